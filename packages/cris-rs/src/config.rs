use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::context::DEFAULT_PARTY_IDENTITY;

/// Hard upper bound of the runner pool.
pub const MAX_RUNNER_COUNT: usize = 1000;

/// Execution host configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Runners started with the host.
    pub runner_count: usize,
    /// Identity of this process, stamped on emitted events.
    pub party_identity: String,
    /// Largest accepted runner count (at most [`MAX_RUNNER_COUNT`]).
    pub max_runner_count: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            runner_count: 1,
            party_identity: DEFAULT_PARTY_IDENTITY.to_string(),
            max_runner_count: MAX_RUNNER_COUNT,
        }
    }
}

impl HostConfig {
    /// Default configuration with a specific runner count.
    pub fn with_runner_count(runner_count: usize) -> Self {
        Self {
            runner_count,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// - `CRIS_RUNNER_COUNT` (default 1)
    /// - `CRIS_PARTY_IDENTITY` (default `local`)
    /// - `CRIS_MAX_RUNNER_COUNT` (default 1000)
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            runner_count: match lookup("CRIS_RUNNER_COUNT") {
                Some(v) => v
                    .parse()
                    .context("CRIS_RUNNER_COUNT must be a valid number")?,
                None => defaults.runner_count,
            },
            party_identity: lookup("CRIS_PARTY_IDENTITY").unwrap_or(defaults.party_identity),
            max_runner_count: match lookup("CRIS_MAX_RUNNER_COUNT") {
                Some(v) => v
                    .parse()
                    .context("CRIS_MAX_RUNNER_COUNT must be a valid number")?,
                None => defaults.max_runner_count,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the runner bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_runner_count == 0 || self.max_runner_count > MAX_RUNNER_COUNT {
            bail!(
                "max runner count must be within [1, {}], got {}",
                MAX_RUNNER_COUNT,
                self.max_runner_count
            );
        }
        if self.runner_count == 0 || self.runner_count > self.max_runner_count {
            bail!(
                "runner count must be within [1, {}], got {}",
                self.max_runner_count,
                self.runner_count
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = HostConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.party_identity, "local");
    }

    #[test]
    fn test_variables_override_defaults() {
        let config = HostConfig::from_lookup(lookup(&[
            ("CRIS_RUNNER_COUNT", "8"),
            ("CRIS_PARTY_IDENTITY", "node-a"),
        ]))
        .unwrap();
        assert_eq!(config.runner_count, 8);
        assert_eq!(config.party_identity, "node-a");
        assert_eq!(config.max_runner_count, MAX_RUNNER_COUNT);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = HostConfig::from_lookup(lookup(&[("CRIS_RUNNER_COUNT", "many")])).unwrap_err();
        assert!(err.to_string().contains("CRIS_RUNNER_COUNT"));
    }

    #[test]
    fn test_out_of_range_counts_rejected() {
        assert!(HostConfig::with_runner_count(0).validate().is_err());
        assert!(HostConfig::with_runner_count(1001).validate().is_err());
        assert!(HostConfig::with_runner_count(1000).validate().is_ok());

        let config = HostConfig {
            runner_count: 5,
            max_runner_count: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
