//! Structured error types and caller-facing results for cris.
//!
//! `CrisError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//! `CrisResult` is what a caller eventually receives for a command.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever reaches the caller of a job.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers and validators)
//! - Lower layers (execution context, event dispatch) never catch: nested calls
//!   observe the real error
//! - The job boundary catches everything, logs the raw error with the issuer
//!   token, and hands the caller a sanitized [`CrisResultError`]
//!
//! # Error Example
//!
//! ```ignore
//! use cris::CrisError;
//!
//! match ctx.execute_command(cmd).await {
//!     Ok(result) => { /* ... */ }
//!     Err(e) => match e.downcast_ref::<CrisError>() {
//!         Some(CrisError::ValidationFailed { result, .. }) => {
//!             // a nested command was rejected by its handling validators
//!         }
//!         _ => return Err(e),
//!     },
//! }
//! ```

use std::any::TypeId;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{CommandResult, CorrelationId};
use crate::validation::{MessageLevel, UserMessage, ValidationResult};

/// Generic message handed to callers for any unhandled error.
pub const UNHANDLED_ERROR_MESSAGE: &str = "An unhandled error occurred.";

// =============================================================================
// Cris Error
// =============================================================================

/// Structured error type for cris operations.
///
/// This enum provides pattern-matchable errors for common failure modes.
/// Each variant includes context about what went wrong.
#[derive(Debug, Error)]
pub enum CrisError {
    /// Execution protocol misuse: no active call chain, or a root call while
    /// one is already active.
    #[error("invalid execution state: {reason}")]
    InvalidState {
        /// What was attempted.
        reason: &'static str,
    },

    /// The object's type is not registered.
    #[error("type {type_name} is not registered")]
    UnknownType {
        /// The TypeId of the object.
        type_id: TypeId,
        /// Human-readable type name.
        type_name: &'static str,
    },

    /// No handler was elected for the command type.
    #[error("no handler for command type {type_name}")]
    NoHandler {
        /// Human-readable type name.
        type_name: &'static str,
    },

    /// A command was used where an event is expected, or the opposite.
    #[error("{type_name} is a {actual}, expected {expected}")]
    KindMismatch {
        /// Human-readable type name.
        type_name: &'static str,
        /// What the operation expected.
        expected: &'static str,
        /// The registered kind.
        actual: crate::CrisKind,
    },

    /// Handling validation of a nested command failed.
    #[error("validation of {type_name} failed")]
    ValidationFailed {
        /// Human-readable type name.
        type_name: &'static str,
        /// The failed validation result.
        result: ValidationResult,
    },

    /// A typed handler or a typed caller received an unexpected type.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
    },

    /// Requested runner count is outside the accepted range.
    #[error("runner count {requested} is out of range [1, {max}]")]
    InvalidRunnerCount {
        /// The requested count.
        requested: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The execution host is shutting down.
    #[error("execution host is shutting down")]
    HostShuttingDown,

    /// The job's scope could not be created.
    #[error("failed to create job scope: {message}")]
    ScopeCreation {
        /// The underlying error message.
        message: String,
    },

    /// Ambient values could not be restored in the job's scope.
    #[error("failed to restore ambient values: {message}")]
    AmbientRestore {
        /// The underlying error message.
        message: String,
    },
}

impl CrisError {
    /// Protocol misuse error.
    pub fn invalid_state(reason: &'static str) -> Self {
        CrisError::InvalidState { reason }
    }

    /// Returns true for protocol misuse errors.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, CrisError::InvalidState { .. })
    }
}

/// Returns true when `error` is (or wraps) a [`CrisError::InvalidState`].
pub fn is_invalid_state(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<CrisError>()
        .map(CrisError::is_invalid_state)
        .unwrap_or(false)
}

// =============================================================================
// Caller-facing results
// =============================================================================

/// A sanitized error result handed to the caller of a command.
///
/// This message is safe to display to users. Unhandled errors carry NO
/// internal details, only [`UNHANDLED_ERROR_MESSAGE`] and the log key that
/// correlates them with the server logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisResultError {
    /// True when the error comes from validation.
    pub is_validation_error: bool,
    /// User-facing messages.
    pub messages: Vec<UserMessage>,
    /// Log correlation key.
    pub log_key: Option<String>,
}

impl CrisResultError {
    /// Build an error result from a failed validation.
    pub fn from_validation(result: &ValidationResult) -> Self {
        Self {
            is_validation_error: true,
            messages: result.messages().to_vec(),
            log_key: result.log_key().map(str::to_owned),
        }
    }

    /// Build a generic error result from an unhandled error.
    ///
    /// The raw error must be logged separately, before this sanitization.
    /// A nested [`CrisError::ValidationFailed`] is the only error whose
    /// messages are exposed.
    pub fn from_error(error: &anyhow::Error, token: CorrelationId) -> Self {
        if let Some(CrisError::ValidationFailed { result, .. }) = error.downcast_ref::<CrisError>()
        {
            let mut e = Self::from_validation(result);
            e.log_key = Some(token.to_string());
            return e;
        }
        Self {
            is_validation_error: false,
            messages: vec![UserMessage::new(
                MessageLevel::Error,
                UNHANDLED_ERROR_MESSAGE,
            )],
            log_key: Some(token.to_string()),
        }
    }

    /// The first error message, if any.
    pub fn first_error(&self) -> Option<&UserMessage> {
        self.messages
            .iter()
            .find(|m| m.level == MessageLevel::Error)
    }
}

impl fmt::Display for CrisResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_validation_error {
            "validation error"
        } else {
            "error"
        };
        match self.first_error() {
            Some(m) => write!(f, "{}: {}", kind, m.text)?,
            None => write!(f, "{}", kind)?,
        }
        if let Some(key) = &self.log_key {
            write!(f, " (log key {})", key)?;
        }
        Ok(())
    }
}

/// The outcome of a command, as seen by its caller.
#[derive(Debug, Clone)]
pub enum CrisResult {
    /// The command was executed; carries the handler's result.
    Success(CommandResult),
    /// The command was rejected or failed.
    Error(CrisResultError),
}

impl CrisResult {
    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        matches!(self, CrisResult::Success(_))
    }

    /// The result on success.
    pub fn success(&self) -> Option<&CommandResult> {
        match self {
            CrisResult::Success(r) => Some(r),
            CrisResult::Error(_) => None,
        }
    }

    /// The error on failure.
    pub fn error(&self) -> Option<&CrisResultError> {
        match self {
            CrisResult::Success(_) => None,
            CrisResult::Error(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::UserMessageCollector;

    #[test]
    fn test_unknown_type_display() {
        let err = CrisError::UnknownType {
            type_id: TypeId::of::<String>(),
            type_name: "MyCommand",
        };
        assert!(err.to_string().contains("not registered"));
        assert!(err.to_string().contains("MyCommand"));
    }

    #[test]
    fn test_invalid_runner_count_display() {
        let err = CrisError::InvalidRunnerCount {
            requested: 0,
            max: 1000,
        };
        assert!(err.to_string().contains("[1, 1000]"));
    }

    #[test]
    fn test_invalid_state_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = CrisError::invalid_state("no active call").into();
        assert!(is_invalid_state(&err));

        let other: anyhow::Error = anyhow::anyhow!("boom");
        assert!(!is_invalid_state(&other));
    }

    #[test]
    fn test_from_error_is_sanitized() {
        let token = CorrelationId::new();
        let err = anyhow::anyhow!("connection refused to db at 10.0.0.3 (password=hunter2)");
        let result = CrisResultError::from_error(&err, token);

        assert!(!result.is_validation_error);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].text, UNHANDLED_ERROR_MESSAGE);
        assert!(!result.to_string().contains("hunter2"));
        assert_eq!(result.log_key, Some(token.to_string()));
    }

    #[test]
    fn test_from_error_exposes_nested_validation() {
        let mut collector = UserMessageCollector::new();
        collector.error("Name is required.");
        let validation = collector.into_result(None);

        let err: anyhow::Error = CrisError::ValidationFailed {
            type_name: "CreateUser",
            result: validation,
        }
        .into();
        let token = CorrelationId::new();
        let result = CrisResultError::from_error(&err, token);

        assert!(result.is_validation_error);
        assert_eq!(result.first_error().unwrap().text, "Name is required.");
        assert_eq!(result.log_key, Some(token.to_string()));
    }

    #[test]
    fn test_cris_result_accessors() {
        let ok = CrisResult::Success(CommandResult::new(3_i64));
        assert!(ok.is_success());
        assert_eq!(ok.success().unwrap().downcast_ref::<i64>(), Some(&3));
        assert!(ok.error().is_none());
    }
}
