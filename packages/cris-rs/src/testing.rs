//! Testing utilities for hosts and jobs.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! cris = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use cris::testing::{init_tracing, ExecutorCall, RecordingExecutor};
//!
//! init_tracing();
//! let executor = Arc::new(RecordingExecutor::new(|_: &ScopeData| Ok(AppServices::default())));
//!
//! let (job, handle) = Job::new(cris_object(CreateUser { name }), executor.clone(), ScopeData::default());
//! host.submit(job)?;
//! handle.wait().await?;
//!
//! assert_eq!(executor.calls().last(), Some(&ExecutorCall::DisposeScope));
//! ```

use std::sync::{Arc, Mutex, Once};

use anyhow::Result;
use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use crate::core::{AmbientValues, CrisObject};
use crate::error::CrisResult;
use crate::job::{JobExecutor, JobInfo, ScopeData};
use crate::validation::ValidationResult;

/// A hook call observed by a [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    /// `create_scope`, whatever the factory returned.
    CreateScope,
    /// `restore_ambient_values`, whatever the hook returned.
    RestoreAmbientValues,
    /// `on_validation_result` with the handling validation outcome.
    ValidationResult { success: bool },
    /// `on_immediate_event` with the short type name of the event.
    ImmediateEvent(&'static str),
    /// `on_final_result` with the result outcome and the final event count.
    FinalResult { success: bool, events: usize },
    /// `dispose_scope`.
    DisposeScope,
}

type ScopeFactory<D> = Box<dyn Fn(&ScopeData) -> Result<D> + Send + Sync>;
type RestoreHook<D> = Box<dyn Fn(&D, &AmbientValues) -> Result<()> + Send + Sync>;

/// [`JobExecutor`] recording every hook call, in order.
pub struct RecordingExecutor<D> {
    factory: ScopeFactory<D>,
    restore: Option<RestoreHook<D>>,
    calls: Mutex<Vec<ExecutorCall>>,
}

impl<D: Send + Sync + 'static> RecordingExecutor<D> {
    /// Create a recording executor over a scope factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ScopeData) -> Result<D> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            restore: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Install ambient values with `restore`.
    pub fn on_restore<F>(mut self, restore: F) -> Self
    where
        F: Fn(&D, &AmbientValues) -> Result<()> + Send + Sync + 'static,
    {
        self.restore = Some(Box::new(restore));
        self
    }

    /// Calls observed so far.
    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Forget observed calls.
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: ExecutorCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl<D: Send + Sync + 'static> JobExecutor<D> for RecordingExecutor<D> {
    async fn create_scope(&self, _job: &JobInfo, scope_data: &ScopeData) -> Result<D> {
        self.record(ExecutorCall::CreateScope);
        (self.factory)(scope_data)
    }

    async fn restore_ambient_values(&self, services: &D, values: &AmbientValues) -> Result<()> {
        self.record(ExecutorCall::RestoreAmbientValues);
        match &self.restore {
            Some(restore) => restore(services, values),
            None => Ok(()),
        }
    }

    async fn dispose_scope(&self, _job: &JobInfo, _services: Arc<D>) {
        self.record(ExecutorCall::DisposeScope);
    }

    async fn on_validation_result(&self, _job: &JobInfo, result: &ValidationResult) {
        self.record(ExecutorCall::ValidationResult {
            success: result.is_success(),
        });
    }

    async fn on_immediate_event(&self, _job: &JobInfo, event: &CrisObject) -> Result<()> {
        let name = event.cris_type_name();
        let short = name.rsplit("::").next().unwrap_or(name);
        self.record(ExecutorCall::ImmediateEvent(short));
        Ok(())
    }

    async fn on_final_result(&self, _job: &JobInfo, result: &CrisResult, events: &[CrisObject]) {
        self.record(ExecutorCall::FinalResult {
            success: result.is_success(),
            events: events.len(),
        });
    }
}

/// Install a `tracing` subscriber for tests, once per process.
///
/// Honors `RUST_LOG`; defaults to `cris=debug`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cris=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
