//! Background jobs.
//!
//! A [`Job`] carries one root command to the execution host, together with
//! what the host needs to run it outside the caller's call stack:
//!
//! - [`ScopeData`] to build the job's services (and restore ambient values)
//! - a [`JobExecutor`], the embedding application's extension hooks
//! - the issuer token, used as log key
//!
//! Creating a job also returns the caller's [`ExecutingCommand`] handle, which
//! streams immediate events while the job runs and resolves to the final
//! [`ExecutedCommand`].
//!
//! # Example
//!
//! ```ignore
//! let executor = Arc::new(ClosureExecutor::new(|data: &ScopeData| AppServices::from_scope(data)));
//! let (job, mut handle) = Job::new(cris_object(CreateUser { name }), executor, ScopeData::default());
//! host.submit(job)?;
//!
//! while let Some(event) = handle.next_immediate_event().await {
//!     progress.send(event);
//! }
//! let executed = handle.wait().await?;
//! ```

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::context::ImmediateEventSink;
use crate::core::{AmbientValues, CorrelationId, CrisObject};
use crate::error::{CrisError, CrisResult};
use crate::validation::ValidationResult;

/// Data needed to build a job's services, away from the caller's scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeData {
    /// Application-defined payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Ambient values captured when the command entered the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambient_values: Option<AmbientValues>,
}

impl ScopeData {
    /// Scope data with a payload and no ambient values.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ambient_values: None,
        }
    }

    /// Attach an ambient values snapshot.
    pub fn with_ambient_values(mut self, values: AmbientValues) -> Self {
        self.ambient_values = Some(values);
        self
    }
}

/// Read-only description of a job, given to executor hooks.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// The root command.
    pub command: CrisObject,
    /// The issuer token (log key).
    pub issuer_token: CorrelationId,
    /// When the job was created.
    pub enqueued_at: DateTime<Utc>,
}

impl JobInfo {
    /// Type name of the root command.
    pub fn command_type(&self) -> &'static str {
        self.command.cris_type_name()
    }
}

/// Final report of a job.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    /// The root command.
    pub command: CrisObject,
    /// The issuer token (log key).
    pub issuer_token: CorrelationId,
    /// Result or sanitized error.
    pub result: CrisResult,
    /// Handling validation of the root command, when it ran.
    pub validation: Option<ValidationResult>,
    /// Final (non-immediate) events.
    pub events: Vec<CrisObject>,
    /// When the job completed.
    pub completed_at: DateTime<Utc>,
}

impl ExecutedCommand {
    /// Returns true when the command executed successfully.
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Caller handle of a submitted job.
pub struct ExecutingCommand {
    info: JobInfo,
    completion: oneshot::Receiver<ExecutedCommand>,
    immediate_events: mpsc::UnboundedReceiver<CrisObject>,
}

impl ExecutingCommand {
    /// The submitted command.
    pub fn command(&self) -> &CrisObject {
        &self.info.command
    }

    /// The issuer token (log key).
    pub fn issuer_token(&self) -> CorrelationId {
        self.info.issuer_token
    }

    /// When the job was created.
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.info.enqueued_at
    }

    /// Next immediate event emitted by the job.
    ///
    /// Returns `None` once the job finished and every event was received.
    pub async fn next_immediate_event(&mut self) -> Option<CrisObject> {
        self.immediate_events.recv().await
    }

    /// Next immediate event, without waiting.
    pub fn try_next_immediate_event(&mut self) -> Option<CrisObject> {
        self.immediate_events.try_recv().ok()
    }

    /// Wait for the final report.
    ///
    /// Fails with [`CrisError::HostShuttingDown`] when the job was dropped
    /// without being executed.
    pub async fn wait(self) -> Result<ExecutedCommand, CrisError> {
        self.completion
            .await
            .map_err(|_| CrisError::HostShuttingDown)
    }
}

impl fmt::Debug for ExecutingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutingCommand")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

type ReportCallback = Box<dyn FnOnce(&ExecutedCommand) + Send>;

/// Completes the caller handle of one job.
pub(crate) struct JobReporter {
    completion: oneshot::Sender<ExecutedCommand>,
    immediate_events: mpsc::UnboundedSender<CrisObject>,
    report: Option<ReportCallback>,
}

impl JobReporter {
    pub(crate) fn immediate_events(&self) -> mpsc::UnboundedSender<CrisObject> {
        self.immediate_events.clone()
    }

    /// Run the report callback, then resolve the caller handle.
    pub(crate) fn complete(self, executed: ExecutedCommand) {
        if let Some(report) = self.report {
            report(&executed);
        }
        // The caller may have dropped its handle.
        let _ = self.completion.send(executed);
    }
}

/// A root command waiting for a runner.
pub struct Job<D> {
    info: JobInfo,
    scope_data: ScopeData,
    executor: Arc<dyn JobExecutor<D>>,
    reporter: JobReporter,
}

impl<D: Send + Sync + 'static> Job<D> {
    /// Create a job with a fresh issuer token, and its caller handle.
    pub fn new(
        command: CrisObject,
        executor: Arc<dyn JobExecutor<D>>,
        scope_data: ScopeData,
    ) -> (Self, ExecutingCommand) {
        Self::with_issuer_token(command, executor, scope_data, CorrelationId::new())
    }

    /// Create a job with a given issuer token, and its caller handle.
    pub fn with_issuer_token(
        command: CrisObject,
        executor: Arc<dyn JobExecutor<D>>,
        scope_data: ScopeData,
        issuer_token: CorrelationId,
    ) -> (Self, ExecutingCommand) {
        let info = JobInfo {
            command,
            issuer_token,
            enqueued_at: Utc::now(),
        };
        let (completion_tx, completion_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let job = Self {
            info: info.clone(),
            scope_data,
            executor,
            reporter: JobReporter {
                completion: completion_tx,
                immediate_events: events_tx,
                report: None,
            },
        };
        let handle = ExecutingCommand {
            info,
            completion: completion_rx,
            immediate_events: events_rx,
        };
        (job, handle)
    }

    /// Call `report` with the final report, before the caller handle resolves.
    pub fn on_report<F>(mut self, report: F) -> Self
    where
        F: FnOnce(&ExecutedCommand) + Send + 'static,
    {
        self.reporter.report = Some(Box::new(report));
        self
    }

    /// The job description.
    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    /// The scope data.
    pub fn scope_data(&self) -> &ScopeData {
        &self.scope_data
    }

    pub(crate) fn into_parts(self) -> (JobInfo, ScopeData, Arc<dyn JobExecutor<D>>, JobReporter) {
        (self.info, self.scope_data, self.executor, self.reporter)
    }
}

impl<D> fmt::Debug for Job<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("info", &self.info)
            .field("scope_data", &self.scope_data)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Extension hooks of the embedding application, called by the execution
/// host while it runs a job.
///
/// Order for one job: `create_scope`, `restore_ambient_values` (when the
/// scope data carries ambient values), `on_validation_result`, then
/// `on_immediate_event` for each immediate event, `on_final_result`, and
/// `dispose_scope` on every path once the scope exists.
#[async_trait]
pub trait JobExecutor<D: Send + Sync + 'static>: Send + Sync + 'static {
    /// Build the job's services.
    async fn create_scope(&self, job: &JobInfo, scope_data: &ScopeData) -> Result<D>;

    /// Install the captured ambient values into the job's services.
    async fn restore_ambient_values(&self, _services: &D, _values: &AmbientValues) -> Result<()> {
        Ok(())
    }

    /// Release the job's services.
    async fn dispose_scope(&self, _job: &JobInfo, _services: Arc<D>) {}

    /// Handling validation of the root command completed.
    async fn on_validation_result(&self, _job: &JobInfo, _result: &ValidationResult) {}

    /// An immediate event was emitted. Errors fail the job.
    async fn on_immediate_event(&self, _job: &JobInfo, _event: &CrisObject) -> Result<()> {
        Ok(())
    }

    /// The job completed (successfully or not) after validation succeeded.
    async fn on_final_result(&self, _job: &JobInfo, _result: &CrisResult, _events: &[CrisObject]) {}
}

/// [`JobExecutor`] built from a scope factory, with no-op hooks.
pub struct ClosureExecutor<F> {
    factory: F,
}

impl<F> ClosureExecutor<F> {
    /// Create an executor from a scope factory.
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<D, F> JobExecutor<D> for ClosureExecutor<F>
where
    D: Send + Sync + 'static,
    F: Fn(&ScopeData) -> Result<D> + Send + Sync + 'static,
{
    async fn create_scope(&self, _job: &JobInfo, scope_data: &ScopeData) -> Result<D> {
        (self.factory)(scope_data)
    }
}

/// Forwards a job's immediate events to its executor and caller handle.
pub(crate) struct JobEventSink<D> {
    pub(crate) info: JobInfo,
    pub(crate) executor: Arc<dyn JobExecutor<D>>,
    pub(crate) caller: mpsc::UnboundedSender<CrisObject>,
}

#[async_trait]
impl<D: Send + Sync + 'static> ImmediateEventSink for JobEventSink<D> {
    async fn on_immediate_event(&self, event: &CrisObject) -> Result<()> {
        self.executor.on_immediate_event(&self.info, event).await?;
        // The caller may have stopped listening.
        let _ = self.caller.send(Arc::clone(event));
        Ok(())
    }
}
