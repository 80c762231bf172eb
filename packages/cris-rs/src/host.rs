//! Execution host: a resizable pool of runners executing background jobs.
//!
//! Runners are long-lived tokio tasks sharing one FIFO of messages:
//!
//! - `Job`: execute it, then go back to the queue
//! - `Grow`: spawn one runner if the pool is below its planned size
//! - `Poison`: exit if the pool is above its planned size, otherwise ignore
//!
//! Resizing only enqueues control messages. A runner never stops in the
//! middle of a job, so reducing the pool waits for busy runners to come back
//! to the queue. When the live count reaches the planned count after a
//! change, the pool reports one convergence through [`PoolStatus`].
//!
//! # Job processing
//!
//! ```text
//! create scope -> restore ambient values -> handling validation
//!   -> on_validation_result -> execute root -> on_final_result -> dispose scope
//! ```
//!
//! Any error or panic along the way becomes a sanitized error result carrying
//! the issuer token as log key. The runner keeps going.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::HostConfig;
use crate::context::ExecutionContext;
use crate::core::{CorrelationId, CrisObject};
use crate::error::{CrisError, CrisResult, CrisResultError};
use crate::handler::extract_panic_message;
use crate::job::{
    ExecutedCommand, ExecutingCommand, Job, JobEventSink, JobExecutor, JobInfo, ScopeData,
};
use crate::registry::HandlerRegistry;
use crate::validation::{validate_handling, validate_incoming, ValidationResult};

/// Snapshot of the runner pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live runners.
    pub runner_count: usize,
    /// Runners the pool is converging to.
    pub planned_count: usize,
    /// Convergences since start.
    pub convergences: u64,
    /// True once shutdown started.
    pub shutting_down: bool,
}

/// Outcome of [`ExecutionHost::receive`].
#[derive(Debug)]
pub enum CommandReceipt {
    /// Incoming validation failed; nothing was enqueued.
    Rejected(ValidationResult),
    /// The command was enqueued.
    Accepted(ExecutingCommand),
}

enum RunnerMessage<D> {
    Job(Job<D>),
    Grow,
    Poison,
}

#[derive(Debug, Default)]
struct PoolState {
    runner_count: usize,
    planned_count: usize,
    shutting_down: bool,
    awaiting_convergence: bool,
    convergences: u64,
    next_runner_id: usize,
}

impl PoolState {
    fn status(&self) -> PoolStatus {
        PoolStatus {
            runner_count: self.runner_count,
            planned_count: self.planned_count,
            convergences: self.convergences,
            shutting_down: self.shutting_down,
        }
    }

    fn allocate_runner(&mut self) -> usize {
        self.runner_count += 1;
        self.next_runner_id += 1;
        self.next_runner_id
    }

    fn check_convergence(&mut self) {
        if self.awaiting_convergence && self.runner_count == self.planned_count {
            self.awaiting_convergence = false;
            self.convergences += 1;
            info!(
                runners = self.runner_count,
                convergences = self.convergences,
                "runner pool converged"
            );
        }
    }
}

struct HostInner<D> {
    registry: Arc<HandlerRegistry<D>>,
    party_identity: Arc<str>,
    max_runner_count: usize,
    state: Mutex<PoolState>,
    status: watch::Sender<PoolStatus>,
    queue: mpsc::UnboundedSender<RunnerMessage<D>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunnerMessage<D>>>,
}

/// Starts shutdown when the last host handle goes away.
///
/// Runners hold the inner state, not this guard, so they cannot keep the
/// pool alive on their own.
struct HostLifetime<D> {
    inner: Arc<HostInner<D>>,
}

impl<D> Drop for HostLifetime<D> {
    fn drop(&mut self) {
        self.inner.begin_shutdown();
    }
}

/// Pool of runners executing root commands in the background.
///
/// Cheap to clone: clones share the same pool. Dropping the last clone
/// without calling [`shutdown`](Self::shutdown) stops the pool the same way,
/// without waiting for it.
pub struct ExecutionHost<D> {
    lifetime: Arc<HostLifetime<D>>,
}

impl<D> Clone for ExecutionHost<D> {
    fn clone(&self) -> Self {
        Self {
            lifetime: Arc::clone(&self.lifetime),
        }
    }
}

impl<D> ExecutionHost<D> {
    fn inner(&self) -> &Arc<HostInner<D>> {
        &self.lifetime.inner
    }
}

impl<D: Send + Sync + 'static> ExecutionHost<D> {
    /// Start a host with `config.runner_count` runners.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(registry: Arc<HandlerRegistry<D>>, config: HostConfig) -> Result<Self> {
        config.validate()?;

        let (queue, inbox) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PoolStatus::default());
        let inner = Arc::new(HostInner {
            registry,
            party_identity: Arc::from(config.party_identity.as_str()),
            max_runner_count: config.max_runner_count,
            state: Mutex::new(PoolState {
                planned_count: config.runner_count,
                ..Default::default()
            }),
            status,
            queue,
            inbox: tokio::sync::Mutex::new(inbox),
        });

        {
            let mut state = inner.lock_state();
            for _ in 0..config.runner_count {
                let id = state.allocate_runner();
                spawn_runner(Arc::clone(&inner), id);
            }
            inner.publish(&state);
        }

        info!(
            runners = config.runner_count,
            party = %config.party_identity,
            "execution host started"
        );
        Ok(Self {
            lifetime: Arc::new(HostLifetime { inner }),
        })
    }

    /// The registry jobs execute against.
    pub fn registry(&self) -> &Arc<HandlerRegistry<D>> {
        &self.inner().registry
    }

    /// Current pool snapshot.
    pub fn status(&self) -> PoolStatus {
        *self.inner().status.borrow()
    }

    /// Watch pool snapshots.
    pub fn subscribe(&self) -> watch::Receiver<PoolStatus> {
        self.inner().status.subscribe()
    }

    /// Change the planned runner count.
    ///
    /// Returns once the control messages are enqueued; watch [`PoolStatus`]
    /// to observe convergence.
    pub fn set_runner_count(&self, count: usize) -> Result<(), CrisError> {
        let max = self.inner().max_runner_count;
        if count == 0 || count > max {
            return Err(CrisError::InvalidRunnerCount {
                requested: count,
                max,
            });
        }

        let mut state = self.inner().lock_state();
        if state.shutting_down {
            warn!(requested = count, "runner count change rejected: host is shutting down");
            return Err(CrisError::HostShuttingDown);
        }

        let planned = state.planned_count;
        if count == planned {
            return Ok(());
        }
        state.planned_count = count;
        state.awaiting_convergence = true;

        if count > planned {
            for _ in planned..count {
                self.inner().enqueue(RunnerMessage::Grow)?;
            }
        } else {
            for _ in count..planned {
                self.inner().enqueue(RunnerMessage::Poison)?;
            }
        }
        info!(from = planned, to = count, live = state.runner_count, "runner count changed");

        // Opposite changes may cancel out before any runner reacts.
        state.check_convergence();
        self.inner().publish(&state);
        Ok(())
    }

    /// Enqueue a job.
    pub fn submit(&self, job: Job<D>) -> Result<(), CrisError> {
        let state = self.inner().lock_state();
        if state.shutting_down {
            warn!(token = %job.info().issuer_token, "job rejected: host is shutting down");
            return Err(CrisError::HostShuttingDown);
        }
        debug!(
            token = %job.info().issuer_token,
            command = job.info().command_type(),
            "job enqueued"
        );
        self.inner().enqueue(RunnerMessage::Job(job))
    }

    /// Receive a command from outside the process.
    ///
    /// Runs incoming validation against the caller's services, captures their
    /// ambient values into `scope_data` when it has none, then enqueues a job.
    pub async fn receive(
        &self,
        executor: Arc<dyn JobExecutor<D>>,
        services: &D,
        command: CrisObject,
        mut scope_data: ScopeData,
    ) -> Result<CommandReceipt, CrisError> {
        let token = CorrelationId::new();
        let validation = validate_incoming(&self.inner().registry, services, &command, token).await;
        if !validation.is_success() {
            return Ok(CommandReceipt::Rejected(validation));
        }

        if scope_data.ambient_values.is_none() {
            if let Some(provider) = self.inner().registry.ambient_values_provider() {
                let values = provider(services).map_err(|e| CrisError::ScopeCreation {
                    message: format!("capturing ambient values: {:#}", e),
                })?;
                scope_data.ambient_values = Some(values);
            }
        }

        let (job, handle) = Job::with_issuer_token(command, executor, scope_data, token);
        self.submit(job)?;
        Ok(CommandReceipt::Accepted(handle))
    }

    /// Stop the pool.
    ///
    /// Jobs enqueued before the call still complete; later submissions fail
    /// with [`CrisError::HostShuttingDown`]. Resolves once every runner exited.
    pub async fn shutdown(&self) {
        self.inner().begin_shutdown();

        let mut status = self.inner().status.subscribe();
        let _ = status.wait_for(|s| s.runner_count == 0).await;
        info!("execution host stopped");
    }
}

impl<D> HostInner<D> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("pool state mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn publish(&self, state: &PoolState) {
        self.status.send_replace(state.status());
    }

    fn enqueue(&self, message: RunnerMessage<D>) -> Result<(), CrisError> {
        self.queue
            .send(message)
            .map_err(|_| CrisError::HostShuttingDown)
    }

    /// Reject further work and poison every runner. Idempotent.
    fn begin_shutdown(&self) {
        let mut state = self.lock_state();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        let poisons = state.planned_count.max(state.runner_count);
        state.planned_count = 0;
        state.awaiting_convergence = true;
        for _ in 0..poisons {
            // The inbox lives as long as the inner state.
            let _ = self.enqueue(RunnerMessage::Poison);
        }
        info!(runners = state.runner_count, "execution host shutting down");
        state.check_convergence();
        self.publish(&state);
    }
}

impl<D: Send + Sync + 'static> HostInner<D> {
    /// Handle a `Grow` message.
    fn grow(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.runner_count < state.planned_count {
            let id = state.allocate_runner();
            spawn_runner(Arc::clone(self), id);
            state.check_convergence();
            self.publish(&state);
        }
    }

    /// Handle a `Poison` message. Returns true when the runner must exit.
    fn poison(&self, runner: usize) -> bool {
        let mut state = self.lock_state();
        if state.runner_count <= state.planned_count {
            return false;
        }
        state.runner_count -= 1;
        debug!(runner, live = state.runner_count, "runner stopping");
        state.check_convergence();
        self.publish(&state);
        true
    }

    async fn process_job(&self, job: Job<D>, runner: usize) {
        let (info, scope_data, executor, reporter) = job.into_parts();
        let token = info.issuer_token;
        let span = info_span!(
            "cris_job",
            token = %token,
            command = info.command_type(),
            runner
        );

        async move {
            debug!("job started");
            let caller = reporter.immediate_events();
            let run = self.run_job(&info, &scope_data, &executor, caller).await;

            if run.result.is_success() {
                info!(events = run.events.len(), "job completed");
            } else {
                debug!("job completed with an error result");
            }
            reporter.complete(ExecutedCommand {
                command: Arc::clone(&info.command),
                issuer_token: token,
                result: run.result,
                validation: run.validation,
                events: run.events,
                completed_at: Utc::now(),
            });
        }
        .instrument(span)
        .await
    }

    async fn run_job(
        &self,
        info: &JobInfo,
        scope_data: &ScopeData,
        executor: &Arc<dyn JobExecutor<D>>,
        caller: mpsc::UnboundedSender<CrisObject>,
    ) -> JobRun {
        let token = info.issuer_token;

        let created = guarded(token, "create_scope", executor.create_scope(info, scope_data)).await;
        let services = match created {
            Ok(services) => Arc::new(services),
            Err(e) => {
                let e = anyhow::Error::new(CrisError::ScopeCreation {
                    message: format!("{:#}", e),
                });
                error!(%token, error = ?e, "job scope creation failed");
                let run = JobRun::failed(&e, token, None);
                self.report_final(info, executor, &run).await;
                return run;
            }
        };

        let mut validation = None;
        let executed = guarded(
            token,
            "job",
            self.run_in_scope(info, scope_data, executor, &services, caller, &mut validation),
        )
        .await;
        let run = match executed {
            Ok(run) => run,
            Err(e) => {
                error!(%token, error = ?e, "job failed");
                JobRun::failed(&e, token, validation)
            }
        };

        if run.notify_final {
            self.report_final(info, executor, &run).await;
        }
        if let Err(e) = guarded(token, "dispose_scope", async {
            executor.dispose_scope(info, services).await;
            Ok::<_, anyhow::Error>(())
        })
        .await
        {
            error!(%token, error = ?e, "job scope disposal failed");
        }
        run
    }

    async fn run_in_scope(
        &self,
        info: &JobInfo,
        scope_data: &ScopeData,
        executor: &Arc<dyn JobExecutor<D>>,
        services: &Arc<D>,
        caller: mpsc::UnboundedSender<CrisObject>,
        validation: &mut Option<ValidationResult>,
    ) -> Result<JobRun> {
        let token = info.issuer_token;

        if let Some(values) = &scope_data.ambient_values {
            executor
                .restore_ambient_values(services, values)
                .await
                .map_err(|e| CrisError::AmbientRestore {
                    message: format!("{:#}", e),
                })?;
        }

        let result = validate_handling(&self.registry, services, &info.command, token).await?;
        executor.on_validation_result(info, &result).await;
        *validation = Some(result.clone());
        if !result.is_success() {
            return Ok(JobRun {
                result: CrisResult::Error(CrisResultError::from_validation(&result)),
                validation: Some(result),
                events: Vec::new(),
                notify_final: false,
            });
        }

        let sink = Arc::new(JobEventSink {
            info: info.clone(),
            executor: Arc::clone(executor),
            caller,
        });
        let mut ctx = ExecutionContext::new(Arc::clone(&self.registry), Arc::clone(services))
            .with_issuer_token(token)
            .with_party_identity(Arc::clone(&self.party_identity))
            .with_immediate_sink(sink);
        let outcome = ctx
            .execute_root_prevalidated(Arc::clone(&info.command))
            .await?;

        Ok(JobRun {
            result: CrisResult::Success(outcome.result),
            validation: Some(result),
            events: outcome.events,
            notify_final: true,
        })
    }

    async fn report_final(&self, info: &JobInfo, executor: &Arc<dyn JobExecutor<D>>, run: &JobRun) {
        let token = info.issuer_token;
        let reported = guarded(token, "on_final_result", async {
            executor.on_final_result(info, &run.result, &run.events).await;
            Ok::<_, anyhow::Error>(())
        })
        .await;
        if let Err(e) = reported {
            error!(%token, error = ?e, "final result hook failed");
        }
    }
}

struct JobRun {
    result: CrisResult,
    validation: Option<ValidationResult>,
    events: Vec<CrisObject>,
    notify_final: bool,
}

impl JobRun {
    fn failed(error: &anyhow::Error, token: CorrelationId, validation: Option<ValidationResult>) -> Self {
        Self {
            result: CrisResult::Error(CrisResultError::from_error(error, token)),
            validation,
            events: Vec::new(),
            notify_final: true,
        }
    }
}

/// Await `fut`, turning a panic into an error.
async fn guarded<T, F>(token: CorrelationId, stage: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic_info) => {
            let message = extract_panic_message(panic_info.as_ref());
            error!(%token, stage, panic = %message, "job panicked");
            Err(anyhow!("{} panicked: {}", stage, message))
        }
    }
}

fn spawn_runner<D: Send + Sync + 'static>(inner: Arc<HostInner<D>>, id: usize) {
    tokio::spawn(runner_loop(inner, id));
}

fn runner_loop<D: Send + Sync + 'static>(inner: Arc<HostInner<D>>, id: usize) -> BoxFuture<'static, ()> {
    async move {
        debug!(runner = id, "runner started");
        loop {
            let message = {
                let mut inbox = inner.inbox.lock().await;
                inbox.recv().await
            };

            match message {
                Some(RunnerMessage::Job(job)) => {
                    let token = job.info().issuer_token;
                    let processed = AssertUnwindSafe(inner.process_job(job, id))
                        .catch_unwind()
                        .await;
                    if let Err(panic_info) = processed {
                        error!(
                            %token,
                            runner = id,
                            panic = %extract_panic_message(panic_info.as_ref()),
                            "job reporting panicked"
                        );
                    }
                }
                Some(RunnerMessage::Grow) => inner.grow(),
                Some(RunnerMessage::Poison) => {
                    if inner.poison(id) {
                        break;
                    }
                }
                None => break,
            }
        }
        debug!(runner = id, "runner stopped");
    }
    .boxed()
}
