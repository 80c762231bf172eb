//! Execution context: the nested call stack of one call chain.
//!
//! An [`ExecutionContext`] executes one root command at a time. Handlers,
//! post-handlers and event handlers receive `&mut ExecutionContext`, so the
//! whole chain is sequential by construction: the borrow checker rejects any
//! attempt to run two nested operations concurrently on the same context.
//!
//! # Event propagation
//!
//! | Kind | On `emit_event` | At the root |
//! |------|-----------------|-------------|
//! | `RoutedImmediateEvent` | dispatched now, then sent to the immediate sink | - |
//! | `CallerOnlyImmediateEvent` | sent to the immediate sink | - |
//! | `RoutedEvent` | queued on the current frame | dispatched after the root command |
//! | `CallerOnlyEvent` | queued on the current frame | returned to the caller |
//!
//! Queued events bubble from frame to frame when nested commands return, and
//! all end up in the root's final events, in emission order.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use smallvec::SmallVec;
use tracing::debug;

use crate::core::{cris_object, CommandResult, CorrelationId, CrisKind, CrisObject, CrisPoco};
use crate::dispatch;
use crate::error::CrisError;
use crate::registry::HandlerRegistry;
use crate::validation::validate_handling;

/// Party identity stamped on events when none is configured.
pub const DEFAULT_PARTY_IDENTITY: &str = "local";

/// Receives immediate events as they are emitted.
#[async_trait]
pub trait ImmediateEventSink: Send + Sync + 'static {
    /// Called synchronously, before `emit_event` returns. Errors propagate to
    /// the emitter.
    async fn on_immediate_event(&self, event: &CrisObject) -> Result<()>;
}

/// One executing command and the events it emitted so far.
pub struct Frame {
    command: CrisObject,
    pending_events: SmallVec<[CrisObject; 4]>,
}

impl Frame {
    fn new(command: CrisObject) -> Self {
        Self {
            command,
            pending_events: SmallVec::new(),
        }
    }

    /// The executing command.
    pub fn command(&self) -> &CrisObject {
        &self.command
    }

    /// Non-immediate events emitted by this command and its sub-calls.
    pub fn pending_events(&self) -> &[CrisObject] {
        &self.pending_events
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("command", &self.command.cris_type_name())
            .field("pending_events", &self.pending_events.len())
            .finish()
    }
}

/// Result and final events of a root command.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The root handler's result.
    pub result: CommandResult,
    /// Every non-immediate event of the call chain, in emission order.
    pub events: Vec<CrisObject>,
}

/// Executes commands and routes events for one call chain at a time.
pub struct ExecutionContext<D> {
    registry: Arc<HandlerRegistry<D>>,
    services: Arc<D>,
    stack: Vec<Frame>,
    issuer_token: CorrelationId,
    party_identity: Arc<str>,
    immediate_sink: Option<Arc<dyn ImmediateEventSink>>,
}

impl<D: Send + Sync + 'static> ExecutionContext<D> {
    /// Create a context over a registry and the call's services.
    pub fn new(registry: Arc<HandlerRegistry<D>>, services: Arc<D>) -> Self {
        Self {
            registry,
            services,
            stack: Vec::new(),
            issuer_token: CorrelationId::NONE,
            party_identity: Arc::from(DEFAULT_PARTY_IDENTITY),
            immediate_sink: None,
        }
    }

    /// Set the issuer token used in logs.
    pub fn with_issuer_token(mut self, token: CorrelationId) -> Self {
        self.issuer_token = token;
        self
    }

    /// Set the party identity stamped on emitted events.
    pub fn with_party_identity(mut self, party: impl Into<Arc<str>>) -> Self {
        self.party_identity = party.into();
        self
    }

    /// Set the receiver of immediate events.
    pub fn with_immediate_sink(mut self, sink: Arc<dyn ImmediateEventSink>) -> Self {
        self.immediate_sink = Some(sink);
        self
    }

    /// The call's services.
    pub fn services(&self) -> &D {
        &self.services
    }

    /// The call's services, shared.
    pub fn services_arc(&self) -> &Arc<D> {
        &self.services
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry<D>> {
        &self.registry
    }

    /// The issuer token.
    pub fn issuer_token(&self) -> CorrelationId {
        self.issuer_token
    }

    /// The party identity.
    pub fn party_identity(&self) -> &str {
        &self.party_identity
    }

    /// The innermost executing command.
    pub fn current_command(&self) -> Option<&CrisObject> {
        self.stack.last().map(Frame::command)
    }

    /// Returns true while a call chain is active.
    pub fn is_executing_command(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Number of frames on the stack.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The frames, root first.
    pub fn frames(&self) -> &[Frame] {
        &self.stack
    }

    // =========================================================================
    // Root execution
    // =========================================================================

    /// Execute a root command: handling validation, handler, post-handlers,
    /// then dispatch of its routed final events.
    ///
    /// Fails with [`CrisError::InvalidState`] when a call chain is already
    /// active. The stack is empty again when this returns, on every path,
    /// including when a handler panics (the panic is then resumed).
    pub async fn execute_root(&mut self, command: CrisObject) -> Result<ExecutionOutcome> {
        self.execute_root_with(command, true).await
    }

    /// Like [`execute_root`](Self::execute_root), for a root command whose
    /// handling validation already ran.
    pub(crate) async fn execute_root_prevalidated(
        &mut self,
        command: CrisObject,
    ) -> Result<ExecutionOutcome> {
        self.execute_root_with(command, false).await
    }

    async fn execute_root_with(
        &mut self,
        command: CrisObject,
        validate: bool,
    ) -> Result<ExecutionOutcome> {
        if !self.stack.is_empty() {
            return Err(CrisError::invalid_state("a call chain is already active").into());
        }
        let outcome = AssertUnwindSafe(self.run_root(command, validate))
            .catch_unwind()
            .await;
        self.stack.clear();
        match outcome {
            Ok(outcome) => outcome,
            Err(panic_info) => panic::resume_unwind(panic_info),
        }
    }

    async fn run_root(&mut self, command: CrisObject, validate: bool) -> Result<ExecutionOutcome> {
        self.stack.push(Frame::new(Arc::clone(&command)));
        let result = self.raw_execute(command, validate).await?;

        // The root frame stays on the stack while final events are
        // dispatched: their handlers may execute commands and emit events.
        let mut events = self.take_root_events();
        let mut next = 0;
        while next < events.len() {
            let event = Arc::clone(&events[next]);
            next += 1;
            let dispatch = self
                .registry
                .descriptor_of(event.as_ref())
                .is_some_and(|d| d.kind() == CrisKind::RoutedEvent && d.is_handled());
            if dispatch {
                dispatch::dispatch_event(self, &event).await?;
                events.extend(self.take_root_events());
            }
        }

        Ok(ExecutionOutcome { result, events })
    }

    fn take_root_events(&mut self) -> Vec<CrisObject> {
        self.stack
            .first_mut()
            .map(|root| std::mem::take(&mut root.pending_events).into_vec())
            .unwrap_or_default()
    }

    // =========================================================================
    // Nested execution
    // =========================================================================

    /// Execute a nested command. Its events bubble to the calling frame.
    pub async fn execute_command(&mut self, command: CrisObject) -> Result<CommandResult> {
        let (result, _) = self.execute_nested(command, false, false).await?;
        Ok(result)
    }

    /// Execute a nested command built from a concrete value.
    pub async fn execute<C: CrisPoco>(&mut self, command: C) -> Result<CommandResult> {
        self.execute_command(cris_object(command)).await
    }

    /// Execute a nested command and return the events it emitted.
    ///
    /// With `stop_propagation`, those events are not appended to the calling
    /// frame: the caller alone receives them.
    pub async fn execute_command_with_events(
        &mut self,
        command: CrisObject,
        stop_propagation: bool,
    ) -> Result<(CommandResult, Vec<CrisObject>)> {
        self.execute_nested(command, stop_propagation, true).await
    }

    async fn execute_nested(
        &mut self,
        command: CrisObject,
        stop_propagation: bool,
        return_events: bool,
    ) -> Result<(CommandResult, Vec<CrisObject>)> {
        if self.stack.is_empty() {
            return Err(CrisError::invalid_state("no active call chain to execute a command").into());
        }

        let depth = self.stack.len();
        self.stack.push(Frame::new(Arc::clone(&command)));
        let outcome = self.raw_execute(command, true).await;
        // Unwind whatever the sub-call left, even on error.
        let frame = self.stack.drain(depth..).next();
        let result = outcome?;

        let events = frame
            .map(|f| f.pending_events.into_vec())
            .unwrap_or_default();
        if stop_propagation {
            return Ok((result, events));
        }

        let parent = self
            .stack
            .last_mut()
            .ok_or(CrisError::invalid_state("call chain ended during a nested command"))?;
        if return_events {
            parent.pending_events.extend(events.iter().cloned());
            Ok((result, events))
        } else {
            parent.pending_events.extend(events);
            Ok((result, Vec::new()))
        }
    }

    /// Handling validation, handler, post-handlers.
    fn raw_execute(
        &mut self,
        command: CrisObject,
        validate: bool,
    ) -> BoxFuture<'_, Result<CommandResult>> {
        async move {
            let registry = Arc::clone(&self.registry);
            let descriptor = registry.require_descriptor(command.as_ref())?;
            let type_name = descriptor.type_name();
            if !descriptor.kind().is_command() {
                return Err(CrisError::KindMismatch {
                    type_name,
                    expected: "command",
                    actual: descriptor.kind(),
                }
                .into());
            }
            let slot = descriptor
                .handler()
                .ok_or(CrisError::NoHandler { type_name })?;

            if validate {
                let services = Arc::clone(&self.services);
                let validation =
                    validate_handling(&registry, &services, &command, self.issuer_token).await?;
                if !validation.is_success() {
                    return Err(CrisError::ValidationFailed {
                        type_name,
                        result: validation,
                    }
                    .into());
                }
            }

            debug!(
                token = %self.issuer_token,
                command = type_name,
                depth = self.stack.len(),
                "executing command"
            );

            let handler = slot.resolve(&self.services)?;
            let result = handler.handle_erased(Arc::clone(&command), self).await?;

            for post in descriptor.post_handlers() {
                let post = post.resolve(&self.services)?;
                post.post_handle_erased(Arc::clone(&command), &result, self)
                    .await?;
            }

            Ok(result)
        }
        .boxed()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Emit an event from the executing command.
    ///
    /// The event is stamped with the current command and the party identity,
    /// then routed by kind (see the module documentation). Immediate routed
    /// events are fully dispatched before this returns.
    pub async fn emit_event<E: CrisPoco>(&mut self, event: E) -> Result<()> {
        self.emit_event_boxed(Box::new(event)).await
    }

    /// Emit an already boxed event.
    pub async fn emit_event_boxed(&mut self, mut event: Box<dyn CrisPoco>) -> Result<()> {
        let Some(top) = self.stack.last() else {
            return Err(CrisError::invalid_state("no active call chain to emit an event").into());
        };
        event.set_source_command(Arc::clone(&top.command));
        event.set_party_identity(&self.party_identity);
        let event: CrisObject = Arc::from(event);

        let registry = Arc::clone(&self.registry);
        let descriptor = registry.require_descriptor(event.as_ref())?;
        let kind = descriptor.kind();
        debug!(
            token = %self.issuer_token,
            event = descriptor.type_name(),
            %kind,
            "event emitted"
        );

        match kind {
            CrisKind::RoutedImmediateEvent => {
                if descriptor.is_handled() {
                    dispatch::dispatch_event(self, &event).await?;
                }
                self.notify_immediate(&event).await
            }
            CrisKind::CallerOnlyImmediateEvent => self.notify_immediate(&event).await,
            CrisKind::RoutedEvent | CrisKind::CallerOnlyEvent => {
                if let Some(top) = self.stack.last_mut() {
                    top.pending_events.push(event);
                }
                Ok(())
            }
            CrisKind::Command | CrisKind::CommandWithResult => Err(CrisError::KindMismatch {
                type_name: descriptor.type_name(),
                expected: "event",
                actual: kind,
            }
            .into()),
        }
    }

    async fn notify_immediate(&self, event: &CrisObject) -> Result<()> {
        if let Some(sink) = &self.immediate_sink {
            sink.on_immediate_event(event).await?;
        }
        Ok(())
    }

    /// Dispatch an event to its handlers. Errors propagate.
    pub async fn dispatch_event(&mut self, event: &CrisObject) -> Result<()> {
        dispatch::dispatch_event(self, event).await
    }

    /// Dispatch an event to its handlers, logging and swallowing failures.
    ///
    /// Returns false when a handler failed or panicked.
    pub async fn dispatch_event_safe(&mut self, event: &CrisObject) -> bool {
        dispatch::dispatch_event_safe(self, event).await
    }

    /// Drop frames above `depth` (after a caught panic).
    pub(crate) fn truncate_stack(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }
}

impl<D> fmt::Debug for ExecutionContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("issuer_token", &self.issuer_token)
            .field("party_identity", &self.party_identity)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_invalid_state;
    use crate::handler::{EventHandler, Handler};
    use crate::registry::RegistryBuilder;
    use crate::validation::{ValidationContext, Validator};
    use std::sync::Mutex;

    // =========================================================================
    // Test Types
    // =========================================================================

    #[derive(Default)]
    struct Services {
        log: Mutex<Vec<String>>,
    }

    impl Services {
        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[derive(Debug)]
    struct C1;
    impl CrisPoco for C1 {}

    #[derive(Debug)]
    struct C2;
    impl CrisPoco for C2 {}

    #[derive(Debug)]
    struct E1;
    impl CrisPoco for E1 {}

    #[derive(Debug)]
    struct E2;
    impl CrisPoco for E2 {}

    #[derive(Debug)]
    struct Nest {
        remaining: u32,
    }
    impl CrisPoco for Nest {}

    #[derive(Debug)]
    struct Step {
        n: u32,
    }
    impl CrisPoco for Step {}

    #[derive(Debug)]
    struct Reenter;
    impl CrisPoco for Reenter {}

    #[derive(Debug)]
    struct Isolate {
        stop_propagation: bool,
    }
    impl CrisPoco for Isolate {}

    #[derive(Debug)]
    struct Child;
    impl CrisPoco for Child {}

    #[derive(Debug)]
    struct ChildDone;
    impl CrisPoco for ChildDone {}

    #[derive(Debug)]
    struct Failing;
    impl CrisPoco for Failing {}

    #[derive(Debug)]
    struct Recover;
    impl CrisPoco for Recover {}

    #[derive(Debug)]
    struct Guarded {
        allowed: bool,
    }
    impl CrisPoco for Guarded {}

    #[derive(Debug)]
    struct Progress;
    impl CrisPoco for Progress {}

    #[derive(Debug, Default)]
    struct Stamped {
        source: Option<CrisObject>,
        party: Option<String>,
    }
    impl CrisPoco for Stamped {
        fn set_source_command(&mut self, command: CrisObject) {
            self.source = Some(command);
        }

        fn set_party_identity(&mut self, party: &str) {
            self.party = Some(party.to_string());
        }
    }

    #[derive(Debug)]
    struct Crash;
    impl CrisPoco for Crash {}

    #[derive(Debug)]
    struct Announce;
    impl CrisPoco for Announce {}

    // =========================================================================
    // Test Handlers
    // =========================================================================

    struct H1;

    #[async_trait]
    impl Handler<C1, Services> for H1 {
        type Output = ();

        async fn handle(&self, _: &C1, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.emit_event(E1).await?;
            ctx.execute(C2).await?;
            ctx.services().record("H1 done");
            Ok(())
        }
    }

    struct H2;

    #[async_trait]
    impl Handler<C2, Services> for H2 {
        type Output = ();

        async fn handle(&self, _: &C2, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.emit_event(E2).await?;
            ctx.services().record("H2 after emit");
            Ok(())
        }
    }

    struct OnE1;

    #[async_trait]
    impl EventHandler<E1, Services> for OnE1 {
        async fn handle_event(&self, _: &E1, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.services().record("E1 handled");
            Ok(())
        }
    }

    struct OnE2;

    #[async_trait]
    impl EventHandler<E2, Services> for OnE2 {
        async fn handle_event(&self, _: &E2, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.services().record("E2 handled");
            Ok(())
        }
    }

    struct NestHandler;

    #[async_trait]
    impl Handler<Nest, Services> for NestHandler {
        type Output = u32;

        async fn handle(&self, cmd: &Nest, ctx: &mut ExecutionContext<Services>) -> Result<u32> {
            ctx.emit_event(Step { n: cmd.remaining }).await?;
            let depth = ctx.depth() as u32;
            if cmd.remaining > 0 {
                ctx.execute(Nest {
                    remaining: cmd.remaining - 1,
                })
                .await?;
            }
            ctx.services().record(format!("nest {} done", cmd.remaining));
            Ok(depth)
        }
    }

    struct OnStep;

    #[async_trait]
    impl EventHandler<Step, Services> for OnStep {
        async fn handle_event(&self, e: &Step, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.services().record(format!("step {}", e.n));
            Ok(())
        }
    }

    struct ReenterHandler;

    #[async_trait]
    impl Handler<Reenter, Services> for ReenterHandler {
        type Output = bool;

        async fn handle(&self, _: &Reenter, ctx: &mut ExecutionContext<Services>) -> Result<bool> {
            let err = ctx
                .execute_root(cris_object(C2))
                .await
                .err()
                .ok_or_else(|| anyhow::anyhow!("nested root call succeeded"))?;
            Ok(is_invalid_state(&err))
        }
    }

    struct IsolateHandler;

    #[async_trait]
    impl Handler<Isolate, Services> for IsolateHandler {
        type Output = usize;

        async fn handle(&self, cmd: &Isolate, ctx: &mut ExecutionContext<Services>) -> Result<usize> {
            let (_, events) = ctx
                .execute_command_with_events(cris_object(Child), cmd.stop_propagation)
                .await?;
            Ok(events.len())
        }
    }

    struct ChildHandler;

    #[async_trait]
    impl Handler<Child, Services> for ChildHandler {
        type Output = ();

        async fn handle(&self, _: &Child, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.emit_event(ChildDone).await
        }
    }

    struct CrashHandler;

    #[async_trait]
    impl Handler<Crash, Services> for CrashHandler {
        type Output = ();

        async fn handle(&self, _: &Crash, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.execute(Child).await?;
            panic!("handler bug")
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler<Failing, Services> for FailingHandler {
        type Output = ();

        async fn handle(&self, _: &Failing, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.emit_event(ChildDone).await?;
            anyhow::bail!("failing handler")
        }
    }

    struct RecoverHandler;

    #[async_trait]
    impl Handler<Recover, Services> for RecoverHandler {
        type Output = usize;

        async fn handle(&self, _: &Recover, ctx: &mut ExecutionContext<Services>) -> Result<usize> {
            let failed = ctx.execute(Failing).await;
            if failed.is_ok() {
                anyhow::bail!("expected the nested command to fail");
            }
            Ok(ctx.depth())
        }
    }

    struct GuardedHandler;

    #[async_trait]
    impl Handler<Guarded, Services> for GuardedHandler {
        type Output = ();

        async fn handle(&self, _: &Guarded, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.services().record("guarded handled");
            Ok(())
        }
    }

    struct GuardValidator;

    #[async_trait]
    impl Validator<Services> for GuardValidator {
        async fn validate(
            &self,
            object: &CrisObject,
            ctx: &mut ValidationContext<'_, Services>,
        ) -> Result<()> {
            if let Some(cmd) = object.downcast_ref::<Guarded>() {
                if !cmd.allowed {
                    ctx.messages().error("Not allowed.");
                }
            }
            Ok(())
        }
    }

    struct AnnounceHandler;

    #[async_trait]
    impl Handler<Announce, Services> for AnnounceHandler {
        type Output = ();

        async fn handle(&self, _: &Announce, ctx: &mut ExecutionContext<Services>) -> Result<()> {
            ctx.emit_event(Progress).await?;
            ctx.emit_event(Stamped::default()).await?;
            ctx.services().record("announce done");
            Ok(())
        }
    }

    struct PostRecorder;

    #[async_trait]
    impl crate::handler::PostHandler<C2, Services> for PostRecorder {
        async fn post_handle(
            &self,
            _: &C2,
            result: &CommandResult,
            ctx: &mut ExecutionContext<Services>,
        ) -> Result<()> {
            ctx.services()
                .record(format!("post C2 void={}", result.is_void()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ImmediateEventSink for RecordingSink {
        async fn on_immediate_event(&self, event: &CrisObject) -> Result<()> {
            self.events.lock().unwrap().push(event.cris_type_name());
            Ok(())
        }
    }

    fn registry() -> Arc<HandlerRegistry<Services>> {
        let registry = RegistryBuilder::<Services>::new()
            .command::<C1>()
            .command::<C2>()
            .routed_event::<E1>()
            .routed_immediate_event::<E2>()
            .command_with_result::<Nest, u32>()
            .routed_event::<Step>()
            .command_with_result::<Reenter, bool>()
            .command_with_result::<Isolate, usize>()
            .command::<Child>()
            .caller_only_event::<ChildDone>()
            .command::<Failing>()
            .command_with_result::<Recover, usize>()
            .command::<Guarded>()
            .caller_only_immediate_event::<Progress>()
            .caller_only_event::<Stamped>()
            .command::<Announce>()
            .command::<Crash>()
            .handler::<Crash, _>(CrashHandler)
            .handler::<C1, _>(H1)
            .handler::<C2, _>(H2)
            .post_handler::<C2, _>(PostRecorder)
            .event_handler::<E1, _>(OnE1)
            .event_handler::<E2, _>(OnE2)
            .handler::<Nest, _>(NestHandler)
            .event_handler::<Step, _>(OnStep)
            .handler::<Reenter, _>(ReenterHandler)
            .handler::<Isolate, _>(IsolateHandler)
            .handler::<Child, _>(ChildHandler)
            .handler::<Failing, _>(FailingHandler)
            .handler::<Recover, _>(RecoverHandler)
            .handler::<Guarded, _>(GuardedHandler)
            .handling_validator::<Guarded, _>(GuardValidator)
            .handler::<Announce, _>(AnnounceHandler)
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn context() -> ExecutionContext<Services> {
        ExecutionContext::new(registry(), Arc::new(Services::default()))
    }

    // =========================================================================
    // Scenario
    // =========================================================================

    #[tokio::test]
    async fn test_immediate_and_routed_events_scenario() {
        let mut ctx = context();

        let outcome = ctx.execute_root(cris_object(C1)).await.unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.events[0].is::<E1>());
        assert!(outcome.result.is_void());
        assert_eq!(
            ctx.services().entries(),
            vec![
                "E2 handled",
                "H2 after emit",
                "post C2 void=true",
                "H1 done",
                "E1 handled",
            ]
        );
        assert_eq!(ctx.depth(), 0);
    }

    // =========================================================================
    // Call chain protocol
    // =========================================================================

    #[tokio::test]
    async fn test_root_inside_active_chain_is_invalid() {
        let mut ctx = context();

        let outcome = ctx.execute_root(cris_object(Reenter)).await.unwrap();
        assert_eq!(outcome.result.downcast_ref::<bool>(), Some(&true));

        // The context is reusable once the chain completed.
        let again = ctx.execute_root(cris_object(Reenter)).await.unwrap();
        assert_eq!(again.result.downcast_ref::<bool>(), Some(&true));
    }

    #[tokio::test]
    async fn test_nested_operations_outside_chain_are_invalid() {
        let mut ctx = context();

        let err = ctx.execute_command(cris_object(C2)).await.unwrap_err();
        assert!(is_invalid_state(&err));

        let err = ctx.emit_event(E1).await.unwrap_err();
        assert!(is_invalid_state(&err));
        assert!(!ctx.is_executing_command());
        assert!(ctx.current_command().is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_misrouted_types() {
        #[derive(Debug)]
        struct Unregistered;
        impl CrisPoco for Unregistered {}

        let mut ctx = context();

        let err = ctx.execute_root(cris_object(Unregistered)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrisError>(),
            Some(CrisError::UnknownType { .. })
        ));

        let err = ctx.execute_root(cris_object(E1)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrisError>(),
            Some(CrisError::KindMismatch { expected: "command", .. })
        ));
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test]
    async fn test_command_without_handler() {
        #[derive(Debug)]
        struct Orphan;
        impl CrisPoco for Orphan {}

        let registry = RegistryBuilder::<Services>::new()
            .command::<Orphan>()
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(registry), Arc::new(Services::default()));

        let err = ctx.execute_root(cris_object(Orphan)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrisError>(),
            Some(CrisError::NoHandler { .. })
        ));
    }

    // =========================================================================
    // Event bubbling
    // =========================================================================

    #[tokio::test]
    async fn test_routed_events_bubble_to_root_in_emission_order() {
        let mut ctx = context();

        let outcome = ctx
            .execute_root(cris_object(Nest { remaining: 3 }))
            .await
            .unwrap();

        let steps: Vec<u32> = outcome
            .events
            .iter()
            .map(|e| e.downcast_ref::<Step>().unwrap().n)
            .collect();
        assert_eq!(steps, vec![3, 2, 1, 0]);
        assert_eq!(outcome.result.downcast_ref::<u32>(), Some(&1));

        // Every nested command completed before any step was dispatched.
        assert_eq!(
            ctx.services().entries(),
            vec![
                "nest 0 done",
                "nest 1 done",
                "nest 2 done",
                "nest 3 done",
                "step 3",
                "step 2",
                "step 1",
                "step 0",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_propagation_keeps_events_from_parent() {
        let mut ctx = context();

        let outcome = ctx
            .execute_root(cris_object(Isolate {
                stop_propagation: true,
            }))
            .await
            .unwrap();
        assert_eq!(outcome.result.downcast_ref::<usize>(), Some(&1));
        assert!(outcome.events.is_empty());

        let outcome = ctx
            .execute_root(cris_object(Isolate {
                stop_propagation: false,
            }))
            .await
            .unwrap();
        assert_eq!(outcome.result.downcast_ref::<usize>(), Some(&1));
        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.events[0].is::<ChildDone>());
    }

    #[tokio::test]
    async fn test_failed_nested_command_unwinds_its_frame() {
        let mut ctx = context();

        let outcome = ctx.execute_root(cris_object(Recover)).await.unwrap();

        assert_eq!(outcome.result.downcast_ref::<usize>(), Some(&1));
        // Events of the failed sub-call are dropped with its frame.
        assert!(outcome.events.is_empty());
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test]
    async fn test_root_failure_leaves_context_reusable() {
        let mut ctx = context();

        let err = ctx.execute_root(cris_object(Failing)).await.unwrap_err();
        assert!(err.to_string().contains("failing handler"));
        assert_eq!(ctx.depth(), 0);

        ctx.execute_root(cris_object(C2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_root_panic_leaves_context_reusable() {
        let mut ctx = context();

        let caught = AssertUnwindSafe(ctx.execute_root(cris_object(Crash)))
            .catch_unwind()
            .await;
        assert!(caught.is_err());
        assert_eq!(ctx.depth(), 0);
        assert!(!ctx.is_executing_command());

        ctx.execute_root(cris_object(C2)).await.unwrap();
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[tokio::test]
    async fn test_handling_validation_rejects_command() {
        let mut ctx = context();

        let err = ctx
            .execute_root(cris_object(Guarded { allowed: false }))
            .await
            .unwrap_err();
        match err.downcast_ref::<CrisError>() {
            Some(CrisError::ValidationFailed { result, .. }) => {
                assert_eq!(result.errors().next().unwrap().text, "Not allowed.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ctx.services().entries().is_empty());

        ctx.execute_root(cris_object(Guarded { allowed: true }))
            .await
            .unwrap();
        assert_eq!(ctx.services().entries(), vec!["guarded handled"]);
    }

    #[tokio::test]
    async fn test_prevalidated_root_skips_handling_validation() {
        let mut ctx = context();

        ctx.execute_root_prevalidated(cris_object(Guarded { allowed: false }))
            .await
            .unwrap();
        assert_eq!(ctx.services().entries(), vec!["guarded handled"]);
    }

    // =========================================================================
    // Immediate events and stamping
    // =========================================================================

    #[tokio::test]
    async fn test_immediate_events_reach_the_sink_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = context().with_immediate_sink(sink.clone());

        ctx.execute_root(cris_object(C1)).await.unwrap();
        ctx.execute_root(cris_object(Announce)).await.unwrap();

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events[0].ends_with("E2"));
        assert!(events[1].ends_with("Progress"));
    }

    #[tokio::test]
    async fn test_events_are_stamped_with_source_and_party() {
        let mut ctx = context().with_party_identity("node-7");

        let outcome = ctx.execute_root(cris_object(Announce)).await.unwrap();

        assert_eq!(outcome.events.len(), 1);
        let stamped = outcome.events[0].downcast_ref::<Stamped>().unwrap();
        assert!(stamped.source.as_ref().unwrap().is::<Announce>());
        assert_eq!(stamped.party.as_deref(), Some("node-7"));
    }

    #[tokio::test]
    async fn test_safe_dispatch_reports_failures() {
        struct Explode;

        #[async_trait]
        impl EventHandler<E1, Services> for Explode {
            async fn handle_event(&self, _: &E1, _: &mut ExecutionContext<Services>) -> Result<()> {
                anyhow::bail!("event handler failed")
            }
        }

        let registry = RegistryBuilder::<Services>::new()
            .routed_event::<E1>()
            .routed_event::<E2>()
            .event_handler::<E1, _>(Explode)
            .event_handler::<E2, _>(OnE2)
            .build()
            .unwrap();
        let mut ctx = ExecutionContext::new(Arc::new(registry), Arc::new(Services::default()));

        assert!(!ctx.dispatch_event_safe(&cris_object(E1)).await);
        assert!(ctx.dispatch_event_safe(&cris_object(E2)).await);
        assert!(ctx.dispatch_event(&cris_object(E1)).await.is_err());
        assert_eq!(ctx.services().entries(), vec!["E2 handled"]);
    }
}
