//! # Cris
//!
//! A command/event execution engine: validated commands run by exactly one
//! elected handler, events bubble up the call chain, and a resizable pool of
//! runners executes root commands in the background.
//!
//! ## Core Concepts
//!
//! - **Commands** are requests, handled by exactly one handler and optionally
//!   returning a result. Post-handlers run after the handler.
//! - **Events** are notifications emitted by executing commands. Their
//!   [`CrisKind`] says who sees them (caller only, or routed to event
//!   handlers) and when (immediately, or once the root command completed).
//!
//! ## Architecture
//!
//! ```text
//! caller ──► ExecutionHost::receive ── incoming validation
//!                │
//!                ▼ Job
//!          shared FIFO ◄── Grow / Poison (set_runner_count)
//!                │
//!                ▼ runner
//!   create scope ─► restore ambient values ─► handling validation
//!                │
//!                ▼
//!   ExecutionContext::execute_root
//!     ├─► handler ─► ctx.execute(nested) ─► handler ─► ...
//!     │      └─► ctx.emit_event ─► immediate: dispatch now + caller stream
//!     │                           final: bubble to the calling frame
//!     ├─► post-handlers
//!     └─► dispatch routed final events
//!                │
//!                ▼
//!   ExecutedCommand ─► JobExecutor hooks + ExecutingCommand handle
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One chain per context** - a second root command is rejected while one
//!    is active; nested work takes `&mut ExecutionContext`
//! 2. **Bubbling** - final events of a nested command join its caller's
//!    frame, unless the caller asked to stop propagation
//! 3. **Order-independent election** - registration order never changes
//!    which handler wins
//! 4. **Contained failures** - a failing or panicking job yields a sanitized
//!    error result and the runner keeps going
//!
//! ## Example
//!
//! ```ignore
//! use cris::{cris_object, CrisPoco, ExecutionContext, ExecutionHost, Handler, HostConfig,
//!            Job, RegistryBuilder, ScopeData, ClosureExecutor};
//!
//! #[derive(Debug)]
//! struct CreateUser { name: String }
//! impl CrisPoco for CreateUser {}
//!
//! #[derive(Debug)]
//! struct UserCreated { id: u64 }
//! impl CrisPoco for UserCreated {}
//!
//! struct CreateUserHandler;
//!
//! #[cris::async_trait]
//! impl Handler<CreateUser, AppServices> for CreateUserHandler {
//!     type Output = u64;
//!
//!     async fn handle(&self, cmd: &CreateUser, ctx: &mut ExecutionContext<AppServices>) -> anyhow::Result<u64> {
//!         let id = ctx.services().users.insert(&cmd.name).await?;
//!         ctx.emit_event(UserCreated { id }).await?;
//!         Ok(id)
//!     }
//! }
//!
//! let registry = RegistryBuilder::<AppServices>::new()
//!     .command_with_result::<CreateUser, u64>()
//!     .routed_event::<UserCreated>()
//!     .handler::<CreateUser, _>(CreateUserHandler)
//!     .event_handler::<UserCreated, _>(SendWelcomeMail)
//!     .build()?;
//!
//! let host = ExecutionHost::start(Arc::new(registry), HostConfig::from_env()?)?;
//! let executor = Arc::new(ClosureExecutor::new(|_: &ScopeData| AppServices::connect()));
//!
//! let (job, handle) = Job::new(cris_object(CreateUser { name }), executor, ScopeData::default());
//! host.submit(job)?;
//! let executed = handle.wait().await?;
//! ```

// Core modules
mod config;
mod context;
mod core;
mod dispatch;
mod election;
mod error;
mod handler;
mod registry;
mod validation;

// Background execution
pub mod host;
pub mod job;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export the object model
pub use crate::core::{
    cris_object, AmbientValues, AsAny, CommandResult, CorrelationId, CrisKind, CrisObject,
    CrisPoco,
};

// Re-export error types
pub use crate::error::{
    is_invalid_state, CrisError, CrisResult, CrisResultError, UNHANDLED_ERROR_MESSAGE,
};

// Re-export handler traits
pub use crate::handler::{
    ErasedEventHandler, ErasedHandler, ErasedPostHandler, EventHandler, EventHandlerWrapper,
    Handler, HandlerWrapper, PostHandler, PostHandlerWrapper, ServiceFactory, ServiceSlot,
};

// Re-export registry and election
pub use crate::election::{
    elect, CandidateSignature, ConflictReason, ElectionError, ElectionInput, HierarchyCycle,
    TypeHierarchy, TypeKey,
};
pub use crate::registry::{
    AmbientValuesProvider, CrisTypeDescriptor, HandlerCandidate, HandlerRegistry,
    RegistryBuilder, RegistryError,
};

// Re-export validation
pub use crate::validation::{
    validate_handling, validate_incoming, MessageLevel, UserMessage, UserMessageCollector,
    ValidationContext, ValidationResult, ValidationStage, Validator, UNHANDLED_VALIDATION_ERROR,
};

// Re-export execution
pub use crate::config::{HostConfig, MAX_RUNNER_COUNT};
pub use crate::context::{
    ExecutionContext, ExecutionOutcome, Frame, ImmediateEventSink, DEFAULT_PARTY_IDENTITY,
};
pub use crate::dispatch::{dispatch_event, dispatch_event_safe};
pub use crate::host::{CommandReceipt, ExecutionHost, PoolStatus};
pub use crate::job::{
    ClosureExecutor, ExecutedCommand, ExecutingCommand, Job, JobExecutor, JobInfo, ScopeData,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
