//! Handler traits and service resolution.
//!
//! Handlers come in two layers, like command dispatch in most Rust frameworks:
//!
//! - **Typed traits** ([`Handler`], [`PostHandler`], [`EventHandler`]) are what
//!   applications implement. They receive the concrete command or event type.
//! - **Erased traits** ([`ErasedHandler`], [`ErasedPostHandler`],
//!   [`ErasedEventHandler`]) are what the registry stores. Wrappers downcast
//!   the [`CrisObject`] and call the typed trait. Implement an erased trait
//!   directly for handlers written against a "part" trait object instead of a
//!   concrete command (unclosed handlers).
//!
//! Every registration is a [`ServiceSlot`]: either one pooled instance shared
//! by all calls, or a factory resolving the instance from the call's services.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::core::{CommandResult, CrisObject, CrisPoco};
use crate::error::CrisError;

/// Factory resolving a scoped service from the call's services.
pub type ServiceFactory<T, D> = Arc<dyn Fn(&D) -> Result<Arc<T>> + Send + Sync>;

/// How a handler or validator instance is obtained for a call.
pub enum ServiceSlot<T: ?Sized, D> {
    /// One shared instance.
    Pooled(Arc<T>),
    /// Resolved from the call's services on every call.
    Scoped(ServiceFactory<T, D>),
}

impl<T: ?Sized, D> ServiceSlot<T, D> {
    /// A pooled slot.
    pub fn pooled(instance: Arc<T>) -> Self {
        ServiceSlot::Pooled(instance)
    }

    /// A scoped slot.
    pub fn scoped<F>(factory: F) -> Self
    where
        F: Fn(&D) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        ServiceSlot::Scoped(Arc::new(factory))
    }

    /// Returns true for pooled slots.
    pub fn is_pooled(&self) -> bool {
        matches!(self, ServiceSlot::Pooled(_))
    }

    /// Obtain the instance for a call.
    pub fn resolve(&self, services: &D) -> Result<Arc<T>> {
        match self {
            ServiceSlot::Pooled(instance) => Ok(Arc::clone(instance)),
            ServiceSlot::Scoped(factory) => factory(services),
        }
    }
}

impl<T: ?Sized, D> Clone for ServiceSlot<T, D> {
    fn clone(&self) -> Self {
        match self {
            ServiceSlot::Pooled(instance) => ServiceSlot::Pooled(Arc::clone(instance)),
            ServiceSlot::Scoped(factory) => ServiceSlot::Scoped(Arc::clone(factory)),
        }
    }
}

impl<T: ?Sized, D> fmt::Debug for ServiceSlot<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSlot::Pooled(_) => f.write_str("ServiceSlot::Pooled"),
            ServiceSlot::Scoped(_) => f.write_str("ServiceSlot::Scoped"),
        }
    }
}

// =============================================================================
// Command handlers
// =============================================================================

/// Handler of a command type.
///
/// Handlers execute one command and return its result (`()` for commands
/// without result). Through the context they can execute nested commands and
/// emit events; both run sequentially, inside the same call chain.
///
/// # Example
///
/// ```ignore
/// struct CreateUserHandler;
///
/// #[async_trait]
/// impl Handler<CreateUser, AppServices> for CreateUserHandler {
///     type Output = UserId;
///
///     async fn handle(&self, cmd: &CreateUser, ctx: &mut ExecutionContext<AppServices>) -> Result<UserId> {
///         let id = ctx.services().users.insert(&cmd.name).await?;
///         ctx.emit_event(UserCreated { id, source: None }).await?;
///         Ok(id)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<C: CrisPoco, D: Send + Sync + 'static>: Send + Sync + 'static {
    /// The command's result. `()` means no result.
    type Output: Any + Send + Sync;

    /// Execute the command.
    async fn handle(&self, command: &C, ctx: &mut ExecutionContext<D>) -> Result<Self::Output>;
}

/// Type-erased command handler, as stored in the registry.
#[async_trait]
pub trait ErasedHandler<D: Send + Sync + 'static>: Send + Sync + 'static {
    /// Execute a command.
    async fn handle_erased(
        &self,
        command: CrisObject,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<CommandResult>;
}

/// Adapts a [`Handler`] to [`ErasedHandler`].
pub struct HandlerWrapper<H, C, D> {
    handler: H,
    _phantom: PhantomData<fn() -> (C, D)>,
}

impl<H, C, D> HandlerWrapper<H, C, D>
where
    H: Handler<C, D>,
    C: CrisPoco,
    D: Send + Sync + 'static,
{
    /// Wrap a typed handler.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, C, D> ErasedHandler<D> for HandlerWrapper<H, C, D>
where
    H: Handler<C, D>,
    C: CrisPoco,
    D: Send + Sync + 'static,
{
    async fn handle_erased(
        &self,
        command: CrisObject,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<CommandResult> {
        let typed = downcast::<C>(&command)?;
        let output = self.handler.handle(typed, ctx).await?;
        Ok(into_command_result(output))
    }
}

fn into_command_result<T: Any + Send + Sync>(value: T) -> CommandResult {
    if TypeId::of::<T>() == TypeId::of::<()>() {
        CommandResult::void()
    } else {
        CommandResult::new(value)
    }
}

// =============================================================================
// Post-handlers
// =============================================================================

/// Runs after the handler of a command, with its result.
///
/// Post-handlers of a command run in registration order.
#[async_trait]
pub trait PostHandler<C: CrisPoco, D: Send + Sync + 'static>: Send + Sync + 'static {
    /// React to an executed command.
    async fn post_handle(
        &self,
        command: &C,
        result: &CommandResult,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<()>;
}

/// Type-erased post-handler.
#[async_trait]
pub trait ErasedPostHandler<D: Send + Sync + 'static>: Send + Sync + 'static {
    /// React to an executed command.
    async fn post_handle_erased(
        &self,
        command: CrisObject,
        result: &CommandResult,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<()>;
}

/// Adapts a [`PostHandler`] to [`ErasedPostHandler`].
pub struct PostHandlerWrapper<P, C, D> {
    handler: P,
    _phantom: PhantomData<fn() -> (C, D)>,
}

impl<P, C, D> PostHandlerWrapper<P, C, D>
where
    P: PostHandler<C, D>,
    C: CrisPoco,
    D: Send + Sync + 'static,
{
    /// Wrap a typed post-handler.
    pub fn new(handler: P) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<P, C, D> ErasedPostHandler<D> for PostHandlerWrapper<P, C, D>
where
    P: PostHandler<C, D>,
    C: CrisPoco,
    D: Send + Sync + 'static,
{
    async fn post_handle_erased(
        &self,
        command: CrisObject,
        result: &CommandResult,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<()> {
        let typed = downcast::<C>(&command)?;
        self.handler.post_handle(typed, result, ctx).await
    }
}

// =============================================================================
// Event handlers
// =============================================================================

/// Handler of a routed event type.
///
/// Event handlers may execute commands and emit further events.
#[async_trait]
pub trait EventHandler<E: CrisPoco, D: Send + Sync + 'static>: Send + Sync + 'static {
    /// React to the event.
    async fn handle_event(&self, event: &E, ctx: &mut ExecutionContext<D>) -> Result<()>;
}

/// Type-erased event handler.
#[async_trait]
pub trait ErasedEventHandler<D: Send + Sync + 'static>: Send + Sync + 'static {
    /// React to the event.
    async fn handle_event_erased(
        &self,
        event: CrisObject,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<()>;
}

/// Adapts an [`EventHandler`] to [`ErasedEventHandler`].
pub struct EventHandlerWrapper<H, E, D> {
    handler: H,
    _phantom: PhantomData<fn() -> (E, D)>,
}

impl<H, E, D> EventHandlerWrapper<H, E, D>
where
    H: EventHandler<E, D>,
    E: CrisPoco,
    D: Send + Sync + 'static,
{
    /// Wrap a typed event handler.
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<H, E, D> ErasedEventHandler<D> for EventHandlerWrapper<H, E, D>
where
    H: EventHandler<E, D>,
    E: CrisPoco,
    D: Send + Sync + 'static,
{
    async fn handle_event_erased(
        &self,
        event: CrisObject,
        ctx: &mut ExecutionContext<D>,
    ) -> Result<()> {
        let typed = downcast::<E>(&event)?;
        self.handler.handle_event(typed, ctx).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn downcast<T: CrisPoco>(object: &CrisObject) -> Result<&T, CrisError> {
    object
        .downcast_ref::<T>()
        .ok_or(CrisError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn extract_panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
