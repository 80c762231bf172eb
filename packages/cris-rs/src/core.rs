//! Core object model for the cris execution engine.
//!
//! # Overview
//!
//! Everything that flows through cris is a [`CrisPoco`]: a command (a request,
//! possibly expecting a result) or an event (a fire-and-forget notification).
//! Objects are shared as [`CrisObject`] (`Arc<dyn CrisPoco>`) once they enter
//! the engine; their concrete type identity selects a descriptor in the
//! [`HandlerRegistry`](crate::HandlerRegistry), and the descriptor's
//! [`CrisKind`] drives how the engine treats them.
//!
//! # Correlation
//!
//! Every job and every error path carries a [`CorrelationId`] (the issuer
//! token). It exists purely for log correlation and never influences control
//! flow.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation ID used as issuer token and log key.
///
/// Use `CorrelationId::NONE` for uncorrelated work, or `CorrelationId::new()`
/// to generate a fresh ID.
///
/// # Example
///
/// ```ignore
/// use cris::CorrelationId;
///
/// let token = CorrelationId::new();
/// assert!(token.is_some());
///
/// let log_key = token.to_string();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated work.
    ///
    /// Uses nil UUID (`00000000-0000-0000-0000-000000000000`).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Type-identity helpers for [`CrisPoco`].
///
/// Automatically implemented for every [`CrisPoco`]. Smart pointers such as
/// [`CrisObject`] are not `CrisPoco` themselves, so method calls on them always
/// reach the concrete type.
pub trait AsAny: Any + Send + Sync {
    /// Borrow as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// The `TypeId` of the concrete type.
    fn cris_type_id(&self) -> TypeId;

    /// The Rust type name of the concrete type (for logs and errors).
    fn cris_type_name(&self) -> &'static str;
}

impl<T: CrisPoco> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn cris_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn cris_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A command or an event.
///
/// Implement it (usually with an empty `impl`) for every type registered in
/// the [`RegistryBuilder`](crate::RegistryBuilder). The two stamping hooks are
/// called by [`ExecutionContext::emit_event`](crate::ExecutionContext::emit_event)
/// before the event is classified; override them on event types that carry a
/// source-command relation or a party identity field.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct UserCreated {
///     user_id: u64,
///     source: Option<CrisObject>,
/// }
///
/// impl CrisPoco for UserCreated {
///     fn set_source_command(&mut self, command: CrisObject) {
///         self.source = Some(command);
///     }
/// }
/// ```
pub trait CrisPoco: AsAny + fmt::Debug {
    /// Receives the command currently executing when this event is emitted.
    fn set_source_command(&mut self, _command: CrisObject) {}

    /// Receives the identity of the party (process) emitting this event.
    fn set_party_identity(&mut self, _party: &str) {}
}

impl dyn CrisPoco {
    /// Downcast to a concrete command or event type.
    pub fn downcast_ref<T: CrisPoco>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Check the concrete type.
    pub fn is<T: CrisPoco>(&self) -> bool {
        self.cris_type_id() == TypeId::of::<T>()
    }
}

/// A command or event once it has entered the engine.
pub type CrisObject = Arc<dyn CrisPoco>;

/// Wrap a concrete command or event into a [`CrisObject`].
pub fn cris_object<T: CrisPoco>(poco: T) -> CrisObject {
    Arc::new(poco)
}

/// What a registered type is and how the engine treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrisKind {
    /// A command without result.
    Command,
    /// A command whose handler produces a result.
    CommandWithResult,
    /// An event only returned to the caller; bubbles to the root.
    CallerOnlyEvent,
    /// An event only sent to the caller, synchronously, when emitted.
    CallerOnlyImmediateEvent,
    /// An event dispatched to its event handlers once it reaches the root.
    RoutedEvent,
    /// An event dispatched to its event handlers synchronously when emitted.
    RoutedImmediateEvent,
}

impl CrisKind {
    /// Build an event kind from its two axes.
    pub fn event(routed: bool, immediate: bool) -> Self {
        match (routed, immediate) {
            (false, false) => CrisKind::CallerOnlyEvent,
            (false, true) => CrisKind::CallerOnlyImmediateEvent,
            (true, false) => CrisKind::RoutedEvent,
            (true, true) => CrisKind::RoutedImmediateEvent,
        }
    }

    /// Returns true for both command kinds.
    pub fn is_command(&self) -> bool {
        matches!(self, CrisKind::Command | CrisKind::CommandWithResult)
    }

    /// Returns true for the four event kinds.
    pub fn is_event(&self) -> bool {
        !self.is_command()
    }

    /// Returns true for events that can have event handlers.
    pub fn is_routed(&self) -> bool {
        matches!(self, CrisKind::RoutedEvent | CrisKind::RoutedImmediateEvent)
    }

    /// Returns true for events handled at emission time.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            CrisKind::CallerOnlyImmediateEvent | CrisKind::RoutedImmediateEvent
        )
    }
}

impl fmt::Display for CrisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrisKind::Command => "command",
            CrisKind::CommandWithResult => "command_with_result",
            CrisKind::CallerOnlyEvent => "caller_only_event",
            CrisKind::CallerOnlyImmediateEvent => "caller_only_immediate_event",
            CrisKind::RoutedEvent => "routed_event",
            CrisKind::RoutedImmediateEvent => "routed_immediate_event",
        };
        f.write_str(name)
    }
}

/// The result of a command execution, `void` for commands without result.
#[derive(Clone, Default)]
pub struct CommandResult(Option<Arc<dyn Any + Send + Sync>>);

impl CommandResult {
    /// The result of a command without result.
    pub fn void() -> Self {
        Self(None)
    }

    /// Wrap a handler's result value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    /// Wrap an already shared value.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(Some(value))
    }

    /// Returns true when there is no value.
    pub fn is_void(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the value as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }

    /// The `TypeId` of the value, if any.
    pub fn value_type_id(&self) -> Option<TypeId> {
        self.0.as_deref().map(|v| v.type_id())
    }

    /// Access the shared value.
    pub fn value(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.0.as_ref()
    }
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("CommandResult(void)"),
            Some(_) => f.write_str("CommandResult(..)"),
        }
    }
}

/// Ubiquitous values (identity, culture, ...) available to handlers without
/// explicit parameter passing.
///
/// Snapshots are captured when a command enters the process and travel with
/// background jobs inside [`ScopeData`](crate::ScopeData).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmbientValues {
    values: BTreeMap<String, serde_json::Value>,
}

impl AmbientValues {
    /// Create an empty set of ambient values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Get a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when no value is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
