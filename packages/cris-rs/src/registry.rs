//! Handler registry: one immutable descriptor per command or event type.
//!
//! The registry replaces runtime type discovery with an explicit registration
//! table. A [`RegistryBuilder`] collects type declarations, the type hierarchy,
//! handler candidates, validators, post-handlers and event handlers; `build()`
//! checks them, runs the handler election and freezes the result into a
//! [`HandlerRegistry`] shared by `Arc` without locking.
//!
//! # Example
//!
//! ```ignore
//! let registry = RegistryBuilder::<AppServices>::new()
//!     .command_with_result::<CreateUser, UserId>()
//!     .routed_event::<UserCreated>()
//!     .handler::<CreateUser, _>(CreateUserHandler)
//!     .handling_validator::<CreateUser, _>(NameRequired)
//!     .event_handler::<UserCreated, _>(SendWelcomeMail)
//!     .build()?;
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::info;

use crate::core::{AmbientValues, CrisKind, CrisPoco};
use crate::election::{
    elect, CandidateSignature, ElectionError, ElectionInput, HierarchyCycle, TypeHierarchy,
    TypeKey,
};
use crate::error::CrisError;
use crate::handler::{
    ErasedEventHandler, ErasedHandler, ErasedPostHandler, EventHandler, EventHandlerWrapper,
    Handler, HandlerWrapper, PostHandler, PostHandlerWrapper, ServiceSlot,
};
use crate::validation::Validator;

/// Builds the ambient values of a call from its services.
pub type AmbientValuesProvider<D> = Arc<dyn Fn(&D) -> Result<AmbientValues> + Send + Sync>;

type ValidatorSlot<D> = ServiceSlot<dyn Validator<D>, D>;
type HandlerSlot<D> = ServiceSlot<dyn ErasedHandler<D>, D>;
type PostHandlerSlot<D> = ServiceSlot<dyn ErasedPostHandler<D>, D>;
type EventHandlerSlot<D> = ServiceSlot<dyn ErasedEventHandler<D>, D>;

/// Error raised by [`RegistryBuilder::build`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A type was declared twice.
    #[error("type {type_name} is declared twice")]
    DuplicateType {
        /// The type.
        type_name: &'static str,
    },

    /// A registration refers to a type that was never declared.
    #[error("{registration} registered for undeclared type {type_name}")]
    UndeclaredType {
        /// The type.
        type_name: &'static str,
        /// What was registered.
        registration: &'static str,
    },

    /// A registration does not fit the declared kind.
    #[error("{registration} cannot be registered for {type_name} ({kind})")]
    KindMismatch {
        /// The type.
        type_name: &'static str,
        /// The declared kind.
        kind: CrisKind,
        /// What was registered.
        registration: &'static str,
    },

    /// The declared type hierarchy is cyclic.
    #[error(transparent)]
    HierarchyCycle(#[from] HierarchyCycle),

    /// Handler election failed.
    #[error(transparent)]
    Election(#[from] ElectionError),
}

// =============================================================================
// Descriptor
// =============================================================================

/// Everything the engine knows about one registered type.
pub struct CrisTypeDescriptor<D> {
    index: usize,
    key: TypeKey,
    kind: CrisKind,
    result_type: Option<TypeKey>,
    handler: Option<(CandidateSignature, HandlerSlot<D>)>,
    incoming_validators: Vec<ValidatorSlot<D>>,
    handling_validators: Vec<ValidatorSlot<D>>,
    post_handlers: Vec<PostHandlerSlot<D>>,
    event_handlers: Vec<EventHandlerSlot<D>>,
    is_handled: bool,
}

impl<D> CrisTypeDescriptor<D> {
    /// Stable index, in declaration order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The type.
    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    /// The Rust type name.
    pub fn type_name(&self) -> &'static str {
        self.key.name()
    }

    /// The kind.
    pub fn kind(&self) -> CrisKind {
        self.kind
    }

    /// Declared result type of a command with result.
    pub fn result_type(&self) -> Option<TypeKey> {
        self.result_type
    }

    /// The elected handler.
    pub fn handler(&self) -> Option<&HandlerSlot<D>> {
        self.handler.as_ref().map(|(_, slot)| slot)
    }

    /// Signature of the elected handler.
    pub fn handler_signature(&self) -> Option<&CandidateSignature> {
        self.handler.as_ref().map(|(sig, _)| sig)
    }

    /// Validators run where the object enters the process.
    pub fn incoming_validators(&self) -> &[ValidatorSlot<D>] {
        &self.incoming_validators
    }

    /// Validators run right before the handler.
    pub fn handling_validators(&self) -> &[ValidatorSlot<D>] {
        &self.handling_validators
    }

    /// Post-handlers, in registration order.
    pub fn post_handlers(&self) -> &[PostHandlerSlot<D>] {
        &self.post_handlers
    }

    /// Event handlers, in registration order.
    pub fn event_handlers(&self) -> &[EventHandlerSlot<D>] {
        &self.event_handlers
    }

    /// Command: has a handler. Routed event: has at least one event handler.
    /// Caller-only event: never.
    pub fn is_handled(&self) -> bool {
        self.is_handled
    }
}

impl<D> fmt::Debug for CrisTypeDescriptor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrisTypeDescriptor")
            .field("index", &self.index)
            .field("type", &self.key)
            .field("kind", &self.kind)
            .field("handler", &self.handler_signature().map(|s| s.label()))
            .field("event_handlers", &self.event_handlers.len())
            .field("is_handled", &self.is_handled)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Immutable registry of all command and event types.
pub struct HandlerRegistry<D> {
    descriptors: Vec<CrisTypeDescriptor<D>>,
    by_type: HashMap<TypeId, usize>,
    hierarchy: TypeHierarchy,
    ambient_values_provider: Option<AmbientValuesProvider<D>>,
}

impl<D> HandlerRegistry<D> {
    /// Descriptor of an object's concrete type.
    pub fn descriptor_of(&self, object: &dyn CrisPoco) -> Option<&CrisTypeDescriptor<D>> {
        self.by_type
            .get(&object.cris_type_id())
            .map(|&i| &self.descriptors[i])
    }

    /// Descriptor of `T`.
    pub fn descriptor<T: CrisPoco>(&self) -> Option<&CrisTypeDescriptor<D>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|&i| &self.descriptors[i])
    }

    /// Descriptor of an object's concrete type, or [`CrisError::UnknownType`].
    pub fn require_descriptor(
        &self,
        object: &dyn CrisPoco,
    ) -> Result<&CrisTypeDescriptor<D>, CrisError> {
        self.descriptor_of(object)
            .ok_or_else(|| CrisError::UnknownType {
                type_id: object.cris_type_id(),
                type_name: object.cris_type_name(),
            })
    }

    /// All descriptors, by index.
    pub fn descriptors(&self) -> &[CrisTypeDescriptor<D>] {
        &self.descriptors
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true when no type is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The declared type hierarchy.
    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    /// Provider of ambient values, if configured.
    pub fn ambient_values_provider(&self) -> Option<&AmbientValuesProvider<D>> {
        self.ambient_values_provider.as_ref()
    }
}

impl<D> fmt::Debug for HandlerRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Candidates
// =============================================================================

/// A handler taking part in the election of a command's handler.
///
/// Typed handlers registered with [`RegistryBuilder::handler`] become closed
/// candidates automatically. Build candidates by hand for handlers declared on
/// a "part" type of the command.
///
/// ```ignore
/// let candidate = HandlerCandidate::new("UserService", "handle_part", slot)
///     .parameter::<dyn UserCommandPart>()
///     .returns::<UserId>()
///     .allow_unclosed();
/// ```
pub struct HandlerCandidate<D> {
    service: String,
    method: String,
    parameter: Option<TypeKey>,
    returns: TypeKey,
    allow_unclosed: bool,
    handler: HandlerSlot<D>,
}

impl<D: Send + Sync + 'static> HandlerCandidate<D> {
    /// A candidate whose parameter is the command type and that returns `()`.
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        handler: HandlerSlot<D>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            parameter: None,
            returns: TypeKey::of::<()>(),
            allow_unclosed: false,
            handler,
        }
    }

    /// A closed candidate from a typed handler.
    pub fn typed<C, H>(handler: H) -> Self
    where
        C: CrisPoco,
        H: Handler<C, D>,
    {
        let slot: HandlerSlot<D> = ServiceSlot::pooled(Arc::new(HandlerWrapper::<H, C, D>::new(handler)));
        Self::new(std::any::type_name::<H>(), "handle", slot)
            .parameter::<C>()
            .returns::<H::Output>()
    }

    /// Declare the handler's parameter type.
    pub fn parameter<P: ?Sized + 'static>(mut self) -> Self {
        self.parameter = Some(TypeKey::of::<P>());
        self
    }

    /// Declare the handler's return type.
    pub fn returns<R: ?Sized + 'static>(mut self) -> Self {
        self.returns = TypeKey::of::<R>();
        self
    }

    /// Accept this candidate even though its parameter is not the command type.
    pub fn allow_unclosed(mut self) -> Self {
        self.allow_unclosed = true;
        self
    }

    fn signature(&self, command: TypeKey) -> CandidateSignature {
        CandidateSignature {
            service: self.service.clone(),
            method: self.method.clone(),
            parameter: self.parameter.unwrap_or(command),
            returns: self.returns,
            allow_unclosed: self.allow_unclosed,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

struct TypeDeclaration {
    key: TypeKey,
    kind: CrisKind,
    result_type: Option<TypeKey>,
}

/// Registration table of a [`HandlerRegistry`].
///
/// Registration order is preserved for validators, post-handlers and event
/// handlers. Errors are reported by [`build`](Self::build).
pub struct RegistryBuilder<D> {
    types: Vec<TypeDeclaration>,
    supertypes: Vec<(TypeKey, TypeKey)>,
    owning_services: HashMap<TypeKey, String>,
    candidates: Vec<(TypeKey, HandlerCandidate<D>)>,
    incoming_validators: Vec<(TypeKey, ValidatorSlot<D>)>,
    handling_validators: Vec<(TypeKey, ValidatorSlot<D>)>,
    post_handlers: Vec<(TypeKey, PostHandlerSlot<D>)>,
    event_handlers: Vec<(TypeKey, EventHandlerSlot<D>)>,
    ambient_values_provider: Option<AmbientValuesProvider<D>>,
}

impl<D: Send + Sync + 'static> Default for RegistryBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Send + Sync + 'static> RegistryBuilder<D> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            supertypes: Vec::new(),
            owning_services: HashMap::new(),
            candidates: Vec::new(),
            incoming_validators: Vec::new(),
            handling_validators: Vec::new(),
            post_handlers: Vec::new(),
            event_handlers: Vec::new(),
            ambient_values_provider: None,
        }
    }

    // -------------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------------

    /// Declare a command without result.
    pub fn command<C: CrisPoco>(self) -> Self {
        self.declare(TypeKey::of::<C>(), CrisKind::Command, None)
    }

    /// Declare a command whose handler returns `R` (or a subtype of `R`).
    pub fn command_with_result<C: CrisPoco, R: ?Sized + 'static>(self) -> Self {
        self.declare(
            TypeKey::of::<C>(),
            CrisKind::CommandWithResult,
            Some(TypeKey::of::<R>()),
        )
    }

    /// Declare an event of the given kind.
    pub fn event<E: CrisPoco>(self, kind: CrisKind) -> Self {
        self.declare(TypeKey::of::<E>(), kind, None)
    }

    /// Declare an event dispatched to its handlers once it reaches the root.
    pub fn routed_event<E: CrisPoco>(self) -> Self {
        self.event::<E>(CrisKind::RoutedEvent)
    }

    /// Declare an event dispatched to its handlers when emitted.
    pub fn routed_immediate_event<E: CrisPoco>(self) -> Self {
        self.event::<E>(CrisKind::RoutedImmediateEvent)
    }

    /// Declare an event only returned to the caller.
    pub fn caller_only_event<E: CrisPoco>(self) -> Self {
        self.event::<E>(CrisKind::CallerOnlyEvent)
    }

    /// Declare an event only sent to the caller, when emitted.
    pub fn caller_only_immediate_event<E: CrisPoco>(self) -> Self {
        self.event::<E>(CrisKind::CallerOnlyImmediateEvent)
    }

    fn declare(mut self, key: TypeKey, kind: CrisKind, result_type: Option<TypeKey>) -> Self {
        self.types.push(TypeDeclaration {
            key,
            kind,
            result_type,
        });
        self
    }

    /// Declare `Sub` as a direct subtype of `Sup` (a "part" trait it
    /// implements, or a result trait).
    pub fn supertype<Sub: ?Sized + 'static, Sup: ?Sized + 'static>(mut self) -> Self {
        self.supertypes
            .push((TypeKey::of::<Sub>(), TypeKey::of::<Sup>()));
        self
    }

    /// Only consider handler candidates of `service` for `C`.
    pub fn owning_service<C: CrisPoco>(mut self, service: impl Into<String>) -> Self {
        self.owning_services
            .insert(TypeKey::of::<C>(), service.into());
        self
    }

    /// Configure the provider of ambient values.
    pub fn ambient_values_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn(&D) -> Result<AmbientValues> + Send + Sync + 'static,
    {
        self.ambient_values_provider = Some(Arc::new(provider));
        self
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    /// Register a pooled typed handler candidate for `C`.
    pub fn handler<C: CrisPoco, H: Handler<C, D>>(self, handler: H) -> Self {
        self.candidate::<C>(HandlerCandidate::typed::<C, H>(handler))
    }

    /// Register a typed handler candidate for `C`, resolved per call.
    pub fn scoped_handler<C, H, F>(self, factory: F) -> Self
    where
        C: CrisPoco,
        H: Handler<C, D>,
        F: Fn(&D) -> Result<H> + Send + Sync + 'static,
    {
        let slot: HandlerSlot<D> = ServiceSlot::scoped(move |services: &D| {
            let handler: Arc<dyn ErasedHandler<D>> =
                Arc::new(HandlerWrapper::<H, C, D>::new(factory(services)?));
            Ok(handler)
        });
        let candidate = HandlerCandidate::new(std::any::type_name::<H>(), "handle", slot)
            .parameter::<C>()
            .returns::<H::Output>();
        self.candidate::<C>(candidate)
    }

    /// Register a handler candidate for `C`.
    pub fn candidate<C: CrisPoco>(mut self, candidate: HandlerCandidate<D>) -> Self {
        self.candidates.push((TypeKey::of::<C>(), candidate));
        self
    }

    /// Register a pooled post-handler for `C`.
    pub fn post_handler<C: CrisPoco, P: PostHandler<C, D>>(mut self, handler: P) -> Self {
        let slot: PostHandlerSlot<D> =
            ServiceSlot::pooled(Arc::new(PostHandlerWrapper::<P, C, D>::new(handler)));
        self.post_handlers.push((TypeKey::of::<C>(), slot));
        self
    }

    /// Register a post-handler for `C`, resolved per call.
    pub fn scoped_post_handler<C, P, F>(mut self, factory: F) -> Self
    where
        C: CrisPoco,
        P: PostHandler<C, D>,
        F: Fn(&D) -> Result<P> + Send + Sync + 'static,
    {
        let slot: PostHandlerSlot<D> = ServiceSlot::scoped(move |services: &D| {
            let handler: Arc<dyn ErasedPostHandler<D>> =
                Arc::new(PostHandlerWrapper::<P, C, D>::new(factory(services)?));
            Ok(handler)
        });
        self.post_handlers.push((TypeKey::of::<C>(), slot));
        self
    }

    /// Register a pooled event handler for `E`.
    pub fn event_handler<E: CrisPoco, H: EventHandler<E, D>>(mut self, handler: H) -> Self {
        let slot: EventHandlerSlot<D> =
            ServiceSlot::pooled(Arc::new(EventHandlerWrapper::<H, E, D>::new(handler)));
        self.event_handlers.push((TypeKey::of::<E>(), slot));
        self
    }

    /// Register an event handler for `E`, resolved per call.
    pub fn scoped_event_handler<E, H, F>(mut self, factory: F) -> Self
    where
        E: CrisPoco,
        H: EventHandler<E, D>,
        F: Fn(&D) -> Result<H> + Send + Sync + 'static,
    {
        let slot: EventHandlerSlot<D> = ServiceSlot::scoped(move |services: &D| {
            let handler: Arc<dyn ErasedEventHandler<D>> =
                Arc::new(EventHandlerWrapper::<H, E, D>::new(factory(services)?));
            Ok(handler)
        });
        self.event_handlers.push((TypeKey::of::<E>(), slot));
        self
    }

    // -------------------------------------------------------------------------
    // Validators
    // -------------------------------------------------------------------------

    /// Register a pooled incoming validator for `C`.
    pub fn incoming_validator<C: CrisPoco, V: Validator<D>>(self, validator: V) -> Self {
        self.incoming_validator_arc::<C>(Arc::new(validator))
    }

    /// Register a shared incoming validator for `C`.
    pub fn incoming_validator_arc<C: CrisPoco>(mut self, validator: Arc<dyn Validator<D>>) -> Self {
        self.incoming_validators
            .push((TypeKey::of::<C>(), ServiceSlot::pooled(validator)));
        self
    }

    /// Register an incoming validator for `C`, resolved per call.
    pub fn scoped_incoming_validator<C, F>(mut self, factory: F) -> Self
    where
        C: CrisPoco,
        F: Fn(&D) -> Result<Arc<dyn Validator<D>>> + Send + Sync + 'static,
    {
        self.incoming_validators
            .push((TypeKey::of::<C>(), ServiceSlot::scoped(factory)));
        self
    }

    /// Register a pooled handling validator for `C`.
    pub fn handling_validator<C: CrisPoco, V: Validator<D>>(self, validator: V) -> Self {
        self.handling_validator_arc::<C>(Arc::new(validator))
    }

    /// Register a shared handling validator for `C`.
    pub fn handling_validator_arc<C: CrisPoco>(mut self, validator: Arc<dyn Validator<D>>) -> Self {
        self.handling_validators
            .push((TypeKey::of::<C>(), ServiceSlot::pooled(validator)));
        self
    }

    /// Register a handling validator for `C`, resolved per call.
    pub fn scoped_handling_validator<C, F>(mut self, factory: F) -> Self
    where
        C: CrisPoco,
        F: Fn(&D) -> Result<Arc<dyn Validator<D>>> + Send + Sync + 'static,
    {
        self.handling_validators
            .push((TypeKey::of::<C>(), ServiceSlot::scoped(factory)));
        self
    }

    // -------------------------------------------------------------------------
    // Build
    // -------------------------------------------------------------------------

    /// Check every registration, elect handlers and freeze the registry.
    pub fn build(self) -> Result<HandlerRegistry<D>, RegistryError> {
        let mut hierarchy = TypeHierarchy::new();
        for (sub, sup) in &self.supertypes {
            hierarchy.declare(*sub, *sup)?;
        }

        let mut by_type = HashMap::new();
        let mut descriptors = Vec::with_capacity(self.types.len());
        for (index, decl) in self.types.iter().enumerate() {
            if by_type.insert(decl.key.id(), index).is_some() {
                return Err(RegistryError::DuplicateType {
                    type_name: decl.key.name(),
                });
            }
            descriptors.push(CrisTypeDescriptor {
                index,
                key: decl.key,
                kind: decl.kind,
                result_type: decl.result_type,
                handler: None,
                incoming_validators: Vec::new(),
                handling_validators: Vec::new(),
                post_handlers: Vec::new(),
                event_handlers: Vec::new(),
                is_handled: false,
            });
        }

        let slot_of = |key: TypeKey,
                       registration: &'static str,
                       accepts: fn(CrisKind) -> bool|
         -> Result<usize, RegistryError> {
            let index = *by_type
                .get(&key.id())
                .ok_or(RegistryError::UndeclaredType {
                    type_name: key.name(),
                    registration,
                })?;
            let kind = self.types[index].kind;
            if !accepts(kind) {
                return Err(RegistryError::KindMismatch {
                    type_name: key.name(),
                    kind,
                    registration,
                });
            }
            Ok(index)
        };

        let is_command = |k: CrisKind| k.is_command();
        let is_routed = |k: CrisKind| k.is_routed();

        let mut candidates: Vec<Vec<(CandidateSignature, HandlerSlot<D>)>> =
            (0..descriptors.len()).map(|_| Vec::new()).collect();
        for (key, candidate) in &self.candidates {
            let i = slot_of(*key, "handler", is_command)?;
            candidates[i].push((candidate.signature(*key), candidate.handler.clone()));
        }
        for (key, slot) in &self.incoming_validators {
            let i = slot_of(*key, "incoming validator", is_command)?;
            descriptors[i].incoming_validators.push(slot.clone());
        }
        for (key, slot) in &self.handling_validators {
            let i = slot_of(*key, "handling validator", is_command)?;
            descriptors[i].handling_validators.push(slot.clone());
        }
        for (key, slot) in &self.post_handlers {
            let i = slot_of(*key, "post-handler", is_command)?;
            descriptors[i].post_handlers.push(slot.clone());
        }
        for (key, slot) in &self.event_handlers {
            let i = slot_of(*key, "event handler", is_routed)?;
            descriptors[i].event_handlers.push(slot.clone());
        }
        for key in self.owning_services.keys() {
            slot_of(*key, "owning service", is_command)?;
        }

        for (descriptor, mut candidates) in descriptors.iter_mut().zip(candidates) {
            if descriptor.kind.is_command() {
                let signatures: Vec<CandidateSignature> =
                    candidates.iter().map(|(sig, _)| sig.clone()).collect();
                let input = ElectionInput {
                    command: descriptor.key,
                    result_type: descriptor.result_type,
                    owning_service: self
                        .owning_services
                        .get(&descriptor.key)
                        .map(String::as_str),
                };
                if let Some(winner) = elect(&hierarchy, input, &signatures)? {
                    descriptor.handler = Some(candidates.swap_remove(winner));
                }
                descriptor.is_handled = descriptor.handler.is_some();
            } else {
                descriptor.is_handled =
                    descriptor.kind.is_routed() && !descriptor.event_handlers.is_empty();
            }
        }

        let handled_commands = descriptors
            .iter()
            .filter(|d| d.kind.is_command() && d.is_handled)
            .count();
        info!(
            types = descriptors.len(),
            handled_commands,
            "handler registry built"
        );

        Ok(HandlerRegistry {
            descriptors,
            by_type,
            hierarchy,
            ambient_values_provider: self.ambient_values_provider,
        })
    }
}
