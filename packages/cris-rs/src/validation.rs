//! Two-stage validation pipeline.
//!
//! - **Incoming validation** runs once, where a command or event first enters
//!   the process. It never fails: validator errors and panics are logged with
//!   the issuer token and become a single "Unhandled validation error." message.
//! - **Handling validation** runs right before the elected handler. Validator
//!   errors propagate to the caller (the job boundary catches them).
//!
//! Both stages run their validators in registration order against one shared
//! [`UserMessageCollector`]. A [`ValidationResult`] is successful iff it holds
//! no `Error` message.
//!
//! # Example
//!
//! ```ignore
//! struct NameRequired;
//!
//! #[async_trait]
//! impl Validator<AppServices> for NameRequired {
//!     async fn validate(&self, command: &CrisObject, ctx: &mut ValidationContext<'_, AppServices>) -> Result<()> {
//!         let Some(cmd) = command.downcast_ref::<CreateUser>() else {
//!             return Ok(());
//!         };
//!         if cmd.name.trim().is_empty() {
//!             ctx.messages().error("Name is required.");
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::{AmbientValues, CorrelationId, CrisObject};
use crate::handler::extract_panic_message;
use crate::registry::HandlerRegistry;

/// Message given when an incoming validator fails unexpectedly.
pub const UNHANDLED_VALIDATION_ERROR: &str = "Unhandled validation error.";

/// Severity of a [`UserMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageLevel {
    /// Informational message.
    Info,
    /// Warning; does not fail validation.
    Warn,
    /// Error; fails validation.
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLevel::Info => write!(f, "info"),
            MessageLevel::Warn => write!(f, "warn"),
            MessageLevel::Error => write!(f, "error"),
        }
    }
}

/// A user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Severity.
    pub level: MessageLevel,
    /// Text, safe to show to users.
    pub text: String,
    /// Optional machine-readable code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl UserMessage {
    /// Create a message without code.
    pub fn new(level: MessageLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            code: None,
        }
    }

    /// Attach a machine-readable code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Collects messages emitted by validators.
#[derive(Debug, Default)]
pub struct UserMessageCollector {
    messages: Vec<UserMessage>,
    error_count: usize,
}

impl UserMessageCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message.
    pub fn add(&mut self, message: UserMessage) {
        if message.level == MessageLevel::Error {
            self.error_count += 1;
        }
        self.messages.push(message);
    }

    /// Add an info message.
    pub fn info(&mut self, text: impl Into<String>) {
        self.add(UserMessage::new(MessageLevel::Info, text));
    }

    /// Add a warning.
    pub fn warn(&mut self, text: impl Into<String>) {
        self.add(UserMessage::new(MessageLevel::Warn, text));
    }

    /// Add an error.
    pub fn error(&mut self, text: impl Into<String>) {
        self.add(UserMessage::new(MessageLevel::Error, text));
    }

    /// Add an error with a machine-readable code.
    pub fn error_with_code(&mut self, text: impl Into<String>, code: impl Into<String>) {
        self.add(UserMessage::new(MessageLevel::Error, text).with_code(code));
    }

    /// Number of error messages so far.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Returns true if at least one error was collected.
    pub fn has_error(&self) -> bool {
        self.error_count > 0
    }

    /// Messages collected so far.
    pub fn messages(&self) -> &[UserMessage] {
        &self.messages
    }

    /// Freeze the collector into a result.
    pub fn into_result(self, log_key: Option<String>) -> ValidationResult {
        ValidationResult {
            success: self.error_count == 0,
            messages: self.messages,
            log_key,
        }
    }
}

/// Immutable outcome of a validation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    messages: Vec<UserMessage>,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_key: Option<String>,
}

impl ValidationResult {
    /// A successful result without messages.
    pub fn success() -> Self {
        Self {
            messages: Vec::new(),
            success: true,
            log_key: None,
        }
    }

    /// Build a result from messages. Success is derived from them.
    pub fn from_messages(messages: Vec<UserMessage>, log_key: Option<String>) -> Self {
        let success = !messages.iter().any(|m| m.level == MessageLevel::Error);
        Self {
            messages,
            success,
            log_key,
        }
    }

    /// False iff at least one `Error` message exists.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// All messages, in emission order.
    pub fn messages(&self) -> &[UserMessage] {
        &self.messages
    }

    /// The error messages.
    pub fn errors(&self) -> impl Iterator<Item = &UserMessage> {
        self.messages
            .iter()
            .filter(|m| m.level == MessageLevel::Error)
    }

    /// Log correlation key, set on failed results.
    pub fn log_key(&self) -> Option<&str> {
        self.log_key.as_deref()
    }
}

/// The validation stage a [`ValidationContext`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// At the process boundary, before execution scope is final.
    Incoming,
    /// Right before the handler runs, inside the execution scope.
    Handling,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStage::Incoming => write!(f, "incoming"),
            ValidationStage::Handling => write!(f, "handling"),
        }
    }
}

/// Context given to validators.
///
/// Holds the shared message collector, the call's services, and lazily
/// prepared ambient values (built at most once per validation).
pub struct ValidationContext<'a, D> {
    stage: ValidationStage,
    services: &'a D,
    registry: &'a HandlerRegistry<D>,
    token: CorrelationId,
    messages: UserMessageCollector,
    ambient: Option<AmbientValues>,
}

impl<'a, D: Send + Sync + 'static> ValidationContext<'a, D> {
    fn new(
        stage: ValidationStage,
        registry: &'a HandlerRegistry<D>,
        services: &'a D,
        token: CorrelationId,
    ) -> Self {
        Self {
            stage,
            services,
            registry,
            token,
            messages: UserMessageCollector::new(),
            ambient: None,
        }
    }

    /// The stage being run.
    pub fn stage(&self) -> ValidationStage {
        self.stage
    }

    /// The call's services.
    pub fn services(&self) -> &D {
        self.services
    }

    /// The issuer token.
    pub fn issuer_token(&self) -> CorrelationId {
        self.token
    }

    /// The shared message collector.
    pub fn messages(&mut self) -> &mut UserMessageCollector {
        &mut self.messages
    }

    /// Ambient values, prepared on first request.
    ///
    /// Uses the registry's ambient values provider; empty when none is
    /// configured.
    pub fn ambient_values(&mut self) -> Result<&AmbientValues> {
        if self.ambient.is_none() {
            let values = match self.registry.ambient_values_provider() {
                Some(provider) => provider(self.services)?,
                None => AmbientValues::new(),
            };
            self.ambient = Some(values);
        }
        Ok(self.ambient.get_or_insert_with(AmbientValues::new))
    }

    /// Returns true once ambient values have been prepared.
    pub fn has_ambient_values(&self) -> bool {
        self.ambient.is_some()
    }

    fn finish(self) -> ValidationResult {
        let log_key = self
            .messages
            .has_error()
            .then(|| self.token.to_string());
        self.messages.into_result(log_key)
    }
}

/// A validator of commands (or incoming events).
///
/// Validators must not keep state across calls: pooled validators are shared
/// by all concurrent jobs.
#[async_trait]
pub trait Validator<D: Send + Sync + 'static>: Send + Sync + 'static {
    /// Record messages about `object`. Returning `Err` is an unexpected
    /// failure, not a validation error.
    async fn validate(&self, object: &CrisObject, ctx: &mut ValidationContext<'_, D>)
        -> Result<()>;
}

/// Run the incoming validators of `object`.
///
/// Never fails: any validator error or panic is logged with `token` and turned
/// into an [`UNHANDLED_VALIDATION_ERROR`] message.
pub async fn validate_incoming<D: Send + Sync + 'static>(
    registry: &HandlerRegistry<D>,
    services: &D,
    object: &CrisObject,
    token: CorrelationId,
) -> ValidationResult {
    let type_name = object.cris_type_name();
    let mut ctx = ValidationContext::new(ValidationStage::Incoming, registry, services, token);

    let Some(descriptor) = registry.descriptor_of(object.as_ref()) else {
        warn!(%token, type_name, "incoming object type is not registered");
        ctx.messages().error("Unknown command or event.");
        return ctx.finish();
    };

    for (index, slot) in descriptor.incoming_validators().iter().enumerate() {
        let run = AssertUnwindSafe(async {
            let validator = slot.resolve(services)?;
            validator.validate(object, &mut ctx).await
        })
        .catch_unwind()
        .await;

        let failure = match run {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:?}", e)),
            Err(panic_info) => Some(format!(
                "validator panicked: {}",
                extract_panic_message(panic_info.as_ref())
            )),
        };

        if let Some(failure) = failure {
            error!(%token, type_name, validator = index, error = %failure, "incoming validator failed");
            ctx.messages().error(UNHANDLED_VALIDATION_ERROR);
            break;
        }
    }

    let result = ctx.finish();
    log_outcome(ValidationStage::Incoming, type_name, token, &result);
    result
}

/// Run the handling validators of `command`.
///
/// Errors raised by a validator propagate to the caller.
pub async fn validate_handling<D: Send + Sync + 'static>(
    registry: &HandlerRegistry<D>,
    services: &D,
    command: &CrisObject,
    token: CorrelationId,
) -> Result<ValidationResult> {
    let type_name = command.cris_type_name();
    let descriptor = registry.require_descriptor(command.as_ref())?;
    if descriptor.handling_validators().is_empty() {
        return Ok(ValidationResult::success());
    }

    let mut ctx = ValidationContext::new(ValidationStage::Handling, registry, services, token);
    for slot in descriptor.handling_validators() {
        let validator = slot.resolve(services)?;
        validator.validate(command, &mut ctx).await?;
    }

    let result = ctx.finish();
    log_outcome(ValidationStage::Handling, type_name, token, &result);
    Ok(result)
}

fn log_outcome(
    stage: ValidationStage,
    type_name: &'static str,
    token: CorrelationId,
    result: &ValidationResult,
) {
    if result.is_success() {
        debug!(%token, %stage, type_name, messages = result.messages().len(), "validation succeeded");
    } else {
        warn!(%token, %stage, type_name, errors = result.errors().count(), "validation failed");
    }
}
