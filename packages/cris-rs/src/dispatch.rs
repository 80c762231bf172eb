//! Event dispatch.
//!
//! Runs the event handlers of an event, in registration order, one after the
//! other, each with the execution context so it can execute commands and emit
//! events.
//!
//! Two paths exist:
//!
//! - [`dispatch_event`] (raw): the first failure stops the dispatch and
//!   propagates. Every internal call site uses it: immediate dispatch in
//!   `emit_event` and final-event dispatch at the root.
//! - [`dispatch_event_safe`]: failures and panics are logged with the issuer
//!   token and reported as `false`. Only offered to callers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use tracing::{debug, error};

use crate::context::ExecutionContext;
use crate::core::CrisObject;
use crate::error::CrisError;
use crate::handler::extract_panic_message;

/// Dispatch `event` to its event handlers. Errors propagate.
pub async fn dispatch_event<D: Send + Sync + 'static>(
    ctx: &mut ExecutionContext<D>,
    event: &CrisObject,
) -> Result<()> {
    let registry = Arc::clone(ctx.registry());
    let descriptor = registry.require_descriptor(event.as_ref())?;
    if !descriptor.kind().is_event() {
        return Err(CrisError::KindMismatch {
            type_name: descriptor.type_name(),
            expected: "event",
            actual: descriptor.kind(),
        }
        .into());
    }

    let handlers = descriptor.event_handlers();
    debug!(
        token = %ctx.issuer_token(),
        event = descriptor.type_name(),
        handlers = handlers.len(),
        "dispatching event"
    );

    for slot in handlers {
        let handler = slot.resolve(ctx.services())?;
        handler.handle_event_erased(Arc::clone(event), ctx).await?;
    }
    Ok(())
}

/// Dispatch `event`, logging any failure instead of propagating it.
///
/// Returns true when every handler succeeded. Frames left by a panicking
/// handler are dropped so the context stays usable.
pub async fn dispatch_event_safe<D: Send + Sync + 'static>(
    ctx: &mut ExecutionContext<D>,
    event: &CrisObject,
) -> bool {
    let token = ctx.issuer_token();
    let depth = ctx.depth();
    let event_type = event.cris_type_name();

    let outcome = AssertUnwindSafe(dispatch_event(ctx, event))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(%token, event = event_type, error = ?e, "event dispatch failed");
            false
        }
        Err(panic_info) => {
            ctx.truncate_stack(depth);
            error!(
                %token,
                event = event_type,
                panic = %extract_panic_message(panic_info.as_ref()),
                "event handler panicked"
            );
            false
        }
    }
}
