//! Action dispatch
//!
//! Runs the handler behind each fired trigger and keeps the activation log.

pub mod dispatcher;
pub mod handler;

pub use dispatcher::{
    ActionDispatcher, ActionOutcome, ActivationRecord, FailureKind, DEFAULT_HANDLER_TIMEOUT,
    DEFAULT_MAX_HISTORY,
};
pub use handler::{handler_fn, ActionContext, ActionFn, ActionHandler, FnHandler, LogAction, WebhookAction};
