//! Structured error types for fluxible.
//!
//! `FluxError` is the single error type that crosses the crate boundary.
//! User code (action bodies, store handlers, plugin rehydrate hooks) works
//! with `anyhow::Result`; those errors are wrapped in an `Arc` so that one
//! settlement can be observed by every awaiter of a [`Promise`] and by the
//! callback bridge at the same time.
//!
//! # Categories
//!
//! - **Configuration errors**: [`FluxError::PluginMissingName`],
//!   [`FluxError::InvalidState`], [`FluxError::StoreAlreadyRegistered`].
//!   Returned synchronously, before anything runs.
//! - **Runtime errors**: [`FluxError::UnsupportedRuntime`] when work is
//!   started outside a `current_thread` tokio runtime; nothing runs.
//! - **Action errors**: [`FluxError::Action`], [`FluxError::ActionPanicked`],
//!   [`FluxError::CompletionDropped`]. Recoverable by the caller through the
//!   promise returned from `execute_action`.
//! - **Unhandled errors**: [`UnhandledError`]. Never returned to anyone; they
//!   go through [`UnhandledErrors::raise`](crate::UnhandledErrors::raise).
//!
//! [`Promise`]: crate::Promise

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the application container, contexts and dispatcher.
///
/// Cheap to clone: wrapped user errors are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum FluxError {
    /// A plugin was registered without a name.
    #[error("plugin must have a non-empty name")]
    PluginMissingName,

    /// `rehydrate` was handed something other than a JSON object.
    #[error("rehydrate called with a non-object ({found}); pass the state produced by dehydrate")]
    InvalidState {
        /// JSON kind that was received instead.
        found: &'static str,
    },

    /// The dehydrated state is an object but its fields have the wrong shape.
    #[error("malformed dehydrated state: {message}")]
    MalformedState {
        /// Deserialization error message.
        message: String,
    },

    /// An action body returned or signalled an error.
    #[error("action {action} failed: {cause}")]
    Action {
        /// Display name of the failing action.
        action: String,
        /// The error produced by the action.
        cause: Arc<anyhow::Error>,
    },

    /// An action body panicked.
    #[error("action {action} panicked: {message}")]
    ActionPanicked {
        /// Display name of the panicking action.
        action: String,
        /// Panic message, if one could be extracted.
        message: String,
    },

    /// A callback-style action dropped its completion handle without calling it.
    #[error("action {action} dropped its completion callback without calling it")]
    CompletionDropped {
        /// Display name of the action.
        action: String,
    },

    /// A plugin's rehydrate hook failed.
    #[error("plugin {plugin} failed to rehydrate: {cause}")]
    PluginRehydrate {
        /// Name of the failing plugin.
        plugin: String,
        /// The error produced by the hook.
        cause: Arc<anyhow::Error>,
    },

    /// No store with this name/type is registered with the dispatcher.
    #[error("store {name} is not registered")]
    StoreNotRegistered {
        /// Store name that was requested.
        name: &'static str,
    },

    /// A different store type is already registered under this name.
    #[error("a different store is already registered as {name}")]
    StoreAlreadyRegistered {
        /// Contested store name.
        name: &'static str,
    },

    /// A store handler failed while handling a dispatched event.
    #[error("store {store} failed to handle {event}: {cause}")]
    StoreHandler {
        /// Name of the failing store.
        store: &'static str,
        /// Event being dispatched.
        event: String,
        /// The error produced by the handler.
        cause: Arc<anyhow::Error>,
    },

    /// A store rejected its dehydrated state.
    #[error("store {store} failed to rehydrate: {cause}")]
    StoreRehydrate {
        /// Name of the failing store.
        store: &'static str,
        /// The error produced by the store.
        cause: Arc<anyhow::Error>,
    },

    /// `dispatch` was called with an empty event name.
    #[error("dispatch requires a non-empty event name")]
    InvalidEvent,

    /// `dispatch` was called from inside a store handler of another dispatch.
    #[error("cannot dispatch {event} while {current} is being dispatched")]
    CascadingDispatch {
        /// Event that was requested.
        event: String,
        /// Event currently in flight.
        current: String,
    },

    /// Work was started outside a `current_thread` tokio runtime.
    #[error("fluxible needs a current_thread tokio runtime, found {flavor}")]
    UnsupportedRuntime {
        /// Flavor of the runtime in use, or `none`.
        flavor: String,
    },

    /// The task driving a promise was cancelled (runtime shutdown).
    #[error("task aborted before settling: {message}")]
    TaskAborted {
        /// Join error message.
        message: String,
    },
}

impl FluxError {
    /// Wrap an action error.
    pub fn action(action: impl Into<String>, source: anyhow::Error) -> Self {
        FluxError::Action {
            action: action.into(),
            cause: Arc::new(source),
        }
    }

    /// Returns true for failures raised by action bodies (error, panic, dropped callback).
    pub fn is_action_failure(&self) -> bool {
        matches!(
            self,
            FluxError::Action { .. }
                | FluxError::ActionPanicked { .. }
                | FluxError::CompletionDropped { .. }
        )
    }

    /// The message a component error handler sees under `err`.
    ///
    /// For action failures this is the action's own error message rather
    /// than the wrapped description.
    pub fn cause_message(&self) -> String {
        match self {
            FluxError::Action { cause, .. } => cause.to_string(),
            FluxError::ActionPanicked { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors that escaped every handler.
///
/// These are delivered to [`UnhandledErrors::raise`](crate::UnhandledErrors::raise),
/// never to the code that started the work.
#[derive(Debug, Clone, Error)]
pub enum UnhandledError {
    /// A user completion callback panicked after its promise settled.
    #[error("completion callback panicked: {message}")]
    CallbackPanicked {
        /// Panic message, if one could be extracted.
        message: String,
    },

    /// A component action failed and the component action error handler
    /// did not resolve it.
    #[error(
        "component action {action} failed and the error handler did not resolve it: {error} \
         (handler: {handler_error})"
    )]
    ComponentAction {
        /// Display name of the component action.
        action: String,
        /// The error the component action failed with.
        error: FluxError,
        /// The error the handler returned.
        handler_error: FluxError,
    },
}

/// JSON kind name used in [`FluxError::InvalidState`].
pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_display() {
        let err = FluxError::action("loadPage", anyhow::anyhow!("page not found"));
        assert!(err.to_string().contains("loadPage"));
        assert!(err.to_string().contains("page not found"));
        assert_eq!(err.cause_message(), "page not found");
        assert!(err.is_action_failure());
    }

    #[test]
    fn test_invalid_state_display() {
        let err = FluxError::InvalidState { found: "string" };
        assert!(err.to_string().contains("non-object"));
        assert!(err.to_string().contains("string"));
        assert!(!err.is_action_failure());
    }

    #[test]
    fn test_clone_shares_source() {
        let err = FluxError::action("a", anyhow::anyhow!("boom"));
        let cloned = err.clone();
        match (&err, &cloned) {
            (FluxError::Action { cause: a, .. }, FluxError::Action { cause: b, .. }) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected Action variants"),
        }
    }

    #[test]
    fn test_unhandled_error_display() {
        let err = UnhandledError::ComponentAction {
            action: "navigate".into(),
            error: FluxError::action("navigate", anyhow::anyhow!("no route")),
            handler_error: FluxError::action("errorHandler", anyhow::anyhow!("still broken")),
        };
        assert!(err.to_string().contains("navigate"));
        assert!(err.to_string().contains("no route"));
        assert!(err.to_string().contains("still broken"));
    }

    #[test]
    fn test_json_kind() {
        assert_eq!(json_kind(&serde_json::json!({})), "object");
        assert_eq!(json_kind(&serde_json::json!([])), "array");
        assert_eq!(json_kind(&serde_json::json!(null)), "null");
        assert_eq!(json_kind(&serde_json::json!(false)), "boolean");
    }
}
