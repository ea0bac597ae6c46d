//! The unhandled-error channel.
//!
//! Errors thrown by user completion callbacks, and component action errors
//! the component error handler could not resolve, must never vanish into a
//! settled promise. They are handed to [`UnhandledErrors::raise`], which logs
//! them and then either calls the application's hook or escalates them as a
//! panic on a fresh task.
//!
//! An escalated panic is not fatal to the process: tokio catches it, prints
//! the panic message, and the runtime keeps running. Applications that want
//! unhandled errors to stop the process install a hook that does so, e.g.
//! `App::builder().on_unhandled_error(|_| std::process::abort())`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

use crate::error::UnhandledError;

/// Hook invoked with every unhandled error.
pub type UnhandledHook = Arc<dyn Fn(&UnhandledError) + Send + Sync>;

/// Destination for errors that escaped every handler.
///
/// Cloned into every context and bridge created by an application.
#[derive(Clone, Default)]
pub struct UnhandledErrors {
    hook: Option<UnhandledHook>,
}

impl UnhandledErrors {
    /// Escalate unhandled errors as panics (the default).
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver unhandled errors to `hook` instead of escalating them.
    pub fn with_hook(hook: UnhandledHook) -> Self {
        Self { hook: Some(hook) }
    }

    /// Surface an error that nobody handled.
    ///
    /// Never returns the error to the caller. Without a hook, the error is
    /// re-raised as a panic on a new detached task, which the runtime reports
    /// and survives. With no tokio runtime running, the panic happens on the
    /// current thread instead.
    pub fn raise(&self, err: UnhandledError) {
        error!(error = %err, "unhandled error");
        match &self.hook {
            Some(hook) => hook(&err),
            None => {
                escalate(err);
            }
        }
    }
}

impl fmt::Debug for UnhandledErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnhandledErrors")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

fn escalate(err: UnhandledError) -> JoinHandle<()> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.spawn(async move { panic!("{err}") }),
        Err(_) => panic!("{err}"),
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_hook_receives_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let errors = UnhandledErrors::with_hook(Arc::new(move |err| {
            sink.lock().unwrap().push(err.to_string());
        }));

        errors.raise(UnhandledError::CallbackPanicked {
            message: "oops".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("oops"));
    }

    #[test]
    #[should_panic(expected = "completion callback panicked")]
    fn test_escalates_without_runtime() {
        UnhandledErrors::new().raise(UnhandledError::CallbackPanicked {
            message: "no runtime".into(),
        });
    }

    #[tokio::test]
    async fn test_escalation_panics_a_task_not_the_runtime() {
        let task = escalate(UnhandledError::CallbackPanicked {
            message: "late failure".into(),
        });

        let join_err = task.await.unwrap_err();
        assert!(join_err.is_panic());
        assert!(panic_message(join_err.into_panic().as_ref()).contains("late failure"));

        // The runtime is still serving tasks
        assert_eq!(tokio::spawn(async { 7 }).await.unwrap(), 7);
    }

    #[test]
    fn test_panic_message() {
        let from_str: Box<dyn Any + Send> = Box::new("static message");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        let opaque: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(from_str.as_ref()), "static message");
        assert_eq!(panic_message(from_string.as_ref()), "owned message");
        assert_eq!(panic_message(opaque.as_ref()), "unknown panic");
    }
}
