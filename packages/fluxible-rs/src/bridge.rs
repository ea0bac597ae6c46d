//! Promises and the promise-to-callback bridge.
//!
//! A [`Promise`] is a shared, cloneable future driven by its own tokio task:
//! the work starts as soon as the promise is created, whether or not anybody
//! awaits it, and every clone observes the same settlement.
//!
//! Promises only run on tokio's `current_thread` runtime, where a spawned
//! task cannot start before the spawning task yields. [`spawn`] refuses any
//! other runtime flavor with [`FluxError::UnsupportedRuntime`].
//!
//! [`promise_callback`] adapts a promise to a legacy `(err, result)` style
//! [`Callback`]. The callback always runs outside the task that settled the
//! promise, and a panic inside it is handed to
//! [`UnhandledErrors::raise`] instead of being absorbed.
//!
//! # Scheduling modes
//!
//! | Mode      | When the callback runs                                  |
//! |-----------|---------------------------------------------------------|
//! | default   | on a new task spawned after the promise settles         |
//! | optimized | inline in the continuation that observed the settlement |

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

use crate::error::{FluxError, UnhandledError};
use crate::fatal::{panic_message, UnhandledErrors};

/// A shared handle on the eventual result of some work.
pub type Promise<T> = Shared<BoxFuture<'static, Result<T, FluxError>>>;

/// A legacy completion callback receiving the settled result.
pub type Callback<T> = Box<dyn FnOnce(Result<T, FluxError>) + Send + 'static>;

/// Options for [`promise_callback`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackOptions {
    /// Invoke the callback inline in the settling continuation instead of
    /// on a new task.
    pub optimize: bool,
}

impl CallbackOptions {
    /// Options with `optimize` enabled.
    pub fn optimized() -> Self {
        Self { optimize: true }
    }
}

/// Start `future` on its own task and return a promise of its result.
///
/// Outside a `current_thread` runtime `future` is dropped unpolled and the
/// promise settles with [`FluxError::UnsupportedRuntime`].
pub fn spawn<T, F>(future: F) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, FluxError>> + Send + 'static,
{
    if let Err(err) = check_runtime() {
        warn!(error = %err, "work not started");
        return settled(Err(err));
    }
    let handle = tokio::spawn(future);
    async move {
        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(FluxError::TaskAborted {
                message: join_err.to_string(),
            }),
        }
    }
    .boxed()
    .shared()
}

/// Ok when running on a `current_thread` tokio runtime.
pub(crate) fn check_runtime() -> Result<(), FluxError> {
    let flavor = match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => return Ok(()),
        Ok(handle) => format!("{:?}", handle.runtime_flavor()),
        Err(_) => "none".to_string(),
    };
    Err(FluxError::UnsupportedRuntime { flavor })
}

/// A promise that is already settled.
pub fn settled<T>(result: Result<T, FluxError>) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    futures::future::ready(result).boxed().shared()
}

/// Deliver the settlement of `promise` to `callback`.
///
/// No-op when `callback` is `None`. Panics raised by the callback are sent
/// to `unhandled`; they never reach the promise or its other observers.
pub fn promise_callback<T>(
    promise: Promise<T>,
    callback: Option<Callback<T>>,
    options: CallbackOptions,
    unhandled: &UnhandledErrors,
) where
    T: Clone + Send + Sync + 'static,
{
    let Some(callback) = callback else {
        return;
    };
    let unhandled = unhandled.clone();

    tokio::spawn(async move {
        let result = promise.await;
        if options.optimize {
            invoke_guarded(callback, result, &unhandled);
        } else {
            tokio::spawn(async move {
                invoke_guarded(callback, result, &unhandled);
            });
        }
    });
}

fn invoke_guarded<T>(
    callback: Callback<T>,
    result: Result<T, FluxError>,
    unhandled: &UnhandledErrors,
) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback(result))) {
        unhandled.raise(UnhandledError::CallbackPanicked {
            message: panic_message(payload.as_ref()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot};

    fn capture_unhandled() -> (UnhandledErrors, mpsc::UnboundedReceiver<UnhandledError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = UnhandledErrors::with_hook(Arc::new(move |err: &UnhandledError| {
            let _ = tx.send(err.clone());
        }));
        (errors, rx)
    }

    #[tokio::test]
    async fn test_spawn_runs_without_awaiting() {
        let (tx, rx) = oneshot::channel();
        let _promise: Promise<()> = spawn(async move {
            let _ = tx.send(());
            Ok(())
        });
        // Nobody polls the promise, the task still runs.
        rx.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_refuses_multi_thread_runtime() {
        let (tx, mut rx) = oneshot::channel::<()>();
        let promise: Promise<()> = spawn(async move {
            let _ = tx.send(());
            Ok(())
        });

        let err = promise.await.unwrap_err();
        assert!(matches!(err, FluxError::UnsupportedRuntime { ref flavor } if flavor == "MultiThread"));
        // The work was dropped without running
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spawn_outside_runtime_settles_with_error() {
        let promise: Promise<()> = spawn(async { Ok(()) });
        let result = promise.now_or_never().unwrap();
        assert!(matches!(result, Err(FluxError::UnsupportedRuntime { ref flavor }) if flavor == "none"));
    }

    #[tokio::test]
    async fn test_clones_share_settlement() {
        let promise = spawn(async { Ok::<_, FluxError>(serde_json::json!({"n": 1})) });
        let other = promise.clone();
        assert_eq!(promise.await.unwrap(), other.await.unwrap());
    }

    #[tokio::test]
    async fn test_callback_receives_success() {
        let (errors, _rx) = capture_unhandled();
        let (tx, rx) = oneshot::channel();
        let promise = settled(Ok(5u32));

        promise_callback(
            promise,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            CallbackOptions::default(),
            &errors,
        );

        assert_eq!(rx.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_callback_receives_failure_in_optimized_mode() {
        let (errors, _rx) = capture_unhandled();
        let (tx, rx) = oneshot::channel();
        let promise: Promise<u32> = settled(Err(FluxError::InvalidEvent));

        promise_callback(
            promise,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            CallbackOptions::optimized(),
            &errors,
        );

        assert!(matches!(rx.await.unwrap(), Err(FluxError::InvalidEvent)));
    }

    #[tokio::test]
    async fn test_callback_panic_is_raised_not_swallowed() {
        for options in [CallbackOptions::default(), CallbackOptions::optimized()] {
            let (errors, mut rx) = capture_unhandled();
            let promise = settled(Ok(1u8));

            promise_callback(
                promise.clone(),
                Some(Box::new(|_| panic!("callback bug"))),
                options,
                &errors,
            );

            let raised = rx.recv().await.unwrap();
            assert!(matches!(
                raised,
                UnhandledError::CallbackPanicked { ref message } if message == "callback bug"
            ));
            // The promise itself is untouched
            assert_eq!(promise.await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_missing_callback_is_noop() {
        let (errors, mut rx) = capture_unhandled();
        promise_callback(settled(Ok(())), None, CallbackOptions::default(), &errors);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
