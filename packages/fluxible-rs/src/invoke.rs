//! Running one action to completion.
//!
//! Every action runs on its own task of the `current_thread` runtime, so the
//! body only starts once the caller yields. Whatever the body's convention, the outcome is
//! normalized into a [`Promise`]; panics become [`FluxError::ActionPanicked`].

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, debug_span, Instrument};

use crate::action::{Action, RunOutcome};
use crate::bridge::{self, promise_callback, Callback, CallbackOptions, Promise};
use crate::context::ActionContext;
use crate::error::FluxError;
use crate::fatal::panic_message;
use crate::id::RootId;
use crate::timing::TimingStart;

/// Start `action` in `frame` and return a promise of its result.
///
/// `done`, when given, receives the same result on a later task.
pub(crate) fn call_action(
    frame: ActionContext,
    action: Action,
    payload: Value,
    done: Option<Callback<Value>>,
) -> Promise<Value> {
    let unhandled = frame.scope().unhandled.clone();
    let span = debug_span!(
        "action",
        name = action.display_name(),
        root_id = frame.root_id().map(RootId::get),
        depth = frame.stack().len(),
    );

    let promise = bridge::spawn(run(frame, action, payload).instrument(span));
    promise_callback(promise.clone(), done, CallbackOptions::default(), &unhandled);
    promise
}

async fn run(frame: ActionContext, action: Action, payload: Value) -> Result<Value, FluxError> {
    let scope = frame.scope().clone();
    let name = action.name_arc();
    let root_id = frame.root_id();
    let timer = scope.timing_enabled.then(|| {
        let stack: Vec<String> = frame.stack().iter().map(|s| s.to_string()).collect();
        (TimingStart::now(), stack)
    });

    debug!("action started");
    let outcome = AssertUnwindSafe(async move { action.run(frame, payload).await })
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(RunOutcome::Settled(Ok(value))) => Ok(value),
        Ok(RunOutcome::Settled(Err(cause))) => Err(FluxError::action(&*name, cause)),
        Ok(RunOutcome::Abandoned) => Err(FluxError::CompletionDropped {
            action: name.to_string(),
        }),
        Err(panic) => Err(FluxError::ActionPanicked {
            action: name.to_string(),
            message: panic_message(panic.as_ref()),
        }),
    };

    if let Some((start, stack)) = timer {
        scope
            .timings
            .record(start.finish(&name, stack, root_id, result.is_err()));
    }

    match &result {
        Ok(_) => debug!("action finished"),
        Err(err) => debug!(error = %err, "action failed"),
    }
    result
}
