//! Actions: units of application logic run against an [`ActionContext`].
//!
//! An action is given a context, a payload and a way to signal completion.
//! The three supported calling conventions are an explicit variant rather
//! than something sniffed at runtime:
//!
//! | Constructor          | Body signature                                  |
//! |----------------------|-------------------------------------------------|
//! | [`Action::sync`]     | `Fn(&ActionContext, Value) -> Result<Value>`    |
//! | [`Action::future`]   | `Fn(ActionContext, Value) -> impl Future<..>`   |
//! | [`Action::callback`] | `Fn(ActionContext, Value, Done)`                |
//!
//! # Example
//!
//! ```ignore
//! use fluxible::{Action, ActionContext};
//! use serde_json::{json, Value};
//!
//! fn increment(ctx: &ActionContext, _payload: Value) -> anyhow::Result<Value> {
//!     ctx.dispatch("INCREMENT", json!({}))?;
//!     Ok(Value::Null)
//! }
//!
//! async fn load_page(ctx: ActionContext, payload: Value) -> anyhow::Result<Value> {
//!     let page = fetch(&payload).await?;
//!     ctx.dispatch("RECEIVE_PAGE", page)?;
//!     Ok(Value::Null)
//! }
//!
//! let increment = Action::sync(increment);         // display name "increment"
//! let load_page = Action::future(load_page);       // display name "load_page"
//! let legacy = Action::callback(|_ctx, _payload, done| done.ok(Value::Null))
//!     .named("legacy");
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::context::ActionContext;

/// Result an action body produces.
pub type ActionOutput = anyhow::Result<Value>;

type SyncBody = dyn Fn(&ActionContext, Value) -> ActionOutput + Send + Sync;
type AsyncBody = dyn Fn(ActionContext, Value) -> BoxFuture<'static, ActionOutput> + Send + Sync;
type CallbackBody = dyn Fn(ActionContext, Value, Done) + Send + Sync;

/// The calling convention of an action body.
#[derive(Clone)]
pub enum ActionKind {
    /// Returns its result directly.
    Sync(Arc<SyncBody>),
    /// Returns a future of its result.
    Async(Arc<AsyncBody>),
    /// Signals its result through [`Done`].
    Callback(Arc<CallbackBody>),
}

/// A named action.
#[derive(Clone)]
pub struct Action {
    name: Arc<str>,
    kind: ActionKind,
}

impl Action {
    /// An action that returns its result synchronously.
    ///
    /// The display name is taken from the function's own name.
    pub fn sync<F>(body: F) -> Self
    where
        F: Fn(&ActionContext, Value) -> ActionOutput + Send + Sync + 'static,
    {
        Self {
            name: derive_name::<F>(),
            kind: ActionKind::Sync(Arc::new(body)),
        }
    }

    /// An action that returns a future.
    pub fn future<F, Fut>(body: F) -> Self
    where
        F: Fn(ActionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionOutput> + Send + 'static,
    {
        Self {
            name: derive_name::<F>(),
            kind: ActionKind::Async(Arc::new(move |ctx, payload| body(ctx, payload).boxed())),
        }
    }

    /// A legacy action that signals completion through a [`Done`] handle.
    pub fn callback<F>(body: F) -> Self
    where
        F: Fn(ActionContext, Value, Done) + Send + Sync + 'static,
    {
        Self {
            name: derive_name::<F>(),
            kind: ActionKind::Callback(Arc::new(body)),
        }
    }

    /// Override the display name.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Name used in call stacks, logs and error messages.
    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    /// The action's calling convention.
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Run the body. Synchronous bodies execute when the returned future is
    /// first polled, not when `run` is called.
    pub(crate) fn run(&self, ctx: ActionContext, payload: Value) -> BoxFuture<'static, RunOutcome> {
        match self.kind.clone() {
            ActionKind::Sync(body) => async move { RunOutcome::Settled(body(&ctx, payload)) }.boxed(),
            ActionKind::Async(body) => body(ctx, payload).map(RunOutcome::Settled).boxed(),
            ActionKind::Callback(body) => {
                let (done, rx) = Done::channel();
                async move {
                    body(ctx, payload, done);
                    match rx.await {
                        Ok(result) => RunOutcome::Settled(result),
                        Err(_) => RunOutcome::Abandoned,
                    }
                }
                .boxed()
            }
        }
    }
}

/// How an action body finished.
pub(crate) enum RunOutcome {
    Settled(ActionOutput),
    /// A callback-style body dropped its [`Done`] without calling it.
    Abandoned,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ActionKind::Sync(_) => "sync",
            ActionKind::Async(_) => "async",
            ActionKind::Callback(_) => "callback",
        };
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

/// Completion handle handed to callback-style actions and plugin hooks.
///
/// Consumed on use, so it can be called at most once.
pub struct Done<T = Value> {
    tx: oneshot::Sender<anyhow::Result<T>>,
}

impl<T> Done<T> {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<anyhow::Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Signal completion with `result`.
    pub fn call(self, result: anyhow::Result<T>) {
        // A closed receiver means nobody waits for the result any more
        let _ = self.tx.send(result);
    }

    /// Signal success.
    pub fn ok(self, value: T) {
        self.call(Ok(value));
    }

    /// Signal failure.
    pub fn fail(self, err: impl Into<anyhow::Error>) {
        self.call(Err(err.into()));
    }
}

impl<T> fmt::Debug for Done<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done").finish_non_exhaustive()
    }
}

/// Await a [`Done`] receiver, treating a dropped handle as an error.
pub(crate) async fn settle_done<T>(rx: oneshot::Receiver<anyhow::Result<T>>) -> anyhow::Result<T> {
    rx.await
        .unwrap_or_else(|_| Err(anyhow!("completion callback dropped without being called")))
}

/// Last path segment of the body's type name; closures are "anonymous".
fn derive_name<F>() -> Arc<str> {
    let full = std::any::type_name::<F>();
    let path = full.split('<').next().unwrap_or(full);
    let last = path.rsplit("::").next().unwrap_or(path);
    if last.is_empty() || last.starts_with('{') {
        Arc::from("anonymous")
    } else {
        Arc::from(last)
    }
}
