//! Plugins: named extensions of the application and its contexts.
//!
//! An [`AppPlugin`] is registered once on the [`App`] and may contribute a
//! [`ContextPlugin`] to every context the app creates. A [`ContextPlugin`]
//! can add members to the action, component and store contexts, wrap every
//! action execution, and persist private state across dehydrate/rehydrate.
//!
//! Every hook is optional; the defaults do nothing.
//!
//! # Example
//!
//! ```ignore
//! struct LocalePlugin { locale: Mutex<String> }
//!
//! impl AppPlugin for LocalePlugin {
//!     fn name(&self) -> &str { "LocalePlugin" }
//!
//!     fn plug_context(&self, _: &ContextOptions, _: &Context, _: &App) -> Option<Box<dyn ContextPlugin>> {
//!         Some(Box::new(LocaleContextPlugin { locale: self.locale.lock().unwrap().clone() }))
//!     }
//!
//!     fn dehydrate(&self) -> Option<Value> {
//!         Some(json!({ "locale": *self.locale.lock().unwrap() }))
//!     }
//!
//!     fn rehydrate(&self, state: Value, _: &App) -> Rehydrate {
//!         *self.locale.lock().unwrap() = state["locale"].as_str().unwrap_or("en").into();
//!         Rehydrate::done()
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;

use crate::action::{settle_done, Done};
use crate::app::App;
use crate::context::{ActionContext, ComponentContext, Context, ContextOptions, ExecuteAction, StoreContext};
use crate::error::FluxError;

/// Hook threaded through every action execution of a context.
///
/// Receives the invocation and returns the (possibly replaced) invocation.
pub type ExecuteActionHook = Arc<dyn Fn(ExecuteAction) -> ExecuteAction + Send + Sync>;

/// Outcome of a rehydrate hook, in one of three conventions.
pub enum Rehydrate {
    /// Finished synchronously.
    Sync(anyhow::Result<()>),
    /// Finishes when the future resolves.
    Future(BoxFuture<'static, anyhow::Result<()>>),
    /// Finishes when the closure calls its [`Done`].
    Callback(Box<dyn FnOnce(Done<()>) + Send>),
}

impl Rehydrate {
    /// Synchronous success.
    pub fn done() -> Self {
        Rehydrate::Sync(Ok(()))
    }

    /// Finish when `future` resolves.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Rehydrate::Future(future.boxed())
    }

    /// Finish when `body` calls its completion handle.
    pub fn callback<F>(body: F) -> Self
    where
        F: FnOnce(Done<()>) + Send + 'static,
    {
        Rehydrate::Callback(Box::new(body))
    }

    pub(crate) async fn settle(self) -> anyhow::Result<()> {
        match self {
            Rehydrate::Sync(result) => result,
            Rehydrate::Future(future) => future.await,
            Rehydrate::Callback(body) => {
                let (done, rx) = Done::channel();
                body(done);
                settle_done(rx).await
            }
        }
    }
}

/// Wait for every plugin rehydration; the first failure fails the whole join.
pub(crate) async fn rehydrate_all(tasks: Vec<(String, Rehydrate)>) -> Result<(), FluxError> {
    try_join_all(tasks.into_iter().map(|(plugin, task)| async move {
        task.settle()
            .await
            .map_err(|cause| FluxError::PluginRehydrate {
                plugin,
                cause: Arc::new(cause),
            })
    }))
    .await?;
    Ok(())
}

/// A plugin registered on the application.
pub trait AppPlugin: Send + Sync + 'static {
    /// Unique name; keys the plugin's dehydrated state. Must not be empty.
    fn name(&self) -> &str;

    /// Contribute a plugin to a newly created context.
    ///
    /// A returned plugin with an empty name is registered under this
    /// plugin's name.
    fn plug_context(
        &self,
        options: &ContextOptions,
        context: &Context,
        app: &App,
    ) -> Option<Box<dyn ContextPlugin>> {
        let _ = (options, context, app);
        None
    }

    /// Plugin state to persist. `None` leaves no entry.
    fn dehydrate(&self) -> Option<Value> {
        None
    }

    /// Restore state produced by [`AppPlugin::dehydrate`].
    fn rehydrate(&self, state: Value, app: &App) -> Rehydrate {
        let _ = (state, app);
        Rehydrate::done()
    }
}

/// A plugin attached to one context.
pub trait ContextPlugin: Send + Sync + 'static {
    /// Unique name within the context.
    fn name(&self) -> &str {
        ""
    }

    /// Add members to the context's action context.
    fn plug_action_context(&self, action_context: &mut ActionContext, context: &Context) {
        let _ = (action_context, context);
    }

    /// Add members to the context's component context.
    fn plug_component_context(&self, component_context: &mut ComponentContext, context: &Context) {
        let _ = (component_context, context);
    }

    /// Add members to the context's store context.
    fn plug_store_context(&self, store_context: &mut StoreContext, context: &Context) {
        let _ = (store_context, context);
    }

    /// Hook run on every action execution of the context.
    fn execute_action_hook(&self) -> Option<ExecuteActionHook> {
        None
    }

    /// Plugin state to persist. `None` leaves no entry.
    fn dehydrate(&self) -> Option<Value> {
        None
    }

    /// Restore state produced by [`ContextPlugin::dehydrate`].
    fn rehydrate(&self, state: Value, context: &Context) -> Rehydrate {
        let _ = (state, context);
        Rehydrate::done()
    }
}

/// A context plugin registered under its app plugin's name.
pub(crate) struct NamedPlugin {
    name: String,
    inner: Box<dyn ContextPlugin>,
}

impl NamedPlugin {
    pub(crate) fn new(name: impl Into<String>, inner: Box<dyn ContextPlugin>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

impl ContextPlugin for NamedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn plug_action_context(&self, action_context: &mut ActionContext, context: &Context) {
        self.inner.plug_action_context(action_context, context);
    }

    fn plug_component_context(&self, component_context: &mut ComponentContext, context: &Context) {
        self.inner.plug_component_context(component_context, context);
    }

    fn plug_store_context(&self, store_context: &mut StoreContext, context: &Context) {
        self.inner.plug_store_context(store_context, context);
    }

    fn execute_action_hook(&self) -> Option<ExecuteActionHook> {
        self.inner.execute_action_hook()
    }

    fn dehydrate(&self) -> Option<Value> {
        self.inner.dehydrate()
    }

    fn rehydrate(&self, state: Value, context: &Context) -> Rehydrate {
        self.inner.rehydrate(state, context)
    }
}
