//! The application container.
//!
//! An [`App`] is created once per process. It holds the root component,
//! the store registry and the app-level plugins, and it creates one
//! [`Context`] per request:
//!
//! ```ignore
//! let app = App::builder()
//!     .component(Routes::default())
//!     .config(Config::from_env()?)
//!     .build();
//! app.register_store::<CounterStore>()?;
//!
//! // server
//! let context = app.create_context(ContextOptions::new());
//! context.execute_action(&navigate, Some(json!({ "url": "/" }))).await?;
//! let state = serde_json::to_value(app.dehydrate(&context))?;
//!
//! // client
//! let context = app.rehydrate(state, None).await?;
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::action::{Action, ActionOutput};
use crate::bridge::{self, promise_callback, Callback, CallbackOptions, Promise};
use crate::config::Config;
use crate::context::{
    parse_state, ActionContext, Context, ContextOptions, DehydratedContext, StoreContext,
};
use crate::dispatcher::{Dispatcher, DispatcherContext, Store};
use crate::error::{FluxError, UnhandledError};
use crate::fatal::UnhandledErrors;
use crate::plugin::{rehydrate_all, AppPlugin, ContextPlugin, NamedPlugin};

/// The root UI component, opaque to the container.
pub type Component = Arc<dyn Any + Send + Sync>;

/// Serialized form of an application and one of its contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedApp {
    /// The context's state.
    pub context: DehydratedContext,
    /// State of app plugins that persist something, by plugin name.
    pub plugins: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AppState {
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    plugins: Option<Map<String, Value>>,
}

/// Builder for [`App`].
pub struct AppBuilder {
    component: Option<Component>,
    component_action_error_handler: Option<Action>,
    config: Config,
    unhandled: UnhandledErrors,
}

impl AppBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            component: None,
            component_action_error_handler: None,
            config: Config::default(),
            unhandled: UnhandledErrors::new(),
        }
    }

    /// Set the root component.
    pub fn component<C: Any + Send + Sync>(mut self, component: C) -> Self {
        self.component = Some(Arc::new(component));
        self
    }

    /// Replace the action run when a component-initiated action fails.
    ///
    /// It receives `{ "actionName": .., "err": .. }` as payload.
    pub fn component_action_error_handler(mut self, handler: Action) -> Self {
        self.component_action_error_handler = Some(handler);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Deliver unhandled errors to `hook` instead of panicking.
    pub fn on_unhandled_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&UnhandledError) + Send + Sync + 'static,
    {
        self.unhandled = UnhandledErrors::with_hook(Arc::new(hook));
        self
    }

    /// Build the application.
    pub fn build(self) -> App {
        let component_action_error_handler = self
            .component_action_error_handler
            .unwrap_or_else(default_component_action_error_handler);
        App {
            inner: Arc::new(AppInner {
                component: self.component,
                component_action_error_handler,
                plugins: RwLock::new(Vec::new()),
                dispatcher: Dispatcher::new(),
                config: self.config,
                unhandled: self.unhandled,
            }),
        }
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-raises the component action's error, leaving it unhandled.
fn default_component_action_error_handler() -> Action {
    fn rethrow(_ctx: &ActionContext, payload: Value) -> ActionOutput {
        match payload.get("err") {
            Some(Value::String(message)) => Err(anyhow!("{message}")),
            Some(err) if !err.is_null() => Err(anyhow!("{err}")),
            _ => Ok(Value::Null),
        }
    }
    Action::sync(rethrow).named("defaultComponentActionHandler")
}

/// The application container. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    component: Option<Component>,
    component_action_error_handler: Action,
    plugins: RwLock<Vec<Arc<dyn AppPlugin>>>,
    dispatcher: Dispatcher,
    config: Config,
    unhandled: UnhandledErrors,
}

impl App {
    /// An application with no component and default configuration.
    pub fn new() -> Self {
        AppBuilder::new().build()
    }

    /// Start building an application.
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// The root component, if one was given.
    pub fn component(&self) -> Option<&Component> {
        self.inner.component.as_ref()
    }

    /// The root component, downcast to its concrete type.
    pub fn component_as<C: Any>(&self) -> Option<&C> {
        self.inner.component.as_ref()?.downcast_ref()
    }

    /// Action run when a component-initiated action fails.
    pub fn component_action_error_handler(&self) -> &Action {
        &self.inner.component_action_error_handler
    }

    /// The application's configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn unhandled_errors(&self) -> &UnhandledErrors {
        &self.inner.unhandled
    }

    /// Register a store type with the dispatcher.
    pub fn register_store<S: Store>(&self) -> Result<(), FluxError> {
        self.inner.dispatcher.register_store::<S>()
    }

    /// The shared store registry.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Create a new context, letting every app plugin contribute to it.
    pub fn create_context(&self, options: ContextOptions) -> Context {
        let context = Context::new(self.clone(), options);
        for plugin in self.plugins() {
            let Some(context_plugin) = plugin.plug_context(context.options(), &context, self) else {
                continue;
            };
            let context_plugin: Arc<dyn ContextPlugin> = if context_plugin.name().is_empty() {
                Arc::new(NamedPlugin::new(plugin.name(), context_plugin))
            } else {
                Arc::from(context_plugin)
            };
            context.attach(context_plugin);
        }
        debug!(plugins = context.plugins().len(), "context created");
        context
    }

    /// Create a dispatcher instance whose stores are built with `store_context`.
    pub fn create_dispatcher_instance(&self, store_context: StoreContext) -> DispatcherContext {
        self.inner.dispatcher.create_context(store_context)
    }

    /// Register an app plugin.
    ///
    /// Fails if the plugin has no name.
    pub fn plug<P: AppPlugin>(&self, plugin: P) -> Result<(), FluxError> {
        if plugin.name().is_empty() {
            return Err(FluxError::PluginMissingName);
        }
        info!(plugin = plugin.name(), "app plugin registered");
        write(&self.inner.plugins).push(Arc::new(plugin));
        Ok(())
    }

    /// Registered app plugins, in registration order.
    pub fn plugins(&self) -> Vec<Arc<dyn AppPlugin>> {
        read(&self.inner.plugins).clone()
    }

    /// Find a registered app plugin by name.
    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn AppPlugin>> {
        read(&self.inner.plugins)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Serialize app plugin state together with `context`.
    pub fn dehydrate(&self, context: &Context) -> DehydratedApp {
        let plugins = self
            .plugins()
            .iter()
            .filter_map(|p| p.dehydrate().map(|state| (p.name().to_string(), state)))
            .collect();
        DehydratedApp {
            context: context.dehydrate(),
            plugins,
        }
    }

    /// Create a context from state produced by [`App::dehydrate`].
    ///
    /// App plugins are rehydrated first (all of them, concurrently), then a
    /// new context is created with the saved options and rehydrated. Errors,
    /// including a non-object `state`, settle the promise and reach
    /// `callback` on a later task.
    pub fn rehydrate(&self, state: Value, callback: Option<Callback<Context>>) -> Promise<Context> {
        let app = self.clone();
        let promise = bridge::spawn(async move { app.rehydrate_state(state).await });
        promise_callback(
            promise.clone(),
            callback,
            CallbackOptions::optimized(),
            &self.inner.unhandled,
        );
        promise
    }

    async fn rehydrate_state(&self, state: Value) -> Result<Context, FluxError> {
        let state: AppState = parse_state(state)?;
        let saved = state.plugins.unwrap_or_default();

        let tasks: Vec<_> = self
            .plugins()
            .into_iter()
            .filter_map(|plugin| {
                let plugin_state = saved.get(plugin.name())?.clone();
                Some((plugin.name().to_string(), plugin.rehydrate(plugin_state, self)))
            })
            .collect();
        rehydrate_all(tasks).await?;

        let context_state = state.context.unwrap_or_else(|| json!({}));
        let options = match context_state.get("options") {
            Some(options) if !options.is_null() => serde_json::from_value(options.clone())
                .map_err(|e| FluxError::MalformedState {
                    message: e.to_string(),
                })?,
            _ => ContextOptions::default(),
        };

        let context = self.create_context(options);
        let context = context.rehydrate(context_state).await?;
        info!(plugins = saved.len(), "app rehydrated");
        Ok(context)
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<String> = self.plugins().iter().map(|p| p.name().to_string()).collect();
        f.debug_struct("App")
            .field("component", &self.inner.component.is_some())
            .field("plugins", &plugins)
            .field("dispatcher", &self.inner.dispatcher)
            .field("config", &self.inner.config)
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl AppPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_plug_requires_name() {
        let app = App::new();
        assert!(matches!(app.plug(Named("")), Err(FluxError::PluginMissingName)));
        assert!(app.plugins().is_empty());

        app.plug(Named("TestAppPlugin")).unwrap();
        assert!(app.get_plugin("TestAppPlugin").is_some());
        assert!(app.get_plugin("Other").is_none());
    }

    #[test]
    fn test_component_downcast() {
        #[derive(Debug, PartialEq)]
        struct Routes(u8);

        let app = App::builder().component(Routes(3)).build();
        assert_eq!(app.component_as::<Routes>(), Some(&Routes(3)));
        assert!(app.component_as::<String>().is_none());
        assert!(App::new().component().is_none());
    }

    #[test]
    fn test_default_error_handler_name() {
        let app = App::new();
        assert_eq!(
            app.component_action_error_handler().display_name(),
            "defaultComponentActionHandler"
        );
    }

    #[tokio::test]
    async fn test_rehydrate_rejects_non_object() {
        let app = App::new();
        let err = app.rehydrate(json!([1, 2]), None).await.unwrap_err();
        assert!(matches!(err, FluxError::InvalidState { found: "array" }));
    }

    #[tokio::test]
    async fn test_rehydrate_empty_state() {
        let app = App::new();
        let context = app.rehydrate(json!({}), None).await.unwrap();
        assert_eq!(context.options(), &ContextOptions::default());
        assert_eq!(context.dehydrate().dispatcher, json!({ "stores": {} }));
    }
}
