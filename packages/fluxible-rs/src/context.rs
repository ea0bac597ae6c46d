//! Per-request contexts and the interfaces derived from them.
//!
//! A [`Context`] is created by the [`App`] for one request or session. It
//! owns a dispatcher instance (created lazily, reused for the lifetime of
//! the context) and three derived interfaces, each built once on first
//! access and extended by the context's plugins:
//!
//! | Interface            | Used by        | Exposes                                   |
//! |----------------------|----------------|-------------------------------------------|
//! | [`ActionContext`]    | actions        | `dispatch`, `execute_action`, `get_store` |
//! | [`ComponentContext`] | UI components  | `execute_action` (errors redirected), `get_store` |
//! | [`StoreContext`]     | stores         | plugin members only                       |
//!
//! # Transactions
//!
//! Every `execute_action` runs in a fresh frame: a copy of the calling
//! [`ActionContext`] with the action's name appended to its call stack and
//! the transaction's [`RootId`]. A root-level call draws a new root id;
//! nested calls made through the frame an action received inherit it.
//!
//! ```text
//! context.execute_action(A)          stack [A]        root 7
//!   └─ ctx.execute_action(B)         stack [A, B]     root 7
//!        └─ ctx.execute_action(C)    stack [A, B, C]  root 7
//!   └─ ctx.execute_action(D)         stack [A, D]     root 7
//! context.execute_action(E)          stack [E]        root 12
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action::Action;
use crate::app::App;
use crate::bridge::{self, promise_callback, Callback, CallbackOptions, Promise};
use crate::dispatcher::{DispatcherContext, Store, StoreHandle};
use crate::error::{json_kind, FluxError, UnhandledError};
use crate::fatal::UnhandledErrors;
use crate::id::RootId;
use crate::invoke::call_action;
use crate::members::Members;
use crate::plugin::{rehydrate_all, ContextPlugin, ExecuteActionHook};
use crate::timing::{ActionTiming, TimingLog};

#[cfg(any(test, feature = "testing"))]
use crate::testing::CallRecorder;

/// Display names from the transaction root to the current action.
pub type ActionStack = SmallVec<[Arc<str>; 4]>;

/// Options a context is created with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Overrides [`Config::action_timing`](crate::Config::action_timing) for this context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_timing: Option<bool>,
    /// Anything else; forwarded to plugins' `plug_context`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContextOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable action timing for this context.
    pub fn with_action_timing(mut self, enabled: bool) -> Self {
        self.action_timing = Some(enabled);
        self
    }

    /// Add an option for plugins.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// State shared by a context and every action frame it creates.
pub(crate) struct Scope {
    hooks: RwLock<Vec<ExecuteActionHook>>,
    pub(crate) timings: TimingLog,
    pub(crate) timing_enabled: bool,
    pub(crate) dev_warnings: bool,
    pub(crate) unhandled: UnhandledErrors,
    #[cfg(any(test, feature = "testing"))]
    pub(crate) recorder: Option<Arc<CallRecorder>>,
}

impl Scope {
    pub(crate) fn new(
        timings: TimingLog,
        timing_enabled: bool,
        dev_warnings: bool,
        unhandled: UnhandledErrors,
    ) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            timings,
            timing_enabled,
            dev_warnings,
            unhandled,
            #[cfg(any(test, feature = "testing"))]
            recorder: None,
        }
    }

    fn hooks(&self) -> Vec<ExecuteActionHook> {
        read(&self.hooks).clone()
    }
}

/// One action invocation, as seen by execute-action hooks.
///
/// Hooks may replace any field: wrap the action, rewrite the payload,
/// add members to the frame or intercept the completion callback.
pub struct ExecuteAction {
    /// Frame the action will run in.
    pub action_context: ActionContext,
    /// Action to run.
    pub action: Action,
    /// Payload (already defaulted).
    pub payload: Value,
    /// Caller's completion callback, if any.
    pub done: Option<Callback<Value>>,
}

impl fmt::Debug for ExecuteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteAction")
            .field("action", &self.action)
            .field("payload", &self.payload)
            .field("stack", &self.action_context.stack)
            .field("done", &self.done.is_some())
            .finish()
    }
}

/// The interface actions run against.
///
/// Cheap to clone. Each action receives its own frame; calling
/// [`execute_action`](Self::execute_action) on that frame nests the new
/// action under it.
#[derive(Clone)]
pub struct ActionContext {
    scope: Arc<Scope>,
    dispatcher: Arc<DispatcherContext>,
    members: Members,
    display_name: Option<Arc<str>>,
    stack: ActionStack,
    root_id: Option<RootId>,
}

impl ActionContext {
    pub(crate) fn root(scope: Arc<Scope>, dispatcher: Arc<DispatcherContext>) -> Self {
        Self {
            scope,
            dispatcher,
            members: Members::new(),
            display_name: None,
            stack: ActionStack::new(),
            root_id: None,
        }
    }

    /// Deliver an event to the stores synchronously.
    pub fn dispatch(&self, event: &str, payload: Value) -> Result<(), FluxError> {
        #[cfg(any(test, feature = "testing"))]
        if let Some(recorder) = &self.scope.recorder {
            recorder.record_dispatch(event, &payload);
        }
        self.dispatcher.dispatch(event, &payload)
    }

    /// Get a store instance of this context.
    pub fn get_store<S: Store>(&self) -> Result<StoreHandle<S>, FluxError> {
        self.dispatcher.get_store::<S>()
    }

    /// Run `action` nested under this frame.
    ///
    /// `None` payload becomes `{}`; any other value, including `null` and
    /// `false`, is passed through unchanged. The action starts on a new task
    /// whether or not the returned promise is awaited.
    pub fn execute_action(&self, action: &Action, payload: Option<Value>) -> Promise<Value> {
        self.execute(action.clone(), payload, None)
    }

    /// Like [`execute_action`](Self::execute_action), additionally
    /// delivering the result to `done` on a later task.
    pub fn execute_action_with(
        &self,
        action: &Action,
        payload: Option<Value>,
        done: Callback<Value>,
    ) -> Promise<Value> {
        self.execute(action.clone(), payload, Some(done))
    }

    fn execute(
        &self,
        action: Action,
        payload: Option<Value>,
        done: Option<Callback<Value>>,
    ) -> Promise<Value> {
        #[cfg(any(test, feature = "testing"))]
        if let Some(recorder) = &self.scope.recorder {
            recorder.record_execute(&action, payload.as_ref());
            return call_action(self.clone(), action, payload.unwrap_or_else(empty_payload), done);
        }
        let frame = self.sub_action_context(&action);
        run_action(frame, action, payload, done)
    }

    /// Frame for running `action` under this one.
    pub(crate) fn sub_action_context(&self, action: &Action) -> ActionContext {
        let mut frame = self.clone();
        let name = action.name_arc();
        frame.stack.push(name.clone());
        frame.display_name = Some(name);
        frame.root_id = Some(self.root_id.unwrap_or_else(RootId::generate));
        frame
    }

    /// Name of the action this frame belongs to (`None` for the root interface).
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Display names from the transaction root to this action.
    pub fn stack(&self) -> &[Arc<str>] {
        &self.stack
    }

    /// Transaction this frame belongs to (`None` for the root interface).
    pub fn root_id(&self) -> Option<RootId> {
        self.root_id
    }

    /// A plugin-provided member.
    pub fn member<T: Any>(&self, name: &str) -> Option<&T> {
        self.members.get(name)
    }

    /// Add a member. Meant for plugin hooks.
    pub fn provide<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.members.insert(name, value);
    }

    /// All plugin-provided members.
    pub fn members(&self) -> &Members {
        &self.members
    }

    pub(crate) fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("display_name", &self.display_name)
            .field("stack", &self.stack)
            .field("root_id", &self.root_id)
            .field("members", &self.members)
            .finish()
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// The execution routine shared by root-level and nested calls.
fn run_action(
    frame: ActionContext,
    action: Action,
    payload: Option<Value>,
    done: Option<Callback<Value>>,
) -> Promise<Value> {
    let payload = payload.unwrap_or_else(empty_payload);

    if frame.scope.dev_warnings {
        if let Some(current) = frame.dispatcher.current_dispatch() {
            warn!(
                action = action.display_name(),
                dispatching = %current.event,
                "executeAction called while an event is being dispatched; \
                 the action will only start after the dispatch completes. \
                 This usually means cascading updates"
            );
        }
    }

    let hooks = frame.scope.hooks();
    let mut invocation = ExecuteAction {
        action_context: frame,
        action,
        payload,
        done,
    };
    for hook in hooks {
        invocation = hook(invocation);
    }

    let ExecuteAction {
        action_context,
        action,
        payload,
        done,
    } = invocation;
    call_action(action_context, action, payload, done)
}

/// The interface UI components run against.
///
/// Components never see action errors: failures are handed to the app's
/// component action error handler.
#[derive(Clone)]
pub struct ComponentContext {
    action_context: ActionContext,
    error_handler: Action,
    members: Members,
}

impl ComponentContext {
    /// Get a store instance of this context.
    pub fn get_store<S: Store>(&self) -> Result<StoreHandle<S>, FluxError> {
        self.action_context.get_store::<S>()
    }

    /// Run `action` as a new transaction.
    ///
    /// The returned handle completes once the action, and the error handler
    /// if the action failed, have finished. It never carries the error.
    pub fn execute_action(&self, action: &Action, payload: Option<Value>) -> JoinHandle<()> {
        self.execute(action, payload, None)
    }

    /// Like [`execute_action`](Self::execute_action) with a completion
    /// callback. Accepted, but components should react to store changes
    /// instead.
    pub fn execute_action_with(
        &self,
        action: &Action,
        payload: Option<Value>,
        done: Callback<Value>,
    ) -> JoinHandle<()> {
        if self.action_context.scope.dev_warnings {
            warn!(
                action = action.display_name(),
                "callback passed to a component executeAction; \
                 components should listen to store changes instead"
            );
        }
        self.execute(action, payload, Some(done))
    }

    fn execute(
        &self,
        action: &Action,
        payload: Option<Value>,
        done: Option<Callback<Value>>,
    ) -> JoinHandle<()> {
        let execution = self.action_context.execute_action(action, payload);
        let root = self.action_context.clone();
        let handler = self.error_handler.clone();
        let action_name = action.display_name().to_string();
        let unhandled = self.action_context.scope.unhandled.clone();

        let outcome = bridge::spawn({
            let unhandled = unhandled.clone();
            async move {
                let err = match execution.await {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                debug!(action = %action_name, error = %err, "component action failed, running error handler");
                let payload = json!({
                    "actionName": action_name.clone(),
                    "err": err.cause_message(),
                });
                let handled = root.execute_action(&handler, Some(payload)).await;
                if let Err(handler_error) = &handled {
                    unhandled.raise(UnhandledError::ComponentAction {
                        action: action_name,
                        error: err,
                        handler_error: handler_error.clone(),
                    });
                }
                handled
            }
        });

        promise_callback(outcome.clone(), done, CallbackOptions::default(), &unhandled);
        tokio::spawn(async move {
            let _ = outcome.await;
        })
    }

    /// A plugin-provided member.
    pub fn member<T: Any>(&self, name: &str) -> Option<&T> {
        self.members.get(name)
    }

    /// Add a member. Meant for plugin hooks.
    pub fn provide<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.members.insert(name, value);
    }

    /// All plugin-provided members.
    pub fn members(&self) -> &Members {
        &self.members
    }
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("error_handler", &self.error_handler)
            .field("members", &self.members)
            .finish()
    }
}

/// The interface stores are created with.
///
/// Holds nothing but what plugins add.
#[derive(Debug, Clone, Default)]
pub struct StoreContext {
    members: Members,
}

impl StoreContext {
    /// A plugin-provided member.
    pub fn member<T: Any>(&self, name: &str) -> Option<&T> {
        self.members.get(name)
    }

    /// Add a member. Meant for plugin hooks.
    pub fn provide<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.members.insert(name, value);
    }

    /// All plugin-provided members.
    pub fn members(&self) -> &Members {
        &self.members
    }
}

/// Serialized form of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedContext {
    /// Dispatcher (store) state.
    pub dispatcher: Value,
    /// State of context plugins that persist something, by plugin name.
    pub plugins: Map<String, Value>,
    /// Options the context was created with, when not the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ContextOptions>,
}

#[derive(Debug, Default, Deserialize)]
struct ContextState {
    #[serde(default)]
    dispatcher: Option<Value>,
    #[serde(default)]
    plugins: Option<Map<String, Value>>,
}

/// Parse a dehydrated envelope, rejecting non-objects.
pub(crate) fn parse_state<T: DeserializeOwned>(state: Value) -> Result<T, FluxError> {
    if !state.is_object() {
        return Err(FluxError::InvalidState {
            found: json_kind(&state),
        });
    }
    serde_json::from_value(state).map_err(|e| FluxError::MalformedState {
        message: e.to_string(),
    })
}

/// A request- or session-scoped container.
///
/// Created by [`App::create_context`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    app: App,
    options: ContextOptions,
    scope: Arc<Scope>,
    dispatcher: RwLock<Option<Arc<DispatcherContext>>>,
    plugins: RwLock<Vec<Arc<dyn ContextPlugin>>>,
    action_context: Mutex<Option<ActionContext>>,
    component_context: Mutex<Option<ComponentContext>>,
    store_context: Mutex<Option<StoreContext>>,
}

impl Context {
    pub(crate) fn new(app: App, options: ContextOptions) -> Self {
        let config = app.config();
        let scope = Scope::new(
            TimingLog::with_capacity(config.timing_capacity),
            options.action_timing.unwrap_or(config.action_timing),
            config.dev_warnings,
            app.unhandled_errors().clone(),
        );
        Self {
            inner: Arc::new(ContextInner {
                app,
                options,
                scope: Arc::new(scope),
                dispatcher: RwLock::new(None),
                plugins: RwLock::new(Vec::new()),
                action_context: Mutex::new(None),
                component_context: Mutex::new(None),
                store_context: Mutex::new(None),
            }),
        }
    }

    /// The application that created this context.
    pub fn app(&self) -> &App {
        &self.inner.app
    }

    /// Options the context was created with.
    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Attach a plugin to this context.
    ///
    /// Fails if the plugin has no name.
    pub fn plug<P: ContextPlugin>(&self, plugin: P) -> Result<(), FluxError> {
        if plugin.name().is_empty() {
            return Err(FluxError::PluginMissingName);
        }
        self.attach(Arc::new(plugin));
        Ok(())
    }

    pub(crate) fn attach(&self, plugin: Arc<dyn ContextPlugin>) {
        if let Some(hook) = plugin.execute_action_hook() {
            write(&self.inner.scope.hooks).push(hook);
        }
        debug!(plugin = plugin.name(), "context plugin attached");
        write(&self.inner.plugins).push(plugin);
    }

    /// Plugins attached to this context, in registration order.
    pub fn plugins(&self) -> Vec<Arc<dyn ContextPlugin>> {
        read(&self.inner.plugins).clone()
    }

    /// Find an attached plugin by name.
    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn ContextPlugin>> {
        read(&self.inner.plugins)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Get a store instance, creating the dispatcher instance if needed.
    pub fn get_store<S: Store>(&self) -> Result<StoreHandle<S>, FluxError> {
        self.dispatcher_instance().get_store::<S>()
    }

    fn dispatcher_instance(&self) -> Arc<DispatcherContext> {
        if let Some(dispatcher) = read(&self.inner.dispatcher).as_ref() {
            return dispatcher.clone();
        }
        let store_context = self.get_store_context();
        write(&self.inner.dispatcher)
            .get_or_insert_with(|| Arc::new(self.inner.app.create_dispatcher_instance(store_context)))
            .clone()
    }

    /// The interface actions run against. Built once, then shared.
    pub fn get_action_context(&self) -> ActionContext {
        let mut memo = lock(&self.inner.action_context);
        if let Some(action_context) = memo.as_ref() {
            return action_context.clone();
        }
        let mut action_context =
            ActionContext::root(self.inner.scope.clone(), self.dispatcher_instance());
        for plugin in self.plugins() {
            plugin.plug_action_context(&mut action_context, self);
        }
        *memo = Some(action_context.clone());
        action_context
    }

    /// The interface components run against. Built once, then shared.
    pub fn get_component_context(&self) -> ComponentContext {
        let mut memo = lock(&self.inner.component_context);
        if let Some(component_context) = memo.as_ref() {
            return component_context.clone();
        }
        let mut component_context = ComponentContext {
            action_context: self.get_action_context(),
            error_handler: self.inner.app.component_action_error_handler().clone(),
            members: Members::new(),
        };
        for plugin in self.plugins() {
            plugin.plug_component_context(&mut component_context, self);
        }
        *memo = Some(component_context.clone());
        component_context
    }

    /// The interface stores are created with. Built once, then shared.
    pub fn get_store_context(&self) -> StoreContext {
        let mut memo = lock(&self.inner.store_context);
        if let Some(store_context) = memo.as_ref() {
            return store_context.clone();
        }
        let mut store_context = StoreContext::default();
        for plugin in self.plugins() {
            plugin.plug_store_context(&mut store_context, self);
        }
        *memo = Some(store_context.clone());
        store_context
    }

    /// Run `action` as a new transaction.
    pub fn execute_action(&self, action: &Action, payload: Option<Value>) -> Promise<Value> {
        self.get_action_context().execute_action(action, payload)
    }

    /// Run `action` as a new transaction, also delivering the result to `done`.
    pub fn execute_action_with(
        &self,
        action: &Action,
        payload: Option<Value>,
        done: Callback<Value>,
    ) -> Promise<Value> {
        self.get_action_context()
            .execute_action_with(action, payload, done)
    }

    /// Timing log of this context (empty unless timing is enabled).
    pub fn timing_log(&self) -> &TimingLog {
        &self.inner.scope.timings
    }

    /// Recorded action timings, oldest first.
    pub fn action_timings(&self) -> Vec<ActionTiming> {
        self.inner.scope.timings.entries()
    }

    /// Serialize dispatcher and plugin state.
    pub fn dehydrate(&self) -> DehydratedContext {
        let dispatcher = read(&self.inner.dispatcher)
            .as_ref()
            .map(|d| d.dehydrate())
            .unwrap_or_else(empty_payload);
        let plugins = self
            .plugins()
            .iter()
            .filter_map(|p| p.dehydrate().map(|state| (p.name().to_string(), state)))
            .collect();
        let options = (self.inner.options != ContextOptions::default())
            .then(|| self.inner.options.clone());
        DehydratedContext {
            dispatcher,
            plugins,
            options,
        }
    }

    /// Restore state produced by [`Context::dehydrate`].
    ///
    /// Waits for every plugin with saved state to rehydrate, then replaces
    /// the dispatcher instance with one built from the saved store state.
    /// The action and component contexts are rebuilt on next access.
    pub async fn rehydrate(&self, state: Value) -> Result<Context, FluxError> {
        let state: ContextState = parse_state(state)?;
        let saved = state.plugins.unwrap_or_default();

        let tasks: Vec<_> = self
            .plugins()
            .into_iter()
            .filter_map(|plugin| {
                let plugin_state = saved.get(plugin.name())?.clone();
                Some((plugin.name().to_string(), plugin.rehydrate(plugin_state, self)))
            })
            .collect();
        let rehydrated = tasks.len();
        rehydrate_all(tasks).await?;

        let dispatcher = self
            .inner
            .app
            .create_dispatcher_instance(self.get_store_context());
        dispatcher.rehydrate(&state.dispatcher.unwrap_or_else(|| json!({})))?;
        *write(&self.inner.dispatcher) = Some(Arc::new(dispatcher));
        *lock(&self.inner.action_context) = None;
        *lock(&self.inner.component_context) = None;

        debug!(plugins = rehydrated, "context rehydrated");
        Ok(self.clone())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<String> = self.plugins().iter().map(|p| p.name().to_string()).collect();
        f.debug_struct("Context")
            .field("options", &self.inner.options)
            .field("plugins", &plugins)
            .field("dispatcher", &read(&self.inner.dispatcher).is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
