//! Testing utilities for actions and components.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! fluxible = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Testing an Action
//!
//! ```ignore
//! use fluxible::testing::MockActionContext;
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.register_store::<CounterStore>()?;
//!
//! let ctx = MockActionContext::new(&dispatcher);
//! ctx.run(&increment, None).await?;
//!
//! assert_eq!(ctx.dispatch_calls()[0].event, "INCREMENT");
//! assert_eq!(ctx.get_store::<CounterStore>()?.lock().count, 1);
//! ```
//!
//! A mock context runs nested actions in itself instead of a new frame,
//! so their dispatches show up in the same call log.
//!
//! # Waiting for Callbacks
//!
//! ```ignore
//! let latch = CallbackLatch::new(2);
//! context.execute_action_with(&a, None, Box::new({ let l = latch.clone(); move |_| l.dec() }));
//! context.execute_action_with(&b, None, Box::new({ let l = latch.clone(); move |_| l.dec() }));
//! latch.await_zero().await;
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::action::Action;
use crate::context::{ActionContext, Scope, StoreContext};
use crate::dispatcher::{Dispatcher, DispatcherContext, Store, StoreHandle};
use crate::error::FluxError;
use crate::fatal::UnhandledErrors;
use crate::invoke::call_action;
use crate::timing::TimingLog;

/// One recorded `dispatch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCall {
    /// Event name.
    pub event: String,
    /// Payload as passed.
    pub payload: Value,
}

/// One recorded `execute_action` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteActionCall {
    /// Display name of the action.
    pub action_name: String,
    /// Payload as passed, before defaulting.
    pub payload: Option<Value>,
}

/// Call log shared by a mock context and every frame cloned from it.
#[derive(Debug, Default)]
pub(crate) struct CallRecorder {
    dispatches: Mutex<Vec<DispatchCall>>,
    executions: Mutex<Vec<ExecuteActionCall>>,
}

impl CallRecorder {
    pub(crate) fn record_dispatch(&self, event: &str, payload: &Value) {
        lock(&self.dispatches).push(DispatchCall {
            event: event.to_string(),
            payload: payload.clone(),
        });
    }

    pub(crate) fn record_execute(&self, action: &Action, payload: Option<&Value>) {
        lock(&self.executions).push(ExecuteActionCall {
            action_name: action.display_name().to_string(),
            payload: payload.cloned(),
        });
    }

    fn dispatches(&self) -> Vec<DispatchCall> {
        lock(&self.dispatches).clone()
    }

    fn executions(&self) -> Vec<ExecuteActionCall> {
        lock(&self.executions).clone()
    }
}

/// An [`ActionContext`] backed by a real dispatcher instance that records
/// every `dispatch` and `execute_action` call.
pub struct MockActionContext {
    action_context: ActionContext,
    recorder: Arc<CallRecorder>,
}

impl MockActionContext {
    /// Mock context over the stores registered on `dispatcher`.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self::with_store_context(dispatcher, StoreContext::default())
    }

    /// Mock context whose stores are created with `store_context`.
    pub fn with_store_context(dispatcher: &Dispatcher, store_context: StoreContext) -> Self {
        let recorder = Arc::new(CallRecorder::default());
        let mut scope = Scope::new(TimingLog::with_capacity(1), false, false, UnhandledErrors::new());
        scope.recorder = Some(recorder.clone());
        let dispatcher = Arc::new(dispatcher.create_context(store_context));
        Self {
            action_context: ActionContext::root(Arc::new(scope), dispatcher),
            recorder,
        }
    }

    /// Run `action` directly in this context.
    ///
    /// Unlike [`ActionContext::execute_action`] the call is not recorded.
    pub async fn run(&self, action: &Action, payload: Option<Value>) -> Result<Value, FluxError> {
        let payload = payload.unwrap_or_else(|| Value::Object(Map::new()));
        call_action(self.action_context.clone(), action.clone(), payload, None).await
    }

    /// Dispatch calls made so far, in order.
    pub fn dispatch_calls(&self) -> Vec<DispatchCall> {
        self.recorder.dispatches()
    }

    /// `execute_action` calls made so far, in order.
    pub fn execute_action_calls(&self) -> Vec<ExecuteActionCall> {
        self.recorder.executions()
    }
}

impl Deref for MockActionContext {
    type Target = ActionContext;

    fn deref(&self) -> &ActionContext {
        &self.action_context
    }
}

/// A component context that records `execute_action` calls without
/// running anything.
pub struct MockComponentContext {
    dispatcher: Arc<DispatcherContext>,
    recorder: Arc<CallRecorder>,
}

impl MockComponentContext {
    /// Mock context over the stores registered on `dispatcher`.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher.create_context(StoreContext::default())),
            recorder: Arc::new(CallRecorder::default()),
        }
    }

    /// Get a store instance.
    pub fn get_store<S: Store>(&self) -> Result<StoreHandle<S>, FluxError> {
        self.dispatcher.get_store::<S>()
    }

    /// Record the call.
    pub fn execute_action(&self, action: &Action, payload: Option<Value>) {
        self.recorder.record_execute(action, payload.as_ref());
    }

    /// `execute_action` calls made so far, in order.
    pub fn execute_action_calls(&self) -> Vec<ExecuteActionCall> {
        self.recorder.executions()
    }
}

/// Countdown for a known number of callbacks.
///
/// Clones share the same count.
#[derive(Clone)]
pub struct CallbackLatch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CallbackLatch {
    /// Create a latch expecting `expected` calls.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Count one call.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("CallbackLatch decremented below zero - more calls than expected");
        }
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait until every expected call happened.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking, or a notification could slip in between
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Calls still expected.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct CounterStore {
        count: i64,
    }

    impl Store for CounterStore {
        const NAME: &'static str = "CounterStore";
        const HANDLES: &'static [&'static str] = &["INCREMENT"];

        fn new(_context: &StoreContext) -> Self {
            Self::default()
        }

        fn handle(&mut self, _event: &str, _payload: &Value) -> anyhow::Result<()> {
            self.count += 1;
            Ok(())
        }
    }

    fn increment(ctx: &ActionContext, payload: Value) -> anyhow::Result<Value> {
        ctx.dispatch("INCREMENT", payload)?;
        Ok(Value::Null)
    }

    #[tokio::test]
    async fn test_mock_records_dispatches() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_store::<CounterStore>().unwrap();
        let ctx = MockActionContext::new(&dispatcher);

        ctx.run(&Action::sync(increment), Some(json!({ "by": 1 })))
            .await
            .unwrap();

        assert_eq!(
            ctx.dispatch_calls(),
            vec![DispatchCall {
                event: "INCREMENT".into(),
                payload: json!({ "by": 1 }),
            }]
        );
        assert!(ctx.execute_action_calls().is_empty());
        assert_eq!(ctx.get_store::<CounterStore>().unwrap().lock().count, 1);
    }

    #[tokio::test]
    async fn test_mock_records_nested_executions_in_same_log() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_store::<CounterStore>().unwrap();
        let ctx = MockActionContext::new(&dispatcher);

        let parent = Action::future(|ctx: ActionContext, _payload| async move {
            ctx.execute_action(&Action::sync(increment), None).await?;
            Ok::<_, anyhow::Error>(Value::Null)
        })
        .named("parent");

        ctx.run(&parent, None).await.unwrap();

        let executions = ctx.execute_action_calls();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].action_name, "increment");
        assert_eq!(executions[0].payload, None);
        assert_eq!(ctx.dispatch_calls()[0].payload, json!({}));
    }

    #[test]
    fn test_mock_component_records_only() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_store::<CounterStore>().unwrap();
        let ctx = MockComponentContext::new(&dispatcher);

        ctx.execute_action(&Action::sync(increment), Some(json!(3)));

        assert_eq!(ctx.execute_action_calls()[0].payload, Some(json!(3)));
        assert_eq!(ctx.get_store::<CounterStore>().unwrap().lock().count, 0);
    }

    #[tokio::test]
    async fn test_latch_releases_at_zero() {
        let latch = CallbackLatch::new(2);
        let waiter = tokio::spawn({
            let latch = latch.clone();
            async move { latch.await_zero().await }
        });
        latch.dec();
        assert_eq!(latch.remaining(), 1);
        latch.dec();
        waiter.await.unwrap();
        assert_eq!(latch.remaining(), 0);
    }
}
