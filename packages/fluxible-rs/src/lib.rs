//! # Fluxible
//!
//! An isomorphic flux application container: per-request context isolation,
//! tracked action execution, plugins, and server-to-client state transfer.
//!
//! ## Core Concepts
//!
//! - [`App`] = the process-wide container (component, stores, plugins)
//! - [`Context`] = one request or session; owns its store instances
//! - [`Action`] = application logic, run against an [`ActionContext`]
//! - [`Store`] = per-context state, changed only by dispatched events
//!
//! ## Architecture
//!
//! ```text
//! App ──create_context()──► Context ──────────────────────────┐
//!                              │                              │
//!                              ├─► ActionContext              │
//!                              │     ├─ execute_action() ─► frame ─► Action
//!                              │     │                              │
//!                              │     └─ dispatch() ◄────────────────┘
//!                              │            │
//!                              │            ▼
//!                              ├─► DispatcherContext ─► Store, Store, ..
//!                              │
//!                              ├─► ComponentContext (errors ─► error handler)
//!                              └─► StoreContext
//!
//! server: app.dehydrate(&context) ──JSON──► client: app.rehydrate(state)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Actions never run inline** - on the required `current_thread` runtime the body
//!    only starts once the caller yields; other runtimes get [`FluxError::UnsupportedRuntime`]
//! 2. **Frames are copies** - each action sees its own call stack; parents are untouched
//! 3. **One root id per transaction** - nested actions inherit it, root calls draw a new one
//! 4. **Contexts are isolated** - no store instance is shared between contexts
//! 5. **Errors always land somewhere** - the caller, the component error handler,
//!    or [`UnhandledErrors`]
//!
//! ## Runtime
//!
//! Fluxible needs tokio's `current_thread` runtime: `#[tokio::main(flavor =
//! "current_thread")]` or `tokio::runtime::Builder::new_current_thread()`.
//!
//! ## Example
//!
//! ```ignore
//! use fluxible::{Action, ActionContext, App, ContextOptions, Store, StoreContext};
//! use serde_json::{json, Value};
//!
//! #[derive(Default)]
//! struct CounterStore { count: i64 }
//!
//! impl Store for CounterStore {
//!     const NAME: &'static str = "CounterStore";
//!     const HANDLES: &'static [&'static str] = &["INCREMENT"];
//!
//!     fn new(_: &StoreContext) -> Self { Self::default() }
//!
//!     fn handle(&mut self, _event: &str, _payload: &Value) -> anyhow::Result<()> {
//!         self.count += 1;
//!         Ok(())
//!     }
//!
//!     fn dehydrate(&self) -> Option<Value> { Some(json!({ "count": self.count })) }
//!
//!     fn rehydrate(&mut self, state: Value) -> anyhow::Result<()> {
//!         self.count = state["count"].as_i64().unwrap_or_default();
//!         Ok(())
//!     }
//! }
//!
//! fn increment(ctx: &ActionContext, _payload: Value) -> anyhow::Result<Value> {
//!     ctx.dispatch("INCREMENT", json!({}))?;
//!     Ok(Value::Null)
//! }
//!
//! let app = App::new();
//! app.register_store::<CounterStore>()?;
//!
//! let context = app.create_context(ContextOptions::new());
//! context.execute_action(&Action::sync(increment), None).await?;
//!
//! let state = serde_json::to_value(app.dehydrate(&context))?;
//! let restored = app.rehydrate(state, None).await?;
//! assert_eq!(restored.get_store::<CounterStore>()?.lock().count, 1);
//! ```

// Core modules
mod action;
mod app;
mod bridge;
mod config;
mod context;
mod dispatcher;
mod error;
mod fatal;
mod id;
mod invoke;
mod members;
mod plugin;
mod timing;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export application types (primary entry point)
pub use app::{App, AppBuilder, Component, DehydratedApp};

// Re-export context types
pub use context::{
    ActionContext, ActionStack, ComponentContext, Context, ContextOptions, DehydratedContext,
    ExecuteAction, StoreContext,
};

// Re-export action types
pub use action::{Action, ActionKind, ActionOutput, Done};

// Re-export store types
pub use dispatcher::{
    CurrentDispatch, Dispatcher, DispatcherContext, Store, StoreHandle, ALL_EVENTS,
};

// Re-export plugin types
pub use plugin::{AppPlugin, ContextPlugin, ExecuteActionHook, Rehydrate};

// Re-export promise/callback bridge
pub use bridge::{promise_callback, settled, spawn, Callback, CallbackOptions, Promise};

// Re-export error types
pub use error::{FluxError, UnhandledError};
pub use fatal::{UnhandledErrors, UnhandledHook};

// Re-export supporting types
pub use config::Config;
pub use id::{RootId, MAX_ROOT_ID};
pub use members::Members;
pub use timing::{ActionTiming, TimingLog, DEFAULT_TIMING_CAPACITY};
