//! Store dispatcher: routes named events to per-context store instances.
//!
//! The [`Dispatcher`] is the per-application registry of store types. Each
//! context gets its own [`DispatcherContext`] from it, holding that
//! context's store instances, so two requests never share store state.
//!
//! ```text
//! App ── Dispatcher (store registry, shared)
//!          │
//!          ├─► create_context() ─► DispatcherContext (request A) ─► stores
//!          └─► create_context() ─► DispatcherContext (request B) ─► stores
//! ```
//!
//! Stores are created lazily on first access or first event they handle,
//! except that rehydrating creates every store the saved state names.
//! `dispatch` is synchronous: every handler has run before it returns.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Default)]
//! struct CounterStore { count: i64 }
//!
//! impl Store for CounterStore {
//!     const NAME: &'static str = "CounterStore";
//!     const HANDLES: &'static [&'static str] = &["INCREMENT"];
//!
//!     fn new(_ctx: &StoreContext) -> Self { Self::default() }
//!
//!     fn handle(&mut self, _event: &str, _payload: &Value) -> anyhow::Result<()> {
//!         self.count += 1;
//!         Ok(())
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::context::StoreContext;
use crate::error::FluxError;

/// Event name that matches every dispatched event in [`Store::HANDLES`].
pub const ALL_EVENTS: &str = "*";

/// A per-context unit of state that reacts to dispatched events.
pub trait Store: Send + 'static {
    /// Name used for lookup and as the key of the store's dehydrated state.
    const NAME: &'static str;

    /// Events this store handles. [`ALL_EVENTS`] matches everything.
    const HANDLES: &'static [&'static str];

    /// Create the store for one context.
    fn new(context: &StoreContext) -> Self
    where
        Self: Sized;

    /// React to a dispatched event.
    fn handle(&mut self, event: &str, payload: &Value) -> anyhow::Result<()>;

    /// State to carry over to another runtime. `None` skips the store.
    fn dehydrate(&self) -> Option<Value> {
        None
    }

    /// Restore state produced by [`Store::dehydrate`].
    fn rehydrate(&mut self, state: Value) -> anyhow::Result<()> {
        let _ = state;
        Ok(())
    }
}

/// Type-erased store instance.
trait AnyStore: Send + Sync {
    fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()>;
    fn dehydrate(&self) -> Option<Value>;
    fn rehydrate(&self, state: Value) -> anyhow::Result<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct StoreCell<S>(Mutex<S>);

impl<S> StoreCell<S> {
    // A store that panicked mid-handler keeps serving; its state is whatever the handler left.
    fn lock(&self) -> MutexGuard<'_, S> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: Store> AnyStore for StoreCell<S> {
    fn handle(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        self.lock().handle(event, payload)
    }

    fn dehydrate(&self) -> Option<Value> {
        self.lock().dehydrate()
    }

    fn rehydrate(&self, state: Value) -> anyhow::Result<()> {
        self.lock().rehydrate(state)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Locked access to a store instance.
pub struct StoreHandle<S> {
    cell: Arc<StoreCell<S>>,
}

impl<S: Store> StoreHandle<S> {
    /// Lock the store. Do not hold the guard across a dispatch that reaches this store.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.cell.lock()
    }

    /// Run `f` against the store.
    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.cell.lock())
    }
}

impl<S> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<S> fmt::Debug for StoreHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store", &std::any::type_name::<S>())
            .finish()
    }
}

type CreateStore = fn(&StoreContext) -> Arc<dyn AnyStore>;

#[derive(Clone)]
struct StoreDescriptor {
    name: &'static str,
    type_id: TypeId,
    handles: &'static [&'static str],
    create: CreateStore,
}

impl StoreDescriptor {
    fn of<S: Store>() -> Self {
        Self {
            name: S::NAME,
            type_id: TypeId::of::<S>(),
            handles: S::HANDLES,
            create: create_store::<S>,
        }
    }

    fn handles(&self, event: &str) -> bool {
        self.handles.iter().any(|h| *h == event || *h == ALL_EVENTS)
    }
}

fn create_store<S: Store>(context: &StoreContext) -> Arc<dyn AnyStore> {
    Arc::new(StoreCell(Mutex::new(S::new(context))))
}

/// Application-wide store registry.
#[derive(Default)]
pub struct Dispatcher {
    stores: RwLock<Vec<StoreDescriptor>>,
}

impl Dispatcher {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store type.
    ///
    /// Registering the same type twice is a no-op. Registering a different
    /// type under an existing name fails.
    pub fn register_store<S: Store>(&self) -> Result<(), FluxError> {
        let mut stores = self
            .stores
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = stores.iter().find(|d| d.name == S::NAME) {
            if existing.type_id == TypeId::of::<S>() {
                return Ok(());
            }
            return Err(FluxError::StoreAlreadyRegistered { name: S::NAME });
        }
        debug!(store = S::NAME, handles = ?S::HANDLES, "registered store");
        stores.push(StoreDescriptor::of::<S>());
        Ok(())
    }

    /// Names of registered stores, in registration order.
    pub fn store_names(&self) -> Vec<&'static str> {
        self.stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|d| d.name)
            .collect()
    }

    /// Create the dispatcher instance for one context.
    ///
    /// Sees the stores registered at the time of the call.
    pub fn create_context(&self, store_context: StoreContext) -> DispatcherContext {
        let descriptors = self
            .stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        DispatcherContext {
            descriptors,
            store_context,
            instances: DashMap::new(),
            current: Mutex::new(None),
            serial: Mutex::new(()),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stores", &self.store_names())
            .finish()
    }
}

/// The event currently being delivered to stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentDispatch {
    /// Event name.
    pub event: String,
    thread: ThreadId,
}

/// Per-context dispatcher holding that context's store instances.
pub struct DispatcherContext {
    descriptors: Vec<StoreDescriptor>,
    store_context: StoreContext,
    instances: DashMap<&'static str, Arc<dyn AnyStore>>,
    current: Mutex<Option<CurrentDispatch>>,
    /// Serializes dispatches from different threads.
    serial: Mutex<()>,
}

impl DispatcherContext {
    /// The store context stores of this instance are created with.
    pub fn store_context(&self) -> &StoreContext {
        &self.store_context
    }

    /// The event being dispatched right now, if any.
    pub fn current_dispatch(&self) -> Option<CurrentDispatch> {
        lock_recover(&self.current).clone()
    }

    /// Deliver `event` to every store that handles it, in registration order.
    ///
    /// Stops at the first failing handler. Calling `dispatch` from inside a
    /// handler of this dispatcher fails with [`FluxError::CascadingDispatch`].
    pub fn dispatch(&self, event: &str, payload: &Value) -> Result<(), FluxError> {
        if event.is_empty() {
            return Err(FluxError::InvalidEvent);
        }
        if let Some(current) = self.current_dispatch() {
            if current.thread == thread::current().id() {
                return Err(FluxError::CascadingDispatch {
                    event: event.to_string(),
                    current: current.event,
                });
            }
        }

        let _serial = lock_recover(&self.serial);
        let _current = CurrentGuard::enter(&self.current, event);

        let targets: Vec<_> = self
            .descriptors
            .iter()
            .filter(|d| d.handles(event))
            .collect();
        if targets.is_empty() {
            debug!(event, "no store handles event");
            return Ok(());
        }

        for descriptor in targets {
            let store = self.instance(descriptor)?;
            store
                .handle(event, payload)
                .map_err(|cause| FluxError::StoreHandler {
                    store: descriptor.name,
                    event: event.to_string(),
                    cause: Arc::new(cause),
                })?;
        }
        Ok(())
    }

    /// Get this context's instance of store `S`, creating it if needed.
    pub fn get_store<S: Store>(&self) -> Result<StoreHandle<S>, FluxError> {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.type_id == TypeId::of::<S>())
            .ok_or(FluxError::StoreNotRegistered { name: S::NAME })?;
        let store = self.instance(descriptor)?;
        let cell = store
            .into_any()
            .downcast::<StoreCell<S>>()
            .map_err(|_| FluxError::StoreNotRegistered { name: S::NAME })?;
        Ok(StoreHandle { cell })
    }

    /// Returns true if a store with this name is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name == name)
    }

    /// State of every created store that persists something.
    ///
    /// Shape: `{"stores": {<name>: <state>}}`.
    pub fn dehydrate(&self) -> Value {
        let mut stores = Map::new();
        for descriptor in &self.descriptors {
            let state = self
                .instances
                .get(descriptor.name)
                .map(|s| s.clone())
                .and_then(|store| store.dehydrate());
            if let Some(state) = state {
                stores.insert(descriptor.name.to_string(), state);
            }
        }
        json!({ "stores": stores })
    }

    /// Restore state produced by [`DispatcherContext::dehydrate`].
    ///
    /// Every registered store named in `state` is created (if needed) and
    /// rehydrated now, so a store that rejects its state fails this call
    /// with [`FluxError::StoreRehydrate`]. A newly created store that fails
    /// is not kept.
    pub fn rehydrate(&self, state: &Value) -> Result<(), FluxError> {
        let Some(stores) = state.get("stores").and_then(Value::as_object) else {
            return Ok(());
        };
        for (name, store_state) in stores {
            let Some(descriptor) = self.descriptors.iter().find(|d| d.name == name) else {
                warn!(store = %name, "dehydrated state for unregistered store ignored");
                continue;
            };
            let rehydrate = |store: &Arc<dyn AnyStore>| {
                store
                    .rehydrate(store_state.clone())
                    .map_err(|cause| FluxError::StoreRehydrate {
                        store: descriptor.name,
                        cause: Arc::new(cause),
                    })
            };
            match self.instances.get(descriptor.name).map(|s| s.clone()) {
                Some(store) => rehydrate(&store)?,
                None => {
                    let created = (descriptor.create)(&self.store_context);
                    rehydrate(&created)?;
                    self.instances.entry(descriptor.name).or_insert(created);
                }
            }
            debug!(store = descriptor.name, "rehydrated store");
        }
        Ok(())
    }

    fn instance(&self, descriptor: &StoreDescriptor) -> Result<Arc<dyn AnyStore>, FluxError> {
        if let Some(store) = self.instances.get(descriptor.name) {
            return Ok(store.clone());
        }

        // Create outside the map lock so store constructors may look up other stores
        let created = (descriptor.create)(&self.store_context);
        let store = self
            .instances
            .entry(descriptor.name)
            .or_insert(created)
            .clone();
        Ok(store)
    }
}

impl fmt::Debug for DispatcherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let created: Vec<_> = self.instances.iter().map(|e| *e.key()).collect();
        f.debug_struct("DispatcherContext")
            .field("stores", &self.descriptors.iter().map(|d| d.name).collect::<Vec<_>>())
            .field("created", &created)
            .field("current", &self.current_dispatch())
            .finish()
    }
}

/// Marks an event as in flight for the guard's lifetime.
struct CurrentGuard<'a> {
    slot: &'a Mutex<Option<CurrentDispatch>>,
}

impl<'a> CurrentGuard<'a> {
    fn enter(slot: &'a Mutex<Option<CurrentDispatch>>, event: &str) -> Self {
        *lock_recover(slot) = Some(CurrentDispatch {
            event: event.to_string(),
            thread: thread::current().id(),
        });
        Self { slot }
    }
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        *lock_recover(self.slot) = None;
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
