//! Reducer-driven state container and the awaitable handle modules bind to.
//!
//! The store holds one JSON value mutated only by synchronous, full reducer
//! application. There is a single writer path (`dispatch`) and many readers;
//! dispatches are serialized internally so subscribers observe a consistent
//! old/new pair.

use crate::action::Action;
use crate::config::ModuleConfig;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;

/// A pure state transition: `(previous state, action) -> next state`.
///
/// `None` input means the store is being seeded and the reducer should return
/// its initial state.
pub type Reducer = Arc<dyn Fn(Option<&Value>, &Action) -> Value + Send + Sync>;

type ChangeListener = Arc<dyn Fn(&Value, &Value) + Send + Sync>;
type ActionTap = Arc<dyn Fn(&Action) + Send + Sync>;

/// Pass-through reducer used by modules without their own state.
///
/// Seeds to an empty object and returns every other input unchanged,
/// ignoring all actions.
pub fn default_reducer() -> Reducer {
    Arc::new(|state, _action| match state {
        Some(value) => value.clone(),
        None => Value::Object(serde_json::Map::new()),
    })
}

/// Identifies one state subscriber, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Reducer-driven state container.
pub struct Store {
    reducer: Reducer,
    state: RwLock<Value>,
    next_sub: AtomicU64,
    subscribers: Mutex<Vec<(u64, ChangeListener)>>,
    taps: Mutex<Vec<ActionTap>>,
    dispatch_lock: Mutex<()>,
}

impl Store {
    /// Create a store, seeding its state through the reducer.
    pub fn new(reducer: Reducer) -> Arc<Self> {
        let initial = reducer(None, &Action::new(ModuleConfig::INIT_ACTION));
        Arc::new(Self {
            reducer,
            state: RwLock::new(initial),
            next_sub: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            taps: Mutex::new(Vec::new()),
            dispatch_lock: Mutex::new(()),
        })
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> Value {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply an action through the reducer.
    ///
    /// Change subscribers fire only when the state actually changed; action
    /// taps fire for every dispatch. Both run on the dispatching thread after
    /// the internal lock is released, so a listener may itself dispatch.
    pub fn dispatch(&self, action: Action) {
        let (old, new, listeners, taps) = {
            let _serialize = self
                .dispatch_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let old = self.state();
            let new = (self.reducer)(Some(&old), &action);
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = new.clone();

            let listeners: Vec<ChangeListener> = if old != new {
                self.subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect()
            } else {
                Vec::new()
            };
            let taps: Vec<ActionTap> = self
                .taps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect();
            (old, new, listeners, taps)
        };

        for listener in listeners {
            listener(&old, &new);
        }
        for tap in taps {
            tap(&action);
        }
    }

    /// Subscribe to state changes with an `(old, new)` callback.
    pub fn subscribe(&self, listener: impl Fn(&Value, &Value) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    /// Remove a state subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id.0);
        subscribers.len() != before
    }

    /// Observe every dispatched action, after reduction.
    ///
    /// This is the replication hook: the proxy server forwards each observed
    /// action to its transport.
    pub fn tap_actions(&self, tap: impl Fn(&Action) + Send + Sync + 'static) {
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(tap));
    }
}

/// Create a linked resolver/promise pair for deferred store binding.
///
/// Modules are constructed before the store exists (the store's reducer is
/// assembled from the module tree), so they receive a `StorePromise` and bind
/// once `StoreResolver::resolve` runs. The promise may never resolve, in which
/// case bound-state access keeps failing and init routines never run.
pub fn store_channel() -> (StoreResolver, StorePromise) {
    let (tx, rx) = watch::channel(None::<Arc<Store>>);
    (StoreResolver { tx }, StorePromise { rx })
}

/// Fulfilling end of a [`store_channel`] pair.
pub struct StoreResolver {
    tx: watch::Sender<Option<Arc<Store>>>,
}

impl StoreResolver {
    /// Resolve every outstanding and future [`StorePromise`] clone.
    pub fn resolve(self, store: Arc<Store>) {
        let _ = self.tx.send(Some(store));
    }
}

/// Awaitable handle to a store that may not exist yet.
#[derive(Clone)]
pub struct StorePromise {
    rx: watch::Receiver<Option<Arc<Store>>>,
}

impl StorePromise {
    /// Suspend until the store resolves.
    ///
    /// Never completes if the resolver was dropped without resolving; that is
    /// the "permanently unbound" lifecycle from the module contract.
    pub async fn resolved(&self) -> Arc<Store> {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(store) = current {
                return store;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Current store, if already resolved. Never suspends.
    pub fn try_get(&self) -> Option<Arc<Store>> {
        self.rx.borrow().clone()
    }
}
