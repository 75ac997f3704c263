//! Local event emitter for modules.
//!
//! Events are local to one module instance and independent of the store.
//! Handlers are registered by event name and removed by the id returned at
//! registration time.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

type EventHandler = std::sync::Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registered handler, for later removal with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: u64,
    once: bool,
    handler: EventHandler,
}

/// An event emitter keyed by event name.
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<Registration>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event.
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.register(event, false, std::sync::Arc::new(handler))
    }

    /// Register a handler that fires at most once.
    pub fn once(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.register(event, true, std::sync::Arc::new(handler))
    }

    fn register(&self, event: &str, once: bool, handler: EventHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, handler });
        HandlerId(id)
    }

    /// Remove a handler. Returns whether it was still registered.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match handlers.get_mut(event) {
            Some(list) => {
                let before = list.len();
                list.retain(|reg| reg.id != id.0);
                list.len() != before
            }
            None => false,
        }
    }

    /// Emit an event to all registered handlers, in registration order.
    ///
    /// `once` handlers are dropped before their invocation, so a handler that
    /// re-emits the same event cannot fire itself twice. Handlers run outside
    /// the registry lock and may register or remove other handlers freely.
    pub fn emit(&self, event: &str, payload: &Value) {
        let to_call: Vec<EventHandler> = {
            let mut handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match handlers.get_mut(event) {
                Some(list) => {
                    let snapshot = list.iter().map(|reg| reg.handler.clone()).collect();
                    list.retain(|reg| !reg.once);
                    snapshot
                }
                None => return,
            }
        };
        for handler in to_call {
            handler(payload);
        }
    }
}
