//! Proxy client: a structurally identical mirror of the server's module tree.
//!
//! The client instantiates the same tree locally so submodule names and
//! method signatures match the server exactly, then switches the whole tree
//! into proxied mode: tagged methods redirect into execution requests, init
//! routines stay suppressed (the authoritative side already ran them), and
//! the mirrored state is kept current by a one-time full sync plus
//! watermark-gated application of replicated pushes.

use crate::message::{PushMessage, RequestMessage, ResponseMessage};
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trellis_core::{
    Action, Module, ModuleConfig, ProxyConfig, Reducer, RemoteDispatcher, Result, Store,
    TrellisError,
};

/// Turns proxied method calls into execution requests on the transport.
struct TransportRemote {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl RemoteDispatcher for TransportRemote {
    async fn dispatch(&self, function_path: &str, args: Vec<Value>) -> Result<Value> {
        let request = RequestMessage::Exec {
            request_id: 0,
            function_path: function_path.to_string(),
            args,
        };
        let response = self.transport.request(serde_json::to_value(&request)?).await?;
        match serde_json::from_value::<ResponseMessage>(response)? {
            ResponseMessage::Exec { result, error, .. } => match error {
                Some(fault) => Err(fault.into_error()),
                None => Ok(result.unwrap_or(Value::Null)),
            },
            ResponseMessage::Sync { .. } => Err(TrellisError::Json {
                message: "unexpected sync response to an exec request".to_string(),
                source: None,
            }),
        }
    }
}

/// Wrap the mirrored reducer so a sync snapshot replaces the state wholesale.
fn client_reducer(inner: Reducer) -> Reducer {
    Arc::new(move |state, action| {
        if action.kind == ProxyConfig::SYNC_ACTION {
            return action.payload.clone();
        }
        inner(state, action)
    })
}

/// Handle to a running proxy client. Dropping stops push application.
pub struct ProxyClient {
    module: Module,
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    watermark: Arc<AtomicU64>,
    push_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyClient {
    /// Mirror `module` over `transport`.
    ///
    /// Fails with [`TrellisError::TransportRequired`] when no transport is
    /// supplied. The tree is marked proxied and init-suppressed before its
    /// store binds, so nothing runs locally; the first sync is issued as the
    /// client's own startup routine. It always applies: snapshot timestamps
    /// exceed the initial zero watermark, and pushes stay buffered on the
    /// transport until the baseline snapshot has landed (delivery is
    /// unordered, so a push stamped after the snapshot can arrive first).
    pub async fn start(
        module: Module,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self> {
        let transport = transport.ok_or(TrellisError::TransportRequired)?;
        module.assign_root(ModuleConfig::DEFAULT_ROOT_LABEL)?;
        module.enter_proxied_mode(Arc::new(TransportRemote {
            transport: transport.clone(),
        }));

        let store = Store::new(client_reducer(module.combined_reducer()));
        module.bind_store(store.clone()).await?;

        let watermark = Arc::new(AtomicU64::new(0));
        let pushes = transport.incoming_pushes().ok_or_else(|| {
            TrellisError::config("transport push stream already taken")
        })?;

        let client = Self {
            module,
            store,
            transport,
            watermark,
            push_task: Mutex::new(None),
        };
        client.resync().await?;

        // Drain pushes only now that the baseline is in place.
        let push_task = tokio::spawn(Self::push_loop(
            client.store.clone(),
            client.watermark.clone(),
            pushes,
        ));
        *client
            .push_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(push_task);
        info!(
            tree = %client.module.path().unwrap_or_default(),
            "proxy client started"
        );
        Ok(client)
    }

    /// Request a full state snapshot and apply it if it is newer than
    /// everything applied so far.
    ///
    /// Called once at startup; callable again to re-establish baseline state.
    pub async fn resync(&self) -> Result<()> {
        let request = serde_json::to_value(&RequestMessage::Sync { request_id: 0 })?;
        let response = self.transport.request(request).await?;
        match serde_json::from_value::<ResponseMessage>(response)? {
            ResponseMessage::Sync {
                state, timestamp, ..
            } => {
                if !advance_watermark(&self.watermark, timestamp) {
                    debug!(timestamp, "discarding stale sync snapshot");
                    return Ok(());
                }
                self.store
                    .dispatch(Action::with_payload(ProxyConfig::SYNC_ACTION, state));
                Ok(())
            }
            ResponseMessage::Exec { .. } => Err(TrellisError::Json {
                message: "unexpected exec response to a sync request".to_string(),
                source: None,
            }),
        }
    }

    async fn push_loop(
        store: Arc<Store>,
        watermark: Arc<AtomicU64>,
        mut pushes: mpsc::UnboundedReceiver<Value>,
    ) {
        while let Some(payload) = pushes.recv().await {
            let push: PushMessage = match serde_json::from_value(payload) {
                Ok(push) => push,
                Err(err) => {
                    warn!("dropping malformed push: {err}");
                    continue;
                }
            };
            if !advance_watermark(&watermark, push.timestamp) {
                debug!(timestamp = push.timestamp, "discarding stale push");
                continue;
            }
            store.dispatch(push.action);
        }
        debug!("push stream closed, proxy client loop exiting");
    }

    /// The mirrored module tree.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Submodule attached under `name`, addressed exactly as on the server.
    pub fn child(&self, name: &str) -> Option<Module> {
        self.module.child(name)
    }

    /// Submodules in attach order.
    pub fn children(&self) -> Vec<(String, Module)> {
        self.module.children()
    }

    /// The mirrored store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Timestamp of the last applied state update.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Stop applying pushes. Outstanding remote calls keep their timeouts.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .push_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Advance the watermark to `timestamp` if it is strictly newer.
///
/// Returns false for stale or duplicate timestamps, which the caller
/// discards silently.
fn advance_watermark(watermark: &AtomicU64, timestamp: u64) -> bool {
    let mut current = watermark.load(Ordering::SeqCst);
    loop {
        if timestamp <= current {
            return false;
        }
        match watermark.compare_exchange(current, timestamp, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}
