//! Abstract transport contract and request correlation machinery.
//!
//! The transport is supplied by the embedding environment; only its contract
//! is fixed here. Delivery is asynchronous with no ordering guarantee, which
//! is why responses are matched by correlation id and state updates carry
//! timestamps. [`ChannelTransport`] is the in-memory implementation used by
//! tests and demos; physical transports (sockets, frame embedding) are out of
//! scope.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use trellis_core::{ProxyConfig, Result, TrellisError};

/// Bidirectional channel between the two proxy ends.
///
/// Payloads cross this boundary as raw JSON values; the consumer parses them
/// and drops what it cannot parse. Implementations correlate `request` with
/// its response through the `requestId` field they inject into the payload.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send an execution or sync request and await the correlated response.
    async fn request(&self, payload: Value) -> Result<Value>;

    /// Send a reply, correlated by the `requestId` inside `payload`.
    fn respond(&self, payload: Value) -> Result<()>;

    /// One-way broadcast of a replicated action.
    fn push(&self, payload: Value) -> Result<()>;

    /// Take the inbound request stream. Yields `Some` exactly once; the
    /// proxy server is the single consumer.
    fn incoming_requests(&self) -> Option<mpsc::UnboundedReceiver<Value>>;

    /// Take the inbound push stream. Yields `Some` exactly once; the proxy
    /// client is the single consumer.
    fn incoming_pushes(&self) -> Option<mpsc::UnboundedReceiver<Value>>;
}

/// Outstanding request table: correlation ids, response slots, and the
/// timeout that bounds every call.
///
/// An entry lives from request send until its response arrives or the timeout
/// fires; it is removed in both cases, so a late response finds no entry and
/// is dropped without effect.
pub struct PendingRequests {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    timeout: Duration,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::with_timeout(ProxyConfig::REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Allocate a correlation id and the slot its response will land in.
    pub fn register(&self) -> (u64, oneshot::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        (id, rx)
    }

    /// Await the response for a registered id, bounded by the timeout.
    pub async fn wait(&self, id: u64, rx: oneshot::Receiver<Value>) -> Result<Value> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                self.remove(id);
                Err(TrellisError::ChannelClosed)
            }
            Err(_) => {
                self.remove(id);
                debug!(request_id = id, "request timed out, entry removed");
                Err(TrellisError::RemoteTimeout(self.timeout))
            }
        }
    }

    /// Resolve an outstanding request. A response for an id that timed out or
    /// was never issued is a no-op.
    pub fn complete(&self, id: u64, payload: Value) -> bool {
        let slot = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match slot {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!(request_id = id, "dropping response for unknown request");
                false
            }
        }
    }

    fn remove(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Number of outstanding requests.
    pub fn outstanding(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// In-memory duplex transport backed by tokio channels.
///
/// `pair()` wires two endpoints together: one endpoint's sends arrive on the
/// other's inbound streams. Must be created inside a tokio runtime (each
/// endpoint spawns a response-routing task).
pub struct ChannelTransport {
    peer_requests: mpsc::UnboundedSender<Value>,
    peer_responses: mpsc::UnboundedSender<Value>,
    peer_pushes: mpsc::UnboundedSender<Value>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    pushes_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    pending: Arc<PendingRequests>,
    router: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelTransport {
    /// Create two connected endpoints with the default request timeout.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::pair_with_timeout(ProxyConfig::REQUEST_TIMEOUT)
    }

    /// Create two connected endpoints with a custom request timeout.
    pub fn pair_with_timeout(timeout: Duration) -> (Arc<Self>, Arc<Self>) {
        let (a_req_tx, a_req_rx) = mpsc::unbounded_channel();
        let (a_resp_tx, a_resp_rx) = mpsc::unbounded_channel();
        let (a_push_tx, a_push_rx) = mpsc::unbounded_channel();
        let (b_req_tx, b_req_rx) = mpsc::unbounded_channel();
        let (b_resp_tx, b_resp_rx) = mpsc::unbounded_channel();
        let (b_push_tx, b_push_rx) = mpsc::unbounded_channel();

        let a = Self::endpoint(b_req_tx, b_resp_tx, b_push_tx, a_req_rx, a_resp_rx, a_push_rx, timeout);
        let b = Self::endpoint(a_req_tx, a_resp_tx, a_push_tx, b_req_rx, b_resp_rx, b_push_rx, timeout);
        (a, b)
    }

    fn endpoint(
        peer_requests: mpsc::UnboundedSender<Value>,
        peer_responses: mpsc::UnboundedSender<Value>,
        peer_pushes: mpsc::UnboundedSender<Value>,
        requests_rx: mpsc::UnboundedReceiver<Value>,
        responses_rx: mpsc::UnboundedReceiver<Value>,
        pushes_rx: mpsc::UnboundedReceiver<Value>,
        timeout: Duration,
    ) -> Arc<Self> {
        let pending = Arc::new(PendingRequests::with_timeout(timeout));
        let router = tokio::spawn(Self::route_responses(pending.clone(), responses_rx));
        Arc::new(Self {
            peer_requests,
            peer_responses,
            peer_pushes,
            requests_rx: Mutex::new(Some(requests_rx)),
            pushes_rx: Mutex::new(Some(pushes_rx)),
            pending,
            router: Mutex::new(Some(router)),
        })
    }

    async fn route_responses(
        pending: Arc<PendingRequests>,
        mut responses: mpsc::UnboundedReceiver<Value>,
    ) {
        while let Some(payload) = responses.recv().await {
            match payload.get("requestId").and_then(Value::as_u64) {
                Some(id) => {
                    pending.complete(id, payload);
                }
                None => warn!("dropping response without requestId"),
            }
        }
    }

    /// Outstanding request count, exposed for tests.
    pub fn outstanding(&self) -> usize {
        self.pending.outstanding()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if let Some(router) = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            router.abort();
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn request(&self, mut payload: Value) -> Result<Value> {
        let (id, rx) = self.pending.register();
        match payload.as_object_mut() {
            Some(object) => {
                object.insert("requestId".to_string(), id.into());
            }
            None => {
                self.pending.remove(id);
                return Err(TrellisError::Json {
                    message: "request payload must be a JSON object".to_string(),
                    source: None,
                });
            }
        }
        if self.peer_requests.send(payload).is_err() {
            self.pending.remove(id);
            return Err(TrellisError::ChannelClosed);
        }
        self.pending.wait(id, rx).await
    }

    fn respond(&self, payload: Value) -> Result<()> {
        self.peer_responses
            .send(payload)
            .map_err(|_| TrellisError::ChannelClosed)
    }

    fn push(&self, payload: Value) -> Result<()> {
        self.peer_pushes
            .send(payload)
            .map_err(|_| TrellisError::ChannelClosed)
    }

    fn incoming_requests(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.requests_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn incoming_pushes(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.pushes_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
