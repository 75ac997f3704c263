//! Wire message types and timestamping for the proxy layer.
//!
//! Requests and responses are externally tagged by a `type` field; pushes
//! travel on their own channel and carry no tag. Everything crosses the
//! transport as `serde_json::Value`, so a malformed peer payload surfaces as
//! a parse failure at the consumer, never as a crash of the channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use trellis_core::{Action, TrellisError};

/// Request sent from the proxy client to the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RequestMessage {
    /// Invoke a method addressed by dotted path on the authoritative tree.
    #[serde(rename = "exec")]
    Exec {
        /// Correlation id. Assigned by the transport when the request is
        /// sent; 0 until then.
        #[serde(rename = "requestId", default)]
        request_id: u64,
        #[serde(rename = "functionPath")]
        function_path: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Ask for a full state snapshot.
    #[serde(rename = "sync")]
    Sync {
        #[serde(rename = "requestId", default)]
        request_id: u64,
    },
}

impl RequestMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            RequestMessage::Exec { request_id, .. } | RequestMessage::Sync { request_id } => {
                *request_id
            }
        }
    }
}

/// Reply sent from the proxy server, correlated by `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseMessage {
    #[serde(rename = "exec-response")]
    Exec {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<RemoteFault>,
    },
    #[serde(rename = "sync-response")]
    Sync {
        #[serde(rename = "requestId")]
        request_id: u64,
        state: Value,
        timestamp: u64,
    },
}

/// A server-side failure in transportable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: i32,
    pub message: String,
}

impl From<&TrellisError> for RemoteFault {
    fn from(err: &TrellisError) -> Self {
        Self {
            code: err.to_remote_code(),
            message: err.to_string(),
        }
    }
}

impl RemoteFault {
    /// Surface this fault to the caller's future.
    pub fn into_error(self) -> TrellisError {
        TrellisError::RemoteExecution {
            code: self.code,
            message: self.message,
        }
    }
}

/// A replicated action broadcast from the authoritative side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub action: Action,
    pub timestamp: u64,
}

/// Monotonic timestamp source for pushes and sync snapshots.
///
/// Timestamps are wall-clock milliseconds, bumped past the last handed-out
/// value when the clock stalls or steps backwards. Equal timestamps are
/// treated as "not newer" by the mirror side, so `now` (used for snapshots)
/// may repeat while `next` (used for pushes) is strictly increasing.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }

    /// A timestamp strictly greater than every previously issued one.
    pub fn next(&self) -> u64 {
        let wall = Self::wall_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = wall.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// The current logical time: never behind an issued timestamp, never
    /// ahead of the next push.
    pub fn now(&self) -> u64 {
        let wall = Self::wall_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = wall.max(last);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}
