//! Error types for the Trellis module framework.
//!
//! A single enum covers both the local module/tree lifecycle and the proxy
//! layer, so errors can cross the crate boundary without wrapping. Remote-side
//! failures are mapped to numeric codes for the wire (JSON-RPC style bands).

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Trellis framework.
#[derive(Debug, Error)]
pub enum TrellisError {
    // Construction errors
    #[error("Invalid module configuration: {message}")]
    Config { message: String },

    // Tree composition errors
    #[error("Module composition error: {message}")]
    Scope { message: String },

    #[error("Module '{name}' already exists on this parent")]
    DuplicateModule { name: String },

    // Lifecycle errors
    #[error("State accessed before the backing store resolved")]
    UnboundStore,

    #[error("Init routine '{method}' cannot be invoked directly")]
    InitCall { method: String },

    #[error("Method '{method}' must not run while the module is proxied")]
    ProxyGuard { method: String },

    // Dispatch errors
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Module not found at path: {path}")]
    ModuleNotFound { path: String },

    // Proxy and transport errors
    #[error("A transport instance is required")]
    TransportRequired,

    #[error("Transport channel closed")]
    ChannelClosed,

    #[error("Remote call timed out after {0:?}")]
    RemoteTimeout(Duration),

    #[error("Remote execution failed (code {code}): {message}")]
    RemoteExecution { code: i32, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for Trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;

impl From<serde_json::Error> for TrellisError {
    fn from(err: serde_json::Error) -> Self {
        TrellisError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TrellisError {
    /// Create a configuration error with a message.
    pub fn config(message: impl Into<String>) -> Self {
        TrellisError::Config {
            message: message.into(),
        }
    }

    /// Create a composition scope error with a message.
    pub fn scope(message: impl Into<String>) -> Self {
        TrellisError::Scope {
            message: message.into(),
        }
    }

    /// Convert to a numeric code for the wire.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32002: State container not ready
    /// - -32005: Guarded or init-only method invoked
    pub fn to_remote_code(&self) -> i32 {
        match self {
            TrellisError::TransportRequired
            | TrellisError::ChannelClosed
            | TrellisError::RemoteTimeout(_) => -32000,

            TrellisError::UnboundStore => -32002,

            TrellisError::InitCall { .. } | TrellisError::ProxyGuard { .. } => -32005,

            TrellisError::MethodNotFound { .. } | TrellisError::ModuleNotFound { .. } => -32601,

            TrellisError::Json { .. } => -32700,

            TrellisError::RemoteExecution { code, .. } => *code,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Timeouts and an unresolved store are transient; the rest are
    /// programmer errors or permanent failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrellisError::RemoteTimeout(_)
                | TrellisError::ChannelClosed
                | TrellisError::UnboundStore
        )
    }
}
