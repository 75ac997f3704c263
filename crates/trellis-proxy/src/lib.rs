//! Trellis proxy - remote invocation and state replication for module trees.
//!
//! A [`ProxyServer`] wraps the authoritative tree from `trellis-core`,
//! resolving execution requests by dotted path and broadcasting every
//! dispatched action as a timestamped push. A [`ProxyClient`] instantiates
//! the same tree in proxied mode: tagged method calls become requests over
//! the transport, and the mirrored state follows the server through a
//! one-time full sync plus watermark-gated push application.
//!
//! The transport is abstract (see [`Transport`]); delivery is assumed
//! asynchronous and unordered, which the correlation-id and timestamp
//! machinery here exists to survive.

pub mod client;
pub mod message;
pub mod server;
pub mod transport;

pub use client::ProxyClient;
pub use message::{LogicalClock, PushMessage, RemoteFault, RequestMessage, ResponseMessage};
pub use server::ProxyServer;
pub use transport::{ChannelTransport, PendingRequests, Transport};
