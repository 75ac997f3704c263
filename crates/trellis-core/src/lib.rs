//! Trellis core - hierarchical module framework.
//!
//! A tree of stateful modules shares one reducer-driven store. Every module
//! has a unique dotted address assigned at first attachment, a reducer for its
//! state slice, a local event emitter, and named methods tagged for local or
//! remote dispatch. The `trellis-proxy` crate mirrors such a tree across an
//! asynchronous message channel; this crate is usable on its own for the
//! un-proxied case.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{MethodKind, Module, Store};
//!
//! #[tokio::main]
//! async fn main() -> trellis_core::Result<()> {
//!     let root = Module::builder().build()?;
//!     root.assign_root("root")?;
//!
//!     let auth = Module::builder()
//!         .prefix("auth")
//!         .actions(&["login"])
//!         .method("login", MethodKind::Proxied, |module, args| {
//!             Box::pin(async move {
//!                 // dispatch actions, read module.state(), ...
//!                 Ok(serde_json::Value::Null)
//!             })
//!         })
//!         .build()?;
//!     root.add_module("auth", &auth)?;
//!
//!     let store = Store::new(root.combined_reducer());
//!     root.bind_store(store).await?;
//!
//!     let result = auth.call("login", vec![]).await?;
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod module;
pub mod store;

pub use action::{prefix_actions, Action};
pub use config::{ModuleConfig, ProxyConfig};
pub use error::{Result, TrellisError};
pub use event::{EventEmitter, HandlerId};
pub use module::{
    MethodFn, MethodFuture, MethodKind, Module, ModuleBuilder, RemoteDispatcher, StateGetter,
};
pub use store::{
    default_reducer, store_channel, Reducer, Store, StorePromise, StoreResolver, SubscriptionId,
};
