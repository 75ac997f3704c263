//! Proxy server: exposes a module tree for remote invocation and broadcasts
//! every locally dispatched action.
//!
//! The server side is authoritative: its tree binds a real store, its init
//! routines run, and every action that reaches the combined reducer is
//! replicated to the mirror side as a timestamped push.

use crate::message::{LogicalClock, PushMessage, RemoteFault, RequestMessage, ResponseMessage};
use crate::transport::Transport;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trellis_core::{Module, ModuleConfig, Result, Store, TrellisError};

/// Handle to a running proxy server. Dropping shuts down the serve loop.
pub struct ProxyServer {
    module: Module,
    store: Arc<Store>,
    serve_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyServer {
    /// Wrap `module` and serve it over `transport`.
    ///
    /// Fails with [`TrellisError::TransportRequired`] when no transport is
    /// supplied. The tree gets the default root label if it has none, a store
    /// is built from its combined reducer, and the tree is bound to it, which
    /// runs the authoritative init routines before the first request is
    /// served.
    pub async fn start(
        module: Module,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self> {
        let transport = transport.ok_or(TrellisError::TransportRequired)?;
        module.assign_root(ModuleConfig::DEFAULT_ROOT_LABEL)?;

        let store = Store::new(module.combined_reducer());
        let clock = Arc::new(LogicalClock::new());

        // Replicate every dispatched action, stamped strictly after any
        // previous push.
        {
            let transport = transport.clone();
            let clock = clock.clone();
            store.tap_actions(move |action| {
                let push = PushMessage {
                    action: action.clone(),
                    timestamp: clock.next(),
                };
                match serde_json::to_value(&push) {
                    Ok(payload) => {
                        if transport.push(payload).is_err() {
                            warn!("push channel closed, replicated action dropped");
                        }
                    }
                    Err(err) => warn!("failed to serialize push: {err}"),
                }
            });
        }

        module.bind_store(store.clone()).await?;

        let requests = transport.incoming_requests().ok_or_else(|| {
            TrellisError::config("transport request stream already taken")
        })?;
        let serve_task = tokio::spawn(Self::serve_loop(
            module.clone(),
            store.clone(),
            transport,
            clock,
            requests,
        ));
        info!(
            tree = %module.path().unwrap_or_default(),
            "proxy server started"
        );

        Ok(Self {
            module,
            store,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    async fn serve_loop(
        module: Module,
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        clock: Arc<LogicalClock>,
        mut requests: mpsc::UnboundedReceiver<Value>,
    ) {
        while let Some(payload) = requests.recv().await {
            let request: RequestMessage = match serde_json::from_value(payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!("dropping malformed request: {err}");
                    continue;
                }
            };

            // Both branches produce exactly one reply per request.
            let response = match request {
                RequestMessage::Exec {
                    request_id,
                    function_path,
                    args,
                } => match Self::execute(&module, &function_path, args).await {
                    Ok(result) => ResponseMessage::Exec {
                        request_id,
                        result: Some(result),
                        error: None,
                    },
                    Err(err) => {
                        debug!(%function_path, "remote execution failed: {err}");
                        ResponseMessage::Exec {
                            request_id,
                            result: None,
                            error: Some(RemoteFault::from(&err)),
                        }
                    }
                },
                RequestMessage::Sync { request_id } => ResponseMessage::Sync {
                    request_id,
                    state: store.state(),
                    timestamp: clock.now(),
                },
            };

            match serde_json::to_value(&response) {
                Ok(payload) => {
                    if transport.respond(payload).is_err() {
                        warn!("response channel closed, stopping serve loop");
                        break;
                    }
                }
                Err(err) => warn!("failed to serialize response: {err}"),
            }
        }
        debug!("request stream closed, proxy server loop exiting");
    }

    /// Resolve `function_path` against the live tree and invoke the method.
    ///
    /// The first segment is always treated as the tree's own root label and
    /// dropped; a tree mounted as a submodule of another tree would misroute
    /// here.
    async fn execute(module: &Module, function_path: &str, args: Vec<Value>) -> Result<Value> {
        let mut segments: Vec<&str> = function_path
            .split(ModuleConfig::PATH_SEPARATOR)
            .collect();
        if segments.len() < 2 {
            return Err(TrellisError::ModuleNotFound {
                path: function_path.to_string(),
            });
        }
        let method = segments.pop().unwrap_or_default();
        let target =
            module
                .resolve(&segments[1..])
                .ok_or_else(|| TrellisError::ModuleNotFound {
                    path: function_path.to_string(),
                })?;
        target.call(method, args).await
    }

    /// The authoritative module tree.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The authoritative store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Stop serving requests. Pushes stop with the last dispatch.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .serve_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;
    use trellis_core::{Action, MethodKind};

    fn auth_tree() -> Module {
        let root = Module::builder().build().unwrap();
        root.assign_root("root").unwrap();
        let auth = Module::builder()
            .prefix("auth")
            .actions(&["login"])
            .reducer(|state, action| {
                if action.kind == "auth-login" {
                    return json!({ "status": "loggedIn" });
                }
                state.cloned().unwrap_or(json!({ "status": "pending" }))
            })
            .method("login", MethodKind::Proxied, |module, args| {
                Box::pin(async move {
                    let kind = module.action("login").unwrap_or("login").to_string();
                    module.dispatch(Action::with_payload(
                        kind,
                        args.into_iter().next().unwrap_or(Value::Null),
                    ))?;
                    Ok(json!({ "ok": true }))
                })
            })
            .method("fail", MethodKind::Proxied, |_, _| {
                Box::pin(async {
                    Err(TrellisError::RemoteExecution {
                        code: -32603,
                        message: "backend unavailable".into(),
                    })
                })
            })
            .build()
            .unwrap();
        root.add_module("auth", &auth).unwrap();
        root
    }

    #[tokio::test]
    async fn test_start_requires_transport() {
        let result = ProxyServer::start(auth_tree(), None).await;
        assert!(matches!(result, Err(TrellisError::TransportRequired)));
    }

    #[tokio::test]
    async fn test_exec_request_invokes_method_and_replies() {
        let (client_end, server_end) = ChannelTransport::pair();
        let server = ProxyServer::start(auth_tree(), Some(server_end)).await.unwrap();

        let response = client_end
            .request(json!({
                "type": "exec",
                "functionPath": "root.auth.login",
                "args": [{"user": "x"}],
            }))
            .await
            .unwrap();
        assert_eq!(response["type"], "exec-response");
        assert_eq!(response["result"], json!({ "ok": true }));
        assert_eq!(
            server.store().state()["auth"],
            json!({ "status": "loggedIn" })
        );
    }

    #[tokio::test]
    async fn test_exec_failure_serializes_fault() {
        let (client_end, server_end) = ChannelTransport::pair();
        let _server = ProxyServer::start(auth_tree(), Some(server_end)).await.unwrap();

        let response = client_end
            .request(json!({
                "type": "exec",
                "functionPath": "root.auth.fail",
                "args": [],
            }))
            .await
            .unwrap();
        assert!(response.get("result").is_none());
        assert_eq!(response["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_unknown_path_replies_with_fault() {
        let (client_end, server_end) = ChannelTransport::pair();
        let _server = ProxyServer::start(auth_tree(), Some(server_end)).await.unwrap();

        let response = client_end
            .request(json!({
                "type": "exec",
                "functionPath": "root.missing.login",
                "args": [],
            }))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_sync_request_returns_snapshot() {
        let (client_end, server_end) = ChannelTransport::pair();
        let server = ProxyServer::start(auth_tree(), Some(server_end)).await.unwrap();

        let response = client_end.request(json!({"type": "sync"})).await.unwrap();
        assert_eq!(response["type"], "sync-response");
        assert_eq!(response["state"], server.store().state());
        assert!(response["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_dispatches_are_pushed_with_increasing_timestamps() {
        let (client_end, server_end) = ChannelTransport::pair();
        let mut pushes = client_end.incoming_pushes().unwrap();
        let server = ProxyServer::start(auth_tree(), Some(server_end)).await.unwrap();

        server.store().dispatch(Action::new("auth-login"));
        server.store().dispatch(Action::new("noop"));

        let first = pushes.recv().await.unwrap();
        let second = pushes.recv().await.unwrap();
        assert_eq!(first["action"]["type"], "auth-login");
        assert!(second["timestamp"].as_u64().unwrap() > first["timestamp"].as_u64().unwrap());
    }

    #[tokio::test]
    async fn test_malformed_request_is_dropped_channel_stays_alive() {
        let (client_end, server_end) = ChannelTransport::pair();
        let _server = ProxyServer::start(auth_tree(), Some(server_end)).await.unwrap();

        // No reply expected for garbage; the next valid request still works.
        let garbage = client_end.request(json!({"type": "wat"}));
        let valid = client_end.request(json!({"type": "sync"}));
        let (garbage, valid) = tokio::join!(
            async { tokio::time::timeout(std::time::Duration::from_millis(100), garbage).await },
            valid
        );
        assert!(garbage.is_err());
        assert!(valid.is_ok());
    }
}
