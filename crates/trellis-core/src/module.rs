//! Module base: method registry, tree composition, and bind lifecycle.
//!
//! A [`Module`] is a stateful unit addressed by a dotted path inside a tree.
//! It owns a slice of a shared [`Store`](crate::store::Store), a reducer for
//! that slice, a local event emitter, and a set of named methods. Methods are
//! registered at build time with a [`MethodKind`] tag; `Module::call` compiles
//! the tag into an explicit dispatch branch, so switching a tree into proxied
//! mode never rewrites the methods themselves.
//!
//! Cloning a `Module` clones a handle; all clones share the same instance.

use crate::action::{prefix_actions, Action};
use crate::config::ModuleConfig;
use crate::error::{Result, TrellisError};
use crate::event::{EventEmitter, HandlerId};
use crate::store::{default_reducer, Reducer, Store, StorePromise};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;

/// Future returned by module method bodies.
pub type MethodFuture = BoxFuture<'static, Result<Value>>;

/// A method body: receives a handle to its owning module and the call's
/// JSON arguments.
pub type MethodFn = Arc<dyn Fn(Module, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Maps the full store state to this module's slice.
pub type StateGetter = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// How a method behaves once its module enters proxied mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Always runs its local body.
    Local,
    /// Redirects to remote execution while the module is proxied.
    Proxied,
    /// Meaningful only on the authoritative side; fails with
    /// [`TrellisError::ProxyGuard`] while proxied, without touching the
    /// transport.
    ServerOnly,
}

/// Seam between a proxied module and the remote side.
///
/// The proxy client installs an implementation that turns
/// `(function_path, args)` into an execution request on its transport.
#[async_trait]
pub trait RemoteDispatcher: Send + Sync + 'static {
    /// Execute `function_path` remotely with the given arguments.
    async fn dispatch(&self, function_path: &str, args: Vec<Value>) -> Result<Value>;
}

struct MethodEntry {
    kind: MethodKind,
    body: MethodFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Pending,
    Initialized,
}

struct ModuleInner {
    prefix: Option<String>,
    actions: HashMap<String, String>,
    getter: Option<StateGetter>,
    reducer: Reducer,
    emitter: EventEmitter,
    methods: HashMap<String, MethodEntry>,
    init_method: Option<String>,
    // Ordered child registry; attach order is walk order.
    children: Mutex<Vec<(String, Module)>>,
    // Dotted path, fixed at first attachment (or root assignment).
    path: OnceLock<String>,
    store: OnceLock<Arc<Store>>,
    remote: OnceLock<Arc<dyn RemoteDispatcher>>,
    proxied: AtomicBool,
    suppress_init: AtomicBool,
    init_state: Mutex<InitState>,
}

/// A stateful module inside a tree. See the module-level docs.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.inner.path.get())
            .field("prefix", &self.inner.prefix)
            .field("proxied", &self.is_proxied())
            .finish()
    }
}

/// Builder for [`Module`]. All configuration is validated in [`build`].
///
/// [`build`]: ModuleBuilder::build
#[derive(Default)]
pub struct ModuleBuilder {
    prefix: Option<String>,
    action_names: Vec<String>,
    getter: Option<StateGetter>,
    reducer: Option<Reducer>,
    methods: Vec<(String, MethodKind, MethodFn)>,
    init_method: Option<String>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace prefix for this module's action kinds.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Declare the action names this module dispatches; they are namespaced
    /// with the prefix at build time (see [`prefix_actions`]).
    pub fn actions(mut self, names: &[&str]) -> Self {
        self.action_names
            .extend(names.iter().map(|name| (*name).to_string()));
        self
    }

    /// Custom state getter. Defaults to a lookup derived from the module's
    /// dotted path.
    pub fn getter(mut self, getter: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Reducer for this module's state slice. Defaults to the pass-through
    /// [`default_reducer`].
    pub fn reducer(
        mut self,
        reducer: impl Fn(Option<&Value>, &Action) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    /// Register a method under `name` with the given dispatch tag.
    pub fn method(
        mut self,
        name: impl Into<String>,
        kind: MethodKind,
        body: impl Fn(Module, Vec<Value>) -> MethodFuture + Send + Sync + 'static,
    ) -> Self {
        self.methods.push((name.into(), kind, Arc::new(body)));
        self
    }

    /// Designate a registered method as the init routine.
    ///
    /// It runs automatically, exactly once, right after the store binds, and
    /// is never callable through [`Module::call`].
    pub fn init_method(mut self, name: impl Into<String>) -> Self {
        self.init_method = Some(name.into());
        self
    }

    /// Validate the configuration and build the module.
    ///
    /// Violations fail here with [`TrellisError::Config`], never later.
    pub fn build(self) -> Result<Module> {
        if let Some(prefix) = &self.prefix {
            if prefix.is_empty() {
                return Err(TrellisError::config("prefix must not be empty"));
            }
            if prefix.contains(ModuleConfig::PATH_SEPARATOR) {
                return Err(TrellisError::config(format!(
                    "prefix '{prefix}' must not contain '{}'",
                    ModuleConfig::PATH_SEPARATOR
                )));
            }
        }

        let mut seen_actions = HashSet::new();
        for name in &self.action_names {
            if !seen_actions.insert(name.as_str()) {
                return Err(TrellisError::config(format!(
                    "duplicate action name '{name}'"
                )));
            }
        }

        let mut methods = HashMap::new();
        for (name, kind, body) in self.methods {
            if methods
                .insert(name.clone(), MethodEntry { kind, body })
                .is_some()
            {
                return Err(TrellisError::config(format!("duplicate method '{name}'")));
            }
        }

        if let Some(init) = &self.init_method {
            if !methods.contains_key(init) {
                return Err(TrellisError::config(format!(
                    "init method '{init}' is not a registered method"
                )));
            }
        }

        let action_names: Vec<&str> = self.action_names.iter().map(String::as_str).collect();
        let actions = prefix_actions(self.prefix.as_deref(), &action_names);

        Ok(Module {
            inner: Arc::new(ModuleInner {
                prefix: self.prefix,
                actions,
                getter: self.getter,
                reducer: self.reducer.unwrap_or_else(default_reducer),
                emitter: EventEmitter::new(),
                methods,
                init_method: self.init_method,
                children: Mutex::new(Vec::new()),
                path: OnceLock::new(),
                store: OnceLock::new(),
                remote: OnceLock::new(),
                proxied: AtomicBool::new(false),
                suppress_init: AtomicBool::new(false),
                init_state: Mutex::new(InitState::Pending),
            }),
        })
    }
}

impl Module {
    pub fn builder() -> ModuleBuilder {
        ModuleBuilder::new()
    }

    // --- addressing ---

    /// The module's dotted path, if it has been attached or made a root.
    pub fn path(&self) -> Option<String> {
        self.inner.path.get().cloned()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.inner.prefix.as_deref()
    }

    /// Namespaced action kind for a declared action name.
    pub fn action(&self, name: &str) -> Option<&str> {
        self.inner.actions.get(name).map(String::as_str)
    }

    /// Make this module a tree root under `label`.
    ///
    /// Path assignment is first-wins: a later assignment (or attachment) is a
    /// no-op, preserving the module's canonical address.
    pub fn assign_root(&self, label: &str) -> Result<()> {
        if label.is_empty() || label.contains(ModuleConfig::PATH_SEPARATOR) {
            return Err(TrellisError::config(format!("invalid root label '{label}'")));
        }
        let _ = self.inner.path.set(label.to_string());
        Ok(())
    }

    // --- tree composition ---

    /// Attach `child` under `name`.
    ///
    /// The parent must already have a path (it is a root or was itself
    /// attached); the name must be unique among this parent's children. The
    /// child's path is recorded only if it does not already have one, so
    /// re-attachment under a second name exposes the module there without
    /// changing its address.
    pub fn add_module(&self, name: &str, child: &Module) -> Result<()> {
        if name.is_empty() || name.contains(ModuleConfig::PATH_SEPARATOR) {
            return Err(TrellisError::config(format!("invalid module name '{name}'")));
        }
        let parent_path = self.inner.path.get().ok_or_else(|| {
            TrellisError::scope(format!(
                "cannot attach '{name}' to a module with no assigned path"
            ))
        })?;

        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if children.iter().any(|(existing, _)| existing == name) {
            return Err(TrellisError::DuplicateModule {
                name: name.to_string(),
            });
        }

        // First attachment wins; a second attachment keeps the recorded path.
        let _ = child.inner.path.set(format!(
            "{parent_path}{}{name}",
            ModuleConfig::PATH_SEPARATOR
        ));
        children.push((name.to_string(), child.clone()));
        Ok(())
    }

    /// Child attached under `name`, if any.
    pub fn child(&self, name: &str) -> Option<Module> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, module)| module.clone())
    }

    /// Children in attach order.
    pub fn children(&self) -> Vec<(String, Module)> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Walk `segments` through the child registry.
    pub fn resolve(&self, segments: &[&str]) -> Option<Module> {
        let mut current = self.clone();
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    // --- state ---

    /// This module's slice of the bound store's state.
    ///
    /// Fails synchronously with [`TrellisError::UnboundStore`] until the
    /// store resolves; it never suspends.
    pub fn state(&self) -> Result<Value> {
        let store = self.inner.store.get().ok_or(TrellisError::UnboundStore)?;
        Ok(self.slice(&store.state()))
    }

    fn slice(&self, full: &Value) -> Value {
        if let Some(getter) = &self.inner.getter {
            return getter(full);
        }
        // Default getter: the path segments below the root label mirror the
        // combined reducer's nesting.
        match self.inner.path.get() {
            Some(path) => {
                let mut current = full;
                for segment in path.split(ModuleConfig::PATH_SEPARATOR).skip(1) {
                    current = current.get(segment).unwrap_or(&Value::Null);
                }
                current.clone()
            }
            None => full.clone(),
        }
    }

    /// The store this module is bound to.
    pub fn store(&self) -> Result<Arc<Store>> {
        self.inner
            .store
            .get()
            .cloned()
            .ok_or(TrellisError::UnboundStore)
    }

    /// Dispatch an action into the bound store.
    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.store()?.dispatch(action);
        Ok(())
    }

    /// This module's own reducer.
    pub fn reducer(&self) -> Reducer {
        self.inner.reducer.clone()
    }

    /// Reducer for this module's whole subtree.
    ///
    /// The module's own reducer produces the base object, then every child's
    /// combined reducer owns the key matching its attach name. The nesting
    /// mirrors dotted paths, which is what the default getter walks.
    pub fn combined_reducer(&self) -> Reducer {
        let own = self.inner.reducer.clone();
        let children: Vec<(String, Reducer)> = self
            .children()
            .into_iter()
            .map(|(name, child)| (name, child.combined_reducer()))
            .collect();
        if children.is_empty() {
            return own;
        }
        Arc::new(move |state, action| {
            let mut map = match own(state, action) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            for (name, child) in &children {
                let previous = state.and_then(|s| s.get(name.as_str()));
                map.insert(name.clone(), child(previous, action));
            }
            Value::Object(map)
        })
    }

    // --- events ---

    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.inner.emitter.on(event, handler)
    }

    pub fn once(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.inner.emitter.once(event, handler)
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.inner.emitter.off(event, id)
    }

    pub fn emit(&self, event: &str, payload: &Value) {
        self.inner.emitter.emit(event, payload);
    }

    // --- proxied mode ---

    pub fn is_proxied(&self) -> bool {
        self.inner.proxied.load(Ordering::SeqCst)
    }

    pub fn set_proxied(&self, proxied: bool) {
        self.inner.proxied.store(proxied, Ordering::SeqCst);
    }

    /// Skip the automatic init routine permanently.
    ///
    /// Only effective if called before the store resolves; once the routine
    /// has run, suppression has nothing left to do.
    pub fn suppress_init(&self) {
        self.inner.suppress_init.store(true, Ordering::SeqCst);
    }

    /// Install the remote dispatch seam. First installation wins.
    pub fn set_remote(&self, remote: Arc<dyn RemoteDispatcher>) {
        let _ = self.inner.remote.set(remote);
    }

    /// Switch this module and every descendant into proxied mode: tagged
    /// methods redirect through `remote`, and auto-init routines are
    /// suppressed (the authoritative instance already ran them).
    pub fn enter_proxied_mode(&self, remote: Arc<dyn RemoteDispatcher>) {
        self.set_proxied(true);
        self.suppress_init();
        self.set_remote(remote.clone());
        for (_, child) in self.children() {
            child.enter_proxied_mode(remote.clone());
        }
    }

    // --- lifecycle ---

    /// Suspend until the store resolves, then bind this subtree to it.
    pub async fn bind(&self, promise: &StorePromise) -> Result<()> {
        let store = promise.resolved().await;
        self.bind_store(store).await
    }

    /// Bind this module and its subtree to a resolved store.
    ///
    /// Binding subscribes the `state-change` emission and runs each module's
    /// init routine exactly once (unless suppressed or proxied). Re-binding
    /// an already-bound module is a no-op.
    pub async fn bind_store(&self, store: Arc<Store>) -> Result<()> {
        self.bind_one(store.clone()).await?;
        for (_, child) in self.children() {
            Box::pin(child.bind_store(store.clone())).await?;
        }
        Ok(())
    }

    async fn bind_one(&self, store: Arc<Store>) -> Result<()> {
        if self.inner.store.set(store.clone()).is_err() {
            return Ok(());
        }
        let module = self.clone();
        store.subscribe(move |old, new| {
            module.emit(
                ModuleConfig::STATE_CHANGE_EVENT,
                &serde_json::json!({ "oldState": old, "newState": new }),
            );
        });
        self.run_init().await
    }

    async fn run_init(&self) -> Result<()> {
        let Some(name) = self.inner.init_method.clone() else {
            return Ok(());
        };
        if self.is_proxied() || self.inner.suppress_init.load(Ordering::SeqCst) {
            debug!(path = ?self.path(), "init routine suppressed");
            return Ok(());
        }
        {
            let mut state = self
                .inner
                .init_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state == InitState::Initialized {
                return Ok(());
            }
            *state = InitState::Initialized;
        }
        debug!(path = ?self.path(), method = %name, "running init routine");
        // Registered init methods are validated at build time.
        let body = match self.inner.methods.get(&name) {
            Some(entry) => entry.body.clone(),
            None => return Ok(()),
        };
        body(self.clone(), Vec::new()).await.map(|_| ())
    }

    // --- dispatch ---

    /// Invoke a registered method by name.
    ///
    /// The branch taken depends on the method's tag and the module's proxied
    /// flag; the init routine is never callable here.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if self.inner.init_method.as_deref() == Some(method) {
            return Err(TrellisError::InitCall {
                method: method.to_string(),
            });
        }
        let entry = self
            .inner
            .methods
            .get(method)
            .ok_or_else(|| TrellisError::MethodNotFound {
                method: method.to_string(),
            })?;

        match entry.kind {
            MethodKind::ServerOnly if self.is_proxied() => Err(TrellisError::ProxyGuard {
                method: method.to_string(),
            }),
            MethodKind::Proxied if self.is_proxied() => {
                let remote = self
                    .inner
                    .remote
                    .get()
                    .ok_or(TrellisError::TransportRequired)?;
                let path = self.inner.path.get().ok_or_else(|| {
                    TrellisError::scope("proxied call on a module with no assigned path")
                })?;
                let function_path =
                    format!("{path}{}{method}", ModuleConfig::PATH_SEPARATOR);
                debug!(%function_path, "redirecting method to remote execution");
                remote.dispatch(&function_path, args).await
            }
            _ => {
                let body = entry.body.clone();
                body(self.clone(), args).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::store_channel;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn plain_module() -> Module {
        Module::builder().build().unwrap()
    }

    fn echo_module() -> Module {
        Module::builder()
            .method("echo", MethodKind::Local, |_, args| {
                Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_empty_prefix() {
        let result = Module::builder().prefix("").build();
        assert!(matches!(result, Err(TrellisError::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_prefix_with_separator() {
        let result = Module::builder().prefix("a.b").build();
        assert!(matches!(result, Err(TrellisError::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_unknown_init_method() {
        let result = Module::builder().init_method("missing").build();
        assert!(matches!(result, Err(TrellisError::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_duplicate_method() {
        let result = Module::builder()
            .method("go", MethodKind::Local, |_, _| {
                Box::pin(async { Ok(Value::Null) })
            })
            .method("go", MethodKind::Local, |_, _| {
                Box::pin(async { Ok(Value::Null) })
            })
            .build();
        assert!(matches!(result, Err(TrellisError::Config { .. })));
    }

    #[test]
    fn test_actions_are_prefixed() {
        let module = Module::builder()
            .prefix("auth")
            .actions(&["login", "logout"])
            .build()
            .unwrap();
        assert_eq!(module.action("login"), Some("auth-login"));
        assert_eq!(module.action("missing"), None);
    }

    #[test]
    fn test_add_module_assigns_dotted_path() {
        let root = plain_module();
        root.assign_root("root").unwrap();
        let auth = plain_module();
        root.add_module("auth", &auth).unwrap();
        assert_eq!(auth.path().as_deref(), Some("root.auth"));
        assert!(root.child("auth").is_some());
    }

    #[test]
    fn test_add_module_duplicate_name_fails() {
        let root = plain_module();
        root.assign_root("root").unwrap();
        root.add_module("auth", &plain_module()).unwrap();
        let result = root.add_module("auth", &plain_module());
        assert!(matches!(result, Err(TrellisError::DuplicateModule { .. })));
    }

    #[test]
    fn test_first_attachment_wins_on_path() {
        let root = plain_module();
        root.assign_root("root").unwrap();
        let shared = plain_module();
        root.add_module("first", &shared).unwrap();
        root.add_module("second", &shared).unwrap();
        // Exposed under both names, addressed by the first.
        assert!(root.child("second").is_some());
        assert_eq!(shared.path().as_deref(), Some("root.first"));
    }

    #[test]
    fn test_add_module_to_detached_parent_fails() {
        let detached = plain_module();
        let result = detached.add_module("auth", &plain_module());
        assert!(matches!(result, Err(TrellisError::Scope { .. })));
    }

    #[test]
    fn test_resolve_walks_registry() {
        let root = plain_module();
        root.assign_root("root").unwrap();
        let auth = plain_module();
        root.add_module("auth", &auth).unwrap();
        let session = plain_module();
        auth.add_module("session", &session).unwrap();

        let found = root.resolve(&["auth", "session"]).unwrap();
        assert_eq!(found.path().as_deref(), Some("root.auth.session"));
        assert!(root.resolve(&["auth", "missing"]).is_none());
    }

    #[test]
    fn test_state_before_bind_fails_synchronously() {
        let module = plain_module();
        assert!(matches!(module.state(), Err(TrellisError::UnboundStore)));
    }

    #[tokio::test]
    async fn test_default_getter_follows_path() {
        let root = plain_module();
        root.assign_root("root").unwrap();
        let auth = Module::builder()
            .reducer(|state, _| state.cloned().unwrap_or(json!({ "status": "pending" })))
            .build()
            .unwrap();
        root.add_module("auth", &auth).unwrap();

        let store = Store::new(root.combined_reducer());
        root.bind_store(store.clone()).await.unwrap();

        assert_eq!(store.state(), json!({ "auth": { "status": "pending" } }));
        assert_eq!(auth.state().unwrap(), json!({ "status": "pending" }));
        assert_eq!(root.state().unwrap(), store.state());
    }

    #[tokio::test]
    async fn test_custom_getter() {
        let module = Module::builder()
            .getter(|full| full.get("elsewhere").cloned().unwrap_or(Value::Null))
            .build()
            .unwrap();
        module.assign_root("root").unwrap();
        let store = Store::new(Arc::new(|_, _| json!({ "elsewhere": 42 })));
        module.bind_store(store).await.unwrap();
        assert_eq!(module.state().unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_state_change_event_on_dispatch() {
        let module = Module::builder()
            .reducer(|state, action| match action.kind.as_str() {
                "bump" => json!({ "bumped": true }),
                _ => state.cloned().unwrap_or(json!({})),
            })
            .build()
            .unwrap();
        module.assign_root("root").unwrap();
        let store = Store::new(module.combined_reducer());
        module.bind_store(store.clone()).await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        module.on(ModuleConfig::STATE_CHANGE_EVENT, move |payload| {
            events_clone.lock().unwrap().push(payload.clone());
        });

        store.dispatch(Action::new("bump"));
        store.dispatch(Action::new("irrelevant"));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["oldState"], json!({}));
        assert_eq!(events[0]["newState"], json!({ "bumped": true }));
    }

    fn counting_init_module(counter: Arc<AtomicUsize>) -> Module {
        Module::builder()
            .method("initialize", MethodKind::Local, move |_, _| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                })
            })
            .init_method("initialize")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_init_runs_exactly_once_on_bind() {
        let counter = Arc::new(AtomicUsize::new(0));
        let module = counting_init_module(counter.clone());
        module.assign_root("root").unwrap();

        let (resolver, promise) = store_channel();
        let waiter = {
            let module = module.clone();
            let promise = promise.clone();
            tokio::spawn(async move { module.bind(&promise).await })
        };
        resolver.resolve(Store::new(default_reducer()));
        waiter.await.unwrap().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Re-binding does not run it again.
        module
            .bind_store(Store::new(default_reducer()))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_suppressed_init_never_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let module = counting_init_module(counter.clone());
        module.assign_root("root").unwrap();
        module.suppress_init();
        module
            .bind_store(Store::new(default_reducer()))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_method_not_directly_callable() {
        let counter = Arc::new(AtomicUsize::new(0));
        let module = counting_init_module(counter);
        let result = module.call("initialize", Vec::new()).await;
        assert!(matches!(result, Err(TrellisError::InitCall { .. })));
    }

    #[tokio::test]
    async fn test_call_local_method() {
        let module = echo_module();
        let result = module.call("echo", vec![json!("hello")]).await.unwrap();
        assert_eq!(result, json!("hello"));
    }

    #[tokio::test]
    async fn test_call_unknown_method() {
        let module = echo_module();
        let result = module.call("nope", Vec::new()).await;
        assert!(matches!(result, Err(TrellisError::MethodNotFound { .. })));
    }

    #[tokio::test]
    async fn test_server_only_method_guarded_while_proxied() {
        let module = Module::builder()
            .method("rotate_secrets", MethodKind::ServerOnly, |_, _| {
                Box::pin(async { Ok(Value::Null) })
            })
            .build()
            .unwrap();

        // Runs locally while un-proxied.
        assert!(module.call("rotate_secrets", Vec::new()).await.is_ok());

        module.set_proxied(true);
        let result = module.call("rotate_secrets", Vec::new()).await;
        assert!(matches!(result, Err(TrellisError::ProxyGuard { .. })));
    }

    struct RecordingRemote {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl RemoteDispatcher for RecordingRemote {
        async fn dispatch(&self, function_path: &str, args: Vec<Value>) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((function_path.to_string(), args));
            Ok(json!("remote-result"))
        }
    }

    #[tokio::test]
    async fn test_proxied_method_redirects_with_dotted_path() {
        let root = plain_module();
        root.assign_root("root").unwrap();
        let auth = Module::builder()
            .method("login", MethodKind::Proxied, |_, _| {
                Box::pin(async { Ok(json!("local-result")) })
            })
            .build()
            .unwrap();
        root.add_module("auth", &auth).unwrap();

        // Un-proxied: runs the local body.
        let local = auth.call("login", Vec::new()).await.unwrap();
        assert_eq!(local, json!("local-result"));

        let remote = Arc::new(RecordingRemote {
            calls: Mutex::new(Vec::new()),
        });
        root.enter_proxied_mode(remote.clone());

        let result = auth.call("login", vec![json!({"user": "x"})]).await.unwrap();
        assert_eq!(result, json!("remote-result"));

        let calls = remote.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "root.auth.login");
        assert_eq!(calls[0].1, vec![json!({"user": "x"})]);
    }

    #[tokio::test]
    async fn test_proxied_method_without_remote_fails() {
        let module = Module::builder()
            .method("login", MethodKind::Proxied, |_, _| {
                Box::pin(async { Ok(Value::Null) })
            })
            .build()
            .unwrap();
        module.assign_root("root").unwrap();
        module.set_proxied(true);
        let result = module.call("login", Vec::new()).await;
        assert!(matches!(result, Err(TrellisError::TransportRequired)));
    }

    #[tokio::test]
    async fn test_enter_proxied_mode_recurses_and_suppresses_init() {
        let counter = Arc::new(AtomicUsize::new(0));
        let root = plain_module();
        root.assign_root("root").unwrap();
        let child = counting_init_module(counter.clone());
        root.add_module("child", &child).unwrap();

        let remote = Arc::new(RecordingRemote {
            calls: Mutex::new(Vec::new()),
        });
        root.enter_proxied_mode(remote);
        assert!(child.is_proxied());

        root.bind_store(Store::new(default_reducer())).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
