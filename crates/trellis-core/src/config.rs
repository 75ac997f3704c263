//! Centralized configuration for the Trellis framework.
//!
//! Constants for module addressing, lifecycle events, and proxy timing.

use std::time::Duration;

/// Module tree and lifecycle configuration.
pub struct ModuleConfig;

impl ModuleConfig {
    /// Separator between segments of a module's dotted path.
    pub const PATH_SEPARATOR: char = '.';

    /// Root label assigned to a tree when none was set explicitly.
    pub const DEFAULT_ROOT_LABEL: &'static str = "root";

    /// Event emitted when the bound store's state changes after a dispatch.
    pub const STATE_CHANGE_EVENT: &'static str = "state-change";

    /// Action used to seed a freshly created store.
    pub const INIT_ACTION: &'static str = "@@trellis/init";
}

/// Proxy layer configuration.
pub struct ProxyConfig;

impl ProxyConfig {
    /// How long a remote call waits for its correlated response.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Action kind that replaces the mirrored state with a sync snapshot.
    pub const SYNC_ACTION: &'static str = "proxy-sync";
}
