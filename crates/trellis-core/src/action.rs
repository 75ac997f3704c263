//! Actions dispatched into the store, and action identifier namespacing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A state-changing action.
///
/// `kind` identifies the action (serialized as `type` on the wire, so pushed
/// actions keep the shape the mirror side expects); `payload` carries
/// arbitrary action data and is omitted from serialization when null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Action {
    /// Create an action with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
        }
    }

    /// Create an action carrying a payload.
    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Namespace action identifiers with a module prefix.
///
/// Maps each name to `<prefix>-<name>`, so two modules sharing a store never
/// collide on action kinds. Without a prefix the names pass through unchanged.
pub fn prefix_actions(prefix: Option<&str>, names: &[&str]) -> HashMap<String, String> {
    names
        .iter()
        .map(|name| {
            let namespaced = match prefix {
                Some(prefix) => format!("{prefix}-{name}"),
                None => (*name).to_string(),
            };
            ((*name).to_string(), namespaced)
        })
        .collect()
}
