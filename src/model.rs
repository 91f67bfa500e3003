//! Tenant configuration snapshots and the lifecycle commands derived from them.
use std::{collections::{BTreeMap, HashMap}, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunnerError;

/// Per-chat settings; `active` decides whether join requests are auto-approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub chat_id: String,
    pub active: bool,
}

pub type Chats = BTreeMap<String, ChatConfig>;

/// One observation of `bots/{tenant_id}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub token: String,
    pub active: bool,
    pub chats: Chats,
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("tenant_id", &self.tenant_id)
            .field("token", &"[REDACTED]")
            .field("active", &self.active)
            .field("chats", &self.chats)
            .finish()
    }
}

impl TenantConfig {
    /// Normalize a raw node payload.
    ///
    /// Returns `Ok(None)` when the node is absent. A node that is active but has
    /// no usable token, or whose `chats` is not an object, is malformed.
    pub fn from_node(tenant_id: &str, node: Option<&Value>) -> Result<Option<Self>, RunnerError> {
        let node = match node {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(RunnerError::malformed(
                    tenant_id,
                    format!("expected an object, got {}", type_name(other)),
                ));
            }
        };

        let active = node.get("active").map(truthy).unwrap_or(false);
        let chats = parse_chats(tenant_id, node.get("chats"))?;
        let token = match node.get("token") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ if !active => String::new(),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(RunnerError::malformed(tenant_id, "missing token"));
            }
            Some(other) => {
                return Err(RunnerError::malformed(
                    tenant_id,
                    format!("token must be a string, got {}", type_name(other)),
                ));
            }
        };

        Ok(Some(TenantConfig {
            tenant_id: tenant_id.to_string(),
            token,
            active,
            chats,
        }))
    }
}

/// Normalize a `chats` subtree. `null`/absent means no chats.
pub fn parse_chats(tenant_id: &str, value: Option<&Value>) -> Result<Chats, RunnerError> {
    match value {
        None | Some(Value::Null) => Ok(Chats::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(chat_id, cfg)| {
                let active = cfg.get("active").map(truthy).unwrap_or(false);
                (
                    chat_id.clone(),
                    ChatConfig {
                        chat_id: chat_id.clone(),
                        active,
                    },
                )
            })
            .collect()),
        Some(other) => Err(RunnerError::malformed(
            tenant_id,
            format!("chats must be an object, got {}", type_name(other)),
        )),
    }
}

/// JavaScript-style truthiness, which is what the admin panel writes against.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Flattened view of a tenant's chats: chat id -> join requests allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatPermissions(HashMap<String, bool>);

impl ChatPermissions {
    pub fn from_chats(chats: &Chats) -> Self {
        Self(
            chats
                .values()
                .map(|c| (c.chat_id.clone(), c.active))
                .collect(),
        )
    }

    /// Unknown chats are denied.
    pub fn is_allowed(&self, chat_id: &str) -> bool {
        self.0.get(chat_id).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the watcher asks the reconciler to do for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommand {
    Start(String, TenantConfig),
    UpdateChats(String, Chats),
    Stop(String),
}

impl LifecycleCommand {
    pub fn tenant_id(&self) -> &str {
        match self {
            LifecycleCommand::Start(id, _)
            | LifecycleCommand::UpdateChats(id, _)
            | LifecycleCommand::Stop(id) => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleCommand::Start(..) => "start",
            LifecycleCommand::UpdateChats(..) => "update_chats",
            LifecycleCommand::Stop(_) => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_absent_node_is_none() {
        assert_eq!(TenantConfig::from_node("t1", None).unwrap(), None);
        assert_eq!(TenantConfig::from_node("t1", Some(&Value::Null)).unwrap(), None);
    }

    #[test]
    fn test_full_node_is_normalized() {
        let node = json!({
            "token": "A",
            "active": true,
            "chats": { "c1": { "active": true }, "c2": { "active": 0 }, "c3": "junk" }
        });
        let cfg = TenantConfig::from_node("t1", Some(&node)).unwrap().unwrap();
        assert_eq!(cfg.token, "A");
        assert!(cfg.active);
        assert!(cfg.chats["c1"].active);
        assert!(!cfg.chats["c2"].active);
        assert!(!cfg.chats["c3"].active);
    }

    #[test]
    fn test_inactive_node_may_lack_token() {
        let node = json!({ "active": false });
        let cfg = TenantConfig::from_node("t1", Some(&node)).unwrap().unwrap();
        assert!(!cfg.active);
        assert!(cfg.chats.is_empty());
    }

    #[test]
    fn test_active_node_without_token_is_malformed() {
        let node = json!({ "active": true, "token": "  " });
        let err = TenantConfig::from_node("t1", Some(&node)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMalformed);

        let node = json!({ "active": true, "token": 42 });
        assert!(TenantConfig::from_node("t1", Some(&node)).is_err());
    }

    #[test]
    fn test_chats_must_be_an_object() {
        let err = parse_chats("t1", Some(&json!([1, 2]))).unwrap_err();
        assert_eq!(err.tenant(), Some("t1"));
        assert!(parse_chats("t1", Some(&Value::Null)).unwrap().is_empty());
    }

    #[test]
    fn test_permissions_deny_unknown_chats() {
        let chats = parse_chats("t1", Some(&json!({ "c1": { "active": true } }))).unwrap();
        let perms = ChatPermissions::from_chats(&chats);
        assert!(perms.is_allowed("c1"));
        assert!(!perms.is_allowed("nope"));
        assert_eq!(perms.len(), 1);
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let node = json!({ "token": "secret-token", "active": true });
        let cfg = TenantConfig::from_node("t1", Some(&node)).unwrap().unwrap();
        assert!(!format!("{cfg:?}").contains("secret-token"));
    }
}
