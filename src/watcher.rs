// src/watcher.rs
//! Turns configuration tree notifications into lifecycle commands.
//!
//! For every child of the bots root two subscriptions are kept: the whole
//! tenant node (start/stop decisions) and its `chats` subtree (hot reload of
//! the permission table). Commands are submitted from the tree's dispatcher
//! task, so per tenant they arrive in the order the store changed.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    model::{LifecycleCommand, TenantConfig, parse_chats},
    reconciler::CommandSink,
    store::{ConfigTree, ListenerId, TreeEvent},
};

struct TenantListeners {
    node: ListenerId,
    chats: ListenerId,
}

/// Command for a new tenant node value.
pub fn node_command(tenant_id: &str, node: &Value) -> LifecycleCommand {
    match TenantConfig::from_node(tenant_id, Some(node)) {
        Ok(Some(config)) if config.active => LifecycleCommand::Start(tenant_id.to_string(), config),
        Ok(_) => LifecycleCommand::Stop(tenant_id.to_string()),
        Err(e) => {
            warn!(tenant = %tenant_id, kind = %e.kind(), "{e}, stopping");
            LifecycleCommand::Stop(tenant_id.to_string())
        }
    }
}

/// Command for a new `chats` subtree value.
pub fn chats_command(tenant_id: &str, chats: &Value) -> LifecycleCommand {
    match parse_chats(tenant_id, Some(chats)) {
        Ok(chats) => LifecycleCommand::UpdateChats(tenant_id.to_string(), chats),
        Err(e) => {
            warn!(tenant = %tenant_id, kind = %e.kind(), "{e}, stopping");
            LifecycleCommand::Stop(tenant_id.to_string())
        }
    }
}

pub struct ConfigWatcher {
    tree: ConfigTree,
    root: String,
    sink: Arc<dyn CommandSink>,
    tenants: Arc<DashMap<String, TenantListeners>>,
    root_listener: Mutex<Option<ListenerId>>,
}

impl ConfigWatcher {
    pub fn new(tree: ConfigTree, root: &str, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            tree,
            root: root.trim_matches('/').to_string(),
            sink,
            tenants: Arc::new(DashMap::new()),
            root_listener: Mutex::new(None),
        }
    }

    /// Subscribe to the bots root. Returns how many tenants exist right now.
    pub fn start(&self) -> usize {
        let mut root_listener = self.root_listener.lock().unwrap_or_else(PoisonError::into_inner);
        if root_listener.is_some() {
            return self.tree.child_count(&self.root);
        }

        let tree = self.tree.clone();
        let root = self.root.clone();
        let sink = self.sink.clone();
        let tenants = self.tenants.clone();
        let id = self.tree.on_children(&self.root, move |event| match event {
            TreeEvent::ChildAdded { key, .. } => watch_tenant(&tree, &root, &sink, &tenants, key),
            TreeEvent::ChildRemoved { key } => {
                sink.submit(LifecycleCommand::Stop(key.clone()));
                if let Some((_, listeners)) = tenants.remove(&key) {
                    tree.off(listeners.node);
                    tree.off(listeners.chats);
                }
                sink.retire(&key);
                info!(tenant = %key, "removed");
            }
            TreeEvent::Value(_) => {}
        });
        *root_listener = Some(id);
        self.tree.child_count(&self.root)
    }

    /// Log how many tenants the root holds, once the backend has synced.
    pub fn announce(&self) -> usize {
        let found = self.tree.child_count(&self.root);
        info!(root = %self.root, found, "Watching bots...");
        found
    }

    /// Drop every subscription. Running workers are left alone.
    pub fn stop(&self) {
        if let Some(id) = self.root_listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.tree.off(id);
        }
        let tenants: Vec<String> = self.tenants.iter().map(|kv| kv.key().clone()).collect();
        for tenant in tenants {
            if let Some((_, listeners)) = self.tenants.remove(&tenant) {
                self.tree.off(listeners.node);
                self.tree.off(listeners.chats);
            }
        }
    }

    /// Tenants currently observed, sorted.
    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.iter().map(|kv| kv.key().clone()).collect();
        ids.sort();
        ids
    }
}

fn watch_tenant(
    tree: &ConfigTree,
    root: &str,
    sink: &Arc<dyn CommandSink>,
    tenants: &DashMap<String, TenantListeners>,
    tenant_id: String,
) {
    if tenants.contains_key(&tenant_id) {
        return;
    }
    let node_path = format!("{root}/{tenant_id}");

    let node_sink = sink.clone();
    let node_tenant = tenant_id.clone();
    let node = tree.on_value(&node_path, move |event| {
        if let TreeEvent::Value(value) = event {
            // deletion is handled by the root listener
            if !value.is_null() {
                node_sink.submit(node_command(&node_tenant, &value));
            }
        }
    });

    let chats_sink = sink.clone();
    let chats_tenant = tenant_id.clone();
    let chats = tree.on_value(&format!("{node_path}/chats"), move |event| {
        if let TreeEvent::Value(value) = event {
            chats_sink.submit(chats_command(&chats_tenant, &value));
        }
    });

    info!(tenant = %tenant_id, "watching");
    tenants.insert(tenant_id, TenantListeners { node, chats });
}

impl fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("root", &self.root)
            .field("tenants", &self.watched())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    impl CommandSink for Recorder {
        fn submit(&self, command: LifecycleCommand) {
            let line = match &command {
                LifecycleCommand::Start(id, cfg) => format!("start {id} {}", cfg.token),
                LifecycleCommand::UpdateChats(id, chats) => format!("chats {id} {}", chats.len()),
                LifecycleCommand::Stop(id) => format!("stop {id}"),
            };
            self.log.lock().unwrap().push(line);
        }

        fn retire(&self, tenant_id: &str) {
            self.log.lock().unwrap().push(format!("retire {tenant_id}"));
        }
    }

    #[tokio::test]
    async fn test_existing_tenants_are_started_on_subscribe() {
        let tree = ConfigTree::new();
        tree.set("bots/t1", json!({ "token": "A", "active": true, "chats": { "c1": { "active": true } } }));
        tree.set("bots/t2", json!({ "token": "B", "active": false }));

        let recorder = Arc::new(Recorder::default());
        let watcher = ConfigWatcher::new(tree.clone(), "bots", recorder.clone());
        assert_eq!(watcher.start(), 2);
        tree.flush().await;

        assert_eq!(
            recorder.take(),
            vec!["start t1 A", "chats t1 1", "stop t2", "chats t2 0"]
        );
        assert_eq!(watcher.watched(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_announce_counts_tenants_that_arrive_after_start() {
        let tree = ConfigTree::new();
        let recorder = Arc::new(Recorder::default());
        let watcher = ConfigWatcher::new(tree.clone(), "bots", recorder.clone());
        assert_eq!(watcher.start(), 0);

        tree.set("bots", json!({ "t1": { "active": false }, "t2": { "active": false } }));
        assert_eq!(watcher.announce(), 2);
    }

    #[tokio::test]
    async fn test_changes_map_to_commands_in_order() {
        let tree = ConfigTree::new();
        let recorder = Arc::new(Recorder::default());
        let watcher = ConfigWatcher::new(tree.clone(), "/bots/", recorder.clone());
        watcher.start();

        tree.set("bots/t1", json!({ "token": "A", "active": true }));
        tree.flush().await;
        assert_eq!(recorder.take(), vec!["start t1 A", "chats t1 0"]);

        tree.set("bots/t1/chats/c1", json!({ "active": true }));
        tree.flush().await;
        // the node value changes too; same token means no restart downstream
        assert_eq!(recorder.take(), vec!["start t1 A", "chats t1 1"]);

        tree.set("bots/t1/token", json!("B"));
        tree.set("bots/t1/active", json!(false));
        tree.flush().await;
        assert_eq!(recorder.take(), vec!["start t1 B", "stop t1"]);

        tree.set("bots/t1", Value::Null);
        tree.flush().await;
        assert_eq!(recorder.take(), vec!["stop t1", "retire t1"]);
        assert!(watcher.watched().is_empty());
        // only the root listener is left
        assert_eq!(tree.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payloads_stop_the_tenant() {
        let tree = ConfigTree::new();
        let recorder = Arc::new(Recorder::default());
        let watcher = ConfigWatcher::new(tree.clone(), "bots", recorder.clone());
        watcher.start();

        tree.set("bots/t1", json!({ "active": true }));
        tree.flush().await;
        assert_eq!(recorder.take(), vec!["stop t1", "chats t1 0"]);

        tree.set("bots/t1/token", json!("A"));
        tree.set("bots/t1/chats", json!("oops"));
        tree.flush().await;
        assert_eq!(recorder.take(), vec!["start t1 A", "stop t1", "stop t1"]);
    }

    #[tokio::test]
    async fn test_stop_detaches_everything() {
        let tree = ConfigTree::new();
        tree.set("bots/t1", json!({ "token": "A", "active": true }));
        let recorder = Arc::new(Recorder::default());
        let watcher = ConfigWatcher::new(tree.clone(), "bots", recorder.clone());
        watcher.start();
        tree.flush().await;
        recorder.take();

        watcher.stop();
        assert_eq!(tree.listener_count(), 0);
        tree.set("bots/t1/active", json!(false));
        tree.flush().await;
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_node_command_rules() {
        let start = node_command("t1", &json!({ "token": "A", "active": 1 }));
        assert!(matches!(start, LifecycleCommand::Start(ref id, _) if id == "t1"));
        assert_eq!(node_command("t1", &json!({ "token": "A" })), LifecycleCommand::Stop("t1".into()));
        assert_eq!(node_command("t1", &json!(42)), LifecycleCommand::Stop("t1".into()));
        assert_eq!(chats_command("t1", &json!([1])), LifecycleCommand::Stop("t1".into()));
    }
}
