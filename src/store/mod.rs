// src/store/mod.rs
//! Local mirror of the remote configuration tree.
//!
//! Backends (`file`, `firebase`) write into a [`ConfigTree`]; consumers
//! subscribe to paths and get realtime-database style notifications:
//! `on_children` reports keys appearing and disappearing under a path,
//! `on_value` reports the full value at a path (null on deletion) every time it
//! changes, starting with the current value.
//!
//! All notifications, including the initial ones delivered on subscribe, go
//! through a single dispatcher task in the order the tree changed, so a
//! callback never observes an older value after a newer one. Callbacks run on
//! that task and may subscribe or unsubscribe freely, but must not block.
pub mod file;
pub mod firebase;

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    ChildAdded { key: String, value: Value },
    ChildRemoved { key: String },
    /// New value at the subscribed path; `Value::Null` when it was deleted.
    Value(Value),
}

pub type Callback = Arc<dyn Fn(TreeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenKind {
    Children,
    Value,
}

struct Listener {
    id: ListenerId,
    path: Vec<String>,
    kind: ListenKind,
    callback: Callback,
}

enum Dispatch {
    Event {
        id: ListenerId,
        callback: Callback,
        event: TreeEvent,
    },
    Barrier(oneshot::Sender<()>),
}

struct TreeState {
    root: Value,
    listeners: Vec<Listener>,
    next_id: u64,
}

/// Shared handle to the tree. Cloning is cheap.
#[derive(Clone)]
pub struct ConfigTree {
    state: Arc<Mutex<TreeState>>,
    queue: mpsc::UnboundedSender<Dispatch>,
    delivered: Arc<AtomicU64>,
}

fn lock(m: &Mutex<TreeState>) -> MutexGuard<'_, TreeState> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `"bots/t1/chats"` -> `["bots", "t1", "chats"]`; empty segments are dropped.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

static NULL: Value = Value::Null;

fn value_at<'a>(root: &'a Value, path: &[String]) -> &'a Value {
    let mut node = root;
    for segment in path {
        match node.get(segment.as_str()) {
            Some(child) => node = child,
            None => return &NULL,
        }
    }
    node
}

/// Write `value` at `path`, creating intermediate objects. Null deletes.
fn write_at(node: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if !rest.is_empty() {
            let child = map.entry(first.clone()).or_insert(Value::Null);
            write_at(child, rest, value);
        } else if value.is_null() {
            map.remove(first);
        } else {
            map.insert(first.clone(), value);
        }
    }
}

/// Empty objects do not exist in the tree, same as the realtime database.
fn prune(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            prune(child);
        }
        map.retain(|_, child| !child.is_null() && !matches!(child, Value::Object(m) if m.is_empty()));
        if map.is_empty() {
            *value = Value::Null;
        }
    }
}

fn child_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

impl ConfigTree {
    /// Create an empty tree and spawn its dispatcher on the current runtime.
    pub fn new() -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Dispatch>();
        let state = Arc::new(Mutex::new(TreeState {
            root: Value::Null,
            listeners: Vec::new(),
            next_id: 0,
        }));

        let delivered = Arc::new(AtomicU64::new(0));

        let dispatch_state = Arc::downgrade(&state);
        let dispatch_count = delivered.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Dispatch::Event { id, callback, event } => {
                        // skip listeners removed after the event was queued
                        let Some(state) = dispatch_state.upgrade() else { break };
                        let live = lock(&state).listeners.iter().any(|l| l.id == id);
                        drop(state);
                        if live {
                            callback(event);
                            dispatch_count.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Dispatch::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            trace!("config tree dispatcher exited");
        });

        Self {
            state,
            queue,
            delivered,
        }
    }

    /// One-shot read. `None` when nothing is stored at `path`.
    pub fn read(&self, path: &str) -> Option<Value> {
        let state = lock(&self.state);
        match value_at(&state.root, &split_path(path)) {
            Value::Null => None,
            v => Some(v.clone()),
        }
    }

    /// Number of children under `path`.
    pub fn child_count(&self, path: &str) -> usize {
        let state = lock(&self.state);
        child_keys(value_at(&state.root, &split_path(path))).len()
    }

    /// Replace the value at `path`; `Value::Null` removes it.
    pub fn set(&self, path: &str, value: Value) {
        let path = split_path(path);
        self.mutate(|root| write_at(root, &path, value));
    }

    /// Merge `children` into the object at `path`, child by child.
    pub fn update(&self, path: &str, children: Map<String, Value>) {
        let path = split_path(path);
        self.mutate(|root| {
            for (key, value) in children {
                let mut child_path = path.clone();
                child_path.extend(split_path(&key));
                write_at(root, &child_path, value);
            }
        });
    }

    /// Listen for keys added to or removed from the object at `path`.
    /// Existing children are reported as added right away.
    pub fn on_children(&self, path: &str, callback: impl Fn(TreeEvent) + Send + Sync + 'static) -> ListenerId {
        self.listen(path, ListenKind::Children, Arc::new(callback))
    }

    /// Listen for the value at `path`. The current value is reported right away.
    pub fn on_value(&self, path: &str, callback: impl Fn(TreeEvent) + Send + Sync + 'static) -> ListenerId {
        self.listen(path, ListenKind::Value, Arc::new(callback))
    }

    /// Detach a listener. Events already queued for it are dropped.
    pub fn off(&self, id: ListenerId) {
        lock(&self.state).listeners.retain(|l| l.id != id);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    /// Wait until the dispatcher goes quiet: everything queued so far has been
    /// delivered, and so has everything those callbacks queued in turn.
    pub async fn flush(&self) {
        loop {
            let before = self.delivered.load(Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            if self.queue.send(Dispatch::Barrier(tx)).is_err() || rx.await.is_err() {
                return;
            }
            if self.delivered.load(Ordering::SeqCst) == before {
                return;
            }
        }
    }

    fn listen(&self, path: &str, kind: ListenKind, callback: Callback) -> ListenerId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        let path = split_path(path);

        let current = value_at(&state.root, &path);
        let initial: Vec<TreeEvent> = match kind {
            ListenKind::Value => vec![TreeEvent::Value(current.clone())],
            ListenKind::Children => match current {
                Value::Object(map) => map
                    .iter()
                    .map(|(key, value)| TreeEvent::ChildAdded {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                _ => Vec::new(),
            },
        };
        for event in initial {
            self.enqueue(id, &callback, event);
        }

        state.listeners.push(Listener {
            id,
            path,
            kind,
            callback,
        });
        id
    }

    fn enqueue(&self, id: ListenerId, callback: &Callback, event: TreeEvent) {
        // the dispatcher only goes away with the runtime
        let _ = self.queue.send(Dispatch::Event {
            id,
            callback: callback.clone(),
            event,
        });
    }

    /// Apply `change` and queue notifications for every listener whose view
    /// changed, in registration order. Runs under the state lock so queue
    /// order matches mutation order.
    fn mutate(&self, change: impl FnOnce(&mut Value)) {
        let mut state = lock(&self.state);
        let before = state.root.clone();
        change(&mut state.root);
        prune(&mut state.root);

        if before == state.root {
            return;
        }

        for listener in &state.listeners {
            let old = value_at(&before, &listener.path);
            let new = value_at(&state.root, &listener.path);
            if old == new {
                continue;
            }
            match listener.kind {
                ListenKind::Value => {
                    self.enqueue(listener.id, &listener.callback, TreeEvent::Value(new.clone()));
                }
                ListenKind::Children => {
                    let old_keys = child_keys(old);
                    let new_keys = child_keys(new);
                    for key in old_keys.iter().filter(|k| !new_keys.contains(k)) {
                        self.enqueue(
                            listener.id,
                            &listener.callback,
                            TreeEvent::ChildRemoved { key: key.clone() },
                        );
                    }
                    for key in new_keys.iter().filter(|k| !old_keys.contains(k)) {
                        let value = new.get(key.as_str()).cloned().unwrap_or(Value::Null);
                        self.enqueue(
                            listener.id,
                            &listener.callback,
                            TreeEvent::ChildAdded {
                                key: key.clone(),
                                value,
                            },
                        );
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ConfigTree")
            .field("children", &child_keys(&state.root))
            .field("listeners", &state.listeners.len())
            .finish()
    }
}
