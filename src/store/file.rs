// src/store/file.rs
//! File backend: a JSON document on disk mirrored into the [`ConfigTree`],
//! re-read whenever it changes.
//!
//! ```json
//! { "bots": { "t1": { "token": "...", "active": true, "chats": { "-100123": { "active": true } } } } }
//! ```
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, info, warn};

use super::ConfigTree;
use crate::error::RunnerError;

/// Something that reacts to files in a watched directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        // Default: just call on_create_or_modify
        self.on_create_or_modify(path).await
    }
}

/// The spawned watcher tasks for one directory. `shutdown()` aborts them.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Start watching `dir` for paths `watched.is_relevant(..)` accepts. With
    /// `initial_scan`, existing relevant entries are loaded first. With
    /// `enable_retry`, a failed initial load is retried a few times.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        // If the directory doesn’t exist, bail out immediately.
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        // 1) On startup: load what is already there
        if initial_scan {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        // 2) Poll watcher pushes raw events into a channel
        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // rx gone means nobody is listening anymore
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )
        .context("creating poll watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        let handle_watcher = tokio::spawn(async move {
            // keeps `watcher` alive until aborted
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        // 3) Dispatch relevant events, one at a time and in order
        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(_) | EventKind::Modify(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_create_or_modify(path).await {
                                let err = RunnerError::store(format!("{e:#}"));
                                warn!(?path, kind = %err.kind(), "Failed to handle create/modify: {err}");
                            }
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_remove(path).await {
                                let err = RunnerError::store(format!("{e:#}"));
                                warn!(?path, kind = %err.kind(), "Failed to handle removal: {err}");
                            }
                        }
                    }
                    Err(e) => {
                        let err = RunnerError::store(e);
                        warn!(kind = %err.kind(), "Watcher error: {err}");
                    }
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher {
            handles: vec![handle_dispatch, handle_watcher],
        })
    }

    /// Abort the watcher tasks. No more events are dispatched afterwards.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    let err = RunnerError::store(format!("{e:#}"));
                    error!(kind = %err.kind(), "Failed to reload {:?}: {err}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:#}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Mirrors one JSON file into the tree root.
pub struct FileSource {
    path: PathBuf,
    tree: ConfigTree,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, tree: ConfigTree) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            tree,
        })
    }

    /// Read and parse the document, then replace the tree with it.
    pub fn load(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let doc: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if !doc.is_object() {
            bail!("{} must contain a JSON object", self.path.display());
        }
        self.tree.set("", doc);
        info!(path = %self.path.display(), "bots document loaded");
        Ok(())
    }

    /// Load once, then keep following the file.
    pub async fn watch(self: Arc<Self>, poll_interval: Duration) -> Result<DirectoryWatcher> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !self.path.exists() {
            bail!("bots file {} does not exist", self.path.display());
        }
        DirectoryWatcher::new(dir, self, true, true, poll_interval).await
    }
}

#[async_trait]
impl WatchedType for FileSource {
    fn is_relevant(&self, path: &Path) -> bool {
        path.file_name().is_some() && path.file_name() == self.path.file_name()
    }

    async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
        self.load()
    }

    /// Editors often save by delete-and-rename; a vanished file keeps the last
    /// loaded state until it reappears.
    async fn on_remove(&self, path: &Path) -> Result<()> {
        warn!(?path, "bots file removed, keeping last loaded configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_replaces_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bots.json");
        fs::write(&path, r#"{ "bots": { "t1": { "token": "A", "active": true } } }"#).unwrap();

        let tree = ConfigTree::new();
        let source = FileSource::new(&path, tree.clone());
        source.load().unwrap();
        assert_eq!(tree.read("bots/t1/token"), Some(json!("A")));

        fs::write(&path, r#"{ "bots": { "t2": { "active": false } } }"#).unwrap();
        source.load().unwrap();
        assert_eq!(tree.read("bots/t1"), None);
        assert_eq!(tree.child_count("bots"), 1);
    }

    #[tokio::test]
    async fn test_bad_document_keeps_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bots.json");
        fs::write(&path, r#"{ "bots": { "t1": { "active": true, "token": "A" } } }"#).unwrap();

        let tree = ConfigTree::new();
        let source = FileSource::new(&path, tree.clone());
        source.load().unwrap();

        fs::write(&path, "{ not json").unwrap();
        assert!(source.load().is_err());
        fs::write(&path, "[1, 2]").unwrap();
        assert!(source.load().is_err());
        assert_eq!(tree.read("bots/t1/token"), Some(json!("A")));
    }

    #[tokio::test]
    async fn test_watch_picks_up_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bots.json");
        fs::write(&path, r#"{ "bots": { "t1": { "token": "A" } } }"#).unwrap();

        let tree = ConfigTree::new();
        let watcher = FileSource::new(&path, tree.clone())
            .watch(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(tree.read("bots/t1/token"), Some(json!("A")));

        // make sure the mtime moves even on coarse filesystems
        sleep(Duration::from_millis(1100)).await;
        fs::write(&path, r#"{ "bots": { "t1": { "token": "B" } } }"#).unwrap();

        let mut token = None;
        for _ in 0..60 {
            sleep(Duration::from_millis(50)).await;
            token = tree.read("bots/t1/token");
            if token == Some(json!("B")) {
                break;
            }
        }
        assert_eq!(token, Some(json!("B")));
        watcher.shutdown();
    }

    #[tokio::test]
    async fn test_watch_requires_existing_file() {
        let dir = tempdir().unwrap();
        let tree = ConfigTree::new();
        let result = FileSource::new(dir.path().join("missing.json"), tree)
            .watch(Duration::from_millis(50))
            .await;
        assert!(result.is_err());
    }
}
