// src/supervisor.rs
//! Wires a backend, the configuration tree, the watcher and the reconciler
//! together, and tears them down again in order.
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{BotsSource, Settings},
    health,
    platform::ChatPlatform,
    reconciler::Reconciler,
    registry::Registry,
    store::{
        ConfigTree,
        file::{DirectoryWatcher, FileSource},
        firebase::FirebaseSource,
    },
    watcher::ConfigWatcher,
};

enum Backend {
    File(DirectoryWatcher),
    Firebase(JoinHandle<()>),
}

pub struct Supervisor {
    settings: Settings,
    platform: Arc<dyn ChatPlatform>,
}

impl Supervisor {
    pub fn new(settings: Settings, platform: Arc<dyn ChatPlatform>) -> Self {
        Self { settings, platform }
    }

    /// Run until SIGINT or SIGTERM, then shut down.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        shutdown_signal().await?;
        info!("shutdown requested");
        running.shutdown().await;
        Ok(())
    }

    /// Bring everything up and return a handle to it.
    pub async fn start(self) -> Result<Running> {
        let Settings {
            source,
            bots_root,
            health_enabled,
            port,
            worker,
            shutdown_timeout,
            ..
        } = self.settings;

        let cancel = CancellationToken::new();
        let tree = ConfigTree::new();
        let reconciler = Reconciler::new(Registry::new(), self.platform, worker);
        let watcher = Arc::new(ConfigWatcher::new(tree.clone(), &bots_root, reconciler.clone()));

        let backend = match source {
            BotsSource::File { path, poll_interval } => {
                let source = FileSource::new(&path, tree.clone());
                let dir_watcher = source.watch(poll_interval).await?;
                watcher.start();
                watcher.announce();
                Backend::File(dir_watcher)
            }
            BotsSource::Firebase { db_url, auth } => {
                watcher.start();
                let source = FirebaseSource::new(&db_url, &bots_root, auth, tree.clone());
                let synced = source.first_sync();
                let announcer = watcher.clone();
                let stop = cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        res = synced => {
                            if res.is_ok() {
                                announcer.announce();
                            }
                        }
                    }
                });
                Backend::Firebase(tokio::spawn(source.run(cancel.child_token())))
            }
        };

        let health = health_enabled.then(|| {
            let reconciler = reconciler.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = health::serve(port, reconciler, cancel).await {
                    error!("{e:#}");
                }
            })
        });

        info!("botrunner running");
        Ok(Running {
            tree,
            watcher,
            reconciler,
            backend,
            health,
            cancel,
            shutdown_timeout,
        })
    }
}

/// A started supervisor.
pub struct Running {
    tree: ConfigTree,
    watcher: Arc<ConfigWatcher>,
    reconciler: Arc<Reconciler>,
    backend: Backend,
    health: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl Running {
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    /// Stop following the store, then stop every worker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.watcher.stop();
        match self.backend {
            Backend::File(dir_watcher) => dir_watcher.shutdown(),
            Backend::Firebase(handle) => {
                if let Err(e) = handle.await {
                    warn!("config stream task ended abnormally: {e}");
                }
            }
        }

        self.reconciler.shutdown(self.shutdown_timeout).await;

        if let Some(handle) = self.health {
            let _ = handle.await;
        }
        info!("botrunner stopped");
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
