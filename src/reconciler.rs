// src/reconciler.rs
//! Applies lifecycle commands to the registry, one serial lane per tenant.
//!
//! Each tenant gets a task fed by an unbounded queue, so commands for one
//! tenant are applied strictly in arrival order while different tenants make
//! progress in parallel. A lane is retired when its tenant node disappears;
//! a later lane for the same tenant waits for the retired one to finish
//! before it touches anything.
use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    logger::{lifecycle_event, metrics},
    model::{Chats, LifecycleCommand, TenantConfig},
    platform::ChatPlatform,
    registry::Registry,
    worker::{Worker, WorkerSettings},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl TenantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantState::Stopped => "stopped",
            TenantState::Starting => "starting",
            TenantState::Running => "running",
            TenantState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the watcher sends its commands.
pub trait CommandSink: Send + Sync + 'static {
    fn submit(&self, command: LifecycleCommand);
    /// The tenant node is gone: let its lane drain and exit.
    fn retire(&self, tenant_id: &str);
}

struct Lane {
    tx: UnboundedSender<LifecycleCommand>,
    handle: JoinHandle<()>,
}

/// Everything a lane task needs, shared by all lanes.
struct LaneContext {
    registry: Arc<Registry>,
    platform: Arc<dyn ChatPlatform>,
    settings: WorkerSettings,
    states: DashMap<String, TenantState>,
    /// Lanes that were retired and have not exited yet.
    retired: DashMap<String, JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct Reconciler {
    ctx: Arc<LaneContext>,
    lanes: DashMap<String, Lane>,
}

impl Reconciler {
    pub fn new(registry: Arc<Registry>, platform: Arc<dyn ChatPlatform>, settings: WorkerSettings) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(LaneContext {
                registry,
                platform,
                settings,
                states: DashMap::new(),
                retired: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
            lanes: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    pub fn state(&self, tenant_id: &str) -> TenantState {
        self.ctx
            .states
            .get(tenant_id)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    /// Current state of every tenant seen so far, sorted by id.
    pub fn snapshot(&self) -> Vec<(String, TenantState)> {
        let mut all: Vec<_> = self
            .ctx
            .states
            .iter()
            .map(|kv| (kv.key().clone(), *kv.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Retired lanes that are still draining.
    pub fn retired_count(&self) -> usize {
        self.ctx.retired.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    fn spawn_lane(&self, tenant_id: &str) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.ctx.retired.remove(tenant_id).map(|(_, handle)| handle);
        let handle = tokio::spawn(run_lane(self.ctx.clone(), tenant_id.to_string(), rx, previous));
        debug!(tenant = %tenant_id, "lane opened");
        Lane { tx, handle }
    }

    /// Stop intake, let every lane stop its worker, and wait up to `grace`.
    /// Lanes still busy after that are aborted and whatever they left in the
    /// registry is stopped here.
    pub async fn shutdown(&self, grace: Duration) {
        self.ctx.cancel.cancel();

        let mut handles = Vec::new();
        let tenants: Vec<String> = self.lanes.iter().map(|kv| kv.key().clone()).collect();
        for tenant in tenants {
            if let Some((_, lane)) = self.lanes.remove(&tenant) {
                handles.push(lane.handle);
            }
        }
        let tenants: Vec<String> = self.ctx.retired.iter().map(|kv| kv.key().clone()).collect();
        for tenant in tenants {
            if let Some((_, handle)) = self.ctx.retired.remove(&tenant) {
                handles.push(handle);
            }
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        info!(lanes = handles.len(), "stopping all workers");
        if timeout(grace, futures::future::join_all(handles)).await.is_err() {
            warn!("lanes still busy after {grace:?}, aborting them");
            for abort in aborts {
                abort.abort();
            }
        }

        for worker in self.ctx.registry.drain() {
            warn!(tenant = %worker.tenant_id(), "force-stopping leftover worker");
            worker.stop().await;
            self.ctx.set_state(worker.tenant_id(), TenantState::Stopped);
        }
        // aborted lanes may have died mid-transition
        let stale: Vec<String> = self
            .ctx
            .states
            .iter()
            .filter(|kv| *kv.value() != TenantState::Stopped)
            .map(|kv| kv.key().clone())
            .collect();
        for tenant in stale {
            self.ctx.set_state(&tenant, TenantState::Stopped);
        }
        info!("all workers stopped");
    }
}

impl CommandSink for Reconciler {
    fn submit(&self, command: LifecycleCommand) {
        if self.ctx.cancel.is_cancelled() {
            debug!(tenant = %command.tenant_id(), command = command.name(), "shutting down, command dropped");
            return;
        }
        let tenant = command.tenant_id().to_string();
        let lane = self
            .lanes
            .entry(tenant.clone())
            .or_insert_with(|| self.spawn_lane(&tenant));
        if lane.tx.send(command).is_err() {
            // only after the lane saw the cancellation
            debug!(tenant = %tenant, "lane closed, command dropped");
        }
    }

    fn retire(&self, tenant_id: &str) {
        if let Some((_, lane)) = self.lanes.remove(tenant_id) {
            // recorded before the sender goes, so the lane finds its own entry on exit
            self.ctx.retired.insert(tenant_id.to_string(), lane.handle);
            // dropping the sender lets the lane drain what is queued, then exit
            drop(lane.tx);
            debug!(tenant = %tenant_id, "lane retired");
        }
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("lanes", &self.lanes.len())
            .field("retired", &self.ctx.retired.len())
            .field("registry", &self.ctx.registry)
            .finish()
    }
}

async fn run_lane(
    ctx: Arc<LaneContext>,
    tenant: String,
    mut rx: UnboundedReceiver<LifecycleCommand>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(tenant = %tenant, "previous lane ended abnormally: {e}");
        }
    }

    loop {
        let command = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        ctx.apply(command).await;
    }

    // a lane never leaves a worker behind, whether retired or cancelled
    ctx.stop(&tenant).await;
    if !ctx.cancel.is_cancelled() {
        ctx.states.remove_if(&tenant, |_, s| *s == TenantState::Stopped);
    }
    let me = tokio::task::id();
    ctx.retired.remove_if(&tenant, |_, handle| handle.id() == me);
    debug!(tenant = %tenant, "lane closed");
}

impl LaneContext {
    fn set_state(&self, tenant: &str, state: TenantState) {
        let previous = self.states.insert(tenant.to_string(), state);
        if previous != Some(state) {
            lifecycle_event(tenant, state.as_str());
        }
    }

    async fn apply(&self, command: LifecycleCommand) {
        debug!(tenant = %command.tenant_id(), command = command.name(), "applying");
        match command {
            LifecycleCommand::Start(tenant, config) => self.start(&tenant, config).await,
            LifecycleCommand::UpdateChats(tenant, chats) => self.update_chats(&tenant, &chats),
            LifecycleCommand::Stop(tenant) => self.stop(&tenant).await,
        }
    }

    async fn start(&self, tenant: &str, config: TenantConfig) {
        if let Some(worker) = self.registry.get(tenant) {
            if worker.token_matches(&config.token) {
                worker.update_chat_permissions(&config.chats);
                return;
            }
            info!(tenant = %tenant, "token changed, restarting");
            self.stop(tenant).await;
        }

        self.set_state(tenant, TenantState::Starting);
        let worker = match Worker::create(
            tenant,
            &config.token,
            &config.chats,
            self.platform.as_ref(),
            &self.settings,
        )
        .await
        {
            Ok(worker) => Arc::new(worker),
            Err(e) => {
                error!(tenant = %tenant, kind = %e.kind(), "{e}");
                metrics().connect_failed(tenant);
                self.set_state(tenant, TenantState::Stopped);
                return;
            }
        };

        match self.registry.insert(tenant, worker.clone()) {
            Ok(()) => {
                metrics().worker_started(tenant);
                self.set_state(tenant, TenantState::Running);
            }
            Err(e) => {
                error!(tenant = %tenant, kind = %e.kind(), "{e}");
                worker.stop().await;
                self.set_state(tenant, TenantState::Running);
            }
        }
    }

    fn update_chats(&self, tenant: &str, chats: &Chats) {
        match self.registry.get(tenant) {
            Some(worker) => worker.update_chat_permissions(chats),
            None => warn!(tenant = %tenant, "chats changed while not running, ignored"),
        }
    }

    async fn stop(&self, tenant: &str) {
        let Some(worker) = self.registry.remove(tenant) else {
            if self.states.get(tenant).is_some_and(|s| *s.value() != TenantState::Stopped) {
                self.set_state(tenant, TenantState::Stopped);
            }
            return;
        };
        self.set_state(tenant, TenantState::Stopping);
        worker.stop().await;
        self.set_state(tenant, TenantState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ChatConfig, platform::mock::MockPlatform};

    fn config(tenant: &str, token: &str, chats: &[(&str, bool)]) -> TenantConfig {
        TenantConfig {
            tenant_id: tenant.to_string(),
            token: token.to_string(),
            active: true,
            chats: chats
                .iter()
                .map(|(id, active)| {
                    (
                        id.to_string(),
                        ChatConfig {
                            chat_id: id.to_string(),
                            active: *active,
                        },
                    )
                })
                .collect(),
        }
    }

    fn reconciler(platform: &MockPlatform) -> Arc<Reconciler> {
        Reconciler::new(Registry::new(), Arc::new(platform.clone()), WorkerSettings::default())
    }

    async fn settle(reconciler: &Reconciler, tenant: &str, want: TenantState) {
        for _ in 0..200 {
            if reconciler.state(tenant) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{tenant} never reached {want}, is {}", reconciler.state(tenant));
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let platform = MockPlatform::new();
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "A", &[("c1", true)])));
        settle(&r, "t1", TenantState::Running).await;
        assert_eq!(platform.live_sessions().len(), 1);

        r.submit(LifecycleCommand::Stop("t1".into()));
        settle(&r, "t1", TenantState::Stopped).await;
        assert!(r.registry().is_empty());
        assert!(platform.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_same_token_start_only_swaps_chats() {
        let platform = MockPlatform::new();
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "A", &[("c1", true)])));
        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "A", &[("c1", false)])));
        settle(&r, "t1", TenantState::Running).await;
        for _ in 0..200 {
            if r.registry().get("t1").is_some_and(|w| !w.permissions().is_allowed("c1")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!r.registry().get("t1").unwrap().permissions().is_allowed("c1"));
        assert_eq!(platform.opened_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_tenant_stopped() {
        let platform = MockPlatform::new();
        platform.reject_token("bad");
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "bad", &[])));
        r.submit(LifecycleCommand::Start("t2".into(), config("t2", "good", &[])));
        settle(&r, "t2", TenantState::Running).await;
        settle(&r, "t1", TenantState::Stopped).await;
        assert!(r.registry().get("t1").is_none());
        assert_eq!(r.registry().tenants(), vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn test_update_chats_while_stopped_is_ignored() {
        let platform = MockPlatform::new();
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::UpdateChats("t1".into(), Chats::new()));
        r.submit(LifecycleCommand::Stop("t1".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r.state("t1"), TenantState::Stopped);
        assert_eq!(platform.opened_count(), 0);
        assert!(r.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_retired_lane_finishes_before_new_lane_runs() {
        let platform = MockPlatform::new();
        platform.set_connect_delay(Duration::from_millis(50));
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "A", &[])));
        r.submit(LifecycleCommand::Stop("t1".into()));
        r.retire("t1");
        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "B", &[])));

        for _ in 0..200 {
            if platform.opened_count() == 2 && r.state("t1") == TenantState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let live = platform.live_sessions();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1, "B");
        assert_eq!(platform.opened_count(), 2);
    }

    #[tokio::test]
    async fn test_retired_lanes_are_forgotten_once_they_exit() {
        let platform = MockPlatform::new();
        let r = reconciler(&platform);

        for i in 0..20 {
            let tenant = format!("t{i}");
            r.submit(LifecycleCommand::Start(tenant.clone(), config(&tenant, "A", &[])));
            r.submit(LifecycleCommand::Stop(tenant.clone()));
            r.retire(&tenant);
        }
        for _ in 0..200 {
            if r.retired_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(r.retired_count(), 0);
        assert!(r.snapshot().is_empty());
        assert!(platform.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_by_tenant() {
        let platform = MockPlatform::new();
        let r = reconciler(&platform);

        for tenant in ["b", "c", "a"] {
            r.submit(LifecycleCommand::Start(tenant.into(), config(tenant, tenant, &[])));
        }
        for tenant in ["a", "b", "c"] {
            settle(&r, tenant, TenantState::Running).await;
        }
        let ids: Vec<String> = r.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_aborted_start_is_reported_stopped() {
        let platform = MockPlatform::new();
        platform.set_connect_delay(Duration::from_millis(500));
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "A", &[])));
        settle(&r, "t1", TenantState::Starting).await;

        r.shutdown(Duration::from_millis(20)).await;
        assert_eq!(r.state("t1"), TenantState::Stopped);
        assert!(r.snapshot().iter().all(|(_, s)| *s == TenantState::Stopped));
        assert!(r.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_refuses_new_work() {
        let platform = MockPlatform::new();
        let r = reconciler(&platform);

        r.submit(LifecycleCommand::Start("t1".into(), config("t1", "A", &[])));
        r.submit(LifecycleCommand::Start("t2".into(), config("t2", "B", &[])));
        settle(&r, "t1", TenantState::Running).await;
        settle(&r, "t2", TenantState::Running).await;

        r.shutdown(Duration::from_secs(2)).await;
        assert!(r.registry().is_empty());
        assert!(platform.live_sessions().is_empty());
        assert!(r.is_shutting_down());

        r.submit(LifecycleCommand::Start("t3".into(), config("t3", "C", &[])));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(platform.opened_count(), 2);
    }
}
