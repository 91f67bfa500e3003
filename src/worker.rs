// src/worker.rs
//! One live bot: a platform session plus the chat permission table its
//! join-request handler reads from.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{
    error::RunnerError,
    logger::metrics,
    model::{ChatPermissions, Chats},
    platform::{ChatPlatform, EventHandler, EventKind, HandlerSet, InboundEvent, PlatformApi, Session},
};

/// Liveness command every worker answers.
pub const PING_COMMAND: &str = "ping";

/// Bounds on the network calls a worker makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Decides join requests against the current permission table.
struct JoinGate {
    tenant_id: String,
    permissions: ArcSwap<ChatPermissions>,
    request_timeout: Duration,
}

impl JoinGate {
    /// `Ok(true)` when the request was approved, `Ok(false)` when the chat is
    /// not enabled and nothing was sent.
    async fn handle_join_request<A>(&self, api: &A, chat_id: &str, user_id: &str) -> Result<bool, RunnerError>
    where
        A: PlatformApi + ?Sized,
    {
        if !self.permissions.load().is_allowed(chat_id) {
            debug!(tenant = %self.tenant_id, chat_id, user_id, "join request ignored, chat not enabled");
            return Ok(false);
        }

        let approve_err = |reason: String| RunnerError::Approve {
            tenant: self.tenant_id.clone(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            reason,
        };
        match timeout(self.request_timeout, api.approve_join_request(chat_id, user_id)).await {
            Ok(Ok(())) => {
                info!(tenant = %self.tenant_id, chat_id, user_id, "approved join request");
                metrics().join_request_approved(&self.tenant_id);
                Ok(true)
            }
            Ok(Err(e)) => Err(approve_err(e.to_string())),
            Err(_) => Err(approve_err(format!("timed out after {:?}", self.request_timeout))),
        }
    }
}

#[async_trait]
impl EventHandler for JoinGate {
    async fn handle(&self, api: &dyn PlatformApi, event: InboundEvent) {
        let InboundEvent::JoinRequest { chat_id, user_id } = event else {
            return;
        };
        if let Err(e) = self.handle_join_request(api, &chat_id, &user_id).await {
            error!(tenant = %self.tenant_id, kind = %e.kind(), "{e}");
            metrics().approve_failed(&self.tenant_id);
        }
    }
}

struct PingHandler {
    tenant_id: String,
}

#[async_trait]
impl EventHandler for PingHandler {
    async fn handle(&self, api: &dyn PlatformApi, event: InboundEvent) {
        if let InboundEvent::Command { chat_id, .. } = event {
            if let Err(e) = api.send_text(&chat_id, "pong").await {
                warn!(tenant = %self.tenant_id, chat_id, "could not answer ping: {e}");
            }
        }
    }
}

pub struct Worker {
    tenant_id: String,
    token: String,
    session: Arc<dyn Session>,
    gate: Arc<JoinGate>,
    stopped: AtomicBool,
    stop_timeout: Duration,
    started_at: DateTime<Utc>,
}

impl Worker {
    /// Open a session for `tenant_id`. The join-request and ping handlers are
    /// registered before the session starts receiving events.
    pub async fn create(
        tenant_id: &str,
        token: &str,
        chats: &Chats,
        platform: &dyn ChatPlatform,
        settings: &WorkerSettings,
    ) -> Result<Self, RunnerError> {
        let gate = Arc::new(JoinGate {
            tenant_id: tenant_id.to_string(),
            permissions: ArcSwap::from_pointee(ChatPermissions::from_chats(chats)),
            request_timeout: settings.request_timeout,
        });
        let handlers = HandlerSet::new()
            .on(EventKind::JoinRequest, gate.clone())
            .on(
                EventKind::Command(PING_COMMAND.to_string()),
                Arc::new(PingHandler {
                    tenant_id: tenant_id.to_string(),
                }),
            );

        let session = match timeout(settings.connect_timeout, platform.open_session(token, handlers)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(RunnerError::connect(tenant_id, e)),
            Err(_) => {
                return Err(RunnerError::connect(
                    tenant_id,
                    format!("timed out after {:?}", settings.connect_timeout),
                ));
            }
        };

        info!(tenant = %tenant_id, session_id = session.session_id(), chats = chats.len(), "launched");
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            token: token.to_string(),
            session,
            gate,
            stopped: AtomicBool::new(false),
            stop_timeout: settings.stop_timeout,
            started_at: Utc::now(),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn token_matches(&self, token: &str) -> bool {
        self.token == token
    }

    /// Snapshot of the table the join handler currently reads.
    pub fn permissions(&self) -> Arc<ChatPermissions> {
        self.gate.permissions.load_full()
    }

    /// Approve `user_id` into `chat_id` if that chat is enabled.
    pub async fn handle_join_request(&self, chat_id: &str, user_id: &str) -> Result<bool, RunnerError> {
        self.gate
            .handle_join_request(self.session.as_ref(), chat_id, user_id)
            .await
    }

    /// Swap in a new permission table without touching the session.
    pub fn update_chat_permissions(&self, chats: &Chats) {
        let table = ChatPermissions::from_chats(chats);
        let size = table.len();
        self.gate.permissions.store(Arc::new(table));
        info!(tenant = %self.tenant_id, chats = size, "chats updated");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Close the session. Only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if timeout(self.stop_timeout, self.session.close()).await.is_err() {
            warn!(
                tenant = %self.tenant_id,
                session_id = self.session_id(),
                "session did not close within {:?}, releasing it anyway",
                self.stop_timeout
            );
        }
        metrics().worker_stopped(&self.tenant_id);
        info!(tenant = %self.tenant_id, "stopped");
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("tenant_id", &self.tenant_id)
            .field("token", &"[REDACTED]")
            .field("session_id", &self.session_id())
            .field("stopped", &self.is_stopped())
            .field("started_at", &self.started_at)
            .finish()
    }
}
