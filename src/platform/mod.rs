// src/platform/mod.rs
//! The chat platform as seen by a worker: open a session with a token, get
//! inbound events routed to registered handlers, approve join requests.
pub mod mock;
pub mod telegram;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tracing::trace;

/// Something that arrived over a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    JoinRequest { chat_id: String, user_id: String },
    Command { chat_id: String, name: String },
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::JoinRequest { .. } => EventKind::JoinRequest,
            InboundEvent::Command { name, .. } => EventKind::Command(name.to_lowercase()),
        }
    }
}

/// Key under which a handler is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinRequest,
    Command(String),
}

/// Outbound calls a handler may make while reacting to an event.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn approve_join_request(&self, chat_id: &str, user_id: &str) -> Result<(), PlatformError>;
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, api: &dyn PlatformApi, event: InboundEvent);
}

/// Handlers registered for a session, keyed by event kind.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Route an event to its handler; events nobody registered for are dropped.
    pub async fn dispatch(&self, api: &dyn PlatformApi, event: InboundEvent) {
        match self.handlers.get(&event.kind()) {
            Some(handler) => handler.handle(api, event).await,
            None => trace!(?event, "no handler registered"),
        }
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A live connection. `close` must be safe to call more than once.
#[async_trait]
pub trait Session: PlatformApi {
    /// Stable identifier of this connection, for logs and tests.
    fn session_id(&self) -> u64;
    async fn close(&self);
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn open_session(
        &self,
        token: &str,
        handlers: HandlerSet,
    ) -> Result<Arc<dyn Session>, PlatformError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("session closed")]
    Closed,
}
