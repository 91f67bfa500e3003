// src/platform/mock.rs
//! In-memory platform. Used by the test-suite and by `botrunner run --dry-run`,
//! where sessions are opened and closed but nothing leaves the process.
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::info;

use super::{ChatPlatform, HandlerSet, InboundEvent, PlatformApi, PlatformError, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub session_id: u64,
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub session_id: u64,
    pub chat_id: String,
    pub text: String,
}

struct SessionRecord {
    id: u64,
    token: String,
    handlers: HandlerSet,
    session: Arc<MockSession>,
}

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    sessions: Mutex<Vec<SessionRecord>>,
    rejected_tokens: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
    fail_approvals: AtomicBool,
    approvals: Mutex<Vec<Approval>>,
    sent: Mutex<Vec<SentText>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fake platform that records everything.
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<MockState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions opened with `token` fail with `Unauthorized`.
    pub fn reject_token(&self, token: &str) {
        lock(&self.state.rejected_tokens).insert(token.to_string());
    }

    /// Delay every `open_session` call, to widen race windows in tests.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = delay;
    }

    pub fn fail_approvals(&self, fail: bool) {
        self.state.fail_approvals.store(fail, Ordering::SeqCst);
    }

    pub fn opened_count(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    /// `(session_id, token)` of every session not yet closed.
    pub fn live_sessions(&self) -> Vec<(u64, String)> {
        lock(&self.state.sessions)
            .iter()
            .filter(|r| !r.session.is_closed())
            .map(|r| (r.id, r.token.clone()))
            .collect()
    }

    /// How many times `close` was called on session `id`.
    pub fn close_calls(&self, id: u64) -> usize {
        lock(&self.state.sessions)
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.session.close_calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn approvals(&self) -> Vec<Approval> {
        lock(&self.state.approvals).clone()
    }

    pub fn sent(&self) -> Vec<SentText> {
        lock(&self.state.sent).clone()
    }

    /// Deliver `event` to the live session opened with `token`.
    /// Returns false when no such session is open.
    pub async fn inject(&self, token: &str, event: InboundEvent) -> bool {
        let target = {
            let sessions = lock(&self.state.sessions);
            sessions
                .iter()
                .rev()
                .find(|r| r.token == token && !r.session.is_closed())
                .map(|r| (r.handlers.clone(), r.session.clone()))
        };
        match target {
            Some((handlers, session)) => {
                handlers.dispatch(session.as_ref(), event).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChatPlatform for MockPlatform {
    async fn open_session(
        &self,
        token: &str,
        handlers: HandlerSet,
    ) -> Result<Arc<dyn Session>, PlatformError> {
        let delay = *lock(&self.state.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.state.rejected_tokens).contains(token) {
            return Err(PlatformError::Unauthorized("token rejected".into()));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(MockSession {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        lock(&self.state.sessions).push(SessionRecord {
            id,
            token: token.to_string(),
            handlers,
            session: session.clone(),
        });
        info!(session_id = id, "mock session opened");
        Ok(session)
    }
}

pub struct MockSession {
    id: u64,
    state: Arc<MockState>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformApi for MockSession {
    async fn approve_join_request(&self, chat_id: &str, user_id: &str) -> Result<(), PlatformError> {
        if self.is_closed() {
            return Err(PlatformError::Closed);
        }
        if self.state.fail_approvals.load(Ordering::SeqCst) {
            return Err(PlatformError::Request("approve rejected".into()));
        }
        lock(&self.state.approvals).push(Approval {
            session_id: self.id,
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), PlatformError> {
        if self.is_closed() {
            return Err(PlatformError::Closed);
        }
        lock(&self.state.sent).push(SentText {
            session_id: self.id,
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl Session for MockSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(session_id = self.id, "mock session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_close_and_reject() {
        let platform = MockPlatform::new();
        platform.reject_token("bad");
        assert!(platform.open_session("bad", HandlerSet::new()).await.is_err());

        let session = platform.open_session("good", HandlerSet::new()).await.unwrap();
        assert_eq!(platform.live_sessions(), vec![(session.session_id(), "good".to_string())]);

        session.close().await;
        session.close().await;
        assert!(platform.live_sessions().is_empty());
        assert_eq!(platform.close_calls(session.session_id()), 2);
        assert_eq!(
            session.approve_join_request("c", "u").await,
            Err(PlatformError::Closed)
        );
    }

    #[tokio::test]
    async fn test_inject_without_session() {
        let platform = MockPlatform::new();
        let delivered = platform
            .inject("nobody", InboundEvent::Command { chat_id: "c".into(), name: "ping".into() })
            .await;
        assert!(!delivered);
    }
}
