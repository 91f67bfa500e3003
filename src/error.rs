// src/error.rs
use std::fmt;

use thiserror::Error;

/// Failure kinds the runner distinguishes. Every variant carries the tenant it
/// belongs to so a failure can be logged at a single boundary with the right
/// context and never leaks into another tenant's state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// The platform session could not be opened (or did not open in time).
    #[error("[{tenant}] could not connect: {reason}")]
    Connect { tenant: String, reason: String },

    /// A worker was inserted for a tenant that already has one.
    #[error("[{tenant}] a worker is already registered for this tenant")]
    DuplicateTenant { tenant: String },

    /// The platform rejected (or timed out) an approve call.
    #[error("[{tenant}] approve failed for user={user_id} chat={chat_id}: {reason}")]
    Approve {
        tenant: String,
        chat_id: String,
        user_id: String,
        reason: String,
    },

    /// The tenant node carried a payload we cannot run.
    #[error("[{tenant}] malformed config: {reason}")]
    ConfigMalformed { tenant: String, reason: String },

    /// The configuration backend failed.
    #[error("config store error: {0}")]
    Store(String),
}

impl RunnerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunnerError::Connect { .. } => ErrorKind::Connect,
            RunnerError::DuplicateTenant { .. } => ErrorKind::DuplicateTenant,
            RunnerError::Approve { .. } => ErrorKind::Approve,
            RunnerError::ConfigMalformed { .. } => ErrorKind::ConfigMalformed,
            RunnerError::Store(_) => ErrorKind::Store,
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        match self {
            RunnerError::Connect { tenant, .. }
            | RunnerError::DuplicateTenant { tenant }
            | RunnerError::Approve { tenant, .. }
            | RunnerError::ConfigMalformed { tenant, .. } => Some(tenant),
            RunnerError::Store(_) => None,
        }
    }

    pub fn connect(tenant: &str, reason: impl fmt::Display) -> Self {
        RunnerError::Connect {
            tenant: tenant.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn store(reason: impl fmt::Display) -> Self {
        RunnerError::Store(reason.to_string())
    }

    pub fn malformed(tenant: &str, reason: impl fmt::Display) -> Self {
        RunnerError::ConfigMalformed {
            tenant: tenant.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Short tag used as the `kind` field on log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    DuplicateTenant,
    Approve,
    ConfigMalformed,
    Store,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connect => "connect",
            ErrorKind::DuplicateTenant => "duplicate_tenant",
            ErrorKind::Approve => "approve",
            ErrorKind::ConfigMalformed => "config_malformed",
            ErrorKind::Store => "store",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
