// src/health.rs
//! Optional HTTP probe: `GET /` and `GET /health` answer `OK`, `GET /status`
//! lists tenant states.
use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::reconciler::{Reconciler, TenantState};

#[derive(Clone)]
pub struct HealthState {
    reconciler: Arc<Reconciler>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TenantStatus {
    pub tenant: String,
    pub state: TenantState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub started_at: DateTime<Utc>,
    pub running: usize,
    pub tenants: Vec<TenantStatus>,
}

pub fn router(reconciler: Arc<Reconciler>) -> Router {
    Router::new()
        .route("/", get(ok))
        .route("/health", get(ok))
        .route("/status", get(status))
        .with_state(HealthState {
            reconciler,
            started_at: Utc::now(),
        })
}

/// Serve until `cancel` fires.
pub async fn serve(port: u16, reconciler: Arc<Reconciler>, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health server to {addr}"))?;
    info!(%addr, "health server listening");
    axum::serve(listener, router(reconciler))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("health server failed")
}

async fn ok() -> &'static str {
    "OK"
}

async fn status(State(state): State<HealthState>) -> Json<StatusBody> {
    let registry = state.reconciler.registry();
    let tenants: Vec<TenantStatus> = state
        .reconciler
        .snapshot()
        .into_iter()
        .map(|(tenant, tenant_state)| TenantStatus {
            running_since: registry.get(&tenant).map(|w| w.started_at()),
            tenant,
            state: tenant_state,
        })
        .collect();
    Json(StatusBody {
        started_at: state.started_at,
        running: registry.len(),
        tenants,
    })
}
