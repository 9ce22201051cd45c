//! Background controllers (§10.1) spawned alongside the API server:
//! the Relaunch Watcher, the Stale/Reclaim Controller, its Access-Log
//! Tailer, the Build-Result Reconciler, and the secondary stale/wake HTTP
//! server (§6.2). Each runner takes a cloned `CancellationToken` and exits
//! its loop via `tokio::select!` against `cancel.cancelled()`, mirroring
//! `eosin-meta`'s background-task shape.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use previewctl_core::reclaim::{AccessLog, AccessLogTailer, StaleReclaimController, WakeOnRequest, WakeOutcome};
use previewctl_core::reconciler::BuildResultReconciler;
use previewctl_core::relaunch::RelaunchWatcher;
use tokio_util::sync::CancellationToken;

/// Everything the stale/wake server and the background controllers need
/// that isn't already bundled inside `LifecycleOrchestrator`.
pub struct Controllers {
    pub relaunch: RelaunchWatcher,
    pub reclaim: StaleReclaimController,
    pub access_log_tailer: AccessLogTailer,
    pub reconciler: BuildResultReconciler,
    pub wake: Arc<WakeOnRequest>,
}

impl Controllers {
    /// Spawns every background loop onto the current Tokio runtime; each
    /// task exits once `cancel` fires. Does not block.
    pub fn spawn(self, cancel: CancellationToken) {
        let relaunch = self.relaunch;
        let c = cancel.clone();
        tokio::spawn(async move { relaunch.run(c).await });

        let access_log_tailer = self.access_log_tailer;
        let c = cancel.clone();
        tokio::spawn(async move { access_log_tailer.run(c).await });

        let reclaim = self.reclaim;
        let c = cancel.clone();
        tokio::spawn(async move { reclaim.run(c).await });

        let reconciler = self.reconciler;
        tokio::spawn(async move { reconciler.run(cancel).await });
    }
}

pub fn access_log() -> AccessLog {
    AccessLog::new()
}

#[derive(Clone)]
struct StaleServerState {
    wake: Arc<WakeOnRequest>,
    frontend_url: String,
}

/// The §6.2 secondary server: any path, `Host` header resolved to an
/// environment, stale environments woken, then a 307 redirect to the
/// frontend. Unknown hosts get a 404 instead of a redirect loop.
pub async fn run_stale_server(
    wake: Arc<WakeOnRequest>,
    frontend_url: impl Into<String>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = StaleServerState { wake, frontend_url: frontend_url.into() };
    let app: Router = Router::new().fallback(wake_fallback).with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!(%addr, "starting stale/wake server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn wake_fallback(State(state): State<StaleServerState>, headers: HeaderMap) -> Response {
    let Some(host) = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.wake.wake(host).await {
        Ok(WakeOutcome::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Ok(WakeOutcome::AlreadyActive { host }) | Ok(WakeOutcome::Woken { host }) => {
            let target = format!("{}/waking?host={}", state.frontend_url.trim_end_matches('/'), host);
            Redirect::temporary(&target).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, host, "failed to resolve wake-on-request host");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
