//! `/v2/environments/*` handlers (§6.1): listing, the public summary used
//! by the frontend env page, and the two SSE log streams.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use previewctl_cluster::LogKind;
use previewctl_types::{Environment, Service};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{ApiError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner: String,
    pub repo: Option<String>,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>, _user: AuthUser) -> Result<Json<Vec<Environment>>> {
    let mut envs = state.environments.list_by_owner(&query.owner, false).await?;
    if let Some(repo) = &query.repo {
        envs.retain(|e| &e.repo == repo);
    }
    Ok(Json(envs))
}

#[derive(Debug, Serialize)]
pub struct PublicEnvironmentResponse {
    pub id: String,
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub pull_request: Option<i64>,
    pub status: previewctl_types::EnvironmentStatus,
    pub services: Vec<Service>,
}

pub async fn public(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<PublicEnvironmentResponse>> {
    let env = state
        .environments
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("environment {id} not found")))?;
    let services = state.services.list_by_environment(&id).await?;
    Ok(Json(PublicEnvironmentResponse {
        id: env.id,
        owner: env.owner,
        repo: env.repo,
        branch: env.branch,
        pull_request: env.pull_request,
        status: env.status,
        services,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub service: Option<String>,
}

async fn first_service_selector(state: &AppState, environment_id: &str, service: Option<&str>) -> Result<String> {
    let services = state.services.list_by_environment(environment_id).await?;
    let chosen = match service {
        Some(name) => services.into_iter().find(|s| s.name == name),
        None => services.into_iter().next(),
    };
    let service = chosen.ok_or_else(|| ApiError::NotFound(format!("no services for environment {environment_id}")))?;
    Ok(format!("app={}", service.id))
}

pub async fn build_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    _user: AuthUser,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    log_stream(state, id, query, LogKind::Build, 3600).await
}

pub async fn live_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    _user: AuthUser,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    log_stream(state, id, query, LogKind::Live, 0).await
}

async fn log_stream(
    state: AppState,
    environment_id: String,
    query: LogsQuery,
    kind: LogKind,
    since_seconds: u32,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let selector = first_service_selector(&state, &environment_id, query.service.as_deref()).await?;
    let lines = state
        .cluster
        .stream_logs(&environment_id, &selector, kind, since_seconds)
        .await
        .map_err(|e| ApiError::Other(e.into()))?;

    let events = lines.map(|item| match item {
        Ok(line) => Ok(Event::default().event("log").data(line)),
        Err(e) => Ok(Event::default().event("error").data(e.to_string())),
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
