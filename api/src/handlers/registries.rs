//! `/v2/owner/:owner/registries` CRUD (§6.1, §10.6): thin handlers over
//! `RegistryCredProvider`. Credentials are never echoed back in plaintext;
//! the provider's `list`/`get` already return the encrypted-at-rest values
//! decrypted only for the fields callers legitimately need.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use previewctl_types::ResolvedRegistryCred;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>, Path(owner): Path<String>, _user: AuthUser) -> Result<Json<Vec<ResolvedRegistryCred>>> {
    let creds = state.registry_creds.list(&owner).await?;
    Ok(Json(creds))
}

#[derive(Debug, Deserialize)]
pub struct UpsertRegistryRequest {
    pub registry_host: String,
    pub username: String,
    pub password: String,
}

pub async fn upsert(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    _user: AuthUser,
    Json(req): Json<UpsertRegistryRequest>,
) -> Result<StatusCode> {
    state.registry_creds.upsert(&owner, &req.registry_host, &req.username, &req.password).await?;
    Ok(StatusCode::CREATED)
}

pub async fn delete(
    State(state): State<AppState>,
    Path((owner, registry_host)): Path<(String, String)>,
    _user: AuthUser,
) -> Result<StatusCode> {
    state.registry_creds.delete(&owner, &registry_host).await?;
    Ok(StatusCode::OK)
}
