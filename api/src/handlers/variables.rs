//! `/v2/owner/:owner/repos/:repo/variables` (§6.1, §10.6): thin handlers over
//! `EnvVarProvider`, exercising the branch-scoped override precedence
//! (testable property #8) from outside the core crate.

use axum::Json;
use axum::extract::{Path, Query, State};
use previewctl_types::ResolvedEnvVar;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BranchQuery {
    pub branch: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<BranchQuery>,
    _user: AuthUser,
) -> Result<Json<Vec<ResolvedEnvVar>>> {
    let vars = state.env_vars.list_resolved(&owner, &repo, query.branch.as_deref()).await?;
    Ok(Json(vars))
}

#[derive(Debug, Deserialize)]
pub struct UpsertVariableRequest {
    pub branch: Option<String>,
    pub name: String,
    pub value: String,
}

pub async fn upsert(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    _user: AuthUser,
    Json(req): Json<UpsertVariableRequest>,
) -> Result<Json<Vec<ResolvedEnvVar>>> {
    state.env_vars.upsert(&owner, &repo, req.branch.as_deref(), &req.name, &req.value).await?;
    let vars = state.env_vars.list_resolved(&owner, &repo, req.branch.as_deref()).await?;
    Ok(Json(vars))
}
