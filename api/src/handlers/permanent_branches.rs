//! `/v2/owner/:owner/repos/:repo/permanent-branches` (§6.1, §10.6): thin
//! handlers over `PermanentBranchProvider`. Batch upsert replaces the whole
//! set for the repo under one transaction (§9 shared-resources note).

use axum::Json;
use axum::extract::{Path, State};
use previewctl_types::PermanentBranch;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>, Path((owner, repo)): Path<(String, String)>, _user: AuthUser) -> Result<Json<Vec<PermanentBranch>>> {
    let branches = state.permanent_branches.list(&owner, &repo).await?;
    Ok(Json(branches))
}

#[derive(Debug, Deserialize)]
pub struct BatchUpsertRequest {
    pub branches: Vec<String>,
}

pub async fn batch_upsert(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    _user: AuthUser,
    Json(req): Json<BatchUpsertRequest>,
) -> Result<Json<Vec<PermanentBranch>>> {
    state.permanent_branches.batch_upsert(&owner, &repo, &req.branches).await?;
    let branches = state.permanent_branches.list(&owner, &repo).await?;
    Ok(Json(branches))
}
