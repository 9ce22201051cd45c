//! `/v2/github/*` handlers (§6.1): forge webhook dispatch, the marketplace
//! billing webhook, user-organization listing, and the repo
//! list/configure pair used by the onboarding flow.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use previewctl_core::ingestor::DispatchOutcome;
use previewctl_forge::RepoSummary;
use previewctl_types::PaymentPlan;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthUser;
use crate::error::{ApiError, Result};
use crate::state::AppState;

const SEED_MANIFEST_PATH: &str = ".ergomake/ergopack.yaml";
const SEED_MANIFEST_CONTENTS: &str = "apps:\n  app:\n    build: .\n    publicPort: 3000\n";

pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    let event_type = headers.get("x-github-event").and_then(|v| v.to_str().ok()).unwrap_or_default();
    let delivery_id = headers.get("x-github-delivery").and_then(|v| v.to_str().ok());
    let signature = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok());

    match state.dispatcher.handle_webhook(event_type, delivery_id, signature, &body).await {
        DispatchOutcome::Accepted => StatusCode::NO_CONTENT,
        DispatchOutcome::Unauthorized => StatusCode::UNAUTHORIZED,
    }
}

pub async fn marketplace_webhook(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    let Some(signature) = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !previewctl_forge::signature::verify(&state.marketplace_webhook_secret, &body, signature) {
        return StatusCode::UNAUTHORIZED;
    }

    let event_type = headers.get("x-github-event").and_then(|v| v.to_str().ok()).unwrap_or_default();
    let event = match previewctl_forge::webhook::parse(event_type, &body) {
        Ok(Some(event)) => event,
        Ok(None) => return StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::warn!(error = %e, event_type, "failed to parse marketplace webhook payload");
            return StatusCode::NO_CONTENT;
        }
    };

    let previewctl_forge::webhook::WebhookEvent::MarketplacePurchase { owner, action, raw_payload } = event else {
        return StatusCode::NO_CONTENT;
    };

    if let Err(e) = state.event_log.record_marketplace_event(&owner, &action, raw_payload.clone()).await {
        tracing::warn!(error = %e, owner, action, "failed to record marketplace event");
    }

    let plan = if action == "cancelled" { PaymentPlan::Free } else { plan_from_payload(&raw_payload) };
    if let Err(e) = state.billing.upsert_subscription(&owner, plan, None, None, &action, false).await {
        tracing::warn!(error = %e, owner, action, "failed to upsert marketplace subscription");
    }

    StatusCode::NO_CONTENT
}

fn plan_from_payload(raw: &Value) -> PaymentPlan {
    let name = raw
        .get("marketplace_purchase")
        .and_then(|mp| mp.get("plan"))
        .and_then(|plan| plan.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name.contains("professional") {
        PaymentPlan::Professional
    } else if name.contains("standard") {
        PaymentPlan::Standard
    } else {
        PaymentPlan::Free
    }
}

#[derive(Debug, Serialize)]
pub struct OrgWithPlan {
    pub login: String,
    pub plan: PaymentPlan,
}

#[derive(Debug, Deserialize)]
struct GithubOrg {
    login: String,
}

pub async fn user_organizations(State(state): State<AppState>, AuthUser(claims): AuthUser) -> Result<Json<Vec<OrgWithPlan>>> {
    let client = reqwest::Client::new();
    let orgs: Vec<GithubOrg> = client
        .get("https://api.github.com/user/orgs")
        .bearer_auth(&claims.access_token)
        .header(reqwest::header::USER_AGENT, "previewctl")
        .send()
        .await
        .map_err(|e| ApiError::Other(e.into()))?
        .json()
        .await
        .map_err(|e| ApiError::Other(e.into()))?;

    let mut result = Vec::with_capacity(orgs.len() + 1);
    result.push(owner_with_plan(&state, &claims.sub).await?);
    for org in orgs {
        result.push(owner_with_plan(&state, &org.login).await?);
    }
    Ok(Json(result))
}

async fn owner_with_plan(state: &AppState, owner: &str) -> Result<OrgWithPlan> {
    let plan = state.billing.plan_for_owner(owner).await?;
    Ok(OrgWithPlan { login: owner.to_string(), plan })
}

pub async fn owner_repos(State(state): State<AppState>, Path(owner): Path<String>, _user: AuthUser) -> Result<Json<Vec<RepoSummary>>> {
    let repos = state.forge.list_repos(&owner).await.map_err(|e| ApiError::Other(e.into()))?;
    Ok(Json(repos))
}

#[derive(Debug, Serialize)]
pub struct ConfigureResponse {
    pub pull_request_url: String,
}

pub async fn configure_repo(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    _user: AuthUser,
) -> Result<Json<ConfigureResponse>> {
    let url = state
        .forge
        .open_seed_pr(&owner, &repo, SEED_MANIFEST_PATH, SEED_MANIFEST_CONTENTS)
        .await
        .map_err(|e| ApiError::Other(e.into()))?;
    Ok(Json(ConfigureResponse { pull_request_url: url }))
}
