//! `/v2/stripe/webhook` (§6.1, §10.6): signature-checked pass-through that
//! updates the `Subscription` row. Plan computation, proration, and the
//! rest of the payments business logic stay external per the Non-goals;
//! this handler only persists the subset of fields §3.1 names.
//!
//! Stripe signs with its own `Stripe-Signature: t=...,v1=...` scheme, but
//! §6.3 only specifies the GitHub-style `sha256=<hex>` HMAC, so this
//! handler is kept consistent with the rest of the webhook surface and
//! verifies a `sha256=<hex>` signature carried in the same header name the
//! forge webhooks use.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use previewctl_types::PaymentPlan;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeSubscriptionObject,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionObject {
    id: String,
    customer: String,
    status: String,
    metadata: StripeMetadata,
    items: StripeItems,
}

#[derive(Debug, Deserialize, Default)]
struct StripeMetadata {
    #[serde(default)]
    owner: String,
}

#[derive(Debug, Deserialize)]
struct StripeItems {
    data: Vec<StripeItem>,
}

#[derive(Debug, Deserialize)]
struct StripeItem {
    price: StripePrice,
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    product: String,
}

pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    let Some(secret) = &state.stripe_webhook_secret else {
        tracing::warn!("received stripe webhook with no configured secret; ignoring");
        return StatusCode::NO_CONTENT;
    };
    let Some(signature) = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()) else {
        return StatusCode::UNAUTHORIZED;
    };
    if !previewctl_forge::signature::verify(secret, &body, signature) {
        return StatusCode::UNAUTHORIZED;
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse stripe webhook payload");
            return StatusCode::OK;
        }
    };

    if !event.event_type.starts_with("customer.subscription.") {
        return StatusCode::OK;
    }

    let object = event.data.object;
    if object.metadata.owner.is_empty() {
        tracing::warn!(subscription = object.id, "stripe subscription has no owner metadata");
        return StatusCode::OK;
    }

    let plan = object
        .items
        .data
        .first()
        .map(|item| plan_for_product(&state, &item.price.product))
        .unwrap_or(PaymentPlan::Free);

    if let Err(e) = state
        .billing
        .upsert_subscription(&object.metadata.owner, plan, Some(&object.customer), Some(&object.id), &object.status, false)
        .await
    {
        tracing::warn!(error = %e, owner = object.metadata.owner, "failed to upsert stripe subscription");
    }

    StatusCode::OK
}

fn plan_for_product(state: &AppState, product_id: &str) -> PaymentPlan {
    if Some(product_id) == state.standard_product_id.as_deref() {
        PaymentPlan::Standard
    } else if Some(product_id) == state.professional_product_id.as_deref() {
        PaymentPlan::Professional
    } else {
        PaymentPlan::Free
    }
}
