//! Parses GitHub webhook payloads into the neutral events the Event
//! Ingestor (C8, §4.8) dispatches on. Signature verification happens one
//! layer up, in [`crate::signature`]; this module only classifies bodies
//! that have already been authenticated.

use serde::Deserialize;

use crate::ForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Reopened,
    Synchronize,
    Closed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PullRequest {
        action: PullRequestAction,
        owner: String,
        repo: String,
        branch_owner: String,
        branch: String,
        sha: String,
        pull_request: i64,
        author: String,
        is_private: bool,
    },
    Push {
        owner: String,
        repo: String,
        branch: String,
        sha: String,
        author: String,
        is_private: bool,
    },
    MarketplacePurchase {
        owner: String,
        action: String,
        raw_payload: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    number: i64,
    pull_request: PullRequestObj,
    sender: Sender,
}

#[derive(Debug, Deserialize)]
struct PullRequestObj {
    head: PrHead,
}

#[derive(Debug, Deserialize)]
struct PrHead {
    #[serde(rename = "ref")]
    ref_: String,
    sha: String,
    repo: RepoObj,
}

#[derive(Debug, Deserialize)]
struct RepoObj {
    name: String,
    owner: Owner,
    private: bool,
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Sender {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_: String,
    after: String,
    repository: RepoObj,
    sender: Sender,
}

#[derive(Debug, Deserialize)]
struct MarketplacePurchasePayload {
    action: String,
    marketplace_purchase: MarketplacePurchaseObj,
}

#[derive(Debug, Deserialize)]
struct MarketplacePurchaseObj {
    account: Owner,
}

/// Classifies a webhook body per `X-GitHub-Event`. Unrecognised event types
/// return `Ok(None)` (§4.8: "unrecognised ⇒ 204 no-op"), not an error.
pub fn parse(event_type: &str, body: &[u8]) -> Result<Option<WebhookEvent>, ForgeError> {
    match event_type {
        "pull_request" => {
            let payload: PullRequestPayload = serde_json::from_slice(body)
                .map_err(|e| ForgeError::Rejected(format!("invalid pull_request payload: {e}")))?;
            let action = match payload.action.as_str() {
                "opened" => PullRequestAction::Opened,
                "reopened" => PullRequestAction::Reopened,
                "synchronize" => PullRequestAction::Synchronize,
                "closed" => PullRequestAction::Closed,
                _ => PullRequestAction::Other,
            };
            Ok(Some(WebhookEvent::PullRequest {
                action,
                // The base repository owner: the repo this PR targets, not
                // necessarily who holds the branch (forks differ, §9 open question).
                owner: payload.pull_request.head.repo.owner.login.clone(),
                repo: payload.pull_request.head.repo.name.clone(),
                branch_owner: payload.pull_request.head.repo.owner.login,
                branch: payload.pull_request.head.ref_,
                sha: payload.pull_request.head.sha,
                pull_request: payload.number,
                author: payload.sender.login,
                is_private: payload.pull_request.head.repo.private,
            }))
        }
        "push" => {
            let payload: PushPayload = serde_json::from_slice(body)
                .map_err(|e| ForgeError::Rejected(format!("invalid push payload: {e}")))?;
            let Some(branch) = payload.ref_.strip_prefix("refs/heads/") else {
                // Tag pushes and other ref kinds are not branch deploys.
                return Ok(None);
            };
            Ok(Some(WebhookEvent::Push {
                owner: payload.repository.owner.login.clone(),
                repo: payload.repository.name,
                branch: branch.to_string(),
                sha: payload.after,
                author: payload.sender.login,
                is_private: payload.repository.private,
            }))
        }
        "marketplace_purchase" => {
            let raw_payload: serde_json::Value = serde_json::from_slice(body)
                .map_err(|e| ForgeError::Rejected(format!("invalid marketplace_purchase payload: {e}")))?;
            let payload: MarketplacePurchasePayload = serde_json::from_value(raw_payload.clone())
                .map_err(|e| ForgeError::Rejected(format!("invalid marketplace_purchase payload: {e}")))?;
            Ok(Some(WebhookEvent::MarketplacePurchase {
                owner: payload.marketplace_purchase.account.login,
                action: payload.action,
                raw_payload,
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_request_opened_maps_to_launch_fields() {
        let body = serde_json::json!({
            "action": "opened",
            "number": 42,
            "pull_request": {
                "head": {
                    "ref": "feature",
                    "sha": "abc123",
                    "repo": {"name": "demo", "owner": {"login": "forker"}, "private": false},
                }
            },
            "sender": {"login": "forker"},
        });
        let event = parse("pull_request", body.to_string().as_bytes()).unwrap().unwrap();
        match event {
            WebhookEvent::PullRequest { action, owner, branch_owner, pull_request, .. } => {
                assert_eq!(action, PullRequestAction::Opened);
                assert_eq!(owner, "forker");
                assert_eq!(branch_owner, "forker");
                assert_eq!(pull_request, 42);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn push_strips_refs_heads_prefix() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "deadbeef",
            "repository": {"name": "demo", "owner": {"login": "acme"}, "private": true},
            "sender": {"login": "bot"},
        });
        let event = parse("push", body.to_string().as_bytes()).unwrap().unwrap();
        match event {
            WebhookEvent::Push { branch, is_private, .. } => {
                assert_eq!(branch, "main");
                assert!(is_private);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tag_push_is_not_a_branch_deploy() {
        let body = serde_json::json!({
            "ref": "refs/tags/v1.0.0",
            "after": "deadbeef",
            "repository": {"name": "demo", "owner": {"login": "acme"}, "private": false},
            "sender": {"login": "bot"},
        });
        assert!(parse("push", body.to_string().as_bytes()).unwrap().is_none());
    }

    #[test]
    fn unrecognised_event_type_is_a_no_op() {
        assert!(parse("issue_comment", b"{}").unwrap().is_none());
    }
}
