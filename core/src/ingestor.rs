//! Event Ingestor / Dispatcher (C8, §4.8): authenticates inbound forge
//! webhooks and turns them into terminate/launch calls against the
//! Lifecycle Orchestrator.

use std::sync::Arc;

use previewctl_forge::webhook::{self, PullRequestAction, WebhookEvent};
use previewctl_types::LaunchRequest;

use crate::orchestrator::LifecycleOrchestrator;
use crate::store::{EnvironmentsProvider, EventLog, PermanentBranchProvider};

/// Process-wide, loaded once at startup from configuration (§9 Design Notes).
pub mod owner_block_list {
    use std::collections::HashSet;
    use std::sync::OnceLock;

    static BLOCKED: OnceLock<HashSet<String>> = OnceLock::new();

    /// Must run exactly once, before any webhook is dispatched; panics on a
    /// second call rather than silently keeping the first list.
    pub fn init(owners: impl IntoIterator<Item = String>) {
        BLOCKED
            .set(owners.into_iter().collect())
            .expect("owner block list already initialised");
    }

    pub fn is_blocked(owner: &str) -> bool {
        BLOCKED.get().is_some_and(|set| set.contains(owner))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Signature missing or didn't match; caller should respond 401.
    Unauthorized,
    /// Everything else (including unrecognised event types and blocked
    /// owners) responds 204 — the dispatch either queued async work or
    /// deliberately did nothing.
    Accepted,
}

pub struct Dispatcher {
    webhook_secret: Vec<u8>,
    environments: Arc<dyn EnvironmentsProvider>,
    permanent_branches: Arc<dyn PermanentBranchProvider>,
    event_log: Arc<dyn EventLog>,
    orchestrator: Arc<LifecycleOrchestrator>,
}

impl Dispatcher {
    pub fn new(
        webhook_secret: impl Into<Vec<u8>>,
        environments: Arc<dyn EnvironmentsProvider>,
        permanent_branches: Arc<dyn PermanentBranchProvider>,
        event_log: Arc<dyn EventLog>,
        orchestrator: Arc<LifecycleOrchestrator>,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            environments,
            permanent_branches,
            event_log,
            orchestrator,
        }
    }

    /// `delivery_id` is logged only; the lifecycle engine's own
    /// terminate-then-launch ordering is the effective dedupe (§4.8).
    #[tracing::instrument(skip(self, body, signature_header), fields(event_type))]
    pub async fn handle_webhook(
        &self,
        event_type: &str,
        delivery_id: Option<&str>,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> DispatchOutcome {
        tracing::debug!(delivery_id, "received webhook");

        let Some(signature) = signature_header else {
            return DispatchOutcome::Unauthorized;
        };
        if !previewctl_forge::signature::verify(&self.webhook_secret, body, signature) {
            return DispatchOutcome::Unauthorized;
        }

        let event = match webhook::parse(event_type, body) {
            Ok(Some(event)) => event,
            Ok(None) => return DispatchOutcome::Accepted,
            Err(e) => {
                tracing::warn!(error = %e, event_type, "failed to parse webhook payload");
                return DispatchOutcome::Accepted;
            }
        };

        match event {
            WebhookEvent::PullRequest {
                action,
                owner,
                repo,
                branch_owner,
                branch,
                sha,
                pull_request,
                author,
                is_private,
            } => {
                if owner_block_list::is_blocked(&owner) {
                    tracing::warn!(owner, "dropping webhook for blocked owner");
                    return DispatchOutcome::Accepted;
                }
                match action {
                    PullRequestAction::Opened | PullRequestAction::Reopened | PullRequestAction::Synchronize => {
                        self.terminate_then_launch(
                            owner.clone(),
                            repo.clone(),
                            Some(branch.clone()),
                            Some(pull_request),
                            LaunchRequest {
                                owner,
                                branch_owner,
                                repo,
                                branch: Some(branch),
                                sha,
                                pull_request: Some(pull_request),
                                author,
                                is_private,
                            },
                        );
                    }
                    PullRequestAction::Closed => {
                        self.terminate_only(owner, repo, Some(branch), Some(pull_request));
                    }
                    PullRequestAction::Other => {}
                }
            }
            WebhookEvent::Push { owner, repo, branch, sha, author, is_private } => {
                if owner_block_list::is_blocked(&owner) {
                    tracing::warn!(owner, "dropping webhook for blocked owner");
                    return DispatchOutcome::Accepted;
                }
                let should_deploy = match self.permanent_branches.should_deploy(&owner, &repo, &branch).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, owner, repo, branch, "failed to check permanent-branch deploy policy");
                        return DispatchOutcome::Accepted;
                    }
                };
                if should_deploy {
                    self.terminate_then_launch(
                        owner.clone(),
                        repo.clone(),
                        Some(branch.clone()),
                        None,
                        LaunchRequest {
                            owner: owner.clone(),
                            branch_owner: owner,
                            repo,
                            branch: Some(branch),
                            sha,
                            pull_request: None,
                            author,
                            is_private,
                        },
                    );
                }
            }
            WebhookEvent::MarketplacePurchase { owner, action, raw_payload } => {
                if let Err(e) = self.event_log.record_marketplace_event(&owner, &action, raw_payload).await {
                    tracing::warn!(error = %e, owner, action, "failed to record marketplace event");
                }
            }
        }

        DispatchOutcome::Accepted
    }

    fn terminate_then_launch(
        &self,
        owner: String,
        repo: String,
        branch: Option<String>,
        pull_request: Option<i64>,
        launch_req: LaunchRequest,
    ) {
        let environments = self.environments.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            terminate_existing(&environments, &orchestrator, &owner, &repo, branch.as_deref(), pull_request).await;
            if let Err(e) = orchestrator.launch_environment(launch_req).await {
                tracing::error!(error = %e, owner, repo, "failed to launch environment");
            }
        });
    }

    fn terminate_only(&self, owner: String, repo: String, branch: Option<String>, pull_request: Option<i64>) {
        let environments = self.environments.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            terminate_existing(&environments, &orchestrator, &owner, &repo, branch.as_deref(), pull_request).await;
        });
    }
}

async fn terminate_existing(
    environments: &Arc<dyn EnvironmentsProvider>,
    orchestrator: &Arc<LifecycleOrchestrator>,
    owner: &str,
    repo: &str,
    branch: Option<&str>,
    pull_request: Option<i64>,
) {
    let existing = match environments.find_by_key(owner, repo, branch, pull_request, false).await {
        Ok(envs) => envs,
        Err(e) => {
            tracing::warn!(error = %e, owner, repo, "failed to look up existing environments to terminate");
            return;
        }
    };
    for env in existing {
        if let Err(e) = orchestrator.terminate(&env.id).await {
            tracing::warn!(error = %e, environment = %env.id, "failed to terminate environment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;
    use crate::loader::ProjectLoader;
    use crate::quota::QuotaController;
    use crate::store::testdoubles::InMemoryStore;
    use previewctl_cluster::testdoubles::InMemoryClusterDriver;
    use previewctl_forge::testdoubles::InMemoryForgeClient;

    fn dispatcher(
        store: Arc<InMemoryStore>,
        cluster: Arc<InMemoryClusterDriver>,
        forge: Arc<InMemoryForgeClient>,
    ) -> Dispatcher {
        let quota = QuotaController::new(store.clone(), store.clone());
        let loader = ProjectLoader::new(forge.clone(), "preview.example.com");
        let builder = ImageBuilder::new(forge.clone(), cluster.clone());
        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            quota,
            loader,
            builder,
            cluster.clone(),
            forge.clone(),
            "internal.registry",
            "",
            "https://app.example.com",
        ));
        Dispatcher::new(b"shh".to_vec(), store.clone(), store.clone(), store.clone(), orchestrator)
    }

    #[tokio::test]
    async fn missing_signature_is_unauthorized() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        let d = dispatcher(store, cluster, forge);

        let outcome = d.handle_webhook("push", None, None, b"{}").await;
        assert_eq!(outcome, DispatchOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn wrong_signature_is_unauthorized() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        let d = dispatcher(store, cluster, forge);

        let body = b"{}";
        let sig = previewctl_forge::signature::sign(b"different-secret", body);
        let outcome = d.handle_webhook("push", None, Some(&sig), body).await;
        assert_eq!(outcome, DispatchOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn unrecognised_event_type_is_accepted_as_a_no_op() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        let d = dispatcher(store, cluster, forge);

        let body = b"{}";
        let sig = previewctl_forge::signature::sign(b"shh", body);
        let outcome = d.handle_webhook("issue_comment", None, Some(&sig), body).await;
        assert_eq!(outcome, DispatchOutcome::Accepted);
    }

    #[tokio::test]
    async fn marketplace_purchase_is_recorded_to_the_event_log() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        let d = dispatcher(store.clone(), cluster, forge);

        let body = serde_json::json!({
            "action": "purchased",
            "marketplace_purchase": {"account": {"login": "acme"}},
        })
        .to_string();
        let sig = previewctl_forge::signature::sign(b"shh", body.as_bytes());
        let outcome = d.handle_webhook("marketplace_purchase", None, Some(&sig), body.as_bytes()).await;
        assert_eq!(outcome, DispatchOutcome::Accepted);
        assert_eq!(store.marketplace_events().len(), 1);
    }

    #[tokio::test]
    async fn push_to_a_non_permanent_branch_does_not_deploy() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        let d = dispatcher(store.clone(), cluster.clone(), forge);

        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "deadbeef",
            "repository": {"name": "demo", "owner": {"login": "acme"}, "private": false},
            "sender": {"login": "bot"},
        })
        .to_string();
        let sig = previewctl_forge::signature::sign(b"shh", body.as_bytes());
        d.handle_webhook("push", None, Some(&sig), body.as_bytes()).await;

        tokio::task::yield_now().await;
        assert!(!cluster.namespace_exists("anything"));
    }
}
