//! Quota Admission (§4.5, testable property #3): resolves an owner's active
//! environment limit and decides whether a new launch is admitted.

use std::sync::Arc;

use previewctl_types::EnvironmentStatus;

use crate::error::Result;
use crate::store::{BillingProvider, EnvironmentsProvider};

pub struct QuotaController {
    environments: Arc<dyn EnvironmentsProvider>,
    billing: Arc<dyn BillingProvider>,
}

impl QuotaController {
    pub fn new(environments: Arc<dyn EnvironmentsProvider>, billing: Arc<dyn BillingProvider>) -> Self {
        Self { environments, billing }
    }

    /// `Limited` environments are excluded from both the count and the limit
    /// check: they're the queue, not the occupants.
    #[tracing::instrument(skip(self))]
    pub async fn is_owner_limited(&self, owner: &str) -> Result<bool> {
        let limit = self.active_limit(owner).await?;
        let count = self
            .environments
            .list_by_owner(owner, false)
            .await?
            .into_iter()
            .filter(|e| e.status != EnvironmentStatus::Limited)
            .count() as i64;
        Ok(count >= limit)
    }

    async fn active_limit(&self, owner: &str) -> Result<i64> {
        Ok(self.limits(owner).await?.0)
    }

    /// `(active_limit, permanent_limit)` for the owner, used by the stale
    /// scorer (§4.6) alongside admission.
    pub async fn limits(&self, owner: &str) -> Result<(i64, i64)> {
        if let Some(over) = self.billing.limit_override(owner).await? {
            return Ok((over.active_limit, over.permanent_limit));
        }
        let plan = self.billing.plan_for_owner(owner).await?;
        // The override flag that raises Standard's limit to 10 is itself an
        // owner-scoped billing detail; absent a per-owner row it defaults off.
        Ok((plan.active_environments_limit(false), plan.permanent_environments_limit()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testdoubles::InMemoryStore;
    use previewctl_types::{BuildTool, Environment};
    use std::sync::Arc;

    fn env(owner: &str, status: EnvironmentStatus) -> Environment {
        Environment {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            branch_owner: owner.to_string(),
            repo: "demo".to_string(),
            branch: Some("main".to_string()),
            pull_request: None,
            author: "bot".to_string(),
            status,
            degraded_reason: None,
            external_comment_id: None,
            build_tool: BuildTool::Kaniko,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn free_owner_is_limited_at_one_non_limited_environment() {
        let store = Arc::new(InMemoryStore::new());
        store.set_plan("acme", previewctl_types::PaymentPlan::Free);
        let quota = QuotaController::new(store.clone(), store.clone());

        EnvironmentsProvider::create(&*store, &env("acme", EnvironmentStatus::Success))
            .await
            .unwrap();

        assert!(quota.is_owner_limited("acme").await.unwrap());
    }

    #[tokio::test]
    async fn limited_environments_do_not_count_towards_the_limit() {
        let store = Arc::new(InMemoryStore::new());
        store.set_plan("acme", previewctl_types::PaymentPlan::Free);
        let quota = QuotaController::new(store.clone(), store.clone());

        EnvironmentsProvider::create(&*store, &env("acme", EnvironmentStatus::Limited))
            .await
            .unwrap();

        assert!(!quota.is_owner_limited("acme").await.unwrap());
    }
}
