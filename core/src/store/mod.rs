//! The relational store and the small encrypted/billing collaborators that
//! sit next to it. §1 treats these as external-collaborator traits; this
//! crate provides both the production Postgres-backed implementation and
//! in-memory test doubles, per the single-production-impl-plus-doubles rule.

pub mod postgres_store;
pub mod testdoubles;

use async_trait::async_trait;
use previewctl_types::{
    Environment, EnvironmentLimitOverride, EnvironmentStatus, PaymentPlan, PermanentBranch,
    ProjectValidationError, ResolvedEnvVar, ResolvedRegistryCred, Service, User,
};

use crate::error::Result;

pub use postgres_store::PgStore;

#[async_trait]
pub trait EnvironmentsProvider: Send + Sync {
    async fn create(&self, env: &Environment) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Environment>>;

    /// Includes soft-deleted rows when `include_deleted` (§4.4.1 idempotency lookup).
    async fn find_by_key(
        &self,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
        pull_request: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<Environment>>;

    async fn list_by_owner(&self, owner: &str, include_deleted: bool) -> Result<Vec<Environment>>;

    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>>;

    async fn update_status(&self, id: &str, status: EnvironmentStatus) -> Result<()>;

    async fn set_degraded(&self, id: &str, reason: ProjectValidationError) -> Result<()>;

    async fn set_external_comment_id(&self, id: &str, comment_id: i64) -> Result<()>;

    /// The manifest kind isn't known until after the row is created (the
    /// Project Loader runs after admission's idempotency lookup), so it's
    /// corrected in place rather than supplied at `create` time.
    async fn set_build_tool(&self, id: &str, build_tool: previewctl_types::BuildTool) -> Result<()>;

    async fn soft_delete(&self, id: &str) -> Result<()>;

    /// Bumps `updated_at`, used by the wake-on-request handler to reset staleness.
    async fn touch(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ServicesProvider: Send + Sync {
    async fn create_many(&self, services: &[Service]) -> Result<()>;

    async fn list_by_environment(&self, environment_id: &str) -> Result<Vec<Service>>;

    async fn find_by_id(&self, service_id: &str) -> Result<Option<Service>>;

    async fn update_build_status(
        &self,
        service_id: &str,
        status: previewctl_types::BuildStatus,
    ) -> Result<()>;
}

#[async_trait]
pub trait EnvVarProvider: Send + Sync {
    /// Branch-scoped rows override branch-less rows of the same name
    /// (testable property #8); the returned list never has duplicate names.
    async fn list_resolved(
        &self,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
    ) -> Result<Vec<ResolvedEnvVar>>;

    async fn upsert(&self, owner: &str, repo: &str, branch: Option<&str>, name: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait RegistryCredProvider: Send + Sync {
    async fn get(&self, owner: &str, registry_host: &str) -> Result<Option<ResolvedRegistryCred>>;

    async fn list(&self, owner: &str) -> Result<Vec<ResolvedRegistryCred>>;

    async fn upsert(&self, owner: &str, registry_host: &str, username: &str, password: &str) -> Result<()>;

    async fn delete(&self, owner: &str, registry_host: &str) -> Result<()>;
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn plan_for_owner(&self, owner: &str) -> Result<PaymentPlan>;

    async fn limit_override(&self, owner: &str) -> Result<Option<EnvironmentLimitOverride>>;

    /// Upserts the single subscription row for `owner` from an incoming
    /// Stripe webhook event. `stripe_subscription_id`/`stripe_customer_id`
    /// are `None` for plans that never touch Stripe (e.g. a marketplace
    /// grant).
    #[allow(clippy::too_many_arguments)]
    async fn upsert_subscription(
        &self,
        owner: &str,
        plan: PaymentPlan,
        stripe_customer_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
        status: &str,
        standard_plan_env_limit: bool,
    ) -> Result<()>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record_marketplace_event(
        &self,
        owner: &str,
        action: &str,
        raw_payload: serde_json::Value,
    ) -> Result<()>;
}

#[async_trait]
pub trait PermanentBranchProvider: Send + Sync {
    async fn should_deploy(&self, owner: &str, repo: &str, branch: &str) -> Result<bool>;

    async fn list(&self, owner: &str, repo: &str) -> Result<Vec<PermanentBranch>>;

    /// Runs under a single transaction; any failed row rolls back the whole batch.
    async fn batch_upsert(&self, owner: &str, repo: &str, branches: &[String]) -> Result<()>;
}

#[async_trait]
pub trait UsersProvider: Send + Sync {
    async fn upsert(&self, forge_login: &str, email: Option<&str>) -> Result<User>;

    async fn find_by_login(&self, forge_login: &str) -> Result<Option<User>>;
}
