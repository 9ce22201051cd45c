//! Shared domain types for the preview-environment control plane: the
//! `Environment`/`Service` aggregate, manifest descriptors, and the small
//! value types referenced by every other crate in the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One (owner, repo, branch, optional PR) attempt at a running preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    /// Also used as the cluster namespace name.
    pub id: String,
    pub owner: String,
    /// The owner that actually holds the branch (differs from `owner` on forked PRs).
    pub branch_owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub pull_request: Option<i64>,
    pub author: String,
    pub status: EnvironmentStatus,
    pub degraded_reason: Option<ProjectValidationError>,
    pub external_comment_id: Option<i64>,
    pub build_tool: BuildTool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Environment {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, postgres_types::ToSql, postgres_types::FromSql)]
#[postgres(name = "environment_status")]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Pending,
    Building,
    Success,
    Degraded,
    Limited,
    Stale,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, postgres_types::ToSql, postgres_types::FromSql)]
#[postgres(name = "build_tool")]
#[serde(rename_all = "lowercase")]
pub enum BuildTool {
    Kaniko,
    Buildpacks,
}

/// One containerised component declared in the project manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    /// Globally unique; also used as build-job name, pod label, and image tag suffix.
    pub id: String,
    pub environment_id: String,
    pub name: String,
    pub image: String,
    /// Build context path; empty means prebuilt image.
    pub build: String,
    pub build_status: BuildStatus,
    /// External hostname; empty means internal-only.
    pub url: String,
    pub public_port: Option<u16>,
    pub internal_ports: Vec<u16>,
    /// Ordinal position in manifest declaration order; index 0 is the "main" service.
    pub index: i32,
}

impl Service {
    pub fn has_build(&self) -> bool {
        !self.build.is_empty()
    }

    pub fn is_public(&self) -> bool {
        !self.url.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, postgres_types::ToSql, postgres_types::FromSql)]
#[postgres(name = "build_status")]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Image,
    Building,
    BuildSuccess,
    BuildFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectValidationError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for ProjectValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// `(owner, repo, branch, name)` -> encrypted value. `branch = None` is the repo default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub id: Uuid,
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub name: String,
    /// `hex(iv):hex(ciphertext)`.
    pub encrypted_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A decrypted env-var ready to be attached to a workload or build job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedEnvVar {
    pub name: String,
    pub value: String,
}

/// `(owner, registry_host)` -> encrypted registry credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryCred {
    pub id: Uuid,
    pub owner: String,
    pub registry_host: String,
    pub encrypted_username: String,
    pub encrypted_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedRegistryCred {
    pub registry_host: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentPlan {
    Free,
    Standard,
    Professional,
}

impl PaymentPlan {
    /// `standard_plan_env_limit` raises a Standard owner's active limit from 3 to 10.
    pub fn active_environments_limit(&self, standard_plan_env_limit: bool) -> i64 {
        match self {
            PaymentPlan::Free => 1,
            PaymentPlan::Standard => {
                if standard_plan_env_limit {
                    10
                } else {
                    3
                }
            }
            PaymentPlan::Professional => 8,
        }
    }

    pub fn permanent_environments_limit(&self) -> i64 {
        match self {
            PaymentPlan::Free => 0,
            PaymentPlan::Standard => 1,
            PaymentPlan::Professional => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: Uuid,
    pub owner: String,
    pub plan: PaymentPlan,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: String,
    pub standard_plan_env_limit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarketplaceEvent {
    pub id: Uuid,
    pub owner: String,
    pub action: String,
    pub raw_payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// `(owner, repo, branch)` registered so pushes without a PR still deploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermanentBranch {
    pub id: Uuid,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// Per-owner override of the plan-tier limits, see `environment_limits` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentLimitOverride {
    pub owner: String,
    pub active_limit: i64,
    pub permanent_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub forge_login: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Manifest descriptor types (project-loader output) -----------------

/// The normalised representation produced by the Project Loader from either
/// a compose or a pack manifest. Also serves as the mustache render context
/// for per-service env interpolation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub services: Vec<EnvironmentServiceDescriptor>,
}

impl EnvironmentDescriptor {
    /// The service with `index == 0`, whose URL is surfaced to humans.
    pub fn first_service(&self) -> Option<&EnvironmentServiceDescriptor> {
        self.services.iter().find(|s| s.index == 0)
    }

    pub fn service_by_name(&self, name: &str) -> Option<&EnvironmentServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentServiceDescriptor {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Build context path as written in the manifest; empty means prebuilt image.
    pub build: String,
    pub url: String,
    pub public_port: Option<u16>,
    pub internal_ports: Vec<u16>,
    pub env: Vec<ResolvedEnvVar>,
    pub build_args: Vec<ResolvedEnvVar>,
    pub index: i32,
}

impl EnvironmentServiceDescriptor {
    pub fn has_build(&self) -> bool {
        !self.build.is_empty()
    }

    pub fn is_public(&self) -> bool {
        !self.url.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Compose,
    Pack,
}

/// The outcome of `ProjectLoader::load`.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub project_path: std::path::PathBuf,
    pub config_path: std::path::PathBuf,
    pub kind: ManifestKind,
    pub environment_descriptor: EnvironmentDescriptor,
    pub skip: bool,
    pub validation_error: Option<ProjectValidationError>,
}

// --- Lifecycle request/result types -------------------------------------

/// Input to `launch_environment`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchRequest {
    pub owner: String,
    pub branch_owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub sha: String,
    pub pull_request: Option<i64>,
    pub author: String,
    pub is_private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildImagesResult {
    pub failed_jobs: Vec<String>,
}

impl BuildImagesResult {
    pub fn is_success(&self) -> bool {
        self.failed_jobs.is_empty()
    }
}

/// Progress events streamed by the `/v2/deploy` SSE variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DeployEvent {
    Progress { status: DeployProgressStatus },
    Finish {
        status: DeployFinishStatus,
        url: Option<String>,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployProgressStatus {
    Pending,
    Building,
    Deploying,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployFinishStatus {
    Success,
    Error,
    Validation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plan_env_limit_flag_raises_active_limit() {
        assert_eq!(PaymentPlan::Standard.active_environments_limit(false), 3);
        assert_eq!(PaymentPlan::Standard.active_environments_limit(true), 10);
    }

    #[test]
    fn free_plan_has_no_permanent_environments() {
        assert_eq!(PaymentPlan::Free.permanent_environments_limit(), 0);
    }

    #[test]
    fn environment_descriptor_first_service_is_index_zero() {
        let descriptor = EnvironmentDescriptor {
            services: vec![
                EnvironmentServiceDescriptor {
                    name: "worker".into(),
                    index: 1,
                    ..Default::default()
                },
                EnvironmentServiceDescriptor {
                    name: "web".into(),
                    index: 0,
                    ..Default::default()
                },
            ],
        };
        assert_eq!(descriptor.first_service().unwrap().name, "web");
    }
}
