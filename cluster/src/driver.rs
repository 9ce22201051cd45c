//! `ClusterDriver`: the thin interface over a container orchestrator (§1,
//! deliberately-excluded list). Everything downstream of the Cluster
//! Renderer (namespace/workload/service/ingress/job/log operations) goes
//! through this trait so the orchestrator, builder, and reclaim controller
//! never import `kube` directly.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::render::RenderedEnvironment;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster API error: {0}")]
    Transient(#[from] anyhow::Error),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct BuildJobSpec {
    /// Also the job name, and the value of the `id` pod label.
    pub service_id: String,
    pub namespace: String,
    pub sha: String,
    pub owner: String,
    pub branch_owner: String,
    pub repo: String,
    pub service: String,
    pub clone_branch: String,
    pub clone_token_secret: Option<String>,
    pub dockerfile_path: String,
    pub build_context_subpath: String,
    pub image_tag: String,
    pub build_args: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct BuildResourceSpec {
    pub service_id: String,
    pub namespace: String,
    pub sha: String,
    pub git_url: String,
    pub git_revision: String,
    pub subpath: String,
    pub image_tag: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildImagesResult {
    pub failed_jobs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Build,
    Live,
}

/// A transition of a build resource's `Succeeded` condition from unknown to
/// true/false (§4.7 step 1); `service_id`/`sha` come from its labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub service_id: String,
    pub sha: String,
    pub succeeded: bool,
}

/// A thin interface over a container orchestrator: creates namespaces,
/// workloads, services, ingress rules, jobs, and streams logs.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn create_namespace(&self, id: &str) -> Result<(), ClusterError>;

    /// Deleting an already-missing namespace is success (§7 not-found-on-teardown).
    async fn delete_namespace(&self, id: &str) -> Result<(), ClusterError>;

    /// Creates every rendered object in dependency order: namespace-scoped
    /// secrets and config first, then workloads, then services, then ingress.
    async fn apply_rendered(&self, rendered: &RenderedEnvironment) -> Result<(), ClusterError>;

    /// Blocks until every workload in `namespace` has at least one ready
    /// replica, or returns `Timeout` after `deadline_secs`.
    async fn wait_ready(&self, namespace: &str, deadline_secs: u64) -> Result<(), ClusterError>;

    async fn submit_build_job(&self, spec: BuildJobSpec) -> Result<(), ClusterError>;

    async fn submit_build_resource(&self, spec: BuildResourceSpec) -> Result<(), ClusterError>;

    /// Polls the named jobs until each reaches a terminal state or
    /// `deadline_secs` elapses; jobs still running at the deadline count as failed.
    async fn wait_jobs(
        &self,
        namespace: &str,
        job_names: &[String],
        deadline_secs: u64,
    ) -> Result<BuildImagesResult, ClusterError>;

    async fn create_clone_token_secret(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
    ) -> Result<(), ClusterError>;

    async fn create_image_pull_secret(
        &self,
        namespace: &str,
        name: &str,
        registry_host: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ClusterError>;

    /// Scales every workload belonging to `service_id` to `replicas`.
    async fn scale_service(
        &self,
        namespace: &str,
        service_id: &str,
        replicas: i32,
    ) -> Result<(), ClusterError>;

    /// Rewrites the first ingress rule's host, used both to mark an
    /// environment stale (`stale-<host>`) and to wake it (back to `<host>`).
    async fn rewrite_ingress_host(
        &self,
        namespace: &str,
        service_id: &str,
        new_host: &str,
    ) -> Result<(), ClusterError>;

    /// Tails pod logs for the given selector, newest-first chunking aside;
    /// yields raw lines as they arrive. `since_seconds=0` means "from now".
    async fn stream_logs(
        &self,
        namespace: &str,
        pod_selector: &str,
        kind: LogKind,
        since_seconds: u32,
    ) -> Result<BoxStream<'static, Result<String, ClusterError>>, ClusterError>;

    /// Subscribes to the ingress controller's own pods' logs (used by the
    /// access-log tailer, §4.6), not scoped to any preview namespace.
    async fn stream_ingress_logs(
        &self,
        since_seconds: u32,
    ) -> Result<BoxStream<'static, Result<String, ClusterError>>, ClusterError>;

    /// Resolves a `Host` header to the environment id that owns the ingress
    /// rule serving it, used by the wake-on-request handler (§4.6).
    async fn get_environment_from_host(&self, host: &str) -> Result<Option<String>, ClusterError>;

    /// Subscribes to update events on build resources cluster-wide (§4.7),
    /// yielding only actual `Succeeded` transitions — the driver is
    /// responsible for diffing old/new conditions before emitting.
    async fn watch_build_events(
        &self,
    ) -> Result<BoxStream<'static, Result<BuildEvent, ClusterError>>, ClusterError>;
}
