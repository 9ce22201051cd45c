//! Build-Result Reconciler (C7, §4.7): subscribes to build-resource state
//! transitions and drives pack-kind environments from `Building` to
//! `Success`/`Degraded` once every service's image has landed.

use std::sync::Arc;

use futures::StreamExt;
use previewctl_cluster::{BuildEvent, ClusterDriver};
use tokio_util::sync::CancellationToken;

use crate::orchestrator::LifecycleOrchestrator;

pub struct BuildResultReconciler {
    cluster: Arc<dyn ClusterDriver>,
    orchestrator: Arc<LifecycleOrchestrator>,
}

impl BuildResultReconciler {
    pub fn new(cluster: Arc<dyn ClusterDriver>, orchestrator: Arc<LifecycleOrchestrator>) -> Self {
        Self { cluster, orchestrator }
    }

    /// Runs until `cancel` fires. Resubscribes with backoff if the
    /// underlying event stream ends or errors — watch streams over a cluster
    /// API connection are not expected to run forever uninterrupted.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let stream = match self.cluster.watch_build_events().await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to subscribe to build events, retrying");
                    if previewctl_common::wait::wait_with_backoff(&cancel, attempt, std::time::Duration::from_secs(30))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    attempt += 1;
                    continue;
                }
            };
            attempt = 0;
            let mut stream = stream;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => self.handle_event(event).await,
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "build event stream error, resubscribing");
                                break;
                            }
                            None => {
                                tracing::warn!("build event stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self, event), fields(service_id = %event.service_id, sha = %event.sha))]
    async fn handle_event(&self, event: BuildEvent) {
        let BuildEvent { service_id, sha, succeeded } = event;
        if let Err(e) = self.orchestrator.handle_build_result(&service_id, &sha, succeeded).await {
            tracing::error!(error = %e, "failed to reconcile build result");
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
    use previewctl_types::{BuildStatus, BuildTool, Environment, EnvironmentStatus, Service};

    fn orchestrator(
        store: Arc<InMemoryStore>,
        cluster: Arc<InMemoryClusterDriver>,
        forge: Arc<InMemoryForgeClient>,
    ) -> LifecycleOrchestrator {
        let quota = QuotaController::new(store.clone(), store.clone());
        let loader = ProjectLoader::new(forge.clone(), "preview.example.com");
        let builder = ImageBuilder::new(forge.clone(), cluster.clone());
        LifecycleOrchestrator::new(
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
        )
    }

    fn env(id: &str, status: EnvironmentStatus) -> Environment {
        Environment {
            id: id.to_string(),
            owner: "acme".to_string(),
            branch_owner: "acme".to_string(),
            repo: "demo".to_string(),
            branch: Some("feature".to_string()),
            pull_request: Some(9),
            author: "bot".to_string(),
            status,
            degraded_reason: None,
            external_comment_id: None,
            build_tool: BuildTool::Buildpacks,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        }
    }

    fn service(id: &str, env_id: &str, status: BuildStatus) -> Service {
        Service {
            id: id.to_string(),
            environment_id: env_id.to_string(),
            name: id.to_string(),
            image: format!("registry/{id}"),
            build: ".".to_string(),
            build_status: status,
            url: String::new(),
            public_port: None,
            internal_ports: vec![],
            index: 0,
        }
    }

    #[tokio::test]
    async fn waits_for_every_service_before_promoting() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        use crate::store::EnvironmentsProvider;
        use crate::store::ServicesProvider;

        EnvironmentsProvider::create(&*store, &env("env-1", EnvironmentStatus::Building))
            .await
            .unwrap();
        ServicesProvider::create_many(
            &*store,
            &[
                service("svc-a", "env-1", BuildStatus::Building),
                service("svc-b", "env-1", BuildStatus::Building),
            ],
        )
        .await
        .unwrap();

        let orch = orchestrator(store.clone(), cluster.clone(), forge.clone());
        orch.handle_build_result("svc-a", "sha1", true).await.unwrap();

        let current = EnvironmentsProvider::get(&*store, "env-1").await.unwrap().unwrap();
        assert_eq!(current.status, EnvironmentStatus::Building);
        assert!(cluster.replicas_of("env-1", "svc-a").is_none());
    }

    #[tokio::test]
    async fn promotes_to_success_once_every_service_has_an_image() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        use crate::store::EnvironmentsProvider;
        use crate::store::ServicesProvider;

        EnvironmentsProvider::create(&*store, &env("env-2", EnvironmentStatus::Building))
            .await
            .unwrap();
        ServicesProvider::create_many(
            &*store,
            &[
                service("svc-a", "env-2", BuildStatus::BuildSuccess),
                service("svc-b", "env-2", BuildStatus::Building),
            ],
        )
        .await
        .unwrap();

        let orch = orchestrator(store.clone(), cluster.clone(), forge.clone());
        orch.handle_build_result("svc-b", "sha1", true).await.unwrap();

        let current = EnvironmentsProvider::get(&*store, "env-2").await.unwrap().unwrap();
        assert_eq!(current.status, EnvironmentStatus::Success);
        assert_eq!(cluster.replicas_of("env-2", "svc-a"), Some(1));
        assert_eq!(cluster.replicas_of("env-2", "svc-b"), Some(1));
    }

    #[tokio::test]
    async fn any_failed_service_degrades_and_tears_down() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        use crate::store::EnvironmentsProvider;
        use crate::store::ServicesProvider;

        EnvironmentsProvider::create(&*store, &env("env-3", EnvironmentStatus::Building))
            .await
            .unwrap();
        ServicesProvider::create_many(
            &*store,
            &[
                service("svc-a", "env-3", BuildStatus::BuildSuccess),
                service("svc-b", "env-3", BuildStatus::Building),
            ],
        )
        .await
        .unwrap();
        cluster.create_namespace("env-3").await.unwrap();

        let orch = orchestrator(store.clone(), cluster.clone(), forge.clone());
        orch.handle_build_result("svc-b", "sha1", false).await.unwrap();

        let current = EnvironmentsProvider::get(&*store, "env-3").await.unwrap().unwrap();
        assert_eq!(current.status, EnvironmentStatus::Degraded);
        assert!(!cluster.namespace_exists("env-3"));
    }

    #[tokio::test]
    async fn stale_event_on_a_non_building_environment_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        let forge = Arc::new(InMemoryForgeClient::new());
        use crate::store::EnvironmentsProvider;
        use crate::store::ServicesProvider;

        EnvironmentsProvider::create(&*store, &env("env-4", EnvironmentStatus::Success))
            .await
            .unwrap();
        ServicesProvider::create_many(&*store, &[service("svc-a", "env-4", BuildStatus::BuildSuccess)])
            .await
            .unwrap();

        let orch = orchestrator(store.clone(), cluster.clone(), forge.clone());
        orch.handle_build_result("svc-a", "sha1", true).await.unwrap();

        assert!(cluster.replicas_of("env-4", "svc-a").is_none());
    }
}
