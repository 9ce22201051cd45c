//! In-memory `ClusterDriver` used by orchestrator/watcher/reconciler unit
//! tests to exercise state transitions without a live cluster.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::driver::{
    BuildEvent, BuildImagesResult, BuildJobSpec, BuildResourceSpec, ClusterDriver, ClusterError,
    LogKind,
};
use crate::render::RenderedEnvironment;

#[derive(Default)]
struct State {
    namespaces: HashSet<String>,
    deployed: HashMap<String, RenderedEnvironment>,
    replicas: HashMap<(String, String), i32>,
    ingress_hosts: HashMap<(String, String), String>,
    submitted_jobs: HashSet<String>,
    failing_jobs: HashSet<String>,
    host_to_namespace: HashMap<String, String>,
}

pub struct InMemoryClusterDriver {
    state: Mutex<State>,
    build_events_tx: mpsc::UnboundedSender<Result<BuildEvent, ClusterError>>,
    build_events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<BuildEvent, ClusterError>>>>,
}

impl Default for InMemoryClusterDriver {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            build_events_tx: tx,
            build_events_rx: Mutex::new(Some(rx)),
        }
    }
}

impl InMemoryClusterDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `job_name` to be observed as failed by `wait_jobs`.
    pub fn fail_job(&self, job_name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_jobs
            .insert(job_name.to_string());
    }

    pub fn namespace_exists(&self, id: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(id)
    }

    pub fn replicas_of(&self, namespace: &str, service_id: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .replicas
            .get(&(namespace.to_string(), service_id.to_string()))
            .copied()
    }

    pub fn ingress_host_of(&self, namespace: &str, service_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .ingress_hosts
            .get(&(namespace.to_string(), service_id.to_string()))
            .cloned()
    }

    pub fn register_host(&self, host: &str, namespace: &str) {
        self.state
            .lock()
            .unwrap()
            .host_to_namespace
            .insert(host.to_string(), namespace.to_string());
    }

    /// Scripts a build-result transition for `watch_build_events` to yield.
    pub fn push_build_event(&self, event: BuildEvent) {
        let _ = self.build_events_tx.send(Ok(event));
    }
}

#[async_trait]
impl ClusterDriver for InMemoryClusterDriver {
    async fn create_namespace(&self, id: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().namespaces.insert(id.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, id: &str) -> Result<(), ClusterError> {
        let mut s = self.state.lock().unwrap();
        s.namespaces.remove(id);
        s.deployed.remove(id);
        Ok(())
    }

    async fn apply_rendered(&self, rendered: &RenderedEnvironment) -> Result<(), ClusterError> {
        let mut s = self.state.lock().unwrap();
        for d in &rendered.deployments {
            let replicas = d
                .spec
                .as_ref()
                .and_then(|sp| sp.replicas)
                .unwrap_or(1);
            let name = d.metadata.name.clone().unwrap_or_default();
            s.replicas
                .insert((rendered.namespace.clone(), name), replicas);
        }
        for ing in &rendered.ingresses {
            let name = ing.metadata.name.clone().unwrap_or_default();
            if let Some(host) = ing
                .spec
                .as_ref()
                .and_then(|sp| sp.rules.as_ref())
                .and_then(|r| r.first())
                .and_then(|r| r.host.clone())
            {
                s.ingress_hosts
                    .insert((rendered.namespace.clone(), name), host);
            }
        }
        s.deployed
            .insert(rendered.namespace.clone(), rendered.clone());
        Ok(())
    }

    async fn wait_ready(&self, _namespace: &str, _deadline_secs: u64) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn submit_build_job(&self, spec: BuildJobSpec) -> Result<(), ClusterError> {
        self.state
            .lock()
            .unwrap()
            .submitted_jobs
            .insert(spec.service_id);
        Ok(())
    }

    async fn submit_build_resource(&self, spec: BuildResourceSpec) -> Result<(), ClusterError> {
        self.state
            .lock()
            .unwrap()
            .submitted_jobs
            .insert(spec.service_id);
        Ok(())
    }

    async fn wait_jobs(
        &self,
        _namespace: &str,
        job_names: &[String],
        _deadline_secs: u64,
    ) -> Result<BuildImagesResult, ClusterError> {
        let s = self.state.lock().unwrap();
        let failed = job_names
            .iter()
            .filter(|n| s.failing_jobs.contains(*n))
            .cloned()
            .collect();
        Ok(BuildImagesResult { failed_jobs: failed })
    }

    async fn create_clone_token_secret(
        &self,
        _namespace: &str,
        _name: &str,
        _token: &str,
    ) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn create_image_pull_secret(
        &self,
        _namespace: &str,
        _name: &str,
        _registry_host: &str,
        _username: &str,
        _password: &str,
    ) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn scale_service(
        &self,
        namespace: &str,
        service_id: &str,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        self.state
            .lock()
            .unwrap()
            .replicas
            .insert((namespace.to_string(), service_id.to_string()), replicas);
        Ok(())
    }

    async fn rewrite_ingress_host(
        &self,
        namespace: &str,
        service_id: &str,
        new_host: &str,
    ) -> Result<(), ClusterError> {
        self.state.lock().unwrap().ingress_hosts.insert(
            (namespace.to_string(), service_id.to_string()),
            new_host.to_string(),
        );
        Ok(())
    }

    async fn stream_logs(
        &self,
        _namespace: &str,
        _pod_selector: &str,
        _kind: LogKind,
        _since_seconds: u32,
    ) -> Result<BoxStream<'static, Result<String, ClusterError>>, ClusterError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn stream_ingress_logs(
        &self,
        _since_seconds: u32,
    ) -> Result<BoxStream<'static, Result<String, ClusterError>>, ClusterError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn get_environment_from_host(&self, host: &str) -> Result<Option<String>, ClusterError> {
        let s = self.state.lock().unwrap();
        Ok(s.host_to_namespace
            .get(host)
            .or_else(|| s.host_to_namespace.get(host.trim_start_matches("stale-")))
            .cloned())
    }

    async fn watch_build_events(
        &self,
    ) -> Result<BoxStream<'static, Result<BuildEvent, ClusterError>>, ClusterError> {
        let rx = self
            .build_events_rx
            .lock()
            .unwrap()
            .take()
            .expect("watch_build_events called more than once on InMemoryClusterDriver");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
