//! Production `ClusterDriver`, grounded in `storage-operator`'s use of
//! `kube`/`k8s_openapi` for patch application and resource naming.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EnvVar as K8sEnvVar, Namespace, Pod, PodSpec, PodTemplateSpec, Secret,
        },
        networking::v1::Ingress,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
};
use tokio::time::{Duration, Instant};

use crate::driver::{
    BuildEvent, BuildImagesResult, BuildJobSpec, BuildResourceSpec, ClusterDriver, ClusterError,
    LogKind,
};
use crate::render::RenderedEnvironment;

const MANAGER: &str = "previewctl";
const BUILD_NAMESPACE: &str = "previewctl-build";
const CLONE_IMAGE: &str = "alpine/git:latest";
const BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";
const BUILD_ACTIVE_DEADLINE_SECS: i64 = 30 * 60;
const BUILD_TTL_AFTER_FINISHED_SECS: i32 = 120;
const INGRESS_NAMESPACE: &str = "ingress-nginx";
const INGRESS_SELECTOR: &str = "app.kubernetes.io/name=ingress-nginx";

pub struct KubeClusterDriver {
    client: Client,
}

impl KubeClusterDriver {
    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::try_default().await?,
        })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found_is_ok(e: kube::Error) -> Result<(), ClusterError> {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => Ok(()),
        _ => Err(ClusterError::Transient(e.into())),
    }
}

#[async_trait]
impl ClusterDriver for KubeClusterDriver {
    async fn create_namespace(&self, id: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(id.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(ClusterError::Transient(e.into())),
        }
    }

    async fn delete_namespace(&self, id: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(id, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => not_found_is_ok(e),
        }
    }

    async fn apply_rendered(&self, rendered: &RenderedEnvironment) -> Result<(), ClusterError> {
        let ns = rendered.namespace.as_str();
        let pp = PatchParams::apply(MANAGER).force();

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        for secret in &rendered.secrets {
            let name = secret.name_any();
            secrets
                .patch(&name, &pp, &Patch::Apply(secret))
                .await
                .map_err(|e| ClusterError::Transient(e.into()))?;
        }

        let deployments: Api<k8s_openapi::api::apps::v1::Deployment> =
            Api::namespaced(self.client.clone(), ns);
        for deployment in &rendered.deployments {
            let name = deployment.name_any();
            deployments
                .patch(&name, &pp, &Patch::Apply(deployment))
                .await
                .map_err(|e| ClusterError::Transient(e.into()))?;
        }

        let services: Api<k8s_openapi::api::core::v1::Service> =
            Api::namespaced(self.client.clone(), ns);
        for service in &rendered.services {
            let name = service.name_any();
            services
                .patch(&name, &pp, &Patch::Apply(service))
                .await
                .map_err(|e| ClusterError::Transient(e.into()))?;
        }

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), ns);
        for ingress in &rendered.ingresses {
            let name = ingress.name_any();
            ingresses
                .patch(&name, &pp, &Patch::Apply(ingress))
                .await
                .map_err(|e| ClusterError::Transient(e.into()))?;
        }

        Ok(())
    }

    async fn wait_ready(&self, namespace: &str, deadline_secs: u64) -> Result<(), ClusterError> {
        let api: Api<k8s_openapi::api::apps::v1::Deployment> =
            Api::namespaced(self.client.clone(), namespace);
        let deadline = Instant::now() + Duration::from_secs(deadline_secs);
        loop {
            let deployments = api
                .list(&ListParams::default())
                .await
                .map_err(|e| ClusterError::Transient(e.into()))?;
            let all_ready = deployments.items.iter().all(|d| {
                let wanted = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                if wanted == 0 {
                    return true;
                }
                d.status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0)
                    >= wanted
            });
            if all_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout(format!(
                    "workloads in {namespace} not ready"
                )));
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    }

    async fn submit_build_job(&self, spec: BuildJobSpec) -> Result<(), ClusterError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), BUILD_NAMESPACE);

        let mut init_args = vec![
            "clone".to_string(),
            "--branch".to_string(),
            spec.clone_branch.clone(),
            "--depth".to_string(),
            "1".to_string(),
            format!("https://github.com/{}/{}.git", spec.branch_owner, spec.repo),
            "/workspace".to_string(),
        ];
        if spec.clone_token_secret.is_some() {
            init_args.insert(0, "-c".to_string());
            init_args.insert(
                1,
                "credential.helper=store --file=/secrets/token".to_string(),
            );
        }

        let mut build_args: Vec<String> = vec![
            format!("--dockerfile={}", spec.dockerfile_path),
            format!("--context=dir:///workspace/{}", spec.build_context_subpath),
            format!("--destination={}", spec.image_tag),
        ];
        for (k, v) in &spec.build_args {
            build_args.push(format!("--build-arg={k}={v}"));
        }

        let labels = BTreeMap::from([
            ("id".to_string(), spec.service_id.clone()),
            ("sha".to_string(), spec.sha.clone()),
            ("owner".to_string(), spec.owner.clone()),
            ("branch_owner".to_string(), spec.branch_owner.clone()),
            ("repo".to_string(), spec.repo.clone()),
            ("service".to_string(), spec.service.clone()),
        ]);

        let job = Job {
            metadata: ObjectMeta {
                name: Some(spec.service_id.clone()),
                namespace: Some(BUILD_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                active_deadline_seconds: Some(BUILD_ACTIVE_DEADLINE_SECS),
                ttl_seconds_after_finished: Some(BUILD_TTL_AFTER_FINISHED_SECS),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        init_containers: Some(vec![Container {
                            name: "clone".to_string(),
                            image: Some(CLONE_IMAGE.to_string()),
                            args: Some(init_args),
                            ..Default::default()
                        }]),
                        containers: vec![Container {
                            name: "build".to_string(),
                            image: Some(BUILDER_IMAGE.to_string()),
                            args: Some(build_args),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };

        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        Ok(())
    }

    async fn submit_build_resource(&self, spec: BuildResourceSpec) -> Result<(), ClusterError> {
        // Declarative Git-source build resource (pack kind); the cluster's
        // build controller reconciles it asynchronously (§4.2.2, §4.7).
        let gvk = kube::core::GroupVersionKind::gvk("build.previewctl.dev", "v1alpha1", "Build");
        let ar = kube::core::ApiResource::from_gvk(&gvk);
        let api: Api<kube::core::DynamicObject> =
            Api::namespaced_with(self.client.clone(), &spec.namespace, &ar);
        let env: serde_json::Map<String, serde_json::Value> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let body = serde_json::json!({
            "apiVersion": "build.previewctl.dev/v1alpha1",
            "kind": "Build",
            "metadata": {
                "name": spec.service_id,
                "namespace": spec.namespace,
                "labels": { "id": spec.service_id, "sha": spec.sha },
            },
            "spec": {
                "source": { "git": { "url": spec.git_url, "revision": spec.git_revision, "subpath": spec.subpath } },
                "image": spec.image_tag,
                "env": env,
            },
        });
        let obj: kube::core::DynamicObject =
            serde_json::from_value(body).map_err(|e| ClusterError::Transient(e.into()))?;
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        Ok(())
    }

    async fn wait_jobs(
        &self,
        namespace: &str,
        job_names: &[String],
        deadline_secs: u64,
    ) -> Result<BuildImagesResult, ClusterError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let deadline = Instant::now() + Duration::from_secs(deadline_secs);
        let mut pending: Vec<String> = job_names.to_vec();
        let mut failed = Vec::new();

        while !pending.is_empty() {
            if Instant::now() >= deadline {
                failed.extend(pending);
                break;
            }
            let mut still_pending = Vec::new();
            for name in &pending {
                match jobs.get(name).await {
                    Ok(job) => {
                        let status = job.status.unwrap_or_default();
                        if status.succeeded.unwrap_or(0) > 0 {
                            // terminal success, drop from pending
                        } else if status.failed.unwrap_or(0) > 0 {
                            failed.push(name.clone());
                        } else {
                            still_pending.push(name.clone());
                        }
                    }
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {
                        failed.push(name.clone());
                    }
                    Err(e) => return Err(ClusterError::Transient(e.into())),
                }
            }
            pending = still_pending;
            if !pending.is_empty() {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }

        Ok(BuildImagesResult { failed_jobs: failed })
    }

    async fn create_clone_token_secret(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
    ) -> Result<(), ClusterError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut data = BTreeMap::new();
        data.insert(
            "token".to_string(),
            k8s_openapi::ByteString(token.as_bytes().to_vec()),
        );
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        secrets
            .patch(
                name,
                &PatchParams::apply(MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        Ok(())
    }

    async fn create_image_pull_secret(
        &self,
        namespace: &str,
        name: &str,
        registry_host: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ClusterError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        use base64::Engine;
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let dockerconfig = serde_json::json!({
            "auths": { registry_host: { "username": username, "password": password, "auth": auth } }
        });
        let mut data = BTreeMap::new();
        data.insert(
            ".dockerconfigjson".to_string(),
            k8s_openapi::ByteString(dockerconfig.to_string().into_bytes()),
        );
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            ..Default::default()
        };
        secrets
            .patch(
                name,
                &PatchParams::apply(MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        Ok(())
    }

    async fn scale_service(
        &self,
        namespace: &str,
        service_id: &str,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let api: Api<k8s_openapi::api::apps::v1::Deployment> =
            Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            service_id,
            &PatchParams::apply(MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| ClusterError::Transient(e.into()))?;
        Ok(())
    }

    async fn rewrite_ingress_host(
        &self,
        namespace: &str,
        service_id: &str,
        new_host: &str,
    ) -> Result<(), ClusterError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "rules": [{ "host": new_host }] }
        });
        api.patch(
            service_id,
            &PatchParams::apply(MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| ClusterError::Transient(e.into()))?;
        Ok(())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod_selector: &str,
        kind: LogKind,
        since_seconds: u32,
    ) -> Result<BoxStream<'static, Result<String, ClusterError>>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(pod_selector))
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        let Some(pod) = list.items.into_iter().next() else {
            return Err(ClusterError::NotFound(format!(
                "no pod for selector {pod_selector} in {namespace} ({kind:?})"
            )));
        };
        let name = pod.name_any();
        let mut params = LogParams {
            follow: true,
            ..Default::default()
        };
        if since_seconds > 0 {
            params.since_seconds = Some(since_seconds as i64);
        }
        let stream = pods
            .log_stream(&name, &params)
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        let lines = tokio_util::io::ReaderStream::new(stream).map(|chunk| {
            chunk
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                .map_err(|e| ClusterError::Transient(e.into()))
        });
        Ok(Box::pin(lines))
    }

    async fn stream_ingress_logs(
        &self,
        since_seconds: u32,
    ) -> Result<BoxStream<'static, Result<String, ClusterError>>, ClusterError> {
        self.stream_logs(
            INGRESS_NAMESPACE,
            INGRESS_SELECTOR,
            LogKind::Live,
            since_seconds,
        )
        .await
    }

    async fn get_environment_from_host(&self, host: &str) -> Result<Option<String>, ClusterError> {
        let ingresses: Api<Ingress> = Api::all(self.client.clone());
        let list = ingresses
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Transient(e.into()))?;
        for ingress in list.items {
            let matches = ingress
                .spec
                .as_ref()
                .and_then(|s| s.rules.as_ref())
                .is_some_and(|rules| {
                    rules.iter().any(|r| {
                        r.host.as_deref() == Some(host)
                            || r.host.as_deref() == Some(host.trim_start_matches("stale-"))
                    })
                });
            if matches {
                return Ok(ingress.namespace());
            }
        }
        Ok(None)
    }

    async fn watch_build_events(
        &self,
    ) -> Result<BoxStream<'static, Result<BuildEvent, ClusterError>>, ClusterError> {
        use kube::runtime::{WatchStreamExt, watcher};
        use std::collections::HashMap;
        use std::sync::Mutex;

        let gvk = kube::core::GroupVersionKind::gvk("build.previewctl.dev", "v1alpha1", "Build");
        let ar = kube::core::ApiResource::from_gvk(&gvk);
        let api: Api<kube::core::DynamicObject> = Api::all_with(self.client.clone(), &ar);

        // Tracks the last observed `Succeeded` condition per build name so
        // only true transitions (§4.7 step 1) are emitted, not every apply.
        let seen: Mutex<HashMap<String, Option<bool>>> = Mutex::new(HashMap::new());

        let stream = watcher(api, watcher::Config::default())
            .applied_objects()
            .filter_map(move |item| {
                let result = match item {
                    Ok(obj) => {
                        let name = obj.name_any();
                        let succeeded_now = succeeded_condition(&obj);
                        let mut guard = seen.lock().unwrap();
                        let previous = guard.insert(name.clone(), succeeded_now);
                        match (previous, succeeded_now) {
                            (None, Some(s)) | (Some(None), Some(s)) => {
                                let labels = obj.labels();
                                let service_id = labels.get("id").cloned().unwrap_or(name);
                                let sha = labels.get("sha").cloned().unwrap_or_default();
                                Some(Ok(BuildEvent { service_id, sha, succeeded: s }))
                            }
                            _ => None,
                        }
                    }
                    Err(e) => Some(Err(ClusterError::Transient(e.into()))),
                };
                futures::future::ready(result)
            });

        Ok(Box::pin(stream))
    }
}

/// Reads `status.conditions[type=Succeeded].status` off a dynamic `Build`
/// object: `Some(true)`/`Some(false)` once set, `None` while still unknown.
fn succeeded_condition(obj: &kube::core::DynamicObject) -> Option<bool> {
    let conditions = obj.data.get("status")?.get("conditions")?.as_array()?;
    let succeeded = conditions
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Succeeded"))?;
    match succeeded.get("status").and_then(|s| s.as_str())? {
        "True" => Some(true),
        "False" => Some(false),
        _ => None,
    }
}
