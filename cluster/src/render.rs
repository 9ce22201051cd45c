//! Cluster Renderer (C3): translates an `EnvironmentDescriptor` into
//! concrete cluster objects with the hardening defaults from §4.3.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvFromSource, LocalObjectReference, PodSecurityContext,
            PodSpec, PodTemplateSpec, ResourceRequirements, SeccompProfile, Secret,
            SecretEnvSource, Service as K8sService, ServicePort, ServiceSpec, Toleration,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressRule, IngressServiceBackend,
            IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use previewctl_types::{EnvironmentDescriptor, ManifestKind, ResolvedRegistryCred};
use std::collections::HashMap;

pub const LABEL_PREFIX: &str = "preview.previewctl.dev";
pub const NODE_ROLE_LABEL: &str = "preview.previewctl.dev/role";
pub const NODE_ROLE_VALUE: &str = "preview";
pub const TOLERATION_KEY: &str = "preview.previewctl.dev/domain";
pub const TOLERATION_VALUE: &str = "previews";
pub const ENV_SECRET_NAME: &str = "service-env";

#[derive(Debug, Clone, Default)]
pub struct RenderedEnvironment {
    pub namespace: String,
    pub secrets: Vec<Secret>,
    pub deployments: Vec<Deployment>,
    pub services: Vec<K8sService>,
    pub ingresses: Vec<Ingress>,
}

pub struct RenderContext<'a> {
    pub kind: ManifestKind,
    pub namespace: String,
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub internal_registry_host: String,
    pub registry_creds: &'a HashMap<String, ResolvedRegistryCred>,
    pub pull_secret_name: &'a str,
}

/// Renders every service in `descriptor` into workload/service/ingress
/// objects, applying the mandatory hardening transforms of §4.3.
pub fn render(ctx: &RenderContext, descriptor: &EnvironmentDescriptor) -> RenderedEnvironment {
    let mut out = RenderedEnvironment {
        namespace: ctx.namespace.clone(),
        ..Default::default()
    };

    let ephemeral_storage = match ctx.kind {
        ManifestKind::Compose => "5Gi",
        ManifestKind::Pack => "2Gi",
    };

    // One secret per environment holds every service's resolved env vars
    // (§4.3): containers pull theirs via `envFrom`, not literal values.
    let mut secret_data = BTreeMap::new();
    for svc in &descriptor.services {
        for e in &svc.env {
            secret_data.insert(e.name.clone(), e.value.clone());
        }
    }
    if !secret_data.is_empty() {
        out.secrets.push(Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(ENV_SECRET_NAME.to_string()),
                namespace: Some(ctx.namespace.clone()),
                ..Default::default()
            },
            string_data: Some(secret_data),
            ..Default::default()
        });
    }
    let env_from = if descriptor.services.iter().any(|s| !s.env.is_empty()) {
        Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: ENV_SECRET_NAME.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }])
    } else {
        None
    };

    for svc in &descriptor.services {
        let labels = service_labels(ctx, &svc.id, &svc.name);

        let mut requests = BTreeMap::new();
        requests.insert("memory".to_string(), Quantity("1Gi".to_string()));
        requests.insert(
            "ephemeral-storage".to_string(),
            Quantity(ephemeral_storage.to_string()),
        );
        let limits = requests.clone();

        let mut image_pull_secrets = vec![];
        if !svc.image.starts_with(&ctx.internal_registry_host)
            && let Some(host) = registry_host_of(&svc.image)
            && ctx.registry_creds.contains_key(host)
        {
            image_pull_secrets.push(LocalObjectReference {
                name: format!("{}-pull", svc.id),
            });
        } else if !ctx.pull_secret_name.is_empty() && !svc.image.starts_with(&ctx.internal_registry_host)
        {
            image_pull_secrets.push(LocalObjectReference {
                name: ctx.pull_secret_name.to_string(),
            });
        }

        let container = Container {
            name: svc.name.clone(),
            image: Some(svc.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env_from: env_from.clone(),
            // Host ports are stripped (§4.3): only internal container ports remain.
            ports: Some(
                svc.internal_ports
                    .iter()
                    .map(|p| ContainerPort {
                        container_port: *p as i32,
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![container],
            restart_policy: Some("Always".to_string()),
            automount_service_account_token: Some(false),
            security_context: Some(PodSecurityContext {
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            node_selector: Some(BTreeMap::from([(
                NODE_ROLE_LABEL.to_string(),
                NODE_ROLE_VALUE.to_string(),
            )])),
            tolerations: Some(vec![Toleration {
                key: Some(TOLERATION_KEY.to_string()),
                operator: Some("Equal".to_string()),
                value: Some(TOLERATION_VALUE.to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }]),
            image_pull_secrets: if image_pull_secrets.is_empty() {
                None
            } else {
                Some(image_pull_secrets)
            },
            ..Default::default()
        };

        // Pack-kind workloads default to zero replicas; wake-on-request scales up (§4.3, §4.6).
        let replicas = match ctx.kind {
            ManifestKind::Compose => 1,
            ManifestKind::Pack => 0,
        };

        let deployment = Deployment {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(svc.id.clone()),
                namespace: Some(ctx.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations(ctx, &svc.id)),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), svc.id.clone())])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            status: None,
        };
        out.deployments.push(deployment);

        if !svc.internal_ports.is_empty() {
            let service = K8sService {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(svc.id.clone()),
                    namespace: Some(ctx.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    selector: Some(BTreeMap::from([("app".to_string(), svc.id.clone())])),
                    ports: Some(
                        svc.internal_ports
                            .iter()
                            .map(|p| ServicePort {
                                port: *p as i32,
                                target_port: Some(IntOrString::Int(*p as i32)),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }),
                status: None,
            };
            out.services.push(service);
        }

        if !svc.url.is_empty()
            && let Some(public_port) = svc.public_port
        {
            let ingress = Ingress {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(svc.id.clone()),
                    namespace: Some(ctx.namespace.clone()),
                    labels: Some(labels.clone()),
                    annotations: Some(BTreeMap::from([(
                        "kubernetes.io/ingress.class".to_string(),
                        "nginx".to_string(),
                    )])),
                    ..Default::default()
                },
                spec: Some(IngressSpec {
                    rules: Some(vec![IngressRule {
                        host: Some(svc.url.clone()),
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![HTTPIngressPath {
                                path: Some("/".to_string()),
                                path_type: "Prefix".to_string(),
                                backend: k8s_openapi::api::networking::v1::IngressBackend {
                                    service: Some(IngressServiceBackend {
                                        name: svc.id.clone(),
                                        port: Some(ServiceBackendPort {
                                            number: Some(public_port as i32),
                                            ..Default::default()
                                        }),
                                    }),
                                    ..Default::default()
                                },
                            }],
                        }),
                    }]),
                    ..Default::default()
                }),
                status: None,
            };
            out.ingresses.push(ingress);
        }
    }

    out
}

fn service_labels(ctx: &RenderContext, service_id: &str, service_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), service_id.to_string()),
        (format!("{LABEL_PREFIX}/id"), service_id.to_string()),
        (format!("{LABEL_PREFIX}/service"), service_name.to_string()),
        (format!("{LABEL_PREFIX}/owner"), ctx.owner.clone()),
        (format!("{LABEL_PREFIX}/repo"), ctx.repo.clone()),
        (format!("{LABEL_PREFIX}/sha"), ctx.sha.clone()),
    ])
}

fn annotations(ctx: &RenderContext, service_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(format!("{LABEL_PREFIX}/id"), service_id.to_string())])
}

/// Extract the registry host prefix of an image reference, or `None` for
/// bare Docker Hub references (`nginx:latest`) which never need a pull secret.
fn registry_host_of(image: &str) -> Option<&str> {
    let before_tag = image.split('@').next().unwrap_or(image);
    let first_segment = before_tag.split('/').next()?;
    if first_segment.contains('.') || first_segment.contains(':') || first_segment == "localhost" {
        Some(first_segment)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_image_has_no_registry_host() {
        assert_eq!(registry_host_of("nginx:latest"), None);
        assert_eq!(registry_host_of("library/nginx"), None);
    }

    #[test]
    fn qualified_image_has_registry_host() {
        assert_eq!(
            registry_host_of("registry.example.com/team/app:sha-123"),
            Some("registry.example.com")
        );
    }

    #[test]
    fn render_strips_host_ports_and_sets_hardening_defaults() {
        let descriptor = EnvironmentDescriptor {
            services: vec![previewctl_types::EnvironmentServiceDescriptor {
                id: "svc-1".into(),
                name: "web".into(),
                image: "nginx:latest".into(),
                build: String::new(),
                url: "web-acme-demo-42.previews.example.com".into(),
                public_port: Some(3000),
                internal_ports: vec![3000],
                env: vec![],
                build_args: vec![],
                index: 0,
            }],
        };
        let creds = HashMap::new();
        let ctx = RenderContext {
            kind: ManifestKind::Compose,
            namespace: "env-1".into(),
            owner: "acme".into(),
            repo: "demo".into(),
            sha: "deadbeef".into(),
            internal_registry_host: "internal.registry".into(),
            registry_creds: &creds,
            pull_secret_name: "",
        };
        let rendered = render(&ctx, &descriptor);
        assert_eq!(rendered.deployments.len(), 1);
        let pod_spec = rendered.deployments[0]
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Always"));
        assert_eq!(pod_spec.automount_service_account_token, Some(false));
        assert_eq!(rendered.ingresses.len(), 1);
        assert_eq!(
            rendered.ingresses[0]
                .spec
                .as_ref()
                .unwrap()
                .rules
                .as_ref()
                .unwrap()[0]
                .host
                .as_deref(),
            Some("web-acme-demo-42.previews.example.com")
        );
    }
}
