//! Image Builder (C2, §4.2): resolves the build repo/subpath for each
//! service, mints per-repo clone tokens, submits build jobs/resources, and
//! waits for compose-kind jobs to finish.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use previewctl_cluster::{BuildImagesResult, BuildJobSpec, BuildResourceSpec, ClusterDriver};
use previewctl_forge::ForgeClient;
use previewctl_types::{EnvironmentDescriptor, ManifestKind, ResolvedEnvVar};

use crate::error::Result;
use crate::multirepo::compute_repo_and_build_path;

const BUILD_WAIT_DEADLINE_SECS: u64 = 3600;
const BUILD_NAMESPACE: &str = "previewctl-build";

pub struct BuildRequest<'a> {
    pub owner: &'a str,
    pub branch_owner: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub sha: &'a str,
    pub namespace: &'a str,
    pub kind: ManifestKind,
    pub project_path: &'a Path,
    pub config_path: &'a Path,
    pub descriptor: &'a EnvironmentDescriptor,
    pub repo_env_vars: &'a [ResolvedEnvVar],
}

pub struct ImageBuilder {
    forge: Arc<dyn ForgeClient>,
    cluster: Arc<dyn ClusterDriver>,
}

impl ImageBuilder {
    pub fn new(forge: Arc<dyn ForgeClient>, cluster: Arc<dyn ClusterDriver>) -> Self {
        Self { forge, cluster }
    }

    #[tracing::instrument(skip(self, req), fields(owner = req.owner, repo = req.repo))]
    pub async fn build(&self, req: BuildRequest<'_>) -> Result<BuildImagesResult> {
        let buildable: Vec<_> = req.descriptor.services.iter().filter(|s| s.has_build()).collect();
        if buildable.is_empty() {
            return Ok(BuildImagesResult::default());
        }

        let mut clone_tokens: HashMap<String, String> = HashMap::new();
        let mut job_names = Vec::new();

        for svc in &buildable {
            let (build_repo, build_subpath) = compute_repo_and_build_path(
                req.project_path,
                req.config_path,
                &svc.build,
                req.repo,
            );

            let clone_branch = if build_repo == req.repo {
                req.branch.to_string()
            } else if self
                .forge
                .does_branch_exist(req.branch_owner, &build_repo, req.branch)
                .await?
            {
                req.branch.to_string()
            } else {
                self.forge.get_default_branch(req.branch_owner, &build_repo).await?
            };

            let clone_token_secret = if self.forge.is_repo_private(req.branch_owner, &build_repo).await? {
                let token = match clone_tokens.get(&build_repo) {
                    Some(t) => t.clone(),
                    None => {
                        let t = self.forge.get_clone_token(req.branch_owner, &build_repo).await?;
                        clone_tokens.insert(build_repo.clone(), t.clone());
                        t
                    }
                };
                let secret_name = format!("clone-token-{}", svc.id);
                self.cluster
                    .create_clone_token_secret(BUILD_NAMESPACE, &secret_name, &token)
                    .await?;
                Some(secret_name)
            } else {
                None
            };

            let build_args = merge_build_args(&svc.build_args, req.repo_env_vars);

            match req.kind {
                ManifestKind::Compose => {
                    let job_name = svc.id.clone();
                    self.cluster
                        .submit_build_job(BuildJobSpec {
                            service_id: svc.id.clone(),
                            namespace: BUILD_NAMESPACE.to_string(),
                            sha: req.sha.to_string(),
                            owner: req.owner.to_string(),
                            branch_owner: req.branch_owner.to_string(),
                            repo: build_repo.clone(),
                            service: svc.name.clone(),
                            clone_branch,
                            clone_token_secret,
                            dockerfile_path: format!("{build_subpath}/Dockerfile"),
                            build_context_subpath: build_subpath,
                            image_tag: svc.image.clone(),
                            build_args,
                        })
                        .await?;
                    job_names.push(job_name);
                }
                ManifestKind::Pack => {
                    let git_url = format!("https://github.com/{}/{}.git", req.branch_owner, build_repo);
                    self.cluster
                        .submit_build_resource(BuildResourceSpec {
                            service_id: svc.id.clone(),
                            namespace: req.namespace.to_string(),
                            sha: req.sha.to_string(),
                            git_url,
                            git_revision: clone_branch,
                            subpath: build_subpath,
                            image_tag: svc.image.clone(),
                            env: build_args,
                        })
                        .await?;
                }
            }
        }

        match req.kind {
            ManifestKind::Compose => Ok(self
                .cluster
                .wait_jobs(BUILD_NAMESPACE, &job_names, BUILD_WAIT_DEADLINE_SECS)
                .await?),
            // Completion is observed asynchronously by the Build-Result Reconciler (§4.7).
            ManifestKind::Pack => Ok(BuildImagesResult::default()),
        }
    }
}

/// Manifest build-args win over repository-scoped env vars with the same name.
fn merge_build_args(manifest_args: &[ResolvedEnvVar], repo_env: &[ResolvedEnvVar]) -> Vec<(String, String)> {
    let mut merged: HashMap<String, String> =
        repo_env.iter().map(|e| (e.name.clone(), e.value.clone())).collect();
    for arg in manifest_args {
        merged.insert(arg.name.clone(), arg.value.clone());
    }
    let mut out: Vec<_> = merged.into_iter().collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_build_args_win_over_repo_env_vars() {
        let manifest_args = vec![ResolvedEnvVar {
            name: "NODE_ENV".to_string(),
            value: "production".to_string(),
        }];
        let repo_env = vec![
            ResolvedEnvVar {
                name: "NODE_ENV".to_string(),
                value: "development".to_string(),
            },
            ResolvedEnvVar {
                name: "API_KEY".to_string(),
                value: "secret".to_string(),
            },
        ];
        let merged = merge_build_args(&manifest_args, &repo_env);
        assert!(merged.contains(&("NODE_ENV".to_string(), "production".to_string())));
        assert!(merged.contains(&("API_KEY".to_string(), "secret".to_string())));
    }
}
