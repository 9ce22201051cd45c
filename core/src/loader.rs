//! Project Loader (C1, §4.1): materialises project source onto local disk,
//! discovers and validates the `.ergomake/` manifest, and normalises it into
//! an [`EnvironmentDescriptor`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use previewctl_forge::ForgeClient;
use previewctl_types::{
    EnvironmentDescriptor, EnvironmentServiceDescriptor, LoadResult, ManifestKind,
    ProjectValidationError, ResolvedEnvVar,
};

use crate::error::{Error, Result};
use crate::mustache_render::{self, RenderMode};

const MANIFEST_DIR: &str = ".ergomake";

const ERGOMAKE_MANIFEST_NAMES: &[(&str, ManifestKind)] = &[
    (".ergomake/ergopack.yml", ManifestKind::Pack),
    (".ergomake/ergopack.yaml", ManifestKind::Pack),
    (".ergomake/compose.yml", ManifestKind::Compose),
    (".ergomake/compose.yaml", ManifestKind::Compose),
    (".ergomake/docker-compose.yml", ManifestKind::Compose),
    (".ergomake/docker-compose.yaml", ManifestKind::Compose),
];

const ROOT_MANIFEST_NAMES: &[(&str, ManifestKind)] = &[
    ("compose.yml", ManifestKind::Compose),
    ("compose.yaml", ManifestKind::Compose),
    ("docker-compose.yml", ManifestKind::Compose),
    ("docker-compose.yaml", ManifestKind::Compose),
];

/// Where project source comes from for one load.
pub enum LoadInput {
    /// Clone `branch` of `branch_owner/repo` over HTTPS.
    SourceRef {
        branch_owner: String,
        repo: String,
        branch: String,
        is_private: bool,
    },
    /// A `.tar.gz` archive already staged on disk (CLI upload path).
    Archive(PathBuf),
}

/// Removes the materialised source directory on drop, so an early `?` return
/// from [`ProjectLoader::load`]'s caller still cleans up. Mirrors the
/// teacher's `Cleanup()`-on-transformer pattern as a `Drop` guard instead of
/// an explicit deferred call.
pub struct SourceGuard {
    path: PathBuf,
}

impl SourceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to clean up materialised source");
        }
    }
}

pub struct ProjectLoader {
    forge: Arc<dyn ForgeClient>,
    cluster_domain: String,
}

impl ProjectLoader {
    pub fn new(forge: Arc<dyn ForgeClient>, cluster_domain: impl Into<String>) -> Self {
        Self {
            forge,
            cluster_domain: cluster_domain.into(),
        }
    }

    #[tracing::instrument(skip(self, input), fields(owner, repo))]
    pub async fn load(
        &self,
        input: LoadInput,
        owner: &str,
        repo: &str,
        url_suffix: &str,
    ) -> Result<(LoadResult, SourceGuard)> {
        let project_path = self.materialize(input).await?;
        let guard = SourceGuard {
            path: project_path.clone(),
        };

        if !project_path.join(MANIFEST_DIR).is_dir() {
            return Ok((
                LoadResult {
                    project_path,
                    config_path: PathBuf::new(),
                    kind: ManifestKind::Compose,
                    environment_descriptor: EnvironmentDescriptor::default(),
                    skip: true,
                    validation_error: None,
                },
                guard,
            ));
        }

        let Some((config_path, kind)) = discover_manifest(&project_path) else {
            return Ok((
                LoadResult {
                    project_path,
                    config_path: PathBuf::new(),
                    kind: ManifestKind::Compose,
                    environment_descriptor: EnvironmentDescriptor::default(),
                    skip: true,
                    validation_error: None,
                },
                guard,
            ));
        };

        let raw = match std::fs::read_to_string(&config_path) {
            Ok(raw) => raw,
            Err(e) => {
                return Ok((
                    validation_result(project_path, config_path, kind, "read-error", e.to_string()),
                    guard,
                ));
            }
        };

        let descriptor = match kind {
            ManifestKind::Compose => match parse_compose(&raw, &config_path, owner, repo, url_suffix, &self.cluster_domain) {
                Ok(d) => d,
                Err(validation) => {
                    return Ok((
                        validation_result(project_path, config_path, kind, &validation.kind, validation.message),
                        guard,
                    ));
                }
            },
            ManifestKind::Pack => match parse_pack(&raw, owner, repo, url_suffix, &self.cluster_domain) {
                Ok(d) => d,
                Err(validation) => {
                    return Ok((
                        validation_result(project_path, config_path, kind, &validation.kind, validation.message),
                        guard,
                    ));
                }
            },
        };

        Ok((
            LoadResult {
                project_path,
                config_path,
                kind,
                environment_descriptor: descriptor,
                skip: false,
                validation_error: None,
            },
            guard,
        ))
    }

    async fn materialize(&self, input: LoadInput) -> Result<PathBuf> {
        match input {
            LoadInput::SourceRef {
                branch_owner,
                repo,
                branch,
                is_private,
            } => self.clone_shallow(&branch_owner, &repo, &branch, is_private).await,
            LoadInput::Archive(archive_path) => extract_archive(&archive_path),
        }
    }

    async fn clone_shallow(
        &self,
        branch_owner: &str,
        repo: &str,
        branch: &str,
        is_private: bool,
    ) -> Result<PathBuf> {
        let dest = tempfile::Builder::new()
            .prefix("previewctl-src-")
            .tempdir()
            .map_err(|e| Error::Transient(anyhow::anyhow!("failed to create temp dir: {e}")))?
            .keep();

        let token = if is_private {
            Some(self.forge.get_clone_token(branch_owner, repo).await?)
        } else {
            None
        };

        let url = format!("https://github.com/{branch_owner}/{repo}.git");
        let branch = branch.to_string();
        let dest_for_blocking = dest.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut callbacks = git2::RemoteCallbacks::new();
            if let Some(token) = token.clone() {
                callbacks.credentials(move |_url, _username, _allowed| {
                    git2::Cred::userpass_plaintext("x-access-token", &token)
                });
            }

            let mut fetch_options = git2::FetchOptions::new();
            fetch_options.remote_callbacks(callbacks);
            fetch_options.depth(1);

            git2::build::RepoBuilder::new()
                .branch(&branch)
                .fetch_options(fetch_options)
                .clone(&url, &dest_for_blocking)
                .map_err(|e| Error::Transient(anyhow::anyhow!("git clone failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Transient(anyhow::anyhow!("clone task panicked: {e}")))??;

        Ok(dest)
    }
}

fn extract_archive(archive_path: &Path) -> Result<PathBuf> {
    let dest = tempfile::Builder::new()
        .prefix("previewctl-src-")
        .tempdir()
        .map_err(|e| Error::Transient(anyhow::anyhow!("failed to create temp dir: {e}")))?
        .keep();

    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::Transient(anyhow::anyhow!("failed to open archive: {e}")))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(&dest)
        .map_err(|e| Error::Transient(anyhow::anyhow!("failed to extract archive: {e}")))?;

    Ok(dest)
}

fn discover_manifest(project_path: &Path) -> Option<(PathBuf, ManifestKind)> {
    for (name, kind) in ERGOMAKE_MANIFEST_NAMES.iter().chain(ROOT_MANIFEST_NAMES) {
        let candidate = project_path.join(name);
        if candidate.is_file() {
            return Some((candidate, *kind));
        }
    }
    None
}

fn validation_result(
    project_path: PathBuf,
    config_path: PathBuf,
    kind: ManifestKind,
    error_kind: &str,
    message: String,
) -> LoadResult {
    LoadResult {
        project_path,
        config_path,
        kind,
        environment_descriptor: EnvironmentDescriptor::default(),
        skip: false,
        validation_error: Some(ProjectValidationError {
            kind: error_kind.to_string(),
            message,
        }),
    }
}

// --- compose manifest --------------------------------------------------

fn parse_compose(
    raw: &str,
    config_path: &Path,
    owner: &str,
    repo: &str,
    url_suffix: &str,
    cluster_domain: &str,
) -> std::result::Result<EnvironmentDescriptor, ProjectValidationError> {
    let doc: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| ProjectValidationError {
        kind: "yaml-parse-error".to_string(),
        message: e.to_string(),
    })?;

    let services_value = doc
        .as_mapping()
        .and_then(|m| m.get("services"))
        .and_then(|v| v.as_mapping())
        .ok_or_else(|| ProjectValidationError {
            kind: "missing-services".to_string(),
            message: "manifest must be a mapping containing a `services` mapping".to_string(),
        })?;

    let manifest_dir = config_path.parent().unwrap_or(Path::new("."));
    let order = scan_block_order(raw, "services");

    let mut services = Vec::new();
    for (name_value, svc_value) in services_value {
        let name = name_value.as_str().unwrap_or_default().to_string();
        let svc = svc_value.as_mapping();

        let image = svc
            .and_then(|m| m.get("image"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let build = svc
            .and_then(|m| m.get("build"))
            .map(|v| match v {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Mapping(m) => m
                    .get("context")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            })
            .unwrap_or_default();

        let (public_port, internal_ports) = parse_ports(svc);

        let mut env = parse_env_file(svc, manifest_dir)?;
        env.extend(parse_environment(svc));

        let index = order.get(&name).copied().unwrap_or(i32::MAX);

        let url = public_port
            .map(|_| compute_service_url(&name, owner, repo, url_suffix, cluster_domain))
            .unwrap_or_default();

        services.push(EnvironmentServiceDescriptor {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            image,
            build,
            url,
            public_port,
            internal_ports,
            env,
            build_args: Vec::new(),
            index,
        });
    }

    services.sort_by_key(|s| s.index);
    for (i, svc) in services.iter_mut().enumerate() {
        svc.index = i as i32;
    }

    Ok(EnvironmentDescriptor { services })
}

fn parse_ports(svc: Option<&serde_yaml::Mapping>) -> (Option<u16>, Vec<u16>) {
    let Some(ports) = svc.and_then(|m| m.get("ports")).and_then(|v| v.as_sequence()) else {
        return (None, Vec::new());
    };

    let mut public_port = None;
    let mut internal_ports = Vec::new();

    for entry in ports {
        let spec = match entry {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if let Some((host, container)) = spec.split_once(':') {
            if let (Ok(host), Ok(container)) = (host.parse::<u16>(), container.parse::<u16>()) {
                public_port.get_or_insert(host);
                internal_ports.push(container);
            }
        } else if let Ok(container) = spec.parse::<u16>() {
            internal_ports.push(container);
        }
    }

    (public_port, internal_ports)
}

fn parse_env_file(
    svc: Option<&serde_yaml::Mapping>,
    manifest_dir: &Path,
) -> std::result::Result<Vec<ResolvedEnvVar>, ProjectValidationError> {
    let Some(env_file_value) = svc.and_then(|m| m.get("env_file")) else {
        return Ok(Vec::new());
    };

    let files: Vec<String> = match env_file_value {
        serde_yaml::Value::String(s) => vec![s.clone()],
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => {
            return Err(ProjectValidationError {
                kind: "invalid-env-file".to_string(),
                message: "env_file must be a string or a list of strings".to_string(),
            });
        }
    };

    let mut out = Vec::new();
    for file in files {
        let path = manifest_dir.join(&file);
        let contents = std::fs::read_to_string(&path).map_err(|_| ProjectValidationError {
            kind: "env-file-not-found".to_string(),
            message: format!("env_file `{file}` does not resolve to an existing file"),
        })?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((name, value)) = line.split_once('=') {
                out.push(ResolvedEnvVar {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                });
            }
        }
    }
    Ok(out)
}

fn parse_environment(svc: Option<&serde_yaml::Mapping>) -> Vec<ResolvedEnvVar> {
    let Some(env_value) = svc.and_then(|m| m.get("environment")) else {
        return Vec::new();
    };

    match env_value {
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .filter_map(|s| s.split_once('='))
            .map(|(name, value)| ResolvedEnvVar {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
        serde_yaml::Value::Mapping(m) => m
            .iter()
            .filter_map(|(k, v)| {
                let name = k.as_str()?.to_string();
                let value = match v {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some(ResolvedEnvVar { name, value })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Re-scans the raw manifest text to assign `services:`/`apps:` map-key order
/// by first-seen indentation level, per §4.1 step 6 (not map-iteration order,
/// which YAML libraries don't guarantee and which can differ from source
/// order after a round-trip).
fn scan_block_order(raw: &str, block_key: &str) -> BTreeMap<String, i32> {
    let mut order = BTreeMap::new();
    let mut in_block = false;
    let mut entry_indent: Option<usize> = None;
    let mut index = 0i32;

    for line in raw.lines() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if !in_block {
            if trimmed == format!("{block_key}:") {
                in_block = true;
            }
            continue;
        }

        match entry_indent {
            None => {
                entry_indent = Some(indent);
            }
            Some(level) => {
                if indent < level {
                    break;
                }
                if indent > level {
                    continue;
                }
            }
        }

        if let Some(name) = trimmed.strip_suffix(':').or_else(|| {
            trimmed
                .split_once(':')
                .map(|(k, _)| k)
                .filter(|_| trimmed.contains(':'))
        }) {
            order.entry(name.trim().to_string()).or_insert_with(|| {
                let i = index;
                index += 1;
                i
            });
        }
    }

    order
}

// --- pack manifest -------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize)]
struct ErgopackApp {
    #[serde(default)]
    image: String,
    #[serde(default)]
    build: String,
    #[serde(default)]
    #[serde(rename = "publicPort")]
    public_port: Option<u16>,
    #[serde(default)]
    #[serde(rename = "internalPorts")]
    internal_ports: Vec<u16>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    #[serde(rename = "buildArgs")]
    build_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Ergopack {
    apps: BTreeMap<String, ErgopackApp>,
}

fn parse_pack(
    raw: &str,
    owner: &str,
    repo: &str,
    url_suffix: &str,
    cluster_domain: &str,
) -> std::result::Result<EnvironmentDescriptor, ProjectValidationError> {
    let pack: Ergopack = serde_yaml::from_str(raw).map_err(|e| ProjectValidationError {
        kind: "yaml-parse-error".to_string(),
        message: e.to_string(),
    })?;

    let order = scan_block_order(raw, "apps");

    let mut services: Vec<EnvironmentServiceDescriptor> = pack
        .apps
        .into_iter()
        .map(|(name, app)| {
            let url = app
                .public_port
                .map(|_| compute_service_url(&name, owner, repo, url_suffix, cluster_domain))
                .unwrap_or_default();
            let index = order.get(&name).copied().unwrap_or(i32::MAX);
            EnvironmentServiceDescriptor {
                id: uuid::Uuid::new_v4().to_string(),
                name,
                image: app.image,
                build: app.build,
                url,
                public_port: app.public_port,
                internal_ports: app.internal_ports,
                env: app
                    .env
                    .into_iter()
                    .map(|(name, value)| ResolvedEnvVar { name, value })
                    .collect(),
                build_args: app
                    .build_args
                    .into_iter()
                    .map(|(name, value)| ResolvedEnvVar { name, value })
                    .collect(),
                index,
            }
        })
        .collect();

    services.sort_by_key(|s| s.index);
    for (i, svc) in services.iter_mut().enumerate() {
        svc.index = i as i32;
    }

    let mut descriptor = EnvironmentDescriptor { services };
    render_pack_env_placeholders(&mut descriptor)?;
    Ok(descriptor)
}

/// Renders `{{...}}` placeholders in every service's env values against the
/// descriptor itself (tolerant: unresolved placeholders are left as-is).
fn render_pack_env_placeholders(
    descriptor: &mut EnvironmentDescriptor,
) -> std::result::Result<(), ProjectValidationError> {
    let context = serde_json::to_value(&*descriptor).map_err(|e| ProjectValidationError {
        kind: "descriptor-serialize-error".to_string(),
        message: e.to_string(),
    })?;

    for svc in &mut descriptor.services {
        for var in &mut svc.env {
            if let Ok(rendered) = mustache_render::render(&var.value, &context, RenderMode::Tolerant) {
                var.value = rendered;
            }
        }
    }
    Ok(())
}

fn compute_service_url(
    service: &str,
    owner: &str,
    repo: &str,
    suffix: &str,
    cluster_domain: &str,
) -> String {
    let repo_no_underscore = repo.replace('_', "-");
    format!("{service}-{owner}-{repo_no_underscore}-{suffix}.{cluster_domain}").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_ergopack_before_compose() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".ergomake")).unwrap();
        std::fs::write(dir.path().join(".ergomake/compose.yml"), "services: {}").unwrap();
        std::fs::write(dir.path().join(".ergomake/ergopack.yaml"), "apps: {}").unwrap();

        let (path, kind) = discover_manifest(dir.path()).unwrap();
        assert_eq!(kind, ManifestKind::Pack);
        assert!(path.ends_with(".ergomake/ergopack.yaml"));
    }

    #[test]
    fn falls_back_to_root_compose_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker-compose.yaml"), "services: {}").unwrap();

        let (path, kind) = discover_manifest(dir.path()).unwrap();
        assert_eq!(kind, ManifestKind::Compose);
        assert!(path.ends_with("docker-compose.yaml"));
    }

    #[test]
    fn compose_requires_services_mapping() {
        let result = parse_compose("foo: bar", Path::new("/tmp/x/compose.yml"), "acme", "demo", "12", "preview.example.com");
        let err = result.unwrap_err();
        assert_eq!(err.kind, "missing-services");
    }

    #[test]
    fn compose_rejects_missing_env_file() {
        let raw = "services:\n  web:\n    image: nginx\n    env_file: missing.env\n";
        let result = parse_compose(raw, Path::new("/tmp/x/compose.yml"), "acme", "demo", "12", "preview.example.com");
        assert_eq!(result.unwrap_err().kind, "env-file-not-found");
    }

    #[test]
    fn compose_accepts_env_file_as_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.env"), "A=1\n").unwrap();
        std::fs::write(dir.path().join("b.env"), "B=2\n").unwrap();
        let raw = "services:\n  web:\n    image: nginx\n    env_file:\n      - a.env\n      - b.env\n";
        let config_path = dir.path().join("compose.yml");
        let descriptor = parse_compose(raw, &config_path, "acme", "demo", "12", "preview.example.com").unwrap();
        let web = descriptor.service_by_name("web").unwrap();
        assert!(web.env.iter().any(|e| e.name == "A" && e.value == "1"));
        assert!(web.env.iter().any(|e| e.name == "B" && e.value == "2"));
    }

    #[test]
    fn service_index_follows_first_seen_indent_not_alphabetical_order() {
        let raw = "services:\n  zeta:\n    image: a\n  alpha:\n    image: b\n";
        let descriptor =
            parse_compose(raw, Path::new("/tmp/x/compose.yml"), "acme", "demo", "12", "preview.example.com").unwrap();
        assert_eq!(descriptor.services[0].name, "zeta");
        assert_eq!(descriptor.services[1].name, "alpha");
    }

    #[test]
    fn public_port_computes_lowercased_url_with_pr_suffix() {
        let raw = "services:\n  web:\n    image: nginx\n    ports:\n      - \"8080:80\"\n";
        let descriptor =
            parse_compose(raw, Path::new("/tmp/x/compose.yml"), "ACME", "My_Repo", "42", "preview.example.com")
                .unwrap();
        let web = descriptor.service_by_name("web").unwrap();
        assert_eq!(web.url, "web-acme-my-repo-42.preview.example.com");
        assert_eq!(web.public_port, Some(8080));
        assert_eq!(web.internal_ports, vec![80]);
    }

    #[test]
    fn pack_manifest_renders_self_referential_placeholders() {
        let raw = "apps:\n  web:\n    image: x\n    publicPort: 80\n  worker:\n    image: y\n    env:\n      WEB_URL: \"{{services.0.url}}\"\n";
        let descriptor = parse_pack(raw, "acme", "demo", "7", "preview.example.com").unwrap();
        let worker = descriptor.service_by_name("worker").unwrap();
        let web_url_var = worker.env.iter().find(|e| e.name == "WEB_URL").unwrap();
        assert_eq!(web_url_var.value, "web-acme-demo-7.preview.example.com");
    }
}
