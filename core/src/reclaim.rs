//! Stale/Reclaim Controller + Wake-on-Request (C6, §4.6): downscales idle
//! environments to free capacity, tails ingress access logs to know what
//! "idle" means, and brings a stale environment back on the first request
//! that hits it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use previewctl_cluster::ClusterDriver;
use previewctl_types::{Environment, EnvironmentStatus};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::quota::QuotaController;
use crate::store::{EnvironmentsProvider, ServicesProvider};

const STALE_TICK_INTERVAL: Duration = Duration::from_secs(30);
const TIMEOUT_TO_STALE: chrono::Duration = chrono::Duration::hours(1);
const WAKE_READY_DEADLINE_SECS: u64 = 10 * 60;

/// Process-wide `namespace -> last observed request time`, written by the
/// access-log tailer and read by the stale scorer. A lossy race between the
/// two is tolerated (§5 shared resources).
#[derive(Default, Clone)]
pub struct AccessLog {
    inner: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, namespace: &str, at: DateTime<Utc>) {
        let mut m = self.inner.lock().unwrap();
        let slot = m.entry(namespace.to_string()).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }

    pub fn last_access(&self, namespace: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().get(namespace).copied()
    }
}

/// Parses one ingress access-log line into `(namespace, timestamp)`.
///
/// Namespace is the penultimate bracketed token with its trailing
/// `-`-joined two segments stripped (the pod's own generated suffix) and a
/// leading `preview-core` prefix skipped; timestamp is the first bracketed
/// token, `%d/%b/%Y:%H:%M:%S %z`.
pub fn parse_access_log_line(line: &str) -> Option<(String, DateTime<Utc>)> {
    let tokens: Vec<&str> = line
        .split('[')
        .skip(1)
        .filter_map(|s| s.split(']').next())
        .collect();
    if tokens.len() < 2 {
        return None;
    }
    let timestamp_token = tokens[0];
    let namespace_token = tokens[tokens.len() - 2];

    let timestamp = DateTime::parse_from_str(timestamp_token, "%d/%b/%Y:%H:%M:%S %z")
        .ok()?
        .with_timezone(&Utc);

    let mut parts: Vec<&str> = namespace_token.split('-').collect();
    if parts.first() == Some(&"preview") && parts.get(1) == Some(&"core") {
        parts.drain(0..2);
    }
    if parts.len() > 2 {
        parts.truncate(parts.len() - 2);
    }
    let namespace = parts.join("-");
    if namespace.is_empty() {
        return None;
    }
    Some((namespace, timestamp))
}

/// Continuously tails the ingress controller's pod logs and feeds
/// [`AccessLog`]. Restarts the stream with backoff on error or end-of-stream.
pub struct AccessLogTailer {
    cluster: Arc<dyn ClusterDriver>,
    log: AccessLog,
}

impl AccessLogTailer {
    pub fn new(cluster: Arc<dyn ClusterDriver>, log: AccessLog) -> Self {
        Self { cluster, log }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        use futures::StreamExt;

        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let stream = match self.cluster.stream_ingress_logs(3600).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open ingress log stream, retrying");
                    if previewctl_common::wait::wait_with_backoff(&cancel, attempt, Duration::from_secs(30))
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
                            Some(Ok(line)) => {
                                if let Some((namespace, at)) = parse_access_log_line(&line) {
                                    self.log.record(&namespace, at);
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "ingress log stream error, resubscribing");
                                break;
                            }
                            None => {
                                tracing::warn!("ingress log stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

struct Scored {
    env: Environment,
    last_access: DateTime<Utc>,
}

pub struct StaleReclaimController {
    environments: Arc<dyn EnvironmentsProvider>,
    services: Arc<dyn ServicesProvider>,
    cluster: Arc<dyn ClusterDriver>,
    quota: QuotaController,
    access_log: AccessLog,
}

impl StaleReclaimController {
    pub fn new(
        environments: Arc<dyn EnvironmentsProvider>,
        services: Arc<dyn ServicesProvider>,
        cluster: Arc<dyn ClusterDriver>,
        quota: QuotaController,
        access_log: AccessLog,
    ) -> Self {
        Self { environments, services, cluster, quota, access_log }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        self.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(STALE_TICK_INTERVAL) => {}
            }
            self.tick().await;
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) {
        let envs = match self.environments.list_by_status(EnvironmentStatus::Success).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list success environments");
                return;
            }
        };

        // Non-PR (permanent branch) envs are never reclaim candidates and are
        // excluded from the counted population entirely (§4.6: "skip
        // branch-only (non-PR) envs"), not merely sorted ahead of PR envs.
        let mut by_owner: HashMap<String, Vec<Environment>> = HashMap::new();
        for env in envs {
            if !env.is_pull_request() {
                continue;
            }
            by_owner.entry(env.owner.clone()).or_default().push(env);
        }

        for (owner, owner_envs) in by_owner {
            if let Err(e) = self.score_owner(&owner, owner_envs).await {
                tracing::warn!(error = %e, owner = %owner, "failed to score owner's environments");
            }
        }
    }

    /// `owner_envs` are PR envs only — permanent-branch envs are filtered
    /// out by the caller and never enter the counted population.
    async fn score_owner(&self, owner: &str, owner_envs: Vec<Environment>) -> Result<()> {
        let (active_limit, permanent_limit) = self.quota.limits(owner).await?;

        let mut scored: Vec<Scored> = owner_envs
            .into_iter()
            .map(|env| {
                let last_access = self.access_log.last_access(&env.id).unwrap_or(env.updated_at);
                Scored { env, last_access }
            })
            .collect();

        scored.sort_by(|a, b| a.last_access.cmp(&b.last_access));

        let total = scored.len() as i64;

        let to_stale: Vec<&Environment> = if total > active_limit {
            let count = (total - active_limit) as usize;
            scored.iter().take(count).map(|s| &s.env).collect()
        } else if total > permanent_limit {
            let count = (total - permanent_limit) as usize;
            let now = Utc::now();
            scored
                .iter()
                .take(count)
                .filter(|s| now - s.last_access >= TIMEOUT_TO_STALE)
                .map(|s| &s.env)
                .collect()
        } else {
            Vec::new()
        };

        for env in to_stale {
            if let Err(e) = self.stale_one(env).await {
                tracing::warn!(error = %e, environment = %env.id, "failed to mark environment stale");
                let _ = self.environments.update_status(&env.id, EnvironmentStatus::Degraded).await;
            }
        }
        Ok(())
    }

    async fn stale_one(&self, env: &Environment) -> Result<()> {
        let services = self.services.list_by_environment(&env.id).await?;
        for svc in &services {
            self.cluster.scale_service(&env.id, &svc.id, 0).await?;
            if svc.is_public() {
                self.cluster
                    .rewrite_ingress_host(&env.id, &svc.id, &format!("stale-{}", svc.url))
                    .await?;
            }
        }
        self.environments.update_status(&env.id, EnvironmentStatus::Stale).await?;
        Ok(())
    }
}

pub enum WakeOutcome {
    /// The host doesn't resolve to any known environment.
    NotFound,
    /// The environment was already active; redirect straight there.
    AlreadyActive { host: String },
    /// A wake was started; redirect to a frontend page that polls `host`.
    Woken { host: String },
}

/// Resolves an inbound `Host` header on the stale/wake server (§6.2, §10.1)
/// to an environment and scales it back up if it was stale.
pub struct WakeOnRequest {
    environments: Arc<dyn EnvironmentsProvider>,
    services: Arc<dyn ServicesProvider>,
    cluster: Arc<dyn ClusterDriver>,
}

impl WakeOnRequest {
    pub fn new(
        environments: Arc<dyn EnvironmentsProvider>,
        services: Arc<dyn ServicesProvider>,
        cluster: Arc<dyn ClusterDriver>,
    ) -> Self {
        Self { environments, services, cluster }
    }

    #[tracing::instrument(skip(self))]
    pub async fn wake(&self, host: &str) -> Result<WakeOutcome> {
        let Some(namespace) = self.cluster.get_environment_from_host(host).await? else {
            return Ok(WakeOutcome::NotFound);
        };
        let Some(env) = self.environments.get(&namespace).await? else {
            return Ok(WakeOutcome::NotFound);
        };
        if env.status != EnvironmentStatus::Stale {
            return Ok(WakeOutcome::AlreadyActive { host: host.to_string() });
        }

        let services = self.services.list_by_environment(&env.id).await?;
        for svc in &services {
            self.cluster.scale_service(&env.id, &svc.id, 1).await?;
            if svc.is_public() {
                self.cluster.rewrite_ingress_host(&env.id, &svc.id, &svc.url).await?;
            }
        }
        self.environments.touch(&env.id).await?;

        let environments = self.environments.clone();
        let cluster = self.cluster.clone();
        let env_id = env.id.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster.wait_ready(&env_id, WAKE_READY_DEADLINE_SECS).await {
                tracing::warn!(error = %e, environment = %env_id, "woken environment did not become ready");
                return;
            }
            if let Err(e) = environments.update_status(&env_id, EnvironmentStatus::Success).await {
                tracing::warn!(error = %e, environment = %env_id, "failed to flip woken environment back to success");
            }
        });

        Ok(WakeOutcome::Woken { host: host.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testdoubles::InMemoryStore;
    use previewctl_cluster::testdoubles::InMemoryClusterDriver;
    use previewctl_types::{BuildTool, PaymentPlan, Service};

    fn env_with(owner: &str, pr: Option<i64>, updated_at: DateTime<Utc>) -> Environment {
        Environment {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            branch_owner: owner.to_string(),
            repo: "demo".to_string(),
            branch: Some("feature".to_string()),
            pull_request: pr,
            author: "bot".to_string(),
            status: EnvironmentStatus::Success,
            degraded_reason: None,
            external_comment_id: None,
            build_tool: BuildTool::Kaniko,
            created_at: updated_at,
            updated_at,
            deleted_at: None,
        }
    }

    #[test]
    fn parses_nginx_style_access_log_line() {
        let line = "1.2.3.4 - - [15/Mar/2024:10:30:00 +0000] \"GET / HTTP/1.1\" 200 512 \"-\" \"curl\" [preview-core-acme-demo-feature-9-abc123]";
        let (namespace, ts) = parse_access_log_line(line).expect("should parse");
        assert_eq!(namespace, "acme-demo-feature-9");
        assert_eq!(ts.to_rfc3339(), "2024-03-15T10:30:00+00:00");
    }

    #[test]
    fn unparseable_line_is_ignored() {
        assert!(parse_access_log_line("not a log line").is_none());
    }

    #[tokio::test]
    async fn oldest_pr_envs_beyond_active_limit_are_marked_stale() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        store.set_plan("acme", PaymentPlan::Standard);

        let now = Utc::now();
        let envs = vec![
            env_with("acme", Some(1), now - chrono::Duration::hours(4)),
            env_with("acme", Some(2), now - chrono::Duration::hours(3)),
            env_with("acme", Some(3), now - chrono::Duration::hours(2)),
            env_with("acme", Some(4), now - chrono::Duration::hours(1)),
        ];
        for e in &envs {
            EnvironmentsProvider::create(&*store, e).await.unwrap();
            ServicesProvider::create_many(
                &*store,
                &[Service {
                    id: format!("{}-web", e.id),
                    environment_id: e.id.clone(),
                    name: "web".into(),
                    image: "nginx".into(),
                    build: String::new(),
                    build_status: previewctl_types::BuildStatus::Image,
                    url: format!("{}.preview.example.com", e.id),
                    public_port: Some(80),
                    internal_ports: vec![],
                    index: 0,
                }],
            )
            .await
            .unwrap();
        }

        let quota = QuotaController::new(store.clone(), store.clone());
        let controller = StaleReclaimController::new(
            store.clone(),
            store.clone(),
            cluster.clone(),
            quota,
            AccessLog::new(),
        );
        controller.tick().await;

        let refreshed: Vec<_> = futures::future::join_all(
            envs.iter().map(|e| EnvironmentsProvider::get(&*store, &e.id)),
        )
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

        // Standard plan active_limit=3, four envs present: the oldest one goes stale.
        assert_eq!(refreshed[0].status, EnvironmentStatus::Stale);
        assert_eq!(refreshed[1].status, EnvironmentStatus::Success);
        assert_eq!(refreshed[2].status, EnvironmentStatus::Success);
        assert_eq!(refreshed[3].status, EnvironmentStatus::Success);
    }

    #[tokio::test]
    async fn permanent_branch_envs_are_excluded_from_the_limit_count() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());
        store.set_plan("acme", PaymentPlan::Professional);

        let now = Utc::now();
        // 5 permanent branches (non-PR) + 4 PR envs = 9 Success envs for the
        // owner, which would exceed the Professional active_limit of 8 if
        // the permanent branches were (incorrectly) counted. None of the 4
        // PR envs should go stale: only PR envs count toward the limit.
        let permanent = vec![
            env_with("acme", None, now - chrono::Duration::hours(9)),
            env_with("acme", None, now - chrono::Duration::hours(8)),
            env_with("acme", None, now - chrono::Duration::hours(7)),
            env_with("acme", None, now - chrono::Duration::hours(6)),
            env_with("acme", None, now - chrono::Duration::hours(5)),
        ];
        let pull_requests = vec![
            env_with("acme", Some(1), now - chrono::Duration::hours(4)),
            env_with("acme", Some(2), now - chrono::Duration::hours(3)),
            env_with("acme", Some(3), now - chrono::Duration::hours(2)),
            env_with("acme", Some(4), now - chrono::Duration::hours(1)),
        ];
        for e in permanent.iter().chain(pull_requests.iter()) {
            EnvironmentsProvider::create(&*store, e).await.unwrap();
            ServicesProvider::create_many(
                &*store,
                &[Service {
                    id: format!("{}-web", e.id),
                    environment_id: e.id.clone(),
                    name: "web".into(),
                    image: "nginx".into(),
                    build: String::new(),
                    build_status: previewctl_types::BuildStatus::Image,
                    url: format!("{}.preview.example.com", e.id),
                    public_port: Some(80),
                    internal_ports: vec![],
                    index: 0,
                }],
            )
            .await
            .unwrap();
        }

        let quota = QuotaController::new(store.clone(), store.clone());
        let controller = StaleReclaimController::new(
            store.clone(),
            store.clone(),
            cluster.clone(),
            quota,
            AccessLog::new(),
        );
        controller.tick().await;

        for e in permanent.iter().chain(pull_requests.iter()) {
            let refreshed = EnvironmentsProvider::get(&*store, &e.id).await.unwrap().unwrap();
            assert_eq!(refreshed.status, EnvironmentStatus::Success, "{} should not be staled", e.id);
        }
    }

    #[tokio::test]
    async fn waking_a_stale_environment_scales_up_and_restores_host() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Arc::new(InMemoryClusterDriver::new());

        let env = env_with("acme", Some(1), Utc::now());
        EnvironmentsProvider::create(&*store, &env).await.unwrap();
        EnvironmentsProvider::update_status(&*store, &env.id, EnvironmentStatus::Stale)
            .await
            .unwrap();
        let svc = Service {
            id: format!("{}-web", env.id),
            environment_id: env.id.clone(),
            name: "web".into(),
            image: "nginx".into(),
            build: String::new(),
            build_status: previewctl_types::BuildStatus::Image,
            url: "nice-host.preview.example.com".into(),
            public_port: Some(80),
            internal_ports: vec![],
            index: 0,
        };
        ServicesProvider::create_many(&*store, &[svc.clone()]).await.unwrap();
        cluster.register_host("nice-host.preview.example.com", &env.id);

        let wake = WakeOnRequest::new(store.clone(), store.clone(), cluster.clone());
        let outcome = wake.wake("stale-nice-host.preview.example.com").await.unwrap();
        assert!(matches!(outcome, WakeOutcome::Woken { .. }));
        assert_eq!(cluster.replicas_of(&env.id, &svc.id), Some(1));
        assert_eq!(
            cluster.ingress_host_of(&env.id, &svc.id),
            Some("nice-host.preview.example.com".to_string())
        );
    }
}
