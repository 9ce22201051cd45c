//! In-memory store doubles, used by the orchestrator/watcher/reconciler unit
//! tests to exercise state transitions without a live database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use previewctl_types::{
    BuildStatus, Environment, EnvironmentLimitOverride, EnvironmentStatus, PaymentPlan,
    PermanentBranch, ProjectValidationError, ResolvedEnvVar, ResolvedRegistryCred, Service, User,
};

use super::{
    BillingProvider, EnvVarProvider, EnvironmentsProvider, EventLog, PermanentBranchProvider,
    RegistryCredProvider, ServicesProvider, UsersProvider,
};
use crate::error::Result;

#[derive(Default)]
pub struct InMemoryStore {
    environments: Mutex<HashMap<String, Environment>>,
    services: Mutex<HashMap<String, Vec<Service>>>,
    env_vars: Mutex<HashMap<(String, String, Option<String>, String), String>>,
    registry_creds: Mutex<HashMap<(String, String), ResolvedRegistryCred>>,
    plans: Mutex<HashMap<String, PaymentPlan>>,
    limit_overrides: Mutex<HashMap<String, EnvironmentLimitOverride>>,
    marketplace_events: Mutex<Vec<(String, String, serde_json::Value)>>,
    permanent_branches: Mutex<Vec<PermanentBranch>>,
    users: Mutex<HashMap<String, User>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only helper: sets a plan directly instead of going through Stripe.
    pub fn set_plan(&self, owner: &str, plan: PaymentPlan) {
        self.plans.lock().unwrap().insert(owner.to_string(), plan);
    }

    pub fn set_limit_override(&self, override_: EnvironmentLimitOverride) {
        self.limit_overrides
            .lock()
            .unwrap()
            .insert(override_.owner.clone(), override_);
    }

    /// Test-only helper: inspect what's been recorded via `EventLog`.
    pub fn marketplace_events(&self) -> Vec<(String, String, serde_json::Value)> {
        self.marketplace_events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvironmentsProvider for InMemoryStore {
    async fn create(&self, env: &Environment) -> Result<()> {
        self.environments.lock().unwrap().insert(env.id.clone(), env.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Environment>> {
        Ok(self.environments.lock().unwrap().get(id).cloned())
    }

    async fn find_by_key(
        &self,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
        pull_request: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<Environment>> {
        let mut out: Vec<_> = self
            .environments
            .lock()
            .unwrap()
            .values()
            .filter(|e| {
                e.owner == owner
                    && e.repo == repo
                    && e.branch.as_deref() == branch
                    && e.pull_request == pull_request
                    && (include_deleted || !e.is_deleted())
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn list_by_owner(&self, owner: &str, include_deleted: bool) -> Result<Vec<Environment>> {
        let mut out: Vec<_> = self
            .environments
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.owner == owner && (include_deleted || !e.is_deleted()))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>> {
        Ok(self
            .environments
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == status && !e.is_deleted())
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: &str, status: EnvironmentStatus) -> Result<()> {
        if let Some(env) = self.environments.lock().unwrap().get_mut(id) {
            env.status = status;
            env.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_degraded(&self, id: &str, reason: ProjectValidationError) -> Result<()> {
        if let Some(env) = self.environments.lock().unwrap().get_mut(id) {
            env.status = EnvironmentStatus::Degraded;
            env.degraded_reason = Some(reason);
            env.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_external_comment_id(&self, id: &str, comment_id: i64) -> Result<()> {
        if let Some(env) = self.environments.lock().unwrap().get_mut(id) {
            env.external_comment_id = Some(comment_id);
        }
        Ok(())
    }

    async fn set_build_tool(&self, id: &str, build_tool: previewctl_types::BuildTool) -> Result<()> {
        if let Some(env) = self.environments.lock().unwrap().get_mut(id) {
            env.build_tool = build_tool;
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<()> {
        if let Some(env) = self.environments.lock().unwrap().get_mut(id) {
            env.deleted_at = Some(Utc::now());
            env.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<()> {
        if let Some(env) = self.environments.lock().unwrap().get_mut(id) {
            env.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ServicesProvider for InMemoryStore {
    async fn create_many(&self, services: &[Service]) -> Result<()> {
        let mut guard = self.services.lock().unwrap();
        for svc in services {
            guard.entry(svc.environment_id.clone()).or_default().push(svc.clone());
        }
        Ok(())
    }

    async fn list_by_environment(&self, environment_id: &str) -> Result<Vec<Service>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(environment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_by_id(&self, service_id: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|s| s.id == service_id)
            .cloned())
    }

    async fn update_build_status(&self, service_id: &str, status: BuildStatus) -> Result<()> {
        for services in self.services.lock().unwrap().values_mut() {
            if let Some(svc) = services.iter_mut().find(|s| s.id == service_id) {
                svc.build_status = status;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EnvVarProvider for InMemoryStore {
    async fn list_resolved(
        &self,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
    ) -> Result<Vec<ResolvedEnvVar>> {
        let guard = self.env_vars.lock().unwrap();
        let mut by_name: HashMap<String, String> = HashMap::new();
        for ((o, r, b, name), value) in guard.iter() {
            if o != owner || r != repo {
                continue;
            }
            if b.is_none() || b.as_deref() == branch {
                by_name.insert(name.clone(), value.clone());
            }
        }
        Ok(by_name
            .into_iter()
            .map(|(name, value)| ResolvedEnvVar { name, value })
            .collect())
    }

    async fn upsert(&self, owner: &str, repo: &str, branch: Option<&str>, name: &str, value: &str) -> Result<()> {
        self.env_vars.lock().unwrap().insert(
            (owner.to_string(), repo.to_string(), branch.map(String::from), name.to_string()),
            value.to_string(),
        );
        Ok(())
    }
}

#[async_trait]
impl RegistryCredProvider for InMemoryStore {
    async fn get(&self, owner: &str, registry_host: &str) -> Result<Option<ResolvedRegistryCred>> {
        Ok(self
            .registry_creds
            .lock()
            .unwrap()
            .get(&(owner.to_string(), registry_host.to_string()))
            .cloned())
    }

    async fn list(&self, owner: &str) -> Result<Vec<ResolvedRegistryCred>> {
        Ok(self
            .registry_creds
            .lock()
            .unwrap()
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|(_, cred)| cred.clone())
            .collect())
    }

    async fn upsert(&self, owner: &str, registry_host: &str, username: &str, password: &str) -> Result<()> {
        self.registry_creds.lock().unwrap().insert(
            (owner.to_string(), registry_host.to_string()),
            ResolvedRegistryCred {
                registry_host: registry_host.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, owner: &str, registry_host: &str) -> Result<()> {
        self.registry_creds
            .lock()
            .unwrap()
            .remove(&(owner.to_string(), registry_host.to_string()));
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for InMemoryStore {
    async fn plan_for_owner(&self, owner: &str) -> Result<PaymentPlan> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .get(owner)
            .copied()
            .unwrap_or(PaymentPlan::Free))
    }

    async fn limit_override(&self, owner: &str) -> Result<Option<EnvironmentLimitOverride>> {
        Ok(self.limit_overrides.lock().unwrap().get(owner).cloned())
    }

    async fn upsert_subscription(
        &self,
        owner: &str,
        plan: PaymentPlan,
        _stripe_customer_id: Option<&str>,
        _stripe_subscription_id: Option<&str>,
        _status: &str,
        _standard_plan_env_limit: bool,
    ) -> Result<()> {
        self.plans.lock().unwrap().insert(owner.to_string(), plan);
        Ok(())
    }
}

#[async_trait]
impl EventLog for InMemoryStore {
    async fn record_marketplace_event(&self, owner: &str, action: &str, raw_payload: serde_json::Value) -> Result<()> {
        self.marketplace_events
            .lock()
            .unwrap()
            .push((owner.to_string(), action.to_string(), raw_payload));
        Ok(())
    }
}

#[async_trait]
impl PermanentBranchProvider for InMemoryStore {
    async fn should_deploy(&self, owner: &str, repo: &str, branch: &str) -> Result<bool> {
        Ok(self
            .permanent_branches
            .lock()
            .unwrap()
            .iter()
            .any(|b| b.owner == owner && b.repo == repo && b.branch == branch))
    }

    async fn list(&self, owner: &str, repo: &str) -> Result<Vec<PermanentBranch>> {
        Ok(self
            .permanent_branches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.owner == owner && b.repo == repo)
            .cloned()
            .collect())
    }

    async fn batch_upsert(&self, owner: &str, repo: &str, branches: &[String]) -> Result<()> {
        let mut guard = self.permanent_branches.lock().unwrap();
        for branch in branches {
            if !guard.iter().any(|b| b.owner == owner && b.repo == repo && &b.branch == branch) {
                guard.push(PermanentBranch {
                    id: uuid::Uuid::new_v4(),
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    branch: branch.clone(),
                    created_at: Utc::now(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UsersProvider for InMemoryStore {
    async fn upsert(&self, forge_login: &str, email: Option<&str>) -> Result<User> {
        let mut guard = self.users.lock().unwrap();
        let user = guard.entry(forge_login.to_string()).or_insert_with(|| User {
            id: uuid::Uuid::new_v4(),
            forge_login: forge_login.to_string(),
            email: email.map(String::from),
            created_at: Utc::now(),
        });
        user.email = email.map(String::from).or_else(|| user.email.clone());
        Ok(user.clone())
    }

    async fn find_by_login(&self, forge_login: &str) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().get(forge_login).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn branch_scoped_env_var_overrides_branch_less_default() {
        let store = InMemoryStore::new();
        store.upsert("acme", "demo", None, "X", "default").await.unwrap();
        store.upsert("acme", "demo", Some("feature"), "X", "override").await.unwrap();

        let resolved = store.list_resolved("acme", "demo", Some("feature")).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].value, "override");

        let resolved_other_branch = store.list_resolved("acme", "demo", Some("other")).await.unwrap();
        assert_eq!(resolved_other_branch.len(), 1);
        assert_eq!(resolved_other_branch[0].value, "default");
    }
}
