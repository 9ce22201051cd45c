//! Postgres-backed implementation of every store trait, grounded in the
//! ambient `previewctl_common::postgres` pool-construction pattern.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use previewctl_types::{
    BuildStatus, Environment, EnvironmentLimitOverride, EnvironmentStatus, PaymentPlan,
    PermanentBranch, ProjectValidationError, ResolvedEnvVar, ResolvedRegistryCred, Service, User,
};

use super::{
    BillingProvider, EnvVarProvider, EnvironmentsProvider, EventLog, PermanentBranchProvider,
    RegistryCredProvider, ServicesProvider, UsersProvider,
};
use crate::crypto;
use crate::error::{Error, Result};

pub struct PgStore {
    pool: Pool,
    encryption_key: String,
}

impl PgStore {
    pub fn new(pool: Pool, encryption_key: impl Into<String>) -> Self {
        Self {
            pool,
            encryption_key: encryption_key.into(),
        }
    }
}

fn row_to_environment(row: &Row) -> Environment {
    let degraded_type: Option<String> = row.get("degraded_reason_type");
    let degraded_message: Option<String> = row.get("degraded_reason_message");
    Environment {
        id: row.get("id"),
        owner: row.get("owner"),
        branch_owner: row.get("branch_owner"),
        repo: row.get("repo"),
        branch: row.get("branch"),
        pull_request: row.get("pull_request"),
        author: row.get("author"),
        status: row.get("status"),
        degraded_reason: degraded_type.map(|kind| ProjectValidationError {
            kind,
            message: degraded_message.unwrap_or_default(),
        }),
        external_comment_id: row.get("external_comment_id"),
        build_tool: row.get("build_tool"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn row_to_service(row: &Row) -> Service {
    let internal_ports: Vec<i32> = row.get("internal_ports");
    let public_port: Option<i32> = row.get("public_port");
    Service {
        id: row.get("id"),
        environment_id: row.get("environment_id"),
        name: row.get("name"),
        image: row.get("image"),
        build: row.get("build"),
        build_status: row.get("build_status"),
        url: row.get("url"),
        public_port: public_port.map(|p| p as u16),
        internal_ports: internal_ports.into_iter().map(|p| p as u16).collect(),
        index: row.get("index"),
    }
}

#[async_trait]
impl EnvironmentsProvider for PgStore {
    async fn create(&self, env: &Environment) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "INSERT INTO environments
                    (id, owner, branch_owner, repo, branch, pull_request, author, status, build_tool, external_comment_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &env.id,
                    &env.owner,
                    &env.branch_owner,
                    &env.repo,
                    &env.branch,
                    &env.pull_request,
                    &env.author,
                    &env.status,
                    &env.build_tool,
                    &env.external_comment_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Environment>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt("SELECT * FROM environments WHERE id = $1", &[&id])
            .await?;
        Ok(row.as_ref().map(row_to_environment))
    }

    async fn find_by_key(
        &self,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
        pull_request: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<Environment>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let sql = if include_deleted {
            "SELECT * FROM environments
             WHERE owner = $1 AND repo = $2 AND branch IS NOT DISTINCT FROM $3 AND pull_request IS NOT DISTINCT FROM $4
             ORDER BY created_at"
        } else {
            "SELECT * FROM environments
             WHERE owner = $1 AND repo = $2 AND branch IS NOT DISTINCT FROM $3 AND pull_request IS NOT DISTINCT FROM $4
               AND deleted_at IS NULL
             ORDER BY created_at"
        };
        let rows = client
            .query(sql, &[&owner, &repo, &branch, &pull_request])
            .await?;
        Ok(rows.iter().map(row_to_environment).collect())
    }

    async fn list_by_owner(&self, owner: &str, include_deleted: bool) -> Result<Vec<Environment>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let sql = if include_deleted {
            "SELECT * FROM environments WHERE owner = $1 ORDER BY created_at"
        } else {
            "SELECT * FROM environments WHERE owner = $1 AND deleted_at IS NULL ORDER BY created_at"
        };
        let rows = client.query(sql, &[&owner]).await?;
        Ok(rows.iter().map(row_to_environment).collect())
    }

    async fn list_by_status(&self, status: EnvironmentStatus) -> Result<Vec<Environment>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let rows = client
            .query(
                "SELECT * FROM environments WHERE status = $1 AND deleted_at IS NULL ORDER BY updated_at",
                &[&status],
            )
            .await?;
        Ok(rows.iter().map(row_to_environment).collect())
    }

    async fn update_status(&self, id: &str, status: EnvironmentStatus) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE environments SET status = $2, updated_at = now() WHERE id = $1",
                &[&id, &status],
            )
            .await?;
        Ok(())
    }

    async fn set_degraded(&self, id: &str, reason: ProjectValidationError) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE environments
                 SET status = $2, degraded_reason_type = $3, degraded_reason_message = $4, updated_at = now()
                 WHERE id = $1",
                &[&id, &EnvironmentStatus::Degraded, &reason.kind, &reason.message],
            )
            .await?;
        Ok(())
    }

    async fn set_external_comment_id(&self, id: &str, comment_id: i64) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE environments SET external_comment_id = $2, updated_at = now() WHERE id = $1",
                &[&id, &comment_id],
            )
            .await?;
        Ok(())
    }

    async fn set_build_tool(&self, id: &str, build_tool: previewctl_types::BuildTool) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE environments SET build_tool = $2, updated_at = now() WHERE id = $1",
                &[&id, &build_tool],
            )
            .await?;
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE environments SET deleted_at = now(), updated_at = now() WHERE id = $1 AND deleted_at IS NULL",
                &[&id],
            )
            .await?;
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute("UPDATE environments SET updated_at = now() WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServicesProvider for PgStore {
    async fn create_many(&self, services: &[Service]) -> Result<()> {
        let mut client = self.pool.get().await.map_err(Error::from)?;
        let tx = client.transaction().await?;
        for svc in services {
            let internal_ports: Vec<i32> = svc.internal_ports.iter().map(|p| *p as i32).collect();
            let public_port: Option<i32> = svc.public_port.map(|p| p as i32);
            tx.execute(
                "INSERT INTO services (id, environment_id, name, image, build, build_status, url, public_port, internal_ports, index)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &svc.id,
                    &svc.environment_id,
                    &svc.name,
                    &svc.image,
                    &svc.build,
                    &svc.build_status,
                    &svc.url,
                    &public_port,
                    &internal_ports,
                    &svc.index,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_by_environment(&self, environment_id: &str) -> Result<Vec<Service>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let rows = client
            .query(
                "SELECT * FROM services WHERE environment_id = $1 ORDER BY index",
                &[&environment_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_service).collect())
    }

    async fn find_by_id(&self, service_id: &str) -> Result<Option<Service>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt("SELECT * FROM services WHERE id = $1", &[&service_id])
            .await?;
        Ok(row.as_ref().map(row_to_service))
    }

    async fn update_build_status(&self, service_id: &str, status: BuildStatus) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE services SET build_status = $2 WHERE id = $1",
                &[&service_id, &status],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EnvVarProvider for PgStore {
    async fn list_resolved(
        &self,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
    ) -> Result<Vec<ResolvedEnvVar>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let rows = client
            .query(
                "SELECT name, encrypted_value, branch FROM env_vars
                 WHERE owner = $1 AND repo = $2 AND deleted_at IS NULL
                   AND (branch IS NULL OR branch = $3)
                 ORDER BY branch NULLS FIRST",
                &[&owner, &repo, &branch],
            )
            .await?;

        // Rows are ordered branch-less first, so a later branch-scoped row
        // for the same name naturally overrides the earlier default one.
        let mut by_name = std::collections::HashMap::new();
        for row in &rows {
            let name: String = row.get("name");
            let encrypted: String = row.get("encrypted_value");
            let value = crypto::decrypt(&self.encryption_key, &encrypted)?;
            by_name.insert(name.clone(), ResolvedEnvVar { name, value });
        }
        Ok(by_name.into_values().collect())
    }

    async fn upsert(&self, owner: &str, repo: &str, branch: Option<&str>, name: &str, value: &str) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let encrypted = crypto::encrypt(&self.encryption_key, value)?;
        client
            .execute(
                "INSERT INTO env_vars (id, owner, repo, branch, name, encrypted_value)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (owner, repo, COALESCE(branch, ''), name) WHERE deleted_at IS NULL
                 DO UPDATE SET encrypted_value = EXCLUDED.encrypted_value, updated_at = now()",
                &[&Uuid::new_v4(), &owner, &repo, &branch, &name, &encrypted],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryCredProvider for PgStore {
    async fn get(&self, owner: &str, registry_host: &str) -> Result<Option<ResolvedRegistryCred>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt(
                "SELECT encrypted_username, encrypted_password FROM private_registries
                 WHERE owner = $1 AND registry_host = $2 AND deleted_at IS NULL",
                &[&owner, &registry_host],
            )
            .await?;
        let Some(row) = row else { return Ok(None) };
        let encrypted_username: String = row.get("encrypted_username");
        let encrypted_password: String = row.get("encrypted_password");
        Ok(Some(ResolvedRegistryCred {
            registry_host: registry_host.to_string(),
            username: crypto::decrypt(&self.encryption_key, &encrypted_username)?,
            password: crypto::decrypt(&self.encryption_key, &encrypted_password)?,
        }))
    }

    async fn list(&self, owner: &str) -> Result<Vec<ResolvedRegistryCred>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let rows = client
            .query(
                "SELECT registry_host, encrypted_username, encrypted_password FROM private_registries
                 WHERE owner = $1 AND deleted_at IS NULL",
                &[&owner],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let encrypted_username: String = row.get("encrypted_username");
                let encrypted_password: String = row.get("encrypted_password");
                Ok(ResolvedRegistryCred {
                    registry_host: row.get("registry_host"),
                    username: crypto::decrypt(&self.encryption_key, &encrypted_username)?,
                    password: crypto::decrypt(&self.encryption_key, &encrypted_password)?,
                })
            })
            .collect()
    }

    async fn upsert(&self, owner: &str, registry_host: &str, username: &str, password: &str) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let encrypted_username = crypto::encrypt(&self.encryption_key, username)?;
        let encrypted_password = crypto::encrypt(&self.encryption_key, password)?;
        client
            .execute(
                "INSERT INTO private_registries (id, owner, registry_host, encrypted_username, encrypted_password)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (owner, registry_host) WHERE deleted_at IS NULL
                 DO UPDATE SET encrypted_username = EXCLUDED.encrypted_username,
                               encrypted_password = EXCLUDED.encrypted_password,
                               updated_at = now()",
                &[&Uuid::new_v4(), &owner, &registry_host, &encrypted_username, &encrypted_password],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, owner: &str, registry_host: &str) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "UPDATE private_registries SET deleted_at = now() WHERE owner = $1 AND registry_host = $2",
                &[&owner, &registry_host],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for PgStore {
    async fn plan_for_owner(&self, owner: &str) -> Result<PaymentPlan> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt(
                "SELECT plan FROM stripe_subscriptions WHERE owner = $1 AND status = 'active'",
                &[&owner],
            )
            .await?;
        Ok(match row {
            Some(row) => {
                let plan: String = row.get("plan");
                match plan.as_str() {
                    "standard" => PaymentPlan::Standard,
                    "professional" => PaymentPlan::Professional,
                    _ => PaymentPlan::Free,
                }
            }
            None => PaymentPlan::Free,
        })
    }

    async fn limit_override(&self, owner: &str) -> Result<Option<EnvironmentLimitOverride>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt(
                "SELECT active_limit, permanent_limit FROM environment_limits WHERE owner = $1",
                &[&owner],
            )
            .await?;
        Ok(row.map(|row| EnvironmentLimitOverride {
            owner: owner.to_string(),
            active_limit: row.get("active_limit"),
            permanent_limit: row.get("permanent_limit"),
        }))
    }

    async fn upsert_subscription(
        &self,
        owner: &str,
        plan: PaymentPlan,
        stripe_customer_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
        status: &str,
        standard_plan_env_limit: bool,
    ) -> Result<()> {
        let plan = match plan {
            PaymentPlan::Free => "free",
            PaymentPlan::Standard => "standard",
            PaymentPlan::Professional => "professional",
        };
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "INSERT INTO stripe_subscriptions \
                    (id, owner, plan, stripe_customer_id, stripe_subscription_id, status, standard_plan_env_limit) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (owner) DO UPDATE SET \
                    plan = excluded.plan, \
                    stripe_customer_id = excluded.stripe_customer_id, \
                    stripe_subscription_id = excluded.stripe_subscription_id, \
                    status = excluded.status, \
                    standard_plan_env_limit = excluded.standard_plan_env_limit, \
                    updated_at = now()",
                &[
                    &uuid::Uuid::new_v4(),
                    &owner,
                    &plan,
                    &stripe_customer_id,
                    &stripe_subscription_id,
                    &status,
                    &standard_plan_env_limit,
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventLog for PgStore {
    async fn record_marketplace_event(&self, owner: &str, action: &str, raw_payload: serde_json::Value) -> Result<()> {
        let client = self.pool.get().await.map_err(Error::from)?;
        client
            .execute(
                "INSERT INTO marketplace_events (id, owner, action, raw_payload) VALUES ($1, $2, $3, $4)",
                &[&Uuid::new_v4(), &owner, &action, &raw_payload],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PermanentBranchProvider for PgStore {
    async fn should_deploy(&self, owner: &str, repo: &str, branch: &str) -> Result<bool> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt(
                "SELECT 1 FROM deployed_branches WHERE owner = $1 AND repo = $2 AND branch = $3",
                &[&owner, &repo, &branch],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn list(&self, owner: &str, repo: &str) -> Result<Vec<PermanentBranch>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let rows = client
            .query(
                "SELECT * FROM deployed_branches WHERE owner = $1 AND repo = $2 ORDER BY created_at",
                &[&owner, &repo],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| PermanentBranch {
                id: row.get("id"),
                owner: row.get("owner"),
                repo: row.get("repo"),
                branch: row.get("branch"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn batch_upsert(&self, owner: &str, repo: &str, branches: &[String]) -> Result<()> {
        let mut client = self.pool.get().await.map_err(Error::from)?;
        let tx = client.transaction().await?;
        for branch in branches {
            tx.execute(
                "INSERT INTO deployed_branches (id, owner, repo, branch) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (owner, repo, branch) DO NOTHING",
                &[&Uuid::new_v4(), &owner, &repo, branch],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl UsersProvider for PgStore {
    async fn upsert(&self, forge_login: &str, email: Option<&str>) -> Result<User> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_one(
                "INSERT INTO users (id, forge_login, email) VALUES ($1, $2, $3)
                 ON CONFLICT (forge_login) DO UPDATE SET email = EXCLUDED.email
                 RETURNING *",
                &[&Uuid::new_v4(), &forge_login, &email],
            )
            .await?;
        Ok(User {
            id: row.get("id"),
            forge_login: row.get("forge_login"),
            email: row.get("email"),
            created_at: row.get("created_at"),
        })
    }

    async fn find_by_login(&self, forge_login: &str) -> Result<Option<User>> {
        let client = self.pool.get().await.map_err(Error::from)?;
        let row = client
            .query_opt("SELECT * FROM users WHERE forge_login = $1", &[&forge_login])
            .await?;
        Ok(row.map(|row| User {
            id: row.get("id"),
            forge_login: row.get("forge_login"),
            email: row.get("email"),
            created_at: row.get("created_at"),
        }))
    }
}
