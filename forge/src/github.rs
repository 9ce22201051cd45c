use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::{CommitStatusState, ForgeClient, ForgeError, RepoSummary};

const API_BASE: &str = "https://api.github.com";

/// Installation-tokened REST client for the code-forge, the production
/// implementation of `ForgeClient`. Caches one installation token per owner
/// (GitHub installation tokens are valid ~1h; refreshed 60s before expiry).
pub struct GithubForgeClient {
    http: reqwest::Client,
    app_id: String,
    private_key: EncodingKey,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

impl GithubForgeClient {
    pub fn new(app_id: String, pem: &str) -> anyhow::Result<Self> {
        let private_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .context("parse GitHub App private key PEM")?;
        Ok(Self {
            http: reqwest::Client::builder()
                .user_agent("previewctl/0.1")
                .build()
                .context("build reqwest client")?,
            app_id,
            private_key,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn app_jwt(&self) -> anyhow::Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        #[derive(Serialize)]
        struct Claims {
            iat: u64,
            exp: u64,
            iss: String,
        }
        let claims = Claims {
            iat: now.saturating_sub(60),
            exp: now + 9 * 60,
            iss: self.app_id.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.private_key)
            .context("sign GitHub App JWT")
    }

    async fn installation_token(&self, owner: &str) -> anyhow::Result<String> {
        {
            let cache = self.tokens.lock().await;
            if let Some(cached) = cache.get(owner)
                && cached.expires_at > SystemTime::now() + Duration::from_secs(60)
            {
                return Ok(cached.token.clone());
            }
        }

        let jwt = self.app_jwt()?;
        #[derive(Deserialize)]
        struct Installation {
            id: i64,
        }
        let installation: Installation = self
            .http
            .get(format!("{API_BASE}/orgs/{owner}/installation"))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("fetch app installation")?
            .error_for_status()
            .context("app installation lookup failed")?
            .json()
            .await
            .context("decode installation response")?;

        #[derive(Deserialize)]
        struct TokenResp {
            token: String,
            expires_at: String,
        }
        let resp: TokenResp = self
            .http
            .post(format!(
                "{API_BASE}/app/installations/{}/access_tokens",
                installation.id
            ))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("mint installation token")?
            .error_for_status()
            .context("mint installation token failed")?
            .json()
            .await
            .context("decode token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&resp.expires_at)
            .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
            .unwrap_or_else(|_| SystemTime::now() + Duration::from_secs(55 * 60));

        let mut cache = self.tokens.lock().await;
        cache.insert(
            owner.to_string(),
            CachedToken {
                token: resp.token.clone(),
                expires_at,
            },
        );
        Ok(resp.token)
    }

    async fn authed(&self, owner: &str) -> Result<String, ForgeError> {
        self.installation_token(owner)
            .await
            .map_err(ForgeError::Transient)
    }
}

#[async_trait]
impl ForgeClient for GithubForgeClient {
    async fn get_clone_token(&self, owner: &str, _repo: &str) -> Result<String, ForgeError> {
        self.authed(owner).await
    }

    async fn is_repo_private(&self, owner: &str, repo: &str) -> Result<bool, ForgeError> {
        let token = self.authed(owner).await?;
        #[derive(Deserialize)]
        struct Repo {
            private: bool,
        }
        let resp = self
            .http
            .get(format!("{API_BASE}/repos/{owner}/{repo}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ForgeError::NotFound {
                owner: owner.into(),
                repo: repo.into(),
            });
        }
        let repo: Repo = resp
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?
            .json()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(repo.private)
    }

    async fn does_branch_exist(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<bool, ForgeError> {
        let token = self.authed(owner).await?;
        let resp = self
            .http
            .get(format!(
                "{API_BASE}/repos/{owner}/{repo}/branches/{branch}"
            ))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(resp.status().is_success())
    }

    async fn get_default_branch(&self, owner: &str, repo: &str) -> Result<String, ForgeError> {
        let token = self.authed(owner).await?;
        #[derive(Deserialize)]
        struct Repo {
            default_branch: String,
        }
        let repo: Repo = self
            .http
            .get(format!("{API_BASE}/repos/{owner}/{repo}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?
            .json()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(repo.default_branch)
    }

    async fn get_branch_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ForgeError> {
        let token = self.authed(owner).await?;
        #[derive(Deserialize)]
        struct Commit {
            sha: String,
        }
        let resp = self
            .http
            .get(format!(
                "{API_BASE}/repos/{owner}/{repo}/commits/{branch}"
            ))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ForgeError::NotFound {
                owner: owner.into(),
                repo: repo.into(),
            });
        }
        let commit: Commit = resp
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?
            .json()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(commit.sha)
    }

    async fn upsert_comment(
        &self,
        owner: &str,
        repo: &str,
        pull_request: i64,
        existing_comment_id: Option<i64>,
        body: &str,
    ) -> Result<i64, ForgeError> {
        let token = self.authed(owner).await?;
        #[derive(Deserialize)]
        struct Comment {
            id: i64,
        }

        if let Some(id) = existing_comment_id {
            let resp = self
                .http
                .patch(format!("{API_BASE}/repos/{owner}/{repo}/issues/comments/{id}"))
                .bearer_auth(&token)
                .header("Accept", "application/vnd.github+json")
                .json(&json!({ "body": body }))
                .send()
                .await
                .map_err(|e| ForgeError::Transient(e.into()))?;
            // "edit returns 404" falls back to create (§7).
            if resp.status() != reqwest::StatusCode::NOT_FOUND {
                resp.error_for_status()
                    .map_err(|e| ForgeError::Transient(e.into()))?;
                return Ok(id);
            }
        }

        let comment: Comment = self
            .http
            .post(format!(
                "{API_BASE}/repos/{owner}/{repo}/issues/{pull_request}/comments"
            ))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?
            .json()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(comment.id)
    }

    async fn post_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        state: CommitStatusState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ForgeError> {
        let token = self.authed(owner).await?;
        self.http
            .post(format!("{API_BASE}/repos/{owner}/{repo}/statuses/{sha}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({
                "state": state.as_str(),
                "description": description,
                "target_url": target_url,
                "context": "previewctl",
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(())
    }

    async fn list_repos(&self, owner: &str) -> Result<Vec<RepoSummary>, ForgeError> {
        let token = self.authed(owner).await?;
        #[derive(Deserialize)]
        struct Repo {
            name: String,
            private: bool,
            default_branch: String,
        }
        let repos: Vec<Repo> = self
            .http
            .get(format!("{API_BASE}/orgs/{owner}/repos"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?
            .json()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(repos
            .into_iter()
            .map(|r| RepoSummary {
                owner: owner.to_string(),
                repo: r.name,
                is_private: r.private,
                default_branch: r.default_branch,
                active_environment_count: 0,
                last_deployed_at: None,
            })
            .collect())
    }

    async fn open_seed_pr(
        &self,
        owner: &str,
        repo: &str,
        manifest_path: &str,
        manifest_contents: &str,
    ) -> Result<String, ForgeError> {
        let token = self.authed(owner).await?;
        let default_branch = self.get_default_branch(owner, repo).await?;
        let branch_name = format!("previewctl/configure-{}", &uuid_like_suffix());

        let base_sha = self.get_branch_sha(owner, repo, &default_branch).await?;
        self.http
            .post(format!("{API_BASE}/repos/{owner}/{repo}/git/refs"))
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({ "ref": format!("refs/heads/{branch_name}"), "sha": base_sha }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?;

        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(manifest_contents);
        self.http
            .put(format!(
                "{API_BASE}/repos/{owner}/{repo}/contents/{manifest_path}"
            ))
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({
                "message": "Add previewctl manifest",
                "content": encoded,
                "branch": branch_name,
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?;

        #[derive(Deserialize)]
        struct Pr {
            html_url: String,
        }
        let pr: Pr = self
            .http
            .post(format!("{API_BASE}/repos/{owner}/{repo}/pulls"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({
                "title": "Add previewctl manifest",
                "head": branch_name,
                "base": default_branch,
                "body": "This PR adds a starter manifest so preview environments can be built for this repository.",
            }))
            .send()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?
            .error_for_status()
            .map_err(|e| ForgeError::Transient(e.into()))?
            .json()
            .await
            .map_err(|e| ForgeError::Transient(e.into()))?;
        Ok(pr.html_url)
    }
}

fn uuid_like_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}")
}

/// Convenience constructor returning a boxed trait object, used by binaries
/// that only know they need *a* `ForgeClient`.
pub fn boxed(app_id: String, pem: &str) -> anyhow::Result<Arc<dyn ForgeClient>> {
    Ok(Arc::new(GithubForgeClient::new(app_id, pem)?))
}
