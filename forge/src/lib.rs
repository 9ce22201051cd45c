//! `ForgeClient`: the code-forge REST collaborator (§1, deliberately-excluded
//! list). The core only ever talks to the forge through this trait; the
//! production implementation (`GithubForgeClient`) and the in-memory
//! `testdoubles::InMemoryForgeClient` are interchangeable behind it.

pub mod signature;
pub mod testdoubles;
pub mod webhook;

mod github;

pub use github::GithubForgeClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("forge request failed: {0}")]
    Transient(#[from] anyhow::Error),
    #[error("repository {owner}/{repo} not found")]
    NotFound { owner: String, repo: String },
    #[error("forge rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitStatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatusState::Pending => "pending",
            CommitStatusState::Success => "success",
            CommitStatusState::Failure => "failure",
            CommitStatusState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSummary {
    pub owner: String,
    pub repo: String,
    pub is_private: bool,
    pub default_branch: String,
    pub active_environment_count: i64,
    pub last_deployed_at: Option<DateTime<Utc>>,
}

/// A single-repository installation-tokened collaborator. Every method takes
/// the `owner` whose GitHub App installation should be used to mint tokens,
/// matching the source's habit of scoping clone/comment/status calls per
/// `branch_owner` so forked PRs authenticate against the fork owner's install.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Short-lived token usable to `git clone` a private repo over HTTPS.
    async fn get_clone_token(&self, owner: &str, repo: &str) -> Result<String, ForgeError>;

    async fn is_repo_private(&self, owner: &str, repo: &str) -> Result<bool, ForgeError>;

    async fn does_branch_exist(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<bool, ForgeError>;

    async fn get_default_branch(&self, owner: &str, repo: &str) -> Result<String, ForgeError>;

    async fn get_branch_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ForgeError>;

    /// Edits `existing_comment_id` if set, else creates a new PR comment.
    /// Returns the resulting comment id (unchanged on edit).
    async fn upsert_comment(
        &self,
        owner: &str,
        repo: &str,
        pull_request: i64,
        existing_comment_id: Option<i64>,
        body: &str,
    ) -> Result<i64, ForgeError>;

    async fn post_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        state: CommitStatusState,
        description: &str,
        target_url: &str,
    ) -> Result<(), ForgeError>;

    async fn list_repos(&self, owner: &str) -> Result<Vec<RepoSummary>, ForgeError>;

    /// Opens a PR that introduces a starter `.ergomake/` manifest, returning its URL.
    async fn open_seed_pr(
        &self,
        owner: &str,
        repo: &str,
        manifest_path: &str,
        manifest_contents: &str,
    ) -> Result<String, ForgeError>;
}
