//! In-memory `ForgeClient` used by orchestrator/watcher/reconciler unit
//! tests so they can exercise state transitions without a live forge.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{CommitStatusState, ForgeClient, ForgeError, RepoSummary};

#[derive(Debug, Clone)]
pub struct PostedComment {
    pub owner: String,
    pub repo: String,
    pub pull_request: i64,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct PostedStatus {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub state: CommitStatusState,
    pub description: String,
}

#[derive(Default)]
struct State {
    branches: HashMap<(String, String), Vec<String>>,
    default_branch: HashMap<(String, String), String>,
    shas: HashMap<(String, String, String), String>,
    private: HashMap<(String, String), bool>,
    comments: Vec<PostedComment>,
    next_comment_id: i64,
    statuses: Vec<PostedStatus>,
}

/// A fully scriptable forge double: insert branches/SHAs/privacy up front,
/// then inspect `comments()`/`statuses()` after exercising the unit under test.
pub struct InMemoryForgeClient {
    state: Mutex<State>,
}

impl Default for InMemoryForgeClient {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_comment_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl InMemoryForgeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_branch_sha(&self, owner: &str, repo: &str, branch: &str, sha: &str) {
        let mut s = self.state.lock().unwrap();
        s.branches
            .entry((owner.into(), repo.into()))
            .or_default()
            .push(branch.into());
        s.shas
            .insert((owner.into(), repo.into(), branch.into()), sha.into());
    }

    pub fn remove_branch(&self, owner: &str, repo: &str, branch: &str) {
        let mut s = self.state.lock().unwrap();
        if let Some(branches) = s.branches.get_mut(&(owner.to_string(), repo.to_string())) {
            branches.retain(|b| b != branch);
        }
        s.shas
            .remove(&(owner.to_string(), repo.to_string(), branch.to_string()));
    }

    pub fn set_private(&self, owner: &str, repo: &str, is_private: bool) {
        self.state
            .lock()
            .unwrap()
            .private
            .insert((owner.into(), repo.into()), is_private);
    }

    pub fn set_default_branch(&self, owner: &str, repo: &str, branch: &str) {
        self.state
            .lock()
            .unwrap()
            .default_branch
            .insert((owner.into(), repo.into()), branch.into());
    }

    pub fn comments(&self) -> Vec<PostedComment> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn statuses(&self) -> Vec<PostedStatus> {
        self.state.lock().unwrap().statuses.clone()
    }
}

#[async_trait]
impl ForgeClient for InMemoryForgeClient {
    async fn get_clone_token(&self, _owner: &str, _repo: &str) -> Result<String, ForgeError> {
        Ok("test-clone-token".into())
    }

    async fn is_repo_private(&self, owner: &str, repo: &str) -> Result<bool, ForgeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .private
            .get(&(owner.into(), repo.into()))
            .copied()
            .unwrap_or(false))
    }

    async fn does_branch_exist(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<bool, ForgeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .branches
            .get(&(owner.into(), repo.into()))
            .is_some_and(|b| b.iter().any(|x| x == branch)))
    }

    async fn get_default_branch(&self, owner: &str, repo: &str) -> Result<String, ForgeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .default_branch
            .get(&(owner.into(), repo.into()))
            .cloned()
            .unwrap_or_else(|| "main".into()))
    }

    async fn get_branch_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ForgeError> {
        self.state
            .lock()
            .unwrap()
            .shas
            .get(&(owner.into(), repo.into(), branch.into()))
            .cloned()
            .ok_or_else(|| ForgeError::NotFound {
                owner: owner.into(),
                repo: repo.into(),
            })
    }

    async fn upsert_comment(
        &self,
        owner: &str,
        repo: &str,
        pull_request: i64,
        existing_comment_id: Option<i64>,
        body: &str,
    ) -> Result<i64, ForgeError> {
        let mut s = self.state.lock().unwrap();
        let id = match existing_comment_id {
            Some(id) => id,
            None => {
                let id = s.next_comment_id;
                s.next_comment_id += 1;
                id
            }
        };
        s.comments.push(PostedComment {
            owner: owner.into(),
            repo: repo.into(),
            pull_request,
            body: body.into(),
        });
        Ok(id)
    }

    async fn post_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        state: CommitStatusState,
        description: &str,
        _target_url: &str,
    ) -> Result<(), ForgeError> {
        self.state.lock().unwrap().statuses.push(PostedStatus {
            owner: owner.into(),
            repo: repo.into(),
            sha: sha.into(),
            state,
            description: description.into(),
        });
        Ok(())
    }

    async fn list_repos(&self, _owner: &str) -> Result<Vec<RepoSummary>, ForgeError> {
        Ok(vec![])
    }

    async fn open_seed_pr(
        &self,
        owner: &str,
        repo: &str,
        _manifest_path: &str,
        _manifest_contents: &str,
    ) -> Result<String, ForgeError> {
        Ok(format!("https://forge.example/{owner}/{repo}/pull/1"))
    }
}
