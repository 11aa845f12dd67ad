//! Source host abstraction: repository reads and pull request creation.
//!
//! [`GitHubClient`] talks to the GitHub REST API. Tests use
//! [`crate::fakes::ScriptedSourceHost`].

pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{RepoId, Result, Tier};

pub use github::{GitHubClient, GitHubConfig};

/// Prefix of every branch the bot pushes.
pub const BRANCH_PREFIX: &str = "refactor-bot";

/// One file rewritten by a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// Everything needed to open one suggestion PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedChange {
    pub tier: Tier,
    pub base_branch: String,
    pub head_branch: String,
    pub title: String,
    pub body: String,
    pub commit_message: String,
    pub file: FileChange,
}

/// An opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
}

/// Repository reads and PR creation on a GitHub-like host.
#[async_trait]
pub trait SourceHost: Send + Sync {
    async fn default_branch(&self, repo: &RepoId) -> Result<String>;

    /// Every blob path on `branch`, recursively.
    async fn list_files(&self, repo: &RepoId, branch: &str) -> Result<Vec<String>>;

    /// Decoded UTF-8 content, or `None` if the path does not exist.
    async fn fetch_file(&self, repo: &RepoId, path: &str, branch: &str) -> Result<Option<String>>;

    /// Push `change` to a new branch and open a PR against its base.
    ///
    /// Must be safe to repeat after a partial failure: an existing head
    /// branch is reused and an existing open PR for it is returned.
    async fn open_pull_request(
        &self,
        repo: &RepoId,
        change: &ProposedChange,
    ) -> Result<PullRequestRef>;
}

/// Deterministic head branch: `refactor-bot/tier-<t>-<sha256(content)[..12]>`.
pub fn branch_name(tier: Tier, content: &str) -> String {
    let digest = hex::encode(Sha256::digest(content.as_bytes()));
    format!("{BRANCH_PREFIX}/tier-{}-{}", tier.rank(), &digest[..12])
}
