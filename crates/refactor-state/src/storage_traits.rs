//! Storage trait definitions for refactor-bot
//!
//! - `RepositoryRefactorState`: one escalation record per repository
//! - `RefactorStateStore`: durable store with an atomic compare-and-set
//!
//! The trait is async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers and enums
// ---------------------------------------------------------------------------

/// Repository identifier (`owner/name` full name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId(pub String);

impl RepoId {
    pub fn new(full_name: impl Into<String>) -> Self {
        RepoId(full_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(owner, name)`. Returns `None` for ids without a slash.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        let (owner, name) = self.0.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some((owner, name))
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Refactor aggressiveness, lowest-risk first.
///
/// The ordering of the variants is the ordering of the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 0: whitespace and style.
    Style,
    /// Tier 1: structural simplification.
    Simplification,
    /// Tier 2: semantic restructuring.
    Restructuring,
}

impl Tier {
    /// The lowest tier, proposed for repositories without history.
    pub const MIN: Tier = Tier::Style;

    /// The most aggressive tier. Escalation is capped here.
    pub const MAX: Tier = Tier::Restructuring;

    /// All tiers in ascending order.
    pub const ALL: [Tier; 3] = [Tier::Style, Tier::Simplification, Tier::Restructuring];

    /// Numeric rank (0-based).
    pub fn rank(self) -> u8 {
        match self {
            Tier::Style => 0,
            Tier::Simplification => 1,
            Tier::Restructuring => 2,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Tier> {
        Tier::ALL.get(rank as usize).copied()
    }

    /// The next tier up, saturating at [`Tier::MAX`].
    pub fn next_capped(self) -> Tier {
        Tier::from_rank(self.rank() + 1).unwrap_or(Tier::MAX)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Style => "style",
            Tier::Simplification => "simplification",
            Tier::Restructuring => "restructuring",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.rank(), self.as_str())
    }
}

/// Status of the most recent suggestion PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Open,
    Merged,
    Closed,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Open => "open",
            ProposalStatus::Merged => "merged",
            ProposalStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<ProposalStatus> {
        match s {
            "open" => Some(ProposalStatus::Open),
            "merged" => Some(ProposalStatus::Merged),
            "closed" => Some(ProposalStatus::Closed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RepositoryRefactorState
// ---------------------------------------------------------------------------

/// Per-repository escalation record.
///
/// `version` is owned by the store: it is bumped on every successful write
/// and is the token compare-and-set checks against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRefactorState {
    pub repo_id: RepoId,
    pub installation_id: Option<u64>,
    pub current_tier: Tier,
    pub last_pr_status: Option<ProposalStatus>,
    pub last_pr_number: Option<u64>,
    pub last_pr_url: Option<String>,
    pub last_pr_merged_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryRefactorState {
    /// A fresh record with no proposal history, at the lowest tier.
    pub fn new(repo_id: RepoId, installation_id: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            repo_id,
            installation_id,
            current_tier: Tier::MIN,
            last_pr_status: None,
            last_pr_number: None,
            last_pr_url: None,
            last_pr_merged_at: None,
            suspended_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }

    pub fn has_open_proposal(&self) -> bool {
        self.last_pr_status == Some(ProposalStatus::Open)
    }
}

// ---------------------------------------------------------------------------
// RefactorStateStore
// ---------------------------------------------------------------------------

/// Durable escalation state store.
///
/// Guarantees:
/// - At most one record per `repo_id`.
/// - `create` stores version 1 and fails with `AlreadyExists` if a record exists.
/// - `compare_and_set` writes only when the stored version equals
///   `expected_version`, and stores `expected_version + 1`. A mismatch returns
///   `Conflict` and leaves the record untouched.
/// - Records are never deleted by the store.
#[async_trait]
pub trait RefactorStateStore: Send + Sync {
    /// Load the record for a repository, if any.
    async fn load(&self, repo_id: &RepoId) -> StorageResult<Option<RepositoryRefactorState>>;

    /// Insert a fresh record. Returns the stored record (version 1).
    async fn create(&self, state: RepositoryRefactorState)
        -> StorageResult<RepositoryRefactorState>;

    /// Atomically replace the record if its version is still `expected_version`.
    async fn compare_and_set(
        &self,
        expected_version: u64,
        next: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState>;

    /// All records, ordered by repository id.
    async fn list(&self) -> StorageResult<Vec<RepositoryRefactorState>>;

    /// All records belonging to one app installation, ordered by repository id.
    async fn list_by_installation(
        &self,
        installation_id: u64,
    ) -> StorageResult<Vec<RepositoryRefactorState>>;
}
