//! Row definitions for refactor-bot SurrealDB tables
//!
//! Tables:
//! - repo_states: one escalation record per repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{ProposalStatus, RepoId, RepositoryRefactorState, Tier};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = date.map(SurrealDatetime::from);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// `repo_states` row. Enums are stored as plain strings / ranks so the table
/// stays readable from the SurrealDB console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoStateRow {
    pub repo_id: String,
    #[serde(default)]
    pub installation_id: Option<u64>,
    pub current_tier: u8,
    #[serde(default)]
    pub last_pr_status: Option<String>,
    #[serde(default)]
    pub last_pr_number: Option<u64>,
    #[serde(default)]
    pub last_pr_url: Option<String>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub last_pr_merged_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub suspended_at: Option<DateTime<Utc>>,
    pub version: u64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&RepositoryRefactorState> for RepoStateRow {
    fn from(state: &RepositoryRefactorState) -> Self {
        Self {
            repo_id: state.repo_id.0.clone(),
            installation_id: state.installation_id,
            current_tier: state.current_tier.rank(),
            last_pr_status: state.last_pr_status.map(|s| s.as_str().to_string()),
            last_pr_number: state.last_pr_number,
            last_pr_url: state.last_pr_url.clone(),
            last_pr_merged_at: state.last_pr_merged_at,
            suspended_at: state.suspended_at,
            version: state.version,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

impl TryFrom<RepoStateRow> for RepositoryRefactorState {
    type Error = StorageError;

    fn try_from(row: RepoStateRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| StorageError::InvalidRecord {
            repo_id: row.repo_id.clone(),
            reason,
        };

        let current_tier = Tier::from_rank(row.current_tier)
            .ok_or_else(|| invalid(format!("unknown tier rank {}", row.current_tier)))?;

        let last_pr_status = match row.last_pr_status.as_deref() {
            None => None,
            Some(s) => Some(
                ProposalStatus::parse(s)
                    .ok_or_else(|| invalid(format!("unknown proposal status: {s}")))?,
            ),
        };

        Ok(RepositoryRefactorState {
            repo_id: RepoId(row.repo_id),
            installation_id: row.installation_id,
            current_tier,
            last_pr_status,
            last_pr_number: row.last_pr_number,
            last_pr_url: row.last_pr_url,
            last_pr_merged_at: row.last_pr_merged_at,
            suspended_at: row.suspended_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_rejects_unknown_tier_rank() {
        let state = RepositoryRefactorState::new(RepoId::new("acme/a"), None);
        let mut row = RepoStateRow::from(&state);
        row.current_tier = 9;
        let err = RepositoryRefactorState::try_from(row).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { .. }));
    }

    #[test]
    fn row_rejects_unknown_status() {
        let state = RepositoryRefactorState::new(RepoId::new("acme/a"), None);
        let mut row = RepoStateRow::from(&state);
        row.last_pr_status = Some("reopened".to_string());
        assert!(RepositoryRefactorState::try_from(row).is_err());
    }

    #[test]
    fn row_preserves_merge_timestamp() {
        let mut state = RepositoryRefactorState::new(RepoId::new("acme/a"), Some(3));
        state.current_tier = Tier::Simplification;
        state.last_pr_status = Some(ProposalStatus::Merged);
        state.last_pr_number = Some(12);
        state.last_pr_merged_at = Some(Utc::now());

        let back = RepositoryRefactorState::try_from(RepoStateRow::from(&state)).unwrap();
        assert_eq!(back, state);
    }
}
