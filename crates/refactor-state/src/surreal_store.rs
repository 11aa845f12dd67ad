//! SurrealDB-backed RefactorStateStore implementation
//!
//! Uses `schema::RepoStateRow` for persistence, converting to/from
//! `storage_traits` types at the boundary. Compare-and-set is a single
//! conditional `UPDATE ... WHERE version = $expected` statement.

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::schema::RepoStateRow;
use crate::storage_traits::{RefactorStateStore, RepoId, RepositoryRefactorState, StorageResult};

/// SurrealDB-backed implementation of [`RefactorStateStore`].
#[derive(Clone)]
pub struct SurrealStateStore {
    db: Surreal<Any>,
}

impl SurrealStateStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_url("mem://").await?;
        info!("SurrealStateStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Uses the env-var chain of [`crate::connect_from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        Ok(Self { db })
    }

    /// Wrap an already-connected handle. The schema must be initialized.
    pub fn from_handle(db: Surreal<Any>) -> Self {
        Self { db }
    }

    // -- private helpers -----------------------------------------------------

    async fn select_rows(
        &self,
        sql: &'static str,
        bind: Option<(&'static str, u64)>,
    ) -> StorageResult<Vec<RepoStateRow>> {
        let query = self.db.query(sql);
        let query = match bind {
            Some(b) => query.bind(b),
            None => query,
        };
        let mut res = query
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        res.take(0).map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn rows_to_states(rows: Vec<RepoStateRow>) -> StorageResult<Vec<RepositoryRefactorState>> {
        rows.into_iter()
            .map(RepositoryRefactorState::try_from)
            .collect()
    }
}

#[async_trait]
impl RefactorStateStore for SurrealStateStore {
    async fn load(&self, repo_id: &RepoId) -> StorageResult<Option<RepositoryRefactorState>> {
        let mut res = self
            .db
            .query("SELECT * FROM repo_states WHERE repo_id = $rid")
            .bind(("rid", repo_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RepoStateRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .map(RepositoryRefactorState::try_from)
            .transpose()
    }

    async fn create(
        &self,
        mut state: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState> {
        if self.load(&state.repo_id).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                repo_id: state.repo_id.0.clone(),
            });
        }

        state.version = 1;
        state.updated_at = Utc::now();
        let row = RepoStateRow::from(&state);

        let created: StorageResult<Vec<RepoStateRow>> = async {
            let mut res = self
                .db
                .query("CREATE repo_states CONTENT $row")
                .bind(("row", row))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))
        }
        .await;

        match created {
            Ok(_) => {
                debug!(repo_id = %state.repo_id, "repo state created");
                Ok(state)
            }
            // The unique index on repo_id rejects a concurrent create.
            Err(err) => match self.load(&state.repo_id).await? {
                Some(_) => Err(StorageError::AlreadyExists {
                    repo_id: state.repo_id.0.clone(),
                }),
                None => Err(err),
            },
        }
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        mut next: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState> {
        next.version = expected_version + 1;
        next.updated_at = Utc::now();
        let row = RepoStateRow::from(&next);

        let updated: StorageResult<Vec<RepoStateRow>> = async {
            let mut res = self
                .db
                .query(
                    "UPDATE repo_states CONTENT $row \
                     WHERE repo_id = $rid AND version = $expected",
                )
                .bind(("row", row))
                .bind(("rid", next.repo_id.0.clone()))
                .bind(("expected", expected_version))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))
        }
        .await;

        let failure = match updated {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => {
                    debug!(repo_id = %next.repo_id, version = next.version, "repo state updated");
                    return RepositoryRefactorState::try_from(row);
                }
                None => None,
            },
            // A transaction aborted by a concurrent writer surfaces as a backend error.
            Err(err) => Some(err),
        };

        match self.load(&next.repo_id).await? {
            None => Err(StorageError::NotFound {
                repo_id: next.repo_id.0.clone(),
            }),
            Some(current) if current.version != expected_version => Err(StorageError::Conflict {
                repo_id: next.repo_id.0.clone(),
                expected: expected_version,
                actual: current.version,
            }),
            Some(current) => Err(failure.unwrap_or(StorageError::Conflict {
                repo_id: next.repo_id.0.clone(),
                expected: expected_version,
                actual: current.version,
            })),
        }
    }

    async fn list(&self) -> StorageResult<Vec<RepositoryRefactorState>> {
        let rows = self
            .select_rows("SELECT * FROM repo_states ORDER BY repo_id ASC", None)
            .await?;
        Self::rows_to_states(rows)
    }

    async fn list_by_installation(
        &self,
        installation_id: u64,
    ) -> StorageResult<Vec<RepositoryRefactorState>> {
        let rows = self
            .select_rows(
                "SELECT * FROM repo_states WHERE installation_id = $iid ORDER BY repo_id ASC",
                Some(("iid", installation_id)),
            )
            .await?;
        Self::rows_to_states(rows)
    }
}
