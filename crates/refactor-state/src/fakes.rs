//! In-memory fake for the state store (testing only)
//!
//! `MemoryStateStore` satisfies the `RefactorStateStore` contract without any
//! external dependencies. It can also be told to fail the next N
//! compare-and-set calls, which is how tests exercise the conflict path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory store backed by a `BTreeMap<repo_id, state>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<BTreeMap<String, RepositoryRefactorState>>,
    injected_conflicts: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` compare-and-set calls fail with `Conflict`,
    /// as if another writer had bumped the version in between.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, BTreeMap<String, RepositoryRefactorState>>> {
        self.states
            .lock()
            .map_err(|e| StorageError::Backend(format!("state map poisoned: {e}")))
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RefactorStateStore for MemoryStateStore {
    async fn load(&self, repo_id: &RepoId) -> StorageResult<Option<RepositoryRefactorState>> {
        let states = self.lock()?;
        Ok(states.get(repo_id.as_str()).cloned())
    }

    async fn create(
        &self,
        mut state: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState> {
        let mut states = self.lock()?;
        if states.contains_key(state.repo_id.as_str()) {
            return Err(StorageError::AlreadyExists {
                repo_id: state.repo_id.0.clone(),
            });
        }
        state.version = 1;
        state.updated_at = Utc::now();
        states.insert(state.repo_id.0.clone(), state.clone());
        Ok(state)
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        mut next: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState> {
        let mut states = self.lock()?;
        let current = states
            .get(next.repo_id.as_str())
            .ok_or_else(|| StorageError::NotFound {
                repo_id: next.repo_id.0.clone(),
            })?;

        if self.take_injected_conflict() {
            return Err(StorageError::Conflict {
                repo_id: next.repo_id.0.clone(),
                expected: expected_version,
                actual: current.version + 1,
            });
        }

        if current.version != expected_version {
            return Err(StorageError::Conflict {
                repo_id: next.repo_id.0.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        next.version = expected_version + 1;
        next.created_at = current.created_at;
        next.updated_at = Utc::now();
        states.insert(next.repo_id.0.clone(), next.clone());
        Ok(next)
    }

    async fn list(&self) -> StorageResult<Vec<RepositoryRefactorState>> {
        let states = self.lock()?;
        Ok(states.values().cloned().collect())
    }

    async fn list_by_installation(
        &self,
        installation_id: u64,
    ) -> StorageResult<Vec<RepositoryRefactorState>> {
        let states = self.lock()?;
        Ok(states
            .values()
            .filter(|s| s.installation_id == Some(installation_id))
            .cloned()
            .collect())
    }
}
