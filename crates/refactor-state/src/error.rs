//! Error types for refactor-state

use thiserror::Error;

/// Errors raised while connecting to the database or preparing its schema
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by [`crate::RefactorStateStore`] operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record exists for the repository
    #[error("no refactor state for repository {repo_id}")]
    NotFound { repo_id: String },

    /// A record already exists where a fresh one was expected
    #[error("refactor state for repository {repo_id} already exists")]
    AlreadyExists { repo_id: String },

    /// Compare-and-set lost against a concurrent writer
    #[error("version conflict on {repo_id}: expected {expected}, found {actual}")]
    Conflict {
        repo_id: String,
        expected: u64,
        actual: u64,
    },

    /// A stored row could not be mapped back to the domain record
    #[error("invalid stored record for {repo_id}: {reason}")]
    InvalidRecord { repo_id: String, reason: String },

    /// Backend (database) failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether a fresh read followed by a retry may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
