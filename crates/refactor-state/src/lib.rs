//! Refactor-State: SurrealDB Backend for refactor-bot
//!
//! This crate provides the persistence layer for the escalation scheduler.
//! It owns the one durable record the bot keeps per repository and the
//! compare-and-set primitive every mutation goes through.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable per-repository state, atomic read-modify-write.
//!
//! ## Key Components
//!
//! - `RefactorStateStore`: Backend-agnostic store trait (load / create / compare-and-set)
//! - `RepositoryRefactorState`: The per-repository escalation record
//! - `SurrealStateStore`: SurrealDB implementation (mem://, surrealkv://, ws/wss)
//! - `fakes::MemoryStateStore`: In-memory implementation for tests

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{connect_from_env, connect_url, CloudConfig, DEFAULT_LOCAL_PATH};
pub use storage_traits::{
    ProposalStatus, RefactorStateStore, RepoId, RepositoryRefactorState, StorageResult, Tier,
};
pub use surreal_store::SurrealStateStore;

/// Result type for refactor-state connection and setup operations
pub type Result<T> = std::result::Result<T, StateError>;
