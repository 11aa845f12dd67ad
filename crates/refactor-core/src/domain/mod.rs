//! Domain models for refactor-bot.
//!
//! Canonical definitions for the core entities:
//! - `Finding`: one detected issue in one file, fresh on every scan
//! - `RefactorCategory`: the rule family a finding belongs to, and its tier
//! - `BotError`: the error taxonomy shared by every component

pub mod error;
pub mod finding;

pub use error::{BotError, Result};
pub use finding::{classify_rule, Analyzer, Finding, LineRange, RefactorCategory, Severity};
pub use refactor_state::{ProposalStatus, RepoId, RepositoryRefactorState, Tier};
