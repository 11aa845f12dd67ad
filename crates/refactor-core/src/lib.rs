//! refactor-bot Core Library
//!
//! Incremental-escalation refactor scheduling for GitHub repositories:
//! findings from static analysis are proposed as pull requests, safest tier
//! first, and a repository only moves to a more aggressive tier after its
//! previous proposal was merged.

pub mod cycle;
pub mod detector;
pub mod dispatcher;
pub mod domain;
pub mod escalation;
pub mod events;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod repo_config;
pub mod retry;
pub mod source_host;
pub mod suggestion;
pub mod telemetry;

pub use cycle::{CycleOutcome, PullRequestObservation, RefactorCycle};

pub use detector::{IssueDetector, StaticAnalyzer, DEFAULT_TOOL_TIMEOUT};

pub use dispatcher::{Dispatcher, EventReport, RepoAction, RepoResult};

pub use domain::{
    classify_rule, Analyzer, BotError, Finding, LineRange, ProposalStatus, RefactorCategory,
    RepoId, RepositoryRefactorState, Result, Severity, Tier,
};

pub use escalation::{
    apply_outcome, plan, record_proposal, tier_to_propose, EscalationPlan, OutcomeTransition,
    ProposalState,
};

pub use events::BotEvent;

pub use repo_config::{RepoConfig, CONFIG_PATH};
pub use retry::RetryPolicy;

pub use source_host::{
    branch_name, FileChange, GitHubClient, GitHubConfig, ProposedChange, PullRequestRef,
    SourceHost,
};

pub use suggestion::{
    OpenAiConfig, OpenAiGenerator, PatchVerdict, SuggestionGenerator, SuggestionRequest,
};

pub use refactor_state::{RefactorStateStore, StorageError, SurrealStateStore};
