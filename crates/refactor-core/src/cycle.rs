//! One scan-and-propose cycle for a repository, plus the state updates
//! driven by installation and pull request events.
//!
//! Every collaborator call goes through [`with_retry`]. State is written
//! only with compare-and-set, and a lost race is retried once against a
//! fresh read before it surfaces as [`BotError::PersistenceConflict`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::detector::{sort_findings, IssueDetector};
use crate::domain::{
    BotError, Finding, ProposalStatus, RepoId, RepositoryRefactorState, Result, Tier,
};
use crate::escalation::{self, EscalationPlan, OutcomeTransition, ProposalState};
use crate::metrics::METRICS;
use crate::obs;
use crate::repo_config::{RepoConfig, CONFIG_PATH};
use crate::retry::{with_retry, RetryPolicy};
use crate::source_host::{branch_name, FileChange, ProposedChange, PullRequestRef, SourceHost};
use crate::suggestion::{
    guard_patch, select_target, PatchVerdict, SuggestionGenerator, SuggestionRequest,
};
use refactor_state::{RefactorStateStore, StorageError};

/// How a cycle ended. Only `Proposed` changes persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Proposed {
        tier: Tier,
        file_path: String,
        findings: usize,
        pr: PullRequestRef,
    },
    NoEligibleFindings {
        tier: Tier,
    },
    /// The previous proposal is still open.
    AwaitingReview {
        pr_number: Option<u64>,
    },
    NoChange {
        file_path: String,
    },
    PatchRejected {
        file_path: String,
        changed: usize,
        limit: usize,
    },
    /// The app was uninstalled from this repository.
    Suspended,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Proposed { .. } => "proposed",
            CycleOutcome::NoEligibleFindings { .. } => "no_eligible_findings",
            CycleOutcome::AwaitingReview { .. } => "awaiting_review",
            CycleOutcome::NoChange { .. } => "no_change",
            CycleOutcome::PatchRejected { .. } => "patch_rejected",
            CycleOutcome::Suspended => "suspended",
        }
    }
}

/// Result of feeding a PR merge/close notification into the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum PullRequestObservation {
    Applied { status: ProposalStatus, tier: Tier },
    /// Not the most recent proposal of the repository.
    Stale,
    /// The most recent proposal was already resolved.
    Duplicate,
    UnknownRepository,
}

/// Scan, plan, generate, publish, commit.
#[derive(Clone)]
pub struct RefactorCycle {
    store: Arc<dyn RefactorStateStore>,
    host: Arc<dyn SourceHost>,
    generator: Arc<dyn SuggestionGenerator>,
    detector: IssueDetector,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RefactorCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefactorCycle")
            .field("detector", &self.detector)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RefactorCycle {
    pub fn new(
        store: Arc<dyn RefactorStateStore>,
        host: Arc<dyn SourceHost>,
        generator: Arc<dyn SuggestionGenerator>,
        detector: IssueDetector,
    ) -> Self {
        Self {
            store,
            host,
            generator,
            detector,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn RefactorStateStore> {
        &self.store
    }

    /// Run one cycle for `repo`.
    ///
    /// Errors leave the persisted state untouched, except that a missing
    /// record is created at tier 0 before scanning.
    pub async fn run(&self, repo: &RepoId) -> Result<CycleOutcome> {
        let cycle_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        METRICS.inc_cycles();

        let span = obs::cycle_span(&cycle_id, repo.as_str());
        let result = async {
            obs::emit_cycle_started(&cycle_id, repo.as_str());
            self.run_inner(repo).await
        }
        .instrument(span)
        .await;

        match &result {
            Ok(outcome) => obs::emit_cycle_finished(
                &cycle_id,
                repo.as_str(),
                outcome.as_str(),
                started.elapsed().as_millis() as u64,
            ),
            Err(e) if e.is_fatal() => {
                error!(event = "cycle.aborted", cycle_id = %cycle_id, repo = %repo, error = %e);
            }
            Err(e) => obs::emit_cycle_failed(&cycle_id, repo.as_str(), e),
        }
        result
    }

    async fn run_inner(&self, repo: &RepoId) -> Result<CycleOutcome> {
        let state = match self.store.load(repo).await? {
            Some(state) => state,
            None => self.register_repository(repo, None).await?,
        };

        if state.is_suspended() {
            info!("repository suspended; skipping");
            return Ok(CycleOutcome::Suspended);
        }
        if state.has_open_proposal() {
            info!(pr_number = ?state.last_pr_number, "previous proposal still open");
            return Ok(CycleOutcome::AwaitingReview {
                pr_number: state.last_pr_number,
            });
        }

        let branch = with_retry(&self.retry, "source_host.default_branch", || {
            self.host.default_branch(repo)
        })
        .await?;

        let config_text = with_retry(&self.retry, "source_host.fetch_config", || {
            self.host.fetch_file(repo, CONFIG_PATH, &branch)
        })
        .await?;
        let config = RepoConfig::from_optional(config_text.as_deref())?;

        let sources = self.fetch_sources(repo, &branch, &config).await?;
        let findings = self.detect(&sources, &config).await?;
        let findings = config.retain_enabled(findings)?;

        let plan = escalation::plan(Some(&state), findings);
        info!(tier = plan.tier.rank(), rationale = %plan.rationale, "escalation plan");
        if plan.is_empty() {
            return Ok(CycleOutcome::NoEligibleFindings { tier: plan.tier });
        }

        let Some(target) = select_target(&plan.findings, config.max_findings_per_pr) else {
            return Ok(CycleOutcome::NoEligibleFindings { tier: plan.tier });
        };
        let original = sources
            .iter()
            .find(|(path, _)| *path == target.file_path)
            .map(|(_, content)| content.clone())
            .unwrap_or_default();
        debug!(file = %target.file_path, score = target.score, findings = target.findings.len(), "target selected");

        let request = SuggestionRequest {
            repo: repo.clone(),
            file_path: target.file_path.clone(),
            content: original.clone(),
            findings: target.findings.clone(),
            tier: plan.tier,
        };
        let raw = with_retry(&self.retry, "generator.generate", || {
            self.generator.generate(&request)
        })
        .await?;

        let content = match guard_patch(&original, &raw, config.max_diff_lines) {
            PatchVerdict::NoChange => {
                info!(file = %target.file_path, "generated patch changes nothing");
                return Ok(CycleOutcome::NoChange {
                    file_path: target.file_path,
                });
            }
            PatchVerdict::TooLarge { changed, limit } => {
                warn!(file = %target.file_path, changed, limit, "generated patch exceeds max_diff_lines");
                return Ok(CycleOutcome::PatchRejected {
                    file_path: target.file_path,
                    changed,
                    limit,
                });
            }
            PatchVerdict::Accepted { content, changed } => {
                debug!(changed, "patch accepted");
                content
            }
        };

        let change = proposed_change(plan.tier, &branch, &target.file_path, content, &target.findings);
        let pr = with_retry(&self.retry, "source_host.open_pull_request", || {
            self.host.open_pull_request(repo, &change)
        })
        .await?;
        METRICS.inc_prs_opened();
        obs::emit_pr_opened(repo.as_str(), plan.tier.rank(), pr.number, &pr.url);

        self.commit_proposal(&state, &plan, &pr).await?;

        Ok(CycleOutcome::Proposed {
            tier: plan.tier,
            file_path: target.file_path,
            findings: target.findings.len(),
            pr,
        })
    }

    /// Contents of every scannable Python file on `branch`.
    async fn fetch_sources(
        &self,
        repo: &RepoId,
        branch: &str,
        config: &RepoConfig,
    ) -> Result<Vec<(String, String)>> {
        let paths = with_retry(&self.retry, "source_host.list_files", || {
            self.host.list_files(repo, branch)
        })
        .await?;
        let candidates = self.detector.candidate_paths(&paths, config)?;

        let mut sources = Vec::with_capacity(candidates.len());
        for path in candidates {
            let content = with_retry(&self.retry, "source_host.fetch_file", || {
                self.host.fetch_file(repo, &path, branch)
            })
            .await?;
            match content {
                Some(content) => sources.push((path, content)),
                None => debug!(path = %path, "listed file vanished before fetch"),
            }
        }
        Ok(sources)
    }

    /// Analyze each fetched source on its own so the call timeout bounds
    /// one file, not the whole repository.
    async fn detect(&self, sources: &[(String, String)], config: &RepoConfig) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        for (path, source) in sources {
            findings.extend(
                with_retry(&self.retry, "detector.analyze_file", || {
                    self.detector.analyze_file(path, source, config)
                })
                .await?,
            );
        }
        sort_findings(&mut findings);
        info!(files = sources.len(), findings = findings.len(), "detection complete");
        Ok(findings)
    }

    /// Persist the opened proposal with one compare-and-set.
    async fn commit_proposal(
        &self,
        read: &RepositoryRefactorState,
        plan: &EscalationPlan,
        pr: &PullRequestRef,
    ) -> Result<RepositoryRefactorState> {
        let next = escalation::record_proposal(read, plan.tier, pr.number, &pr.url);
        let committed = match self.store.compare_and_set(read.version, next).await {
            Ok(committed) => committed,
            Err(StorageError::Conflict { .. }) => {
                METRICS.inc_conflicts();
                let fresh = self.store.load(&read.repo_id).await?;
                let Some(fresh) = fresh.filter(|f| same_decision(f, plan)) else {
                    warn!(pr_number = pr.number, "state changed under an opened proposal");
                    return Err(BotError::PersistenceConflict {
                        repo_id: read.repo_id.to_string(),
                        detail: format!(
                            "state changed while PR #{} was being opened",
                            pr.number
                        ),
                    });
                };
                let next = escalation::record_proposal(&fresh, plan.tier, pr.number, &pr.url);
                self.store
                    .compare_and_set(fresh.version, next)
                    .await
                    .map_err(|e| conflict_or_storage(&read.repo_id, e))?
            }
            Err(e) => return Err(e.into()),
        };

        obs::emit_state_transition(
            read.repo_id.as_str(),
            plan.proposal_state.as_str(),
            ProposalState::ProposalOpen.as_str(),
            committed.current_tier.rank(),
        );
        Ok(committed)
    }

    /// Record a merge or close of PR `number`.
    pub async fn observe_pull_request(
        &self,
        repo: &RepoId,
        number: u64,
        merged: bool,
    ) -> Result<PullRequestObservation> {
        for attempt in 1..=2 {
            let Some(state) = self.store.load(repo).await? else {
                debug!(repo = %repo, number, "outcome for unknown repository");
                return Ok(PullRequestObservation::UnknownRepository);
            };
            let next = match escalation::apply_outcome(&state, number, merged, Utc::now()) {
                OutcomeTransition::Applied(next) => next,
                OutcomeTransition::Stale => {
                    info!(repo = %repo, number, last = ?state.last_pr_number, "ignoring stale PR outcome");
                    return Ok(PullRequestObservation::Stale);
                }
                OutcomeTransition::Duplicate => {
                    info!(repo = %repo, number, "ignoring duplicate PR outcome");
                    return Ok(PullRequestObservation::Duplicate);
                }
            };

            match self.store.compare_and_set(state.version, next).await {
                Ok(committed) => {
                    let to = ProposalState::of(Some(&committed));
                    obs::emit_state_transition(
                        repo.as_str(),
                        ProposalState::ProposalOpen.as_str(),
                        to.as_str(),
                        committed.current_tier.rank(),
                    );
                    let status = if merged {
                        ProposalStatus::Merged
                    } else {
                        ProposalStatus::Closed
                    };
                    return Ok(PullRequestObservation::Applied {
                        status,
                        tier: committed.current_tier,
                    });
                }
                Err(StorageError::Conflict { .. }) if attempt == 1 => {
                    METRICS.inc_conflicts();
                    debug!(repo = %repo, "outcome lost a compare-and-set; re-reading");
                }
                Err(e) => return Err(conflict_or_storage(repo, e)),
            }
        }
        Err(BotError::PersistenceConflict {
            repo_id: repo.to_string(),
            detail: format!("could not record outcome of PR #{number}"),
        })
    }

    /// Insert the record if absent, or clear a suspension and attach the
    /// installation if present.
    pub async fn register_repository(
        &self,
        repo: &RepoId,
        installation_id: Option<u64>,
    ) -> Result<RepositoryRefactorState> {
        for attempt in 1..=2 {
            let existing = match self.store.load(repo).await? {
                Some(existing) => existing,
                None => {
                    let fresh = RepositoryRefactorState::new(repo.clone(), installation_id);
                    match self.store.create(fresh).await {
                        Ok(created) => {
                            info!(repo = %repo, installation_id = ?installation_id, "repository registered");
                            return Ok(created);
                        }
                        Err(StorageError::AlreadyExists { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            let reattach = installation_id.is_some() && existing.installation_id != installation_id;
            if !existing.is_suspended() && !reattach {
                return Ok(existing);
            }
            let mut next = existing.clone();
            next.suspended_at = None;
            if installation_id.is_some() {
                next.installation_id = installation_id;
            }
            match self.store.compare_and_set(existing.version, next).await {
                Ok(updated) => {
                    info!(repo = %repo, installation_id = ?installation_id, "repository reactivated");
                    return Ok(updated);
                }
                Err(StorageError::Conflict { .. }) if attempt == 1 => METRICS.inc_conflicts(),
                Err(e) => return Err(conflict_or_storage(repo, e)),
            }
        }
        Err(BotError::PersistenceConflict {
            repo_id: repo.to_string(),
            detail: "could not register repository".to_string(),
        })
    }

    /// Repositories of an installation that are not yet suspended.
    pub async fn installation_repositories(&self, installation_id: u64) -> Result<Vec<RepoId>> {
        let states = self.store.list_by_installation(installation_id).await?;
        Ok(states
            .into_iter()
            .filter(|s| !s.is_suspended())
            .map(|s| s.repo_id)
            .collect())
    }

    /// Mark one repository suspended. Its record is kept so a reinstall
    /// resumes at the same tier. Returns false when there was nothing to do.
    pub async fn suspend_repository(&self, repo: &RepoId) -> Result<bool> {
        for attempt in 1..=2 {
            let Some(current) = self.store.load(repo).await? else {
                return Ok(false);
            };
            if current.is_suspended() {
                return Ok(false);
            }
            let mut next = current.clone();
            next.suspended_at = Some(Utc::now());
            match self.store.compare_and_set(current.version, next).await {
                Ok(_) => {
                    info!(repo = %repo, "repository suspended");
                    return Ok(true);
                }
                Err(StorageError::Conflict { .. }) if attempt == 1 => METRICS.inc_conflicts(),
                Err(e) => return Err(conflict_or_storage(repo, e)),
            }
        }
        Ok(false)
    }

    /// Mark every repository of an uninstalled installation suspended.
    pub async fn suspend_installation(&self, installation_id: u64) -> Result<Vec<RepoId>> {
        let mut suspended = Vec::new();
        for repo in self.installation_repositories(installation_id).await? {
            if self.suspend_repository(&repo).await? {
                suspended.push(repo);
            }
        }
        info!(installation_id, count = suspended.len(), "installation suspended");
        Ok(suspended)
    }
}

/// Whether `fresh` still leads to the tier and proposal state in `plan`.
fn same_decision(fresh: &RepositoryRefactorState, plan: &EscalationPlan) -> bool {
    !fresh.is_suspended()
        && escalation::tier_to_propose(Some(fresh)) == plan.tier
        && ProposalState::of(Some(fresh)) == plan.proposal_state
}

fn conflict_or_storage(repo: &RepoId, err: StorageError) -> BotError {
    if err.is_conflict() {
        METRICS.inc_conflicts();
        BotError::PersistenceConflict {
            repo_id: repo.to_string(),
            detail: err.to_string(),
        }
    } else {
        BotError::Storage(err)
    }
}

fn proposed_change(
    tier: Tier,
    base_branch: &str,
    file_path: &str,
    content: String,
    findings: &[Finding],
) -> ProposedChange {
    let title = format!("refactor-bot: tier {} fixes in {file_path}", tier);
    let mut body = format!(
        "Automated {} refactor of `{file_path}` (tier {}).\n\nAddressed findings:\n",
        tier.as_str(),
        tier.rank()
    );
    for f in findings {
        body.push_str(&format!("- `{}` {}: {}\n", f.rule_id, f.line_range, f.message));
    }
    body.push_str(
        "\nMerging this PR lets the next proposal for this repository move to the next tier.\n",
    );
    ProposedChange {
        tier,
        base_branch: base_branch.to_string(),
        head_branch: branch_name(tier, &content),
        title,
        body,
        commit_message: format!("refactor: tier {} fixes in {file_path}", tier.rank()),
        file: FileChange {
            path: file_path.to_string(),
            content,
        },
    }
}
