//! End-to-end cycles against scripted collaborators and the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use refactor_core::fakes::{HostOp, PatternAnalyzer, ScriptedGenerator, ScriptedSourceHost};
use refactor_core::repo_config::Thresholds;
use refactor_core::{
    BotError, CycleOutcome, Finding, IssueDetector, ProposalStatus, PullRequestObservation,
    RefactorCycle, RefactorStateStore, RepoId, RepositoryRefactorState, RetryPolicy,
    StaticAnalyzer, Tier,
};
use refactor_state::fakes::MemoryStateStore;
use refactor_state::{StorageError, StorageResult};

const SOURCE: &str = "import os\nx = 1 \ny = 2\n";
const STYLE_FIXED: &str = "import os\nx = 1\ny = 2\n";
const SIMPLIFIED: &str = "x = 1\ny = 2\n";

fn repo() -> RepoId {
    RepoId::new("acme/widgets")
}

fn detector() -> IssueDetector {
    IssueDetector::new(vec![Arc::new(
        PatternAnalyzer::new()
            .with_pattern("import os", "F401")
            .with_pattern("while True", "C901"),
    )])
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 40,
        call_timeout: Duration::from_secs(5),
    }
}

struct Harness {
    store: Arc<MemoryStateStore>,
    host: Arc<ScriptedSourceHost>,
    generator: Arc<ScriptedGenerator>,
    cycle: RefactorCycle,
}

fn harness_with(host: ScriptedSourceHost, generator: ScriptedGenerator) -> Harness {
    let store = Arc::new(MemoryStateStore::new());
    let host = Arc::new(host);
    let generator = Arc::new(generator);
    let cycle = RefactorCycle::new(store.clone(), host.clone(), generator.clone(), detector())
        .with_retry_policy(fast_retry());
    Harness {
        store,
        host,
        generator,
        cycle,
    }
}

fn harness() -> Harness {
    harness_with(
        ScriptedSourceHost::new().with_file(&repo(), "app/main.py", SOURCE),
        ScriptedGenerator::echo(),
    )
}

async fn load(h: &Harness) -> RepositoryRefactorState {
    h.store.load(&repo()).await.unwrap().expect("state exists")
}

#[tokio::test]
async fn full_escalation_lifecycle() {
    let h = harness();

    // First scan: tier 0, only the whitespace finding is eligible
    h.generator.push_reply(STYLE_FIXED);
    let outcome = h.cycle.run(&repo()).await.unwrap();
    let CycleOutcome::Proposed { tier, findings, pr, .. } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };
    assert_eq!(tier, Tier::Style);
    assert_eq!(findings, 1);
    let sent = &h.generator.requests()[0];
    assert_eq!(sent.findings.len(), 1);
    assert_eq!(sent.findings[0].rule_id, "W291");
    assert_eq!(h.host.opened()[0].change.file.content, STYLE_FIXED);

    let state = load(&h).await;
    assert_eq!(state.current_tier, Tier::Style);
    assert_eq!(state.last_pr_status, Some(ProposalStatus::Open));
    assert_eq!(state.last_pr_number, Some(pr.number));

    // No overlapping proposals
    assert_eq!(
        h.cycle.run(&repo()).await.unwrap(),
        CycleOutcome::AwaitingReview {
            pr_number: Some(pr.number)
        }
    );
    assert_eq!(h.host.opened().len(), 1);

    // Merge: recorded now, tier advance takes effect on the next cycle
    h.host.resolve(pr.number, true);
    let observed = h.cycle.observe_pull_request(&repo(), pr.number, true).await.unwrap();
    assert_eq!(
        observed,
        PullRequestObservation::Applied {
            status: ProposalStatus::Merged,
            tier: Tier::Style
        }
    );
    let state = load(&h).await;
    assert_eq!(state.current_tier, Tier::Style);
    assert!(state.last_pr_merged_at.is_some());

    h.generator.push_reply(SIMPLIFIED);
    let outcome = h.cycle.run(&repo()).await.unwrap();
    let CycleOutcome::Proposed { tier, pr: second, .. } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };
    assert_eq!(tier, Tier::Simplification);
    let state = load(&h).await;
    assert_eq!(state.current_tier, Tier::Simplification);
    assert_eq!(state.last_pr_merged_at, None);

    // Closed without merge: tier holds and the next cycle retries it
    h.host.resolve(second.number, false);
    h.cycle
        .observe_pull_request(&repo(), second.number, false)
        .await
        .unwrap();
    h.generator.push_reply(SIMPLIFIED);
    let outcome = h.cycle.run(&repo()).await.unwrap();
    let CycleOutcome::Proposed { tier, pr: third, .. } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };
    assert_eq!(tier, Tier::Simplification);
    assert_ne!(third.number, second.number);
    assert_eq!(load(&h).await.current_tier, Tier::Simplification);
}

#[tokio::test]
async fn stale_and_duplicate_outcomes_leave_state_alone() {
    let h = harness();
    h.generator.push_reply(STYLE_FIXED);
    let CycleOutcome::Proposed { pr, .. } = h.cycle.run(&repo()).await.unwrap() else {
        panic!("expected a proposal");
    };

    let before = load(&h).await;
    assert_eq!(
        h.cycle.observe_pull_request(&repo(), pr.number + 100, true).await.unwrap(),
        PullRequestObservation::Stale
    );
    assert_eq!(load(&h).await.version, before.version);

    h.cycle.observe_pull_request(&repo(), pr.number, false).await.unwrap();
    let closed = load(&h).await;
    assert_eq!(
        h.cycle.observe_pull_request(&repo(), pr.number, true).await.unwrap(),
        PullRequestObservation::Duplicate
    );
    let after = load(&h).await;
    assert_eq!(after.version, closed.version);
    assert_eq!(after.last_pr_status, Some(ProposalStatus::Closed));

    assert_eq!(
        h.cycle
            .observe_pull_request(&RepoId::new("acme/unknown"), 1, true)
            .await
            .unwrap(),
        PullRequestObservation::UnknownRepository
    );
}

#[tokio::test]
async fn no_eligible_findings_creates_no_pr() {
    let h = harness_with(
        ScriptedSourceHost::new().with_file(&repo(), "app/main.py", "import os\nx = 1\n"),
        ScriptedGenerator::echo(),
    );
    let outcome = h.cycle.run(&repo()).await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoEligibleFindings { tier: Tier::Style });
    assert!(h.host.opened().is_empty());
    assert!(h.generator.requests().is_empty());

    let state = load(&h).await;
    assert_eq!(state.version, 1);
    assert_eq!(state.last_pr_status, None);
}

#[tokio::test]
async fn top_tier_merge_stays_at_top_tier() {
    let h = harness_with(
        ScriptedSourceHost::new().with_file(&repo(), "app/loop.py", "while True:\n    pass\n"),
        ScriptedGenerator::fixed("for _ in range(3):\n    pass\n"),
    );
    let created = h
        .store
        .create(RepositoryRefactorState::new(repo(), None))
        .await
        .unwrap();
    let mut top = created.clone();
    top.current_tier = Tier::Restructuring;
    top.last_pr_status = Some(ProposalStatus::Merged);
    top.last_pr_number = Some(9);
    top.last_pr_merged_at = Some(Utc::now());
    h.store.compare_and_set(created.version, top).await.unwrap();

    let CycleOutcome::Proposed { tier, .. } = h.cycle.run(&repo()).await.unwrap() else {
        panic!("expected a proposal");
    };
    assert_eq!(tier, Tier::Restructuring);
    assert_eq!(load(&h).await.current_tier, Tier::Restructuring);
}

#[tokio::test]
async fn generator_echo_is_no_change() {
    let h = harness();
    let outcome = h.cycle.run(&repo()).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::NoChange {
            file_path: "app/main.py".to_string()
        }
    );
    assert!(h.host.opened().is_empty());
    assert_eq!(load(&h).await.version, 1);
}

#[tokio::test]
async fn oversized_patch_is_rejected() {
    let h = harness();
    let rewrite: String = (0..60).map(|n| format!("v{n} = {n}\n")).collect();
    h.generator.push_reply(&rewrite);
    let outcome = h.cycle.run(&repo()).await.unwrap();
    let CycleOutcome::PatchRejected { changed, limit, .. } = outcome else {
        panic!("expected rejection, got {outcome:?}");
    };
    assert!(changed > limit);
    assert_eq!(limit, 50);
    assert!(h.host.opened().is_empty());
}

#[tokio::test]
async fn malformed_config_aborts_before_any_pr_call() {
    let h = harness_with(
        ScriptedSourceHost::new()
            .with_file(&repo(), "app/main.py", SOURCE)
            .with_file(&repo(), ".refactor-bot.toml", "max_diff_lines = ["),
        ScriptedGenerator::fixed(STYLE_FIXED),
    );
    let err = h.cycle.run(&repo()).await.unwrap_err();
    assert!(err.is_fatal(), "unexpected error: {err}");
    assert_eq!(h.host.calls(HostOp::OpenPullRequest), 0);
    assert!(h.generator.requests().is_empty());
    assert_eq!(load(&h).await.last_pr_status, None);
}

#[tokio::test]
async fn config_filters_categories_and_paths() {
    let h = harness_with(
        ScriptedSourceHost::new()
            .with_file(&repo(), "app/main.py", SOURCE)
            .with_file(&repo(), "tests/test_main.py", "x = 1 \n")
            .with_file(
                &repo(),
                ".refactor-bot.toml",
                "exclude = [\"tests/**\"]\n[categories]\nstyle = false\n",
            ),
        ScriptedGenerator::fixed(STYLE_FIXED),
    );
    let outcome = h.cycle.run(&repo()).await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoEligibleFindings { tier: Tier::Style });
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_within_the_bound() {
    let h = harness();
    h.host.fail_transient(HostOp::OpenPullRequest, 2);
    h.generator.push_reply(STYLE_FIXED);
    let outcome = h.cycle.run(&repo()).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Proposed { .. }));
    assert_eq!(h.host.calls(HostOp::OpenPullRequest), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_abandon_the_cycle_without_state_change() {
    let h = harness();
    h.host.fail_transient(HostOp::OpenPullRequest, 10);
    h.generator.push_reply(STYLE_FIXED);
    let err = h.cycle.run(&repo()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.host.calls(HostOp::OpenPullRequest), 3);

    let state = load(&h).await;
    assert_eq!(state.version, 1);
    assert_eq!(state.last_pr_status, None);
}

#[tokio::test(start_paused = true)]
async fn generator_outage_leaves_state_unchanged() {
    let h = harness();
    h.generator.fail_transient(3);
    let err = h.cycle.run(&repo()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.generator.requests().len(), 3);
    assert!(h.host.opened().is_empty());
    assert_eq!(load(&h).await.version, 1);
}

/// Takes two seconds per file, well inside the call timeout.
struct SlowAnalyzer(PatternAnalyzer);

#[async_trait]
impl StaticAnalyzer for SlowAnalyzer {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn analyze(
        &self,
        path: &str,
        source: &str,
        thresholds: &Thresholds,
    ) -> refactor_core::Result<Vec<Finding>> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.0.analyze(path, source, thresholds).await
    }
}

#[tokio::test(start_paused = true)]
async fn call_timeout_bounds_each_file_not_the_whole_scan() {
    let mut host = ScriptedSourceHost::new();
    for i in 0..40 {
        host = host.with_file(&repo(), &format!("pkg/mod_{i:02}.py"), "x = 1\n");
    }
    host = host.with_file(&repo(), "pkg/zz_last.py", SOURCE);
    let generator = Arc::new(ScriptedGenerator::echo());
    generator.push_reply(STYLE_FIXED);
    let cycle = RefactorCycle::new(
        Arc::new(MemoryStateStore::new()),
        Arc::new(host),
        generator.clone(),
        IssueDetector::new(vec![Arc::new(SlowAnalyzer(PatternAnalyzer::new()))]),
    )
    .with_retry_policy(fast_retry());

    // 41 files at 2 s each is far past the 5 s call timeout in total
    let started = tokio::time::Instant::now();
    let outcome = cycle.run(&repo()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(82));
    let CycleOutcome::Proposed { file_path, .. } = outcome else {
        panic!("expected a proposal, got {outcome:?}");
    };
    assert_eq!(file_path, "pkg/zz_last.py");
}

#[tokio::test]
async fn single_conflict_is_retried_with_fresh_read() {
    let h = harness();
    h.cycle.register_repository(&repo(), Some(3)).await.unwrap();
    h.store.inject_conflicts(1);
    h.generator.push_reply(STYLE_FIXED);

    let outcome = h.cycle.run(&repo()).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Proposed { .. }));
    let state = load(&h).await;
    assert_eq!(state.last_pr_status, Some(ProposalStatus::Open));
    assert_eq!(state.version, 2);
}

#[tokio::test]
async fn repeated_conflict_surfaces_persistence_conflict() {
    let h = harness();
    h.cycle.register_repository(&repo(), None).await.unwrap();
    h.store.inject_conflicts(2);
    h.generator.push_reply(STYLE_FIXED);

    let err = h.cycle.run(&repo()).await.unwrap_err();
    assert!(matches!(err, BotError::PersistenceConflict { .. }), "got {err}");
    assert_eq!(load(&h).await.last_pr_status, None);
}

/// Suspends the repository right before the first compare-and-set lands,
/// so the fresh read no longer supports the cycle's decision.
struct RacingStore {
    inner: MemoryStateStore,
    raced: AtomicBool,
}

#[async_trait]
impl RefactorStateStore for RacingStore {
    async fn load(&self, repo_id: &RepoId) -> StorageResult<Option<RepositoryRefactorState>> {
        self.inner.load(repo_id).await
    }

    async fn create(
        &self,
        state: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState> {
        self.inner.create(state).await
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        next: RepositoryRefactorState,
    ) -> StorageResult<RepositoryRefactorState> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            let mut current = self
                .inner
                .load(&next.repo_id)
                .await?
                .ok_or_else(|| StorageError::NotFound {
                    repo_id: next.repo_id.to_string(),
                })?;
            current.suspended_at = Some(Utc::now());
            self.inner.compare_and_set(current.version, current).await?;
        }
        self.inner.compare_and_set(expected_version, next).await
    }

    async fn list(&self) -> StorageResult<Vec<RepositoryRefactorState>> {
        self.inner.list().await
    }

    async fn list_by_installation(
        &self,
        installation_id: u64,
    ) -> StorageResult<Vec<RepositoryRefactorState>> {
        self.inner.list_by_installation(installation_id).await
    }
}

#[tokio::test]
async fn conflict_with_changed_decision_is_not_retried() {
    let store = Arc::new(RacingStore {
        inner: MemoryStateStore::new(),
        raced: AtomicBool::new(false),
    });
    store
        .create(RepositoryRefactorState::new(repo(), None))
        .await
        .unwrap();
    let host = Arc::new(ScriptedSourceHost::new().with_file(&repo(), "app/main.py", SOURCE));
    let cycle = RefactorCycle::new(
        store.clone(),
        host.clone(),
        Arc::new(ScriptedGenerator::fixed(STYLE_FIXED)),
        detector(),
    );

    let err = cycle.run(&repo()).await.unwrap_err();
    assert!(matches!(err, BotError::PersistenceConflict { .. }), "got {err}");
    let state = store.load(&repo()).await.unwrap().unwrap();
    assert!(state.is_suspended());
    assert_eq!(state.last_pr_status, None);
}

#[tokio::test]
async fn uninstall_suspends_and_reinstall_resumes_at_same_tier() {
    let h = harness();
    h.cycle.register_repository(&repo(), Some(42)).await.unwrap();
    h.generator.push_reply(STYLE_FIXED);
    let CycleOutcome::Proposed { pr, .. } = h.cycle.run(&repo()).await.unwrap() else {
        panic!("expected a proposal");
    };
    h.host.resolve(pr.number, true);
    h.cycle.observe_pull_request(&repo(), pr.number, true).await.unwrap();

    let suspended = h.cycle.suspend_installation(42).await.unwrap();
    assert_eq!(suspended, vec![repo()]);
    assert_eq!(h.cycle.run(&repo()).await.unwrap(), CycleOutcome::Suspended);
    // Already suspended: nothing to do
    assert!(h.cycle.suspend_installation(42).await.unwrap().is_empty());

    let resumed = h.cycle.register_repository(&repo(), Some(43)).await.unwrap();
    assert!(!resumed.is_suspended());
    assert_eq!(resumed.installation_id, Some(43));
    assert_eq!(resumed.last_pr_status, Some(ProposalStatus::Merged));

    h.generator.push_reply(SIMPLIFIED);
    let CycleOutcome::Proposed { tier, .. } = h.cycle.run(&repo()).await.unwrap() else {
        panic!("expected a proposal");
    };
    assert_eq!(tier, Tier::Simplification);
}
