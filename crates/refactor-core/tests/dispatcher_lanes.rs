//! Event routing through per-repository lanes.

use std::sync::Arc;

use futures::future::join_all;
use refactor_core::fakes::{PatternAnalyzer, ScriptedGenerator, ScriptedSourceHost};
use refactor_core::{
    BotEvent, CycleOutcome, Dispatcher, IssueDetector, ProposalStatus, PullRequestObservation,
    RefactorCycle, RefactorStateStore, RepoAction, RepoId, Tier,
};
use refactor_state::fakes::MemoryStateStore;

const SOURCE: &str = "import os\nx = 1 \ny = 2\n";

fn setup(repos: &[&str]) -> (Dispatcher, Arc<ScriptedSourceHost>, Arc<MemoryStateStore>) {
    let mut host = ScriptedSourceHost::new();
    for name in repos {
        host = host.with_file(&RepoId::new(*name), "app/main.py", SOURCE);
    }
    let host = Arc::new(host);
    let store = Arc::new(MemoryStateStore::new());
    let detector = IssueDetector::new(vec![Arc::new(
        PatternAnalyzer::new().with_pattern("import os", "F401"),
    )]);
    let cycle = RefactorCycle::new(
        store.clone(),
        host.clone(),
        Arc::new(ScriptedGenerator::cleanup("import os")),
        detector,
    );
    (Dispatcher::new(Arc::new(cycle)), host, store)
}

/// Idle workers remove their lanes once they next get to run.
async fn lanes_drained(dispatcher: &Dispatcher) -> bool {
    for _ in 0..100 {
        if dispatcher.lane_count() == 0 {
            return true;
        }
        tokio::task::yield_now().await;
    }
    false
}

fn scanned(action: &Option<RepoAction>) -> &CycleOutcome {
    match action {
        Some(RepoAction::Scanned { outcome }) => outcome,
        other => panic!("expected a scan, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_scans_of_one_repository_open_a_single_pr() {
    let repo = RepoId::new("acme/widgets");
    let (dispatcher, host, _) = setup(&["acme/widgets"]);

    let pending: Vec<_> = (0..3)
        .map(|_| dispatcher.submit(BotEvent::ScanRequested { repo: repo.clone() }))
        .collect();
    let reports = join_all(pending).await;

    let outcomes: Vec<&CycleOutcome> = reports
        .iter()
        .map(|r| scanned(&r.results[0].action))
        .collect();
    assert!(matches!(outcomes[0], CycleOutcome::Proposed { tier: Tier::Style, .. }));
    for later in &outcomes[1..] {
        assert!(
            matches!(later, CycleOutcome::AwaitingReview { pr_number: Some(1) }),
            "got {later:?}"
        );
    }
    assert_eq!(host.opened().len(), 1);
    assert!(lanes_drained(&dispatcher).await);
}

#[tokio::test]
async fn installation_registers_and_scans_every_repository() {
    let (dispatcher, host, store) = setup(&["acme/one", "acme/two"]);

    let report = dispatcher
        .handle(BotEvent::InstallationCreated {
            installation_id: 11,
            repositories: vec![RepoId::new("acme/one"), RepoId::new("acme/two")],
        })
        .await;

    assert_eq!(report.event, "installation_created");
    assert_eq!(report.results.len(), 2);
    for result in &report.results {
        assert!(matches!(scanned(&result.action), CycleOutcome::Proposed { .. }));
    }
    assert_eq!(host.opened().len(), 2);
    assert_eq!(store.list_by_installation(11).await.unwrap().len(), 2);
    assert!(lanes_drained(&dispatcher).await);
}

#[tokio::test]
async fn merged_pr_triggers_the_next_cycle() {
    let repo = RepoId::new("acme/widgets");
    let (dispatcher, host, store) = setup(&["acme/widgets"]);

    let first = dispatcher
        .handle(BotEvent::ScanRequested { repo: repo.clone() })
        .await;
    let CycleOutcome::Proposed { pr, .. } = scanned(&first.results[0].action).clone() else {
        panic!("expected a proposal");
    };
    host.resolve(pr.number, true);

    let report = dispatcher
        .handle(BotEvent::PullRequestClosed {
            repo: repo.clone(),
            number: pr.number,
            merged: true,
        })
        .await;
    let Some(RepoAction::Observed {
        observation,
        next_cycle,
    }) = &report.results[0].action
    else {
        panic!("expected an observation, got {:?}", report.results[0]);
    };
    assert_eq!(
        observation,
        &PullRequestObservation::Applied {
            status: ProposalStatus::Merged,
            tier: Tier::Style
        }
    );
    // The merged cleanup removed every finding
    assert_eq!(
        next_cycle,
        &Some(CycleOutcome::NoEligibleFindings {
            tier: Tier::Simplification
        })
    );
    let state = store.load(&repo).await.unwrap().unwrap();
    assert_eq!(state.last_pr_status, Some(ProposalStatus::Merged));
}

#[tokio::test]
async fn closed_pr_does_not_trigger_a_cycle() {
    let repo = RepoId::new("acme/widgets");
    let (dispatcher, host, _) = setup(&["acme/widgets"]);
    dispatcher
        .handle(BotEvent::ScanRequested { repo: repo.clone() })
        .await;

    let report = dispatcher
        .handle(BotEvent::PullRequestClosed {
            repo,
            number: 1,
            merged: false,
        })
        .await;
    assert!(matches!(
        &report.results[0].action,
        Some(RepoAction::Observed { next_cycle: None, .. })
    ));
    assert_eq!(host.opened().len(), 1);
}

#[tokio::test]
async fn uninstall_suspends_the_installation_repositories() {
    let (dispatcher, _, store) = setup(&["acme/one", "acme/two"]);
    dispatcher
        .handle(BotEvent::InstallationCreated {
            installation_id: 5,
            repositories: vec![RepoId::new("acme/one"), RepoId::new("acme/two")],
        })
        .await;

    let report = dispatcher
        .handle(BotEvent::InstallationDeleted { installation_id: 5 })
        .await;
    assert_eq!(report.results.len(), 2);
    assert!(report
        .results
        .iter()
        .all(|r| r.action == Some(RepoAction::Suspended)));
    for state in store.list_by_installation(5).await.unwrap() {
        assert!(state.is_suspended());
    }

    let rescan = dispatcher
        .handle(BotEvent::ScanRequested {
            repo: RepoId::new("acme/one"),
        })
        .await;
    assert_eq!(scanned(&rescan.results[0].action), &CycleOutcome::Suspended);
}

#[tokio::test]
async fn uninstall_runs_after_work_already_queued_for_the_repository() {
    let repo = RepoId::new("acme/widgets");
    let (dispatcher, host, store) = setup(&["acme/widgets"]);
    dispatcher
        .handle(BotEvent::InstallationCreated {
            installation_id: 7,
            repositories: vec![repo.clone()],
        })
        .await;
    host.resolve(1, true);

    let closed = dispatcher.submit(BotEvent::PullRequestClosed {
        repo: repo.clone(),
        number: 1,
        merged: true,
    });
    assert_eq!(dispatcher.lane_count(), 1);
    let deleted = dispatcher.submit(BotEvent::InstallationDeleted { installation_id: 7 });
    let (closed, deleted) = tokio::join!(closed, deleted);

    // The merge and its follow-up cycle finished before the suspension
    let Some(RepoAction::Observed { next_cycle, .. }) = &closed.results[0].action else {
        panic!("expected an observation, got {:?}", closed.results[0]);
    };
    assert_eq!(
        next_cycle,
        &Some(CycleOutcome::NoEligibleFindings {
            tier: Tier::Simplification
        })
    );
    assert_eq!(deleted.results.len(), 1);
    assert_eq!(deleted.results[0].action, Some(RepoAction::Suspended));

    let state = store.load(&repo).await.unwrap().unwrap();
    assert!(state.is_suspended());
    assert_eq!(state.last_pr_status, Some(ProposalStatus::Merged));
    assert!(lanes_drained(&dispatcher).await);
}

#[tokio::test]
async fn idle_lane_is_recreated_for_the_next_event() {
    let repo = RepoId::new("acme/widgets");
    let (dispatcher, host, _) = setup(&["acme/widgets"]);

    dispatcher
        .handle(BotEvent::ScanRequested { repo: repo.clone() })
        .await;
    assert!(lanes_drained(&dispatcher).await);

    let again = dispatcher.handle(BotEvent::ScanRequested { repo }).await;
    assert!(matches!(
        scanned(&again.results[0].action),
        CycleOutcome::AwaitingReview { pr_number: Some(1) }
    ));
    assert_eq!(host.opened().len(), 1);
    assert!(lanes_drained(&dispatcher).await);
}
