//! Routes events to repositories.
//!
//! Each repository has a lane: an unbounded queue drained by one worker
//! task. Work for a repository is enqueued synchronously in
//! [`Dispatcher::submit`], so it runs to completion in arrival order, while
//! different repositories proceed concurrently. A worker that finds its
//! queue empty removes the lane and exits; the next event starts a new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cycle::{CycleOutcome, PullRequestObservation, RefactorCycle};
use crate::domain::{ProposalStatus, RepoId, Result};
use crate::events::BotEvent;

/// What happened to one repository while handling an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepoAction {
    Scanned {
        outcome: CycleOutcome,
    },
    Observed {
        observation: PullRequestObservation,
        /// Cycle triggered by a merge.
        next_cycle: Option<CycleOutcome>,
    },
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoResult {
    pub repo: RepoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RepoAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepoResult {
    fn from_result(repo: RepoId, result: Result<RepoAction>) -> Self {
        match result {
            Ok(action) => Self {
                repo,
                action: Some(action),
                error: None,
            },
            Err(e) => Self {
                repo,
                action: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-event report, one entry per repository touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub event: String,
    pub results: Vec<RepoResult>,
}

type Job = BoxFuture<'static, ()>;
type LaneMap = HashMap<RepoId, mpsc::UnboundedSender<Job>>;

/// Live lanes, shared with the workers so an idle worker can remove its own.
#[derive(Clone)]
struct Lanes {
    cycle: Arc<RefactorCycle>,
    map: Arc<Mutex<LaneMap>>,
}

impl Lanes {
    fn lock(&self) -> MutexGuard<'_, LaneMap> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `work` on the repository's lane.
    fn enqueue<F, Fut>(&self, repo: RepoId, work: F) -> PendingResult
    where
        F: FnOnce(Arc<RefactorCycle>, RepoId) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<RepoAction>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cycle = Arc::clone(&self.cycle);
        let job_repo = repo.clone();
        let job: Job = async move {
            let result = work(cycle, job_repo.clone()).await;
            // The submitter may have stopped waiting
            let _ = tx.send(RepoResult::from_result(job_repo, result));
        }
        .boxed();

        let mut lanes = self.lock();
        let job = match lanes.get(&repo) {
            Some(sender) => match sender.send(job) {
                Ok(()) => None,
                // Worker died mid-job; replace the lane
                Err(mpsc::error::SendError(job)) => Some(job),
            },
            None => Some(job),
        };
        if let Some(job) = job {
            let (sender, receiver) = mpsc::unbounded_channel();
            let _ = sender.send(job);
            lanes.insert(repo.clone(), sender);
            tokio::spawn(self.clone().drain(repo.clone(), receiver));
        }
        PendingResult { repo, rx }
    }

    /// Run queued jobs until the queue is empty, then drop the lane.
    /// Senders only push while holding the map lock, so checking for the
    /// next job under the same lock cannot miss one.
    async fn drain(self, repo: RepoId, mut rx: mpsc::UnboundedReceiver<Job>) {
        debug!(repo = %repo, "lane started");
        loop {
            let job = {
                let mut lanes = self.lock();
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        lanes.remove(&repo);
                        break;
                    }
                }
            };
            job.await;
        }
        debug!(repo = %repo, "lane idle; removed");
    }
}

pub struct Dispatcher {
    lanes: Lanes,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("lanes", &self.lane_count())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(cycle: Arc<RefactorCycle>) -> Self {
        Self {
            lanes: Lanes {
                cycle,
                map: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    /// Handle one event and wait for every repository it touches.
    pub async fn handle(&self, event: BotEvent) -> EventReport {
        self.submit(event).await
    }

    /// Enqueue the work for `event` now and return a future that resolves
    /// once it has run. Must be called from within a tokio runtime.
    ///
    /// An uninstall first lists the installation's repositories, then queues
    /// each suspension on that repository's lane behind any work already
    /// waiting there.
    pub fn submit(&self, event: BotEvent) -> BoxFuture<'static, EventReport> {
        let kind = event.kind().to_string();
        debug!(event = %kind, "dispatching");

        match event {
            BotEvent::InstallationCreated {
                installation_id,
                repositories,
            } => {
                let pending: Vec<_> = repositories
                    .into_iter()
                    .map(|repo| {
                        self.lanes.enqueue(repo, move |cycle, repo| async move {
                            cycle.register_repository(&repo, Some(installation_id)).await?;
                            let outcome = cycle.run(&repo).await?;
                            Ok(RepoAction::Scanned { outcome })
                        })
                    })
                    .collect();
                collect(kind, pending)
            }
            BotEvent::InstallationDeleted { installation_id } => {
                let lanes = self.lanes.clone();
                async move {
                    let repos = match lanes.cycle.installation_repositories(installation_id).await {
                        Ok(repos) => repos,
                        Err(e) => {
                            warn!(installation_id, error = %e, "failed to list installation");
                            return EventReport {
                                event: kind,
                                results: vec![RepoResult::from_result(
                                    RepoId::new(format!("installation/{installation_id}")),
                                    Err(e),
                                )],
                            };
                        }
                    };
                    let pending = repos
                        .into_iter()
                        .map(|repo| {
                            lanes.enqueue(repo, |cycle, repo| async move {
                                cycle.suspend_repository(&repo).await?;
                                Ok(RepoAction::Suspended)
                            })
                        })
                        .collect();
                    let report = collect(kind, pending).await;
                    info!(installation_id, repos = report.results.len(), "installation suspended");
                    report
                }
                .boxed()
            }
            BotEvent::PullRequestClosed {
                repo,
                number,
                merged,
            } => {
                let pending = self.lanes.enqueue(repo, move |cycle, repo| async move {
                    let observation = cycle.observe_pull_request(&repo, number, merged).await?;
                    let next_cycle = match observation {
                        PullRequestObservation::Applied {
                            status: ProposalStatus::Merged,
                            ..
                        } => Some(cycle.run(&repo).await?),
                        _ => None,
                    };
                    Ok(RepoAction::Observed {
                        observation,
                        next_cycle,
                    })
                });
                collect(kind, vec![pending])
            }
            BotEvent::ScanRequested { repo } => {
                let pending = self.lanes.enqueue(repo, |cycle, repo| async move {
                    let outcome = cycle.run(&repo).await?;
                    Ok(RepoAction::Scanned { outcome })
                });
                collect(kind, vec![pending])
            }
            BotEvent::Ignored { name, action } => {
                debug!(name = %name, action = ?action, "event ignored");
                async move {
                    EventReport {
                        event: kind,
                        results: Vec::new(),
                    }
                }
                .boxed()
            }
        }
    }

    /// Repositories with queued or running work.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

struct PendingResult {
    repo: RepoId,
    rx: oneshot::Receiver<RepoResult>,
}

fn collect(event: String, pending: Vec<PendingResult>) -> BoxFuture<'static, EventReport> {
    async move {
        let results = join_all(pending.into_iter().map(|p| async move {
            p.rx.await.unwrap_or_else(|_| RepoResult {
                repo: p.repo,
                action: None,
                error: Some("repository worker stopped before finishing".to_string()),
            })
        }))
        .await;
        EventReport { event, results }
    }
    .boxed()
}
