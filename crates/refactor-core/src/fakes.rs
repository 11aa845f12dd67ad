//! In-process collaborator doubles for tests and offline runs.
//!
//! Each fake records the calls it receives and can be scripted to fail with
//! transient errors a fixed number of times.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::detector::StaticAnalyzer;
use crate::domain::{Analyzer, BotError, Finding, LineRange, RepoId, Result, Severity};
use crate::repo_config::Thresholds;
use crate::source_host::{ProposedChange, PullRequestRef, SourceHost};
use crate::suggestion::{SuggestionGenerator, SuggestionRequest};

fn poisoned() -> BotError {
    BotError::transient("fake", "mutex poisoned")
}

/// Decrement `counter` if positive. Returns whether a failure is due.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Source host operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    DefaultBranch,
    ListFiles,
    FetchFile,
    OpenPullRequest,
}

#[derive(Debug)]
struct HostRepo {
    default_branch: String,
    files: BTreeMap<String, String>,
}

/// A pull request recorded by [`ScriptedSourceHost`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedPullRequest {
    pub repo: RepoId,
    pub change: ProposedChange,
    pub pr: PullRequestRef,
    pub open: bool,
}

/// Scripted [`SourceHost`] backed by in-memory repositories.
#[derive(Debug)]
pub struct ScriptedSourceHost {
    repos: Mutex<HashMap<RepoId, HostRepo>>,
    opened: Mutex<Vec<OpenedPullRequest>>,
    failures: Mutex<HashMap<HostOp, u32>>,
    calls: Mutex<HashMap<HostOp, u32>>,
    next_number: AtomicU64,
}

impl Default for ScriptedSourceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSourceHost {
    pub fn new() -> Self {
        Self {
            repos: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            next_number: AtomicU64::new(1),
        }
    }

    /// Add or replace a file on the repository's default branch ("main").
    pub fn with_file(self, repo: &RepoId, path: &str, content: &str) -> Self {
        self.set_file(repo, path, content);
        self
    }

    pub fn set_file(&self, repo: &RepoId, path: &str, content: &str) {
        if let Ok(mut repos) = self.repos.lock() {
            let entry = repos.entry(repo.clone()).or_insert_with(|| HostRepo {
                default_branch: "main".to_string(),
                files: BTreeMap::new(),
            });
            entry.files.insert(path.to_string(), content.to_string());
        }
    }

    /// Make the next `count` calls of `op` fail with a transient error.
    pub fn fail_transient(&self, op: HostOp, count: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, count);
        }
    }

    pub fn calls(&self, op: HostOp) -> u32 {
        self.calls
            .lock()
            .map(|c| c.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Every PR opened so far, oldest first.
    pub fn opened(&self) -> Vec<OpenedPullRequest> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Mark PR `number` merged or closed. When merged, its file lands on
    /// the default branch.
    pub fn resolve(&self, number: u64, merged: bool) {
        let landed = match self.opened.lock() {
            Ok(mut opened) => opened
                .iter_mut()
                .find(|o| o.pr.number == number)
                .map(|o| {
                    o.open = false;
                    (o.repo.clone(), o.change.file.clone())
                }),
            Err(_) => None,
        };
        if let (true, Some((repo, file))) = (merged, landed) {
            self.set_file(&repo, &file.path, &file.content);
        }
    }

    fn enter(&self, op: HostOp) -> Result<()> {
        *self.calls.lock().map_err(|_| poisoned())?.entry(op).or_insert(0) += 1;
        let mut failures = self.failures.lock().map_err(|_| poisoned())?;
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BotError::transient("scripted-host", format!("{op:?} unavailable")));
            }
        }
        Ok(())
    }

    fn not_found(repo: &RepoId) -> BotError {
        BotError::External {
            service: "scripted-host".to_string(),
            status: 404,
            message: format!("unknown repository {repo}"),
        }
    }
}

#[async_trait]
impl SourceHost for ScriptedSourceHost {
    async fn default_branch(&self, repo: &RepoId) -> Result<String> {
        self.enter(HostOp::DefaultBranch)?;
        let repos = self.repos.lock().map_err(|_| poisoned())?;
        repos
            .get(repo)
            .map(|r| r.default_branch.clone())
            .ok_or_else(|| Self::not_found(repo))
    }

    async fn list_files(&self, repo: &RepoId, _branch: &str) -> Result<Vec<String>> {
        self.enter(HostOp::ListFiles)?;
        let repos = self.repos.lock().map_err(|_| poisoned())?;
        repos
            .get(repo)
            .map(|r| r.files.keys().cloned().collect())
            .ok_or_else(|| Self::not_found(repo))
    }

    async fn fetch_file(&self, repo: &RepoId, path: &str, _branch: &str) -> Result<Option<String>> {
        self.enter(HostOp::FetchFile)?;
        let repos = self.repos.lock().map_err(|_| poisoned())?;
        let r = repos.get(repo).ok_or_else(|| Self::not_found(repo))?;
        Ok(r.files.get(path).cloned())
    }

    async fn open_pull_request(
        &self,
        repo: &RepoId,
        change: &ProposedChange,
    ) -> Result<PullRequestRef> {
        self.enter(HostOp::OpenPullRequest)?;
        let mut opened = self.opened.lock().map_err(|_| poisoned())?;
        if let Some(existing) = opened
            .iter()
            .find(|o| o.open && &o.repo == repo && o.pr.head_branch == change.head_branch)
        {
            return Ok(existing.pr.clone());
        }
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let pr = PullRequestRef {
            number,
            url: format!("https://github.com/{repo}/pull/{number}"),
            head_branch: change.head_branch.clone(),
        };
        opened.push(OpenedPullRequest {
            repo: repo.clone(),
            change: change.clone(),
            pr: pr.clone(),
            open: true,
        });
        Ok(pr)
    }
}

/// How a [`ScriptedGenerator`] answers once its queue is empty.
#[derive(Debug, Clone)]
pub enum Fallback {
    /// Return the request content unchanged.
    Echo,
    /// Strip trailing whitespace and drop lines containing the marker.
    Cleanup { drop_marker: String },
    /// Return this text.
    Fixed(String),
}

/// Scripted [`SuggestionGenerator`].
#[derive(Debug)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    fallback: Fallback,
    transient_failures: AtomicU32,
    requests: Mutex<Vec<SuggestionRequest>>,
}

impl ScriptedGenerator {
    pub fn new(fallback: Fallback) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback,
            transient_failures: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Removes trailing whitespace and any line containing `marker`.
    pub fn cleanup(marker: &str) -> Self {
        Self::new(Fallback::Cleanup {
            drop_marker: marker.to_string(),
        })
    }

    pub fn echo() -> Self {
        Self::new(Fallback::Echo)
    }

    pub fn fixed(text: &str) -> Self {
        Self::new(Fallback::Fixed(text.to_string()))
    }

    /// Queue a reply used before the fallback.
    pub fn push_reply(&self, text: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(text.to_string());
        }
    }

    pub fn fail_transient(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Requests received, including ones that failed.
    pub fn requests(&self) -> Vec<SuggestionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SuggestionGenerator for ScriptedGenerator {
    async fn generate(&self, request: &SuggestionRequest) -> Result<String> {
        self.requests
            .lock()
            .map_err(|_| poisoned())?
            .push(request.clone());
        if take_failure(&self.transient_failures) {
            return Err(BotError::transient("scripted-generator", "model overloaded"));
        }
        if let Some(reply) = self.replies.lock().map_err(|_| poisoned())?.pop_front() {
            return Ok(reply);
        }
        Ok(match &self.fallback {
            Fallback::Echo => request.content.clone(),
            Fallback::Fixed(text) => text.clone(),
            Fallback::Cleanup { drop_marker } => request
                .content
                .lines()
                .filter(|l| !l.contains(drop_marker.as_str()))
                .map(|l| format!("{}\n", l.trim_end()))
                .collect(),
        })
    }
}

/// [`StaticAnalyzer`] that derives findings from file content.
///
/// Each `(needle, rule)` pair reports `rule` on every line containing
/// `needle`. Trailing whitespace is always reported as `W291`.
#[derive(Debug, Clone, Default)]
pub struct PatternAnalyzer {
    patterns: Vec<(String, String)>,
}

impl PatternAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, needle: &str, rule: &str) -> Self {
        self.patterns.push((needle.to_string(), rule.to_string()));
        self
    }
}

#[async_trait]
impl StaticAnalyzer for PatternAnalyzer {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn analyze(
        &self,
        path: &str,
        source: &str,
        _thresholds: &Thresholds,
    ) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        for (idx, line) in source.lines().enumerate() {
            let line_no = idx as u32 + 1;
            let mut report = |rule: &str, message: &str| {
                findings.push(Finding {
                    file_path: path.to_string(),
                    rule_id: rule.to_string(),
                    severity: Severity::Warning,
                    line_range: LineRange::single(line_no),
                    message: message.to_string(),
                    analyzer: Analyzer::Flake8,
                    symbol: None,
                    metric: None,
                });
            };
            if line != line.trim_end() {
                report("W291", "trailing whitespace");
            }
            for (needle, rule) in &self.patterns {
                if line.contains(needle.as_str()) {
                    report(rule, needle);
                }
            }
        }
        Ok(findings)
    }
}
