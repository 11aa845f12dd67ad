//! Issue detection: runs static analysis tools over Python sources and
//! normalizes their output into [`Finding`]s.
//!
//! Parsing is kept in pure functions (`flake8::parse_output`,
//! `radon::parse_cc`, `radon::parse_mi`) so it is testable without the
//! tools installed. Tool invocation goes through [`run_tool`], which bounds
//! every process by a timeout.

pub mod flake8;
pub mod radon;

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{BotError, Finding, Result};
use crate::repo_config::{RepoConfig, Thresholds};

pub use flake8::Flake8Analyzer;
pub use radon::RadonAnalyzer;

/// Default upper bound on a single analyzer process.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A static analysis tool.
#[async_trait]
pub trait StaticAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Analyze one file. `path` is the repository-relative path reported in
    /// findings; `source` is the file content.
    async fn analyze(&self, path: &str, source: &str, thresholds: &Thresholds)
        -> Result<Vec<Finding>>;
}

/// Captured output of a finished tool process.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Run an external tool with a timeout.
///
/// A missing binary is a fatal operator error; a timeout is transient.
pub async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> Result<ToolOutput> {
    let start = Instant::now();

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BotError::FatalConfig(format!(
                "'{program}' is not installed or not on PATH"
            )),
            _ => BotError::Io(e),
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            BotError::transient(program, format!("timed out after {}s", timeout.as_secs()))
        })??;

    let duration_ms = start.elapsed().as_millis() as u64;
    debug!(program, duration_ms, status = ?output.status, "tool finished");

    Ok(ToolOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms,
    })
}

/// Write `source` to a fresh `.py` temp file. Removed when dropped.
pub(crate) fn write_temp_source(source: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("refactor-bot-")
        .suffix(".py")
        .tempfile()?;
    file.write_all(source.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Composes analyzers and applies repository configuration.
#[derive(Clone)]
pub struct IssueDetector {
    analyzers: Vec<Arc<dyn StaticAnalyzer>>,
}

impl IssueDetector {
    pub fn new(analyzers: Vec<Arc<dyn StaticAnalyzer>>) -> Self {
        Self { analyzers }
    }

    /// flake8 + radon, each bounded by `timeout`.
    pub fn with_default_tools(timeout: Duration) -> Self {
        Self::new(vec![
            Arc::new(Flake8Analyzer::new(timeout)),
            Arc::new(RadonAnalyzer::new(timeout)),
        ])
    }

    pub fn analyzer_names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    /// Python files not excluded by the repository configuration, sorted.
    pub fn candidate_paths(&self, paths: &[String], config: &RepoConfig) -> Result<Vec<String>> {
        let excluded = config.exclude_matcher()?;
        let mut candidates: Vec<String> = paths
            .iter()
            .filter(|p| p.ends_with(".py"))
            .filter(|p| !excluded.is_match(p.as_str()))
            .cloned()
            .collect();
        candidates.sort();
        candidates.dedup();
        Ok(candidates)
    }

    /// Run every analyzer over one file.
    pub async fn analyze_file(
        &self,
        path: &str,
        source: &str,
        config: &RepoConfig,
    ) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        for analyzer in &self.analyzers {
            let found = analyzer.analyze(path, source, &config.thresholds).await?;
            debug!(analyzer = analyzer.name(), path, count = found.len(), "file analyzed");
            findings.extend(found);
        }
        Ok(findings)
    }

    /// Analyze `(path, source)` pairs and return all findings sorted by path
    /// and line. Excluded and non-Python paths are skipped.
    pub async fn analyze_files(
        &self,
        files: &[(String, String)],
        config: &RepoConfig,
    ) -> Result<Vec<Finding>> {
        let paths: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();
        let candidates = self.candidate_paths(&paths, config)?;

        let mut findings = Vec::new();
        for (path, source) in files {
            if candidates.binary_search(path).is_err() {
                continue;
            }
            findings.extend(self.analyze_file(path, source, config).await?);
        }
        sort_findings(&mut findings);
        info!(files = candidates.len(), findings = findings.len(), "detection complete");
        Ok(findings)
    }
}

impl std::fmt::Debug for IssueDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueDetector")
            .field("analyzers", &self.analyzer_names())
            .finish()
    }
}

/// Stable ordering: path, first line, rule.
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then(a.line_range.start.cmp(&b.line_range.start))
            .then(a.rule_id.cmp(&b.rule_id))
    });
}

pub(crate) fn log_tool_stderr(program: &str, output: &ToolOutput) {
    if !output.stderr.trim().is_empty() {
        warn!(program, exit_code = output.exit_code, stderr = %output.stderr.trim(), "tool wrote to stderr");
    }
}
