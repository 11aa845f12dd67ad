//! flake8 (pycodestyle + pyflakes + mccabe) analyzer.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{log_tool_stderr, run_tool, write_temp_source, StaticAnalyzer};
use crate::domain::{Analyzer, BotError, Finding, LineRange, Result, Severity};
use crate::repo_config::Thresholds;

const PROGRAM: &str = "flake8";

/// `path:line:col: CODE message`
fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<path>.+?):(?P<line>\d+):(?P<col>\d+):\s+(?P<code>[A-Z]+\d+)\s+(?P<msg>.*)$")
            .expect("static flake8 pattern compiles")
    })
}

/// Severity by rule family: pyflakes errors are real bugs, pycodestyle and
/// mccabe are warnings, everything else is informational.
pub fn severity_for(code: &str) -> Severity {
    match code.chars().next() {
        Some('F') => Severity::Error,
        Some('E') | Some('C') => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Parse flake8 default-format output. Lines that do not match are skipped.
/// Findings are reported against `path`, not the temp file flake8 saw.
pub fn parse_output(path: &str, stdout: &str) -> Vec<Finding> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = line_pattern().captures(line.trim_end())?;
            let line_no: u32 = caps["line"].parse().ok()?;
            let code = caps["code"].to_string();
            Some(Finding {
                file_path: path.to_string(),
                severity: severity_for(&code),
                rule_id: code,
                line_range: LineRange::single(line_no),
                message: caps["msg"].trim().to_string(),
                analyzer: Analyzer::Flake8,
                symbol: None,
                metric: None,
            })
        })
        .collect()
}

/// Runs `flake8` on a temp copy of the file.
#[derive(Debug, Clone)]
pub struct Flake8Analyzer {
    timeout: Duration,
}

impl Flake8Analyzer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StaticAnalyzer for Flake8Analyzer {
    fn name(&self) -> &'static str {
        PROGRAM
    }

    async fn analyze(
        &self,
        path: &str,
        source: &str,
        thresholds: &Thresholds,
    ) -> Result<Vec<Finding>> {
        let file = write_temp_source(source)?;
        let tmp_path = file.path().to_string_lossy().to_string();
        let max_complexity = thresholds.complexity.to_string();

        let output = run_tool(
            PROGRAM,
            &["--max-complexity", &max_complexity, &tmp_path],
            self.timeout,
        )
        .await?;

        // 0 = clean, 1 = findings reported; anything else is a tool failure.
        if output.exit_code != 0 && output.exit_code != 1 {
            log_tool_stderr(PROGRAM, &output);
            return Err(BotError::FatalConfig(format!(
                "flake8 exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let findings = parse_output(path, &output.stdout);
        debug!(path, count = findings.len(), "flake8 findings parsed");
        Ok(findings)
    }
}
