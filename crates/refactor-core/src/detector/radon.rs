//! radon analyzer: cyclomatic complexity (`radon cc -j`) and
//! maintainability index (`radon mi -j`).

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{log_tool_stderr, run_tool, write_temp_source, StaticAnalyzer};
use crate::domain::{Analyzer, BotError, Finding, LineRange, Result, Severity};
use crate::repo_config::Thresholds;

const PROGRAM: &str = "radon";

pub const RULE_COMPLEXITY: &str = "radon.cc";
pub const RULE_MAINTAINABILITY: &str = "radon.mi";

/// One block of `radon cc -j` output.
#[derive(Debug, Clone, Deserialize)]
pub struct CcBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub lineno: u32,
    #[serde(default)]
    pub endline: Option<u32>,
    pub complexity: u32,
    #[serde(default)]
    pub rank: String,
    #[serde(default)]
    pub classname: Option<String>,
    #[serde(default)]
    pub methods: Vec<CcBlock>,
}

impl CcBlock {
    fn qualified_name(&self) -> String {
        match &self.classname {
            Some(class) => format!("{class}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CcFile {
    Blocks(Vec<CcBlock>),
    Failed { error: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MiFile {
    Scored {
        mi: f64,
        #[serde(default)]
        rank: String,
    },
    Failed {
        error: String,
    },
}

/// radon's letter rank for a complexity score.
pub fn complexity_rank(complexity: u32) -> char {
    match complexity {
        0..=5 => 'A',
        6..=10 => 'B',
        11..=20 => 'C',
        21..=30 => 'D',
        31..=40 => 'E',
        _ => 'F',
    }
}

/// Parse `radon cc -j` output into findings for functions and methods whose
/// complexity exceeds `threshold`. Class summary blocks are ignored; their
/// methods are reported individually.
pub fn parse_cc(path: &str, json: &str, threshold: u32) -> Result<Vec<Finding>> {
    let files: BTreeMap<String, CcFile> = serde_json::from_str(json)?;

    let mut seen = HashSet::new();
    let mut findings = Vec::new();
    for (_, file) in files {
        let blocks = match file {
            CcFile::Blocks(blocks) => blocks,
            CcFile::Failed { error } => {
                warn!(path, %error, "radon cc could not analyze file");
                continue;
            }
        };

        let mut pending: Vec<CcBlock> = blocks;
        while let Some(block) = pending.pop() {
            if block.kind == "class" {
                pending.extend(block.methods);
                continue;
            }
            if block.complexity <= threshold {
                continue;
            }
            let name = block.qualified_name();
            if !seen.insert((name.clone(), block.lineno)) {
                continue;
            }
            let rank = if block.rank.is_empty() {
                complexity_rank(block.complexity).to_string()
            } else {
                block.rank.clone()
            };
            findings.push(Finding {
                file_path: path.to_string(),
                rule_id: RULE_COMPLEXITY.to_string(),
                severity: Severity::Warning,
                line_range: LineRange::new(block.lineno, block.endline.unwrap_or(block.lineno)),
                message: format!(
                    "'{name}' has cyclomatic complexity {} (rank {rank}), above {threshold}",
                    block.complexity
                ),
                analyzer: Analyzer::Radon,
                symbol: Some(name),
                metric: Some(block.complexity as f64),
            });
        }
    }

    findings.sort_by_key(|f| f.line_range.start);
    Ok(findings)
}

/// Parse `radon mi -j` output into at most one whole-file finding when the
/// maintainability index is below `threshold`.
pub fn parse_mi(path: &str, json: &str, threshold: f64, line_count: u32) -> Result<Vec<Finding>> {
    let files: BTreeMap<String, MiFile> = serde_json::from_str(json)?;

    let mut findings = Vec::new();
    for (_, file) in files {
        match file {
            MiFile::Scored { mi, rank } if mi < threshold => findings.push(Finding {
                file_path: path.to_string(),
                rule_id: RULE_MAINTAINABILITY.to_string(),
                severity: Severity::Warning,
                line_range: LineRange::new(1, line_count),
                message: format!(
                    "maintainability index {mi:.1} (rank {rank}) is below {threshold:.1}"
                ),
                analyzer: Analyzer::Radon,
                symbol: None,
                metric: Some(mi),
            }),
            MiFile::Scored { .. } => {}
            MiFile::Failed { error } => {
                warn!(path, %error, "radon mi could not analyze file");
            }
        }
    }
    Ok(findings)
}

/// Runs `radon cc` and `radon mi` on a temp copy of the file.
#[derive(Debug, Clone)]
pub struct RadonAnalyzer {
    timeout: Duration,
}

impl RadonAnalyzer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, subcommand: &str, tmp_path: &str) -> Result<String> {
        let output = run_tool(PROGRAM, &[subcommand, "-j", tmp_path], self.timeout).await?;
        if output.exit_code != 0 {
            log_tool_stderr(PROGRAM, &output);
            return Err(BotError::FatalConfig(format!(
                "radon {subcommand} exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl StaticAnalyzer for RadonAnalyzer {
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

        let cc = self.run("cc", &tmp_path).await?;
        let mi = self.run("mi", &tmp_path).await?;

        let line_count = source.lines().count().max(1) as u32;
        let mut findings = parse_cc(path, &cc, thresholds.complexity)?;
        findings.extend(parse_mi(path, &mi, thresholds.maintainability, line_count)?);
        debug!(path, count = findings.len(), "radon findings parsed");
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CC_JSON: &str = r#"{
        "/tmp/refactor-bot-x.py": [
            {"type": "function", "name": "simple", "lineno": 1, "endline": 3,
             "complexity": 2, "rank": "A", "col_offset": 0, "closures": []},
            {"type": "function", "name": "tangled", "lineno": 5, "endline": 60,
             "complexity": 17, "rank": "C", "col_offset": 0, "closures": []},
            {"type": "class", "name": "Handler", "lineno": 62, "endline": 120,
             "complexity": 12, "rank": "C", "col_offset": 0,
             "methods": [
                {"type": "method", "name": "dispatch", "lineno": 63, "endline": 110,
                 "complexity": 23, "rank": "D", "classname": "Handler",
                 "col_offset": 4, "closures": []}
             ]},
            {"type": "method", "name": "dispatch", "lineno": 63, "endline": 110,
             "complexity": 23, "rank": "D", "classname": "Handler",
             "col_offset": 4, "closures": []}
        ]
    }"#;

    #[test]
    fn test_parse_cc_reports_blocks_over_threshold() {
        let findings = parse_cc("app/logic.py", CC_JSON, 10).unwrap();
        assert_eq!(findings.len(), 2);

        assert_eq!(findings[0].symbol.as_deref(), Some("tangled"));
        assert_eq!(findings[0].line_range, LineRange::new(5, 60));
        assert_eq!(findings[0].metric, Some(17.0));
        assert_eq!(findings[0].rule_id, RULE_COMPLEXITY);

        assert_eq!(findings[1].symbol.as_deref(), Some("Handler.dispatch"));
        assert!(findings[1].message.contains("rank D"));
    }

    #[test]
    fn test_parse_cc_threshold_is_exclusive() {
        let findings = parse_cc("a.py", CC_JSON, 23).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_parse_cc_error_entry_is_skipped() {
        let json = r#"{"/tmp/x.py": {"error": "invalid syntax (<unknown>, line 3)"}}"#;
        assert!(parse_cc("a.py", json, 10).unwrap().is_empty());
    }

    #[test]
    fn test_parse_cc_rejects_garbage() {
        assert!(parse_cc("a.py", "not json", 10).is_err());
    }

    #[test]
    fn test_parse_mi_below_threshold() {
        let json = r#"{"/tmp/x.py": {"mi": 38.25, "rank": "A"}}"#;
        let findings = parse_mi("app/logic.py", json, 50.0, 240).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, RULE_MAINTAINABILITY);
        assert_eq!(findings[0].line_range, LineRange::new(1, 240));
        assert_eq!(findings[0].metric, Some(38.25));
    }

    #[test]
    fn test_parse_mi_above_threshold() {
        let json = r#"{"/tmp/x.py": {"mi": 71.0, "rank": "A"}}"#;
        assert!(parse_mi("a.py", json, 50.0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_complexity_rank_bands() {
        assert_eq!(complexity_rank(1), 'A');
        assert_eq!(complexity_rank(10), 'B');
        assert_eq!(complexity_rank(11), 'C');
        assert_eq!(complexity_rank(25), 'D');
        assert_eq!(complexity_rank(40), 'E');
        assert_eq!(complexity_rank(41), 'F');
    }
}
