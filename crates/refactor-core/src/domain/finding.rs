//! Findings produced by static analysis and their rule classification.

use serde::{Deserialize, Serialize};

use refactor_state::Tier;

/// Ordered severity: `info < warning < error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// The tool that produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analyzer {
    Flake8,
    Radon,
}

impl Analyzer {
    pub fn as_str(self) -> &'static str {
        match self {
            Analyzer::Flake8 => "flake8",
            Analyzer::Radon => "radon",
        }
    }
}

/// 1-indexed, inclusive line span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        let start = start.max(1);
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    pub fn line_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "L{}", self.start)
        } else {
            write!(f, "L{}-L{}", self.start, self.end)
        }
    }
}

/// One detected issue in one file. Never persisted past a scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub file_path: String,
    pub rule_id: String,
    pub severity: Severity,
    pub line_range: LineRange,
    pub message: String,
    pub analyzer: Analyzer,
    /// Function or method name for complexity findings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Complexity score or maintainability index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
}

impl Finding {
    pub fn category(&self) -> RefactorCategory {
        classify_rule(&self.rule_id)
    }

    pub fn tier(&self) -> Tier {
        self.category().tier()
    }
}

/// Rule family, which fixes the tier a finding becomes eligible at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefactorCategory {
    /// Whitespace, indentation, line length, naming-free cosmetics.
    Style,
    /// Unused names, comparison idioms, comprehension rewrites.
    Simplification,
    /// Complexity and maintainability work that moves code around.
    Restructuring,
}

impl RefactorCategory {
    pub fn tier(self) -> Tier {
        match self {
            RefactorCategory::Style => Tier::Style,
            RefactorCategory::Simplification => Tier::Simplification,
            RefactorCategory::Restructuring => Tier::Restructuring,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RefactorCategory::Style => "style",
            RefactorCategory::Simplification => "simplification",
            RefactorCategory::Restructuring => "restructuring",
        }
    }
}

/// pycodestyle codes that change behavior when fixed (`== None`, `== True`,
/// `type(x) == y`, bare `except`).
const SEMANTIC_E_CODES: [&str; 4] = ["E711", "E712", "E721", "E722"];

/// Map a rule identifier to its category.
///
/// Unknown identifiers land in `Restructuring` so they are only proposed
/// once a repository has accepted the most aggressive tier.
pub fn classify_rule(rule_id: &str) -> RefactorCategory {
    let rule = rule_id.trim();
    if rule.starts_with("radon.") || rule == "C901" {
        return RefactorCategory::Restructuring;
    }
    if SEMANTIC_E_CODES.contains(&rule) {
        return RefactorCategory::Simplification;
    }

    let mut chars = rule.chars();
    let family = chars.next();
    let digits = chars.as_str();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return RefactorCategory::Restructuring;
    }
    let group = digits.chars().next();

    match (family, group) {
        (Some('W'), _) => RefactorCategory::Style,
        (Some('E'), Some('1'..='5' | '7')) => RefactorCategory::Style,
        (Some('F'), _) => RefactorCategory::Simplification,
        (Some('C'), Some('4')) => RefactorCategory::Simplification,
        _ => RefactorCategory::Restructuring,
    }
}
