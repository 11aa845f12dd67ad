//! Per-repository configuration read from `.refactor-bot.toml`.
//!
//! The file is optional. When present it must parse and validate, otherwise
//! the cycle is aborted with [`BotError::FatalConfig`] before any PR call.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::domain::{BotError, Finding, RefactorCategory, Result};

/// Location of the configuration file in the repository root.
pub const CONFIG_PATH: &str = ".refactor-bot.toml";

pub const DEFAULT_MAX_DIFF_LINES: usize = 50;
pub const DEFAULT_MAX_FINDINGS_PER_PR: usize = 10;
pub const DEFAULT_COMPLEXITY_THRESHOLD: u32 = 10;
pub const DEFAULT_MAINTAINABILITY_THRESHOLD: f64 = 50.0;

/// Which rule families may be proposed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryToggles {
    pub style: bool,
    pub simplification: bool,
    pub restructuring: bool,
}

impl Default for CategoryToggles {
    fn default() -> Self {
        Self {
            style: true,
            simplification: true,
            restructuring: true,
        }
    }
}

/// Analyzer thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Cyclomatic complexity above which a function is reported.
    pub complexity: u32,
    /// Maintainability index below which a file is reported.
    pub maintainability: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            complexity: DEFAULT_COMPLEXITY_THRESHOLD,
            maintainability: DEFAULT_MAINTAINABILITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepoConfig {
    /// Glob patterns of paths never scanned or patched.
    pub exclude: Vec<String>,
    /// Largest accepted patch, counted as added plus removed lines.
    pub max_diff_lines: usize,
    /// Most findings sent to the generator for one proposal.
    pub max_findings_per_pr: usize,
    pub categories: CategoryToggles,
    pub thresholds: Thresholds,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            max_diff_lines: DEFAULT_MAX_DIFF_LINES,
            max_findings_per_pr: DEFAULT_MAX_FINDINGS_PER_PR,
            categories: CategoryToggles::default(),
            thresholds: Thresholds::default(),
        }
    }
}

impl RepoConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: RepoConfig = toml::from_str(toml_str)
            .map_err(|e| BotError::FatalConfig(format!("{CONFIG_PATH}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the file contents if the file exists, defaults otherwise.
    pub fn from_optional(contents: Option<&str>) -> Result<Self> {
        match contents {
            Some(text) => Self::from_toml(text),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_diff_lines == 0 {
            return Err(invalid("max_diff_lines", "must be greater than 0"));
        }
        if self.max_findings_per_pr == 0 {
            return Err(invalid("max_findings_per_pr", "must be greater than 0"));
        }
        if self.thresholds.complexity == 0 {
            return Err(invalid("thresholds.complexity", "must be greater than 0"));
        }
        if !(0.0..=100.0).contains(&self.thresholds.maintainability) {
            return Err(invalid(
                "thresholds.maintainability",
                "must be between 0 and 100",
            ));
        }
        self.exclude_matcher()?;
        Ok(())
    }

    /// Compile the exclude globs.
    pub fn exclude_matcher(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            let glob = Glob::new(pattern).map_err(|e| {
                BotError::FatalConfig(format!("{CONFIG_PATH}: exclude pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| BotError::FatalConfig(format!("{CONFIG_PATH}: exclude: {e}")))
    }

    pub fn category_enabled(&self, category: RefactorCategory) -> bool {
        match category {
            RefactorCategory::Style => self.categories.style,
            RefactorCategory::Simplification => self.categories.simplification,
            RefactorCategory::Restructuring => self.categories.restructuring,
        }
    }

    /// Drop findings in disabled categories or excluded paths.
    pub fn retain_enabled(&self, findings: Vec<Finding>) -> Result<Vec<Finding>> {
        let excluded = self.exclude_matcher()?;
        Ok(findings
            .into_iter()
            .filter(|f| self.category_enabled(f.category()))
            .filter(|f| !excluded.is_match(&f.file_path))
            .collect())
    }
}

fn invalid(field: &str, message: &str) -> BotError {
    BotError::FatalConfig(format!("{CONFIG_PATH}: {field} {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Analyzer, LineRange, Severity};

    fn finding(path: &str, rule: &str) -> Finding {
        Finding {
            file_path: path.to_string(),
            rule_id: rule.to_string(),
            severity: Severity::Info,
            line_range: LineRange::single(1),
            message: String::new(),
            analyzer: Analyzer::Flake8,
            symbol: None,
            metric: None,
        }
    }

    #[test]
    fn test_absent_file_uses_defaults() {
        let cfg = RepoConfig::from_optional(None).unwrap();
        assert_eq!(cfg, RepoConfig::default());
        assert_eq!(cfg.max_diff_lines, 50);
        assert_eq!(cfg.max_findings_per_pr, 10);
        assert_eq!(cfg.thresholds.complexity, 10);
    }

    #[test]
    fn test_full_document_parses() {
        let cfg = RepoConfig::from_toml(
            r#"
            exclude = ["tests/**", "migrations/**"]
            max_diff_lines = 30
            max_findings_per_pr = 5

            [categories]
            style = true
            simplification = true
            restructuring = false

            [thresholds]
            complexity = 12
            maintainability = 40.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.exclude.len(), 2);
        assert_eq!(cfg.max_diff_lines, 30);
        assert!(!cfg.categories.restructuring);
        assert_eq!(cfg.thresholds.complexity, 12);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let cfg = RepoConfig::from_toml("[categories]\nstyle = false\n").unwrap();
        assert!(!cfg.categories.style);
        assert!(cfg.categories.simplification);
        assert_eq!(cfg.max_diff_lines, DEFAULT_MAX_DIFF_LINES);
    }

    #[test]
    fn test_malformed_toml_is_fatal() {
        let err = RepoConfig::from_toml("max_diff_lines = [").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let err = RepoConfig::from_toml("max_diff_line = 10").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        assert!(RepoConfig::from_toml("max_diff_lines = 0").is_err());
        assert!(RepoConfig::from_toml("[thresholds]\nmaintainability = 140.0").is_err());
        assert!(RepoConfig::from_toml("exclude = [\"a[\"]").is_err());
    }

    #[test]
    fn test_retain_enabled_filters_categories_and_paths() {
        let cfg = RepoConfig::from_toml(
            "exclude = [\"tests/**\"]\n[categories]\nsimplification = false\n",
        )
        .unwrap();
        let kept = cfg
            .retain_enabled(vec![
                finding("app/a.py", "W291"),
                finding("app/a.py", "F401"),
                finding("tests/test_a.py", "W291"),
                finding("app/b.py", "C901"),
            ])
            .unwrap();
        let rules: Vec<(&str, &str)> = kept
            .iter()
            .map(|f| (f.file_path.as_str(), f.rule_id.as_str()))
            .collect();
        assert_eq!(rules, vec![("app/a.py", "W291"), ("app/b.py", "C901")]);
    }
}
