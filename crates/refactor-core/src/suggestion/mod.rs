//! Suggestion generation: prompt building, the generator seam, and the
//! guard that decides whether a generated patch may become a PR.

pub mod diff;
pub mod openai;
pub mod target;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Finding, RepoId, Result, Tier};

pub use diff::changed_lines;
pub use openai::{OpenAiConfig, OpenAiGenerator};
pub use target::{score_finding, select_target, Target};

/// Lines of context shown around each finding in the prompt.
pub const CONTEXT_LINES: u32 = 5;

pub const SYSTEM_PROMPT: &str = "You are a code refactoring expert.";

/// Input for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionRequest {
    pub repo: RepoId,
    pub file_path: String,
    pub content: String,
    pub findings: Vec<Finding>,
    pub tier: Tier,
}

/// Produces the full rewritten file for a request.
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    async fn generate(&self, request: &SuggestionRequest) -> Result<String>;
}

fn tier_instruction(tier: Tier) -> &'static str {
    match tier {
        Tier::Style => {
            "Only fix whitespace, indentation, line length and other cosmetic issues. \
             Do not change behavior, names or structure."
        }
        Tier::Simplification => {
            "Fix the listed issues with local simplifications such as removing unused \
             imports and variables or correcting comparisons. Keep functions and their \
             signatures intact."
        }
        Tier::Restructuring => {
            "Reduce complexity and improve maintainability of the listed code. You may \
             extract helper functions, but public names and behavior must not change."
        }
    }
}

/// Numbered source excerpt around `finding`, clamped to the file.
fn context_excerpt(lines: &[&str], finding: &Finding) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let last = lines.len() as u32;
    let start = finding.line_range.start.saturating_sub(CONTEXT_LINES).max(1).min(last);
    let end = finding
        .line_range
        .end
        .saturating_add(CONTEXT_LINES)
        .min(last);
    (start..=end)
        .map(|n| format!("{n:>5} | {}", lines[(n - 1) as usize]))
        .collect::<Vec<_>>()
        .join("\n")
}

/// User message for the generation call.
pub fn build_prompt(request: &SuggestionRequest) -> String {
    let lines: Vec<&str> = request.content.lines().collect();
    let mut prompt = format!(
        "You are a Python expert. Fix the following issues in `{}`.\n{}\n\nIssues:\n",
        request.file_path,
        tier_instruction(request.tier)
    );

    for (i, finding) in request.findings.iter().enumerate() {
        let symbol = finding
            .symbol
            .as_deref()
            .map(|s| format!(" in `{s}`"))
            .unwrap_or_default();
        prompt.push_str(&format!(
            "\n{}. {} at {}{}: {}\n```python\n{}\n```\n",
            i + 1,
            finding.rule_id,
            finding.line_range,
            symbol,
            finding.message,
            context_excerpt(&lines, finding)
        ));
    }

    prompt.push_str(&format!(
        "\nOriginal file:\n```python\n{}\n```\n\n\
         Return only the complete updated file without any explanations or markdown formatting.",
        request.content
    ));
    prompt
}

/// Remove a surrounding markdown fence (```` ```python ... ``` ````) if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body_start) = rest.find('\n') else {
        return trimmed;
    };
    let body = &rest[body_start + 1..];
    match body.trim_end().strip_suffix("```") {
        Some(inner) => inner,
        None => body,
    }
}

/// CRLF and lone CR to LF.
pub fn unify_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// CRLF/CR to LF, strip trailing whitespace per line, single final newline.
pub fn normalize_code(text: &str) -> String {
    let unified = unify_line_endings(text);
    let mut out = unified
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed_len = out.trim_end_matches('\n').len();
    out.truncate(trimmed_len);
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Verdict on a generated patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchVerdict {
    /// Generated content equals the original.
    NoChange,
    /// More lines changed than the repository allows.
    TooLarge { changed: usize, limit: usize },
    Accepted { content: String, changed: usize },
}

/// Clean the raw generator output and check it against `max_diff_lines`.
///
/// The original is compared with line endings unified only, so patches
/// that just remove trailing whitespace or blank lines count as changes.
/// A reply that repeats the original verbatim is `NoChange`.
pub fn guard_patch(original: &str, raw: &str, max_diff_lines: usize) -> PatchVerdict {
    let baseline = unify_line_endings(original);
    if unify_line_endings(raw) == baseline {
        return PatchVerdict::NoChange;
    }
    let candidate = normalize_code(strip_code_fences(raw));
    if candidate.trim().is_empty() {
        return PatchVerdict::NoChange;
    }
    let changed = changed_lines(&baseline, &candidate);
    if changed == 0 {
        return PatchVerdict::NoChange;
    }
    if changed > max_diff_lines {
        return PatchVerdict::TooLarge {
            changed,
            limit: max_diff_lines,
        };
    }
    PatchVerdict::Accepted {
        content: candidate,
        changed,
    }
}
