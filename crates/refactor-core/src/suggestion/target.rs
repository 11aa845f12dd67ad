//! Choose which file a proposal patches and which findings it addresses.

use std::collections::BTreeMap;

use crate::detector::radon::{complexity_rank, RULE_COMPLEXITY, RULE_MAINTAINABILITY};
use crate::domain::Finding;

/// The file picked for one proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub file_path: String,
    /// Highest score first, at most `max_findings_per_pr`.
    pub findings: Vec<Finding>,
    /// Sum of scores over every eligible finding in the file.
    pub score: f64,
}

fn rank_weight(rank: char) -> f64 {
    match rank {
        'A' => 1.0,
        'B' => 2.0,
        'C' => 3.0,
        'D' => 4.0,
        'E' => 5.0,
        _ => 6.0,
    }
}

fn family_weight(rule_id: &str) -> f64 {
    match rule_id.chars().next() {
        Some('F') => 3.0,
        Some('E') | Some('C') => 2.0,
        _ => 1.0,
    }
}

/// Urgency of one finding. Complexity dominates style noise.
pub fn score_finding(finding: &Finding) -> f64 {
    match finding.rule_id.as_str() {
        RULE_COMPLEXITY => {
            let complexity = finding.metric.unwrap_or(0.0).max(0.0);
            complexity * rank_weight(complexity_rank(complexity.round() as u32))
        }
        RULE_MAINTAINABILITY => (100.0 - finding.metric.unwrap_or(100.0)).max(0.0),
        rule => 10.0 * family_weight(rule),
    }
}

/// Group findings by file and pick the file with the highest aggregate
/// score. Ties go to the lexicographically first path.
pub fn select_target(findings: &[Finding], max_findings: usize) -> Option<Target> {
    let mut by_file: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in findings {
        by_file.entry(finding.file_path.as_str()).or_default().push(finding);
    }

    let (path, group, score) = by_file
        .into_iter()
        .map(|(path, group)| {
            let score: f64 = group.iter().map(|f| score_finding(f)).sum();
            (path, group, score)
        })
        .fold(None::<(&str, Vec<&Finding>, f64)>, |best, candidate| match best {
            Some(b) if b.2 >= candidate.2 => Some(b),
            _ => Some(candidate),
        })?;

    let mut ranked = group;
    // Stable sort keeps line order among equal scores
    ranked.sort_by(|a, b| score_finding(b).total_cmp(&score_finding(a)));
    ranked.truncate(max_findings.max(1));

    Some(Target {
        file_path: path.to_string(),
        findings: ranked.into_iter().cloned().collect(),
        score,
    })
}
