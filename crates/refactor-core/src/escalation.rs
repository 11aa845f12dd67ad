//! Incremental-escalation policy.
//!
//! The policy is a small finite-state model over the last proposal of a
//! repository:
//!
//! ```text
//!   no_history ──open(t)──▶ proposal_open ──merged──▶ proposal_merged
//!                              │                          │
//!                              └──closed──▶ proposal_closed
//!   proposal_merged / proposal_closed ──open(t)──▶ proposal_open
//! ```
//!
//! A merge advances the *next* proposal by one tier (capped at [`Tier::MAX`]).
//! A close without merge holds the tier. Everything here is pure; the cycle
//! orchestrator owns persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Finding, ProposalStatus, RepositoryRefactorState, Tier};

/// Where a repository sits in the proposal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    NoHistory,
    ProposalOpen,
    ProposalMerged,
    ProposalClosed,
}

impl ProposalState {
    pub fn of(state: Option<&RepositoryRefactorState>) -> Self {
        match state.and_then(|s| s.last_pr_status) {
            None => ProposalState::NoHistory,
            Some(ProposalStatus::Open) => ProposalState::ProposalOpen,
            Some(ProposalStatus::Merged) => ProposalState::ProposalMerged,
            Some(ProposalStatus::Closed) => ProposalState::ProposalClosed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalState::NoHistory => "no_history",
            ProposalState::ProposalOpen => "proposal_open",
            ProposalState::ProposalMerged => "proposal_merged",
            ProposalState::ProposalClosed => "proposal_closed",
        }
    }
}

/// The tier the next proposal for this repository should target.
pub fn tier_to_propose(state: Option<&RepositoryRefactorState>) -> Tier {
    let Some(state) = state else {
        return Tier::MIN;
    };
    match ProposalState::of(Some(state)) {
        ProposalState::NoHistory => state.current_tier,
        ProposalState::ProposalMerged => state.current_tier.next_capped(),
        ProposalState::ProposalOpen | ProposalState::ProposalClosed => state.current_tier,
    }
}

/// Decision for one scan: the tier and the findings eligible at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPlan {
    pub tier: Tier,
    pub proposal_state: ProposalState,
    pub findings: Vec<Finding>,
    pub rationale: String,
}

impl EscalationPlan {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Choose the tier and keep only findings whose rule maps to a tier at or
/// below it. Order of the surviving findings is preserved.
pub fn plan(state: Option<&RepositoryRefactorState>, findings: Vec<Finding>) -> EscalationPlan {
    let proposal_state = ProposalState::of(state);
    let tier = tier_to_propose(state);
    let scanned = findings.len();
    let findings: Vec<Finding> = findings.into_iter().filter(|f| f.tier() <= tier).collect();

    let rationale = match (proposal_state, state) {
        (ProposalState::NoHistory, _) => format!("no proposal history; starting at tier {tier}"),
        (ProposalState::ProposalMerged, Some(s)) if s.current_tier < tier => {
            format!("previous tier {} proposal merged; escalating to tier {tier}", s.current_tier)
        }
        (ProposalState::ProposalMerged, _) => {
            format!("previous proposal merged at the top tier; holding tier {tier}")
        }
        (ProposalState::ProposalClosed, _) => {
            format!("previous proposal closed without merge; holding tier {tier}")
        }
        (ProposalState::ProposalOpen, _) => {
            format!("previous proposal still open; holding tier {tier}")
        }
    };
    let rationale = format!(
        "{rationale} ({} of {scanned} findings eligible)",
        findings.len()
    );

    EscalationPlan {
        tier,
        proposal_state,
        findings,
        rationale,
    }
}

/// The record to commit after a proposal PR was opened at `tier`.
///
/// Tier advancement and PR bookkeeping land in the same value so they are
/// persisted by a single compare-and-set.
pub fn record_proposal(
    state: &RepositoryRefactorState,
    tier: Tier,
    pr_number: u64,
    pr_url: &str,
) -> RepositoryRefactorState {
    let mut next = state.clone();
    next.current_tier = tier.max(state.current_tier);
    next.last_pr_status = Some(ProposalStatus::Open);
    next.last_pr_number = Some(pr_number);
    next.last_pr_url = Some(pr_url.to_string());
    next.last_pr_merged_at = None;
    next
}

/// Result of applying a PR outcome notification to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeTransition {
    /// The outcome resolves the open proposal. Commit this record.
    Applied(RepositoryRefactorState),
    /// The notification is for a PR that is not the latest proposal.
    Stale,
    /// The latest proposal was already resolved.
    Duplicate,
}

/// Apply a merge/close notification for PR `number`.
pub fn apply_outcome(
    state: &RepositoryRefactorState,
    number: u64,
    merged: bool,
    at: DateTime<Utc>,
) -> OutcomeTransition {
    if state.last_pr_number != Some(number) {
        return OutcomeTransition::Stale;
    }
    match state.last_pr_status {
        Some(ProposalStatus::Open) => {
            let mut next = state.clone();
            if merged {
                next.last_pr_status = Some(ProposalStatus::Merged);
                next.last_pr_merged_at = Some(at);
            } else {
                next.last_pr_status = Some(ProposalStatus::Closed);
            }
            OutcomeTransition::Applied(next)
        }
        Some(ProposalStatus::Merged) | Some(ProposalStatus::Closed) => {
            OutcomeTransition::Duplicate
        }
        None => OutcomeTransition::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Analyzer, LineRange, RepoId, Severity};

    fn finding(rule: &str) -> Finding {
        Finding {
            file_path: "app/main.py".to_string(),
            rule_id: rule.to_string(),
            severity: Severity::Warning,
            line_range: LineRange::single(3),
            message: String::new(),
            analyzer: Analyzer::Flake8,
            symbol: None,
            metric: None,
        }
    }

    fn state(tier: Tier, status: Option<ProposalStatus>) -> RepositoryRefactorState {
        let mut s = RepositoryRefactorState::new(RepoId::new("acme/widgets"), None);
        s.current_tier = tier;
        s.last_pr_status = status;
        s.last_pr_number = status.map(|_| 11);
        s
    }

    #[test]
    fn test_no_state_starts_at_tier_zero() {
        assert_eq!(tier_to_propose(None), Tier::Style);
        let p = plan(None, vec![finding("W291"), finding("F401"), finding("C901")]);
        assert_eq!(p.tier, Tier::Style);
        assert_eq!(p.proposal_state, ProposalState::NoHistory);
        assert_eq!(p.findings.len(), 1);
        assert_eq!(p.findings[0].rule_id, "W291");
    }

    #[test]
    fn test_merged_tier_zero_escalates_and_keeps_lower_tiers() {
        let s = state(Tier::Style, Some(ProposalStatus::Merged));
        let p = plan(Some(&s), vec![finding("E225"), finding("F401")]);
        assert_eq!(p.tier, Tier::Simplification);
        assert_eq!(p.findings.len(), 2);
        assert!(p.rationale.contains("escalating"));
    }

    #[test]
    fn test_open_holds_tier() {
        let s = state(Tier::Simplification, Some(ProposalStatus::Open));
        assert_eq!(tier_to_propose(Some(&s)), Tier::Simplification);
    }

    #[test]
    fn test_closed_holds_tier() {
        let s = state(Tier::Simplification, Some(ProposalStatus::Closed));
        let p = plan(Some(&s), vec![finding("C901")]);
        assert_eq!(p.tier, Tier::Simplification);
        assert!(p.is_empty());
    }

    #[test]
    fn test_merged_at_max_tier_is_capped() {
        let s = state(Tier::Restructuring, Some(ProposalStatus::Merged));
        assert_eq!(tier_to_propose(Some(&s)), Tier::Restructuring);
    }

    #[test]
    fn test_registered_state_without_history_uses_stored_tier() {
        let s = state(Tier::Style, None);
        assert_eq!(tier_to_propose(Some(&s)), Tier::Style);
    }

    #[test]
    fn test_plan_preserves_finding_order() {
        let s = state(Tier::Simplification, Some(ProposalStatus::Merged));
        let rules = ["F841", "C901", "W291", "E711", "radon.cc", "E501"];
        let p = plan(Some(&s), rules.iter().map(|r| finding(r)).collect());
        let kept: Vec<&str> = p.findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(kept, vec!["F841", "C901", "W291", "E711", "radon.cc", "E501"]);
        assert_eq!(p.tier, Tier::Restructuring);
    }

    #[test]
    fn test_record_proposal_sets_open_and_tier() {
        let s = state(Tier::Style, Some(ProposalStatus::Merged));
        let next = record_proposal(&s, Tier::Simplification, 12, "https://x/pull/12");
        assert_eq!(next.current_tier, Tier::Simplification);
        assert_eq!(next.last_pr_status, Some(ProposalStatus::Open));
        assert_eq!(next.last_pr_number, Some(12));
        assert!(next.last_pr_merged_at.is_none());
    }

    #[test]
    fn test_record_proposal_never_regresses() {
        let s = state(Tier::Restructuring, Some(ProposalStatus::Closed));
        let next = record_proposal(&s, Tier::Style, 12, "u");
        assert_eq!(next.current_tier, Tier::Restructuring);
    }

    #[test]
    fn test_apply_outcome_merge_and_close() {
        let s = state(Tier::Style, Some(ProposalStatus::Open));
        let now = Utc::now();
        match apply_outcome(&s, 11, true, now) {
            OutcomeTransition::Applied(next) => {
                assert_eq!(next.last_pr_status, Some(ProposalStatus::Merged));
                assert_eq!(next.last_pr_merged_at, Some(now));
                assert_eq!(next.current_tier, Tier::Style);
            }
            other => panic!("unexpected {other:?}"),
        }
        match apply_outcome(&s, 11, false, now) {
            OutcomeTransition::Applied(next) => {
                assert_eq!(next.last_pr_status, Some(ProposalStatus::Closed));
                assert!(next.last_pr_merged_at.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_apply_outcome_stale_and_duplicate() {
        let open = state(Tier::Style, Some(ProposalStatus::Open));
        assert_eq!(
            apply_outcome(&open, 99, true, Utc::now()),
            OutcomeTransition::Stale
        );

        let merged = state(Tier::Style, Some(ProposalStatus::Merged));
        assert_eq!(
            apply_outcome(&merged, 11, true, Utc::now()),
            OutcomeTransition::Duplicate
        );

        let fresh = state(Tier::Style, None);
        assert_eq!(
            apply_outcome(&fresh, 11, true, Utc::now()),
            OutcomeTransition::Stale
        );
    }
}
