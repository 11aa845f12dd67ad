//! Structured observability hooks for refactor cycle lifecycle events.
//!
//! This module provides:
//! - Cycle-scoped tracing spans via [`cycle_span`], attached to the cycle
//!   future with `tracing::Instrument`
//! - Emission functions for lifecycle events: cycle start/finish, PR opened,
//!   state transitions, retries
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use std::time::Duration;

use tracing::{info, warn};

/// Span tagging every event of one cycle with its id and repository.
///
/// # Example
///
/// ```ignore
/// cycle.run_inner(repo).instrument(cycle_span("cycle-1234", "acme/widgets")).await
/// ```
pub fn cycle_span(cycle_id: &str, repo: &str) -> tracing::Span {
    tracing::info_span!("refactor.cycle", cycle_id = %cycle_id, repo = %repo)
}

/// Emit event: cycle started.
pub fn emit_cycle_started(cycle_id: &str, repo: &str) {
    info!(event = "cycle.started", cycle_id = %cycle_id, repo = %repo);
}

/// Emit event: cycle finished with its outcome.
pub fn emit_cycle_finished(cycle_id: &str, repo: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "cycle.finished",
        cycle_id = %cycle_id,
        repo = %repo,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: cycle aborted by an error (warning level).
pub fn emit_cycle_failed(cycle_id: &str, repo: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cycle.failed", cycle_id = %cycle_id, repo = %repo, error = %error);
}

/// Emit event: suggestion PR opened.
pub fn emit_pr_opened(repo: &str, tier: u8, number: u64, url: &str) {
    info!(event = "pr.opened", repo = %repo, tier = tier, number = number, url = %url);
}

/// Emit event: persisted escalation state changed.
pub fn emit_state_transition(repo: &str, from: &str, to: &str, tier: u8) {
    info!(
        event = "state.transition",
        repo = %repo,
        from = %from,
        to = %to,
        tier = tier,
    );
}

/// Emit event: a collaborator call is about to be retried (warning level).
pub fn emit_retry_attempt(
    operation: &str,
    attempt: u32,
    max_attempts: u32,
    delay: Duration,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "retry.attempt",
        operation = %operation,
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay.as_millis() as u64,
        error = %error,
    );
}
