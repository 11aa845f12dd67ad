//! refactor-botd: reads webhook envelopes from stdin, one JSON object per
//! line (`{"event": "<X-GitHub-Event>", "payload": {...}}`), dispatches
//! them and writes one JSON report per event to stdout as it completes.

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn, Level};

use refactor_core::metrics::METRICS;
use refactor_core::{
    BotEvent, Dispatcher, EventReport, GitHubClient, IssueDetector, OpenAiGenerator,
    RefactorCycle, RetryPolicy, SurrealStateStore,
};

#[derive(Parser)]
#[command(name = "refactor-botd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "refactor-bot event daemon", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    payload: serde_json::Value,
}

#[derive(Debug, Default, PartialEq)]
struct ServeSummary {
    dispatched: usize,
    rejected: usize,
    failed_repos: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    refactor_core::telemetry::init_tracing(args.json, level);

    let retry = RetryPolicy::from_env();
    let store = SurrealStateStore::from_env()
        .await
        .context("Failed to connect to refactor-bot state store")?;
    let host = GitHubClient::from_env(retry.call_timeout).context("GitHub client")?;
    let generator =
        OpenAiGenerator::from_env(retry.call_timeout).context("suggestion generator")?;
    let cycle = RefactorCycle::new(
        Arc::new(store),
        Arc::new(host),
        Arc::new(generator),
        IssueDetector::with_default_tools(retry.call_timeout),
    )
    .with_retry_policy(retry);
    let dispatcher = Dispatcher::new(Arc::new(cycle));

    info!("refactor-botd started; reading events from stdin");
    let summary = serve(
        &dispatcher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;
    info!(
        dispatched = summary.dispatched,
        rejected = summary.rejected,
        failed_repos = summary.failed_repos,
        "input closed; all events handled"
    );
    METRICS.flush();
    Ok(())
}

/// Dispatch every envelope read from `input` and write each report to
/// `output`. Returns once the input is exhausted and every report is out.
async fn serve<R, W>(dispatcher: &Dispatcher, input: R, mut output: W) -> Result<ServeSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut pending = FuturesUnordered::new();
    let mut summary = ServeSummary::default();
    let mut input_open = true;

    while input_open || !pending.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("Failed to read event stream")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match parse_envelope(&line) {
                        Ok(event) => {
                            summary.dispatched += 1;
                            pending.push(dispatcher.submit(event));
                        }
                        Err(e) => {
                            summary.rejected += 1;
                            warn!(error = %format!("{e:#}"), "rejected event envelope");
                        }
                    },
                    None => input_open = false,
                }
            }
            Some(report) = pending.next(), if !pending.is_empty() => {
                summary.failed_repos += write_report(&mut output, &report).await?;
            }
        }
    }
    output.flush().await?;
    Ok(summary)
}

fn parse_envelope(line: &str) -> Result<BotEvent> {
    let envelope: Envelope = serde_json::from_str(line).context("malformed envelope")?;
    BotEvent::parse(&envelope.event, &envelope.payload)
        .context(format!("unrecognised {} payload", envelope.event))
}

/// Returns the number of repositories that failed.
async fn write_report<W: AsyncWrite + Unpin>(output: &mut W, report: &EventReport) -> Result<usize> {
    let failed = report.results.iter().filter(|r| r.is_error()).count();
    for result in report.results.iter().filter(|r| r.is_error()) {
        warn!(event = %report.event, repo = %result.repo, error = ?result.error, "repository failed");
    }
    let mut line = serde_json::to_vec(report)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    Ok(failed)
}
