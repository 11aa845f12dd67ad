//! refactor-bot operator CLI
//!
//! ## Commands
//!
//! - `scan`: run one scan-and-propose cycle for a repository
//! - `event`: feed a webhook payload through the dispatcher
//! - `state`: inspect persisted escalation records
//! - `detect`: run the static analyzers over a local checkout
//! - `plan`: preview the escalation decision for a findings file, offline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use walkdir::WalkDir;

use refactor_core::{
    escalation, BotEvent, CycleOutcome, Dispatcher, EscalationPlan, EventReport, Finding,
    GitHubClient, IssueDetector, OpenAiGenerator, RefactorCycle, RefactorStateStore, RepoConfig,
    RepoId, RepositoryRefactorState, RetryPolicy, SurrealStateStore, CONFIG_PATH,
};

#[derive(Parser)]
#[command(name = "refactor-bot")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental-escalation refactoring bot", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan cycle against a GitHub repository
    Scan {
        /// Repository full name (owner/name)
        #[arg(short, long, env = "REFACTOR_BOT_REPO")]
        repo: String,
    },

    /// Dispatch a webhook payload as if it had been delivered
    Event {
        /// Webhook event name (X-GitHub-Event)
        #[arg(short, long)]
        name: String,

        /// Path to the JSON payload
        #[arg(short, long)]
        payload: PathBuf,
    },

    /// Inspect persisted escalation state
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Run flake8 and radon over a local directory
    Detect {
        /// Checkout root (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Repository config (default: <path>/.refactor-bot.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Preview the tier and eligible findings without touching GitHub
    Plan {
        /// JSON array of findings (as printed by `detect`)
        #[arg(short, long)]
        findings: PathBuf,

        /// JSON state record (as printed by `state show`); fresh if omitted
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Repository config applied before planning
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Show the record of one repository
    Show {
        /// Repository full name (owner/name)
        repo: String,
    },

    /// List records, optionally for one installation
    List {
        #[arg(short, long)]
        installation: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    refactor_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Scan { repo } => {
            let cycle = build_cycle().await?;
            let outcome = cmd_scan(&cycle, &repo).await?;
            print_json(&outcome)
        }
        Commands::Event { name, payload } => {
            let cycle = build_cycle().await?;
            let dispatcher = Dispatcher::new(Arc::new(cycle));
            let report = cmd_event(&dispatcher, &name, &payload).await?;
            print_json(&report)
        }
        Commands::State { action } => {
            let store = open_store().await?;
            match action {
                StateAction::Show { repo } => match cmd_state_show(&store, &repo).await? {
                    Some(state) => print_json(&state),
                    None => {
                        println!("No state recorded for {repo}");
                        Ok(())
                    }
                },
                StateAction::List { installation } => {
                    let states = cmd_state_list(&store, installation).await?;
                    for state in &states {
                        println!("{}", state_line(state));
                    }
                    Ok(())
                }
            }
        }
        Commands::Detect { path, config } => {
            let detector = IssueDetector::with_default_tools(RetryPolicy::from_env().call_timeout);
            let findings = cmd_detect(&detector, &path, config.as_deref()).await?;
            print_json(&findings)
        }
        Commands::Plan {
            findings,
            state,
            config,
        } => {
            let plan = cmd_plan(&findings, state.as_deref(), config.as_deref())?;
            print_json(&plan)
        }
    }
}

async fn open_store() -> Result<SurrealStateStore> {
    SurrealStateStore::from_env()
        .await
        .context("Failed to connect to refactor-bot state store")
}

/// Wire the production collaborators from the environment.
async fn build_cycle() -> Result<RefactorCycle> {
    let retry = RetryPolicy::from_env();
    let store = open_store().await?;
    let host = GitHubClient::from_env(retry.call_timeout).context("GitHub client")?;
    let generator =
        OpenAiGenerator::from_env(retry.call_timeout).context("suggestion generator")?;
    let detector = IssueDetector::with_default_tools(retry.call_timeout);

    Ok(RefactorCycle::new(
        Arc::new(store),
        Arc::new(host),
        Arc::new(generator),
        detector,
    )
    .with_retry_policy(retry))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).context(format!("Failed to parse {} as JSON", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<RepoConfig> {
    let text = match path {
        Some(p) => Some(
            std::fs::read_to_string(p)
                .context(format!("Failed to read config {}", p.display()))?,
        ),
        None => None,
    };
    Ok(RepoConfig::from_optional(text.as_deref())?)
}

fn state_line(state: &RepositoryRefactorState) -> String {
    let status = state
        .last_pr_status
        .map(|s| format!("{s:?}").to_lowercase())
        .unwrap_or_else(|| "-".to_string());
    let pr = state
        .last_pr_number
        .map(|n| format!("#{n}"))
        .unwrap_or_else(|| "-".to_string());
    let suspended = if state.is_suspended() { " (suspended)" } else { "" };
    format!(
        "{:<40} tier {} {:<8} {:<6} v{}{}",
        state.repo_id,
        state.current_tier.rank(),
        status,
        pr,
        state.version,
        suspended
    )
}

/// Run one cycle for `repo`
async fn cmd_scan(cycle: &RefactorCycle, repo: &str) -> Result<CycleOutcome> {
    let repo = RepoId::new(repo);
    info!(repo = %repo, "running scan cycle");
    cycle
        .run(&repo)
        .await
        .context(format!("Scan cycle for {repo} failed"))
}

/// Parse a payload file and dispatch it
async fn cmd_event(dispatcher: &Dispatcher, name: &str, payload: &Path) -> Result<EventReport> {
    let payload: serde_json::Value = read_json_file(payload)?;
    let event = BotEvent::parse(name, &payload).context("Unrecognised event payload")?;
    Ok(dispatcher.handle(event).await)
}

async fn cmd_state_show(
    store: &dyn RefactorStateStore,
    repo: &str,
) -> Result<Option<RepositoryRefactorState>> {
    Ok(store.load(&RepoId::new(repo)).await?)
}

async fn cmd_state_list(
    store: &dyn RefactorStateStore,
    installation: Option<u64>,
) -> Result<Vec<RepositoryRefactorState>> {
    let states = match installation {
        Some(id) => store.list_by_installation(id).await?,
        None => store.list().await?,
    };
    Ok(states)
}

/// Analyze every Python file under `root`, paths relative to it.
async fn cmd_detect(
    detector: &IssueDetector,
    root: &Path,
    config: Option<&Path>,
) -> Result<Vec<Finding>> {
    let default_config = root.join(CONFIG_PATH);
    let config_path = match config {
        Some(p) => Some(p.to_path_buf()),
        None if default_config.is_file() => Some(default_config),
        None => None,
    };
    let config = load_config(config_path.as_deref())?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.context("Failed to walk checkout")?;
        let is_hidden = entry
            .path()
            .strip_prefix(root)
            .map(|rel| rel.components().any(|c| c.as_os_str().to_string_lossy().starts_with('.')))
            .unwrap_or(false);
        if !entry.file_type().is_file() || is_hidden {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("File outside checkout root")?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read_to_string(entry.path())
            .context(format!("Failed to read {}", entry.path().display()))?;
        files.push((rel, content));
    }

    info!(root = %root.display(), files = files.len(), "analyzing local checkout");
    let findings = detector.analyze_files(&files, &config).await?;
    Ok(config.retain_enabled(findings)?)
}

/// Offline escalation decision
fn cmd_plan(
    findings: &Path,
    state: Option<&Path>,
    config: Option<&Path>,
) -> Result<EscalationPlan> {
    let findings: Vec<Finding> = read_json_file(findings)?;
    let state: Option<RepositoryRefactorState> = match state {
        Some(p) => Some(read_json_file(p)?),
        None => None,
    };
    let config = load_config(config)?;
    let findings = config.retain_enabled(findings)?;
    Ok(escalation::plan(state.as_ref(), findings))
}
