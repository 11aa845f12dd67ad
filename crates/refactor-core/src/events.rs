//! Webhook events that drive the bot.
//!
//! Payloads are parsed into typed structs. Only the fields the bot acts on
//! are declared; everything else GitHub sends is ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{BotError, RepoId, Result};

/// A webhook notification reduced to what the bot needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BotEvent {
    /// App installed, or repositories added to an installation.
    InstallationCreated {
        installation_id: u64,
        repositories: Vec<RepoId>,
    },
    /// App uninstalled.
    InstallationDeleted { installation_id: u64 },
    PullRequestClosed {
        repo: RepoId,
        number: u64,
        merged: bool,
    },
    /// Push to the default branch.
    ScanRequested { repo: RepoId },
    Ignored { name: String, action: Option<String> },
}

#[derive(Debug, Deserialize)]
struct InstallationRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryWithBranch {
    full_name: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    action: String,
    installation: InstallationRef,
    #[serde(default)]
    repositories: Vec<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositoriesPayload {
    action: String,
    installation: InstallationRef,
    #[serde(default)]
    repositories_added: Vec<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    number: u64,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    pull_request: PullRequestBody,
    repository: RepositoryRef,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: RepositoryWithBranch,
}

fn decode<T: DeserializeOwned>(name: &str, payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| BotError::InvalidEvent(format!("{name}: {e}")))
}

fn repo_ids(repos: Vec<RepositoryRef>) -> Vec<RepoId> {
    repos.into_iter().map(|r| RepoId::new(r.full_name)).collect()
}

impl BotEvent {
    /// Parse an `X-GitHub-Event` name and its JSON payload.
    pub fn parse(name: &str, payload: &Value) -> Result<BotEvent> {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string);
        let ignored = || BotEvent::Ignored {
            name: name.to_string(),
            action: action.clone(),
        };

        let event = match name {
            "installation" => {
                let p: InstallationPayload = decode(name, payload)?;
                match p.action.as_str() {
                    "created" | "unsuspend" => BotEvent::InstallationCreated {
                        installation_id: p.installation.id,
                        repositories: repo_ids(p.repositories),
                    },
                    "deleted" | "suspend" => BotEvent::InstallationDeleted {
                        installation_id: p.installation.id,
                    },
                    _ => ignored(),
                }
            }
            "installation_repositories" => {
                let p: InstallationRepositoriesPayload = decode(name, payload)?;
                if p.action == "added" {
                    BotEvent::InstallationCreated {
                        installation_id: p.installation.id,
                        repositories: repo_ids(p.repositories_added),
                    }
                } else {
                    ignored()
                }
            }
            "pull_request" => {
                if action.as_deref() != Some("closed") {
                    return Ok(ignored());
                }
                let p: PullRequestPayload = decode(name, payload)?;
                BotEvent::PullRequestClosed {
                    repo: RepoId::new(p.repository.full_name),
                    number: p.pull_request.number,
                    merged: p.pull_request.merged,
                }
            }
            "push" => {
                let p: PushPayload = decode(name, payload)?;
                let default_ref = format!("refs/heads/{}", p.repository.default_branch);
                if p.git_ref == default_ref {
                    BotEvent::ScanRequested {
                        repo: RepoId::new(p.repository.full_name),
                    }
                } else {
                    ignored()
                }
            }
            _ => ignored(),
        };
        Ok(event)
    }

    /// Repositories whose state this event touches. Installation deletion
    /// is resolved against the store instead.
    pub fn repositories(&self) -> Vec<RepoId> {
        match self {
            BotEvent::InstallationCreated { repositories, .. } => repositories.clone(),
            BotEvent::PullRequestClosed { repo, .. } | BotEvent::ScanRequested { repo } => {
                vec![repo.clone()]
            }
            BotEvent::InstallationDeleted { .. } | BotEvent::Ignored { .. } => Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BotEvent::InstallationCreated { .. } => "installation_created",
            BotEvent::InstallationDeleted { .. } => "installation_deleted",
            BotEvent::PullRequestClosed { .. } => "pull_request_closed",
            BotEvent::ScanRequested { .. } => "scan_requested",
            BotEvent::Ignored { .. } => "ignored",
        }
    }
}
