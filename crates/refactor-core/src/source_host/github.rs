//! GitHub REST API client.
//!
//! PR creation follows the git data API: base ref, head ref, blob, tree,
//! commit, ref update, then the pull request itself.
//!
//! Each method makes single attempts. Retryable statuses come back as
//! [`BotError::TransientExternal`] and the cycle decides whether to repeat.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::{ProposedChange, PullRequestRef, SourceHost};
use crate::domain::{BotError, RepoId, Result};
use crate::retry::{retry_decision_for_status, status_error, transport_error, RetryDecision};

const SERVICE: &str = "github";
const API_VERSION: &str = "2022-11-28";

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Connection settings for the GitHub API.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// REST root (default: "https://api.github.com")
    pub api_url: String,
    /// Installation or personal access token
    pub token: String,
    pub user_agent: String,
}

impl GitHubConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            user_agent: format!("refactor-bot/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - GITHUB_TOKEN (required)
    /// - GITHUB_API_URL (optional, default: "https://api.github.com")
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .map_err(|_| BotError::FatalConfig("GITHUB_TOKEN not set".to_string()))?;
        let mut config = Self::new(token);
        if let Ok(url) = std::env::var("GITHUB_API_URL") {
            config.api_url = url;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TreeListing {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct Sha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    tree: Sha,
}

#[derive(Debug, Deserialize)]
struct PullBody {
    number: u64,
    html_url: String,
}

/// GitHub implementation of [`SourceHost`].
#[derive(Clone)]
pub struct GitHubClient {
    config: GitHubConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_url", &self.config.api_url)
            .finish()
    }
}

impl GitHubClient {
    /// `timeout` bounds each HTTP request.
    pub fn new(config: GitHubConfig, timeout: Duration) -> Result<Self> {
        Url::parse(&config.api_url)
            .map_err(|e| BotError::FatalConfig(format!("invalid GITHUB_API_URL: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| BotError::FatalConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, http })
    }

    pub fn from_env(timeout: Duration) -> Result<Self> {
        Self::new(GitHubConfig::from_env()?, timeout)
    }

    /// `{api_url}/repos/{owner}/{name}/{tail...}` with each segment escaped.
    fn repo_url(&self, repo: &RepoId, tail: &[&str]) -> Result<Url> {
        let (owner, name) = repo
            .owner_and_name()
            .ok_or_else(|| BotError::InvalidEvent(format!("malformed repository id: {repo}")))?;
        let mut url = Url::parse(&self.config.api_url)
            .map_err(|e| BotError::FatalConfig(format!("invalid GITHUB_API_URL: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BotError::FatalConfig("GITHUB_API_URL cannot be a base".to_string()))?;
            segments.pop_if_empty().push("repos").push(owner).push(name);
            for part in tail.iter().flat_map(|t| t.split('/')) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    /// Send one request. Retryable statuses, rate limiting and transport
    /// failures are transient errors; any other status is returned with its
    /// body for the caller to interpret.
    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        if retry_decision_for_status(status) == RetryDecision::Retryable
            || is_rate_limited(status, &text)
        {
            return Err(BotError::transient(
                SERVICE,
                format!("{operation}: status {status}"),
            ));
        }
        debug!(operation, %status, "github call");
        Ok((status, text))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T> {
        let (status, text) = self.send(operation, method, url, &[], body).await?;
        parse_success(status, &text)
    }

    async fn find_open_pull(
        &self,
        repo: &RepoId,
        head_branch: &str,
    ) -> Result<Option<PullRequestRef>> {
        let (owner, _) = repo
            .owner_and_name()
            .ok_or_else(|| BotError::InvalidEvent(format!("malformed repository id: {repo}")))?;
        let head = format!("{owner}:{head_branch}");
        let url = self.repo_url(repo, &["pulls"])?;
        let (status, text) = self
            .send(
                "github.list_pulls",
                Method::GET,
                url,
                &[("head", head.as_str()), ("state", "open")],
                None,
            )
            .await?;
        let pulls: Vec<PullBody> = parse_success(status, &text)?;
        Ok(pulls.into_iter().next().map(|p| PullRequestRef {
            number: p.number,
            url: p.html_url,
            head_branch: head_branch.to_string(),
        }))
    }
}

fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    status == StatusCode::FORBIDDEN && body.to_ascii_lowercase().contains("rate limit")
}

fn parse_success<T: DeserializeOwned>(status: StatusCode, text: &str) -> Result<T> {
    if !status.is_success() {
        return Err(status_error(SERVICE, status, text));
    }
    Ok(serde_json::from_str(text)?)
}

/// GitHub returns base64 wrapped at 60 columns.
///
/// Files GitHub will not inline (encoding "none", sent for blobs over
/// 1 MB) and files that are not UTF-8 yield `Ok(None)`: they cannot be
/// analyzed, but they must not stop the rest of the repository.
pub(crate) fn decode_content(content: &str, encoding: &str) -> Result<Option<String>> {
    if !encoding.is_empty() && encoding != "base64" {
        return Ok(None);
    }
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| BotError::External {
            service: SERVICE.to_string(),
            status: 200,
            message: format!("invalid base64 content: {e}"),
        })?;
    Ok(String::from_utf8(bytes).ok())
}

#[async_trait]
impl SourceHost for GitHubClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn default_branch(&self, repo: &RepoId) -> Result<String> {
        let url = self.repo_url(repo, &[])?;
        let info: RepoInfo = self.call("github.repo", Method::GET, url, None).await?;
        Ok(info.default_branch)
    }

    #[instrument(skip(self), fields(repo = %repo))]
    async fn list_files(&self, repo: &RepoId, branch: &str) -> Result<Vec<String>> {
        let url = self.repo_url(repo, &["git", "trees", branch])?;
        let (status, text) = self
            .send(
                "github.tree",
                Method::GET,
                url,
                &[("recursive", "1")],
                None,
            )
            .await?;
        let listing: TreeListing = parse_success(status, &text)?;
        if listing.truncated {
            warn!(repo = %repo, "tree listing truncated by GitHub; scanning partial tree");
        }
        let files: Vec<String> = listing
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| e.path)
            .collect();
        debug!(count = files.len(), "tree listed");
        Ok(files)
    }

    async fn fetch_file(&self, repo: &RepoId, path: &str, branch: &str) -> Result<Option<String>> {
        let url = self.repo_url(repo, &["contents", path])?;
        let (status, text) = self
            .send(
                "github.contents",
                Method::GET,
                url,
                &[("ref", branch)],
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ContentBody = parse_success(status, &text)?;
        let decoded = decode_content(&body.content, &body.encoding)?;
        if decoded.is_none() {
            warn!(
                path,
                encoding = %body.encoding,
                "skipping file that is too large or not UTF-8"
            );
        }
        Ok(decoded)
    }

    #[instrument(skip(self, change), fields(repo = %repo, head = %change.head_branch))]
    async fn open_pull_request(
        &self,
        repo: &RepoId,
        change: &ProposedChange,
    ) -> Result<PullRequestRef> {
        // 1. Base branch head
        let url = self.repo_url(repo, &["git", "ref", "heads", &change.base_branch])?;
        let base: GitRef = self.call("github.base_ref", Method::GET, url, None).await?;
        let base_sha = base.object.sha;

        // 2. Head branch; reused when a previous attempt already created it
        let url = self.repo_url(repo, &["git", "refs"])?;
        let (status, text) = self
            .send(
                "github.create_ref",
                Method::POST,
                url,
                &[],
                Some(json!({
                    "ref": format!("refs/heads/{}", change.head_branch),
                    "sha": base_sha,
                })),
            )
            .await?;
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            debug!("head branch already exists; reusing");
        } else if !status.is_success() {
            return Err(status_error(SERVICE, status, &text));
        }

        // 3. Blob
        let url = self.repo_url(repo, &["git", "blobs"])?;
        let blob: Sha = self
            .call(
                "github.create_blob",
                Method::POST,
                url,
                Some(json!({ "content": change.file.content, "encoding": "utf-8" })),
            )
            .await?;

        // 4. Base tree
        let url = self.repo_url(repo, &["git", "commits", &base_sha])?;
        let base_commit: CommitBody = self.call("github.base_commit", Method::GET, url, None).await?;

        // 5. Tree
        let url = self.repo_url(repo, &["git", "trees"])?;
        let tree: Sha = self
            .call(
                "github.create_tree",
                Method::POST,
                url,
                Some(json!({
                    "base_tree": base_commit.tree.sha,
                    "tree": [{
                        "path": change.file.path,
                        "mode": "100644",
                        "type": "blob",
                        "sha": blob.sha,
                    }],
                })),
            )
            .await?;

        // 6. Commit
        let url = self.repo_url(repo, &["git", "commits"])?;
        let commit: Sha = self
            .call(
                "github.create_commit",
                Method::POST,
                url,
                Some(json!({
                    "message": change.commit_message,
                    "tree": tree.sha,
                    "parents": [base_sha],
                })),
            )
            .await?;

        // 7. Point the head branch at the commit
        let url = self.repo_url(repo, &["git", "refs", "heads", &change.head_branch])?;
        let _: Value = self
            .call(
                "github.update_ref",
                Method::PATCH,
                url,
                Some(json!({ "sha": commit.sha, "force": true })),
            )
            .await?;

        // 8. Pull request; an existing open one for this head is returned
        let url = self.repo_url(repo, &["pulls"])?;
        let (status, text) = self
            .send(
                "github.create_pull",
                Method::POST,
                url,
                &[],
                Some(json!({
                    "title": change.title,
                    "head": change.head_branch,
                    "base": change.base_branch,
                    "body": change.body,
                })),
            )
            .await?;

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            if let Some(existing) = self.find_open_pull(repo, &change.head_branch).await? {
                info!(number = existing.number, "pull request already open for head branch");
                return Ok(existing);
            }
        }
        let pull: PullBody = parse_success(status, &text)?;
        Ok(PullRequestRef {
            number: pull.number,
            url: pull.html_url,
            head_branch: change.head_branch.clone(),
        })
    }
}
