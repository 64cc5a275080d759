//! Commit Lookup Client: resolves `owner/name` + branch to the head commit id.

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use std::sync::LazyLock;
use std::time::Duration;

const USER_AGENT: &str = concat!("remote-pull-runner/", env!("CARGO_PKG_VERSION"));
/// Makes the commits endpoint answer with the bare sha.
const SHA_MEDIA_TYPE: &str = "application/vnd.github.sha";

static GITHUB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://|git@)?(?:www\.)?github\.com[/:]([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+?)(?:\.git)?/?$")
        .expect("static regex")
});
static OWNER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("static regex"));

/// Accepts `owner/name` or a GitHub URL and returns `owner/name`.
pub fn normalize_repo_name(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(caps) = GITHUB_URL.captures(input) {
        return Some(caps[1].to_string());
    }
    let bare = input.strip_suffix(".git").unwrap_or(input);
    OWNER_NAME.is_match(bare).then(|| bare.to_string())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommitLookupError {
    #[error("credential rejected for {repo}: {detail}")]
    Auth { repo: String, detail: String },
    #[error("{repo}@{branch} not found")]
    NotFound { repo: String, branch: String },
    #[error("rate limited while querying {repo}")]
    RateLimited { repo: String },
    #[error("network error while querying {repo}: {detail}")]
    Network { repo: String, detail: String },
}

#[async_trait]
pub trait CommitLookup: Send + Sync {
    async fn latest_commit(
        &self,
        repo: &str,
        branch: &str,
        credential: Option<&str>,
    ) -> Result<String, CommitLookupError>;
}

pub struct GithubClient {
    client: Client,
    api_base: String,
}

impl GithubClient {
    pub fn new(api_base: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn commit_url(&self, repo: &str, branch: &str) -> String {
        format!(
            "{}/repos/{}/commits/{}",
            self.api_base,
            repo,
            urlencoding::encode(branch)
        )
    }
}

#[async_trait]
impl CommitLookup for GithubClient {
    async fn latest_commit(
        &self,
        repo: &str,
        branch: &str,
        credential: Option<&str>,
    ) -> Result<String, CommitLookupError> {
        let mut req = self
            .client
            .get(self.commit_url(repo, branch))
            .header(reqwest::header::ACCEPT, SHA_MEDIA_TYPE)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = credential {
            req = req.bearer_auth(token);
        }

        let res = req.send().await.map_err(|e| CommitLookupError::Network {
            repo: repo.to_string(),
            detail: e.to_string(),
        })?;

        let status = res.status();
        let rate_exhausted = res
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
        let body = res.text().await.map_err(|e| CommitLookupError::Network {
            repo: repo.to_string(),
            detail: e.to_string(),
        })?;

        if status.is_success() {
            let sha = body.trim();
            if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CommitLookupError::Network {
                    repo: repo.to_string(),
                    detail: format!("unexpected response body: {:.80}", sha),
                });
            }
            return Ok(sha.to_string());
        }

        Err(classify_status(repo, branch, status, rate_exhausted, &body))
    }
}

fn classify_status(
    repo: &str,
    branch: &str,
    status: StatusCode,
    rate_exhausted: bool,
    body: &str,
) -> CommitLookupError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CommitLookupError::RateLimited {
            repo: repo.to_string(),
        },
        StatusCode::FORBIDDEN if rate_exhausted => CommitLookupError::RateLimited {
            repo: repo.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CommitLookupError::Auth {
            repo: repo.to_string(),
            detail: format!("HTTP {}", status.as_u16()),
        },
        // GitHub answers 422 for a branch that does not resolve to a commit.
        StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => CommitLookupError::NotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        },
        _ => CommitLookupError::Network {
            repo: repo.to_string(),
            detail: format!("HTTP {}: {:.200}", status.as_u16(), body.trim()),
        },
    }
}
