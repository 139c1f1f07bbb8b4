//! GitHub REST client for release pull requests and commit statuses.

use async_trait::async_trait;
use lockstep_core::PackageId;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ReleaseError, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Environment variable holding the API token.
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// Status context used for verification builds.
pub const VERIFICATION_CONTEXT: &str = "lockstep/release-verification";

/// A pull request to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

/// An opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub html_url: String,
}

/// Outcome of a verification build, as reported to the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Success,
    Failure,
}

impl VerificationState {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            VerificationState::Success
        } else {
            VerificationState::Failure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Success => "success",
            VerificationState::Failure => "failure",
        }
    }
}

/// A commit status to post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitStatus {
    pub state: VerificationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub description: String,
    pub context: String,
}

impl CommitStatus {
    pub fn verification(state: VerificationState, target_url: Option<String>) -> Self {
        Self {
            state,
            target_url,
            description: format!("Verification build resulted in {}", state.as_str()),
            context: VERIFICATION_CONTEXT.to_string(),
        }
    }
}

/// Code host operations the publish sequence needs.
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    async fn create_pull_request(
        &self,
        repo: &PackageId,
        spec: &PullRequestSpec,
    ) -> Result<PullRequestRef>;

    async fn is_merged(&self, repo: &PackageId, number: u64) -> Result<bool>;
}

/// One commit of a compared range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    /// First line of the commit message.
    pub headline: String,
}

/// Read access to commit history.
#[async_trait]
pub trait CommitHistory: Send + Sync {
    /// Commits reachable from `head` but not from `base`, oldest first.
    async fn compare(&self, repo: &PackageId, base: &str, head: &str)
        -> Result<Vec<CommitSummary>>;
}

/// Posts commit statuses.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn create_status(&self, repo: &PackageId, sha: &str, status: &CommitStatus)
        -> Result<()>;
}

/// Token-authenticated GitHub API client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, token)
    }

    /// Client against a different API root, such as GitHub Enterprise.
    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lockstep/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Client from `GITHUB_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var(ENV_GITHUB_TOKEN)
            .map_err(|_| ReleaseError::Config(format!("{ENV_GITHUB_TOKEN} is not set")))?;
        Self::new(token)
    }

    fn repo_url(&self, repo: &PackageId, tail: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.base_url, repo.owner, repo.name, tail)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
    }
}

#[derive(Deserialize)]
struct Comparison {
    commits: Vec<ComparedCommit>,
}

#[derive(Deserialize)]
struct ComparedCommit {
    sha: String,
    commit: CommitBody,
}

#[derive(Deserialize)]
struct CommitBody {
    message: String,
}

async fn api_error(response: reqwest::Response) -> ReleaseError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ReleaseError::Api { status, message }
}

#[async_trait]
impl ReleaseHost for GithubClient {
    async fn create_pull_request(
        &self,
        repo: &PackageId,
        spec: &PullRequestSpec,
    ) -> Result<PullRequestRef> {
        let url = self.repo_url(repo, "pulls");
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(spec)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let pull: PullRequestRef = response.json().await?;
        info!(repo = %repo, number = pull.number, url = %pull.html_url, "Opened pull request");
        Ok(pull)
    }

    async fn is_merged(&self, repo: &PackageId, number: u64) -> Result<bool> {
        let url = self.repo_url(repo, &format!("pulls/{number}/merge"));
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(api_error(response).await),
        }
    }
}

#[async_trait]
impl StatusReporter for GithubClient {
    async fn create_status(
        &self,
        repo: &PackageId,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("statuses/{sha}"));
        debug!(repo = %repo, sha, state = status.state.as_str(), "Posting commit status");
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(status)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl CommitHistory for GithubClient {
    async fn compare(
        &self,
        repo: &PackageId,
        base: &str,
        head: &str,
    ) -> Result<Vec<CommitSummary>> {
        let url = self.repo_url(repo, &format!("compare/{base}...{head}"));
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let comparison: Comparison = response.json().await?;
        Ok(comparison
            .commits
            .into_iter()
            .map(|c| CommitSummary {
                headline: c.commit.message.lines().next().unwrap_or_default().to_string(),
                sha: c.sha,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo() -> PackageId {
        "fusionjs/fusion-core".parse().unwrap()
    }

    #[test]
    fn test_verification_state_strings() {
        assert_eq!(VerificationState::from_passed(true).as_str(), "success");
        assert_eq!(VerificationState::from_passed(false).as_str(), "failure");
        let status = CommitStatus::verification(VerificationState::Failure, None);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failure");
        assert_eq!(json["context"], VERIFICATION_CONTEXT);
        assert!(json.get("target_url").is_none());
    }

    #[test]
    fn test_repo_url_trims_base() {
        let client = GithubClient::with_base_url("https://ghe.example.com/api/v3/", "t").unwrap();
        assert_eq!(
            client.repo_url(&repo(), "pulls"),
            "https://ghe.example.com/api/v3/repos/fusionjs/fusion-core/pulls"
        );
    }

    #[tokio::test]
    async fn test_create_pull_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/fusionjs/fusion-core/pulls"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "title": "Release v1.2.0",
                "head": "release/release-v1.2.0",
                "base": "master",
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "number": 42,
                "html_url": "https://github.com/fusionjs/fusion-core/pull/42",
                "id": 7,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(server.uri(), "secret").unwrap();
        let spec = PullRequestSpec {
            title: "Release v1.2.0".to_string(),
            body: "Created by lockstep.".to_string(),
            head: "release/release-v1.2.0".to_string(),
            base: "master".to_string(),
        };

        let pull = client.create_pull_request(&repo(), &spec).await.unwrap();
        assert_eq!(pull.number, 42);
        assert_eq!(pull.html_url, "https://github.com/fusionjs/fusion-core/pull/42");
    }

    #[tokio::test]
    async fn test_is_merged_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/fusionjs/fusion-core/pulls/42/merge"))
            .and(header("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/fusionjs/fusion-core/pulls/43/merge"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/fusionjs/fusion-core/pulls/44/merge"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(server.uri(), "t").unwrap();
        assert!(client.is_merged(&repo(), 42).await.unwrap());
        assert!(!client.is_merged(&repo(), 43).await.unwrap());
        assert!(matches!(
            client.is_merged(&repo(), 44).await.unwrap_err(),
            ReleaseError::Api { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn test_create_status_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/fusionjs/fusion-core/statuses/abc123"))
            .and(body_partial_json(json!({
                "state": "success",
                "context": VERIFICATION_CONTEXT,
                "target_url": "https://ci.example.com/builds/1",
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(server.uri(), "t").unwrap();
        let status = CommitStatus::verification(
            VerificationState::Success,
            Some("https://ci.example.com/builds/1".to_string()),
        );
        client.create_status(&repo(), "abc123", &status).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_api_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/fusionjs/fusion-core/statuses/abc123"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "bad sha"})),
            )
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(server.uri(), "t").unwrap();
        let status = CommitStatus::verification(VerificationState::Success, None);
        let err = client
            .create_status(&repo(), "abc123", &status)
            .await
            .unwrap_err();
        match err {
            ReleaseError::Api { status, message } => {
                assert_eq!(status, 422);
                assert!(message.contains("bad sha"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compare_returns_commit_headlines() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/fusionjs/fusion-core/compare/aaa...bbb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ahead",
                "commits": [
                    {"sha": "111", "commit": {"message": "Fix router\n\nLonger body"}},
                    {"sha": "222", "commit": {"message": "Bump deps"}},
                ],
            })))
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(server.uri(), "t").unwrap();
        let commits = client.compare(&repo(), "aaa", "bbb").await.unwrap();
        assert_eq!(
            commits,
            vec![
                CommitSummary {
                    sha: "111".to_string(),
                    headline: "Fix router".to_string(),
                },
                CommitSummary {
                    sha: "222".to_string(),
                    headline: "Bump deps".to_string(),
                },
            ]
        );
    }
}
