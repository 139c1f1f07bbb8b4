//! Buildkite integration: build metadata, annotations and pipeline upload.
//!
//! Writes go through the `buildkite-agent` binary available inside a job.
//! Reading the previous build's metadata needs the GraphQL API and an API
//! token.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lockstep_core::{CommandRunner, Invocation};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{ReleaseError, Result};

pub const DEFAULT_GRAPHQL_URL: &str = "https://graphql.buildkite.com/v1";

/// Environment variable holding the GraphQL API token.
pub const ENV_BUILDKITE_API_TOKEN: &str = "BUILDKITE_API_TOKEN";

const AGENT: &str = "buildkite-agent";

/// Annotation context, so reruns replace the previous annotation.
pub const ANNOTATION_CONTEXT: &str = "lockstep-commits";

const LAST_BUILD_QUERY: &str = r#"query LastBuild($organization: ID!, $pipeline: String!, $branch: [String!]) {
  organization(slug: $organization) {
    pipelines(first: 1, search: $pipeline) {
      edges {
        node {
          builds(branch: $branch, state: [PASSED, FAILED], first: 1) {
            edges {
              node {
                commit
                metaData {
                  edges { node { key value } }
                }
              }
            }
          }
        }
      }
    }
  }
}"#;

/// Key/value metadata attached to CI builds.
#[async_trait]
pub trait BuildMetadata: Send + Sync {
    /// Attach `key = value` to the current build.
    async fn record(&self, key: &str, value: &str) -> Result<()>;

    /// Metadata of the last finished build, empty when there is none.
    async fn previous_build(&self) -> Result<BTreeMap<String, String>>;
}

/// Receives human-readable build annotations.
#[async_trait]
pub trait AnnotationSink: Send + Sync {
    async fn annotate(&self, markdown: &str) -> Result<()>;
}

/// Buildkite client for one pipeline and branch.
pub struct BuildkiteClient {
    http: reqwest::Client,
    graphql_url: String,
    token: String,
    organization: String,
    pipeline: String,
    branch: String,
    runner: Arc<dyn CommandRunner>,
    cwd: PathBuf,
}

impl BuildkiteClient {
    pub fn new(
        token: impl Into<String>,
        organization: impl Into<String>,
        pipeline: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lockstep/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            token: token.into(),
            organization: organization.into(),
            pipeline: pipeline.into(),
            branch: "master".to_string(),
            runner,
            cwd: PathBuf::from("."),
        })
    }

    /// Client using `BUILDKITE_API_TOKEN`.
    pub fn from_env(
        organization: impl Into<String>,
        pipeline: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let token = std::env::var(ENV_BUILDKITE_API_TOKEN)
            .map_err(|_| ReleaseError::Config(format!("{ENV_BUILDKITE_API_TOKEN} is not set")))?;
        Self::new(token, organization, pipeline, runner)
    }

    pub fn with_graphql_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_url = url.into();
        self
    }

    /// Branch whose builds count as "previous".
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Working directory for `buildkite-agent` invocations.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    async fn agent<'a, I>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        run_agent(self.runner.as_ref(), &self.cwd, args).await
    }
}

/// Upload a generated pipeline file to the running build.
pub async fn upload_pipeline(runner: &dyn CommandRunner, cwd: &Path, file: &Path) -> Result<()> {
    let file = file.display().to_string();
    info!(file = %file, "Uploading pipeline");
    run_agent(runner, cwd, ["pipeline", "upload", file.as_str()]).await
}

async fn run_agent<'a, I>(runner: &dyn CommandRunner, cwd: &Path, args: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let invocation = Invocation::new(AGENT, cwd).args(args);
    let output = runner.run(&invocation).await?;
    if output.success() {
        Ok(())
    } else {
        Err(ReleaseError::Command {
            command: invocation.to_string(),
            detail: output.tail(10),
        })
    }
}

#[derive(Deserialize)]
struct Edges<T> {
    edges: Vec<Edge<T>>,
}

#[derive(Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<QueryData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct QueryData {
    organization: Option<Organization>,
}

#[derive(Deserialize)]
struct Organization {
    pipelines: Edges<Pipeline>,
}

#[derive(Deserialize)]
struct Pipeline {
    builds: Edges<Build>,
}

#[derive(Deserialize)]
struct Build {
    #[serde(rename = "metaData")]
    metadata: Edges<MetadataEntry>,
}

#[derive(Deserialize)]
struct MetadataEntry {
    key: String,
    value: String,
}

#[async_trait]
impl BuildMetadata for BuildkiteClient {
    async fn record(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, value, "Recording build metadata");
        self.agent(["meta-data", "set", key, value]).await
    }

    async fn previous_build(&self) -> Result<BTreeMap<String, String>> {
        let body = json!({
            "query": LAST_BUILD_QUERY,
            "variables": {
                "organization": self.organization,
                "pipeline": self.pipeline,
                "branch": [self.branch],
            },
        });
        let response = self
            .http
            .post(&self.graphql_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ReleaseError::Buildkite(format!("{status}: {message}")));
        }

        let parsed: GraphqlResponse = response.json().await?;
        if !parsed.errors.is_empty() {
            let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
            return Err(ReleaseError::Buildkite(messages.join("; ")));
        }

        let build = parsed
            .data
            .and_then(|d| d.organization)
            .and_then(|o| o.pipelines.edges.into_iter().next())
            .and_then(|p| p.node.builds.edges.into_iter().next());
        let Some(build) = build else {
            debug!(pipeline = %self.pipeline, branch = %self.branch, "No previous build");
            return Ok(BTreeMap::new());
        };

        Ok(build
            .node
            .metadata
            .edges
            .into_iter()
            .map(|e| (e.node.key, e.node.value))
            .collect())
    }
}

#[async_trait]
impl AnnotationSink for BuildkiteClient {
    async fn annotate(&self, markdown: &str) -> Result<()> {
        self.agent([
            "annotate",
            markdown,
            "--style",
            "info",
            "--context",
            ANNOTATION_CONTEXT,
        ])
        .await
    }
}
