//! Commit annotations for verification builds.
//!
//! Every run records each repository's head commit as build metadata under
//! [`metadata_key`]. The annotation lists, per repository, the commits
//! between the previous finished build's recorded head and the current one.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use lockstep_core::manifest::package_dir;
use lockstep_core::{CommandRunner, Invocation, PackageId};
use tracing::{debug, info, warn};

use crate::buildkite::{AnnotationSink, BuildMetadata};
use crate::error::{ReleaseError, Result};
use crate::github::{CommitHistory, CommitSummary};

pub const COMMITS_HEADER: &str = "## Commits since last verification build";
pub const NO_NEW_COMMITS: &str =
    "**No new commits found between this build and last verification build.**";
pub const RANGE_UNAVAILABLE: &str = "Unable to load commits for revision range.";

pub const DEFAULT_WEB_URL: &str = "https://github.com";

/// Build metadata key holding a repository's head commit.
pub fn metadata_key(id: &PackageId) -> String {
    format!("sha-{}-{}", id.owner, id.name)
}

/// Commits of one repository since the previous build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoChanges {
    pub repo: PackageId,
    pub base: String,
    pub head: String,
    /// `None` when the range could not be loaded.
    pub commits: Option<Vec<CommitSummary>>,
}

/// Render the annotation markdown. Repositories appear in the given order.
pub fn render_annotation(changes: &[RepoChanges], web_url: &str) -> String {
    if changes.is_empty() {
        return NO_NEW_COMMITS.to_string();
    }
    let web_url = web_url.trim_end_matches('/');
    let mut out = String::from(COMMITS_HEADER);
    out.push('\n');
    for change in changes {
        let repo_url = format!("{web_url}/{}/{}", change.repo.owner, change.repo.name);
        let _ = write!(
            out,
            "\n### [{}]({repo_url}/compare/{}...{})\n\n",
            change.repo, change.base, change.head
        );
        match &change.commits {
            Some(commits) => {
                for commit in commits {
                    let _ = writeln!(
                        out,
                        "* [{}]({repo_url}/commit/{})",
                        commit.headline, commit.sha
                    );
                }
            }
            None => {
                out.push_str(RANGE_UNAVAILABLE);
                out.push('\n');
            }
        }
    }
    out
}

/// Records head commits and posts the "commits since last build" annotation.
pub struct CommitAnnotator {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    history: Arc<dyn CommitHistory>,
    metadata: Arc<dyn BuildMetadata>,
    sink: Arc<dyn AnnotationSink>,
    web_url: String,
}

impl CommitAnnotator {
    pub fn new(
        root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        history: Arc<dyn CommitHistory>,
        metadata: Arc<dyn BuildMetadata>,
        sink: Arc<dyn AnnotationSink>,
    ) -> Self {
        Self {
            root: root.into(),
            runner,
            history,
            metadata,
            sink,
            web_url: DEFAULT_WEB_URL.to_string(),
        }
    }

    /// Base URL for commit and compare links.
    pub fn with_web_url(mut self, url: impl Into<String>) -> Self {
        self.web_url = url.into();
        self
    }

    /// Current head commit of a checked-out repository.
    pub async fn head_commit(&self, id: &PackageId) -> Result<String> {
        let invocation = Invocation::new("git", package_dir(&self.root, id))
            .args(["log", "-n", "1", "--pretty=format:%H"]);
        let output = self.runner.run(&invocation).await?;
        let sha = output.stdout.trim();
        if !output.success() || sha.is_empty() {
            return Err(ReleaseError::Git {
                command: invocation.to_string(),
                detail: output.tail(10),
            });
        }
        Ok(sha.to_string())
    }

    /// Record heads, compare against the previous build and post the
    /// annotation. Returns the posted markdown.
    pub async fn annotate(&self, ids: &[PackageId]) -> Result<String> {
        let mut heads = BTreeMap::new();
        for id in ids {
            let head = self.head_commit(id).await?;
            self.metadata.record(&metadata_key(id), &head).await?;
            heads.insert(id.clone(), head);
        }

        let previous = self.metadata.previous_build().await?;
        let mut changes = Vec::new();
        for (id, head) in heads {
            let Some(base) = previous.get(&metadata_key(&id)) else {
                debug!(repo = %id, "Not recorded by the previous build");
                continue;
            };
            if *base == head {
                continue;
            }
            let commits = match self.history.compare(&id, base, &head).await {
                Ok(commits) => Some(commits),
                Err(e) => {
                    warn!(repo = %id, base = %base, head = %head, error = %e, "Commit comparison failed");
                    None
                }
            };
            changes.push(RepoChanges {
                repo: id,
                base: base.clone(),
                head,
                commits,
            });
        }

        let markdown = render_annotation(&changes, &self.web_url);
        info!(changed = changes.len(), "Posting commit annotation");
        self.sink.annotate(&markdown).await?;
        Ok(markdown)
    }
}
