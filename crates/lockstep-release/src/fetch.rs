//! Repository acquisition.
//!
//! Every package lives in its own git repository checked out at
//! `<root>/<owner>/<name>`. [`RepoFetcher::sync`] clones a repository when
//! its manifest is missing, then hard-resets it to the tip of the tracked
//! branch so every run starts from a clean tree.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use lockstep_core::manifest::{manifest_path, package_dir};
use lockstep_core::{CommandRunner, Invocation, PackageId};
use regex::Regex;
use tracing::{info, warn};

use crate::error::{ReleaseError, Result};

pub const DEFAULT_BRANCH: &str = "master";

/// Environment variable holding extra repository URLs, comma separated.
pub const ENV_ADDITIONAL_REPOS: &str = "ADDITIONAL_REPOS";

/// A repository to check out, with the package identity it provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSource {
    pub id: PackageId,
    pub url: String,
}

impl RepoSource {
    /// The GitHub repository named after the identity.
    pub fn github(id: PackageId) -> Self {
        let url = format!("https://github.com/{}/{}.git", id.owner, id.name);
        Self { id, url }
    }

    /// Derive the identity from the URL tail.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self {
            id: parse_repo_url(url)?,
            url: url.to_string(),
        })
    }
}

/// Extract `owner/name` from the end of a repository URL.
///
/// Accepts https and scp-style URLs, with or without a `.git` suffix.
pub fn parse_repo_url(url: &str) -> Result<PackageId> {
    static REPO_RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let re = REPO_RE
        .get_or_init(|| Regex::new(r"([A-Za-z0-9_-]+)/([A-Za-z0-9_-]+?)(?:\.git)?/?$"))
        .as_ref()
        .map_err(|e| ReleaseError::Config(e.to_string()))?;

    let caps = re
        .captures(url.trim())
        .ok_or_else(|| ReleaseError::InvalidRepoUrl(url.to_string()))?;
    Ok(PackageId::new(&caps[1], &caps[2]))
}

/// Parse a comma-separated URL list, ignoring empty entries.
pub fn parse_repo_list(raw: &str) -> Result<Vec<RepoSource>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(RepoSource::from_url)
        .collect()
}

/// Clones and resets package repositories under a root directory.
pub struct RepoFetcher {
    root: PathBuf,
    branch: String,
    runner: Arc<dyn CommandRunner>,
    timeout_secs: u64,
}

impl RepoFetcher {
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            branch: DEFAULT_BRANCH.to_string(),
            runner,
            timeout_secs: 600,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bring one repository to a clean checkout of the tracked branch.
    pub async fn sync(&self, source: &RepoSource) -> Result<PathBuf> {
        let dir = package_dir(&self.root, &source.id);

        if !manifest_path(&self.root, &source.id).is_file() {
            info!(repo = %source.id, url = %source.url, "Cloning repository");
            std::fs::create_dir_all(&self.root)?;
            let target = format!("{}/{}", source.id.owner, source.id.name);
            let clone = ["clone", "--depth", "1", source.url.as_str(), target.as_str()];
            self.git(&self.root, clone).await?;
        }

        info!(repo = %source.id, branch = %self.branch, "Resetting repository");
        let remote_branch = format!("origin/{}", self.branch);
        self.git(&dir, ["reset", "--hard"]).await?;
        self.git(&dir, ["clean", "-xdf"]).await?;
        self.git(&dir, ["fetch"]).await?;
        self.git(&dir, ["checkout", remote_branch.as_str()]).await?;
        if let Err(e) = self.git(&dir, ["branch", "-D", self.branch.as_str()]).await {
            warn!(repo = %source.id, error = %e, "Could not delete local branch");
        }
        self.git(&dir, ["checkout", "-b", self.branch.as_str()]).await?;

        Ok(dir)
    }

    /// Sync repositories one after another, returning their identities in
    /// input order.
    pub async fn sync_all(&self, sources: &[RepoSource]) -> Result<Vec<PackageId>> {
        let mut ids = Vec::with_capacity(sources.len());
        for source in sources {
            self.sync(source).await?;
            ids.push(source.id.clone());
        }
        Ok(ids)
    }

    async fn git<'a, I>(&self, cwd: &Path, args: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let invocation = Invocation::new("git", cwd)
            .args(args)
            .timeout(self.timeout_secs);
        let output = self.runner.run(&invocation).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ReleaseError::Git {
                command: invocation.to_string(),
                detail: output.tail(10),
            })
        }
    }
}
