//! Lockstep publishing.
//!
//! [`PublishSequencer`] walks a [`BatchPlan`] the same way the installer
//! does: batches strictly in order, members of a batch concurrently. Each
//! package is versioned, pushed on a release branch, merged through a pull
//! request, observed on the registry, and finally pulled into its dependents.
//!
//! Failures are collected per batch. Once a batch has a failure, every
//! later batch is skipped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lockstep_core::{
    BatchPlan, CommandRunner, DependencyGraph, DependencyKind, Invocation, Package, PackageId,
    PackageManagerConfig,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{ReleaseError, Result};
use crate::github::{PullRequestSpec, ReleaseHost};

/// Whether a lockstep release to `target` is needed.
///
/// Only when the reference package's current version is known and differs.
pub fn should_publish(current: Option<&str>, target: &str) -> bool {
    match current.map(str::trim) {
        Some(current) if !current.is_empty() => current != target.trim(),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Version every package is released at.
    pub version: String,
    /// Branch release pull requests merge into.
    pub base_branch: String,
    pub poll_interval: Duration,
    /// Polls before a wait gives up.
    pub max_attempts: u32,
    pub package_manager: PackageManagerConfig,
    /// Registry client used to observe published versions.
    pub registry_program: String,
}

impl PublishOptions {
    pub fn new(version: impl Into<String>, package_manager: PackageManagerConfig) -> Self {
        Self {
            version: version.into(),
            base_branch: "master".to_string(),
            poll_interval: Duration::from_secs(5),
            max_attempts: 720,
            package_manager,
            registry_program: "npm".to_string(),
        }
    }

    pub fn release_branch(&self) -> String {
        format!("release/release-v{}", self.version)
    }
}

/// Result of a publish run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishOutcome {
    pub version: String,
    pub published: Vec<PackageId>,
    /// Packages that failed, with the reason.
    pub failed: Vec<(PackageId, String)>,
    /// Packages never attempted because an earlier batch failed.
    pub skipped: Vec<PackageId>,
}

impl PublishOutcome {
    pub fn overall_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

pub struct PublishSequencer {
    host: Arc<dyn ReleaseHost>,
    runner: Arc<dyn CommandRunner>,
    options: PublishOptions,
    /// Serialises `add` runs, since siblings may share a dependent.
    dependents_lock: Mutex<()>,
}

impl PublishSequencer {
    pub fn new(
        host: Arc<dyn ReleaseHost>,
        runner: Arc<dyn CommandRunner>,
        options: PublishOptions,
    ) -> Self {
        Self {
            host,
            runner,
            options,
            dependents_lock: Mutex::new(()),
        }
    }

    pub async fn publish(&self, graph: &DependencyGraph, plan: &BatchPlan) -> PublishOutcome {
        let mut outcome = PublishOutcome {
            version: self.options.version.clone(),
            ..PublishOutcome::default()
        };
        info!(version = %self.options.version, batches = plan.len(), "Starting lockstep publish");

        for (index, batch) in plan.iter().enumerate() {
            if !outcome.failed.is_empty() {
                outcome.skipped.extend(batch.members.iter().cloned());
                continue;
            }
            info!(
                batch = index + 1,
                of = plan.len(),
                size = batch.len(),
                "Publishing batch"
            );

            let results =
                join_all(batch.members.iter().map(|id| self.publish_package(graph, id))).await;
            for (id, result) in batch.members.iter().zip(results) {
                match result {
                    Ok(()) => outcome.published.push(id.clone()),
                    Err(e) => {
                        error!(package = %id, error = %e, "Publish failed");
                        outcome.failed.push((id.clone(), e.to_string()));
                    }
                }
            }
        }

        outcome
    }

    async fn publish_package(&self, graph: &DependencyGraph, id: &PackageId) -> Result<()> {
        let pkg = graph.package(id)?;
        let version = &self.options.version;
        let branch = self.options.release_branch();
        let pm = &self.options.package_manager;

        info!(package = %id, version = %version, "Updating version");
        self.exec(
            Invocation::new(&pm.program, &pkg.dir)
                .args(["version", "--new-version", version.as_str()])
                .timeout(pm.timeout_secs),
        )
        .await?;
        self.exec(
            Invocation::new("git", &pkg.dir)
                .args(["push", "origin", branch.as_str()])
                .timeout(pm.timeout_secs),
        )
        .await?;

        let spec = PullRequestSpec {
            title: format!("Release v{version}"),
            body: "Created by lockstep.".to_string(),
            head: branch,
            base: self.options.base_branch.clone(),
        };
        let pull = self.host.create_pull_request(id, &spec).await?;
        info!(package = %id, url = %pull.html_url, "Waiting for pull request to land");

        let host = &self.host;
        let number = pull.number;
        self.wait_for(format!("{id} pull request #{number} to merge"), move || {
            host.is_merged(id, number)
        })
        .await?;

        info!(package = %id, "Waiting for package to be published");
        self.wait_for(format!("{} {version} on the registry", pkg.published_name), move || {
            self.is_published(pkg)
        })
        .await?;

        self.update_dependents(graph, pkg).await
    }

    async fn is_published(&self, pkg: &Package) -> Result<bool> {
        let invocation = Invocation::new(&self.options.registry_program, &pkg.dir)
            .args(["view", pkg.published_name.as_str(), "version"])
            .timeout(self.options.package_manager.timeout_secs);
        let output = self.runner.run(&invocation).await?;
        Ok(output.success() && output.stdout.trim() == self.options.version)
    }

    async fn update_dependents(&self, graph: &DependencyGraph, pkg: &Package) -> Result<()> {
        let _guard = self.dependents_lock.lock().await;
        let spec = format!("{}@{}", pkg.published_name, self.options.version);
        let pm = &self.options.package_manager;

        for kind in [DependencyKind::Runtime, DependencyKind::Development] {
            for dependent_id in &pkg.dependents {
                if dependent_id == &pkg.id {
                    continue;
                }
                let dependent = graph.package(dependent_id)?;
                let declared = dependent
                    .key_for(&pkg.id)
                    .and_then(|key| dependent.kind_of(key));
                if declared != Some(kind) {
                    continue;
                }

                let mut invocation = Invocation::new(&pm.program, &dependent.dir)
                    .args(pm.add_args.iter().cloned())
                    .timeout(pm.timeout_secs);
                if kind == DependencyKind::Development {
                    invocation = invocation.arg(&pm.dev_flag);
                }
                debug!(package = %pkg.id, dependent = %dependent_id, "Updating dependent");
                self.exec(invocation.arg(&spec)).await?;
            }
        }
        Ok(())
    }

    async fn wait_for<F, Fut>(&self, what: String, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for attempt in 1..=self.options.max_attempts {
            tokio::time::sleep(self.options.poll_interval).await;
            if check().await? {
                return Ok(());
            }
            debug!(waiting_for = %what, attempt, "Not yet");
        }
        Err(ReleaseError::Timeout {
            what,
            attempts: self.options.max_attempts,
        })
    }

    async fn exec(&self, invocation: Invocation) -> Result<()> {
        let output = self.runner.run(&invocation).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ReleaseError::Command {
                command: invocation.to_string(),
                detail: output.tail(10),
            })
        }
    }
}
