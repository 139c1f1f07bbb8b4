//! Load, plan and install a package set in one call.

use std::sync::Arc;

use tracing::info;

use crate::config::LockstepConfig;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::install::{InstallOptions, InstallReport, Installer};
use crate::manifest::{FsManifestLoader, ManifestLoader};
use crate::package::{load_packages, PackageId};
use crate::planner::{BatchPlan, BatchPlanner};
use crate::runner::CommandRunner;

/// Everything a bootstrap run produced.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub plan: BatchPlan,
    pub report: InstallReport,
}

/// Per-invocation pipeline. Holds no graph state between calls.
pub struct LockstepPipeline {
    config: LockstepConfig,
    loader: Arc<dyn ManifestLoader>,
    runner: Arc<dyn CommandRunner>,
}

impl LockstepPipeline {
    pub fn new(config: LockstepConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            loader: Arc::new(FsManifestLoader),
            runner,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ManifestLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    /// Read every manifest and build the dependency graph.
    pub fn load(&self, ids: &[PackageId]) -> Result<DependencyGraph> {
        let packages = load_packages(
            &self.config.root_dir,
            ids,
            self.loader.as_ref(),
            &self.config.package_manager.build_script,
        )?;
        DependencyGraph::new(packages)
    }

    pub fn plan(&self, graph: &DependencyGraph) -> Result<BatchPlan> {
        BatchPlanner::new(self.config.cycle_policy()).plan(graph)
    }

    /// Load, plan and install. Manifest and cycle errors surface before any
    /// command runs.
    pub async fn bootstrap(&self, ids: &[PackageId]) -> Result<BootstrapResult> {
        let graph = self.load(ids)?;
        let plan = self.plan(&graph)?;
        info!(
            packages = graph.len(),
            batches = plan.len(),
            cycle_breaks = plan.cycle_breaks.len(),
            "Planned bootstrap"
        );

        let installer = Installer::new(
            self.runner.clone(),
            InstallOptions::from_config(&self.config),
        );
        let report = installer.install(&graph, &plan).await?;
        Ok(BootstrapResult { plan, report })
    }
}
