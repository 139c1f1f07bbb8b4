//! Batched install, build and propagation.
//!
//! Two passes over the plan, each strictly in batch order. The install pass
//! adds every package's registry dependencies; the build pass runs the
//! build script and copies the result into dependents. Inside a batch the
//! members run concurrently, capped at `concurrency` packages at a time.
//!
//! A failing step stops the rest of that package's steps. Siblings keep
//! going, and once the whole batch has settled any failures are returned
//! together as [`LockstepError::BatchFailed`]. No later batch starts, and
//! a failure in the install pass means the build pass never starts.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use crate::chunk::chunk;
use crate::config::{LockstepConfig, PackageManagerConfig};
use crate::error::{FailureKind, LockstepError, PackageFailure, Result};
use crate::graph::DependencyGraph;
use crate::package::{DependencyKind, Package, PackageId};
use crate::planner::{Batch, BatchPlan};
use crate::propagate::{propagate, propagation_target};
use crate::runner::{CommandRunner, Invocation};
use crate::telemetry::run_span;

/// Settings the installer needs from the run configuration.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub root: PathBuf,
    pub package_manager: PackageManagerConfig,
    pub concurrency: usize,
}

impl InstallOptions {
    pub fn from_config(config: &LockstepConfig) -> Self {
        Self {
            root: config.root_dir.clone(),
            package_manager: config.package_manager.clone(),
            concurrency: config.concurrency,
        }
    }
}

/// External dependencies to install for one package, `key → constraint`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallSet {
    pub runtime: BTreeMap<String, String>,
    pub development: BTreeMap<String, String>,
}

impl InstallSet {
    pub fn is_empty(&self) -> bool {
        self.runtime.is_empty() && self.development.is_empty()
    }

    pub fn runtime_specs(&self) -> Vec<String> {
        specs(&self.runtime)
    }

    pub fn development_specs(&self) -> Vec<String> {
        specs(&self.development)
    }
}

fn specs(map: &BTreeMap<String, String>) -> Vec<String> {
    map.iter().map(|(k, v)| format!("{k}@{v}")).collect()
}

/// Compute the install set of `id`, including transitive top-ups.
///
/// Runtime externals of in-set dependencies are added to the set matching
/// the kind under which `id` declared that dependency, following runtime
/// in-set edges further down. Development externals of in-set dependencies
/// never propagate. Keys `id` declares itself are never topped up, and a
/// key that lands in both sets stays runtime only.
pub fn install_set(graph: &DependencyGraph, id: &PackageId) -> Result<InstallSet> {
    let pkg = graph.package(id)?;

    let mut runtime = own_externals(pkg, DependencyKind::Runtime);
    let mut development = own_externals(pkg, DependencyKind::Development);

    let runtime_seeds = in_set_seeds(pkg, DependencyKind::Runtime);
    let dev_seeds = in_set_seeds(pkg, DependencyKind::Development);

    for (key, constraint) in reachable_runtime_externals(graph, id, runtime_seeds)? {
        if !pkg.declared.contains_key(&key) {
            runtime.entry(key).or_insert(constraint);
        }
    }
    for (key, constraint) in reachable_runtime_externals(graph, id, dev_seeds)? {
        if !pkg.declared.contains_key(&key) && !runtime.contains_key(&key) {
            development.entry(key).or_insert(constraint);
        }
    }

    Ok(InstallSet {
        runtime,
        development,
    })
}

fn own_externals(pkg: &Package, kind: DependencyKind) -> BTreeMap<String, String> {
    pkg.external_of_kind(kind)
        .map(|(k, d)| (k.clone(), d.constraint.clone()))
        .collect()
}

fn in_set_seeds(pkg: &Package, kind: DependencyKind) -> BTreeSet<PackageId> {
    pkg.in_set_of_kind(kind)
        .map(|(_, target)| target.clone())
        .filter(|target| target != &pkg.id)
        .collect()
}

/// Breadth-first walk over runtime in-set edges starting at `seeds`,
/// collecting runtime externals. Each level is visited in identity order
/// and the first constraint reached for a key wins.
fn reachable_runtime_externals(
    graph: &DependencyGraph,
    origin: &PackageId,
    seeds: BTreeSet<PackageId>,
) -> Result<BTreeMap<String, String>> {
    let mut found = BTreeMap::new();
    let mut visited: BTreeSet<PackageId> = BTreeSet::from([origin.clone()]);
    let mut queue: VecDeque<PackageId> = VecDeque::new();
    for seed in seeds {
        if visited.insert(seed.clone()) {
            queue.push_back(seed);
        }
    }

    while let Some(current) = queue.pop_front() {
        let pkg = graph.package(&current)?;
        for (key, dep) in pkg.external_of_kind(DependencyKind::Runtime) {
            found
                .entry(key.clone())
                .or_insert_with(|| dep.constraint.clone());
        }
        for next in in_set_seeds(pkg, DependencyKind::Runtime) {
            if visited.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }

    Ok(found)
}

/// Result of the install pass for one package.
#[derive(Debug, Clone)]
struct Installed {
    package: PackageId,
    runtime: Vec<String>,
    development: Vec<String>,
    duration_ms: u64,
}

/// What happened to one package.
#[derive(Debug, Clone, Serialize)]
pub struct PackageOutcome {
    pub package: PackageId,
    /// `name@constraint` specs passed to the runtime install.
    pub installed: Vec<String>,
    /// `name@constraint` specs passed to the development install.
    pub installed_dev: Vec<String>,
    pub built: bool,
    pub propagated_to: Vec<PackageId>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub forced: bool,
    pub packages: Vec<PackageOutcome>,
}

/// Result of a successful run over a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan_digest: String,
    pub batches: Vec<BatchReport>,
}

impl InstallReport {
    pub fn package_count(&self) -> usize {
        self.batches.iter().map(|b| b.packages.len()).sum()
    }

    pub fn built_count(&self) -> usize {
        self.outcomes().filter(|o| o.built).count()
    }

    pub fn propagation_count(&self) -> usize {
        self.outcomes().map(|o| o.propagated_to.len()).sum()
    }

    pub fn outcome(&self, id: &PackageId) -> Option<&PackageOutcome> {
        self.outcomes().find(|o| &o.package == id)
    }

    fn outcomes(&self) -> impl Iterator<Item = &PackageOutcome> {
        self.batches.iter().flat_map(|b| b.packages.iter())
    }
}

/// Drives a [`BatchPlan`] through install, build and propagation.
pub struct Installer {
    runner: Arc<dyn CommandRunner>,
    options: InstallOptions,
}

impl Installer {
    pub fn new(runner: Arc<dyn CommandRunner>, options: InstallOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Process every batch of `plan` in order, in two passes.
    ///
    /// The first pass runs the registry installs of every package, batch by
    /// batch. The second builds and propagates, batch by batch. Package
    /// managers prune entries they do not track from the dependency
    /// directory, so nothing is copied into a package until its own install
    /// has finished.
    ///
    /// Everything logged during the run is recorded inside a
    /// [`run_span`] carrying the run id.
    pub async fn install(&self, graph: &DependencyGraph, plan: &BatchPlan) -> Result<InstallReport> {
        let run_id = Uuid::new_v4();
        self.install_run(graph, plan, run_id)
            .instrument(run_span("bootstrap", &run_id))
            .await
    }

    async fn install_run(
        &self,
        graph: &DependencyGraph,
        plan: &BatchPlan,
        run_id: Uuid,
    ) -> Result<InstallReport> {
        let started_at = Utc::now();
        let plan_digest = plan.digest();
        info!(
            batches = plan.len(),
            packages = plan.package_count(),
            plan = %plan_digest,
            "Starting batched install"
        );

        let mut installed: BTreeMap<PackageId, Installed> = BTreeMap::new();
        for (index, batch) in plan.iter().enumerate() {
            let done = self
                .run_batch("install", index, batch, |id| self.install_package(graph, id))
                .await?;
            installed.extend(done.into_iter().map(|i| (i.package.clone(), i)));
        }

        let mut batches = Vec::with_capacity(plan.len());
        for (index, batch) in plan.iter().enumerate() {
            let installed = &installed;
            let packages = self
                .run_batch("build", index, batch, |id| {
                    self.build_and_propagate(graph, id, installed.get(id))
                })
                .await?;
            batches.push(BatchReport {
                index,
                forced: batch.forced,
                packages,
            });
        }

        let report = InstallReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            plan_digest,
            batches,
        };
        info!(
            packages = report.package_count(),
            built = report.built_count(),
            propagated = report.propagation_count(),
            "Batched install complete"
        );
        Ok(report)
    }

    /// Run `step` for every member of `batch`, `concurrency` at a time.
    /// Failures are collected and returned together once the batch settles.
    async fn run_batch<'b, T, F, Fut>(
        &self,
        pass: &'static str,
        index: usize,
        batch: &'b Batch,
        step: F,
    ) -> Result<Vec<T>>
    where
        F: Fn(&'b PackageId) -> Fut,
        Fut: Future<Output = std::result::Result<T, PackageFailure>>,
    {
        info!(pass, batch = index, size = batch.len(), forced = batch.forced, "Processing batch");

        let mut done = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();
        for group in chunk(batch.members.iter().collect(), self.options.concurrency) {
            for result in join_all(group.into_iter().map(&step)).await {
                match result {
                    Ok(value) => done.push(value),
                    Err(failure) => {
                        error!(
                            pass,
                            batch = index,
                            package = %failure.package,
                            step = %failure.kind,
                            "Package step failed"
                        );
                        failures.push(failure);
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(LockstepError::BatchFailed {
                batch: index,
                failures,
            });
        }
        Ok(done)
    }

    /// Registry install of one package's runtime, then development set.
    async fn install_package(
        &self,
        graph: &DependencyGraph,
        id: &PackageId,
    ) -> std::result::Result<Installed, PackageFailure> {
        let start = Instant::now();
        let fail = |detail: String| PackageFailure {
            package: id.to_string(),
            kind: FailureKind::Install,
            detail,
        };

        let pkg = graph.package(id).map_err(|e| fail(e.to_string()))?;
        let set = install_set(graph, id).map_err(|e| fail(e.to_string()))?;

        let runtime = set.runtime_specs();
        let development = set.development_specs();
        if !runtime.is_empty() {
            self.exec(self.add_invocation(pkg, &runtime, false))
                .await
                .map_err(fail)?;
        }
        if !development.is_empty() {
            self.exec(self.add_invocation(pkg, &development, true))
                .await
                .map_err(fail)?;
        }

        Ok(Installed {
            package: id.clone(),
            runtime,
            development,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn build_and_propagate(
        &self,
        graph: &DependencyGraph,
        id: &PackageId,
        installed: Option<&Installed>,
    ) -> std::result::Result<PackageOutcome, PackageFailure> {
        let start = Instant::now();
        let fail = |kind: FailureKind, detail: String| PackageFailure {
            package: id.to_string(),
            kind,
            detail,
        };

        let pkg = graph
            .package(id)
            .map_err(|e| fail(FailureKind::Build, e.to_string()))?;

        if pkg.build_capable {
            self.exec(self.build_invocation(pkg))
                .await
                .map_err(|detail| fail(FailureKind::Build, detail))?;
        }

        let propagated_to = self
            .propagate_to_dependents(graph, pkg)
            .await
            .map_err(|detail| fail(FailureKind::Propagate, detail))?;

        debug!(package = %id, built = pkg.build_capable, dependents = propagated_to.len(), "Package settled");
        let (installed, installed_dev, install_ms) = match installed {
            Some(i) => (i.runtime.clone(), i.development.clone(), i.duration_ms),
            None => (Vec::new(), Vec::new(), 0),
        };
        Ok(PackageOutcome {
            package: id.clone(),
            installed,
            installed_dev,
            built: pkg.build_capable,
            propagated_to,
            duration_ms: install_ms + start.elapsed().as_millis() as u64,
        })
    }

    fn add_invocation(&self, pkg: &Package, specs: &[String], dev: bool) -> Invocation {
        let pm = &self.options.package_manager;
        let mut invocation = Invocation::new(&pm.program, &pkg.dir)
            .args(pm.add_args.iter().cloned())
            .timeout(pm.timeout_secs);
        if dev {
            invocation = invocation.arg(&pm.dev_flag);
        }
        invocation.args(specs.iter().cloned())
    }

    fn build_invocation(&self, pkg: &Package) -> Invocation {
        let pm = &self.options.package_manager;
        Invocation::new(&pm.program, &pkg.dir)
            .args(pm.run_args.iter().cloned())
            .arg(&pm.build_script)
            .timeout(pm.timeout_secs)
    }

    /// Run one command; any failure is rendered for the batch report.
    async fn exec(&self, invocation: Invocation) -> std::result::Result<(), String> {
        info!(command = %invocation, cwd = %invocation.cwd.display(), "Running");
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(format!(
                "`{invocation}` exited with code {}: {}",
                output.exit_code,
                output.tail(20)
            ))
        }
    }

    async fn propagate_to_dependents(
        &self,
        graph: &DependencyGraph,
        pkg: &Package,
    ) -> std::result::Result<Vec<PackageId>, String> {
        let mut propagated = Vec::with_capacity(pkg.dependents.len());
        for dependent_id in &pkg.dependents {
            if dependent_id == &pkg.id {
                continue;
            }
            let dependent = graph.package(dependent_id).map_err(|e| e.to_string())?;
            let key = dependent.key_for(&pkg.id).ok_or_else(|| {
                format!("{dependent_id} lists no dependency key for {}", pkg.id)
            })?;

            let source = pkg.dir.clone();
            let target = propagation_target(
                &self.options.root,
                dependent_id,
                &self.options.package_manager.dependency_dir,
                key,
            );
            let files = pkg.output_files.clone();
            debug!(package = %pkg.id, dependent = %dependent_id, target = %target.display(), "Propagating");

            let copy_target = target.clone();
            let dependency_dir = self.options.package_manager.dependency_dir.clone();
            tokio::task::spawn_blocking(move || {
                propagate(&source, &copy_target, files.as_deref(), &dependency_dir)
            })
            .await
            .map_err(|e| format!("copy task failed: {e}"))?
            .map_err(|e| format!("copy to {} failed: {e}", target.display()))?;
            propagated.push(dependent_id.clone());
        }
        Ok(propagated)
    }
}
