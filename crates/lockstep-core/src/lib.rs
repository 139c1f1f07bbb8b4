//! Lockstep core library.
//!
//! Builds a dependency graph over a set of JavaScript packages that live in
//! separate repositories, partitions it into topologically ordered batches,
//! and drives install, build and local propagation batch by batch.

pub mod chunk;
pub mod config;
pub mod error;
pub mod graph;
pub mod install;
pub mod manifest;
pub mod package;
pub mod pipeline;
pub mod planner;
pub mod propagate;
pub mod runner;
pub mod telemetry;

pub use chunk::chunk;
pub use config::{LockstepConfig, PackageManagerConfig};
pub use error::{FailureKind, LockstepError, PackageFailure, Result};
pub use graph::DependencyGraph;
pub use install::{
    install_set, BatchReport, InstallOptions, InstallReport, InstallSet, Installer, PackageOutcome,
};
pub use manifest::{FsManifestLoader, Manifest, ManifestLoader, MANIFEST_FILE};
pub use package::{
    load_packages, populate_dependents, Dependency, DependencyKind, NameIndex, Package, PackageId,
};
pub use pipeline::{BootstrapResult, LockstepPipeline};
pub use planner::{Batch, BatchPlan, BatchPlanner, CyclePolicy, CycleBreak};
pub use propagate::looks_like_file;
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
