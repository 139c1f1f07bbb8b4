//! Error taxonomy for package loading, planning and batched installation.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which per-package step failed inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Install,
    Build,
    Propagate,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Install => "install",
            FailureKind::Build => "build",
            FailureKind::Propagate => "propagate",
        };
        f.write_str(s)
    }
}

/// A single package's failure, recorded with the underlying tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFailure {
    pub package: String,
    pub kind: FailureKind,
    pub detail: String,
}

impl fmt::Display for PackageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} failed): {}", self.package, self.kind, self.detail)
    }
}

/// Errors produced by the lockstep core.
#[derive(Debug, Error)]
pub enum LockstepError {
    /// No manifest exists where the package is expected to live.
    #[error("manifest not found: {}", path.display())]
    ManifestNotFound { path: PathBuf },

    /// A manifest exists but is not valid package metadata.
    #[error("failed to parse manifest {}: {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A package identity is not of the form `owner/name`.
    #[error("invalid package identity '{0}': expected owner/name")]
    InvalidPackageId(String),

    /// The same identity was listed twice for one run.
    #[error("duplicate package identity: {0}")]
    DuplicatePackage(String),

    /// The graph contains a cycle and cycles are rejected.
    #[error("dependency cycle detected; unscheduled packages: {}", packages.join(", "))]
    DependencyCycle { packages: Vec<String> },

    /// A referenced package is not part of the graph.
    #[error("package not found in graph: {0}")]
    PackageNotFound(String),

    /// One or more packages in a batch failed; siblings ran to completion.
    #[error("batch {batch} failed for {} package(s): {}", failures.len(), summarize(failures))]
    BatchFailed {
        batch: usize,
        failures: Vec<PackageFailure>,
    },

    /// An external command could not be started or timed out.
    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LockstepError {
    /// Identities of the packages this error is about, if any.
    pub fn packages(&self) -> Vec<String> {
        match self {
            LockstepError::DependencyCycle { packages } => packages.clone(),
            LockstepError::BatchFailed { failures, .. } => {
                failures.iter().map(|f| f.package.clone()).collect()
            }
            LockstepError::DuplicatePackage(p) | LockstepError::PackageNotFound(p) => {
                vec![p.clone()]
            }
            _ => Vec::new(),
        }
    }
}

fn summarize(failures: &[PackageFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.package, f.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for lockstep core operations.
pub type Result<T> = std::result::Result<T, LockstepError>;
