//! Manifest reader.
//!
//! Loads the declared metadata of a package (`package.json`) from a known
//! location. No ordering logic lives here.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LockstepError, Result};
use crate::package::PackageId;

/// File name of a package manifest inside a package directory.
pub const MANIFEST_FILE: &str = "package.json";

/// The subset of a package manifest lockstep cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Published name. Absent in some private fixtures.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,

    #[serde(default)]
    pub scripts: BTreeMap<String, String>,

    /// Explicit distributable surface. `None` means the whole tree.
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

impl Manifest {
    /// Parse a manifest from JSON text. `path` is only used for error reporting.
    pub fn from_json(text: &str, path: &Path) -> Result<Self> {
        serde_json::from_str(text).map_err(|source| LockstepError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether the manifest declares the given script.
    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }
}

/// Location of a package directory under the run root.
pub fn package_dir(root: &Path, id: &PackageId) -> PathBuf {
    root.join(&id.owner).join(&id.name)
}

/// Location of a package's manifest under the run root.
pub fn manifest_path(root: &Path, id: &PackageId) -> PathBuf {
    package_dir(root, id).join(MANIFEST_FILE)
}

/// Capability to load a manifest from a path.
pub trait ManifestLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Manifest>;
}

/// Reads manifests from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsManifestLoader;

impl ManifestLoader for FsManifestLoader {
    fn load(&self, path: &Path) -> Result<Manifest> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LockstepError::ManifestNotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(LockstepError::Io(e)),
        };
        Manifest::from_json(&text, path)
    }
}
