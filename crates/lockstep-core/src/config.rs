//! Run configuration.
//!
//! Precedence, lowest first: built-in defaults, `lockstep.toml`, environment
//! (`LOCKSTEP_ROOT`, `LOCKSTEP_REJECT_CYCLES`), then whatever the caller
//! applies on top (CLI flags).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LockstepError, Result};
use crate::planner::CyclePolicy;

/// Default configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = "lockstep.toml";

pub const ENV_ROOT: &str = "LOCKSTEP_ROOT";
pub const ENV_REJECT_CYCLES: &str = "LOCKSTEP_REJECT_CYCLES";

/// How the package manager is invoked for installs and builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageManagerConfig {
    pub program: String,
    /// Arguments preceding the `name@constraint` list of an install.
    pub add_args: Vec<String>,
    /// Extra flag marking an install as development-only.
    pub dev_flag: String,
    /// Script whose presence makes a package build-capable.
    pub build_script: String,
    /// Arguments preceding the script name of a build.
    pub run_args: Vec<String>,
    /// Local dependency-resolution directory inside each package.
    pub dependency_dir: String,
    /// Per-command timeout; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for PackageManagerConfig {
    fn default() -> Self {
        Self {
            program: "yarn".to_string(),
            add_args: vec!["add".to_string()],
            dev_flag: "--dev".to_string(),
            build_script: "transpile".to_string(),
            run_args: vec!["run".to_string()],
            dependency_dir: "node_modules".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockstepConfig {
    /// Directory holding `<owner>/<name>/package.json` for every package.
    pub root_dir: PathBuf,
    pub reject_cycles: bool,
    /// Maximum packages processed at once inside a batch; 0 = whole batch.
    pub concurrency: usize,
    pub package_manager: PackageManagerConfig,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("packages"),
            reject_cycles: false,
            concurrency: 0,
            package_manager: PackageManagerConfig::default(),
        }
    }
}

impl LockstepConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| LockstepError::Config(e.to_string()))
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LockstepError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Resolve configuration from an explicit file or `lockstep.toml` if it
    /// exists, then apply the process environment.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).is_file() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        debug!(root = %config.root_dir.display(), reject_cycles = config.reject_cycles, "Configuration loaded");
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.root_dir = PathBuf::from(root);
        }
        if let Some(raw) = lookup(ENV_REJECT_CYCLES) {
            self.reject_cycles = parse_bool(&raw).ok_or_else(|| {
                LockstepError::Config(format!("{ENV_REJECT_CYCLES}: expected a boolean, got '{raw}'"))
            })?;
        }
        Ok(())
    }

    pub fn cycle_policy(&self) -> CyclePolicy {
        CyclePolicy::from_reject_flag(self.reject_cycles)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
