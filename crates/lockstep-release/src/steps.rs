//! Per-repository CI test steps.
//!
//! Renders one test step per package as a Buildkite pipeline document,
//! ready for `buildkite-agent pipeline upload`.

use std::collections::BTreeMap;

use lockstep_core::PackageId;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::Result;

pub const DEFAULT_QUEUE: &str = "workers";
pub const DEFAULT_COMPOSE_PLUGIN: &str = "docker-compose#v1.7.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStep {
    pub label: String,
    pub command: String,
    pub agents: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDocument {
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone)]
pub struct StepOptions {
    pub queue: String,
    /// Test command run inside each checkout.
    pub test_command: String,
    /// docker-compose service to run the step in, if any.
    pub compose_service: Option<String>,
    pub compose_plugin: String,
    /// Repositories left out of the pipeline.
    pub exclude: Vec<PackageId>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            test_command: "yarn test".to_string(),
            compose_service: None,
            compose_plugin: DEFAULT_COMPOSE_PLUGIN.to_string(),
            exclude: Vec::new(),
        }
    }
}

/// One test step per package, in the given order. Steps `cd` into the
/// package directory relative to the workspace root.
pub fn test_steps(ids: &[PackageId], options: &StepOptions) -> PipelineDocument {
    let steps = ids
        .iter()
        .filter(|id| !options.exclude.contains(id))
        .map(|id| {
            let mut agents = BTreeMap::new();
            agents.insert("queue".to_string(), options.queue.clone());
            let plugins = match &options.compose_service {
                Some(service) => {
                    let mut plugin = BTreeMap::new();
                    plugin.insert(options.compose_plugin.clone(), json!({ "run": service }));
                    vec![plugin]
                }
                None => Vec::new(),
            };
            PipelineStep {
                label: format!("{} test", id.name),
                command: format!("cd {}/{} && {}", id.owner, id.name, options.test_command),
                agents,
                plugins,
            }
        })
        .collect();
    PipelineDocument { steps }
}

impl PipelineDocument {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
