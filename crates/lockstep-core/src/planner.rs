//! Topological batch planning.
//!
//! Partitions a [`DependencyGraph`] into ordered batches using Kahn-style
//! layering over reference counts. A package enters a batch once none of
//! its in-set dependencies is still pending. Batch `i` must complete before
//! batch `i + 1` starts; members of one batch may run concurrently.
//!
//! When nothing is ready but packages remain, the graph has a cycle. Under
//! [`CyclePolicy::Reject`] planning fails; under [`CyclePolicy::Break`] the
//! cycle member with the highest reference count (ties: smallest identity)
//! is forced into a batch of its own and planning continues.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{LockstepError, Result};
use crate::graph::DependencyGraph;
use crate::package::PackageId;

/// What to do when the remaining graph contains a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Force one package out of the cycle and warn.
    #[default]
    Break,
    /// Fail with [`LockstepError::DependencyCycle`].
    Reject,
}

impl CyclePolicy {
    pub fn from_reject_flag(reject_cycles: bool) -> Self {
        if reject_cycles {
            CyclePolicy::Reject
        } else {
            CyclePolicy::Break
        }
    }
}

/// A set of packages with no pending dependency edges among them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Members in ascending identity order.
    pub members: Vec<PackageId>,
    /// True for a synthetic single-member batch produced by a cycle break.
    pub forced: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.members.contains(id)
    }
}

/// Record of one forced cycle break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleBreak {
    /// Index of the synthetic batch holding `forced`.
    pub batch: usize,
    pub forced: PackageId,
    /// Every package on a cycle at the time of the break.
    pub members: Vec<PackageId>,
}

impl fmt::Display for CycleBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.members.iter().map(|m| format!("\"{m}\"")).collect();
        write!(
            f,
            "Encountered a cycle in the dependency graph. This may cause instability! \
             Packages in cycle are: {}; forcing {} into batch {}",
            names.join(", "),
            self.forced,
            self.batch
        )
    }
}

/// The ordered output of the planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    pub cycle_breaks: Vec<CycleBreak>,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    /// Total number of scheduled packages.
    pub fn package_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Index of the batch that schedules `id`.
    pub fn batch_of(&self, id: &PackageId) -> Option<usize> {
        self.batches.iter().position(|b| b.contains(id))
    }

    /// Batches as plain identity lists.
    pub fn identity_sets(&self) -> Vec<Vec<String>> {
        self.batches
            .iter()
            .map(|b| b.members.iter().map(ToString::to_string).collect())
            .collect()
    }

    /// Pretty JSON: an array of arrays of `owner/name`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.identity_sets())?)
    }

    /// SHA-256 of the compact JSON rendering, hex encoded.
    pub fn digest(&self) -> String {
        let compact = serde_json::to_vec(&self.identity_sets()).unwrap_or_default();
        hex::encode(Sha256::digest(&compact))
    }
}

impl fmt::Display for BatchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, batch) in self.batches.iter().enumerate() {
            let members: Vec<String> = batch.members.iter().map(ToString::to_string).collect();
            let marker = if batch.forced { " (cycle break)" } else { "" };
            writeln!(f, "batch {index}{marker}: {}", members.join(", "))?;
        }
        Ok(())
    }
}

/// Computes a [`BatchPlan`] from a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchPlanner {
    policy: CyclePolicy,
}

impl BatchPlanner {
    pub fn new(policy: CyclePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> CyclePolicy {
        self.policy
    }

    pub fn plan(&self, graph: &DependencyGraph) -> Result<BatchPlan> {
        // dependency → number of unscheduled packages still listing it
        let mut refcounts: HashMap<&PackageId, usize> = HashMap::new();
        for id in graph.ids() {
            for dep in graph.dependencies_of(id)? {
                *refcounts.entry(dep).or_default() += 1;
            }
        }

        let mut remaining: BTreeSet<PackageId> = graph.ids().iter().cloned().collect();
        let mut plan = BatchPlan::default();

        while !remaining.is_empty() {
            let mut ready = Vec::new();
            for id in &remaining {
                let deps = graph.dependencies_of(id)?;
                if deps
                    .iter()
                    .all(|d| refcounts.get(d).copied().unwrap_or(0) == 0)
                {
                    ready.push(id.clone());
                }
            }

            let batch = if ready.is_empty() {
                self.break_cycle(graph, &remaining, &refcounts, &mut plan)?
            } else {
                Batch {
                    members: ready,
                    forced: false,
                }
            };

            debug!(
                batch = plan.batches.len(),
                size = batch.len(),
                forced = batch.forced,
                "Planned batch"
            );

            for id in &batch.members {
                remaining.remove(id);
                refcounts.remove(id);
                for dep in graph.dependencies_of(id)? {
                    if let Some(count) = refcounts.get_mut(dep) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            plan.batches.push(batch);
        }

        Ok(plan)
    }

    fn break_cycle(
        &self,
        graph: &DependencyGraph,
        remaining: &BTreeSet<PackageId>,
        refcounts: &HashMap<&PackageId, usize>,
        plan: &mut BatchPlan,
    ) -> Result<Batch> {
        if self.policy == CyclePolicy::Reject {
            return Err(LockstepError::DependencyCycle {
                packages: remaining.iter().map(ToString::to_string).collect(),
            });
        }

        let mut members = graph.cycle_members(remaining);
        if members.is_empty() {
            members = remaining.clone();
        }

        let count = |id: &PackageId| refcounts.get(id).copied().unwrap_or(0);
        let forced = members
            .iter()
            .max_by(|a, b| count(*a).cmp(&count(*b)).then_with(|| b.cmp(a)))
            .cloned()
            .ok_or_else(|| LockstepError::DependencyCycle {
                packages: remaining.iter().map(ToString::to_string).collect(),
            })?;

        let record = CycleBreak {
            batch: plan.batches.len(),
            forced: forced.clone(),
            members: members.into_iter().collect(),
        };
        warn!(forced = %record.forced, "ECYCLE {record}");
        plan.cycle_breaks.push(record);

        Ok(Batch {
            members: vec![forced],
            forced: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{Dependency, DependencyKind, Package};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn id(s: &str) -> PackageId {
        s.parse().unwrap()
    }

    fn pkg(name: &str, deps: &[&str]) -> Package {
        Package {
            id: id(name),
            published_name: name.to_string(),
            dir: PathBuf::from(name),
            version: None,
            declared: deps
                .iter()
                .map(|d| {
                    (
                        d.to_string(),
                        Dependency {
                            constraint: "*".to_string(),
                            kind: DependencyKind::Runtime,
                        },
                    )
                })
                .collect(),
            in_set: deps.iter().map(|d| (d.to_string(), id(d))).collect(),
            external: BTreeMap::new(),
            build_capable: false,
            output_files: None,
            dependents: BTreeSet::new(),
        }
    }

    fn plan_of(packages: Vec<Package>, policy: CyclePolicy) -> Result<BatchPlan> {
        let graph = DependencyGraph::new(packages).unwrap();
        BatchPlanner::new(policy).plan(&graph)
    }

    #[test]
    fn test_empty_graph_empty_plan() {
        let plan = plan_of(vec![], CyclePolicy::Break).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.to_json().unwrap(), "[]");
    }

    #[test]
    fn test_linear_chain_one_per_batch() {
        let plan = plan_of(
            vec![pkg("o/c", &["o/b"]), pkg("o/b", &["o/a"]), pkg("o/a", &[])],
            CyclePolicy::Break,
        )
        .unwrap();
        assert_eq!(
            plan.identity_sets(),
            vec![vec!["o/a"], vec!["o/b"], vec!["o/c"]]
        );
        assert!(plan.cycle_breaks.is_empty());
    }

    #[test]
    fn test_diamond_groups_siblings() {
        let plan = plan_of(
            vec![
                pkg("o/root", &["o/left", "o/right"]),
                pkg("o/left", &["o/bottom"]),
                pkg("o/right", &["o/bottom"]),
                pkg("o/bottom", &[]),
            ],
            CyclePolicy::Break,
        )
        .unwrap();
        assert_eq!(
            plan.identity_sets(),
            vec![
                vec!["o/bottom"],
                vec!["o/left", "o/right"],
                vec!["o/root"]
            ]
        );
    }

    #[test]
    fn test_independent_packages_share_one_batch() {
        let plan = plan_of(
            vec![pkg("o/a", &[]), pkg("o/b", &[]), pkg("o/c", &[])],
            CyclePolicy::Break,
        )
        .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.batches[0].len(), 3);
    }

    fn three_cycle() -> Vec<Package> {
        vec![
            pkg("o/a", &["o/b"]),
            pkg("o/b", &["o/c"]),
            pkg("o/c", &["o/a"]),
        ]
    }

    #[test]
    fn test_reject_mode_names_cycle() {
        let err = plan_of(three_cycle(), CyclePolicy::Reject).unwrap_err();
        match err {
            LockstepError::DependencyCycle { packages } => {
                assert_eq!(packages, vec!["o/a", "o/b", "o/c"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_break_mode_covers_cycle_and_records_warning() {
        let plan = plan_of(three_cycle(), CyclePolicy::Break).unwrap();
        assert_eq!(plan.package_count(), 3);
        assert_eq!(plan.cycle_breaks.len(), 1);

        let record = &plan.cycle_breaks[0];
        assert_eq!(record.members, vec![id("o/a"), id("o/b"), id("o/c")]);
        // Equal reference counts: the smallest identity is forced.
        assert_eq!(record.forced, id("o/a"));
        assert_eq!(record.batch, 0);
        assert!(plan.batches[0].forced);
        assert_eq!(plan.batches[0].members, vec![id("o/a")]);

        let message = record.to_string();
        for name in ["o/a", "o/b", "o/c"] {
            assert!(message.contains(name));
        }
    }

    #[test]
    fn test_break_prefers_highest_reference_count() {
        // b is listed by both a and c; a and c each by one package.
        let plan = plan_of(
            vec![
                pkg("o/a", &["o/b"]),
                pkg("o/b", &["o/a", "o/c"]),
                pkg("o/c", &["o/b"]),
            ],
            CyclePolicy::Break,
        )
        .unwrap();
        assert_eq!(plan.cycle_breaks[0].forced, id("o/b"));
        assert_eq!(plan.batches[0].members, vec![id("o/b")]);
        assert_eq!(plan.batches[1].members, vec![id("o/a"), id("o/c")]);
    }

    #[test]
    fn test_break_ignores_downstream_non_cycle_packages() {
        // z depends on the cycle and is listed by many, but is not on it.
        let plan = plan_of(
            vec![
                pkg("o/a", &["o/b"]),
                pkg("o/b", &["o/a"]),
                pkg("o/z", &["o/a"]),
                pkg("o/y1", &["o/z"]),
                pkg("o/y2", &["o/z"]),
                pkg("o/y3", &["o/z"]),
            ],
            CyclePolicy::Break,
        )
        .unwrap();
        let forced = &plan.cycle_breaks[0].forced;
        assert!(forced == &id("o/a") || forced == &id("o/b"));
        assert!(plan.batch_of(&id("o/a")).unwrap() < plan.batch_of(&id("o/z")).unwrap());
    }

    #[test]
    fn test_self_dependency_is_forced_alone() {
        let plan = plan_of(
            vec![pkg("o/a", &["o/a"]), pkg("o/b", &[])],
            CyclePolicy::Break,
        )
        .unwrap();
        assert_eq!(plan.batches[0].members, vec![id("o/b")]);
        assert_eq!(plan.batches[1].members, vec![id("o/a")]);
        assert!(plan.batches[1].forced);
        assert_eq!(plan.cycle_breaks[0].members, vec![id("o/a")]);

        let err = plan_of(vec![pkg("o/a", &["o/a"])], CyclePolicy::Reject).unwrap_err();
        assert!(matches!(err, LockstepError::DependencyCycle { .. }));
    }

    #[test]
    fn test_dependents_scheduled_after_dependency() {
        let plan = plan_of(
            vec![pkg("pub/a", &[]), pkg("pub/b", &["pub/a"])],
            CyclePolicy::Break,
        )
        .unwrap();
        assert!(plan.batch_of(&id("pub/a")).unwrap() < plan.batch_of(&id("pub/b")).unwrap());
    }

    #[test]
    fn test_render_and_digest_are_stable() {
        let packages = || vec![pkg("o/a", &[]), pkg("o/b", &["o/a"])];
        let first = plan_of(packages(), CyclePolicy::Break).unwrap();
        let second = plan_of(packages(), CyclePolicy::Break).unwrap();
        assert_eq!(first.digest(), second.digest());
        assert_eq!(first.digest().len(), 64);
        assert_eq!(first.to_string(), "batch 0: o/a\nbatch 1: o/b\n");
    }

    #[test]
    fn test_policy_from_flag() {
        assert_eq!(CyclePolicy::from_reject_flag(true), CyclePolicy::Reject);
        assert_eq!(CyclePolicy::from_reject_flag(false), CyclePolicy::Break);
        assert_eq!(CyclePolicy::default(), CyclePolicy::Break);
    }
}
