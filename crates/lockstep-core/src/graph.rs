//! Package dependency graph.
//!
//! One node per [`Package`], keyed by identity. An edge `A → B` means
//! "A declares B as an in-set dependency", so B must be processed first.
//! Unlike a release DAG, cycles are representable here: the batch planner
//! decides whether to reject or break them. A package that resolves one of
//! its own dependency keys to itself carries a self-edge (a 1-cycle).
//!
//! The graph is immutable after construction.

use std::collections::{BTreeSet, HashMap};

use crate::error::{LockstepError, Result};
use crate::package::{Package, PackageId};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    packages: HashMap<PackageId, Package>,
    /// Identities in ascending order.
    ids: Vec<PackageId>,
    /// `package → {dependency, ...}`
    upstream: HashMap<PackageId, BTreeSet<PackageId>>,
    /// `dependency → {dependent, ...}`
    downstream: HashMap<PackageId, BTreeSet<PackageId>>,
}

impl DependencyGraph {
    /// Build the graph from every package of a run.
    pub fn new(packages: Vec<Package>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(packages.len());
        for pkg in packages {
            let id = pkg.id.clone();
            if by_id.insert(id.clone(), pkg).is_some() {
                return Err(LockstepError::DuplicatePackage(id.to_string()));
            }
        }

        let mut upstream: HashMap<PackageId, BTreeSet<PackageId>> = HashMap::new();
        let mut downstream: HashMap<PackageId, BTreeSet<PackageId>> = HashMap::new();
        for id in by_id.keys() {
            upstream.entry(id.clone()).or_default();
            downstream.entry(id.clone()).or_default();
        }

        for (id, pkg) in &by_id {
            for dep in pkg.in_set.values() {
                if !by_id.contains_key(dep) {
                    return Err(LockstepError::PackageNotFound(dep.to_string()));
                }
                upstream.entry(id.clone()).or_default().insert(dep.clone());
                downstream.entry(dep.clone()).or_default().insert(id.clone());
            }
        }

        let mut ids: Vec<PackageId> = by_id.keys().cloned().collect();
        ids.sort();

        Ok(Self {
            packages: by_id,
            ids,
            upstream,
            downstream,
        })
    }

    pub fn get(&self, id: &PackageId) -> Option<&Package> {
        self.packages.get(id)
    }

    /// Like [`get`](Self::get) but errors when the identity is unknown.
    pub fn package(&self, id: &PackageId) -> Result<&Package> {
        self.packages
            .get(id)
            .ok_or_else(|| LockstepError::PackageNotFound(id.to_string()))
    }

    /// Every identity, ascending.
    pub fn ids(&self) -> &[PackageId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Packages `id` depends on.
    pub fn dependencies_of(&self, id: &PackageId) -> Result<&BTreeSet<PackageId>> {
        self.upstream
            .get(id)
            .ok_or_else(|| LockstepError::PackageNotFound(id.to_string()))
    }

    /// Packages that depend on `id`.
    pub fn dependents_of(&self, id: &PackageId) -> Result<&BTreeSet<PackageId>> {
        self.downstream
            .get(id)
            .ok_or_else(|| LockstepError::PackageNotFound(id.to_string()))
    }

    pub fn has_self_edge(&self, id: &PackageId) -> bool {
        self.upstream.get(id).is_some_and(|deps| deps.contains(id))
    }

    /// Members of `within` that sit on a cycle of the subgraph induced by
    /// `within`: strongly connected components with more than one member,
    /// plus packages with a self-edge.
    pub fn cycle_members(&self, within: &BTreeSet<PackageId>) -> BTreeSet<PackageId> {
        let mut members = BTreeSet::new();
        for component in self.strongly_connected(within) {
            if component.len() > 1 || self.has_self_edge(&component[0]) {
                members.extend(component);
            }
        }
        members
    }

    /// Tarjan's algorithm over the subgraph induced by `within`.
    fn strongly_connected(&self, within: &BTreeSet<PackageId>) -> Vec<Vec<PackageId>> {
        let mut state = Tarjan {
            graph: self,
            within,
            next_index: 0,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        };
        for id in within {
            if !state.index.contains_key(id) {
                state.visit(id);
            }
        }
        state.components
    }
}

struct Tarjan<'g> {
    graph: &'g DependencyGraph,
    within: &'g BTreeSet<PackageId>,
    next_index: usize,
    index: HashMap<&'g PackageId, usize>,
    lowlink: HashMap<&'g PackageId, usize>,
    stack: Vec<&'g PackageId>,
    on_stack: BTreeSet<&'g PackageId>,
    components: Vec<Vec<PackageId>>,
}

impl<'g> Tarjan<'g> {
    fn visit(&mut self, node: &'g PackageId) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let graph = self.graph;
        let within = self.within;
        if let Some(deps) = graph.upstream.get(node) {
            for dep in deps.iter().filter(|d| within.contains(*d)) {
                if !self.index.contains_key(dep) {
                    self.visit(dep);
                    let low = self.lowlink[dep].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(dep) {
                    let low = self.index[dep].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                }
            }
        }

        if self.lowlink[node] == self.index[node] {
            let mut component = Vec::new();
            while let Some(top) = self.stack.pop() {
                self.on_stack.remove(top);
                component.push(top.clone());
                if top == node {
                    break;
                }
            }
            component.sort();
            self.components.push(component);
        }
    }
}
