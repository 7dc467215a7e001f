//! ModuleGraph - DAG over active module nodes
//!
//! - Arc<str> for zero-cost cloning of node names
//! - FxHashMap for faster hashing (non-crypto)
//! - SmallVec for stack-allocated small dependency lists (0-4 items)
//!
//! Edges point from a dependency to its dependent. Ordering uses Kahn's
//! algorithm with ties broken by declaration order, so the order is
//! deterministic. Nodes Kahn cannot release are traced back to one cycle.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::PlanError;

/// Stack-allocated deps: most nodes have 0-4 dependencies
pub type DepVec = SmallVec<[Arc<str>; 4]>;

/// Graph of node dependencies
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    /// node -> dependents
    adjacency: FxHashMap<Arc<str>, DepVec>,
    /// node -> dependencies
    predecessors: FxHashMap<Arc<str>, DepVec>,
    /// All nodes in declaration order
    node_ids: Vec<Arc<str>>,
    /// Declaration index, used for deterministic tie-breaking
    position: FxHashMap<Arc<str>, usize>,
}

impl ModuleGraph {
    /// Build from nodes (declaration order) and `(dependency, dependent)` edges.
    ///
    /// Duplicate edges are collapsed. Edge endpoints must be listed nodes.
    pub fn new(nodes: &[Arc<str>], edges: &[(Arc<str>, Arc<str>)]) -> Self {
        let capacity = nodes.len();
        let mut adjacency: FxHashMap<Arc<str>, DepVec> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut predecessors: FxHashMap<Arc<str>, DepVec> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut position: FxHashMap<Arc<str>, usize> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());

        for (idx, id) in nodes.iter().enumerate() {
            adjacency.insert(Arc::clone(id), DepVec::new());
            predecessors.insert(Arc::clone(id), DepVec::new());
            position.insert(Arc::clone(id), idx);
        }

        for (dep, dependent) in edges {
            let successors = adjacency.entry(Arc::clone(dep)).or_default();
            if successors.iter().any(|s| s == dependent) {
                continue;
            }
            successors.push(Arc::clone(dependent));
            predecessors
                .entry(Arc::clone(dependent))
                .or_default()
                .push(Arc::clone(dep));
        }

        Self {
            adjacency,
            predecessors,
            node_ids: nodes.to_vec(),
            position,
        }
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> &[Arc<str>] {
        &self.node_ids
    }

    /// Direct dependencies of a node
    #[inline]
    pub fn get_dependencies(&self, node: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.predecessors
            .get(node)
            .map_or(EMPTY, SmallVec::as_slice)
    }

    /// Direct dependents of a node
    #[inline]
    pub fn get_dependents(&self, node: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.adjacency.get(node).map_or(EMPTY, SmallVec::as_slice)
    }

    #[inline]
    pub fn contains(&self, node: &str) -> bool {
        self.position.contains_key(node)
    }

    /// Whether `to` is reachable from `from` along dependent edges
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        from == to || self.walk_dependents(from, |next| next.as_ref() == to)
    }

    /// Every node reachable from `node` along dependent edges (excluding itself)
    pub fn transitive_dependents(&self, node: &str) -> Vec<Arc<str>> {
        let mut out = Vec::new();
        self.walk_dependents(node, |next| {
            out.push(Arc::clone(next));
            false
        });
        out.sort_by_key(|id| self.position.get(id).copied().unwrap_or(usize::MAX));
        out
    }

    /// Breadth-first over dependents; stops as soon as `visit` returns true
    fn walk_dependents<'g>(
        &'g self,
        start: &'g str,
        mut visit: impl FnMut(&'g Arc<str>) -> bool,
    ) -> bool {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for next in self.get_dependents(current) {
                if !seen.insert(next.as_ref()) {
                    continue;
                }
                if visit(next) {
                    return true;
                }
                queue.push_back(next.as_ref());
            }
        }
        false
    }

    /// Linear evaluation order; every node comes after all its dependencies.
    ///
    /// Fails with `CyclicDependency` rather than returning a partial order.
    pub fn topological_order(&self) -> Result<Vec<Arc<str>>, PlanError> {
        let mut in_degree: Vec<usize> = self
            .node_ids
            .iter()
            .map(|id| self.get_dependencies(id).len())
            .collect();

        // Min-heap on declaration index keeps the order stable
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();

        let mut order = Vec::with_capacity(self.node_ids.len());
        while let Some(Reverse(idx)) = ready.pop() {
            let id = &self.node_ids[idx];
            order.push(Arc::clone(id));
            for dependent in self.get_dependents(id) {
                let Some(&pos) = self.position.get(dependent) else {
                    continue;
                };
                in_degree[pos] -= 1;
                if in_degree[pos] == 0 {
                    ready.push(Reverse(pos));
                }
            }
        }

        if order.len() == self.node_ids.len() {
            return Ok(order);
        }
        Err(PlanError::CyclicDependency {
            cycle: self.trace_cycle(&in_degree),
        })
    }

    /// Nodes left with a positive in-degree all sit on or behind a cycle.
    /// Walk back through such predecessors until one repeats.
    fn trace_cycle(&self, in_degree: &[usize]) -> String {
        let stuck = |id: &Arc<str>| {
            self.position
                .get(id)
                .map_or(false, |&pos| in_degree[pos] > 0)
        };

        let Some(mut current) = self.node_ids.iter().find(|&id| stuck(id)) else {
            return String::new();
        };
        let mut path: Vec<&Arc<str>> = Vec::new();

        loop {
            if let Some(start) = path.iter().position(|seen| *seen == current) {
                // Walked against the edges; read it back in dependency order
                let mut cycle: Vec<&str> = vec![current.as_ref()];
                cycle.extend(path[start + 1..].iter().rev().map(|id| id.as_ref()));
                cycle.push(current.as_ref());
                return cycle.join(" → ");
            }
            path.push(current);
            match self.get_dependencies(current).iter().find(|&dep| stuck(dep)) {
                Some(dep) => current = dep,
                None => break,
            }
        }

        let names: Vec<&str> = path.iter().map(|id| id.as_ref()).collect();
        names.join(", ")
    }

    /// Group nodes into waves: wave N only depends on waves < N.
    ///
    /// Nodes within a wave may be provisioned concurrently.
    pub fn waves(&self) -> Result<Vec<Vec<Arc<str>>>, PlanError> {
        let order = self.topological_order()?;
        let mut level: FxHashMap<&str, usize> = FxHashMap::default();
        let mut waves: Vec<Vec<Arc<str>>> = Vec::new();

        for id in &order {
            let lvl = self
                .get_dependencies(id)
                .iter()
                .filter_map(|dep| level.get(dep.as_ref()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(id.as_ref(), lvl);
            if waves.len() <= lvl {
                waves.resize_with(lvl + 1, Vec::new);
            }
            waves[lvl].push(Arc::clone(id));
        }

        Ok(waves)
    }
}
