//! The task registry and dependency graph.
//!
//! Tasks are registered once at startup and are immutable afterwards.
//! The graph stores two kinds of edges:
//!
//! * [`DepKind::Requires`] — a hard dependency. Resolving a set of
//!   target tasks pulls every transitive requirement into the run, e.g.
//!   a compile step requires its lint guard, a publish step requires the
//!   build pipeline.
//! * [`DepKind::Orders`] — an ordering-only constraint contributed by
//!   pipeline composition. It sequences two tasks when both are already
//!   part of a run, but never pulls anything in. This is what keeps a
//!   watch-triggered stylesheet rebuild from dragging `clean` and the
//!   rest of the build pipeline along with it.
//!
//! Resolution produces *batches*: sets of tasks whose dependencies are
//! all satisfied and which run concurrently as one scheduling step.
//! Ties inside a batch break by registration order, so the result is
//! deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::RegistryError;
use crate::task::{Action, TaskId, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DepKind {
    Requires,
    Orders,
}

pub(crate) struct TaskNode {
    pub name: Box<str>,
    pub action: Arc<dyn Action>,
    pub group: Option<Box<str>>,
    pub guards: Option<Box<str>>,
    pub requires: Option<Box<str>>,
}

pub struct Registry {
    graph: DiGraph<TaskNode, DepKind>,
    names: HashMap<Box<str>, TaskId>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            names: HashMap::new(),
        }
    }

    pub fn register(&mut self, spec: TaskSpec) -> Result<TaskId, RegistryError> {
        if self.names.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        for dep in &spec.deps {
            self.validate(*dep)?;
        }

        let name = spec.name.clone();
        let index = self.graph.add_node(TaskNode {
            name: spec.name,
            action: spec.action,
            group: spec.group,
            guards: spec.guards,
            requires: spec.requires,
        });

        // Edges point from a dependency to its dependent. A fresh node
        // only ever receives incoming edges from existing nodes, so this
        // cannot introduce a cycle.
        for dep in &spec.deps {
            self.graph.add_edge(dep.0, index, DepKind::Requires);
        }

        let id = TaskId(index);
        self.names.insert(name, id);
        Ok(id)
    }

    /// Declare after the fact that `task` requires `dep`, used to wire
    /// pipelines over already-registered tasks.
    pub fn add_dependency(&mut self, task: TaskId, dep: TaskId) -> Result<(), RegistryError> {
        self.add_edge(dep, task, DepKind::Requires)
    }

    /// Constrain `then` to run after `first` whenever both are part of
    /// the same run, without pulling `first` into runs that target
    /// `then`.
    pub fn add_order(&mut self, first: TaskId, then: TaskId) -> Result<(), RegistryError> {
        self.add_edge(first, then, DepKind::Orders)
    }

    fn add_edge(&mut self, from: TaskId, to: TaskId, kind: DepKind) -> Result<(), RegistryError> {
        self.validate(from)?;
        self.validate(to)?;

        let edge = self.graph.add_edge(from.0, to.0, kind);
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(RegistryError::Cycle(self.graph[to.0].name.clone()));
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.names.get(name).copied()
    }

    pub fn name(&self, id: TaskId) -> &str {
        &self.graph[id.0].name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub(crate) fn node(&self, id: TaskId) -> &TaskNode {
        &self.graph[id.0]
    }

    fn validate(&self, id: TaskId) -> Result<(), RegistryError> {
        if id.0.index() >= self.graph.node_count() {
            return Err(RegistryError::UnknownTask(
                format!("#{}", id.0.index()).into(),
            ));
        }
        Ok(())
    }

    /// Resolve `targets` into an ordered sequence of batches.
    ///
    /// The run set is the transitive closure of the targets over
    /// `Requires` edges. Within that set, both edge kinds constrain the
    /// leveling, and every member of a named parallel group is raised
    /// into a single batch.
    pub fn resolve_order(&self, targets: &[TaskId]) -> Result<Vec<Vec<TaskId>>, RegistryError> {
        for target in targets {
            self.validate(*target)?;
        }

        // Transitive requirements of the targets.
        let mut closure = HashSet::new();
        let mut stack: Vec<NodeIndex> = targets.iter().map(|id| id.0).collect();
        while let Some(node) = stack.pop() {
            if !closure.insert(node) {
                continue;
            }
            for edge in self.graph.edges_directed(node, Direction::Incoming) {
                if *edge.weight() == DepKind::Requires {
                    stack.push(edge.source());
                }
            }
        }

        let mut groups: HashMap<&str, Vec<NodeIndex>> = HashMap::new();
        for &node in &closure {
            if let Some(group) = &self.graph[node].group {
                groups.entry(&**group).or_default().push(node);
            }
        }

        // A group member depending on a sibling can never share a batch
        // with it.
        for (group, members) in &groups {
            let set: HashSet<_> = members.iter().copied().collect();
            for &member in members {
                if self
                    .ancestors_within(member, &closure)
                    .iter()
                    .any(|a| *a != member && set.contains(a))
                {
                    return Err(RegistryError::GroupCycle((*group).into()));
                }
            }
        }

        let mut order: Vec<NodeIndex> = closure.iter().copied().collect();
        order.sort_by_key(|n| n.index());

        // Longest-path leveling, iterated because raising a group member
        // can invalidate the levels of its dependents. Levels only ever
        // grow; failure to settle means two groups are entangled through
        // their dependencies.
        let mut level: HashMap<NodeIndex, usize> = order.iter().map(|&n| (n, 0)).collect();
        let cap = order.len() + groups.len() + 2;
        let mut entangled = None;
        let mut passes = 0usize;

        loop {
            let mut changed = false;

            for &node in &order {
                let wanted = self
                    .graph
                    .edges_directed(node, Direction::Incoming)
                    .filter(|edge| closure.contains(&edge.source()))
                    .map(|edge| level[&edge.source()] + 1)
                    .max()
                    .unwrap_or(0);
                if wanted > level[&node] {
                    level.insert(node, wanted);
                    changed = true;
                }
            }

            for (group, members) in &groups {
                let target = members.iter().map(|m| level[m]).max().unwrap_or(0);
                for member in members {
                    if level[member] < target {
                        level.insert(*member, target);
                        changed = true;
                        entangled = Some(*group);
                    }
                }
            }

            if !changed {
                break;
            }
            passes += 1;
            if passes > cap {
                let group = entangled.unwrap_or_default();
                return Err(RegistryError::GroupCycle(group.into()));
            }
        }

        let depth = order.iter().map(|n| level[n]).max().map_or(0, |d| d + 1);
        let mut batches = vec![Vec::new(); depth];
        for &node in &order {
            batches[level[&node]].push(TaskId(node));
        }

        Ok(batches.into_iter().filter(|b| !b.is_empty()).collect())
    }

    fn ancestors_within(&self, node: NodeIndex, closure: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            for edge in self.graph.edges_directed(current, Direction::Incoming) {
                if closure.contains(&edge.source()) {
                    stack.push(edge.source());
                }
            }
        }
        seen.remove(&node);
        seen.into_iter().collect()
    }
}
