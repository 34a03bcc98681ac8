//! engine::links
//!
//! Graph of parent/child links between pending operations.
//!
//! An edge `parent -> child` exists when the parent records a
//! `ChildOperation` action naming the child, or the child records a
//! `ParentOperation` action naming the parent. Both directions describe the
//! same relationship, so they are merged into one graph.
//!
//! The graph is rebuilt from the persisted records whenever a link is
//! appended; it is never stored.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::ops::PendingOperation;
use crate::core::types::OpId;

/// Parent/child links between operations.
#[derive(Debug, Default, Clone)]
pub struct LinkGraph {
    children: BTreeMap<OpId, BTreeSet<OpId>>,
    parents: BTreeMap<OpId, BTreeSet<OpId>>,
}

impl LinkGraph {
    /// Build the graph from a set of records.
    pub fn from_operations<'a>(ops: impl IntoIterator<Item = &'a PendingOperation>) -> Self {
        let mut graph = Self::default();
        for op in ops {
            graph.extend(op);
        }
        graph
    }

    /// Add the links recorded by one operation.
    pub fn extend(&mut self, op: &PendingOperation) {
        for child in op.children() {
            self.add_edge(&op.id, child);
        }
        for parent in op.parents() {
            self.add_edge(parent, &op.id);
        }
    }

    /// Add a `parent -> child` edge.
    pub fn add_edge(&mut self, parent: &OpId, child: &OpId) {
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        self.parents
            .entry(child.clone())
            .or_default()
            .insert(parent.clone());
    }

    /// Direct children of `op`.
    pub fn children_of(&self, op: &OpId) -> impl Iterator<Item = &OpId> {
        self.children.get(op).into_iter().flatten()
    }

    /// Direct parents of `op`.
    pub fn parents_of(&self, op: &OpId) -> impl Iterator<Item = &OpId> {
        self.parents.get(op).into_iter().flatten()
    }

    /// Whether any operation claims `op` as a child.
    pub fn has_parent(&self, op: &OpId) -> bool {
        self.parents.get(op).is_some_and(|p| !p.is_empty())
    }

    /// A path of child edges from `from` to `to`, both included.
    ///
    /// `path(a, a)` is `[a]`.
    pub fn path(&self, from: &OpId, to: &OpId) -> Option<Vec<OpId>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs_path(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_path(
        &self,
        node: &OpId,
        target: &OpId,
        visited: &mut BTreeSet<OpId>,
        path: &mut Vec<OpId>,
    ) -> bool {
        if !visited.insert(node.clone()) {
            return false;
        }
        path.push(node.clone());
        if node == target {
            return true;
        }
        for child in self.children_of(node) {
            if self.dfs_path(child, target, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    /// Length of the longest chain of child edges below `op`.
    pub fn height_below(&self, op: &OpId) -> usize {
        longest(op, &self.children, &mut BTreeSet::new())
    }

    /// Length of the longest chain of parent edges above `op`.
    pub fn depth_above(&self, op: &OpId) -> usize {
        longest(op, &self.parents, &mut BTreeSet::new())
    }

    /// Operations that appear in any link.
    pub fn nodes(&self) -> BTreeSet<&OpId> {
        self.children
            .keys()
            .chain(self.parents.keys())
            .collect()
    }
}

/// Longest edge chain from `node`, ignoring edges back onto the current
/// path so a corrupted (cyclic) store cannot loop forever.
fn longest(
    node: &OpId,
    edges: &BTreeMap<OpId, BTreeSet<OpId>>,
    on_path: &mut BTreeSet<OpId>,
) -> usize {
    on_path.insert(node.clone());
    let mut best = 0;
    if let Some(next) = edges.get(node) {
        for n in next {
            if on_path.contains(n) {
                continue;
            }
            best = best.max(1 + longest(n, edges, on_path));
        }
    }
    on_path.remove(node);
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::delta::Action;
    use crate::core::kinds::OperationKind;

    fn id(s: &str) -> OpId {
        OpId::parse(s).unwrap()
    }

    fn chain(names: &[&str]) -> LinkGraph {
        let mut graph = LinkGraph::default();
        for pair in names.windows(2) {
            graph.add_edge(&id(pair[0]), &id(pair[1]));
        }
        graph
    }

    #[test]
    fn both_link_directions_merge() {
        let mut parent = PendingOperation::new(OperationKind::CloneVolume);
        let mut child = PendingOperation::new(OperationKind::CreateVolume);
        parent.push(Action::child_link(&child.id));
        child.push(Action::parent_link(&parent.id));

        let graph = LinkGraph::from_operations([&parent, &child]);
        assert_eq!(graph.children_of(&parent.id).collect::<Vec<_>>(), vec![&child.id]);
        assert_eq!(graph.parents_of(&child.id).collect::<Vec<_>>(), vec![&parent.id]);
        assert!(graph.has_parent(&child.id));
        assert!(!graph.has_parent(&parent.id));
    }

    #[test]
    fn path_follows_child_edges() {
        let graph = chain(&["a", "b", "c"]);
        assert_eq!(graph.path(&id("a"), &id("c")), Some(vec![id("a"), id("b"), id("c")]));
        assert_eq!(graph.path(&id("c"), &id("a")), None);
        assert_eq!(graph.path(&id("b"), &id("b")), Some(vec![id("b")]));
    }

    #[test]
    fn heights_and_depths() {
        let mut graph = chain(&["a", "b", "c", "d"]);
        graph.add_edge(&id("a"), &id("x"));
        assert_eq!(graph.height_below(&id("a")), 3);
        assert_eq!(graph.height_below(&id("d")), 0);
        assert_eq!(graph.depth_above(&id("d")), 3);
        assert_eq!(graph.depth_above(&id("x")), 1);
        assert_eq!(graph.nodes().len(), 5);
    }

    #[test]
    fn cyclic_graph_terminates() {
        let mut graph = chain(&["a", "b", "c"]);
        graph.add_edge(&id("c"), &id("a"));
        assert_eq!(graph.height_below(&id("a")), 2);
        assert!(graph.path(&id("c"), &id("b")).is_some());
    }
}
