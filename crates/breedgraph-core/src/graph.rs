use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;

use crate::ids::Identified;
use crate::DomainError;

type Id<N> = <N as Identified>::Id;

/// Directed graph over identified models, with per-edge attributes.
///
/// Nodes live in an id-keyed arena; edges are adjacency maps in both directions.
/// The graph is kept acyclic: edge insertion fails on self-loops and on edges that
/// would close a cycle.
#[derive(Debug, Clone)]
pub struct DiGraph<N: Identified, E = ()> {
    nodes: BTreeMap<Id<N>, N>,
    out_edges: BTreeMap<Id<N>, BTreeMap<Id<N>, E>>,
    in_edges: BTreeMap<Id<N>, BTreeSet<Id<N>>>,
}

impl<N: Identified, E> Default for DiGraph<N, E> {
    fn default() -> Self {
        Self { nodes: BTreeMap::new(), out_edges: BTreeMap::new(), in_edges: BTreeMap::new() }
    }
}

impl<N: Identified, E> DiGraph<N, E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from stored parts without re-running cycle checks per edge.
    ///
    /// The result is still verified once for acyclicity.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] for duplicate node ids,
    /// [`DomainError::NoResultFound`] for edges with unknown endpoints and
    /// [`DomainError::IllegalOperation`] when the edges contain a cycle.
    pub fn from_parts(
        nodes: impl IntoIterator<Item = N>,
        edges: impl IntoIterator<Item = (Id<N>, Id<N>, E)>,
    ) -> Result<Self, DomainError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node)?;
        }
        for (source, target, attrs) in edges {
            graph.require_node(source)?;
            graph.require_node(target)?;
            if source == target {
                return Err(DomainError::IllegalOperation(format!(
                    "self-loop on node {source:?}"
                )));
            }
            graph.insert_edge(source, target, attrs);
        }
        if graph.has_cycle() {
            return Err(DomainError::IllegalOperation("stored edges contain a cycle".to_string()));
        }
        Ok(graph)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: Id<N>) -> bool {
        self.nodes.contains_key(&id)
    }

    #[must_use]
    pub fn node(&self, id: Id<N>) -> Option<&N> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: Id<N>) -> Option<&mut N> {
        self.nodes.get_mut(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = Id<N>> + '_ {
        self.nodes.keys().copied()
    }

    /// All edges as (source, target, attrs).
    pub fn edges(&self) -> impl Iterator<Item = (Id<N>, Id<N>, &E)> {
        self.out_edges
            .iter()
            .flat_map(|(source, targets)| targets.iter().map(|(target, e)| (*source, *target, e)))
    }

    #[must_use]
    pub fn edge(&self, source: Id<N>, target: Id<N>) -> Option<&E> {
        self.out_edges.get(&source).and_then(|targets| targets.get(&target))
    }

    pub fn edge_mut(&mut self, source: Id<N>, target: Id<N>) -> Option<&mut E> {
        self.out_edges.get_mut(&source).and_then(|targets| targets.get_mut(&target))
    }

    #[must_use]
    pub fn out_edges(&self, id: Id<N>) -> Vec<(Id<N>, Id<N>, &E)> {
        self.out_edges
            .get(&id)
            .map(|targets| targets.iter().map(|(target, e)| (id, *target, e)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn in_edges(&self, id: Id<N>) -> Vec<(Id<N>, Id<N>, &E)> {
        self.predecessors(id)
            .into_iter()
            .filter_map(|source| self.edge(source, id).map(|e| (source, id, e)))
            .collect()
    }

    #[must_use]
    pub fn successors(&self, id: Id<N>) -> Vec<Id<N>> {
        self.out_edges.get(&id).map(|targets| targets.keys().copied().collect()).unwrap_or_default()
    }

    #[must_use]
    pub fn predecessors(&self, id: Id<N>) -> Vec<Id<N>> {
        self.in_edges.get(&id).map(|sources| sources.iter().copied().collect()).unwrap_or_default()
    }

    #[must_use]
    pub fn in_degree(&self, id: Id<N>) -> usize {
        self.in_edges.get(&id).map_or(0, BTreeSet::len)
    }

    /// Every node reachable by walking edges backwards from `id`.
    #[must_use]
    pub fn ancestors(&self, id: Id<N>) -> BTreeSet<Id<N>> {
        self.walk(id, |graph, node| graph.predecessors(node))
    }

    /// Every node reachable by walking edges forwards from `id`.
    #[must_use]
    pub fn descendants(&self, id: Id<N>) -> BTreeSet<Id<N>> {
        self.walk(id, |graph, node| graph.successors(node))
    }

    /// Depth-first reachability test from `source` to `target`.
    #[must_use]
    pub fn has_path(&self, source: Id<N>, target: Id<N>) -> bool {
        if source == target {
            return self.contains(source);
        }
        let mut stack = vec![source];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            for next in self.successors(node) {
                if next == target {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }

    /// # Errors
    /// Returns [`DomainError::IdentityExists`] when a node with the same id exists.
    pub fn add_node(&mut self, model: N) -> Result<Id<N>, DomainError> {
        let id = model.id();
        if self.nodes.contains_key(&id) {
            return Err(DomainError::IdentityExists(format!("node {id:?} already in graph")));
        }
        self.nodes.insert(id, model);
        Ok(id)
    }

    /// Add a directed edge, refusing self-loops, duplicates and cycles.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown endpoints and
    /// [`DomainError::IllegalOperation`] for self-loops, duplicate edges or cycles.
    pub fn add_edge(&mut self, source: Id<N>, target: Id<N>, attrs: E) -> Result<(), DomainError> {
        self.require_node(source)?;
        self.require_node(target)?;
        if source == target {
            return Err(DomainError::IllegalOperation(format!("self-loop on node {source:?}")));
        }
        if self.edge(source, target).is_some() {
            return Err(DomainError::IllegalOperation(format!(
                "edge {source:?} -> {target:?} already exists"
            )));
        }
        if self.has_path(target, source) {
            return Err(DomainError::IllegalOperation(format!(
                "edge {source:?} -> {target:?} would create a cycle"
            )));
        }
        self.insert_edge(source, target, attrs);
        Ok(())
    }

    /// # Errors
    /// Returns [`DomainError::NoResultFound`] when the edge does not exist.
    pub fn remove_edge(&mut self, source: Id<N>, target: Id<N>) -> Result<E, DomainError> {
        let attrs = self
            .out_edges
            .get_mut(&source)
            .and_then(|targets| targets.remove(&target))
            .ok_or_else(|| {
                DomainError::NoResultFound(format!("edge {source:?} -> {target:?}"))
            })?;
        if let Some(sources) = self.in_edges.get_mut(&target) {
            sources.remove(&source);
        }
        Ok(attrs)
    }

    /// Remove a batch of nodes.
    ///
    /// A node may only be removed when every outgoing edge points at another node of
    /// the same batch; incoming edges are dropped with it.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] for unknown ids and
    /// [`DomainError::IllegalOperation`] for nodes that still have dependants.
    pub fn remove_nodes_from(&mut self, ids: &[Id<N>]) -> Result<Vec<N>, DomainError> {
        let batch: BTreeSet<Id<N>> = ids.iter().copied().collect();
        for id in &batch {
            self.require_node(*id)?;
            if self.successors(*id).iter().any(|target| !batch.contains(target)) {
                return Err(DomainError::IllegalOperation(format!(
                    "node {id:?} has outgoing edges and cannot be removed"
                )));
            }
        }

        let mut removed = Vec::with_capacity(batch.len());
        for id in batch {
            for source in self.predecessors(id) {
                if let Some(targets) = self.out_edges.get_mut(&source) {
                    targets.remove(&id);
                }
            }
            if let Some(targets) = self.out_edges.remove(&id) {
                for target in targets.keys() {
                    if let Some(sources) = self.in_edges.get_mut(target) {
                        sources.remove(&id);
                    }
                }
            }
            self.in_edges.remove(&id);
            if let Some(node) = self.nodes.remove(&id) {
                removed.push(node);
            }
        }
        Ok(removed)
    }

    /// Re-key a node (and every edge touching it) from `old` to `new`.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] when `old` is unknown and
    /// [`DomainError::IdentityExists`] when `new` is taken.
    pub fn replace_node_id(&mut self, old: Id<N>, new: Id<N>) -> Result<(), DomainError> {
        if self.nodes.contains_key(&new) {
            return Err(DomainError::IdentityExists(format!("node {new:?} already in graph")));
        }
        let mut node =
            self.nodes.remove(&old).ok_or_else(|| DomainError::NoResultFound(format!("{old:?}")))?;
        node.set_id(new);
        self.nodes.insert(new, node);

        if let Some(targets) = self.out_edges.remove(&old) {
            for target in targets.keys() {
                if let Some(sources) = self.in_edges.get_mut(target) {
                    sources.remove(&old);
                    sources.insert(new);
                }
            }
            self.out_edges.insert(new, targets);
        }
        if let Some(sources) = self.in_edges.remove(&old) {
            for source in &sources {
                if let Some(targets) = self.out_edges.get_mut(source) {
                    if let Some(attrs) = targets.remove(&old) {
                        targets.insert(new, attrs);
                    }
                }
            }
            self.in_edges.insert(new, sources);
        }
        Ok(())
    }

    /// Nodes with no incoming edges.
    #[must_use]
    pub fn sources(&self) -> Vec<Id<N>> {
        self.node_ids().filter(|id| self.in_degree(*id) == 0).collect()
    }

    /// True when every node is reachable from `start` ignoring edge direction.
    #[must_use]
    pub fn weakly_connected_from(&self, start: Id<N>) -> bool {
        let reached = self.walk(start, |graph, node| {
            let mut next = graph.successors(node);
            next.extend(graph.predecessors(node));
            next
        });
        reached.len() + 1 == self.nodes.len() || (self.nodes.len() == 1 && self.contains(start))
    }

    fn has_cycle(&self) -> bool {
        // Kahn's algorithm: any node left with positive in-degree sits on a cycle.
        let mut in_degree: BTreeMap<Id<N>, usize> =
            self.node_ids().map(|id| (id, self.in_degree(id))).collect();
        let mut ready: Vec<Id<N>> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        let mut visited = 0_usize;
        while let Some(node) = ready.pop() {
            visited += 1;
            for next in self.successors(node) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(next);
                    }
                }
            }
        }
        visited != self.nodes.len()
    }

    fn insert_edge(&mut self, source: Id<N>, target: Id<N>, attrs: E) {
        self.out_edges.entry(source).or_default().insert(target, attrs);
        self.in_edges.entry(target).or_default().insert(source);
    }

    fn require_node(&self, id: Id<N>) -> Result<(), DomainError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(DomainError::NoResultFound(format!("node {id:?} not in graph")))
        }
    }

    fn walk(
        &self,
        start: Id<N>,
        next: impl Fn(&Self, Id<N>) -> Vec<Id<N>>,
    ) -> BTreeSet<Id<N>> {
        let mut seen = BTreeSet::new();
        let mut stack = next(self, start);
        while let Some(node) = stack.pop() {
            if node == start || !seen.insert(node) {
                continue;
            }
            stack.extend(next(self, node));
        }
        seen
    }
}

/// A weakly connected graph with exactly one root (in-degree 0).
#[derive(Debug, Clone)]
pub struct RootedGraph<N: Identified, E = ()> {
    graph: DiGraph<N, E>,
    root: Id<N>,
}

impl<N: Identified, E> Deref for RootedGraph<N, E> {
    type Target = DiGraph<N, E>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl<N: Identified, E> RootedGraph<N, E> {
    #[must_use]
    pub fn new(root: N) -> Self {
        let root_id = root.id();
        let mut graph = DiGraph::new();
        graph.nodes.insert(root_id, root);
        Self { graph, root: root_id }
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] unless the parts form a single
    /// weakly connected component with one root.
    pub fn from_graph(graph: DiGraph<N, E>) -> Result<Self, DomainError> {
        let roots = graph.sources();
        let [root] = roots.as_slice() else {
            return Err(DomainError::IllegalOperation(format!(
                "rooted graph requires exactly one root, found {}",
                roots.len()
            )));
        };
        if !graph.weakly_connected_from(*root) {
            return Err(DomainError::IllegalOperation(
                "rooted graph must be weakly connected".to_string(),
            ));
        }
        Ok(Self { root: *root, graph })
    }

    #[must_use]
    pub fn root_id(&self) -> Id<N> {
        self.root
    }

    /// The root model.
    #[must_use]
    pub fn root(&self) -> &N {
        // `root` is always in the arena; `remove_nodes_from` refuses it and
        // `split_off` refuses to detach it.
        &self.graph.nodes[&self.root]
    }

    pub fn node_mut(&mut self, id: Id<N>) -> Option<&mut N> {
        self.graph.node_mut(id)
    }

    pub fn edge_mut(&mut self, source: Id<N>, target: Id<N>) -> Option<&mut E> {
        self.graph.edge_mut(source, target)
    }

    /// Attach a new node below `parent`.
    ///
    /// # Errors
    /// Propagates node insertion and edge errors.
    pub fn add_child(&mut self, parent: Id<N>, model: N, attrs: E) -> Result<Id<N>, DomainError> {
        self.graph.require_node(parent)?;
        let id = self.graph.add_node(model)?;
        self.graph.insert_edge(parent, id, attrs);
        Ok(id)
    }

    /// Add an edge between existing nodes; the root can never become a target.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when targeting the root or closing a cycle.
    pub fn add_edge(&mut self, source: Id<N>, target: Id<N>, attrs: E) -> Result<(), DomainError> {
        if target == self.root {
            return Err(DomainError::IllegalOperation("root cannot gain a parent".to_string()));
        }
        self.graph.add_edge(source, target, attrs)
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when removal would disconnect the graph.
    pub fn remove_edge(&mut self, source: Id<N>, target: Id<N>) -> Result<E, DomainError> {
        if self.graph.in_degree(target) <= 1 {
            return Err(DomainError::IllegalOperation(format!(
                "removing {source:?} -> {target:?} would disconnect the graph"
            )));
        }
        self.graph.remove_edge(source, target)
    }

    /// Insert `model` as the new root, above the current one.
    ///
    /// # Errors
    /// Returns [`DomainError::IdentityExists`] when the id is already used.
    pub fn insert_root(&mut self, model: N, attrs: E) -> Result<Id<N>, DomainError> {
        let id = self.graph.add_node(model)?;
        self.graph.insert_edge(id, self.root, attrs);
        self.root = id;
        Ok(id)
    }

    /// # Errors
    /// Returns [`DomainError::ProtectedNode`] when the batch contains the root while
    /// other nodes remain, otherwise the underlying graph errors.
    pub fn remove_nodes_from(&mut self, ids: &[Id<N>]) -> Result<Vec<N>, DomainError> {
        if ids.contains(&self.root) {
            return Err(DomainError::ProtectedNode("the root cannot be removed".to_string()));
        }
        self.graph.remove_nodes_from(ids)
    }

    /// # Errors
    /// Propagates [`DiGraph::replace_node_id`] errors.
    pub fn replace_node_id(&mut self, old: Id<N>, new: Id<N>) -> Result<(), DomainError> {
        self.graph.replace_node_id(old, new)?;
        if self.root == old {
            self.root = new;
        }
        Ok(())
    }

    pub fn into_graph(self) -> DiGraph<N, E> {
        self.graph
    }
}

/// A rooted graph where every non-root node has exactly one parent.
#[derive(Debug, Clone)]
pub struct Tree<N: Identified, E = ()> {
    inner: RootedGraph<N, E>,
}

impl<N: Identified, E> Deref for Tree<N, E> {
    type Target = RootedGraph<N, E>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<N: Identified, E> Tree<N, E> {
    #[must_use]
    pub fn new(root: N) -> Self {
        Self { inner: RootedGraph::new(root) }
    }

    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when any node has more than one parent
    /// or the graph is not rooted.
    pub fn from_graph(graph: DiGraph<N, E>) -> Result<Self, DomainError> {
        if let Some(id) = graph.node_ids().find(|id| graph.in_degree(*id) > 1) {
            return Err(DomainError::IllegalOperation(format!(
                "tree node {id:?} has more than one parent"
            )));
        }
        Ok(Self { inner: RootedGraph::from_graph(graph)? })
    }

    #[must_use]
    pub fn parent(&self, id: Id<N>) -> Option<Id<N>> {
        self.inner.predecessors(id).into_iter().next()
    }

    #[must_use]
    pub fn children(&self, id: Id<N>) -> Vec<Id<N>> {
        self.inner.successors(id)
    }

    pub fn node_mut(&mut self, id: Id<N>) -> Option<&mut N> {
        self.inner.node_mut(id)
    }

    /// # Errors
    /// Propagates [`RootedGraph::add_child`] errors.
    pub fn add_child(&mut self, parent: Id<N>, model: N, attrs: E) -> Result<Id<N>, DomainError> {
        self.inner.add_child(parent, model, attrs)
    }

    /// # Errors
    /// Propagates [`RootedGraph::insert_root`] errors.
    pub fn insert_root(&mut self, model: N, attrs: E) -> Result<Id<N>, DomainError> {
        self.inner.insert_root(model, attrs)
    }

    /// Move `node` (and its subtree) under `new_parent`.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when moving the root or when the new
    /// parent lies inside the moved subtree.
    pub fn change_source(&mut self, node: Id<N>, new_parent: Id<N>) -> Result<(), DomainError> {
        let Some(old_parent) = self.parent(node) else {
            return Err(DomainError::IllegalOperation("the root has no source to change".into()));
        };
        if old_parent == new_parent {
            return Ok(());
        }
        if new_parent == node || self.inner.descendants(node).contains(&new_parent) {
            return Err(DomainError::IllegalOperation(format!(
                "moving {node:?} under {new_parent:?} would create a cycle"
            )));
        }
        self.inner.graph.require_node(new_parent)?;
        let attrs = self.inner.graph.remove_edge(old_parent, node)?;
        self.inner.graph.insert_edge(new_parent, node, attrs);
        Ok(())
    }

    /// # Errors
    /// Propagates [`RootedGraph::remove_nodes_from`] errors.
    pub fn remove_nodes_from(&mut self, ids: &[Id<N>]) -> Result<Vec<N>, DomainError> {
        self.inner.remove_nodes_from(ids)
    }

    /// # Errors
    /// Propagates [`RootedGraph::replace_node_id`] errors.
    pub fn replace_node_id(&mut self, old: Id<N>, new: Id<N>) -> Result<(), DomainError> {
        self.inner.replace_node_id(old, new)
    }

    /// Detach the subtree rooted at `node` into its own tree.
    ///
    /// Returns the detached tree and the attrs of the removed parent edge.
    ///
    /// # Errors
    /// Returns [`DomainError::IllegalOperation`] when `node` is the root.
    pub fn split_off(&mut self, node: Id<N>) -> Result<(Self, E), DomainError> {
        let Some(parent) = self.parent(node) else {
            return Err(DomainError::IllegalOperation("cannot split the root".to_string()));
        };
        let attrs = self.inner.graph.remove_edge(parent, node)?;
        let subtree = self.inner.graph.descendants(node);

        let mut detached = DiGraph::new();
        for id in std::iter::once(node).chain(subtree.iter().copied()) {
            if let Some(model) = self.inner.graph.nodes.remove(&id) {
                detached.nodes.insert(id, model);
            }
            if let Some(targets) = self.inner.graph.out_edges.remove(&id) {
                for target in targets.keys() {
                    detached.in_edges.entry(*target).or_default().insert(id);
                }
                detached.out_edges.insert(id, targets);
            }
            self.inner.graph.in_edges.remove(&id);
        }
        Ok((Self { inner: RootedGraph { graph: detached, root: node } }, attrs))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ids::EntryId;

    fn line(ids: &[i64]) -> Result<DiGraph<EntryId>, DomainError> {
        let mut graph = DiGraph::new();
        for id in ids {
            graph.add_node(EntryId(*id))?;
        }
        for pair in ids.windows(2) {
            graph.add_edge(EntryId(pair[0]), EntryId(pair[1]), ())?;
        }
        Ok(graph)
    }

    #[test]
    fn cycle_closing_edge_is_rejected() -> Result<(), DomainError> {
        let mut graph = line(&[1, 2, 3])?;
        let result = graph.add_edge(EntryId(3), EntryId(1), ());
        assert!(matches!(result, Err(DomainError::IllegalOperation(_))));
        assert_eq!(graph.edges().count(), 2);
        Ok(())
    }

    #[test]
    fn self_loop_is_rejected() -> Result<(), DomainError> {
        let mut graph = line(&[1])?;
        assert!(graph.add_edge(EntryId(1), EntryId(1), ()).is_err());
        Ok(())
    }

    #[test]
    fn ancestors_and_descendants_follow_edges() -> Result<(), DomainError> {
        let graph = line(&[1, 2, 3, 4])?;
        assert_eq!(graph.ancestors(EntryId(3)), [EntryId(1), EntryId(2)].into_iter().collect());
        assert_eq!(graph.descendants(EntryId(2)), [EntryId(3), EntryId(4)].into_iter().collect());
        assert!(graph.has_path(EntryId(1), EntryId(4)));
        assert!(!graph.has_path(EntryId(4), EntryId(1)));
        Ok(())
    }

    #[test]
    fn removing_a_node_with_outgoing_edges_fails() -> Result<(), DomainError> {
        let mut graph = line(&[1, 2, 3])?;
        assert!(graph.remove_nodes_from(&[EntryId(2)]).is_err());
        let removed = graph.remove_nodes_from(&[EntryId(2), EntryId(3)])?;
        assert_eq!(removed.len(), 2);
        assert!(graph.successors(EntryId(1)).is_empty());
        Ok(())
    }

    #[test]
    fn from_parts_rejects_stored_cycles() {
        let nodes = [EntryId(1), EntryId(2)];
        let edges = [(EntryId(1), EntryId(2), ()), (EntryId(2), EntryId(1), ())];
        assert!(DiGraph::from_parts(nodes, edges).is_err());
    }

    #[test]
    fn replace_node_id_keeps_edges() -> Result<(), DomainError> {
        let mut graph = line(&[1, -1, 3])?;
        graph.replace_node_id(EntryId(-1), EntryId(2))?;
        assert!(graph.has_path(EntryId(1), EntryId(3)));
        assert_eq!(graph.successors(EntryId(1)), vec![EntryId(2)]);
        assert_eq!(graph.predecessors(EntryId(3)), vec![EntryId(2)]);
        Ok(())
    }

    #[test]
    fn rooted_graph_insert_root_moves_root_up() -> Result<(), DomainError> {
        let mut rooted = RootedGraph::new(EntryId(2));
        rooted.add_child(EntryId(2), EntryId(3), ())?;
        rooted.insert_root(EntryId(1), ())?;
        assert_eq!(rooted.root_id(), EntryId(1));
        assert_eq!(*rooted.root(), EntryId(1));
        assert!(rooted.add_edge(EntryId(3), EntryId(1), ()).is_err());
        Ok(())
    }

    #[test]
    fn rooted_graph_root_survives_removal_and_renumbering() -> Result<(), DomainError> {
        let mut rooted = RootedGraph::new(EntryId(-1));
        rooted.add_child(EntryId(-1), EntryId(2), ())?;
        let refused = rooted.remove_nodes_from(&[EntryId(-1), EntryId(2)]);
        assert!(matches!(refused, Err(DomainError::ProtectedNode(_))));
        assert_eq!(*rooted.root(), EntryId(-1));

        rooted.replace_node_id(EntryId(-1), EntryId(1))?;
        assert_eq!(rooted.root_id(), EntryId(1));
        assert_eq!(*rooted.root(), EntryId(1));

        let mut tree = Tree::new(EntryId(1));
        tree.add_child(EntryId(1), EntryId(2), ())?;
        tree.add_child(EntryId(2), EntryId(3), ())?;
        let (detached, ()) = tree.split_off(EntryId(2))?;
        assert_eq!(*tree.root(), EntryId(1));
        assert_eq!(*detached.root(), EntryId(2));
        assert!(tree.split_off(EntryId(1)).is_err());
        Ok(())
    }

    #[test]
    fn rooted_graph_requires_single_root() -> Result<(), DomainError> {
        let mut graph: DiGraph<EntryId> = DiGraph::new();
        graph.add_node(EntryId(1))?;
        graph.add_node(EntryId(2))?;
        assert!(RootedGraph::from_graph(graph).is_err());
        Ok(())
    }

    #[test]
    fn tree_change_source_and_split() -> Result<(), DomainError> {
        let mut tree = Tree::new(EntryId(1));
        tree.add_child(EntryId(1), EntryId(2), ())?;
        tree.add_child(EntryId(1), EntryId(3), ())?;
        tree.add_child(EntryId(2), EntryId(4), ())?;

        tree.change_source(EntryId(4), EntryId(3))?;
        assert_eq!(tree.parent(EntryId(4)), Some(EntryId(3)));
        assert!(tree.change_source(EntryId(3), EntryId(4)).is_err());

        let (detached, ()) = tree.split_off(EntryId(3))?;
        assert_eq!(detached.root_id(), EntryId(3));
        assert_eq!(detached.children(EntryId(3)), vec![EntryId(4)]);
        assert_eq!(tree.len(), 2);
        assert!(!tree.contains(EntryId(4)));
        Ok(())
    }

    #[test]
    fn tree_rejects_second_parent() -> Result<(), DomainError> {
        let nodes = [EntryId(1), EntryId(2), EntryId(3)];
        let edges = [
            (EntryId(1), EntryId(2), ()),
            (EntryId(1), EntryId(3), ()),
            (EntryId(2), EntryId(3), ()),
        ];
        let graph = DiGraph::from_parts(nodes, edges)?;
        assert!(Tree::from_graph(graph).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn accepted_edges_never_form_cycles(edges in proptest::collection::vec((0_i64..12, 0_i64..12), 0..60)) {
            let mut graph: DiGraph<EntryId> = DiGraph::new();
            for id in 0..12 {
                let _ = graph.add_node(EntryId(id));
            }
            for (source, target) in edges {
                let _ = graph.add_edge(EntryId(source), EntryId(target), ());
            }
            for (source, target, ()) in graph.edges() {
                prop_assert!(!graph.has_path(target, source));
            }
        }
    }
}
