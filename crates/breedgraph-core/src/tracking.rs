//! Change tracking for aggregate state.
//!
//! Every container keeps a snapshot taken at the last [`Tracked::reset_tracking`] and
//! derives its `added`/`removed`/`changed` sets by comparing against it, so a delete
//! followed by an equal re-insert cancels out. Mutations also raise a
//! [`ChangeNotifier`] flag that is shared with every ancestor container, which gives
//! the aggregate root an O(1) dirty probe.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::graph::{DiGraph, Tree};
use crate::ids::{EntryId, Identified, RelationshipId, TeamId, UserId};
use crate::DomainError;

/// Dirty flag plus the flags of every enclosing container.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    own: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self { own: Arc::new(AtomicBool::new(false)), ancestors: Vec::new() }
    }

    pub fn notify(&self) {
        self.own.store(true, Ordering::Relaxed);
        for flag in &self.ancestors {
            flag.store(true, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.own.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.own.store(false, Ordering::Relaxed);
    }

    /// Chain this notifier below `parent`, keeping its own flag.
    pub fn attach_to(&mut self, parent: &ChangeNotifier) {
        let mut ancestors = Vec::with_capacity(parent.ancestors.len() + 1);
        ancestors.push(Arc::clone(&parent.own));
        ancestors.extend(parent.ancestors.iter().cloned());
        self.ancestors = ancestors;
    }
}

/// State that can report and forget its own modifications.
pub trait Tracked {
    fn is_changed(&self) -> bool;
    fn reset_tracking(&mut self);
    /// Route future change notifications up to `parent`.
    fn attach(&mut self, parent: &ChangeNotifier);
}

/// Plain values are compared by value by their container; they carry no tracker.
#[macro_export]
macro_rules! untracked_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::tracking::Tracked for $ty {
                fn is_changed(&self) -> bool {
                    false
                }

                fn reset_tracking(&mut self) {}

                fn attach(&mut self, _parent: &$crate::tracking::ChangeNotifier) {}
            }
        )*
    };
}

untracked_value!(bool, i32, i64, u16, u32, u64, String, time::OffsetDateTime);
untracked_value!(UserId, TeamId, EntryId, RelationshipId);

impl<T: Tracked> Tracked for Option<T> {
    fn is_changed(&self) -> bool {
        self.as_ref().is_some_and(Tracked::is_changed)
    }

    fn reset_tracking(&mut self) {
        if let Some(value) = self {
            value.reset_tracking();
        }
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        if let Some(value) = self {
            value.attach(parent);
        }
    }
}

/// A single value remembered against its original.
#[derive(Debug, Clone)]
pub struct TrackedValue<T> {
    current: T,
    original: T,
    notifier: ChangeNotifier,
}

impl<T: Clone + PartialEq> TrackedValue<T> {
    pub fn new(value: T) -> Self {
        Self { original: value.clone(), current: value, notifier: ChangeNotifier::new() }
    }

    #[must_use]
    pub fn get(&self) -> &T {
        &self.current
    }

    #[must_use]
    pub fn original(&self) -> &T {
        &self.original
    }

    pub fn set(&mut self, value: T) {
        if value != self.current {
            self.current = value;
            self.notifier.notify();
        }
    }

    /// Mutate in place; notifies when the value actually moved.
    pub fn update(&mut self, apply: impl FnOnce(&mut T)) {
        let mut next = self.current.clone();
        apply(&mut next);
        self.set(next);
    }

    pub fn into_inner(self) -> T {
        self.current
    }
}

impl<T> Deref for TrackedValue<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.current
    }
}

impl<T: Clone + PartialEq> Tracked for TrackedValue<T> {
    fn is_changed(&self) -> bool {
        self.current != self.original
    }

    fn reset_tracking(&mut self) {
        self.original = self.current.clone();
        self.notifier.clear();
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        self.notifier.attach_to(parent);
    }
}

impl<T: PartialEq> PartialEq for TrackedValue<T> {
    fn eq(&self, other: &Self) -> bool {
        self.current == other.current
    }
}

impl<T: Serialize> Serialize for TrackedValue<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.current.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Clone + PartialEq> Deserialize<'de> for TrackedValue<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self::new)
    }
}

/// Ordered list with multiset diffing against its snapshot.
#[derive(Debug, Clone)]
pub struct TrackedList<T> {
    items: Vec<T>,
    original: Vec<T>,
    notifier: ChangeNotifier,
}

impl<T: Clone + PartialEq + Tracked> Default for TrackedList<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T: Clone + PartialEq + Tracked> TrackedList<T> {
    pub fn new(items: Vec<T>) -> Self {
        let mut list =
            Self { original: items.clone(), items, notifier: ChangeNotifier::new() };
        list.attach_children();
        list
    }

    pub fn push(&mut self, mut item: T) {
        item.attach(&self.notifier);
        self.items.push(item);
        self.notifier.notify();
    }

    pub fn insert(&mut self, index: usize, mut item: T) {
        item.attach(&self.notifier);
        self.items.insert(index.min(self.items.len()), item);
        self.notifier.notify();
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.items.len() {
            return None;
        }
        self.notifier.notify();
        Some(self.items.remove(index))
    }

    /// Remove the first element equal to `item`.
    pub fn remove_item(&mut self, item: &T) -> Option<T> {
        let index = self.items.iter().position(|candidate| candidate == item)?;
        self.remove(index)
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        let before = self.items.len();
        self.items.retain(keep);
        if self.items.len() != before {
            self.notifier.notify();
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    /// Elements present now but not in the snapshot, counted with multiplicity.
    #[must_use]
    pub fn added(&self) -> Vec<T> {
        multiset_difference(&self.items, &self.original)
    }

    #[must_use]
    pub fn removed(&self) -> Vec<T> {
        multiset_difference(&self.original, &self.items)
    }

    /// Indices of elements whose own tracker reports a change.
    #[must_use]
    pub fn changed(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_changed())
            .map(|(index, _)| index)
            .collect()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.notifier.is_dirty()
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }

    fn attach_children(&mut self) {
        let notifier = self.notifier.clone();
        for item in &mut self.items {
            item.attach(&notifier);
        }
    }
}

impl<T> Deref for TrackedList<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: Clone + PartialEq + Tracked> Tracked for TrackedList<T> {
    fn is_changed(&self) -> bool {
        self.items != self.original || self.items.iter().any(Tracked::is_changed)
    }

    fn reset_tracking(&mut self) {
        for item in &mut self.items {
            item.reset_tracking();
        }
        self.original = self.items.clone();
        self.notifier.clear();
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        self.notifier.attach_to(parent);
        self.attach_children();
    }
}

impl<T: PartialEq> PartialEq for TrackedList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Serialize> Serialize for TrackedList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Clone + PartialEq + Tracked> Deserialize<'de> for TrackedList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<T>::deserialize(deserializer).map(Self::new)
    }
}

fn multiset_difference<T: Clone + PartialEq>(left: &[T], right: &[T]) -> Vec<T> {
    let mut unmatched: Vec<&T> = right.iter().collect();
    let mut difference = Vec::new();
    for item in left {
        if let Some(index) = unmatched.iter().position(|candidate| *candidate == item) {
            unmatched.swap_remove(index);
        } else {
            difference.push(item.clone());
        }
    }
    difference
}

/// Ordered set of plain values.
#[derive(Debug, Clone)]
pub struct TrackedSet<T> {
    items: BTreeSet<T>,
    original: BTreeSet<T>,
    notifier: ChangeNotifier,
}

impl<T: Ord + Clone> Default for TrackedSet<T> {
    fn default() -> Self {
        Self::new(BTreeSet::new())
    }
}

impl<T: Ord + Clone> TrackedSet<T> {
    #[must_use]
    pub fn new(items: BTreeSet<T>) -> Self {
        Self { original: items.clone(), items, notifier: ChangeNotifier::new() }
    }

    pub fn insert(&mut self, item: T) -> bool {
        let inserted = self.items.insert(item);
        if inserted {
            self.notifier.notify();
        }
        inserted
    }

    pub fn remove(&mut self, item: &T) -> bool {
        let removed = self.items.remove(item);
        if removed {
            self.notifier.notify();
        }
        removed
    }

    #[must_use]
    pub fn added(&self) -> BTreeSet<T> {
        self.items.difference(&self.original).cloned().collect()
    }

    #[must_use]
    pub fn removed(&self) -> BTreeSet<T> {
        self.original.difference(&self.items).cloned().collect()
    }

    /// Swap `old` for `new`, carrying its pending add/remove state.
    pub fn replace(&mut self, old: &T, new: T) {
        if self.items.remove(old) {
            self.items.insert(new.clone());
        }
        if self.original.remove(old) {
            self.original.insert(new);
        }
    }
}

impl<T> Deref for TrackedSet<T> {
    type Target = BTreeSet<T>;

    fn deref(&self) -> &BTreeSet<T> {
        &self.items
    }
}

impl<T: Ord + Clone> Tracked for TrackedSet<T> {
    fn is_changed(&self) -> bool {
        self.items != self.original
    }

    fn reset_tracking(&mut self) {
        self.original = self.items.clone();
        self.notifier.clear();
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        self.notifier.attach_to(parent);
    }
}

impl<T: PartialEq> PartialEq for TrackedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Serialize> Serialize for TrackedSet<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

/// Keyed map whose values may themselves be tracked containers.
///
/// Values replaced through [`TrackedMap::insert`] are compared against the snapshot;
/// values mutated in place through [`TrackedMap::get_mut`] must be trackers themselves
/// for the edit to register.
#[derive(Debug, Clone)]
pub struct TrackedMap<K, V> {
    items: BTreeMap<K, V>,
    original: BTreeMap<K, V>,
    notifier: ChangeNotifier,
}

impl<K: Ord + Clone, V: Clone + PartialEq + Tracked> Default for TrackedMap<K, V> {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq + Tracked> TrackedMap<K, V> {
    pub fn new(items: BTreeMap<K, V>) -> Self {
        let mut map = Self { original: items.clone(), items, notifier: ChangeNotifier::new() };
        map.attach_children();
        map
    }

    pub fn insert(&mut self, key: K, mut value: V) -> Option<V> {
        value.attach(&self.notifier);
        let previous = self.items.insert(key, value);
        self.notifier.notify();
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.items.remove(key);
        if removed.is_some() {
            self.notifier.notify();
        }
        removed
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.items.get_mut(key)
    }

    /// Mutable access, inserting `V::default()` for a missing key.
    pub fn entry_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        if !self.items.contains_key(&key) {
            self.insert(key.clone(), V::default());
        }
        let notifier = self.notifier.clone();
        let value = self.items.entry(key).or_default();
        value.attach(&notifier);
        value
    }

    #[must_use]
    pub fn added(&self) -> Vec<K> {
        self.items.keys().filter(|key| !self.original.contains_key(*key)).cloned().collect()
    }

    #[must_use]
    pub fn removed(&self) -> Vec<K> {
        self.original.keys().filter(|key| !self.items.contains_key(*key)).cloned().collect()
    }

    /// Keys present before and now whose value differs from the snapshot.
    #[must_use]
    pub fn changed(&self) -> Vec<K> {
        self.items
            .iter()
            .filter(|(key, value)| {
                self.original.get(*key).is_some_and(|original| original != *value)
                    || (self.original.contains_key(*key) && value.is_changed())
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Value as of the last reset.
    #[must_use]
    pub fn original(&self, key: &K) -> Option<&V> {
        self.original.get(key)
    }

    /// Re-key an entry (typically transient id to stored id) keeping its diff state.
    ///
    /// # Errors
    /// Returns [`DomainError::NoResultFound`] when `old` is absent and
    /// [`DomainError::IdentityExists`] when `new` is already a key.
    pub fn replace_key(&mut self, old: &K, new: K) -> Result<(), DomainError>
    where
        K: std::fmt::Debug,
    {
        if self.items.contains_key(&new) {
            return Err(DomainError::IdentityExists(format!("key {new:?} already present")));
        }
        let value = self
            .items
            .remove(old)
            .ok_or_else(|| DomainError::NoResultFound(format!("key {old:?}")))?;
        self.items.insert(new.clone(), value);
        if let Some(original) = self.original.remove(old) {
            self.original.insert(new, original);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.notifier.is_dirty()
    }

    pub fn into_inner(self) -> BTreeMap<K, V> {
        self.items
    }

    fn attach_children(&mut self) {
        let notifier = self.notifier.clone();
        for value in self.items.values_mut() {
            value.attach(&notifier);
        }
    }
}

impl<K, V> Deref for TrackedMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &BTreeMap<K, V> {
        &self.items
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq + Tracked> Tracked for TrackedMap<K, V> {
    fn is_changed(&self) -> bool {
        self.items != self.original || self.items.values().any(Tracked::is_changed)
    }

    fn reset_tracking(&mut self) {
        for value in self.items.values_mut() {
            value.reset_tracking();
        }
        self.original = self.items.clone();
        self.notifier.clear();
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        self.notifier.attach_to(parent);
        self.attach_children();
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for TrackedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<K: Serialize, V: Serialize> Serialize for TrackedMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for TrackedMap<K, V>
where
    K: Deserialize<'de> + Ord + Clone,
    V: Deserialize<'de> + Clone + PartialEq + Tracked,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<K, V>::deserialize(deserializer).map(Self::new)
    }
}

/// Graph shapes a [`TrackedGraph`] can wrap.
pub trait GraphStructure {
    type Node: Identified + Clone + PartialEq + Tracked;
    type Edge;

    fn digraph(&self) -> &DiGraph<Self::Node, Self::Edge>;
    fn node_mut(&mut self, id: <Self::Node as Identified>::Id) -> Option<&mut Self::Node>;

    /// # Errors
    /// Propagates graph re-keying errors.
    fn replace_node_id(
        &mut self,
        old: <Self::Node as Identified>::Id,
        new: <Self::Node as Identified>::Id,
    ) -> Result<(), DomainError>;
}

impl<N: Identified + Clone + PartialEq + Tracked, E> GraphStructure for DiGraph<N, E> {
    type Node = N;
    type Edge = E;

    fn digraph(&self) -> &DiGraph<N, E> {
        self
    }

    fn node_mut(&mut self, id: N::Id) -> Option<&mut N> {
        DiGraph::node_mut(self, id)
    }

    fn replace_node_id(&mut self, old: N::Id, new: N::Id) -> Result<(), DomainError> {
        DiGraph::replace_node_id(self, old, new)
    }
}

impl<N: Identified + Clone + PartialEq + Tracked, E> GraphStructure for Tree<N, E> {
    type Node = N;
    type Edge = E;

    fn digraph(&self) -> &DiGraph<N, E> {
        self
    }

    fn node_mut(&mut self, id: N::Id) -> Option<&mut N> {
        Tree::node_mut(self, id)
    }

    fn replace_node_id(&mut self, old: N::Id, new: N::Id) -> Result<(), DomainError> {
        Tree::replace_node_id(self, old, new)
    }
}

type NodeId<G> = <<G as GraphStructure>::Node as Identified>::Id;

/// A graph with node and edge diffs against its last snapshot.
#[derive(Debug, Clone)]
pub struct TrackedGraph<G: GraphStructure> {
    graph: G,
    original_nodes: BTreeMap<NodeId<G>, G::Node>,
    original_edges: BTreeSet<(NodeId<G>, NodeId<G>)>,
    notifier: ChangeNotifier,
}

impl<G: GraphStructure> Deref for TrackedGraph<G> {
    type Target = G;

    fn deref(&self) -> &G {
        &self.graph
    }
}

impl<G: GraphStructure> TrackedGraph<G> {
    pub fn new(graph: G) -> Self {
        let mut tracked = Self {
            graph,
            original_nodes: BTreeMap::new(),
            original_edges: BTreeSet::new(),
            notifier: ChangeNotifier::new(),
        };
        tracked.reset_tracking();
        tracked
    }

    /// A graph whose every node and edge counts as added.
    pub fn new_untracked_baseline(graph: G) -> Self {
        let mut tracked = Self {
            graph,
            original_nodes: BTreeMap::new(),
            original_edges: BTreeSet::new(),
            notifier: ChangeNotifier::new(),
        };
        tracked.attach_nodes();
        tracked.notifier.notify();
        tracked
    }

    pub fn node_mut(&mut self, id: NodeId<G>) -> Option<&mut G::Node> {
        self.notifier.notify();
        self.graph.node_mut(id)
    }

    #[must_use]
    pub fn added_nodes(&self) -> Vec<NodeId<G>> {
        self.graph
            .digraph()
            .node_ids()
            .filter(|id| !self.original_nodes.contains_key(id))
            .collect()
    }

    #[must_use]
    pub fn removed_nodes(&self) -> Vec<NodeId<G>> {
        let graph = self.graph.digraph();
        self.original_nodes.keys().filter(|id| !graph.contains(**id)).copied().collect()
    }

    #[must_use]
    pub fn changed_nodes(&self) -> Vec<NodeId<G>> {
        self.graph
            .digraph()
            .nodes()
            .filter(|node| {
                self.original_nodes
                    .get(&node.id())
                    .is_some_and(|original| original != *node || node.is_changed())
            })
            .map(Identified::id)
            .collect()
    }

    #[must_use]
    pub fn added_edges(&self) -> Vec<(NodeId<G>, NodeId<G>)> {
        self.graph
            .digraph()
            .edges()
            .map(|(source, target, _)| (source, target))
            .filter(|edge| !self.original_edges.contains(edge))
            .collect()
    }

    #[must_use]
    pub fn removed_edges(&self) -> Vec<(NodeId<G>, NodeId<G>)> {
        let graph = self.graph.digraph();
        self.original_edges
            .iter()
            .filter(|(source, target)| graph.edge(*source, *target).is_none())
            .copied()
            .collect()
    }

    /// Snapshot node as of the last reset.
    #[must_use]
    pub fn original_node(&self, id: NodeId<G>) -> Option<&G::Node> {
        self.original_nodes.get(&id)
    }

    /// Swap a transient node id for its stored id, remapping pending diffs.
    ///
    /// # Errors
    /// Propagates graph re-keying errors.
    pub fn replace_id(&mut self, old: NodeId<G>, new: NodeId<G>) -> Result<(), DomainError> {
        self.graph.replace_node_id(old, new)?;
        if let Some(mut original) = self.original_nodes.remove(&old) {
            original.set_id(new);
            self.original_nodes.insert(new, original);
        }
        let remapped: BTreeSet<_> = std::mem::take(&mut self.original_edges)
            .into_iter()
            .map(|(source, target)| {
                (if source == old { new } else { source }, if target == old { new } else { target })
            })
            .collect();
        self.original_edges = remapped;
        Ok(())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.notifier.is_dirty()
    }

    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn into_inner(self) -> G {
        self.graph
    }

    fn mutate<T>(
        &mut self,
        apply: impl FnOnce(&mut G) -> Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        let result = apply(&mut self.graph)?;
        self.notifier.notify();
        self.attach_nodes();
        Ok(result)
    }

    fn attach_nodes(&mut self) {
        let ids: Vec<_> = self.graph.digraph().node_ids().collect();
        for id in ids {
            if let Some(node) = self.graph.node_mut(id) {
                node.attach(&self.notifier);
            }
        }
    }
}

impl<G: GraphStructure> Tracked for TrackedGraph<G> {
    fn is_changed(&self) -> bool {
        !(self.added_nodes().is_empty()
            && self.removed_nodes().is_empty()
            && self.changed_nodes().is_empty()
            && self.added_edges().is_empty()
            && self.removed_edges().is_empty())
    }

    fn reset_tracking(&mut self) {
        let ids: Vec<_> = self.graph.digraph().node_ids().collect();
        for id in &ids {
            if let Some(node) = self.graph.node_mut(*id) {
                node.reset_tracking();
            }
        }
        let graph = self.graph.digraph();
        self.original_nodes = graph.nodes().map(|node| (node.id(), node.clone())).collect();
        self.original_edges = graph.edges().map(|(source, target, _)| (source, target)).collect();
        self.notifier.clear();
        self.attach_nodes();
    }

    fn attach(&mut self, parent: &ChangeNotifier) {
        self.notifier.attach_to(parent);
        self.attach_nodes();
    }
}

impl<N: Identified + Clone + PartialEq + Tracked, E> TrackedGraph<DiGraph<N, E>> {
    /// # Errors
    /// Propagates [`DiGraph::add_node`] errors.
    pub fn add_node(&mut self, model: N) -> Result<N::Id, DomainError> {
        self.mutate(|graph| graph.add_node(model))
    }

    /// # Errors
    /// Propagates [`DiGraph::add_edge`] errors.
    pub fn add_edge(&mut self, source: N::Id, target: N::Id, attrs: E) -> Result<(), DomainError> {
        self.mutate(|graph| graph.add_edge(source, target, attrs))
    }

    /// # Errors
    /// Propagates [`DiGraph::remove_edge`] errors.
    pub fn remove_edge(&mut self, source: N::Id, target: N::Id) -> Result<E, DomainError> {
        self.mutate(|graph| graph.remove_edge(source, target))
    }

    /// # Errors
    /// Propagates [`DiGraph::remove_nodes_from`] errors.
    pub fn remove_nodes_from(&mut self, ids: &[N::Id]) -> Result<Vec<N>, DomainError> {
        self.mutate(|graph| graph.remove_nodes_from(ids))
    }
}

impl<N: Identified + Clone + PartialEq + Tracked, E> TrackedGraph<Tree<N, E>> {
    /// # Errors
    /// Propagates [`Tree::add_child`] errors.
    pub fn add_child(&mut self, parent: N::Id, model: N, attrs: E) -> Result<N::Id, DomainError> {
        self.mutate(|tree| tree.add_child(parent, model, attrs))
    }

    /// # Errors
    /// Propagates [`Tree::insert_root`] errors.
    pub fn insert_root(&mut self, model: N, attrs: E) -> Result<N::Id, DomainError> {
        self.mutate(|tree| tree.insert_root(model, attrs))
    }

    /// # Errors
    /// Propagates [`Tree::change_source`] errors.
    pub fn change_source(&mut self, node: N::Id, new_parent: N::Id) -> Result<(), DomainError> {
        self.mutate(|tree| tree.change_source(node, new_parent))
    }

    /// # Errors
    /// Propagates [`Tree::remove_nodes_from`] errors.
    pub fn remove_nodes_from(&mut self, ids: &[N::Id]) -> Result<Vec<N>, DomainError> {
        self.mutate(|tree| tree.remove_nodes_from(ids))
    }

    /// Detach the subtree at `node`.
    ///
    /// The subtree's snapshots move with it, so pending edits stay visible as changes
    /// in the detached graph and only the cut parent edge shows up as removed here.
    ///
    /// # Errors
    /// Propagates [`Tree::split_off`] errors.
    pub fn split_off(&mut self, node: N::Id) -> Result<(Self, E), DomainError> {
        let (tree, attrs) = self.mutate(|tree| tree.split_off(node))?;
        let ids: BTreeSet<N::Id> = tree.node_ids().collect();
        let original_nodes =
            ids.iter().filter_map(|id| self.original_nodes.remove_entry(id)).collect();
        let (original_edges, kept): (BTreeSet<_>, BTreeSet<_>) = std::mem::take(&mut self.original_edges)
            .into_iter()
            .partition(|(source, target)| ids.contains(source) && ids.contains(target));
        self.original_edges = kept;
        let mut detached =
            Self { graph: tree, original_nodes, original_edges, notifier: ChangeNotifier::new() };
        detached.attach_nodes();
        Ok((detached, attrs))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn value_set_back_to_original_is_unchanged() {
        let mut value = TrackedValue::new("a".to_string());
        value.set("b".to_string());
        assert!(value.is_changed());
        value.set("a".to_string());
        assert!(!value.is_changed());
    }

    #[test]
    fn list_delete_then_add_cancels() {
        let mut list = TrackedList::new(vec![1_i64, 2, 3]);
        list.remove_item(&2);
        list.push(4);
        list.push(2);
        assert_eq!(list.added(), vec![4]);
        assert!(list.removed().is_empty());
        list.reset_tracking();
        assert!(list.added().is_empty());
        assert!(!list.is_dirty());
    }

    #[test]
    fn map_reports_added_removed_changed() {
        let mut map = TrackedMap::new(BTreeMap::from([(1_i64, 10_i64), (2, 20)]));
        map.insert(1, 11);
        map.remove(&2);
        map.insert(3, 30);
        assert_eq!(map.changed(), vec![1]);
        assert_eq!(map.removed(), vec![2]);
        assert_eq!(map.added(), vec![3]);

        map.insert(2, 20);
        assert!(map.removed().is_empty());
        assert!(map.changed().iter().all(|key| *key != 2));
    }

    #[test]
    fn nested_map_changes_reach_the_root_flag() {
        let inner = TrackedMap::new(BTreeMap::from([(1_i64, true)]));
        let mut outer = TrackedMap::new(BTreeMap::from([(7_i64, inner)]));
        assert!(!outer.is_dirty());
        if let Some(inner) = outer.get_mut(&7) {
            inner.insert(1, false);
        }
        assert!(outer.is_dirty());
        assert_eq!(outer.changed(), vec![7]);
        outer.reset_tracking();
        assert!(!outer.is_changed());
    }

    #[test]
    fn replace_key_keeps_pending_diffs() -> Result<(), DomainError> {
        let mut map = TrackedMap::new(BTreeMap::from([(1_i64, 10_i64)]));
        map.insert(-1, 5);
        map.replace_key(&-1, 2)?;
        assert_eq!(map.added(), vec![2]);
        map.insert(1, 12);
        map.replace_key(&1, 9)?;
        assert_eq!(map.changed(), vec![9]);
        Ok(())
    }

    #[test]
    fn set_replace_carries_state() {
        let mut set = TrackedSet::new(BTreeSet::from([1_i64]));
        set.insert(-1);
        set.replace(&-1, 5);
        assert_eq!(set.added(), BTreeSet::from([5]));
        assert!(set.removed().is_empty());
    }

    #[test]
    fn graph_tracks_nodes_and_edges_and_remaps_ids() -> Result<(), DomainError> {
        let mut tree = TrackedGraph::new(Tree::new(EntryId(1)));
        tree.add_child(EntryId(1), EntryId(-1), ())?;
        assert_eq!(tree.added_nodes(), vec![EntryId(-1)]);
        assert_eq!(tree.added_edges(), vec![(EntryId(1), EntryId(-1))]);

        tree.replace_id(EntryId(-1), EntryId(2))?;
        assert_eq!(tree.added_nodes(), vec![EntryId(2)]);
        tree.reset_tracking();
        assert!(!tree.is_changed());

        tree.remove_nodes_from(&[EntryId(2)])?;
        assert_eq!(tree.removed_nodes(), vec![EntryId(2)]);
        assert_eq!(tree.removed_edges(), vec![(EntryId(1), EntryId(2))]);
        Ok(())
    }

    #[test]
    fn digraph_tracking_cancels_readded_edge() -> Result<(), DomainError> {
        let mut graph = DiGraph::new();
        graph.add_node(EntryId(1))?;
        graph.add_node(EntryId(2))?;
        graph.add_edge(EntryId(1), EntryId(2), ())?;
        let mut tracked = TrackedGraph::new(graph);
        tracked.remove_edge(EntryId(1), EntryId(2))?;
        tracked.add_edge(EntryId(1), EntryId(2), ())?;
        assert!(!tracked.is_changed());
        assert!(tracked.is_dirty());
        Ok(())
    }

    proptest! {
        #[test]
        fn list_diff_matches_snapshot(
            initial in proptest::collection::vec(0_i64..6, 0..8),
            ops in proptest::collection::vec((any::<bool>(), 0_i64..6), 0..20),
        ) {
            let mut list = TrackedList::new(initial.clone());
            for (push, value) in ops {
                if push {
                    list.push(value);
                } else {
                    list.remove_item(&value);
                }
            }
            let mut rebuilt = initial;
            for removed in list.removed() {
                if let Some(index) = rebuilt.iter().position(|item| *item == removed) {
                    rebuilt.remove(index);
                }
            }
            rebuilt.extend(list.added());
            rebuilt.sort_unstable();
            let mut current = list.to_vec();
            current.sort_unstable();
            prop_assert_eq!(rebuilt, current);
        }
    }
}
