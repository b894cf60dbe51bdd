//! Entity storage shared by the provider store and the consumer replica.
//!
//! [`EntityMap`] holds entries keyed by handle and answers the structural
//! lookups (by node type, by parent, by coding, subtree). [`VersionArchive`]
//! remembers the last version ever assigned per handle so that a recreated
//! handle never reuses a version.

use crate::{CodedValue, Descriptor, Entity, Handle, NodeType, State, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Anything stored in an [`EntityMap`] exposes its descriptor.
pub trait HasDescriptor {
    fn descriptor(&self) -> &Descriptor;
}

impl HasDescriptor for Entity {
    fn descriptor(&self) -> &Descriptor {
        Entity::descriptor(self)
    }
}

/// Subtree traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Traversal {
    #[default]
    DepthFirst,
    BreadthFirst,
}

/// Entries keyed by descriptor handle.
///
/// Uses BTreeMap so that lookups and snapshots come out in handle order.
#[derive(Debug, Clone)]
pub struct EntityMap<E> {
    entries: BTreeMap<Handle, E>,
}

impl<E> Default for EntityMap<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<E: HasDescriptor> EntityMap<E> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: &str) -> Option<&E> {
        self.entries.get(handle)
    }

    pub fn get_mut(&mut self, handle: &str) -> Option<&mut E> {
        self.entries.get_mut(handle)
    }

    /// Insert or replace the entry for its descriptor's handle.
    pub fn insert(&mut self, entry: E) -> Option<E> {
        self.entries
            .insert(entry.descriptor().handle.clone(), entry)
    }

    pub fn remove(&mut self, handle: &str) -> Option<E> {
        self.entries.remove(handle)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn handles(&self) -> impl Iterator<Item = &Handle> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    /// Node type of a stored handle.
    pub fn node_type_of(&self, handle: &str) -> Option<NodeType> {
        self.get(handle).map(|e| e.descriptor().node_type)
    }

    pub fn by_node_type(&self, node_type: NodeType) -> Vec<&E> {
        self.values()
            .filter(|e| e.descriptor().node_type == node_type)
            .collect()
    }

    /// Children of `parent`, or the roots when `parent` is `None`.
    pub fn by_parent_handle(&self, parent: Option<&str>) -> Vec<&E> {
        self.values()
            .filter(|e| e.descriptor().parent_handle.as_deref() == parent)
            .collect()
    }

    pub fn by_coding(&self, coding: &CodedValue) -> Vec<&E> {
        self.values()
            .filter(|e| {
                e.descriptor()
                    .coding
                    .as_ref()
                    .map(|c| c.matches(coding))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn child_handles(&self, parent: &str) -> Vec<Handle> {
        self.by_parent_handle(Some(parent))
            .into_iter()
            .map(|e| e.descriptor().handle.clone())
            .collect()
    }

    /// Handles of the subtree rooted at `root`. Empty if `root` is unknown.
    pub fn subtree_handles(
        &self,
        root: &str,
        order: Traversal,
        include_root: bool,
    ) -> Vec<Handle> {
        if !self.contains(root) {
            return Vec::new();
        }

        let mut out = Vec::new();
        match order {
            Traversal::DepthFirst => {
                // pre-order; children pushed in reverse so they pop in handle order
                let mut stack = vec![root.to_string()];
                while let Some(handle) = stack.pop() {
                    let mut children = self.child_handles(&handle);
                    children.reverse();
                    stack.extend(children);
                    out.push(handle);
                }
            }
            Traversal::BreadthFirst => {
                let mut queue = VecDeque::from([root.to_string()]);
                while let Some(handle) = queue.pop_front() {
                    queue.extend(self.child_handles(&handle));
                    out.push(handle);
                }
            }
        }

        if !include_root {
            out.remove(0);
        }
        out
    }

    /// Entries of the subtree rooted at `root`.
    pub fn subtree(&self, root: &str, order: Traversal, include_root: bool) -> Vec<&E> {
        self.subtree_handles(root, order, include_root)
            .iter()
            .filter_map(|h| self.get(h))
            .collect()
    }
}

impl EntityMap<Entity> {
    /// Handle of the entity holding a state keyed `key`, if any.
    pub fn state_owner(&self, key: &str) -> Option<&str> {
        self.values()
            .find(|e| e.states().iter().any(|s| s.key() == key))
            .map(Entity::handle)
    }
}

/// Last descriptor and state versions ever assigned per handle.
///
/// Survives deletion; consulted whenever a handle enters the store again.
/// Travels with snapshots so a restored store keeps honouring it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionArchive {
    #[serde(default)]
    descriptor: BTreeMap<Handle, Version>,
    #[serde(default)]
    state: BTreeMap<Handle, Version>,
}

impl VersionArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.is_empty() && self.state.is_empty()
    }

    /// Record the versions of an entity that is leaving the store.
    pub fn archive(&mut self, entity: &Entity) {
        self.archive_parts(entity.descriptor(), entity.states());
    }

    /// Record the versions of a descriptor and its states.
    pub fn archive_parts<'a>(
        &mut self,
        descriptor: &Descriptor,
        states: impl IntoIterator<Item = &'a State>,
    ) {
        Self::raise(
            &mut self.descriptor,
            &descriptor.handle,
            descriptor.descriptor_version,
        );
        for state in states {
            Self::raise(&mut self.state, state.key(), state.state_version);
        }
    }

    fn raise(map: &mut BTreeMap<Handle, Version>, key: &str, version: Version) {
        let slot = map.entry(key.to_string()).or_insert(version);
        if *slot < version {
            *slot = version;
        }
    }

    pub fn last_descriptor_version(&self, handle: &str) -> Option<Version> {
        self.descriptor.get(handle).copied()
    }

    pub fn last_state_version(&self, key: &str) -> Option<Version> {
        self.state.get(key).copied()
    }

    /// Version for a descriptor entering the store: 0 for a fresh handle,
    /// one past the archived version otherwise.
    pub fn next_descriptor_version(&self, handle: &str) -> Version {
        self.last_descriptor_version(handle)
            .map(|v| v + 1)
            .unwrap_or(0)
    }

    pub fn next_state_version(&self, key: &str) -> Version {
        self.last_state_version(key).map(|v| v + 1).unwrap_or(0)
    }
}
