//! The consumer's local copy of a provider MDIB.
//!
//! Entries keep what the reports delivered (descriptor plus flat state list)
//! and materialize a typed [`Entity`] only on lookup. The materialized copy
//! is cached until the entry is written again.

use crate::store::{HasDescriptor, VersionArchive};
use crate::{
    error::Result, Category, DescriptionModificationReport, Descriptor, Entity, EntityMap, Error,
    Handle, MdibEvent, MdibSnapshot, MdibVersionGroup, ModificationKind, NodeType, Report,
    ReportBody, State, Traversal, Version,
};
use crate::version::Acceptance;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub(crate) struct ReplicaEntry {
    descriptor: Descriptor,
    states: Vec<State>,
    materialized: Option<Entity>,
}

impl HasDescriptor for ReplicaEntry {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }
}

impl ReplicaEntry {
    fn new(descriptor: Descriptor, states: Vec<State>) -> Self {
        Self {
            descriptor,
            states,
            materialized: None,
        }
    }

    fn materialize(&mut self) -> Result<Entity> {
        if let Some(entity) = &self.materialized {
            if entity.descriptor().descriptor_version == self.descriptor.descriptor_version {
                return Ok(entity.clone());
            }
        }
        let entity = Entity::from_parts(self.descriptor.clone(), self.states.clone())?;
        self.materialized = Some(entity.clone());
        Ok(entity)
    }

    /// Replace or add one state. Older versions and identical copies are
    /// ignored. Returns whether the entry changed.
    fn put_state(&mut self, state: State) -> bool {
        match self.states.iter_mut().find(|s| s.key() == state.key()) {
            Some(existing) if existing.state_version > state.state_version || *existing == state => {
                false
            }
            Some(existing) => {
                *existing = state;
                self.materialized = None;
                true
            }
            None => {
                self.states.push(state);
                self.materialized = None;
                true
            }
        }
    }
}

/// A delivered state must belong to the descriptor, match its category and
/// carry its own handle exactly when the descriptor is multi-state.
fn check_state(descriptor: &Descriptor, state: &State) -> Result<()> {
    if state.descriptor_handle != descriptor.handle {
        return Err(Error::ForeignState {
            state: state.key().to_string(),
            descriptor: descriptor.handle.clone(),
        });
    }
    if state.category() != descriptor.category() {
        return Err(Error::CategoryMismatch {
            handle: state.key().to_string(),
            expected: descriptor.category(),
            actual: state.category(),
        });
    }
    if descriptor.node_type.is_multi_state() != state.handle.is_some() {
        return Err(Error::VersionInvariant {
            handle: state.key().to_string(),
            detail: "state handle does not fit the descriptor's cardinality".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub(crate) struct Replica {
    entities: EntityMap<ReplicaEntry>,
    /// Mirrors the provider's archive so exported snapshots restore faithfully
    archive: VersionArchive,
    version_group: Option<MdibVersionGroup>,
}

impl Replica {
    /// Replace the whole replica with a snapshot.
    pub(crate) fn load(&mut self, mut snapshot: MdibSnapshot) -> Result<()> {
        let synthesized = snapshot.normalize();
        if !synthesized.is_empty() {
            debug!(count = synthesized.len(), "synthesized missing default states");
        }
        snapshot.validate()?;
        let archive = std::mem::take(&mut snapshot.retired);

        let mut grouped: BTreeMap<Handle, Vec<State>> = BTreeMap::new();
        for state in snapshot.states.into_values() {
            grouped
                .entry(state.descriptor_handle.clone())
                .or_default()
                .push(state);
        }

        let mut entities = EntityMap::new();
        for descriptor in snapshot.descriptors.into_values() {
            let states = grouped.remove(&descriptor.handle).unwrap_or_default();
            for state in &states {
                check_state(&descriptor, state)?;
            }
            entities.insert(ReplicaEntry::new(descriptor, states));
        }

        self.entities = entities;
        self.archive = archive;
        self.version_group = Some(snapshot.version_group);
        Ok(())
    }

    pub(crate) fn invalidate(&mut self) {
        self.entities.clear();
        self.archive = VersionArchive::new();
        self.version_group = None;
    }

    pub(crate) fn version_group(&self) -> Option<&MdibVersionGroup> {
        self.version_group.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }

    pub(crate) fn entity(&mut self, handle: &str) -> Option<Entity> {
        let entry = self.entities.get_mut(handle)?;
        match entry.materialize() {
            Ok(entity) => Some(entity),
            Err(error) => {
                warn!(handle, %error, "replica entry cannot be materialized");
                None
            }
        }
    }

    fn materialize_all(&mut self, handles: Vec<Handle>) -> Vec<Entity> {
        handles.iter().filter_map(|h| self.entity(h)).collect()
    }

    fn handles_of(entries: Vec<&ReplicaEntry>) -> Vec<Handle> {
        entries.into_iter().map(|e| e.descriptor.handle.clone()).collect()
    }

    pub(crate) fn by_node_type(&mut self, node_type: NodeType) -> Vec<Entity> {
        let handles = Self::handles_of(self.entities.by_node_type(node_type));
        self.materialize_all(handles)
    }

    pub(crate) fn by_parent_handle(&mut self, parent: Option<&str>) -> Vec<Entity> {
        let handles = Self::handles_of(self.entities.by_parent_handle(parent));
        self.materialize_all(handles)
    }

    pub(crate) fn by_coding(&mut self, coding: &crate::CodedValue) -> Vec<Entity> {
        let handles = Self::handles_of(self.entities.by_coding(coding));
        self.materialize_all(handles)
    }

    pub(crate) fn subtree(&mut self, root: &str, order: Traversal, include_root: bool) -> Vec<Entity> {
        let handles = self.entities.subtree_handles(root, order, include_root);
        self.materialize_all(handles)
    }

    /// Export the replica in snapshot form.
    pub(crate) fn snapshot(&self) -> Result<MdibSnapshot> {
        let group = self.version_group.clone().ok_or(Error::NotInitialized)?;
        let mut snapshot = MdibSnapshot::new(group);
        for entry in self.entities.values() {
            snapshot.add_descriptor(entry.descriptor.clone());
            for state in &entry.states {
                snapshot.add_state(state.clone());
            }
        }
        snapshot.retired = self.archive.clone();
        Ok(snapshot)
    }

    /// Apply one report.
    ///
    /// Errors classify the outcome: [`Error::StaleReport`] and
    /// [`Error::SessionReset`] leave the replica untouched, structural errors
    /// mean the report was malformed and nothing of it was applied.
    pub(crate) fn apply(&mut self, report: &Report) -> Result<Option<MdibEvent>> {
        let local = self.version_group.as_ref().ok_or(Error::NotInitialized)?;
        let incoming = &report.version_group;
        match local.accepts(incoming) {
            Acceptance::SessionReset => {
                return Err(Error::SessionReset {
                    expected: local.session(),
                    received: incoming.session(),
                })
            }
            Acceptance::Stale => {
                return Err(Error::StaleReport {
                    local: local.mdib_version,
                    received: incoming.mdib_version,
                })
            }
            Acceptance::Apply { gap } if gap > 1 => {
                warn!(
                    local = local.mdib_version,
                    received = incoming.mdib_version,
                    kind = %report.kind(),
                    "version gap, notifications were probably missed"
                );
            }
            Acceptance::Apply { .. } => {}
        }

        let version = incoming.mdib_version;
        let event = match &report.body {
            ReportBody::Description(body) => self.apply_description(body, version)?,
            ReportBody::Metric(r) => self.apply_states(Category::Metric, &r.states, version)?,
            ReportBody::Alert(r) => self.apply_states(Category::Alert, &r.states, version)?,
            ReportBody::Component(r) => self.apply_states(Category::Component, &r.states, version)?,
            ReportBody::Operational(r) => {
                self.apply_states(Category::Operational, &r.states, version)?
            }
            ReportBody::Context(r) => self.apply_states(Category::Context, &r.states, version)?,
            ReportBody::Waveform(r) => {
                self.apply_states(Category::RealTimeSample, &r.states, version)?
            }
        };

        if let Some(group) = self.version_group.as_mut() {
            group.mdib_version = group.mdib_version.max(version);
        }
        Ok(event)
    }

    fn apply_states(
        &mut self,
        category: Category,
        states: &[State],
        version: Version,
    ) -> Result<Option<MdibEvent>> {
        for state in states {
            let entry = self
                .entities
                .get(&state.descriptor_handle)
                .ok_or_else(|| Error::EntityNotFound(state.descriptor_handle.clone()))?;
            if entry.descriptor.category() != category {
                return Err(Error::CategoryMismatch {
                    handle: state.key().to_string(),
                    expected: category,
                    actual: entry.descriptor.category(),
                });
            }
            check_state(&entry.descriptor, state)?;
        }

        let mut handles = Vec::new();
        for state in states {
            let Some(entry) = self.entities.get_mut(&state.descriptor_handle) else {
                continue;
            };
            let key = state.key().to_string();
            if entry.put_state(state.clone()) {
                handles.push(key);
            } else {
                debug!(handle = %key, state_version = state.state_version, "state already current");
            }
        }

        if handles.is_empty() {
            return Ok(None);
        }
        debug!(%category, mdib_version = version, count = handles.len(), "applied states");
        Ok(Some(MdibEvent::StatesUpdated {
            category,
            handles,
            mdib_version: version,
        }))
    }

    fn check_description(&self, report: &DescriptionModificationReport) -> Result<()> {
        let mut types: HashMap<&str, NodeType> = self
            .entities
            .values()
            .map(|e| (e.descriptor.handle.as_str(), e.descriptor.node_type))
            .collect();

        for part in &report.parts {
            for state in &part.states {
                if !part
                    .descriptors
                    .iter()
                    .any(|d| d.handle == state.descriptor_handle)
                {
                    return Err(Error::ForeignState {
                        state: state.key().to_string(),
                        descriptor: state.descriptor_handle.clone(),
                    });
                }
            }
            if part.modification == ModificationKind::Delete {
                continue;
            }

            for descriptor in &part.descriptors {
                let parent_type = match descriptor.parent_handle.as_deref() {
                    None => None,
                    Some(parent) => Some(types.get(parent).copied().ok_or_else(|| {
                        Error::UnknownParent {
                            handle: descriptor.handle.clone(),
                            parent: parent.to_string(),
                        }
                    })?),
                };
                if !descriptor.node_type.accepts_parent(parent_type) {
                    return Err(Error::InvalidParent {
                        handle: descriptor.handle.clone(),
                        node_type: descriptor.node_type,
                        parent: parent_type,
                    });
                }

                let mut count = 0;
                for state in part.states_of(&descriptor.handle) {
                    check_state(descriptor, state)?;
                    count += 1;
                }
                if !descriptor.node_type.is_multi_state() && count != 1 {
                    return Err(Error::MissingState(descriptor.handle.clone()));
                }
                types.insert(descriptor.handle.as_str(), descriptor.node_type);
            }
        }
        Ok(())
    }

    fn apply_description(
        &mut self,
        report: &DescriptionModificationReport,
        version: Version,
    ) -> Result<Option<MdibEvent>> {
        self.check_description(report)?;

        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();

        for part in &report.parts {
            if part.modification == ModificationKind::Delete {
                for descriptor in &part.descriptors {
                    let subtree =
                        self.entities
                            .subtree_handles(&descriptor.handle, Traversal::DepthFirst, true);
                    if subtree.is_empty() {
                        debug!(handle = %descriptor.handle, "delete of unknown entity ignored");
                    }
                    for handle in subtree {
                        if let Some(entry) = self.entities.remove(&handle) {
                            self.archive.archive_parts(&entry.descriptor, &entry.states);
                        }
                        deleted.push(handle);
                    }
                }
                continue;
            }

            for descriptor in &part.descriptors {
                let states: Vec<State> = part.states_of(&descriptor.handle).cloned().collect();
                if let Some(existing) = self.entities.get(&descriptor.handle) {
                    if existing.descriptor.descriptor_version > descriptor.descriptor_version {
                        debug!(handle = %descriptor.handle, "older descriptor ignored");
                        continue;
                    }
                    if existing.descriptor == *descriptor && existing.states == states {
                        continue;
                    }
                }
                let replaced = self
                    .entities
                    .insert(ReplicaEntry::new(descriptor.clone(), states))
                    .is_some();
                match part.modification {
                    ModificationKind::Create if replaced => {
                        debug!(handle = %descriptor.handle, "create replaced an existing entity");
                        created.push(descriptor.handle.clone());
                    }
                    ModificationKind::Create => created.push(descriptor.handle.clone()),
                    _ => updated.push(descriptor.handle.clone()),
                }
            }
        }

        if created.is_empty() && updated.is_empty() && deleted.is_empty() {
            return Ok(None);
        }
        debug!(
            mdib_version = version,
            created = created.len(),
            updated = updated.len(),
            deleted = deleted.len(),
            "applied description modification"
        );
        Ok(Some(MdibEvent::DescriptorsChanged {
            created,
            updated,
            deleted,
            mdib_version: version,
        }))
    }
}
