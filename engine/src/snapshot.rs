//! Full copies of an MDIB, used to bootstrap consumers and restore providers.
//!
//! Snapshots are designed for deterministic serialization: descriptors and
//! states are kept in BTreeMaps keyed by handle.

use crate::store::VersionArchive;
use crate::{error::Result, Descriptor, Entity, Error, Handle, MdibVersionGroup, State};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of every descriptor and state, stamped with the
/// version group it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MdibSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    pub version_group: MdibVersionGroup,
    /// Descriptors by handle
    pub descriptors: BTreeMap<Handle, Descriptor>,
    /// States by state key (own handle for context states, descriptor
    /// handle otherwise)
    pub states: BTreeMap<Handle, State>,
    /// Last versions of handles deleted earlier in this sequence
    #[serde(default, skip_serializing_if = "VersionArchive::is_empty")]
    pub retired: VersionArchive,
}

/// Supplies snapshots to a consumer on `reload_all`.
///
/// Implementations may block; the consumer never holds its replica lock
/// while fetching.
pub trait SnapshotSource: Send + Sync {
    fn fetch_snapshot(&self) -> Result<MdibSnapshot>;
}

impl MdibSnapshot {
    /// Create an empty snapshot.
    pub fn new(version_group: MdibVersionGroup) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            version_group,
            descriptors: BTreeMap::new(),
            states: BTreeMap::new(),
            retired: VersionArchive::new(),
        }
    }

    pub fn add_descriptor(&mut self, descriptor: Descriptor) {
        self.descriptors.insert(descriptor.handle.clone(), descriptor);
    }

    pub fn add_state(&mut self, state: State) {
        self.states.insert(state.key().to_string(), state);
    }

    /// Add an entity's descriptor and all its states.
    pub fn add_entity(&mut self, entity: &Entity) {
        self.add_descriptor(entity.descriptor().clone());
        for state in entity.states() {
            self.add_state(state.clone());
        }
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Give every single-state descriptor without a state its default state.
    ///
    /// Returns the handles that got one.
    pub fn normalize(&mut self) -> Vec<Handle> {
        let with_state: HashSet<&str> = self
            .states
            .values()
            .map(|s| s.descriptor_handle.as_str())
            .collect();
        let missing: Vec<State> = self
            .descriptors
            .values()
            .filter(|d| !d.node_type.is_multi_state() && !with_state.contains(d.handle.as_str()))
            .map(State::for_descriptor)
            .collect();

        let mut added = Vec::with_capacity(missing.len());
        for state in missing {
            added.push(state.descriptor_handle.clone());
            self.add_state(state);
        }
        added
    }

    /// Check structural soundness: resolvable, type-correct and acyclic
    /// parents, states owned by known descriptors.
    pub fn validate(&self) -> Result<()> {
        for descriptor in self.descriptors.values() {
            let parent_type = match descriptor.parent_handle.as_deref() {
                None => None,
                Some(parent) => Some(
                    self.descriptors
                        .get(parent)
                        .map(|p| p.node_type)
                        .ok_or_else(|| Error::UnknownParent {
                            handle: descriptor.handle.clone(),
                            parent: parent.to_string(),
                        })?,
                ),
            };
            if !descriptor.node_type.accepts_parent(parent_type) {
                return Err(Error::InvalidParent {
                    handle: descriptor.handle.clone(),
                    node_type: descriptor.node_type,
                    parent: parent_type,
                });
            }
            self.check_acyclic(descriptor)?;
        }

        for (key, state) in &self.states {
            if key != state.key() {
                return Err(Error::InvalidSnapshot(format!(
                    "state stored under {key} has key {}",
                    state.key()
                )));
            }
            if state.handle.is_some() && self.descriptors.contains_key(key) {
                return Err(Error::DuplicateHandle(key.clone()));
            }
            if !self.descriptors.contains_key(&state.descriptor_handle) {
                return Err(Error::ForeignState {
                    state: key.clone(),
                    descriptor: state.descriptor_handle.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_acyclic(&self, descriptor: &Descriptor) -> Result<()> {
        let mut current = descriptor.parent_handle.as_deref();
        let mut steps = 0;
        while let Some(handle) = current {
            steps += 1;
            if handle == descriptor.handle || steps > self.descriptors.len() {
                return Err(Error::InvalidSnapshot(format!(
                    "cycle through {}",
                    descriptor.handle
                )));
            }
            current = self
                .descriptors
                .get(handle)
                .and_then(|d| d.parent_handle.as_deref());
        }
        Ok(())
    }

    /// Validate and assemble entities, in handle order.
    pub fn into_entities(self) -> Result<Vec<Entity>> {
        self.validate()?;
        let mut grouped: BTreeMap<Handle, Vec<State>> = BTreeMap::new();
        for state in self.states.into_values() {
            grouped
                .entry(state.descriptor_handle.clone())
                .or_default()
                .push(state);
        }
        self.descriptors
            .into_values()
            .map(|descriptor| {
                let states = grouped.remove(&descriptor.handle).unwrap_or_default();
                Entity::from_parts(descriptor, states)
            })
            .collect()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Summary of a snapshot, for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub version_group: MdibVersionGroup,
    pub descriptor_count: usize,
    pub state_count: usize,
}

impl From<&MdibSnapshot> for SnapshotMetadata {
    fn from(snapshot: &MdibSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            version_group: snapshot.version_group.clone(),
            descriptor_count: snapshot.descriptor_count(),
            state_count: snapshot.state_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextAssociation, NodeType};

    fn group() -> MdibVersionGroup {
        MdibVersionGroup::with_version(4, "urn:uuid:snap", None)
    }

    fn tree() -> MdibSnapshot {
        let mut snapshot = MdibSnapshot::new(group());
        for (handle, parent, node_type) in [
            ("mds0", None, NodeType::Mds),
            ("vmd0", Some("mds0"), NodeType::Vmd),
            ("ch0", Some("vmd0"), NodeType::Channel),
            ("hr", Some("ch0"), NodeType::NumericMetric),
            ("sc0", Some("mds0"), NodeType::SystemContext),
            ("pat", Some("sc0"), NodeType::PatientContext),
        ] {
            snapshot.add_entity(&Entity::new(Descriptor::new(handle, parent, node_type)));
        }
        snapshot
    }

    #[test]
    fn create_empty_snapshot() {
        let snapshot = MdibSnapshot::new(group());
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.descriptor_count(), 0);
        assert!(snapshot.into_entities().unwrap().is_empty());
    }

    #[test]
    fn entities_roundtrip() {
        let mut snapshot = tree();
        let pat = snapshot.descriptors["pat"].clone();
        let mut state = State::context("pat-1", &pat);
        state.context_state_mut().unwrap().association = ContextAssociation::Associated;
        snapshot.add_state(state);

        let entities = snapshot.clone().into_entities().unwrap();
        assert_eq!(entities.len(), 6);
        let pat = entities.iter().find(|e| e.handle() == "pat").unwrap();
        assert_eq!(pat.states().len(), 1);

        let mut rebuilt = MdibSnapshot::new(group());
        for entity in &entities {
            rebuilt.add_entity(entity);
        }
        assert_eq!(rebuilt, snapshot);
    }

    #[test]
    fn normalize_fills_missing_single_states() {
        let mut snapshot = tree();
        snapshot.states.remove("hr");
        assert!(matches!(
            snapshot.clone().into_entities(),
            Err(Error::MissingState(_))
        ));

        let added = snapshot.normalize();
        assert_eq!(added, vec!["hr".to_string()]);
        assert!(snapshot.normalize().is_empty());
        assert!(snapshot.into_entities().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_parent() {
        let mut snapshot = tree();
        snapshot.add_descriptor(Descriptor::new("ch9", Some("vmd9"), NodeType::Channel));
        assert!(matches!(
            snapshot.validate(),
            Err(Error::UnknownParent { .. })
        ));
    }

    #[test]
    fn validate_rejects_cycles() {
        let mut snapshot = MdibSnapshot::new(group());
        snapshot.add_descriptor(Descriptor::new("a", Some("b"), NodeType::Vmd));
        snapshot.add_descriptor(Descriptor::new("b", Some("a"), NodeType::Vmd));
        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn validate_rejects_orphan_state() {
        let mut snapshot = tree();
        let ghost = Descriptor::new("ghost", Some("ch0"), NodeType::NumericMetric);
        snapshot.add_state(State::for_descriptor(&ghost));
        assert!(matches!(
            snapshot.validate(),
            Err(Error::ForeignState { .. })
        ));
    }

    #[test]
    fn validate_rejects_context_state_named_like_a_descriptor() {
        let mut snapshot = tree();
        let pat = snapshot.descriptors["pat"].clone();
        snapshot.add_state(State::context("ch0", &pat));
        assert_eq!(
            snapshot.validate(),
            Err(Error::DuplicateHandle("ch0".into()))
        );
    }

    #[test]
    fn json_roundtrip() {
        let snapshot = tree();
        let json = snapshot.to_json().unwrap();
        let restored = MdibSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn deterministic_serialization() {
        let first = tree();
        let mut second = MdibSnapshot::new(group());
        let mut entities = first.clone().into_entities().unwrap();
        entities.reverse();
        for entity in &entities {
            second.add_entity(entity);
        }
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "versionGroup": {"mdibVersion": 0, "sequenceId": "urn:uuid:x"},
            "descriptors": {},
            "states": {}
        }"#;
        assert!(matches!(
            MdibSnapshot::from_json(json),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn snapshot_metadata() {
        let metadata: SnapshotMetadata = (&tree()).into();
        assert_eq!(metadata.descriptor_count, 6);
        assert_eq!(metadata.state_count, 5);
        assert_eq!(metadata.version_group.mdib_version, 4);
    }
}
