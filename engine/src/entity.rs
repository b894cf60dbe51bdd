//! Entities: a descriptor together with its state or states.

use crate::{
    error::Result, state::now_millis, Category, ContextAssociation, Descriptor, Error, Handle,
    NodeType, State, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// A descriptor with exactly one current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleStateEntity {
    pub descriptor: Descriptor,
    pub state: State,
}

/// A context descriptor owning a set of states keyed by their own handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiStateEntity {
    pub descriptor: Descriptor,
    pub states: BTreeMap<Handle, State>,
}

/// Descriptor plus state(s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Single(SingleStateEntity),
    Multi(MultiStateEntity),
}

/// Version counters of an entity, compared by facades to skip needless copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityVersions {
    pub descriptor: Version,
    pub states: BTreeMap<Handle, Version>,
}

impl MultiStateEntity {
    /// Add a new `NoAssociation` state under `handle`, replacing any existing
    /// one, and return it for editing.
    pub fn new_state(&mut self, handle: impl Into<Handle>) -> &mut State {
        let handle = handle.into();
        let state = State::context(handle.clone(), &self.descriptor);
        match self.states.entry(handle) {
            Entry::Occupied(mut slot) => {
                slot.insert(state);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(state),
        }
    }

    pub fn state(&self, handle: &str) -> Option<&State> {
        self.states.get(handle)
    }

    pub fn state_mut(&mut self, handle: &str) -> Option<&mut State> {
        self.states.get_mut(handle)
    }

    /// States currently `Associated`.
    pub fn associated_states(&self) -> impl Iterator<Item = &State> {
        self.states.values().filter(|s| {
            s.context_state()
                .map(|c| c.association == ContextAssociation::Associated)
                .unwrap_or(false)
        })
    }

    /// Disassociate every state except `ignored_handle`.
    ///
    /// States that are not already `Disassociated` move to `Disassociated`,
    /// get `unbinding_version` (unless one is set) and an end time. Returns the
    /// handles that changed. Keeping at most one associated state is up to
    /// the caller: call this before associating a new state.
    pub fn disassociate_all(
        &mut self,
        unbinding_version: Version,
        ignored_handle: Option<&str>,
    ) -> Vec<Handle> {
        let now = now_millis();
        let mut changed = Vec::new();
        for (handle, state) in self.states.iter_mut() {
            if Some(handle.as_str()) == ignored_handle {
                continue;
            }
            let Some(context) = state.context_state_mut() else {
                continue;
            };
            if context.association == ContextAssociation::Disassociated {
                continue;
            }
            context.association = ContextAssociation::Disassociated;
            if context.unbinding_mdib_version.is_none() {
                context.unbinding_mdib_version = Some(unbinding_version);
            }
            context.binding_end_time = Some(now);
            changed.push(handle.clone());
        }
        changed
    }
}

impl Entity {
    /// A new entity with default state(s) for its node type: one state for
    /// single-state descriptors, none for context descriptors.
    pub fn new(descriptor: Descriptor) -> Self {
        if descriptor.node_type.is_multi_state() {
            Entity::Multi(MultiStateEntity {
                descriptor,
                states: BTreeMap::new(),
            })
        } else {
            let state = State::for_descriptor(&descriptor);
            Entity::Single(SingleStateEntity { descriptor, state })
        }
    }

    /// Assemble an entity from a descriptor and a flat list of its states,
    /// validating ownership, category and cardinality.
    pub fn from_parts(descriptor: Descriptor, states: Vec<State>) -> Result<Self> {
        for state in &states {
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
        }

        if descriptor.node_type.is_multi_state() {
            let mut map = BTreeMap::new();
            for state in states {
                let handle = state
                    .handle
                    .clone()
                    .ok_or_else(|| Error::MissingState(descriptor.handle.clone()))?;
                map.insert(handle, state);
            }
            return Ok(Entity::Multi(MultiStateEntity {
                descriptor,
                states: map,
            }));
        }

        let mut states = states.into_iter();
        match (states.next(), states.next()) {
            (Some(state), None) => Ok(Entity::Single(SingleStateEntity { descriptor, state })),
            (None, _) => Err(Error::MissingState(descriptor.handle)),
            (Some(_), Some(_)) => Err(Error::VersionInvariant {
                handle: descriptor.handle,
                detail: "single-state descriptor with several states".to_string(),
            }),
        }
    }

    /// Split into descriptor and flat state list.
    pub fn into_parts(self) -> (Descriptor, Vec<State>) {
        match self {
            Entity::Single(e) => (e.descriptor, vec![e.state]),
            Entity::Multi(e) => (e.descriptor, e.states.into_values().collect()),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Entity::Single(e) => &e.descriptor,
            Entity::Multi(e) => &e.descriptor,
        }
    }

    pub fn descriptor_mut(&mut self) -> &mut Descriptor {
        match self {
            Entity::Single(e) => &mut e.descriptor,
            Entity::Multi(e) => &mut e.descriptor,
        }
    }

    pub fn handle(&self) -> &str {
        &self.descriptor().handle
    }

    pub fn parent_handle(&self) -> Option<&str> {
        self.descriptor().parent_handle.as_deref()
    }

    pub fn node_type(&self) -> NodeType {
        self.descriptor().node_type
    }

    pub fn category(&self) -> Category {
        self.descriptor().category()
    }

    /// All states, in handle order for context entities.
    pub fn states(&self) -> Vec<&State> {
        match self {
            Entity::Single(e) => vec![&e.state],
            Entity::Multi(e) => e.states.values().collect(),
        }
    }

    pub fn states_mut(&mut self) -> Vec<&mut State> {
        match self {
            Entity::Single(e) => vec![&mut e.state],
            Entity::Multi(e) => e.states.values_mut().collect(),
        }
    }

    /// The single state, if this is a single-state entity.
    pub fn state(&self) -> Option<&State> {
        match self {
            Entity::Single(e) => Some(&e.state),
            Entity::Multi(_) => None,
        }
    }

    pub fn state_mut(&mut self) -> Option<&mut State> {
        match self {
            Entity::Single(e) => Some(&mut e.state),
            Entity::Multi(_) => None,
        }
    }

    pub fn as_multi(&self) -> Option<&MultiStateEntity> {
        match self {
            Entity::Multi(e) => Some(e),
            Entity::Single(_) => None,
        }
    }

    pub fn as_multi_mut(&mut self) -> Option<&mut MultiStateEntity> {
        match self {
            Entity::Multi(e) => Some(e),
            Entity::Single(_) => None,
        }
    }

    /// Shortcut to the metric payload of a single-state metric entity.
    pub fn metric(&self) -> Option<&crate::MetricState> {
        self.state().and_then(State::metric)
    }

    pub fn metric_mut(&mut self) -> Option<&mut crate::MetricState> {
        self.state_mut().and_then(State::metric_mut)
    }

    pub fn alert(&self) -> Option<&crate::AlertState> {
        self.state().and_then(State::alert)
    }

    pub fn alert_mut(&mut self) -> Option<&mut crate::AlertState> {
        self.state_mut().and_then(State::alert_mut)
    }

    pub fn versions(&self) -> EntityVersions {
        EntityVersions {
            descriptor: self.descriptor().descriptor_version,
            states: self
                .states()
                .into_iter()
                .map(|s| (s.key().to_string(), s.state_version))
                .collect(),
        }
    }

    /// Check that the entity shape matches its node type and that every
    /// state belongs to the descriptor.
    pub fn validate(&self) -> Result<()> {
        let descriptor = self.descriptor();
        match self {
            Entity::Single(_) if descriptor.node_type.is_multi_state() => {
                return Err(Error::VersionInvariant {
                    handle: descriptor.handle.clone(),
                    detail: "context descriptor stored as single-state entity".to_string(),
                })
            }
            Entity::Multi(_) if !descriptor.node_type.is_multi_state() => {
                return Err(Error::VersionInvariant {
                    handle: descriptor.handle.clone(),
                    detail: "single-state descriptor stored as multi-state entity".to_string(),
                })
            }
            _ => {}
        }
        for state in self.states() {
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
        }
        if let Entity::Multi(e) = self {
            for (key, state) in &e.states {
                if state.handle.as_deref() != Some(key.as_str()) {
                    return Err(Error::VersionInvariant {
                        handle: key.clone(),
                        detail: "context state stored under a foreign handle".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricSample, MetricValue};

    fn patient_context() -> MultiStateEntity {
        let descriptor = Descriptor::new("pat", Some("sc0"), NodeType::PatientContext);
        match Entity::new(descriptor) {
            Entity::Multi(e) => e,
            Entity::Single(_) => panic!("context must be multi-state"),
        }
    }

    fn set_association(entity: &mut MultiStateEntity, handle: &str, value: ContextAssociation) {
        entity.new_state(handle).context_state_mut().unwrap().association = value;
    }

    #[test]
    fn new_entity_shapes() {
        let metric = Entity::new(Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric));
        assert!(metric.state().is_some());
        assert_eq!(metric.states().len(), 1);

        let context = Entity::new(Descriptor::new("pat", Some("sc0"), NodeType::PatientContext));
        assert!(context.as_multi().is_some());
        assert!(context.states().is_empty());
    }

    #[test]
    fn from_parts_requires_a_state() {
        let d = Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric);
        let err = Entity::from_parts(d, vec![]).unwrap_err();
        assert_eq!(err, Error::MissingState("hr".into()));
    }

    #[test]
    fn from_parts_rejects_foreign_state() {
        let d = Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric);
        let other = Descriptor::new("spo2", Some("ch0"), NodeType::NumericMetric);
        let err = Entity::from_parts(d, vec![State::for_descriptor(&other)]).unwrap_err();
        assert!(matches!(err, Error::ForeignState { .. }));
    }

    #[test]
    fn from_parts_roundtrip() {
        let mut entity = Entity::new(Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric));
        entity.metric_mut().unwrap().value = Some(MetricValue::valid(MetricSample::Numeric(60.0)));
        let (descriptor, states) = entity.clone().into_parts();
        assert_eq!(Entity::from_parts(descriptor, states).unwrap(), entity);
    }

    #[test]
    fn disassociate_all_skips_ignored_and_already_disassociated() {
        let mut entity = patient_context();
        set_association(&mut entity, "s1", ContextAssociation::Associated);
        set_association(&mut entity, "s2", ContextAssociation::Disassociated);

        let changed = entity.disassociate_all(5, Some("s1"));
        assert!(changed.is_empty());
        assert_eq!(
            entity.state("s1").unwrap().context_state().unwrap().association,
            ContextAssociation::Associated
        );
    }

    #[test]
    fn disassociate_all_stamps_unbinding() {
        let mut entity = patient_context();
        set_association(&mut entity, "s1", ContextAssociation::Associated);
        set_association(&mut entity, "s2", ContextAssociation::NoAssociation);
        set_association(&mut entity, "s3", ContextAssociation::Associated);
        entity
            .state_mut("s3")
            .unwrap()
            .context_state_mut()
            .unwrap()
            .unbinding_mdib_version = Some(2);

        let changed = entity.disassociate_all(9, Some("s2"));
        assert_eq!(changed, vec!["s1".to_string(), "s3".to_string()]);

        let s1 = entity.state("s1").unwrap().context_state().unwrap();
        assert_eq!(s1.association, ContextAssociation::Disassociated);
        assert_eq!(s1.unbinding_mdib_version, Some(9));
        assert!(s1.binding_end_time.is_some());

        // an existing unbinding version is kept
        let s3 = entity.state("s3").unwrap().context_state().unwrap();
        assert_eq!(s3.unbinding_mdib_version, Some(2));

        assert_eq!(entity.associated_states().count(), 0);
    }

    #[test]
    fn validate_catches_shape_mismatch() {
        let descriptor = Descriptor::new("pat", Some("sc0"), NodeType::PatientContext);
        let state = State::context("p1", &descriptor);
        let bogus = Entity::Single(SingleStateEntity { descriptor, state });
        assert!(matches!(
            bogus.validate(),
            Err(Error::VersionInvariant { .. })
        ));
    }

    #[test]
    fn versions_track_state_keys() {
        let mut entity = patient_context();
        entity.new_state("p1").state_version = 3;
        entity.descriptor.descriptor_version = 2;
        let versions = Entity::Multi(entity).versions();
        assert_eq!(versions.descriptor, 2);
        assert_eq!(versions.states.get("p1"), Some(&3));
    }
}
