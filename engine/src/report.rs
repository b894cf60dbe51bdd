//! Delta reports built from committed transactions.
//!
//! A report carries the version group it was committed at and one category
//! of changes. Reports are self-contained: a state report holds whole states,
//! and a description-modification report holds every created, updated or
//! deleted descriptor together with its states.

use crate::{Category, Entity, MdibVersionGroup, State, TransactionResult, Version};
use serde::{Deserialize, Serialize};

/// Kind of report, one per delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    EpisodicMetric,
    EpisodicAlert,
    EpisodicComponent,
    EpisodicOperationalState,
    EpisodicContext,
    Waveform,
    DescriptionModification,
}

impl ReportKind {
    /// State category carried by this kind; `None` for description reports.
    pub fn category(self) -> Option<Category> {
        match self {
            ReportKind::EpisodicMetric => Some(Category::Metric),
            ReportKind::EpisodicAlert => Some(Category::Alert),
            ReportKind::EpisodicComponent => Some(Category::Component),
            ReportKind::EpisodicOperationalState => Some(Category::Operational),
            ReportKind::EpisodicContext => Some(Category::Context),
            ReportKind::Waveform => Some(Category::RealTimeSample),
            ReportKind::DescriptionModification => None,
        }
    }

    pub fn for_category(category: Category) -> Self {
        match category {
            Category::Metric => ReportKind::EpisodicMetric,
            Category::Alert => ReportKind::EpisodicAlert,
            Category::Component => ReportKind::EpisodicComponent,
            Category::Operational => ReportKind::EpisodicOperationalState,
            Category::Context => ReportKind::EpisodicContext,
            Category::RealTimeSample => ReportKind::Waveform,
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Whole states of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub states: Vec<State>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationKind {
    Create,
    Update,
    Delete,
}

/// Descriptors sharing one modification kind, with their states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPart {
    pub modification: ModificationKind,
    pub descriptors: Vec<crate::Descriptor>,
    pub states: Vec<State>,
}

impl ReportPart {
    fn from_entities(modification: ModificationKind, entities: &[Entity]) -> Self {
        let mut descriptors = Vec::with_capacity(entities.len());
        let mut states = Vec::new();
        for entity in entities {
            descriptors.push(entity.descriptor().clone());
            states.extend(entity.states().into_iter().cloned());
        }
        Self {
            modification,
            descriptors,
            states,
        }
    }

    /// States belonging to `handle`.
    pub fn states_of<'a>(&'a self, handle: &'a str) -> impl Iterator<Item = &'a State> {
        self.states
            .iter()
            .filter(move |s| s.descriptor_handle == handle)
    }
}

/// Structural changes, in the order they must be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionModificationReport {
    pub parts: Vec<ReportPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ReportBody {
    Metric(StateReport),
    Alert(StateReport),
    Component(StateReport),
    Operational(StateReport),
    Context(StateReport),
    Waveform(StateReport),
    Description(DescriptionModificationReport),
}

/// A delta report stamped with the version group of its commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub version_group: MdibVersionGroup,
    pub body: ReportBody,
}

impl Report {
    /// A state report for `category`.
    pub fn states(version_group: MdibVersionGroup, category: Category, states: Vec<State>) -> Self {
        let report = StateReport { states };
        let body = match category {
            Category::Metric => ReportBody::Metric(report),
            Category::Alert => ReportBody::Alert(report),
            Category::Component => ReportBody::Component(report),
            Category::Operational => ReportBody::Operational(report),
            Category::Context => ReportBody::Context(report),
            Category::RealTimeSample => ReportBody::Waveform(report),
        };
        Self { version_group, body }
    }

    pub fn kind(&self) -> ReportKind {
        match &self.body {
            ReportBody::Metric(_) => ReportKind::EpisodicMetric,
            ReportBody::Alert(_) => ReportKind::EpisodicAlert,
            ReportBody::Component(_) => ReportKind::EpisodicComponent,
            ReportBody::Operational(_) => ReportKind::EpisodicOperationalState,
            ReportBody::Context(_) => ReportKind::EpisodicContext,
            ReportBody::Waveform(_) => ReportKind::Waveform,
            ReportBody::Description(_) => ReportKind::DescriptionModification,
        }
    }

    pub fn mdib_version(&self) -> Version {
        self.version_group.mdib_version
    }

    /// The state report, for every kind except description modification.
    pub fn state_report(&self) -> Option<&StateReport> {
        match &self.body {
            ReportBody::Metric(r)
            | ReportBody::Alert(r)
            | ReportBody::Component(r)
            | ReportBody::Operational(r)
            | ReportBody::Context(r)
            | ReportBody::Waveform(r) => Some(r),
            ReportBody::Description(_) => None,
        }
    }
}

/// Build the reports for a committed transaction: at most one per non-empty
/// category, the description report first. A no-op yields nothing.
///
/// `version_group` supplies the session; its version is replaced by the
/// transaction's `new_mdib_version`.
pub fn build_reports(result: &TransactionResult, version_group: &MdibVersionGroup) -> Vec<Report> {
    let group = version_group.at_version(result.new_mdib_version);
    let mut reports = Vec::new();

    if result.has_descriptor_changes() {
        let parts = [
            (ModificationKind::Create, &result.descr_created),
            (ModificationKind::Update, &result.descr_updated),
            (ModificationKind::Delete, &result.descr_deleted),
        ]
        .into_iter()
        .filter(|(_, entities)| !entities.is_empty())
        .map(|(kind, entities)| ReportPart::from_entities(kind, entities))
        .collect();
        reports.push(Report {
            version_group: group.clone(),
            body: ReportBody::Description(DescriptionModificationReport { parts }),
        });
    }

    for category in Category::ALL {
        let states = result.state_updates(category);
        if !states.is_empty() {
            reports.push(Report::states(group.clone(), category, states.to_vec()));
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeType, ProviderConfig, ProviderMdib};

    fn provider() -> ProviderMdib {
        ProviderMdib::new(&ProviderConfig::default())
    }

    #[test]
    fn kinds_map_to_categories() {
        for category in Category::ALL {
            assert_eq!(ReportKind::for_category(category).category(), Some(category));
        }
        assert_eq!(ReportKind::DescriptionModification.category(), None);
    }

    #[test]
    fn insert_builds_create_and_update_parts() {
        let mdib = provider();
        let mut tx = mdib.descriptor_transaction();
        tx.write_entity(&mdib.new_entity("mds0", None, NodeType::Mds).unwrap())
            .unwrap();
        tx.commit().unwrap();

        let mut tx = mdib.descriptor_transaction();
        tx.write_entity(&mdib.new_entity("vmd0", Some("mds0"), NodeType::Vmd).unwrap())
            .unwrap();
        let result = tx.commit().unwrap().unwrap();

        let reports = build_reports(&result, &mdib.mdib_version_group());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].mdib_version(), 2);
        let ReportBody::Description(body) = &reports[0].body else {
            panic!("expected description report");
        };
        let kinds: Vec<_> = body.parts.iter().map(|p| p.modification).collect();
        assert_eq!(kinds, vec![ModificationKind::Create, ModificationKind::Update]);
        assert_eq!(body.parts[0].descriptors[0].handle, "vmd0");
        assert_eq!(body.parts[1].states_of("mds0").count(), 1);
    }

    #[test]
    fn state_reports_per_category() {
        let group = MdibVersionGroup::with_version(3, "urn:uuid:r", None);
        let d = crate::Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric);
        let report = Report::states(group, Category::Metric, vec![State::for_descriptor(&d)]);
        assert_eq!(report.kind(), ReportKind::EpisodicMetric);
        assert_eq!(report.state_report().unwrap().states.len(), 1);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"type\":\"Metric\""));
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
