//! Demo device hosted by the node.
//!
//! The provider lives behind a lock so a simulated restart can swap it for a
//! new instance while consumers keep fetching snapshots through
//! [`DeviceSource`].

use std::sync::Arc;

use mdib_engine::{
    AlertState, ContextAssociation, MdibSnapshot, MetricSample, MetricValue, NodeType,
    ProviderConfig, ProviderMdib, SnapshotSource, TransactionResult,
};
use parking_lot::RwLock;

use crate::error::Result;

const TREE: &[(&str, Option<&str>, NodeType)] = &[
    ("mds0", None, NodeType::Mds),
    ("vmd0", Some("mds0"), NodeType::Vmd),
    ("ch.vitals", Some("vmd0"), NodeType::Channel),
    ("ch.spo2", Some("vmd0"), NodeType::Channel),
    ("hr", Some("ch.vitals"), NodeType::NumericMetric),
    ("rr", Some("ch.vitals"), NodeType::NumericMetric),
    ("spo2", Some("ch.spo2"), NodeType::NumericMetric),
    ("pleth", Some("ch.spo2"), NodeType::RealTimeSampleArrayMetric),
    ("as0", Some("mds0"), NodeType::AlertSystem),
    ("cond.hr.high", Some("as0"), NodeType::LimitAlertCondition),
    ("sig.hr.high", Some("as0"), NodeType::AlertSignal),
    ("sco0", Some("mds0"), NodeType::Sco),
    ("op.hr.limit", Some("sco0"), NodeType::SetValueOperation),
    ("sc0", Some("mds0"), NodeType::SystemContext),
    ("patient", Some("sc0"), NodeType::PatientContext),
    ("location", Some("sc0"), NodeType::LocationContext),
];

/// Heart rate above which the alert condition is present.
const HR_LIMIT: f64 = 100.0;

/// Temporary metric inserted and removed to exercise description reports.
const TEMP_METRIC: &str = "temp";

/// The demo device and its current provider.
#[derive(Debug, Clone)]
pub struct Device {
    provider: Arc<RwLock<ProviderMdib>>,
}

impl Device {
    /// Build the device tree in one descriptor transaction.
    pub fn build(config: &ProviderConfig) -> Result<(Self, Option<TransactionResult>)> {
        let provider = ProviderMdib::new(config);
        let mut tx = provider.descriptor_transaction();
        for (handle, parent, node_type) in TREE {
            let entity = provider.new_entity(handle, *parent, *node_type)?;
            tx.write_entity(&entity)?;
        }
        let result = tx.commit()?;
        tracing::info!(
            entities = provider.len(),
            version = %provider.mdib_version_group(),
            "device built"
        );

        let device = Self {
            provider: Arc::new(RwLock::new(provider)),
        };
        Ok((device, result))
    }

    pub fn provider(&self) -> ProviderMdib {
        self.provider.read().clone()
    }

    pub fn source(&self) -> DeviceSource {
        DeviceSource {
            provider: self.provider.clone(),
        }
    }

    /// Replace the provider with a new instance loaded from the current
    /// content. Reports of the new instance invalidate every replica.
    pub fn restart(&self) -> Result<()> {
        let mut provider = self.provider.write();
        let mut snapshot = provider.snapshot();
        let previous = snapshot.version_group.clone();
        snapshot.version_group.instance_id = Some(previous.instance_id.map_or(1, |i| i + 1));
        *provider = ProviderMdib::from_snapshot(snapshot)?;
        tracing::warn!(
            from = %previous,
            to = %provider.mdib_version_group(),
            "provider restarted"
        );
        Ok(())
    }

    /// Advance the simulation by one tick and return what was committed.
    pub fn tick(&self, tick: u64) -> Result<Vec<TransactionResult>> {
        let provider = self.provider();
        let mut results = Vec::new();

        let hr = 70.0 + ((tick * 7) % 45) as f64;
        results.extend(set_metrics(&provider, tick, hr)?);
        results.extend(update_alert(&provider, hr)?);
        if tick % 10 == 0 {
            results.extend(admit_patient(&provider, tick)?);
        }
        if tick % 15 == 0 {
            results.extend(toggle_temp_metric(&provider)?);
        }

        Ok(results)
    }
}

/// Snapshot source that always reads the current provider.
#[derive(Debug, Clone)]
pub struct DeviceSource {
    provider: Arc<RwLock<ProviderMdib>>,
}

impl SnapshotSource for DeviceSource {
    fn fetch_snapshot(&self) -> mdib_engine::error::Result<MdibSnapshot> {
        Ok(self.provider.read().snapshot())
    }
}

fn set_metrics(provider: &ProviderMdib, tick: u64, hr: f64) -> Result<Option<TransactionResult>> {
    let values = [
        ("hr", hr),
        ("rr", 12.0 + (tick % 6) as f64),
        ("spo2", 99.0 - (tick % 5) as f64),
    ];

    let mut tx = provider.metric_state_transaction();
    for (handle, value) in values {
        let Some(mut entity) = provider.by_handle(handle) else {
            continue;
        };
        if let Some(metric) = entity.metric_mut() {
            metric.value = Some(MetricValue::valid(MetricSample::Numeric(value)));
        }
        tx.write_entity(&entity)?;
    }
    Ok(tx.commit()?)
}

fn update_alert(provider: &ProviderMdib, hr: f64) -> Result<Option<TransactionResult>> {
    let Some(mut condition) = provider.by_handle("cond.hr.high") else {
        return Ok(None);
    };
    if let Some(AlertState::Condition(state)) = condition.alert_mut() {
        state.presence = hr > HR_LIMIT;
    }
    let mut tx = provider.alert_state_transaction();
    tx.write_entity(&condition)?;
    Ok(tx.commit()?)
}

/// Associate a new patient, disassociating the previous one.
fn admit_patient(provider: &ProviderMdib, tick: u64) -> Result<Option<TransactionResult>> {
    let Some(mut patient) = provider.by_handle("patient") else {
        return Ok(None);
    };
    let mut tx = provider.context_state_transaction();
    let handle = format!("patient.{}", tick / 10);
    if let Some(multi) = patient.as_multi_mut() {
        multi.disassociate_all(tx.new_mdib_version(), Some(&handle));
        let state = multi.new_state(handle.clone());
        if let Some(context) = state.context_state_mut() {
            context.association = ContextAssociation::Associated;
            context.identification = vec![format!("MRN-{:05}", tick)];
        }
    }
    tx.write_entity(&patient)?;
    Ok(tx.commit()?)
}

/// Insert the temporary metric when absent, remove it otherwise.
fn toggle_temp_metric(provider: &ProviderMdib) -> Result<Option<TransactionResult>> {
    let mut tx = provider.descriptor_transaction();
    if provider.by_handle(TEMP_METRIC).is_some() {
        tx.remove_entity(TEMP_METRIC)?;
    } else {
        let entity = provider.new_entity(TEMP_METRIC, Some("ch.vitals"), NodeType::NumericMetric)?;
        tx.write_entity(&entity)?;
    }
    Ok(tx.commit()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        let config = ProviderConfig {
            sequence_id: Some("urn:uuid:device-test".into()),
            instance_id: None,
        };
        Device::build(&config).unwrap().0
    }

    #[test]
    fn build_creates_the_tree() {
        let device = device();
        let provider = device.provider();
        assert_eq!(provider.len(), TREE.len());
        assert_eq!(provider.mdib_version(), 1);
        assert_eq!(provider.by_parent_handle(Some("sc0")).len(), 2);
    }

    #[test]
    fn ticks_advance_the_version() {
        let device = device();
        let before = device.provider().mdib_version();
        let results = device.tick(1).unwrap();
        assert!(!results.is_empty());
        assert_eq!(
            device.provider().mdib_version(),
            before + results.len() as u64
        );
    }

    #[test]
    fn patient_admission_keeps_one_association() {
        let device = device();
        for tick in [10, 20, 30] {
            device.tick(tick).unwrap();
        }
        let patient = device.provider().by_handle("patient").unwrap();
        let multi = patient.as_multi().unwrap();
        assert_eq!(multi.associated_states().count(), 1);
        assert!(multi.state("patient.3").is_some());
    }

    #[test]
    fn temp_metric_toggles() {
        let device = device();
        device.tick(15).unwrap();
        assert!(device.provider().by_handle(TEMP_METRIC).is_some());
        device.tick(30).unwrap();
        assert!(device.provider().by_handle(TEMP_METRIC).is_none());
    }

    #[test]
    fn restart_changes_the_instance_and_keeps_content() {
        let device = device();
        device.tick(1).unwrap();
        let before = device.provider().snapshot();

        device.restart().unwrap();
        let after = device.source().fetch_snapshot().unwrap();

        assert_eq!(after.version_group.instance_id, Some(1));
        assert_eq!(after.version_group.mdib_version, before.version_group.mdib_version);
        assert_eq!(after.descriptors, before.descriptors);
        assert_eq!(after.states, before.states);
    }
}
