//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use mdib_engine::{
    AlertState, ConsumerConfig, ConsumerMdib, MetricSample, MetricValue, NodeType,
    ProviderConfig, ProviderMdib, Report, TransactionResult,
};

pub const SEQUENCE: &str = "urn:uuid:00000000-0000-4000-8000-000000000001";

pub fn provider() -> ProviderMdib {
    ProviderMdib::new(&ProviderConfig {
        sequence_id: Some(SEQUENCE.to_string()),
        instance_id: Some(1),
    })
}

pub fn insert(mdib: &ProviderMdib, nodes: &[(&str, Option<&str>, NodeType)]) -> TransactionResult {
    let mut tx = mdib.descriptor_transaction();
    for (handle, parent, node_type) in nodes {
        let entity = mdib.new_entity(handle, *parent, *node_type).unwrap();
        tx.write_entity(&entity).unwrap();
    }
    tx.commit().unwrap().expect("insert changes the store")
}

/// mds0 / vmd0 / {ch0: hr, ch1: spo2 pr}, alert system, sco, patient context.
pub fn device() -> (ProviderMdib, TransactionResult) {
    let mdib = provider();
    let result = insert(
        &mdib,
        &[
            ("mds0", None, NodeType::Mds),
            ("vmd0", Some("mds0"), NodeType::Vmd),
            ("ch0", Some("vmd0"), NodeType::Channel),
            ("ch1", Some("vmd0"), NodeType::Channel),
            ("hr", Some("ch0"), NodeType::NumericMetric),
            ("spo2", Some("ch1"), NodeType::NumericMetric),
            ("pr", Some("ch1"), NodeType::NumericMetric),
            ("as0", Some("mds0"), NodeType::AlertSystem),
            ("cond0", Some("as0"), NodeType::AlertCondition),
            ("sig0", Some("as0"), NodeType::AlertSignal),
            ("sco0", Some("mds0"), NodeType::Sco),
            ("op0", Some("sco0"), NodeType::SetValueOperation),
            ("sc0", Some("mds0"), NodeType::SystemContext),
            ("pat", Some("sc0"), NodeType::PatientContext),
        ],
    );
    (mdib, result)
}

pub fn set_metric(mdib: &ProviderMdib, handle: &str, value: f64) -> Option<TransactionResult> {
    let mut entity = mdib.by_handle(handle)?;
    entity.metric_mut()?.value = Some(MetricValue::valid(MetricSample::Numeric(value)));
    let mut tx = mdib.metric_state_transaction();
    tx.write_entity(&entity).unwrap();
    tx.commit().unwrap()
}

pub fn set_alert(mdib: &ProviderMdib, presence: bool) -> Option<TransactionResult> {
    let mut cond = mdib.by_handle("cond0")?;
    if let Some(AlertState::Condition(c)) = cond.alert_mut() {
        c.presence = presence;
    }
    let mut tx = mdib.alert_state_transaction();
    tx.write_entity(&cond).unwrap();
    tx.commit().unwrap()
}

pub fn consumer(mdib: &ProviderMdib) -> ConsumerMdib {
    let consumer = ConsumerMdib::new(mdib.clone(), ConsumerConfig::default());
    consumer.reload_all().unwrap();
    consumer
}

pub fn reports(mdib: &ProviderMdib, result: &TransactionResult) -> Vec<Report> {
    mdib.reports_for(result)
}

pub fn deliver(consumer: &ConsumerMdib, mdib: &ProviderMdib, result: &TransactionResult) {
    for report in reports(mdib, result) {
        consumer.process_incoming(report);
    }
}
