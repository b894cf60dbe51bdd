//! States: the mutable values attached to descriptors.

use crate::{Category, Descriptor, Handle, NodeType, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Activation of a component or metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComponentActivation {
    #[default]
    On,
    NotReady,
    StandBy,
    Off,
    Shutdown,
    Failure,
}

/// Activation of an alert system, condition or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlertActivation {
    #[default]
    On,
    Off,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MeasurementValidity {
    #[default]
    Valid,
    Validated,
    Ongoing,
    Questionable,
    Calibration,
    Invalid,
    Overflow,
    Underflow,
    NotAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricSample {
    Numeric(f64),
    Text(String),
}

/// An observed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    pub sample: MetricSample,
    pub validity: MeasurementValidity,
    /// Refreshed by every metric transaction that writes this value
    pub determination_time: Option<Timestamp>,
}

impl MetricValue {
    /// A valid sample without a determination time; the transaction stamps it.
    pub fn valid(sample: MetricSample) -> Self {
        Self {
            sample,
            validity: MeasurementValidity::Valid,
            determination_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricState {
    pub activation: ComponentActivation,
    pub value: Option<MetricValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtSampleState {
    pub activation: ComponentActivation,
    pub samples: Vec<f64>,
    pub determination_time: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalPresence {
    On,
    #[default]
    Off,
    Latched,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConditionState {
    pub activation: AlertActivation,
    pub presence: bool,
    /// Refreshed only when `presence` transitions
    pub determination_time: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSignalState {
    pub activation: AlertActivation,
    pub presence: SignalPresence,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSystemState {
    pub activation: AlertActivation,
    pub last_self_check: Option<Timestamp>,
    pub self_check_count: u64,
    pub present_conditions: Vec<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertState {
    Condition(AlertConditionState),
    Signal(AlertSignalState),
    System(AlertSystemState),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentState {
    pub activation: ComponentActivation,
    pub operating_hours: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperatingMode {
    #[default]
    Enabled,
    Disabled,
    NotAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub operating_mode: OperatingMode,
}

/// Association status of a context state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContextAssociation {
    #[default]
    NoAssociation,
    Associated,
    Disassociated,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    pub association: ContextAssociation,
    pub binding_mdib_version: Option<Version>,
    pub unbinding_mdib_version: Option<Version>,
    pub binding_start_time: Option<Timestamp>,
    pub binding_end_time: Option<Timestamp>,
    pub identification: Vec<String>,
}

/// Category-specific state content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatePayload {
    Metric(MetricState),
    RealTimeSample(RtSampleState),
    Alert(AlertState),
    Component(ComponentState),
    Operational(OperationState),
    Context(ContextState),
}

impl StatePayload {
    pub fn category(&self) -> Category {
        match self {
            StatePayload::Metric(_) => Category::Metric,
            StatePayload::RealTimeSample(_) => Category::RealTimeSample,
            StatePayload::Alert(_) => Category::Alert,
            StatePayload::Component(_) => Category::Component,
            StatePayload::Operational(_) => Category::Operational,
            StatePayload::Context(_) => Category::Context,
        }
    }

    /// Initial payload for a freshly created descriptor.
    pub fn default_for(node_type: NodeType) -> Self {
        match node_type {
            NodeType::AlertSystem => {
                StatePayload::Alert(AlertState::System(AlertSystemState::default()))
            }
            NodeType::AlertSignal => {
                StatePayload::Alert(AlertState::Signal(AlertSignalState::default()))
            }
            other => match other.category() {
                Category::Metric => StatePayload::Metric(MetricState::default()),
                Category::RealTimeSample => StatePayload::RealTimeSample(RtSampleState::default()),
                Category::Component => StatePayload::Component(ComponentState::default()),
                Category::Operational => StatePayload::Operational(OperationState::default()),
                Category::Context => StatePayload::Context(ContextState::default()),
                // AlertCondition and LimitAlertCondition
                Category::Alert => {
                    StatePayload::Alert(AlertState::Condition(AlertConditionState::default()))
                }
            },
        }
    }
}

/// The value attached to a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    /// Own handle; only context states carry one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    /// Back-reference to the owning descriptor
    pub descriptor_handle: Handle,
    pub state_version: Version,
    /// Mirror of the owning descriptor's version at the last state write
    pub descriptor_version: Version,
    pub payload: StatePayload,
}

macro_rules! payload_accessors {
    ($($get:ident, $get_mut:ident => $variant:ident($ty:ty);)*) => {
        $(
            pub fn $get(&self) -> Option<&$ty> {
                match &self.payload {
                    StatePayload::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            pub fn $get_mut(&mut self) -> Option<&mut $ty> {
                match &mut self.payload {
                    StatePayload::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        )*
    };
}

impl State {
    /// Default single state for a descriptor, at the descriptor's version.
    pub fn for_descriptor(descriptor: &Descriptor) -> Self {
        Self {
            handle: None,
            descriptor_handle: descriptor.handle.clone(),
            state_version: 0,
            descriptor_version: descriptor.descriptor_version,
            payload: StatePayload::default_for(descriptor.node_type),
        }
    }

    /// Default context state with its own handle.
    pub fn context(handle: impl Into<Handle>, descriptor: &Descriptor) -> Self {
        Self {
            handle: Some(handle.into()),
            descriptor_handle: descriptor.handle.clone(),
            state_version: 0,
            descriptor_version: descriptor.descriptor_version,
            payload: StatePayload::Context(ContextState::default()),
        }
    }

    /// Key under which this state's version history is tracked: its own handle
    /// for context states, the descriptor handle otherwise.
    pub fn key(&self) -> &str {
        self.handle.as_deref().unwrap_or(&self.descriptor_handle)
    }

    pub fn category(&self) -> Category {
        self.payload.category()
    }

    payload_accessors! {
        metric, metric_mut => Metric(MetricState);
        rt_sample, rt_sample_mut => RealTimeSample(RtSampleState);
        alert, alert_mut => Alert(AlertState);
        component, component_mut => Component(ComponentState);
        operation, operation_mut => Operational(OperationState);
        context_state, context_state_mut => Context(ContextState);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_node_type() {
        let d = Descriptor::new("as0", Some("mds0"), NodeType::AlertSystem);
        let state = State::for_descriptor(&d);
        assert!(matches!(state.alert(), Some(AlertState::System(_))));
        assert_eq!(state.key(), "as0");

        let d = Descriptor::new("sig0", Some("as0"), NodeType::AlertSignal);
        let state = State::for_descriptor(&d);
        assert!(matches!(
            state.alert(),
            Some(AlertState::Signal(AlertSignalState {
                presence: SignalPresence::Off,
                ..
            }))
        ));

        let d = Descriptor::new("op0", Some("sco0"), NodeType::SetValueOperation);
        let state = State::for_descriptor(&d);
        assert_eq!(
            state.operation().unwrap().operating_mode,
            OperatingMode::Enabled
        );
    }

    #[test]
    fn context_state_key_is_own_handle() {
        let d = Descriptor::new("pat", Some("sc0"), NodeType::PatientContext);
        let state = State::context("pat-1", &d);
        assert_eq!(state.key(), "pat-1");
        assert_eq!(state.descriptor_handle, "pat");
        assert_eq!(
            state.context_state().unwrap().association,
            ContextAssociation::NoAssociation
        );
    }

    #[test]
    fn accessors_are_category_specific() {
        let d = Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric);
        let mut state = State::for_descriptor(&d);
        assert!(state.alert().is_none());
        state.metric_mut().unwrap().value = Some(MetricValue::valid(MetricSample::Numeric(5.0)));
        assert_eq!(
            state.metric().unwrap().value.as_ref().unwrap().sample,
            MetricSample::Numeric(5.0)
        );
        assert_eq!(state.category(), Category::Metric);
    }

    #[test]
    fn serialization_roundtrip() {
        let d = Descriptor::new("cond", Some("as0"), NodeType::AlertCondition);
        let mut state = State::for_descriptor(&d);
        state.state_version = 4;
        if let Some(AlertState::Condition(c)) = state.alert_mut() {
            c.presence = true;
            c.determination_time = Some(1_706_745_600_000);
        }
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("descriptorHandle"));
        assert!(!json.contains("\"handle\""));
        let parsed: State = serde_json::from_str(&json).unwrap();
        assert_eq!(state, parsed);
    }
}
