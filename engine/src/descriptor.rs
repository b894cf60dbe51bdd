//! Descriptors: the structural nodes of the device tree.
//!
//! A descriptor never stores its children. The tree is recovered by scanning
//! for descriptors whose `parent_handle` points at a given handle.

use crate::{Handle, Version};
use serde::{Deserialize, Serialize};

/// Coding system assumed when a [`CodedValue`] names none (IEEE 11073-10101).
pub const DEFAULT_CODING_SYSTEM: &str = "urn:oid:1.2.840.10004.1.1.1.0.0.1";

/// Category of a descriptor, which fixes the kind of state it carries and the
/// state transaction allowed to write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Metric,
    RealTimeSample,
    Alert,
    Component,
    Operational,
    Context,
}

impl Category {
    /// Every category, in report order.
    pub const ALL: [Category; 6] = [
        Category::Metric,
        Category::Alert,
        Category::Component,
        Category::Context,
        Category::Operational,
        Category::RealTimeSample,
    ];

    /// Context descriptors own a set of states instead of exactly one.
    pub fn is_multi_state(self) -> bool {
        matches!(self, Category::Context)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Metric => write!(f, "metric"),
            Category::RealTimeSample => write!(f, "rt_sample"),
            Category::Alert => write!(f, "alert"),
            Category::Component => write!(f, "component"),
            Category::Operational => write!(f, "operational"),
            Category::Context => write!(f, "context"),
        }
    }
}

/// Closed set of descriptor node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Mds,
    Vmd,
    Channel,
    NumericMetric,
    StringMetric,
    EnumStringMetric,
    RealTimeSampleArrayMetric,
    AlertSystem,
    AlertCondition,
    LimitAlertCondition,
    AlertSignal,
    Sco,
    SetValueOperation,
    SetStringOperation,
    ActivateOperation,
    SetContextStateOperation,
    SystemContext,
    PatientContext,
    LocationContext,
    EnsembleContext,
    WorkflowContext,
    OperatorContext,
    MeansContext,
}

impl NodeType {
    /// The category this node type belongs to.
    pub fn category(self) -> Category {
        use NodeType::*;
        match self {
            Mds | Vmd | Channel | Sco | SystemContext => Category::Component,
            NumericMetric | StringMetric | EnumStringMetric => Category::Metric,
            RealTimeSampleArrayMetric => Category::RealTimeSample,
            AlertSystem | AlertCondition | LimitAlertCondition | AlertSignal => Category::Alert,
            SetValueOperation | SetStringOperation | ActivateOperation
            | SetContextStateOperation => Category::Operational,
            PatientContext | LocationContext | EnsembleContext | WorkflowContext
            | OperatorContext | MeansContext => Category::Context,
        }
    }

    /// Whether this node type owns a set of states.
    pub fn is_multi_state(self) -> bool {
        self.category().is_multi_state()
    }

    /// Node types a descriptor of this type may be placed under. Empty means
    /// the node is a root.
    pub fn allowed_parents(self) -> &'static [NodeType] {
        use NodeType::*;
        match self {
            Mds => &[],
            Vmd | Sco => &[Mds, Vmd],
            Channel => &[Vmd],
            NumericMetric | StringMetric | EnumStringMetric | RealTimeSampleArrayMetric => {
                &[Channel]
            }
            AlertSystem => &[Mds, Vmd],
            AlertCondition | LimitAlertCondition | AlertSignal => &[AlertSystem],
            SetValueOperation | SetStringOperation | ActivateOperation
            | SetContextStateOperation => &[Sco],
            SystemContext => &[Mds],
            PatientContext | LocationContext | EnsembleContext | WorkflowContext
            | OperatorContext | MeansContext => &[SystemContext],
        }
    }

    /// Check a parent placement. `None` means "no parent" (a root).
    pub fn accepts_parent(self, parent: Option<NodeType>) -> bool {
        let allowed = self.allowed_parents();
        match parent {
            None => allowed.is_empty(),
            Some(parent) => allowed.contains(&parent),
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Coded classification of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodedValue {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coding_system: Option<String>,
}

impl CodedValue {
    /// A code in the default coding system.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            coding_system: None,
        }
    }

    /// A code in an explicit coding system.
    pub fn with_system(code: impl Into<String>, coding_system: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            coding_system: Some(coding_system.into()),
        }
    }

    /// The coding system, falling back to [`DEFAULT_CODING_SYSTEM`].
    pub fn effective_coding_system(&self) -> &str {
        self.coding_system.as_deref().unwrap_or(DEFAULT_CODING_SYSTEM)
    }

    /// Codes match when code and effective coding system are equal.
    pub fn matches(&self, other: &CodedValue) -> bool {
        self.code == other.code && self.effective_coding_system() == other.effective_coding_system()
    }
}

/// Safety classification of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyClassification {
    Inf,
    MedA,
    MedB,
    MedC,
}

/// A structural node of the device tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Unique identity
    pub handle: Handle,
    /// Parent descriptor; `None` for roots
    pub parent_handle: Option<Handle>,
    /// Closed node type
    pub node_type: NodeType,
    /// Incremented on every change of this descriptor or its child set
    pub descriptor_version: Version,
    /// Classification used by [`crate::EntityMap::by_coding`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coding: Option<CodedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_classification: Option<SafetyClassification>,
    /// Category-specific attributes (units, limits, ...), opaque to the engine
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl Descriptor {
    /// Create a descriptor at version 0 with no coding and no properties.
    pub fn new(handle: impl Into<Handle>, parent_handle: Option<&str>, node_type: NodeType) -> Self {
        Self {
            handle: handle.into(),
            parent_handle: parent_handle.map(str::to_string),
            node_type,
            descriptor_version: 0,
            coding: None,
            safety_classification: None,
            properties: serde_json::Value::Null,
        }
    }

    pub fn with_coding(mut self, coding: CodedValue) -> Self {
        self.coding = Some(coding);
        self
    }

    pub fn with_safety_classification(mut self, classification: SafetyClassification) -> Self {
        self.safety_classification = Some(classification);
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    pub fn category(&self) -> Category {
        self.node_type.category()
    }

    /// Equal in everything except the version counter.
    pub fn same_content(&self, other: &Descriptor) -> bool {
        self.handle == other.handle
            && self.parent_handle == other.parent_handle
            && self.node_type == other.node_type
            && self.coding == other.coding
            && self.safety_classification == other.safety_classification
            && self.properties == other.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn categories() {
        assert_eq!(NodeType::NumericMetric.category(), Category::Metric);
        assert_eq!(
            NodeType::RealTimeSampleArrayMetric.category(),
            Category::RealTimeSample
        );
        assert_eq!(NodeType::LimitAlertCondition.category(), Category::Alert);
        assert_eq!(NodeType::Sco.category(), Category::Component);
        assert_eq!(NodeType::ActivateOperation.category(), Category::Operational);
        assert!(NodeType::PatientContext.is_multi_state());
        assert!(!NodeType::Mds.is_multi_state());
    }

    #[test]
    fn parent_rules() {
        assert!(NodeType::Mds.accepts_parent(None));
        assert!(!NodeType::Vmd.accepts_parent(None));
        assert!(NodeType::Vmd.accepts_parent(Some(NodeType::Mds)));
        assert!(NodeType::Channel.accepts_parent(Some(NodeType::Vmd)));
        assert!(!NodeType::Channel.accepts_parent(Some(NodeType::Mds)));
        assert!(NodeType::AlertSignal.accepts_parent(Some(NodeType::AlertSystem)));
        assert!(NodeType::PatientContext.accepts_parent(Some(NodeType::SystemContext)));
    }

    #[test]
    fn coding_default_system() {
        let implicit = CodedValue::new("147842");
        let explicit = CodedValue::with_system("147842", DEFAULT_CODING_SYSTEM);
        let other = CodedValue::with_system("147842", "urn:oid:1.2.3");
        assert!(implicit.matches(&explicit));
        assert!(!implicit.matches(&other));
        assert!(!implicit.matches(&CodedValue::new("150456")));
    }

    #[test]
    fn same_content_ignores_version() {
        let a = Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric)
            .with_properties(json!({"unit": "bpm"}));
        let mut b = a.clone();
        b.descriptor_version = 7;
        assert!(a.same_content(&b));

        b.properties = json!({"unit": "1/min"});
        assert!(!a.same_content(&b));
    }

    #[test]
    fn serialization_format() {
        let d = Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric)
            .with_coding(CodedValue::new("147842"));
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("parentHandle"));
        assert!(json.contains("\"nodeType\":\"NumericMetric\""));
        let parsed: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, parsed);
    }
}
