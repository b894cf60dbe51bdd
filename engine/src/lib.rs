//! # MDIB Engine
//!
//! A versioned state-replication and transaction engine for device data.
//!
//! A provider owns the canonical medical device information base (MDIB): a
//! tree of descriptors, each carrying one current state (or, for context
//! descriptors, a set of association states). Consumers keep a replica of it
//! current from an initial snapshot followed by an ordered stream of delta
//! reports delivered at least once.
//!
//! ## Design Principles
//!
//! - **No wire format, no transport**: reports and snapshots are plain values;
//!   encoding and delivery belong to the embedding application
//! - **Single writer**: every provider mutation goes through a typed,
//!   exclusive transaction that yields a [`TransactionResult`]
//! - **Monotonic versions**: `mdib_version` advances by one per committed
//!   change, and per-handle version counters never decrease, even across
//!   delete/recreate cycles
//! - **Whole-state replace**: consumers apply states wholesale, so duplicate
//!   and already-superseded reports are harmless
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! An [`Entity`] pairs a [`Descriptor`] with its [`State`]s. Descriptors form a
//! tree through `parent_handle`; children are found by scanning, never stored
//! on the parent.
//!
//! ### Transactions
//!
//! [`ProviderMdib`] hands out one transaction at a time:
//! - [`ProviderMdib::descriptor_transaction`] - insert, update or delete
//!   descriptors (one kind of operation per transaction)
//! - [`ProviderMdib::metric_state_transaction`] and the five other state
//!   transactions - write states of exactly one [`Category`]
//!
//! ### Replication
//!
//! [`build_reports`] turns a [`TransactionResult`] into category reports, and
//! [`ConsumerMdib`] applies them after [`ConsumerMdib::reload_all`] loaded a
//! snapshot from a [`SnapshotSource`].
//!
//! ## Quick Start
//!
//! ```rust
//! use mdib_engine::{
//!     build_reports, ConsumerConfig, ConsumerMdib, MetricSample, MetricValue, NodeType,
//!     ProviderConfig, ProviderMdib, SyncState,
//! };
//!
//! // 1. Build a provider with a small device tree
//! let provider = ProviderMdib::new(&ProviderConfig::default());
//! let mut tx = provider.descriptor_transaction();
//! for (handle, parent, node_type) in [
//!     ("mds0", None, NodeType::Mds),
//!     ("vmd0", Some("mds0"), NodeType::Vmd),
//!     ("ch0", Some("vmd0"), NodeType::Channel),
//!     ("hr", Some("ch0"), NodeType::NumericMetric),
//! ] {
//!     let entity = provider.new_entity(handle, parent, node_type).unwrap();
//!     tx.write_entity(&entity).unwrap();
//! }
//! tx.commit().unwrap();
//!
//! // 2. Bring a consumer up from a snapshot
//! let consumer = ConsumerMdib::new(provider.clone(), ConsumerConfig::default());
//! consumer.reload_all().unwrap();
//! assert_eq!(consumer.sync_state(), SyncState::Initialized);
//!
//! // 3. Change a metric and replicate the result
//! let mut hr = provider.by_handle("hr").unwrap();
//! hr.metric_mut().unwrap().value = Some(MetricValue::valid(MetricSample::Numeric(72.0)));
//! let mut tx = provider.metric_state_transaction();
//! tx.write_entity(&hr).unwrap();
//! let result = tx.commit().unwrap().expect("value changed");
//!
//! for report in build_reports(&result, &provider.mdib_version_group()) {
//!     consumer.process_incoming(report);
//! }
//! let replica_hr = consumer.by_handle("hr").unwrap();
//! let value = replica_hr.metric().unwrap().value.as_ref().unwrap();
//! assert_eq!(value.sample, MetricSample::Numeric(72.0));
//! assert_eq!(consumer.mdib_version_group().unwrap().mdib_version, 2);
//! ```

pub mod config;
pub mod consumer;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod facade;
pub mod provider;
mod replica;
pub mod report;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod transaction;
pub mod version;

// Re-export main types at crate root
pub use config::{ConfigError, ConsumerConfig, ProviderConfig};
pub use consumer::{ConsumerMdib, DropReason, MdibEvent, ProcessOutcome, SyncState};
pub use descriptor::{
    Category, CodedValue, Descriptor, NodeType, SafetyClassification, DEFAULT_CODING_SYSTEM,
};
pub use entity::{Entity, EntityVersions, MultiStateEntity, SingleStateEntity};
pub use error::{Error, ErrorKind};
pub use facade::{ConsumerEntity, ProviderEntity};
pub use provider::ProviderMdib;
pub use report::{
    build_reports, DescriptionModificationReport, ModificationKind, Report, ReportBody,
    ReportKind, ReportPart, StateReport,
};
pub use snapshot::{MdibSnapshot, SnapshotSource, SNAPSHOT_FORMAT_VERSION};
pub use state::{
    AlertActivation, AlertConditionState, AlertSignalState, AlertState, AlertSystemState,
    ComponentActivation, ComponentState, ContextAssociation, ContextState, MeasurementValidity,
    MetricSample, MetricState, MetricValue, OperatingMode, OperationState, RtSampleState,
    SignalPresence, State, StatePayload,
};
pub use store::{EntityMap, Traversal, VersionArchive};
pub use transaction::{
    DescriptorOperation, DescriptorTransaction, StateTransaction, TransactionResult,
};
pub use version::MdibVersionGroup;

/// Type aliases for clarity
pub type Handle = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
