//! The consumer-side MDIB: a replica kept current from delta reports.
//!
//! # Sync states
//!
//! ```text
//! Invalid --reload_all--> Initializing --snapshot loaded--> Initialized
//!    ^                                                          |
//!    +------------------- session reset ------------------------+
//! ```
//!
//! Reports are dropped while `Invalid`, buffered while `Initializing` and
//! applied while `Initialized`. The engine never reloads on its own: a
//! session reset only publishes [`MdibEvent::SessionReset`].
//!
//! # Locking
//!
//! The startup lock (sync state and buffer) is always taken before the
//! replica lock. The snapshot fetch runs with neither held.

use crate::{
    error::Result, facade::ConsumerEntity, replica::Replica, Category, CodedValue,
    ConsumerConfig, DescriptionModificationReport, Entity, Error, ErrorKind, Handle,
    MdibSnapshot, MdibVersionGroup, NodeType, Report, ReportBody, SnapshotSource, StateReport,
    Traversal, Version,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle of a consumer replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Invalid,
    Initializing,
    Initialized,
}

/// Notifications published by a [`ConsumerMdib`].
#[derive(Debug, Clone, PartialEq)]
pub enum MdibEvent {
    /// The provider's sequence or instance changed; call `reload_all`.
    SessionReset {
        local: MdibVersionGroup,
        received: MdibVersionGroup,
    },
    StatesUpdated {
        category: Category,
        handles: Vec<Handle>,
        mdib_version: Version,
    },
    DescriptorsChanged {
        created: Vec<Handle>,
        updated: Vec<Handle>,
        deleted: Vec<Handle>,
        mdib_version: Version,
    },
    Initialized {
        mdib_version: Version,
    },
}

/// Why an incoming report was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// The replica is invalid; nothing is accepted before `reload_all`.
    NotInitialized,
    /// Older than the local version.
    Stale,
    /// Different sequence or instance; the replica has been invalidated.
    SessionReset,
    /// Structurally broken; nothing of it was applied.
    Malformed(Error),
}

/// What `process_incoming` did with a report.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Applied,
    Buffered,
    Dropped(DropReason),
}

struct Startup {
    state: SyncState,
    buffer: VecDeque<Report>,
}

struct ConsumerInner {
    source: Box<dyn SnapshotSource>,
    replica: Mutex<Replica>,
    startup: Mutex<Startup>,
    events: broadcast::Sender<MdibEvent>,
    config: ConsumerConfig,
}

/// A replica of a provider MDIB.
///
/// Cheap to clone; clones share the same replica.
#[derive(Clone)]
pub struct ConsumerMdib {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for ConsumerMdib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerMdib")
            .field("sync_state", &self.sync_state())
            .field("version_group", &self.mdib_version_group())
            .finish()
    }
}

impl ConsumerMdib {
    /// Create an invalid consumer; call [`reload_all`](Self::reload_all) to
    /// bring it up.
    pub fn new(source: impl SnapshotSource + 'static, config: ConsumerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ConsumerInner {
                source: Box::new(source),
                replica: Mutex::new(Replica::default()),
                startup: Mutex::new(Startup {
                    state: SyncState::Invalid,
                    buffer: VecDeque::new(),
                }),
                events,
                config,
            }),
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MdibEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: MdibEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.startup.lock().state
    }

    /// Version group of the replica; `None` unless a snapshot is loaded.
    pub fn mdib_version_group(&self) -> Option<MdibVersionGroup> {
        self.inner.replica.lock().version_group().cloned()
    }

    /// Reload the whole replica from the snapshot source.
    ///
    /// Reports arriving meanwhile are buffered and replayed afterwards in
    /// version order; those not newer than the snapshot, or from another
    /// session, are discarded. A failed fetch leaves the consumer `Invalid`.
    pub fn reload_all(&self) -> Result<MdibVersionGroup> {
        {
            let mut startup = self.inner.startup.lock();
            startup.state = SyncState::Initializing;
            startup.buffer.clear();
        }
        info!("reloading replica");

        let snapshot = match self.inner.source.fetch_snapshot() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "snapshot fetch failed");
                self.fail_reload();
                return Err(error);
            }
        };

        let mut events = Vec::new();
        let loaded = {
            let mut startup = self.inner.startup.lock();
            let mut replica = self.inner.replica.lock();
            if let Err(error) = replica.load(snapshot) {
                warn!(%error, "snapshot rejected");
                replica.invalidate();
                startup.state = SyncState::Invalid;
                startup.buffer.clear();
                return Err(error);
            }
            let Some(loaded) = replica.version_group().cloned() else {
                startup.state = SyncState::Invalid;
                return Err(Error::NotInitialized);
            };

            let mut buffered: Vec<Report> = startup.buffer.drain(..).collect();
            buffered.sort_by_key(Report::mdib_version);
            let mut replayed = 0;
            for report in buffered {
                if !report.version_group.same_session(&loaded)
                    || report.mdib_version() <= loaded.mdib_version
                {
                    debug!(version = %report.version_group, "discarding buffered report");
                    continue;
                }
                match replica.apply(&report) {
                    Ok(event) => {
                        replayed += 1;
                        events.extend(event);
                    }
                    Err(error) => warn!(%error, kind = %report.kind(), "buffered report dropped"),
                }
            }

            startup.state = SyncState::Initialized;
            info!(
                version = %loaded,
                entities = replica.len(),
                replayed,
                "replica initialized"
            );
            replica.version_group().cloned().unwrap_or(loaded)
        };

        self.publish(MdibEvent::Initialized {
            mdib_version: loaded.mdib_version,
        });
        for event in events {
            self.publish(event);
        }
        Ok(loaded)
    }

    fn fail_reload(&self) {
        let mut startup = self.inner.startup.lock();
        startup.state = SyncState::Invalid;
        startup.buffer.clear();
    }

    /// Handle one incoming report according to the current sync state.
    pub fn process_incoming(&self, report: Report) -> ProcessOutcome {
        let mut startup = self.inner.startup.lock();
        match startup.state {
            SyncState::Invalid => {
                debug!(kind = %report.kind(), "replica invalid, report dropped");
                return ProcessOutcome::Dropped(DropReason::NotInitialized);
            }
            SyncState::Initializing => {
                if startup.buffer.len() >= self.inner.config.max_buffered_reports {
                    if let Some(oldest) = startup.buffer.pop_front() {
                        warn!(version = %oldest.version_group, "startup buffer full, dropping oldest report");
                    }
                }
                startup.buffer.push_back(report);
                return ProcessOutcome::Buffered;
            }
            SyncState::Initialized => {}
        }

        let applied = self.inner.replica.lock().apply(&report);
        match applied {
            Ok(event) => {
                drop(startup);
                if let Some(event) = event {
                    self.publish(event);
                }
                ProcessOutcome::Applied
            }
            Err(error) => match error.kind() {
                ErrorKind::Stale => {
                    warn!(%error, kind = %report.kind(), "stale report ignored");
                    ProcessOutcome::Dropped(DropReason::Stale)
                }
                ErrorKind::Reset => {
                    startup.state = SyncState::Invalid;
                    startup.buffer.clear();
                    let local = {
                        let mut replica = self.inner.replica.lock();
                        let local = replica.version_group().cloned();
                        replica.invalidate();
                        local
                    };
                    drop(startup);
                    warn!(%error, "session reset, replica invalidated");
                    if let Some(local) = local {
                        self.publish(MdibEvent::SessionReset {
                            local,
                            received: report.version_group,
                        });
                    }
                    ProcessOutcome::Dropped(DropReason::SessionReset)
                }
                ErrorKind::Usage | ErrorKind::Structural | ErrorKind::Source => {
                    warn!(%error, kind = %report.kind(), "malformed report dropped");
                    ProcessOutcome::Dropped(DropReason::Malformed(error))
                }
            },
        }
    }

    fn process_states(
        &self,
        category: Category,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_incoming(Report::states(version_group, category, report.states))
    }

    pub fn process_incoming_metric_report(
        &self,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_states(Category::Metric, report, version_group)
    }

    pub fn process_incoming_alert_report(
        &self,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_states(Category::Alert, report, version_group)
    }

    pub fn process_incoming_component_report(
        &self,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_states(Category::Component, report, version_group)
    }

    pub fn process_incoming_operational_state_report(
        &self,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_states(Category::Operational, report, version_group)
    }

    pub fn process_incoming_context_report(
        &self,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_states(Category::Context, report, version_group)
    }

    pub fn process_incoming_waveform_report(
        &self,
        report: StateReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_states(Category::RealTimeSample, report, version_group)
    }

    pub fn process_incoming_description_report(
        &self,
        report: DescriptionModificationReport,
        version_group: MdibVersionGroup,
    ) -> ProcessOutcome {
        self.process_incoming(Report {
            version_group,
            body: ReportBody::Description(report),
        })
    }

    pub(crate) fn entity(&self, handle: &str) -> Option<Entity> {
        self.inner.replica.lock().entity(handle)
    }

    fn facades(&self, entities: Vec<Entity>) -> Vec<ConsumerEntity> {
        entities
            .into_iter()
            .map(|e| ConsumerEntity::new(self.clone(), e))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.replica.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn by_handle(&self, handle: &str) -> Option<ConsumerEntity> {
        let entity = self.entity(handle)?;
        Some(ConsumerEntity::new(self.clone(), entity))
    }

    pub fn by_node_type(&self, node_type: NodeType) -> Vec<ConsumerEntity> {
        let entities = self.inner.replica.lock().by_node_type(node_type);
        self.facades(entities)
    }

    pub fn by_parent_handle(&self, parent: Option<&str>) -> Vec<ConsumerEntity> {
        let entities = self.inner.replica.lock().by_parent_handle(parent);
        self.facades(entities)
    }

    pub fn by_coding(&self, coding: &CodedValue) -> Vec<ConsumerEntity> {
        let entities = self.inner.replica.lock().by_coding(coding);
        self.facades(entities)
    }

    pub fn subtree(&self, root: &str, order: Traversal, include_root: bool) -> Vec<ConsumerEntity> {
        let entities = self.inner.replica.lock().subtree(root, order, include_root);
        self.facades(entities)
    }

    /// The replica in snapshot form, for comparison or persistence.
    pub fn export_snapshot(&self) -> Result<MdibSnapshot> {
        self.inner.replica.lock().snapshot()
    }
}
