//! The provider-side MDIB: the canonical entity store.
//!
//! Readers take the data lock briefly and get detached copies. Writers go
//! through transactions, which additionally hold the exclusivity lock so
//! that only one transaction is ever in flight.

use crate::{
    error::Result, facade::ProviderEntity, report::build_reports, store::VersionArchive,
    Category, CodedValue, Descriptor, DescriptorTransaction, Entity, EntityMap, Error, Handle,
    MdibSnapshot, MdibVersionGroup, NodeType, ProviderConfig, Report, SnapshotSource,
    StateTransaction, TransactionResult, Traversal, Version,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tracing::info;

/// Everything guarded by the data lock.
#[derive(Debug)]
pub(crate) struct ProviderData {
    pub(crate) entities: EntityMap<Entity>,
    pub(crate) archive: VersionArchive,
    pub(crate) version_group: MdibVersionGroup,
}

#[derive(Debug)]
struct ProviderInner {
    data: RwLock<ProviderData>,
    transaction_lock: Mutex<()>,
}

/// Canonical, versioned device description and state.
///
/// Cheap to clone; clones share the same store.
#[derive(Debug, Clone)]
pub struct ProviderMdib {
    inner: Arc<ProviderInner>,
}

impl ProviderMdib {
    /// Create an empty MDIB at version 0.
    ///
    /// A fresh `urn:uuid:` sequence id is generated unless the config names one.
    pub fn new(config: &ProviderConfig) -> Self {
        let sequence_id = config
            .sequence_id
            .clone()
            .unwrap_or_else(MdibVersionGroup::generate_sequence_id);
        let version_group = MdibVersionGroup::new(sequence_id, config.instance_id);
        info!(%version_group, "provider mdib created");
        Self::with_data(ProviderData {
            entities: EntityMap::new(),
            archive: VersionArchive::new(),
            version_group,
        })
    }

    /// Restore a provider from a snapshot, continuing its version group and
    /// the retired versions of deleted handles.
    pub fn from_snapshot(mut snapshot: MdibSnapshot) -> Result<Self> {
        let version_group = snapshot.version_group.clone();
        let archive = std::mem::take(&mut snapshot.retired);
        let mut entities = EntityMap::new();
        for entity in snapshot.into_entities()? {
            entities.insert(entity);
        }
        info!(%version_group, entities = entities.len(), "provider mdib restored");
        Ok(Self::with_data(ProviderData {
            entities,
            archive,
            version_group,
        }))
    }

    fn with_data(data: ProviderData) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                data: RwLock::new(data),
                transaction_lock: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn read_data(&self) -> RwLockReadGuard<'_, ProviderData> {
        self.inner.data.read()
    }

    pub(crate) fn write_data(&self) -> RwLockWriteGuard<'_, ProviderData> {
        self.inner.data.write()
    }

    pub fn mdib_version_group(&self) -> MdibVersionGroup {
        self.read_data().version_group.clone()
    }

    pub fn mdib_version(&self) -> Version {
        self.read_data().version_group.mdib_version
    }

    pub fn len(&self) -> usize {
        self.read_data().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_data().entities.is_empty()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.read_data().entities.handles().cloned().collect()
    }

    fn facades<'a>(&self, entities: impl IntoIterator<Item = &'a Entity>) -> Vec<ProviderEntity> {
        entities
            .into_iter()
            .map(|e| ProviderEntity::new(self.clone(), e.clone()))
            .collect()
    }

    /// Detached copy of one entity.
    pub fn by_handle(&self, handle: &str) -> Option<ProviderEntity> {
        let entity = self.read_data().entities.get(handle).cloned()?;
        Some(ProviderEntity::new(self.clone(), entity))
    }

    pub(crate) fn entity(&self, handle: &str) -> Option<Entity> {
        self.read_data().entities.get(handle).cloned()
    }

    pub fn by_node_type(&self, node_type: NodeType) -> Vec<ProviderEntity> {
        let data = self.read_data();
        self.facades(data.entities.by_node_type(node_type))
    }

    /// Children of `parent`, or the root entities for `None`.
    pub fn by_parent_handle(&self, parent: Option<&str>) -> Vec<ProviderEntity> {
        let data = self.read_data();
        self.facades(data.entities.by_parent_handle(parent))
    }

    pub fn by_coding(&self, coding: &CodedValue) -> Vec<ProviderEntity> {
        let data = self.read_data();
        self.facades(data.entities.by_coding(coding))
    }

    pub fn subtree(&self, root: &str, order: Traversal, include_root: bool) -> Vec<ProviderEntity> {
        let data = self.read_data();
        self.facades(data.entities.subtree(root, order, include_root))
    }

    /// Build a detached entity with default state(s), ready to be inserted
    /// through a descriptor transaction.
    pub fn new_entity(
        &self,
        handle: &str,
        parent_handle: Option<&str>,
        node_type: NodeType,
    ) -> Result<ProviderEntity> {
        if self.read_data().entities.contains(handle) {
            return Err(Error::EntityAlreadyExists(handle.to_string()));
        }
        let entity = Entity::new(Descriptor::new(handle, parent_handle, node_type));
        Ok(ProviderEntity::new(self.clone(), entity))
    }

    /// Open a descriptor transaction. Blocks while another transaction is open.
    pub fn descriptor_transaction(&self) -> DescriptorTransaction<'_> {
        let exclusive = self.inner.transaction_lock.lock();
        let new_mdib_version = self.mdib_version() + 1;
        DescriptorTransaction::new(self, exclusive, new_mdib_version)
    }

    /// Open a state transaction for `category`. Blocks while another
    /// transaction is open.
    pub fn state_transaction(&self, category: Category) -> StateTransaction<'_> {
        let exclusive = self.inner.transaction_lock.lock();
        let new_mdib_version = self.mdib_version() + 1;
        StateTransaction::new(self, exclusive, category, new_mdib_version)
    }

    pub fn metric_state_transaction(&self) -> StateTransaction<'_> {
        self.state_transaction(Category::Metric)
    }

    pub fn alert_state_transaction(&self) -> StateTransaction<'_> {
        self.state_transaction(Category::Alert)
    }

    pub fn component_state_transaction(&self) -> StateTransaction<'_> {
        self.state_transaction(Category::Component)
    }

    pub fn operational_state_transaction(&self) -> StateTransaction<'_> {
        self.state_transaction(Category::Operational)
    }

    pub fn context_state_transaction(&self) -> StateTransaction<'_> {
        self.state_transaction(Category::Context)
    }

    pub fn rt_sample_state_transaction(&self) -> StateTransaction<'_> {
        self.state_transaction(Category::RealTimeSample)
    }

    /// Consistent full copy, taken under the data lock.
    pub fn snapshot(&self) -> MdibSnapshot {
        let data = self.read_data();
        let mut snapshot = MdibSnapshot::new(data.version_group.clone());
        for entity in data.entities.values() {
            snapshot.add_entity(entity);
        }
        snapshot.retired = data.archive.clone();
        snapshot
    }

    /// Reports for a committed transaction, stamped with the current group.
    pub fn reports_for(&self, result: &TransactionResult) -> Vec<Report> {
        let group = self.mdib_version_group().at_version(result.new_mdib_version);
        build_reports(result, &group)
    }
}

impl SnapshotSource for ProviderMdib {
    fn fetch_snapshot(&self) -> Result<MdibSnapshot> {
        Ok(self.snapshot())
    }
}
