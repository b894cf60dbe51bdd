//! Provider transactions: the only way to mutate a [`ProviderMdib`].
//!
//! A transaction holds the provider's exclusivity lock from open until it is
//! committed or dropped, so transactions fully serialize. Writes are staged
//! and validated as they arrive; nothing touches the store until `commit`,
//! which computes the complete diff first and applies it only if every step
//! succeeded.
//!
//! # Commit rules
//!
//! 1. `new_mdib_version` is fixed at open (store version + 1).
//! 2. State writes get `state_version = old + 1` (or one past the archived
//!    version for a handle that was deleted before) and mirror the current
//!    descriptor version.
//! 3. Descriptor transactions carry one kind of operation only. Inserting or
//!    deleting a child bumps the surviving parent's versions.
//! 4. A transaction that changed nothing returns `Ok(None)` and leaves the
//!    version untouched.

use crate::provider::{ProviderData, ProviderMdib};
use crate::{
    error::Result, state::now_millis, AlertState, Category, ContextAssociation, Descriptor,
    Entity, Error, Handle, State, StatePayload, Timestamp, Traversal, Version,
};
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Diff of a committed transaction, partitioned by category.
///
/// This is the only artifact used to build outgoing reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    pub new_mdib_version: Version,
    pub descr_created: Vec<Entity>,
    pub descr_updated: Vec<Entity>,
    pub descr_deleted: Vec<Entity>,
    pub metric_updates: Vec<State>,
    pub alert_updates: Vec<State>,
    pub comp_updates: Vec<State>,
    pub ctxt_updates: Vec<State>,
    pub op_updates: Vec<State>,
    pub rt_updates: Vec<State>,
}

impl TransactionResult {
    fn new(new_mdib_version: Version) -> Self {
        Self {
            new_mdib_version,
            descr_created: Vec::new(),
            descr_updated: Vec::new(),
            descr_deleted: Vec::new(),
            metric_updates: Vec::new(),
            alert_updates: Vec::new(),
            comp_updates: Vec::new(),
            ctxt_updates: Vec::new(),
            op_updates: Vec::new(),
            rt_updates: Vec::new(),
        }
    }

    pub fn has_descriptor_changes(&self) -> bool {
        !(self.descr_created.is_empty()
            && self.descr_updated.is_empty()
            && self.descr_deleted.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_descriptor_changes()
            && Category::ALL
                .iter()
                .all(|c| self.state_updates(*c).is_empty())
    }

    /// Updated states of one category.
    pub fn state_updates(&self, category: Category) -> &[State] {
        match category {
            Category::Metric => &self.metric_updates,
            Category::Alert => &self.alert_updates,
            Category::Component => &self.comp_updates,
            Category::Context => &self.ctxt_updates,
            Category::Operational => &self.op_updates,
            Category::RealTimeSample => &self.rt_updates,
        }
    }

    fn push_state(&mut self, state: State) {
        let bucket = match state.category() {
            Category::Metric => &mut self.metric_updates,
            Category::Alert => &mut self.alert_updates,
            Category::Component => &mut self.comp_updates,
            Category::Context => &mut self.ctxt_updates,
            Category::Operational => &mut self.op_updates,
            Category::RealTimeSample => &mut self.rt_updates,
        };
        bucket.push(state);
    }

    fn change_count(&self) -> usize {
        self.descr_created.len()
            + self.descr_updated.len()
            + self.descr_deleted.len()
            + Category::ALL
                .iter()
                .map(|c| self.state_updates(*c).len())
                .sum::<usize>()
    }
}

/// The single kind of structural operation a descriptor transaction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorOperation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for DescriptorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorOperation::Insert => write!(f, "insert"),
            DescriptorOperation::Update => write!(f, "update"),
            DescriptorOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Bump descriptor and state versions of an entity whose child set changed
/// or whose descriptor was rewritten.
fn bump_versions(entity: &mut Entity) {
    let descriptor_version = entity.descriptor().descriptor_version + 1;
    entity.descriptor_mut().descriptor_version = descriptor_version;
    for state in entity.states_mut() {
        state.descriptor_version = descriptor_version;
        state.state_version += 1;
    }
}

/// Compute the committed form of a written state, or `None` if the write does
/// not change the canonical payload.
fn derive_state(
    descriptor: &Descriptor,
    old: Option<&State>,
    written: &State,
    data: &ProviderData,
    new_mdib_version: Version,
    now: Timestamp,
) -> Result<Option<State>> {
    if written.descriptor_handle != descriptor.handle {
        return Err(Error::ForeignState {
            state: written.key().to_string(),
            descriptor: descriptor.handle.clone(),
        });
    }
    if written.category() != descriptor.category() {
        return Err(Error::CategoryMismatch {
            handle: written.key().to_string(),
            expected: descriptor.category(),
            actual: written.category(),
        });
    }
    if let Some(old) = old {
        if old.payload == written.payload {
            return Ok(None);
        }
    }

    let mut state = written.clone();
    let resurrected = data.archive.next_state_version(state.key());
    state.state_version = match old {
        Some(old) => (old.state_version + 1).max(resurrected),
        None => resurrected,
    };
    state.descriptor_version = descriptor.descriptor_version;
    stamp_payload(
        &mut state.payload,
        old.map(|o| &o.payload),
        new_mdib_version,
        now,
    );
    Ok(Some(state))
}

/// Category-specific timestamp rules.
fn stamp_payload(
    payload: &mut StatePayload,
    old: Option<&StatePayload>,
    new_mdib_version: Version,
    now: Timestamp,
) {
    match payload {
        StatePayload::Metric(metric) => {
            if let Some(value) = metric.value.as_mut() {
                value.determination_time = Some(now);
            }
        }
        StatePayload::RealTimeSample(rt) => rt.determination_time = Some(now),
        StatePayload::Alert(AlertState::Condition(condition)) => {
            let previous = match old {
                Some(StatePayload::Alert(AlertState::Condition(o))) => Some(o.presence),
                _ => None,
            };
            if previous != Some(condition.presence) {
                condition.determination_time = Some(now);
            }
        }
        StatePayload::Alert(AlertState::Signal(_))
        | StatePayload::Alert(AlertState::System(_))
        | StatePayload::Component(_)
        | StatePayload::Operational(_) => {}
        StatePayload::Context(context) => match context.association {
            ContextAssociation::Associated => {
                context.binding_mdib_version.get_or_insert(new_mdib_version);
                context.binding_start_time.get_or_insert(now);
            }
            ContextAssociation::Disassociated => {
                context.unbinding_mdib_version.get_or_insert(new_mdib_version);
                context.binding_end_time.get_or_insert(now);
            }
            ContextAssociation::NoAssociation => {}
        },
    }
}

/// Context state handles share one namespace with descriptor handles and
/// with the states of every other entity. `staged` holds the entities written
/// earlier in the same transaction.
fn check_state_handles(data: &ProviderData, entity: &Entity, staged: &[&Entity]) -> Result<()> {
    if !entity.node_type().is_multi_state() {
        return Ok(());
    }
    let owner = entity.handle();
    for state in entity.states() {
        let key = state.key();
        let stored = data.entities.contains(key)
            || data.entities.state_owner(key).is_some_and(|o| o != owner);
        let pending = staged
            .iter()
            .filter(|e| e.handle() != owner)
            .any(|e| e.handle() == key || e.states().iter().any(|s| s.key() == key));
        if key == owner || stored || pending {
            return Err(Error::DuplicateHandle(key.to_string()));
        }
    }
    Ok(())
}

/// A new descriptor handle must not already name a context state.
fn check_descriptor_handle(data: &ProviderData, handle: &str, staged: &[&Entity]) -> Result<()> {
    let pending = staged
        .iter()
        .filter(|e| e.node_type().is_multi_state())
        .any(|e| e.states().iter().any(|s| s.key() == handle));
    if pending || data.entities.state_owner(handle).is_some() {
        return Err(Error::DuplicateHandle(handle.to_string()));
    }
    Ok(())
}

/// A transaction writing states of one category.
///
/// Obtained from [`ProviderMdib::metric_state_transaction`] and its siblings.
/// Dropping it without calling [`StateTransaction::commit`] discards every
/// staged write.
pub struct StateTransaction<'a> {
    mdib: &'a ProviderMdib,
    _exclusive: MutexGuard<'a, ()>,
    category: Category,
    new_mdib_version: Version,
    staged: BTreeMap<Handle, Entity>,
    poisoned: bool,
}

impl<'a> StateTransaction<'a> {
    pub(crate) fn new(
        mdib: &'a ProviderMdib,
        exclusive: MutexGuard<'a, ()>,
        category: Category,
        new_mdib_version: Version,
    ) -> Self {
        Self {
            mdib,
            _exclusive: exclusive,
            category,
            new_mdib_version,
            staged: BTreeMap::new(),
            poisoned: false,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Version this transaction will commit as, if it changes anything.
    pub fn new_mdib_version(&self) -> Version {
        self.new_mdib_version
    }

    /// Stage the state(s) of `entity`. For context entities every state whose
    /// payload differs from the canonical one (or that is new) is written.
    ///
    /// Any error poisons the transaction.
    pub fn write_entity(&mut self, entity: &Entity) -> Result<()> {
        let staged = self.stage(entity);
        if staged.is_err() {
            self.poisoned = true;
        }
        staged
    }

    fn stage(&mut self, entity: &Entity) -> Result<()> {
        if self.poisoned {
            return Err(Error::TransactionPoisoned);
        }
        let handle = entity.handle();
        if entity.category() != self.category {
            return Err(Error::CategoryMismatch {
                handle: handle.to_string(),
                expected: self.category,
                actual: entity.category(),
            });
        }
        if self.staged.contains_key(handle) {
            return Err(Error::DuplicateWrite(handle.to_string()));
        }
        entity.validate()?;
        {
            let data = self.mdib.read_data();
            if !data.entities.contains(handle) {
                return Err(Error::EntityNotFound(handle.to_string()));
            }
            let staged: Vec<&Entity> = self.staged.values().collect();
            check_state_handles(&data, entity, &staged)?;
        }
        self.staged.insert(handle.to_string(), entity.clone());
        Ok(())
    }

    /// Apply the staged writes. Returns `Ok(None)` if nothing changed.
    pub fn commit(mut self) -> Result<Option<TransactionResult>> {
        if self.poisoned {
            return Err(Error::TransactionPoisoned);
        }
        let staged = std::mem::take(&mut self.staged);
        let now = now_millis();
        let mut data = self.mdib.write_data();
        let mut result = TransactionResult::new(self.new_mdib_version);
        let mut replacements = Vec::new();

        for (handle, written) in staged {
            let mut updated = data
                .entities
                .get(&handle)
                .cloned()
                .ok_or_else(|| Error::EntityNotFound(handle.clone()))?;
            let mut changed = false;

            match (&mut updated, &written) {
                (Entity::Single(current), Entity::Single(new)) => {
                    if let Some(state) = derive_state(
                        &current.descriptor,
                        Some(&current.state),
                        &new.state,
                        &data,
                        self.new_mdib_version,
                        now,
                    )? {
                        current.state = state.clone();
                        result.push_state(state);
                        changed = true;
                    }
                }
                (Entity::Multi(current), Entity::Multi(new)) => {
                    for (key, state) in &new.states {
                        if let Some(state) = derive_state(
                            &current.descriptor,
                            current.states.get(key),
                            state,
                            &data,
                            self.new_mdib_version,
                            now,
                        )? {
                            current.states.insert(key.clone(), state.clone());
                            result.push_state(state);
                            changed = true;
                        }
                    }
                }
                _ => {
                    return Err(Error::VersionInvariant {
                        handle,
                        detail: "entity shape differs from the stored entity".to_string(),
                    })
                }
            }

            if changed {
                replacements.push(updated);
            }
        }

        if result.is_empty() {
            debug!(category = %self.category, "state transaction changed nothing");
            return Ok(None);
        }

        for entity in replacements {
            data.entities.insert(entity);
        }
        data.version_group.mdib_version = self.new_mdib_version;

        debug!(
            category = %self.category,
            mdib_version = self.new_mdib_version,
            changes = result.change_count(),
            "committed state transaction"
        );
        Ok(Some(result))
    }
}

impl Drop for StateTransaction<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            debug!(
                category = %self.category,
                staged = self.staged.len(),
                "discarding uncommitted state transaction"
            );
        }
    }
}

/// A transaction inserting, updating or deleting descriptors.
///
/// Exactly one kind of operation per transaction; the first write fixes it.
pub struct DescriptorTransaction<'a> {
    mdib: &'a ProviderMdib,
    _exclusive: MutexGuard<'a, ()>,
    new_mdib_version: Version,
    operation: Option<DescriptorOperation>,
    inserts: Vec<Entity>,
    updates: Vec<Entity>,
    deletes: Vec<Handle>,
    written: HashSet<Handle>,
    poisoned: bool,
}

impl<'a> DescriptorTransaction<'a> {
    pub(crate) fn new(
        mdib: &'a ProviderMdib,
        exclusive: MutexGuard<'a, ()>,
        new_mdib_version: Version,
    ) -> Self {
        Self {
            mdib,
            _exclusive: exclusive,
            new_mdib_version,
            operation: None,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            written: HashSet::new(),
            poisoned: false,
        }
    }

    pub fn new_mdib_version(&self) -> Version {
        self.new_mdib_version
    }

    pub fn operation(&self) -> Option<DescriptorOperation> {
        self.operation
    }

    /// Insert `entity` if its handle is not in the store, otherwise update
    /// the stored descriptor from it.
    ///
    /// Parents must be written before their children when inserting a
    /// subtree. Any error poisons the transaction.
    pub fn write_entity(&mut self, entity: &Entity) -> Result<()> {
        let exists = self.mdib.read_data().entities.contains(entity.handle());
        let staged = if exists {
            self.stage_update(entity)
        } else {
            self.stage_insert(entity)
        };
        if staged.is_err() {
            self.poisoned = true;
        }
        staged
    }

    /// Delete `handle` and its whole subtree.
    pub fn remove_entity(&mut self, handle: &str) -> Result<()> {
        let staged = self.stage_delete(handle);
        if staged.is_err() {
            self.poisoned = true;
        }
        staged
    }

    fn claim(&mut self, operation: DescriptorOperation, handle: &str) -> Result<()> {
        if self.poisoned {
            return Err(Error::TransactionPoisoned);
        }
        match self.operation {
            Some(current) if current != operation => {
                return Err(Error::MixedDescriptorOperation {
                    current,
                    requested: operation,
                })
            }
            _ => self.operation = Some(operation),
        }
        if !self.written.insert(handle.to_string()) {
            return Err(Error::DuplicateWrite(handle.to_string()));
        }
        Ok(())
    }

    fn stage_insert(&mut self, entity: &Entity) -> Result<()> {
        self.claim(DescriptorOperation::Insert, entity.handle())?;
        entity.validate()?;

        let descriptor = entity.descriptor();
        let parent_type = match descriptor.parent_handle.as_deref() {
            None => None,
            Some(parent) => {
                let stored = self.mdib.read_data().entities.node_type_of(parent);
                let staged = || {
                    self.inserts
                        .iter()
                        .find(|e| e.handle() == parent)
                        .map(Entity::node_type)
                };
                let node_type = stored.or_else(staged).ok_or_else(|| Error::UnknownParent {
                    handle: descriptor.handle.clone(),
                    parent: parent.to_string(),
                })?;
                Some(node_type)
            }
        };
        if !descriptor.node_type.accepts_parent(parent_type) {
            return Err(Error::InvalidParent {
                handle: descriptor.handle.clone(),
                node_type: descriptor.node_type,
                parent: parent_type,
            });
        }
        {
            let data = self.mdib.read_data();
            let staged: Vec<&Entity> = self.inserts.iter().collect();
            check_descriptor_handle(&data, entity.handle(), &staged)?;
            check_state_handles(&data, entity, &staged)?;
        }

        self.inserts.push(entity.clone());
        Ok(())
    }

    fn stage_update(&mut self, entity: &Entity) -> Result<()> {
        self.claim(DescriptorOperation::Update, entity.handle())?;
        entity.validate()?;

        let data = self.mdib.read_data();
        let current = data
            .entities
            .get(entity.handle())
            .ok_or_else(|| Error::EntityNotFound(entity.handle().to_string()))?;
        if current.node_type() != entity.node_type() {
            return Err(Error::InvalidUpdate {
                handle: entity.handle().to_string(),
                reason: "node type cannot change".to_string(),
            });
        }
        if current.parent_handle() != entity.parent_handle() {
            return Err(Error::InvalidUpdate {
                handle: entity.handle().to_string(),
                reason: "parent cannot change".to_string(),
            });
        }
        drop(data);

        self.updates.push(entity.clone());
        Ok(())
    }

    fn stage_delete(&mut self, handle: &str) -> Result<()> {
        self.claim(DescriptorOperation::Delete, handle)?;
        if !self.mdib.read_data().entities.contains(handle) {
            return Err(Error::EntityNotFound(handle.to_string()));
        }
        self.deletes.push(handle.to_string());
        Ok(())
    }

    /// Apply the staged operation. Returns `Ok(None)` if nothing changed.
    pub fn commit(mut self) -> Result<Option<TransactionResult>> {
        if self.poisoned {
            return Err(Error::TransactionPoisoned);
        }
        let Some(operation) = self.operation else {
            debug!("descriptor transaction staged nothing");
            return Ok(None);
        };

        let mut data = self.mdib.write_data();
        let mut result = TransactionResult::new(self.new_mdib_version);
        let plan = match operation {
            DescriptorOperation::Insert => {
                Self::plan_inserts(&data, &mut result, std::mem::take(&mut self.inserts))?
            }
            DescriptorOperation::Update => {
                Self::plan_updates(&data, &mut result, std::mem::take(&mut self.updates))?
            }
            DescriptorOperation::Delete => {
                Self::plan_deletes(&data, &mut result, std::mem::take(&mut self.deletes))?
            }
        };

        if result.is_empty() {
            debug!(%operation, "descriptor transaction changed nothing");
            return Ok(None);
        }

        for handle in &plan.removals {
            if let Some(entity) = data.entities.remove(handle) {
                data.archive.archive(&entity);
            }
        }
        for entity in plan.upserts {
            data.entities.insert(entity);
        }
        data.version_group.mdib_version = self.new_mdib_version;

        debug!(
            %operation,
            mdib_version = self.new_mdib_version,
            created = result.descr_created.len(),
            updated = result.descr_updated.len(),
            deleted = result.descr_deleted.len(),
            "committed descriptor transaction"
        );
        Ok(Some(result))
    }

    fn bump_parents(
        data: &ProviderData,
        result: &mut TransactionResult,
        plan: &mut CommitPlan,
        parents: BTreeSet<Handle>,
    ) -> Result<()> {
        for parent in parents {
            let mut entity = data
                .entities
                .get(&parent)
                .cloned()
                .ok_or_else(|| Error::EntityNotFound(parent.clone()))?;
            bump_versions(&mut entity);
            result.descr_updated.push(entity.clone());
            plan.upserts.push(entity);
        }
        Ok(())
    }

    fn plan_inserts(
        data: &ProviderData,
        result: &mut TransactionResult,
        inserts: Vec<Entity>,
    ) -> Result<CommitPlan> {
        let inserted: HashSet<Handle> = inserts.iter().map(|e| e.handle().to_string()).collect();
        let mut plan = CommitPlan::default();
        let mut parents = BTreeSet::new();
        let now = now_millis();

        for mut entity in inserts {
            let descriptor_version = data.archive.next_descriptor_version(entity.handle());
            let multi_state = entity.node_type().is_multi_state();
            entity.descriptor_mut().descriptor_version = descriptor_version;
            for state in entity.states_mut() {
                state.descriptor_version = descriptor_version;
                state.state_version = data.archive.next_state_version(state.key());
                if multi_state {
                    // binding stamps, as a context transaction would apply them
                    stamp_payload(&mut state.payload, None, result.new_mdib_version, now);
                }
            }
            if let Some(parent) = entity.parent_handle() {
                if !inserted.contains(parent) {
                    parents.insert(parent.to_string());
                }
            }
            result.descr_created.push(entity.clone());
            plan.upserts.push(entity);
        }

        Self::bump_parents(data, result, &mut plan, parents)?;
        Ok(plan)
    }

    fn plan_updates(
        data: &ProviderData,
        result: &mut TransactionResult,
        updates: Vec<Entity>,
    ) -> Result<CommitPlan> {
        let mut plan = CommitPlan::default();
        for staged in updates {
            let current = data
                .entities
                .get(staged.handle())
                .ok_or_else(|| Error::EntityNotFound(staged.handle().to_string()))?;
            if current.descriptor().same_content(staged.descriptor()) {
                continue;
            }
            // States come from the store; staged state edits are ignored here.
            let mut entity = current.clone();
            *entity.descriptor_mut() = Descriptor {
                descriptor_version: current.descriptor().descriptor_version,
                ..staged.descriptor().clone()
            };
            bump_versions(&mut entity);
            result.descr_updated.push(entity.clone());
            plan.upserts.push(entity);
        }
        Ok(plan)
    }

    fn plan_deletes(
        data: &ProviderData,
        result: &mut TransactionResult,
        deletes: Vec<Handle>,
    ) -> Result<CommitPlan> {
        let mut plan = CommitPlan::default();
        let mut doomed = HashSet::new();

        for target in &deletes {
            let subtree = data
                .entities
                .subtree_handles(target, Traversal::DepthFirst, true);
            if subtree.is_empty() {
                return Err(Error::EntityNotFound(target.clone()));
            }
            for handle in subtree {
                if doomed.insert(handle.clone()) {
                    plan.removals.push(handle);
                }
            }
        }

        for handle in &plan.removals {
            if let Some(entity) = data.entities.get(handle) {
                result.descr_deleted.push(entity.clone());
            }
        }

        let parents: BTreeSet<Handle> = deletes
            .iter()
            .filter_map(|h| data.entities.get(h).and_then(Entity::parent_handle))
            .filter(|parent| !doomed.contains(*parent))
            .map(str::to_string)
            .collect();
        Self::bump_parents(data, result, &mut plan, parents)?;
        Ok(plan)
    }
}

impl Drop for DescriptorTransaction<'_> {
    fn drop(&mut self) {
        let staged = self.inserts.len() + self.updates.len() + self.deletes.len();
        if staged > 0 {
            debug!(staged, "discarding uncommitted descriptor transaction");
        }
    }
}

/// Store changes computed by a descriptor commit before any is applied.
#[derive(Default)]
struct CommitPlan {
    upserts: Vec<Entity>,
    removals: Vec<Handle>,
}
