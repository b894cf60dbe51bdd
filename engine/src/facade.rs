//! Entity facades: detached, freely mutable copies bound to their store.
//!
//! A facade never points into the store. It keeps the handle and re-resolves
//! it on [`update`](ProviderEntity::update); edits stay local until the
//! entity is written through a transaction.

use crate::{error::Result, ConsumerMdib, Entity, Error, ProviderMdib};
use std::ops::{Deref, DerefMut};

/// A detached copy of a provider entity.
#[derive(Debug, Clone)]
pub struct ProviderEntity {
    mdib: ProviderMdib,
    entity: Entity,
}

impl ProviderEntity {
    pub(crate) fn new(mdib: ProviderMdib, entity: Entity) -> Self {
        Self { mdib, entity }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn into_entity(self) -> Entity {
        self.entity
    }

    /// Re-sync from the store if its version counters moved. Local edits are
    /// lost in that case. Returns whether the copy changed.
    pub fn update(&mut self) -> Result<bool> {
        let current = self
            .mdib
            .entity(self.entity.handle())
            .ok_or_else(|| Error::EntityNotFound(self.entity.handle().to_string()))?;
        if current.versions() == self.entity.versions() {
            return Ok(false);
        }
        self.entity = current;
        Ok(true)
    }
}

impl Deref for ProviderEntity {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.entity
    }
}

impl DerefMut for ProviderEntity {
    fn deref_mut(&mut self) -> &mut Entity {
        &mut self.entity
    }
}

/// A detached copy of a replicated entity.
#[derive(Debug, Clone)]
pub struct ConsumerEntity {
    mdib: ConsumerMdib,
    entity: Entity,
}

impl ConsumerEntity {
    pub(crate) fn new(mdib: ConsumerMdib, entity: Entity) -> Self {
        Self { mdib, entity }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn into_entity(self) -> Entity {
        self.entity
    }

    /// Re-sync from the replica if its version counters moved.
    pub fn update(&mut self) -> Result<bool> {
        let current = self
            .mdib
            .entity(self.entity.handle())
            .ok_or_else(|| Error::EntityNotFound(self.entity.handle().to_string()))?;
        if current.versions() == self.entity.versions() {
            return Ok(false);
        }
        self.entity = current;
        Ok(true)
    }
}

impl Deref for ConsumerEntity {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.entity
    }
}

impl DerefMut for ConsumerEntity {
    fn deref_mut(&mut self) -> &mut Entity {
        &mut self.entity
    }
}
