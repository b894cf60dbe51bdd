//! Version-and-session identity of one replicated dataset.
//!
//! Every provider commit that changes something advances `mdib_version` by
//! one within a `sequence_id`. A consumer compares the group stamped on each
//! incoming report against its own to decide whether to apply, ignore, or
//! invalidate its replica.

use crate::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(mdib_version, sequence_id, instance_id)` of an MDIB.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MdibVersionGroup {
    /// Serial change counter within the sequence
    pub mdib_version: Version,
    /// Identifies one uninterrupted run of the provider's version counter
    pub sequence_id: String,
    /// Optional provider instance discriminator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<u64>,
}

/// What a consumer should do with a report stamped with some version group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Apply the report. `gap` is the distance to the local version; more
    /// than one means notifications were probably missed.
    Apply { gap: Version },
    /// Older than the local version; ignore.
    Stale,
    /// Sequence or instance changed; the replica is no longer valid.
    SessionReset,
}

impl MdibVersionGroup {
    /// Create a group at version 0.
    pub fn new(sequence_id: impl Into<String>, instance_id: Option<u64>) -> Self {
        Self {
            mdib_version: 0,
            sequence_id: sequence_id.into(),
            instance_id,
        }
    }

    /// Create a group with a specific version.
    pub fn with_version(
        mdib_version: Version,
        sequence_id: impl Into<String>,
        instance_id: Option<u64>,
    ) -> Self {
        Self {
            mdib_version,
            sequence_id: sequence_id.into(),
            instance_id,
        }
    }

    /// Generate a fresh `urn:uuid:` sequence id.
    pub fn generate_sequence_id() -> String {
        format!("urn:uuid:{}", Uuid::new_v4())
    }

    /// Same sequence and instance, regardless of version.
    pub fn same_session(&self, other: &MdibVersionGroup) -> bool {
        self.sequence_id == other.sequence_id && self.instance_id == other.instance_id
    }

    /// `sequence_id` plus instance, the part that must match across reports.
    pub fn session(&self) -> String {
        match self.instance_id {
            Some(instance) => format!("{}/{}", self.sequence_id, instance),
            None => self.sequence_id.clone(),
        }
    }

    /// This group with its version replaced.
    pub fn at_version(&self, mdib_version: Version) -> Self {
        Self {
            mdib_version,
            ..self.clone()
        }
    }

    /// Decide how a local replica at `self` treats a report stamped `incoming`.
    ///
    /// Equal versions are accepted: applying a state twice is a no-op.
    pub fn accepts(&self, incoming: &MdibVersionGroup) -> Acceptance {
        if !self.same_session(incoming) {
            return Acceptance::SessionReset;
        }
        if incoming.mdib_version < self.mdib_version {
            return Acceptance::Stale;
        }
        Acceptance::Apply {
            gap: incoming.mdib_version - self.mdib_version,
        }
    }
}

impl std::fmt::Display for MdibVersionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instance_id {
            Some(instance) => write!(
                f,
                "{}@{}/{}",
                self.mdib_version, self.sequence_id, instance
            ),
            None => write!(f, "{}@{}", self.mdib_version, self.sequence_id),
        }
    }
}
