//! Error types for the MDIB engine.

use crate::{Category, DescriptorOperation, Handle, NodeType, Version};
use thiserror::Error;

/// All possible errors from the MDIB engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Usage errors
    #[error("{expected} transaction cannot write {actual} entity {handle}")]
    CategoryMismatch {
        handle: Handle,
        expected: Category,
        actual: Category,
    },

    #[error("entity written twice in one transaction: {0}")]
    DuplicateWrite(Handle),

    #[error("descriptor transaction already holds {current} operations, cannot {requested}")]
    MixedDescriptorOperation {
        current: DescriptorOperation,
        requested: DescriptorOperation,
    },

    #[error("transaction was aborted by an earlier error")]
    TransactionPoisoned,

    #[error("entity already exists: {0}")]
    EntityAlreadyExists(Handle),

    #[error("handle already names another descriptor or state: {0}")]
    DuplicateHandle(Handle),

    // Structural errors
    #[error("entity not found: {0}")]
    EntityNotFound(Handle),

    #[error("unknown parent '{parent}' for {handle}")]
    UnknownParent { handle: Handle, parent: Handle },

    #[error("{node_type} {handle} cannot be placed under {parent:?}")]
    InvalidParent {
        handle: Handle,
        node_type: NodeType,
        parent: Option<NodeType>,
    },

    #[error("missing state for {0}")]
    MissingState(Handle),

    #[error("state {state} does not belong to {descriptor}")]
    ForeignState { state: Handle, descriptor: Handle },

    #[error("invalid update of {handle}: {reason}")]
    InvalidUpdate { handle: Handle, reason: String },

    #[error("version invariant violated for {handle}: {detail}")]
    VersionInvariant { handle: Handle, detail: String },

    // Staleness
    #[error("stale report: local version {local}, received {received}")]
    StaleReport { local: Version, received: Version },

    // Session reset
    #[error("session reset: expected sequence {expected}, received {received}")]
    SessionReset { expected: String, received: String },

    #[error("replica is not initialized")]
    NotInitialized,

    // Snapshot source
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Coarse classification of an [`Error`], for callers that branch on the class
/// rather than the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller defect; never retried.
    Usage,
    /// Broken structure; aborts a transaction or drops a single report.
    Structural,
    /// Already-seen data; ignored.
    Stale,
    /// Sequence or instance changed; the replica needs a reload.
    Reset,
    /// The external snapshot source failed or delivered bad material.
    Source,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CategoryMismatch { .. }
            | Error::DuplicateWrite(_)
            | Error::MixedDescriptorOperation { .. }
            | Error::TransactionPoisoned
            | Error::EntityAlreadyExists(_)
            | Error::DuplicateHandle(_) => ErrorKind::Usage,
            Error::EntityNotFound(_)
            | Error::UnknownParent { .. }
            | Error::InvalidParent { .. }
            | Error::MissingState(_)
            | Error::ForeignState { .. }
            | Error::InvalidUpdate { .. }
            | Error::VersionInvariant { .. } => ErrorKind::Structural,
            Error::StaleReport { .. } => ErrorKind::Stale,
            Error::SessionReset { .. } | Error::NotInitialized => ErrorKind::Reset,
            Error::SnapshotUnavailable(_) | Error::InvalidSnapshot(_) => ErrorKind::Source,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::EntityNotFound("vmd0".into());
        assert_eq!(err.to_string(), "entity not found: vmd0");

        let err = Error::CategoryMismatch {
            handle: "as0".into(),
            expected: Category::Metric,
            actual: Category::Alert,
        };
        assert_eq!(
            err.to_string(),
            "metric transaction cannot write alert entity as0"
        );

        let err = Error::StaleReport {
            local: 10,
            received: 9,
        };
        assert_eq!(
            err.to_string(),
            "stale report: local version 10, received 9"
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::DuplicateWrite("x".into()).kind(), ErrorKind::Usage);
        assert_eq!(Error::DuplicateHandle("x".into()).kind(), ErrorKind::Usage);
        assert_eq!(Error::MissingState("x".into()).kind(), ErrorKind::Structural);
        assert_eq!(Error::NotInitialized.kind(), ErrorKind::Reset);
        assert_eq!(
            Error::SnapshotUnavailable("timeout".into()).kind(),
            ErrorKind::Source
        );
    }
}
