//! Error types for the ledger, the external collaborators and the indexer.

use serde::Serialize;
use thiserror::Error;

use crate::store::EntityKind;

/// Failures raised by the local hash-chain ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The record could not be turned into a canonical JSON object.
    #[error("cannot encode payload: {0}")]
    Encoding(String),

    /// The chain has no blocks at all (genesis missing).
    #[error("ledger has no genesis block")]
    EmptyChain,

    #[error("no record at index {0}")]
    NotFound(u64),

    /// A stored block file could not be read back as the block its name promises.
    #[error("corrupt block file {}: {reason}", .path.display())]
    CorruptBlock {
        path: std::path::PathBuf,
        reason: String,
    },

    /// Writing or reading the block files failed.
    #[error("ledger storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Failures raised by a [`ChainEventSource`](crate::source::ChainEventSource).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The event source could not be reached. Retryable.
    #[error("event source unreachable: {0}")]
    Connectivity(String),

    /// An event or call result did not have the expected shape.
    #[error("malformed source data: {0}")]
    Decode(String),
}

/// Failures raised by a [`RelationalStore`](crate::store::RelationalStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or the connection is gone. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Duplicate natural key or dangling reference.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                rusqlite::ErrorCode::ConstraintViolation => {
                    Self::ConstraintViolation(err.to_string())
                }
                rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::NotADatabase => Self::Unavailable(err.to_string()),
                _ => Self::Database(err.to_string()),
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// A failure reported in a synchronization outcome.
///
/// These never escape `synchronize()` as `Err`; they are aggregated so the
/// caller decides what the user sees.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum SyncError {
    #[error("event source unreachable while syncing {stage}s: {message}")]
    Connectivity { stage: EntityKind, message: String },

    #[error("skipped malformed {stage} data at position {position:?}: {message}")]
    Decode {
        stage: EntityKind,
        position: Option<u64>,
        message: String,
    },

    #[error("store rejected {kind} {key}: {message}")]
    Rejected {
        kind: EntityKind,
        key: String,
        message: String,
    },

    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("{kind} {key} still waiting for {parent} after {cycles} cycles")]
    DependencyStalled {
        kind: EntityKind,
        key: String,
        parent: String,
        cycles: u32,
    },
}

/// Failure of one scheduled run.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("synchronization aborted: {0}")]
    SyncAborted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
