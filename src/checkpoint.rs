//! Durable batch progress.
//!
//! [`CheckpointState`] keeps one tagged status per discovered item, so the pending, processed,
//! and failed views can never overlap. [`CheckpointStore`] persists it; the file-backed store
//! writes through a temporary file and a rename so readers never see a half-written record.

/// In-memory checkpoint state and its wire format.
pub mod state;
/// Storage backends.
pub mod store;

use std::path::PathBuf;
use thiserror::Error;

pub use state::{
    BatchStatus, CheckpointProgress, CheckpointState, FailureRecord, FailureSummary,
    ReconcileSummary,
};
pub use store::{CheckpointStore, FileCheckpointStore};

/// Errors raised while loading, mutating, or persisting checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Reading or writing the checkpoint file failed.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// File involved in the failed operation.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The checkpoint could not be encoded.
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
    /// The stored checkpoint could not be decoded or violates its invariants.
    #[error("corrupt checkpoint {path}: {message}")]
    Corrupt {
        /// File holding the corrupt record.
        path: PathBuf,
        /// Decoder or validation message.
        message: String,
    },
    /// The record's item sets are inconsistent.
    #[error("inconsistent checkpoint: {0}")]
    Inconsistent(String),
    /// An outcome was recorded for an item the batch never discovered.
    #[error("item {0} is not part of this batch")]
    UnknownItem(String),
}
