//! Work-set discovery.
//!
//! Listers yield items lazily so large folders never need to be materialized up front. A
//! listing error ends discovery for the whole batch.

/// Remote storage folder listing and downloads.
pub mod drive;
/// Local directory walking.
pub mod local;

use crate::model::{BatchSource, WorkItem};
use futures_core::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub use drive::DriveClient;

/// Lazy sequence of discovered items.
pub type ItemStream<'a> = Pin<Box<dyn Stream<Item = Result<WorkItem, SourceError>> + Send + 'a>>;

/// Errors raised while listing a work set.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be listed.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The remote storage API answered with a non-success status.
    #[error("storage API returned {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: reqwest::StatusCode,
        /// Response body, possibly empty.
        body: String,
    },
    /// Transport failure talking to the remote storage API.
    #[error("storage API request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The batch needs a collaborator that was not configured.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Enumerates the items of a work set.
pub trait SourceLister: Send + Sync {
    /// Lazily list every item reachable from `source`.
    fn list<'a>(&'a self, source: &'a BatchSource) -> ItemStream<'a>;
}

/// Lister dispatching on the source variant.
#[derive(Clone, Default)]
pub struct SourceRouter {
    drive: Option<Arc<DriveClient>>,
}

impl SourceRouter {
    /// Router that can list local directories and, when `drive` is set, remote folders.
    pub fn new(drive: Option<Arc<DriveClient>>) -> Self {
        Self { drive }
    }
}

impl SourceLister for SourceRouter {
    fn list<'a>(&'a self, source: &'a BatchSource) -> ItemStream<'a> {
        match source {
            BatchSource::Local { root } => local::list_directory(root.clone()),
            BatchSource::Drive { folder_id } => match &self.drive {
                Some(drive) => drive.list_folder(folder_id),
                None => Box::pin(futures_util::stream::once(async {
                    Err(SourceError::NotConfigured("remote storage access"))
                })),
            },
        }
    }
}
