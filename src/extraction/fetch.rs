use super::ExtractionError;
use crate::model::{SourceRef, WorkItem};
use crate::source::drive::DriveClient;
use async_trait::async_trait;
use std::sync::Arc;

/// Fetch the raw bytes of a work item.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    /// Return the full contents of `item`.
    async fn fetch(&self, item: &WorkItem) -> Result<Vec<u8>, ExtractionError>;
}

/// Fetcher resolving every [`SourceRef`] variant.
#[derive(Clone, Default)]
pub struct SourceFetcher {
    drive: Option<Arc<DriveClient>>,
}

impl SourceFetcher {
    /// Fetcher for local and unpacked items only.
    pub fn local_only() -> Self {
        Self::default()
    }

    /// Fetcher that can also download remote items.
    pub fn with_drive(drive: Arc<DriveClient>) -> Self {
        Self { drive: Some(drive) }
    }
}

#[async_trait]
impl ItemFetcher for SourceFetcher {
    async fn fetch(&self, item: &WorkItem) -> Result<Vec<u8>, ExtractionError> {
        match &item.source {
            SourceRef::Local { path } => tokio::fs::read(path).await.map_err(|error| {
                if error.kind() == std::io::ErrorKind::NotFound {
                    ExtractionError::SourceUnavailable(format!(
                        "{} no longer exists",
                        path.display()
                    ))
                } else {
                    ExtractionError::Io(format!("reading {}: {error}", path.display()))
                }
            }),
            SourceRef::Remote { file_id } => {
                let drive = self.drive.as_ref().ok_or_else(|| {
                    ExtractionError::SourceUnavailable(
                        "remote storage access is not configured".into(),
                    )
                })?;
                drive
                    .download(file_id)
                    .await
                    .map_err(|error| ExtractionError::SourceUnavailable(error.to_string()))
            }
            SourceRef::Archive { bytes, .. } => Ok(bytes.as_ref().clone()),
        }
    }
}
