use super::{CheckpointError, CheckpointProgress, CheckpointState};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Durable storage for checkpoint state.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint of `batch_id`. A batch that never ran yields `Ok(None)`.
    async fn load(&self, batch_id: &str) -> Result<Option<CheckpointState>, CheckpointError>;

    /// Replace the stored checkpoint with `state`. Readers observe either the old or the new
    /// record, never a mix.
    async fn persist(&self, state: &CheckpointState) -> Result<(), CheckpointError>;
}

/// One JSON file per batch inside a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the checkpoint of `batch_id`.
    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        let safe: String = batch_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(64)
            .collect();
        let digest = hex::encode(Sha256::digest(batch_id.as_bytes()));
        self.dir
            .join(format!("checkpoint_{safe}_{}.json", &digest[..8]))
    }

    /// Progress of every stored batch, most recently updated first.
    ///
    /// Files that fail to decode are logged and skipped.
    pub async fn list(&self) -> Result<Vec<CheckpointProgress>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut batches = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("checkpoint_") && name.ends_with(".json"));
            if !is_checkpoint {
                continue;
            }
            match read_state(&path).await {
                Ok(Some(state)) => batches.push(state.progress()),
                Ok(None) => {}
                Err(error) => tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "Skipping unreadable checkpoint"
                ),
            }
        }
        batches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(batches)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, batch_id: &str) -> Result<Option<CheckpointState>, CheckpointError> {
        let path = self.path_for(batch_id);
        let state = read_state(&path).await?;
        if let Some(state) = &state {
            if state.batch_id() != batch_id {
                return Err(CheckpointError::Corrupt {
                    path,
                    message: format!("file belongs to batch {}", state.batch_id()),
                });
            }
            tracing::debug!(batch_id, items = state.total_items(), "Loaded checkpoint");
        }
        Ok(state)
    }

    async fn persist(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path_for(state.batch_id());
        let temp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(state)?;

        if let Err(source) = tokio::fs::write(&temp_path, &json).await {
            return Err(CheckpointError::Io {
                path: temp_path,
                source,
            });
        }
        if let Err(source) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CheckpointError::Io { path, source });
        }

        tracing::debug!(
            batch_id = state.batch_id(),
            path = %path.display(),
            bytes = json.len(),
            "Persisted checkpoint"
        );
        Ok(())
    }
}

async fn read_state(path: &Path) -> Result<Option<CheckpointState>, CheckpointError> {
    let json = match tokio::fs::read(path).await {
        Ok(json) => json,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&json)
        .map(Some)
        .map_err(|error| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            message: error.to_string(),
        })
}
