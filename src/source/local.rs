use super::{ItemStream, SourceError};
use crate::model::{SourceRef, WorkItem};
use async_stream::try_stream;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Walk `root` recursively in name order, yielding every regular, non-hidden file.
///
/// Item ids are the `/`-separated paths relative to `root`, so they stay stable across runs.
pub fn list_directory(root: PathBuf) -> ItemStream<'static> {
    Box::pin(try_stream! {
        if !root.is_dir() {
            Err(SourceError::Unavailable(format!("{} is not a directory", root.display())))?;
        }

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

        for entry in walker {
            let entry = entry.map_err(|error| SourceError::Unavailable(error.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry
                .metadata()
                .map(|metadata| metadata.len())
                .unwrap_or_default();
            yield local_item(&root, entry.path(), size);
        }
    })
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn local_item(root: &Path, path: &Path, size: u64) -> WorkItem {
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| relative.clone());
    WorkItem {
        id: relative.clone(),
        name,
        path: Some(relative),
        content_type: None,
        size,
        source: SourceRef::Local {
            path: path.to_path_buf(),
        },
    }
}
