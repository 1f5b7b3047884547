use super::ExtractionError;
use crate::model::WorkItem;
use std::io::{Cursor, Read};
use zip::ZipArchive;
use zip::result::ZipError;

/// Largest single entry we are willing to inflate.
const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

/// Unpack a ZIP container into child items, in archive order.
///
/// Directory entries, macOS resource forks, and entries whose names would escape the archive
/// root are skipped. Child identifiers are content-addressed, see [`WorkItem::archive_entry`].
pub fn unpack(container: &WorkItem, bytes: &[u8]) -> Result<Vec<WorkItem>, ExtractionError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
    let mut children = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry
            .enclosed_name()
            .map(|path| path.to_string_lossy().replace('\\', "/"))
        else {
            tracing::warn!(
                container = %container.id,
                entry = entry.name(),
                "Skipping unsafe entry path"
            );
            continue;
        };
        if is_resource_fork(&name) {
            continue;
        }
        if entry.size() > MAX_ENTRY_BYTES {
            return Err(ExtractionError::CorruptSource(format!(
                "entry {name} declares {} bytes",
                entry.size()
            )));
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        (&mut entry)
            .take(MAX_ENTRY_BYTES + 1)
            .read_to_end(&mut data)
            .map_err(|error| ExtractionError::CorruptSource(format!("entry {name}: {error}")))?;
        if data.len() as u64 > MAX_ENTRY_BYTES {
            return Err(ExtractionError::CorruptSource(format!(
                "entry {name} inflates past its declared size"
            )));
        }

        children.push(WorkItem::archive_entry(container, &name, data));
    }

    Ok(children)
}

fn is_resource_fork(name: &str) -> bool {
    name.starts_with("__MACOSX/")
        || name
            .rsplit('/')
            .next()
            .is_some_and(|file| file.starts_with("._") || file == ".DS_Store")
}

fn zip_error(error: ZipError) -> ExtractionError {
    match error {
        ZipError::Io(error) => ExtractionError::Io(error.to_string()),
        ZipError::UnsupportedArchive(message) => {
            ExtractionError::UnsupportedFormat(message.to_string())
        }
        other => ExtractionError::CorruptSource(other.to_string()),
    }
}
