//! Batch manifests and description consolidation.
//!
//! A manifest lists every item that reached a terminal state in discovery order: processed items
//! with their full result trees, failed items with their failure kind and message. The
//! consolidation helpers flatten one or more manifests (or checkpoint files) into a single
//! de-duplicated list of descriptions.

use crate::checkpoint::{BatchStatus, CheckpointState};
use crate::classify::classify_item;
use crate::model::{BatchSource, ItemKind, ProcessingResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use time::OffsetDateTime;

/// Outcome listing for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Batch identifier.
    pub batch_id: String,
    /// Source the batch ran against.
    pub source: BatchSource,
    /// Lifecycle status when the manifest was built.
    pub status: BatchStatus,
    /// When the manifest was built.
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    /// Discovered item count.
    pub total_items: usize,
    /// Items with a description.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items not yet attempted, for example after a cancelled pass.
    pub pending: usize,
    /// Terminal outcomes in discovery order.
    pub entries: Vec<ProcessingResult>,
}

impl Manifest {
    /// Build the manifest for the current checkpoint state.
    pub fn from_state(state: &CheckpointState) -> Self {
        let mut entries: Vec<ProcessingResult> = state.results().to_vec();
        entries.extend(state.failed_entries().into_iter().map(|(item, record)| {
            ProcessingResult::failed(
                item,
                classify_item(item),
                record.kind,
                record.message.clone(),
            )
            .with_children(record.children.clone())
        }));
        entries.sort_by_key(|entry| state.position_of(&entry.id).unwrap_or(usize::MAX));

        let succeeded = entries.iter().filter(|entry| entry.is_ok()).count();
        let failed = entries.len() - succeeded;
        Self {
            batch_id: state.batch_id().to_string(),
            source: state.source().clone(),
            status: state.status(),
            generated_at: OffsetDateTime::now_utc(),
            total_items: state.total_items(),
            succeeded,
            failed,
            pending: state.total_items() - entries.len(),
            entries,
        }
    }
}

/// Flat description of one successfully described item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionRecord {
    /// Item identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Relative path, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Item classification.
    pub kind: ItemKind,
    /// Generated title.
    pub title: String,
    /// Generated description.
    pub description: String,
}

/// Flatten result trees into description records, children after their container.
/// Failed results are skipped; the first occurrence of an identifier wins.
pub fn flatten_descriptions(results: &[ProcessingResult]) -> Vec<DescriptionRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for result in results {
        flatten_into(result, &mut seen, &mut records);
    }
    records
}

fn flatten_into(
    result: &ProcessingResult,
    seen: &mut HashSet<String>,
    records: &mut Vec<DescriptionRecord>,
) {
    if result.is_ok() && seen.insert(result.id.clone()) {
        records.push(DescriptionRecord {
            id: result.id.clone(),
            name: result.name.clone(),
            path: result.path.clone(),
            kind: result.kind,
            title: result.title.clone(),
            description: result.description.clone(),
        });
    }
    for child in &result.children {
        flatten_into(child, seen, records);
    }
}

/// Collect results from a manifest, a checkpoint file, a bare list, or a single result.
///
/// Documents that match none of those shapes yield nothing.
pub fn results_from_document(document: Value) -> Vec<ProcessingResult> {
    let list = match document {
        Value::Object(mut map) => {
            if let Some(entries) = map.remove("entries") {
                entries
            } else if let Some(results) = map.remove("results") {
                results
            } else {
                Value::Array(vec![Value::Object(map)])
            }
        }
        other => other,
    };
    match list {
        Value::Array(values) => values
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Consolidate several documents into one de-duplicated description list.
pub fn consolidate(documents: Vec<Value>) -> Vec<DescriptionRecord> {
    let results: Vec<ProcessingResult> = documents
        .into_iter()
        .flat_map(results_from_document)
        .collect();
    flatten_descriptions(&results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureKind, RunSettings, SourceRef, WorkItem};
    use serde_json::{Map, json};

    fn item(id: &str, name: &str) -> WorkItem {
        WorkItem {
            id: id.into(),
            name: name.into(),
            path: Some(name.into()),
            content_type: None,
            size: 1,
            source: SourceRef::Remote { file_id: id.into() },
        }
    }

    fn ok(id: &str, name: &str) -> ProcessingResult {
        ProcessingResult::ok(
            &item(id, name),
            crate::classify::classify(name, None),
            format!("T {name}"),
            format!("D {name}"),
            Map::new(),
        )
    }

    #[test]
    fn manifest_is_sorted_by_discovery_position() {
        let mut state = CheckpointState::new(
            "b",
            BatchSource::Drive {
                folder_id: "b".into(),
            },
            RunSettings::for_language("en"),
        );
        state.reconcile(vec![
            item("1", "one.pdf"),
            item("2", "two.pdf"),
            item("3", "three.pdf"),
        ]);
        state.record_outcome(ok("3", "three.pdf")).unwrap();
        state
            .record_outcome(ProcessingResult::failed(
                &item("2", "two.pdf"),
                ItemKind::VisualDocument,
                FailureKind::CorruptSource,
                "truncated",
            ))
            .unwrap();
        state.record_outcome(ok("1", "one.pdf")).unwrap();

        let manifest = Manifest::from_state(&state);

        let ids: Vec<_> = manifest.entries.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!((manifest.succeeded, manifest.failed, manifest.pending), (2, 1, 0));
        assert_eq!(manifest.entries[1].kind, ItemKind::VisualDocument);
    }

    #[test]
    fn failed_containers_keep_their_described_entries() {
        let mut state = CheckpointState::new(
            "b",
            BatchSource::Drive {
                folder_id: "b".into(),
            },
            RunSettings::for_language("en"),
        );
        state.reconcile(vec![item("zip", "bundle.zip")]);
        let archive = ProcessingResult::failed(
            &item("zip", "bundle.zip"),
            ItemKind::Container,
            FailureKind::ModelError,
            "aggregate description failed",
        )
        .with_children(vec![ok("c1", "inner.pdf")]);
        state.record_outcome(archive).unwrap();

        let reloaded: CheckpointState =
            serde_json::from_value(serde_json::to_value(&state).unwrap()).unwrap();
        let manifest = Manifest::from_state(&reloaded);

        assert_eq!(manifest.failed, 1);
        let entry = &manifest.entries[0];
        assert_eq!(entry.failure().map(|(kind, _)| kind), Some(FailureKind::ModelError));
        assert_eq!(entry.children.len(), 1);
        assert_eq!(entry.children[0].title, "T inner.pdf");

        let records = flatten_descriptions(&manifest.entries);
        let ids: Vec<_> = records.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["c1"]);
    }

    #[test]
    fn consolidation_flattens_and_dedupes() {
        let archive = ok("zip", "bundle.zip").with_children(vec![
            ok("c1", "inner.pdf"),
            ProcessingResult::failed(
                &item("c2", "bad.pdf"),
                ItemKind::VisualDocument,
                FailureKind::CorruptSource,
                "x",
            ),
        ]);
        let manifest = json!({ "batch_id": "b", "entries": [ok("a", "a.pdf"), archive] });
        let checkpoint = json!({ "results": [ok("a", "a.pdf"), ok("c1", "inner.pdf")] });
        let single = serde_json::to_value(ok("solo", "solo.txt")).unwrap();

        let records = consolidate(vec![manifest, checkpoint, single, json!("noise")]);

        let ids: Vec<_> = records.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "zip", "c1", "solo"]);
        assert_eq!(records[3].kind, ItemKind::StructuredText);
    }
}
