use super::CheckpointError;
use crate::model::{BatchSource, FailureKind, ProcessingResult, RunSettings, WorkItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use time::OffsetDateTime;

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Items remain pending.
    InProgress,
    /// Every discovered item reached a terminal state in the last pass.
    Completed,
}

/// Detail kept for a failed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Display name of the item.
    pub item_name: String,
    /// Failure category.
    pub kind: FailureKind,
    /// Error summary.
    pub message: String,
    /// When the failure was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
    /// Results of a failed container's entries, kept so described entries stay visible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProcessingResult>,
}

#[derive(Debug, Clone, PartialEq)]
enum ItemState {
    Pending,
    Processed,
    Failed(FailureRecord),
}

#[derive(Debug, Clone, PartialEq)]
struct TrackedItem {
    item: WorkItem,
    position: usize,
    state: ItemState,
}

/// What a reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Newly discovered items added as pending.
    pub added: usize,
    /// Previously failed items moved back to pending.
    pub requeued: usize,
}

impl ReconcileSummary {
    /// Whether reconciliation left the state untouched.
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.requeued == 0
    }
}

/// One failed item in a progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    /// Item identifier.
    pub id: String,
    /// Item display name.
    pub name: String,
    /// Failure category.
    pub kind: FailureKind,
    /// Error summary.
    pub message: String,
    /// Whether a rerun is likely to help.
    pub transient: bool,
    /// When the failure was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

/// Operator-facing view of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointProgress {
    /// Batch identifier.
    pub batch_id: String,
    /// Source the batch runs against.
    pub source: BatchSource,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// Discovered item count.
    pub total_items: usize,
    /// Items with a description.
    pub processed: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items still to be attempted.
    pub pending: usize,
    /// Share of items in a terminal state, rounded down.
    pub percent_complete: u8,
    /// Creation time of the checkpoint.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Time of the last mutation.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Failed items in discovery order.
    pub failures: Vec<FailureSummary>,
}

/// Progress of one batch, keyed by item identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "CheckpointRecord", try_from = "CheckpointRecord")]
pub struct CheckpointState {
    batch_id: String,
    source: BatchSource,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    settings: RunSettings,
    status: BatchStatus,
    items: BTreeMap<String, TrackedItem>,
    results: Vec<ProcessingResult>,
}

impl CheckpointState {
    /// Empty state for a batch that has never run.
    pub fn new(batch_id: impl Into<String>, source: BatchSource, settings: RunSettings) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            batch_id: batch_id.into(),
            source,
            created_at: now,
            updated_at: now,
            settings,
            status: BatchStatus::InProgress,
            items: BTreeMap::new(),
            results: Vec::new(),
        }
    }

    /// Batch identifier.
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Source the batch runs against.
    pub fn source(&self) -> &BatchSource {
        &self.source
    }

    /// Settings of the most recent run.
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Record the settings of the current run.
    pub fn set_settings(&mut self, settings: RunSettings) {
        if self.settings != settings {
            self.settings = settings;
            self.touch();
        }
    }

    /// Lifecycle status.
    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Time of the last mutation.
    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    /// Number of discovered items.
    pub fn total_items(&self) -> usize {
        self.items.len()
    }

    /// Results of processed items, in completion order.
    pub fn results(&self) -> &[ProcessingResult] {
        &self.results
    }

    /// Discovery position of an item.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.items.get(id).map(|tracked| tracked.position)
    }

    /// Merge freshly discovered items.
    ///
    /// Unseen items become pending and every failed item goes back to pending. Processed
    /// items are left alone. Items missing from `discovered` keep their state.
    pub fn reconcile<I>(&mut self, discovered: I) -> ReconcileSummary
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let mut summary = ReconcileSummary::default();
        let mut next_position = self.next_position();
        for item in discovered {
            if self.items.contains_key(&item.id) {
                continue;
            }
            self.items.insert(
                item.id.clone(),
                TrackedItem {
                    item,
                    position: next_position,
                    state: ItemState::Pending,
                },
            );
            next_position += 1;
            summary.added += 1;
        }

        for tracked in self.items.values_mut() {
            if matches!(tracked.state, ItemState::Failed(_)) {
                tracked.state = ItemState::Pending;
                summary.requeued += 1;
            }
        }

        if !summary.is_noop() {
            self.status = BatchStatus::InProgress;
            self.touch();
        }
        summary
    }

    /// Move an item out of pending according to its result.
    pub fn record_outcome(&mut self, result: ProcessingResult) -> Result<(), CheckpointError> {
        let tracked = self
            .items
            .get_mut(&result.id)
            .ok_or_else(|| CheckpointError::UnknownItem(result.id.clone()))?;

        self.results.retain(|existing| existing.id != result.id);
        let failure = result
            .failure()
            .map(|(kind, message)| (kind, message.to_string()));
        match failure {
            None => {
                tracked.state = ItemState::Processed;
                self.results.push(result);
            }
            Some((kind, message)) => {
                tracked.state = ItemState::Failed(FailureRecord {
                    item_name: tracked.item.name.clone(),
                    kind,
                    message,
                    failed_at: OffsetDateTime::now_utc(),
                    children: result.children,
                });
            }
        }
        self.touch();
        Ok(())
    }

    /// Failed items in discovery order, without changing their state.
    pub fn select_failed_only(&self) -> Vec<WorkItem> {
        self.ordered()
            .filter(|tracked| matches!(tracked.state, ItemState::Failed(_)))
            .map(|tracked| tracked.item.clone())
            .collect()
    }

    /// Move every failed item back to pending and return them in discovery order.
    pub fn requeue_failed(&mut self) -> Vec<WorkItem> {
        let failed = self.select_failed_only();
        for item in &failed {
            if let Some(tracked) = self.items.get_mut(&item.id) {
                tracked.state = ItemState::Pending;
            }
        }
        if !failed.is_empty() {
            self.status = BatchStatus::InProgress;
            self.touch();
        }
        failed
    }

    /// Pending items in discovery order.
    pub fn pending_items(&self) -> Vec<WorkItem> {
        self.ordered()
            .filter(|tracked| tracked.state == ItemState::Pending)
            .map(|tracked| tracked.item.clone())
            .collect()
    }

    /// Identifiers of processed items in discovery order.
    pub fn processed_ids(&self) -> Vec<&str> {
        self.ids_where(|state| matches!(state, ItemState::Processed))
    }

    /// Identifiers of failed items in discovery order.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.ids_where(|state| matches!(state, ItemState::Failed(_)))
    }

    /// Identifiers of pending items in discovery order.
    pub fn pending_ids(&self) -> Vec<&str> {
        self.ids_where(|state| matches!(state, ItemState::Pending))
    }

    /// Failed items and their records in discovery order.
    pub fn failed_entries(&self) -> Vec<(&WorkItem, &FailureRecord)> {
        self.ordered()
            .filter_map(|tracked| match &tracked.state {
                ItemState::Failed(record) => Some((&tracked.item, record)),
                _ => None,
            })
            .collect()
    }

    /// Whether any item is still pending.
    pub fn has_pending(&self) -> bool {
        self.items
            .values()
            .any(|tracked| tracked.state == ItemState::Pending)
    }

    /// Mark the batch completed when nothing is pending. Returns whether it is completed.
    pub fn mark_completed(&mut self) -> bool {
        if self.has_pending() {
            return false;
        }
        if self.status != BatchStatus::Completed {
            self.status = BatchStatus::Completed;
            self.touch();
        }
        true
    }

    /// Counts and failure details for operators.
    pub fn progress(&self) -> CheckpointProgress {
        let failures: Vec<FailureSummary> = self
            .failed_entries()
            .into_iter()
            .map(|(item, record)| FailureSummary {
                id: item.id.clone(),
                name: record.item_name.clone(),
                kind: record.kind,
                message: record.message.clone(),
                transient: record.kind.is_transient(),
                failed_at: record.failed_at,
            })
            .collect();
        let pending = self.pending_ids().len();
        let total = self.items.len();
        let percent_complete = if total == 0 {
            100
        } else {
            ((total - pending) * 100 / total) as u8
        };
        CheckpointProgress {
            batch_id: self.batch_id.clone(),
            source: self.source.clone(),
            status: self.status,
            total_items: self.items.len(),
            processed: self.items.len() - pending - failures.len(),
            failed: failures.len(),
            pending,
            percent_complete,
            created_at: self.created_at,
            updated_at: self.updated_at,
            failures,
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &TrackedItem> {
        let mut tracked: Vec<&TrackedItem> = self.items.values().collect();
        tracked.sort_by_key(|tracked| tracked.position);
        tracked.into_iter()
    }

    fn ids_where(&self, predicate: impl Fn(&ItemState) -> bool) -> Vec<&str> {
        self.ordered()
            .filter(|tracked| predicate(&tracked.state))
            .map(|tracked| tracked.item.id.as_str())
            .collect()
    }

    fn next_position(&self) -> usize {
        self.items
            .values()
            .map(|tracked| tracked.position + 1)
            .max()
            .unwrap_or(0)
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }
}

/// On-disk layout: explicit processed/failed/pending lists next to the item catalog.
#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    batch_id: String,
    source: BatchSource,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
    status: BatchStatus,
    total_items: usize,
    settings: RunSettings,
    processed: Vec<String>,
    failed: Vec<FailedEntry>,
    pending: Vec<String>,
    items: Vec<CatalogEntry>,
    #[serde(default)]
    results: Vec<ProcessingResult>,
}

#[derive(Serialize, Deserialize)]
struct FailedEntry {
    id: String,
    #[serde(flatten)]
    record: FailureRecord,
}

#[derive(Serialize, Deserialize)]
struct CatalogEntry {
    position: usize,
    #[serde(flatten)]
    item: WorkItem,
}

impl From<CheckpointState> for CheckpointRecord {
    fn from(state: CheckpointState) -> Self {
        let mut tracked: Vec<TrackedItem> = state.items.into_values().collect();
        tracked.sort_by_key(|tracked| tracked.position);

        let mut processed = Vec::new();
        let mut failed = Vec::new();
        let mut pending = Vec::new();
        let mut items = Vec::with_capacity(tracked.len());
        for TrackedItem {
            item,
            position,
            state,
        } in tracked
        {
            match state {
                ItemState::Pending => pending.push(item.id.clone()),
                ItemState::Processed => processed.push(item.id.clone()),
                ItemState::Failed(record) => failed.push(FailedEntry {
                    id: item.id.clone(),
                    record,
                }),
            }
            items.push(CatalogEntry { position, item });
        }

        Self {
            batch_id: state.batch_id,
            source: state.source,
            created_at: state.created_at,
            updated_at: state.updated_at,
            status: state.status,
            total_items: items.len(),
            settings: state.settings,
            processed,
            failed,
            pending,
            items,
            results: state.results,
        }
    }
}

impl TryFrom<CheckpointRecord> for CheckpointState {
    type Error = CheckpointError;

    fn try_from(record: CheckpointRecord) -> Result<Self, Self::Error> {
        let mut items = BTreeMap::new();
        for CatalogEntry { position, item } in record.items {
            let id = item.id.clone();
            let tracked = TrackedItem {
                item,
                position,
                state: ItemState::Pending,
            };
            if items.insert(id.clone(), tracked).is_some() {
                return Err(CheckpointError::Inconsistent(format!(
                    "item {id} is catalogued twice"
                )));
            }
        }

        let mut assigned = HashSet::new();
        let mut assign = |id: &str, state: ItemState| -> Result<(), CheckpointError> {
            if !assigned.insert(id.to_string()) {
                return Err(CheckpointError::Inconsistent(format!(
                    "item {id} appears in more than one set"
                )));
            }
            let tracked = items.get_mut(id).ok_or_else(|| {
                CheckpointError::Inconsistent(format!("item {id} is missing from the catalog"))
            })?;
            tracked.state = state;
            Ok(())
        };
        for id in &record.processed {
            assign(id, ItemState::Processed)?;
        }
        for entry in record.failed {
            assign(&entry.id, ItemState::Failed(entry.record))?;
        }
        for id in &record.pending {
            assign(id, ItemState::Pending)?;
        }

        let unassigned = items.len() - assigned.len();
        if unassigned > 0 {
            tracing::warn!(
                batch_id = %record.batch_id,
                unassigned,
                "Checkpoint items without a state were treated as pending"
            );
        }
        for result in &record.results {
            let processed = items
                .get(&result.id)
                .is_some_and(|tracked| tracked.state == ItemState::Processed);
            if !processed {
                return Err(CheckpointError::Inconsistent(format!(
                    "result {} belongs to an item that is not processed",
                    result.id
                )));
            }
        }
        if record.total_items != items.len() {
            tracing::warn!(
                batch_id = %record.batch_id,
                recorded = record.total_items,
                catalogued = items.len(),
                "Checkpoint item count disagrees with its catalog"
            );
        }

        Ok(Self {
            batch_id: record.batch_id,
            source: record.source,
            created_at: record.created_at,
            updated_at: record.updated_at,
            settings: record.settings,
            status: record.status,
            items,
            results: record.results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemKind, SourceRef};
    use serde_json::{Map, json};
    use std::path::PathBuf;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            id: id.into(),
            name: format!("{id}.pdf"),
            path: Some(format!("docs/{id}.pdf")),
            content_type: Some("application/pdf".into()),
            size: 10,
            source: SourceRef::Local {
                path: PathBuf::from(format!("/data/docs/{id}.pdf")),
            },
        }
    }

    fn ok(id: &str) -> ProcessingResult {
        ProcessingResult::ok(
            &item(id),
            ItemKind::VisualDocument,
            format!("Title {id}"),
            format!("Description {id}"),
            Map::new(),
        )
    }

    fn failed(id: &str, kind: FailureKind) -> ProcessingResult {
        ProcessingResult::failed(&item(id), ItemKind::VisualDocument, kind, "broken")
    }

    fn state() -> CheckpointState {
        CheckpointState::new(
            "folder-1",
            BatchSource::Drive {
                folder_id: "folder-1".into(),
            },
            RunSettings::for_language("es"),
        )
    }

    fn assert_partition(state: &CheckpointState) {
        let processed: HashSet<_> = state.processed_ids().into_iter().collect();
        let failed: HashSet<_> = state.failed_ids().into_iter().collect();
        let pending: HashSet<_> = state.pending_ids().into_iter().collect();
        assert!(processed.is_disjoint(&failed));
        assert!(processed.is_disjoint(&pending));
        assert!(failed.is_disjoint(&pending));
        assert_eq!(processed.len() + failed.len() + pending.len(), state.total_items());
    }

    #[test]
    fn reconcile_adds_new_items_and_requeues_failures() {
        let mut state = state();
        let summary = state.reconcile(vec![item("a"), item("b"), item("c")]);
        assert_eq!(summary.added, 3);
        state.record_outcome(ok("a")).unwrap();
        state.record_outcome(failed("b", FailureKind::Timeout)).unwrap();
        assert_partition(&state);

        let summary = state.reconcile(vec![item("a"), item("b"), item("c"), item("d")]);
        assert_eq!(summary, ReconcileSummary { added: 1, requeued: 1 });
        assert_eq!(state.processed_ids(), vec!["a"]);
        assert_eq!(state.pending_ids(), vec!["b", "c", "d"]);
        assert_partition(&state);
    }

    #[test]
    fn reconcile_twice_is_a_noop() {
        let mut state = state();
        let discovered = vec![item("a"), item("b")];
        state.reconcile(discovered.clone());
        state.record_outcome(ok("a")).unwrap();
        state.reconcile(discovered.clone());
        let snapshot = state.clone();

        let summary = state.reconcile(discovered);

        assert!(summary.is_noop());
        assert_eq!(state, snapshot);
    }

    #[test]
    fn duplicate_discoveries_are_tracked_once() {
        let mut state = state();
        let summary = state.reconcile(vec![item("a"), item("a")]);
        assert_eq!(summary.added, 1);
        assert_eq!(state.total_items(), 1);
    }

    #[test]
    fn outcomes_for_unknown_items_are_rejected() {
        let mut state = state();
        let error = state.record_outcome(ok("ghost")).unwrap_err();
        assert!(matches!(error, CheckpointError::UnknownItem(id) if id == "ghost"));
    }

    #[test]
    fn results_are_kept_only_for_processed_items() {
        let mut state = state();
        state.reconcile(vec![item("a")]);
        state.record_outcome(ok("a")).unwrap();
        state.record_outcome(ok("a")).unwrap();
        assert_eq!(state.results().len(), 1);
        state.record_outcome(failed("a", FailureKind::ModelError)).unwrap();
        assert!(state.results().is_empty());
        assert_eq!(state.failed_ids(), vec!["a"]);
    }

    #[test]
    fn completion_requires_an_empty_pending_set() {
        let mut state = state();
        state.reconcile(vec![item("a"), item("b")]);
        state.record_outcome(ok("a")).unwrap();
        assert!(!state.mark_completed());
        state.record_outcome(failed("b", FailureKind::CorruptSource)).unwrap();
        assert!(state.mark_completed());
        assert_eq!(state.status(), BatchStatus::Completed);

        state.reconcile(vec![item("a"), item("b")]);
        assert_eq!(state.status(), BatchStatus::InProgress);
    }

    #[test]
    fn requeue_moves_only_failed_items() {
        let mut state = state();
        state.reconcile(vec![item("a"), item("b"), item("c")]);
        state.record_outcome(ok("a")).unwrap();
        state.record_outcome(failed("c", FailureKind::Timeout)).unwrap();

        assert_eq!(state.select_failed_only(), vec![item("c")]);
        let requeued = state.requeue_failed();
        assert_eq!(requeued, vec![item("c")]);
        assert_eq!(state.processed_ids(), vec!["a"]);
        assert_eq!(state.pending_ids(), vec!["b", "c"]);
        assert_partition(&state);
    }

    #[test]
    fn persisted_form_round_trips() {
        let mut state = state();
        state.reconcile(vec![item("a"), item("b"), item("c")]);
        state.record_outcome(ok("a")).unwrap();
        state.record_outcome(failed("b", FailureKind::CorruptSource)).unwrap();

        let first = serde_json::to_string_pretty(&state).unwrap();
        let loaded: CheckpointState = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&loaded).unwrap();

        assert_eq!(first, second);
        assert_eq!(loaded, state);
    }

    #[test]
    fn persisted_form_lists_the_three_sets() {
        let mut state = state();
        state.reconcile(vec![item("a"), item("b"), item("c")]);
        state.record_outcome(ok("a")).unwrap();
        state.record_outcome(failed("b", FailureKind::CorruptSource)).unwrap();

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["processed"], json!(["a"]));
        assert_eq!(value["pending"], json!(["c"]));
        assert_eq!(value["failed"][0]["id"], json!("b"));
        assert_eq!(value["failed"][0]["kind"], json!("corrupt_source"));
        assert_eq!(value["total_items"], json!(3));
        assert_eq!(value["status"], json!("in_progress"));
    }

    #[test]
    fn unknown_kinds_in_old_records_are_tolerated() {
        let mut state = state();
        state.reconcile(vec![item("a"), item("b")]);
        state.record_outcome(ok("a")).unwrap();
        state.record_outcome(failed("b", FailureKind::Timeout)).unwrap();
        let mut value = serde_json::to_value(&state).unwrap();
        value["results"][0]["kind"] = json!("hologram");
        value["failed"][0]["kind"] = json!("solar_flare");

        let loaded: CheckpointState = serde_json::from_value(value).unwrap();

        assert_eq!(loaded.results()[0].kind, ItemKind::Unsupported);
        assert_eq!(loaded.failed_entries()[0].1.kind, FailureKind::Unknown);
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let mut state = state();
        state.reconcile(vec![item("a")]);
        let mut value = serde_json::to_value(&state).unwrap();
        value["processed"] = json!(["a"]);

        let error = serde_json::from_value::<CheckpointState>(value).unwrap_err();
        assert!(error.to_string().contains("more than one set"));
    }

    #[test]
    fn progress_flags_transient_failures() {
        let mut state = state();
        state.reconcile(vec![item("a"), item("b"), item("c")]);
        state.record_outcome(failed("a", FailureKind::Timeout)).unwrap();
        state.record_outcome(failed("b", FailureKind::CorruptSource)).unwrap();

        let progress = state.progress();
        assert_eq!((progress.processed, progress.failed, progress.pending), (0, 2, 1));
        assert_eq!(progress.percent_complete, 66);
        assert!(progress.failures[0].transient);
        assert!(!progress.failures[1].transient);
    }
}
