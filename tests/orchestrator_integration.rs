use async_trait::async_trait;
use rustybrief::checkpoint::{CheckpointState, CheckpointStore, FileCheckpointStore};
use rustybrief::extraction::{ContentExtractor, ExtractedContent, ExtractionError, PageImage};
use rustybrief::generation::{
    DescriptionGenerator, GeneratedFields, GenerationError, GenerationRequest, GenerationTask,
};
use rustybrief::manifest::Manifest;
use rustybrief::metrics::ProcessingMetrics;
use rustybrief::model::{BatchSource, FailureKind, ItemKind, RunSettings, SourceRef, WorkItem};
use rustybrief::orchestrator::{BatchOrchestrator, OrchestratorSettings, PassOutcome};
use rustybrief::processor::{DocumentProcessor, ProcessorSettings};
use rustybrief::source::{ItemStream, SourceLister};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct FixedLister {
    items: Vec<WorkItem>,
}

impl SourceLister for FixedLister {
    fn list<'a>(&'a self, _source: &'a BatchSource) -> ItemStream<'a> {
        Box::pin(futures_util::stream::iter(
            self.items.clone().into_iter().map(Ok),
        ))
    }
}

/// Renders one page per document, rejects names containing `broken` or `doc2`, and unpacks
/// `archive.zip` into two entries. Optionally cancels a token after a number of top-level
/// extractions, and sleeps for the delay listed under an item's name.
#[derive(Default)]
struct ScriptedExtractor {
    calls: Mutex<HashMap<String, usize>>,
    cancel_after: Option<(usize, CancellationToken)>,
    delays: HashMap<String, Duration>,
}

impl ScriptedExtractor {
    fn with_delays(delays: &[(&str, u64)]) -> Self {
        Self {
            delays: delays
                .iter()
                .map(|(name, millis)| (name.to_string(), Duration::from_millis(*millis)))
                .collect(),
            ..Self::default()
        }
    }
}

impl ScriptedExtractor {
    fn calls_for(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ContentExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        item: &WorkItem,
        kind: ItemKind,
        _settings: &RunSettings,
    ) -> Result<ExtractedContent, ExtractionError> {
        let total = {
            let mut calls = self.calls.lock().unwrap();
            *calls.entry(item.name.clone()).or_default() += 1;
            calls.values().sum::<usize>()
        };
        if let Some((limit, token)) = &self.cancel_after {
            if total >= *limit {
                token.cancel();
            }
        }
        if let Some(delay) = self.delays.get(&item.name) {
            tokio::time::sleep(*delay).await;
        }

        if item.name.contains("broken") || item.name.contains("doc2") {
            return Err(ExtractionError::CorruptSource(format!(
                "{} has no end-of-file marker",
                item.name
            )));
        }
        match kind {
            ItemKind::Container => Ok(ExtractedContent::Children {
                items: vec![
                    WorkItem::archive_entry(item, "inner/doc3.pdf", b"%PDF-three".to_vec()),
                    WorkItem::archive_entry(item, "broken.pdf", b"%PDF-".to_vec()),
                ],
            }),
            _ => Ok(ExtractedContent::Pages {
                images: vec![PageImage {
                    page: 1,
                    media_type: "image/jpeg".into(),
                    data: vec![0xff, 0xd8],
                }],
                total_pages: 1,
            }),
        }
    }
}

/// Records every request. Requests whose prompt mentions a name in `failing` get a model error.
#[derive(Default)]
struct RecordingGenerator {
    requests: Mutex<Vec<(GenerationTask, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingGenerator {
    fn requests(&self) -> Vec<(GenerationTask, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DescriptionGenerator for RecordingGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GeneratedFields, GenerationError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.task, request.prompt.clone()));
        let failing = self.failing.lock().unwrap();
        if failing.iter().any(|name| request.prompt.contains(name.as_str())) {
            return Err(GenerationError::ModelError("503 Service Unavailable".into()));
        }
        let subject = request
            .prompt
            .split('"')
            .nth(1)
            .unwrap_or("the collection")
            .to_string();
        Ok(GeneratedFields {
            title: Some(format!("About {subject}")),
            description: Some(format!("Summary of {subject}")),
        })
    }
}

struct Harness {
    orchestrator: BatchOrchestrator,
    store: Arc<FileCheckpointStore>,
    extractor: Arc<ScriptedExtractor>,
    vision: Arc<RecordingGenerator>,
    text: Arc<RecordingGenerator>,
    _dir: tempfile::TempDir,
}

fn harness(items: Vec<WorkItem>, extractor: ScriptedExtractor, workers: usize) -> Harness {
    harness_with(
        items,
        extractor,
        OrchestratorSettings {
            workers,
            checkpoint_interval: Duration::ZERO,
        },
    )
}

fn harness_with(
    items: Vec<WorkItem>,
    extractor: ScriptedExtractor,
    settings: OrchestratorSettings,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoints")));
    let extractor = Arc::new(extractor);
    let vision = Arc::new(RecordingGenerator::default());
    let text = Arc::new(RecordingGenerator::default());
    let metrics = Arc::new(ProcessingMetrics::new());
    let processor = Arc::new(DocumentProcessor::new(
        extractor.clone(),
        vision.clone(),
        text.clone(),
        ProcessorSettings {
            call_timeout: Duration::from_secs(5),
            ..ProcessorSettings::default()
        },
        metrics.clone(),
    ));
    let orchestrator = BatchOrchestrator::new(
        Arc::new(FixedLister { items }),
        processor,
        store.clone(),
        metrics,
        settings,
    );
    Harness {
        orchestrator,
        store,
        extractor,
        vision,
        text,
        _dir: dir,
    }
}

fn remote(id: &str, name: &str) -> WorkItem {
    WorkItem {
        id: id.into(),
        name: name.into(),
        path: Some(name.into()),
        content_type: None,
        size: 10,
        source: SourceRef::Remote {
            file_id: id.into(),
        },
    }
}

fn source() -> BatchSource {
    BatchSource::Drive {
        folder_id: "folder-1".into(),
    }
}

async fn load(harness: &Harness) -> CheckpointState {
    harness.store.load("folder-1").await.unwrap().unwrap()
}

fn assert_partitioned(state: &CheckpointState) {
    let processed: HashSet<&str> = state.processed_ids().into_iter().collect();
    let failed: HashSet<&str> = state.failed_ids().into_iter().collect();
    let pending: HashSet<&str> = state.pending_ids().into_iter().collect();
    assert!(processed.is_disjoint(&failed));
    assert!(processed.is_disjoint(&pending));
    assert!(failed.is_disjoint(&pending));
    assert_eq!(
        processed.len() + failed.len() + pending.len(),
        state.total_items()
    );
}

#[tokio::test]
async fn mixed_batch_describes_documents_and_archives() {
    let items = vec![
        remote("f1", "doc1.pdf"),
        remote("f2", "doc2.pdf"),
        remote("f3", "archive.zip"),
    ];
    let harness = harness(items, ScriptedExtractor::default(), 1);

    let report = harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, PassOutcome::Finished);
    assert_eq!((report.succeeded, report.failed), (2, 1));

    let state = load(&harness).await;
    assert_partitioned(&state);
    assert_eq!(state.processed_ids(), vec!["f1", "f3"]);
    assert_eq!(state.failed_ids(), vec!["f2"]);

    let manifest = Manifest::from_state(&state);
    assert_eq!(manifest.entries.len(), 3);
    assert_eq!(manifest.entries[0].title, "About doc1.pdf");
    assert_eq!(
        manifest.entries[1].failure().map(|(kind, _)| kind),
        Some(FailureKind::CorruptSource)
    );
    let archive = &manifest.entries[2];
    assert_eq!(archive.kind, ItemKind::Container);
    assert_eq!(archive.children.len(), 2);
    assert!(archive.children[0].is_ok());
    assert_eq!(
        archive.children[0].path.as_deref(),
        Some("archive.zip/inner/doc3.pdf")
    );
    assert!(!archive.children[1].is_ok());

    // The corrupt document never reached a generator.
    let vision = harness.vision.requests();
    assert_eq!(vision.len(), 2);
    assert!(vision.iter().all(|(_, prompt)| !prompt.contains("doc2.pdf")));

    // Description of the archive first, then its title; only the described child is aggregated.
    let text = harness.text.requests();
    assert_eq!(text.len(), 2);
    assert_eq!(text[0].0, GenerationTask::Description);
    assert!(text[0].1.contains("- doc3.pdf: Summary of doc3.pdf"));
    assert!(!text[0].1.contains("broken.pdf"));
    assert_eq!(text[1].0, GenerationTask::Title);
    assert!(text[1].1.contains(&archive.description));
}

#[tokio::test]
async fn cancelled_pass_resumes_with_the_remaining_items() {
    let items: Vec<WorkItem> = (1..=6)
        .map(|i| remote(&format!("f{i}"), &format!("page{i}.pdf")))
        .collect();
    let cancel = CancellationToken::new();
    let harness = harness(
        items,
        ScriptedExtractor {
            cancel_after: Some((3, cancel.clone())),
            ..ScriptedExtractor::default()
        },
        1,
    );

    let first = harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &cancel)
        .await
        .unwrap();
    assert_eq!(first.outcome, PassOutcome::Cancelled);

    let interrupted = load(&harness).await;
    assert_partitioned(&interrupted);
    assert_eq!(interrupted.processed_ids(), vec!["f1", "f2", "f3"]);
    assert_eq!(interrupted.pending_ids(), vec!["f4", "f5", "f6"]);

    let second = harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.outcome, PassOutcome::Finished);
    assert_eq!(second.attempted, 3);
    assert_eq!(second.added, 0);

    let state = load(&harness).await;
    assert_partitioned(&state);
    assert_eq!(state.processed_ids().len(), 6);
    for i in 1..=6 {
        assert_eq!(harness.extractor.calls_for(&format!("page{i}.pdf")), 1);
    }
}

#[tokio::test]
async fn retry_touches_only_failed_items() {
    let items = vec![
        remote("a", "alpha.pdf"),
        remote("b", "flaky.pdf"),
        remote("c", "gamma.pdf"),
    ];
    let harness = harness(items, ScriptedExtractor::default(), 2);
    harness
        .vision
        .failing
        .lock()
        .unwrap()
        .insert("flaky.pdf".into());

    harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &CancellationToken::new())
        .await
        .unwrap();
    let before = load(&harness).await;
    assert_eq!(before.failed_ids(), vec!["b"]);
    assert!(before.progress().failures[0].transient);

    harness.vision.failing.lock().unwrap().clear();
    let report = harness
        .orchestrator
        .retry("folder-1", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.requeued, report.attempted, report.succeeded), (1, 1, 1));
    let after = load(&harness).await;
    assert_partitioned(&after);
    assert_eq!(after.processed_ids(), vec!["a", "b", "c"]);
    assert_eq!(harness.extractor.calls_for("alpha.pdf"), 1);
    assert_eq!(harness.extractor.calls_for("gamma.pdf"), 1);
    assert_eq!(harness.extractor.calls_for("flaky.pdf"), 2);
}

#[tokio::test]
async fn rerunning_a_completed_batch_does_no_work() {
    let items = vec![remote("a", "alpha.pdf"), remote("b", "beta.pdf")];
    let harness = harness(items, ScriptedExtractor::default(), 1);

    harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &CancellationToken::new())
        .await
        .unwrap();
    let calls = harness.extractor.total_calls();

    let report = harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.attempted, 0);
    assert_eq!(report.outcome, PassOutcome::Finished);
    assert_eq!(harness.extractor.total_calls(), calls);
    assert_eq!(
        load(&harness).await.status(),
        rustybrief::checkpoint::BatchStatus::Completed
    );
}

#[tokio::test]
async fn checkpoint_advances_while_a_pass_is_running() {
    let names: Vec<String> = (1..=6).map(|i| format!("slow{i}.pdf")).collect();
    let items = names
        .iter()
        .enumerate()
        .map(|(i, name)| remote(&format!("f{}", i + 1), name))
        .collect();
    let delays: Vec<(&str, u64)> = names.iter().map(|name| (name.as_str(), 200)).collect();
    let harness = harness_with(
        items,
        ScriptedExtractor::with_delays(&delays),
        OrchestratorSettings {
            workers: 1,
            checkpoint_interval: Duration::from_millis(150),
        },
    );

    let pass_source = source();
    let pass_cancel = CancellationToken::new();
    let pass = harness.orchestrator.run(
        &pass_source,
        RunSettings::for_language("en"),
        &pass_cancel,
    );
    let observe = async {
        tokio::time::sleep(Duration::from_millis(700)).await;
        load(&harness).await
    };
    let (report, mid_pass) = tokio::join!(pass, observe);

    let report = report.unwrap();
    assert_eq!(report.outcome, PassOutcome::Finished);
    assert_eq!(report.succeeded, 6);

    assert_partitioned(&mid_pass);
    let written = mid_pass.processed_ids().len();
    assert!(written >= 1, "nothing was persisted mid-pass");
    assert!(written < 6, "the pass finished before it was observed");
    assert_eq!(mid_pass.pending_ids().len(), 6 - written);
    assert_eq!(load(&harness).await.processed_ids().len(), 6);
}

#[tokio::test]
async fn manifest_keeps_discovery_order_when_items_finish_out_of_order() {
    let items = vec![
        remote("f1", "first.pdf"),
        remote("f2", "broken-second.pdf"),
        remote("f3", "third.pdf"),
        remote("f4", "fourth.pdf"),
    ];
    let extractor =
        ScriptedExtractor::with_delays(&[("first.pdf", 300), ("broken-second.pdf", 150)]);
    let harness = harness(items, extractor, 3);

    let report = harness
        .orchestrator
        .run(&source(), RunSettings::for_language("en"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((report.succeeded, report.failed), (3, 1));

    let state = load(&harness).await;
    assert_partitioned(&state);
    let completion: Vec<&str> = state.results().iter().map(|result| result.id.as_str()).collect();
    assert_eq!(completion, vec!["f3", "f4", "f1"]);

    let manifest = Manifest::from_state(&state);
    let ids: Vec<&str> = manifest.entries.iter().map(|entry| entry.id.as_str()).collect();
    assert_eq!(ids, vec!["f1", "f2", "f3", "f4"]);
    assert_eq!(manifest.entries[0].title, "About first.pdf");
    assert!(!manifest.entries[1].is_ok());
}
