//! Batch orchestration.
//!
//! A pass discovers the work set, reconciles it with the stored checkpoint, and drains the
//! pending items through the [`DocumentProcessor`] with a bounded number of items in flight.
//! Outcomes are folded into the checkpoint as they complete and written back on a time cadence,
//! on cancellation, and when the pass ends. Cancellation stops new dispatches but lets in-flight
//! items finish, so a later pass resumes with exactly the items that never reached a terminal
//! state.
//!
//! Passes started through [`BatchApi`] run on a task tracker owned by the orchestrator. A batch is
//! claimed before its pass is spawned, so a second start over a running batch is refused up front.

use crate::checkpoint::{
    CheckpointError, CheckpointProgress, CheckpointState, CheckpointStore, FileCheckpointStore,
};
use crate::config::Config;
use crate::extraction::{FormatExtractor, PageRenderer, SourceFetcher};
use crate::generation::{ChatCompletionsGenerator, DescriptionGenerator};
use crate::manifest::Manifest;
use crate::metrics::{MetricsSnapshot, ProcessingMetrics};
use crate::model::{BatchSource, ProcessingResult, RunSettings, WorkItem};
use crate::processor::{DocumentProcessor, ProcessorSettings};
use crate::source::{DriveClient, SourceError, SourceLister, SourceRouter};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(100);

/// Errors that abort a pass. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The work set could not be listed.
    #[error("discovery failed: {0}")]
    Discovery(#[from] SourceError),
    /// The checkpoint could not be loaded or written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// No checkpoint exists for the batch.
    #[error("no checkpoint found for batch {0}")]
    NotFound(String),
    /// Another pass over the same batch is running in this process.
    #[error("batch {0} is already running")]
    Busy(String),
}

/// Concurrency and persistence knobs for a pass.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Maximum number of items in flight.
    pub workers: usize,
    /// Minimum interval between periodic checkpoint writes.
    pub checkpoint_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.batch_workers.max(1),
            checkpoint_interval: config.checkpoint_interval,
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every selected item reached a terminal state.
    Finished,
    /// Cancellation stopped the pass before every selected item was attempted.
    Cancelled,
}

/// Summary of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Batch identifier.
    pub batch_id: String,
    /// Identifier of this pass, also attached to its log span.
    pub pass_id: String,
    /// How the pass ended.
    pub outcome: PassOutcome,
    /// Items listed by discovery; zero for retry passes.
    pub discovered: usize,
    /// Items first seen in this pass.
    pub added: usize,
    /// Failed items moved back to pending before draining.
    pub requeued: usize,
    /// Items dispatched and recorded in this pass.
    pub attempted: usize,
    /// Attempted items that produced a description.
    pub succeeded: usize,
    /// Attempted items that failed.
    pub failed: usize,
    /// Checkpoint view after the pass.
    pub progress: CheckpointProgress,
}

/// Operations exposed to the HTTP layer.
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// Claim the batch of `source` and run (or resume) it in the background.
    ///
    /// Returns the batch identifier, or [`BatchError::Busy`] when a pass already holds it.
    async fn start_batch(
        &self,
        source: BatchSource,
        settings: RunSettings,
    ) -> Result<String, BatchError>;

    /// Claim `batch_id` and re-attempt only its failed items in the background.
    async fn start_retry(&self, batch_id: &str) -> Result<(), BatchError>;

    /// Progress of `batch_id`, if it ever ran.
    async fn checkpoint_status(
        &self,
        batch_id: &str,
    ) -> Result<Option<CheckpointProgress>, BatchError>;

    /// Manifest of `batch_id`, if it ever ran.
    async fn manifest(&self, batch_id: &str) -> Result<Option<Manifest>, BatchError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Counters accumulated while draining.
#[derive(Debug, Default)]
struct DrainTally {
    attempted: usize,
    succeeded: usize,
    failed: usize,
    cancelled: bool,
}

/// Drives passes over batches, one pass per batch at a time.
///
/// Clones share collaborators, batch claims and background passes.
#[derive(Clone)]
pub struct BatchOrchestrator {
    lister: Arc<dyn SourceLister>,
    processor: Arc<DocumentProcessor>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<ProcessingMetrics>,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
    active: Arc<Mutex<HashSet<String>>>,
    passes: TaskTracker,
}

impl BatchOrchestrator {
    /// Build an orchestrator from its collaborators.
    pub fn new(
        lister: Arc<dyn SourceLister>,
        processor: Arc<DocumentProcessor>,
        store: Arc<dyn CheckpointStore>,
        metrics: Arc<ProcessingMetrics>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            lister,
            processor,
            store,
            metrics,
            settings,
            shutdown: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
            passes: TaskTracker::new(),
        }
    }

    /// Wire the production collaborators described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let metrics = Arc::new(ProcessingMetrics::new());
        let drive = Arc::new(DriveClient::new(
            config.drive_api_url.clone(),
            config.drive_access_token.clone(),
        )?);
        let extractor = Arc::new(FormatExtractor::new(
            Arc::new(SourceFetcher::with_drive(drive.clone())),
            PageRenderer::new(config.render_dpi),
            config.text_excerpt_chars,
        ));
        let vision: Arc<dyn DescriptionGenerator> = Arc::new(ChatCompletionsGenerator::new(
            config.model_api_url.clone(),
            config.model_api_token.clone(),
            config.vision_model.clone(),
            true,
            config.collaborator_timeout,
        )?);
        let text: Arc<dyn DescriptionGenerator> = Arc::new(ChatCompletionsGenerator::new(
            config.model_api_url.clone(),
            config.model_api_token.clone(),
            config.effective_text_model(),
            false,
            config.collaborator_timeout,
        )?);
        let processor = Arc::new(DocumentProcessor::new(
            extractor,
            vision,
            text,
            ProcessorSettings {
                call_timeout: config.collaborator_timeout,
                max_depth: config.max_container_depth,
                aggregate_token_budget: config.aggregate_token_budget,
            },
            metrics.clone(),
        ));
        tracing::info!(
            checkpoint_dir = %config.checkpoint_dir.display(),
            workers = config.batch_workers,
            "Initialized batch orchestrator"
        );
        Ok(Self::new(
            Arc::new(SourceRouter::new(Some(drive))),
            processor,
            Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone())),
            metrics,
            OrchestratorSettings::from(config),
        ))
    }

    /// Token cancelling every pass started through [`BatchApi`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for every background pass to write its final checkpoint and exit.
    ///
    /// Cancel [`Self::shutdown_token`] first to make running passes stop dispatching.
    pub async fn wait_for_background_passes(&self) {
        self.passes.close();
        if !self.passes.is_empty() {
            tracing::info!(passes = self.passes.len(), "Waiting for background passes");
        }
        self.passes.wait().await;
    }

    /// Discover `source`, reconcile it with the stored checkpoint, and drain every pending item.
    ///
    /// Previously failed items are attempted again; processed items are never re-attempted.
    pub async fn run(
        &self,
        source: &BatchSource,
        settings: RunSettings,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        let _guard = self.claim(&source.batch_id())?;
        self.run_claimed(source, settings, cancel).await
    }

    /// Re-attempt only the failed items of a stored batch.
    ///
    /// Processed items stay processed and pending items stay pending.
    pub async fn retry(
        &self,
        batch_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        let _guard = self.claim(batch_id)?;
        self.retry_claimed(batch_id, cancel).await
    }

    async fn run_claimed(
        &self,
        source: &BatchSource,
        settings: RunSettings,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        let batch_id = source.batch_id();
        let pass_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "batch",
            batch_id = %batch_id,
            pass_id = %pass_id,
            mode = "run"
        );

        async move {
            tracing::info!(source = %source, language = %settings.language, "Starting batch pass");
            let discovered: Vec<WorkItem> = self.lister.list(source).try_collect().await?;
            let discovered_count = discovered.len();

            let mut state = match self.store.load(&batch_id).await? {
                Some(state) => {
                    tracing::info!(items = state.total_items(), "Resuming from checkpoint");
                    state
                }
                None => CheckpointState::new(batch_id.clone(), source.clone(), settings.clone()),
            };
            state.set_settings(settings.clone());
            let summary = state.reconcile(discovered);
            tracing::info!(
                discovered = discovered_count,
                added = summary.added,
                requeued = summary.requeued,
                total = state.total_items(),
                "Reconciled work set with checkpoint"
            );
            self.persist(&state).await?;

            let queue = state.pending_items();
            let tally = self.drain(&mut state, queue, &settings, cancel).await?;
            let mut report = self.finish(state, pass_id, tally).await?;
            report.discovered = discovered_count;
            report.added = summary.added;
            report.requeued = summary.requeued;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn retry_claimed(
        &self,
        batch_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, BatchError> {
        let pass_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "batch",
            batch_id = %batch_id,
            pass_id = %pass_id,
            mode = "retry"
        );

        async move {
            let mut state = self
                .store
                .load(batch_id)
                .await?
                .ok_or_else(|| BatchError::NotFound(batch_id.to_string()))?;
            let queue = state.requeue_failed();
            tracing::info!(requeued = queue.len(), "Retrying failed items");
            let requeued = queue.len();
            if requeued > 0 {
                self.persist(&state).await?;
            }

            let settings = state.settings().clone();
            let tally = self.drain(&mut state, queue, &settings, cancel).await?;
            let mut report = self.finish(state, pass_id, tally).await?;
            report.requeued = requeued;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Progress of a stored batch.
    pub async fn status(&self, batch_id: &str) -> Result<Option<CheckpointProgress>, BatchError> {
        Ok(self
            .store
            .load(batch_id)
            .await?
            .map(|state| state.progress()))
    }

    /// Manifest of a stored batch.
    pub async fn manifest_for(&self, batch_id: &str) -> Result<Option<Manifest>, BatchError> {
        Ok(self
            .store
            .load(batch_id)
            .await?
            .map(|state| Manifest::from_state(&state)))
    }

    async fn drain(
        &self,
        state: &mut CheckpointState,
        queue: Vec<WorkItem>,
        settings: &RunSettings,
        cancel: &CancellationToken,
    ) -> Result<DrainTally, BatchError> {
        let mut tally = DrainTally::default();
        if queue.is_empty() {
            return Ok(tally);
        }

        let workers = self.settings.workers.max(1);
        let mut queue = queue.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut last_persist = Instant::now();
        let mut dirty = false;
        let flush_period = self.settings.checkpoint_interval.max(MIN_FLUSH_PERIOD);
        let mut ticker = tokio::time::interval(flush_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stopping = false;
        loop {
            stopping |= cancel.is_cancelled();
            while !stopping && in_flight.len() < workers {
                match queue.next() {
                    Some(item) => in_flight.push(self.dispatch(item, settings)),
                    None => break,
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    tracing::info!(
                        in_flight = in_flight.len(),
                        "Cancellation requested; waiting for in-flight items"
                    );
                }
                Some(result) = in_flight.next() => {
                    tally.attempted += 1;
                    if result.is_ok() {
                        tally.succeeded += 1;
                    } else {
                        tally.failed += 1;
                    }
                    self.metrics.record_item(result.is_ok());
                    state.record_outcome(result)?;
                    dirty = true;
                    if last_persist.elapsed() >= self.settings.checkpoint_interval {
                        self.persist(state).await?;
                        last_persist = Instant::now();
                        dirty = false;
                    }
                }
                _ = ticker.tick() => {
                    if dirty {
                        self.persist(state).await?;
                        last_persist = Instant::now();
                        dirty = false;
                    }
                }
            }
        }

        tally.cancelled = stopping && !queue.as_slice().is_empty();
        Ok(tally)
    }

    async fn dispatch(&self, item: WorkItem, settings: &RunSettings) -> ProcessingResult {
        let started = Instant::now();
        let result = self.processor.process(&item, settings).await;
        match result.failure() {
            None => tracing::info!(
                item = %item.id,
                name = %item.name,
                kind = %result.kind,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Item described"
            ),
            Some((kind, message)) => tracing::warn!(
                item = %item.id,
                name = %item.name,
                failure = %kind,
                error = message,
                "Item failed"
            ),
        }
        result
    }

    async fn finish(
        &self,
        mut state: CheckpointState,
        pass_id: String,
        tally: DrainTally,
    ) -> Result<BatchReport, BatchError> {
        let completed = !tally.cancelled && state.mark_completed();
        self.persist(&state).await?;

        let outcome = if tally.cancelled {
            PassOutcome::Cancelled
        } else {
            PassOutcome::Finished
        };
        let progress = state.progress();
        tracing::info!(
            outcome = ?outcome,
            completed,
            attempted = tally.attempted,
            succeeded = tally.succeeded,
            failed = tally.failed,
            pending = progress.pending,
            "Batch pass finished"
        );
        Ok(BatchReport {
            batch_id: state.batch_id().to_string(),
            pass_id,
            outcome,
            discovered: 0,
            added: 0,
            requeued: 0,
            attempted: tally.attempted,
            succeeded: tally.succeeded,
            failed: tally.failed,
            progress,
        })
    }

    async fn persist(&self, state: &CheckpointState) -> Result<(), BatchError> {
        self.store.persist(state).await?;
        self.metrics.record_checkpoint_write();
        Ok(())
    }

    fn claim(&self, batch_id: &str) -> Result<ActiveBatch, BatchError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(batch_id.to_string()) {
            return Err(BatchError::Busy(batch_id.to_string()));
        }
        Ok(ActiveBatch {
            active: self.active.clone(),
            batch_id: batch_id.to_string(),
        })
    }
}

/// Releases a batch claim on drop.
struct ActiveBatch {
    active: Arc<Mutex<HashSet<String>>>,
    batch_id: String,
}

impl Drop for ActiveBatch {
    fn drop(&mut self) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.batch_id);
    }
}

#[async_trait]
impl BatchApi for BatchOrchestrator {
    async fn start_batch(
        &self,
        source: BatchSource,
        settings: RunSettings,
    ) -> Result<String, BatchError> {
        let batch_id = source.batch_id();
        let claim = self.claim(&batch_id)?;
        let this = self.clone();
        let cancel = self.shutdown.child_token();
        self.passes.spawn(async move {
            let _claim = claim;
            if let Err(error) = this.run_claimed(&source, settings, &cancel).await {
                tracing::error!(
                    batch_id = %source.batch_id(),
                    error = %error,
                    "Batch pass failed"
                );
            }
        });
        Ok(batch_id)
    }

    async fn start_retry(&self, batch_id: &str) -> Result<(), BatchError> {
        let claim = self.claim(batch_id)?;
        if self.store.load(batch_id).await?.is_none() {
            return Err(BatchError::NotFound(batch_id.to_string()));
        }
        let this = self.clone();
        let cancel = self.shutdown.child_token();
        let batch_id = batch_id.to_string();
        self.passes.spawn(async move {
            let _claim = claim;
            if let Err(error) = this.retry_claimed(&batch_id, &cancel).await {
                tracing::error!(batch_id = %batch_id, error = %error, "Retry pass failed");
            }
        });
        Ok(())
    }

    async fn checkpoint_status(
        &self,
        batch_id: &str,
    ) -> Result<Option<CheckpointProgress>, BatchError> {
        self.status(batch_id).await
    }

    async fn manifest(&self, batch_id: &str) -> Result<Option<Manifest>, BatchError> {
        self.manifest_for(batch_id).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
