//! Harvest orchestrator.
//!
//! [`HarvestPipeline`] drives every configured source through one run:
//! - **Initializing**: configuration validation and checkpoint loading,
//!   before any network activity
//! - **Enumerating / Harvesting**: per source, pages are enumerated
//!   sequentially from the checkpoint cursor while items are fetched and
//!   exported by a bounded worker pool ([`ItemExecutor`])
//! - **Draining**: in-flight workers finish, checkpoints are flushed and
//!   sinks are finalized
//!
//! Sources run concurrently and share nothing but the global item limit.
//! Per-item failures are counted in the [`HarvestReport`]; only
//! configuration and checkpoint I/O errors end a run early.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::{ConfigError, HarvestConfig};
use crate::executor::{FailureKind, ItemExecutor, ItemOutcome};
use crate::harvest::sources;
use crate::harvest::traits::{SourceAdapter, SourceError};
use crate::model::SourceType;
use crate::traits::Sink;

// ============================================================================
// Run Phases
// ============================================================================

/// Lifecycle of a run. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initializing,
    Enumerating,
    Harvesting,
    Draining,
    Completed,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Initializing => "initializing",
            RunPhase::Enumerating => "enumerating",
            RunPhase::Harvesting => "harvesting",
            RunPhase::Draining => "draining",
            RunPhase::Completed => "completed",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Shared phase of a run, advanced by the source tasks.
#[derive(Debug)]
struct PhaseTracker {
    phase: Mutex<RunPhase>,
    dispatching: AtomicUsize,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: Mutex::new(RunPhase::Initializing),
            dispatching: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, to: RunPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if to > *phase {
            info!(from = %*phase, to = %to, "Run phase changed");
            *phase = to;
        }
    }

    fn start_dispatching(&self, sources: usize) {
        self.dispatching.store(sources, Ordering::SeqCst);
        self.advance(RunPhase::Enumerating);
    }

    /// Called once per source when it stops dispatching; the last one moves
    /// the run into draining.
    fn stop_dispatching(&self) {
        if self.dispatching.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.advance(RunPhase::Draining);
        }
    }
}

// ============================================================================
// Item Limit
// ============================================================================

/// Global cap on dispatched items, shared by every source.
#[derive(Debug)]
struct ItemLimit {
    max: Option<usize>,
    used: AtomicUsize,
}

impl ItemLimit {
    fn new(max: Option<usize>) -> Self {
        Self {
            max,
            used: AtomicUsize::new(0),
        }
    }

    fn try_reserve(&self) -> bool {
        match self.max {
            None => {
                self.used.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(max) => self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    (used < max).then_some(used + 1)
                })
                .is_ok(),
        }
    }

    /// Returns a slot that was reserved but never dispatched.
    fn release(&self) {
        self.used.fetch_sub(1, Ordering::SeqCst);
    }

    fn exhausted(&self) -> bool {
        self.max
            .is_some_and(|max| self.used.load(Ordering::SeqCst) >= max)
    }
}

// ============================================================================
// Errors and Reports
// ============================================================================

/// Errors that end a run. Per-item failures never surface here.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Durable progress could not be read or written. The last persisted
    /// checkpoint stays the resume point.
    #[error("Checkpoint failure for source '{source_type}' ({pending} completions not persisted): {error}")]
    Checkpoint {
        source_type: SourceType,
        pending: usize,
        #[source]
        error: CheckpointError,
    },

    #[error("No adapter registered for source '{0}'")]
    MissingAdapter(SourceType),

    #[error("Harvest task failed: {0}")]
    Task(String),
}

/// Counters for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub dispatched: usize,
    pub exported: usize,
    /// Already completed in an earlier run.
    pub skipped: usize,
    pub failed: BTreeMap<FailureKind, usize>,
    pub pages: usize,
    /// Cursor held when the source finished.
    pub cursor: Option<String>,
    /// Set when enumeration stopped on an upstream error.
    pub enumeration_error: Option<String>,
    pub duration_ms: u64,
}

impl SourceReport {
    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }

    pub fn failures(&self, kind: FailureKind) -> usize {
        self.failed.get(&kind).copied().unwrap_or(0)
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub run_id: String,
    pub phase: RunPhase,
    pub sources: BTreeMap<SourceType, SourceReport>,
    pub limit_reached: bool,
    /// Sinks whose `finalize` failed, with the error.
    pub sink_errors: Vec<String>,
    pub duration_ms: u64,
}

impl HarvestReport {
    pub fn source(&self, source: SourceType) -> Option<&SourceReport> {
        self.sources.get(&source)
    }

    pub fn total_dispatched(&self) -> usize {
        self.sources.values().map(|r| r.dispatched).sum()
    }

    pub fn total_exported(&self) -> usize {
        self.sources.values().map(|r| r.exported).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.sources.values().map(SourceReport::failed_total).sum()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Coordinates adapters, workers, sinks and the checkpoint store for a run.
pub struct HarvestPipeline {
    config: HarvestConfig,
    store: Arc<CheckpointStore>,
    adapters: HashMap<SourceType, Arc<dyn SourceAdapter>>,
    sinks: Vec<Arc<dyn Sink>>,
    cancel: CancellationToken,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig, store: Arc<CheckpointStore>) -> Self {
        Self {
            config,
            store,
            adapters: HashMap::new(),
            sinks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Pipeline whose checkpoint store lives at `config.checkpoint_dir`,
    /// keyed by `config.run_id`.
    pub fn from_config(config: HarvestConfig) -> Self {
        let store = Arc::new(CheckpointStore::from_config(&config));
        Self::new(config, store)
    }

    /// Registers the adapter for its source, replacing any earlier one.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source_type(), adapter);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Uses `token` for the run; cancelling it stops dispatching and
    /// interrupts in-flight fetches.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Registers the built-in HTTP adapter for every configured source.
    pub fn with_configured_adapters(mut self) -> Result<Self, SourceError> {
        for adapter in sources::adapters_for(&self.config, &self.cancel)? {
            self.adapters.insert(adapter.source_type(), adapter);
        }
        Ok(self)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// The store must write where the configuration says checkpoints live.
    fn check_store(&self) -> Result<(), ConfigError> {
        if self.store.run_id() != self.config.run_id {
            return Err(ConfigError::Invalid {
                field: "run_id",
                reason: format!(
                    "checkpoint store is keyed by '{}', configuration by '{}'",
                    self.store.run_id(),
                    self.config.run_id
                ),
            });
        }
        if self.store.dir() != self.config.checkpoint_dir {
            return Err(ConfigError::Invalid {
                field: "checkpoint_dir",
                reason: format!(
                    "checkpoint store writes to {}, configuration names {}",
                    self.store.dir().display(),
                    self.config.checkpoint_dir.display()
                ),
            });
        }
        Ok(())
    }

    /// Executes one run.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Config`] when validation fails (nothing is fetched)
    /// - [`PipelineError::MissingAdapter`] when a configured source has no
    ///   adapter
    /// - [`PipelineError::Checkpoint`] when a checkpoint cannot be loaded or
    ///   persisted
    pub async fn run(&self) -> Result<HarvestReport, PipelineError> {
        let started = Instant::now();
        let phase = Arc::new(PhaseTracker::new());
        info!(run_id = %self.config.run_id, sources = ?self.config.sources, "Harvest run starting");

        // Initializing
        self.config.validate()?;
        self.check_store()?;
        let mut selected = Vec::new();
        let mut seen = HashSet::new();
        for source in self.config.sources.iter().copied() {
            if !seen.insert(source) {
                continue;
            }
            let adapter = self
                .adapters
                .get(&source)
                .cloned()
                .ok_or(PipelineError::MissingAdapter(source))?;
            self.store
                .load(source)
                .map_err(|error| PipelineError::Checkpoint {
                    source_type: source,
                    pending: 0,
                    error,
                })?;
            selected.push(adapter);
        }

        // Cancelling the child aborts this run without touching the caller's token.
        let cancel = self.cancel.child_token();
        let watchdog = self.config.run_timeout().map(|limit| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(timeout_secs = limit.as_secs(), "Run timeout reached, cancelling");
                        token.cancel();
                    }
                }
            })
        });

        let limit = Arc::new(ItemLimit::new(self.config.item_limit));
        let sinks = Arc::new(self.sinks.clone());
        phase.start_dispatching(selected.len());

        let mut tasks = JoinSet::new();
        for adapter in selected {
            let executor = Arc::new(ItemExecutor::new(
                Arc::clone(&adapter),
                Arc::clone(&sinks),
                Arc::clone(&self.store),
                self.config.workers_per_source,
                self.config.item_timeout(),
                cancel.clone(),
            ));
            let harvest = SourceHarvest {
                source: adapter.source_type(),
                adapter,
                executor,
                store: Arc::clone(&self.store),
                limit: Arc::clone(&limit),
                phase: Arc::clone(&phase),
                cancel: cancel.clone(),
                checkpoint_interval: self.config.checkpoint_interval,
            };
            tasks.spawn(harvest.run());
        }

        let mut reports = BTreeMap::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((source, report))) => {
                    reports.insert(source, report);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Aborting harvest run");
                    cancel.cancel();
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Source task panicked");
                    cancel.cancel();
                    failure.get_or_insert(PipelineError::Task(e.to_string()));
                }
            }
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if let Some(e) = failure {
            phase.advance(RunPhase::Aborted);
            return Err(e);
        }

        // Draining: every source task has flushed its checkpoint.
        let mut sink_errors = Vec::new();
        for sink in self.sinks.iter() {
            if let Err(e) = sink.finalize().await {
                warn!(sink = sink.name(), error = %e, "Sink finalize failed");
                sink_errors.push(format!("{}: {}", sink.name(), e));
            }
        }

        let final_phase = if cancel.is_cancelled() {
            RunPhase::Aborted
        } else {
            RunPhase::Completed
        };
        phase.advance(final_phase);

        let report = HarvestReport {
            run_id: self.config.run_id.clone(),
            phase: phase.current(),
            sources: reports,
            limit_reached: limit.exhausted(),
            sink_errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            run_id = %report.run_id,
            phase = %report.phase,
            dispatched = report.total_dispatched(),
            exported = report.total_exported(),
            failed = report.total_failed(),
            duration_ms = report.duration_ms,
            "Harvest run finished"
        );
        Ok(report)
    }
}

// ============================================================================
// Per-Source Loop
// ============================================================================

/// Dispatch progress of one enumerated page.
#[derive(Debug)]
struct PageProgress {
    start: Option<String>,
    next: Option<String>,
    outstanding: usize,
    /// No more items will be dispatched from this page.
    sealed: bool,
    /// Every dispatched item completed and nothing was left undispatched.
    clean: bool,
}

/// Mutable state of one source loop.
#[derive(Debug, Default)]
struct SourceProgress {
    report: SourceReport,
    pages: VecDeque<PageProgress>,
    base_seq: usize,
    unpersisted: usize,
}

impl SourceProgress {
    fn push_page(&mut self, start: Option<String>, next: Option<String>) -> usize {
        self.pages.push_back(PageProgress {
            start,
            next,
            outstanding: 0,
            sealed: false,
            clean: true,
        });
        self.report.pages += 1;
        self.base_seq + self.pages.len() - 1
    }

    fn page_mut(&mut self, seq: usize) -> Option<&mut PageProgress> {
        seq.checked_sub(self.base_seq)
            .and_then(|index| self.pages.get_mut(index))
    }

    fn dispatched(&mut self, seq: usize) {
        self.report.dispatched += 1;
        if let Some(page) = self.page_mut(seq) {
            page.outstanding += 1;
        }
    }

    fn seal(&mut self, seq: usize, clean: bool) {
        if let Some(page) = self.page_mut(seq) {
            page.sealed = true;
            page.clean &= clean;
        }
    }

    fn record(&mut self, seq: usize, outcome: &ItemOutcome) {
        let exported = match outcome {
            ItemOutcome::Exported { .. } => {
                self.report.exported += 1;
                self.unpersisted += 1;
                true
            }
            ItemOutcome::Failed { kind, .. } => {
                *self.report.failed.entry(*kind).or_default() += 1;
                false
            }
        };
        if let Some(page) = self.page_mut(seq) {
            page.outstanding = page.outstanding.saturating_sub(1);
            page.clean &= exported;
        }
    }

    /// Pops fully completed pages from the front and returns the cursor to
    /// resume from, if it moved. A page with a failed item stops the cursor
    /// for the rest of the run.
    fn advance_cursor(&mut self) -> Option<Option<String>> {
        let mut moved = None;
        while let Some(front) = self.pages.front() {
            if !(front.sealed && front.outstanding == 0 && front.clean) {
                break;
            }
            let Some(page) = self.pages.pop_front() else {
                break;
            };
            self.base_seq += 1;
            // The final page resumes from its own start.
            let cursor = page.next.or(page.start);
            self.report.cursor = cursor.clone();
            moved = Some(cursor);
        }
        moved
    }
}

struct SourceHarvest {
    source: SourceType,
    adapter: Arc<dyn SourceAdapter>,
    executor: Arc<ItemExecutor>,
    store: Arc<CheckpointStore>,
    limit: Arc<ItemLimit>,
    phase: Arc<PhaseTracker>,
    cancel: CancellationToken,
    checkpoint_interval: usize,
}

type OutcomeSender = mpsc::UnboundedSender<(usize, ItemOutcome)>;
type OutcomeReceiver = mpsc::UnboundedReceiver<(usize, ItemOutcome)>;

/// Delivers exactly one outcome per dispatched item. A worker that panics
/// or is aborted reports [`FailureKind::Aborted`] on drop, so its page never
/// waits on it.
struct OutcomeSlot {
    seq: usize,
    id: String,
    tx: Option<OutcomeSender>,
}

impl OutcomeSlot {
    fn new(seq: usize, id: String, tx: OutcomeSender) -> Self {
        Self {
            seq,
            id,
            tx: Some(tx),
        }
    }

    fn fill(mut self, outcome: ItemOutcome) {
        if let Some(tx) = self.tx.take() {
            // The receiver only goes away when the run is aborting.
            let _ = tx.send((self.seq, outcome));
        }
    }
}

impl Drop for OutcomeSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send((
                self.seq,
                ItemOutcome::Failed {
                    id: std::mem::take(&mut self.id),
                    kind: FailureKind::Aborted,
                    error: "worker stopped before producing an outcome".to_string(),
                },
            ));
        }
    }
}

impl SourceHarvest {
    async fn run(self) -> Result<(SourceType, SourceReport), PipelineError> {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Dropping the set on an early return aborts every in-flight worker,
        // so nothing is exported once the run has failed.
        let mut workers = JoinSet::new();
        let mut progress = SourceProgress::default();
        let mut dispatched_ids = HashSet::new();

        let mut cursor = self.store.snapshot(self.source).cursor;
        progress.report.cursor = cursor.clone();
        info!(source = %self.source, cursor = ?cursor, "Source harvest starting");

        let dispatch = self
            .enumerate_and_dispatch(
                &mut cursor,
                &mut progress,
                &mut dispatched_ids,
                &mut workers,
                &tx,
                &mut rx,
            )
            .await;
        self.phase.stop_dispatching();
        dispatch?;

        // Drain in-flight workers.
        drop(tx);
        while let Some((seq, outcome)) = rx.recv().await {
            progress.record(seq, &outcome);
            self.settle(&mut progress).await?;
        }
        self.settle(&mut progress).await?;
        self.persist(progress.unpersisted).await?;
        progress.unpersisted = 0;
        while workers.join_next().await.is_some() {}

        progress.report.duration_ms = started.elapsed().as_millis() as u64;
        let report = progress.report;
        info!(
            source = %self.source,
            pages = report.pages,
            dispatched = report.dispatched,
            exported = report.exported,
            skipped = report.skipped,
            failed = report.failed_total(),
            duration_ms = report.duration_ms,
            "Source harvest completed"
        );
        Ok((self.source, report))
    }

    async fn enumerate_and_dispatch(
        &self,
        cursor: &mut Option<String>,
        progress: &mut SourceProgress,
        dispatched_ids: &mut HashSet<String>,
        workers: &mut JoinSet<()>,
        tx: &OutcomeSender,
        rx: &mut OutcomeReceiver,
    ) -> Result<(), PipelineError> {
        loop {
            if self.cancel.is_cancelled() || self.limit.exhausted() {
                return Ok(());
            }
            let page = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                page = self.adapter.enumerate(cursor.as_deref()) => page,
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(source = %self.source, cursor = ?cursor, error = %e, "Enumeration failed");
                    progress.report.enumeration_error = Some(e.to_string());
                    return Ok(());
                }
            };
            debug!(source = %self.source, items = page.ids.len(), next = ?page.next_cursor, "Page enumerated");

            let seq = progress.push_page(cursor.clone(), page.next_cursor.clone());
            let finished = self
                .dispatch_page(seq, page.ids, progress, dispatched_ids, workers, tx, rx)
                .await;
            progress.seal(seq, matches!(finished, Ok(true)));
            self.settle(progress).await?;
            if !finished? {
                return Ok(());
            }

            match page.next_cursor {
                Some(next) => *cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Dispatches the page's items. Returns `false` when dispatching stopped
    /// early on cancellation or the item limit.
    async fn dispatch_page(
        &self,
        seq: usize,
        ids: Vec<String>,
        progress: &mut SourceProgress,
        dispatched_ids: &mut HashSet<String>,
        workers: &mut JoinSet<()>,
        tx: &OutcomeSender,
        rx: &mut OutcomeReceiver,
    ) -> Result<bool, PipelineError> {
        for id in ids {
            if self.store.is_completed(self.source, &id) {
                progress.report.skipped += 1;
                continue;
            }
            if !dispatched_ids.insert(id.clone()) {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            if !self.limit.try_reserve() {
                info!(source = %self.source, "Item limit reached");
                return Ok(false);
            }
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.limit.release();
                    return Ok(false);
                }
                permit = self.executor.acquire() => {
                    permit.map_err(|e| PipelineError::Task(format!("worker pool closed: {}", e)))?
                }
            };

            progress.dispatched(seq);
            self.phase.advance(RunPhase::Harvesting);
            let executor = Arc::clone(&self.executor);
            let slot = OutcomeSlot::new(seq, id.clone(), tx.clone());
            workers.spawn(async move {
                let outcome = executor.execute(id).await;
                drop(permit);
                slot.fill(outcome);
            });
            while workers.try_join_next().is_some() {}

            while let Ok((done_seq, outcome)) = rx.try_recv() {
                progress.record(done_seq, &outcome);
            }
            self.settle(progress).await?;
        }
        Ok(true)
    }

    /// Moves the cursor past completed pages and persists when the
    /// checkpoint interval is reached.
    async fn settle(&self, progress: &mut SourceProgress) -> Result<(), PipelineError> {
        if let Some(cursor) = progress.advance_cursor() {
            self.store.set_cursor(self.source, cursor);
        }
        if progress.unpersisted >= self.checkpoint_interval {
            self.persist(progress.unpersisted).await?;
            progress.unpersisted = 0;
        }
        Ok(())
    }

    async fn persist(&self, pending: usize) -> Result<(), PipelineError> {
        let store = Arc::clone(&self.store);
        let source = self.source;
        tokio::task::spawn_blocking(move || store.persist(source))
            .await
            .map_err(|e| PipelineError::Task(format!("checkpoint writer: {}", e)))?
            .map_err(|error| PipelineError::Checkpoint {
                source_type: source,
                pending,
                error,
            })
    }
}

// ============================================================================
// Tests
// ============================================================================
