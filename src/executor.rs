//! Per-item harvest worker.
//!
//! [`ItemExecutor`] owns the worker pool of one source. Each item is
//! fetched under a timeout, raced against cancellation, handed to every
//! sink, and recorded in the checkpoint store only when every sink has
//! acknowledged it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::harvest::traits::{SourceAdapter, SourceError};
use crate::model::SourceType;
use crate::traits::Sink;

/// Why an item did not reach every sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CircuitOpen,
    RetriesExhausted,
    Malformed,
    NotFound,
    /// Non-retryable upstream error (4xx, unexpected body)
    Upstream,
    Export,
    Timeout,
    Cancelled,
    /// The worker stopped without producing an outcome (panic or abort).
    Aborted,
}

impl FailureKind {
    pub fn of(err: &SourceError) -> Self {
        match err {
            SourceError::CircuitOpen(_) => FailureKind::CircuitOpen,
            SourceError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            SourceError::Malformed(_) => FailureKind::Malformed,
            SourceError::NotFound(_) => FailureKind::NotFound,
            SourceError::Cancelled => FailureKind::Cancelled,
            SourceError::RateLimited { .. }
            | SourceError::Http { .. }
            | SourceError::Network(_)
            | SourceError::UnexpectedResponse(_)
            | SourceError::Config(_) => FailureKind::Upstream,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::Malformed => "malformed",
            FailureKind::NotFound => "not_found",
            FailureKind::Upstream => "upstream",
            FailureKind::Export => "export",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of harvesting one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Every sink acknowledged the record; the id is checkpointed.
    Exported { id: String },
    Failed {
        id: String,
        kind: FailureKind,
        error: String,
    },
}

impl ItemOutcome {
    pub fn id(&self) -> &str {
        match self {
            ItemOutcome::Exported { id } | ItemOutcome::Failed { id, .. } => id,
        }
    }

    pub fn is_exported(&self) -> bool {
        matches!(self, ItemOutcome::Exported { .. })
    }
}

/// Fetch-and-export worker pool for one source.
pub struct ItemExecutor {
    source: SourceType,
    adapter: Arc<dyn SourceAdapter>,
    sinks: Arc<Vec<Arc<dyn Sink>>>,
    store: Arc<CheckpointStore>,
    semaphore: Arc<Semaphore>,
    item_timeout: Duration,
    cancel: CancellationToken,
}

impl ItemExecutor {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        sinks: Arc<Vec<Arc<dyn Sink>>>,
        store: Arc<CheckpointStore>,
        concurrency_limit: usize,
        item_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: adapter.source_type(),
            adapter,
            sinks,
            store,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            item_timeout,
            cancel,
        }
    }

    pub fn source_type(&self) -> SourceType {
        self.source
    }

    /// Waits for a free worker slot. The permit is held for the lifetime of
    /// one item.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }

    /// Harvests one item. Never fails: every error becomes an
    /// [`ItemOutcome::Failed`].
    #[instrument(skip(self), fields(source = %self.source))]
    pub async fn execute(&self, id: String) -> ItemOutcome {
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => {
                return failed(id, FailureKind::Cancelled, "cancelled before fetch completed");
            }
            result = tokio::time::timeout(self.item_timeout, self.adapter.fetch_one(&id)) => result,
        };

        let record = match fetched {
            Err(_) => {
                let reason = format!("no result within {}s", self.item_timeout.as_secs());
                warn!(id = %id, "Item timed out");
                return failed(id, FailureKind::Timeout, &reason);
            }
            Ok(Err(e)) => {
                let kind = FailureKind::of(&e);
                warn!(id = %id, kind = %kind, error = %e, "Fetch failed");
                return failed(id, kind, &e.to_string());
            }
            Ok(Ok(record)) => record,
        };

        // Every sink sees the record, even after another sink failed.
        let mut errors = Vec::new();
        for sink in self.sinks.iter() {
            match sink.export(&record).await {
                Ok(ack) => debug!(id = %id, sink = %ack.sink, "Sink acknowledged"),
                Err(e) => {
                    warn!(id = %id, sink = sink.name(), error = %e, "Export failed");
                    errors.push(format!("{}: {}", sink.name(), e));
                }
            }
        }
        if !errors.is_empty() {
            return failed(id, FailureKind::Export, &errors.join("; "));
        }

        self.store.record_completed(self.source, &id);
        debug!(id = %id, record_id = record.id(), "Item exported");
        ItemOutcome::Exported { id }
    }
}

fn failed(id: String, kind: FailureKind, error: &str) -> ItemOutcome {
    ItemOutcome::Failed {
        id,
        kind,
        error: error.to_string(),
    }
}
