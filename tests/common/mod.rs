#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use package_harvester::harvest::traits::{FormatError, Page, SourceAdapter, SourceError};
use package_harvester::{
    ExportAck, ExportError, HarvestConfig, NormalizedPackageRecord, Sink, SourceType,
};

/// Config for a local run of `sources` with checkpoints under `dir`.
pub fn config(dir: &std::path::Path, sources: &[SourceType]) -> HarvestConfig {
    HarvestConfig {
        run_id: "test-run".to_string(),
        sources: sources.to_vec(),
        checkpoint_dir: dir.to_path_buf(),
        checkpoint_interval: 1,
        workers_per_source: 2,
        item_timeout_secs: 10,
        ..Default::default()
    }
}

/// Adapter serving fixed pages; the cursor is the page index.
pub struct MockAdapter {
    source: SourceType,
    pages: Vec<Vec<String>>,
    malformed: HashSet<String>,
    delay: Option<Duration>,
    slow: HashMap<String, Duration>,
    panicking: HashSet<String>,
    on_enumerate: Option<Box<dyn Fn() + Send + Sync>>,
    fetched: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new(source: SourceType, pages: &[&[&str]]) -> Self {
        Self {
            source,
            pages: pages
                .iter()
                .map(|page| page.iter().map(|id| id.to_string()).collect())
                .collect(),
            malformed: HashSet::new(),
            delay: None,
            slow: HashMap::new(),
            panicking: HashSet::new(),
            on_enumerate: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_malformed(mut self, id: &str) -> Self {
        self.malformed.insert(id.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delays only the fetch of `id`.
    pub fn with_slow(mut self, id: &str, delay: Duration) -> Self {
        self.slow.insert(id.to_string(), delay);
        self
    }

    pub fn with_panic(mut self, id: &str) -> Self {
        self.panicking.insert(id.to_string());
        self
    }

    pub fn on_enumerate(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_enumerate = Some(Box::new(hook));
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        let mut fetched = self.fetched.lock().unwrap().clone();
        fetched.sort();
        fetched
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn source_type(&self) -> SourceType {
        self.source
    }

    async fn enumerate(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
        if let Some(hook) = &self.on_enumerate {
            hook();
        }
        let index: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let ids = self.pages.get(index).cloned().unwrap_or_default();
        Ok(Page {
            ids,
            next_cursor: (index + 1 < self.pages.len()).then(|| (index + 1).to_string()),
        })
    }

    async fn fetch_one(&self, id: &str) -> Result<NormalizedPackageRecord, SourceError> {
        self.fetched.lock().unwrap().push(id.to_string());
        if let Some(delay) = self.delay.or_else(|| self.slow.get(id).copied()) {
            tokio::time::sleep(delay).await;
        }
        if self.panicking.contains(id) {
            panic!("adapter bug while fetching {id}");
        }
        if self.malformed.contains(id) {
            return Err(SourceError::Malformed(FormatError::MalformedRecipe {
                line: 2,
                reason: "unterminated array".to_string(),
            }));
        }
        Ok(NormalizedPackageRecord::builder(self.source, id)
            .version(Some("1.0"))
            .build())
    }
}

/// Sink keeping every record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<NormalizedPackageRecord>>,
    finalized: AtomicBool,
}

impl MemorySink {
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn export(&self, record: &NormalizedPackageRecord) -> Result<ExportAck, ExportError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(ExportAck::new(self.name(), record.id()))
    }

    async fn finalize(&self) -> Result<(), ExportError> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink rejecting the listed package names.
pub struct FailingSink {
    reject: HashSet<String>,
}

impl FailingSink {
    pub fn rejecting(names: &[&str]) -> Self {
        Self {
            reject: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn export(&self, record: &NormalizedPackageRecord) -> Result<ExportAck, ExportError> {
        if self.reject.contains(record.name()) {
            return Err(ExportError::Rejected {
                sink: self.name().to_string(),
                id: record.id().to_string(),
                reason: "quota exceeded".to_string(),
            });
        }
        Ok(ExportAck::new(self.name(), record.id()))
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
