use crate::model::NormalizedPackageRecord;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Sink '{sink}' rejected record {id}: {reason}")]
    Rejected {
        sink: String,
        id: String,
        reason: String,
    },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Acknowledgement that a sink durably stored a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportAck {
    pub sink: String,
    pub id: String,
}

impl ExportAck {
    pub fn new(sink: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            id: id.into(),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs and acks (e.g., "nps", "sqlite").
    fn name(&self) -> &str;

    /// Stores one record. Returning `Ok` means the record is durable as far
    /// as this sink is concerned.
    async fn export(&self, record: &NormalizedPackageRecord) -> Result<ExportAck, ExportError>;

    /// Called once after the last record of a run.
    async fn finalize(&self) -> Result<(), ExportError> {
        Ok(())
    }
}
