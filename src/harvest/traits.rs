//! Core traits and types for the modular harvest system.
//!
//! This module defines the seams between the orchestrator and the
//! ecosystem-specific code:
//! - Upstream access via [`SourceAdapter`]
//! - Text-format parsing via [`PackageFormat`]
//! - Source-neutral parse results via [`FormatExtract`]
//! - Standardized error handling

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{NormalizedPackageRecord, SourceType};
use crate::resilience::{CircuitOpenError, RetryError, Transient};

// ============================================================================
// Source Adapter Trait
// ============================================================================

/// One page of an adapter's enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Candidate identifiers, in stable upstream order.
    pub ids: Vec<String>,

    /// Cursor for the following page; `None` ends the enumeration.
    pub next_cursor: Option<String>,
}

/// Access to one upstream ecosystem.
///
/// Enumeration is lazy and page-based: the orchestrator calls
/// [`enumerate`](SourceAdapter::enumerate) with `None`, then with each
/// returned `next_cursor` until it is `None`. The order must be stable for
/// unchanged upstream data so that persisted cursors stay meaningful.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; `fetch_one` is called
/// concurrently from the source's worker pool.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Returns the page that starts at `cursor`.
    async fn enumerate(&self, cursor: Option<&str>) -> Result<Page, SourceError>;

    /// Fetches and parses one item into a normalized record.
    ///
    /// # Errors
    ///
    /// Source-level failures ([`SourceError::NotFound`],
    /// [`SourceError::RateLimited`], [`SourceError::Malformed`]) are kept
    /// distinct from resilience failures ([`SourceError::CircuitOpen`],
    /// [`SourceError::RetriesExhausted`]).
    async fn fetch_one(&self, id: &str) -> Result<NormalizedPackageRecord, SourceError>;
}

// ============================================================================
// Package Format Trait
// ============================================================================

/// Abstraction over the upstream text formats (Nix expressions, PKGBUILDs,
/// Flatpak manifests).
///
/// Implementations are pure: no I/O, no shared state, identical output for
/// identical input.
pub trait PackageFormat: Send + Sync {
    /// Returns the unique identifier for this format.
    ///
    /// Examples: `"nix"`, `"pkgbuild"`, `"flatpak-manifest"`
    fn name(&self) -> &str;

    /// Detects from the file name whether this format applies.
    fn can_handle(&self, path: &Path) -> bool;

    /// Parses `text` and returns the source-neutral summary.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] when the text is structurally malformed.
    fn extract(&self, text: &str) -> Result<FormatExtract, FormatError>;
}

/// Source-neutral result of parsing one package description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatExtract {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,

    /// Runtime dependencies, declaration order
    pub dependencies: Vec<String>,

    /// Build-time dependencies, declaration order
    pub build_dependencies: Vec<String>,

    /// Optional dependencies
    pub optional_dependencies: Vec<String>,

    /// Runtimes / SDKs / platforms the package builds against
    pub frameworks: Vec<String>,

    /// Format-specific raw data, preserved verbatim into record metadata
    pub raw: BTreeMap<String, serde_json::Value>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors from the structural parsers. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Unbalanced delimiter or unterminated literal in a Nix expression
    #[error("Malformed expression at byte {offset}: {reason}")]
    MalformedExpression { offset: usize, reason: String },

    /// Unterminated quote or array in a PKGBUILD
    #[error("Malformed recipe at line {line}: {reason}")]
    MalformedRecipe { line: usize, reason: String },

    /// Manifest is neither valid JSON nor valid YAML
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),
}

/// Errors from a source adapter for a single item or page.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The upstream has no such item
    #[error("Not found: {0}")]
    NotFound(String),

    /// The upstream asked us to slow down
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Unexpected HTTP status
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// Connection, TLS or timeout error
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream returned data we cannot parse
    #[error("Malformed upstream data: {0}")]
    Malformed(#[from] FormatError),

    /// Upstream returned a response body we did not expect
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The source's circuit breaker is open
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Transient failures persisted through every retry
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<SourceError>,
    },

    /// The run was cancelled while this call was pending
    #[error("Cancelled")]
    Cancelled,

    /// The adapter cannot be built from the supplied configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        match self {
            SourceError::RateLimited { .. } | SourceError::Network(_) => true,
            SourceError::Http { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<RetryError<SourceError>> for SourceError {
    fn from(err: RetryError<SourceError>) -> Self {
        match err {
            RetryError::CircuitOpen(e) => SourceError::CircuitOpen(e),
            RetryError::Exhausted { attempts, last } => SourceError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Permanent(e) => e,
            RetryError::Cancelled => SourceError::Cancelled,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Network(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
