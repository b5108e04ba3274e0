//! Harvest configuration.
//!
//! [`HarvestConfig`] is built once by the caller (CLI, service, test) and
//! passed by reference into the pipeline and adapters. Nothing in the core
//! reads the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::SourceType;

/// Default GitHub API used to enumerate Flathub repositories.
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
/// Default raw-content host for manifests and Nix expressions.
pub const DEFAULT_RAW_GITHUB: &str = "https://raw.githubusercontent.com";
/// Default Arch User Repository host.
pub const DEFAULT_AUR_URL: &str = "https://aur.archlinux.org";

/// Errors that make a run impossible before any network activity.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A selected source needs a credential that was not supplied
    #[error("Missing credential for source '{0}'")]
    MissingCredential(SourceType),

    /// No source was selected
    #[error("No sources selected")]
    NoSources,

    /// A numeric or textual setting is out of range
    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration for one harvest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Identity of the run; checkpoints are keyed by it.
    pub run_id: String,

    /// Sources to harvest, in any order.
    pub sources: Vec<SourceType>,

    /// Per-source API token.
    pub credentials: HashMap<SourceType, String>,

    /// Maximum items dispatched across all sources (`None` = unlimited).
    pub item_limit: Option<usize>,

    /// Concurrent fetch workers per source.
    pub workers_per_source: usize,

    /// Directory holding checkpoint files.
    pub checkpoint_dir: PathBuf,

    /// Persist the checkpoint after this many completions.
    pub checkpoint_interval: usize,

    /// Upper bound for fetching one item, retries included.
    pub item_timeout_secs: u64,

    /// Cancel the whole run after this long.
    pub run_timeout_secs: Option<u64>,

    pub breaker: BreakerConfig,
    pub backoff: BackoffConfig,
    pub http: HttpConfig,
    pub flathub: FlathubConfig,
    pub nixpkgs: NixpkgsConfig,
    pub aur: AurConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            run_id: "default".to_string(),
            sources: SourceType::ALL.to_vec(),
            credentials: HashMap::new(),
            item_limit: None,
            workers_per_source: 4,
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            checkpoint_interval: 50,
            item_timeout_secs: 300,
            run_timeout_secs: None,
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
            http: HttpConfig::default(),
            flathub: FlathubConfig::default(),
            nixpkgs: NixpkgsConfig::default(),
            aur: AurConfig::default(),
        }
    }
}

impl HarvestConfig {
    pub fn credential(&self, source: SourceType) -> Option<&str> {
        self.credentials
            .get(&source)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    /// Sources that cannot run without a credential.
    pub fn requires_credential(source: SourceType) -> bool {
        // Listing the Flathub org goes through the GitHub API, which is
        // unusable for a full harvest without a token.
        matches!(source, SourceType::Flathub)
    }

    /// Whether a selected secondary source derives candidates from the
    /// Flathub listing.
    fn lists_flathub(&self) -> bool {
        self.sources.iter().any(|source| match source {
            SourceType::Nix => self.nixpkgs.candidates_from_flathub,
            SourceType::Arch => self.aur.candidates_from_flathub,
            SourceType::Flathub => false,
        })
    }

    /// Checks the configuration; called in the pipeline's initializing phase.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.run_id.trim().is_empty()
            || self
                .run_id
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(ConfigError::Invalid {
                field: "run_id",
                reason: format!("'{}' must be non-empty [A-Za-z0-9_-]", self.run_id),
            });
        }
        if self.workers_per_source == 0 {
            return Err(invalid("workers_per_source", "must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(invalid("checkpoint_interval", "must be at least 1"));
        }
        if self.item_timeout_secs == 0 {
            return Err(invalid("item_timeout_secs", "must be at least 1"));
        }
        if self.breaker.threshold == 0 {
            return Err(invalid("breaker.threshold", "must be at least 1"));
        }
        self.backoff.validate()?;

        for source in &self.sources {
            if Self::requires_credential(*source) && self.credential(*source).is_none() {
                return Err(ConfigError::MissingCredential(*source));
            }
        }
        if self.lists_flathub() && self.credential(SourceType::Flathub).is_none() {
            return Err(ConfigError::MissingCredential(SourceType::Flathub));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Circuit breaker settings, shared by every source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_secs: 300,
        }
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Uniform jitter fraction, e.g. `0.25` for ±25%.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("backoff.max_attempts", "must be at least 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("backoff.max_delay_ms", "must be >= base_delay_ms"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(invalid("backoff.jitter", "must be in [0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("package-harvester/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlathubConfig {
    pub api_base: String,
    pub raw_base: String,
    pub org: String,
    pub branch: String,
    pub page_size: u32,
}

impl Default for FlathubConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API.to_string(),
            raw_base: DEFAULT_RAW_GITHUB.to_string(),
            org: "flathub".to_string(),
            branch: "master".to_string(),
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NixpkgsConfig {
    /// Base URL of the nixpkgs tree, branch included.
    pub raw_base: String,
    /// Package attribute names to harvest.
    pub candidates: Vec<String>,
    /// After `candidates`, also harvest the package names of the Flathub
    /// applications. Needs the Flathub token.
    pub candidates_from_flathub: bool,
    pub page_size: usize,
}

impl Default for NixpkgsConfig {
    fn default() -> Self {
        Self {
            raw_base: format!("{}/NixOS/nixpkgs/nixos-unstable", DEFAULT_RAW_GITHUB),
            candidates: Vec::new(),
            candidates_from_flathub: false,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AurConfig {
    pub base_url: String,
    /// AUR package names to harvest.
    pub candidates: Vec<String>,
    /// See [`NixpkgsConfig::candidates_from_flathub`].
    pub candidates_from_flathub: bool,
    pub page_size: usize,
}

impl Default for AurConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_AUR_URL.to_string(),
            candidates: Vec::new(),
            candidates_from_flathub: false,
            page_size: 100,
        }
    }
}
