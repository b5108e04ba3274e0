//! NPS record model - the normalized package record every source adapter
//! produces and every sink consumes.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Schema tag written into every record.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Upstream ecosystem a record was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Manifest store: Flatpak manifests hosted in the Flathub GitHub org.
    Flathub,
    /// Expression tree: the nixpkgs Nix expression tree.
    Nix,
    /// Recipe distro: PKGBUILD recipes from the Arch User Repository.
    Arch,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [SourceType::Flathub, SourceType::Nix, SourceType::Arch];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Flathub => "flathub",
            SourceType::Nix => "nix",
            SourceType::Arch => "arch",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a source name is not one of the known ecosystems.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown source '{0}' (expected one of: flathub, nix, arch)")]
pub struct UnknownSource(pub String);

impl FromStr for SourceType {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flathub" => Ok(SourceType::Flathub),
            "nix" | "nixpkgs" => Ok(SourceType::Nix),
            "arch" | "aur" => Ok(SourceType::Arch),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Normalized package record (NPS v1.0.0).
///
/// Fields are private: a record is assembled once through
/// [`NormalizedPackageRecord::builder`] and is read-only afterwards.
///
/// # Serialization
///
/// The JSON field names are part of the wire contract. An unknown version
/// is written as `null`, never as an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPackageRecord {
    id: String,
    name: String,
    #[serde(default, deserialize_with = "non_empty")]
    version: Option<String>,
    source_type: SourceType,
    #[serde(default, deserialize_with = "non_empty")]
    description: Option<String>,
    #[serde(default, deserialize_with = "dedup_list")]
    dependencies: Vec<String>,
    #[serde(default, deserialize_with = "dedup_list")]
    build_dependencies: Vec<String>,
    #[serde(default, deserialize_with = "dedup_list")]
    frameworks: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_schema_version")]
    schema_version: String,
}

impl NormalizedPackageRecord {
    /// Starts a record for `name` from `source`. The id is derived as
    /// `<source_type>:<name>`.
    pub fn builder(source_type: SourceType, name: impl Into<String>) -> RecordBuilder {
        let name = name.into();
        RecordBuilder {
            record: NormalizedPackageRecord {
                id: format!("{}:{}", source_type, name),
                name,
                version: None,
                source_type,
                description: None,
                dependencies: Vec::new(),
                build_dependencies: Vec::new(),
                frameworks: Vec::new(),
                metadata: BTreeMap::new(),
                schema_version: SCHEMA_VERSION.to_string(),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` means the upstream did not declare a version.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn build_dependencies(&self) -> &[String] {
        &self.build_dependencies
    }

    pub fn frameworks(&self) -> &[String] {
        &self.frameworks
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Builder for [`NormalizedPackageRecord`].
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: NormalizedPackageRecord,
}

impl RecordBuilder {
    pub fn version(mut self, version: Option<impl Into<String>>) -> Self {
        self.record.version = normalize_optional(version.map(Into::into));
        self
    }

    pub fn description(mut self, description: Option<impl Into<String>>) -> Self {
        self.record.description = normalize_optional(description.map(Into::into));
        self
    }

    /// Appends runtime dependencies; duplicates are dropped, first
    /// occurrence wins.
    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        extend_unique(&mut self.record.dependencies, deps);
        self
    }

    pub fn build_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        extend_unique(&mut self.record.build_dependencies, deps);
        self
    }

    pub fn frameworks<I, S>(mut self, frameworks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        extend_unique(&mut self.record.frameworks, frameworks);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.record.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> NormalizedPackageRecord {
        self.record
    }
}

/// Removes duplicates from `items` while keeping first-seen order.
pub fn dedup_preserving_order<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out = Vec::new();
    extend_unique(&mut out, items);
    out
}

fn extend_unique<I, S>(target: &mut Vec<String>, items: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen: HashSet<String> = target.iter().cloned().collect();
    for item in items {
        let item = item.into();
        if item.is_empty() {
            continue;
        }
        if seen.insert(item.clone()) {
            target.push(item);
        }
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(normalize_optional(Option::<String>::deserialize(deserializer)?))
}

fn dedup_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(dedup_preserving_order(raw))
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}
