//! nixpkgs adapter: package expressions fetched from the nixpkgs tree.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Candidates;
use super::http::ResilientClient;
use crate::config::HarvestConfig;
use crate::harvest::formats::NixFormat;
use crate::harvest::traits::{Page, PackageFormat, SourceAdapter, SourceError};
use crate::model::{NormalizedPackageRecord, SourceType};

/// Category directories searched after `pkgs/by-name`.
const CATEGORY_DIRS: &[&str] = &[
    "pkgs/applications",
    "pkgs/applications/audio",
    "pkgs/applications/video",
    "pkgs/applications/graphics",
    "pkgs/applications/editors",
    "pkgs/applications/office",
    "pkgs/applications/networking/browsers",
    "pkgs/applications/networking/instant-messengers",
    "pkgs/games",
];

/// Repository-relative paths where the expression for `name` may live,
/// in lookup order.
pub fn expression_paths(name: &str) -> Vec<String> {
    let shard: String = name.chars().take(2).collect::<String>().to_lowercase();
    let mut paths = vec![format!("pkgs/by-name/{}/{}/package.nix", shard, name)];
    paths.extend(
        CATEGORY_DIRS
            .iter()
            .map(|dir| format!("{}/{}/default.nix", dir, name)),
    );
    paths
}

pub struct NixpkgsAdapter {
    client: ResilientClient,
    raw_base: String,
    candidates: Candidates,
}

impl NixpkgsAdapter {
    pub fn new(config: &HarvestConfig, cancel: CancellationToken) -> Result<Self, SourceError> {
        let candidates = Candidates::new(
            &config.nixpkgs.candidates,
            config.nixpkgs.page_size,
            config.nixpkgs.candidates_from_flathub,
            config,
            &cancel,
        )?;
        Ok(Self {
            client: ResilientClient::new(SourceType::Nix, config, cancel)?,
            raw_base: config.nixpkgs.raw_base.trim_end_matches('/').to_string(),
            candidates,
        })
    }
}

#[async_trait]
impl SourceAdapter for NixpkgsAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Nix
    }

    async fn enumerate(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
        self.candidates.page(cursor).await
    }

    async fn fetch_one(&self, id: &str) -> Result<NormalizedPackageRecord, SourceError> {
        for path in expression_paths(id) {
            let url = format!("{}/{}", self.raw_base, path);
            let Some(text) = self.client.get_optional_text(&url).await? else {
                continue;
            };
            debug!(package = id, path = %path, "Found Nix expression");

            let extract = NixFormat.extract(&text)?;
            let name = extract.name.clone().unwrap_or_else(|| id.to_string());
            let mut builder = NormalizedPackageRecord::builder(SourceType::Nix, id)
                .version(extract.version)
                .description(extract.description)
                .dependencies(extract.dependencies)
                .build_dependencies(extract.build_dependencies)
                .metadata("expression_path", json!(path))
                .metadata("pname", json!(name));
            for (key, value) in extract.raw {
                builder = builder.metadata(key, value);
            }
            return Ok(builder.build());
        }
        Err(SourceError::NotFound(format!("no expression for {}", id)))
    }
}
