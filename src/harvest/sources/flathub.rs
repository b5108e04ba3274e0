//! Flathub adapter: one GitHub repository per application, holding its
//! Flatpak manifest.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::http::ResilientClient;
use crate::config::{FlathubConfig, HarvestConfig};
use crate::harvest::formats::manifest::{package_name_from_app_id, MANIFEST_CANDIDATES};
use crate::harvest::formats::ManifestFormat;
use crate::harvest::traits::{FormatExtract, Page, PackageFormat, SourceAdapter, SourceError};
use crate::model::{NormalizedPackageRecord, SourceType};

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    #[serde(default)]
    archived: bool,
}

/// Paged listing of the application repositories of the Flathub org.
#[derive(Debug, Clone)]
pub struct FlathubListing {
    client: ResilientClient,
    config: FlathubConfig,
}

impl FlathubListing {
    /// Fails with [`SourceError::Config`] when no GitHub token is configured.
    pub fn new(config: &HarvestConfig, cancel: CancellationToken) -> Result<Self, SourceError> {
        if config.credential(SourceType::Flathub).is_none() {
            return Err(SourceError::Config(
                "Flathub enumeration requires a GitHub token".to_string(),
            ));
        }
        Ok(Self {
            client: ResilientClient::new(SourceType::Flathub, config, cancel)?,
            config: config.flathub.clone(),
        })
    }

    fn repos_url(&self, page: u32) -> String {
        format!(
            "{}/orgs/{}/repos?type=public&sort=full_name&direction=asc&per_page={}&page={}",
            self.config.api_base.trim_end_matches('/'),
            self.config.org,
            self.config.page_size,
            page
        )
    }

    /// Application ids on listing page `page` (1-based), skipping archived
    /// and infrastructure repositories, plus the next page when this one
    /// was full.
    pub async fn app_ids(&self, page: u32) -> Result<(Vec<String>, Option<u32>), SourceError> {
        let repos: Vec<Repository> = self.client.get_json(&self.repos_url(page)).await?;
        let full_page = repos.len() as u32 >= self.config.page_size;

        let ids: Vec<String> = repos
            .into_iter()
            .filter(|repo| !repo.archived && package_name_from_app_id(&repo.name).is_some())
            .map(|repo| repo.name)
            .collect();
        info!(page, apps = ids.len(), "Enumerated Flathub repositories");
        Ok((ids, full_page.then_some(page + 1)))
    }
}

pub struct FlathubAdapter {
    listing: FlathubListing,
    config: FlathubConfig,
}

impl FlathubAdapter {
    /// Fails with [`SourceError::Config`] when no GitHub token is configured.
    pub fn new(config: &HarvestConfig, cancel: CancellationToken) -> Result<Self, SourceError> {
        Ok(Self {
            listing: FlathubListing::new(config, cancel)?,
            config: config.flathub.clone(),
        })
    }

    fn manifest_url(&self, app_id: &str, file: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.config.raw_base.trim_end_matches('/'),
            self.config.org,
            app_id,
            self.config.branch,
            file
        )
    }

    fn to_record(&self, app_id: &str, file: &str, extract: FormatExtract) -> NormalizedPackageRecord {
        let mut builder = NormalizedPackageRecord::builder(SourceType::Flathub, app_id)
            .version(extract.version)
            .description(extract.description)
            .dependencies(extract.dependencies)
            .frameworks(extract.frameworks)
            .metadata("manifest_file", json!(file))
            .metadata(
                "repository",
                json!(format!("https://github.com/{}/{}", self.config.org, app_id)),
            );
        if let Some(package_name) = package_name_from_app_id(app_id) {
            builder = builder.metadata("package_name", json!(package_name));
        }
        if let Some(declared) = extract.name.filter(|declared| declared != app_id) {
            builder = builder.metadata("declared_app_id", json!(declared));
        }
        for (key, value) in extract.raw {
            builder = builder.metadata(key, value);
        }
        builder.build()
    }
}

#[async_trait]
impl SourceAdapter for FlathubAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Flathub
    }

    async fn enumerate(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
        let page = match cursor {
            Some(cursor) => cursor
                .parse::<u32>()
                .map_err(|_| SourceError::UnexpectedResponse(format!("bad Flathub cursor '{}'", cursor)))?,
            None => 1,
        };
        let (ids, next) = self.listing.app_ids(page).await?;
        Ok(Page {
            ids,
            next_cursor: next.map(|next| next.to_string()),
        })
    }

    async fn fetch_one(&self, id: &str) -> Result<NormalizedPackageRecord, SourceError> {
        for candidate in MANIFEST_CANDIDATES {
            let file = candidate.replace("{id}", id);
            let url = self.manifest_url(id, &file);
            let Some(text) = self.listing.client.get_optional_text(&url).await? else {
                continue;
            };
            debug!(app_id = id, file = %file, "Found manifest");
            let extract = ManifestFormat.extract(&text)?;
            return Ok(self.to_record(id, &file, extract));
        }
        Err(SourceError::NotFound(format!("no manifest for {}", id)))
    }
}
