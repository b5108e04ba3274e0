//! AUR adapter: RPC metadata plus the package's PKGBUILD.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Candidates;
use super::http::ResilientClient;
use crate::config::HarvestConfig;
use crate::harvest::formats::PkgbuildFormat;
use crate::harvest::traits::{Page, PackageFormat, SourceAdapter, SourceError};
use crate::model::{NormalizedPackageRecord, SourceType};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    results: Vec<RpcPackage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RpcPackage {
    name: String,
    #[serde(default)]
    package_base: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "URL")]
    url: Option<String>,
    #[serde(default)]
    maintainer: Option<String>,
    #[serde(default)]
    num_votes: Option<u64>,
    #[serde(default)]
    popularity: Option<f64>,
    #[serde(default)]
    out_of_date: Option<i64>,
    #[serde(default)]
    last_modified: Option<i64>,
}

pub struct AurAdapter {
    client: ResilientClient,
    rpc_endpoint: Url,
    pkgbuild_endpoint: Url,
    candidates: Candidates,
}

impl AurAdapter {
    pub fn new(config: &HarvestConfig, cancel: CancellationToken) -> Result<Self, SourceError> {
        let base = config.aur.base_url.trim_end_matches('/');
        let endpoint = |path: &str| {
            Url::parse(&format!("{}/{}", base, path))
                .map_err(|e| SourceError::Config(format!("AUR base URL '{}': {}", base, e)))
        };
        let candidates = Candidates::new(
            &config.aur.candidates,
            config.aur.page_size,
            config.aur.candidates_from_flathub,
            config,
            &cancel,
        )?;
        Ok(Self {
            client: ResilientClient::new(SourceType::Arch, config, cancel)?,
            rpc_endpoint: endpoint("rpc/")?,
            pkgbuild_endpoint: endpoint("cgit/aur.git/plain/PKGBUILD")?,
            candidates,
        })
    }

    /// Package names may hold `+`, `@` or `&`, so query values are encoded.
    fn info_url(&self, name: &str) -> Url {
        let mut url = self.rpc_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("v", "5")
            .append_pair("type", "info")
            .append_pair("arg[]", name);
        url
    }

    fn pkgbuild_url(&self, base: &str) -> Url {
        let mut url = self.pkgbuild_endpoint.clone();
        url.query_pairs_mut().append_pair("h", base);
        url
    }
}

#[async_trait]
impl SourceAdapter for AurAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Arch
    }

    async fn enumerate(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
        self.candidates.page(cursor).await
    }

    async fn fetch_one(&self, id: &str) -> Result<NormalizedPackageRecord, SourceError> {
        let rpc: RpcResponse = self.client.get_json(self.info_url(id).as_str()).await?;
        if let Some(error) = rpc.error {
            return Err(SourceError::UnexpectedResponse(format!("AUR RPC: {}", error)));
        }
        let info = rpc
            .results
            .into_iter()
            .find(|pkg| pkg.name.eq_ignore_ascii_case(id))
            .ok_or_else(|| SourceError::NotFound(format!("AUR package {}", id)))?;

        // Split packages share the PKGBUILD of their base.
        let base = info.package_base.clone().unwrap_or_else(|| info.name.clone());
        let text = self.client.get_text(self.pkgbuild_url(&base).as_str()).await?;
        let extract = PkgbuildFormat.extract(&text)?;
        debug!(package = %info.name, base = %base, "Parsed PKGBUILD");

        let mut builder = NormalizedPackageRecord::builder(SourceType::Arch, info.name.clone())
            .version(extract.version.or(info.version.clone()))
            .description(extract.description.or(info.description.clone()))
            .dependencies(extract.dependencies)
            .build_dependencies(extract.build_dependencies)
            .metadata("optional_dependencies", json!(extract.optional_dependencies))
            .metadata("package_base", json!(base))
            .metadata(
                "aur",
                json!({
                    "version": info.version,
                    "url": info.url,
                    "maintainer": info.maintainer,
                    "num_votes": info.num_votes,
                    "popularity": info.popularity,
                    "out_of_date": info.out_of_date,
                    "last_modified": info.last_modified,
                }),
            );
        for (key, value) in extract.raw {
            builder = builder.metadata(key, value);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let adapter = AurAdapter::new(&HarvestConfig::default(), CancellationToken::new()).unwrap();
        assert_eq!(
            adapter.info_url("firefox").as_str(),
            "https://aur.archlinux.org/rpc/?v=5&type=info&arg%5B%5D=firefox"
        );
        assert_eq!(
            adapter.pkgbuild_url("firefox").as_str(),
            "https://aur.archlinux.org/cgit/aur.git/plain/PKGBUILD?h=firefox"
        );
        assert_eq!(
            adapter.info_url("libc++").as_str(),
            "https://aur.archlinux.org/rpc/?v=5&type=info&arg%5B%5D=libc%2B%2B"
        );
        assert_eq!(
            adapter.pkgbuild_url("a&b").as_str(),
            "https://aur.archlinux.org/cgit/aur.git/plain/PKGBUILD?h=a%26b"
        );
    }

    #[test]
    fn test_rpc_payload_shape() {
        let rpc: RpcResponse = serde_json::from_str(
            r#"{"version":5,"type":"multiinfo","resultcount":1,"results":[
                {"Name":"yay","PackageBase":"yay","Version":"12.3.5-1",
                 "Description":"AUR helper","URL":"https://github.com/Jguer/yay",
                 "NumVotes":2000,"Popularity":30.5,"OutOfDate":null,"Maintainer":"jguer"}]}"#,
        )
        .unwrap();
        assert_eq!(rpc.results[0].name, "yay");
        assert_eq!(rpc.results[0].version.as_deref(), Some("12.3.5-1"));
        assert_eq!(rpc.results[0].url.as_deref(), Some("https://github.com/Jguer/yay"));
        assert!(rpc.error.is_none());
    }
}
