//! Source adapters, one per upstream ecosystem.
//!
//! - `flathub` - Flatpak manifests from the Flathub GitHub organization
//! - `nixpkgs` - Nix expressions from the nixpkgs tree
//! - `aur` - PKGBUILDs and RPC metadata from the Arch User Repository
//!
//! All network access goes through [`http::ResilientClient`].

pub mod aur;
pub mod flathub;
pub mod http;
pub mod nixpkgs;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use aur::AurAdapter;
pub use flathub::{FlathubAdapter, FlathubListing};
pub use http::ResilientClient;
pub use nixpkgs::NixpkgsAdapter;

use crate::config::HarvestConfig;
use crate::harvest::formats::package_name_from_app_id;
use crate::harvest::traits::{Page, SourceAdapter, SourceError};
use crate::model::{dedup_preserving_order, SourceType};

/// Cursor prefix for pages drawn from the Flathub listing.
const FLATHUB_CURSOR: &str = "flathub:";

/// Builds the adapter for `source`.
pub fn adapter_for(
    source: SourceType,
    config: &HarvestConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn SourceAdapter>, SourceError> {
    let adapter: Arc<dyn SourceAdapter> = match source {
        SourceType::Flathub => Arc::new(FlathubAdapter::new(config, cancel)?),
        SourceType::Nix => Arc::new(NixpkgsAdapter::new(config, cancel)?),
        SourceType::Arch => Arc::new(AurAdapter::new(config, cancel)?),
    };
    Ok(adapter)
}

/// Builds an adapter for every configured source.
pub fn adapters_for(
    config: &HarvestConfig,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn SourceAdapter>>, SourceError> {
    config
        .sources
        .iter()
        .map(|source| adapter_for(*source, config, cancel.clone()))
        .collect()
}

/// Package names enumerated by a secondary source: the configured list
/// first, then optionally the names derived from Flathub application ids.
///
/// Cursors are offsets into the configured list, then `flathub:<page>`.
pub(crate) struct Candidates {
    fixed: Vec<String>,
    page_size: usize,
    flathub: Option<FlathubListing>,
}

impl Candidates {
    pub fn new(
        names: &[String],
        page_size: usize,
        from_flathub: bool,
        config: &HarvestConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, SourceError> {
        let mut fixed = dedup_preserving_order(names.iter().cloned());
        fixed.sort();
        let flathub = if from_flathub {
            Some(FlathubListing::new(config, cancel.clone())?)
        } else {
            None
        };
        Ok(Self {
            fixed,
            page_size,
            flathub,
        })
    }

    pub async fn page(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
        if let Some(page) = cursor.and_then(|c| c.strip_prefix(FLATHUB_CURSOR)) {
            let page = page
                .parse::<u32>()
                .map_err(|_| SourceError::UnexpectedResponse(format!("bad Flathub cursor '{}'", page)))?;
            return self.flathub_page(page).await;
        }

        let mut page = candidate_page(&self.fixed, cursor, self.page_size)?;
        if page.next_cursor.is_none() && self.flathub.is_some() {
            if page.ids.is_empty() {
                return self.flathub_page(1).await;
            }
            page.next_cursor = Some(format!("{}1", FLATHUB_CURSOR));
        }
        Ok(page)
    }

    async fn flathub_page(&self, page: u32) -> Result<Page, SourceError> {
        let Some(listing) = &self.flathub else {
            return Err(SourceError::UnexpectedResponse(
                "Flathub cursor without Flathub-derived candidates".to_string(),
            ));
        };
        let (app_ids, next) = listing.app_ids(page).await?;
        let mut ids = dedup_preserving_order(app_ids.iter().filter_map(|id| package_name_from_app_id(id)));
        ids.sort();
        Ok(Page {
            ids,
            next_cursor: next.map(|next| format!("{}{}", FLATHUB_CURSOR, next)),
        })
    }
}

/// One page of a fixed candidate list; the cursor is the offset.
pub(crate) fn candidate_page(
    candidates: &[String],
    cursor: Option<&str>,
    page_size: usize,
) -> Result<Page, SourceError> {
    let offset = match cursor {
        Some(cursor) => cursor
            .parse::<usize>()
            .map_err(|_| SourceError::UnexpectedResponse(format!("bad offset cursor '{}'", cursor)))?,
        None => 0,
    };
    let page_size = page_size.max(1);
    let start = offset.min(candidates.len());
    let end = (start + page_size).min(candidates.len());
    Ok(Page {
        ids: candidates[start..end].to_vec(),
        next_cursor: (end < candidates.len()).then(|| end.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_page() {
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let page = candidate_page(&names, None, 2).unwrap();
        assert_eq!(page.ids, vec!["a", "b"]);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let page = candidate_page(&names, Some("2"), 2).unwrap();
        assert_eq!(page.ids, vec!["c"]);
        assert_eq!(page.next_cursor, None);

        let page = candidate_page(&names, Some("10"), 2).unwrap();
        assert!(page.ids.is_empty());
        assert!(candidate_page(&names, Some("x"), 2).is_err());
    }

    #[test]
    fn test_adapters_for_sources() {
        let mut config = HarvestConfig::default();
        config.sources = vec![SourceType::Nix, SourceType::Arch];
        let adapters = adapters_for(&config, &CancellationToken::new()).unwrap();
        let kinds: Vec<_> = adapters.iter().map(|a| a.source_type()).collect();
        assert_eq!(kinds, vec![SourceType::Nix, SourceType::Arch]);
    }
}
