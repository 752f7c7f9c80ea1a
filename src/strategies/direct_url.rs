//! Direct lookup of curated known URLs.
//!
//! Some documents live at well-known addresses that search engines
//! refuse to surface to automated traffic. This strategy matches the
//! target name against a curated table and fetches the page directly.

use async_trait::async_trait;
use std::sync::Arc;

use super::web_search::page_to_record;
use super::{AcquisitionStrategy, RawRecord, StrategyError, StrategyKind};
use crate::modules::detection::OperationKind;
use crate::modules::resolver::{keywords, normalize_title, MatchCandidate};
use crate::net::NetClient;

/// Strategy that resolves targets against a known-URL table.
pub struct DirectUrlStrategy {
    net: Arc<NetClient>,
    /// (document name, URL) pairs; order decides ambiguity.
    known_urls: Vec<(String, String)>,
}

impl DirectUrlStrategy {
    pub fn new(net: Arc<NetClient>, known_urls: Vec<(String, String)>) -> Self {
        Self { net, known_urls }
    }

    /// Exact match on the normalized name, then containment, then a
    /// shared-keyword match requiring at least two keywords.
    fn find_known_url(&self, target: &str) -> Option<&(String, String)> {
        let target_norm = normalize_title(target);

        if let Some(entry) = self
            .known_urls
            .iter()
            .find(|(name, _)| normalize_title(name) == target_norm)
        {
            return Some(entry);
        }

        if let Some(entry) = self.known_urls.iter().find(|(name, _)| {
            let name_norm = normalize_title(name);
            name_norm.contains(&target_norm) || target_norm.contains(&name_norm)
        }) {
            return Some(entry);
        }

        let target_keywords = keywords(&target_norm);
        self.known_urls.iter().find(|(name, _)| {
            let shared = keywords(&normalize_title(name))
                .iter()
                .filter(|k| target_keywords.contains(k))
                .count();
            shared >= 2
        })
    }
}

#[async_trait]
impl AcquisitionStrategy for DirectUrlStrategy {
    fn name(&self) -> &'static str {
        "direct_url"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectUrl
    }

    async fn search(&self, target: &str) -> Result<Vec<MatchCandidate>, StrategyError> {
        let Some((name, url)) = self.find_known_url(target) else {
            return Ok(Vec::new());
        };
        log::debug!("known url table: {target:?} -> {url}");
        let mut candidate = MatchCandidate::new(name.clone(), url.clone()).with_url(url.clone());
        candidate.extra = serde_json::json!({ "table_entry": name });
        Ok(vec![candidate])
    }

    async fn fetch_detail(&self, candidate: &MatchCandidate) -> Result<RawRecord, StrategyError> {
        let url = candidate
            .url
            .as_deref()
            .unwrap_or(candidate.source_ref.as_str());
        let page = self.net.get(url, OperationKind::DetailFetch).await?;
        Ok(page_to_record(page.url.as_str(), &page.body, &candidate.title))
    }
}
