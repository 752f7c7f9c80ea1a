//! Structured search API of the national statute database.
//!
//! The authoritative source: a JSON search endpoint keyed by title plus a
//! detail endpoint keyed by record id. Searched with a ladder of keyword
//! variants because the catalogue's own titles drop prefixes and
//! annotations inconsistently.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{parse_source_date, AcquisitionStrategy, RawRecord, StrategyError, StrategyKind};
use crate::modules::detection::OperationKind;
use crate::modules::resolver::{normalize_title, MatchCandidate, Validity};
use crate::net::NetClient;

pub const DEFAULT_BASE_URL: &str = "https://flk.npc.gov.cn";

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    data: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    publish: String,
    #[serde(default)]
    office: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct DetailEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
}

/// Strategy backed by the statute database's JSON API.
pub struct StatuteApiStrategy {
    net: Arc<NetClient>,
    base_url: String,
}

impl StatuteApiStrategy {
    pub fn new(net: Arc<NetClient>) -> Self {
        Self::with_base_url(net, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(net: Arc<NetClient>, base_url: impl Into<String>) -> Self {
        Self {
            net,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Keyword ladder: full name, name without the country prefix, main
    /// name without parentheticals, and the stem up to the first 法.
    fn keyword_variants(target: &str) -> Vec<String> {
        let normalized = normalize_title(target);
        let mut raw = vec![target.trim().to_string(), normalized.clone()];
        if let Some((stem, _)) = normalized.split_once('法') {
            if !stem.is_empty() {
                raw.push(format!("{stem}法"));
            }
        }

        let mut variants: Vec<String> = Vec::new();
        for variant in raw {
            if !variant.is_empty() && !variants.contains(&variant) {
                variants.push(variant);
            }
        }
        variants
    }

    async fn search_keyword(&self, keyword: &str) -> Result<Vec<SearchEntry>, StrategyError> {
        let url = url::Url::parse_with_params(
            &format!("{}/api/", self.base_url),
            &[
                ("searchType", "title;accurate;1,3"),
                ("sortTr", "f_bbrq_s;desc"),
                ("sort", "true"),
                ("page", "1"),
                ("size", "20"),
                ("fgbt", keyword),
            ],
        )
        .map_err(crate::net::NetError::from)?;

        let page = self.net.get(url.as_str(), OperationKind::Search).await?;
        let envelope: SearchEnvelope = serde_json::from_str(&page.body)
            .map_err(|err| StrategyError::Parse(format!("search response: {err}")))?;

        if !envelope.success {
            return Ok(Vec::new());
        }
        Ok(envelope.result.map(|r| r.data).unwrap_or_default())
    }

    fn entry_to_candidate(&self, entry: SearchEntry) -> MatchCandidate {
        let validity = match entry.status.as_str() {
            "1" => Some(Validity::InForce),
            "5" | "9" => Some(Validity::Superseded),
            "3" => Some(Validity::Repealed),
            _ => None,
        };

        let mut candidate = MatchCandidate::new(
            html_escape::decode_html_entities(&entry.title).to_string(),
            entry.id.clone(),
        )
        .with_url(format!("{}/detail2.html?id={}", self.base_url, entry.id));
        candidate.validity = validity;
        candidate.published = parse_source_date(&entry.publish);
        candidate.extra = serde_json::json!({
            "office": entry.office,
            "status": entry.status,
        });
        candidate
    }
}

#[async_trait]
impl AcquisitionStrategy for StatuteApiStrategy {
    fn name(&self) -> &'static str {
        "statute_api"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::StructuredApi
    }

    async fn search(&self, target: &str) -> Result<Vec<MatchCandidate>, StrategyError> {
        let mut last_error: Option<StrategyError> = None;

        for keyword in Self::keyword_variants(target) {
            match self.search_keyword(&keyword).await {
                Ok(entries) if !entries.is_empty() => {
                    log::debug!("statute api: {} hits for {keyword:?}", entries.len());
                    return Ok(entries
                        .into_iter()
                        .filter(|entry| !entry.id.is_empty())
                        .map(|entry| self.entry_to_candidate(entry))
                        .collect());
                }
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("statute api: keyword {keyword:?} failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_detail(&self, candidate: &MatchCandidate) -> Result<RawRecord, StrategyError> {
        let url = format!("{}/api/detail", self.base_url);
        let page = self
            .net
            .post_form(&url, &[("id", candidate.source_ref.as_str())], OperationKind::DetailFetch)
            .await?;

        let envelope: DetailEnvelope = serde_json::from_str(&page.body)
            .map_err(|err| StrategyError::Parse(format!("detail response: {err}")))?;
        let result = match (envelope.success, envelope.result) {
            (true, Some(result)) => result,
            _ => {
                return Err(StrategyError::Parse(format!(
                    "detail endpoint rejected id {}",
                    candidate.source_ref
                )))
            }
        };

        let title = result
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(&candidate.title)
            .to_string();

        let mut record = RawRecord::new(title);
        record.source_url = candidate.url.clone();
        record.fields = result;
        Ok(record)
    }
}
