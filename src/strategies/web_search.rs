//! Generic web-search-engine lookup.
//!
//! Broad-coverage fallback: queries public search engines with a
//! site-restricted query and extracts result titles and links. Field
//! extraction deliberately stops there; page-specific heuristics belong
//! to downstream consumers.

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::Arc;
use url::Url;

use super::{AcquisitionStrategy, RawRecord, StrategyError, StrategyKind};
use crate::modules::detection::OperationKind;
use crate::modules::resolver::MatchCandidate;
use crate::net::NetClient;

/// One search engine endpoint and its result-markup shape.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    pub name: &'static str,
    pub endpoint: &'static str,
    pub query_param: &'static str,
    /// CSS selector for one result block.
    pub result_selector: &'static str,
    /// CSS selector for the title link inside a result block.
    pub link_selector: &'static str,
}

/// Engines tried in order; the first one that yields hits wins.
pub fn default_engines() -> Vec<SearchEngine> {
    vec![
        SearchEngine {
            name: "bing",
            endpoint: "https://cn.bing.com/search",
            query_param: "q",
            result_selector: "li.b_algo",
            link_selector: "h2 a",
        },
        SearchEngine {
            name: "baidu",
            endpoint: "https://www.baidu.com/s",
            query_param: "wd",
            result_selector: "div.result",
            link_selector: "h3 a",
        },
    ]
}

/// Strategy that locates documents through public search engines.
pub struct WebSearchStrategy {
    net: Arc<NetClient>,
    engines: Vec<SearchEngine>,
    /// Appended to the query to keep hits on authoritative domains.
    site_filter: String,
    max_hits: usize,
}

impl WebSearchStrategy {
    pub fn new(net: Arc<NetClient>) -> Self {
        Self {
            net,
            engines: default_engines(),
            site_filter: "site:gov.cn OR site:npc.gov.cn".to_string(),
            max_hits: 5,
        }
    }

    pub fn with_engines(mut self, engines: Vec<SearchEngine>) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_site_filter(mut self, filter: impl Into<String>) -> Self {
        self.site_filter = filter.into();
        self
    }

    async fn search_engine(
        &self,
        engine: &SearchEngine,
        target: &str,
    ) -> Result<Vec<MatchCandidate>, StrategyError> {
        let query = if self.site_filter.is_empty() {
            target.to_string()
        } else {
            format!("{target} {}", self.site_filter)
        };
        let url = Url::parse_with_params(engine.endpoint, &[(engine.query_param, query.as_str())])
            .map_err(crate::net::NetError::from)?;

        let page = self.net.get(url.as_str(), OperationKind::Search).await?;
        Ok(extract_results(&page.body, engine, self.max_hits))
    }
}

/// Pull `(title, href)` pairs out of a search result page. Shared with the
/// browser strategy, which renders the same engines.
pub(crate) fn extract_results(
    html: &str,
    engine: &SearchEngine,
    max_hits: usize,
) -> Vec<MatchCandidate> {
    let document = Html::parse_document(html);
    let Ok(result_selector) = Selector::parse(engine.result_selector) else {
        return Vec::new();
    };
    let Ok(link_selector) = Selector::parse(engine.link_selector) else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    for block in document.select(&result_selector) {
        if candidates.len() >= max_hits {
            break;
        }
        let Some(link) = block.select(&link_selector).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if !href.starts_with("http") {
            continue;
        }
        let title = html_escape::decode_html_entities(
            &link.text().collect::<String>(),
        )
        .trim()
        .to_string();
        if title.is_empty() {
            continue;
        }

        let mut candidate = MatchCandidate::new(title, href).with_url(href);
        candidate.extra = serde_json::json!({ "engine": engine.name });
        candidates.push(candidate);
    }
    candidates
}

/// Generic title + text extraction from a fetched page.
pub(crate) fn page_to_record(url: &str, body: &str, fallback_title: &str) -> RawRecord {
    let document = Html::parse_document(body);
    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        })
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| fallback_title.to_string());

    let text = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join("\n");

    let mut record = RawRecord::new(title);
    record.source_url = Some(url.to_string());
    record.content = Some(text);
    record
}

#[async_trait]
impl AcquisitionStrategy for WebSearchStrategy {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::WebSearch
    }

    async fn search(&self, target: &str) -> Result<Vec<MatchCandidate>, StrategyError> {
        let mut last_error: Option<StrategyError> = None;

        for engine in &self.engines {
            match self.search_engine(engine, target).await {
                Ok(candidates) if !candidates.is_empty() => {
                    log::debug!("{}: {} hits for {target:?}", engine.name, candidates.len());
                    return Ok(candidates);
                }
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("{} search failed: {err}", engine.name);
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
        let url = candidate
            .url
            .as_deref()
            .unwrap_or(candidate.source_ref.as_str());
        let page = self.net.get(url, OperationKind::DetailFetch).await?;
        Ok(page_to_record(page.url.as_str(), &page.body, &candidate.title))
    }
}
