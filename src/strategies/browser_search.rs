//! Headless-browser search strategy.
//!
//! The slow, hard-to-detect path: drives a real Chromium over CDP so the
//! traffic carries a genuine browser fingerprint. Expensive to start and
//! cheap to reuse, so it supports batch sessions: one browser per phase,
//! proactively restarted after a configured number of uses to bound
//! memory growth.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use super::web_search::{extract_results, page_to_record, SearchEngine};
use super::{AcquisitionStrategy, RawRecord, StrategyError, StrategyKind};
use crate::modules::detection::{ObservedResponse, ResponseAnalyzer};
use crate::modules::resolver::MatchCandidate;

/// Locate a Chromium binary: explicit override first, then PATH.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("LEXFETCH_CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct BrowserSearchConfig {
    /// Engine whose result pages the browser renders.
    pub engine: SearchEngine,
    pub site_filter: String,
    pub navigation_timeout: Duration,
    /// Session restarts after this many page loads.
    pub max_session_uses: u32,
    pub max_hits: usize,
}

impl Default for BrowserSearchConfig {
    fn default() -> Self {
        Self {
            engine: super::web_search::default_engines().remove(0),
            site_filter: "site:gov.cn OR site:npc.gov.cn".to_string(),
            navigation_timeout: Duration::from_secs(20),
            max_session_uses: 10,
            max_hits: 5,
        }
    }
}

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    uses: u32,
}

impl BrowserSession {
    async fn launch() -> Result<Self, StrategyError> {
        let executable = find_chromium()
            .ok_or_else(|| StrategyError::Session("no Chromium binary found".to_string()))?;

        let config = BrowserConfig::builder()
            .chrome_executable(executable)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(StrategyError::Session)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| StrategyError::Session(format!("launch failed: {err}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self {
            browser,
            handler,
            uses: 0,
        })
    }

    async fn shutdown(mut self) {
        if let Err(err) = self.browser.close().await {
            log::warn!("browser close failed: {err}");
        }
        self.handler.abort();
    }

    /// Navigate to a URL and return the rendered HTML.
    async fn render(&mut self, url: &str, timeout: Duration) -> Result<String, StrategyError> {
        self.uses += 1;
        let page = tokio::time::timeout(timeout, self.browser.new_page(url))
            .await
            .map_err(|_| StrategyError::Browser(format!("navigation timed out: {url}")))?
            .map_err(|err| StrategyError::Browser(format!("navigation failed: {err}")))?;

        let html = tokio::time::timeout(timeout, async {
            page.wait_for_navigation().await.ok();
            page.content().await
        })
        .await
        .map_err(|_| StrategyError::Browser(format!("render timed out: {url}")))?
        .map_err(|err| StrategyError::Browser(format!("content failed: {err}")))?;

        if let Err(err) = page.close().await {
            log::debug!("page close failed: {err}");
        }
        Ok(html)
    }
}

/// Browser-driven search. Supports batch sessions; outside a batch the
/// session is opened lazily and torn down with `close_session`.
pub struct BrowserSearchStrategy {
    config: BrowserSearchConfig,
    analyzer: Arc<ResponseAnalyzer>,
    session: Mutex<Option<BrowserSession>>,
}

impl BrowserSearchStrategy {
    pub fn new(config: BrowserSearchConfig, analyzer: Arc<ResponseAnalyzer>) -> Self {
        Self {
            config,
            analyzer,
            session: Mutex::new(None),
        }
    }

    /// Render a URL in the (possibly recycled) session and classify the
    /// result so browser traffic feeds the same detection metrics.
    async fn render_classified(&self, url: &str) -> Result<String, StrategyError> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            if session.uses >= self.config.max_session_uses {
                let uses = session.uses;
                if let Some(old) = guard.take() {
                    old.shutdown().await;
                }
                log::info!("browser session recycled after {uses} uses");
            }
        }
        if guard.is_none() {
            *guard = Some(BrowserSession::launch().await?);
        }
        let session = guard.as_mut().expect("session just ensured");

        let started = Instant::now();
        let outcome = session.render(url, self.config.navigation_timeout).await;
        let elapsed = started.elapsed();

        // A dead session must not poison later targets; drop it so the
        // next call starts fresh.
        if outcome.is_err() {
            if let Some(broken) = guard.take() {
                broken.shutdown().await;
            }
        }
        let html = outcome?;

        let parsed = Url::parse(url).map_err(crate::net::NetError::from)?;
        let (verdict, _) = self.analyzer.classify(&ObservedResponse {
            url: &parsed,
            status: 200,
            headers: &http::HeaderMap::new(),
            body: &html,
            elapsed,
        });
        if verdict.is_hostile() {
            return Err(StrategyError::Net(crate::net::NetError::Hostile {
                verdict,
                url: url.to_string(),
            }));
        }
        Ok(html)
    }
}

#[async_trait]
impl AcquisitionStrategy for BrowserSearchStrategy {
    fn name(&self) -> &'static str {
        "browser_search"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Browser
    }

    fn supports_batch_session(&self) -> bool {
        true
    }

    async fn open_session(&self) -> Result<(), StrategyError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(BrowserSession::launch().await?);
        }
        Ok(())
    }

    async fn close_session(&self) -> Result<(), StrategyError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.shutdown().await;
        }
        Ok(())
    }

    async fn search(&self, target: &str) -> Result<Vec<MatchCandidate>, StrategyError> {
        let query = if self.config.site_filter.is_empty() {
            target.to_string()
        } else {
            format!("{target} {}", self.config.site_filter)
        };
        let url = Url::parse_with_params(
            self.config.engine.endpoint,
            &[(self.config.engine.query_param, query.as_str())],
        )
        .map_err(crate::net::NetError::from)?;

        let html = self.render_classified(url.as_str()).await?;
        Ok(extract_results(&html, &self.config.engine, self.config.max_hits))
    }

    async fn fetch_detail(&self, candidate: &MatchCandidate) -> Result<RawRecord, StrategyError> {
        let url = candidate
            .url
            .as_deref()
            .unwrap_or(candidate.source_ref.as_str());
        let html = self.render_classified(url).await?;
        Ok(page_to_record(url, &html, &candidate.title))
    }
}
