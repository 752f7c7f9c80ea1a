//! Shared network layer.
//!
//! Every strategy request flows through here: identity selection,
//! identity-keyed client reuse, per-request timeout, response
//! classification, and health reporting. Centralizing this keeps the
//! throttling/rotation policy in one place instead of per call site.

use http::{HeaderMap, HeaderName, HeaderValue};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use url::Url;

use crate::modules::detection::{DetectionVerdict, ObservedResponse, OperationKind, ResponseAnalyzer};
use crate::modules::identity::IdentityPool;

/// Browser user agents rotated per request.
static USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
];

#[derive(Debug, Error)]
pub enum NetError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("hostile response ({verdict:?}) from {url}")]
    Hostile { verdict: DetectionVerdict, url: String },
}

impl NetError {
    /// Whether retrying the same strategy can plausibly help.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Http(_) | NetError::Hostile { .. })
    }
}

/// A classified, fully-read response.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub verdict: DetectionVerdict,
    pub elapsed: Duration,
}

/// Network layer tuning.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub request_timeout: Duration,
    pub prefer_paid_identities: bool,
    /// Extra headers sent with every request.
    pub base_headers: Vec<(String, String)>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            prefer_paid_identities: true,
            base_headers: vec![
                (
                    "accept".to_string(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
                ),
                ("accept-language".to_string(), "zh-CN,zh;q=0.9,en;q=0.8".to_string()),
            ],
        }
    }
}

/// Identity-aware HTTP client shared by all strategies.
pub struct NetClient {
    config: NetConfig,
    pool: Arc<IdentityPool>,
    analyzer: Arc<ResponseAnalyzer>,
    /// Reqwest clients keyed by proxy endpoint; `None` is the direct client.
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl NetClient {
    pub fn new(config: NetConfig, pool: Arc<IdentityPool>, analyzer: Arc<ResponseAnalyzer>) -> Self {
        Self {
            config,
            pool,
            analyzer,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn analyzer(&self) -> &Arc<ResponseAnalyzer> {
        &self.analyzer
    }

    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.pool
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, NetError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.config.request_timeout)
            .default_headers(self.default_headers()?);

        if let Some(endpoint) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(endpoint)?);
        }

        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    fn default_headers(&self) -> Result<reqwest::header::HeaderMap, NetError> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.config.base_headers {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| NetError::InvalidHeader(name.clone()))?;
            let header_value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| NetError::InvalidHeader(name.clone()))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    /// GET a URL through the pool with adaptive pacing and classification.
    pub async fn get(&self, url: &str, op: OperationKind) -> Result<FetchedPage, NetError> {
        self.request(reqwest::Method::GET, url, None, op).await
    }

    /// POST a form body through the pool.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        op: OperationKind,
    ) -> Result<FetchedPage, NetError> {
        let body: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter().copied())
            .finish();
        self.request(reqwest::Method::POST, url, Some(body), op).await
    }

    /// Download a binary attachment (statute body files, decree scans)
    /// through the pool. No classification: attachments are not HTML and
    /// the phrase tables would misread them.
    pub async fn download(&self, url: &str) -> Result<bytes::Bytes, NetError> {
        let identity = self.pool.acquire(self.config.prefer_paid_identities);
        let proxy = identity.as_ref().and_then(|sel| sel.proxy_url.clone());
        let client = self.client_for(proxy.as_deref()).await?;

        let started = Instant::now();
        let outcome = async {
            let response = client.get(url).send().await?.error_for_status()?;
            response.bytes().await
        }
        .await;

        match outcome {
            Ok(payload) => {
                if let Some(sel) = &identity {
                    self.pool.report_success(sel.id, started.elapsed());
                }
                Ok(payload)
            }
            Err(err) => {
                if let Some(sel) = &identity {
                    self.pool.report_failure(sel.id);
                }
                Err(NetError::Http(err))
            }
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        form_body: Option<String>,
        op: OperationKind,
    ) -> Result<FetchedPage, NetError> {
        let parsed = Url::parse(url)?;

        let delay = self.analyzer.adaptive_delay(op);
        if delay > Duration::ZERO {
            sleep(delay).await;
        }

        let identity = self.pool.acquire(self.config.prefer_paid_identities);
        let proxy = identity.as_ref().and_then(|sel| sel.proxy_url.clone());
        let client = self.client_for(proxy.as_deref()).await?;

        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let mut builder = client
            .request(method, parsed.clone())
            .header("user-agent", user_agent);
        if let Some(body) = form_body {
            builder = builder
                .header("content-type", "application/x-www-form-urlencoded")
                .body(body);
        }

        let started = Instant::now();
        let outcome = builder.send().await;
        let elapsed = started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                if let Some(sel) = &identity {
                    self.pool.report_failure(sel.id);
                }
                return Err(NetError::Http(err));
            }
        };

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let headers = convert_headers(response.headers())?;
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                if let Some(sel) = &identity {
                    self.pool.report_failure(sel.id);
                }
                return Err(NetError::Http(err));
            }
        };

        let (verdict, level) = self.analyzer.classify(&ObservedResponse {
            url: &final_url,
            status,
            headers: &headers,
            body: &body,
            elapsed,
        });

        if verdict.is_hostile() {
            log::info!("{final_url}: {verdict:?} (level {level:?})");
            if let Some(sel) = &identity {
                self.pool.report_failure(sel.id);
                // A burned identity cools down immediately; the rotation
                // signal retires it early so the next attempt egresses
                // elsewhere.
                if verdict.burns_identity() || self.analyzer.should_rotate_identity() {
                    self.pool.quarantine(sel.id);
                }
            }
            return Err(NetError::Hostile {
                verdict,
                url: final_url.to_string(),
            });
        }

        if let Some(sel) = &identity {
            self.pool.report_success(sel.id, elapsed);
        }

        Ok(FetchedPage {
            url: final_url,
            status,
            headers,
            body,
            verdict,
            elapsed,
        })
    }
}

fn convert_headers(headers: &reqwest::header::HeaderMap) -> Result<HeaderMap, NetError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        let header_name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| NetError::InvalidHeader(name.to_string()))?;
        let header_value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| NetError::InvalidHeader(name.to_string()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::detection::DetectionConfig;
    use crate::modules::identity::IdentityConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> NetClient {
        let pool = Arc::new(IdentityPool::new(IdentityConfig::default()));
        let analyzer = Arc::new(ResponseAnalyzer::new(DetectionConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            fast_response: Duration::from_millis(0),
            ..Default::default()
        }));
        NetClient::new(NetConfig::default(), pool, analyzer)
    }

    #[tokio::test]
    async fn normal_response_is_returned() {
        let server = MockServer::start().await;
        let body = "statute catalogue entry ".repeat(20);
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let net = client();
        let page = net
            .get(&format!("{}/search", server.uri()), OperationKind::Search)
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.verdict, DetectionVerdict::Normal);
    }

    #[tokio::test]
    async fn download_returns_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/statute.pdf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7 fake".to_vec()),
            )
            .mount(&server)
            .await;

        let net = client();
        let payload = net
            .download(&format!("{}/statute.pdf", server.uri()))
            .await
            .unwrap();
        assert!(payload.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn hostile_response_surfaces_as_error_and_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let net = client();
        let err = net
            .get(&server.uri(), OperationKind::Search)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetError::Hostile {
                verdict: DetectionVerdict::RateLimited,
                ..
            }
        ));
        assert_eq!(net.analyzer().metrics().rate_limited_requests, 1);
    }
}
