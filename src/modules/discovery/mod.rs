//! Free-identity discovery feed.
//!
//! Pulls candidate proxy endpoints from public plaintext feeds. Every
//! discovered identity is admitted untrusted and must pass a health
//! sweep before the pool will select it.

use std::time::Duration;
use thiserror::Error;

use super::identity::{IdentityTier, NetworkIdentity, ProxyProtocol};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no feed produced any identity")]
    Empty,
}

/// One plaintext `address:port`-per-line feed.
#[derive(Debug, Clone)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    pub protocol: ProxyProtocol,
}

impl FeedSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, protocol: ProxyProtocol) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            protocol,
        }
    }
}

/// Fetches and parses free-identity feeds.
#[derive(Debug)]
pub struct IdentityDiscovery {
    sources: Vec<FeedSource>,
    client: reqwest::Client,
    limit: usize,
}

impl IdentityDiscovery {
    pub fn new(sources: Vec<FeedSource>, limit: usize) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            sources,
            client,
            limit,
        })
    }

    /// Fetch all feeds, parse, and dedupe. Individual feed failures are
    /// logged and skipped; only a fully empty harvest is an error.
    pub async fn fetch(&self) -> Result<Vec<NetworkIdentity>, DiscoveryError> {
        let mut discovered: Vec<NetworkIdentity> = Vec::new();

        for source in &self.sources {
            if discovered.len() >= self.limit {
                break;
            }
            match self.fetch_one(source).await {
                Ok(batch) => {
                    log::info!("feed {} produced {} identities", source.name, batch.len());
                    for identity in batch {
                        let duplicate = discovered
                            .iter()
                            .any(|d| d.address == identity.address && d.port == identity.port);
                        if !duplicate {
                            discovered.push(identity);
                        }
                    }
                }
                Err(err) => {
                    log::warn!("feed {} failed: {err}", source.name);
                }
            }
        }

        if discovered.is_empty() {
            return Err(DiscoveryError::Empty);
        }
        discovered.truncate(self.limit);
        Ok(discovered)
    }

    async fn fetch_one(&self, source: &FeedSource) -> Result<Vec<NetworkIdentity>, DiscoveryError> {
        let body = self
            .client
            .get(&source.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_plaintext_feed(&body, &source.name, source.protocol))
    }
}

/// Parse `address:port` lines into untrusted free identities. Malformed
/// lines are skipped.
pub fn parse_plaintext_feed(
    body: &str,
    feed_name: &str,
    protocol: ProxyProtocol,
) -> Vec<NetworkIdentity> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (address, port) = line.split_once(':')?;
            let port: u16 = port.trim().parse().ok()?;
            if address.is_empty() || port == 0 {
                return None;
            }
            Some(
                NetworkIdentity::proxied(
                    format!("{feed_name}:{address}:{port}"),
                    protocol,
                    address,
                    port,
                    IdentityTier::Free,
                )
                .untrusted(),
            )
        })
        .collect()
}
