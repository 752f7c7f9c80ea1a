//! Acquisition strategies.
//!
//! Each strategy is one self-contained way of locating and retrieving a
//! target document. The orchestrator walks them in priority order; all of
//! them speak the same narrow trait so new sources are added by
//! implementing it, not by branching on type.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::modules::resolver::MatchCandidate;
use crate::net::NetError;

pub mod browser_search;
pub mod direct_url;
pub mod statute_api;
pub mod web_search;

pub use browser_search::{BrowserSearchConfig, BrowserSearchStrategy};
pub use direct_url::DirectUrlStrategy;
pub use statute_api::StatuteApiStrategy;
pub use web_search::WebSearchStrategy;

/// Broad strategy categories; the orchestrator uses these for its
/// escalation shortcut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    StructuredApi,
    WebSearch,
    Browser,
    DirectUrl,
}

impl StrategyKind {
    /// Harder-to-detect strategies worth escalating to under a ban signal.
    pub fn stealthy(self) -> bool {
        matches!(self, StrategyKind::Browser)
    }
}

/// Raw record payload produced by a winning strategy. The engine treats
/// the fields as opaque and hands them to the persistence collaborator.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub title: String,
    pub source_url: Option<String>,
    /// Source-specific structured fields.
    pub fields: Value,
    /// Extracted page text, when the source is a plain page.
    pub content: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source_url: None,
            fields: Value::Null,
            content: None,
            retrieved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("malformed source payload: {0}")]
    Parse(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("session error: {0}")]
    Session(String),
}

impl StrategyError {
    /// Whether another attempt of the same strategy can plausibly help.
    pub fn is_transient(&self) -> bool {
        match self {
            StrategyError::Net(err) => err.is_transient(),
            StrategyError::Browser(_) | StrategyError::Session(_) => false,
            StrategyError::Parse(_) => false,
        }
    }
}

/// One self-contained acquisition procedure for a single source.
///
/// Strategies never see each other; the orchestrator owns ordering,
/// retries, and session lifecycle calls.
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StrategyKind;

    /// Whether the strategy keeps reusable per-phase session state worth
    /// opening once per batch phase.
    fn supports_batch_session(&self) -> bool {
        false
    }

    async fn open_session(&self) -> Result<(), StrategyError> {
        Ok(())
    }

    async fn close_session(&self) -> Result<(), StrategyError> {
        Ok(())
    }

    /// Search the source for candidate records matching the target name.
    async fn search(&self, target: &str) -> Result<Vec<MatchCandidate>, StrategyError>;

    /// Retrieve the full record for a previously returned candidate.
    async fn fetch_detail(&self, candidate: &MatchCandidate) -> Result<RawRecord, StrategyError>;
}

static CJK_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日").expect("cjk date regex"));
static SEPARATED_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})").expect("separated date regex"));

/// Parse the date formats the sources actually emit: `2013年2月4日`,
/// `2013-2-4`, `2013/02/04`, `2013.2.4`, and `2025-05-29 00:00:00`.
pub fn parse_source_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    for re in [&*CJK_DATE_RE, &*SEPARATED_DATE_RE] {
        if let Some(caps) = re.captures(raw) {
            let year: i32 = caps[1].parse().ok()?;
            let month: u32 = caps[2].parse().ok()?;
            let day: u32 = caps[3].parse().ok()?;
            return NaiveDate::from_ymd_opt(year, month, day);
        }
    }
    None
}
