//! Hostile-response classification and adaptive throttling.
//!
//! Classifies every response into a detection verdict, keeps rolling
//! block metrics, and derives the throttling/rotation policy every
//! network-facing strategy consults.

use http::HeaderMap;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

/// Per-response classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionVerdict {
    Normal,
    Blocked,
    Captcha,
    RateLimited,
    WafDetected,
    IpBanned,
    CloudflareChallenge,
}

impl DetectionVerdict {
    pub fn is_hostile(self) -> bool {
        self != DetectionVerdict::Normal
    }

    /// Verdicts that indicate the current egress identity itself is burned
    /// and should cool down immediately.
    pub fn burns_identity(self) -> bool {
        matches!(
            self,
            DetectionVerdict::WafDetected
                | DetectionVerdict::IpBanned
                | DetectionVerdict::CloudflareChallenge
        )
    }
}

/// Derived severity tier summarizing how aggressively the targets appear
/// to be blocking automated access. Ordered from calm to hostile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnticrawlerLevel {
    None,
    Low,
    Medium,
    High,
    Extreme,
}

impl Default for AnticrawlerLevel {
    fn default() -> Self {
        AnticrawlerLevel::None
    }
}

/// Operation kinds with distinct pacing envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Search,
    DetailFetch,
    Retry,
}

impl OperationKind {
    fn delay_multiplier(self) -> f64 {
        match self {
            OperationKind::Search => 1.5,
            OperationKind::Retry => 2.0,
            OperationKind::DetailFetch => 1.2,
        }
    }
}

/// Classification and pacing thresholds. Documented configuration, not
/// magic: the level ladder itself (None → Extreme) is the contract, the
/// numbers are tunable.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Status codes treated as throttling.
    pub rate_limited_status: Vec<u16>,
    /// Status codes treated as an outright IP ban.
    pub banned_status: Vec<u16>,
    /// Remaining blocking status codes.
    pub blocked_status: Vec<u16>,
    /// Base delay all adaptive delays scale from.
    pub base_delay: Duration,
    /// Hard cap on any adaptive delay.
    pub max_delay: Duration,
    /// A body smaller than this returned faster than `fast_response` reads
    /// as a canned rejection page.
    pub small_body: usize,
    pub fast_response: Duration,
    /// Responses slower than this read as deliberate throttling.
    pub slow_response: Duration,
    /// Consecutive blocks before identity rotation is advised.
    pub rotate_after_blocks: u32,
    /// Consecutive blocks before the current identity is considered banned.
    pub ban_after_blocks: u32,
    /// Rolling window (classification count) for the block rate.
    pub rate_window: usize,
    /// Minimum samples before the rolling rate contributes to the level;
    /// below it the consecutive-block count alone drives the ladder.
    pub rate_min_samples: usize,
    /// Level ladder: consecutive-block thresholds.
    pub low_blocks: u32,
    pub medium_blocks: u32,
    pub high_blocks: u32,
    pub extreme_blocks: u32,
    /// Level ladder: rolling block-rate thresholds.
    pub low_rate: f64,
    pub medium_rate: f64,
    pub high_rate: f64,
    pub extreme_rate: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            rate_limited_status: vec![429, 503],
            banned_status: vec![403, 451],
            blocked_status: vec![520, 521, 522, 523, 524],
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            small_body: 1000,
            fast_response: Duration::from_millis(100),
            slow_response: Duration::from_secs(30),
            rotate_after_blocks: 3,
            ban_after_blocks: 5,
            rate_window: 50,
            rate_min_samples: 10,
            low_blocks: 1,
            medium_blocks: 3,
            high_blocks: 5,
            extreme_blocks: 10,
            low_rate: 0.1,
            medium_rate: 0.3,
            high_rate: 0.5,
            extreme_rate: 0.8,
        }
    }
}

/// Minimal view of a response handed to the analyzer.
#[derive(Debug, Clone)]
pub struct ObservedResponse<'a> {
    pub url: &'a Url,
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
    pub elapsed: Duration,
}

/// Per-site request breakdown.
#[derive(Debug, Clone, Default)]
pub struct SiteStats {
    pub total: u64,
    pub success: u64,
    pub blocked: u64,
    pub captcha: u64,
    pub rate_limited: u64,
}

/// Process-wide detection counters.
#[derive(Debug, Clone, Default)]
pub struct DetectionMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub blocked_requests: u64,
    pub captcha_requests: u64,
    pub rate_limited_requests: u64,
    pub consecutive_blocks: u32,
    pub last_blocked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub site_stats: HashMap<String, SiteStats>,
}

#[derive(Debug, Default)]
struct AnalyzerState {
    metrics: DetectionMetrics,
    /// Rolling outcome window, `true` = hostile.
    window: VecDeque<bool>,
    level: AnticrawlerLevel,
}

struct PhraseSet {
    verdict: DetectionVerdict,
    patterns: Vec<Regex>,
}

fn phrase_set(verdict: DetectionVerdict, raw: &[&str]) -> PhraseSet {
    let patterns = raw
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|err| panic!("invalid detection phrase `{pattern}`: {err}"))
        })
        .collect();
    PhraseSet { verdict, patterns }
}

/// Curated phrase sets, checked in order of specificity. Chinese phrases
/// cover the government sources this engine was built against.
static BODY_PHRASES: Lazy<Vec<PhraseSet>> = Lazy::new(|| {
    vec![
        phrase_set(
            DetectionVerdict::Captcha,
            &[
                r"captcha",
                r"验证码",
                r"人机验证",
                r"prove\s+you\s+are\s+human",
                r"请验证您是人类",
                r"robot\s+check",
                r"机器人检测",
            ],
        ),
        phrase_set(
            DetectionVerdict::RateLimited,
            &[
                r"rate\s+limit",
                r"too\s+many\s+requests",
                r"频率限制",
                r"请求过于频繁",
                r"访问过于频繁",
                r"slow\s+down",
                r"请稍后再试",
            ],
        ),
        phrase_set(
            DetectionVerdict::WafDetected,
            &[
                r"web\s+application\s+firewall",
                r"\bwaf\b",
                r"安全防护",
                r"网站防火墙",
                r"security\s+service",
                r"安全服务",
            ],
        ),
        phrase_set(
            DetectionVerdict::CloudflareChallenge,
            &[
                r"cloudflare",
                r"cf-ray",
                r"checking\s+your\s+browser",
                r"正在检查您的浏览器",
            ],
        ),
        phrase_set(
            DetectionVerdict::Blocked,
            &[
                r"access\s+denied",
                r"访问被拒绝",
                r"禁止访问",
                r"blocked",
                r"封禁",
                r"security\s+check",
                r"安全检查",
            ],
        ),
    ]
});

static CLOUDFLARE_HEADERS: &[&str] = &["cf-ray", "cf-cache-status", "cf-mitigated"];
static WAF_HEADERS: &[&str] = &["x-waf-event", "x-security-check"];
static RATE_LIMIT_HEADERS: &[&str] = &["retry-after", "x-ratelimit-remaining"];

/// Anti-detection response analyzer.
///
/// Shared mutable state: all read-modify-write sequences are serialized
/// behind one lock so concurrent batch execution cannot corrupt counts.
#[derive(Debug)]
pub struct ResponseAnalyzer {
    config: DetectionConfig,
    state: Mutex<AnalyzerState>,
}

impl ResponseAnalyzer {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AnalyzerState::default()),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Classify a response and fold it into the rolling metrics. Returns
    /// the verdict together with the freshly re-derived anticrawler level.
    pub fn classify(&self, response: &ObservedResponse<'_>) -> (DetectionVerdict, AnticrawlerLevel) {
        let verdict = self.classify_only(response);
        let level = self.record(response.url, verdict);
        (verdict, level)
    }

    /// Pure classification, no metrics update. First match wins, most
    /// specific signals first.
    fn classify_only(&self, response: &ObservedResponse<'_>) -> DetectionVerdict {
        if let Some(verdict) = self.check_status(response.status) {
            return verdict;
        }
        if let Some(verdict) = check_headers(response.headers) {
            return verdict;
        }
        if let Some(verdict) = check_body(response.body) {
            return verdict;
        }
        if let Some(verdict) = self.check_timing(response.elapsed, response.body.len()) {
            return verdict;
        }
        DetectionVerdict::Normal
    }

    fn check_status(&self, status: u16) -> Option<DetectionVerdict> {
        if self.config.rate_limited_status.contains(&status) {
            Some(DetectionVerdict::RateLimited)
        } else if self.config.banned_status.contains(&status) {
            Some(DetectionVerdict::IpBanned)
        } else if self.config.blocked_status.contains(&status) {
            Some(DetectionVerdict::Blocked)
        } else {
            None
        }
    }

    fn check_timing(&self, elapsed: Duration, body_len: usize) -> Option<DetectionVerdict> {
        if elapsed < self.config.fast_response && body_len < self.config.small_body {
            return Some(DetectionVerdict::Blocked);
        }
        if elapsed > self.config.slow_response {
            return Some(DetectionVerdict::RateLimited);
        }
        None
    }

    fn record(&self, url: &Url, verdict: DetectionVerdict) -> AnticrawlerLevel {
        let site = url.host_str().unwrap_or("unknown").to_string();
        let mut state = self.state.lock().expect("analyzer lock poisoned");

        state.metrics.total_requests += 1;
        let site_entry = state.metrics.site_stats.entry(site).or_default();
        site_entry.total += 1;

        match verdict {
            DetectionVerdict::Normal => {
                site_entry.success += 1;
                state.metrics.successful_requests += 1;
                state.metrics.consecutive_blocks = 0;
            }
            DetectionVerdict::Captcha => {
                site_entry.captcha += 1;
                state.metrics.captcha_requests += 1;
                state.metrics.consecutive_blocks += 1;
                state.metrics.last_blocked_at = Some(chrono::Utc::now());
            }
            DetectionVerdict::RateLimited => {
                site_entry.rate_limited += 1;
                state.metrics.rate_limited_requests += 1;
                state.metrics.consecutive_blocks += 1;
                state.metrics.last_blocked_at = Some(chrono::Utc::now());
            }
            _ => {
                site_entry.blocked += 1;
                state.metrics.blocked_requests += 1;
                state.metrics.consecutive_blocks += 1;
                state.metrics.last_blocked_at = Some(chrono::Utc::now());
            }
        }

        if state.window.len() == self.config.rate_window {
            state.window.pop_front();
        }
        state.window.push_back(verdict.is_hostile());

        let blocks = state.metrics.consecutive_blocks;
        let rate = rolling_rate(&state.window, self.config.rate_min_samples);
        let level = derive_level(&self.config, blocks, rate);
        if level != state.level {
            log::info!("anticrawler level {:?} -> {:?}", state.level, level);
            state.level = level;
        }
        level
    }

    /// Current level without classifying anything new.
    pub fn level(&self) -> AnticrawlerLevel {
        self.state.lock().expect("analyzer lock poisoned").level
    }

    /// Snapshot of the process-wide counters.
    pub fn metrics(&self) -> DetectionMetrics {
        self.state
            .lock()
            .expect("analyzer lock poisoned")
            .metrics
            .clone()
    }

    /// Delay to apply before the next operation of the given kind: base
    /// delay scaled by level and operation multipliers plus bounded jitter.
    pub fn adaptive_delay(&self, kind: OperationKind) -> Duration {
        let level = self.level();
        let level_multiplier = match level {
            AnticrawlerLevel::None => 1.0,
            AnticrawlerLevel::Low => 2.0,
            AnticrawlerLevel::Medium => 3.0,
            AnticrawlerLevel::High => 5.0,
            AnticrawlerLevel::Extreme => 10.0,
        };
        let jitter = rand::thread_rng().gen_range(0.8..1.5);
        let secs =
            self.config.base_delay.as_secs_f64() * level_multiplier * kind.delay_multiplier() * jitter;
        Duration::from_secs_f64(secs).min(self.config.max_delay)
    }

    /// Advise switching egress identity.
    pub fn should_rotate_identity(&self) -> bool {
        let state = self.state.lock().expect("analyzer lock poisoned");
        state.metrics.consecutive_blocks >= self.config.rotate_after_blocks
            || state.level >= AnticrawlerLevel::High
    }

    /// Advise abandoning the current identity and approach entirely. The
    /// orchestrator reacts by escalating to a stealthier strategy.
    pub fn should_treat_as_banned(&self) -> bool {
        let state = self.state.lock().expect("analyzer lock poisoned");
        state.metrics.consecutive_blocks >= self.config.ban_after_blocks
            || state.level == AnticrawlerLevel::Extreme
    }
}

impl Default for ResponseAnalyzer {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}

fn check_headers(headers: &HeaderMap) -> Option<DetectionVerdict> {
    if CLOUDFLARE_HEADERS.iter().any(|h| headers.contains_key(*h)) {
        return Some(DetectionVerdict::CloudflareChallenge);
    }
    if WAF_HEADERS.iter().any(|h| headers.contains_key(*h)) {
        return Some(DetectionVerdict::WafDetected);
    }
    if RATE_LIMIT_HEADERS.iter().any(|h| headers.contains_key(*h)) {
        return Some(DetectionVerdict::RateLimited);
    }
    None
}

fn check_body(body: &str) -> Option<DetectionVerdict> {
    if body.is_empty() {
        return None;
    }
    for set in BODY_PHRASES.iter() {
        if set.patterns.iter().any(|re| re.is_match(body)) {
            return Some(set.verdict);
        }
    }
    if body.trim().len() < 100 {
        return Some(DetectionVerdict::Blocked);
    }
    None
}

fn rolling_rate(window: &VecDeque<bool>, min_samples: usize) -> f64 {
    if window.is_empty() || window.len() < min_samples {
        return 0.0;
    }
    window.iter().filter(|hostile| **hostile).count() as f64 / window.len() as f64
}

/// Pure level derivation from consecutive blocks and rolling block rate.
fn derive_level(config: &DetectionConfig, blocks: u32, rate: f64) -> AnticrawlerLevel {
    if blocks >= config.extreme_blocks || rate > config.extreme_rate {
        AnticrawlerLevel::Extreme
    } else if blocks >= config.high_blocks || rate > config.high_rate {
        AnticrawlerLevel::High
    } else if blocks >= config.medium_blocks || rate > config.medium_rate {
        AnticrawlerLevel::Medium
    } else if blocks >= config.low_blocks || rate > config.low_rate {
        AnticrawlerLevel::Low
    } else {
        AnticrawlerLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    struct Fixture {
        url: Url,
        headers: HeaderMap,
        body: String,
        status: u16,
        elapsed: Duration,
    }

    impl Fixture {
        fn new(status: u16, body: &str) -> Self {
            Self {
                url: Url::parse("https://flk.example.gov/api").unwrap(),
                headers: HeaderMap::new(),
                body: body.to_string(),
                status,
                elapsed: Duration::from_secs(1),
            }
        }

        fn with_header(mut self, name: &'static str, value: &str) -> Self {
            self.headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
            self
        }

        fn with_elapsed(mut self, elapsed: Duration) -> Self {
            self.elapsed = elapsed;
            self
        }

        fn response(&self) -> ObservedResponse<'_> {
            ObservedResponse {
                url: &self.url,
                status: self.status,
                headers: &self.headers,
                body: &self.body,
                elapsed: self.elapsed,
            }
        }
    }

    fn long_body() -> String {
        "regular searchable catalogue content ".repeat(20)
    }

    #[test]
    fn status_codes_classify_first() {
        let analyzer = ResponseAnalyzer::default();
        let cases = [
            (429, DetectionVerdict::RateLimited),
            (503, DetectionVerdict::RateLimited),
            (403, DetectionVerdict::IpBanned),
            (451, DetectionVerdict::IpBanned),
            (521, DetectionVerdict::Blocked),
        ];
        for (status, expected) in cases {
            let fixture = Fixture::new(status, &long_body());
            let (verdict, _) = analyzer.classify(&fixture.response());
            assert_eq!(verdict, expected, "status {status}");
        }
    }

    #[test]
    fn challenge_headers_beat_body_content() {
        let analyzer = ResponseAnalyzer::default();
        let fixture = Fixture::new(200, &long_body()).with_header("cf-ray", "8a2f-NRT");
        let (verdict, _) = analyzer.classify(&fixture.response());
        assert_eq!(verdict, DetectionVerdict::CloudflareChallenge);
    }

    #[test]
    fn body_phrases_classify_in_specificity_order() {
        let analyzer = ResponseAnalyzer::default();
        let padding = long_body();
        let cases = [
            ("请输入验证码以继续", DetectionVerdict::Captcha),
            ("Too many requests, slow down", DetectionVerdict::RateLimited),
            ("Request rejected by web application firewall", DetectionVerdict::WafDetected),
            ("访问被拒绝", DetectionVerdict::Blocked),
        ];
        for (phrase, expected) in cases {
            let body = format!("{padding}{phrase}");
            let fixture = Fixture::new(200, &body);
            let (verdict, _) = analyzer.classify(&fixture.response());
            assert_eq!(verdict, expected, "phrase {phrase:?}");
        }
    }

    #[test]
    fn instant_tiny_response_reads_as_blocked() {
        let analyzer = ResponseAnalyzer::default();
        let canned = format!("<html><body>unavailable</body></html>{}", " x".repeat(60));
        let fixture = Fixture::new(200, &canned).with_elapsed(Duration::from_millis(20));
        let (verdict, _) = analyzer.classify(&fixture.response());
        assert_eq!(verdict, DetectionVerdict::Blocked);
    }

    #[test]
    fn very_slow_response_reads_as_throttling() {
        let analyzer = ResponseAnalyzer::default();
        let fixture = Fixture::new(200, &long_body()).with_elapsed(Duration::from_secs(45));
        let (verdict, _) = analyzer.classify(&fixture.response());
        assert_eq!(verdict, DetectionVerdict::RateLimited);
    }

    #[test]
    fn level_never_decreases_during_block_run_and_resets_on_normal() {
        let analyzer = ResponseAnalyzer::default();
        let blocked = Fixture::new(403, &long_body());
        let mut previous = AnticrawlerLevel::None;
        for _ in 0..12 {
            let (_, level) = analyzer.classify(&blocked.response());
            assert!(level >= previous);
            previous = level;
        }
        assert_eq!(previous, AnticrawlerLevel::Extreme);

        let normal = Fixture::new(200, &long_body());
        analyzer.classify(&normal.response());
        assert_eq!(analyzer.metrics().consecutive_blocks, 0);
    }

    #[test]
    fn rotation_and_ban_signals_fire_at_their_thresholds() {
        let analyzer = ResponseAnalyzer::default();
        let blocked = Fixture::new(429, &long_body());

        assert!(!analyzer.should_rotate_identity());
        for _ in 0..3 {
            analyzer.classify(&blocked.response());
        }
        assert!(analyzer.should_rotate_identity());
        assert!(!analyzer.should_treat_as_banned());

        for _ in 0..2 {
            analyzer.classify(&blocked.response());
        }
        assert!(analyzer.should_treat_as_banned());
    }

    #[test]
    fn adaptive_delay_grows_with_level_and_stays_capped() {
        let analyzer = ResponseAnalyzer::default();
        let calm = analyzer.adaptive_delay(OperationKind::Search);
        assert!(calm <= analyzer.config.max_delay);

        let blocked = Fixture::new(403, &long_body());
        for _ in 0..12 {
            analyzer.classify(&blocked.response());
        }
        let hostile = analyzer.adaptive_delay(OperationKind::Retry);
        assert!(hostile > calm);
        assert!(hostile <= analyzer.config.max_delay);
    }

    #[test]
    fn per_site_breakdown_is_tracked() {
        let analyzer = ResponseAnalyzer::default();
        let fixture = Fixture::new(200, &long_body());
        analyzer.classify(&fixture.response());
        analyzer.classify(&Fixture::new(429, &long_body()).response());

        let metrics = analyzer.metrics();
        let site = metrics.site_stats.get("flk.example.gov").unwrap();
        assert_eq!(site.total, 2);
        assert_eq!(site.success, 1);
        assert_eq!(site.rate_limited, 1);
    }
}
