//! Orchestrator behavior with scripted strategies: fallback order,
//! batch phasing, concurrency bounds, escalation, and session lifecycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use url::Url;

use lexfetch::{
    AcquisitionResult, AcquisitionStrategy, DetectionConfig, Engine, EngineSettings,
    MatchCandidate, ObservedResponse, RawRecord, RecordSink, StrategyError, StrategyKind,
};

#[derive(Clone, Copy, PartialEq)]
enum Script {
    Found,
    Miss,
    Fail,
}

/// Scripted strategy with instrumentation counters.
struct MockStrategy {
    name: &'static str,
    kind: StrategyKind,
    batch_session: bool,
    script: Script,
    /// When set, `Found` applies only to these targets; others miss.
    only: Option<HashSet<String>>,
    work: Duration,
    searches: AtomicUsize,
    attempted: Mutex<Vec<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockStrategy {
    fn new(name: &'static str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind: StrategyKind::StructuredApi,
            batch_session: false,
            script,
            only: None,
            work: Duration::from_millis(1),
            searches: AtomicUsize::new(0),
            attempted: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    fn stealth(name: &'static str, script: Script) -> Arc<Self> {
        let mut mock = Self::unwrapped(name, script);
        mock.kind = StrategyKind::Browser;
        mock.batch_session = true;
        Arc::new(mock)
    }

    fn resolving_only(name: &'static str, targets: &[&str]) -> Arc<Self> {
        let mut mock = Self::unwrapped(name, Script::Found);
        mock.only = Some(targets.iter().map(|t| t.to_string()).collect());
        Arc::new(mock)
    }

    fn slow(name: &'static str, script: Script, work: Duration) -> Arc<Self> {
        let mut mock = Self::unwrapped(name, script);
        mock.work = work;
        Arc::new(mock)
    }

    fn unwrapped(name: &'static str, script: Script) -> Self {
        Self {
            name,
            kind: StrategyKind::StructuredApi,
            batch_session: false,
            script,
            only: None,
            work: Duration::from_millis(1),
            searches: AtomicUsize::new(0),
            attempted: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn attempted_targets(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcquisitionStrategy for MockStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn supports_batch_session(&self) -> bool {
        self.batch_session
    }

    async fn open_session(&self) -> Result<(), StrategyError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_session(&self) -> Result<(), StrategyError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, target: &str) -> Result<Vec<MatchCandidate>, StrategyError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.attempted.lock().unwrap().push(target.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.script {
            Script::Fail => Err(StrategyError::Parse("scripted failure".to_string())),
            Script::Miss => Ok(Vec::new()),
            Script::Found => {
                let resolves = self
                    .only
                    .as_ref()
                    .map(|targets| targets.contains(target))
                    .unwrap_or(true);
                if resolves {
                    Ok(vec![MatchCandidate::new(target, format!("{}-ref", self.name))])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    async fn fetch_detail(&self, candidate: &MatchCandidate) -> Result<RawRecord, StrategyError> {
        Ok(RawRecord::new(candidate.title.clone()))
    }
}

#[derive(Default)]
struct CollectingSink {
    results: Mutex<Vec<AcquisitionResult>>,
}

impl RecordSink for CollectingSink {
    fn store(&self, result: &AcquisitionResult) {
        self.results.lock().unwrap().push(result.clone());
    }
}

fn settings(order: &[&str]) -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.strategy_order = order.iter().map(|s| s.to_string()).collect();
    settings.attempts_per_strategy = 1;
    settings.detection = DetectionConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..Default::default()
    };
    settings
}

fn engine_with(
    order: &[&str],
    strategies: Vec<Arc<MockStrategy>>,
    configure: impl FnOnce(&mut EngineSettings),
) -> Engine {
    let mut settings = settings(order);
    configure(&mut settings);
    let mut builder = Engine::builder().with_settings(settings);
    for strategy in strategies {
        builder = builder.register_strategy(strategy);
    }
    builder.build().expect("engine builds")
}

/// Push enough hostile classifications into the analyzer to trip the
/// ban signal.
fn seed_ban_signal(engine: &Engine) {
    let url = Url::parse("https://blocked.example.gov/").unwrap();
    let headers = HeaderMap::new();
    let body = "regulatory catalogue placeholder text ".repeat(10);
    for _ in 0..engine.analyzer().config().ban_after_blocks {
        engine.analyzer().classify(&ObservedResponse {
            url: &url,
            status: 403,
            headers: &headers,
            body: &body,
            elapsed: Duration::from_secs(1),
        });
    }
    assert!(engine.analyzer().should_treat_as_banned());
}

#[tokio::test]
async fn fallback_walks_strategies_in_order_until_success() {
    let misser = MockStrategy::new("misser", Script::Miss);
    let failer = MockStrategy::new("failer", Script::Fail);
    let finder = MockStrategy::new("finder", Script::Found);

    let engine = engine_with(
        &["misser", "failer", "finder"],
        vec![misser.clone(), failer.clone(), finder.clone()],
        |_| {},
    );

    let result = engine.acquire("Consumer Protection Law").await;
    assert!(result.found);
    assert_eq!(result.strategy, Some("finder"));
    assert_eq!(misser.search_count(), 1);
    assert_eq!(failer.search_count(), 1);
    assert_eq!(finder.search_count(), 1);
}

#[tokio::test]
async fn disabled_strategies_are_skipped_without_being_attempted() {
    let first = MockStrategy::new("first", Script::Found);
    let second = MockStrategy::new("second", Script::Found);

    let engine = engine_with(
        &["first", "second"],
        vec![first.clone(), second.clone()],
        |settings| {
            settings.disabled_strategies.insert("first".to_string());
        },
    );

    let result = engine.acquire("Statistics Law").await;
    assert!(result.found);
    assert_eq!(result.strategy, Some("second"));
    assert_eq!(first.search_count(), 0);
}

#[tokio::test]
async fn exhaustion_is_a_miss_not_an_error() {
    let misser = MockStrategy::new("misser", Script::Miss);
    let failer = MockStrategy::new("failer", Script::Fail);

    let engine = engine_with(&["misser", "failer"], vec![misser, failer], |_| {});

    let result = engine.acquire("Nonexistent Regulation").await;
    assert!(!result.found);
    assert!(result.record.is_none());
}

#[tokio::test]
async fn batch_never_retries_targets_resolved_in_an_earlier_phase() {
    let partial = MockStrategy::resolving_only("partial", &["Accounting Law"]);
    let sweeper = MockStrategy::new("sweeper", Script::Found);

    let engine = engine_with(
        &["partial", "sweeper"],
        vec![partial.clone(), sweeper.clone()],
        |_| {},
    );

    let targets = vec!["Accounting Law".to_string(), "Tariff Law".to_string()];
    let results = engine.acquire_batch(&targets).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.found));
    assert_eq!(results[0].strategy, Some("partial"));
    assert_eq!(results[1].strategy, Some("sweeper"));

    // The second phase saw only the unresolved target.
    assert_eq!(sweeper.attempted_targets(), vec!["Tariff Law".to_string()]);
}

#[tokio::test]
async fn batch_concurrency_stays_within_the_admission_gate() {
    let finder = MockStrategy::slow("finder", Script::Found, Duration::from_millis(25));

    let engine = engine_with(&["finder"], vec![finder.clone()], |settings| {
        settings.concurrency_limit = 5;
    });

    let targets: Vec<String> = (0..20).map(|i| format!("Regulation {i}")).collect();
    let results = engine.acquire_batch(&targets).await;

    assert_eq!(results.iter().filter(|r| r.found).count(), 20);
    let peak = finder.peak_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight {peak} exceeded the limit");
    assert!(peak >= 2, "expected actual overlap, saw peak {peak}");
}

#[tokio::test]
async fn ban_signal_escalates_past_fast_strategies() {
    let fast = MockStrategy::new("fast", Script::Miss);
    let mid = MockStrategy::new("mid", Script::Found);
    let stealth = MockStrategy::stealth("stealth", Script::Found);

    let engine = engine_with(
        &["fast", "mid", "stealth"],
        vec![fast.clone(), mid.clone(), stealth.clone()],
        |_| {},
    );
    seed_ban_signal(&engine);

    let result = engine.acquire("Securities Law").await;
    assert!(result.found);
    assert_eq!(result.strategy, Some("stealth"));
    // The fast strategy ran once; the mid-priority one was jumped over.
    assert_eq!(fast.search_count(), 1);
    assert_eq!(mid.search_count(), 0);
}

#[tokio::test]
async fn ban_signal_skips_fast_phases_in_batch_mode() {
    let fast = MockStrategy::new("fast", Script::Found);
    let stealth = MockStrategy::stealth("stealth", Script::Found);

    let engine = engine_with(
        &["fast", "stealth"],
        vec![fast.clone(), stealth.clone()],
        |_| {},
    );
    seed_ban_signal(&engine);

    let targets = vec!["Audit Law".to_string()];
    let results = engine.acquire_batch(&targets).await;

    assert!(results[0].found);
    assert_eq!(results[0].strategy, Some("stealth"));
    assert_eq!(fast.search_count(), 0, "fast phase should be skipped under ban");
}

#[tokio::test]
async fn batch_session_opens_once_per_phase_and_always_closes() {
    let stealth = MockStrategy::stealth("stealth", Script::Found);

    let engine = engine_with(&["stealth"], vec![stealth.clone()], |settings| {
        settings.concurrency_limit = 2;
    });

    let targets: Vec<String> = (0..3).map(|i| format!("Decree {i}")).collect();
    let results = engine.acquire_batch(&targets).await;

    assert!(results.iter().all(|r| r.found));
    assert_eq!(stealth.opens.load(Ordering::SeqCst), 1);
    assert_eq!(stealth.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn session_closes_even_when_every_target_fails() {
    let stealth = MockStrategy::stealth("stealth", Script::Fail);

    let engine = engine_with(&["stealth"], vec![stealth.clone()], |_| {});

    let targets = vec!["Alpha".to_string(), "Beta".to_string()];
    let results = engine.acquire_batch(&targets).await;

    assert!(results.iter().all(|r| !r.found));
    assert_eq!(stealth.opens.load(Ordering::SeqCst), 1);
    assert_eq!(stealth.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_strategy_times_out_into_a_recorded_miss() {
    let stuck = MockStrategy::slow("stuck", Script::Found, Duration::from_millis(500));

    let engine = engine_with(&["stuck"], vec![stuck], |settings| {
        settings.target_timeout = Duration::from_millis(50);
    });

    let result = engine.acquire("Glacial Regulation").await;
    assert!(!result.found);
    assert_eq!(result.error.as_deref(), Some("target timed out"));
}

#[tokio::test]
async fn every_result_reaches_the_persistence_sink() {
    let partial = MockStrategy::resolving_only("partial", &["Accounting Law"]);
    let sink = Arc::new(CollectingSink::default());

    let settings = settings(&["partial"]);
    let engine = Engine::builder()
        .with_settings(settings)
        .register_strategy(partial)
        .with_sink(sink.clone())
        .build()
        .unwrap();

    let targets = vec!["Accounting Law".to_string(), "Unknown Law".to_string()];
    engine.acquire_batch(&targets).await;

    let stored = sink.results.lock().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored.iter().filter(|r| r.found).count(), 1);
}

#[tokio::test]
async fn unknown_strategy_in_priority_order_fails_at_build() {
    let finder = MockStrategy::new("finder", Script::Found);
    let outcome = Engine::builder()
        .with_settings(settings(&["finder", "ghost"]))
        .register_strategy(finder)
        .build();
    assert!(outcome.is_err());
}
