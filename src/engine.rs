//! Strategy orchestration.
//!
//! Composes the identity pool, response analyzer, match resolver, and a
//! priority-ordered set of acquisition strategies into a single
//! `acquire` operation, with sequential fallback per target and
//! phased-parallel batch execution.

use chrono::Utc;
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::config::{ConfigError, EngineSettings};
use crate::modules::detection::{OperationKind, ResponseAnalyzer};
use crate::modules::events::{EngineEvent, EventDispatcher, EventHandler, LoggingHandler};
use crate::modules::identity::{IdentityPool, NetworkIdentity};
use crate::modules::resolver::MatchResolver;
use crate::net::NetClient;
use crate::strategies::{
    AcquisitionStrategy, BrowserSearchConfig, BrowserSearchStrategy, DirectUrlStrategy, RawRecord,
    StatuteApiStrategy, StrategyError, WebSearchStrategy,
};

/// Startup-only failures; a running engine never raises these.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Per-target outcome. Immutable after creation; a missing record is a
/// recorded miss, never an error.
#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    pub target: String,
    pub found: bool,
    pub record: Option<RawRecord>,
    pub strategy: Option<&'static str>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl AcquisitionResult {
    fn resolved(target: &str, record: RawRecord, strategy: &'static str, elapsed: Duration) -> Self {
        Self {
            target: target.to_string(),
            found: true,
            record: Some(record),
            strategy: Some(strategy),
            elapsed,
            error: None,
        }
    }

    fn missed(target: &str, elapsed: Duration, error: Option<String>) -> Self {
        Self {
            target: target.to_string(),
            found: false,
            record: None,
            strategy: None,
            elapsed,
            error,
        }
    }
}

/// Persistence collaborator. Receives every result; the engine does not
/// know the storage schema.
pub trait RecordSink: Send + Sync {
    fn store(&self, result: &AcquisitionResult);
}

/// Terminal state of one target's fallback walk.
enum ChainOutcome {
    Resolved(RawRecord, &'static str),
    Exhausted,
    TimedOut,
}

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
    settings: EngineSettings,
    identities: Vec<NetworkIdentity>,
    strategies: Vec<Arc<dyn AcquisitionStrategy>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    sink: Option<Arc<dyn RecordSink>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            settings: EngineSettings::default(),
            identities: Vec::new(),
            strategies: Vec::new(),
            handlers: Vec::new(),
            sink: None,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_identities<I>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = NetworkIdentity>,
    {
        self.identities.extend(identities);
        self
    }

    /// Register a strategy implementation. When none are registered the
    /// builder instantiates the built-in set.
    pub fn register_strategy(mut self, strategy: Arc<dyn AcquisitionStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.settings.validate()?;

        let pool = Arc::new(IdentityPool::with_identities(
            self.settings.identity.clone(),
            self.identities,
        ));
        let analyzer = Arc::new(ResponseAnalyzer::new(self.settings.detection.clone()));
        let net = Arc::new(NetClient::new(
            self.settings.net.clone(),
            Arc::clone(&pool),
            Arc::clone(&analyzer),
        ));

        let registry: Vec<Arc<dyn AcquisitionStrategy>> = if self.strategies.is_empty() {
            vec![
                Arc::new(StatuteApiStrategy::new(Arc::clone(&net))),
                Arc::new(DirectUrlStrategy::new(
                    Arc::clone(&net),
                    self.settings.known_urls.clone(),
                )),
                Arc::new(WebSearchStrategy::new(Arc::clone(&net))),
                Arc::new(BrowserSearchStrategy::new(
                    BrowserSearchConfig::default(),
                    Arc::clone(&analyzer),
                )),
            ]
        } else {
            self.strategies
        };

        let mut ordered = Vec::with_capacity(self.settings.strategy_order.len());
        for name in &self.settings.strategy_order {
            let strategy = registry
                .iter()
                .find(|s| s.name() == name.as_str())
                .cloned()
                .ok_or_else(|| ConfigError::UnknownStrategy(name.clone()))?;
            ordered.push(strategy);
        }

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        for handler in self.handlers {
            events.register_handler(handler);
        }

        Ok(Engine {
            resolver: MatchResolver::new(self.settings.resolver.clone()),
            settings: self.settings,
            strategies: ordered,
            pool,
            analyzer,
            events: Arc::new(events),
            sink: self.sink,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The acquisition engine.
pub struct Engine {
    settings: EngineSettings,
    strategies: Vec<Arc<dyn AcquisitionStrategy>>,
    pool: Arc<IdentityPool>,
    analyzer: Arc<ResponseAnalyzer>,
    resolver: MatchResolver,
    events: Arc<EventDispatcher>,
    sink: Option<Arc<dyn RecordSink>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.pool
    }

    pub fn analyzer(&self) -> &Arc<ResponseAnalyzer> {
        &self.analyzer
    }

    fn is_enabled(&self, strategy: &Arc<dyn AcquisitionStrategy>) -> bool {
        !self.settings.disabled_strategies.contains(strategy.name())
    }

    /// Index of the next enabled stealth strategy after `after`, if any.
    fn next_stealth_index(&self, after: usize) -> Option<usize> {
        self.strategies
            .iter()
            .enumerate()
            .skip(after + 1)
            .find(|(_, strategy)| strategy.kind().stealthy() && self.is_enabled(strategy))
            .map(|(idx, _)| idx)
    }

    /// Acquire a single target: sequential fallback over the strategy
    /// priority list. Always returns a result; exhaustion is a miss.
    pub async fn acquire(&self, target: &str) -> AcquisitionResult {
        let started = Instant::now();
        self.events.dispatch(EngineEvent::TargetStarted {
            target: target.to_string(),
            timestamp: Utc::now(),
        });
        self.pool.refresh_if_stale().await;

        let deadline = Instant::now() + self.settings.target_timeout;
        let outcome = self.fallback_chain(target, deadline).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            ChainOutcome::Resolved(record, strategy) => {
                AcquisitionResult::resolved(target, record, strategy, elapsed)
            }
            ChainOutcome::Exhausted => AcquisitionResult::missed(target, elapsed, None),
            ChainOutcome::TimedOut => AcquisitionResult::missed(
                target,
                elapsed,
                Some("target timed out".to_string()),
            ),
        };

        self.finish(&result);
        result
    }

    /// Walk strategies in priority order, honoring disable flags, the
    /// per-target deadline, and the ban-signal escalation shortcut.
    async fn fallback_chain(&self, target: &str, deadline: Instant) -> ChainOutcome {
        let mut index = 0;
        while index < self.strategies.len() {
            let strategy = &self.strategies[index];
            if !self.is_enabled(strategy) {
                log::debug!("{target}: skipping disabled strategy {}", strategy.name());
                index += 1;
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ChainOutcome::TimedOut;
            }

            match self.run_strategy(strategy, target, remaining).await {
                Ok(Some(record)) => return ChainOutcome::Resolved(record, strategy.name()),
                Ok(None) => {}
                Err(reason) => {
                    self.events.dispatch(EngineEvent::StrategyFailed {
                        target: target.to_string(),
                        strategy: strategy.name(),
                        reason,
                        timestamp: Utc::now(),
                    });
                }
            }

            if deadline.saturating_duration_since(Instant::now()).is_zero() {
                return ChainOutcome::TimedOut;
            }

            // Ban signal: jump past the remaining fast strategies to the
            // next stealthy one instead of burning more requests.
            if self.analyzer.should_treat_as_banned() && !strategy.kind().stealthy() {
                if let Some(stealth) = self.next_stealth_index(index) {
                    if stealth > index + 1 {
                        self.events.dispatch(EngineEvent::Escalated {
                            target: Some(target.to_string()),
                            from: strategy.name(),
                            to: self.strategies[stealth].name(),
                            timestamp: Utc::now(),
                        });
                    }
                    index = stealth;
                    continue;
                }
            }

            index += 1;
        }
        ChainOutcome::Exhausted
    }

    /// Single-target strategy run including session lifecycle for
    /// session-holding strategies (a one-target "phase"). The timeout
    /// wraps only the attempts: the session is closed on every exit path,
    /// including abandonment on deadline.
    async fn run_strategy(
        &self,
        strategy: &Arc<dyn AcquisitionStrategy>,
        target: &str,
        remaining: Duration,
    ) -> Result<Option<RawRecord>, String> {
        let session_open = if strategy.supports_batch_session() {
            match strategy.open_session().await {
                Ok(()) => true,
                Err(err) => return Err(format!("session open failed: {err}")),
            }
        } else {
            false
        };

        let outcome = match timeout(remaining, self.run_strategy_attempts(strategy, target)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err("target timed out".to_string()),
        };

        if session_open {
            if let Err(err) = strategy.close_session().await {
                log::warn!("{}: session close failed: {err}", strategy.name());
            }
        }
        outcome
    }

    /// Bounded retry loop for one strategy on one target. Transient
    /// detection/network failures are retried with adaptive delays; a ban
    /// signal or a non-transient error ends the strategy immediately.
    async fn run_strategy_attempts(
        &self,
        strategy: &Arc<dyn AcquisitionStrategy>,
        target: &str,
    ) -> Result<Option<RawRecord>, String> {
        let max_attempts = self.settings.attempts_per_strategy;
        for attempt in 1..=max_attempts {
            self.events.dispatch(EngineEvent::StrategyAttempt {
                target: target.to_string(),
                strategy: strategy.name(),
                attempt,
                timestamp: Utc::now(),
            });

            match self.try_pipeline(strategy, target).await {
                Ok(found) => return Ok(found),
                Err(err) => {
                    let banned = self.analyzer.should_treat_as_banned();
                    if !err.is_transient() || banned || attempt == max_attempts {
                        return Err(err.to_string());
                    }
                    let delay = self.analyzer.adaptive_delay(OperationKind::Retry);
                    log::debug!(
                        "{target}: {} attempt {attempt} failed ({err}), retrying in {:.1}s",
                        strategy.name(),
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                }
            }
        }
        Err("attempts exhausted".to_string())
    }

    /// One search → resolve → fetch-detail pass.
    async fn try_pipeline(
        &self,
        strategy: &Arc<dyn AcquisitionStrategy>,
        target: &str,
    ) -> Result<Option<RawRecord>, StrategyError> {
        let candidates = strategy.search(target).await?;
        if candidates.is_empty() {
            log::debug!("{target}: {} returned no candidates", strategy.name());
            return Ok(None);
        }

        let Some(resolved) = self.resolver.resolve(target, &candidates) else {
            log::debug!(
                "{target}: {} produced {} candidates, none accepted",
                strategy.name(),
                candidates.len()
            );
            return Ok(None);
        };
        log::debug!(
            "{target}: accepted {:?} (score {:.2}, confirmed_valid={})",
            resolved.candidate.title,
            resolved.score,
            resolved.confirmed_valid
        );

        let record = strategy.fetch_detail(resolved.candidate).await?;
        Ok(Some(record))
    }

    /// Acquire a batch of targets in phases: one phase per strategy tier,
    /// each phase running the same strategy concurrently (bounded by the
    /// configured admission gate) over every still-unresolved target.
    ///
    /// Always returns one result per target, in input order; partial
    /// failure is a normal terminal state.
    pub async fn acquire_batch(&self, targets: &[String]) -> Vec<AcquisitionResult> {
        let mut slots: Vec<Option<AcquisitionResult>> = targets.iter().map(|_| None).collect();
        let mut spent: Vec<Duration> = vec![Duration::ZERO; targets.len()];

        for target in targets {
            self.events.dispatch(EngineEvent::TargetStarted {
                target: target.clone(),
                timestamp: Utc::now(),
            });
        }
        self.pool.refresh_if_stale().await;

        for strategy_index in 0..self.strategies.len() {
            let strategy = &self.strategies[strategy_index];
            if !self.is_enabled(strategy) {
                continue;
            }

            let pending: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(idx, slot)| {
                    slot.is_none() && spent[*idx] < self.settings.target_timeout
                })
                .map(|(idx, _)| idx)
                .collect();
            if pending.is_empty() {
                break;
            }

            // Phase-level escalation: under a ban signal skip remaining
            // fast phases when a stealthier one is still ahead.
            if self.analyzer.should_treat_as_banned() && !strategy.kind().stealthy() {
                if let Some(stealth) = self.next_stealth_index(strategy_index) {
                    self.events.dispatch(EngineEvent::Escalated {
                        target: None,
                        from: strategy.name(),
                        to: self.strategies[stealth].name(),
                        timestamp: Utc::now(),
                    });
                    continue;
                }
            }

            self.events.dispatch(EngineEvent::PhaseStarted {
                strategy: strategy.name(),
                pending_targets: pending.len(),
                timestamp: Utc::now(),
            });

            let session_open = if strategy.supports_batch_session() {
                match strategy.open_session().await {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!(
                            "phase {}: session open failed, skipping phase: {err}",
                            strategy.name()
                        );
                        continue;
                    }
                }
            } else {
                false
            };

            let outcomes: Vec<(usize, Result<Option<RawRecord>, String>, Duration)> =
                futures::stream::iter(pending.into_iter().map(|idx| {
                    let target = targets[idx].clone();
                    let remaining = self.settings.target_timeout.saturating_sub(spent[idx]);
                    async move {
                        let started = Instant::now();
                        let outcome =
                            match timeout(remaining, self.run_strategy_attempts(strategy, &target))
                                .await
                            {
                                Ok(outcome) => outcome,
                                Err(_) => Err("target timed out".to_string()),
                            };
                        (idx, outcome, started.elapsed())
                    }
                }))
                .buffer_unordered(self.settings.concurrency_limit)
                .collect()
                .await;

            let mut resolved_count = 0usize;
            for (idx, outcome, phase_elapsed) in outcomes {
                spent[idx] += phase_elapsed;
                match outcome {
                    Ok(Some(record)) => {
                        resolved_count += 1;
                        slots[idx] = Some(AcquisitionResult::resolved(
                            &targets[idx],
                            record,
                            strategy.name(),
                            spent[idx],
                        ));
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        self.events.dispatch(EngineEvent::StrategyFailed {
                            target: targets[idx].clone(),
                            strategy: strategy.name(),
                            reason,
                            timestamp: Utc::now(),
                        });
                    }
                }
            }

            // Guaranteed release: the phase session closes on every exit
            // path of the phase, success or not.
            if session_open {
                if let Err(err) = strategy.close_session().await {
                    log::warn!("phase {}: session close failed: {err}", strategy.name());
                }
            }

            self.events.dispatch(EngineEvent::PhaseFinished {
                strategy: strategy.name(),
                resolved_targets: resolved_count,
                timestamp: Utc::now(),
            });
        }

        let results: Vec<AcquisitionResult> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    let timed_out = spent[idx] >= self.settings.target_timeout;
                    AcquisitionResult::missed(
                        &targets[idx],
                        spent[idx],
                        timed_out.then(|| "target timed out".to_string()),
                    )
                })
            })
            .collect();

        for result in &results {
            self.finish(result);
        }
        results
    }

    /// Terminal bookkeeping shared by both modes: events plus handoff to
    /// the persistence collaborator.
    fn finish(&self, result: &AcquisitionResult) {
        if result.found {
            self.events.dispatch(EngineEvent::TargetResolved {
                target: result.target.clone(),
                strategy: result.strategy.unwrap_or("unknown"),
                elapsed: result.elapsed,
                timestamp: Utc::now(),
            });
        } else {
            self.events.dispatch(EngineEvent::TargetMissed {
                target: result.target.clone(),
                elapsed: result.elapsed,
                timestamp: Utc::now(),
            });
        }
        if let Some(sink) = &self.sink {
            sink.store(result);
        }
    }
}
