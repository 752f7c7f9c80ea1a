//! Engine event stream.
//!
//! Broadcasts orchestration activity to registered handlers so logging,
//! metrics, and tests can observe the engine without being wired into it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    TargetStarted {
        target: String,
        timestamp: DateTime<Utc>,
    },
    StrategyAttempt {
        target: String,
        strategy: &'static str,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StrategyFailed {
        target: String,
        strategy: &'static str,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Ban signal forced a jump past the remaining fast strategies.
    Escalated {
        target: Option<String>,
        from: &'static str,
        to: &'static str,
        timestamp: DateTime<Utc>,
    },
    TargetResolved {
        target: String,
        strategy: &'static str,
        elapsed: Duration,
        timestamp: DateTime<Utc>,
    },
    TargetMissed {
        target: String,
        elapsed: Duration,
        timestamp: DateTime<Utc>,
    },
    PhaseStarted {
        strategy: &'static str,
        pending_targets: usize,
        timestamp: DateTime<Utc>,
    },
    PhaseFinished {
        strategy: &'static str,
        resolved_targets: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::TargetStarted { target, .. } => {
                log::debug!("target start: {target}");
            }
            EngineEvent::StrategyAttempt {
                target,
                strategy,
                attempt,
                ..
            } => {
                log::debug!("{target}: {strategy} attempt {attempt}");
            }
            EngineEvent::StrategyFailed {
                target,
                strategy,
                reason,
                ..
            } => {
                log::info!("{target}: {strategy} failed ({reason})");
            }
            EngineEvent::Escalated { target, from, to, .. } => match target {
                Some(target) => log::warn!("{target}: ban signal, escalating {from} -> {to}"),
                None => log::warn!("ban signal, escalating {from} -> {to}"),
            },
            EngineEvent::TargetResolved {
                target,
                strategy,
                elapsed,
                ..
            } => {
                log::info!(
                    "{target}: resolved via {strategy} in {:.2}s",
                    elapsed.as_secs_f64()
                );
            }
            EngineEvent::TargetMissed { target, elapsed, .. } => {
                log::warn!("{target}: not found after {:.2}s", elapsed.as_secs_f64());
            }
            EngineEvent::PhaseStarted {
                strategy,
                pending_targets,
                ..
            } => {
                log::info!("phase {strategy}: {pending_targets} pending targets");
            }
            EngineEvent::PhaseFinished {
                strategy,
                resolved_targets,
                ..
            } => {
                log::info!("phase {strategy}: resolved {resolved_targets}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(EngineEvent::TargetStarted {
            target: "Statistics Law".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }
}
