//! Engine settings.
//!
//! One immutable object supplied at startup; the engine never re-reads
//! configuration mid-run. Invalid settings are fatal at build time,
//! never later.

use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use crate::modules::detection::DetectionConfig;
use crate::modules::identity::IdentityConfig;
use crate::modules::resolver::ResolverConfig;
use crate::net::NetConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("strategy order is empty")]
    NoStrategies,
    #[error("unknown strategy in priority order: {0}")]
    UnknownStrategy(String),
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
    #[error("attempts per strategy must be at least 1")]
    ZeroAttempts,
    #[error("ban threshold ({ban}) must not be below rotation threshold ({rotate})")]
    BanBelowRotate { ban: u32, rotate: u32 },
    #[error("paid death threshold ({paid}) must exceed free death threshold ({free})")]
    PaidNotStricter { paid: u32, free: u32 },
    #[error("resolver acceptance threshold {0} outside (0, 1]")]
    BadAcceptThreshold(f64),
    #[error("timeout {name} must be non-zero")]
    ZeroTimeout { name: &'static str },
}

/// Immutable engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Strategy names in priority order, authoritative source first.
    pub strategy_order: Vec<String>,
    /// Strategies present in the order but skipped without being attempted.
    pub disabled_strategies: HashSet<String>,
    /// Counting admission gate for batch phases.
    pub concurrency_limit: usize,
    /// Bounded retry budget within one strategy for one target.
    pub attempts_per_strategy: u32,
    /// Covers all strategies attempted for one target.
    pub target_timeout: Duration,
    /// Known-URL table for the direct strategy.
    pub known_urls: Vec<(String, String)>,

    pub net: NetConfig,
    pub identity: IdentityConfig,
    pub detection: DetectionConfig,
    pub resolver: ResolverConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            strategy_order: vec![
                "statute_api".to_string(),
                "direct_url".to_string(),
                "web_search".to_string(),
                "browser_search".to_string(),
            ],
            disabled_strategies: HashSet::new(),
            concurrency_limit: 3,
            attempts_per_strategy: 3,
            target_timeout: Duration::from_secs(180),
            known_urls: Vec::new(),
            net: NetConfig::default(),
            identity: IdentityConfig::default(),
            detection: DetectionConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl EngineSettings {
    /// Validate the settings object. Called once at engine build; any
    /// error here is a startup failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy_order.is_empty() {
            return Err(ConfigError::NoStrategies);
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.attempts_per_strategy == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.target_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                name: "target_timeout",
            });
        }
        if self.net.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                name: "request_timeout",
            });
        }
        if self.detection.ban_after_blocks < self.detection.rotate_after_blocks {
            return Err(ConfigError::BanBelowRotate {
                ban: self.detection.ban_after_blocks,
                rotate: self.detection.rotate_after_blocks,
            });
        }
        if self.identity.paid_death_threshold <= self.identity.free_death_threshold {
            return Err(ConfigError::PaidNotStricter {
                paid: self.identity.paid_death_threshold,
                free: self.identity.free_death_threshold,
            });
        }
        let threshold = self.resolver.accept_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::BadAcceptThreshold(threshold));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert_eq!(EngineSettings::default().validate(), Ok(()));
    }

    #[test]
    fn invalid_settings_fail_at_startup() {
        let mut settings = EngineSettings::default();
        settings.strategy_order.clear();
        assert_eq!(settings.validate(), Err(ConfigError::NoStrategies));

        let mut settings = EngineSettings::default();
        settings.concurrency_limit = 0;
        assert_eq!(settings.validate(), Err(ConfigError::ZeroConcurrency));

        let mut settings = EngineSettings::default();
        settings.identity.paid_death_threshold = settings.identity.free_death_threshold;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::PaidNotStricter { .. })
        ));

        let mut settings = EngineSettings::default();
        settings.detection.ban_after_blocks = 1;
        settings.detection.rotate_after_blocks = 3;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::BanBelowRotate { .. })
        ));

        let mut settings = EngineSettings::default();
        settings.resolver.accept_threshold = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::BadAcceptThreshold(_))
        ));
    }
}
