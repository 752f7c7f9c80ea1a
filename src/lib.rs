//! # lexfetch
//!
//! Resilient multi-source acquisition engine for regulatory-document
//! records. Resolves a human-supplied document name to a canonical record
//! despite inconsistent naming, partial source outages, and active
//! scraping countermeasures.
//!
//! ## Features
//!
//! - Priority-ordered acquisition strategies with sequential fallback and
//!   phased-parallel batch execution
//! - Network identity pool (direct + proxied egress) with tiered health
//!   scoring, rotation, and bounded-concurrency health sweeps
//! - Anti-detection response analyzer driving adaptive throttling,
//!   identity rotation, and strategy escalation
//! - Fuzzy match resolver with validity-first candidate selection
//!
//! ## Example
//!
//! ```no_run
//! use lexfetch::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::builder().build()?;
//!     let result = engine.acquire("中华人民共和国统计法").await;
//!     println!("found={} via {:?}", result.found, result.strategy);
//!     Ok(())
//! }
//! ```

mod engine;

pub mod config;
pub mod modules;
pub mod net;
pub mod strategies;

pub use crate::engine::{AcquisitionResult, Engine, EngineBuilder, EngineError, RecordSink};

pub use crate::config::{ConfigError, EngineSettings};

pub use crate::net::{FetchedPage, NetClient, NetConfig, NetError};

pub use crate::strategies::{
    AcquisitionStrategy,
    BrowserSearchConfig,
    BrowserSearchStrategy,
    DirectUrlStrategy,
    RawRecord,
    StatuteApiStrategy,
    StrategyError,
    StrategyKind,
    WebSearchStrategy,
};

pub use crate::modules::{
    AnticrawlerLevel,
    DetectionConfig,
    DetectionMetrics,
    DetectionVerdict,
    EngineEvent,
    EventDispatcher,
    EventHandler,
    FeedSource,
    IdentityConfig,
    IdentityDiscovery,
    IdentityPool,
    IdentityTier,
    LoggingHandler,
    MatchCandidate,
    MatchResolver,
    NetworkIdentity,
    ObservedResponse,
    OperationKind,
    PoolStats,
    ProxyProtocol,
    ResolverConfig,
    ResponseAnalyzer,
    Validity,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
