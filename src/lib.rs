//! # carpetbag-rs
//!
//! Resilient HTTP request orchestration for scrapers and crawlers.
//!
//! Every call goes through a per-domain rate limiter, is recorded in a
//! request manifest, and is retried according to the kind of failure it hit:
//! proxy failures rotate to another public proxy, SSL failures may be retried
//! without verification, connection failures are retried up to a bound and
//! truncated bodies swap proxies.
//!
//! ## Features
//!
//! - Async client built on reqwest and tokio
//! - Public proxy bags filtered by continent, with random or ranked rotation
//! - Per registered domain request pacing
//! - Bounded request manifest for auditing attempts and errors
//! - Optional proxy usage reports
//! - Cancellation and per-call deadlines
//!
//! ## Example
//!
//! ```no_run
//! use carpetbag_rs::CarpetBag;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut bag = CarpetBag::builder()
//!         .with_minimum_wait(Duration::from_secs(2))
//!         .build()?;
//!     bag.use_random_public_proxy(&["North America"]).await?;
//!     let response = bag.get("https://example.com").await?;
//!     println!("{} {}", response.status(), response.text());
//!     Ok(())
//! }
//! ```

mod carpetbag;

pub mod config;
pub mod modules;
pub mod remote;
pub mod transport;
pub mod urls;
pub mod user_agents;

pub use crate::carpetbag::{
    CarpetBag,
    CarpetBagBuilder,
    CarpetBagError,
    CarpetBagResult,
    Response,
};

pub use crate::config::{CarpetBagConfig, ConfigError};

pub use crate::modules::{
    AbortSignal,
    Continent,
    DispatchEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    ManifestEntry,
    ManifestRecorder,
    Payload,
    ProxyBag,
    ProxyBagError,
    ProxyQuery,
    ProxyRecord,
    RotationStrategy,
    UsageReport,
};

pub use crate::remote::{ProxySupply, RemoteServiceError, RemoteServices, TelemetrySink};

pub use crate::transport::{
    FailureKind,
    ReqwestTransport,
    Transport,
    TransportFailure,
    TransportRequest,
    TransportResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
