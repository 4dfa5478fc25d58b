//! Request pipeline building blocks
//!
//! Pacing, auditing, proxy rotation, single-attempt dispatch, the retry
//! state machine, usage reporting and the event hooks tying them together.

pub mod dispatcher;
pub mod events;
pub mod manifest;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod usage;

// Re-export commonly used types
pub use dispatcher::{OutboundCall, Payload, RequestDispatcher};
pub use events::{
    DispatchEvent, EventDispatcher, EventHandler, FailureEvent, LoggingHandler, PostResponseEvent,
    PreRequestEvent, ProxyRotatedEvent, RetryEvent,
};
pub use manifest::{EntryHandle, ManifestEntry, ManifestRecorder, ManifestResponse};
pub use proxy::{
    Continent, LoadBagError, ProxyBag, ProxyBagError, ProxyFilter, ProxyQuery, ProxyRecord,
    ProxyRotationManager, RotationStrategy, validate_continents,
};
pub use rate_limit::RateLimiter;
pub use retry::{
    Abandoned, AbortSignal, Attempted, RetryContext, RetryEngine, RetryPolicy, Transition,
};
pub use usage::{UsageReport, UsageReporter};
