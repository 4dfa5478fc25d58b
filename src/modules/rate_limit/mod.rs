//! Per-domain request pacing.
//!
//! Enforces a minimum interval between consecutive requests that target the
//! same registered domain. Requests to a different domain than the previous
//! one go out immediately.

use std::time::Duration;

use tokio::time::Instant;

use crate::modules::retry::AbortSignal;
use crate::CarpetBagResult;

#[derive(Debug, Clone)]
struct LastRequest {
    at: Instant,
    domain: Option<String>,
}

/// Spaces out requests to the same registered domain.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    minimum_wait: Duration,
    last: Option<LastRequest>,
}

impl RateLimiter {
    pub fn new(minimum_wait: Duration) -> Self {
        Self {
            minimum_wait,
            last: None,
        }
    }

    pub fn minimum_wait(&self) -> Duration {
        self.minimum_wait
    }

    pub fn set_minimum_wait(&mut self, minimum_wait: Duration) {
        self.minimum_wait = minimum_wait;
    }

    /// Time the next request to `domain` still has to wait, measured at `now`.
    pub fn required_delay(&self, domain: Option<&str>, now: Instant) -> Duration {
        if self.minimum_wait.is_zero() {
            return Duration::ZERO;
        }

        let Some(last) = &self.last else {
            return Duration::ZERO;
        };

        if last.domain.as_deref() != domain {
            return Duration::ZERO;
        }

        let elapsed = now.saturating_duration_since(last.at);
        self.minimum_wait.saturating_sub(elapsed)
    }

    /// Suspends the caller until a request to `domain` is allowed.
    ///
    /// Returns the time actually spent waiting.
    pub async fn wait(&self, domain: Option<&str>, abort: &AbortSignal) -> CarpetBagResult<Duration> {
        let delay = self.required_delay(domain, Instant::now());
        if delay.is_zero() {
            return Ok(Duration::ZERO);
        }

        log::debug!(
            "sleeping {:.2}s before next request to {}",
            delay.as_secs_f64(),
            domain.unwrap_or("<unknown>")
        );
        abort.sleep(delay).await?;
        Ok(delay)
    }

    /// Stamps the completion of a request to `domain`.
    pub fn record(&mut self, domain: Option<&str>) {
        self.last = Some(LastRequest {
            at: Instant::now(),
            domain: domain.map(str::to_string),
        });
    }

    pub fn last_domain(&self) -> Option<&str> {
        self.last.as_ref().and_then(|last| last.domain.as_deref())
    }
}
