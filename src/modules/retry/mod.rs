//! Failure classification and retry loop.
//!
//! Each transport failure is matched against [`RetryPolicy::decide`], which
//! either schedules another attempt (optionally after a pause and/or a proxy
//! rotation) or declares the dispatch exhausted. The loop is iterative and
//! checks an [`AbortSignal`] before every attempt and during every pause.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::modules::dispatcher::{OutboundCall, RequestDispatcher};
use crate::modules::events::{
    DispatchEvent, EventDispatcher, PreRequestEvent, ProxyRotatedEvent, RetryEvent,
};
use crate::modules::manifest::{EntryHandle, ManifestRecorder};
use crate::modules::proxy::{ProxyBagError, ProxyRecord, ProxyRotationManager};
use crate::transport::{FailureKind, TransportFailure, TransportResponse};
use crate::{CarpetBagError, CarpetBagResult};

pub const DEFAULT_PROXY_ERROR_WAIT: Duration = Duration::from_secs(5);

/// Cancellation token plus optional deadline threaded through a dispatch.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl AbortSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn check(&self) -> CarpetBagResult<()> {
        if self.token.is_cancelled() {
            return Err(CarpetBagError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(CarpetBagError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleeps for `duration` unless cancelled or the deadline hits first.
    pub async fn sleep(&self, duration: Duration) -> CarpetBagResult<()> {
        self.check()?;
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if deadline < wake => {
                tokio::select! {
                    _ = self.token.cancelled() => Err(CarpetBagError::Cancelled),
                    _ = sleep_until(deadline) => Err(CarpetBagError::DeadlineExceeded),
                }
            }
            _ => {
                tokio::select! {
                    _ = self.token.cancelled() => Err(CarpetBagError::Cancelled),
                    _ = sleep_until(wake) => Ok(()),
                }
            }
        }
    }

    /// Drives `future` to completion unless cancelled or out of time.
    pub async fn run<F: Future>(&self, future: F) -> CarpetBagResult<F::Output> {
        self.check()?;
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CarpetBagError::Cancelled),
            _ = expiry => Err(CarpetBagError::DeadlineExceeded),
            output = future => Ok(output),
        }
    }
}

/// Knobs consulted by the transition table.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub random_proxy_bag: bool,
    pub retry_on_proxy_failure: bool,
    pub ssl_verify: bool,
    /// Upper bound on total attempts after connection failures; 0 disables
    /// retrying them.
    pub retries_on_connection_failure: u32,
    pub wait_on_connection_error: Duration,
    pub proxy_error_wait: Duration,
    /// Optional cap on retries triggered by proxy and truncated-body
    /// failures. `None` keeps retrying until cancelled.
    pub max_rotation_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            random_proxy_bag: false,
            retry_on_proxy_failure: true,
            ssl_verify: true,
            retries_on_connection_failure: 5,
            wait_on_connection_error: Duration::ZERO,
            proxy_error_wait: DEFAULT_PROXY_ERROR_WAIT,
            max_rotation_attempts: None,
        }
    }
}

/// What to do after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retry { wait: Duration, rotate: bool },
    Exhausted,
}

impl RetryPolicy {
    /// The transition table.
    ///
    /// `verified` tells whether the failed attempt had TLS verification on.
    pub fn decide(&self, context: &RetryContext, kind: FailureKind, verified: bool) -> Transition {
        match kind {
            FailureKind::Proxy => {
                if !self.retry_on_proxy_failure || self.proxy_retries_spent(context) {
                    Transition::Exhausted
                } else if self.random_proxy_bag {
                    Transition::Retry {
                        wait: Duration::ZERO,
                        rotate: true,
                    }
                } else {
                    Transition::Retry {
                        wait: self.proxy_error_wait,
                        rotate: false,
                    }
                }
            }
            FailureKind::Ssl => {
                if verified && !self.ssl_verify {
                    Transition::Retry {
                        wait: Duration::ZERO,
                        rotate: false,
                    }
                } else {
                    Transition::Exhausted
                }
            }
            FailureKind::Connection => {
                let next_attempt = context.attempt + 1;
                if self.retries_on_connection_failure == 0
                    || next_attempt >= self.retries_on_connection_failure
                {
                    Transition::Exhausted
                } else {
                    Transition::Retry {
                        wait: self.wait_on_connection_error,
                        rotate: self.random_proxy_bag,
                    }
                }
            }
            FailureKind::ChunkedEncoding => {
                if self.random_proxy_bag && !self.proxy_retries_spent(context) {
                    Transition::Retry {
                        wait: Duration::ZERO,
                        rotate: true,
                    }
                } else {
                    Transition::Exhausted
                }
            }
            FailureKind::TooLarge | FailureKind::Other => Transition::Exhausted,
        }
    }

    fn proxy_retries_spent(&self, context: &RetryContext) -> bool {
        self.max_rotation_attempts
            .is_some_and(|max| context.proxy_retries >= max)
    }
}

/// Per-dispatch retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Zero-based attempt number. Truncated-body retries re-enter the same
    /// attempt, so they neither spend the connection bound nor relax TLS.
    pub attempt: u32,
    pub errors: Vec<FailureKind>,
    /// Proxy used by the most recent send.
    pub proxy: Option<ProxyRecord>,
    pub rotations: u32,
    pub proxy_retries: u32,
    pub chunked_retries: u32,
}

impl RetryContext {
    pub fn attempts(&self) -> u32 {
        self.attempt + 1
    }

    /// Transport calls made so far, truncated-body resends included.
    pub fn sends(&self) -> u32 {
        self.attempts() + self.chunked_retries
    }
}

/// Successful outcome of the retry loop.
#[derive(Debug)]
pub struct Attempted {
    pub response: TransportResponse,
    pub context: RetryContext,
}

/// Failed outcome of the retry loop, with the bookkeeping up to the failure.
#[derive(Debug)]
pub struct Abandoned {
    pub error: CarpetBagError,
    pub context: RetryContext,
}

/// Drives attempts until success or exhaustion.
pub struct RetryEngine<'a> {
    pub dispatcher: &'a RequestDispatcher,
    pub proxies: &'a mut ProxyRotationManager,
    pub manifest: &'a mut ManifestRecorder,
    pub events: &'a EventDispatcher,
    pub policy: &'a RetryPolicy,
    pub abort: &'a AbortSignal,
}

impl RetryEngine<'_> {
    pub async fn run(mut self, call: &OutboundCall, entry: EntryHandle) -> Result<Attempted, Abandoned> {
        let mut context = RetryContext::default();
        match self.attempt_loop(call, entry, &mut context).await {
            Ok(response) => Ok(Attempted { response, context }),
            Err(error) => Err(Abandoned { error, context }),
        }
    }

    async fn attempt_loop(
        &mut self,
        call: &OutboundCall,
        entry: EntryHandle,
        context: &mut RetryContext,
    ) -> CarpetBagResult<TransportResponse> {
        loop {
            self.abort.check()?;

            if self.policy.random_proxy_bag && !self.proxies.has_bag() {
                log::error!("random proxy bag enabled but the bag is empty");
                return Err(ProxyBagError::EmptyProxyBag.into());
            }

            let proxy = self.proxies.current().cloned();
            let verified = self.dispatcher.verify_tls(context.attempt, false);
            self.manifest
                .set_proxy(entry, proxy.as_ref().map(ProxyRecord::endpoint));
            context.proxy = proxy.clone();

            self.events.dispatch(DispatchEvent::PreRequest(PreRequestEvent {
                url: call.url.clone(),
                method: call.method.clone(),
                attempt: context.attempt,
                proxy: proxy.as_ref().map(ProxyRecord::endpoint),
                verify_tls: verified,
                timestamp: Utc::now(),
            }));

            let outcome = self
                .abort
                .run(self.dispatcher.send(call, context.attempt, proxy.as_ref(), false))
                .await?;

            let failure = match outcome {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            context.errors.push(failure.kind);
            self.manifest.record_error(entry, failure.kind);
            self.log_failure(call, context, &failure, verified);

            let (wait, rotate) = match self.policy.decide(context, failure.kind, verified) {
                Transition::Exhausted => {
                    // Leave the next dispatch on a fresh proxy.
                    if failure.kind == FailureKind::Connection && self.policy.random_proxy_bag {
                        if let Err(err) = self.rotate(context, proxy.as_ref(), failure.kind) {
                            log::warn!("could not rotate proxy after connection failure: {err}");
                        }
                    }
                    return Err(CarpetBagError::exhausted(
                        failure,
                        &call.url,
                        context.attempts(),
                    ));
                }
                Transition::Retry { wait, rotate } => (wait, rotate),
            };

            if rotate {
                self.rotate(context, proxy.as_ref(), failure.kind)?;
            }

            match failure.kind {
                FailureKind::ChunkedEncoding => {
                    context.proxy_retries += 1;
                    context.chunked_retries += 1;
                }
                FailureKind::Proxy => {
                    context.proxy_retries += 1;
                    context.attempt += 1;
                }
                _ => context.attempt += 1,
            }
            self.manifest.set_attempts(entry, context.sends());

            self.events.dispatch(DispatchEvent::Retry(RetryEvent {
                url: call.url.clone(),
                attempt: context.attempt,
                kind: failure.kind,
                scheduled_after: wait,
                timestamp: Utc::now(),
            }));

            if !wait.is_zero() {
                self.abort.sleep(wait).await?;
            }
        }
    }

    fn rotate(
        &mut self,
        context: &mut RetryContext,
        previous: Option<&ProxyRecord>,
        reason: FailureKind,
    ) -> CarpetBagResult<()> {
        let next = self.proxies.rotate()?.endpoint();
        context.rotations += 1;
        self.events
            .dispatch(DispatchEvent::ProxyRotated(ProxyRotatedEvent {
                previous: previous.map(ProxyRecord::endpoint),
                next,
                reason,
                timestamp: Utc::now(),
            }));
        Ok(())
    }

    fn log_failure(
        &self,
        call: &OutboundCall,
        context: &RetryContext,
        failure: &TransportFailure,
        verified: bool,
    ) {
        match failure.kind {
            FailureKind::Proxy if self.policy.random_proxy_bag => {
                log::debug!("hit a proxy error, picking a new one from the proxy bag");
            }
            FailureKind::Proxy => {
                log::debug!(
                    "hit a proxy error, sleeping {:.0}s and continuing",
                    self.policy.proxy_error_wait.as_secs_f64()
                );
            }
            FailureKind::Ssl => {
                log::warn!("received an SSL error from {}", call.url);
                if verified && !self.policy.ssl_verify {
                    log::warn!("re-running request without SSL cert verification");
                } else {
                    log::error!(
                        "SSL certificate could not be verified; call use_skip_ssl_verify() to allow unverified retries"
                    );
                }
            }
            FailureKind::Connection => {
                log::error!("unable to connect to: {}", call.url);
                log::warn!(
                    "attempt {} of {}",
                    context.attempts(),
                    self.policy.retries_on_connection_failure
                );
            }
            FailureKind::ChunkedEncoding => {
                log::warn!("hit a truncated response from {}, proxy may be too slow", call.url);
            }
            FailureKind::TooLarge => {
                log::error!("{} from {}", failure.message, call.url);
            }
            FailureKind::Other => {
                log::error!("transport failure for {}: {}", call.url, failure.message);
            }
        }
    }
}
