//! Event hooks around request dispatch.
//!
//! The orchestrator and retry engine emit events for every attempt, retry,
//! rotation and terminal failure. Handlers can log them, feed metrics, or
//! drive custom reactions.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::transport::FailureKind;

/// Emitted right before a transport attempt goes out.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub attempt: u32,
    pub proxy: Option<String>,
    pub verify_tls: bool,
    pub timestamp: DateTime<Utc>,
}

/// Emitted once a dispatch returned a response.
#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub attempts: u32,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub kind: FailureKind,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyRotatedEvent {
    pub previous: Option<String>,
    pub next: String,
    pub reason: FailureKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub url: Url,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    Retry(RetryEvent),
    ProxyRotated(ProxyRotatedEvent),
    Failure(FailureEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DispatchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: DispatchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::PreRequest(pre) => {
                log::debug!(
                    "-> {} {} attempt={} proxy={} verify={}",
                    pre.method,
                    pre.url,
                    pre.attempt,
                    pre.proxy.as_deref().unwrap_or("none"),
                    pre.verify_tls
                );
            }
            DispatchEvent::PostResponse(post) => {
                log::debug!(
                    "<- {} {} -> {} after {} attempt(s) ({:.2}s)",
                    post.method,
                    post.url,
                    post.status,
                    post.attempts,
                    post.latency.as_secs_f64()
                );
            }
            DispatchEvent::Retry(retry) => {
                log::warn!(
                    "retry {} attempt {} after {} in {:.2}s",
                    retry.url,
                    retry.attempt,
                    retry.kind,
                    retry.scheduled_after.as_secs_f64()
                );
            }
            DispatchEvent::ProxyRotated(rotated) => {
                log::info!(
                    "proxy rotated {} -> {} ({})",
                    rotated.previous.as_deref().unwrap_or("none"),
                    rotated.next,
                    rotated.reason
                );
            }
            DispatchEvent::Failure(failure) => {
                log::error!(
                    "request {} failed after {} attempt(s): {}",
                    failure.url,
                    failure.attempts,
                    failure.error
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &DispatchEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(DispatchEvent::Failure(FailureEvent {
            url: Url::parse("https://example.com").unwrap(),
            error: "timeout".into(),
            attempts: 1,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }
}
