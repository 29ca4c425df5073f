//! The message queue protocol.
//!
//! `publish` claims a deduplication marker and appends to the pending list.
//! `process_message` leases one message by moving it pending → processing,
//! hands it to a handler, and routes it out of processing exactly once:
//! to the completed log or nowhere on success, to the failed log or nowhere
//! on failure (including a panicking handler).
//!
//! The routing rules live in [`QueueCore`] and are shared by the blocking
//! [`MessageQueue`] and the suspending [`AsyncMessageQueue`].

mod asyncio;
mod blocking;

pub use asyncio::AsyncMessageQueue;
pub use blocking::MessageQueue;

use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueSettings;
use crate::error::{Error, Result};
use crate::gateway::{AsyncGateway, AsyncRedisGateway, Gateway, GatewayOptions, RedisGateway};
use crate::interrupt::Interrupt;
use crate::keys::{DEFAULT_SEPARATOR, QueueKeys};
use crate::retry::RetryPolicy;

/// Derives a deduplication key from a serialized message.
pub type DedupKeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Terminal outcome of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Completed,
    Failed,
}

impl Disposition {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Failed => "failed",
        }
    }
}

/// Where a leased message goes when its lease ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route<'a> {
    Move { from: &'a str, to: &'a str },
    Remove { from: &'a str },
}

impl Route<'_> {
    /// Destination label for logs and spans.
    pub(crate) fn target(&self) -> &str {
        match self {
            Route::Move { to, .. } => *to,
            Route::Remove { .. } => "discarded",
        }
    }
}

/// Queue identity and routing rules, independent of the concurrency model.
#[derive(Clone)]
pub(crate) struct QueueCore {
    pub(crate) keys: QueueKeys,
    deduplication: bool,
    enable_completed_queue: bool,
    enable_failed_queue: bool,
    dedup_key_fn: Option<DedupKeyFn>,
}

impl QueueCore {
    /// Marker key for `message`, or `None` when deduplication is off.
    /// An explicit key wins over the configured key function.
    pub(crate) fn dedup_marker(&self, message: &str, explicit: Option<&str>) -> Option<String> {
        if !self.deduplication {
            return None;
        }
        let key = match (explicit, &self.dedup_key_fn) {
            (Some(key), _) => key.to_string(),
            (None, Some(f)) => f(message),
            (None, None) => message.to_string(),
        };
        Some(self.keys.deduplication(&key))
    }

    /// Failures always leave from processing, mirroring completion.
    pub(crate) fn route(&self, disposition: Disposition) -> Route<'_> {
        let from = self.keys.processing();
        let log = match disposition {
            Disposition::Completed => self.enable_completed_queue.then(|| self.keys.completed()),
            Disposition::Failed => self.enable_failed_queue.then(|| self.keys.failed()),
        };
        match log {
            Some(to) => Route::Move { from, to },
            None => Route::Remove { from },
        }
    }
}

/// Builds a [`MessageQueue`] or an [`AsyncMessageQueue`].
///
/// A queue needs either a Redis client or a ready-made gateway; building
/// without one is a configuration error.
pub struct QueueBuilder {
    name: String,
    separator: String,
    deduplication: bool,
    enable_completed_queue: bool,
    enable_failed_queue: bool,
    dedup_key_fn: Option<DedupKeyFn>,
    options: GatewayOptions,
    interrupt: Option<Arc<dyn Interrupt>>,
    client: Option<redis::Client>,
    gateway: Option<Box<dyn Gateway>>,
    async_gateway: Option<Arc<dyn AsyncGateway>>,
}

impl QueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
            deduplication: true,
            enable_completed_queue: false,
            enable_failed_queue: false,
            dedup_key_fn: None,
            options: GatewayOptions::default(),
            interrupt: None,
            client: None,
            gateway: None,
            async_gateway: None,
        }
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn deduplication(mut self, enabled: bool) -> Self {
        self.deduplication = enabled;
        self
    }

    /// Keep successfully processed messages in the completed log.
    pub fn completed_queue(mut self, enabled: bool) -> Self {
        self.enable_completed_queue = enabled;
        self
    }

    /// Keep messages whose handler failed in the failed log.
    pub fn failed_queue(mut self, enabled: bool) -> Self {
        self.enable_failed_queue = enabled;
        self
    }

    pub fn dedup_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.dedup_key_fn = Some(Arc::new(f));
        self
    }

    // Gateway tuning only applies when the builder opens the connection itself.

    pub fn deduplication_ttl(mut self, ttl: Duration) -> Self {
        self.options.deduplication_ttl = ttl;
        self
    }

    pub fn message_wait_interval(mut self, interval: Duration) -> Self {
        self.options.message_wait_interval = interval;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    /// Abort store retries once `interrupt` fires.
    pub fn interrupt(mut self, interrupt: Arc<dyn Interrupt>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Apply a settings block (queue flags, separator and gateway tuning).
    pub fn settings(mut self, settings: &QueueSettings) -> Self {
        self.separator = settings.key_separator.clone();
        self.deduplication = settings.deduplication;
        self.enable_completed_queue = settings.enable_completed_queue;
        self.enable_failed_queue = settings.enable_failed_queue;
        self.options = settings.gateway_options();
        self
    }

    pub fn client(mut self, client: redis::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn gateway(mut self, gateway: impl Gateway + 'static) -> Self {
        self.gateway = Some(Box::new(gateway));
        self
    }

    pub fn async_gateway(mut self, gateway: impl AsyncGateway + 'static) -> Self {
        self.async_gateway = Some(Arc::new(gateway));
        self
    }

    fn core(&self) -> Result<QueueCore> {
        Ok(QueueCore {
            keys: QueueKeys::new(self.name.clone(), self.separator.clone())?,
            deduplication: self.deduplication,
            enable_completed_queue: self.enable_completed_queue,
            enable_failed_queue: self.enable_failed_queue,
            dedup_key_fn: self.dedup_key_fn.clone(),
        })
    }

    fn gateway_options(&self) -> GatewayOptions {
        let mut options = self.options.clone();
        if let Some(interrupt) = &self.interrupt {
            options.retry = options.retry.interrupt(Arc::clone(interrupt));
        }
        options
    }

    fn missing_store(&self) -> Error {
        Error::Config(format!(
            "queue {:?} needs either a redis client or a gateway",
            self.name
        ))
    }

    /// Build a blocking queue, opening a connection if no gateway was given.
    pub fn build(mut self) -> Result<MessageQueue> {
        let core = self.core()?;
        let gateway: Box<dyn Gateway> = match (self.gateway.take(), &self.client) {
            (Some(gateway), _) => gateway,
            (None, Some(client)) => Box::new(RedisGateway::connect(client, self.gateway_options())?),
            (None, None) => return Err(self.missing_store()),
        };
        Ok(MessageQueue::from_parts(core, gateway))
    }

    /// Build a suspending queue, opening a managed connection if no gateway was given.
    pub async fn build_async(mut self) -> Result<AsyncMessageQueue> {
        let core = self.core()?;
        let gateway: Arc<dyn AsyncGateway> = match (self.async_gateway.take(), &self.client) {
            (Some(gateway), _) => gateway,
            (None, Some(client)) => {
                Arc::new(AsyncRedisGateway::connect(client, self.gateway_options()).await?)
            }
            (None, None) => return Err(self.missing_store()),
        };
        Ok(AsyncMessageQueue::from_parts(core, gateway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(builder: QueueBuilder) -> QueueCore {
        builder.core().unwrap()
    }

    #[test]
    fn dedup_marker_defaults_to_content() {
        let core = core(QueueBuilder::new("q"));
        assert_eq!(core.dedup_marker("hello", None).as_deref(), Some("q::deduplication::hello"));
    }

    #[test]
    fn dedup_marker_uses_key_fn_then_explicit_key() {
        let core = core(QueueBuilder::new("q").dedup_key_fn(|m| m.len().to_string()));
        assert_eq!(core.dedup_marker("hello", None).as_deref(), Some("q::deduplication::5"));
        assert_eq!(
            core.dedup_marker("hello", Some("id-1")).as_deref(),
            Some("q::deduplication::id-1")
        );
    }

    #[test]
    fn no_marker_without_deduplication() {
        let core = core(QueueBuilder::new("q").deduplication(false));
        assert_eq!(core.dedup_marker("hello", None), None);
    }

    #[test]
    fn routes_follow_enabled_logs() {
        let plain = core(QueueBuilder::new("q"));
        assert_eq!(plain.route(Disposition::Completed), Route::Remove { from: "q::processing" });
        assert_eq!(plain.route(Disposition::Failed), Route::Remove { from: "q::processing" });

        let logged = core(QueueBuilder::new("q").completed_queue(true).failed_queue(true));
        assert_eq!(
            logged.route(Disposition::Completed),
            Route::Move { from: "q::processing", to: "q::completed" }
        );
        assert_eq!(
            logged.route(Disposition::Failed),
            Route::Move { from: "q::processing", to: "q::failed" }
        );
    }

    #[test]
    fn build_without_store_is_a_config_error() {
        let err = QueueBuilder::new("q").build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn name_containing_the_separator_is_a_config_error() {
        let gateway = crate::gateway::MemoryGateway::new();
        let err = QueueBuilder::new("a::deduplication").gateway(gateway.clone()).build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let err = QueueBuilder::new("a").separator("").gateway(gateway).build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn build_async_without_store_is_a_config_error() {
        let err = QueueBuilder::new("q").build_async().await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
