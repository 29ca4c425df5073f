//! Suspending queue for tasks on a tokio scheduler.
//!
//! Same protocol as the blocking queue; calls yield only at the gateway.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tracing::{Instrument, Span, debug, error, info};
use uuid::Uuid;

use super::{Disposition, QueueBuilder, QueueCore, Route};
use crate::error::{ProcessError, Result};
use crate::gateway::AsyncGateway;
use crate::keys::QueueKeys;
use crate::message::Message;
use crate::telemetry::{lease, metrics};
use opentelemetry::KeyValue;

/// A message queue whose calls suspend the calling task.
///
/// Cheap to clone; clones share the gateway, so many tasks can publish and
/// process concurrently.
#[derive(Clone)]
pub struct AsyncMessageQueue {
    core: Arc<QueueCore>,
    gateway: Arc<dyn AsyncGateway>,
}

impl AsyncMessageQueue {
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder::new(name)
    }

    /// A queue with default settings over `gateway`.
    ///
    /// Fails with [`Error::Config`](crate::Error::Config) if the name is not a valid queue name.
    pub fn new(name: impl Into<String>, gateway: impl AsyncGateway + 'static) -> Result<Self> {
        let core = QueueBuilder::new(name).core()?;
        Ok(Self::from_parts(core, Arc::new(gateway)))
    }

    pub(crate) fn from_parts(core: QueueCore, gateway: Arc<dyn AsyncGateway>) -> Self {
        Self {
            core: Arc::new(core),
            gateway,
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.core.keys
    }

    /// Publish a message. Returns `false` if it was dropped as a duplicate.
    pub async fn publish(&self, message: &str) -> Result<bool> {
        self.publish_inner(message, None).await
    }

    /// Publish with an explicit deduplication key instead of the derived one.
    pub async fn publish_with_dedup_key(&self, message: &str, dedup_key: &str) -> Result<bool> {
        self.publish_inner(message, Some(dedup_key)).await
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<bool> {
        let message = serde_json::to_string(value)?;
        self.publish_inner(&message, None).await
    }

    async fn publish_inner(&self, message: &str, dedup_key: Option<&str>) -> Result<bool> {
        let name = self.core.keys.name();
        if let Some(marker) = self.core.dedup_marker(message, dedup_key) {
            if !self.gateway.insert_if_absent(&marker, b"").await? {
                metrics::record_publish(name, false);
                debug!(queue = name, marker = %marker, "duplicate message dropped");
                return Ok(false);
            }
        }
        self.gateway
            .append(self.core.keys.pending(), message.as_bytes())
            .await?;
        metrics::record_publish(name, true);
        Ok(true)
    }

    /// Lease the next message and run `handler` on it.
    ///
    /// Waits up to the gateway's message wait interval; `Ok(None)` means the
    /// queue stayed idle. The message is routed out of processing exactly
    /// once before this returns, whether the handler's future resolves to
    /// `Ok`, to `Err` (returned as `ProcessError::Handler`) or panics (the
    /// panic resumes after routing).
    pub async fn process_message<T, E, F, Fut>(
        &self,
        handler: F,
    ) -> std::result::Result<Option<T>, ProcessError<E>>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let keys = &self.core.keys;
        let Some(bytes) = self
            .gateway
            .wait_and_move(keys.pending(), keys.processing())
            .await?
        else {
            debug!(queue = keys.name(), "no message");
            return Ok(None);
        };
        let message = Message::from(bytes);

        let lease_id = Uuid::new_v4();
        let span = lease::start_lease_span(keys.name(), &lease_id);
        let started = Instant::now();

        // Calling the handler happens inside the guarded future so a panic
        // while building its future is caught like one while polling it.
        let leased = message.clone();
        let outcome = AssertUnwindSafe(async move { handler(leased).await })
            .catch_unwind()
            .instrument(span.clone())
            .await;
        metrics::record_handler_duration(keys.name(), started.elapsed());

        match outcome {
            Ok(Ok(value)) => {
                self.finish(&span, Disposition::Completed, &message)
                    .instrument(span.clone())
                    .await?;
                Ok(Some(value))
            }
            Ok(Err(err)) => {
                let routed = self
                    .finish(&span, Disposition::Failed, &message)
                    .instrument(span.clone())
                    .await;
                if let Err(route_err) = routed {
                    error!(parent: &span, error = %route_err, "handler failed and the message could not be routed");
                    return Err(route_err.into());
                }
                Err(ProcessError::Handler(err))
            }
            Err(payload) => {
                error!(parent: &span, "handler panicked, routing message before unwinding");
                let routed = self
                    .finish(&span, Disposition::Failed, &message)
                    .instrument(span.clone())
                    .await;
                if let Err(route_err) = routed {
                    error!(parent: &span, error = %route_err, "could not route message after panic");
                }
                std::panic::resume_unwind(payload)
            }
        }
    }

    async fn finish(&self, span: &Span, disposition: Disposition, message: &Message) -> Result<()> {
        let route = self.core.route(disposition);
        match route {
            Route::Move { from, to } => {
                self.gateway
                    .move_between(from, to, message.as_bytes())
                    .await?
            }
            Route::Remove { from } => self.gateway.remove(from, message.as_bytes()).await?,
        }
        lease::record_route(span, self.core.keys.processing(), route.target());
        metrics::messages_processed().add(
            1,
            &[
                KeyValue::new("queue", self.core.keys.name().to_string()),
                KeyValue::new("outcome", disposition.as_str()),
            ],
        );
        info!(outcome = disposition.as_str(), to = route.target(), "lease closed");
        Ok(())
    }
}
