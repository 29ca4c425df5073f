//! Blocking queue for thread-per-worker programs.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Disposition, QueueBuilder, QueueCore, Route};
use crate::error::{ProcessError, Result};
use crate::gateway::Gateway;
use crate::keys::QueueKeys;
use crate::message::Message;
use crate::telemetry::{lease, metrics};
use opentelemetry::KeyValue;

/// A message queue whose calls block the current thread.
///
/// Each worker thread owns its own queue and therefore its own connection.
pub struct MessageQueue {
    core: QueueCore,
    gateway: Box<dyn Gateway>,
}

impl MessageQueue {
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder::new(name)
    }

    /// A queue with default settings over `gateway`.
    ///
    /// Fails with [`Error::Config`](crate::Error::Config) if the name is not a valid queue name.
    pub fn new(name: impl Into<String>, gateway: impl Gateway + 'static) -> Result<Self> {
        let core = QueueBuilder::new(name).core()?;
        Ok(Self::from_parts(core, Box::new(gateway)))
    }

    pub(crate) fn from_parts(core: QueueCore, gateway: Box<dyn Gateway>) -> Self {
        Self { core, gateway }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.core.keys
    }

    /// Publish a message. Returns `false` if it was dropped as a duplicate.
    pub fn publish(&mut self, message: &str) -> Result<bool> {
        self.publish_inner(message, None)
    }

    /// Publish with an explicit deduplication key instead of the derived one.
    pub fn publish_with_dedup_key(&mut self, message: &str, dedup_key: &str) -> Result<bool> {
        self.publish_inner(message, Some(dedup_key))
    }

    /// Serialize `value` as JSON and publish it.
    pub fn publish_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<bool> {
        let message = serde_json::to_string(value)?;
        self.publish_inner(&message, None)
    }

    fn publish_inner(&mut self, message: &str, dedup_key: Option<&str>) -> Result<bool> {
        if let Some(marker) = self.core.dedup_marker(message, dedup_key) {
            if !self.gateway.insert_if_absent(&marker, b"")? {
                metrics::record_publish(self.core.keys.name(), false);
                debug!(queue = self.core.keys.name(), marker = %marker, "duplicate message dropped");
                return Ok(false);
            }
        }
        self.gateway
            .append(self.core.keys.pending(), message.as_bytes())?;
        metrics::record_publish(self.core.keys.name(), true);
        Ok(true)
    }

    /// Lease the next message and run `handler` on it.
    ///
    /// Waits up to the gateway's message wait interval; `Ok(None)` means the
    /// queue stayed idle. Otherwise the message is routed out of processing
    /// exactly once before this returns, whether the handler succeeds, fails
    /// (`ProcessError::Handler` with the handler's error) or panics (the panic
    /// resumes after routing).
    pub fn process_message<T, E, F>(&mut self, handler: F) -> std::result::Result<Option<T>, ProcessError<E>>
    where
        F: FnOnce(&Message) -> std::result::Result<T, E>,
    {
        let keys = &self.core.keys;
        let Some(bytes) = self.gateway.wait_and_move(keys.pending(), keys.processing())? else {
            debug!(queue = keys.name(), "no message");
            return Ok(None);
        };
        let message = Message::from(bytes);

        let lease_id = Uuid::new_v4();
        let span = lease::start_lease_span(self.core.keys.name(), &lease_id);
        let _entered = span.enter();
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&message)));
        metrics::record_handler_duration(self.core.keys.name(), started.elapsed());

        match outcome {
            Ok(Ok(value)) => {
                self.finish(&span, Disposition::Completed, &message)?;
                Ok(Some(value))
            }
            Ok(Err(err)) => {
                if let Err(route_err) = self.finish(&span, Disposition::Failed, &message) {
                    error!(error = %route_err, "handler failed and the message could not be routed");
                    return Err(route_err.into());
                }
                Err(ProcessError::Handler(err))
            }
            Err(payload) => {
                error!("handler panicked, routing message before unwinding");
                if let Err(route_err) = self.finish(&span, Disposition::Failed, &message) {
                    error!(error = %route_err, "could not route message after panic");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    fn finish(&mut self, span: &tracing::Span, disposition: Disposition, message: &Message) -> Result<()> {
        let route = self.core.route(disposition);
        match route {
            Route::Move { from, to } => self.gateway.move_between(from, to, message.as_bytes())?,
            Route::Remove { from } => self.gateway.remove(from, message.as_bytes())?,
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
