//! # redis-message-queue
//!
//! A reliable work queue on top of Redis lists.
//!
//! Producers [`publish`](MessageQueue::publish) messages, optionally
//! deduplicated by a TTL-bound marker. Consumers lease one message at a time
//! with [`process_message`](MessageQueue::process_message): the message is
//! moved atomically from the pending list to a processing list, handed to a
//! handler, and then removed or moved to a completed/failed log according to
//! the outcome. Every store call runs under a bounded exponential backoff
//! ([`RetryPolicy`]) that retries only transient failures.
//!
//! Both a blocking ([`MessageQueue`]) and a suspending ([`AsyncMessageQueue`])
//! flavor are provided over the same protocol.

pub mod config;
pub mod error;
pub mod gateway;
pub mod interrupt;
pub mod keys;
pub mod message;
pub mod queue;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ProcessError, Result};
pub use gateway::{
    AsyncGateway, AsyncRedisGateway, Gateway, GatewayOptions, MemoryGateway, Operation,
    RedisGateway,
};
pub use interrupt::{GracefulInterruptHandler, Interrupt, InterruptFlag};
pub use keys::QueueKeys;
pub use message::Message;
pub use queue::{AsyncMessageQueue, MessageQueue, QueueBuilder};
pub use retry::{RetryPolicy, Transient};
