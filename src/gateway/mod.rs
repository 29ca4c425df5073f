//! Store gateway: the only code that talks to the store.
//!
//! Five operations make up the whole protocol. [`Gateway`] exposes them as
//! blocking calls for thread-per-worker programs and [`AsyncGateway`] as
//! suspending calls for tasks on a tokio scheduler. Both carry the same
//! atomicity and retry semantics; every operation runs under a
//! [`RetryPolicy`](crate::retry::RetryPolicy).

pub mod memory;
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::retry::RetryPolicy;

pub use self::memory::{MemoryGateway, MemorySnapshot};
pub use self::redis::{AsyncRedisGateway, RedisGateway};

/// How long a deduplication marker lives.
pub const DEFAULT_DEDUPLICATION_TTL: Duration = Duration::from_secs(60 * 60);

/// How long a blocking dequeue waits before reporting an idle queue.
pub const DEFAULT_MESSAGE_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// The five store operations, used for logging, metrics and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    InsertIfAbsent,
    Append,
    Move,
    Remove,
    WaitAndMove,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::InsertIfAbsent => "insert_if_absent",
            Operation::Append => "append",
            Operation::Move => "move",
            Operation::Remove => "remove",
            Operation::WaitAndMove => "wait_and_move",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning shared by every gateway implementation.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub retry: RetryPolicy,
    pub deduplication_ttl: Duration,
    pub message_wait_interval: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deduplication_ttl: DEFAULT_DEDUPLICATION_TTL,
            message_wait_interval: DEFAULT_MESSAGE_WAIT_INTERVAL,
        }
    }
}

/// Blocking store gateway. Calls block the current thread until the
/// operation succeeds or its retry budget is exhausted.
pub trait Gateway: Send {
    /// Set `key` to `value` only if absent, with the deduplication TTL, atomically.
    /// Returns whether the key was inserted.
    fn insert_if_absent(&mut self, key: &str, value: &[u8]) -> Result<bool>;

    /// Push `value` onto the head of `list`.
    fn append(&mut self, list: &str, value: &[u8]) -> Result<()>;

    /// Atomically push `value` onto `to` and remove one occurrence from `from`.
    fn move_between(&mut self, from: &str, to: &str, value: &[u8]) -> Result<()>;

    /// Remove one occurrence of `value` from `list`.
    fn remove(&mut self, list: &str, value: &[u8]) -> Result<()>;

    /// Atomically move the tail of `from` onto the head of `to`, waiting up to
    /// the message wait interval. `None` means the queue stayed idle.
    fn wait_and_move(&mut self, from: &str, to: &str) -> Result<Option<Vec<u8>>>;
}

/// Suspending store gateway. Calls yield to the scheduler while waiting.
#[async_trait]
pub trait AsyncGateway: Send + Sync {
    async fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool>;

    async fn append(&self, list: &str, value: &[u8]) -> Result<()>;

    async fn move_between(&self, from: &str, to: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, list: &str, value: &[u8]) -> Result<()>;

    async fn wait_and_move(&self, from: &str, to: &str) -> Result<Option<Vec<u8>>>;
}
