//! Redis-backed gateways.
//!
//! Commands are built once and executed by either gateway. The two-step
//! operations run inside MULTI/EXEC pipelines.
//!
//! [`RedisGateway`] owns one blocking connection and reopens it from its
//! client after a connection failure. [`AsyncRedisGateway`] sends the four
//! short operations over a self-healing [`ConnectionManager`] and runs each
//! blocking dequeue on a connection of its own, so a waiting consumer never
//! stalls publishers sharing the gateway.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{Client, Cmd, Connection, Pipeline, RedisError, RedisResult};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{AsyncGateway, Gateway, GatewayOptions, Operation};
use crate::error::Result;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Command shapes
// ---------------------------------------------------------------------------

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// BRPOPLPUSH takes fractional seconds (Redis 6+); zero would block forever.
fn timeout_seconds(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(0.001)
}

/// SETNX + EXPIRE in one transaction. Only the SETNX reply is kept.
fn insert_if_absent_pipe(key: &str, value: &[u8], ttl: Duration) -> Pipeline {
    let mut pipe = ::redis::pipe();
    pipe.atomic()
        .cmd("SETNX")
        .arg(key)
        .arg(value)
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl_seconds(ttl))
        .ignore();
    pipe
}

fn append_cmd(list: &str, value: &[u8]) -> Cmd {
    let mut cmd = ::redis::cmd("LPUSH");
    cmd.arg(list).arg(value);
    cmd
}

/// LPUSH onto the target and LREM one occurrence from the source, atomically.
fn move_pipe(from: &str, to: &str, value: &[u8]) -> Pipeline {
    let mut pipe = ::redis::pipe();
    pipe.atomic()
        .cmd("LPUSH")
        .arg(to)
        .arg(value)
        .ignore()
        .cmd("LREM")
        .arg(from)
        .arg(1)
        .arg(value)
        .ignore();
    pipe
}

fn remove_cmd(list: &str, value: &[u8]) -> Cmd {
    let mut cmd = ::redis::cmd("LREM");
    cmd.arg(list).arg(1).arg(value);
    cmd
}

fn wait_and_move_cmd(from: &str, to: &str, timeout: Duration) -> Cmd {
    let mut cmd = ::redis::cmd("BRPOPLPUSH");
    cmd.arg(from).arg(to).arg(timeout_seconds(timeout));
    cmd
}

fn record(operation: Operation) {
    metrics::gateway_operations().add(1, &[KeyValue::new("operation", operation.as_str())]);
}

/// Whether the connection that produced `err` must be thrown away.
fn connection_lost(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// Blocking gateway over one Redis connection.
///
/// A connection that fails with an I/O error is dropped and the next retry
/// attempt opens a fresh one from the client.
pub struct RedisGateway {
    client: Client,
    conn: Option<Connection>,
    options: GatewayOptions,
}

impl RedisGateway {
    /// Open a blocking connection from a client.
    pub fn connect(client: &Client, options: GatewayOptions) -> Result<Self> {
        let conn = options
            .retry
            .call("connect", || client.get_connection())?;
        Ok(Self {
            client: client.clone(),
            conn: Some(conn),
            options,
        })
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Run `query` under the retry policy, reconnecting between attempts when needed.
    fn run<T>(
        &mut self,
        operation: Operation,
        query: impl Fn(&mut Connection) -> RedisResult<T>,
    ) -> Result<T> {
        let client = &self.client;
        let slot = &mut self.conn;
        let value = self.options.retry.call(operation.as_str(), || {
            let mut conn = match slot.take() {
                Some(conn) => conn,
                None => {
                    debug!(%operation, "reconnecting");
                    client.get_connection()?
                }
            };
            let result = query(&mut conn);
            match &result {
                Err(err) if connection_lost(err) => {
                    warn!(%operation, error = %err, "dropping broken connection");
                }
                _ => *slot = Some(conn),
            }
            result
        })?;
        record(operation);
        Ok(value)
    }
}

impl Gateway for RedisGateway {
    fn insert_if_absent(&mut self, key: &str, value: &[u8]) -> Result<bool> {
        let pipe = insert_if_absent_pipe(key, value, self.options.deduplication_ttl);
        let (inserted,): (bool,) = self.run(Operation::InsertIfAbsent, |conn| pipe.query(conn))?;
        debug!(key, inserted, "insert_if_absent");
        Ok(inserted)
    }

    fn append(&mut self, list: &str, value: &[u8]) -> Result<()> {
        let cmd = append_cmd(list, value);
        self.run(Operation::Append, |conn| cmd.query::<()>(conn))?;
        debug!(list, "append");
        Ok(())
    }

    fn move_between(&mut self, from: &str, to: &str, value: &[u8]) -> Result<()> {
        let pipe = move_pipe(from, to, value);
        self.run(Operation::Move, |conn| pipe.query::<()>(conn))?;
        debug!(from, to, "move_between");
        Ok(())
    }

    fn remove(&mut self, list: &str, value: &[u8]) -> Result<()> {
        let cmd = remove_cmd(list, value);
        self.run(Operation::Remove, |conn| cmd.query::<()>(conn))?;
        debug!(list, "remove");
        Ok(())
    }

    fn wait_and_move(&mut self, from: &str, to: &str) -> Result<Option<Vec<u8>>> {
        let cmd = wait_and_move_cmd(from, to, self.options.message_wait_interval);
        let moved: Option<Vec<u8>> = self.run(Operation::WaitAndMove, |conn| cmd.query(conn))?;
        debug!(from, to, found = moved.is_some(), "wait_and_move");
        Ok(moved)
    }
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

/// Idle connections reserved for blocking dequeues.
///
/// Each waiting consumer checks out its own connection; a connection that
/// failed is dropped instead of being returned.
struct WaitPool {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl WaitPool {
    fn new(client: Client) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> RedisResult<MultiplexedConnection> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self.client.get_multiplexed_tokio_connection().await,
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    async fn query(&self, cmd: &Cmd) -> RedisResult<Option<Vec<u8>>> {
        let mut conn = self.checkout().await?;
        let result = cmd.query_async(&mut conn).await;
        if result.is_ok() {
            self.checkin(conn);
        }
        result
    }
}

/// Async gateway for tasks on a tokio scheduler. Cheap to share behind an `Arc`.
pub struct AsyncRedisGateway {
    conn: ConnectionManager,
    waiters: WaitPool,
    options: GatewayOptions,
}

impl AsyncRedisGateway {
    /// Open a managed connection from a client.
    pub async fn connect(client: &Client, options: GatewayOptions) -> Result<Self> {
        let conn = options
            .retry
            .call_async("connect", || client.get_connection_manager())
            .await?;
        Ok(Self {
            conn,
            waiters: WaitPool::new(client.clone()),
            options,
        })
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Send `cmd` over the managed connection, which reconnects on its own.
    async fn send<T: ::redis::FromRedisValue + Send>(&self, operation: Operation, cmd: &Cmd) -> Result<T> {
        let value = self
            .options
            .retry
            .call_async(operation.as_str(), || {
                let mut conn = self.conn.clone();
                async move { cmd.query_async::<_, T>(&mut conn).await }
            })
            .await?;
        record(operation);
        Ok(value)
    }

    async fn send_pipe<T: ::redis::FromRedisValue + Send>(
        &self,
        operation: Operation,
        pipe: &Pipeline,
    ) -> Result<T> {
        let value = self
            .options
            .retry
            .call_async(operation.as_str(), || {
                let mut conn = self.conn.clone();
                async move { pipe.query_async::<_, T>(&mut conn).await }
            })
            .await?;
        record(operation);
        Ok(value)
    }
}

#[async_trait]
impl AsyncGateway for AsyncRedisGateway {
    async fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        let pipe = insert_if_absent_pipe(key, value, self.options.deduplication_ttl);
        let (inserted,): (bool,) = self.send_pipe(Operation::InsertIfAbsent, &pipe).await?;
        debug!(key, inserted, "insert_if_absent");
        Ok(inserted)
    }

    async fn append(&self, list: &str, value: &[u8]) -> Result<()> {
        let cmd = append_cmd(list, value);
        self.send::<()>(Operation::Append, &cmd).await?;
        debug!(list, "append");
        Ok(())
    }

    async fn move_between(&self, from: &str, to: &str, value: &[u8]) -> Result<()> {
        let pipe = move_pipe(from, to, value);
        self.send_pipe::<()>(Operation::Move, &pipe).await?;
        debug!(from, to, "move_between");
        Ok(())
    }

    async fn remove(&self, list: &str, value: &[u8]) -> Result<()> {
        let cmd = remove_cmd(list, value);
        self.send::<()>(Operation::Remove, &cmd).await?;
        debug!(list, "remove");
        Ok(())
    }

    async fn wait_and_move(&self, from: &str, to: &str) -> Result<Option<Vec<u8>>> {
        let cmd = wait_and_move_cmd(from, to, self.options.message_wait_interval);
        let waiters = &self.waiters;
        let moved = self
            .options
            .retry
            .call_async(Operation::WaitAndMove.as_str(), || waiters.query(&cmd))
            .await?;
        record(Operation::WaitAndMove);
        debug!(from, to, found = moved.is_some(), "wait_and_move");
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(pipe: &Pipeline) -> String {
        String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned()
    }

    #[test]
    fn insert_if_absent_is_a_transaction_with_expiry() {
        let pipe = insert_if_absent_pipe("q::deduplication::m", b"", Duration::from_secs(3600));
        let wire = packed(&pipe);
        let multi = wire.find("MULTI").unwrap();
        let setnx = wire.find("SETNX").unwrap();
        let expire = wire.find("EXPIRE").unwrap();
        let exec = wire.find("EXEC").unwrap();
        assert!(multi < setnx && setnx < expire && expire < exec);
        assert!(wire.contains("3600"));
    }

    #[test]
    fn move_is_a_transaction_removing_one_occurrence() {
        let pipe = move_pipe("q::processing", "q::completed", b"hello");
        let wire = packed(&pipe);
        let lpush = wire.find("LPUSH").unwrap();
        let lrem = wire.find("LREM").unwrap();
        assert!(wire.starts_with("*1\r\n$5\r\nMULTI"));
        assert!(lpush < lrem);
        assert!(wire.contains("$1\r\n1\r\n"));
        assert!(wire.contains("EXEC"));
    }

    #[test]
    fn ttl_never_zero() {
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(90)), 90);
    }

    #[test]
    fn wait_timeout_keeps_fractions() {
        let wire = |timeout| {
            let cmd = wait_and_move_cmd("a", "b", timeout);
            String::from_utf8_lossy(&cmd.get_packed_command()).into_owned()
        };
        assert!(wire(Duration::from_millis(500)).ends_with("$3\r\n0.5\r\n"));
        assert!(wire(Duration::from_millis(1900)).ends_with("$3\r\n1.9\r\n"));
        assert!(timeout_seconds(Duration::ZERO) > 0.0);
    }

    #[test]
    fn io_failures_discard_the_connection() {
        let dropped = RedisError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        let refused = RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        let reply = RedisError::from((::redis::ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(connection_lost(&dropped));
        assert!(connection_lost(&refused));
        assert!(!connection_lost(&reply));
    }
}
