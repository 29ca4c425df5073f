//! In-process gateway for tests and local development.
//!
//! Every operation runs under one mutex, which gives the same atomicity the
//! Redis MULTI/EXEC pipelines give: no observer ever sees a moved value in
//! both lists or in neither. Faults can be injected per operation to exercise
//! the retry policy and the routing guarantees.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ::redis::{ErrorKind, RedisError};
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{AsyncGateway, Gateway, GatewayOptions, Operation};
use crate::error::Result;

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    markers: HashMap<String, (Vec<u8>, Instant)>,
    faults: HashMap<Operation, VecDeque<ErrorKind>>,
    calls: HashMap<Operation, u32>,
}

impl State {
    /// Count the call and fail it if a fault is queued for this operation.
    fn enter(&mut self, operation: Operation) -> std::result::Result<(), RedisError> {
        *self.calls.entry(operation).or_default() += 1;
        match self.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(kind) => Err(fault(kind)),
            None => Ok(()),
        }
    }

    fn insert_if_absent(&mut self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let now = Instant::now();
        let expires = now + ttl;
        match self.markers.get_mut(key) {
            Some((_, deadline)) if *deadline > now => {
                // EXPIRE runs in the same transaction as SETNX, so a rejected
                // insert still refreshes the marker's lifetime.
                *deadline = expires;
                false
            }
            _ => {
                self.markers.insert(key.to_string(), (value.to_vec(), expires));
                true
            }
        }
    }

    fn push(&mut self, list: &str, value: &[u8]) {
        self.lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_vec());
    }

    fn remove_one(&mut self, list: &str, value: &[u8]) {
        if let Some(items) = self.lists.get_mut(list) {
            if let Some(pos) = items.iter().position(|v| v.as_slice() == value) {
                items.remove(pos);
            }
            if items.is_empty() {
                self.lists.remove(list);
            }
        }
    }

    fn pop_and_push(&mut self, from: &str, to: &str) -> Option<Vec<u8>> {
        let items = self.lists.get_mut(from)?;
        let value = items.pop_back()?;
        if items.is_empty() {
            self.lists.remove(from);
        }
        self.push(to, &value);
        Some(value)
    }
}

fn fault(kind: ErrorKind) -> RedisError {
    match kind {
        ErrorKind::IoError => RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "injected connection failure",
        )),
        kind => RedisError::from((kind, "injected fault")),
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
    notify: Notify,
}

/// A point-in-time copy of every list and live marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub lists: HashMap<String, Vec<Vec<u8>>>,
    pub markers: Vec<String>,
}

impl MemorySnapshot {
    /// The lists (by key) that currently hold `value`, with multiplicity.
    pub fn lists_containing(&self, value: &[u8]) -> Vec<String> {
        let mut found = Vec::new();
        for (key, items) in &self.lists {
            for item in items {
                if item.as_slice() == value {
                    found.push(key.clone());
                }
            }
        }
        found.sort();
        found
    }
}

/// In-memory gateway. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    shared: Arc<Shared>,
    options: GatewayOptions,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: GatewayOptions) -> Self {
        Self {
            shared: Arc::default(),
            options,
        }
    }

    /// A handle on the same store with different tuning.
    pub fn reconfigured(&self, options: GatewayOptions) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            options,
        }
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave a half-applied
        // operation behind, so the state stays usable.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` calls of `operation` with `kind` before they touch the store.
    pub fn inject_faults(&self, operation: Operation, kind: ErrorKind, count: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(kind, count));
    }

    /// How many times `operation` was attempted, including failed attempts.
    pub fn calls(&self, operation: Operation) -> u32 {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Contents of `list`, head first.
    pub fn list(&self, list: &str) -> Vec<Vec<u8>> {
        self.lock()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, list: &str) -> usize {
        self.lock().lists.get(list).map_or(0, VecDeque::len)
    }

    /// Whether an unexpired marker exists at `key`.
    pub fn has_marker(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .markers
            .get(key)
            .is_some_and(|(_, deadline)| *deadline > now)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = self.lock();
        let now = Instant::now();
        let mut markers: Vec<String> = state
            .markers
            .iter()
            .filter(|(_, (_, deadline))| *deadline > now)
            .map(|(key, _)| key.clone())
            .collect();
        markers.sort();
        MemorySnapshot {
            lists: state
                .lists
                .iter()
                .map(|(key, items)| (key.clone(), items.iter().cloned().collect()))
                .collect(),
            markers,
        }
    }

    fn wake(&self) {
        self.shared.condvar.notify_all();
        self.shared.notify.notify_waiters();
    }

    fn apply<T>(
        &self,
        operation: Operation,
        f: impl FnOnce(&mut State) -> T,
    ) -> std::result::Result<T, RedisError> {
        let mut state = self.lock();
        state.enter(operation)?;
        let out = f(&mut state);
        drop(state);
        debug!(%operation, "memory gateway");
        Ok(out)
    }

    fn insert_once(&self, key: &str, value: &[u8]) -> std::result::Result<bool, RedisError> {
        let ttl = self.options.deduplication_ttl;
        self.apply(Operation::InsertIfAbsent, |s| s.insert_if_absent(key, value, ttl))
    }

    fn append_once(&self, list: &str, value: &[u8]) -> std::result::Result<(), RedisError> {
        self.apply(Operation::Append, |s| s.push(list, value))?;
        self.wake();
        Ok(())
    }

    fn move_once(&self, from: &str, to: &str, value: &[u8]) -> std::result::Result<(), RedisError> {
        self.apply(Operation::Move, |s| {
            s.push(to, value);
            s.remove_one(from, value);
        })?;
        self.wake();
        Ok(())
    }

    fn remove_once(&self, list: &str, value: &[u8]) -> std::result::Result<(), RedisError> {
        self.apply(Operation::Remove, |s| s.remove_one(list, value))
    }

    /// Blocking pop-and-push, parked on the condvar until a push or the deadline.
    fn wait_once_blocking(
        &self,
        from: &str,
        to: &str,
    ) -> std::result::Result<Option<Vec<u8>>, RedisError> {
        let deadline = Instant::now() + self.options.message_wait_interval;
        let mut state = self.lock();
        state.enter(Operation::WaitAndMove)?;
        loop {
            if let Some(value) = state.pop_and_push(from, to) {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .shared
                .condvar
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Suspending pop-and-push, parked on the notifier until a push or the deadline.
    async fn wait_once_async(
        &self,
        from: &str,
        to: &str,
    ) -> std::result::Result<Option<Vec<u8>>, RedisError> {
        let deadline = tokio::time::Instant::now() + self.options.message_wait_interval;
        let mut first = true;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if first {
                    state.enter(Operation::WaitAndMove)?;
                    first = false;
                }
                if let Some(value) = state.pop_and_push(from, to) {
                    return Ok(Some(value));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

impl Gateway for MemoryGateway {
    fn insert_if_absent(&mut self, key: &str, value: &[u8]) -> Result<bool> {
        let op = Operation::InsertIfAbsent.as_str();
        Ok(self.options.retry.call(op, || self.insert_once(key, value))?)
    }

    fn append(&mut self, list: &str, value: &[u8]) -> Result<()> {
        let op = Operation::Append.as_str();
        Ok(self.options.retry.call(op, || self.append_once(list, value))?)
    }

    fn move_between(&mut self, from: &str, to: &str, value: &[u8]) -> Result<()> {
        let op = Operation::Move.as_str();
        Ok(self.options.retry.call(op, || self.move_once(from, to, value))?)
    }

    fn remove(&mut self, list: &str, value: &[u8]) -> Result<()> {
        let op = Operation::Remove.as_str();
        Ok(self.options.retry.call(op, || self.remove_once(list, value))?)
    }

    fn wait_and_move(&mut self, from: &str, to: &str) -> Result<Option<Vec<u8>>> {
        let op = Operation::WaitAndMove.as_str();
        Ok(self
            .options
            .retry
            .call(op, || self.wait_once_blocking(from, to))?)
    }
}

#[async_trait]
impl AsyncGateway for MemoryGateway {
    async fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        let op = Operation::InsertIfAbsent.as_str();
        Ok(self
            .options
            .retry
            .call_async(op, || async move { self.insert_once(key, value) })
            .await?)
    }

    async fn append(&self, list: &str, value: &[u8]) -> Result<()> {
        let op = Operation::Append.as_str();
        Ok(self
            .options
            .retry
            .call_async(op, || async move { self.append_once(list, value) })
            .await?)
    }

    async fn move_between(&self, from: &str, to: &str, value: &[u8]) -> Result<()> {
        let op = Operation::Move.as_str();
        Ok(self
            .options
            .retry
            .call_async(op, || async move { self.move_once(from, to, value) })
            .await?)
    }

    async fn remove(&self, list: &str, value: &[u8]) -> Result<()> {
        let op = Operation::Remove.as_str();
        Ok(self
            .options
            .retry
            .call_async(op, || async move { self.remove_once(list, value) })
            .await?)
    }

    async fn wait_and_move(&self, from: &str, to: &str) -> Result<Option<Vec<u8>>> {
        let op = Operation::WaitAndMove.as_str();
        Ok(self
            .options
            .retry
            .call_async(op, || self.wait_once_async(from, to))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_are_lifo_at_head_and_popped_from_tail() {
        let mut gw = MemoryGateway::new();
        Gateway::append(&mut gw, "q", b"first").unwrap();
        Gateway::append(&mut gw, "q", b"second").unwrap();
        assert_eq!(gw.list("q"), vec![b"second".to_vec(), b"first".to_vec()]);

        let moved = Gateway::wait_and_move(&mut gw, "q", "p").unwrap();
        assert_eq!(moved.as_deref(), Some(&b"first"[..]));
        assert_eq!(gw.list("p"), vec![b"first".to_vec()]);
        assert_eq!(gw.len("q"), 1);
    }

    #[test]
    fn remove_clears_a_single_occurrence() {
        let mut gw = MemoryGateway::new();
        Gateway::append(&mut gw, "q", b"dup").unwrap();
        Gateway::append(&mut gw, "q", b"dup").unwrap();
        Gateway::remove(&mut gw, "q", b"dup").unwrap();
        assert_eq!(gw.len("q"), 1);
    }

    #[test]
    fn marker_expires() {
        let mut gw = MemoryGateway::with_options(GatewayOptions {
            deduplication_ttl: Duration::from_millis(30),
            ..GatewayOptions::default()
        });
        assert!(Gateway::insert_if_absent(&mut gw, "k", b"").unwrap());
        assert!(!Gateway::insert_if_absent(&mut gw, "k", b"").unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!gw.has_marker("k"));
        assert!(Gateway::insert_if_absent(&mut gw, "k", b"").unwrap());
    }

    #[test]
    fn injected_faults_are_consumed_in_order() {
        let gw = MemoryGateway::new();
        gw.inject_faults(Operation::Append, ErrorKind::IoError, 2);
        assert!(gw.append_once("q", b"x").is_err());
        assert!(gw.append_once("q", b"x").is_err());
        assert!(gw.append_once("q", b"x").is_ok());
        assert_eq!(gw.calls(Operation::Append), 3);
        assert_eq!(gw.len("q"), 1);
    }
}
