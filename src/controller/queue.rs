//! Deduplicating work queue of Etcd keys
//!
//! A key is handed to at most one worker at a time. Adds for a key that is
//! being processed mark it dirty; it is redelivered once after `done`.
//! Delayed adds live in the same bookkeeping and are promoted by `get`, so
//! the queue needs no background task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use kube::{Resource, ResourceExt};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::error::BackoffConfig;

/// Identity of an Etcd resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; `None` when namespace or name is unset
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.meta().name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What to do with a key once its pass finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next event; resets the backoff counter
    Never,
    /// Schedule after a fixed delay; resets the backoff counter
    After(Duration),
    /// Schedule after the key's next exponential backoff delay
    Backoff,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is full ({0} keys)")]
    Full(usize),

    #[error("work queue is shutting down")]
    ShuttingDown,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    delayed: HashMap<ObjectKey, Instant>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

impl Inner {
    /// Distinct keys waiting for delivery, now or later
    fn pending(&self) -> usize {
        self.queued.len()
            + self
                .delayed
                .keys()
                .filter(|k| !self.queued.contains(*k))
                .count()
    }

    fn is_known(&self, key: &ObjectKey) -> bool {
        self.queued.contains(key) || self.delayed.contains_key(key) || self.processing.contains(key)
    }

    fn enqueue(&mut self, key: ObjectKey) {
        if self.queued.insert(key.clone()) {
            self.queue.push_back(key);
        }
    }

    /// Move due delayed entries into the queue; returns the next deadline
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        let due: Vec<ObjectKey> = self
            .delayed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.delayed.remove(&key);
            if self.processing.contains(&key) {
                self.dirty.insert(key);
            } else {
                self.enqueue(key);
            }
        }
        self.delayed.values().min().copied()
    }

    fn schedule(&mut self, key: ObjectKey, deadline: Instant) {
        self.delayed
            .entry(key)
            .and_modify(|d| *d = (*d).min(deadline))
            .or_insert(deadline);
    }
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    backoff: BackoffConfig,
}

impl WorkQueue {
    pub fn new(capacity: usize, backoff: BackoffConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
            backoff,
        }
    }

    /// Enqueue `key` for immediate processing
    pub async fn add(&self, key: ObjectKey) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        if !inner.is_known(&key) && inner.pending() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        inner.delayed.remove(&key);
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return Ok(());
        }
        inner.enqueue(key);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Enqueue `key` once `delay` has elapsed. The earliest pending deadline wins.
    pub async fn add_after(&self, key: ObjectKey, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.add(key).await;
        }
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        if inner.queued.contains(&key) {
            return Ok(());
        }
        if !inner.is_known(&key) && inner.pending() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        inner.schedule(key, Instant::now() + delay);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next key and mark it as processing.
    ///
    /// Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            let next_deadline = {
                let mut inner = self.inner.lock().await;
                if inner.shutting_down {
                    return None;
                }
                let next_deadline = inner.promote_due(Instant::now());
                if let Some(key) = inner.queue.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                // Register before releasing the lock so no add is missed
                notified.as_mut().enable();
                next_deadline
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after a pass and apply `requeue`
    pub async fn done(&self, key: &ObjectKey, requeue: Requeue) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);

        match requeue {
            Requeue::Never => {
                inner.failures.remove(key);
            }
            Requeue::After(delay) => {
                inner.failures.remove(key);
                inner.schedule(key.clone(), Instant::now() + delay);
            }
            Requeue::Backoff => {
                let attempt = inner.failures.get(key).copied().unwrap_or(0);
                inner.failures.insert(key.clone(), attempt.saturating_add(1));
                let delay = self.backoff.delay_for_attempt(attempt);
                inner.schedule(key.clone(), Instant::now() + delay);
            }
        }

        if inner.dirty.remove(key) {
            inner.delayed.remove(key);
            inner.enqueue(key.clone());
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Consecutive backoff requeues recorded for `key`
    pub async fn failures(&self, key: &ObjectKey) -> u32 {
        self.inner
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop handing out keys and wake every waiting worker
    pub async fn shutdown(&self) {
        self.inner.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting for delivery, immediate or delayed
    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
