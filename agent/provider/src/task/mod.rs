/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-process task registry.
//!
//! Gives each idempotency key at most one execution and exposes poll and
//! cancel over the resulting async operation. State lives in memory only and
//! does not survive a restart.

use common::error::ProviderError;
use common::task::TaskPhase;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_RETAINED: usize = 1024;
/// Evicted keys remembered per retained entry.
const TOMBSTONES_PER_RETAINED: usize = 4;

/// Cancellation flag handed to a tracked operation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn canceled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            // registry entry is gone; nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

/// Point-in-time view of a tracked task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot<T> {
    pub handle: String,
    pub key: String,
    pub phase: TaskPhase,
    pub result: Option<T>,
    pub error: Option<ProviderError>,
    pub cancel_requested: bool,
    pub created_at: Instant,
    pub retained_until: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub handle: String,
    /// False when the key was already known and the operation was not run.
    pub created: bool,
}

struct Entry<T> {
    key: String,
    phase: TaskPhase,
    result: Option<T>,
    error: Option<ProviderError>,
    cancel: watch::Sender<bool>,
    created_at: Instant,
    finished_at: Option<Instant>,
}

struct Registry<T> {
    by_handle: HashMap<String, Entry<T>>,
    by_key: HashMap<String, String>,
    /// Terminal handles, oldest first.
    finished: VecDeque<String>,
    /// Keys of evicted tasks and the handle they had, oldest first. A late
    /// duplicate submit gets the old handle back instead of a second run.
    tombstones: VecDeque<String>,
    evicted_keys: HashMap<String, String>,
}

impl<T> Registry<T> {
    fn remove(&mut self, handle: &str, max_tombstones: usize) {
        if let Some(entry) = self.by_handle.remove(handle) {
            if self.by_key.get(&entry.key).map(String::as_str) == Some(handle) {
                self.by_key.remove(&entry.key);
                self.bury(entry.key.clone(), handle.to_string(), max_tombstones);
            }
            tracing::debug!(handle, key = %entry.key, "evicted task");
        }
    }

    fn bury(&mut self, key: String, handle: String, max_tombstones: usize) {
        if self.evicted_keys.insert(key.clone(), handle).is_none() {
            self.tombstones.push_back(key);
        }
        while self.tombstones.len() > max_tombstones {
            if let Some(oldest) = self.tombstones.pop_front() {
                self.evicted_keys.remove(&oldest);
            }
        }
    }

    /// Handle for `key`, live or evicted.
    fn known(&self, key: &str) -> Option<&String> {
        self.by_key.get(key).or_else(|| self.evicted_keys.get(key))
    }

    fn evict(&mut self, now: Instant, retention: Duration, max_retained: usize) {
        while let Some(handle) = self.finished.front().cloned() {
            let expired = match self.by_handle.get(&handle).and_then(|e| e.finished_at) {
                Some(finished_at) => now.saturating_duration_since(finished_at) >= retention,
                None => true,
            };
            if !expired && self.finished.len() <= max_retained {
                break;
            }
            self.finished.pop_front();
            self.remove(&handle, max_retained.saturating_mul(TOMBSTONES_PER_RETAINED).max(1));
        }
    }
}

/// Registry of tracked operations producing `T` on success.
pub struct TaskTracker<T> {
    inner: Arc<Mutex<Registry<T>>>,
    retention: Duration,
    max_retained: usize,
}

impl<T> Clone for TaskTracker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            retention: self.retention,
            max_retained: self.max_retained,
        }
    }
}

impl<T> Default for TaskTracker<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_MAX_RETAINED)
    }
}

impl<T> TaskTracker<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(retention: Duration, max_retained: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                by_handle: HashMap::new(),
                by_key: HashMap::new(),
                finished: VecDeque::new(),
                tombstones: VecDeque::new(),
                evicted_keys: HashMap::new(),
            })),
            retention,
            max_retained,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry<T>>, ProviderError> {
        self.inner
            .lock()
            .map_err(|_| ProviderError::internal("task registry lock poisoned"))
    }

    /// Handle already registered for `key`, if any.
    ///
    /// Keys of evicted tasks still resolve to their old handle, which polls
    /// as `NotFound`, until they fall out of the bounded tombstone list.
    pub fn lookup(&self, key: &str) -> Result<Option<String>, ProviderError> {
        let mut registry = self.lock()?;
        registry.evict(Instant::now(), self.retention, self.max_retained);
        Ok(registry.known(key).cloned())
    }

    /// Register `operation` under `key`.
    ///
    /// A known key returns its existing handle whatever the phase, and
    /// `operation` is dropped without being called. A new key is reserved
    /// before the operation is first polled; one that finishes on that first
    /// poll is terminal by the time this returns, anything else continues on
    /// a spawned task. Must be called within a tokio runtime.
    pub fn register<F, Fut>(&self, key: &str, operation: F) -> Result<Registration, ProviderError>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        let (handle, signal) = {
            let mut registry = self.lock()?;
            registry.evict(Instant::now(), self.retention, self.max_retained);
            if let Some(existing) = registry.known(key) {
                tracing::debug!(key, handle = %existing, "idempotency key already registered");
                return Ok(Registration {
                    handle: existing.clone(),
                    created: false,
                });
            }

            let handle = uuid::Uuid::new_v4().to_string();
            let (cancel, rx) = watch::channel(false);
            registry.by_key.insert(key.to_string(), handle.clone());
            registry.by_handle.insert(
                handle.clone(),
                Entry {
                    key: key.to_string(),
                    phase: TaskPhase::Pending,
                    result: None,
                    error: None,
                    cancel,
                    created_at: Instant::now(),
                    finished_at: None,
                },
            );
            (handle, CancelSignal { rx })
        };

        let mut future = Box::pin(operation(signal));
        match (&mut future).now_or_never() {
            Some(outcome) => self.complete(&handle, outcome),
            None => {
                self.set_phase(&handle, TaskPhase::Running);
                let tracker = self.clone();
                let spawned = handle.clone();
                tokio::spawn(async move {
                    let outcome = future.await;
                    tracker.complete(&spawned, outcome);
                });
            }
        }

        tracing::info!(key, %handle, "registered task");
        Ok(Registration {
            handle,
            created: true,
        })
    }

    fn set_phase(&self, handle: &str, phase: TaskPhase) {
        if let Ok(mut registry) = self.inner.lock() {
            if let Some(entry) = registry.by_handle.get_mut(handle) {
                if !entry.phase.is_terminal() {
                    entry.phase = phase;
                }
            }
        }
    }

    fn complete(&self, handle: &str, outcome: Result<T, ProviderError>) {
        let Ok(mut registry) = self.inner.lock() else {
            tracing::error!(handle, "task registry lock poisoned; dropping outcome");
            return;
        };
        let Some(entry) = registry.by_handle.get_mut(handle) else {
            return;
        };
        match outcome {
            Ok(result) => {
                entry.phase = TaskPhase::Succeeded;
                entry.result = Some(result);
            }
            Err(err) if err.kind == common::error::ErrorKind::Canceled => {
                entry.phase = TaskPhase::Canceled;
                entry.error = Some(err);
            }
            Err(err) => {
                entry.phase = TaskPhase::Failed;
                entry.error = Some(err);
            }
        }
        entry.finished_at = Some(Instant::now());
        tracing::info!(handle, key = %entry.key, phase = ?entry.phase, "task finished");
        registry.finished.push_back(handle.to_string());
        registry.evict(Instant::now(), self.retention, self.max_retained);
    }

    /// Current state of `handle`; `NotFound` once it has been evicted.
    pub fn poll(&self, handle: &str) -> Result<TaskSnapshot<T>, ProviderError> {
        let mut registry = self.lock()?;
        registry.evict(Instant::now(), self.retention, self.max_retained);
        let entry = registry
            .by_handle
            .get(handle)
            .ok_or_else(|| ProviderError::not_found(format!("task {handle} is unknown or evicted")))?;
        let snapshot = TaskSnapshot {
            handle: handle.to_string(),
            key: entry.key.clone(),
            phase: entry.phase,
            result: entry.result.clone(),
            error: entry.error.clone(),
            cancel_requested: *entry.cancel.borrow(),
            created_at: entry.created_at,
            retained_until: entry.finished_at.map(|f| f + self.retention),
        };
        Ok(snapshot)
    }

    /// Request cancellation. Advisory: the operation decides whether to stop.
    pub fn cancel(&self, handle: &str) -> Result<TaskPhase, ProviderError> {
        let mut registry = self.lock()?;
        registry.evict(Instant::now(), self.retention, self.max_retained);
        let entry = registry
            .by_handle
            .get(handle)
            .ok_or_else(|| ProviderError::not_found(format!("task {handle} is unknown or evicted")))?;
        if !entry.phase.is_terminal() {
            entry.cancel.send_replace(true);
            tracing::info!(handle, key = %entry.key, "cancellation requested");
        }
        Ok(entry.phase)
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.by_handle.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
