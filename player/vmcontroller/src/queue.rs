/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Per-key deduplicating work queue.
//!
//! A key is either queued, being processed, or neither. Adding a queued key
//! is a no-op; adding a key that is being processed marks it dirty and it is
//! queued exactly once when [`WorkQueue::done`] is called. This keeps at most
//! one reconcile per key in flight and collapses event storms.

use common::spec::ResourceKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ResourceKey>,
    queued: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    /// Token of the latest delayed add per key; stale timers are ignored.
    delayed: HashMap<ResourceKey, u64>,
    next_token: u64,
    shutting_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // the state holds only sets of keys, so a poisoned guard is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: ResourceKey) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed, replacing any earlier pending
    /// delayed add for the same key.
    pub fn add_after(self: &Arc<Self>, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let token = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.next_token += 1;
            let token = state.next_token;
            state.delayed.insert(key.clone(), token);
            token
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut state = queue.lock();
                match state.delayed.get(&key) {
                    Some(t) if *t == token => {
                        state.delayed.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                queue.add(key);
            }
        });
    }

    /// Drop any pending delayed add for `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.lock().delayed.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &ResourceKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_pending_delay(&self, key: &ResourceKey) -> bool {
        self.lock().delayed.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name)
    }

    #[tokio::test]
    async fn test_add_deduplicates_queued_keys() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_once_on_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let k = queue.get().await.unwrap();

        // three events arrive while the reconcile is running
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("a"));
        assert!(queue.is_empty(), "in-flight key must not be queued twice");

        queue.done(&k);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
        queue.done(&key("a"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_fires_and_latest_wins() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(10));
        queue.add_after(key("a"), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
        queue.done(&key("a"));

        // the superseded 10s timer must not add it again
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_delayed_add() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(1));
        assert!(queue.has_pending_delay(&key("a")));
        queue.forget(&key("a"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_workers() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("late"));
        assert!(queue.is_empty());
    }
}
