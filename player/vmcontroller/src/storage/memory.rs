/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-process resource store with revisioned objects and a bounded event log.

use super::{ResourceStore, StoreError, WatchEvent, WatchEventType};
use common::spec::{ResourceKey, VirtualMachine, VmStatus, KIND_VIRTUAL_MACHINE};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceKey, VirtualMachine>,
    revision: u64,
    events: VecDeque<WatchEvent>,
    /// Revision of the newest event dropped from the log.
    compacted: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
    event_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            event_capacity: event_capacity.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn record(&self, inner: &mut Inner, event_type: WatchEventType, object: VirtualMachine) {
        inner.events.push_back(WatchEvent {
            event_type,
            resource_version: object.metadata.resource_version,
            object,
        });
        while inner.events.len() > self.event_capacity {
            if let Some(dropped) = inner.events.pop_front() {
                inner.compacted = dropped.resource_version;
            }
        }
    }

    /// Create or update the desired spec of a resource.
    ///
    /// New resources get a fresh uid and generation 1. A changed spec bumps
    /// the generation; status is never taken from the caller.
    pub fn apply(&self, mut vm: VirtualMachine) -> Result<VirtualMachine, StoreError> {
        let key = vm.key();
        let mut inner = self.lock()?;

        let event_type = match inner.objects.get(&key) {
            Some(current) if current.spec == vm.spec => return Ok(current.clone()),
            Some(current) => {
                let mut updated = current.clone();
                updated.spec = vm.spec;
                updated.metadata.generation += 1;
                vm = updated;
                WatchEventType::Modified
            }
            None => {
                vm.metadata.uid = uuid::Uuid::new_v4().to_string();
                vm.metadata.generation = 1;
                vm.metadata.deletion_requested = false;
                vm.kind = Some(KIND_VIRTUAL_MACHINE.to_string());
                vm.status = VmStatus::default();
                WatchEventType::Added
            }
        };

        inner.revision += 1;
        vm.metadata.resource_version = inner.revision;
        inner.objects.insert(key, vm.clone());
        self.record(&mut inner, event_type, vm.clone());
        drop(inner);
        self.notify.notify_waiters();
        Ok(vm)
    }

    /// Mark a resource for deletion; the controller removes it once the
    /// provider confirms the VM is gone.
    pub fn request_deletion(&self, key: &ResourceKey) -> Result<VirtualMachine, StoreError> {
        let mut inner = self.lock()?;
        let revision = inner.revision + 1;
        let vm = match inner.objects.get_mut(key) {
            Some(vm) if vm.metadata.deletion_requested => return Ok(vm.clone()),
            Some(vm) => {
                vm.metadata.deletion_requested = true;
                vm.metadata.generation += 1;
                vm.metadata.resource_version = revision;
                vm.clone()
            }
            None => return Err(StoreError::NotFound(key.clone())),
        };
        inner.revision = revision;
        self.record(&mut inner, WatchEventType::Modified, vm.clone());
        drop(inner);
        self.notify.notify_waiters();
        Ok(vm)
    }

    pub fn revision(&self) -> u64 {
        self.lock().map(|i| i.revision).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|i| i.objects.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<VirtualMachine>, StoreError> {
        Ok(self.lock()?.objects.get(key).cloned())
    }

    async fn list(&self) -> Result<(Vec<VirtualMachine>, u64), StoreError> {
        let inner = self.lock()?;
        Ok((inner.objects.values().cloned().collect(), inner.revision))
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        status: VmStatus,
        expected_version: u64,
    ) -> Result<VirtualMachine, StoreError> {
        let mut inner = self.lock()?;
        let revision = inner.revision + 1;
        let vm = match inner.objects.get_mut(key) {
            Some(vm) if vm.metadata.resource_version != expected_version => {
                return Err(StoreError::VersionConflict {
                    key: key.clone(),
                    expected: expected_version,
                    actual: vm.metadata.resource_version,
                });
            }
            Some(vm) => {
                vm.status = status;
                vm.metadata.resource_version = revision;
                vm.clone()
            }
            None => return Err(StoreError::NotFound(key.clone())),
        };
        inner.revision = revision;
        self.record(&mut inner, WatchEventType::Modified, vm.clone());
        drop(inner);
        self.notify.notify_waiters();
        Ok(vm)
    }

    async fn remove(&self, key: &ResourceKey, expected_version: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let actual = match inner.objects.get(key) {
            Some(vm) => vm.metadata.resource_version,
            None => return Err(StoreError::NotFound(key.clone())),
        };
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }
        if let Some(mut vm) = inner.objects.remove(key) {
            inner.revision += 1;
            vm.metadata.resource_version = inner.revision;
            self.record(&mut inner, WatchEventType::Deleted, vm);
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_event(&self, cursor: u64) -> Result<WatchEvent, StoreError> {
        loop {
            // registered before the check so a write in between still wakes us
            let notified = self.notify.notified();
            {
                let inner = self.lock()?;
                if cursor < inner.compacted {
                    return Err(StoreError::Expired {
                        cursor,
                        oldest: inner.compacted + 1,
                    });
                }
                if let Some(event) = inner.events.iter().find(|e| e.resource_version > cursor) {
                    return Ok(event.clone());
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::spec::VmSpec;
    use std::sync::Arc;
    use std::time::Duration;

    fn spec(cpus: u32) -> VmSpec {
        serde_yaml::from_str(&format!(
            "provider: lab\nimage: alpine\nclass:\n  cpus: {cpus}\n  memoryMib: 512\n"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_assigns_identity_and_bumps_generation_on_change() {
        let store = MemoryStore::new();
        let created = store.apply(VirtualMachine::new("default", "web", spec(1))).unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert_eq!(created.metadata.resource_version, 1);

        // same spec is a no-op
        let same = store.apply(VirtualMachine::new("default", "web", spec(1))).unwrap();
        assert_eq!(same.metadata.resource_version, 1);

        let changed = store.apply(VirtualMachine::new("default", "web", spec(2))).unwrap();
        assert_eq!(changed.metadata.generation, 2);
        assert_eq!(changed.metadata.uid, created.metadata.uid);
        assert_eq!(changed.metadata.resource_version, 2);
    }

    #[tokio::test]
    async fn test_update_status_rejects_stale_version() {
        let store = MemoryStore::new();
        let vm = store.apply(VirtualMachine::new("default", "web", spec(1))).unwrap();
        let key = vm.key();

        // a spec update lands between read and write
        store.apply(VirtualMachine::new("default", "web", spec(4))).unwrap();

        let err = store
            .update_status(&key, VmStatus::default(), vm.metadata.resource_version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, actual: 2, .. }));

        let fresh = store.get(&key).await.unwrap().unwrap();
        let mut status = VmStatus::default();
        status.observed_generation = fresh.metadata.generation;
        let written = store
            .update_status(&key, status, fresh.metadata.resource_version)
            .await
            .unwrap();
        assert_eq!(written.spec.class.cpus, 4);
        assert_eq!(written.status.observed_generation, 2);
    }

    #[tokio::test]
    async fn test_request_deletion_then_remove() {
        let store = MemoryStore::new();
        let vm = store.apply(VirtualMachine::new("default", "web", spec(1))).unwrap();
        let marked = store.request_deletion(&vm.key()).unwrap();
        assert!(marked.metadata.deletion_requested);
        assert_eq!(marked.metadata.generation, 2);

        assert!(store.remove(&vm.key(), vm.metadata.resource_version).await.is_err());
        store
            .remove(&vm.key(), marked.metadata.resource_version)
            .await
            .unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.request_deletion(&vm.key()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_next_event_waits_and_resumes_from_cursor() {
        let store = Arc::new(MemoryStore::new());
        store.apply(VirtualMachine::new("default", "a", spec(1))).unwrap();

        let first = store.next_event(0).await.unwrap();
        assert_eq!(first.event_type, WatchEventType::Added);
        assert_eq!(first.resource_version, 1);

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.next_event(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.apply(VirtualMachine::new("default", "b", spec(1))).unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.object.metadata.name, "b");
        assert_eq!(second.resource_version, 2);
    }

    #[tokio::test]
    async fn test_compacted_cursor_expires() {
        let store = MemoryStore::with_event_capacity(2);
        for name in ["a", "b", "c", "d"] {
            store.apply(VirtualMachine::new("default", name, spec(1))).unwrap();
        }
        assert!(matches!(
            store.next_event(0).await,
            Err(StoreError::Expired { cursor: 0, oldest: 3 })
        ));
        assert_eq!(store.next_event(2).await.unwrap().resource_version, 3);
    }
}
