/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Resource store abstraction consumed by the controller.
//!
//! The store is the single source of truth for desired spec and status.
//! Status writes carry the `resource_version` the caller read; a stale write
//! is rejected with [`StoreError::VersionConflict`]. Change notification is a
//! pull-based sequence resumable from a revision cursor.

use common::spec::{ResourceKey, VirtualMachine, VmStatus};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: ResourceKey,
        expected: u64,
        actual: u64,
    },
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("watch cursor {cursor} expired, oldest retained revision is {oldest}")]
    Expired { cursor: u64, oldest: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: VirtualMachine,
    /// Store revision at which this change happened; the next cursor.
    pub resource_version: u64,
}

/// Trait for VirtualMachine storage operations
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<VirtualMachine>, StoreError>;

    /// Every resource plus the store revision the listing reflects.
    async fn list(&self) -> Result<(Vec<VirtualMachine>, u64), StoreError>;

    /// Replace the status of `key` if its version is still `expected_version`.
    async fn update_status(
        &self,
        key: &ResourceKey,
        status: VmStatus,
        expected_version: u64,
    ) -> Result<VirtualMachine, StoreError>;

    /// Remove a resource whose deletion has been confirmed by its provider.
    async fn remove(&self, key: &ResourceKey, expected_version: u64) -> Result<(), StoreError>;

    /// Wait for the first change after `cursor`.
    async fn next_event(&self, cursor: u64) -> Result<WatchEvent, StoreError>;
}
