/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! VM reconciliation controller.
//!
//! Watches `VirtualMachine` resources in a [`storage::ResourceStore`], diffs
//! desired against observed state and drives remote providers through
//! idempotent, task-tracked operations until the two agree.

pub mod artifact;
pub mod backoff;
pub mod diff;
pub mod grpc;
pub mod manager;
pub mod provider;
pub mod queue;
pub mod reconciler;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use manager::ControllerManager;
pub use provider::registry::{ProviderBinding, ProviderRegistry};
pub use reconciler::Reconciler;
pub use storage::memory::MemoryStore;
pub use storage::ResourceStore;
