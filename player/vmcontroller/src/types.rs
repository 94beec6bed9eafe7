/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

use common::spec::VmPhase;
use std::time::Duration;

// ========================================
// CONDITIONS
// ========================================

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_FAILED: &str = "Failed";
pub const CONDITION_PROVIDER_AVAILABLE: &str = "ProviderAvailable";
pub const CONDITION_SNAPSHOTS: &str = "Snapshots";
pub const CONDITION_CLONE_MODE: &str = "CloneMode";

pub const REASON_PENDING: &str = "Pending";
pub const REASON_PROGRESSING: &str = "Progressing";
pub const REASON_CONVERGED: &str = "Converged";
pub const REASON_RETRYING: &str = "Retrying";
pub const REASON_FAILED: &str = "Failed";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_SPEC_CHANGED: &str = "SpecChanged";
pub const REASON_NEGOTIATED: &str = "Negotiated";
pub const REASON_UNKNOWN_PROVIDER: &str = "UnknownProvider";
pub const REASON_UNREACHABLE: &str = "Unreachable";
pub const REASON_INCOMPATIBLE_VERSION: &str = "IncompatibleVersion";
pub const REASON_UNSUPPORTED: &str = "Unsupported";
pub const REASON_PRESENT: &str = "Present";
pub const REASON_LINKED: &str = "Linked";
pub const REASON_FULL: &str = "Full";
pub const REASON_FULL_CLONE_FALLBACK: &str = "FullCloneFallback";
pub const REASON_DISK_SHRINK_UNSUPPORTED: &str = "DiskShrinkUnsupported";

// ========================================
// STATE MACHINE
// ========================================

pub const EVENT_PROVISION_REQUESTED: &str = "provision_requested";
pub const EVENT_CONVERGED: &str = "converged";
pub const EVENT_DELETE_REQUESTED: &str = "delete_requested";
pub const EVENT_ABSENCE_CONFIRMED: &str = "absence_confirmed";
pub const EVENT_PERMANENT_ERROR: &str = "permanent_error";
pub const EVENT_SPEC_CHANGED: &str = "spec_changed";

/// One allowed phase change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from_state: VmPhase,
    pub event: &'static str,
    pub to_state: VmPhase,
    pub action: &'static str,
}

// ========================================
// RECONCILE RESULT
// ========================================

/// What the worker should do with a key after one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Desired and observed agree; wait for the next event or resync.
    Steady,
    /// A provider task is in flight; poll again after the delay.
    Poll(Duration),
    /// A transient failure; retry after the backoff delay.
    Retry(Duration),
    /// Progress was made that needs another pass right away.
    Requeue,
    /// The status write lost an optimistic concurrency race.
    Conflict,
    /// Parked on a permanent error until the generation changes.
    Failed,
    /// The resource was removed from the store.
    Removed,
    /// The key no longer exists in the store.
    Gone,
}
