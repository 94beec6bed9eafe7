/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Task identity shared by controller and providers.
//!
//! A [`TaskKey`] is derived only from persisted resource state, so re-deriving
//! it after a crash or a lost status write yields the same string and the
//! provider answers with the task it already started.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Create,
    Clone,
    Delete,
    PowerOn,
    PowerOff,
    PowerOffGraceful,
    Suspend,
    Reconfigure,
    SnapshotCreate,
    SnapshotDelete,
    SnapshotRevert,
}

/// Operations in one category must never overlap for the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationCategory {
    Lifecycle,
    Power,
    Config,
    Snapshot,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Clone => "clone",
            OperationKind::Delete => "delete",
            OperationKind::PowerOn => "power-on",
            OperationKind::PowerOff => "power-off",
            OperationKind::PowerOffGraceful => "power-off-graceful",
            OperationKind::Suspend => "suspend",
            OperationKind::Reconfigure => "reconfigure",
            OperationKind::SnapshotCreate => "snapshot-create",
            OperationKind::SnapshotDelete => "snapshot-delete",
            OperationKind::SnapshotRevert => "snapshot-revert",
        }
    }

    pub fn category(&self) -> OperationCategory {
        match self {
            OperationKind::Create | OperationKind::Clone | OperationKind::Delete => {
                OperationCategory::Lifecycle
            }
            OperationKind::PowerOn
            | OperationKind::PowerOff
            | OperationKind::PowerOffGraceful
            | OperationKind::Suspend => OperationCategory::Power,
            OperationKind::Reconfigure => OperationCategory::Config,
            OperationKind::SnapshotCreate
            | OperationKind::SnapshotDelete
            | OperationKind::SnapshotRevert => OperationCategory::Snapshot,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic idempotency key for one intended side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub uid: String,
    pub generation: u64,
    pub kind: OperationKind,
    /// Number of tasks already retired for this resource.
    pub seq: u64,
}

impl TaskKey {
    pub fn new(uid: impl Into<String>, generation: u64, kind: OperationKind, seq: u64) -> Self {
        Self {
            uid: uid.into(),
            generation,
            kind,
            seq,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.uid, self.generation, self.kind)?;
        if self.seq > 0 {
            write!(f, "#{}", self.seq)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Succeeded | TaskPhase::Failed | TaskPhase::Canceled
        )
    }
}
