/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Controller-side view of a provider.
//!
//! The reconciler only talks to [`ProviderService`]; the gRPC implementation
//! lives in `grpc::sender::provider` and tests substitute fakes or mocks.

pub mod registry;

#[cfg(test)]
pub(crate) mod fake;

use common::capability::CapabilitySet;
use common::error::{ErrorKind, ProviderError};
use common::spec::vm::MachineSpec;
use common::spec::ObservedVm;
use common::task::{OperationKind, TaskPhase};
use thiserror::Error;

/// A mutating intent the controller asks a provider to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create { spec: MachineSpec },
    Clone {
        source: String,
        spec: MachineSpec,
        linked: bool,
    },
    Delete,
    PowerOn,
    PowerOff,
    PowerOffGraceful { grace_secs: u32 },
    Suspend,
    Reconfigure { spec: MachineSpec },
    SnapshotCreate { name: String },
    SnapshotDelete { name: String },
    SnapshotRevert { name: String },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create { .. } => OperationKind::Create,
            Operation::Clone { .. } => OperationKind::Clone,
            Operation::Delete => OperationKind::Delete,
            Operation::PowerOn => OperationKind::PowerOn,
            Operation::PowerOff => OperationKind::PowerOff,
            Operation::PowerOffGraceful { .. } => OperationKind::PowerOffGraceful,
            Operation::Suspend => OperationKind::Suspend,
            Operation::Reconfigure { .. } => OperationKind::Reconfigure,
            Operation::SnapshotCreate { .. } => OperationKind::SnapshotCreate,
            Operation::SnapshotDelete { .. } => OperationKind::SnapshotDelete,
            Operation::SnapshotRevert { .. } => OperationKind::SnapshotRevert,
        }
    }
}

/// Result of one `PollTask` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPoll {
    pub phase: TaskPhase,
    pub result: Option<ObservedVm>,
    pub error: Option<ProviderError>,
}

/// Answer to `GetCapabilities`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub protocol_version: String,
    pub family: String,
    pub capabilities: CapabilitySet,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider speaks protocol {server}, controller speaks {client}")]
    IncompatibleVersion { server: String, client: String },
}

impl ClientError {
    /// Taxonomy kind, if the error came from the provider.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Provider(err) => Some(err.kind),
            ClientError::IncompatibleVersion { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(ErrorKind::NotFound)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync {
    /// Negotiate protocol version and read the advertised capabilities.
    async fn capabilities(&self) -> Result<ProviderInfo, ClientError>;

    /// Issue a mutating operation keyed by `key`; returns the task handle.
    async fn submit(&self, vm_ref: &str, key: &str, op: Operation) -> Result<String, ClientError>;

    /// Current backend view of `vm_ref`; `None` when the VM does not exist.
    async fn describe(&self, vm_ref: &str) -> Result<Option<ObservedVm>, ClientError>;

    async fn poll_task(&self, handle: &str) -> Result<TaskPoll, ClientError>;

    async fn cancel_task(&self, handle: &str) -> Result<TaskPhase, ClientError>;

    async fn health_check(&self) -> Result<bool, ClientError>;
}
