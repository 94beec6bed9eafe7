/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Hypervisor backend seam.
//!
//! A backend speaks its family's native vocabulary: native errors and native
//! job objects. Everything here turns that into tracked, classified provider
//! outcomes before it reaches the wire.

pub mod libvirt;
pub mod proxmox;
pub mod simulated;
pub mod vsphere;

use common::capability::{Capability, CapabilitySet};
use common::error::{ErrorKind, ProviderError};
use common::spec::vm::{MachineSpec, ObservedVm};
use common::spec::ProviderFamily;
use common::task::OperationKind;
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;

use crate::task::CancelSignal;

pub use simulated::SimulatedHypervisor;

/// Interval at which a tracked task re-checks a backend job.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A failure in the backend's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    /// virErrorNumber plus message.
    Libvirt { code: i32, message: String },
    /// vSphere fault type name plus localized message.
    Vsphere { fault: String, message: String },
    /// Proxmox API HTTP status plus response text.
    Proxmox { status: u16, message: String },
    /// The backend endpoint could not be reached at all.
    Unreachable(String),
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeError::Libvirt { code, message } => write!(f, "libvirt error {code}: {message}"),
            NativeError::Vsphere { fault, message } => write!(f, "vSphere fault {fault}: {message}"),
            NativeError::Proxmox { status, message } => write!(f, "proxmox HTTP {status}: {message}"),
            NativeError::Unreachable(message) => write!(f, "backend unreachable: {message}"),
        }
    }
}

impl NativeError {
    /// Map into exactly one taxonomy kind.
    pub fn classify(&self) -> ProviderError {
        match self {
            NativeError::Libvirt { code, message } => libvirt::classify(*code, message),
            NativeError::Vsphere { fault, message } => vsphere::classify(fault, message),
            NativeError::Proxmox { status, message } => proxmox::classify(*status, message),
            NativeError::Unreachable(message) => {
                ProviderError::unavailable(format!("backend unreachable: {message}"))
            }
        }
    }
}

/// Family-neutral failure shapes the simulated backend can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NoSuchVm,
    NoSuchSnapshot,
    Duplicate,
    InvalidRequest,
    Unsupported,
    Aborted,
    Busy,
    HostDown,
    Crash,
}

/// Native error a backend of `family` reports for `fault`.
pub fn native_error(family: ProviderFamily, fault: Fault, message: impl Into<String>) -> NativeError {
    let message = message.into();
    match family {
        ProviderFamily::Libvirt => libvirt::native(fault, message),
        ProviderFamily::Vsphere => vsphere::native(fault, message),
        ProviderFamily::Proxmox => proxmox::native(fault, message),
    }
}

pub fn default_capabilities(family: ProviderFamily) -> CapabilitySet {
    match family {
        ProviderFamily::Libvirt => libvirt::default_capabilities(),
        ProviderFamily::Vsphere => vsphere::default_capabilities(),
        ProviderFamily::Proxmox => proxmox::default_capabilities(),
    }
}

/// A generic VM intent handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    Create { spec: MachineSpec },
    Clone { source: String, spec: MachineSpec, linked: bool },
    Delete { vm_ref: String },
    PowerOn { vm_ref: String },
    PowerOff { vm_ref: String },
    Shutdown { vm_ref: String, grace: Duration },
    Suspend { vm_ref: String },
    Reconfigure { vm_ref: String, spec: MachineSpec },
    SnapshotCreate { vm_ref: String, name: String },
    SnapshotDelete { vm_ref: String, name: String },
    SnapshotRevert { vm_ref: String, name: String },
}

impl BackendOp {
    pub fn kind(&self) -> OperationKind {
        match self {
            BackendOp::Create { .. } => OperationKind::Create,
            BackendOp::Clone { .. } => OperationKind::Clone,
            BackendOp::Delete { .. } => OperationKind::Delete,
            BackendOp::PowerOn { .. } => OperationKind::PowerOn,
            BackendOp::PowerOff { .. } => OperationKind::PowerOff,
            BackendOp::Shutdown { .. } => OperationKind::PowerOffGraceful,
            BackendOp::Suspend { .. } => OperationKind::Suspend,
            BackendOp::Reconfigure { .. } => OperationKind::Reconfigure,
            BackendOp::SnapshotCreate { .. } => OperationKind::SnapshotCreate,
            BackendOp::SnapshotDelete { .. } => OperationKind::SnapshotDelete,
            BackendOp::SnapshotRevert { .. } => OperationKind::SnapshotRevert,
        }
    }

    /// Name of the machine the operation targets.
    pub fn vm_ref(&self) -> &str {
        match self {
            BackendOp::Create { spec } | BackendOp::Clone { spec, .. } => &spec.name,
            BackendOp::Delete { vm_ref }
            | BackendOp::PowerOn { vm_ref }
            | BackendOp::PowerOff { vm_ref }
            | BackendOp::Shutdown { vm_ref, .. }
            | BackendOp::Suspend { vm_ref }
            | BackendOp::Reconfigure { vm_ref, .. }
            | BackendOp::SnapshotCreate { vm_ref, .. }
            | BackendOp::SnapshotDelete { vm_ref, .. }
            | BackendOp::SnapshotRevert { vm_ref, .. } => vm_ref,
        }
    }

    /// Capability the operation needs, beyond core.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            BackendOp::Clone { linked: true, .. } => Some(Capability::LinkedClones),
            BackendOp::Shutdown { .. } => Some(Capability::GuestAgent),
            BackendOp::SnapshotCreate { .. }
            | BackendOp::SnapshotDelete { .. }
            | BackendOp::SnapshotRevert { .. } => Some(Capability::Snapshots),
            _ => None,
        }
    }
}

/// What a backend hands back when asked to start an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendJob {
    /// The backend finished synchronously.
    Done(Option<ObservedVm>),
    /// A native job object to poll.
    Started(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Done(Option<ObservedVm>),
    Failed(NativeError),
}

#[async_trait::async_trait]
pub trait HypervisorBackend: Send + Sync + 'static {
    fn family(&self) -> ProviderFamily;

    /// Best-known state of `vm_ref`; `None` when the VM does not exist.
    async fn describe(&self, vm_ref: &str) -> Result<Option<ObservedVm>, NativeError>;

    async fn start(&self, op: BackendOp) -> Result<BackendJob, NativeError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, NativeError>;

    /// Best-effort abort of a native job.
    async fn cancel_job(&self, job_id: &str) -> Result<(), NativeError>;

    async fn ping(&self) -> Result<(), NativeError>;
}

/// Drive one backend operation to a classified outcome.
///
/// Runs inside a tracked task. Deleting a VM that is already gone counts as
/// success.
pub async fn execute(
    backend: Arc<dyn HypervisorBackend>,
    op: BackendOp,
    cancel: CancelSignal,
    poll_interval: Duration,
) -> Result<Option<ObservedVm>, ProviderError> {
    let is_delete = matches!(op, BackendOp::Delete { .. });
    let vm_ref = op.vm_ref().to_string();
    match drive(backend.as_ref(), op, cancel, poll_interval).await {
        Err(err) if is_delete && err.kind == ErrorKind::NotFound => {
            tracing::info!(%vm_ref, "delete target already absent");
            Ok(None)
        }
        other => other,
    }
}

async fn drive(
    backend: &dyn HypervisorBackend,
    op: BackendOp,
    mut cancel: CancelSignal,
    poll_interval: Duration,
) -> Result<Option<ObservedVm>, ProviderError> {
    if cancel.is_canceled() {
        return Err(ProviderError::canceled("canceled before dispatch"));
    }

    let job_id = match backend.start(op).await.map_err(|e| e.classify())? {
        BackendJob::Done(observed) => return Ok(observed),
        BackendJob::Started(job_id) => job_id,
    };

    let mut abort_sent = false;
    loop {
        if abort_sent {
            tokio::time::sleep(poll_interval).await;
        } else {
            tokio::select! {
                _ = cancel.canceled() => {
                    abort_sent = true;
                    if let Err(e) = backend.cancel_job(&job_id).await {
                        tracing::warn!(%job_id, error = %e, "backend refused job abort");
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        match backend.job_status(&job_id).await {
            Ok(JobStatus::Running) => continue,
            Ok(JobStatus::Done(observed)) => return Ok(observed),
            Ok(JobStatus::Failed(native)) => return Err(native.classify()),
            Err(native) => {
                let err = native.classify();
                // a lost connection does not mean the job stopped
                if err.kind == ErrorKind::Unavailable {
                    tracing::warn!(%job_id, error = %native, "job status unavailable; retrying");
                    continue;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_is_unavailable_for_every_family() {
        let err = NativeError::Unreachable("connection refused".into()).classify();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[test]
    fn test_every_fault_classifies_consistently_across_families() {
        let expected = [
            (Fault::NoSuchVm, ErrorKind::NotFound),
            (Fault::NoSuchSnapshot, ErrorKind::NotFound),
            (Fault::Duplicate, ErrorKind::AlreadyExists),
            (Fault::InvalidRequest, ErrorKind::InvalidArgument),
            (Fault::Unsupported, ErrorKind::Unimplemented),
            (Fault::Aborted, ErrorKind::Canceled),
            (Fault::Busy, ErrorKind::Unavailable),
            (Fault::HostDown, ErrorKind::Unavailable),
            (Fault::Crash, ErrorKind::Internal),
        ];
        for family in [
            ProviderFamily::Libvirt,
            ProviderFamily::Vsphere,
            ProviderFamily::Proxmox,
        ] {
            for (fault, kind) in expected {
                let native = native_error(family, fault, "x");
                assert_eq!(native.classify().kind, kind, "{family} {fault:?} -> {native}");
            }
        }
    }

    #[test]
    fn test_required_capabilities() {
        let spec = MachineSpec {
            name: "vm".into(),
            cpus: 1,
            memory_mib: 512,
            image: "img".into(),
            networks: vec![],
            disks: vec![],
        };
        let full = BackendOp::Clone {
            source: "base".into(),
            spec: spec.clone(),
            linked: false,
        };
        let linked = BackendOp::Clone {
            source: "base".into(),
            spec,
            linked: true,
        };
        assert_eq!(full.required_capability(), None);
        assert_eq!(linked.required_capability(), Some(Capability::LinkedClones));
        assert_eq!(
            BackendOp::Shutdown {
                vm_ref: "vm".into(),
                grace: Duration::from_secs(60)
            }
            .required_capability(),
            Some(Capability::GuestAgent)
        );
        assert_eq!(linked.vm_ref(), "vm");
    }
}
