/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider wire contract (`provider.v1`) and its mapping onto domain types.

include!("generated/provider.v1.rs");

use crate::error::ProviderError;
use crate::spec::vm::{DiskSpec, HardwareSummary, MachineSpec, ObservedVm};
use const_format::concatcp;

/// Version spoken by this build. Peers interoperate when the major matches.
pub const PROTOCOL_VERSION: &str = "1.0";

pub const DEFAULT_PORT: u16 = 9443;
pub const DEFAULT_LISTEN_ADDR: &str = concatcp!("0.0.0.0:", DEFAULT_PORT);
pub const DEFAULT_ENDPOINT: &str = concatcp!("http://127.0.0.1:", DEFAULT_PORT);

/// Listen address for a provider server.
pub fn open_server(port: u16) -> String {
    format!("0.0.0.0:{port}")
}

/// Normalize a configured endpoint into a URI tonic can dial.
pub fn connect_server(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        DEFAULT_ENDPOINT.to_string()
    } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

fn major(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}

pub fn is_compatible(peer_version: &str) -> bool {
    match (major(PROTOCOL_VERSION), major(peer_version)) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => false,
    }
}

// ========================================
// ENUM CONVERSIONS
// ========================================

impl From<crate::error::ErrorKind> for ErrorKind {
    fn from(kind: crate::error::ErrorKind) -> Self {
        use crate::error::ErrorKind as K;
        match kind {
            K::NotFound => ErrorKind::NotFound,
            K::AlreadyExists => ErrorKind::AlreadyExists,
            K::Unavailable => ErrorKind::Unavailable,
            K::InvalidArgument => ErrorKind::InvalidArgument,
            K::Internal => ErrorKind::Internal,
            K::Canceled => ErrorKind::Canceled,
            K::Unimplemented => ErrorKind::Unimplemented,
        }
    }
}

impl From<ErrorKind> for crate::error::ErrorKind {
    fn from(kind: ErrorKind) -> Self {
        use crate::error::ErrorKind as K;
        match kind {
            ErrorKind::NotFound => K::NotFound,
            ErrorKind::AlreadyExists => K::AlreadyExists,
            ErrorKind::Unavailable => K::Unavailable,
            ErrorKind::InvalidArgument => K::InvalidArgument,
            ErrorKind::Canceled => K::Canceled,
            ErrorKind::Unimplemented => K::Unimplemented,
            ErrorKind::Internal | ErrorKind::Unspecified => K::Internal,
        }
    }
}

impl From<crate::task::TaskPhase> for TaskPhase {
    fn from(phase: crate::task::TaskPhase) -> Self {
        use crate::task::TaskPhase as P;
        match phase {
            P::Pending => TaskPhase::Pending,
            P::Running => TaskPhase::Running,
            P::Succeeded => TaskPhase::Succeeded,
            P::Failed => TaskPhase::Failed,
            P::Canceled => TaskPhase::Canceled,
        }
    }
}

impl From<TaskPhase> for crate::task::TaskPhase {
    fn from(phase: TaskPhase) -> Self {
        use crate::task::TaskPhase as P;
        match phase {
            TaskPhase::Unspecified | TaskPhase::Pending => P::Pending,
            TaskPhase::Running => P::Running,
            TaskPhase::Succeeded => P::Succeeded,
            TaskPhase::Failed => P::Failed,
            TaskPhase::Canceled => P::Canceled,
        }
    }
}

impl From<crate::spec::PowerState> for PowerState {
    fn from(power: crate::spec::PowerState) -> Self {
        use crate::spec::PowerState as S;
        match power {
            S::On => PowerState::On,
            S::Off | S::OffGraceful => PowerState::Off,
            S::Suspended => PowerState::Suspended,
        }
    }
}

impl From<PowerState> for crate::spec::PowerState {
    fn from(power: PowerState) -> Self {
        use crate::spec::PowerState as S;
        match power {
            PowerState::On => S::On,
            PowerState::Suspended => S::Suspended,
            PowerState::Off | PowerState::Unspecified => S::Off,
        }
    }
}

// ========================================
// MESSAGE CONVERSIONS
// ========================================

impl From<&DiskSpec> for Disk {
    fn from(disk: &DiskSpec) -> Self {
        Disk {
            name: disk.name.clone(),
            size_gib: disk.size_gib,
        }
    }
}

impl From<&Disk> for DiskSpec {
    fn from(disk: &Disk) -> Self {
        DiskSpec {
            name: disk.name.clone(),
            size_gib: disk.size_gib,
        }
    }
}

impl From<&MachineSpec> for VmSpec {
    fn from(spec: &MachineSpec) -> Self {
        VmSpec {
            name: spec.name.clone(),
            cpus: spec.cpus,
            memory_mib: spec.memory_mib,
            image: spec.image.clone(),
            networks: spec
                .networks
                .iter()
                .map(|n| NetworkAttachment {
                    network: n.network.clone(),
                    mac_address: n.mac_address.clone().unwrap_or_default(),
                })
                .collect(),
            disks: spec.disks.iter().map(Disk::from).collect(),
        }
    }
}

impl From<&VmSpec> for MachineSpec {
    fn from(spec: &VmSpec) -> Self {
        MachineSpec {
            name: spec.name.clone(),
            cpus: spec.cpus,
            memory_mib: spec.memory_mib,
            image: spec.image.clone(),
            networks: spec
                .networks
                .iter()
                .map(|n| crate::spec::vm::NetworkAttachment {
                    network: n.network.clone(),
                    mac_address: (!n.mac_address.is_empty()).then(|| n.mac_address.clone()),
                })
                .collect(),
            disks: spec.disks.iter().map(DiskSpec::from).collect(),
        }
    }
}

impl From<&ObservedVm> for VmObservation {
    fn from(vm: &ObservedVm) -> Self {
        VmObservation {
            vm_ref: vm.vm_ref.clone(),
            vm_id: vm.vm_id.clone(),
            power_state: PowerState::from(vm.power_state) as i32,
            ip_addresses: vm.ip_addresses.clone(),
            hardware_version: vm.hardware_version.clone(),
            cpus: vm.hardware.cpus,
            memory_mib: vm.hardware.memory_mib,
            disks: vm.hardware.disks.iter().map(Disk::from).collect(),
            snapshots: vm.snapshots.clone(),
        }
    }
}

impl From<&VmObservation> for ObservedVm {
    fn from(vm: &VmObservation) -> Self {
        ObservedVm {
            vm_ref: vm.vm_ref.clone(),
            vm_id: vm.vm_id.clone(),
            power_state: vm.power_state().into(),
            ip_addresses: vm.ip_addresses.clone(),
            hardware_version: vm.hardware_version.clone(),
            hardware: HardwareSummary {
                cpus: vm.cpus,
                memory_mib: vm.memory_mib,
                disks: vm.disks.iter().map(DiskSpec::from).collect(),
            },
            snapshots: vm.snapshots.clone(),
        }
    }
}

impl From<&ProviderError> for TaskError {
    fn from(err: &ProviderError) -> Self {
        TaskError {
            kind: ErrorKind::from(err.kind) as i32,
            message: err.message.clone(),
        }
    }
}

impl From<&TaskError> for ProviderError {
    fn from(err: &TaskError) -> Self {
        ProviderError::new(err.kind().into(), err.message.clone())
    }
}
