/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Declarative resources handled by the control plane

pub mod provider;
pub mod vm;

pub use provider::{ProviderDescriptor, ProviderFamily};
pub use vm::{
    Condition, ConditionStatus, HardwareSummary, MachineSpec, ObjectMeta, ObservedVm, PowerState,
    ResourceKey, TaskRef, VirtualMachine, VmPhase, VmSpec, VmStatus,
};

// Manifest kinds
pub const KIND_VIRTUAL_MACHINE: &str = "VirtualMachine";
pub const KIND_PROVIDER: &str = "Provider";
