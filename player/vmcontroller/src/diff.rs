/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Desired-vs-observed diff planner.
//!
//! Pure: given the resource, the provider's current view of the machine and
//! the negotiated capabilities, pick the single next operation. Priority is
//! deletion, existence, hardware, snapshots, then power. Capability gaps are
//! answered with the documented fallback and never with the gated call.

use crate::provider::Operation;
use crate::types::{
    CONDITION_CLONE_MODE, CONDITION_SNAPSHOTS, REASON_DISK_SHRINK_UNSUPPORTED, REASON_FULL,
    REASON_FULL_CLONE_FALLBACK, REASON_LINKED, REASON_PRESENT, REASON_UNSUPPORTED,
};
use common::capability::{Capability, CapabilitySet};
use common::spec::vm::DiskSpec;
use common::spec::{ConditionStatus, ObservedVm, PowerState, VirtualMachine};
use std::collections::BTreeMap;

/// Condition the reconciler should record alongside the planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionNote {
    pub condition_type: &'static str,
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Desired and observed agree.
    InSync,
    /// Deletion requested and the VM is gone: drop the resource.
    Finalize,
    Issue(Operation),
    /// The desired state asks for something that can never be applied.
    Reject {
        reason: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub action: PlanAction,
    pub notes: Vec<ConditionNote>,
}

impl Plan {
    fn new(action: PlanAction) -> Self {
        Self {
            action,
            notes: Vec::new(),
        }
    }

    fn with_note(mut self, note: ConditionNote) -> Self {
        self.notes.push(note);
        self
    }
}

pub fn plan(
    vm: &VirtualMachine,
    observed: Option<&ObservedVm>,
    capabilities: &CapabilitySet,
    default_grace_secs: u32,
) -> Plan {
    let observed = match (vm.metadata.deletion_requested, observed) {
        (true, None) => return Plan::new(PlanAction::Finalize),
        (true, Some(_)) => return Plan::new(PlanAction::Issue(Operation::Delete)),
        (false, None) => return plan_existence(vm, capabilities),
        (false, Some(observed)) => observed,
    };

    if let Some(plan) = plan_hardware(vm, observed, capabilities) {
        return plan;
    }

    let mut notes = Vec::new();
    if let Some(plan) = plan_snapshots(vm, observed, capabilities, &mut notes) {
        return plan;
    }

    let action = plan_power(vm, observed, capabilities, default_grace_secs)
        .map_or(PlanAction::InSync, PlanAction::Issue);
    Plan { action, notes }
}

fn plan_existence(vm: &VirtualMachine, capabilities: &CapabilitySet) -> Plan {
    let spec = vm.machine_spec();
    let Some(clone_from) = &vm.spec.clone_from else {
        return Plan::new(PlanAction::Issue(Operation::Create { spec }));
    };

    let linked = clone_from.linked && capabilities.supports(Capability::LinkedClones);
    let mode = if linked {
        note(CONDITION_CLONE_MODE, ConditionStatus::True, REASON_LINKED, "linked clone")
    } else if clone_from.linked {
        note(
            CONDITION_CLONE_MODE,
            ConditionStatus::False,
            REASON_FULL_CLONE_FALLBACK,
            "provider lacks linked-clones, issuing a full clone",
        )
    } else {
        note(CONDITION_CLONE_MODE, ConditionStatus::True, REASON_FULL, "full clone")
    };

    Plan::new(PlanAction::Issue(Operation::Clone {
        source: clone_from.source.clone(),
        spec,
        linked,
    }))
    .with_note(mode)
}

fn plan_hardware(
    vm: &VirtualMachine,
    observed: &ObservedVm,
    capabilities: &CapabilitySet,
) -> Option<Plan> {
    let desired = &vm.spec;
    let current = &observed.hardware;

    let wanted: BTreeMap<&str, u64> = desired
        .disks
        .iter()
        .map(|d| (d.name.as_str(), d.size_gib))
        .collect();
    for disk in &current.disks {
        match wanted.get(disk.name.as_str()) {
            None => {
                return Some(Plan::new(PlanAction::Reject {
                    reason: REASON_DISK_SHRINK_UNSUPPORTED,
                    message: format!("disk {} cannot be removed", disk.name),
                }))
            }
            Some(size) if *size < disk.size_gib => {
                return Some(Plan::new(PlanAction::Reject {
                    reason: REASON_DISK_SHRINK_UNSUPPORTED,
                    message: format!(
                        "disk {} cannot shrink from {} GiB to {} GiB",
                        disk.name, disk.size_gib, size
                    ),
                }))
            }
            Some(_) => {}
        }
    }

    let same_disks = sorted(&desired.disks) == sorted(&current.disks);
    if desired.class.cpus == current.cpus
        && desired.class.memory_mib == current.memory_mib
        && same_disks
    {
        return None;
    }

    let op = if observed.power_state.observable() == PowerState::On
        && !capabilities.supports(Capability::OnlineReconfigure)
    {
        // the power diff brings it back up once reconfigured
        Operation::PowerOff
    } else {
        Operation::Reconfigure {
            spec: vm.machine_spec(),
        }
    };
    Some(Plan::new(PlanAction::Issue(op)))
}

fn plan_snapshots(
    vm: &VirtualMachine,
    observed: &ObservedVm,
    capabilities: &CapabilitySet,
    notes: &mut Vec<ConditionNote>,
) -> Option<Plan> {
    if vm.spec.snapshots.is_empty() {
        return None;
    }
    let missing: Vec<&String> = vm
        .spec
        .snapshots
        .iter()
        .filter(|name| !observed.snapshots.contains(name))
        .collect();

    let Some(first) = missing.first() else {
        notes.push(note(
            CONDITION_SNAPSHOTS,
            ConditionStatus::True,
            REASON_PRESENT,
            "all desired snapshots exist",
        ));
        return None;
    };

    if capabilities.supports(Capability::Snapshots) {
        return Some(Plan::new(PlanAction::Issue(Operation::SnapshotCreate {
            name: (*first).clone(),
        })));
    }
    notes.push(note(
        CONDITION_SNAPSHOTS,
        ConditionStatus::False,
        REASON_UNSUPPORTED,
        format!("provider lacks snapshots, {} desired snapshot(s) missing", missing.len()),
    ));
    None
}

fn plan_power(
    vm: &VirtualMachine,
    observed: &ObservedVm,
    capabilities: &CapabilitySet,
    default_grace_secs: u32,
) -> Option<Operation> {
    let current = observed.power_state.observable();
    match (vm.spec.power_state, current) {
        (PowerState::On, PowerState::Off | PowerState::Suspended) => Some(Operation::PowerOn),
        (PowerState::Off, PowerState::On | PowerState::Suspended) => Some(Operation::PowerOff),
        (PowerState::OffGraceful, PowerState::On) => {
            if capabilities.supports(Capability::GuestAgent) {
                Some(Operation::PowerOffGraceful {
                    grace_secs: vm.spec.graceful_shutdown_secs.unwrap_or(default_grace_secs),
                })
            } else {
                Some(Operation::PowerOff)
            }
        }
        // a suspended guest cannot cooperate with a shutdown
        (PowerState::OffGraceful, PowerState::Suspended) => Some(Operation::PowerOff),
        (PowerState::Suspended, PowerState::On) => Some(Operation::Suspend),
        (PowerState::Suspended, PowerState::Off) => Some(Operation::PowerOn),
        _ => None,
    }
}

fn sorted(disks: &[DiskSpec]) -> Vec<(&str, u64)> {
    let mut v: Vec<(&str, u64)> = disks.iter().map(|d| (d.name.as_str(), d.size_gib)).collect();
    v.sort_unstable();
    v
}

fn note(
    condition_type: &'static str,
    status: ConditionStatus,
    reason: &'static str,
    message: impl Into<String>,
) -> ConditionNote {
    ConditionNote {
        condition_type,
        status,
        reason,
        message: message.into(),
    }
}
