/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! VirtualMachine resource: desired spec plus controller-owned status.
//!
//! Only the reconciliation controller writes `status`. Providers report what
//! they observe through [`ObservedVm`] and never touch the resource itself.

use crate::task::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on retained condition transitions per resource.
pub const CONDITION_HISTORY_LIMIT: usize = 32;

pub const DEFAULT_NAMESPACE: &str = "default";

// ========================================
// IDENTITY
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`; a bare name lands in the default namespace.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some(Self::new(ns, name))
            }
            None if !value.is_empty() => Some(Self::new(DEFAULT_NAMESPACE, value)),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned by the store; stable across name reuse.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub deletion_requested: bool,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: String::new(),
            generation: 0,
            resource_version: 0,
            deletion_requested: false,
        }
    }
}

// ========================================
// DESIRED STATE
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    On,
    Off,
    /// Guest-cooperative shutdown first, hard power-off as fallback.
    OffGraceful,
    Suspended,
}

impl PowerState {
    /// The state a hypervisor can actually report for this target.
    pub fn observable(self) -> PowerState {
        match self {
            PowerState::OffGraceful => PowerState::Off,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmClass {
    pub cpus: u32,
    pub memory_mib: u64,
}

impl Default for VmClass {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mib: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub name: String,
    pub size_gib: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSource {
    /// `vm_ref` of the source machine on the same provider.
    pub source: String,
    #[serde(default)]
    pub linked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// Name of the provider binding this machine lives on.
    pub provider: String,
    #[serde(default)]
    pub class: VmClass,
    pub image: String,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_from: Option<CloneSource>,
    /// Snapshot names that must exist.
    #[serde(default)]
    pub snapshots: Vec<String>,
}

/// Hardware shape sent to a provider for create, clone and reconfigure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub image: String,
    pub networks: Vec<NetworkAttachment>,
    pub disks: Vec<DiskSpec>,
}

// ========================================
// OBSERVED STATE
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareSummary {
    pub cpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
}

/// What a provider currently knows about one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedVm {
    pub vm_ref: String,
    pub vm_id: String,
    pub power_state: PowerState,
    pub ip_addresses: Vec<String>,
    pub hardware_version: String,
    pub hardware: HardwareSummary,
    pub snapshots: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmPhase {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Suspended,
    Deleting,
    Deleted,
    Failed,
}

impl VmPhase {
    /// Steady phase matching an observed power state.
    pub fn for_power(power: PowerState) -> VmPhase {
        match power.observable() {
            PowerState::On => VmPhase::Running,
            PowerState::Suspended => VmPhase::Suspended,
            _ => VmPhase::Stopped,
        }
    }

    pub fn is_steady(&self) -> bool {
        matches!(self, VmPhase::Running | VmPhase::Stopped | VmPhase::Suspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmPhase::Pending => "Pending",
            VmPhase::Provisioning => "Provisioning",
            VmPhase::Running => "Running",
            VmPhase::Stopped => "Stopped",
            VmPhase::Suspended => "Suspended",
            VmPhase::Deleting => "Deleting",
            VmPhase::Deleted => "Deleted",
            VmPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Reference to the provider task currently driving this resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub handle: String,
    pub key: String,
    pub kind: OperationKind,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VmPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareSummary>,
    #[serde(default)]
    pub snapshots: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_history: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task: Option<TaskRef>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_generation: Option<u64>,
    /// Count of retired tasks; feeds the next task key.
    #[serde(default)]
    pub operation_seq: u64,
    /// Consecutive transient failures; drives the requeue backoff.
    #[serde(default)]
    pub attempts: u32,
}

impl VmStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Upsert a condition.
    ///
    /// The current entry of the same type is replaced only when status or
    /// reason changed; a changed message alone is ignored. Every replacement
    /// is appended to `condition_history`. Returns whether anything changed.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let position = self
            .conditions
            .iter()
            .position(|c| c.condition_type == condition_type);

        let transition_time = match position {
            Some(idx) => {
                let existing = &self.conditions[idx];
                if existing.status == status && existing.reason == reason {
                    return false;
                }
                // transition times never move backwards for one type
                now.max(existing.last_transition_time)
            }
            None => now,
        };

        let condition = Condition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: transition_time,
        };

        match position {
            Some(idx) => self.conditions[idx] = condition.clone(),
            None => self.conditions.push(condition.clone()),
        }

        self.condition_history.push(condition);
        if self.condition_history.len() > CONDITION_HISTORY_LIMIT {
            let overflow = self.condition_history.len() - CONDITION_HISTORY_LIMIT;
            self.condition_history.drain(..overflow);
        }
        true
    }

    /// Fold a provider observation into the observed half of the status.
    pub fn apply_observation(&mut self, observed: &ObservedVm) {
        if !observed.vm_id.is_empty() {
            self.vm_id = Some(observed.vm_id.clone());
        }
        self.power_state = Some(observed.power_state.observable());
        self.ip_addresses = observed.ip_addresses.clone();
        if !observed.hardware_version.is_empty() {
            self.hardware_version = Some(observed.hardware_version.clone());
        }
        self.hardware = Some(observed.hardware.clone());
        self.snapshots = observed.snapshots.clone();
    }

    /// Forget everything observed about the backend machine.
    pub fn clear_observation(&mut self) {
        self.vm_id = None;
        self.power_state = None;
        self.ip_addresses.clear();
        self.hardware_version = None;
        self.hardware = None;
        self.snapshots.clear();
    }
}

// ========================================
// RESOURCE
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: ObjectMeta,
    pub spec: VmSpec,
    #[serde(default)]
    pub status: VmStatus,
}

impl VirtualMachine {
    pub fn new(namespace: &str, name: &str, spec: VmSpec) -> Self {
        Self {
            api_version: None,
            kind: Some(super::KIND_VIRTUAL_MACHINE.to_string()),
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: VmStatus::default(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Backend-facing machine name, stable for the lifetime of the resource.
    ///
    /// The namespace is length-prefixed so distinct keys never share a name:
    /// `a-b/c` becomes `3-a-b-c` and `a/b-c` becomes `1-a-b-c`.
    pub fn vm_ref(&self) -> String {
        let ns = &self.metadata.namespace;
        format!("{}-{}-{}", ns.len(), ns, self.metadata.name)
    }

    pub fn machine_spec(&self) -> MachineSpec {
        MachineSpec {
            name: self.vm_ref(),
            cpus: self.spec.class.cpus,
            memory_mib: self.spec.class.memory_mib,
            image: self.spec.image.clone(),
            networks: self.spec.networks.clone(),
            disks: self.spec.disks.clone(),
        }
    }
}
