/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-process provider for controller tests.
//!
//! Operations apply to an in-memory inventory at submit time unless `hold`
//! is set, in which case they stay Running until [`FakeProvider::release`].

use super::{ClientError, Operation, ProviderInfo, ProviderService, TaskPoll};
use common::capability::{Capability, CapabilitySet};
use common::error::ProviderError;
use common::provider::PROTOCOL_VERSION;
use common::spec::vm::{HardwareSummary, MachineSpec};
use common::spec::{ObservedVm, PowerState};
use common::task::{OperationKind, TaskPhase};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct FakeState {
    pub(crate) vms: HashMap<String, ObservedVm>,
    pub(crate) tasks: HashMap<String, TaskPoll>,
    pub(crate) handles: HashMap<String, String>,
    /// Keys and kinds of submissions that reached the backend.
    pub(crate) side_effects: Vec<(String, OperationKind)>,
    pub(crate) fail_next: Option<ProviderError>,
    /// While set, submissions stay Running and are applied on release.
    pub(crate) hold: bool,
    pub(crate) deferred: Vec<(String, String, Operation)>,
    pub(crate) unreachable: bool,
    pub(crate) version: Option<String>,
}

pub(crate) struct FakeProvider {
    capabilities: CapabilitySet,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub(crate) fn new(capabilities: CapabilitySet) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            state: Mutex::new(FakeState::default()),
        })
    }

    pub(crate) fn full() -> Arc<Self> {
        Self::new(Capability::ALL.iter().copied().collect())
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn count(&self, kind: OperationKind) -> usize {
        self.with(|s| s.side_effects.iter().filter(|(_, k)| *k == kind).count())
    }

    /// Apply and complete every held task.
    pub(crate) fn release(&self) {
        self.with(|s| {
            s.hold = false;
            for (handle, vm_ref, op) in std::mem::take(&mut s.deferred) {
                let poll = match Self::apply(&mut s.vms, &vm_ref, &op) {
                    Ok(()) => TaskPoll {
                        phase: TaskPhase::Succeeded,
                        result: s.vms.get(&vm_ref).cloned(),
                        error: None,
                    },
                    Err(err) => TaskPoll {
                        phase: TaskPhase::Failed,
                        result: None,
                        error: Some(err),
                    },
                };
                s.tasks.insert(handle, poll);
            }
        });
    }

    pub(crate) fn evict_all(&self) {
        self.with(|s| {
            s.tasks.clear();
            s.handles.clear();
        });
    }

    pub(crate) fn observed(spec: &MachineSpec) -> ObservedVm {
        ObservedVm {
            vm_ref: spec.name.clone(),
            vm_id: format!("id-{}", spec.name),
            power_state: PowerState::Off,
            ip_addresses: vec![],
            hardware_version: "fake-1".into(),
            hardware: HardwareSummary {
                cpus: spec.cpus,
                memory_mib: spec.memory_mib,
                disks: spec.disks.clone(),
            },
            snapshots: vec![],
        }
    }

    fn apply(vms: &mut HashMap<String, ObservedVm>, vm_ref: &str, op: &Operation) -> Result<(), ProviderError> {
        let missing = || ProviderError::not_found(format!("{vm_ref} does not exist"));
        match op {
            Operation::Create { spec } | Operation::Clone { spec, .. } => {
                vms.insert(spec.name.clone(), Self::observed(spec));
            }
            Operation::Delete => {
                vms.remove(vm_ref);
            }
            Operation::PowerOn => {
                let vm = vms.get_mut(vm_ref).ok_or_else(missing)?;
                vm.power_state = PowerState::On;
                vm.ip_addresses = vec!["10.0.0.7".into()];
            }
            Operation::PowerOff | Operation::PowerOffGraceful { .. } => {
                let vm = vms.get_mut(vm_ref).ok_or_else(missing)?;
                vm.power_state = PowerState::Off;
                vm.ip_addresses.clear();
            }
            Operation::Suspend => {
                vms.get_mut(vm_ref).ok_or_else(missing)?.power_state = PowerState::Suspended;
            }
            Operation::Reconfigure { spec } => {
                let vm = vms.get_mut(vm_ref).ok_or_else(missing)?;
                vm.hardware = Self::observed(spec).hardware;
            }
            Operation::SnapshotCreate { name } => {
                vms.get_mut(vm_ref).ok_or_else(missing)?.snapshots.push(name.clone());
            }
            Operation::SnapshotDelete { name } => {
                vms.get_mut(vm_ref).ok_or_else(missing)?.snapshots.retain(|s| s != name);
            }
            Operation::SnapshotRevert { name } => {
                let vm = vms.get_mut(vm_ref).ok_or_else(missing)?;
                if !vm.snapshots.contains(name) {
                    return Err(ProviderError::not_found(format!("snapshot {name} does not exist")));
                }
                vm.power_state = PowerState::Off;
                vm.ip_addresses.clear();
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProviderService for FakeProvider {
    async fn capabilities(&self) -> Result<ProviderInfo, ClientError> {
        self.with(|s| {
            if s.unreachable {
                return Err(ProviderError::unavailable("connection refused").into());
            }
            Ok(ProviderInfo {
                protocol_version: s.version.clone().unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
                family: "libvirt".into(),
                capabilities: self.capabilities.clone(),
            })
        })
    }

    async fn submit(&self, vm_ref: &str, key: &str, op: Operation) -> Result<String, ClientError> {
        self.with(|s| {
            if s.unreachable {
                return Err(ProviderError::unavailable("connection refused").into());
            }
            if let Some(handle) = s.handles.get(key) {
                return Ok(handle.clone());
            }
            let handle = format!("task-{}", s.side_effects.len() + 1);
            s.side_effects.push((key.to_string(), op.kind()));
            s.handles.insert(key.to_string(), handle.clone());
            if s.hold {
                s.deferred.push((handle.clone(), vm_ref.to_string(), op));
                s.tasks.insert(
                    handle.clone(),
                    TaskPoll {
                        phase: TaskPhase::Running,
                        result: None,
                        error: None,
                    },
                );
                return Ok(handle);
            }
            let result = match s.fail_next.take() {
                Some(err) => Err(err),
                None => Self::apply(&mut s.vms, vm_ref, &op),
            };
            let poll = match result {
                Ok(()) => TaskPoll {
                    phase: TaskPhase::Succeeded,
                    result: s.vms.get(vm_ref).cloned(),
                    error: None,
                },
                Err(err) => TaskPoll {
                    phase: TaskPhase::Failed,
                    result: None,
                    error: Some(err),
                },
            };
            s.tasks.insert(handle.clone(), poll);
            Ok(handle)
        })
    }

    async fn describe(&self, vm_ref: &str) -> Result<Option<ObservedVm>, ClientError> {
        self.with(|s| {
            if s.unreachable {
                return Err(ProviderError::unavailable("connection refused").into());
            }
            Ok(s.vms.get(vm_ref).cloned())
        })
    }

    async fn poll_task(&self, handle: &str) -> Result<TaskPoll, ClientError> {
        self.with(|s| {
            if s.unreachable {
                return Err(ProviderError::unavailable("connection refused").into());
            }
            s.tasks
                .get(handle)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(format!("task {handle}")).into())
        })
    }

    async fn cancel_task(&self, handle: &str) -> Result<TaskPhase, ClientError> {
        self.with(|s| {
            let poll = s
                .tasks
                .get_mut(handle)
                .ok_or_else(|| ClientError::from(ProviderError::not_found(handle.to_string())))?;
            if !poll.phase.is_terminal() {
                poll.phase = TaskPhase::Canceled;
            }
            Ok(poll.phase)
        })
    }

    async fn health_check(&self) -> Result<bool, ClientError> {
        Ok(self.with(|s| !s.unreachable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> MachineSpec {
        MachineSpec {
            name: "7-default-web".into(),
            cpus: 1,
            memory_mib: 512,
            image: "alpine".into(),
            networks: vec![],
            disks: vec![],
        }
    }

    #[tokio::test]
    async fn test_revert_requires_existing_snapshot() {
        let provider = FakeProvider::full();
        let vm_ref = "7-default-web";
        provider.submit(vm_ref, "k/create", Operation::Create { spec: machine() }).await.unwrap();
        provider.submit(vm_ref, "k/on", Operation::PowerOn).await.unwrap();

        let ghost = provider
            .submit(vm_ref, "k/revert-ghost", Operation::SnapshotRevert { name: "ghost".into() })
            .await
            .unwrap();
        let poll = provider.poll_task(&ghost).await.unwrap();
        assert_eq!(poll.phase, TaskPhase::Failed);
        assert!(poll.error.is_some_and(|e| e.kind == common::error::ErrorKind::NotFound));

        provider
            .submit(vm_ref, "k/snap", Operation::SnapshotCreate { name: "base".into() })
            .await
            .unwrap();
        let revert = provider
            .submit(vm_ref, "k/revert", Operation::SnapshotRevert { name: "base".into() })
            .await
            .unwrap();
        assert_eq!(provider.poll_task(&revert).await.unwrap().phase, TaskPhase::Succeeded);
        let vm = provider.describe(vm_ref).await.unwrap().unwrap();
        assert_eq!(vm.power_state, PowerState::Off);
        assert_eq!(vm.snapshots, vec!["base".to_string()]);
    }
}
