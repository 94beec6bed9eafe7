/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-memory hypervisor that answers in a chosen family's native vocabulary.
//!
//! With zero job latency every operation finishes inside `start`, like a
//! synchronous backend call. With latency, `start` hands out a job id and the
//! change is applied when a status check finds the job due. Faults can be
//! queued per operation kind.

use super::{native_error, BackendJob, BackendOp, Fault, HypervisorBackend, JobStatus, NativeError};
use common::capability::{Capability, CapabilitySet};
use common::spec::vm::{DiskSpec, HardwareSummary, MachineSpec, ObservedVm};
use common::spec::{PowerState, ProviderFamily};
use common::task::OperationKind;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct SimVm {
    id: u64,
    image: String,
    cpus: u32,
    memory_mib: u64,
    disks: Vec<DiskSpec>,
    power: PowerState,
    snapshots: Vec<String>,
}

#[derive(Debug)]
struct SimJob {
    op: BackendOp,
    ready_at: Instant,
    aborted: bool,
    outcome: Option<Result<Option<ObservedVm>, NativeError>>,
}

#[derive(Debug, Default)]
struct SimState {
    vms: BTreeMap<String, SimVm>,
    jobs: HashMap<String, SimJob>,
    next_id: u64,
    faults: Vec<(OperationKind, Fault)>,
    unreachable: bool,
    applied: Vec<OperationKind>,
}

pub struct SimulatedHypervisor {
    family: ProviderFamily,
    capabilities: CapabilitySet,
    job_latency: Duration,
    state: Mutex<SimState>,
}

impl SimulatedHypervisor {
    pub fn new(family: ProviderFamily) -> Self {
        Self {
            family,
            capabilities: super::default_capabilities(family),
            job_latency: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_job_latency(mut self, latency: Duration) -> Self {
        self.job_latency = latency;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, NativeError> {
        self.state
            .lock()
            .map_err(|_| self.native(Fault::Crash, "simulator state poisoned"))
    }

    fn native(&self, fault: Fault, message: impl Into<String>) -> NativeError {
        native_error(self.family, fault, message)
    }

    /// Make the next operation of `kind` fail with `fault`.
    pub fn fail_next(&self, kind: OperationKind, fault: Fault) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push((kind, fault));
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable = !reachable;
        }
    }

    /// Place a VM on the host out of band.
    pub fn insert_vm(&self, spec: &MachineSpec, power: PowerState) {
        if let Ok(mut state) = self.state.lock() {
            state.next_id += 1;
            let vm = SimVm {
                id: state.next_id,
                image: spec.image.clone(),
                cpus: spec.cpus,
                memory_mib: spec.memory_mib,
                disks: spec.disks.clone(),
                power: power.observable(),
                snapshots: Vec::new(),
            };
            state.vms.insert(spec.name.clone(), vm);
        }
    }

    /// Remove a VM out of band.
    pub fn remove_vm(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|mut s| s.vms.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Jobs whose terminal outcome has not been read yet.
    pub fn pending_jobs(&self) -> usize {
        self.state.lock().map(|s| s.jobs.len()).unwrap_or(0)
    }

    pub fn vm_count(&self) -> usize {
        self.state.lock().map(|s| s.vms.len()).unwrap_or(0)
    }

    pub fn power_of(&self, name: &str) -> Option<PowerState> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.vms.get(name).map(|vm| vm.power))
    }

    /// How many operations of `kind` actually changed host state.
    pub fn side_effects(&self, kind: OperationKind) -> usize {
        self.state
            .lock()
            .map(|s| s.applied.iter().filter(|k| **k == kind).count())
            .unwrap_or(0)
    }

    fn hardware_version(&self) -> &'static str {
        match self.family {
            ProviderFamily::Libvirt => "pc-q35-8.2",
            ProviderFamily::Vsphere => "vmx-19",
            ProviderFamily::Proxmox => "pve-qemu-8.1",
        }
    }

    fn observe(&self, name: &str, vm: &SimVm) -> ObservedVm {
        let ip_addresses = match vm.power {
            PowerState::On => vec![format!("10.0.{}.{}", vm.id / 250, 10 + vm.id % 250)],
            _ => Vec::new(),
        };
        ObservedVm {
            vm_ref: name.to_string(),
            vm_id: format!("{}-{}", self.family, vm.id),
            power_state: vm.power,
            ip_addresses,
            hardware_version: self.hardware_version().to_string(),
            hardware: HardwareSummary {
                cpus: vm.cpus,
                memory_mib: vm.memory_mib,
                disks: vm.disks.clone(),
            },
            snapshots: vm.snapshots.clone(),
        }
    }

    fn apply(&self, state: &mut SimState, op: &BackendOp) -> Result<Option<ObservedVm>, NativeError> {
        let name = op.vm_ref().to_string();
        let outcome = match op {
            BackendOp::Create { spec } => {
                if state.vms.contains_key(&name) {
                    return Err(self.native(Fault::Duplicate, name));
                }
                state.next_id += 1;
                let vm = SimVm {
                    id: state.next_id,
                    image: spec.image.clone(),
                    cpus: spec.cpus,
                    memory_mib: spec.memory_mib,
                    disks: spec.disks.clone(),
                    power: PowerState::Off,
                    snapshots: Vec::new(),
                };
                state.vms.insert(name.clone(), vm);
                Some(())
            }
            BackendOp::Clone { source, spec, .. } => {
                let template = state
                    .vms
                    .get(source)
                    .cloned()
                    .ok_or_else(|| self.native(Fault::NoSuchVm, source.clone()))?;
                if state.vms.contains_key(&name) {
                    return Err(self.native(Fault::Duplicate, name));
                }
                state.next_id += 1;
                let vm = SimVm {
                    id: state.next_id,
                    image: template.image,
                    cpus: spec.cpus,
                    memory_mib: spec.memory_mib,
                    disks: if spec.disks.is_empty() {
                        template.disks
                    } else {
                        spec.disks.clone()
                    },
                    power: PowerState::Off,
                    snapshots: Vec::new(),
                };
                state.vms.insert(name.clone(), vm);
                Some(())
            }
            BackendOp::Delete { .. } => {
                if state.vms.remove(&name).is_none() {
                    return Err(self.native(Fault::NoSuchVm, name));
                }
                None
            }
            _ => {
                let online_reconfigure = self.capabilities.supports(Capability::OnlineReconfigure);
                let vm = state
                    .vms
                    .get_mut(&name)
                    .ok_or_else(|| native_error(self.family, Fault::NoSuchVm, name.clone()))?;
                match op {
                    BackendOp::PowerOn { .. } => vm.power = PowerState::On,
                    BackendOp::PowerOff { .. } | BackendOp::Shutdown { .. } => {
                        vm.power = PowerState::Off
                    }
                    BackendOp::Suspend { .. } => {
                        if vm.power != PowerState::On {
                            return Err(self.native(Fault::InvalidRequest, "domain is not running"));
                        }
                        vm.power = PowerState::Suspended;
                    }
                    BackendOp::Reconfigure { spec, .. } => {
                        for disk in &vm.disks {
                            let shrunk = spec
                                .disks
                                .iter()
                                .find(|d| d.name == disk.name)
                                .map(|d| d.size_gib < disk.size_gib)
                                .unwrap_or(true);
                            if shrunk {
                                return Err(self.native(
                                    Fault::InvalidRequest,
                                    format!("disk {} cannot shrink or be removed", disk.name),
                                ));
                            }
                        }
                        if vm.power == PowerState::On && !online_reconfigure {
                            return Err(self.native(Fault::Unsupported, "hot-plug not available"));
                        }
                        vm.cpus = spec.cpus;
                        vm.memory_mib = spec.memory_mib;
                        vm.disks = spec.disks.clone();
                    }
                    BackendOp::SnapshotCreate { name: snap, .. } => {
                        if vm.snapshots.contains(snap) {
                            return Err(self.native(Fault::Duplicate, snap.clone()));
                        }
                        vm.snapshots.push(snap.clone());
                    }
                    BackendOp::SnapshotDelete { name: snap, .. } => {
                        let before = vm.snapshots.len();
                        vm.snapshots.retain(|s| s != snap);
                        if vm.snapshots.len() == before {
                            return Err(self.native(Fault::NoSuchSnapshot, snap.clone()));
                        }
                    }
                    BackendOp::SnapshotRevert { name: snap, .. } => {
                        if !vm.snapshots.contains(snap) {
                            return Err(self.native(Fault::NoSuchSnapshot, snap.clone()));
                        }
                        // reverting restores the powered-off state captured with the snapshot
                        vm.power = PowerState::Off;
                    }
                    BackendOp::Create { .. } | BackendOp::Clone { .. } | BackendOp::Delete { .. } => {}
                }
                Some(())
            }
        };

        state.applied.push(op.kind());
        Ok(outcome.and_then(|_| state.vms.get(&name).map(|vm| self.observe(&name, vm))))
    }

    fn take_fault(state: &mut SimState, kind: OperationKind) -> Option<Fault> {
        let idx = state.faults.iter().position(|(k, _)| *k == kind)?;
        Some(state.faults.remove(idx).1)
    }
}

#[async_trait::async_trait]
impl HypervisorBackend for SimulatedHypervisor {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    async fn describe(&self, vm_ref: &str) -> Result<Option<ObservedVm>, NativeError> {
        let state = self.lock()?;
        if state.unreachable {
            return Err(NativeError::Unreachable("simulated host is down".into()));
        }
        Ok(state.vms.get(vm_ref).map(|vm| self.observe(vm_ref, vm)))
    }

    async fn start(&self, op: BackendOp) -> Result<BackendJob, NativeError> {
        let mut state = self.lock()?;
        if state.unreachable {
            return Err(NativeError::Unreachable("simulated host is down".into()));
        }
        if let Some(fault) = Self::take_fault(&mut state, op.kind()) {
            return Err(self.native(fault, op.vm_ref().to_string()));
        }
        if self.job_latency.is_zero() {
            return self.apply(&mut state, &op).map(BackendJob::Done);
        }

        state.next_id += 1;
        let job_id = format!("job-{}", state.next_id);
        state.jobs.insert(
            job_id.clone(),
            SimJob {
                op,
                ready_at: Instant::now() + self.job_latency,
                aborted: false,
                outcome: None,
            },
        );
        Ok(BackendJob::Started(job_id))
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, NativeError> {
        let mut guard = self.lock()?;
        if guard.unreachable {
            return Err(NativeError::Unreachable("simulated host is down".into()));
        }
        let state = &mut *guard;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(self.native(Fault::Crash, format!("unknown job {job_id}")));
        };
        if job.outcome.is_none() {
            if job.aborted {
                job.outcome = Some(Err(self.native(Fault::Aborted, job_id.to_string())));
            } else if Instant::now() >= job.ready_at {
                let op = job.op.clone();
                let outcome = self.apply(state, &op);
                if let Some(job) = state.jobs.get_mut(job_id) {
                    job.outcome = Some(outcome);
                }
            } else {
                return Ok(JobStatus::Running);
            }
        }
        // a terminal outcome is reported once, then the job is forgotten
        match state.jobs.remove(job_id).and_then(|j| j.outcome) {
            Some(Ok(observed)) => Ok(JobStatus::Done(observed)),
            Some(Err(native)) => Ok(JobStatus::Failed(native)),
            None => Ok(JobStatus::Running),
        }
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), NativeError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(job_id) {
            Some(job) if job.outcome.is_none() => {
                job.aborted = true;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(self.native(Fault::Crash, format!("unknown job {job_id}"))),
        }
    }

    async fn ping(&self) -> Result<(), NativeError> {
        let state = self.lock()?;
        if state.unreachable {
            return Err(NativeError::Unreachable("simulated host is down".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::ErrorKind;

    fn spec(name: &str) -> MachineSpec {
        MachineSpec {
            name: name.into(),
            cpus: 2,
            memory_mib: 2048,
            image: "debian-12".into(),
            networks: vec![],
            disks: vec![DiskSpec {
                name: "root".into(),
                size_gib: 20,
            }],
        }
    }

    #[tokio::test]
    async fn test_synchronous_create_then_duplicate() {
        let sim = SimulatedHypervisor::new(ProviderFamily::Libvirt);
        let job = sim.start(BackendOp::Create { spec: spec("web") }).await.unwrap();
        let BackendJob::Done(Some(observed)) = job else {
            panic!("expected synchronous completion");
        };
        assert_eq!(observed.power_state, PowerState::Off);
        assert_eq!(observed.hardware.cpus, 2);

        let err = sim
            .start(BackendOp::Create { spec: spec("web") })
            .await
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::AlreadyExists);
        assert_eq!(sim.side_effects(OperationKind::Create), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_latency_and_abort() {
        let sim = SimulatedHypervisor::new(ProviderFamily::Vsphere)
            .with_job_latency(Duration::from_secs(1));
        let BackendJob::Started(job) = sim.start(BackendOp::Create { spec: spec("a") }).await.unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(sim.job_status(&job).await.unwrap(), JobStatus::Running);
        assert_eq!(sim.vm_count(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(sim.job_status(&job).await.unwrap(), JobStatus::Done(Some(_))));
        assert_eq!(sim.vm_count(), 1);
        assert_eq!(sim.pending_jobs(), 0);
        assert!(sim.job_status(&job).await.is_err());

        let BackendJob::Started(second) = sim.start(BackendOp::Create { spec: spec("b") }).await.unwrap() else {
            panic!("expected a job");
        };
        sim.cancel_job(&second).await.unwrap();
        let JobStatus::Failed(native) = sim.job_status(&second).await.unwrap() else {
            panic!("expected aborted job");
        };
        assert_eq!(native.classify().kind, ErrorKind::Canceled);
        assert_eq!(sim.vm_count(), 1);
        assert_eq!(sim.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_offline_reconfigure_only_on_proxmox() {
        let sim = SimulatedHypervisor::new(ProviderFamily::Proxmox);
        sim.insert_vm(&spec("db"), PowerState::On);
        let mut bigger = spec("db");
        bigger.cpus = 4;

        let err = sim
            .start(BackendOp::Reconfigure {
                vm_ref: "db".into(),
                spec: bigger.clone(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::Unimplemented);

        sim.start(BackendOp::PowerOff { vm_ref: "db".into() }).await.unwrap();
        sim.start(BackendOp::Reconfigure {
            vm_ref: "db".into(),
            spec: bigger,
        })
        .await
        .unwrap();
        assert_eq!(sim.describe("db").await.unwrap().unwrap().hardware.cpus, 4);
    }

    #[tokio::test]
    async fn test_disk_shrink_is_invalid() {
        let sim = SimulatedHypervisor::new(ProviderFamily::Libvirt);
        sim.insert_vm(&spec("db"), PowerState::Off);
        let mut smaller = spec("db");
        smaller.disks[0].size_gib = 10;
        let err = sim
            .start(BackendOp::Reconfigure {
                vm_ref: "db".into(),
                spec: smaller,
            })
            .await
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_injected_fault_and_unreachable_host() {
        let sim = SimulatedHypervisor::new(ProviderFamily::Proxmox);
        sim.insert_vm(&spec("web"), PowerState::Off);
        sim.fail_next(OperationKind::PowerOn, Fault::Busy);

        let err = sim.start(BackendOp::PowerOn { vm_ref: "web".into() }).await.unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::Unavailable);
        // the fault is consumed
        sim.start(BackendOp::PowerOn { vm_ref: "web".into() }).await.unwrap();
        assert_eq!(sim.power_of("web"), Some(PowerState::On));

        sim.set_reachable(false);
        assert!(sim.ping().await.is_err());
        assert!(matches!(
            sim.describe("web").await.unwrap_err(),
            NativeError::Unreachable(_)
        ));
    }
}
