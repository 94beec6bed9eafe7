/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! One reconcile pass for one VirtualMachine.
//!
//! A pass is idempotent and may run any number of times. It reads the
//! resource, settles the active provider task if there is one, asks the
//! provider what exists, plans the next operation and persists the status
//! with optimistic concurrency. Side effects happen only through the
//! provider client and every one of them carries a task key derived from
//! persisted state, so repeating a pass never repeats a side effect.

use crate::backoff::Backoff;
use crate::diff::{self, PlanAction};
use crate::provider::registry::{ProviderBinding, ProviderRegistry};
use crate::provider::{ClientError, Operation, ProviderService};
use crate::state_machine::StateMachine;
use crate::storage::{ResourceStore, StoreError};
use crate::types::*;
use chrono::{DateTime, Utc};
use common::error::{ErrorKind, ProviderError};
use common::setting::ControllerSettings;
use common::spec::{
    ConditionStatus, ObservedVm, ResourceKey, TaskRef, VirtualMachine, VmPhase, VmStatus,
};
use common::task::{OperationKind, TaskKey, TaskPhase};
use std::sync::Arc;
use std::time::Duration;

/// What a pass decided, before the status is persisted.
enum Step {
    Persist(ReconcileOutcome),
    /// Deletion confirmed by the provider; drop the resource.
    Remove,
}

/// Mutable state of one pass.
struct Pass<'a> {
    vm: &'a VirtualMachine,
    status: VmStatus,
    now: DateTime<Utc>,
}

impl Pass<'_> {
    fn condition(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.status
            .set_condition(condition_type, status, reason, message, self.now);
    }

    /// Clear the active task and move the key sequence past it.
    fn retire_task(&mut self) {
        if self.status.active_task.take().is_some() {
            self.status.operation_seq += 1;
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ProviderRegistry>,
    backoff: Backoff,
    poll_interval: Duration,
    graceful_shutdown_secs: u32,
    state_machine: StateMachine,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<ProviderRegistry>,
        settings: &ControllerSettings,
    ) -> Self {
        Self {
            store,
            registry,
            backoff: Backoff::from_settings(settings),
            poll_interval: settings.poll_interval(),
            graceful_shutdown_secs: settings.graceful_shutdown_secs,
            state_machine: StateMachine::new(),
        }
    }

    #[tracing::instrument(skip_all, fields(resource = %key))]
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, StoreError> {
        let Some(vm) = self.store.get(key).await? else {
            tracing::debug!("resource no longer exists");
            return Ok(ReconcileOutcome::Gone);
        };

        let mut pass = Pass {
            vm: &vm,
            status: vm.status.clone(),
            now: Utc::now(),
        };
        let step = self.drive(&mut pass).await;
        let status = pass.status;
        let version = vm.metadata.resource_version;

        match step {
            Step::Remove => match self.store.remove(key, version).await {
                Ok(()) => {
                    tracing::info!("backend VM confirmed absent, resource removed");
                    Ok(ReconcileOutcome::Removed)
                }
                Err(StoreError::VersionConflict { .. }) => Ok(ReconcileOutcome::Conflict),
                Err(StoreError::NotFound(_)) => Ok(ReconcileOutcome::Gone),
                Err(e) => Err(e),
            },
            Step::Persist(outcome) if status == vm.status => Ok(outcome),
            Step::Persist(outcome) => match self.store.update_status(key, status, version).await {
                Ok(_) => Ok(outcome),
                Err(StoreError::VersionConflict { expected, actual, .. }) => {
                    tracing::debug!(expected, actual, "status write lost a race, re-reconciling");
                    Ok(ReconcileOutcome::Conflict)
                }
                Err(StoreError::NotFound(_)) => Ok(ReconcileOutcome::Gone),
                Err(e) => Err(e),
            },
        }
    }

    async fn drive(&self, pass: &mut Pass<'_>) -> Step {
        let vm = pass.vm;
        let generation = vm.metadata.generation;

        if pass.status.phase.is_none() {
            pass.status.phase = Some(VmPhase::Pending);
            pass.condition(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_PENDING,
                "waiting for the first reconcile",
            );
        }

        if pass.status.phase == Some(VmPhase::Failed) && !vm.metadata.deletion_requested {
            if pass.status.failed_generation == Some(generation) {
                return Step::Persist(ReconcileOutcome::Failed);
            }
            self.set_phase(pass, EVENT_SPEC_CHANGED, VmPhase::Provisioning);
            pass.status.failed_generation = None;
            pass.condition(
                CONDITION_FAILED,
                ConditionStatus::False,
                REASON_SPEC_CHANGED,
                format!("generation {generation} replaces the failed spec"),
            );
        }
        if vm.metadata.deletion_requested {
            self.set_phase(pass, EVENT_DELETE_REQUESTED, VmPhase::Deleting);
            pass.status.failed_generation = None;
        }

        let Some(binding) = self.registry.get(&vm.spec.provider) else {
            pass.condition(
                CONDITION_PROVIDER_AVAILABLE,
                ConditionStatus::False,
                REASON_UNKNOWN_PROVIDER,
                format!("no provider named {}", vm.spec.provider),
            );
            return self.backoff_step(pass, "provider is not registered");
        };

        let capabilities = match binding.capabilities().await {
            Ok(capabilities) => capabilities,
            Err(err) => return self.provider_unavailable(pass, &binding, err),
        };
        let client = binding.client();
        let vm_ref = vm.vm_ref();

        // ========================================
        // ACTIVE TASK
        // ========================================
        if let Some(task) = pass.status.active_task.clone() {
            match client.poll_task(&task.handle).await {
                Ok(poll) => match poll.phase {
                    TaskPhase::Pending | TaskPhase::Running => {
                        if vm.metadata.deletion_requested && task.kind != OperationKind::Delete {
                            // advisory; the next pass sees how the task ended
                            if let Err(err) = client.cancel_task(&task.handle).await {
                                tracing::debug!(handle = %task.handle, error = %err, "cancel request failed");
                            }
                        }
                        tracing::debug!(kind = %task.kind, handle = %task.handle, "task still in flight");
                        return Step::Persist(ReconcileOutcome::Poll(self.poll_interval));
                    }
                    TaskPhase::Succeeded => {
                        tracing::info!(kind = %task.kind, handle = %task.handle, "provider task succeeded");
                        pass.retire_task();
                        pass.status.attempts = 0;
                        if let Some(result) = &poll.result {
                            pass.status.apply_observation(result);
                        }
                    }
                    TaskPhase::Canceled => {
                        pass.retire_task();
                        if !vm.metadata.deletion_requested {
                            let err = ProviderError::canceled(format!("{} task was canceled", task.kind));
                            return self.transient(pass, task.kind, &err);
                        }
                        tracing::info!(kind = %task.kind, "task canceled for deletion");
                    }
                    TaskPhase::Failed => {
                        pass.retire_task();
                        let err = poll.error.unwrap_or_else(|| {
                            ProviderError::internal(format!("{} task failed without an error", task.kind))
                        });
                        if let Some(step) = self.on_error(pass, task.kind, err.into()) {
                            return step;
                        }
                    }
                },
                Err(err) if err.is_not_found() => {
                    // evicted from the provider's tracker: state unknown, describe again
                    tracing::warn!(
                        kind = %task.kind,
                        handle = %task.handle,
                        "task handle unknown to provider, re-verifying"
                    );
                    pass.retire_task();
                }
                Err(err) => return self.provider_unavailable(pass, &binding, err),
            }
        }

        // ========================================
        // OBSERVE
        // ========================================
        let observed: Option<ObservedVm> = match client.describe(&vm_ref).await {
            Ok(observed) => observed,
            Err(err) => return self.provider_unavailable(pass, &binding, err),
        };
        pass.condition(
            CONDITION_PROVIDER_AVAILABLE,
            ConditionStatus::True,
            REASON_NEGOTIATED,
            format!("provider {} is serving", binding.name()),
        );
        match &observed {
            Some(observed) => pass.status.apply_observation(observed),
            None => pass.status.clear_observation(),
        }

        // ========================================
        // PLAN
        // ========================================
        let plan = diff::plan(
            vm,
            observed.as_ref(),
            &capabilities,
            self.graceful_shutdown_secs,
        );
        for note in &plan.notes {
            pass.condition(note.condition_type, note.status, note.reason, note.message.clone());
        }

        match plan.action {
            PlanAction::Finalize => {
                self.set_phase(pass, EVENT_ABSENCE_CONFIRMED, VmPhase::Deleted);
                Step::Remove
            }
            PlanAction::Reject { reason, message } => self.fail(pass, reason, message),
            PlanAction::InSync => {
                let power = pass.status.power_state.unwrap_or_default();
                let phase = VmPhase::for_power(power);
                self.set_phase(pass, EVENT_CONVERGED, phase);
                pass.status.attempts = 0;
                pass.status.observed_generation = generation;
                pass.condition(
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_CONVERGED,
                    format!("machine is {phase}"),
                );
                Step::Persist(ReconcileOutcome::Steady)
            }
            PlanAction::Issue(op) => self.issue(pass, client.as_ref(), &vm_ref, op).await,
        }
    }

    async fn issue(
        &self,
        pass: &mut Pass<'_>,
        client: &dyn ProviderService,
        vm_ref: &str,
        op: Operation,
    ) -> Step {
        let kind = op.kind();
        if matches!(kind, OperationKind::Create | OperationKind::Clone) {
            self.set_phase(pass, EVENT_PROVISION_REQUESTED, VmPhase::Provisioning);
        }

        let vm = pass.vm;
        // operation_seq only moves when a task retires, so a lost status
        // write re-derives this same key
        let key = TaskKey::new(
            &vm.metadata.uid,
            vm.metadata.generation,
            kind,
            pass.status.operation_seq,
        )
        .to_string();

        match client.submit(vm_ref, &key, op).await {
            Ok(handle) => {
                tracing::info!(%kind, %key, %handle, "issued provider task");
                let reason = if vm.metadata.deletion_requested {
                    REASON_DELETING
                } else {
                    REASON_PROGRESSING
                };
                pass.condition(
                    CONDITION_READY,
                    ConditionStatus::False,
                    reason,
                    format!("{kind} in progress"),
                );
                pass.status.active_task = Some(TaskRef {
                    handle,
                    key,
                    kind,
                    issued_at: pass.now,
                });
                Step::Persist(ReconcileOutcome::Poll(self.poll_interval))
            }
            Err(err) => self
                .on_error(pass, kind, err)
                .unwrap_or(Step::Persist(ReconcileOutcome::Requeue)),
        }
    }

    /// Apply the error policy. `None` means the error is the desired outcome
    /// and the pass should carry on.
    fn on_error(&self, pass: &mut Pass<'_>, kind: OperationKind, err: ClientError) -> Option<Step> {
        let err = match err {
            ClientError::Provider(err) => err,
            incompatible => {
                pass.condition(
                    CONDITION_PROVIDER_AVAILABLE,
                    ConditionStatus::False,
                    REASON_INCOMPATIBLE_VERSION,
                    incompatible.to_string(),
                );
                if let Some(binding) = self.registry.get(&pass.vm.spec.provider) {
                    binding.invalidate();
                }
                return Some(self.backoff_step(pass, "incompatible provider"));
            }
        };

        match (err.kind, kind) {
            (ErrorKind::NotFound, OperationKind::Delete)
            | (ErrorKind::NotFound, OperationKind::SnapshotDelete)
            | (ErrorKind::AlreadyExists, OperationKind::SnapshotCreate) => {
                tracing::debug!(%kind, error = %err, "error already satisfies the intent");
                None
            }
            (ErrorKind::AlreadyExists, OperationKind::Create | OperationKind::Clone) => {
                let err = ProviderError::internal(format!(
                    "{kind} reported an existing machine for a fresh key: {}",
                    err.message
                ));
                Some(self.transient(pass, kind, &err))
            }
            (ErrorKind::InvalidArgument | ErrorKind::Unimplemented, _) => {
                // Unimplemented slipped past capability gating; same policy
                Some(self.fail(pass, err.kind.as_str(), format!("{kind}: {}", err.message)))
            }
            _ => Some(self.transient(pass, kind, &err)),
        }
    }

    fn transient(&self, pass: &mut Pass<'_>, kind: OperationKind, err: &ProviderError) -> Step {
        pass.condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_RETRYING,
            format!("{kind}: {err}"),
        );
        self.backoff_step(pass, &err.to_string())
    }

    fn backoff_step(&self, pass: &mut Pass<'_>, cause: &str) -> Step {
        let delay = self.backoff.delay(pass.status.attempts);
        pass.status.attempts = pass.status.attempts.saturating_add(1);
        tracing::warn!(attempt = pass.status.attempts, ?delay, cause, "backing off");
        Step::Persist(ReconcileOutcome::Retry(delay))
    }

    fn provider_unavailable(
        &self,
        pass: &mut Pass<'_>,
        binding: &ProviderBinding,
        err: ClientError,
    ) -> Step {
        let reason = match &err {
            ClientError::IncompatibleVersion { .. } => {
                binding.invalidate();
                REASON_INCOMPATIBLE_VERSION
            }
            ClientError::Provider(_) => REASON_UNREACHABLE,
        };
        pass.condition(
            CONDITION_PROVIDER_AVAILABLE,
            ConditionStatus::False,
            reason,
            format!("provider {}: {err}", binding.name()),
        );
        self.backoff_step(pass, &err.to_string())
    }

    fn fail(&self, pass: &mut Pass<'_>, reason: &str, message: String) -> Step {
        self.set_phase(pass, EVENT_PERMANENT_ERROR, VmPhase::Failed);
        pass.status.failed_generation = Some(pass.vm.metadata.generation);
        pass.status.attempts = 0;
        pass.condition(CONDITION_FAILED, ConditionStatus::True, reason, message.clone());
        pass.condition(CONDITION_READY, ConditionStatus::False, REASON_FAILED, message.clone());
        tracing::error!(reason, %message, "permanent failure, waiting for a spec change");
        Step::Persist(ReconcileOutcome::Failed)
    }

    fn set_phase(&self, pass: &mut Pass<'_>, event: &str, to: VmPhase) {
        let from = pass.status.phase.unwrap_or(VmPhase::Pending);
        match self.state_machine.transition(from, event, to) {
            Ok(Some(transition)) => {
                tracing::info!(%from, %to, action = transition.action, "phase transition");
                pass.status.phase = Some(to);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::{MockProviderService, ProviderInfo};
    use crate::storage::MemoryStore;
    use common::capability::Capability;
    use common::provider::PROTOCOL_VERSION;
    use common::spec::vm::MachineSpec;
    use common::spec::{PowerState, ProviderDescriptor, ProviderFamily, VmSpec};
    use std::sync::Mutex;

    // ========================================
    // HELPERS
    // ========================================

    fn settings() -> ControllerSettings {
        ControllerSettings {
            backoff_jitter: 0.0,
            ..ControllerSettings::default()
        }
    }

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            name: "lab".into(),
            family: ProviderFamily::Libvirt,
            endpoint: "127.0.0.1:9443".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            credentials_ref: None,
        }
    }

    fn spec(power: PowerState) -> VmSpec {
        let mut spec: VmSpec = serde_yaml::from_str(
            "provider: lab\nimage: alpine\nclass:\n  cpus: 2\n  memoryMib: 2048\ndisks:\n  - name: root\n    sizeGib: 20\n",
        )
        .unwrap();
        spec.power_state = power;
        spec
    }

    struct Harness {
        store: Arc<MemoryStore>,
        reconciler: Reconciler,
        key: ResourceKey,
    }

    impl Harness {
        fn new(provider: Arc<dyn ProviderService>, spec: VmSpec) -> Self {
            let store = Arc::new(MemoryStore::new());
            let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(1)));
            registry.insert(descriptor(), provider);
            let vm = store.apply(VirtualMachine::new("default", "web", spec)).unwrap();
            let reconciler = Reconciler::new(store.clone(), registry, &settings());
            Self {
                store,
                reconciler,
                key: vm.key(),
            }
        }

        async fn pass(&self) -> ReconcileOutcome {
            self.reconciler.reconcile(&self.key).await.unwrap()
        }

        async fn vm(&self) -> VirtualMachine {
            self.store.get(&self.key).await.unwrap().unwrap()
        }

        /// Reconcile until steady; returns the number of passes used.
        async fn converge(&self, limit: usize) -> usize {
            for n in 1..=limit {
                if self.pass().await == ReconcileOutcome::Steady {
                    return n;
                }
            }
            panic!("no convergence within {limit} passes: {:?}", self.vm().await.status);
        }
    }

    fn condition<'a>(vm: &'a VirtualMachine, condition_type: &str) -> &'a common::spec::Condition {
        vm.status.condition(condition_type).unwrap()
    }

    // ========================================
    // TESTS
    // ========================================

    #[tokio::test]
    async fn test_converges_within_bounded_passes() {
        let provider = FakeProvider::full();
        let h = Harness::new(provider.clone(), spec(PowerState::On));

        let passes = h.converge(5).await;
        assert!(passes <= 5);

        let vm = h.vm().await;
        assert_eq!(vm.status.phase, Some(VmPhase::Running));
        assert_eq!(vm.status.power_state, Some(PowerState::On));
        assert_eq!(vm.status.ip_addresses, vec!["10.0.0.7".to_string()]);
        assert_eq!(vm.status.observed_generation, 1);
        assert!(vm.status.active_task.is_none());
        assert_eq!(condition(&vm, CONDITION_READY).status, ConditionStatus::True);
        assert_eq!(provider.count(OperationKind::Create), 1);
        assert_eq!(provider.count(OperationKind::PowerOn), 1);

        // steady state is a no-op and writes nothing
        let version = vm.metadata.resource_version;
        assert_eq!(h.pass().await, ReconcileOutcome::Steady);
        assert_eq!(h.vm().await.metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_in_flight_task_is_polled_not_reissued() {
        let provider = FakeProvider::full();
        provider.with(|s| s.hold = true);
        let h = Harness::new(provider.clone(), spec(PowerState::On));

        assert!(matches!(h.pass().await, ReconcileOutcome::Poll(_)));
        let task = h.vm().await.status.active_task.unwrap();
        assert_eq!(task.kind, OperationKind::Create);
        assert_eq!(h.vm().await.status.phase, Some(VmPhase::Provisioning));

        for _ in 0..3 {
            assert!(matches!(h.pass().await, ReconcileOutcome::Poll(_)));
        }
        assert_eq!(provider.with(|s| s.side_effects.len()), 1);
        assert_eq!(h.vm().await.status.active_task.unwrap().handle, task.handle);

        provider.release();
        h.converge(5).await;
        assert_eq!(provider.count(OperationKind::Create), 1);
    }

    #[tokio::test]
    async fn test_lost_status_write_rederives_same_key() {
        let provider = FakeProvider::full();
        provider.with(|s| s.hold = true);
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.pass().await;
        let first = h.vm().await.status.active_task.unwrap();

        // forget the handle as if the status write had been lost
        let vm = h.vm().await;
        let mut status = vm.status.clone();
        status.active_task = None;
        h.store
            .update_status(&h.key, status, vm.metadata.resource_version)
            .await
            .unwrap();

        h.pass().await;
        let second = h.vm().await.status.active_task.unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(first.handle, second.handle);
        assert_eq!(provider.with(|s| s.side_effects.len()), 1);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_without_guest_agent_issues_hard_off() {
        let mut mock = MockProviderService::new();
        mock.expect_capabilities().returning(|| {
            Ok(ProviderInfo {
                protocol_version: PROTOCOL_VERSION.into(),
                family: "proxmox".into(),
                capabilities: [Capability::Core, Capability::Snapshots].into_iter().collect(),
            })
        });
        mock.expect_describe().returning(|vm_ref| {
            let mut vm = FakeProvider::observed(&MachineSpec {
                name: vm_ref.to_string(),
                cpus: 2,
                memory_mib: 2048,
                image: "alpine".into(),
                networks: vec![],
                disks: vec![common::spec::vm::DiskSpec {
                    name: "root".into(),
                    size_gib: 20,
                }],
            });
            vm.power_state = PowerState::On;
            Ok(Some(vm))
        });
        mock.expect_submit()
            .withf(|vm_ref, key, op| {
                vm_ref == "7-default-web" && key.ends_with("/power-off") && *op == Operation::PowerOff
            })
            .times(1)
            .returning(|_, _, _| Ok("task-1".to_string()));

        let h = Harness::new(Arc::new(mock), spec(PowerState::OffGraceful));
        assert!(matches!(h.pass().await, ReconcileOutcome::Poll(_)));
        let task = h.vm().await.status.active_task.unwrap();
        assert_eq!(task.kind, OperationKind::PowerOff);
    }

    #[tokio::test]
    async fn test_delete_of_absent_vm_completes_without_error() {
        let provider = FakeProvider::full();
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.store.request_deletion(&h.key).unwrap();

        assert_eq!(h.pass().await, ReconcileOutcome::Removed);
        assert!(h.store.get(&h.key).await.unwrap().is_none());
        assert_eq!(provider.count(OperationKind::Delete), 0);
    }

    #[tokio::test]
    async fn test_delete_drives_through_deleting() {
        let provider = FakeProvider::full();
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.converge(5).await;

        h.store.request_deletion(&h.key).unwrap();
        assert!(matches!(h.pass().await, ReconcileOutcome::Poll(_)));
        let vm = h.vm().await;
        assert_eq!(vm.status.phase, Some(VmPhase::Deleting));
        assert_eq!(vm.status.active_task.unwrap().kind, OperationKind::Delete);

        assert_eq!(h.pass().await, ReconcileOutcome::Removed);
        assert_eq!(provider.count(OperationKind::Delete), 1);
        assert!(provider.with(|s| s.vms.is_empty()));
    }

    #[tokio::test]
    async fn test_keys_with_shared_dashes_get_distinct_machines() {
        let provider = FakeProvider::full();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(1)));
        registry.insert(descriptor(), provider.clone());
        let reconciler = Reconciler::new(store.clone(), registry, &settings());
        let first = store
            .apply(VirtualMachine::new("a-b", "c", spec(PowerState::On)))
            .unwrap()
            .key();
        let second = store
            .apply(VirtualMachine::new("a", "b-c", spec(PowerState::On)))
            .unwrap()
            .key();

        for key in [&first, &second] {
            let mut steady = false;
            for _ in 0..5 {
                if reconciler.reconcile(key).await.unwrap() == ReconcileOutcome::Steady {
                    steady = true;
                    break;
                }
            }
            assert!(steady, "{key} did not converge");
        }
        assert_eq!(provider.count(OperationKind::Create), 2);
        assert_eq!(provider.with(|s| s.vms.len()), 2);

        store.request_deletion(&second).unwrap();
        for _ in 0..5 {
            if reconciler.reconcile(&second).await.unwrap() == ReconcileOutcome::Removed {
                break;
            }
        }
        assert!(store.get(&second).await.unwrap().is_none());
        let survivor = store.get(&first).await.unwrap().unwrap();
        let vm_ref = survivor.vm_ref();
        assert!(provider.with(|s| s.vms.contains_key(&vm_ref)));
        assert_eq!(provider.with(|s| s.vms.len()), 1);
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let provider = FakeProvider::full();
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.converge(5).await;

        h.store.request_deletion(&h.key).unwrap();
        provider.with(|s| s.fail_next = Some(ProviderError::not_found("already gone")));
        h.pass().await;
        provider.with(|s| s.vms.clear());
        assert_eq!(h.pass().await, ReconcileOutcome::Removed);
    }

    #[tokio::test]
    async fn test_evicted_task_is_reverified_not_failed() {
        let provider = FakeProvider::full();
        provider.with(|s| s.hold = true);
        let h = Harness::new(provider.clone(), spec(PowerState::Off));
        h.pass().await;
        assert_eq!(h.vm().await.status.operation_seq, 0);

        // the create went through but the tracker forgot the task
        provider.release();
        provider.evict_all();

        assert_eq!(h.pass().await, ReconcileOutcome::Steady);
        let vm = h.vm().await;
        assert_ne!(vm.status.phase, Some(VmPhase::Failed));
        assert_eq!(vm.status.phase, Some(VmPhase::Stopped));
        assert_eq!(vm.status.operation_seq, 1);
        assert!(vm.status.condition(CONDITION_FAILED).is_none());
        assert_eq!(provider.count(OperationKind::Create), 1);
    }

    #[tokio::test]
    async fn test_invalid_argument_parks_until_generation_changes() {
        let provider = FakeProvider::full();
        provider.with(|s| s.fail_next = Some(ProviderError::invalid_argument("unknown image")));
        let h = Harness::new(provider.clone(), spec(PowerState::On));

        h.pass().await;
        assert_eq!(h.pass().await, ReconcileOutcome::Failed);
        let vm = h.vm().await;
        assert_eq!(vm.status.phase, Some(VmPhase::Failed));
        assert_eq!(vm.status.failed_generation, Some(1));
        assert_eq!(condition(&vm, CONDITION_FAILED).reason, "InvalidArgument");

        // no auto retry for the same generation
        for _ in 0..3 {
            assert_eq!(h.pass().await, ReconcileOutcome::Failed);
        }
        assert_eq!(provider.count(OperationKind::Create), 1);

        let mut fixed = spec(PowerState::On);
        fixed.image = "alpine-3.20".into();
        h.store.apply(VirtualMachine::new("default", "web", fixed)).unwrap();
        h.converge(5).await;
        let vm = h.vm().await;
        assert_eq!(vm.status.phase, Some(VmPhase::Running));
        assert_eq!(condition(&vm, CONDITION_FAILED).status, ConditionStatus::False);
        assert_eq!(provider.count(OperationKind::Create), 2);
    }

    #[tokio::test]
    async fn test_unimplemented_is_treated_as_invalid_argument() {
        let provider = FakeProvider::full();
        provider.with(|s| s.fail_next = Some(ProviderError::unimplemented("no linked clones")));
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.pass().await;
        assert_eq!(h.pass().await, ReconcileOutcome::Failed);
    }

    #[tokio::test]
    async fn test_transient_errors_back_off_without_failing() {
        let provider = FakeProvider::full();
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        provider.with(|s| s.unreachable = true);

        let mut delays = Vec::new();
        for _ in 0..3 {
            match h.pass().await {
                ReconcileOutcome::Retry(d) => delays.push(d),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );
        let vm = h.vm().await;
        assert_eq!(vm.status.attempts, 3);
        assert_ne!(vm.status.phase, Some(VmPhase::Failed));
        assert_eq!(
            condition(&vm, CONDITION_PROVIDER_AVAILABLE).reason,
            REASON_UNREACHABLE
        );

        provider.with(|s| s.unreachable = false);
        h.converge(5).await;
        let vm = h.vm().await;
        assert_eq!(vm.status.attempts, 0);
        assert_eq!(
            condition(&vm, CONDITION_PROVIDER_AVAILABLE).status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_with_fresh_key() {
        let provider = FakeProvider::full();
        provider.with(|s| s.fail_next = Some(ProviderError::internal("libvirtd crashed")));
        let h = Harness::new(provider.clone(), spec(PowerState::Off));

        h.pass().await;
        assert!(matches!(h.pass().await, ReconcileOutcome::Retry(_)));
        let vm = h.vm().await;
        assert_eq!(vm.status.operation_seq, 1);
        assert_eq!(condition(&vm, CONDITION_READY).reason, REASON_RETRYING);

        h.converge(5).await;
        let keys: Vec<String> = provider.with(|s| s.side_effects.iter().map(|(k, _)| k.clone()).collect());
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
        assert!(keys[1].ends_with("/create#1"));
    }

    #[tokio::test]
    async fn test_incompatible_provider_version() {
        let provider = FakeProvider::full();
        provider.with(|s| s.version = Some("2.0".into()));
        let h = Harness::new(provider.clone(), spec(PowerState::On));

        assert!(matches!(h.pass().await, ReconcileOutcome::Retry(_)));
        let vm = h.vm().await;
        assert_eq!(
            condition(&vm, CONDITION_PROVIDER_AVAILABLE).reason,
            REASON_INCOMPATIBLE_VERSION
        );
        assert!(provider.with(|s| s.side_effects.is_empty()));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let provider = FakeProvider::full();
        let mut spec = spec(PowerState::On);
        spec.provider = "nowhere".into();
        let h = Harness::new(provider, spec);

        assert!(matches!(h.pass().await, ReconcileOutcome::Retry(_)));
        let vm = h.vm().await;
        assert_eq!(
            condition(&vm, CONDITION_PROVIDER_AVAILABLE).reason,
            REASON_UNKNOWN_PROVIDER
        );
    }

    #[tokio::test]
    async fn test_disk_shrink_is_permanent() {
        let provider = FakeProvider::full();
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.converge(5).await;

        let mut smaller = spec(PowerState::On);
        smaller.disks[0].size_gib = 10;
        h.store.apply(VirtualMachine::new("default", "web", smaller)).unwrap();

        assert_eq!(h.pass().await, ReconcileOutcome::Failed);
        let vm = h.vm().await;
        assert_eq!(condition(&vm, CONDITION_FAILED).reason, REASON_DISK_SHRINK_UNSUPPORTED);
        assert_eq!(provider.count(OperationKind::Reconfigure), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_offline_round_trip() {
        let provider = FakeProvider::new([Capability::Core].into_iter().collect());
        let h = Harness::new(provider.clone(), spec(PowerState::On));
        h.converge(5).await;

        let mut bigger = spec(PowerState::On);
        bigger.class.cpus = 8;
        h.store.apply(VirtualMachine::new("default", "web", bigger)).unwrap();
        h.converge(8).await;

        let vm = h.vm().await;
        assert_eq!(vm.status.hardware.unwrap().cpus, 8);
        assert_eq!(vm.status.power_state, Some(PowerState::On));
        assert_eq!(provider.count(OperationKind::PowerOff), 1);
        assert_eq!(provider.count(OperationKind::Reconfigure), 1);
        assert_eq!(provider.count(OperationKind::PowerOn), 2);
    }

    // ========================================
    // CONFLICT RETRY
    // ========================================

    /// Store that lands a spec update right before the next status write.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        race: Mutex<Option<VmSpec>>,
    }

    #[async_trait::async_trait]
    impl ResourceStore for RacingStore {
        async fn get(&self, key: &ResourceKey) -> Result<Option<VirtualMachine>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self) -> Result<(Vec<VirtualMachine>, u64), StoreError> {
            self.inner.list().await
        }

        async fn update_status(
            &self,
            key: &ResourceKey,
            status: VmStatus,
            expected_version: u64,
        ) -> Result<VirtualMachine, StoreError> {
            let pending = self.race.lock().unwrap().take();
            if let Some(spec) = pending {
                self.inner
                    .apply(VirtualMachine::new(&key.namespace, &key.name, spec))?;
            }
            self.inner.update_status(key, status, expected_version).await
        }

        async fn remove(&self, key: &ResourceKey, expected_version: u64) -> Result<(), StoreError> {
            self.inner.remove(key, expected_version).await
        }

        async fn next_event(&self, cursor: u64) -> Result<crate::storage::WatchEvent, StoreError> {
            self.inner.next_event(cursor).await
        }
    }

    #[tokio::test]
    async fn test_conflicting_status_write_is_retried_against_fresh_version() {
        let provider = FakeProvider::full();
        let memory = Arc::new(MemoryStore::new());
        let vm = memory
            .apply(VirtualMachine::new("default", "web", spec(PowerState::On)))
            .unwrap();
        let mut racing_spec = spec(PowerState::On);
        racing_spec.class.memory_mib = 4096;
        let store = Arc::new(RacingStore {
            inner: memory.clone(),
            race: Mutex::new(Some(racing_spec)),
        });
        let registry = Arc::new(ProviderRegistry::new(Duration::from_secs(1)));
        registry.insert(descriptor(), provider.clone());
        let reconciler = Reconciler::new(store, registry, &settings());

        assert_eq!(
            reconciler.reconcile(&vm.key()).await.unwrap(),
            ReconcileOutcome::Conflict
        );
        // the lost write held the create handle; nothing was persisted
        let current = memory.get(&vm.key()).await.unwrap().unwrap();
        assert!(current.status.active_task.is_none());
        assert_eq!(current.metadata.generation, 2);

        let mut steady = false;
        for _ in 0..6 {
            if reconciler.reconcile(&vm.key()).await.unwrap() == ReconcileOutcome::Steady {
                steady = true;
                break;
            }
        }
        assert!(steady);
        let current = memory.get(&vm.key()).await.unwrap().unwrap();
        assert_eq!(current.spec.class.memory_mib, 4096);
        assert_eq!(current.status.observed_generation, 2);
        assert_eq!(current.status.hardware.unwrap().memory_mib, 4096);
    }
}
