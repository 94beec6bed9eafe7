/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider gRPC service handler.
//!
//! Mutating calls are answered from the task tracker when their idempotency
//! key is known; otherwise they are validated, gated on capability and
//! registered as a new tracked task. Nothing here blocks on a backend job.

use crate::runtime::{self, BackendOp, HypervisorBackend, JOB_POLL_INTERVAL};
use crate::task::TaskTracker;
use common::capability::{Capability, CapabilitySet};
use common::error::ProviderError;
use common::health::HealthReporter;
use common::provider::provider_server::Provider;
use common::provider::{
    CancelTaskRequest, CancelTaskResponse, CapabilitiesRequest, CapabilitiesResponse,
    CloneVmRequest, CreateVmRequest, DescribeVmRequest, DescribeVmResponse, HealthCheckRequest,
    HealthCheckResponse, PollTaskRequest, PollTaskResponse, PowerOffGracefulRequest,
    ReconfigureVmRequest, SnapshotRequest, TaskError, TaskResponse, VmObservation, VmRequest,
    VmSpec, PROTOCOL_VERSION,
};
use common::spec::vm::{MachineSpec, ObservedVm};
use common::spec::PowerState;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tonic::{Request, Response, Status};

pub const DEFAULT_DESCRIBE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_GRACE_PERIOD_SECS: u32 = 60;

/// Provider gRPC service handler
#[derive(Clone)]
pub struct ProviderReceiver {
    backend: Arc<dyn HypervisorBackend>,
    tracker: TaskTracker<Option<ObservedVm>>,
    capabilities: CapabilitySet,
    describe_timeout: Duration,
    job_poll_interval: Duration,
    health: Option<HealthReporter>,
}

impl ProviderReceiver {
    pub fn new(
        backend: Arc<dyn HypervisorBackend>,
        tracker: TaskTracker<Option<ObservedVm>>,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            backend,
            tracker,
            capabilities,
            describe_timeout: DEFAULT_DESCRIBE_TIMEOUT,
            job_poll_interval: JOB_POLL_INTERVAL,
            health: None,
        }
    }

    pub fn with_describe_timeout(mut self, describe_timeout: Duration) -> Self {
        self.describe_timeout = describe_timeout;
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_health(mut self, health: HealthReporter) -> Self {
        self.health = Some(health);
        self
    }

    async fn describe_backend(&self, vm_ref: &str) -> Result<Option<ObservedVm>, ProviderError> {
        match timeout(self.describe_timeout, self.backend.describe(vm_ref)).await {
            Ok(Ok(observed)) => Ok(observed),
            Ok(Err(native)) => Err(native.classify()),
            Err(_) => Err(ProviderError::unavailable(format!(
                "describe {vm_ref} exceeded {}ms",
                self.describe_timeout.as_millis()
            ))),
        }
    }

    fn require(&self, capability: Capability) -> Result<(), ProviderError> {
        if self.capabilities.supports(capability) {
            Ok(())
        } else {
            Err(ProviderError::unimplemented(format!(
                "{} provider does not advertise {capability}",
                self.backend.family()
            )))
        }
    }

    /// Shared path of every mutating RPC.
    async fn submit(&self, key: String, op: BackendOp) -> Result<Response<TaskResponse>, Status> {
        if key.trim().is_empty() {
            return Err(ProviderError::invalid_argument("idempotency_key is required").into());
        }
        if op.vm_ref().trim().is_empty() {
            return Err(ProviderError::invalid_argument("vm_ref is required").into());
        }

        // a known key wins over every other check
        if let Some(handle) = self.tracker.lookup(&key)? {
            tracing::info!(%key, %handle, "returning existing task for idempotency key");
            return Ok(Response::new(TaskResponse { task_handle: handle }));
        }

        if let Some(capability) = op.required_capability() {
            self.require(capability)?;
        }
        if let BackendOp::Reconfigure { vm_ref, .. } = &op {
            if !self.capabilities.supports(Capability::OnlineReconfigure) {
                let observed = self.describe_backend(vm_ref).await?;
                if observed.map(|vm| vm.power_state) == Some(PowerState::On) {
                    return Err(ProviderError::unimplemented(format!(
                        "{vm_ref} is running and {} cannot reconfigure online",
                        self.backend.family()
                    ))
                    .into());
                }
            }
        }

        let kind = op.kind();
        let backend = Arc::clone(&self.backend);
        let interval = self.job_poll_interval;
        let registration = self.tracker.register(&key, move |cancel| {
            runtime::execute(backend, op, cancel, interval)
        })?;

        tracing::info!(
            %key,
            handle = %registration.handle,
            %kind,
            created = registration.created,
            "mutating call accepted"
        );
        Ok(Response::new(TaskResponse {
            task_handle: registration.handle,
        }))
    }
}

fn machine_spec(spec: Option<VmSpec>) -> Result<MachineSpec, ProviderError> {
    let spec = spec.ok_or_else(|| ProviderError::invalid_argument("spec is required"))?;
    if spec.name.trim().is_empty() {
        return Err(ProviderError::invalid_argument("spec.name is required"));
    }
    if spec.cpus == 0 || spec.memory_mib == 0 {
        return Err(ProviderError::invalid_argument(
            "spec.cpus and spec.memory_mib must be positive",
        ));
    }
    Ok(MachineSpec::from(&spec))
}

#[tonic::async_trait]
impl Provider for ProviderReceiver {
    async fn create_vm(
        &self,
        request: Request<CreateVmRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        let spec = machine_spec(req.spec)?;
        self.submit(req.idempotency_key, BackendOp::Create { spec })
            .await
    }

    async fn clone_vm(
        &self,
        request: Request<CloneVmRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        if req.source_vm_ref.trim().is_empty() {
            return Err(ProviderError::invalid_argument("source_vm_ref is required").into());
        }
        let spec = machine_spec(req.spec)?;
        let op = BackendOp::Clone {
            source: req.source_vm_ref,
            spec,
            linked: req.linked,
        };
        self.submit(req.idempotency_key, op).await
    }

    async fn delete_vm(&self, request: Request<VmRequest>) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        self.submit(req.idempotency_key, BackendOp::Delete { vm_ref: req.vm_ref })
            .await
    }

    async fn power_on(&self, request: Request<VmRequest>) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        self.submit(req.idempotency_key, BackendOp::PowerOn { vm_ref: req.vm_ref })
            .await
    }

    async fn power_off(&self, request: Request<VmRequest>) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        self.submit(req.idempotency_key, BackendOp::PowerOff { vm_ref: req.vm_ref })
            .await
    }

    async fn power_off_graceful(
        &self,
        request: Request<PowerOffGracefulRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        let secs = match req.grace_period_seconds {
            0 => DEFAULT_GRACE_PERIOD_SECS,
            secs => secs,
        };
        let op = BackendOp::Shutdown {
            vm_ref: req.vm_ref,
            grace: Duration::from_secs(u64::from(secs)),
        };
        self.submit(req.idempotency_key, op).await
    }

    async fn suspend(&self, request: Request<VmRequest>) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        self.submit(req.idempotency_key, BackendOp::Suspend { vm_ref: req.vm_ref })
            .await
    }

    async fn reconfigure_vm(
        &self,
        request: Request<ReconfigureVmRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        let spec = machine_spec(req.spec)?;
        let op = BackendOp::Reconfigure {
            vm_ref: req.vm_ref,
            spec,
        };
        self.submit(req.idempotency_key, op).await
    }

    async fn create_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        let op = BackendOp::SnapshotCreate {
            vm_ref: req.vm_ref,
            name: snapshot_name(req.snapshot_name)?,
        };
        self.submit(req.idempotency_key, op).await
    }

    async fn delete_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        let op = BackendOp::SnapshotDelete {
            vm_ref: req.vm_ref,
            name: snapshot_name(req.snapshot_name)?,
        };
        self.submit(req.idempotency_key, op).await
    }

    async fn revert_snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<TaskResponse>, Status> {
        let req = request.into_inner();
        let op = BackendOp::SnapshotRevert {
            vm_ref: req.vm_ref,
            name: snapshot_name(req.snapshot_name)?,
        };
        self.submit(req.idempotency_key, op).await
    }

    async fn describe_vm(
        &self,
        request: Request<DescribeVmRequest>,
    ) -> Result<Response<DescribeVmResponse>, Status> {
        let vm_ref = request.into_inner().vm_ref;
        if vm_ref.trim().is_empty() {
            return Err(ProviderError::invalid_argument("vm_ref is required").into());
        }
        match self.describe_backend(&vm_ref).await? {
            Some(observed) => Ok(Response::new(DescribeVmResponse {
                vm: Some(VmObservation::from(&observed)),
            })),
            None => Err(ProviderError::not_found(format!("vm {vm_ref} does not exist")).into()),
        }
    }

    async fn poll_task(
        &self,
        request: Request<PollTaskRequest>,
    ) -> Result<Response<PollTaskResponse>, Status> {
        let handle = request.into_inner().task_handle;
        let snapshot = self.tracker.poll(&handle)?;
        tracing::debug!(%handle, key = %snapshot.key, phase = ?snapshot.phase, "poll");
        Ok(Response::new(PollTaskResponse {
            phase: common::provider::TaskPhase::from(snapshot.phase) as i32,
            result: snapshot
                .result
                .flatten()
                .as_ref()
                .map(VmObservation::from),
            error: snapshot.error.as_ref().map(TaskError::from),
        }))
    }

    async fn cancel_task(
        &self,
        request: Request<CancelTaskRequest>,
    ) -> Result<Response<CancelTaskResponse>, Status> {
        let handle = request.into_inner().task_handle;
        let phase = self.tracker.cancel(&handle)?;
        Ok(Response::new(CancelTaskResponse {
            phase: common::provider::TaskPhase::from(phase) as i32,
        }))
    }

    async fn get_capabilities(
        &self,
        _request: Request<CapabilitiesRequest>,
    ) -> Result<Response<CapabilitiesResponse>, Status> {
        Ok(Response::new(CapabilitiesResponse {
            protocol_version: PROTOCOL_VERSION.to_string(),
            family: self.backend.family().to_string(),
            capabilities: self.capabilities.tokens(),
        }))
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let serving = match timeout(self.describe_timeout, self.backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(native)) => {
                tracing::warn!(error = %native, "backend ping failed");
                false
            }
            Err(_) => {
                tracing::warn!("backend ping timed out");
                false
            }
        };
        if let Some(health) = &self.health {
            health.set("backend", serving, if serving { "ok" } else { "unreachable" });
        }
        Ok(Response::new(HealthCheckResponse { serving }))
    }
}

fn snapshot_name(name: String) -> Result<String, ProviderError> {
    if name.trim().is_empty() {
        Err(ProviderError::invalid_argument("snapshot_name is required"))
    } else {
        Ok(name)
    }
}
