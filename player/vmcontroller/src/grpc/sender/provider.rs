/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! gRPC client for the `provider.v1` contract.
//!
//! Every call is bounded by the configured RPC timeout; an elapsed deadline
//! or a transport failure surfaces as `Unavailable`. The protocol version is
//! checked once per connection and every mutating or read call fails fast
//! with [`ClientError::IncompatibleVersion`] against a peer with another
//! major version.

use crate::provider::{ClientError, Operation, ProviderInfo, ProviderService, TaskPoll};
use common::capability::CapabilitySet;
use common::error::ProviderError;
use common::provider::provider_client::ProviderClient;
use common::provider::{
    connect_server, is_compatible, CancelTaskRequest, CapabilitiesRequest, CloneVmRequest,
    CreateVmRequest, DescribeVmRequest, HealthCheckRequest, PollTaskRequest,
    PowerOffGracefulRequest, ReconfigureVmRequest, SnapshotRequest, VmRequest, VmSpec as WireSpec,
    PROTOCOL_VERSION,
};
use common::spec::ObservedVm;
use common::task::TaskPhase;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

pub struct GrpcProviderClient {
    endpoint: String,
    client: ProviderClient<Channel>,
    timeout: Duration,
    /// Protocol version of the peer once it has been verified compatible.
    negotiated: RwLock<Option<String>>,
}

impl GrpcProviderClient {
    /// Build a client over a lazily connected channel.
    pub fn new(endpoint: &str, timeout: Duration) -> common::Result<Self> {
        let uri = connect_server(endpoint);
        let channel = Endpoint::from_shared(uri.clone())?
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            endpoint: uri,
            client: ProviderClient::new(channel),
            timeout,
            negotiated: RwLock::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T, F>(&self, rpc: &str, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<Response<T>, Status>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(ProviderError::from(status).into()),
            Err(_) => Err(ProviderError::unavailable(format!(
                "{rpc} to {} timed out after {:?}",
                self.endpoint, self.timeout
            ))
            .into()),
        }
    }

    async fn fetch_info(&self) -> Result<ProviderInfo, ClientError> {
        let mut client = self.client.clone();
        let response = self
            .call(
                "GetCapabilities",
                client.get_capabilities(Request::new(CapabilitiesRequest {})),
            )
            .await?;

        let info = ProviderInfo {
            capabilities: CapabilitySet::from_tokens(&response.capabilities),
            protocol_version: response.protocol_version,
            family: response.family,
        };
        if let Ok(mut negotiated) = self.negotiated.write() {
            *negotiated = is_compatible(&info.protocol_version)
                .then(|| info.protocol_version.clone());
        }
        Ok(info)
    }

    async fn ensure_compatible(&self) -> Result<(), ClientError> {
        let verified = self
            .negotiated
            .read()
            .map(|n| n.is_some())
            .unwrap_or(false);
        if verified {
            return Ok(());
        }
        let info = self.fetch_info().await?;
        if is_compatible(&info.protocol_version) {
            Ok(())
        } else {
            Err(ClientError::IncompatibleVersion {
                server: info.protocol_version,
                client: PROTOCOL_VERSION.to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl ProviderService for GrpcProviderClient {
    async fn capabilities(&self) -> Result<ProviderInfo, ClientError> {
        self.fetch_info().await
    }

    async fn submit(&self, vm_ref: &str, key: &str, op: Operation) -> Result<String, ClientError> {
        self.ensure_compatible().await?;

        let mut client = self.client.clone();
        let idempotency_key = key.to_string();
        let vm_ref = vm_ref.to_string();
        let kind = op.kind();
        let response = match op {
            Operation::Create { spec } => {
                let request = CreateVmRequest {
                    idempotency_key,
                    spec: Some(WireSpec::from(&spec)),
                };
                self.call("CreateVm", client.create_vm(Request::new(request)))
                    .await?
            }
            Operation::Clone {
                source,
                spec,
                linked,
            } => {
                let request = CloneVmRequest {
                    idempotency_key,
                    source_vm_ref: source,
                    spec: Some(WireSpec::from(&spec)),
                    linked,
                };
                self.call("CloneVm", client.clone_vm(Request::new(request)))
                    .await?
            }
            Operation::Delete => {
                let request = VmRequest {
                    idempotency_key,
                    vm_ref,
                };
                self.call("DeleteVm", client.delete_vm(Request::new(request)))
                    .await?
            }
            Operation::PowerOn => {
                let request = VmRequest {
                    idempotency_key,
                    vm_ref,
                };
                self.call("PowerOn", client.power_on(Request::new(request)))
                    .await?
            }
            Operation::PowerOff => {
                let request = VmRequest {
                    idempotency_key,
                    vm_ref,
                };
                self.call("PowerOff", client.power_off(Request::new(request)))
                    .await?
            }
            Operation::PowerOffGraceful { grace_secs } => {
                let request = PowerOffGracefulRequest {
                    idempotency_key,
                    vm_ref,
                    grace_period_seconds: grace_secs,
                };
                self.call(
                    "PowerOffGraceful",
                    client.power_off_graceful(Request::new(request)),
                )
                .await?
            }
            Operation::Suspend => {
                let request = VmRequest {
                    idempotency_key,
                    vm_ref,
                };
                self.call("Suspend", client.suspend(Request::new(request)))
                    .await?
            }
            Operation::Reconfigure { spec } => {
                let request = ReconfigureVmRequest {
                    idempotency_key,
                    vm_ref,
                    spec: Some(WireSpec::from(&spec)),
                };
                self.call("ReconfigureVm", client.reconfigure_vm(Request::new(request)))
                    .await?
            }
            Operation::SnapshotCreate { name } => {
                let request = SnapshotRequest {
                    idempotency_key,
                    vm_ref,
                    snapshot_name: name,
                };
                self.call("CreateSnapshot", client.create_snapshot(Request::new(request)))
                    .await?
            }
            Operation::SnapshotDelete { name } => {
                let request = SnapshotRequest {
                    idempotency_key,
                    vm_ref,
                    snapshot_name: name,
                };
                self.call("DeleteSnapshot", client.delete_snapshot(Request::new(request)))
                    .await?
            }
            Operation::SnapshotRevert { name } => {
                let request = SnapshotRequest {
                    idempotency_key,
                    vm_ref,
                    snapshot_name: name,
                };
                self.call("RevertSnapshot", client.revert_snapshot(Request::new(request)))
                    .await?
            }
        };

        tracing::debug!(%kind, key, handle = %response.task_handle, "provider accepted task");
        Ok(response.task_handle)
    }

    async fn describe(&self, vm_ref: &str) -> Result<Option<ObservedVm>, ClientError> {
        self.ensure_compatible().await?;

        let mut client = self.client.clone();
        let request = DescribeVmRequest {
            vm_ref: vm_ref.to_string(),
        };
        match self
            .call("DescribeVm", client.describe_vm(Request::new(request)))
            .await
        {
            Ok(response) => Ok(response.vm.as_ref().map(ObservedVm::from)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn poll_task(&self, handle: &str) -> Result<TaskPoll, ClientError> {
        self.ensure_compatible().await?;

        let mut client = self.client.clone();
        let request = PollTaskRequest {
            task_handle: handle.to_string(),
        };
        let response = self
            .call("PollTask", client.poll_task(Request::new(request)))
            .await?;
        Ok(TaskPoll {
            phase: response.phase().into(),
            result: response.result.as_ref().map(ObservedVm::from),
            error: response.error.as_ref().map(ProviderError::from),
        })
    }

    async fn cancel_task(&self, handle: &str) -> Result<TaskPhase, ClientError> {
        self.ensure_compatible().await?;

        let mut client = self.client.clone();
        let request = CancelTaskRequest {
            task_handle: handle.to_string(),
        };
        let response = self
            .call("CancelTask", client.cancel_task(Request::new(request)))
            .await?;
        Ok(response.phase().into())
    }

    async fn health_check(&self) -> Result<bool, ClientError> {
        let mut client = self.client.clone();
        let response = self
            .call(
                "HealthCheck",
                client.health_check(Request::new(HealthCheckRequest {})),
            )
            .await?;
        Ok(response.serving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::ErrorKind;

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        // nothing listens on the discard port
        let client = GrpcProviderClient::new("127.0.0.1:9", Duration::from_millis(300)).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:9");

        let err = client.describe("default-web").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unavailable));
        let err = client.health_check().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unavailable));
    }

    #[test]
    fn test_rejects_malformed_endpoint() {
        assert!(GrpcProviderClient::new("http://bad host:1", Duration::from_secs(1)).is_err());
    }
}
