/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider server for one hypervisor family.
//!
//! Exposes the `provider.v1` gRPC contract on top of a [`HypervisorBackend`],
//! with every mutating call tracked by a [`TaskTracker`].

pub mod grpc;
pub mod runtime;
pub mod task;

pub use grpc::receiver::ProviderReceiver;
pub use runtime::{HypervisorBackend, SimulatedHypervisor};
pub use task::TaskTracker;

use common::provider::provider_server::ProviderServer;
use std::future::Future;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

/// Serve `receiver` on an already bound listener until `shutdown` resolves.
pub async fn serve_with_listener<F>(
    receiver: ProviderReceiver,
    listener: TcpListener,
    shutdown: F,
) -> common::Result<()>
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "provider gRPC server listening");
    }
    Server::builder()
        .add_service(ProviderServer::new(receiver))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;
    tracing::info!("provider gRPC server stopped");
    Ok(())
}
