/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider server entry point
//!
//! Starts the `provider.v1` gRPC server for one hypervisor family and a side
//! HTTP server exposing `/healthz` and `/readyz`.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use common::capability::Capability;
use common::health::HealthReporter;
use common::spec::ProviderFamily;
use provider::runtime::{self, HypervisorBackend, SimulatedHypervisor};
use provider::{ProviderReceiver, TaskTracker};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "provider", version, about = "Hypervisor provider server")]
struct Cli {
    /// gRPC listen port
    #[arg(long, env = "PROVIDER_PORT", default_value_t = common::provider::DEFAULT_PORT)]
    port: u16,

    /// HTTP port for /healthz and /readyz
    #[arg(long, env = "PROVIDER_HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    /// Hypervisor family served by this process (libvirt, vsphere, proxmox)
    #[arg(long, env = "PROVIDER_FAMILY", default_value = "libvirt")]
    family: ProviderFamily,

    /// Capability token to withhold from the advertised set; repeatable
    #[arg(long = "disable-capability")]
    disable_capability: Vec<String>,

    /// How long finished tasks stay pollable
    #[arg(long, default_value_t = 600)]
    task_retention_secs: u64,

    /// Upper bound on finished tasks kept for polling
    #[arg(long, default_value_t = 1024)]
    task_retention_max: usize,

    /// Deadline for DescribeVm and HealthCheck backend calls
    #[arg(long, default_value_t = 5000)]
    describe_timeout_ms: u64,

    /// Latency of simulated backend jobs; 0 completes them synchronously
    #[arg(long, default_value_t = 0)]
    sim_job_latency_ms: u64,
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::logd::init();
    let cli = Cli::parse();

    let mut capabilities = runtime::default_capabilities(cli.family);
    for token in &cli.disable_capability {
        match Capability::parse(token) {
            Some(Capability::Core) => bail!("the core capability cannot be disabled"),
            Some(capability) => capabilities.remove(capability),
            None => bail!("unknown capability token {token:?}"),
        }
    }
    tracing::info!(
        family = %cli.family,
        capabilities = ?capabilities.tokens(),
        "starting provider"
    );

    let backend = Arc::new(
        SimulatedHypervisor::new(cli.family)
            .with_capabilities(capabilities.clone())
            .with_job_latency(Duration::from_millis(cli.sim_job_latency_ms)),
    );
    let health = HealthReporter::new();
    health.register("backend");
    match backend.ping().await {
        Ok(()) => health.set_healthy("backend"),
        Err(e) => health.set_unhealthy("backend", e.to_string()),
    }

    let tracker = TaskTracker::new(
        Duration::from_secs(cli.task_retention_secs),
        cli.task_retention_max,
    );
    let receiver = ProviderReceiver::new(backend, tracker, capabilities)
        .with_describe_timeout(Duration::from_millis(cli.describe_timeout_ms))
        .with_health(health.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    let health_task = tokio::spawn(health.serve(cli.health_port, shutdown_signal(stop_rx.clone())));

    let addr = common::provider::open_server(cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding provider gRPC server to {addr}"))?;
    provider::serve_with_listener(receiver, listener, shutdown_signal(stop_rx))
        .await
        .map_err(|e| anyhow!(e))?;

    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "health server failed"),
        Err(e) => tracing::warn!(error = %e, "health server task panicked"),
    }
    Ok(())
}
