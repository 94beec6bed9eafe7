/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! VM controller entry point
//!
//! Loads settings, binds the configured providers, optionally seeds the
//! in-memory store from a manifest directory and runs the controller until
//! ctrl-c. A side HTTP server exposes `/healthz` and `/readyz`.

use anyhow::Context;
use clap::Parser;
use common::health::HealthReporter;
use common::setting::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use vmcontroller::artifact::ManifestLoader;
use vmcontroller::{ControllerManager, MemoryStore, ProviderRegistry};

#[derive(Parser, Debug)]
#[command(name = "vmcontroller", version, about = "VM reconciliation controller")]
struct Cli {
    /// Optional YAML settings file; VMCTL_* variables override it
    #[arg(long, env = "VMCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of VirtualMachine and Provider manifests
    #[arg(long, env = "VMCTL_MANIFESTS")]
    manifests: Option<PathBuf>,

    /// HTTP port for /healthz and /readyz
    #[arg(long, env = "VMCTL_HEALTH_PORT", default_value_t = 8081)]
    health_port: u16,
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::logd::init();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("loading controller settings")?;
    let controller = settings.controller;

    let registry = Arc::new(ProviderRegistry::new(controller.rpc_timeout()));
    for descriptor in &controller.providers {
        registry
            .bind(descriptor)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("binding provider {}", descriptor.name))?;
    }

    let store = Arc::new(MemoryStore::new());
    let health = HealthReporter::new();
    let mut manager =
        ControllerManager::new(store.clone(), registry.clone(), &controller, health.clone());
    if let Some(dir) = &cli.manifests {
        anyhow::ensure!(dir.is_dir(), "manifest directory {} does not exist", dir.display());
        manager = manager.with_manifests(ManifestLoader::new(dir, store, registry));
    }

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

    Arc::new(manager)
        .run(stop_rx)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "health server failed"),
        Err(e) => tracing::warn!(error = %e, "health server task panicked"),
    }
    Ok(())
}
