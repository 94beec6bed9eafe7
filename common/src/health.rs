/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Liveness and readiness endpoints.
//!
//! Components push dependency signals into a [`HealthReporter`]; nothing in
//! the reconcile or task paths reads them back.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyState {
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct HealthReporter {
    deps: Arc<RwLock<BTreeMap<String, DependencyState>>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency as not yet healthy.
    pub fn register(&self, name: &str) {
        if let Ok(mut deps) = self.deps.write() {
            deps.entry(name.to_string()).or_insert(DependencyState {
                healthy: false,
                detail: "not checked yet".to_string(),
            });
        }
    }

    pub fn set_healthy(&self, name: &str) {
        self.set(name, true, "ok");
    }

    pub fn set_unhealthy(&self, name: &str, detail: impl Into<String>) {
        self.set(name, false, detail);
    }

    pub fn set(&self, name: &str, healthy: bool, detail: impl Into<String>) {
        if let Ok(mut deps) = self.deps.write() {
            let detail = detail.into();
            let changed = deps
                .get(name)
                .map(|d| d.healthy != healthy)
                .unwrap_or(true);
            if changed {
                tracing::info!(dependency = name, healthy, %detail, "dependency health changed");
            }
            deps.insert(name.to_string(), DependencyState { healthy, detail });
        }
    }

    pub fn get(&self, name: &str) -> Option<DependencyState> {
        self.deps.read().ok().and_then(|d| d.get(name).cloned())
    }

    /// Names and details of every unhealthy dependency.
    pub fn unhealthy(&self) -> Vec<(String, String)> {
        match self.deps.read() {
            Ok(deps) => deps
                .iter()
                .filter(|(_, s)| !s.healthy)
                .map(|(n, s)| (n.clone(), s.detail.clone()))
                .collect(),
            Err(_) => vec![("health".to_string(), "registry poisoned".to_string())],
        }
    }

    pub fn is_ready(&self) -> bool {
        self.unhealthy().is_empty()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .with_state(self.clone())
    }

    /// Serve `/healthz` and `/readyz` until `shutdown` resolves.
    pub async fn serve<F>(self, port: u16, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "health server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(reporter): State<HealthReporter>) -> (StatusCode, String) {
    let unhealthy = reporter.unhealthy();
    if unhealthy.is_empty() {
        return (StatusCode::OK, "ready".to_string());
    }
    let body = unhealthy
        .iter()
        .map(|(name, detail)| format!("{name}: {detail}"))
        .collect::<Vec<_>>()
        .join("\n");
    (StatusCode::SERVICE_UNAVAILABLE, body)
}
