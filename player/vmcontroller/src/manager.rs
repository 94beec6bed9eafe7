/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Controller runtime: worker pool, watch loop, resync and provider probes.
//!
//! Keys flow from the watch, resync and manifest loops into the
//! [`WorkQueue`]; workers pull keys and run one [`Reconciler`] pass each,
//! then schedule the next pass from the outcome.

use crate::artifact::ManifestLoader;
use crate::backoff::Backoff;
use crate::provider::registry::ProviderRegistry;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::storage::{ResourceStore, StoreError, WatchEvent, WatchEventType};
use crate::types::ReconcileOutcome;
use common::health::HealthReporter;
use common::setting::ControllerSettings;
use common::spec::ResourceKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

pub const HEALTH_STORE: &str = "store";
pub const PROVIDER_PROBE_INTERVAL: Duration = Duration::from_secs(30);

pub fn provider_health_name(provider: &str) -> String {
    format!("provider/{provider}")
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub struct ControllerManager {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ProviderRegistry>,
    reconciler: Reconciler,
    queue: Arc<WorkQueue>,
    backoff: Backoff,
    workers: usize,
    resync: Duration,
    probe_interval: Duration,
    health: HealthReporter,
    manifests: Option<ManifestLoader>,
    /// Last generation seen per key; status-only writes do not re-enqueue.
    generations: Mutex<HashMap<ResourceKey, u64>>,
    store_failures: AtomicU32,
}

impl ControllerManager {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<ProviderRegistry>,
        settings: &ControllerSettings,
        health: HealthReporter,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&registry), settings),
            store,
            registry,
            queue: WorkQueue::new(),
            backoff: Backoff::from_settings(settings),
            workers: settings.workers.max(1),
            resync: settings.resync().max(Duration::from_secs(1)),
            probe_interval: PROVIDER_PROBE_INTERVAL,
            health,
            manifests: None,
            generations: Mutex::new(HashMap::new()),
            store_failures: AtomicU32::new(0),
        }
    }

    /// Reload manifests from `loader` at start and on every resync.
    pub fn with_manifests(mut self, loader: ManifestLoader) -> Self {
        self.manifests = Some(loader);
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn generations(&self) -> MutexGuard<'_, HashMap<ResourceKey, u64>> {
        self.generations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run until `shutdown` flips to true. In-flight passes finish first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> common::Result<()> {
        self.health.register(HEALTH_STORE);
        self.reload_manifests();
        for name in self.registry.names() {
            self.health.register(&provider_health_name(&name));
        }

        let cursor = self.relist().await?;
        self.health.set_healthy(HEALTH_STORE);
        tracing::info!(
            workers = self.workers,
            resync = ?self.resync,
            providers = ?self.registry.names(),
            "controller started"
        );

        let workers: Vec<_> = (0..self.workers)
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id)))
            .collect();
        let loops = vec![
            tokio::spawn(Arc::clone(&self).watch_loop(cursor, shutdown.clone())),
            tokio::spawn(Arc::clone(&self).resync_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).probe_loop(shutdown.clone())),
        ];

        stopped(&mut shutdown).await;
        tracing::info!("controller shutting down");
        self.queue.shutdown();

        for result in futures::future::join_all(workers.into_iter().chain(loops)).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "controller task ended abnormally");
            }
        }
        Ok(())
    }

    /// List every resource, enqueue it and return the list revision.
    async fn relist(&self) -> Result<u64, StoreError> {
        let (vms, revision) = self.store.list().await?;
        {
            let mut generations = self.generations();
            generations.clear();
            for vm in &vms {
                generations.insert(vm.key(), vm.metadata.generation);
            }
        }
        for vm in &vms {
            self.queue.add(vm.key());
        }
        tracing::debug!(resources = vms.len(), revision, "relisted resources");
        Ok(revision)
    }

    fn reload_manifests(&self) {
        let Some(loader) = &self.manifests else {
            return;
        };
        match loader.reload() {
            Ok(summary) => {
                if summary.errors > 0 {
                    tracing::warn!(dir = %loader.dir().display(), ?summary, "manifests loaded with errors");
                }
                for name in self.registry.names() {
                    self.health.register(&provider_health_name(&name));
                }
            }
            Err(e) => {
                tracing::error!(dir = %loader.dir().display(), error = %e, "failed to read manifests")
            }
        }
    }

    // ========================================
    // WORKERS
    // ========================================

    async fn worker(self: Arc<Self>, id: usize) {
        tracing::debug!(worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            match self.reconciler.reconcile(&key).await {
                Ok(outcome) => {
                    if self.store_failures.swap(0, Ordering::Relaxed) > 0 {
                        self.health.set_healthy(HEALTH_STORE);
                    }
                    self.dispatch(&key, outcome);
                }
                Err(e) => {
                    let failures = self.store_failures.fetch_add(1, Ordering::Relaxed);
                    self.health.set_unhealthy(HEALTH_STORE, e.to_string());
                    tracing::error!(resource = %key, error = %e, "reconcile could not reach the store");
                    self.queue.add_after(key.clone(), self.backoff.delay(failures));
                }
            }
            self.queue.done(&key);
        }
        tracing::debug!(worker = id, "worker stopped");
    }

    fn dispatch(&self, key: &ResourceKey, outcome: ReconcileOutcome) {
        tracing::debug!(resource = %key, ?outcome, "reconcile finished");
        match outcome {
            ReconcileOutcome::Steady | ReconcileOutcome::Failed => self.queue.forget(key),
            ReconcileOutcome::Removed | ReconcileOutcome::Gone => {
                self.queue.forget(key);
                self.generations().remove(key);
            }
            ReconcileOutcome::Poll(delay) | ReconcileOutcome::Retry(delay) => {
                self.queue.add_after(key.clone(), delay)
            }
            ReconcileOutcome::Requeue | ReconcileOutcome::Conflict => self.queue.add(key.clone()),
        }
    }

    // ========================================
    // WATCH
    // ========================================

    fn observe(&self, event: WatchEvent) {
        let key = event.object.key();
        match event.event_type {
            WatchEventType::Deleted => {
                self.generations().remove(&key);
                self.queue.forget(&key);
            }
            WatchEventType::Added | WatchEventType::Modified => {
                let generation = event.object.metadata.generation;
                let previous = self.generations().insert(key.clone(), generation);
                if previous != Some(generation) {
                    tracing::debug!(resource = %key, generation, "desired state changed");
                    self.queue.add(key);
                }
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, mut cursor: u64, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            let event = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                event = self.store.next_event(cursor) => event,
            };
            match event {
                Ok(event) => {
                    failures = 0;
                    cursor = event.resource_version;
                    self.observe(event);
                }
                Err(StoreError::Expired { cursor: stale, oldest }) => {
                    tracing::warn!(cursor = stale, oldest, "watch cursor expired, relisting");
                    match self.relist().await {
                        Ok(revision) => cursor = revision,
                        Err(e) => {
                            self.health.set_unhealthy(HEALTH_STORE, e.to_string());
                            tokio::time::sleep(self.backoff.delay(failures)).await;
                            failures = failures.saturating_add(1);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "watch failed");
                    self.health.set_unhealthy(HEALTH_STORE, e.to_string());
                    tokio::time::sleep(self.backoff.delay(failures)).await;
                    failures = failures.saturating_add(1);
                }
            }
        }
        tracing::debug!("watch loop stopped");
    }

    async fn resync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.resync);
        // the first tick fires immediately and the initial list already ran
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {
                    self.reload_manifests();
                    if let Err(e) = self.relist().await {
                        tracing::error!(error = %e, "resync failed");
                        self.health.set_unhealthy(HEALTH_STORE, e.to_string());
                    }
                }
            }
        }
    }

    // ========================================
    // PROVIDER PROBES
    // ========================================

    async fn probe_providers(&self) {
        for binding in self.registry.bindings() {
            let name = provider_health_name(binding.name());
            match binding.client().health_check().await {
                Ok(true) => self.health.set_healthy(&name),
                Ok(false) => self.health.set_unhealthy(&name, "provider backend not serving"),
                Err(e) => {
                    // renegotiate once it comes back
                    binding.invalidate();
                    self.health.set_unhealthy(&name, e.to_string());
                }
            }
        }
    }

    async fn probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => self.probe_providers().await,
            }
        }
    }
}
