/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider bindings resolved once per descriptor.
//!
//! A binding owns an explicit client handle plus the capability set
//! negotiated on first use. Reconcile passes look bindings up by the
//! `spec.provider` name and never construct clients themselves.

use super::{ClientError, ProviderService};
use crate::grpc::sender::provider::GrpcProviderClient;
use common::capability::CapabilitySet;
use common::provider::{is_compatible, PROTOCOL_VERSION};
use common::spec::ProviderDescriptor;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub struct ProviderBinding {
    descriptor: ProviderDescriptor,
    client: Arc<dyn ProviderService>,
    capabilities: RwLock<Option<CapabilitySet>>,
}

impl ProviderBinding {
    pub fn new(descriptor: ProviderDescriptor, client: Arc<dyn ProviderService>) -> Self {
        Self {
            descriptor,
            client,
            capabilities: RwLock::new(None),
        }
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn client(&self) -> Arc<dyn ProviderService> {
        Arc::clone(&self.client)
    }

    /// Negotiated capabilities, fetched on first use and then cached.
    pub async fn capabilities(&self) -> Result<CapabilitySet, ClientError> {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }

        let info = self.client.capabilities().await?;
        if !is_compatible(&info.protocol_version) {
            self.invalidate();
            return Err(ClientError::IncompatibleVersion {
                server: info.protocol_version,
                client: PROTOCOL_VERSION.to_string(),
            });
        }
        if info.family != self.descriptor.family.as_str() {
            tracing::warn!(
                provider = %self.descriptor.name,
                declared = %self.descriptor.family,
                reported = %info.family,
                "provider reports a different family than declared"
            );
        }
        for token in info.capabilities.unknown_tokens() {
            tracing::debug!(provider = %self.descriptor.name, token, "ignoring unknown capability");
        }

        if let Ok(mut guard) = self.capabilities.write() {
            *guard = Some(info.capabilities.clone());
        }
        tracing::info!(
            provider = %self.descriptor.name,
            version = %info.protocol_version,
            capabilities = ?info.capabilities.tokens(),
            "negotiated provider capabilities"
        );
        Ok(info.capabilities)
    }

    pub fn cached(&self) -> Option<CapabilitySet> {
        self.capabilities.read().ok().and_then(|c| c.clone())
    }

    /// Drop the cached capabilities so the next call negotiates again.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.capabilities.write() {
            *guard = None;
        }
    }
}

/// All provider bindings known to this controller, keyed by name.
pub struct ProviderRegistry {
    bindings: RwLock<BTreeMap<String, Arc<ProviderBinding>>>,
    rpc_timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            bindings: RwLock::new(BTreeMap::new()),
            rpc_timeout,
        }
    }

    /// Register a binding with an explicit client handle.
    pub fn insert(&self, descriptor: ProviderDescriptor, client: Arc<dyn ProviderService>) {
        let name = descriptor.name.clone();
        let binding = Arc::new(ProviderBinding::new(descriptor, client));
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.insert(name, binding);
        }
    }

    /// Resolve a descriptor into a gRPC binding.
    ///
    /// A descriptor identical to the bound one keeps the existing binding
    /// and its negotiated capabilities.
    pub fn bind(&self, descriptor: &ProviderDescriptor) -> common::Result<()> {
        if let Some(existing) = self.get(&descriptor.name) {
            if existing.descriptor() == descriptor {
                return Ok(());
            }
            tracing::info!(provider = %descriptor.name, "provider descriptor changed, rebinding");
        }
        let client = GrpcProviderClient::new(&descriptor.endpoint, self.rpc_timeout)?;
        tracing::info!(
            provider = %descriptor.name,
            family = %descriptor.family,
            endpoint = %descriptor.endpoint,
            "bound provider"
        );
        self.insert(descriptor.clone(), Arc::new(client));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderBinding>> {
        self.bindings.read().ok()?.get(name).cloned()
    }

    pub fn bindings(&self) -> Vec<Arc<ProviderBinding>> {
        self.bindings
            .read()
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}
