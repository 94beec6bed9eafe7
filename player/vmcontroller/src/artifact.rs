/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Load `VirtualMachine` and `Provider` manifests from a directory

use crate::provider::registry::ProviderRegistry;
use crate::storage::MemoryStore;
use common::spec::{
    ProviderDescriptor, ProviderFamily, ResourceKey, VirtualMachine, KIND_PROVIDER,
    KIND_VIRTUAL_MACHINE,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// YAML document separator
const YAML_SEPARATOR: &str = "---";

#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    VirtualMachine(Box<VirtualMachine>),
    Provider(ProviderDescriptor),
}

#[derive(Deserialize)]
struct ProviderMeta {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderBody {
    family: ProviderFamily,
    endpoint: String,
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    credentials_ref: Option<String>,
}

#[derive(Deserialize)]
struct ProviderDocument {
    metadata: ProviderMeta,
    spec: ProviderBody,
}

impl From<ProviderDocument> for ProviderDescriptor {
    fn from(doc: ProviderDocument) -> Self {
        ProviderDescriptor {
            name: doc.metadata.name,
            family: doc.spec.family,
            endpoint: doc.spec.endpoint,
            protocol_version: doc
                .spec
                .protocol_version
                .unwrap_or_else(|| common::provider::PROTOCOL_VERSION.to_string()),
            credentials_ref: doc.spec.credentials_ref,
        }
    }
}

/// Parse one YAML document. Empty documents and unknown kinds yield `None`.
fn parse_document(doc: &str) -> common::Result<Option<Artifact>> {
    if doc.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_yaml::Value = serde_yaml::from_str(doc)?;
    let Some(kind) = value.get("kind").and_then(|k| k.as_str()) else {
        return Err("manifest document has no kind".into());
    };

    let artifact = match kind {
        KIND_VIRTUAL_MACHINE => {
            let mut vm: VirtualMachine = serde_yaml::from_value(value)?;
            // status is owned by the controller
            vm.status = Default::default();
            Artifact::VirtualMachine(Box::new(vm))
        }
        KIND_PROVIDER => {
            let doc: ProviderDocument = serde_yaml::from_value(value)?;
            Artifact::Provider(doc.into())
        }
        other => {
            tracing::warn!(kind = other, "skipping manifest of unknown kind");
            return Ok(None);
        }
    };
    Ok(Some(artifact))
}

/// Split a multi-document body and parse every document.
pub fn parse(body: &str) -> common::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for doc in body.split(YAML_SEPARATOR) {
        if let Some(artifact) = parse_document(doc)? {
            artifacts.push(artifact);
        }
    }
    Ok(artifacts)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub providers: usize,
    pub applied: usize,
    pub deletion_requested: usize,
    pub errors: usize,
}

/// Keeps the in-memory store in line with a manifest directory.
pub struct ManifestLoader {
    dir: PathBuf,
    store: Arc<MemoryStore>,
    registry: Arc<ProviderRegistry>,
    /// VM keys seen in the previous load.
    applied: Mutex<BTreeSet<ResourceKey>>,
}

impl ManifestLoader {
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<MemoryStore>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            dir: dir.into(),
            store,
            registry,
            applied: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read every `.yaml`/`.yml` file and apply what changed.
    ///
    /// A file that fails to parse is skipped as a whole and no deletions are
    /// requested in that load, so a typo never deletes machines.
    pub fn reload(&self) -> common::Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut seen = BTreeSet::new();
        let mut broken = false;
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();

        let previous = self
            .applied
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default();

        for path in &files {
            let loaded: common::Result<Vec<Artifact>> = std::fs::read_to_string(path)
                .map_err(Into::into)
                .and_then(|body| parse(&body));
            let artifacts = match loaded {
                Ok(artifacts) => artifacts,
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "failed to load manifest");
                    summary.errors += 1;
                    broken = true;
                    continue;
                }
            };

            for artifact in artifacts {
                match artifact {
                    Artifact::Provider(descriptor) => match self.registry.bind(&descriptor) {
                        Ok(()) => summary.providers += 1,
                        Err(e) => {
                            tracing::error!(provider = %descriptor.name, error = %e, "failed to bind provider");
                            summary.errors += 1;
                        }
                    },
                    Artifact::VirtualMachine(vm) => {
                        let key = vm.key();
                        match self.store.apply(*vm) {
                            Ok(_) => {
                                seen.insert(key);
                                summary.applied += 1;
                            }
                            Err(e) => {
                                tracing::error!(resource = %key, error = %e, "failed to apply manifest");
                                summary.errors += 1;
                            }
                        }
                    }
                }
            }
        }

        if broken {
            seen.extend(previous.iter().cloned());
        }
        for key in previous.difference(&seen) {
            match self.store.request_deletion(key) {
                Ok(_) => {
                    tracing::info!(resource = %key, "manifest removed, deletion requested");
                    summary.deletion_requested += 1;
                }
                Err(crate::storage::StoreError::NotFound(_)) => {}
                Err(e) => {
                    tracing::error!(resource = %key, error = %e, "failed to request deletion");
                    summary.errors += 1;
                }
            }
        }

        if let Ok(mut applied) = self.applied.lock() {
            *applied = seen;
        }
        tracing::debug!(dir = %self.dir.display(), ?summary, "manifests loaded");
        Ok(summary)
    }
}
