/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider descriptor: where a hypervisor family is served and how to reach it.

use crate::provider::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hypervisor family served by a provider process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Libvirt,
    Vsphere,
    Proxmox,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::Libvirt => "libvirt",
            ProviderFamily::Vsphere => "vsphere",
            ProviderFamily::Proxmox => "proxmox",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "libvirt" | "kvm" => Ok(ProviderFamily::Libvirt),
            "vsphere" => Ok(ProviderFamily::Vsphere),
            "proxmox" => Ok(ProviderFamily::Proxmox),
            other => Err(format!("unknown provider family '{other}'")),
        }
    }
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    pub family: ProviderFamily,
    pub endpoint: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Reference only; credentials are resolved by the provider process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_parsing() {
        assert_eq!("KVM".parse::<ProviderFamily>(), Ok(ProviderFamily::Libvirt));
        assert_eq!("vsphere".parse::<ProviderFamily>(), Ok(ProviderFamily::Vsphere));
        assert!("hyperv".parse::<ProviderFamily>().is_err());
    }

    #[test]
    fn test_descriptor_defaults_protocol_version() {
        let yaml = "name: lab\nfamily: proxmox\nendpoint: http://10.0.0.2:9443\n";
        let desc: ProviderDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.family, ProviderFamily::Proxmox);
        assert_eq!(desc.protocol_version, PROTOCOL_VERSION);
        assert!(desc.credentials_ref.is_none());
    }
}
