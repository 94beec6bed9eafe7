/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Capability tokens advertised by providers.
//!
//! Providers answer `GetCapabilities` with plain string tokens. The controller
//! gates feature-specific reconcile branches on this set and never on the
//! backend family.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    Core,
    Snapshots,
    LinkedClones,
    OnlineReconfigure,
    GuestAgent,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Core,
        Capability::Snapshots,
        Capability::LinkedClones,
        Capability::OnlineReconfigure,
        Capability::GuestAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Core => "core",
            Capability::Snapshots => "snapshots",
            Capability::LinkedClones => "linked-clones",
            Capability::OnlineReconfigure => "online-reconfigure",
            Capability::GuestAgent => "guest-agent",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_lowercase().as_str() {
            "core" => Some(Capability::Core),
            "snapshots" => Some(Capability::Snapshots),
            "linked-clones" => Some(Capability::LinkedClones),
            "online-reconfigure" => Some(Capability::OnlineReconfigure),
            // libvirt providers historically advertise the qemu flavoured name
            "guest-agent" | "qemu-guest-agent" => Some(Capability::GuestAgent),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of capabilities negotiated with one provider.
///
/// Tokens this build does not understand are kept so they can be echoed in
/// logs, but they never enable a reconcile branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    known: BTreeSet<Capability>,
    unknown: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for token in tokens {
            let token = token.as_ref();
            match Capability::parse(token) {
                Some(cap) => {
                    set.known.insert(cap);
                }
                None if !token.trim().is_empty() => {
                    set.unknown.insert(token.trim().to_string());
                }
                None => {}
            }
        }
        set
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.known.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.known.insert(capability);
    }

    pub fn remove(&mut self, capability: Capability) {
        self.known.remove(&capability);
    }

    pub fn unknown_tokens(&self) -> impl Iterator<Item = &str> {
        self.unknown.iter().map(String::as_str)
    }

    /// Tokens in wire form, known capabilities first.
    pub fn tokens(&self) -> Vec<String> {
        self.known
            .iter()
            .map(|c| c.as_str().to_string())
            .chain(self.unknown.iter().cloned())
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            known: iter.into_iter().collect(),
            unknown: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tokens_parses_known_and_keeps_unknown() {
        let set = CapabilitySet::from_tokens(["snapshots", "qemu-guest-agent", "gpu-passthrough", ""]);
        assert!(set.supports(Capability::Snapshots));
        assert!(set.supports(Capability::GuestAgent));
        assert!(!set.supports(Capability::LinkedClones));
        assert_eq!(set.unknown_tokens().collect::<Vec<_>>(), vec!["gpu-passthrough"]);
    }

    #[test]
    fn test_tokens_are_wire_names() {
        let set: CapabilitySet = [Capability::GuestAgent, Capability::OnlineReconfigure]
            .into_iter()
            .collect();
        assert_eq!(set.tokens(), vec!["online-reconfigure", "guest-agent"]);
    }
}
