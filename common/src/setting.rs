/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Controller settings.
//!
//! Layering, lowest precedence first: built-in defaults, an optional YAML
//! file, then `VMCTL_*` environment variables (`__` separates nesting, e.g.
//! `VMCTL_CONTROLLER__WORKERS=8`).

use crate::spec::ProviderDescriptor;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "VMCTL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_secs: u64,
    pub poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    /// Fraction of the delay applied as +/- random jitter.
    pub backoff_jitter: f64,
    pub rpc_timeout_ms: u64,
    pub graceful_shutdown_secs: u32,
    pub providers: Vec<ProviderDescriptor>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_secs: 300,
            poll_interval_ms: 2000,
            backoff_base_ms: 500,
            backoff_cap_secs: 300,
            backoff_jitter: 0.1,
            rpc_timeout_ms: 10_000,
            graceful_shutdown_secs: 60,
            providers: Vec::new(),
        }
    }
}

impl ControllerSettings {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub controller: ControllerSettings,
}

impl Settings {
    /// Load settings from the optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Settings> {
        Self::load_with(path, Environment::with_prefix(ENV_PREFIX))
    }

    /// Same as [`Settings::load`] with a caller-supplied environment source.
    pub fn load_with(path: Option<&Path>, env: Environment) -> crate::Result<Settings> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(format!("settings file {} does not exist", path.display()).into());
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        let env = env
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);

        let settings: Settings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> crate::Result<()> {
        let c = &self.controller;
        if c.workers == 0 {
            return Err("controller.workers must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&c.backoff_jitter) {
            return Err(format!(
                "controller.backoff_jitter must be within [0, 1], got {}",
                c.backoff_jitter
            )
            .into());
        }
        if c.backoff_base_ms == 0 {
            return Err("controller.backoff_base_ms must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ProviderFamily;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load_with(None, env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.controller.workers, 4);
        assert_eq!(settings.controller.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_file_then_env_override() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
controller:
  workers: 2
  resync_secs: 60
  providers:
    - name: lab-kvm
      family: libvirt
      endpoint: "127.0.0.1:9443"
"#
        )
        .unwrap();

        let settings = Settings::load_with(
            Some(file.path()),
            env(&[("VMCTL_CONTROLLER__WORKERS", "8")]),
        )
        .unwrap();

        assert_eq!(settings.controller.workers, 8);
        assert_eq!(settings.controller.resync_secs, 60);
        assert_eq!(settings.controller.rpc_timeout_ms, 10_000);
        assert_eq!(settings.controller.providers.len(), 1);
        assert_eq!(settings.controller.providers[0].family, ProviderFamily::Libvirt);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Settings::load_with(None, env(&[("VMCTL_CONTROLLER__WORKERS", "0")])).is_err());
        assert!(
            Settings::load_with(None, env(&[("VMCTL_CONTROLLER__BACKOFF_JITTER", "1.5")])).is_err()
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(Settings::load_with(Some(&missing), env(&[])).is_err());
    }
}
