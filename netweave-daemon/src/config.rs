use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::construct::ControllerSettings;
use crate::netplan::store::StoreSettings;
use crate::network::inventory::InventorySettings;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub socket_path: String,
    #[serde(default)]
    pub netplan: NetplanConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetplanConfig {
    pub directory: PathBuf,
    /// Documents whose file name starts with `<vendor_prefix>-` belong to us
    pub vendor_prefix: String,
    pub renderer: Option<String>,
    pub try_timeout_secs: u64,
    pub try_grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub cache_ttl_ms: u64,
    pub proc_net_dev: PathBuf,
    /// Offered as parents when discovery finds nothing
    pub fallback_interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/netweave/netweave.sock".to_string(),
            netplan: NetplanConfig::default(),
            inventory: InventoryConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl Default for NetplanConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/etc/netplan"),
            vendor_prefix: "90-netweave".to_string(),
            renderer: Some("networkd".to_string()),
            try_timeout_secs: 30,
            try_grace_secs: 10,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 2000,
            proc_net_dev: PathBuf::from("/proc/net/dev"),
            fallback_interfaces: vec!["eth0".to_string(), "eth1".to_string()],
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 500,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).with_context(|| format!("Invalid configuration in {path}"))
            }
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Some(parent) = Path::new(path).parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = fs::write(path, toml::to_string_pretty(&config)?) {
                    tracing::warn!("Could not write default configuration to {}: {}", path, e);
                }
                Ok(config)
            }
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            directory: self.netplan.directory.clone(),
            vendor_prefix: self.netplan.vendor_prefix.clone(),
            renderer: self.netplan.renderer.clone(),
            try_timeout: Duration::from_secs(self.netplan.try_timeout_secs),
            try_grace: Duration::from_secs(self.netplan.try_grace_secs),
        }
    }

    pub fn inventory_settings(&self) -> InventorySettings {
        InventorySettings {
            cache_ttl: Duration::from_millis(self.inventory.cache_ttl_ms),
            proc_net_dev: self.inventory.proc_net_dev.clone(),
            fallback_interfaces: self.inventory.fallback_interfaces.clone(),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            verify_attempts: self.verify.attempts,
            verify_interval: Duration::from_millis(self.verify.interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("netweaved.toml");
        let path = path.to_str().unwrap();

        let config = DaemonConfig::load(path).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(DaemonConfig::load(path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netweaved.toml");
        fs::write(
            &path,
            "socket_path = \"/tmp/nw.sock\"\n\n[netplan]\ntry_timeout_secs = 60\n",
        )
        .unwrap();

        let config = DaemonConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.socket_path, "/tmp/nw.sock");
        assert_eq!(config.netplan.try_timeout_secs, 60);
        assert_eq!(config.netplan.vendor_prefix, "90-netweave");
        assert_eq!(config.store_settings().try_timeout, Duration::from_secs(60));
        assert_eq!(config.verify, VerifyConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netweaved.toml");
        fs::write(&path, "socket_path = [").unwrap();
        assert!(DaemonConfig::load(path.to_str().unwrap()).is_err());
    }
}
