/*!
 * Interface Inventory
 * Live kernel interface state, cached behind a single invalidation point
 */

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::parse::{self, DefaultRoute, LinkRecord, TcpSession};
use super::{classify_name, is_system_virtual, InterfaceKind, NetworkInterface, NetworkMetrics};
use crate::exec::{CommandExecutor, ExecError, ExecOptions};

#[derive(Debug, Clone)]
pub struct InventorySettings {
    pub cache_ttl: Duration,
    pub proc_net_dev: PathBuf,
    /// Offered when discovery finds nothing, so parent selection is never empty
    pub fallback_interfaces: Vec<String>,
}

pub struct Inventory {
    executor: Arc<dyn CommandExecutor>,
    settings: InventorySettings,
    cache: RwLock<InventoryCache>,
}

#[derive(Default)]
struct InventoryCache {
    interfaces: Option<(Instant, Vec<NetworkInterface>)>,
    physical: Option<(Instant, Vec<String>)>,
}

impl Inventory {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: InventorySettings) -> Self {
        Self {
            executor,
            settings,
            cache: RwLock::new(InventoryCache::default()),
        }
    }

    /// Cached snapshot of every kernel interface. Never fails; a failed query
    /// yields an empty list.
    pub async fn list_interfaces(&self) -> Vec<NetworkInterface> {
        if let Some((taken, interfaces)) = &self.cache.read().await.interfaces {
            if taken.elapsed() < self.settings.cache_ttl {
                return interfaces.clone();
            }
        }
        self.refresh().await
    }

    /// Bypass the cache
    pub async fn refresh(&self) -> Vec<NetworkInterface> {
        match self.try_refresh().await {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!("Interface query failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Like `refresh`, but lets callers that must err toward safety see the failure
    pub async fn try_refresh(&self) -> Result<Vec<NetworkInterface>, ExecError> {
        let output = self
            .executor
            .execute(&["ip", "addr", "show"], ExecOptions::default())
            .await?;
        let counters = self.read_counters().await;

        let interfaces: Vec<NetworkInterface> = parse::parse_ip_addr(&output)
            .into_iter()
            .map(|record| {
                let metrics = counters
                    .iter()
                    .find(|c| c.name == record.name)
                    .map(|c| NetworkMetrics {
                        bytes_tx: c.tx_bytes,
                        bytes_rx: c.rx_bytes,
                        packets_tx: c.tx_packets,
                        packets_rx: c.rx_packets,
                    })
                    .unwrap_or_default();
                interface_from_record(record, metrics)
            })
            .collect();

        self.cache.write().await.interfaces = Some((Instant::now(), interfaces.clone()));
        Ok(interfaces)
    }

    pub async fn find(&self, name: &str) -> Option<NetworkInterface> {
        self.refresh()
            .await
            .into_iter()
            .find(|iface| iface.name == name)
    }

    /// Names usable as a VLAN parent or bond/bridge member.
    ///
    /// Excludes loopback, runtime-owned virtual devices and anything named
    /// like a vlan/bridge/bond. Falls back to `fallback_interfaces` when
    /// discovery comes back empty.
    pub async fn list_physical_interfaces(&self) -> Vec<String> {
        if let Some((taken, names)) = &self.cache.read().await.physical {
            if taken.elapsed() < self.settings.cache_ttl {
                return names.clone();
            }
        }

        let mut names = match self
            .executor
            .execute(&["ip", "link", "show"], ExecOptions::default())
            .await
        {
            Ok(output) => physical_names(
                parse::parse_ip_link(&output)
                    .iter()
                    .map(|record| record.name.as_str()),
            ),
            Err(e) => {
                tracing::warn!("ip link query failed: {}", e);
                Vec::new()
            }
        };

        if names.is_empty() {
            let counters = self.read_counters().await;
            names = physical_names(counters.iter().map(|c| c.name.as_str()));
        }

        if names.is_empty() {
            tracing::warn!(
                "No physical interfaces discovered, offering fallback list {:?}",
                self.settings.fallback_interfaces
            );
            // not cached, so the next call retries discovery
            return self.settings.fallback_interfaces.clone();
        }

        self.cache.write().await.physical = Some((Instant::now(), names.clone()));
        names
    }

    /// Drop every cached snapshot. Called after each mutation.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        cache.interfaces = None;
        cache.physical = None;
        tracing::debug!("Inventory cache invalidated");
    }

    pub async fn default_routes(&self) -> Result<Vec<DefaultRoute>, ExecError> {
        let output = self
            .executor
            .execute(&["ip", "route", "show", "default"], ExecOptions::default())
            .await?;
        Ok(parse::parse_default_routes(&output))
    }

    pub async fn established_sessions(&self) -> Result<Vec<TcpSession>, ExecError> {
        let output = self
            .executor
            .execute(&["ss", "-Htn", "state", "established"], ExecOptions::default())
            .await?;
        Ok(parse::parse_established(&output))
    }

    async fn read_counters(&self) -> Vec<parse::DeviceCounters> {
        match tokio::fs::read_to_string(&self.settings.proc_net_dev).await {
            Ok(content) => parse::parse_proc_net_dev(&content),
            Err(e) => {
                tracing::debug!(
                    "Could not read {}: {}",
                    self.settings.proc_net_dev.display(),
                    e
                );
                Vec::new()
            }
        }
    }
}

fn interface_from_record(record: LinkRecord, metrics: NetworkMetrics) -> NetworkInterface {
    let mut kind = classify_name(&record.name);
    // custom-named VLANs only reveal themselves through the `@parent` decoration
    if kind == InterfaceKind::Physical && record.parent.is_some() && !is_system_virtual(&record.name) {
        kind = InterfaceKind::Vlan;
    }
    NetworkInterface {
        index: record.index,
        kind,
        state: record.state,
        flags: record.flags,
        mac_address: record.mac_address,
        mtu: record.mtu.unwrap_or(1500),
        ipv4_address: record.ipv4.first().map(|address| super::normalize_cidr(address)),
        master: record.master,
        parent: record.parent,
        metrics,
        name: record.name,
    }
}

fn physical_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .map(super::normalize_name)
        .filter(|name| !name.is_empty())
        .filter(|name| !is_system_virtual(name))
        .filter(|name| classify_name(name) == InterfaceKind::Physical)
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}
