pub mod criticality;
pub mod dependencies;
pub mod inventory;
pub mod parse;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::netplan::{ConstructDefinition, Topology};

/// Prefixes of devices owned by container runtimes and hypervisors
const SYSTEM_VIRTUAL_PREFIXES: [&str; 6] = ["docker", "veth", "virbr", "br-", "cni", "flannel"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub index: u32,
    pub name: String,
    pub kind: InterfaceKind,
    pub state: LinkState,
    pub flags: Vec<String>,
    pub mac_address: Option<String>,
    pub mtu: u32,
    pub ipv4_address: Option<String>,
    /// Bond or bridge this device is enslaved to
    pub master: Option<String>,
    /// Lower device of a VLAN, from the `name@parent` decoration
    pub parent: Option<String>,
    pub metrics: NetworkMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Physical,
    Vlan,
    Bridge,
    Bond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkMetrics {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub packets_tx: u64,
    pub packets_rx: u64,
}

impl NetworkInterface {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4_address
            .as_deref()
            .and_then(|cidr| cidr.split('/').next())
            .and_then(|ip| ip.parse().ok())
    }

    pub fn is_admin_up(&self) -> bool {
        self.flags.iter().any(|flag| flag == "UP")
    }

    /// Stand-in for a construct that is declared but not present in the kernel
    pub fn from_definition(definition: &ConstructDefinition) -> Self {
        let (kind, parent) = match &definition.topology {
            Topology::Vlan { link, .. } => (InterfaceKind::Vlan, Some(link.clone())),
            Topology::Bridge { .. } => (InterfaceKind::Bridge, None),
            Topology::Bond { .. } => (InterfaceKind::Bond, None),
            Topology::Ethernet => (InterfaceKind::Physical, None),
        };
        Self {
            index: 0,
            name: definition.name.clone(),
            kind,
            state: LinkState::Unknown,
            flags: Vec::new(),
            mac_address: None,
            mtu: definition.addressing.mtu.unwrap_or(0),
            ipv4_address: definition.addressing.addresses.first().cloned(),
            master: None,
            parent,
            metrics: NetworkMetrics::default(),
        }
    }
}

impl LinkState {
    pub fn from_operstate(state: &str) -> Self {
        match state {
            "UP" => LinkState::Up,
            "DOWN" | "LOWERLAYERDOWN" => LinkState::Down,
            _ => LinkState::Unknown,
        }
    }
}

/// Strip the `@parent` decoration the kernel adds to VLAN names
pub fn normalize_name(raw: &str) -> &str {
    raw.split('@').next().unwrap_or(raw).trim()
}

/// Kind by naming convention. The dot wins, so `bond0.100` is a VLAN.
pub fn classify_name(name: &str) -> InterfaceKind {
    if name.contains('.') {
        InterfaceKind::Vlan
    } else if name.starts_with("bond") {
        InterfaceKind::Bond
    } else if name.starts_with("br") {
        InterfaceKind::Bridge
    } else {
        InterfaceKind::Physical
    }
}

pub fn is_system_virtual(name: &str) -> bool {
    name == "lo"
        || SYSTEM_VIRTUAL_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// Split `eth0.100` into its lower device and VLAN id
pub fn vlan_parts(name: &str) -> Option<(&str, u16)> {
    let (link, id) = name.rsplit_once('.')?;
    let id: u16 = id.parse().ok()?;
    (!link.is_empty() && (1..=4094).contains(&id)).then_some((link, id))
}

/// Best-effort CIDR for display when a tool printed a bare address.
/// Prefer the prefix from `ip addr` whenever one is available.
pub fn normalize_cidr(address: &str) -> String {
    if address.contains('/') {
        return address.to_string();
    }
    let prefix = if address.starts_with("127.") { 8 } else { 24 };
    format!("{address}/{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_vlan_decoration() {
        assert_eq!(normalize_name("eth0.100@eth0"), "eth0.100");
        assert_eq!(normalize_name("eno4"), "eno4");
    }

    #[test]
    fn classifies_by_name_pattern() {
        assert_eq!(classify_name("eth0.100"), InterfaceKind::Vlan);
        assert_eq!(classify_name("br0"), InterfaceKind::Bridge);
        assert_eq!(classify_name("bond1"), InterfaceKind::Bond);
        assert_eq!(classify_name("enp3s0"), InterfaceKind::Physical);
        assert_eq!(classify_name("bond0.100"), InterfaceKind::Vlan);
        assert_eq!(classify_name("br0.20"), InterfaceKind::Vlan);
    }

    #[test]
    fn declared_stand_in_takes_kind_from_topology() {
        let guest = NetworkInterface::from_definition(&ConstructDefinition {
            name: "guest".into(),
            topology: Topology::Vlan {
                id: 30,
                link: "bond0".into(),
            },
            addressing: Default::default(),
        });
        assert_eq!(guest.kind, InterfaceKind::Vlan);
        assert_eq!(guest.parent.as_deref(), Some("bond0"));
    }

    #[test]
    fn vlan_parts_rejects_out_of_range_ids() {
        assert_eq!(vlan_parts("eth0.100"), Some(("eth0", 100)));
        assert_eq!(vlan_parts("bond0.4094"), Some(("bond0", 4094)));
        assert_eq!(vlan_parts("eth0.4095"), None);
        assert_eq!(vlan_parts("eth0.abc"), None);
        assert_eq!(vlan_parts(".5"), None);
    }

    #[test]
    fn guesses_prefix_only_when_missing() {
        assert_eq!(normalize_cidr("10.1.2.3/16"), "10.1.2.3/16");
        assert_eq!(normalize_cidr("192.168.5.9"), "192.168.5.9/24");
        assert_eq!(normalize_cidr("127.0.0.1"), "127.0.0.1/8");
    }

    #[test]
    fn system_virtual_devices() {
        assert!(is_system_virtual("lo"));
        assert!(is_system_virtual("docker0"));
        assert!(is_system_virtual("br-1a2b3c"));
        assert!(is_system_virtual("vethab12"));
        assert!(!is_system_virtual("br0"));
        assert!(!is_system_virtual("eth0"));
    }
}
