/*!
 * Netplan Document Model
 * serde view of netplan v2 YAML, plus the construct definitions derived from it
 */

pub mod apply;
pub mod store;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Device sections of a netplan document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Ethernet,
    Vlan,
    Bridge,
    Bond,
}

impl DeviceKind {
    pub fn section(self) -> &'static str {
        match self {
            DeviceKind::Ethernet => "ethernets",
            DeviceKind::Vlan => "vlans",
            DeviceKind::Bridge => "bridges",
            DeviceKind::Bond => "bonds",
        }
    }

    /// `netplan try` cannot revert bridge and bond parameters, so those
    /// kinds skip the trial and go straight to a permanent apply.
    pub fn supports_trial(self) -> bool {
        matches!(self, DeviceKind::Ethernet | DeviceKind::Vlan)
    }

    /// Whether this kind can be created and deleted by the daemon
    pub fn is_construct(self) -> bool {
        !matches!(self, DeviceKind::Ethernet)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceKind::Ethernet => "ethernet",
            DeviceKind::Vlan => "vlan",
            DeviceKind::Bridge => "bridge",
            DeviceKind::Bond => "bond",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondMode {
    #[serde(rename = "balance-rr")]
    BalanceRr,
    #[serde(rename = "active-backup")]
    ActiveBackup,
    #[serde(rename = "balance-xor")]
    BalanceXor,
    #[serde(rename = "broadcast")]
    Broadcast,
    #[serde(rename = "802.3ad")]
    Lacp,
    #[serde(rename = "balance-tlb")]
    BalanceTlb,
    #[serde(rename = "balance-alb")]
    BalanceAlb,
}

impl BondMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BondMode::BalanceRr => "balance-rr",
            BondMode::ActiveBackup => "active-backup",
            BondMode::BalanceXor => "balance-xor",
            BondMode::Broadcast => "broadcast",
            BondMode::Lacp => "802.3ad",
            BondMode::BalanceTlb => "balance-tlb",
            BondMode::BalanceAlb => "balance-alb",
        }
    }

    /// Accepts the canonical netplan names, the kernel's numeric modes and
    /// the usual shorthands (`lacp`, `rr`, `activebackup`, ...).
    pub fn parse(input: &str) -> Option<Self> {
        let mode = match input.trim().to_ascii_lowercase().as_str() {
            "balance-rr" | "round-robin" | "rr" | "0" => BondMode::BalanceRr,
            "active-backup" | "activebackup" | "1" => BondMode::ActiveBackup,
            "balance-xor" | "xor" | "2" => BondMode::BalanceXor,
            "broadcast" | "3" => BondMode::Broadcast,
            "802.3ad" | "802-3ad" | "lacp" | "lag" | "4" => BondMode::Lacp,
            "balance-tlb" | "tlb" | "5" => BondMode::BalanceTlb,
            "balance-alb" | "alb" | "6" => BondMode::BalanceAlb,
            _ => return None,
        };
        Some(mode)
    }
}

impl fmt::Display for BondMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-identifying part of a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Topology {
    Ethernet,
    Vlan {
        id: u16,
        link: String,
    },
    Bridge {
        interfaces: BTreeSet<String>,
        stp: Option<bool>,
    },
    Bond {
        mode: Option<BondMode>,
        interfaces: Vec<String>,
        primary: Option<String>,
    },
}

impl Topology {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Topology::Ethernet => DeviceKind::Ethernet,
            Topology::Vlan { .. } => DeviceKind::Vlan,
            Topology::Bridge { .. } => DeviceKind::Bridge,
            Topology::Bond { .. } => DeviceKind::Bond,
        }
    }

    /// Devices this definition needs declared somewhere in the namespace
    pub fn lower_devices(&self) -> Vec<String> {
        match self {
            Topology::Ethernet => Vec::new(),
            Topology::Vlan { link, .. } => vec![link.clone()],
            Topology::Bridge { interfaces, .. } => interfaces.iter().cloned().collect(),
            Topology::Bond { interfaces, .. } => interfaces.clone(),
        }
    }
}

/// Mutable, non-identifying settings shared by every device kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    pub dhcp4: Option<bool>,
    /// CIDR strings, in document order
    pub addresses: Vec<String>,
    pub gateway: Option<String>,
    pub nameservers: Vec<String>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructDefinition {
    pub name: String,
    #[serde(flatten)]
    pub topology: Topology,
    pub addressing: Addressing,
}

impl ConstructDefinition {
    pub fn kind(&self) -> DeviceKind {
        self.topology.kind()
    }
}

// ---------------------------------------------------------------------------
// YAML shape
// ---------------------------------------------------------------------------

/// One netplan YAML file. Keys this model does not know are carried through
/// `extra`/`other` maps so a rewrite never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetplanDocument {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ethernets: BTreeMap<String, DeviceConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vlans: BTreeMap<String, VlanConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bridges: BTreeMap<String, BridgeConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bonds: BTreeMap<String, BondConfig>,
    /// wifis, tunnels, modems and anything newer
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

fn default_version() -> u8 {
    2
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            version: default_version(),
            renderer: None,
            ethernets: BTreeMap::new(),
            vlans: BTreeMap::new(),
            bridges: BTreeMap::new(),
            bonds: BTreeMap::new(),
            other: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(
        default,
        deserialize_with = "loose_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub dhcp4: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<AddressEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Nameservers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Boot does not wait for optional links
    #[serde(
        default,
        deserialize_with = "loose_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub optional: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `- 10.0.0.2/24` or `- 10.0.0.2/24: {label: ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressEntry {
    Plain(String),
    Labeled(BTreeMap<String, Value>),
}

impl AddressEntry {
    pub fn cidr(&self) -> Option<&str> {
        match self {
            AddressEntry::Plain(cidr) => Some(cidr),
            AddressEntry::Labeled(map) => map.keys().next().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RouteConfig {
    pub fn default_via(gateway: &str) -> Self {
        Self {
            to: "default".to_string(),
            via: Some(gateway.to_string()),
            extra: BTreeMap::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.to == "default" || self.to == "0.0.0.0/0"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nameservers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlanConfig {
    pub id: u16,
    pub link: String,
    #[serde(flatten)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BridgeParameters>,
    #[serde(flatten)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeParameters {
    #[serde(
        default,
        deserialize_with = "loose_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub stp: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BondConfig {
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BondParameters>,
    #[serde(flatten)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BondParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BondParameters {
    pub fn for_mode(mode: Option<BondMode>, primary: Option<String>) -> Self {
        let mut extra = BTreeMap::new();
        match mode {
            Some(BondMode::Lacp) => {
                extra.insert("lacp-rate".to_string(), Value::from("fast"));
                extra.insert("transmit-hash-policy".to_string(), Value::from("layer3+4"));
            }
            Some(BondMode::BalanceTlb | BondMode::BalanceAlb) => {
                extra.insert("mii-monitor-interval".to_string(), Value::from(100));
            }
            _ => {}
        }
        Self {
            mode: mode.map(|mode| mode.as_str().to_string()),
            primary,
            extra,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseBool {
    Bool(bool),
    Text(String),
}

// YAML 1.1 booleans (`yes`, `on`) still show up in hand-written netplan files.
fn loose_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    match Option::<LooseBool>::deserialize(deserializer)? {
        None => Ok(None),
        Some(LooseBool::Bool(value)) => Ok(Some(value)),
        Some(LooseBool::Text(text)) => match text.to_ascii_lowercase().as_str() {
            "yes" | "y" | "on" | "true" => Ok(Some(true)),
            "no" | "n" | "off" | "false" => Ok(Some(false)),
            other => Err(D::Error::custom(format!("invalid boolean value '{other}'"))),
        },
    }
}

impl DeviceConfig {
    /// Entry written for an undeclared parent or member
    pub fn placeholder() -> Self {
        Self {
            optional: Some(true),
            ..Default::default()
        }
    }

    /// `{}` or `{optional: true}`
    pub fn is_placeholder(&self) -> bool {
        *self == DeviceConfig::default() || *self == DeviceConfig::placeholder()
    }

    pub fn addressing(&self) -> Addressing {
        let gateway = self.gateway4.clone().or_else(|| {
            self.routes
                .iter()
                .find(|route| route.is_default())
                .and_then(|route| route.via.clone())
        });
        Addressing {
            dhcp4: self.dhcp4,
            addresses: self
                .addresses
                .iter()
                .filter_map(AddressEntry::cidr)
                .map(str::to_string)
                .collect(),
            gateway,
            nameservers: self
                .nameservers
                .as_ref()
                .map(|ns| ns.addresses.clone())
                .unwrap_or_default(),
            mtu: self.mtu,
        }
    }

    /// Overwrite the addressing keys, leaving everything else untouched.
    /// A gateway is written as a `to: default` route; `gateway4` is dropped.
    pub fn set_addressing(&mut self, addressing: &Addressing) {
        self.dhcp4 = addressing.dhcp4;
        self.mtu = addressing.mtu;

        // labeled entries survive when the address list is unchanged
        if self.addressing().addresses != addressing.addresses {
            self.addresses = addressing
                .addresses
                .iter()
                .cloned()
                .map(AddressEntry::Plain)
                .collect();
        }

        self.gateway4 = None;
        self.routes.retain(|route| !route.is_default());
        if let Some(gateway) = &addressing.gateway {
            self.routes.insert(0, RouteConfig::default_via(gateway));
        }

        if addressing.nameservers.is_empty() {
            if let Some(ns) = &mut self.nameservers {
                ns.addresses.clear();
                if ns.search.is_empty() && ns.extra.is_empty() {
                    self.nameservers = None;
                }
            }
        } else {
            self.nameservers
                .get_or_insert_with(Nameservers::default)
                .addresses = addressing.nameservers.clone();
        }
    }
}

impl NetplanDocument {
    pub fn new(renderer: Option<String>) -> Self {
        let mut document = Self::default();
        document.network.renderer = renderer;
        document
    }
}

impl NetworkSection {
    /// Every device declared in this document, ethernets first
    pub fn definitions(&self) -> Vec<ConstructDefinition> {
        let ethernets = self.ethernets.iter().map(|(name, config)| ConstructDefinition {
            name: name.clone(),
            topology: Topology::Ethernet,
            addressing: config.addressing(),
        });
        let vlans = self.vlans.iter().map(|(name, config)| ConstructDefinition {
            name: name.clone(),
            topology: Topology::Vlan {
                id: config.id,
                link: config.link.clone(),
            },
            addressing: config.device.addressing(),
        });
        let bridges = self.bridges.iter().map(|(name, config)| ConstructDefinition {
            name: name.clone(),
            topology: Topology::Bridge {
                interfaces: config.interfaces.iter().cloned().collect(),
                stp: config.parameters.as_ref().and_then(|p| p.stp),
            },
            addressing: config.device.addressing(),
        });
        let bonds = self.bonds.iter().map(|(name, config)| {
            let parameters = config.parameters.as_ref();
            ConstructDefinition {
                name: name.clone(),
                topology: Topology::Bond {
                    mode: parameters
                        .and_then(|p| p.mode.as_deref())
                        .and_then(BondMode::parse),
                    interfaces: config.interfaces.clone(),
                    primary: parameters.and_then(|p| p.primary.clone()),
                },
                addressing: config.device.addressing(),
            }
        });

        ethernets.chain(vlans).chain(bridges).chain(bonds).collect()
    }

    pub fn kinds_of(&self, name: &str) -> Vec<DeviceKind> {
        let mut kinds = Vec::new();
        if self.ethernets.contains_key(name) {
            kinds.push(DeviceKind::Ethernet);
        }
        if self.vlans.contains_key(name) {
            kinds.push(DeviceKind::Vlan);
        }
        if self.bridges.contains_key(name) {
            kinds.push(DeviceKind::Bridge);
        }
        if self.bonds.contains_key(name) {
            kinds.push(DeviceKind::Bond);
        }
        kinds
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.kinds_of(name).is_empty()
    }

    /// Remove `name` from every section. Returns the kinds that were removed.
    pub fn remove(&mut self, name: &str) -> Vec<DeviceKind> {
        let kinds = self.kinds_of(name);
        self.ethernets.remove(name);
        self.vlans.remove(name);
        self.bridges.remove(name);
        self.bonds.remove(name);
        kinds
    }

    pub fn insert(&mut self, definition: &ConstructDefinition) {
        let mut device = DeviceConfig::default();
        device.set_addressing(&definition.addressing);
        let name = definition.name.clone();

        match &definition.topology {
            Topology::Ethernet => {
                self.ethernets.insert(name, device);
            }
            Topology::Vlan { id, link } => {
                self.vlans.insert(
                    name,
                    VlanConfig {
                        id: *id,
                        link: link.clone(),
                        device,
                    },
                );
            }
            Topology::Bridge { interfaces, stp } => {
                self.bridges.insert(
                    name,
                    BridgeConfig {
                        interfaces: interfaces.iter().cloned().collect(),
                        parameters: stp.map(|stp| BridgeParameters {
                            stp: Some(stp),
                            extra: BTreeMap::new(),
                        }),
                        device,
                    },
                );
            }
            Topology::Bond {
                mode,
                interfaces,
                primary,
            } => {
                self.bonds.insert(
                    name,
                    BondConfig {
                        interfaces: interfaces.clone(),
                        parameters: Some(BondParameters::for_mode(*mode, primary.clone())),
                        device,
                    },
                );
            }
        }
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut DeviceConfig> {
        if let Some(vlan) = self.vlans.get_mut(name) {
            return Some(&mut vlan.device);
        }
        if let Some(bridge) = self.bridges.get_mut(name) {
            return Some(&mut bridge.device);
        }
        if let Some(bond) = self.bonds.get_mut(name) {
            return Some(&mut bond.device);
        }
        self.ethernets.get_mut(name)
    }

    /// Declare `name` as a bare ethernet unless this document already has it
    pub fn ensure_placeholder(&mut self, name: &str) {
        if !self.contains(name) {
            self.ethernets
                .insert(name.to_string(), DeviceConfig::placeholder());
        }
    }

    /// True when nothing but bare ethernet placeholders remain
    pub fn is_placeholder_only(&self) -> bool {
        self.vlans.is_empty()
            && self.bridges.is_empty()
            && self.bonds.is_empty()
            && self.other.is_empty()
            && self.ethernets.values().all(DeviceConfig::is_placeholder)
    }
}
