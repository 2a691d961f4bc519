use serde::{Deserialize, Serialize};

/// VLAN id as supplied by the caller. Forms send text, API callers numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdInput {
    Number(serde_json::Number),
    Text(String),
}

impl From<u16> for IdInput {
    fn from(id: u16) -> Self {
        IdInput::Number(id.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TopologyRequest {
    Vlan {
        id: IdInput,
        link: String,
    },
    Bridge {
        #[serde(default)]
        interfaces: Vec<String>,
        #[serde(default)]
        stp: Option<bool>,
    },
    Bond {
        #[serde(default)]
        interfaces: Vec<String>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        primary: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressingRequest {
    #[serde(default)]
    pub mtu: Option<u32>,
    /// Static IPv4/IPv6 address in CIDR form. Absent means DHCP.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Optional for VLANs, which default to `<link>.<id>`
    #[serde(default)]
    pub name: Option<String>,
    pub topology: TopologyRequest,
    #[serde(default)]
    pub addressing: AddressingRequest,
}

/// Only non-identifying fields can change. `None` leaves a field alone;
/// an empty address switches the device back to DHCP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditChanges {
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Option<Vec<String>>,
}

impl EditChanges {
    pub fn is_empty(&self) -> bool {
        self.mtu.is_none() && self.address.is_none() && self.gateway.is_none() && self.dns.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub name: String,
    pub changes: EditChanges,
    #[serde(default)]
    pub confirmation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub name: String,
    /// Must echo the interface name when it is critical
    #[serde(default)]
    pub confirmation: Option<String>,
    /// Proceed even though live dependents were found
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStateRequest {
    pub name: String,
    pub up: bool,
    #[serde(default)]
    pub confirmation: Option<String>,
}
