//! Static input rules. Nothing here touches the system.

use ipnetwork::IpNetwork;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use super::request::{AddressingRequest, CreateRequest, EditChanges, IdInput, TopologyRequest};
use crate::error::{ConstructError, Result};
use crate::netplan::{Addressing, BondMode, ConstructDefinition, Topology};

/// Kernel limit is IFNAMSIZ - 1
const MAX_NAME_LEN: usize = 15;
pub const MTU_RANGE: std::ops::RangeInclusive<u32> = 68..=9000;
pub const VLAN_ID_RANGE: std::ops::RangeInclusive<u64> = 1..=4094;

/// A create request reduced to the definition that will be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCreate {
    pub definition: ConstructDefinition,
    pub notes: Vec<String>,
}

pub fn interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ConstructError::validation("Interface name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ConstructError::validation(format!(
            "Interface name '{name}' is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." || name.starts_with('-') {
        return Err(ConstructError::validation(format!(
            "'{name}' is not a valid interface name"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(ConstructError::validation(format!(
            "Interface name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

pub fn vlan_id(input: &IdInput) -> Result<u16> {
    let parsed = match input {
        IdInput::Number(number) => number.as_u64(),
        IdInput::Text(text) => text.trim().parse::<u64>().ok(),
    };
    match parsed {
        Some(id) if VLAN_ID_RANGE.contains(&id) => Ok(id as u16),
        _ => Err(ConstructError::validation(format!(
            "VLAN ID must be a whole number between 1 and 4094, got {}",
            match input {
                IdInput::Number(number) => number.to_string(),
                IdInput::Text(text) => format!("'{text}'"),
            }
        ))),
    }
}

pub fn mtu(value: u32) -> Result<u32> {
    if MTU_RANGE.contains(&value) {
        Ok(value)
    } else {
        Err(ConstructError::validation(format!(
            "MTU must be between {} and {}, got {value}",
            MTU_RANGE.start(),
            MTU_RANGE.end()
        )))
    }
}

/// Address with an explicit prefix length
pub fn cidr(value: &str) -> Result<String> {
    let value = value.trim();
    if !value.contains('/') {
        return Err(ConstructError::validation(format!(
            "Address '{value}' needs a prefix length, e.g. {value}/24"
        )));
    }
    value
        .parse::<IpNetwork>()
        .map(|_| value.to_string())
        .map_err(|e| ConstructError::validation(format!("Invalid address '{value}': {e}")))
}

pub fn ip_address(value: &str, what: &str) -> Result<String> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ConstructError::validation(format!("Invalid {what} '{value}'")))
}

/// Trimmed, syntactically valid, distinct member names
pub fn members(interfaces: &[String], minimum: usize, what: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut cleaned = Vec::new();
    for member in interfaces {
        let member = member.trim();
        if member.is_empty() {
            continue;
        }
        interface_name(member)?;
        if !seen.insert(member.to_string()) {
            return Err(ConstructError::validation(format!(
                "{member} is listed twice as a {what} member"
            )));
        }
        cleaned.push(member.to_string());
    }
    if cleaned.len() < minimum {
        let plural = if minimum == 1 { "" } else { "s" };
        return Err(ConstructError::validation(format!(
            "A {what} needs at least {minimum} member interface{plural}, got {}",
            cleaned.len()
        )));
    }
    Ok(cleaned)
}

pub fn addressing(request: &AddressingRequest) -> Result<Addressing> {
    let mtu = request.mtu.map(mtu).transpose()?;
    let address = request
        .address
        .as_deref()
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(cidr)
        .transpose()?;
    let gateway = request
        .gateway
        .as_deref()
        .map(str::trim)
        .filter(|gateway| !gateway.is_empty())
        .map(|gateway| ip_address(gateway, "gateway"))
        .transpose()?;
    if gateway.is_some() && address.is_none() {
        return Err(ConstructError::validation(
            "A gateway needs a static address on the same interface",
        ));
    }
    let nameservers = request
        .dns
        .iter()
        .map(|server| ip_address(server, "DNS server"))
        .collect::<Result<Vec<_>>>()?;

    Ok(Addressing {
        dhcp4: Some(address.is_none()),
        addresses: address.into_iter().collect(),
        gateway,
        nameservers,
        mtu,
    })
}

/// Apply edit changes on top of the current addressing
pub fn merge_changes(current: &Addressing, changes: &EditChanges) -> Result<Addressing> {
    let mut merged = current.clone();

    if let Some(value) = changes.mtu {
        merged.mtu = Some(mtu(value)?);
    }
    if let Some(address) = &changes.address {
        if address.trim().is_empty() {
            merged.addresses.clear();
            merged.gateway = None;
            merged.dhcp4 = Some(true);
        } else {
            merged.addresses = vec![cidr(address)?];
            merged.dhcp4 = Some(false);
        }
    }
    if let Some(gateway) = &changes.gateway {
        merged.gateway = if gateway.trim().is_empty() {
            None
        } else {
            Some(ip_address(gateway, "gateway")?)
        };
    }
    if let Some(dns) = &changes.dns {
        merged.nameservers = dns
            .iter()
            .map(|server| ip_address(server, "DNS server"))
            .collect::<Result<Vec<_>>>()?;
    }

    if merged.gateway.is_some() && merged.addresses.is_empty() {
        return Err(ConstructError::validation(
            "A gateway needs a static address on the same interface",
        ));
    }
    Ok(merged)
}

/// Validate a create request and settle the construct's name
pub fn resolve_create(request: &CreateRequest) -> Result<ResolvedCreate> {
    let mut notes = Vec::new();
    let requested = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let (name, topology) = match &request.topology {
        TopologyRequest::Vlan { id, link } => {
            let id = vlan_id(id)?;
            let link = link.trim();
            if link.is_empty() {
                return Err(ConstructError::validation(
                    "Choose a parent interface for the VLAN",
                ));
            }
            interface_name(link)?;

            let canonical = format!("{link}.{id}");
            let name = match requested {
                None => canonical,
                Some(name) if name == canonical => canonical,
                Some(name) if name.contains('.') => {
                    tracing::info!("Renaming VLAN {} to {}", name, canonical);
                    notes.push(format!(
                        "Renamed {name} to {canonical} to match parent {link} and VLAN ID {id}"
                    ));
                    canonical
                }
                Some(custom) => custom.to_string(),
            };
            (
                name,
                Topology::Vlan {
                    id,
                    link: link.to_string(),
                },
            )
        }
        TopologyRequest::Bridge { interfaces, stp } => {
            let name = requested
                .ok_or_else(|| ConstructError::validation("A bridge needs a name"))?
                .to_string();
            let interfaces = members(interfaces, 1, "bridge")?;
            (
                name,
                Topology::Bridge {
                    interfaces: interfaces.into_iter().collect::<BTreeSet<_>>(),
                    stp: *stp,
                },
            )
        }
        TopologyRequest::Bond {
            interfaces,
            mode,
            primary,
        } => {
            let name = requested
                .ok_or_else(|| ConstructError::validation("A bond needs a name"))?
                .to_string();
            let interfaces = members(interfaces, 2, "bond")?;
            let mode_text = mode
                .as_deref()
                .map(str::trim)
                .filter(|mode| !mode.is_empty())
                .ok_or_else(|| ConstructError::validation("A bond needs a mode"))?;
            let mode = BondMode::parse(mode_text).ok_or_else(|| {
                ConstructError::validation(format!("Unknown bond mode '{mode_text}'"))
            })?;
            let primary = primary
                .as_deref()
                .map(str::trim)
                .filter(|primary| !primary.is_empty())
                .map(str::to_string);
            if let Some(primary) = &primary {
                if !interfaces.contains(primary) {
                    return Err(ConstructError::validation(format!(
                        "Primary interface {primary} is not a member of the bond"
                    )));
                }
            }
            (
                name,
                Topology::Bond {
                    mode: Some(mode),
                    interfaces,
                    primary,
                },
            )
        }
    };

    interface_name(&name)?;
    if topology.lower_devices().contains(&name) {
        return Err(ConstructError::validation(format!(
            "{name} cannot be a member of itself"
        )));
    }

    Ok(ResolvedCreate {
        definition: ConstructDefinition {
            name,
            topology,
            addressing: addressing(&request.addressing)?,
        },
        notes,
    })
}
