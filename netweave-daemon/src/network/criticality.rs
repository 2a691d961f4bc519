use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use super::{LinkState, NetworkInterface};
use crate::error::{ConstructError, Result};

/// Names that usually carry the host's primary uplink
const PRIMARY_NAMES: [&str; 5] = ["br0", "bond0", "eth0", "eno1", "enp0s3"];

const NON_PUBLIC_RANGES: [(Ipv4Addr, u8); 5] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalityAssessment {
    pub name: String,
    pub is_critical: bool,
    pub reasons: Vec<String>,
}

/// Pure function of the snapshot. All rules are evaluated, reasons accumulate.
pub fn assess(iface: &NetworkInterface) -> CriticalityAssessment {
    let mut reasons = Vec::new();

    if let Some(ip) = iface.ipv4() {
        if !is_non_public(ip) {
            reasons.push(format!("has public IP address {ip}"));
        }
        if looks_like_gateway_range(ip) {
            reasons.push("may be used for default gateway".to_string());
        }
    }

    let lowered = iface.name.to_lowercase();
    if PRIMARY_NAMES.iter().any(|name| lowered.contains(name)) {
        reasons.push("is a primary network interface".to_string());
    }

    if iface.state == LinkState::Up && iface.ipv4_address.is_some() {
        reasons.push("is currently active with IP configuration".to_string());
    }

    CriticalityAssessment {
        name: iface.name.clone(),
        is_critical: !reasons.is_empty(),
        reasons,
    }
}

fn is_non_public(ip: Ipv4Addr) -> bool {
    NON_PUBLIC_RANGES.iter().any(|(network, prefix)| {
        Ipv4Network::new(*network, *prefix)
            .map(|range| range.contains(ip))
            .unwrap_or(false)
    })
}

// Literal octet matching, not a routing table lookup.
fn looks_like_gateway_range(ip: Ipv4Addr) -> bool {
    match ip.octets() {
        [192, 168, 1, _] => true,
        [10, 0, 0, _] => true,
        [172, second, _, _] => (16..=31).contains(&second),
        _ => false,
    }
}

/// Operation-specific confirmation token demanded from the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Fixed phrase, compared case-insensitively after trimming
    Phrase(&'static str),
    /// The interface name, compared exactly
    NameEcho(String),
}

impl Confirmation {
    pub const EDIT_CRITICAL: Confirmation = Confirmation::Phrase("EDIT CRITICAL");
    pub const CHANGE_IP: Confirmation = Confirmation::Phrase("CHANGE IP");
    pub const BRING_DOWN: Confirmation = Confirmation::Phrase("BRING DOWN");

    pub fn token(&self) -> &str {
        match self {
            Confirmation::Phrase(phrase) => phrase,
            Confirmation::NameEcho(name) => name,
        }
    }

    pub fn accepts(&self, supplied: Option<&str>) -> bool {
        let Some(supplied) = supplied else {
            return false;
        };
        match self {
            Confirmation::Phrase(phrase) => supplied.trim().eq_ignore_ascii_case(phrase),
            Confirmation::NameEcho(name) => supplied == name,
        }
    }
}

/// Enforce the confirmation gate for a critical interface.
/// Non-critical interfaces pass without a token.
pub fn require_confirmation(
    assessment: &CriticalityAssessment,
    operation: &str,
    expected: &Confirmation,
    supplied: Option<&str>,
) -> Result<()> {
    if !assessment.is_critical || expected.accepts(supplied) {
        return Ok(());
    }
    tracing::info!(
        "{} on {} held at confirmation gate: {}",
        operation,
        assessment.name,
        assessment.reasons.join(", ")
    );
    Err(ConstructError::ConfirmationRequired {
        name: assessment.name.clone(),
        operation: operation.to_string(),
        token: expected.token().to_string(),
        name_echo: matches!(expected, Confirmation::NameEcho(_)),
        reasons: assessment.reasons.clone(),
    })
}
