use serde::{Deserialize, Serialize};

use super::inventory::Inventory;
use super::NetworkInterface;

/// Live dependents of one interface, gathered before a delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub name: String,
    /// Bond or bridge this interface is enslaved to
    pub member_of: Option<String>,
    /// Slaves of a bond, ports of a bridge
    pub members: Vec<String>,
    pub vlan_children: Vec<String>,
    /// Gateway of the default route through this interface, if any
    pub default_route: Option<String>,
    pub active_connections: Vec<String>,
    /// Probes that could not be completed
    pub unknowns: Vec<String>,
}

impl DependencyReport {
    /// A probe that failed counts as a dependent: safety could not be shown.
    pub fn requires_force(&self) -> bool {
        self.member_of.is_some()
            || !self.members.is_empty()
            || !self.vlan_children.is_empty()
            || self.default_route.is_some()
            || !self.active_connections.is_empty()
            || !self.unknowns.is_empty()
    }

    pub fn details(&self) -> Vec<String> {
        let mut details = Vec::new();
        if let Some(master) = &self.member_of {
            details.push(format!("is a member of {master}"));
        }
        if !self.members.is_empty() {
            details.push(format!("has members {}", self.members.join(", ")));
        }
        if !self.vlan_children.is_empty() {
            details.push(format!("carries VLANs {}", self.vlan_children.join(", ")));
        }
        if let Some(gateway) = &self.default_route {
            details.push(format!("carries the default route via {gateway}"));
        }
        if !self.active_connections.is_empty() {
            details.push(format!(
                "has {} active connection(s): {}",
                self.active_connections.len(),
                self.active_connections.join(", ")
            ));
        }
        for unknown in &self.unknowns {
            details.push(format!("could not check {unknown}"));
        }
        details
    }
}

/// Probe the live system for anything depending on `name`.
pub async fn probe(inventory: &Inventory, name: &str) -> DependencyReport {
    let mut report = DependencyReport {
        name: name.to_string(),
        ..Default::default()
    };

    let interfaces = match inventory.try_refresh().await {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Dependency probe could not list interfaces: {}", e);
            report.unknowns.push("interface membership".to_string());
            Vec::new()
        }
    };
    collect_topology(&mut report, &interfaces);

    match inventory.default_routes().await {
        Ok(routes) => {
            if let Some(route) = routes.iter().find(|route| route.device == name) {
                report.default_route =
                    Some(route.gateway.clone().unwrap_or_else(|| "link".to_string()));
            }
        }
        Err(e) => {
            tracing::warn!("Dependency probe could not read routes: {}", e);
            report.unknowns.push("default route".to_string());
        }
    }

    match inventory.established_sessions().await {
        Ok(sessions) => {
            let local_ip = interfaces
                .iter()
                .find(|iface| iface.name == name)
                .and_then(NetworkInterface::ipv4)
                .map(|ip| ip.to_string());
            report.active_connections = sessions
                .into_iter()
                .filter(|session| {
                    session.device.as_deref() == Some(name)
                        || local_ip.as_deref() == Some(session.local_ip.as_str())
                })
                .map(|session| format!("{}:{} <-> {}", session.local_ip, session.local_port, session.peer))
                .collect();
        }
        Err(e) => {
            tracing::warn!("Dependency probe could not read sessions: {}", e);
            report.unknowns.push("active connections".to_string());
        }
    }

    if report.requires_force() {
        tracing::info!("{} has dependents: {}", name, report.details().join("; "));
    }
    report
}

fn collect_topology(report: &mut DependencyReport, interfaces: &[NetworkInterface]) {
    let name = report.name.clone();
    for iface in interfaces {
        if iface.name == name {
            report.member_of = iface.master.clone();
        }
        if iface.master.as_deref() == Some(name.as_str()) {
            report.members.push(iface.name.clone());
        }
        if iface.parent.as_deref() == Some(name.as_str()) {
            report.vlan_children.push(iface.name.clone());
        }
    }
}
