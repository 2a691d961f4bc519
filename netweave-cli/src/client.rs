/*!
 * netweave Daemon Client
 * JSON IPC communication with netweaved
 */

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum Request {
    Ping,
    ListInterfaces,
    ListPhysicalInterfaces,
    AssessCriticality {
        name: String,
    },
    ListConstructs,
    CreateConstruct {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        topology: Topology,
        addressing: Addressing,
    },
    EditConstruct {
        name: String,
        changes: Addressing,
        #[serde(skip_serializing_if = "Option::is_none")]
        confirmation: Option<String>,
    },
    DeleteConstruct {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confirmation: Option<String>,
        force: bool,
    },
    SetLinkState {
        name: String,
        up: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confirmation: Option<String>,
    },
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Topology {
    /// The id goes over as typed; netweaved owns the range check
    Vlan { id: String, link: String },
    Bridge {
        interfaces: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stp: Option<bool>,
    },
    Bond {
        interfaces: Vec<String>,
        mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        primary: Option<String>,
    },
}

/// Shared by create (absent address = DHCP) and edit (absent = unchanged)
#[derive(Debug, Default, Serialize)]
pub struct Addressing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Pong {
        version: String,
    },
    Interfaces {
        interfaces: Vec<NetworkInterface>,
    },
    PhysicalInterfaces {
        names: Vec<String>,
    },
    Assessment(Assessment),
    Constructs {
        constructs: Vec<Construct>,
    },
    Outcome(Outcome),
    Error {
        kind: String,
        message: String,
        hint: Option<String>,
        rolled_back: Option<bool>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        details: Vec<String>,
    },
    Success {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub kind: String,
    pub state: String,
    pub mtu: u32,
    pub mac_address: Option<String>,
    pub ipv4_address: Option<String>,
    pub master: Option<String>,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub name: String,
    pub is_critical: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Construct {
    pub name: String,
    pub kind: String,
    pub path: String,
    pub vendor_managed: bool,
    #[serde(default)]
    pub id: Option<u16>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub addressing: ConstructAddressing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstructAddressing {
    #[serde(default)]
    pub dhcp4: Option<bool>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub operation_id: String,
    pub operation: String,
    pub name: String,
    pub status: String,
    pub message: String,
    pub hint: Option<String>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub apply_path: Option<String>,
    pub document: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub message: String,
    pub hint: Option<String>,
}

pub struct NetweaveClient {
    socket_path: String,
}

impl NetweaveClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    pub async fn send_request(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Cannot reach netweaved at {}", self.socket_path))?;
        let (read_half, mut write_half) = stream.into_split();

        let request_json = serde_json::to_string(request)?;
        tracing::debug!("-> {}", request_json);
        write_half.write_all(request_json.as_bytes()).await?;
        write_half.write_all(b"\n").await?;

        // the daemon keeps the connection open, so read exactly one line
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await?;
        tracing::debug!("<- {}", line.trim());
        if line.trim().is_empty() {
            bail!("netweaved closed the connection without answering");
        }

        Ok(serde_json::from_str(&line)?)
    }
}
