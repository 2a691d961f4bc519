/*!
 * IPC Server for netweaved
 * Newline-delimited JSON over a Unix socket
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::construct::request::{CreateRequest, DeleteRequest, EditRequest, LinkStateRequest};
use crate::construct::{ConstructController, OperationOutcome};
use crate::error::ConstructError;
use crate::netplan::store::OwnedDefinition;
use crate::network::criticality::CriticalityAssessment;
use crate::network::NetworkInterface;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Ping,
    ListInterfaces,
    ListPhysicalInterfaces,
    AssessCriticality { name: String },
    ListConstructs,
    CreateConstruct(CreateRequest),
    EditConstruct(EditRequest),
    DeleteConstruct(DeleteRequest),
    SetLinkState(LinkStateRequest),
    Shutdown,
}

#[derive(Debug, Serialize)]
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
    Assessment(CriticalityAssessment),
    Constructs {
        constructs: Vec<OwnedDefinition>,
    },
    Outcome(OperationOutcome),
    Error {
        kind: String,
        message: String,
        hint: Option<String>,
        rolled_back: Option<bool>,
        /// Confirmation token the caller must send back
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Criticality reasons or live dependents
        #[serde(skip_serializing_if = "Vec::is_empty")]
        details: Vec<String>,
    },
    Success {
        message: String,
    },
}

impl Response {
    fn protocol_error(message: String) -> Self {
        Response::Error {
            kind: "protocol".to_string(),
            message,
            hint: Some("Send one JSON request per line, tagged with \"type\"".to_string()),
            rolled_back: None,
            token: None,
            details: Vec::new(),
        }
    }
}

impl From<ConstructError> for Response {
    fn from(err: ConstructError) -> Self {
        let (token, details) = match &err {
            ConstructError::ConfirmationRequired { token, reasons, .. } => {
                (Some(token.clone()), reasons.clone())
            }
            ConstructError::Dependency { details, .. } => (None, details.clone()),
            _ => (None, Vec::new()),
        };
        Response::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            hint: err.hint(),
            rolled_back: err.rolled_back(),
            token,
            details,
        }
    }
}

pub struct IpcServer {
    listener: UnixListener,
    controller: Arc<ConstructController>,
    shutdown: Arc<Notify>,
}

impl IpcServer {
    pub fn new(listener: UnixListener, controller: Arc<ConstructController>) -> Self {
        Self {
            listener,
            controller,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Serve until a client sends `Shutdown`
    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tracing::debug!("New client connected");
                        let controller = Arc::clone(&self.controller);
                        let shutdown = Arc::clone(&self.shutdown);

                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, controller, shutdown).await {
                                tracing::error!("Client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                },
                _ = self.shutdown.notified() => {
                    tracing::info!("Shutdown requested over IPC");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_client(
    stream: UnixStream,
    controller: Arc<ConstructController>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let raw = line.trim();
        if raw.is_empty() {
            line.clear();
            continue;
        }
        tracing::debug!("Received request: {}", raw);

        let (response, stop) = match serde_json::from_str::<Request>(raw) {
            Ok(Request::Shutdown) => (
                Response::Success {
                    message: "netweaved shutting down".to_string(),
                },
                true,
            ),
            Ok(request) => (dispatch(&controller, request).await, false),
            Err(e) => (Response::protocol_error(format!("Malformed request: {e}")), false),
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;

        if stop {
            shutdown.notify_one();
            break;
        }
        line.clear();
    }

    Ok(())
}

pub async fn dispatch(controller: &ConstructController, request: Request) -> Response {
    let result = match request {
        Request::Ping => Ok(Response::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        Request::ListInterfaces => Ok(Response::Interfaces {
            interfaces: controller.list_interfaces().await,
        }),
        Request::ListPhysicalInterfaces => controller
            .physical_parents()
            .await
            .map(|names| Response::PhysicalInterfaces { names }),
        Request::AssessCriticality { name } => {
            controller.assess(&name).await.map(Response::Assessment)
        }
        Request::ListConstructs => controller
            .list_constructs()
            .await
            .map(|constructs| Response::Constructs { constructs }),
        Request::CreateConstruct(request) => controller.create(request).await.map(Response::Outcome),
        Request::EditConstruct(request) => controller.edit(request).await.map(Response::Outcome),
        Request::DeleteConstruct(request) => controller.delete(request).await.map(Response::Outcome),
        Request::SetLinkState(request) => {
            controller.set_link_state(request).await.map(Response::Outcome)
        }
        Request::Shutdown => Ok(Response::Success {
            message: "Shutdown is handled by the connection".to_string(),
        }),
    };
    result.unwrap_or_else(Response::from)
}
