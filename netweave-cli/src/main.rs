/*!
 * netweave CLI
 * VLAN, bridge and bond management through netweaved
 */

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod client;
mod output;

use client::{Addressing, NetweaveClient, Request, Response, Topology};
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "netweave")]
#[command(about = "Manage netplan VLANs, bridges and bonds through netweaved")]
struct Cli {
    /// Daemon socket path
    #[arg(short, long, default_value = "/run/netweave/netweave.sock")]
    socket: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that netweaved is answering
    Status,
    /// List every live interface
    Interfaces,
    /// List physical interfaces usable as VLAN parents or members
    Physical,
    /// Explain whether touching an interface could cut connectivity
    Assess { name: String },
    /// List declared VLANs, bridges and bonds
    Constructs,
    /// Create a construct
    #[command(subcommand)]
    Create(CreateCommand),
    /// Change MTU or addressing of an interface
    Edit {
        name: String,
        #[command(flatten)]
        addressing: AddressingArgs,
        /// Switch the interface back to DHCP
        #[arg(long, conflicts_with = "address")]
        dhcp: bool,
        /// Confirmation phrase for critical interfaces
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Delete a construct
    Delete {
        name: String,
        /// Repeat the interface name for critical interfaces
        #[arg(long)]
        confirm: Option<String>,
        /// Delete even if routes or services still use the interface
        #[arg(long)]
        force: bool,
    },
    /// Bring an interface up or down
    Link {
        name: String,
        state: LinkState,
        /// Confirmation phrase for taking a critical interface down
        #[arg(long)]
        confirm: Option<String>,
    },
}

#[derive(Subcommand)]
enum CreateCommand {
    /// 802.1Q VLAN on a physical parent
    Vlan {
        /// VLAN id (1-4094)
        id: String,
        /// Parent interface
        #[arg(long)]
        link: String,
        /// Interface name, defaults to <link>.<id>
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        addressing: AddressingArgs,
    },
    /// Bridge over one or more members
    Bridge {
        name: String,
        /// Member interfaces
        #[arg(long = "member", short = 'm')]
        members: Vec<String>,
        /// Enable spanning tree
        #[arg(long)]
        stp: Option<bool>,
        #[command(flatten)]
        addressing: AddressingArgs,
    },
    /// Bond over two or more members
    Bond {
        name: String,
        /// Member interfaces
        #[arg(long = "member", short = 'm')]
        members: Vec<String>,
        /// Bonding mode, e.g. active-backup or 802.3ad
        #[arg(long)]
        mode: String,
        /// Primary member for active-backup
        #[arg(long)]
        primary: Option<String>,
        #[command(flatten)]
        addressing: AddressingArgs,
    },
}

#[derive(Args, Debug, Default)]
struct AddressingArgs {
    #[arg(long)]
    mtu: Option<u32>,
    /// Static address in CIDR form; omit for DHCP
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    gateway: Option<String>,
    /// Nameserver, may be repeated
    #[arg(long)]
    dns: Vec<String>,
}

impl AddressingArgs {
    fn into_addressing(self) -> Addressing {
        Addressing {
            mtu: self.mtu,
            address: self.address,
            gateway: self.gateway,
            dns: if self.dns.is_empty() { None } else { Some(self.dns) },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkState {
    Up,
    Down,
}

impl Command {
    fn into_request(self) -> Request {
        match self {
            Command::Status => Request::Ping,
            Command::Interfaces => Request::ListInterfaces,
            Command::Physical => Request::ListPhysicalInterfaces,
            Command::Assess { name } => Request::AssessCriticality { name },
            Command::Constructs => Request::ListConstructs,
            Command::Create(create) => create.into_request(),
            Command::Edit {
                name,
                addressing,
                dhcp,
                confirm,
            } => {
                let mut changes = addressing.into_addressing();
                if dhcp {
                    changes.address = Some(String::new());
                }
                Request::EditConstruct {
                    name,
                    changes,
                    confirmation: confirm,
                }
            }
            Command::Delete {
                name,
                confirm,
                force,
            } => Request::DeleteConstruct {
                name,
                confirmation: confirm,
                force,
            },
            Command::Link {
                name,
                state,
                confirm,
            } => Request::SetLinkState {
                name,
                up: matches!(state, LinkState::Up),
                confirmation: confirm,
            },
        }
    }
}

impl CreateCommand {
    fn into_request(self) -> Request {
        let (name, topology, addressing) = match self {
            CreateCommand::Vlan {
                id,
                link,
                name,
                addressing,
            } => (name, Topology::Vlan { id, link }, addressing),
            CreateCommand::Bridge {
                name,
                members,
                stp,
                addressing,
            } => (
                Some(name),
                Topology::Bridge {
                    interfaces: members,
                    stp,
                },
                addressing,
            ),
            CreateCommand::Bond {
                name,
                members,
                mode,
                primary,
                addressing,
            } => (
                Some(name),
                Topology::Bond {
                    interfaces: members,
                    mode,
                    primary,
                },
                addressing,
            ),
        };
        Request::CreateConstruct {
            name,
            topology,
            addressing: addressing.into_addressing(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("netweave_cli={level}")))
        .with_writer(std::io::stderr)
        .init();

    let client = NetweaveClient::new(cli.socket);
    let response = client.send_request(&cli.command.into_request()).await?;

    if !render(response, cli.format) {
        std::process::exit(1);
    }
    Ok(())
}

/// Print a daemon response. Returns false for error responses.
fn render(response: Response, format: OutputFormat) -> bool {
    match response {
        Response::Pong { version } => println!("netweaved {version} is running"),
        Response::Interfaces { interfaces } => output::print_list(&interfaces, format),
        Response::PhysicalInterfaces { names } => match format {
            OutputFormat::Table => names.iter().for_each(|name| println!("{name}")),
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&names).unwrap_or_default())
            }
        },
        Response::Assessment(assessment) => output::print_item(&assessment, format),
        Response::Constructs { constructs } => output::print_list(&constructs, format),
        Response::Outcome(outcome) => output::print_outcome(&outcome, format),
        Response::Success { message } => println!("✅ {message}"),
        Response::Error {
            kind,
            message,
            hint,
            rolled_back,
            token,
            details,
        } => {
            output::print_error(&format!("{kind}: {message}"));
            for detail in &details {
                eprintln!("   - {detail}");
            }
            if let Some(token) = token {
                eprintln!("   re-run with --confirm \"{token}\"");
            }
            if let Some(hint) = hint {
                output::print_hint(&hint);
            }
            match rolled_back {
                Some(true) => eprintln!("   previous configuration restored"),
                Some(false) => eprintln!("   live state may be partially applied"),
                None => {}
            }
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(args: &[&str]) -> serde_json::Value {
        let cli = Cli::try_parse_from(std::iter::once("netweave").chain(args.iter().copied()))
            .unwrap();
        serde_json::to_value(cli.command.into_request()).unwrap()
    }

    #[test]
    fn bond_members_and_mode_are_forwarded() {
        assert_eq!(
            request(&["create", "bond", "bond1", "-m", "eth2", "-m", "eth3", "--mode", "802.3ad"]),
            json!({
                "type": "CreateConstruct",
                "name": "bond1",
                "topology": {"kind": "bond", "interfaces": ["eth2", "eth3"], "mode": "802.3ad"},
                "addressing": {}
            })
        );
    }

    #[test]
    fn dhcp_flag_sends_empty_address() {
        assert_eq!(
            request(&["edit", "eth0", "--dhcp", "--confirm", "CHANGE IP"]),
            json!({
                "type": "EditConstruct",
                "name": "eth0",
                "changes": {"address": ""},
                "confirmation": "CHANGE IP"
            })
        );
    }

    #[test]
    fn link_down_carries_confirmation() {
        assert_eq!(
            request(&["link", "eth0", "down", "--confirm", "BRING DOWN"]),
            json!({"type": "SetLinkState", "name": "eth0", "up": false, "confirmation": "BRING DOWN"})
        );
    }

    #[test]
    fn error_responses_fail_the_command() {
        let busy = Response::Error {
            kind: "busy".into(),
            message: "Another network change is already in progress".into(),
            hint: None,
            rolled_back: None,
            token: None,
            details: Vec::new(),
        };
        assert!(!render(busy, OutputFormat::Json));
        assert!(render(
            Response::Success {
                message: "ok".into()
            },
            OutputFormat::Table
        ));
    }

    #[test]
    fn bridge_help_states_member_minimum() {
        use clap::CommandFactory;
        let cli = Cli::command();
        let bridge = cli
            .find_subcommand("create")
            .and_then(|create| create.find_subcommand("bridge"))
            .unwrap();
        assert_eq!(
            bridge.get_about().unwrap().to_string(),
            "Bridge over one or more members"
        );
    }
}
