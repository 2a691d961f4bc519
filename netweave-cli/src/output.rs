//! Output formatting for the CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::client::{Assessment, Construct, NetworkInterface, Outcome};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Items that can be displayed as a table row
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table<T: TableDisplay>() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(T::headers());
    table
}

pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = table::<T>();
            table.add_row(item.row());
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
    }
}

pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table if items.is_empty() => println!("Nothing to show."),
        OutputFormat::Table => {
            let mut table = table::<T>();
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
    }
}

pub fn print_outcome(outcome: &Outcome, format: OutputFormat) {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(outcome).unwrap_or_default());
        return;
    }

    println!("✅ {}", outcome.message);
    if let Some(hint) = &outcome.hint {
        println!("   hint: {hint}");
    }
    for note in &outcome.notes {
        println!("ℹ️  {note}");
    }
    if let Some(document) = &outcome.document {
        println!("   document: {document}");
    }
    for warning in &outcome.warnings {
        println!("⚠️  {}", warning.message);
        if let Some(hint) = &warning.hint {
            println!("   hint: {hint}");
        }
    }
}

pub fn print_error(message: &str) {
    eprintln!("❌ {message}");
}

pub fn print_hint(hint: &str) {
    eprintln!("   hint: {hint}");
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

impl TableDisplay for NetworkInterface {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "KIND", "STATE", "MTU", "IPV4", "MAC", "MASTER"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.kind.clone(),
            self.state.clone(),
            self.mtu.to_string(),
            or_dash(self.ipv4_address.as_deref()),
            or_dash(self.mac_address.as_deref()),
            or_dash(self.master.as_deref()),
        ]
    }
}

impl TableDisplay for Construct {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "KIND", "TOPOLOGY", "ADDRESSING", "MTU", "DOCUMENT", "MANAGED"]
    }

    fn row(&self) -> Vec<String> {
        let topology = match (self.kind.as_str(), &self.link, self.id) {
            ("vlan", Some(link), Some(id)) => format!("id {id} on {link}"),
            ("bond", _, _) => format!(
                "{} [{}]",
                self.mode.as_deref().unwrap_or("?"),
                self.interfaces.join(", ")
            ),
            _ => self.interfaces.join(", "),
        };
        let addressing = if !self.addressing.addresses.is_empty() {
            self.addressing.addresses.join(", ")
        } else if self.addressing.dhcp4 == Some(true) {
            "dhcp".to_string()
        } else {
            "-".to_string()
        };
        vec![
            self.name.clone(),
            self.kind.clone(),
            topology,
            addressing,
            self.addressing
                .mtu
                .map(|mtu| mtu.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.path.clone(),
            if self.vendor_managed { "yes" } else { "no" }.to_string(),
        ]
    }
}

impl TableDisplay for Assessment {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "CRITICAL", "REASONS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            if self.is_critical { "yes" } else { "no" }.to_string(),
            if self.reasons.is_empty() {
                "-".to_string()
            } else {
                self.reasons.join("\n")
            },
        ]
    }
}
