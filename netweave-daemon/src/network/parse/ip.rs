use crate::network::{normalize_name, LinkState};

/// One device block from `ip addr show` / `ip link show`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub index: u32,
    pub name: String,
    pub parent: Option<String>,
    pub flags: Vec<String>,
    pub mtu: Option<u32>,
    pub state: LinkState,
    pub master: Option<String>,
    pub mac_address: Option<String>,
    /// IPv4 addresses in CIDR form, in kernel order
    pub ipv4: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<String>,
    pub device: String,
}

pub fn parse_ip_addr(output: &str) -> Vec<LinkRecord> {
    let mut records: Vec<LinkRecord> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if let Some(record) = parse_header(line) {
                records.push(record);
            }
            continue;
        }

        let Some(current) = records.last_mut() else {
            continue;
        };
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some(kind) if kind.starts_with("link/") => {
                if let Some(mac) = tokens.next() {
                    if mac.contains(':') {
                        current.mac_address = Some(mac.to_string());
                    }
                }
            }
            Some("inet") => {
                if let Some(address) = tokens.next() {
                    current.ipv4.push(address.to_string());
                }
            }
            _ => {}
        }
    }

    records
}

/// `ip link show` prints the same header and link lines without addresses
pub fn parse_ip_link(output: &str) -> Vec<LinkRecord> {
    parse_ip_addr(output)
}

// 3: eth0.100@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue master br0 state UP ...
fn parse_header(line: &str) -> Option<LinkRecord> {
    let mut parts = line.splitn(3, ": ");
    let index = parts.next()?.trim().parse().ok()?;
    let raw_name = parts.next()?.trim();
    let rest = parts.next().unwrap_or_default();

    let name = normalize_name(raw_name).to_string();
    let parent = raw_name
        .split_once('@')
        .map(|(_, parent)| parent.to_string())
        .filter(|parent| parent != "NONE" && !parent.starts_with("if"));

    let mut tokens = rest.split_whitespace().peekable();
    let flags = match tokens.peek() {
        Some(first) if first.starts_with('<') => {
            let flags = first
                .trim_matches(|c| c == '<' || c == '>')
                .split(',')
                .filter(|flag| !flag.is_empty())
                .map(str::to_string)
                .collect();
            tokens.next();
            flags
        }
        _ => Vec::new(),
    };

    let mut record = LinkRecord {
        index,
        name,
        parent,
        flags,
        mtu: None,
        state: LinkState::Unknown,
        master: None,
        mac_address: None,
        ipv4: Vec::new(),
    };

    while let Some(key) = tokens.next() {
        match key {
            "mtu" => record.mtu = tokens.next().and_then(|v| v.parse().ok()),
            "master" => record.master = tokens.next().map(str::to_string),
            "state" => {
                record.state = tokens
                    .next()
                    .map(LinkState::from_operstate)
                    .unwrap_or(LinkState::Unknown)
            }
            _ => {}
        }
    }

    Some(record)
}

/// `ip route show default`
pub fn parse_default_routes(output: &str) -> Vec<DefaultRoute> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() != Some(&"default") {
                return None;
            }
            let value_after = |key: &str| {
                tokens
                    .iter()
                    .position(|token| *token == key)
                    .and_then(|pos| tokens.get(pos + 1))
                    .map(|value| value.to_string())
            };
            Some(DefaultRoute {
                gateway: value_after("via"),
                device: value_after("dev")?,
            })
        })
        .collect()
}
