/// One established TCP session from `ss -Htn state established`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSession {
    pub local_ip: String,
    pub local_port: u16,
    /// Set when the socket is bound to a device (`10.0.0.5%eth0:22`)
    pub device: Option<String>,
    pub peer: String,
}

pub fn parse_established(output: &str) -> Vec<TcpSession> {
    output
        .lines()
        .filter_map(|line| {
            let mut endpoints = line.split_whitespace().filter_map(split_endpoint);
            let (local_ip, local_port, device) = endpoints.next()?;
            let (peer_ip, peer_port, _) = endpoints.next()?;
            Some(TcpSession {
                local_ip,
                local_port,
                device,
                peer: format!("{peer_ip}:{peer_port}"),
            })
        })
        .collect()
}

fn split_endpoint(token: &str) -> Option<(String, u16, Option<String>)> {
    let (host, port) = token.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let (host, device) = match host.split_once('%') {
        Some((host, device)) => (host, Some(device.to_string())),
        None => (host, None),
    };
    let host = host.strip_prefix("::ffff:").unwrap_or(host);
    (!host.is_empty()).then(|| (host.to_string(), port, device))
}
