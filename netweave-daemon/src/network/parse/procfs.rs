use crate::network::normalize_name;

/// Counters for one device from `/proc/net/dev`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

pub fn parse_proc_net_dev(content: &str) -> Vec<DeviceCounters> {
    content
        .lines()
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let name = normalize_name(name);
            // header lines contain '|' and no numeric columns
            if name.is_empty() || name.contains('|') {
                return None;
            }
            let values: Vec<u64> = counters
                .split_whitespace()
                .map(|value| value.parse().unwrap_or(0))
                .collect();
            if values.len() < 10 {
                return None;
            }
            Some(DeviceCounters {
                name: name.to_string(),
                rx_bytes: values[0],
                rx_packets: values[1],
                tx_bytes: values[8],
                tx_packets: values[9],
            })
        })
        .collect()
}
