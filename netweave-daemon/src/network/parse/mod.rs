//! Parsers for the text output of the tools the inventory reads.
//!
//! None of these tools emit structured output on every distribution we
//! target, so the scraping is kept here behind typed records.

mod ip;
mod procfs;
mod ss;

pub use ip::{parse_default_routes, parse_ip_addr, parse_ip_link, DefaultRoute, LinkRecord};
pub use procfs::{parse_proc_net_dev, DeviceCounters};
pub use ss::{parse_established, TcpSession};
