/*!
 * netweave daemon library
 * VLAN, bridge and bond management on top of netplan
 */

pub mod config;
pub mod construct;
pub mod error;
pub mod exec;
pub mod ipc;
pub mod netplan;
pub mod network;

#[cfg(test)]
mod test_support;
