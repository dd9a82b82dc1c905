//! Network description records
//!
//! These are the raw, deserialized shapes of a network JSON file. They carry
//! strings and integers exactly as written; validation happens when
//! [`crate::core::graph::NetworkGraph::from_data`] turns them into machines.
//!
//! ```json
//! {
//!   "label": "office",
//!   "domain": "office.example.org",
//!   "machines": {
//!     "gw":   { "types": ["router", "dedicated"], "network_interfaces": { "wan": [ ... ], "lan": [ ... ] } },
//!     "web1": { "types": ["service"], "hypervisor": "hv1", "firewall": { "listen": { "tcp": [443] } } }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkData {
    pub label: String,
    #[serde(default)]
    pub domain: Option<String>,
    /// Recipient of network-wide reports (bandwidth digest)
    #[serde(default)]
    pub admin_email: Option<String>,
    /// Emit LOG rules in front of every default drop
    #[serde(default)]
    pub debug: bool,
    /// Add an address pool for unregistered guest devices
    #[serde(default)]
    pub auto_guest: bool,
    /// Netmask for interfaces that do not declare one
    #[serde(default = "default_netmask")]
    pub netmask: String,
    #[serde(default)]
    pub machines: BTreeMap<String, MachineData>,
}

fn default_netmask() -> String {
    "255.255.255.252".to_string()
}

impl NetworkData {
    /// Reads a network description from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read or is not a valid description.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineData {
    #[serde(default)]
    pub types: Vec<String>,
    /// Hosting hypervisor, services only
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub cnames: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub network_interfaces: InterfacesData,
    #[serde(default)]
    pub firewall: FirewallData,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub ssh_port: Option<i64>,
    #[serde(default)]
    pub ram: Option<u64>,
    #[serde(default)]
    pub disks: BTreeMap<String, DiskData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfacesData {
    #[serde(default)]
    pub wan: Vec<InterfaceData>,
    #[serde(default)]
    pub lan: Vec<InterfaceData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceData {
    pub iface: String,
    #[serde(default)]
    pub inet: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub broadcast: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallData {
    #[serde(default)]
    pub listen: ListenData,
    #[serde(default)]
    pub allow_ingress_from: Vec<String>,
    #[serde(default)]
    pub allow_egress_to: Vec<String>,
    #[serde(default)]
    pub allow_forward_to: Vec<String>,
    #[serde(default)]
    pub dnat_to: Vec<String>,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub throttle: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenData {
    #[serde(default)]
    pub tcp: Vec<i64>,
    #[serde(default)]
    pub udp: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskData {
    /// Size in MiB
    pub size: u64,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}
