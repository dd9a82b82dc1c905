//! Shared test utilities for core module tests
//!
//! Provides common fixtures to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::data::NetworkData;
use crate::core::graph::{FrozenGraph, NetworkGraph};
use crate::transport::{ExecOutput, Target, Transport, TransportError};
use std::sync::Mutex;

/// The network every resolution test starts from.
///
/// - `gw`: bare-metal router, DHCP WAN on `wan0`, LAN `10.0.0.0/24`
/// - `hv1`: hypervisor hosting `web1`
/// - `web1`: service listening on 80/443, forwards to `db1`, calls an API
/// - `db1`: server
/// - `alice`: user device, admin of `web1` and `printer`
/// - `printer`: internal-only device
pub const OFFICE_JSON: &str = r#"{
    "label": "office",
    "domain": "office.example.org",
    "admin_email": "ops@office.example.org",
    "machines": {
        "gw": {
            "types": ["router", "dedicated"],
            "network_interfaces": {
                "wan": [{"iface": "wan0"}],
                "lan": [{"iface": "lan0", "address": "10.0.0.1", "netmask": "255.255.255.0"}]
            }
        },
        "hv1": {
            "types": ["hypervisor"],
            "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.1.10"}]}
        },
        "web1": {
            "types": ["service"],
            "hypervisor": "hv1",
            "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.1.2"}]},
            "firewall": {
                "listen": {"tcp": [80, 443]},
                "allow_egress_to": ["api.example.com:443"],
                "allow_forward_to": ["db1:5432"]
            },
            "admins": ["alice"]
        },
        "db1": {
            "types": ["server"],
            "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.1.6"}]}
        },
        "alice": {
            "types": ["user"],
            "email": "alice@example.org",
            "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.2.2"}]}
        },
        "printer": {
            "types": ["internal_only"],
            "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.3.2"}]},
            "admins": ["alice"]
        }
    }
}"#;

pub fn office_data() -> NetworkData {
    serde_json::from_str(OFFICE_JSON).unwrap()
}

/// The office network, built and frozen without profiles
pub fn office_graph() -> FrozenGraph {
    NetworkGraph::from_data(&office_data())
        .unwrap()
        .freeze()
        .unwrap()
}

/// Transport that records what it was sent and reports an all-passed run
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Target, String)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Target, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    async fn execute(&self, target: &Target, script: String) -> Result<ExecOutput, TransportError> {
        self.sent.lock().unwrap().push((target.clone(), script));
        Ok(ExecOutput::new(
            "passed=0 failed=0\n".to_string(),
            String::new(),
            Some(0),
        ))
    }
}
