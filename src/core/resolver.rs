//! Firewall resolution
//!
//! Expands every machine's traffic rules, plus what the network topology
//! implies, into the concrete firewall of one router. Resolution is a single
//! batch over a [`FrozenGraph`]: it sees the final set of machines, rules
//! and subnets, and nothing can be added to them afterwards.
//!
//! Each machine with at least one subnet owns three filter chains:
//!
//! - `<id>_fwd`: entered from `FORWARD` for traffic from or to the machine's
//!   subnet. It dispatches WAN traffic to the two chains below and holds the
//!   rules for traffic inside the network.
//! - `<id>_ingress`: traffic arriving from the internet
//! - `<id>_egress`: traffic leaving for the internet
//!
//! Every chain ends in a `DROP`.
//!
//! ```
//! use drnet::core::data::NetworkData;
//! use drnet::core::graph::NetworkGraph;
//! use drnet::core::resolver::FirewallResolver;
//!
//! let json = r#"{
//!     "label": "office",
//!     "machines": {
//!         "gw": {
//!             "types": ["router", "dedicated"],
//!             "network_interfaces": {
//!                 "wan": [{"iface": "wan0"}],
//!                 "lan": [{"iface": "lan0", "address": "10.0.0.1", "netmask": "255.255.255.0"}]
//!             }
//!         },
//!         "web1": {
//!             "types": ["server"],
//!             "network_interfaces": {"lan": [{"iface": "eth0", "address": "10.0.1.2"}]},
//!             "firewall": {"listen": {"tcp": [443]}}
//!         }
//!     }
//! }"#;
//! let data: NetworkData = serde_json::from_str(json).unwrap();
//! let graph = NetworkGraph::from_data(&data).unwrap().freeze().unwrap();
//! let resolved = FirewallResolver::new(&graph, "gw").unwrap().resolve().unwrap();
//! assert!(resolved.iptables().contains("-A web1_ingress -p tcp -m multiport --dports 443 -j ACCEPT"));
//! ```

use crate::core::error::{Error, Result};
use crate::core::firewall::{AddressSets, Firewall, NetfilterTable};
use crate::core::graph::FrozenGraph;
use crate::core::interface::Inet;
use crate::core::machine::{DeviceKind, HasInterfaces, HasTrafficRules, Machine, MachineKind};
use crate::core::traffic::{ANYWHERE, BROADCAST, Encapsulation, Table, TrafficRule};
use crate::core::unit::{Outcome, Unit};
use crate::core::units;
use crate::utils::{join_csv, to_identifier};
use crate::validators;
use ipnetwork::Ipv4Network;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Longest name `ipset` accepts
const MAX_SET_NAME: usize = 31;
/// Longest user chain name `iptables` accepts
const MAX_CHAIN_NAME: usize = 28;
/// Longest `--log-prefix` accepted by the LOG target
const MAX_LOG_PREFIX: usize = 29;
/// Longest `--hashlimit-name`
const MAX_HASHLIMIT_NAME: usize = 15;

pub const USER_SET: &str = "user";
pub const SERVERS_SET: &str = "servers";
pub const INTERNAL_ONLY_SET: &str = "internalonly";
pub const AUTO_GUEST_SET: &str = "autoguest";

/// Label of the unregistered guest pool
pub const AUTO_GUEST: &str = "autoguest";
const AUTO_GUEST_NETWORK: Ipv4Addr = Ipv4Addr::new(10, 250, 0, 0);
const AUTO_GUEST_PREFIX: u8 = 22;

/// Egress rate above which packets of throttled machines are dropped
pub const THROTTLE_RATE: &str = "1mb/s";

pub const IPSETS_SCRIPT_PATH: &str = "/etc/ipsets/ipsets.up.sh";
pub const IPTABLES_CONF_PATH: &str = "/etc/iptables/iptables.conf";
pub const SYSCTL_FORWARDING_PATH: &str = "/etc/sysctl.d/99-drnet-forwarding.conf";
pub const BANDWIDTH_DIGEST_PATH: &str = "/etc/cron.daily/bandwidth";
/// Where loaded rule checksums are recorded on the router
pub const STATE_DIR: &str = "/var/lib/drnet";

/// Chain names fit `iptables`; long labels are cut and tagged with a hash.
///
/// ```
/// use drnet::core::resolver::ingress_chain;
///
/// assert_eq!(ingress_chain("web-1"), "web_1_ingress");
/// assert_eq!(ingress_chain("accounting-fileserver-01").len(), 28);
/// ```
pub fn ingress_chain(label: &str) -> String {
    bounded_name(label, "_ingress", MAX_CHAIN_NAME)
}

pub fn egress_chain(label: &str) -> String {
    bounded_name(label, "_egress", MAX_CHAIN_NAME)
}

pub fn forward_chain(label: &str) -> String {
    bounded_name(label, "_fwd", MAX_CHAIN_NAME)
}

fn log_prefix(label: &str, direction: &str) -> String {
    bounded_name(label, &format!("-{direction}-dropped:"), MAX_LOG_PREFIX)
}

fn hashlimit_name(label: &str) -> String {
    bounded_name(label, "_thr", MAX_HASHLIMIT_NAME)
}

/// Set key of a machine's admin devices
fn admins_key(label: &str) -> String {
    format!("{label}_admins")
}

/// Set key of a machine's own subnets
fn host_key(label: &str) -> String {
    format!("{label}_host")
}

/// Derives an `ipset` name from arbitrary text.
///
/// Names too long for `ipset` are cut and suffixed with a hash of the full
/// text so they stay distinct.
///
/// ```
/// use drnet::core::resolver::set_name;
///
/// assert_eq!(set_name("api.example.com"), "api_example_com");
/// let long = set_name("a-very-long-hostname.for-an.example.org");
/// assert_eq!(long.len(), 31);
/// ```
pub fn set_name(raw: &str) -> String {
    bounded_name(raw, "", MAX_SET_NAME)
}

/// `to_identifier(key)` followed by `suffix`, hashed when longer than `max`.
fn bounded_name(key: &str, suffix: &str, max: usize) -> String {
    let id = to_identifier(key);
    if id.len() + suffix.len() <= max {
        return format!("{id}{suffix}");
    }
    hashed_name(key, suffix, max)
}

/// Like [`bounded_name`], but always tagged with 8 hex chars of the key's
/// sha256 so that keys with the same identifier stay apart.
fn hashed_name(key: &str, suffix: &str, max: usize) -> String {
    let id = to_identifier(key);
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    let keep = max.saturating_sub(suffix.len() + 9).min(id.len());
    format!("{}_{}{suffix}", &id[..keep], &digest[..8])
}

/// `-m multiport --<flag> a,b` for a rule's ports, empty for any port
fn port_match(rule: &TrafficRule, flag: &str) -> String {
    if rule.is_any_port() {
        String::new()
    } else {
        format!(" -m multiport --{flag} {}", join_csv(rule.ports()))
    }
}

/// Where a rule endpoint points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// No address match at all
    Anywhere,
    /// Matched through an address set
    Set(String),
}

/// The firewall of one router, fully resolved
#[derive(Debug, Clone)]
pub struct ResolvedFirewall {
    router: String,
    firewall: Firewall,
    sets: AddressSets,
}

impl ResolvedFirewall {
    pub fn router(&self) -> &str {
        &self.router
    }

    pub fn firewall(&self) -> &Firewall {
        &self.firewall
    }

    pub fn sets(&self) -> &AddressSets {
        &self.sets
    }

    /// `iptables-restore` input
    pub fn iptables(&self) -> String {
        self.firewall.to_restore_text()
    }

    /// Script loading every address set
    pub fn ipsets(&self) -> String {
        self.sets.to_script()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "router": self.router,
            "firewall": self.firewall.to_json(),
            "sets": serde_json::to_value(&self.sets).unwrap_or(serde_json::Value::Null),
        })
    }

    /// Units installing and loading this firewall on the router.
    pub fn units(&self, graph: &FrozenGraph) -> Result<Vec<Unit>> {
        let mut out = vec![
            units::installed("ipset", "", "ipset"),
            units::installed("iptables", "", "iptables"),
            units::file(
                "ip_forwarding",
                "",
                "net.ipv4.ip_forward=1",
                SYSCTL_FORWARDING_PATH,
            ),
            Unit::new(
                "ip_forwarding_enabled",
                "ip_forwarding",
                "sudo sysctl -w net.ipv4.ip_forward=1",
                "sysctl -n net.ipv4.ip_forward",
                "1",
                Outcome::Pass,
                "IP forwarding is off. Nothing behind this router can reach anything.",
            ),
            units::dir("drnet_state", "", STATE_DIR),
            units::dir("ipsets", "ipset_installed", "/etc/ipsets"),
        ];

        let ipsets = self.ipsets();
        out.push(units::file("ipsets_script", "ipsets_created", &ipsets, IPSETS_SCRIPT_PATH));
        out.push(units::file_perms("ipsets_script", "ipsets_script", IPSETS_SCRIPT_PATH, "750"));
        out.push(checksum_loaded_unit(
            "ipsets_loaded",
            "ipsets_script_chmoded",
            &format!("sudo bash {IPSETS_SCRIPT_PATH}"),
            IPSETS_SCRIPT_PATH,
            &ipsets,
            "I couldn't load the address sets. The firewall will not load either.",
        ));

        let iptables = self.iptables();
        out.push(units::dir("iptables", "iptables_installed", "/etc/iptables"));
        out.push(units::file("iptables_conf", "iptables_created", &iptables, IPTABLES_CONF_PATH));
        out.push(checksum_loaded_unit(
            "iptables_loaded",
            "ipsets_loaded",
            &format!("sudo iptables-restore < {IPTABLES_CONF_PATH}"),
            IPTABLES_CONF_PATH,
            &iptables,
            "I couldn't load the firewall rules. The router is running an outdated firewall.",
        ));

        if let Some(script) = bandwidth_digest(graph, &self.router)? {
            out.push(units::file_with_message(
                "daily_bandwidth_alert_script_created",
                "",
                &script,
                BANDWIDTH_DIGEST_PATH,
                "I couldn't create the bandwidth digest script. You and your users won't receive daily updates on bandwidth use.",
            ));
            out.push(units::file_perms_with_message(
                "daily_bandwidth_alert_script",
                "daily_bandwidth_alert_script_created",
                BANDWIDTH_DIGEST_PATH,
                "750",
                "I couldn't make the bandwidth digest script executable. You and your users won't receive daily updates on bandwidth use.",
            ));
        }

        Ok(out)
    }
}

/// A unit that runs `load` and records the checksum of `path`, passing once
/// the recorded checksum matches `content`.
fn checksum_loaded_unit(
    label: &str,
    precondition: &str,
    load: &str,
    path: &str,
    content: &str,
    message: &str,
) -> Unit {
    let file_text = format!("{}\n", content.trim_end_matches('\n'));
    let checksum = format!("{:x}", Sha256::digest(file_text.as_bytes()));
    let record = format!("{STATE_DIR}/{}.loaded", label.trim_end_matches("_loaded"));
    Unit::new(
        label,
        precondition,
        format!(
            "{load} && sha256sum {path} | awk '{{ print $1 }}' | sudo tee {record} > /dev/null"
        ),
        format!("sudo cat {record} 2>/dev/null"),
        checksum,
        Outcome::Pass,
        message,
    )
}

/// The cron script mailing every user and the admin their traffic counters.
///
/// `None` when the network has no admin address to send from and to.
fn bandwidth_digest(graph: &FrozenGraph, router: &str) -> Result<Option<String>> {
    let Some(admin) = graph.settings().admin_email.as_deref() else {
        return Ok(None);
    };
    let router = graph.machine(router)?;
    let network = &graph.settings().label;
    let sender = format!(
        "{}@{}",
        router.label(),
        router.domain().unwrap_or("localhost")
    );
    let counter = |chain: &str| {
        format!("$(iptables -L {chain} -v -n -x | awk 'NR > 2 {{ sum += $2 }} END {{ print sum + 0 }}')")
    };

    let mut script = String::from("#!/bin/bash\n");
    for user in graph.user_devices() {
        let (Some(email), false) = (user.email(), user.subnets().is_empty()) else {
            continue;
        };
        let label = user.label();
        let _ = writeln!(
            script,
            "\necho -e \"subject: [{label}.{network}] Daily Bandwidth Digest\\nfrom: {sender}\\nrecipients: {email}\\n\\nUL: {}\\nDL: {}\" | sendmail \"{email}\"",
            counter(&egress_chain(label)),
            counter(&ingress_chain(label)),
        );
    }

    let _ = write!(
        script,
        "\necho -e \"subject: [{network}] Daily Bandwidth Digest\\nfrom: {sender}\\nrecipients: {admin}"
    );
    for machine in graph.machines().filter(|m| !m.subnets().is_empty()) {
        let label = machine.label();
        let _ = write!(
            script,
            "\\n\\nDigest for {label}:\\nUL: {}\\nDL: {}",
            counter(&egress_chain(label)),
            counter(&ingress_chain(label)),
        );
    }
    let _ = writeln!(script, "\" | sendmail \"{admin}\"\n");

    for machine in graph.machines().filter(|m| !m.subnets().is_empty()) {
        let _ = writeln!(script, "iptables -Z {}", ingress_chain(machine.label()));
        let _ = writeln!(script, "iptables -Z {}", egress_chain(machine.label()));
    }
    Ok(Some(script))
}

/// Resolves the firewall of one router over a frozen network.
#[derive(Debug)]
pub struct FirewallResolver<'g> {
    graph: &'g FrozenGraph,
    router: &'g Machine,
    firewall: Firewall,
    sets: AddressSets,
    /// Set name to the key that claimed it
    set_owners: BTreeMap<String, String>,
}

impl<'g> FirewallResolver<'g> {
    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] if `router` does not exist, and
    /// [`Error::Validation`] if it is not a router.
    pub fn new(graph: &'g FrozenGraph, router: &str) -> Result<Self> {
        let router = graph.machine(router)?;
        if !router.is_router() {
            return Err(Error::validation(
                "router",
                format!("{} is not a router", router.label()),
            ));
        }
        Ok(Self {
            graph,
            router,
            firewall: Firewall::new(),
            sets: AddressSets::new(),
            set_owners: BTreeMap::new(),
        })
    }

    /// Runs resolution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] for a rule naming a machine that
    /// does not exist, or [`Error::Validation`] for an unusable endpoint.
    pub fn resolve(mut self) -> Result<ResolvedFirewall> {
        let graph = self.graph;
        self.declare_sets();

        for machine in graph.machines() {
            let subnets = machine.subnets();
            let Some(subnet) = subnets.first() else {
                debug!("{} has no subnet, no chains built", machine.label());
                continue;
            };
            self.base_chains(machine.label(), *subnet)?;
        }
        self.wan_rules()?;

        for machine in graph.machines().filter(|m| m.kind().is_server()) {
            if !Self::has_chains(machine) {
                continue;
            }
            self.ingress_rules(machine)?;
            self.egress_rules(machine)?;
            self.forward_rules(machine)?;
            self.dnat_rules(machine)?;
            self.user_forward_rules(machine)?;
            self.admin_ssh_rule(machine)?;
        }

        for device in graph.devices().filter(|m| Self::has_chains(m)) {
            self.dnat_rules(device)?;
            match device.kind() {
                MachineKind::Device(DeviceKind::User | DeviceKind::Admin) => {
                    self.user_device_rules(device)?;
                    self.egress_rules(device)?;
                }
                MachineKind::Device(DeviceKind::InternalOnly) => {
                    self.user_forward_rules(device)?;
                }
                _ => {
                    self.egress_rules(device)?;
                }
            }
        }

        for machine in graph.machines().filter(|m| Self::has_chains(m)) {
            self.jump_rules(machine.label())?;
        }

        if graph.settings().auto_guest {
            self.auto_guest()?;
        }

        for machine in graph
            .machines()
            .filter(|m| m.is_throttled() && Self::has_chains(m))
        {
            self.throttle(machine)?;
        }

        info!(
            "Resolved firewall for {}: {} rules, {} address sets",
            self.router.label(),
            self.firewall.rule_count(),
            self.sets.names().count()
        );
        Ok(ResolvedFirewall {
            router: self.router.label().to_string(),
            firewall: self.firewall,
            sets: self.sets,
        })
    }

    fn has_chains(machine: &Machine) -> bool {
        !machine.subnets().is_empty()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Address sets
    // ═══════════════════════════════════════════════════════════════════════════

    /// The set name for `key`. A key whose plain name another key already
    /// holds gets a hashed name instead of sharing that set.
    fn claim_set(&mut self, key: &str) -> String {
        let name = set_name(key);
        match self.set_owners.get(&name) {
            Some(owner) if owner == key => return name,
            None => {
                self.set_owners.insert(name.clone(), key.to_string());
                return name;
            }
            Some(_) => {}
        }
        if let Some((name, _)) = self.set_owners.iter().find(|(_, owner)| *owner == key) {
            return name.clone();
        }
        let name = hashed_name(key, "", MAX_SET_NAME);
        debug!("Set name {} is taken, {key} uses {name}", set_name(key));
        self.set_owners.insert(name.clone(), key.to_string());
        name
    }

    fn declare_sets(&mut self) {
        let graph = self.graph;
        for name in [USER_SET, SERVERS_SET, INTERNAL_ONLY_SET, AUTO_GUEST_SET] {
            self.claim_set(name);
        }
        for name in [USER_SET, SERVERS_SET, INTERNAL_ONLY_SET] {
            self.sets.add_set(name);
        }
        for machine in graph.machines() {
            let set = match machine.kind() {
                MachineKind::Device(DeviceKind::User | DeviceKind::Admin) => USER_SET,
                MachineKind::Device(DeviceKind::InternalOnly) => INTERNAL_ONLY_SET,
                MachineKind::Device(_) | MachineKind::Router => continue,
                _ => SERVERS_SET,
            };
            for subnet in machine.subnets() {
                self.sets.add_network(set, subnet);
            }
        }

        for machine in graph.machines().filter(|m| Self::has_chains(m)) {
            let set = self.claim_set(&admins_key(machine.label()));
            self.sets.add_set(&set);
            for admin in machine.admins() {
                match graph.get(admin) {
                    Some(device) => {
                        for subnet in device.subnets() {
                            self.sets.add_network(&set, subnet);
                        }
                    }
                    None => debug!("Admin {admin} of {} has no device", machine.label()),
                }
            }
        }
    }

    /// Resolves a rule endpoint, declaring the set it needs.
    fn endpoint(&mut self, name: &str) -> Result<Endpoint> {
        if name == ANYWHERE || name == BROADCAST {
            return Ok(Endpoint::Anywhere);
        }

        if let Ok(network) = name.parse::<Ipv4Network>() {
            let set = self.claim_set(name);
            self.sets.add_network(&set, network);
            return Ok(Endpoint::Set(set));
        }

        if name.contains('.') {
            validators::validate_hostname(name).map_err(|e| Error::validation("destination", e))?;
            let set = self.claim_set(name);
            self.sets.add_host(&set, name);
            return Ok(Endpoint::Set(set));
        }

        let machine = self.graph.machine(name)?;
        let set = self.claim_set(&host_key(machine.label()));
        self.sets.add_set(&set);
        for subnet in machine.subnets() {
            self.sets.add_network(&set, subnet);
        }
        Ok(Endpoint::Set(set))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Chains
    // ═══════════════════════════════════════════════════════════════════════════

    fn base_chains(&mut self, label: &str, subnet: Ipv4Network) -> Result<()> {
        let id = to_identifier(label);
        let ingress = ingress_chain(label);
        let egress = egress_chain(label);
        let fwd = forward_chain(label);
        let fw = &mut self.firewall;

        fw.add_chain(NetfilterTable::Filter, &egress);
        fw.add_chain(NetfilterTable::Filter, &ingress);
        fw.add_chain(NetfilterTable::Filter, &fwd);

        fw.add_filter(
            &format!("{id}_ipt_server_src"),
            "FORWARD",
            &format!("-s {subnet} -j {fwd}"),
            &format!("Force any internal traffic coming from {label} to its own chain"),
        )?;
        fw.add_filter(
            &format!("{id}_ipt_server_dst"),
            "FORWARD",
            &format!("-d {subnet} -j {fwd}"),
            &format!("Force any internal traffic going to {label} to its own chain"),
        )?;

        // The chain may already hold rules; the drop still has to come last
        fw.add_filter_at(
            &format!("{id}_fwd_default_drop"),
            &fwd,
            0,
            "-j DROP",
            &format!("Drop any internal traffic for {label} which has not already hit one of our rules"),
        )?;
        fw.add_filter_at(
            &format!("{id}_ingress_default_drop"),
            &ingress,
            0,
            "-j DROP",
            &format!("Drop any external traffic for {label} which has not already hit one of our rules"),
        )?;
        fw.add_filter_at(
            &format!("{id}_egress_default_drop"),
            &egress,
            0,
            "-j DROP",
            &format!("Drop any outbound traffic from {label} which has not already hit one of our rules"),
        )?;

        if self.graph.settings().debug {
            for (chain, direction) in [(&fwd, "forward"), (&ingress, "ingress"), (&egress, "egress")] {
                fw.add_filter_at(
                    &format!("{id}_{direction}_log"),
                    chain,
                    1,
                    &format!("-j LOG --log-prefix \"{}\"", log_prefix(label, direction)),
                    &format!("Log any {direction} traffic of {label} before dropping it"),
                )?;
            }
        }

        for enc in [Encapsulation::Tcp, Encapsulation::Udp] {
            let p = enc.as_str();
            fw.add_filter(
                &format!("{id}_allow_related_ingress_traffic_{p}"),
                &ingress,
                &format!("-p {p} -m state --state ESTABLISHED,RELATED -j ACCEPT"),
                &format!("Allow {label} to receive responses to accepted outbound {p} traffic"),
            )?;
            fw.add_filter(
                &format!("{id}_allow_related_fwd_traffic_{p}"),
                &fwd,
                &format!("-p {p} -m state --state ESTABLISHED,RELATED -j ACCEPT"),
                &format!("Allow {label} to receive responses to accepted forward {p} traffic"),
            )?;
        }
        fw.add_filter(
            &format!("{id}_allow_related_outbound_traffic_tcp"),
            &egress,
            "-p tcp -m state --state ESTABLISHED,RELATED -j ACCEPT",
            &format!("Allow {label} to send responses to accepted inbound tcp traffic"),
        )?;
        fw.add_filter(
            &format!("{id}_allow_outbound_traffic_udp"),
            &egress,
            "-p udp -j ACCEPT",
            &format!("Allow {label} to send udp traffic"),
        )?;

        fw.add_filter(
            &format!("{id}_allow_router_traffic"),
            &fwd,
            &format!("-s {}/30 -j ACCEPT", subnet.network()),
            &format!("Allow traffic between {label} and its router"),
        )?;
        Ok(())
    }

    /// `<id>_fwd` hands WAN traffic to the ingress and egress chains.
    fn jump_rules(&mut self, label: &str) -> Result<()> {
        let id = to_identifier(label);
        let fwd = forward_chain(label);
        for wan in self.router.wan_interfaces() {
            let wan = wan.name();
            self.firewall.add_filter(
                &format!("{id}_jump_on_ingress"),
                &fwd,
                &format!("-i {wan} -j {}", ingress_chain(label)),
                "Jump to our ingress chain for incoming (external) traffic",
            )?;
            self.firewall.add_filter(
                &format!("{id}_jump_on_egress"),
                &fwd,
                &format!("-o {wan} -j {}", egress_chain(label)),
                "Jump to our egress chain for outgoing (external) traffic",
            )?;
        }
        Ok(())
    }

    /// Masquerade plus what the router needs per WAN link type.
    fn wan_rules(&mut self) -> Result<()> {
        let router = self.router;
        let id = to_identifier(router.label());
        for wan in router.wan_interfaces() {
            let name = wan.name();
            self.firewall.add_nat_postrouting(
                &format!("{id}_masquerade_external"),
                &format!("-o {name} -j MASQUERADE"),
                &format!("Mask the IP address of any external traffic coming from our network on {name}"),
            )?;

            match wan.inet() {
                Inet::Dhcp => {
                    self.firewall.add_filter(
                        "router_ext_dhcp_in",
                        "INPUT",
                        &format!("-i {name} -d {BROADCAST} -p udp --dport 68 --sport 67 -j ACCEPT"),
                        "Make sure the Router can receive DHCP responses",
                    )?;
                    self.firewall.add_filter(
                        "router_ext_dhcp_out",
                        "OUTPUT",
                        &format!("-o {name} -p udp --dport 67 --sport 68 -j ACCEPT"),
                        "Make sure the Router can send DHCP requests",
                    )?;
                }
                Inet::Ppp => {
                    self.firewall.add_mangle_forward(
                        "clamp_mss_to_pmtu",
                        "-p tcp --tcp-flags SYN,RST SYN -m tcpmss --mss 1400:1536 -j TCPMSS --clamp-mss-to-pmtu",
                        "Clamp the MSS to PMTU for PPPoE overhead",
                    )?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Per machine rules
    // ═══════════════════════════════════════════════════════════════════════════

    fn ingress_rules(&mut self, machine: &Machine) -> Result<()> {
        let label = machine.label();
        let id = to_identifier(label);
        for rule in machine.rules_in(Table::Ingress) {
            if rule.is_from_anywhere() {
                for port in rule.ports() {
                    if let Some(note) = validators::check_well_known_port(*port) {
                        debug!("{label} listens on {note}");
                    }
                }
            }
            let source = rule.source();
            let (set_clause, set_label) = match self.endpoint(source)? {
                Endpoint::Anywhere => (String::new(), "anywhere".to_string()),
                Endpoint::Set(set) => (format!(" -m set --match-set {set} src"), set),
            };
            let who = if source == ANYWHERE { "anywhere" } else { source };
            let ports = port_match(rule, "dports");
            self.firewall.add_filter(
                &format!("{id}_{set_label}_ingress"),
                &ingress_chain(label),
                &format!(
                    "-p {}{ports}{set_clause} -j ACCEPT",
                    rule.encapsulation().as_str()
                ),
                &format!("Allow {who} to call in"),
            )?;
        }
        Ok(())
    }

    fn egress_rules(&mut self, machine: &Machine) -> Result<()> {
        let label = machine.label();
        let id = to_identifier(label);
        for rule in machine.rules_in(Table::Egress) {
            for destination in rule.destinations() {
                // Broadcast means everywhere, never a set
                let (set_clause, set_label) = match self.endpoint(destination)? {
                    Endpoint::Anywhere => (String::new(), "anywhere".to_string()),
                    Endpoint::Set(set) => (format!(" -m set --match-set {set} dst"), set),
                };
                let whither = if destination == ANYWHERE { "anywhere" } else { destination };
                let ports = port_match(rule, "dports");
                self.firewall.add_filter(
                    &format!("{id}_{set_label}_egress"),
                    &egress_chain(label),
                    &format!(
                        "-p {}{ports}{set_clause} -j ACCEPT",
                        rule.encapsulation().as_str()
                    ),
                    &format!("Allow call out to {whither}"),
                )?;
            }
        }
        Ok(())
    }

    /// Request and reply holes between a machine and its forward targets,
    /// in both machines' forward chains.
    fn forward_rules(&mut self, machine: &Machine) -> Result<()> {
        for rule in machine.rules_in(Table::Forward) {
            for destination in rule.destinations() {
                let target = self.graph.machine(destination)?;
                self.forward_holes(machine, target, rule)?;
            }
        }
        Ok(())
    }

    fn forward_holes(&mut self, from: &Machine, to: &Machine, rule: &TrafficRule) -> Result<()> {
        let from_addrs = Self::addresses(from)?;
        let to_addrs = Self::addresses(to)?;
        let p = rule.encapsulation().as_str();
        let request = format!(
            "-p {p} -s {from_addrs} -d {to_addrs}{} -j ACCEPT",
            port_match(rule, "dports")
        );
        let reply = format!(
            "-p {p} -s {to_addrs} -d {from_addrs}{} -j ACCEPT",
            port_match(rule, "sports")
        );
        let from_id = to_identifier(from.label());
        let to_id = to_identifier(to.label());

        for chain_owner in [from, to] {
            if !Self::has_chains(chain_owner) {
                continue;
            }
            let chain = forward_chain(chain_owner.label());
            self.firewall.add_filter(
                &format!("{from_id}_{to_id}_forward_request"),
                &chain,
                &request,
                &format!("Allow traffic from {} to {}", from.label(), to.label()),
            )?;
            self.firewall.add_filter(
                &format!("{from_id}_{to_id}_forward_reply"),
                &chain,
                &reply,
                &format!("Allow replies from {} to {}", to.label(), from.label()),
            )?;
        }
        Ok(())
    }

    fn dnat_rules(&mut self, machine: &Machine) -> Result<()> {
        let label = machine.label();
        let id = to_identifier(label);

        // Nobody could be redirected without users
        if !self.sets.is_empty(USER_SET) {
            for rule in machine.rules_in(Table::Dnat) {
                for destination in rule.destinations() {
                    let target = self.graph.machine(destination)?;
                    let own = Self::first_address(machine)?;
                    let p = rule.encapsulation().as_str();
                    self.firewall.add_nat_prerouting(
                        &format!("{id}_{}_dnat", to_identifier(destination)),
                        &format!(
                            "-p {p} -m {p}{} ! -s {own} -d {} -j DNAT --to-destination {own}",
                            port_match(rule, "dports"),
                            Self::addresses(target)?
                        ),
                        &format!("DNAT traffic for {destination} to {label}"),
                    )?;
                    self.forward_holes(machine, target, rule)?;
                }
            }
        }

        let listen = machine.listen_ports(Encapsulation::Tcp);
        if listen.is_empty() {
            return Ok(());
        }
        for external in machine.external_ips() {
            let own = Self::first_address(machine)?;
            for wan in self.router.wan_interfaces() {
                self.firewall.add_nat_prerouting(
                    &format!("{id}_external_ip_dnat"),
                    &format!(
                        "-i {} -d {external} -p tcp -m multiport --dports {} -j DNAT --to-destination {own}",
                        wan.name(),
                        join_csv(&listen)
                    ),
                    &format!("DNAT external traffic on {external} to {label}"),
                )?;
            }
        }
        Ok(())
    }

    /// Lets users reach what a server listens on, and internal-only devices
    /// be used by users and managed by their admins.
    fn user_forward_rules(&mut self, machine: &Machine) -> Result<()> {
        if self.sets.is_empty(USER_SET) {
            return Ok(());
        }
        let label = machine.label();
        let id = to_identifier(label);
        let fwd = forward_chain(label);
        let listen = machine.listen_ports(Encapsulation::Tcp);

        match machine.kind() {
            MachineKind::Device(DeviceKind::InternalOnly) => {
                let ports = if listen.is_empty() {
                    String::new()
                } else {
                    format!(" -m multiport --dports {}", join_csv(&listen))
                };
                self.firewall.add_filter(
                    &format!("{id}_users_forward"),
                    &fwd,
                    &format!("-p tcp{ports} -m set --match-set {USER_SET} src -j ACCEPT"),
                    "Allow traffic from users",
                )?;
                let admins = self.claim_set(&admins_key(label));
                if !self.sets.is_empty(&admins) {
                    self.firewall.add_filter(
                        &format!("{id}_admins_management_forward"),
                        &fwd,
                        &format!("-p tcp -m set --match-set {admins} src -j ACCEPT"),
                        "Allow management traffic from admins",
                    )?;
                }
            }
            kind if kind.is_server() && !listen.is_empty() => {
                self.firewall.add_filter(
                    &format!("{id}_users_forward"),
                    &fwd,
                    &format!(
                        "-p tcp -m multiport --dports {} -m set --match-set {USER_SET} src -j ACCEPT",
                        join_csv(&listen)
                    ),
                    "Allow traffic from users",
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    /// User devices may reach servers and internal-only devices.
    fn user_device_rules(&mut self, user: &Machine) -> Result<()> {
        let id = to_identifier(user.label());
        let fwd = forward_chain(user.label());
        if !self.sets.is_empty(SERVERS_SET) {
            self.firewall.add_filter(
                &format!("{id}_servers_forward"),
                &fwd,
                &format!("-m set --match-set {SERVERS_SET} dst -j ACCEPT"),
                "Allow traffic to servers",
            )?;
        }
        if !self.sets.is_empty(INTERNAL_ONLY_SET) {
            self.firewall.add_filter(
                &format!("{id}_internalonly_forward"),
                &fwd,
                &format!("-m set --match-set {INTERNAL_ONLY_SET} dst -j ACCEPT"),
                "Allow traffic to internal-only devices",
            )?;
        }
        Ok(())
    }

    /// SSH from the machine's admins. Without admins only a bare-metal router
    /// is reachable, from anywhere; anything else gets no SSH at all.
    fn admin_ssh_rule(&mut self, machine: &Machine) -> Result<()> {
        let label = machine.label();
        let id = to_identifier(label);
        let admins = self.claim_set(&admins_key(label));
        let port = machine.ssh_port();

        let rule = if !self.sets.is_empty(&admins) {
            format!("-p tcp --dport {port} -m set --match-set {admins} src -j ACCEPT")
        } else if machine.is_router() && machine.is_metal() {
            format!("-p tcp --dport {port} -j ACCEPT")
        } else {
            debug!("{label} has no admins, no SSH allowed");
            return Ok(());
        };
        self.firewall.add_filter(
            &format!("{id}_allow_admin_ssh"),
            &forward_chain(label),
            &rule,
            "Allow SSH from admins",
        )
    }

    fn auto_guest(&mut self) -> Result<()> {
        let pool = Ipv4Network::new(AUTO_GUEST_NETWORK, AUTO_GUEST_PREFIX)
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.base_chains(AUTO_GUEST, pool)?;
        self.sets.add_network(AUTO_GUEST_SET, pool);
        self.firewall.add_filter(
            "autoguest_egress",
            &egress_chain(AUTO_GUEST),
            &format!("-p tcp -m set --match-set {AUTO_GUEST_SET} src -j ACCEPT"),
            "Allow automatic guest pool to call out to the internet",
        )?;
        self.jump_rules(AUTO_GUEST)
    }

    fn throttle(&mut self, machine: &Machine) -> Result<()> {
        let id = to_identifier(machine.label());
        self.firewall.add_filter(
            &format!("{id}_throttle"),
            &egress_chain(machine.label()),
            &format!(
                "-m hashlimit --hashlimit-above {THROTTLE_RATE} --hashlimit-mode srcip --hashlimit-name {} -j DROP",
                hashlimit_name(machine.label())
            ),
            &format!("Throttle outbound traffic of {}", machine.label()),
        )
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Comma separated addresses, falling back to subnets
    fn addresses(machine: &Machine) -> Result<String> {
        let addresses = machine.addresses();
        if !addresses.is_empty() {
            return Ok(join_csv(&addresses));
        }
        let subnets = machine.subnets();
        if subnets.is_empty() {
            return Err(Error::validation(
                "address",
                format!("{} has no address to route to", machine.label()),
            ));
        }
        Ok(join_csv(&subnets))
    }

    fn first_address(machine: &Machine) -> Result<Ipv4Addr> {
        machine.addresses().first().copied().ok_or_else(|| {
            Error::validation(
                "address",
                format!("{} has no address to redirect to", machine.label()),
            )
        })
    }
}
