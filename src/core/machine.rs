//! Machine model
//!
//! A [`Machine`] is any addressable node of the network: routers, servers,
//! hypervisors, services (VMs hosted on a hypervisor) and end-user devices.
//! The variant is a [`MachineKind`] tag rather than a type hierarchy; the
//! full set of classifications a record declares is kept alongside it in
//! [`Machine::types`] (a server can also be `dedicated`, a user device can
//! also be `vpn`, a router can also be a `hypervisor`).
//!
//! Capabilities the resolver relies on are exposed through the
//! [`HasInterfaces`], [`HasTrafficRules`] and [`HostedOnHypervisor`] traits.

use crate::core::error::{Error, Result};
use crate::core::interface::{Direction, Inet, NetworkInterface};
use crate::core::traffic::{ANYWHERE, Encapsulation, Table, TrafficRule};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default memory of a hosted service in MiB
pub const DEFAULT_SERVICE_RAM_MIB: u64 = 2048;

/// OUI prefix used for generated service MAC addresses
const GENERATED_MAC_PREFIX: &str = "080027";

/// Every classification a machine record can carry
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum MachineType {
    #[strum(serialize = "router")]
    Router,
    #[strum(serialize = "server")]
    Server,
    #[strum(serialize = "hypervisor")]
    Hypervisor,
    /// Bare-metal server not hosted on a hypervisor
    #[strum(serialize = "dedicated")]
    Dedicated,
    /// VM hosted on a hypervisor
    #[strum(serialize = "service")]
    Service,
    /// Device that never talks to the internet (printers, cameras)
    #[strum(serialize = "internal_only")]
    InternalOnly,
    /// Device that only talks to the internet (IoT, smart TVs)
    #[strum(serialize = "external_only")]
    ExternalOnly,
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "admin")]
    Admin,
    #[strum(serialize = "guest")]
    Guest,
    #[strum(serialize = "vpn")]
    Vpn,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "admin")]
    Admin,
    #[strum(serialize = "guest")]
    Guest,
    #[strum(serialize = "internal_only")]
    InternalOnly,
    #[strum(serialize = "external_only")]
    ExternalOnly,
}

/// Machine variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineKind {
    Router,
    Server,
    Hypervisor,
    Service { hypervisor: String },
    Device(DeviceKind),
}

impl MachineKind {
    /// Picks the variant for a set of classifications.
    ///
    /// Precedence is router, service, hypervisor, server, then the device
    /// kinds. A record with no classification at all is a server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHypervisor`] for a service without a
    /// hypervisor.
    pub fn classify(
        label: &str,
        types: &BTreeSet<MachineType>,
        hypervisor: Option<&str>,
    ) -> Result<Self> {
        let kind = if types.contains(&MachineType::Router) {
            MachineKind::Router
        } else if types.contains(&MachineType::Service) {
            let hypervisor = hypervisor.ok_or_else(|| Error::InvalidHypervisor {
                service: label.to_string(),
                hypervisor: String::new(),
            })?;
            MachineKind::Service {
                hypervisor: hypervisor.to_string(),
            }
        } else if types.contains(&MachineType::Hypervisor) {
            MachineKind::Hypervisor
        } else if types.contains(&MachineType::Server) || types.contains(&MachineType::Dedicated)
        {
            MachineKind::Server
        } else if types.contains(&MachineType::Admin) {
            MachineKind::Device(DeviceKind::Admin)
        } else if types.contains(&MachineType::User) {
            MachineKind::Device(DeviceKind::User)
        } else if types.contains(&MachineType::Guest) {
            MachineKind::Device(DeviceKind::Guest)
        } else if types.contains(&MachineType::InternalOnly) {
            MachineKind::Device(DeviceKind::InternalOnly)
        } else if types.contains(&MachineType::ExternalOnly) {
            MachineKind::Device(DeviceKind::ExternalOnly)
        } else {
            MachineKind::Server
        };
        Ok(kind)
    }

    /// `true` for routers, servers, hypervisors and services
    pub fn is_server(&self) -> bool {
        !matches!(self, MachineKind::Device(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, MachineKind::Device(_))
    }

    /// `true` for devices belonging to a person (the `user` address set)
    pub fn is_user_device(&self) -> bool {
        matches!(
            self,
            MachineKind::Device(DeviceKind::User | DeviceKind::Admin)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineKind::Router => "router",
            MachineKind::Server => "server",
            MachineKind::Hypervisor => "hypervisor",
            MachineKind::Service { .. } => "service",
            MachineKind::Device(DeviceKind::User) => "user",
            MachineKind::Device(DeviceKind::Admin) => "admin",
            MachineKind::Device(DeviceKind::Guest) => "guest",
            MachineKind::Device(DeviceKind::InternalOnly) => "internal_only",
            MachineKind::Device(DeviceKind::ExternalOnly) => "external_only",
        }
    }
}

/// A virtual disk attached to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub size_mib: u64,
    pub path: String,
    pub comment: Option<String>,
}

impl Disk {
    pub fn new(name: impl Into<String>, size_mib: u64, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_mib,
            path: path.into(),
            comment: None,
        }
    }

    /// Directory holding the disk image
    pub fn directory(&self) -> &str {
        self.path
            .rsplit_once('/')
            .map_or(self.path.as_str(), |(dir, _)| dir)
    }
}

pub trait HasInterfaces {
    fn interfaces(&self) -> &[NetworkInterface];

    /// Every IPv4 address of every interface, in declaration order
    fn addresses(&self) -> Vec<Ipv4Addr> {
        let mut out = Vec::new();
        for ip in self.interfaces().iter().flat_map(|i| i.addresses().iter()) {
            if !out.contains(ip) {
                out.push(*ip);
            }
        }
        out
    }

    /// Networks of the non-WAN interfaces, in declaration order
    fn subnets(&self) -> Vec<Ipv4Network> {
        let mut out = Vec::new();
        for net in self
            .interfaces()
            .iter()
            .filter(|i| !i.is_wan())
            .filter_map(NetworkInterface::network)
        {
            if !out.contains(&net) {
                out.push(net);
            }
        }
        out
    }

    fn wan_interfaces(&self) -> Vec<&NetworkInterface> {
        self.interfaces().iter().filter(|i| i.is_wan()).collect()
    }

    fn interface(&self, name: &str) -> Option<&NetworkInterface> {
        self.interfaces().iter().find(|i| i.name() == name)
    }
}

pub trait HasTrafficRules {
    fn traffic_rules(&self) -> &BTreeSet<TrafficRule>;

    fn rules_in(&self, table: Table) -> impl Iterator<Item = &TrafficRule> {
        self.traffic_rules()
            .iter()
            .filter(move |r| r.table() == table)
    }
}

pub trait HostedOnHypervisor {
    /// Label of the hosting hypervisor, `None` for anything that is not a
    /// hosted service.
    fn hypervisor(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    label: String,
    kind: MachineKind,
    types: BTreeSet<MachineType>,
    domain: Option<String>,
    cnames: Vec<String>,
    email: Option<String>,
    throttled: bool,
    interfaces: Vec<NetworkInterface>,
    traffic_rules: BTreeSet<TrafficRule>,
    profiles: Vec<String>,
    admins: Vec<String>,
    ssh_port: u16,
    external_ips: Vec<Ipv4Addr>,
    disks: BTreeMap<String, Disk>,
    ram_mib: Option<u64>,
}

impl Machine {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the label is not a valid machine label.
    pub fn new(label: &str, kind: MachineKind) -> Result<Self> {
        crate::validators::validate_machine_label(label)
            .map_err(|e| Error::validation("label", e))?;
        Ok(Self {
            label: label.to_string(),
            kind,
            types: BTreeSet::new(),
            domain: None,
            cnames: Vec::new(),
            email: None,
            throttled: false,
            interfaces: Vec::new(),
            traffic_rules: BTreeSet::new(),
            profiles: Vec::new(),
            admins: Vec::new(),
            ssh_port: DEFAULT_SSH_PORT,
            external_ips: Vec::new(),
            disks: BTreeMap::new(),
            ram_mib: None,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Record fields
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &MachineKind {
        &self.kind
    }

    pub fn types(&self) -> &BTreeSet<MachineType> {
        &self.types
    }

    pub fn is(&self, machine_type: MachineType) -> bool {
        self.types.contains(&machine_type)
    }

    pub fn add_type(&mut self, machine_type: MachineType) {
        self.types.insert(machine_type);
    }

    pub fn is_router(&self) -> bool {
        self.kind == MachineKind::Router
    }

    /// A router running directly on hardware rather than as a guest
    pub fn is_metal(&self) -> bool {
        self.is(MachineType::Dedicated) || self.is(MachineType::Hypervisor)
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn set_domain(&mut self, domain: impl Into<String>) {
        self.domain = Some(domain.into());
    }

    /// Fully qualified name, when a domain is known
    pub fn fqdn(&self) -> Option<String> {
        self.domain.as_ref().map(|d| format!("{}.{d}", self.label))
    }

    pub fn cnames(&self) -> &[String] {
        &self.cnames
    }

    pub fn add_cname(&mut self, cname: impl Into<String>) {
        let cname = cname.into();
        if !self.cnames.contains(&cname) {
            self.cnames.push(cname);
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidEmail`] for a malformed address.
    pub fn set_email(&mut self, email: &str) -> Result<()> {
        crate::validators::validate_email(email).map_err(|_| Error::InvalidEmail {
            machine: self.label.clone(),
            value: email.to_string(),
        })?;
        self.email = Some(email.to_string());
        Ok(())
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn set_throttled(&mut self, throttled: bool) {
        self.throttled = throttled;
    }

    /// # Errors
    ///
    /// Returns [`Error::DuplicateInterface`] if an interface with the same
    /// name is already declared.
    pub fn add_interface(&mut self, iface: NetworkInterface) -> Result<()> {
        if self.interfaces.iter().any(|i| i.name() == iface.name()) {
            return Err(Error::DuplicateInterface {
                machine: self.label.clone(),
                iface: iface.name().to_string(),
            });
        }
        self.interfaces.push(iface);
        Ok(())
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn add_profile(&mut self, profile: impl Into<String>) {
        let profile = profile.into();
        if !self.profiles.contains(&profile) {
            self.profiles.push(profile);
        }
    }

    pub fn admins(&self) -> &[String] {
        &self.admins
    }

    /// # Errors
    ///
    /// Returns [`Error::DuplicateAdmin`] if the admin is already listed.
    pub fn add_admin(&mut self, admin: &str) -> Result<()> {
        if self.admins.iter().any(|a| a == admin) {
            return Err(Error::DuplicateAdmin {
                machine: self.label.clone(),
                admin: admin.to_string(),
            });
        }
        self.admins.push(admin.to_string());
        Ok(())
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidPort`] outside `0..=65535`.
    pub fn set_ssh_port(&mut self, port: i64) -> Result<()> {
        self.ssh_port = TrafficRule::validate_port(port)?;
        Ok(())
    }

    pub fn external_ips(&self) -> &[Ipv4Addr] {
        &self.external_ips
    }

    pub fn add_external_ip(&mut self, ip: Ipv4Addr) {
        if !self.external_ips.contains(&ip) {
            self.external_ips.push(ip);
        }
    }

    pub fn disks(&self) -> &BTreeMap<String, Disk> {
        &self.disks
    }

    pub fn add_disk(&mut self, disk: Disk) {
        self.disks.insert(disk.name.clone(), disk);
    }

    pub fn ram_mib(&self) -> Option<u64> {
        self.ram_mib
    }

    pub fn set_ram_mib(&mut self, ram_mib: u64) {
        self.ram_mib = Some(ram_mib);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Traffic rule mutator
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn add_rule(&mut self, rule: TrafficRule) {
        self.traffic_rules.insert(rule);
    }

    /// Accept `ports` on this machine from anywhere.
    pub fn add_listen(
        &mut self,
        encapsulation: Encapsulation,
        ports: impl IntoIterator<Item = i64>,
    ) -> Result<()> {
        let label = self.label.clone();
        self.push_rule(Table::Ingress, encapsulation, ANYWHERE, &label, ports)
    }

    /// Accept `ports` on this machine from `source` (machine label,
    /// hostname, address or `*`).
    pub fn add_ingress(
        &mut self,
        source: &str,
        encapsulation: Encapsulation,
        ports: impl IntoIterator<Item = i64>,
    ) -> Result<()> {
        let label = self.label.clone();
        self.push_rule(Table::Ingress, encapsulation, source, &label, ports)
    }

    /// Allow this machine to reach `destination` on the internet.
    pub fn add_egress(
        &mut self,
        destination: &str,
        encapsulation: Encapsulation,
        ports: impl IntoIterator<Item = i64>,
    ) -> Result<()> {
        let label = self.label.clone();
        self.push_rule(Table::Egress, encapsulation, &label, destination, ports)
    }

    /// Allow this machine to reach machine `destination` inside the network.
    pub fn add_forward(
        &mut self,
        destination: &str,
        encapsulation: Encapsulation,
        ports: impl IntoIterator<Item = i64>,
    ) -> Result<()> {
        let label = self.label.clone();
        self.push_rule(Table::Forward, encapsulation, &label, destination, ports)
    }

    /// Redirect traffic addressed to machine `destination` to this machine.
    pub fn add_dnat(
        &mut self,
        destination: &str,
        encapsulation: Encapsulation,
        ports: impl IntoIterator<Item = i64>,
    ) -> Result<()> {
        let label = self.label.clone();
        self.push_rule(Table::Dnat, encapsulation, &label, destination, ports)
    }

    fn push_rule(
        &mut self,
        table: Table,
        encapsulation: Encapsulation,
        source: &str,
        destination: &str,
        ports: impl IntoIterator<Item = i64>,
    ) -> Result<()> {
        let rule = TrafficRule::builder()
            .table(table)
            .encapsulation(encapsulation)
            .source(source)
            .destination(destination)
            .ports(ports)?
            .build()?;
        self.traffic_rules.insert(rule);
        Ok(())
    }

    /// Ports this machine accepts from anywhere for `encapsulation`
    pub fn listen_ports(&self, encapsulation: Encapsulation) -> BTreeSet<u16> {
        self.rules_in(Table::Ingress)
            .filter(|r| r.is_from_anywhere() && r.encapsulation() == encapsulation)
            .flat_map(|r| r.ports().iter().copied())
            .filter(|p| *p != 0)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Initialisation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Second construction pass, run once every machine exists.
    ///
    /// Interfaces without a netmask receive `default_netmask`. Services get a
    /// generated LAN interface when they declare none, plus default `boot` and
    /// `data` disks and memory.
    pub fn init(&mut self, default_netmask: Ipv4Addr) -> Result<()> {
        for iface in &mut self.interfaces {
            iface.set_default_netmask(default_netmask);
        }

        if let MachineKind::Service { .. } = self.kind {
            if self.interfaces.is_empty() {
                let iface = NetworkInterface::new("eth0", Direction::Lan, Inet::Static)?
                    .with_mac(generated_mac(&self.label, "eth0"))
                    .with_comment("generated");
                self.interfaces.push(iface);
            }

            let label = self.label.clone();
            self.disks.entry("boot".to_string()).or_insert_with(|| {
                Disk::new("boot", 8 * 1024, format!("/disks/boot/{label}/boot.vmdk"))
            });
            self.disks.entry("data".to_string()).or_insert_with(|| {
                Disk::new("data", 20 * 1024, format!("/disks/data/{label}/data.vmdk"))
            });
            self.ram_mib.get_or_insert(DEFAULT_SERVICE_RAM_MIB);
        }

        Ok(())
    }
}

impl HasInterfaces for Machine {
    fn interfaces(&self) -> &[NetworkInterface] {
        &self.interfaces
    }
}

impl HasTrafficRules for Machine {
    fn traffic_rules(&self) -> &BTreeSet<TrafficRule> {
        &self.traffic_rules
    }
}

impl HostedOnHypervisor for Machine {
    fn hypervisor(&self) -> Option<&str> {
        match &self.kind {
            MachineKind::Service { hypervisor } => Some(hypervisor),
            _ => None,
        }
    }
}

/// Deterministic MAC for a generated interface.
///
/// # Examples
///
/// ```
/// use drnet::core::machine::generated_mac;
///
/// let mac = generated_mac("web1", "eth0");
/// assert!(mac.starts_with("08:00:27:"));
/// assert_eq!(mac, generated_mac("web1", "eth0"));
/// ```
pub fn generated_mac(label: &str, iface: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(label.as_bytes());
    hasher.update(iface.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let hex = format!("{GENERATED_MAC_PREFIX}{}", &digest[..6]);
    (0..6)
        .map(|i| &hex[i * 2..i * 2 + 2])
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(list: &[MachineType]) -> BTreeSet<MachineType> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_classify_precedence() {
        let kind = MachineKind::classify(
            "gw",
            &types(&[MachineType::Router, MachineType::Hypervisor]),
            None,
        )
        .unwrap();
        assert_eq!(kind, MachineKind::Router);

        let kind = MachineKind::classify("laptop", &types(&[MachineType::User]), None).unwrap();
        assert_eq!(kind, MachineKind::Device(DeviceKind::User));

        let kind = MachineKind::classify("x", &BTreeSet::new(), None).unwrap();
        assert_eq!(kind, MachineKind::Server);
    }

    #[test]
    fn test_service_requires_hypervisor() {
        let err =
            MachineKind::classify("web1", &types(&[MachineType::Service]), None).unwrap_err();
        assert!(matches!(err, Error::InvalidHypervisor { .. }));

        let kind =
            MachineKind::classify("web1", &types(&[MachineType::Service]), Some("hv1")).unwrap();
        assert_eq!(
            kind,
            MachineKind::Service {
                hypervisor: "hv1".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_type_string() {
        assert!("mainframe".parse::<MachineType>().is_err());
        assert_eq!(
            "internal_only".parse::<MachineType>().unwrap(),
            MachineType::InternalOnly
        );
    }

    #[test]
    fn test_duplicate_interface() {
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        let eth0 = NetworkInterface::new("eth0", Direction::Lan, Inet::Static).unwrap();
        m.add_interface(eth0.clone()).unwrap();
        assert!(matches!(
            m.add_interface(eth0),
            Err(Error::DuplicateInterface { .. })
        ));
    }

    #[test]
    fn test_duplicate_admin() {
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        m.add_admin("alice").unwrap();
        assert!(matches!(
            m.add_admin("alice"),
            Err(Error::DuplicateAdmin { .. })
        ));
    }

    #[test]
    fn test_invalid_email() {
        let mut m = Machine::new("alice", MachineKind::Device(DeviceKind::User)).unwrap();
        assert!(matches!(
            m.set_email("alice-at-example"),
            Err(Error::InvalidEmail { .. })
        ));
        m.set_email("alice@example.org").unwrap();
        assert_eq!(m.email(), Some("alice@example.org"));
    }

    #[test]
    fn test_listen_adds_ingress_from_anywhere() {
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        m.add_listen(Encapsulation::Tcp, [443, 80]).unwrap();
        m.add_listen(Encapsulation::Udp, [53]).unwrap();
        assert_eq!(
            m.listen_ports(Encapsulation::Tcp).into_iter().collect::<Vec<_>>(),
            vec![80, 443]
        );
        let rule = m.rules_in(Table::Ingress).next().unwrap();
        assert!(rule.is_from_anywhere());
        assert!(rule.destinations().contains("web1"));
    }

    #[test]
    fn test_mutator_rejects_bad_port() {
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        assert!(matches!(
            m.add_egress("api.example.com", Encapsulation::Tcp, [70000]),
            Err(Error::InvalidPort { port: 70000 })
        ));
        assert!(m.traffic_rules().is_empty());
    }

    #[test]
    fn test_service_init_defaults() {
        let mut m = Machine::new(
            "web1",
            MachineKind::Service {
                hypervisor: "hv1".to_string(),
            },
        )
        .unwrap();
        m.init("255.255.255.252".parse().unwrap()).unwrap();

        let eth0 = m.interface("eth0").unwrap();
        assert_eq!(eth0.mac(), Some(generated_mac("web1", "eth0").as_str()));
        assert_eq!(m.disks()["boot"].size_mib, 8192);
        assert_eq!(m.disks()["data"].path, "/disks/data/web1/data.vmdk");
        assert_eq!(m.disks()["boot"].directory(), "/disks/boot/web1");
        assert_eq!(m.ram_mib(), Some(DEFAULT_SERVICE_RAM_MIB));
        assert_eq!(m.hypervisor(), Some("hv1"));
    }

    #[test]
    fn test_subnets_skip_wan() {
        let mut m = Machine::new("gw", MachineKind::Router).unwrap();
        m.add_interface(
            NetworkInterface::new("wan0", Direction::Wan, Inet::Dhcp)
                .unwrap()
                .with_address("203.0.113.9".parse().unwrap())
                .with_netmask("255.255.255.0".parse().unwrap()),
        )
        .unwrap();
        m.add_interface(
            NetworkInterface::new("lan0", Direction::Lan, Inet::Static)
                .unwrap()
                .with_address("10.0.0.1".parse().unwrap())
                .with_netmask("255.255.255.0".parse().unwrap()),
        )
        .unwrap();
        let subnets = m.subnets();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].to_string(), "10.0.0.0/24");
        assert_eq!(m.wan_interfaces().len(), 1);
    }
}
