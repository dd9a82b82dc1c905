//! The network graph and its two phases
//!
//! A [`NetworkGraph`] is the mutable phase: machines are constructed from
//! their records, initialised, and handed to profiles so they can declare
//! firewall intents. [`NetworkGraph::freeze`] turns it into a [`FrozenGraph`],
//! which is immutable. Firewall resolution and unit collection only accept a
//! `FrozenGraph`, so no traffic rule can appear after routers have been
//! resolved.

use crate::core::data::{InterfaceData, MachineData, NetworkData};
use crate::core::error::{Error, Result};
use crate::core::interface::{Direction, Inet, NetworkInterface};
use crate::core::machine::{Disk, HostedOnHypervisor, Machine, MachineKind, MachineType};
use crate::core::profiles::ProfileRegistry;
use crate::core::resolver::AUTO_GUEST;
use crate::core::traffic::{Encapsulation, TrafficRule};
use crate::utils::to_identifier;
use crate::validators;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Network-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub label: String,
    pub domain: Option<String>,
    pub admin_email: Option<String>,
    pub debug: bool,
    pub auto_guest: bool,
    pub netmask: Ipv4Addr,
}

impl NetworkSettings {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            domain: None,
            admin_email: None,
            debug: false,
            auto_guest: false,
            netmask: Ipv4Addr::new(255, 255, 255, 252),
        }
    }
}

/// Mutable construction phase of a network
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    settings: NetworkSettings,
    machines: BTreeMap<String, Machine>,
    initialised: bool,
}

impl NetworkGraph {
    pub fn new(settings: NetworkSettings) -> Self {
        Self {
            settings,
            machines: BTreeMap::new(),
            initialised: false,
        }
    }

    /// Constructs every machine from its record (first pass).
    ///
    /// Nothing that depends on other machines is computed here; see
    /// [`NetworkGraph::init`].
    ///
    /// # Errors
    ///
    /// Returns the first data error found: invalid ports, addresses, emails,
    /// MACs, duplicate interfaces or admins, unknown machine types.
    pub fn from_data(data: &NetworkData) -> Result<Self> {
        let network = &data.label;
        let netmask =
            validators::parse_ipv4(&data.netmask).map_err(|_| Error::InvalidIpAddress {
                machine: network.clone(),
                value: data.netmask.clone(),
            })?;
        ipnetwork::ipv4_mask_to_prefix(netmask).map_err(|_| Error::InvalidIpAddress {
            machine: network.clone(),
            value: data.netmask.clone(),
        })?;

        if let Some(email) = &data.admin_email {
            validators::validate_email(email).map_err(|_| Error::InvalidEmail {
                machine: network.clone(),
                value: email.clone(),
            })?;
        }

        let settings = NetworkSettings {
            label: data.label.clone(),
            domain: data.domain.clone(),
            admin_email: data.admin_email.clone(),
            debug: data.debug,
            auto_guest: data.auto_guest,
            netmask,
        };

        let mut graph = Self::new(settings);
        for (label, record) in &data.machines {
            let machine = machine_from_data(label, record, &graph.settings)?;
            graph.add_machine(machine)?;
        }

        info!(
            "Built network {} with {} machines",
            graph.settings.label,
            graph.machines.len()
        );
        Ok(graph)
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a machine with that label exists, or
    /// if the label names the same firewall chains and sets as another one
    /// (`web-1` and `web_1`, `Web1` and `web1`).
    pub fn add_machine(&mut self, machine: Machine) -> Result<()> {
        let label = machine.label();
        if self.machines.contains_key(label) {
            return Err(Error::validation(
                "label",
                format!("machine '{label}' is declared twice"),
            ));
        }
        let id = to_identifier(label);
        if id == AUTO_GUEST {
            return Err(Error::validation(
                "label",
                format!("'{label}' is reserved for the automatic guest pool"),
            ));
        }
        if let Some(other) = self.machines.keys().find(|l| to_identifier(l) == id) {
            return Err(Error::validation(
                "label",
                format!("machines '{other}' and '{label}' would share the firewall name '{id}'"),
            ));
        }
        self.machines.insert(machine.label().to_string(), machine);
        self.initialised = false;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] if no machine has `label`.
    pub fn machine(&self, label: &str) -> Result<&Machine> {
        self.machines.get(label).ok_or_else(|| Error::UnknownMachine {
            label: label.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] if no machine has `label`.
    pub fn machine_mut(&mut self, label: &str) -> Result<&mut Machine> {
        self.machines
            .get_mut(label)
            .ok_or_else(|| Error::UnknownMachine {
                label: label.to_string(),
            })
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// Second pass: initialises every machine now that all of them exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHypervisor`] for a service whose hypervisor
    /// is missing or is not a hypervisor.
    pub fn init(&mut self) -> Result<()> {
        let hypervisors: BTreeSet<String> = self
            .machines
            .values()
            .filter(|m| m.is(MachineType::Hypervisor))
            .map(|m| m.label().to_string())
            .collect();

        for machine in self.machines.values_mut() {
            if let Some(hypervisor) = machine.hypervisor()
                && !hypervisors.contains(hypervisor)
            {
                return Err(Error::InvalidHypervisor {
                    service: machine.label().to_string(),
                    hypervisor: hypervisor.to_string(),
                });
            }
            machine.init(self.settings.netmask)?;
        }

        self.initialised = true;
        debug!("Initialised {} machines", self.machines.len());
        Ok(())
    }

    /// Lets every profile of every machine declare its traffic rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProfile`] for a profile name the registry does
    /// not know, or whatever the profile itself reports.
    pub fn apply_profiles(&mut self, registry: &ProfileRegistry) -> Result<()> {
        for machine in self.machines.values_mut() {
            for profile in registry.profiles_for(machine)? {
                profile.declare_firewall(machine)?;
            }
        }
        Ok(())
    }

    /// Ends the mutable phase, initialising first if that has not happened.
    pub fn freeze(mut self) -> Result<FrozenGraph> {
        if !self.initialised {
            self.init()?;
        }
        info!("Network {} frozen", self.settings.label);
        Ok(FrozenGraph {
            settings: self.settings,
            machines: self.machines,
        })
    }
}

/// Immutable view of a fully built network
#[derive(Debug, Clone)]
pub struct FrozenGraph {
    settings: NetworkSettings,
    machines: BTreeMap<String, Machine>,
}

impl FrozenGraph {
    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] if no machine has `label`.
    pub fn machine(&self, label: &str) -> Result<&Machine> {
        self.machines.get(label).ok_or_else(|| Error::UnknownMachine {
            label: label.to_string(),
        })
    }

    pub fn get(&self, label: &str) -> Option<&Machine> {
        self.machines.get(label)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn routers(&self) -> impl Iterator<Item = &Machine> {
        self.machines().filter(|m| m.is_router())
    }

    /// Servers, hypervisors and services, routers excluded
    pub fn servers(&self) -> impl Iterator<Item = &Machine> {
        self.machines()
            .filter(|m| m.kind().is_server() && !m.is_router())
    }

    pub fn devices(&self) -> impl Iterator<Item = &Machine> {
        self.machines().filter(|m| m.kind().is_device())
    }

    pub fn user_devices(&self) -> impl Iterator<Item = &Machine> {
        self.machines().filter(|m| m.kind().is_user_device())
    }

    pub fn hosted_services<'a>(&'a self, hypervisor: &'a str) -> impl Iterator<Item = &'a Machine> {
        self.machines()
            .filter(move |m| m.hypervisor() == Some(hypervisor))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Record conversion
// ═══════════════════════════════════════════════════════════════════════════

fn machine_from_data(label: &str, record: &MachineData, settings: &NetworkSettings) -> Result<Machine> {
    let mut types = BTreeSet::new();
    for value in &record.types {
        let machine_type =
            value
                .parse::<MachineType>()
                .map_err(|_| Error::InvalidMachineType {
                    machine: label.to_string(),
                    value: value.clone(),
                })?;
        types.insert(machine_type);
    }

    let kind = MachineKind::classify(label, &types, record.hypervisor.as_deref())?;
    let mut machine = Machine::new(label, kind)?;
    for machine_type in types {
        machine.add_type(machine_type);
    }

    if let Some(domain) = record.domain.as_ref().or(settings.domain.as_ref()) {
        machine.set_domain(domain.clone());
    }
    for cname in &record.cnames {
        machine.add_cname(cname.clone());
    }
    if let Some(email) = &record.email {
        machine.set_email(email)?;
    }

    for iface in &record.network_interfaces.wan {
        machine.add_interface(interface_from_data(label, iface, Direction::Wan)?)?;
    }
    for iface in &record.network_interfaces.lan {
        machine.add_interface(interface_from_data(label, iface, Direction::Lan)?)?;
    }

    let firewall = &record.firewall;
    // An empty port list would mean any port
    if !firewall.listen.tcp.is_empty() {
        machine.add_listen(Encapsulation::Tcp, firewall.listen.tcp.iter().copied())?;
    }
    if !firewall.listen.udp.is_empty() {
        machine.add_listen(Encapsulation::Udp, firewall.listen.udp.iter().copied())?;
    }
    for entry in &firewall.allow_ingress_from {
        let (source, ports) = parse_target(entry)?;
        machine.add_ingress(&source, Encapsulation::Tcp, ports)?;
    }
    for entry in &firewall.allow_egress_to {
        let (destination, ports) = parse_target(entry)?;
        machine.add_egress(&destination, Encapsulation::Tcp, ports)?;
    }
    for entry in &firewall.allow_forward_to {
        let (destination, ports) = parse_target(entry)?;
        machine.add_forward(&destination, Encapsulation::Tcp, ports)?;
    }
    for entry in &firewall.dnat_to {
        let (destination, ports) = parse_target(entry)?;
        machine.add_dnat(&destination, Encapsulation::Tcp, ports)?;
    }
    if let Some(ip) = &firewall.external_ip {
        machine.add_external_ip(parse_ip(label, ip)?);
    }
    machine.set_throttled(firewall.throttle);

    for profile in &record.profiles {
        machine.add_profile(profile.clone());
    }
    for admin in &record.admins {
        machine.add_admin(admin)?;
    }
    if let Some(port) = record.ssh_port {
        machine.set_ssh_port(port)?;
    }

    if let Some(ram) = record.ram {
        machine.set_ram_mib(ram);
    }
    for (name, disk) in &record.disks {
        let path = disk
            .path
            .clone()
            .unwrap_or_else(|| format!("/disks/{name}/{label}/{name}.vmdk"));
        let mut d = Disk::new(name.clone(), disk.size, path);
        d.comment.clone_from(&disk.comment);
        machine.add_disk(d);
    }

    Ok(machine)
}

fn interface_from_data(
    machine: &str,
    record: &InterfaceData,
    direction: Direction,
) -> Result<NetworkInterface> {
    let inet = match &record.inet {
        Some(value) => value.parse::<Inet>().map_err(|_| {
            Error::validation(
                "inet",
                format!("{machine}: unknown inet '{value}' on {}", record.iface),
            )
        })?,
        None if direction == Direction::Wan => Inet::Dhcp,
        None => Inet::Static,
    };

    let mut iface = NetworkInterface::new(&record.iface, direction, inet)?;

    if let Some(mac) = &record.mac {
        let mac = validators::validate_mac(mac).map_err(|_| Error::InvalidMac {
            machine: machine.to_string(),
            value: mac.clone(),
        })?;
        iface = iface.with_mac(mac);
    }
    for address in record.address.iter().chain(&record.addresses) {
        iface = iface.with_address(parse_ip(machine, address)?);
    }
    if let Some(subnet) = &record.subnet {
        iface = iface.with_subnet(parse_ip(machine, subnet)?);
    }
    if let Some(netmask) = &record.netmask {
        let mask = parse_ip(machine, netmask)?;
        ipnetwork::ipv4_mask_to_prefix(mask).map_err(|_| Error::InvalidIpAddress {
            machine: machine.to_string(),
            value: netmask.clone(),
        })?;
        iface = iface.with_netmask(mask);
    }
    if let Some(broadcast) = &record.broadcast {
        iface = iface.with_broadcast(parse_ip(machine, broadcast)?);
    }
    if let Some(gateway) = &record.gateway {
        iface = iface.with_gateway(parse_ip(machine, gateway)?);
    }
    if let Some(comment) = &record.comment {
        iface = iface.with_comment(comment.clone());
    }

    Ok(iface)
}

fn parse_ip(machine: &str, value: &str) -> Result<Ipv4Addr> {
    validators::parse_ipv4(value).map_err(|_| Error::InvalidIpAddress {
        machine: machine.to_string(),
        value: value.to_string(),
    })
}

/// Splits `host[:port[,port...]]`.
fn parse_target(entry: &str) -> Result<(String, Vec<i64>)> {
    let Some((host, ports)) = entry.split_once(':') else {
        return Ok((entry.trim().to_string(), Vec::new()));
    };

    let mut parsed = Vec::new();
    for port in ports.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: i64 = port
            .parse()
            .map_err(|_| Error::validation("port", format!("'{port}' in '{entry}' is not a number")))?;
        parsed.push(i64::from(TrafficRule::validate_port(port)?));
    }
    Ok((host.trim().to_string(), parsed))
}
