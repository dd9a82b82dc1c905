//! Network interface model
//!
//! Each machine owns a list of [`NetworkInterface`]s. The interface direction
//! decides how the firewall treats it: WAN interfaces face the internet (jump
//! targets for ingress/egress chains, masquerade on routers), LAN interfaces
//! carry the machine's internal subnet.

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    #[strum(serialize = "lan")]
    Lan,
    #[strum(serialize = "wan")]
    Wan,
    /// Neither side (bond slaves, dummies)
    #[strum(serialize = "none")]
    None,
}

/// Address configuration method, as written to `/etc/network/interfaces`
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Inet {
    #[strum(serialize = "manual")]
    Manual,
    #[default]
    #[strum(serialize = "static")]
    Static,
    #[strum(serialize = "dhcp")]
    Dhcp,
    #[strum(serialize = "macvlan")]
    Macvlan,
    #[strum(serialize = "bond")]
    Bond,
    #[strum(serialize = "ppp")]
    Ppp,
    #[strum(serialize = "dummy")]
    Dummy,
    #[strum(serialize = "wireguard")]
    Wireguard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    name: String,
    direction: Direction,
    inet: Inet,
    mac: Option<String>,
    addresses: Vec<Ipv4Addr>,
    subnet: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
    broadcast: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    comment: Option<String>,
}

impl NetworkInterface {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `name` is not a valid kernel
    /// interface name.
    pub fn new(name: &str, direction: Direction, inet: Inet) -> Result<Self> {
        let name = crate::validators::validate_interface(name)
            .map_err(|e| Error::validation("interface", e))?;
        Ok(Self {
            name,
            direction,
            inet,
            mac: None,
            addresses: Vec::new(),
            subnet: None,
            netmask: None,
            broadcast: None,
            gateway: None,
            comment: None,
        })
    }

    /// Sets the MAC address. Callers validate it first (see
    /// [`crate::validators::validate_mac`]).
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
        self
    }

    pub fn with_subnet(mut self, subnet: Ipv4Addr) -> Self {
        self.subnet = Some(subnet);
        self
    }

    pub fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = Some(netmask);
        self
    }

    pub fn with_broadcast(mut self, broadcast: Ipv4Addr) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn inet(&self) -> Inet {
        self.inet
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    pub fn subnet(&self) -> Option<Ipv4Addr> {
        self.subnet
    }

    pub fn netmask(&self) -> Option<Ipv4Addr> {
        self.netmask
    }

    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        self.broadcast
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn is_wan(&self) -> bool {
        self.direction == Direction::Wan
    }

    /// Fills in the netmask if the record did not declare one.
    pub fn set_default_netmask(&mut self, netmask: Ipv4Addr) {
        if self.netmask.is_none() {
            self.netmask = Some(netmask);
        }
    }

    /// The network this interface sits on, normalized to its base address.
    ///
    /// Taken from `subnet`, or from the first address when no subnet is
    /// declared. `None` without a netmask or without any address.
    ///
    /// # Examples
    ///
    /// ```
    /// use drnet::core::interface::{Direction, Inet, NetworkInterface};
    ///
    /// let iface = NetworkInterface::new("eth0", Direction::Lan, Inet::Static)
    ///     .unwrap()
    ///     .with_address("10.0.1.6".parse().unwrap())
    ///     .with_netmask("255.255.255.252".parse().unwrap());
    /// assert_eq!(iface.network().unwrap().to_string(), "10.0.1.4/30");
    /// ```
    pub fn network(&self) -> Option<Ipv4Network> {
        let base = self.subnet.or_else(|| self.addresses.first().copied())?;
        let prefix = ipnetwork::ipv4_mask_to_prefix(self.netmask?).ok()?;
        let network = Ipv4Network::new(base, prefix).ok()?;
        Ipv4Network::new(network.network(), prefix).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lan(name: &str) -> NetworkInterface {
        NetworkInterface::new(name, Direction::Lan, Inet::Static).unwrap()
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(NetworkInterface::new("eth0 rm -rf", Direction::Lan, Inet::Static).is_err());
        assert!(NetworkInterface::new("", Direction::Wan, Inet::Dhcp).is_err());
    }

    #[test]
    fn test_network_from_subnet() {
        let iface = lan("eth0")
            .with_subnet("10.0.2.0".parse().unwrap())
            .with_netmask("255.255.255.0".parse().unwrap());
        assert_eq!(iface.network().unwrap().to_string(), "10.0.2.0/24");
    }

    #[test]
    fn test_network_requires_netmask() {
        let iface = lan("eth0").with_address("10.0.2.9".parse().unwrap());
        assert!(iface.network().is_none());
    }

    #[test]
    fn test_network_requires_address() {
        let iface = lan("eth0").with_netmask("255.255.255.0".parse().unwrap());
        assert!(iface.network().is_none());
    }

    #[test]
    fn test_non_contiguous_netmask_yields_none() {
        let iface = lan("eth0")
            .with_address("10.0.2.9".parse().unwrap())
            .with_netmask("255.0.255.0".parse().unwrap());
        assert!(iface.network().is_none());
    }

    #[test]
    fn test_default_netmask_does_not_override() {
        let mut iface = lan("eth0").with_netmask("255.255.255.0".parse().unwrap());
        iface.set_default_netmask("255.255.255.252".parse().unwrap());
        assert_eq!(iface.netmask(), Some("255.255.255.0".parse().unwrap()));
    }

    #[test]
    fn test_addresses_deduplicated() {
        let ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let iface = lan("eth0").with_address(ip).with_address(ip);
        assert_eq!(iface.addresses().len(), 1);
    }

    #[test]
    fn test_inet_strings() {
        assert_eq!("wireguard".parse::<Inet>().unwrap(), Inet::Wireguard);
        assert_eq!(Direction::Wan.to_string(), "wan");
    }
}
