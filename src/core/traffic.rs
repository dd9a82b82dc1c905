//! Declarative traffic intents
//!
//! A [`TrafficRule`] says "this kind of traffic from here to there should be
//! allowed" without saying how. The resolver in [`crate::core::resolver`]
//! turns the rules of every machine into concrete firewall chains.
//!
//! Rules are plain values: two rules with the same fields are the same rule,
//! and a machine stores them in a set.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Source or destination meaning "any address"
pub const ANYWHERE: &str = "*";

/// Destination that is never narrowed by an address set
pub const BROADCAST: &str = "255.255.255.255";

/// Transport protocol of a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
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
#[serde(rename_all = "lowercase")]
pub enum Encapsulation {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Encapsulation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Encapsulation::Tcp => "tcp",
            Encapsulation::Udp => "udp",
        }
    }
}

/// Which part of the firewall a rule is resolved into
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
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// Traffic arriving at the rule's destination machine
    #[strum(serialize = "ingress")]
    Ingress,
    /// Traffic leaving the rule's source machine
    #[strum(serialize = "egress")]
    Egress,
    /// Machine-to-machine traffic inside the network
    #[strum(serialize = "forward")]
    Forward,
    /// Destination NAT towards the rule's source machine
    #[strum(serialize = "dnat")]
    Dnat,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrafficRule {
    table: Table,
    encapsulation: Encapsulation,
    source: String,
    destinations: BTreeSet<String>,
    ports: BTreeSet<u16>,
}

impl TrafficRule {
    pub fn builder() -> TrafficRuleBuilder {
        TrafficRuleBuilder::default()
    }

    /// Checks that a port fits in `0..=65535`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPort`] otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use drnet::core::traffic::TrafficRule;
    ///
    /// assert_eq!(TrafficRule::validate_port(0).unwrap(), 0);
    /// assert_eq!(TrafficRule::validate_port(65535).unwrap(), 65535);
    /// assert!(TrafficRule::validate_port(-1).is_err());
    /// assert!(TrafficRule::validate_port(65536).is_err());
    /// ```
    pub fn validate_port(port: i64) -> Result<u16> {
        u16::try_from(port).map_err(|_| Error::InvalidPort { port })
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn encapsulation(&self) -> Encapsulation {
        self.encapsulation
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destinations(&self) -> &BTreeSet<String> {
        &self.destinations
    }

    pub fn ports(&self) -> &BTreeSet<u16> {
        &self.ports
    }

    /// `true` when no port narrows the rule (no ports, or port 0)
    pub fn is_any_port(&self) -> bool {
        self.ports.is_empty() || self.ports.contains(&0)
    }

    pub fn is_from_anywhere(&self) -> bool {
        self.source == ANYWHERE
    }
}

/// Builder for [`TrafficRule`]
///
/// The table is required; everything else has a default (TCP, from anywhere,
/// no destinations, any port).
#[derive(Debug, Clone, Default)]
pub struct TrafficRuleBuilder {
    table: Option<Table>,
    encapsulation: Encapsulation,
    source: Option<String>,
    destinations: BTreeSet<String>,
    ports: BTreeSet<u16>,
}

impl TrafficRuleBuilder {
    pub fn table(mut self, table: Table) -> Self {
        self.table = Some(table);
        self
    }

    pub fn encapsulation(mut self, encapsulation: Encapsulation) -> Self {
        self.encapsulation = encapsulation;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destinations.insert(destination.into());
        self
    }

    pub fn destinations<S: Into<String>>(mut self, destinations: impl IntoIterator<Item = S>) -> Self {
        self.destinations
            .extend(destinations.into_iter().map(Into::into));
        self
    }

    /// Adds ports, validating each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPort`] on the first port outside `0..=65535`.
    pub fn ports(mut self, ports: impl IntoIterator<Item = i64>) -> Result<Self> {
        for port in ports {
            self.ports.insert(TrafficRule::validate_port(port)?);
        }
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::MissingTable`] if no table was chosen.
    pub fn build(self) -> Result<TrafficRule> {
        let source = self.source.unwrap_or_else(|| ANYWHERE.to_string());
        let table = self.table.ok_or_else(|| Error::MissingTable {
            source_label: source.clone(),
        })?;
        Ok(TrafficRule {
            table,
            encapsulation: self.encapsulation,
            source,
            destinations: self.destinations,
            ports: self.ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_boundaries() {
        assert!(TrafficRule::builder().ports([0, 65535]).is_ok());
        assert!(matches!(
            TrafficRule::builder().ports([-1]),
            Err(Error::InvalidPort { port: -1 })
        ));
        assert!(matches!(
            TrafficRule::builder().ports([65536]),
            Err(Error::InvalidPort { port: 65536 })
        ));
    }

    #[test]
    fn test_missing_table_is_error() {
        let err = TrafficRule::builder().source("web1").build().unwrap_err();
        assert!(matches!(err, Error::MissingTable { ref source_label } if source_label == "web1"));
    }

    #[test]
    fn test_defaults() {
        let rule = TrafficRule::builder().table(Table::Ingress).build().unwrap();
        assert_eq!(rule.encapsulation(), Encapsulation::Tcp);
        assert!(rule.is_from_anywhere());
        assert!(rule.is_any_port());
        assert!(rule.destinations().is_empty());
    }

    #[test]
    fn test_port_zero_means_any() {
        let rule = TrafficRule::builder()
            .table(Table::Egress)
            .ports([0, 443])
            .unwrap()
            .build()
            .unwrap();
        assert!(rule.is_any_port());
    }

    #[test]
    fn test_rules_compare_by_value() {
        let make = || {
            TrafficRule::builder()
                .table(Table::Forward)
                .source("web1")
                .destination("db1")
                .ports([5432])
                .unwrap()
                .build()
                .unwrap()
        };
        let mut set = BTreeSet::new();
        set.insert(make());
        set.insert(make());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!("udp".parse::<Encapsulation>().unwrap(), Encapsulation::Udp);
        assert_eq!(Table::Dnat.to_string(), "dnat");
        assert!("sideways".parse::<Table>().is_err());
    }
}
