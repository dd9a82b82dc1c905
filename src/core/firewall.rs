//! Firewall data structures and iptables/ipset code generation
//!
//! This module holds the concrete firewall a router ends up with: netfilter
//! tables of chains of rules, plus the address sets those rules match
//! against. It knows nothing about machines; [`crate::core::resolver`] fills
//! it in.
//!
//! # Rule order
//!
//! Chains are stored bottom-up. The first stored rule is the chain's final
//! verdict and is rendered last; each rule added afterwards is evaluated
//! before it. That is what lets the resolver insert a chain's default `DROP`
//! at position 0 up front and still have every later allowance take effect,
//! and why a `LOG` inserted at position 1 fires right before the drop.
//!
//! # Example
//!
//! ```
//! use drnet::core::firewall::{Firewall, NetfilterTable};
//!
//! let mut fw = Firewall::new();
//! fw.add_chain(NetfilterTable::Filter, "web1_fwd");
//! fw.add_filter("web1_allow_https", "web1_fwd", "-p tcp --dport 443 -j ACCEPT", "https").unwrap();
//! fw.add_filter_at("web1_drop", "web1_fwd", 0, "-j DROP", "default drop").unwrap();
//!
//! let text = fw.to_restore_text();
//! let accept = text.find("--dport 443").unwrap();
//! let drop = text.find("-A web1_fwd -j DROP").unwrap();
//! assert!(accept < drop);
//! ```

use crate::core::error::{Error, Result};
use crate::validators::sanitize_label;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// Netfilter table a chain lives in
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
pub enum NetfilterTable {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
}

impl NetfilterTable {
    pub const fn as_str(self) -> &'static str {
        match self {
            NetfilterTable::Filter => "filter",
            NetfilterTable::Nat => "nat",
            NetfilterTable::Mangle => "mangle",
        }
    }

    /// Built-in chains and their policies
    const fn builtin_chains(self) -> &'static [(&'static str, &'static str)] {
        match self {
            NetfilterTable::Filter => &[("INPUT", "ACCEPT"), ("FORWARD", "DROP"), ("OUTPUT", "ACCEPT")],
            NetfilterTable::Nat => &[
                ("PREROUTING", "ACCEPT"),
                ("INPUT", "ACCEPT"),
                ("OUTPUT", "ACCEPT"),
                ("POSTROUTING", "ACCEPT"),
            ],
            NetfilterTable::Mangle => &[
                ("PREROUTING", "ACCEPT"),
                ("INPUT", "ACCEPT"),
                ("FORWARD", "ACCEPT"),
                ("OUTPUT", "ACCEPT"),
                ("POSTROUTING", "ACCEPT"),
            ],
        }
    }
}

/// One rule inside a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRule {
    /// Identifier of the rule's purpose, for debugging and export
    pub label: String,
    /// iptables match/target arguments, without `-A <chain>`
    pub rule: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    name: String,
    /// `None` for user-defined chains
    policy: Option<String>,
    rules: Vec<ChainRule>,
}

impl Chain {
    fn new(name: &str, policy: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            policy: policy.map(str::to_string),
            rules: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    /// Rules in storage order; the first is the chain's final verdict.
    pub fn rules(&self) -> &[ChainRule] {
        &self.rules
    }

    /// Rules in the order the kernel evaluates them
    pub fn evaluation_order(&self) -> impl Iterator<Item = &ChainRule> {
        self.rules.iter().rev()
    }

    pub fn contains_rule(&self, rule: &str) -> bool {
        self.rules.iter().any(|r| r.rule == rule)
    }

    /// Inserts at `position` (clamped to the chain length). An identical
    /// rule already present is not added again.
    fn insert(&mut self, position: Option<usize>, rule: ChainRule) {
        if self.contains_rule(&rule.rule) {
            return;
        }
        match position {
            Some(pos) => {
                let pos = pos.min(self.rules.len());
                self.rules.insert(pos, rule);
            }
            None => self.rules.push(rule),
        }
    }
}

/// A router's complete iptables configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firewall {
    tables: BTreeMap<NetfilterTable, Vec<Chain>>,
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall {
    /// Creates a firewall with only the built-in chains.
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for table in [NetfilterTable::Filter, NetfilterTable::Nat, NetfilterTable::Mangle] {
            let chains = table
                .builtin_chains()
                .iter()
                .map(|(name, policy)| Chain::new(name, Some(policy)))
                .collect();
            tables.insert(table, chains);
        }
        Self { tables }
    }

    /// Declares a user chain. Returns `false` if it already existed.
    pub fn add_chain(&mut self, table: NetfilterTable, name: &str) -> bool {
        let chains = self.tables.entry(table).or_default();
        if chains.iter().any(|c| c.name == name) {
            return false;
        }
        chains.push(Chain::new(name, None));
        true
    }

    pub fn chain(&self, table: NetfilterTable, name: &str) -> Option<&Chain> {
        self.tables.get(&table)?.iter().find(|c| c.name == name)
    }

    pub fn chains(&self, table: NetfilterTable) -> &[Chain] {
        self.tables.get(&table).map_or(&[], Vec::as_slice)
    }

    /// Adds a rule to `chain` in `table`.
    ///
    /// `position` follows the storage order described in the module docs;
    /// `None` appends, making the rule the first one evaluated so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the chain was never declared.
    pub fn add(
        &mut self,
        table: NetfilterTable,
        chain: &str,
        position: Option<usize>,
        label: &str,
        rule: &str,
        comment: &str,
    ) -> Result<()> {
        let target = self
            .tables
            .get_mut(&table)
            .and_then(|chains| chains.iter_mut().find(|c| c.name == chain))
            .ok_or_else(|| Error::Internal(format!("chain {chain} does not exist in {table}")))?;
        target.insert(
            position,
            ChainRule {
                label: label.to_string(),
                rule: rule.to_string(),
                comment: comment.to_string(),
            },
        );
        Ok(())
    }

    pub fn add_filter(&mut self, label: &str, chain: &str, rule: &str, comment: &str) -> Result<()> {
        self.add(NetfilterTable::Filter, chain, None, label, rule, comment)
    }

    pub fn add_filter_at(
        &mut self,
        label: &str,
        chain: &str,
        position: usize,
        rule: &str,
        comment: &str,
    ) -> Result<()> {
        self.add(NetfilterTable::Filter, chain, Some(position), label, rule, comment)
    }

    pub fn add_nat_prerouting(&mut self, label: &str, rule: &str, comment: &str) -> Result<()> {
        self.add(NetfilterTable::Nat, "PREROUTING", None, label, rule, comment)
    }

    pub fn add_nat_postrouting(&mut self, label: &str, rule: &str, comment: &str) -> Result<()> {
        self.add(NetfilterTable::Nat, "POSTROUTING", None, label, rule, comment)
    }

    pub fn add_mangle_forward(&mut self, label: &str, rule: &str, comment: &str) -> Result<()> {
        self.add(NetfilterTable::Mangle, "FORWARD", None, label, rule, comment)
    }

    /// Total number of rules across every table
    pub fn rule_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|chains| chains.iter())
            .map(|c| c.rules.len())
            .sum()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Rendering
    // ═══════════════════════════════════════════════════════════════════════════

    /// Renders the firewall as `iptables-restore` input.
    pub fn to_restore_text(&self) -> String {
        let mut out = String::new();
        for (table, chains) in &self.tables {
            let _ = writeln!(out, "*{}", table.as_str());
            for chain in chains {
                let _ = writeln!(
                    out,
                    ":{} {} [0:0]",
                    chain.name,
                    chain.policy.as_deref().unwrap_or("-")
                );
            }
            for chain in chains {
                for rule in chain.evaluation_order() {
                    let comment = sanitize_label(&rule.comment);
                    if comment.is_empty() {
                        let _ = writeln!(out, "-A {} {}", chain.name, rule.rule);
                    } else {
                        let _ = writeln!(
                            out,
                            "-A {} {} -m comment --comment \"{}\"",
                            chain.name, rule.rule, comment
                        );
                    }
                }
            }
            let _ = writeln!(out, "COMMIT");
        }
        out
    }

    /// JSON view of the firewall, for inspection and export.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Address sets
// ═══════════════════════════════════════════════════════════════════════════

/// One entry of an address set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetMember {
    Network(Ipv4Network),
    /// Hostname resolved when the set script runs
    Host(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSet {
    members: BTreeSet<SetMember>,
}

impl AddressSet {
    pub fn members(&self) -> &BTreeSet<SetMember> {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

/// Named `hash:net` sets referenced by `-m set --match-set`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSets {
    sets: BTreeMap<String, AddressSet>,
}

impl AddressSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a set (idempotent).
    pub fn add_set(&mut self, name: &str) {
        self.sets.entry(name.to_string()).or_default();
    }

    pub fn add_network(&mut self, name: &str, network: Ipv4Network) {
        self.sets
            .entry(name.to_string())
            .or_default()
            .members
            .insert(SetMember::Network(network));
    }

    pub fn add_host(&mut self, name: &str, host: &str) {
        self.sets
            .entry(name.to_string())
            .or_default()
            .members
            .insert(SetMember::Host(host.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&AddressSet> {
        self.sets.get(name)
    }

    /// `true` if the set is missing or has no members
    pub fn is_empty(&self, name: &str) -> bool {
        self.sets.get(name).is_none_or(AddressSet::is_empty)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    /// Renders a bash script that feeds every set to `ipset restore`.
    pub fn to_script(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "#!/bin/bash");
        let _ = writeln!(out, "{{");
        for (name, set) in &self.sets {
            let _ = writeln!(out, "\techo \"create {name} hash:net family inet\"");
            let _ = writeln!(out, "\techo \"flush {name}\"");
            for member in &set.members {
                match member {
                    SetMember::Network(net) => {
                        let _ = writeln!(out, "\techo \"add {name} {net}\"");
                    }
                    SetMember::Host(host) => {
                        let _ = writeln!(
                            out,
                            "\tfor ip in $(getent ahostsv4 {} | awk '{{ print $1 }}' | sort -u); do echo \"add {name} ${{ip}}/32\"; done",
                            crate::core::shell::single_quoted(host)
                        );
                    }
                }
            }
        }
        let _ = writeln!(out, "}} | ipset -exist restore");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_chains_present() {
        let fw = Firewall::new();
        assert_eq!(
            fw.chain(NetfilterTable::Filter, "FORWARD").unwrap().policy(),
            Some("DROP")
        );
        assert!(fw.chain(NetfilterTable::Nat, "POSTROUTING").is_some());
        assert!(fw.chain(NetfilterTable::Mangle, "FORWARD").is_some());
        assert_eq!(fw.rule_count(), 0);
    }

    #[test]
    fn test_unknown_chain_is_error() {
        let mut fw = Firewall::new();
        assert!(matches!(
            fw.add_filter("x", "nope", "-j ACCEPT", ""),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_add_chain_idempotent() {
        let mut fw = Firewall::new();
        assert!(fw.add_chain(NetfilterTable::Filter, "a_fwd"));
        assert!(!fw.add_chain(NetfilterTable::Filter, "a_fwd"));
        assert_eq!(fw.chains(NetfilterTable::Filter).len(), 4);
    }

    #[test]
    fn test_insert_at_head_wins_storage_order() {
        let mut fw = Firewall::new();
        fw.add_chain(NetfilterTable::Filter, "a_fwd");
        fw.add_filter("allow", "a_fwd", "-j ACCEPT", "").unwrap();
        fw.add_filter_at("drop", "a_fwd", 0, "-j DROP", "").unwrap();
        fw.add_filter_at("log", "a_fwd", 1, "-j LOG", "").unwrap();
        let chain = fw.chain(NetfilterTable::Filter, "a_fwd").unwrap();
        let stored: Vec<_> = chain.rules().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(stored, vec!["drop", "log", "allow"]);
        let evaluated: Vec<_> = chain.evaluation_order().map(|r| r.label.as_str()).collect();
        assert_eq!(evaluated, vec!["allow", "log", "drop"]);
    }

    #[test]
    fn test_position_clamped() {
        let mut fw = Firewall::new();
        fw.add_chain(NetfilterTable::Filter, "a_fwd");
        fw.add_filter_at("x", "a_fwd", 10, "-j DROP", "").unwrap();
        assert_eq!(fw.chain(NetfilterTable::Filter, "a_fwd").unwrap().rules().len(), 1);
    }

    #[test]
    fn test_duplicate_rule_ignored() {
        let mut fw = Firewall::new();
        fw.add_filter("a", "INPUT", "-i lo -j ACCEPT", "").unwrap();
        fw.add_filter("b", "INPUT", "-i lo -j ACCEPT", "").unwrap();
        assert_eq!(fw.rule_count(), 1);
    }

    #[test]
    fn test_restore_text_shape() {
        let mut fw = Firewall::new();
        fw.add_nat_postrouting("masq", "-o ppp0 -j MASQUERADE", "masquerade \"out\"")
            .unwrap();
        let text = fw.to_restore_text();
        assert!(text.starts_with("*filter\n:INPUT ACCEPT [0:0]\n:FORWARD DROP [0:0]\n"));
        assert!(text.contains("*nat\n"));
        assert!(text.contains(
            "-A POSTROUTING -o ppp0 -j MASQUERADE -m comment --comment \"masquerade out\""
        ));
        assert_eq!(text.matches("COMMIT").count(), 3);
    }

    #[test]
    fn test_address_sets() {
        let mut sets = AddressSets::new();
        sets.add_set("user");
        assert!(sets.is_empty("user"));
        assert!(sets.is_empty("missing"));
        sets.add_network("user", "10.0.0.8/30".parse().unwrap());
        sets.add_host("api_example_com", "api.example.com");
        assert!(!sets.is_empty("user"));

        let script = sets.to_script();
        assert!(script.contains("echo \"create user hash:net family inet\""));
        assert!(script.contains("echo \"add user 10.0.0.8/30\""));
        assert!(script.contains("getent ahostsv4 'api.example.com'"));
        assert!(script.ends_with("} | ipset -exist restore\n"));
    }

    #[test]
    fn test_json_export() {
        let mut fw = Firewall::new();
        fw.add_filter("a", "INPUT", "-i lo -j ACCEPT", "loopback").unwrap();
        let json = fw.to_json();
        assert_eq!(json["tables"]["filter"][0]["name"], "INPUT");
        assert_eq!(json["tables"]["filter"][0]["rules"][0]["label"], "a");
    }
}
