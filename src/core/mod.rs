//! Core network compilation
//!
//! Leaf first:
//!
//! - [`shell`], [`unit`], [`units`]: units and their script fragments
//! - [`script`]: per-machine unit registries and script assembly
//! - [`interface`], [`traffic`], [`machine`]: the machine model
//! - [`data`], [`graph`]: network descriptions and the two-phase graph
//! - [`firewall`], [`resolver`]: iptables model and firewall resolution
//! - [`profiles`]: named bundles of units attached to machines
//! - [`network`]: the whole pipeline, rendering and dispatch
//! - [`error`]: error types

pub mod data;
pub mod error;
pub mod firewall;
pub mod graph;
pub mod interface;
pub mod machine;
pub mod network;
pub mod profiles;
pub mod resolver;
pub mod script;
pub mod shell;
pub mod traffic;
pub mod unit;
pub mod units;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
