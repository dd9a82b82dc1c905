//! drnet - declarative network configuration compiler
//!
//! Turns a JSON description of a network into idempotent bash scripts that
//! audit or enforce each machine's configuration, including the iptables
//! firewall of every router.
//!
//! # Architecture
//!
//! - [`core`] - Network model, units, script assembly and firewall resolution
//! - [`transport`] - Piping rendered scripts into an ssh-like command
//! - [`audit`] - Audit log of rendered and dispatched scripts
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Operator configuration persistence
//! - [`utils`] - Utility functions (XDG directories, identifiers)
//!
//! # Guarantees
//!
//! - Any data error aborts compilation; no partial script is emitted
//! - Every firewall chain ends in a default drop
//! - A unit whose precondition failed never runs its remediation
//! - Dry runs are written atomically with owner-only permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod transport;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::network::Network;
pub use core::unit::{Outcome, Unit};
