//! Utility functions for directory management and identifier handling
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and data storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/drnet/` - Application config, default dry-run output
//! - State: `~/.local/state/drnet/` - Runtime state (audit log, drnet.log)
//!
//! # Example
//!
//! ```
//! use drnet::utils::{get_data_dir, ensure_dirs};
//!
//! // Ensure directories exist before use
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Load configuration from data_path
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "drnet", "drnet").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "drnet", "drnet")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Default directory for persisted dry-run scripts
pub fn get_dryrun_dir() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("dryrun"))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Normalizes a label into a shell/iptables-safe identifier.
///
/// Lowercases, then replaces every character outside `[a-z0-9]` with `_`.
///
/// # Examples
///
/// ```
/// use drnet::utils::to_identifier;
///
/// assert_eq!(to_identifier("Web-1.example"), "web_1_example");
/// assert_eq!(to_identifier("sshd_installed"), "sshd_installed");
/// ```
pub fn to_identifier(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Joins values with commas, the list form iptables multiport expects.
pub fn join_csv<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
