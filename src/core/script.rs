//! Per-machine unit registry and script assembly
//!
//! A machine's units are collected into a [`UnitRegistry`] in the order they
//! were declared. [`assemble`] wraps their fragments for one [`Action`] in a
//! header that initialises the pass/fail accounting and a footer that reports
//! it. Units are never reordered: a precondition must be registered before the
//! unit that depends on it.

use crate::core::error::{Error, Result};
use crate::core::shell::ScriptWriter;
use crate::core::unit::{PROCEED, Unit};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What a rendered script does on the target machine
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum Action {
    /// Check every unit, change nothing
    #[strum(serialize = "audit")]
    Audit,
    /// Check every unit and remediate failures
    #[strum(serialize = "config")]
    Config,
    /// Check every unit and print the remediation that would run
    #[strum(serialize = "dryrun")]
    DryRun,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Audit => "audit",
            Action::Config => "config",
            Action::DryRun => "dryrun",
        }
    }
}

/// Ordered, label-unique collection of one machine's units
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    machine: String,
    units: Vec<Unit>,
    labels: HashSet<String>,
}

impl UnitRegistry {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            units: Vec::new(),
            labels: HashSet::new(),
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Appends a unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateUnit`] if a unit with the same label is
    /// already registered for this machine.
    pub fn push(&mut self, unit: Unit) -> Result<()> {
        if !self.labels.insert(unit.label().to_string()) {
            return Err(Error::DuplicateUnit {
                machine: self.machine.clone(),
                label: unit.label().to_string(),
            });
        }
        self.units.push(unit);
        Ok(())
    }

    pub fn extend(&mut self, units: impl IntoIterator<Item = Unit>) -> Result<()> {
        for unit in units {
            self.push(unit)?;
        }
        Ok(())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Renders the full script for `action`.
    pub fn script(&self, action: Action, quiet: bool) -> String {
        assemble(&self.machine, &self.units, action, quiet)
    }
}

/// Renders a complete bash script for one machine.
pub fn assemble(machine: &str, units: &[Unit], action: Action, quiet: bool) -> String {
    debug!(
        "Assembling {} script for {} ({} units)",
        action,
        machine,
        units.len()
    );

    let mut w = ScriptWriter::new();
    w.line("#!/bin/bash");
    w.blank();
    w.line("hostname=$(hostname)");
    w.line(format!("{PROCEED}_audit_passed=1"));
    w.line("passed=0");
    w.line("failed=0");
    w.line("fail_string=\"\"");
    w.blank();
    w.echo(&format!(
        "Started {} ${{hostname}} with config label: {machine}",
        action.as_str()
    ));
    w.blank();

    let mut out = w.finish();
    for unit in units {
        let _ = writeln!(out, "#============ {} =============", unit.label());
        let _ = writeln!(out, "{}", unit.render(action, quiet));
    }

    let mut w = ScriptWriter::new();
    w.echo(&format!(
        "Finished {} ${{hostname}} with config label: {machine}",
        action.as_str()
    ));
    w.line("echo \"passed=$passed failed=$failed\"");
    w.block("if [ \"$failed\" != \"0\" ] ; then", "fi ;", |w| {
        w.line("echo -e \"failed:${fail_string}\"");
    });
    out.push_str(&w.finish());
    out
}

/// File name of a persisted dry-run script: `<machine>_<YYYY-mm-dd_HH.MM.SS>.sh`
pub fn dry_run_file_name<Tz>(machine: &str, when: &chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{machine}_{}.sh", when.format("%Y-%m-%d_%H.%M.%S"))
}

/// Writes a dry-run script into `dir` using an atomic write pattern.
/// 1. Writes to a temporary file in the same directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the timestamped target path.
///
/// Returns the path of the persisted script.
pub fn persist_dry_run(dir: &Path, machine: &str, script: &str) -> Result<PathBuf> {
    use std::io::Write;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(dry_run_file_name(machine, &chrono::Local::now()));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(script.as_bytes())?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(&path).map_err(|e| Error::Io(e.error))?;
    info!("Dry run for {} written to {}", machine, path.display());
    Ok(path)
}
