//! Profiles
//!
//! A profile is a named bundle of behaviour attached to a machine: it may
//! declare traffic rules while the graph is still mutable, and it emits units
//! in four phases once the graph is frozen. Application profiles live outside
//! this crate and are registered into a [`ProfileRegistry`]; a handful of
//! built-ins cover what every machine of a given kind needs.
//!
//! Machines name their profiles in the `profiles` list of their record. On
//! top of that, every machine gets the [`implicit_profiles`] of its kind.

use crate::core::error::{Error, Result};
use crate::core::graph::FrozenGraph;
use crate::core::machine::{HasInterfaces, Machine, MachineKind};
use crate::core::traffic::Encapsulation;
use crate::core::unit::{Outcome, Unit};
use crate::core::units;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Everything a profile may look at while emitting units
#[derive(Debug, Clone, Copy)]
pub struct ProfileContext<'a> {
    pub machine: &'a Machine,
    pub graph: &'a FrozenGraph,
}

pub trait Profile: Send + Sync {
    fn name(&self) -> &str;

    /// Adds traffic rules to the machine before the graph is frozen.
    fn declare_firewall(&self, _machine: &mut Machine) -> Result<()> {
        Ok(())
    }

    /// Packages
    fn installed(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        Ok(Vec::new())
    }

    /// Files, directories and mounts that survive a reboot
    fn persistent_config(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        Ok(Vec::new())
    }

    /// Firewall state that survives a reboot
    fn persistent_firewall(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        Ok(Vec::new())
    }

    /// Running state: services, loaded rules
    fn live_config(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        Ok(Vec::new())
    }

    /// Every unit of the profile, phase by phase.
    fn units(&self, ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        let mut out = self.installed(ctx)?;
        out.extend(self.persistent_config(ctx)?);
        out.extend(self.persistent_firewall(ctx)?);
        out.extend(self.live_config(ctx)?);
        Ok(out)
    }
}

/// Built-in profiles every machine of `kind` receives
pub fn implicit_profiles(kind: &MachineKind) -> &'static [&'static str] {
    match kind {
        MachineKind::Router | MachineKind::Server => &[CONFIG_FILES],
        MachineKind::Hypervisor => &[CONFIG_FILES, HYPERVISOR_HOST],
        MachineKind::Service { .. } => &[CONFIG_FILES, SERVICE_GUEST],
        MachineKind::Device(_) => &[],
    }
}

/// Names profiles may be registered under
///
/// Alphanumeric, underscores and hyphens, at most 64 characters.
pub fn validate_profile_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }
    if name.len() > 64 {
        return Err("Name too long (max 64 chars)".into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -)".into());
    }
    Ok(())
}

/// Profiles by name
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Box<dyn Profile>>,
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProfileRegistry {
    /// An empty registry, without even the built-ins.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in profiles.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [Box<dyn Profile>; 4] = [
            Box::new(ConfigFiles::default()),
            Box::new(ServiceGuest),
            Box::new(HypervisorHost),
            Box::new(AptUpdates),
        ];
        for profile in builtins {
            registry
                .profiles
                .insert(profile.name().to_string(), profile);
        }
        registry
    }

    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an invalid or already registered
    /// name.
    pub fn register(&mut self, profile: Box<dyn Profile>) -> Result<()> {
        let name = profile.name().to_string();
        validate_profile_name(&name).map_err(|e| Error::validation("profile", e))?;
        if self.profiles.contains_key(&name) {
            return Err(Error::validation(
                "profile",
                format!("{name} is already registered"),
            ));
        }
        self.profiles.insert(name, profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Profile> {
        self.profiles.get(name).map(|p| &**p)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Implicit profiles of the machine's kind, then the ones it names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProfile`] for a name that is not registered.
    pub fn profiles_for(&self, machine: &Machine) -> Result<Vec<&dyn Profile>> {
        let mut names: Vec<&str> = implicit_profiles(machine.kind()).to_vec();
        for name in machine.profiles() {
            if !names.contains(&name.as_str()) {
                names.push(name.as_str());
            }
        }
        names
            .into_iter()
            .map(|name| {
                self.get(name).ok_or_else(|| Error::UnknownProfile {
                    machine: machine.label().to_string(),
                    profile: name.to_string(),
                })
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in profiles
// ═══════════════════════════════════════════════════════════════════════════

pub const CONFIG_FILES: &str = "config_files";
pub const SERVICE_GUEST: &str = "service_guest";
pub const HYPERVISOR_HOST: &str = "hypervisor_host";
pub const APT_UPDATES: &str = "apt_updates";

/// Mount point of a service's non-boot disks
pub const GUEST_MOUNT_ROOT: &str = "/media";

/// Flags package-managed config files that were edited by hand.
///
/// Paths this tool writes itself are excluded from the check.
#[derive(Debug, Clone, Default)]
pub struct ConfigFiles {
    managed: Vec<String>,
}

impl ConfigFiles {
    pub fn new(managed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            managed: managed.into_iter().map(Into::into).collect(),
        }
    }
}

impl Profile for ConfigFiles {
    fn name(&self) -> &str {
        CONFIG_FILES
    }

    fn live_config(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        let mut audit = String::from("sudo dpkg -V");
        for path in &self.managed {
            let _ = write!(audit, " | grep -Ev \"{}\"", crate::core::shell::double_quoted(path));
        }
        Ok(vec![Unit::new(
            "no_config_file_tampering",
            "",
            "",
            audit,
            "",
            Outcome::Pass,
            "There are unexpected config file edits on this machine. This is a sign that someone has been configuring this machine by hand.",
        )])
    }
}

/// A service running as a VirtualBox guest: checks it is one, then mounts
/// its data disks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceGuest;

impl Profile for ServiceGuest {
    fn name(&self) -> &str {
        SERVICE_GUEST
    }

    fn installed(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        Ok(vec![Unit::new(
            "is_virtualbox_guest",
            "",
            "",
            "sudo dmidecode -s system-product-name 2>&1",
            "VirtualBox",
            Outcome::Pass,
            "This service is not running as a VirtualBox guest. Its disks won't be mounted.",
        )])
    }

    fn persistent_config(&self, ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        let mut out = Vec::new();
        // sda is always the boot disk
        let extra: Vec<_> = ctx
            .machine
            .disks()
            .keys()
            .filter(|name| name.as_str() != "boot")
            .collect();
        let letters = 'b'..='z';
        if extra.len() > letters.clone().count() {
            return Err(Error::validation(
                "disks",
                format!(
                    "{} has {} data disks, only sdb to sdz can be mounted",
                    ctx.machine.label(),
                    extra.len()
                ),
            ));
        }
        for (letter, name) in letters.zip(extra) {
            let mount = format!("{GUEST_MOUNT_ROOT}/{name}");
            let mountpoint = units::dir(&format!("{name}_mountpoint"), "is_virtualbox_guest", &mount);
            let fstab = units::file_append(
                &format!("{name}_fstab"),
                mountpoint.label(),
                &format!("/dev/sd{letter}1 {mount} ext4 defaults,nofail 0 2"),
                "/etc/fstab",
            );
            let mounted = units::dir_mounted(&format!("{name}_disk"), fstab.label(), &mount);
            out.extend([mountpoint, fstab, mounted]);
        }
        Ok(out)
    }
}

/// A hypervisor: creates the disk directories of the services it hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypervisorHost;

impl Profile for HypervisorHost {
    fn name(&self) -> &str {
        HYPERVISOR_HOST
    }

    fn persistent_config(&self, ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        let mut out = Vec::new();
        for service in ctx.graph.hosted_services(ctx.machine.label()) {
            for disk in service.disks().values() {
                out.push(units::dir(
                    &format!("{}_{}_disk_dir", service.label(), disk.name),
                    "",
                    disk.directory(),
                ));
            }
        }
        Ok(out)
    }
}

/// Unattended security updates from the Debian mirrors.
#[derive(Debug, Clone, Copy, Default)]
pub struct AptUpdates;

impl AptUpdates {
    const MIRRORS: [&'static str; 2] = ["deb.debian.org", "security.debian.org"];
}

impl Profile for AptUpdates {
    fn name(&self) -> &str {
        APT_UPDATES
    }

    fn declare_firewall(&self, machine: &mut Machine) -> Result<()> {
        for mirror in Self::MIRRORS {
            machine.add_egress(mirror, Encapsulation::Tcp, [80, 443])?;
        }
        Ok(())
    }

    fn installed(&self, ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        if ctx.machine.interfaces().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![units::installed(
            "unattended_upgrades",
            "",
            "unattended-upgrades",
        )])
    }

    fn live_config(&self, _ctx: &ProfileContext<'_>) -> Result<Vec<Unit>> {
        Ok(vec![units::running(
            "unattended_upgrades",
            "unattended_upgrades_installed",
            "unattended-upgrades",
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{NetworkGraph, NetworkSettings};
    use crate::core::machine::{Disk, HasTrafficRules, MachineType};

    struct Dummy(&'static str);

    impl Profile for Dummy {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn graph() -> FrozenGraph {
        let mut g = NetworkGraph::new(NetworkSettings::new("office"));
        let mut hv = Machine::new("hv1", MachineKind::Hypervisor).unwrap();
        hv.add_type(MachineType::Hypervisor);
        g.add_machine(hv).unwrap();
        let web = Machine::new(
            "web1",
            MachineKind::Service {
                hypervisor: "hv1".to_string(),
            },
        )
        .unwrap();
        g.add_machine(web).unwrap();
        g.freeze().unwrap()
    }

    #[test]
    fn test_register_rejects_bad_and_duplicate_names() {
        let mut registry = ProfileRegistry::with_builtins();
        assert!(registry.register(Box::new(Dummy("../etc"))).is_err());
        assert!(registry.register(Box::new(Dummy(CONFIG_FILES))).is_err());
        registry.register(Box::new(Dummy("nginx"))).unwrap();
        assert!(registry.get("nginx").is_some());
        assert!(registry.get("apache").is_none());
    }

    #[test]
    fn test_profiles_for_unknown_name() {
        let registry = ProfileRegistry::with_builtins();
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        m.add_profile("nonexistent");
        assert!(matches!(
            registry.profiles_for(&m),
            Err(Error::UnknownProfile { .. })
        ));
    }

    #[test]
    fn test_implicit_profiles_come_first() {
        let registry = ProfileRegistry::with_builtins();
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        m.add_profile(APT_UPDATES);
        let names: Vec<_> = registry
            .profiles_for(&m)
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec![CONFIG_FILES, APT_UPDATES]);
    }

    #[test]
    fn test_service_guest_mounts_data_disk() {
        let g = graph();
        let ctx = ProfileContext {
            machine: g.machine("web1").unwrap(),
            graph: &g,
        };
        let units = ServiceGuest.persistent_config(&ctx).unwrap();
        let labels: Vec<_> = units.iter().map(Unit::label).collect();
        assert_eq!(
            labels,
            vec!["data_mountpoint_created", "data_fstab_appended", "data_disk_mounted"]
        );
        assert!(units[1].config().contains("/dev/sdb1 /media/data"));
        assert_eq!(units[2].precondition(), "data_fstab_appended");
    }

    #[test]
    fn test_service_guest_rejects_unmountable_disks() {
        let mut g = NetworkGraph::new(NetworkSettings::new("office"));
        let mut hv = Machine::new("hv1", MachineKind::Hypervisor).unwrap();
        hv.add_type(MachineType::Hypervisor);
        g.add_machine(hv).unwrap();
        let mut web = Machine::new(
            "web1",
            MachineKind::Service {
                hypervisor: "hv1".to_string(),
            },
        )
        .unwrap();
        for i in 0..26 {
            web.add_disk(Disk::new(format!("data{i:02}"), 1024, "/disks"));
        }
        g.add_machine(web).unwrap();
        let g = g.freeze().unwrap();
        let ctx = ProfileContext {
            machine: g.machine("web1").unwrap(),
            graph: &g,
        };
        assert!(matches!(
            ServiceGuest.persistent_config(&ctx),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_hypervisor_creates_disk_dirs() {
        let g = graph();
        let ctx = ProfileContext {
            machine: g.machine("hv1").unwrap(),
            graph: &g,
        };
        let units = HypervisorHost.persistent_config(&ctx).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units.iter().any(|u| u.config().contains("/disks/boot/web1")));
    }

    #[test]
    fn test_config_files_excludes_managed_paths() {
        let g = graph();
        let ctx = ProfileContext {
            machine: g.machine("hv1").unwrap(),
            graph: &g,
        };
        let units = ConfigFiles::new(["/etc/iptables/iptables.conf"])
            .live_config(&ctx)
            .unwrap();
        assert_eq!(
            units[0].audit(),
            "sudo dpkg -V | grep -Ev \"/etc/iptables/iptables.conf\""
        );
    }

    #[test]
    fn test_apt_declares_egress() {
        let mut m = Machine::new("web1", MachineKind::Server).unwrap();
        AptUpdates.declare_firewall(&mut m).unwrap();
        assert_eq!(m.traffic_rules().len(), 2);
    }
}
