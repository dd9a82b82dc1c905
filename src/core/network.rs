//! Network compilation and dispatch
//!
//! [`Network::compile`] runs the whole pipeline over a network description:
//! build the graph, initialise it, let profiles declare traffic, freeze,
//! then collect every machine's units. Collection visits devices, then
//! servers, then routers last, so a router's firewall is resolved against a
//! network whose traffic rules are final.
//!
//! ```
//! use drnet::core::data::NetworkData;
//! use drnet::core::network::Network;
//! use drnet::core::profiles::ProfileRegistry;
//! use drnet::core::script::Action;
//!
//! let data: NetworkData = serde_json::from_str(r#"{
//!     "label": "office",
//!     "machines": {"web1": {"types": ["server"]}}
//! }"#).unwrap();
//! let network = Network::compile(&data, &ProfileRegistry::with_builtins()).unwrap();
//! let script = network.script("web1", Action::Audit, false).unwrap();
//! assert!(script.contains("with config label: web1"));
//! ```

use crate::core::data::NetworkData;
use crate::core::error::{Error, Result};
use crate::core::graph::{FrozenGraph, NetworkGraph};
use crate::core::machine::Machine;
use crate::core::profiles::{Profile, ProfileContext, ProfileRegistry};
use crate::core::resolver::{FirewallResolver, ResolvedFirewall};
use crate::core::script::{self, Action, UnitRegistry};
use crate::core::unit::Unit;
use crate::transport::{ExecOutput, Target, Transport};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A compiled network: every machine's units, ready to render
#[derive(Debug, Clone)]
pub struct Network {
    graph: Arc<FrozenGraph>,
    registries: BTreeMap<String, UnitRegistry>,
    /// Labels in collection order
    order: Vec<String>,
    firewalls: BTreeMap<String, ResolvedFirewall>,
}

impl Network {
    /// Compiles a network description.
    ///
    /// # Errors
    ///
    /// Returns the first data or resolution error. Nothing is compiled
    /// partially.
    pub fn compile(data: &NetworkData, profiles: &ProfileRegistry) -> Result<Self> {
        let mut graph = NetworkGraph::from_data(data)?;
        graph.init()?;
        graph.apply_profiles(profiles)?;
        Self::from_graph(graph.freeze()?, profiles)
    }

    /// Collects units over an already frozen graph.
    pub fn from_graph(graph: FrozenGraph, profiles: &ProfileRegistry) -> Result<Self> {
        let mut network = Self {
            graph: Arc::new(graph),
            registries: BTreeMap::new(),
            order: Vec::new(),
            firewalls: BTreeMap::new(),
        };
        let graph = Arc::clone(&network.graph);

        let devices = graph.devices();
        let servers = graph.servers();
        let routers = graph.routers();
        for machine in devices.chain(servers).chain(routers) {
            network.collect(machine, &graph, profiles)?;
        }

        info!(
            "Compiled network {}: {} machines, {} routers",
            graph.settings().label,
            network.order.len(),
            network.firewalls.len()
        );
        Ok(network)
    }

    fn collect(
        &mut self,
        machine: &Machine,
        graph: &FrozenGraph,
        profiles: &ProfileRegistry,
    ) -> Result<()> {
        let ctx = ProfileContext { machine, graph };
        let selected = profiles.profiles_for(machine)?;
        let mut registry = UnitRegistry::new(machine.label());

        phase(&mut registry, &selected, &ctx, |p, ctx| p.installed(ctx))?;
        phase(&mut registry, &selected, &ctx, |p, ctx| p.persistent_config(ctx))?;
        phase(&mut registry, &selected, &ctx, |p, ctx| p.persistent_firewall(ctx))?;

        if machine.is_router() {
            let resolved = FirewallResolver::new(graph, machine.label())?.resolve()?;
            registry.extend(resolved.units(graph)?)?;
            self.firewalls.insert(machine.label().to_string(), resolved);
        }

        phase(&mut registry, &selected, &ctx, |p, ctx| p.live_config(ctx))?;

        debug!("Collected {} units for {}", registry.len(), machine.label());
        self.order.push(machine.label().to_string());
        self.registries.insert(machine.label().to_string(), registry);
        Ok(())
    }

    pub fn graph(&self) -> &FrozenGraph {
        &self.graph
    }

    /// Machine labels in collection order
    pub fn machines(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] if no machine has `label`.
    pub fn registry(&self, label: &str) -> Result<&UnitRegistry> {
        self.registries.get(label).ok_or_else(|| Error::UnknownMachine {
            label: label.to_string(),
        })
    }

    /// The resolved firewall of a router.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMachine`] for an unknown label and
    /// [`Error::Validation`] for a machine that is not a router.
    pub fn firewall(&self, router: &str) -> Result<&ResolvedFirewall> {
        let machine = self.graph.machine(router)?;
        self.firewalls.get(router).ok_or_else(|| {
            Error::validation("router", format!("{} is not a router", machine.label()))
        })
    }

    /// Renders a machine's full script.
    pub fn script(&self, machine: &str, action: Action, quiet: bool) -> Result<String> {
        Ok(self.registry(machine)?.script(action, quiet))
    }

    /// Where a machine's script is sent: its FQDN when it has one, else its
    /// label, on its SSH port.
    pub fn target(&self, machine: &str) -> Result<Target> {
        let m = self.graph.machine(machine)?;
        let host = m.fqdn().unwrap_or_else(|| m.label().to_string());
        Ok(Target::new(m.label(), host, m.ssh_port()))
    }

    /// Persists a machine's dry-run script into `dir`. Nothing is executed.
    pub fn dry_run(&self, machine: &str, dir: &Path, quiet: bool) -> Result<PathBuf> {
        let script = self.script(machine, Action::DryRun, quiet)?;
        script::persist_dry_run(dir, machine, &script)
    }

    /// Sends the audit script and waits for its result.
    pub async fn audit<T: Transport>(
        &self,
        machine: &str,
        transport: &T,
        quiet: bool,
    ) -> Result<ExecOutput> {
        self.dispatch(machine, Action::Audit, transport, quiet).await
    }

    /// Sends the config script and waits for its result.
    pub async fn config<T: Transport>(
        &self,
        machine: &str,
        transport: &T,
        quiet: bool,
    ) -> Result<ExecOutput> {
        self.dispatch(machine, Action::Config, transport, quiet).await
    }

    async fn dispatch<T: Transport>(
        &self,
        machine: &str,
        action: Action,
        transport: &T,
        quiet: bool,
    ) -> Result<ExecOutput> {
        let script = self.script(machine, action, quiet)?;
        let target = self.target(machine)?;
        run(transport, target, script).await
    }

    /// Like [`Network::audit`], on a background task.
    ///
    /// The script is rendered before this returns, so rendering errors
    /// surface here rather than through the handle.
    pub fn audit_non_block<T: Transport>(
        &self,
        machine: &str,
        transport: Arc<T>,
        quiet: bool,
    ) -> Result<JoinHandle<Result<ExecOutput>>> {
        self.spawn(machine, Action::Audit, transport, quiet)
    }

    /// Like [`Network::config`], on a background task.
    pub fn config_non_block<T: Transport>(
        &self,
        machine: &str,
        transport: Arc<T>,
        quiet: bool,
    ) -> Result<JoinHandle<Result<ExecOutput>>> {
        self.spawn(machine, Action::Config, transport, quiet)
    }

    /// Like [`Network::dry_run`], on the blocking pool.
    pub fn dryrun_non_block(
        &self,
        machine: &str,
        dir: PathBuf,
        quiet: bool,
    ) -> Result<JoinHandle<Result<PathBuf>>> {
        let script = self.script(machine, Action::DryRun, quiet)?;
        let machine = machine.to_string();
        Ok(tokio::task::spawn_blocking(move || {
            script::persist_dry_run(&dir, &machine, &script)
        }))
    }

    fn spawn<T: Transport>(
        &self,
        machine: &str,
        action: Action,
        transport: Arc<T>,
        quiet: bool,
    ) -> Result<JoinHandle<Result<ExecOutput>>> {
        let script = self.script(machine, action, quiet)?;
        let target = self.target(machine)?;
        Ok(tokio::spawn(async move {
            run(transport.as_ref(), target, script).await
        }))
    }
}

/// Appends one phase of every selected profile, profile by profile.
fn phase(
    registry: &mut UnitRegistry,
    profiles: &[&dyn Profile],
    ctx: &ProfileContext<'_>,
    emit: fn(&dyn Profile, &ProfileContext<'_>) -> Result<Vec<Unit>>,
) -> Result<()> {
    for profile in profiles {
        registry.extend(emit(*profile, ctx)?)?;
    }
    Ok(())
}

async fn run<T: Transport>(transport: &T, target: Target, script: String) -> Result<ExecOutput> {
    transport
        .execute(&target, script)
        .await
        .map_err(|e| Error::Transport {
            machine: target.machine.clone(),
            exit_code: e.exit_code(),
            message: e.to_string(),
        })
}
