//! drnet - declarative network configuration compiler
//!
//! Reads a JSON description of a network and renders, per machine, a bash
//! script that audits or enforces that machine's configuration, including the
//! firewall of every router.
//!
//! # Usage
//!
//! ```bash
//! drnet list office.json                   # Machines in compilation order
//! drnet script office.json web1            # Print web1's audit script
//! drnet script office.json web1 -a config  # Print web1's config script
//! drnet firewall office.json gw            # iptables-restore input for gw
//! drnet firewall office.json gw -f ipsets  # Address set loader for gw
//! drnet dryrun office.json --all           # Persist dry-run scripts
//! drnet audit office.json web1             # Run the audit over ssh
//! drnet config office.json --all           # Configure every machine
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use drnet::config::{self, AppConfig};
use drnet::core::data::NetworkData;
use drnet::core::network::Network;
use drnet::core::profiles::ProfileRegistry;
use drnet::core::script::Action;
use drnet::transport::CommandTransport;
use drnet::{audit, utils};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "drnet")]
#[command(about = "Declarative network configuration compiler", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Hide per-unit ✓/❌ lines in generated scripts
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Write logs to drnet.log in the state directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List machines in compilation order
    List {
        /// Network description (JSON)
        network: PathBuf,
    },
    /// Print a machine's script
    Script {
        network: PathBuf,
        machine: String,
        #[arg(short, long, value_enum, default_value = "audit")]
        action: ScriptAction,
    },
    /// Print a router's resolved firewall
    Firewall {
        network: PathBuf,
        router: String,
        #[arg(short, long, value_enum, default_value = "iptables")]
        format: FirewallFormat,
    },
    /// Write dry-run scripts to disk without running anything
    Dryrun {
        network: PathBuf,
        #[command(flatten)]
        selection: Selection,
        /// Output directory (default: configured or XDG data dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Run audit scripts through the transport
    Audit {
        network: PathBuf,
        #[command(flatten)]
        selection: Selection,
        /// Transport command, overriding the configured one
        #[arg(short, long)]
        transport: Option<String>,
    },
    /// Run config scripts through the transport
    Config {
        network: PathBuf,
        #[command(flatten)]
        selection: Selection,
        #[arg(short, long)]
        transport: Option<String>,
    },
}

#[derive(clap::Args)]
struct Selection {
    /// Machine label
    #[arg(required_unless_present = "all")]
    machine: Option<String>,
    /// Every machine, in compilation order
    #[arg(long, conflicts_with = "machine")]
    all: bool,
}

impl Selection {
    fn machines(&self, network: &Network) -> Vec<String> {
        match &self.machine {
            Some(machine) if !self.all => vec![machine.clone()],
            _ => network.machines().map(str::to_string).collect(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScriptAction {
    Audit,
    Config,
    Dryrun,
}

impl From<ScriptAction> for Action {
    fn from(action: ScriptAction) -> Self {
        match action {
            ScriptAction::Audit => Action::Audit,
            ScriptAction::Config => Action::Config,
            ScriptAction::Dryrun => Action::DryRun,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FirewallFormat {
    Iptables,
    Ipsets,
    Json,
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(to_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if to_file
        && let Some(mut log_path) = utils::get_state_dir()
    {
        log_path.push("drnet.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn compile(path: &Path) -> drnet::Result<Network> {
    let data = NetworkData::load(path)?;
    Network::compile(&data, &ProfileRegistry::with_builtins())
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let app_config = config::load_config().await;
    let quiet = cli.quiet || app_config.quiet;
    let log = app_config.enable_audit_log;

    match cli.command {
        Commands::List { network } => {
            let network = compile(&network)?;
            println!("Machines in {} (compilation order):", network.graph().settings().label);
            for label in network.machines() {
                let machine = network.graph().machine(label)?;
                let units = network.registry(label)?.len();
                println!("  {label:<24} {:<14} {units:>4} units", machine.kind().as_str());
            }
        }
        Commands::Script {
            network,
            machine,
            action,
        } => {
            let network = compile(&network)?;
            let action = Action::from(action);
            let script = network.script(&machine, action, quiet)?;
            if log {
                let units = network.registry(&machine)?.len();
                audit::log_render(&machine, action.as_str(), &script, units).await;
            }
            print!("{script}");
        }
        Commands::Firewall {
            network,
            router,
            format,
        } => {
            let network = compile(&network)?;
            let resolved = network.firewall(&router)?;
            match format {
                FirewallFormat::Iptables => print!("{}", resolved.iptables()),
                FirewallFormat::Ipsets => print!("{}", resolved.ipsets()),
                FirewallFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&resolved.to_json())?);
                }
            }
        }
        Commands::Dryrun {
            network,
            selection,
            dir,
        } => {
            let network = compile(&network)?;
            let dir = dir
                .or_else(|| app_config.dryrun_dir())
                .ok_or("no dry-run directory: pass --dir")?;
            for machine in selection.machines(&network) {
                let handle = network.dryrun_non_block(&machine, dir.clone(), quiet)?;
                let result = handle.await?;
                if log {
                    audit::log_dry_run(
                        &machine,
                        result.as_ref().ok().map(PathBuf::as_path),
                        result.as_ref().err().map(ToString::to_string),
                    )
                    .await;
                }
                println!("{machine}: {}", result?.display());
            }
        }
        Commands::Audit {
            network,
            selection,
            transport,
        } => {
            return dispatch(&network, &selection, Action::Audit, transport, &app_config, quiet).await;
        }
        Commands::Config {
            network,
            selection,
            transport,
        } => {
            return dispatch(&network, &selection, Action::Config, transport, &app_config, quiet).await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Runs the selected machines' scripts concurrently and reports each result.
///
/// Exits with failure if any script could not be delivered or reported a
/// failed unit.
async fn dispatch(
    path: &Path,
    selection: &Selection,
    action: Action,
    transport: Option<String>,
    app_config: &AppConfig,
    quiet: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let network = compile(path)?;
    let command = transport.unwrap_or_else(|| app_config.transport_command.clone());
    let transport = Arc::new(CommandTransport::new(&command)?);

    let mut handles = Vec::new();
    for machine in selection.machines(&network) {
        let handle = match action {
            Action::Config => network.config_non_block(&machine, Arc::clone(&transport), quiet)?,
            _ => network.audit_non_block(&machine, Arc::clone(&transport), quiet)?,
        };
        handles.push((machine, handle));
    }

    let mut ok = true;
    for (machine, handle) in handles {
        let result = handle.await?;
        if app_config.enable_audit_log {
            let (passed, failed) = result
                .as_ref()
                .map(|out| (out.passed, out.failed))
                .unwrap_or_default();
            audit::log_dispatch(
                &machine,
                action.as_str(),
                passed,
                failed,
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        }

        match result {
            Ok(out) => {
                println!("==== {machine} ====");
                print!("{}", out.stdout);
                if !out.all_passed() {
                    ok = false;
                }
            }
            Err(e) => {
                eprintln!("{machine}: {e}");
                ok = false;
            }
        }
    }

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
