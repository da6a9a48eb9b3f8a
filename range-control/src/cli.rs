//! Command line interface.
//!
//! Thin routing layer: parse arguments, load settings, wire the component
//! graph and delegate to the command handlers. Exit codes: 0 on success,
//! 1 on validation or runtime failure, 130 on interrupt.

pub mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use fs::LocalFile;
use tracing::debug;

use crate::command::{CommandExecutor, SystemCommandRunner};
use crate::config::settings::Settings;
use crate::defaults;
use crate::discovery::IpDiscovery;
use crate::hypervisor::{Hypervisor, LibvirtClient};
use crate::image::ImageBuilder;
use crate::network::bridge::BridgeManager;
use crate::network::firewall::FirewallManager;
use crate::network::topology::{NetworkMode, TopologyManager};
use crate::range::orchestrator::RangeOrchestrator;
use crate::range::store::MetadataStore;
use crate::tasks::executor::TaskExecutor;
use crate::utils::cancel::CancelFlag;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkModeArg {
    User,
    Bridge,
}

impl From<NetworkModeArg> for NetworkMode {
    fn from(mode: NetworkModeArg) -> Self {
        match mode {
            NetworkModeArg::User => NetworkMode::User,
            NetworkModeArg::Bridge => NetworkMode::Bridge,
        }
    }
}

/// CyRIS - cyber range instantiation system.
#[derive(Parser, Debug)]
#[command(name = "cyris", version = defaults::RANGE_CONTROL_VERSION, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new cyber range from a description file.
    Create {
        description_file: PathBuf,
        /// Explicit range id; auto-assigned when omitted.
        #[arg(long)]
        range_id: Option<String>,
        /// Validate and plan without touching the hypervisor.
        #[arg(long)]
        dry_run: bool,
        /// Network attachment mode for realized networks.
        #[arg(long, value_enum, default_value = "user")]
        network_mode: NetworkModeArg,
        /// Enable SSH access setup for created guests.
        #[arg(long)]
        enable_ssh: bool,
        /// Escalate any guest task failure to a range failure.
        #[arg(long)]
        strict_tasks: bool,
        /// Keep the metadata entry in `error` state instead of cleaning
        /// up after a failed creation.
        #[arg(long)]
        keep_on_failure: bool,
    },
    /// List cyber ranges.
    List {
        #[arg(long)]
        range_id: Option<String>,
        /// Include destroyed ranges.
        #[arg(long)]
        all: bool,
    },
    /// Show the status of one range.
    Status { range_id: String },
    /// Destroy a range's domains, networks and firewall rules.
    Destroy {
        range_id: String,
        #[arg(long)]
        force: bool,
        /// Also remove metadata and on-disk files after destroying.
        #[arg(long)]
        rm: bool,
    },
    /// Remove a destroyed range's metadata and files.
    Rm {
        range_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Print SSH connection details for a range's guests.
    SshInfo { range_id: String },
    /// Print the effective configuration.
    ConfigShow,
    /// Write a commented configuration template.
    ConfigInit {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check the host environment: toolchain, hypervisor, directories.
    Validate,
    /// Print (or run) the host permission setup commands.
    SetupPermissions {
        #[arg(long)]
        dry_run: bool,
    },
    /// Legacy positional invocation: DESCRIPTION RANGE_ID [CONFIG].
    Legacy {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

/// Parses arguments and runs the requested command, returning the process
/// exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();

    let settings = match Settings::discover(cli.config.as_deref(), &LocalFile) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("* ERROR: cyris: {err}");
            return EXIT_FAILURE;
        }
    };

    let mut log_settings = settings.log.clone();
    if cli.verbose {
        log_settings.level = "debug".to_string();
    }
    let _guard = match crate::logging::try_init_tracing(&log_settings, &settings.log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("* WARNING: cyris: logging disabled: {err}");
            None
        }
    };

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            eprintln!("\ninterrupted, finishing current operation...");
            cancel.cancel();
        }) {
            debug!(%err, "could not install interrupt handler");
        }
    }

    let exit_code = commands::dispatch(cli.command, settings, cancel.clone(), cli.verbose);
    if cancel.is_cancelled() {
        EXIT_INTERRUPTED
    } else {
        exit_code
    }
}

/// Wires the full component graph for one invocation.
pub fn build_orchestrator(
    settings: &Settings,
    network_mode: NetworkMode,
    strict_tasks: bool,
    cancel: CancelFlag,
) -> RangeOrchestrator {
    let uri = settings.libvirt_uri.clone().unwrap_or_else(|| {
        match network_mode {
            NetworkMode::User => defaults::LIBVIRT_SESSION_URI,
            NetworkMode::Bridge => defaults::LIBVIRT_SYSTEM_URI,
        }
        .to_string()
    });

    let hypervisor: Arc<dyn Hypervisor> = Arc::new(LibvirtClient::new(uri));
    let executor = Arc::new(
        CommandExecutor::new(Arc::new(SystemCommandRunner)).with_cancel_flag(cancel.clone()),
    );
    let store = Arc::new(
        MetadataStore::open(settings.metadata_path())
            .unwrap_or_else(|err| {
                eprintln!("* ERROR: cyris: {err}");
                std::process::exit(EXIT_FAILURE);
            }),
    );

    let bridges = Arc::new(BridgeManager::new(Arc::clone(&executor)));
    let topology = Arc::new(
        TopologyManager::new(Arc::clone(&hypervisor), bridges)
            .with_cidr_overrides(&settings.network_cidrs)
            .with_mode(network_mode),
    );
    let firewall = Arc::new(
        FirewallManager::new(
            Arc::clone(&executor),
            settings.cyber_range_dir.join("firewall-backups"),
        )
        .with_sudo(settings.use_sudo),
    );
    let image_builder = Arc::new(
        ImageBuilder::new(Arc::clone(&executor)).with_build_permits(settings.build_permits),
    );
    let task_executor = Arc::new(
        TaskExecutor::new(Arc::clone(&executor)).with_strict(strict_tasks || settings.strict_tasks),
    );
    let discovery = Arc::new(
        IpDiscovery::new(Arc::clone(&hypervisor), Arc::clone(&executor))
            .with_topology_source(Arc::clone(&store) as _)
            .with_cache_ttl(std::time::Duration::from_secs(settings.ip_cache_ttl_secs)),
    );

    RangeOrchestrator::new(
        settings.clone(),
        hypervisor,
        store,
        topology,
        firewall,
        image_builder,
        task_executor,
        discovery,
    )
    .with_cancel_flag(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_coherent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_create_flags_parse() {
        let cli = Cli::parse_from([
            "cyris",
            "create",
            "range.yml",
            "--range-id",
            "125",
            "--dry-run",
            "--network-mode",
            "bridge",
            "--strict-tasks",
        ]);
        match cli.command {
            Command::Create {
                range_id,
                dry_run,
                network_mode,
                strict_tasks,
                ..
            } => {
                assert_eq!(range_id.as_deref(), Some("125"));
                assert!(dry_run);
                assert_eq!(network_mode, NetworkModeArg::Bridge);
                assert!(strict_tasks);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_subcommand_names_match_the_contract() {
        for args in [
            vec!["cyris", "list", "--all"],
            vec!["cyris", "status", "125", "-v"],
            vec!["cyris", "list", "-v"],
            vec!["cyris", "destroy", "125", "--force", "--rm"],
            vec!["cyris", "rm", "125", "--force"],
            vec!["cyris", "ssh-info", "125"],
            vec!["cyris", "config-show"],
            vec!["cyris", "config-init", "--output", "/tmp/c.yml"],
            vec!["cyris", "validate"],
            vec!["cyris", "setup-permissions", "--dry-run"],
            vec!["cyris", "legacy", "range.yml", "125"],
        ] {
            Cli::try_parse_from(&args).unwrap_or_else(|err| panic!("{args:?}: {err}"));
        }
    }
}
