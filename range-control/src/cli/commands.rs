//! Command handlers behind the CLI routing layer.

use std::path::{Path, PathBuf};

use fs::writer_file::FileWriter;
use fs::LocalFile;

use crate::cli::{build_orchestrator, Command, NetworkModeArg, EXIT_FAILURE, EXIT_SUCCESS};
use crate::config::description::RangeDescription;
use crate::config::settings::Settings;
use crate::defaults;
use crate::network::topology::NetworkMode;
use crate::operation::OperationTracker;
use crate::range::entity::RangeStatus;
use crate::range::error::RangeError;
use crate::range::orchestrator::{CreateOptions, CreateOutcome, RangeOrchestrator, Verdict};
use crate::utils::cancel::CancelFlag;

pub fn dispatch(command: Command, settings: Settings, cancel: CancelFlag, verbose: bool) -> i32 {
    match command {
        Command::Create {
            description_file,
            range_id,
            dry_run,
            network_mode,
            enable_ssh,
            strict_tasks,
            keep_on_failure,
        } => create(
            &settings,
            cancel,
            &description_file,
            CreateOptions {
                range_id,
                dry_run,
                enable_ssh,
                cleanup_on_failure: !keep_on_failure,
            },
            network_mode,
            strict_tasks,
        ),
        Command::List { range_id, all } => {
            list(&settings, cancel, range_id.as_deref(), all, verbose)
        }
        Command::Status { range_id } => status(&settings, cancel, &range_id, verbose),
        Command::Destroy {
            range_id,
            force,
            rm,
        } => destroy(&settings, cancel, &range_id, force, rm),
        Command::Rm { range_id, force } => remove(&settings, cancel, &range_id, force),
        Command::SshInfo { range_id } => ssh_info(&settings, cancel, &range_id),
        Command::ConfigShow => config_show(&settings),
        Command::ConfigInit { output } => config_init(output.as_deref()),
        Command::Validate => validate(&settings, cancel),
        Command::SetupPermissions { dry_run } => setup_permissions(&settings, cancel, dry_run),
        Command::Legacy { args } => legacy(&settings, cancel, &args),
    }
}

fn orchestrator(
    settings: &Settings,
    cancel: CancelFlag,
    network_mode: NetworkMode,
    strict_tasks: bool,
) -> RangeOrchestrator {
    build_orchestrator(settings, network_mode, strict_tasks, cancel)
}

fn fail(err: &RangeError) -> i32 {
    eprintln!("* ERROR: cyris: {err}");
    if let Some(hint) = err.hint() {
        eprintln!("  hint: {hint}");
    }
    EXIT_FAILURE
}

fn create(
    settings: &Settings,
    cancel: CancelFlag,
    description_file: &Path,
    options: CreateOptions,
    network_mode: NetworkModeArg,
    strict_tasks: bool,
) -> i32 {
    let description = match RangeDescription::load(description_file, &LocalFile) {
        Ok(description) => description,
        Err(err) => return fail(&err.into()),
    };

    let orchestrator = orchestrator(settings, cancel, network_mode.into(), strict_tasks);
    match orchestrator.create_range(&description, &options) {
        Ok(outcome) => report_create(&outcome, options.dry_run),
        Err(err) => {
            println!("FAILURE");
            fail(&err)
        }
    }
}

fn report_create(outcome: &CreateOutcome, dry_run: bool) -> i32 {
    match &outcome.verdict {
        Verdict::Success => {
            if dry_run {
                println!("Dry run passed for range {}.", outcome.range_id);
            } else {
                println!("SUCCESS");
                println!("Range {} is active.", outcome.range_id);
            }
            EXIT_SUCCESS
        }
        Verdict::SuccessWithWarnings(warnings) => {
            println!("SUCCESS_WITH_WARNINGS");
            println!("Range {} is active.", outcome.range_id);
            for warning in warnings {
                println!("  warning: {warning}");
            }
            EXIT_SUCCESS
        }
        Verdict::Failure { cause, hint } => {
            println!("FAILURE");
            eprintln!("* ERROR: cyris: {cause}");
            if let Some(hint) = hint {
                eprintln!("  hint: {hint}");
            }
            eprintln!(
                "  operations: {} total, {} failed, {} rolled back",
                outcome.summary.total_operations, outcome.summary.fail_count, outcome.rollbacks
            );
            EXIT_FAILURE
        }
    }
}

fn list(
    settings: &Settings,
    cancel: CancelFlag,
    range_id: Option<&str>,
    all: bool,
    verbose: bool,
) -> i32 {
    let orchestrator = orchestrator(settings, cancel, NetworkMode::User, false);
    let ranges: Vec<_> = orchestrator
        .list_ranges()
        .into_iter()
        .filter(|range| range_id.map_or(true, |id| range.range_id == id))
        .filter(|range| all || range.status != RangeStatus::Destroyed)
        .collect();

    if ranges.is_empty() {
        println!("No cyber ranges found.");
        return EXIT_SUCCESS;
    }

    println!("{:<12} {:<12} {:<8} {:<24}", "RANGE", "STATUS", "GUESTS", "CREATED");
    for range in &ranges {
        println!(
            "{:<12} {:<12} {:<8} {:<24}",
            range.range_id,
            range.status.to_string(),
            range.vm_ips.len(),
            range.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        if verbose {
            print_detailed(&orchestrator, &range.range_id);
        }
    }
    EXIT_SUCCESS
}

fn status(settings: &Settings, cancel: CancelFlag, range_id: &str, verbose: bool) -> i32 {
    let orchestrator = orchestrator(settings, cancel, NetworkMode::User, false);
    let Some(range) = orchestrator.get_range(range_id) else {
        return fail(&RangeError::NotFound(range_id.to_string()));
    };

    println!("Range:    {}", range.range_id);
    println!("Status:   {}", range.status);
    println!("Owner:    {}", range.owner);
    println!("Created:  {}", range.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Modified: {}", range.last_modified.format("%Y-%m-%d %H:%M:%S UTC"));
    if !range.networks.is_empty() {
        println!("Networks:");
        for network in range.networks.values() {
            println!("  {} ({}) gateway {}", network.full_name, network.cidr, network.gateway);
        }
    }

    if verbose {
        print_detailed(&orchestrator, range_id);
    } else {
        for (guest_id, ip) in sorted(&range.vm_ips) {
            println!("  guest {guest_id}: {ip}");
        }
    }
    EXIT_SUCCESS
}

fn print_detailed(orchestrator: &RangeOrchestrator, range_id: &str) {
    match orchestrator.get_range_status_detailed(range_id) {
        Ok(detailed) => {
            for guest in &detailed.guests {
                let state = guest
                    .state
                    .map(|state| state.to_string())
                    .unwrap_or_else(|| "undefined".to_string());
                println!(
                    "  guest {:<16} {:<10} {:<18} ssh:{}",
                    guest.guest_id,
                    state,
                    guest.ip_addresses.first().map(String::as_str).unwrap_or("-"),
                    if guest.ssh_reachable { "up" } else { "down" },
                );
            }
        }
        Err(err) => eprintln!("  (live status unavailable: {err})"),
    }
}

fn destroy(settings: &Settings, cancel: CancelFlag, range_id: &str, force: bool, rm: bool) -> i32 {
    let orchestrator = orchestrator(settings, cancel, NetworkMode::User, false);
    if let Err(err) = orchestrator.destroy_range(range_id) {
        if !(force && matches!(err, RangeError::Transition(_))) {
            return fail(&err);
        }
    }
    println!("Range {range_id} destroyed.");

    if rm {
        if let Err(err) = orchestrator.remove_range(range_id, force) {
            return fail(&err);
        }
        println!("Range {range_id} removed.");
    }
    EXIT_SUCCESS
}

fn remove(settings: &Settings, cancel: CancelFlag, range_id: &str, force: bool) -> i32 {
    let orchestrator = orchestrator(settings, cancel, NetworkMode::User, false);
    match orchestrator.remove_range(range_id, force) {
        Ok(()) => {
            println!("Range {range_id} removed.");
            EXIT_SUCCESS
        }
        Err(err) => fail(&err),
    }
}

fn ssh_info(settings: &Settings, cancel: CancelFlag, range_id: &str) -> i32 {
    let orchestrator = orchestrator(settings, cancel, NetworkMode::User, false);
    let Some(range) = orchestrator.get_range(range_id) else {
        return fail(&RangeError::NotFound(range_id.to_string()));
    };

    if range.vm_ips.is_empty() {
        println!("Range {range_id} has no guests with addresses.");
        return EXIT_SUCCESS;
    }
    println!("SSH access for range {range_id}:");
    for (guest_id, ip) in sorted(&range.vm_ips) {
        println!("  {guest_id}: ssh root@{ip}");
    }
    EXIT_SUCCESS
}

fn config_show(settings: &Settings) -> i32 {
    print!("{}", settings.render());
    EXIT_SUCCESS
}

fn config_init(output: Option<&Path>) -> i32 {
    let path = output.unwrap_or_else(|| Path::new("config.yml"));
    if path.exists() {
        eprintln!(
            "* ERROR: cyris: `{}` already exists; refusing to overwrite",
            path.display()
        );
        return EXIT_FAILURE;
    }
    match LocalFile.write(path, Settings::template()) {
        Ok(()) => {
            println!("Wrote configuration template to {}.", path.display());
            EXIT_SUCCESS
        }
        Err(err) => {
            eprintln!("* ERROR: cyris: {err}");
            EXIT_FAILURE
        }
    }
}

/// Environment check list: toolchain, hypervisor connectivity, range
/// directory. Prints every check; exits 1 when any fails.
fn validate(settings: &Settings, cancel: CancelFlag) -> i32 {
    use crate::command::{CommandExecutor, SystemCommandRunner};
    use crate::image::ImageBuilder;
    use std::sync::Arc;

    let executor = Arc::new(
        CommandExecutor::new(Arc::new(SystemCommandRunner)).with_cancel_flag(cancel.clone()),
    );
    let tracker = OperationTracker::new("validate");
    let mut ok = true;

    let builder = ImageBuilder::new(Arc::clone(&executor));
    match builder.check_toolchain(&tracker) {
        Ok(()) => println!("  [ok] image toolchain (virt-builder, virt-customize, virt-install)"),
        Err(err) => {
            println!("  [!!] image toolchain: {err}");
            ok = false;
        }
    }

    let orchestrator = orchestrator(settings, cancel, NetworkMode::User, false);
    let known_ranges = orchestrator.list_ranges().len();
    println!("  [ok] metadata store ({known_ranges} ranges)");

    use crate::hypervisor::{Hypervisor, LibvirtClient};
    let uri = settings
        .libvirt_uri
        .clone()
        .unwrap_or_else(|| defaults::LIBVIRT_SESSION_URI.to_string());
    let client = LibvirtClient::new(uri.clone());
    match client.list_domains(false) {
        Ok(domains) => println!("  [ok] hypervisor at {uri} ({} domains)", domains.len()),
        Err(err) => {
            println!("  [!!] hypervisor at {uri}: {err}");
            ok = false;
        }
    }

    let probe_dir = settings.cyber_range_dir.join(".write-probe");
    match std::fs::create_dir_all(&probe_dir).and_then(|_| std::fs::remove_dir(&probe_dir)) {
        Ok(()) => println!(
            "  [ok] cyber range directory {} is writable",
            settings.cyber_range_dir.display()
        ),
        Err(err) => {
            println!(
                "  [!!] cyber range directory {}: {err}",
                settings.cyber_range_dir.display()
            );
            ok = false;
        }
    }

    if ok {
        println!("Environment looks good.");
        EXIT_SUCCESS
    } else {
        println!("Environment has problems; fix the items marked [!!].");
        EXIT_FAILURE
    }
}

fn setup_permissions(settings: &Settings, cancel: CancelFlag, dry_run: bool) -> i32 {
    use crate::command::{CommandExecutor, CommandSpec, SystemCommandRunner};
    use std::sync::Arc;

    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
    let commands = [
        format!("usermod -aG libvirt {user}"),
        format!("usermod -aG kvm {user}"),
        format!(
            "setfacl -m u:libvirt-qemu:rx {}",
            settings.cyber_range_dir.display()
        ),
    ];

    if dry_run {
        println!("Commands that would be executed (as root):");
        for command in &commands {
            println!("  {command}");
        }
        return EXIT_SUCCESS;
    }

    let executor = Arc::new(
        CommandExecutor::new(Arc::new(SystemCommandRunner)).with_cancel_flag(cancel),
    );
    let tracker = OperationTracker::new("setup-permissions");
    let mut ok = true;
    for command in &commands {
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or_default();
        let spec = CommandSpec::new("sudo")
            .arg("-n")
            .arg(program)
            .args(parts.map(str::to_string))
            .context("Host permission setup");
        match executor.execute(&tracker, &spec) {
            Ok(result) if result.success => println!("  [ok] {command}"),
            Ok(result) => {
                println!("  [!!] {command}: {}", result.stderr.trim());
                ok = false;
            }
            Err(err) => {
                println!("  [!!] {command}: {err}");
                ok = false;
            }
        }
    }
    if ok {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

/// Legacy positional form: `cyris legacy DESCRIPTION RANGE_ID [CONFIG]`.
fn legacy(settings: &Settings, cancel: CancelFlag, args: &[String]) -> i32 {
    let Some(description_file) = args.first() else {
        eprintln!("* ERROR: cyris: legacy usage: cyris legacy DESCRIPTION RANGE_ID [CONFIG]");
        return EXIT_FAILURE;
    };
    let range_id = args.get(1).cloned();

    let effective_settings = match args.get(2) {
        Some(config_path) => match Settings::load(Path::new(config_path), &LocalFile) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("* ERROR: cyris: {err}");
                return EXIT_FAILURE;
            }
        },
        None => settings.clone(),
    };

    create(
        &effective_settings,
        cancel,
        &PathBuf::from(description_file),
        CreateOptions {
            range_id,
            ..CreateOptions::default()
        },
        NetworkModeArg::User,
        false,
    )
}

fn sorted(map: &std::collections::HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(key, _)| key.clone());
    entries
}
