//! # sysback CLI
//!
//! Command-line front end for whole-system snapshots.
//!
//! ## Usage
//! ```bash
//! # Capture the running system
//! sysback backup --label nightly
//!
//! # Show what exists
//! sysback list
//!
//! # Re-hash an archive (and decode it fully)
//! sysback verify 20240309-140507_nightly --deep
//!
//! # Show what a restore would run, without touching the disk
//! sysback restore 20240309-140507_nightly --device /dev/sdb --boot uefi \
//!     -p efi:512M:fat32 -p swap:2G:swap -p root:remaining:ext4 --dry-run
//!
//! # Restore into partitions that already exist, leaving the table alone
//! sysback restore 20240309-140507_nightly --device /dev/sda --boot uefi \
//!     --mode partition --root-part /dev/sda3 --efi-part /dev/sda1 --yes
//!
//! # Make an existing disk bootable again
//! sysback boot-fix --disk /dev/sdb --boot uefi
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysback::utils::format_bytes;
use sysback::{
    planned_commands, BootFixRequest, BootTarget, CompressionMode, Config, ExclusionRules,
    ExistingPartition, FilesystemType, PartitionRole, PartitionSpec, ProgressCallback, ProgressInfo, RestorePlan, Snapshot, SnapshotStatus, Sysback,
    SysbackBuilder, SysbackError,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// sysback - whole-system snapshots and bare-metal restore
#[derive(Parser)]
#[command(name = "sysback")]
#[command(version)]
#[command(about = "Snapshot a Linux system and restore it onto a fresh disk")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = sysback::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the state directory (catalog and lock)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Override the snapshots directory
    #[arg(long, global = true)]
    snapshots_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List snapshots, newest first
    List {
        /// Print the catalog records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Capture a new snapshot
    Backup {
        /// Label appended to the snapshot id
        #[arg(short, long)]
        label: Option<String>,

        /// Tree to capture (defaults to the configured source root)
        #[arg(long)]
        source: Option<PathBuf>,

        /// Extra exclusion patterns, on top of the excludes file
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Payload compression
        #[arg(long)]
        compression: Option<CompressionMode>,

        /// Descend into other mounted filesystems
        #[arg(long)]
        cross_filesystems: bool,

        /// Hide the progress spinner
        #[arg(long)]
        no_progress: bool,
    },

    /// Restore a snapshot onto a device, erasing it
    Restore {
        /// Snapshot id
        snapshot: String,

        /// Target block device, e.g. /dev/sdb
        #[arg(short, long)]
        device: PathBuf,

        /// Repartition the whole disk, or reuse existing partitions
        #[arg(long, value_enum, default_value_t = RestoreModeArg::Disk)]
        mode: RestoreModeArg,

        /// Partition as role:size:fs[:mount], in table order (disk mode)
        #[arg(short, long = "partition")]
        partitions: Vec<PartitionSpec>,

        /// Existing root partition (partition mode)
        #[arg(long)]
        root_part: Option<PathBuf>,

        /// Filesystem for the existing root partition
        #[arg(long, default_value = "ext4")]
        root_fs: FilesystemType,

        /// Existing EFI system partition, mounted without formatting (partition mode)
        #[arg(long)]
        efi_part: Option<PathBuf>,

        /// Existing swap partition, reinitialised with mkswap (partition mode)
        #[arg(long)]
        swap_part: Option<PathBuf>,

        /// Keep the existing root filesystem instead of recreating it
        #[arg(long)]
        no_format: bool,

        /// Firmware type of the target machine
        #[arg(short, long, default_value = "uefi")]
        boot: BootTarget,

        /// Where the new root is assembled
        #[arg(long, default_value = "/mnt/sysback-target")]
        staging: PathBuf,

        /// Print the device commands instead of running them
        #[arg(long)]
        dry_run: bool,

        /// Confirm that everything on the device may be destroyed
        #[arg(long)]
        yes: bool,
    },

    /// Re-hash snapshot archives and update their status
    Verify {
        /// Snapshot id
        #[arg(required_unless_present = "all")]
        snapshot: Option<String>,

        /// Verify every snapshot
        #[arg(long, conflicts_with = "snapshot")]
        all: bool,

        /// Also decode every record
        #[arg(long)]
        deep: bool,
    },

    /// Delete snapshots and their archives
    Prune {
        /// Snapshot id
        #[arg(required_unless_present = "keep")]
        snapshot: Option<String>,

        /// Keep only this many of the newest snapshots
        #[arg(long, conflicts_with = "snapshot")]
        keep: Option<usize>,
    },

    /// Reinstall the bootloader on a restored disk
    BootFix {
        /// Disk holding the system
        #[arg(long)]
        disk: PathBuf,

        /// Firmware type
        #[arg(short, long, default_value = "uefi")]
        boot: BootTarget,

        /// Root partition (detected when omitted)
        #[arg(long)]
        root: Option<PathBuf>,

        /// EFI system partition (detected when omitted)
        #[arg(long)]
        esp: Option<PathBuf>,

        /// Temporary mount point
        #[arg(long, default_value = "/mnt/sysback-bootfix")]
        mount_point: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RestoreModeArg {
    /// Wipe and repartition the device
    Disk,
    /// Reuse partitions that already exist
    Partition,
}

fn main() {
    let cli = Cli::parse();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let code = match e.downcast_ref::<SysbackError>() {
            Some(err) => {
                eprintln!("{}: {}", "Error".red().bold(), err.user_message());
                err.exit_code()
            }
            None => {
                eprintln!("{}: {:#}", "Error".red().bold(), e);
                sysback::error::exit_code::GENERAL
            }
        };
        std::process::exit(code);
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_filter(stderr_filter);

    // Skipped silently when not writable, e.g. when not running as root.
    let file_layer = log_file
        .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok())
        .map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_filter(EnvFilter::new("info"))
        });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose, None);
            return Err(e.into());
        }
    };
    init_logging(cli.verbose, config.log_file.as_deref());

    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Some(dir) = cli.snapshots_dir {
        config.snapshots_dir = Some(dir);
    }

    match cli.command {
        Commands::List { json } => cmd_list(config, json),
        Commands::Backup {
            label,
            source,
            exclude,
            compression,
            cross_filesystems,
            no_progress,
        } => {
            if let Some(source) = source {
                config.source_root = source;
            }
            if let Some(mode) = compression {
                config.compression = mode;
            }
            if cross_filesystems {
                config.one_file_system = false;
            }
            cmd_backup(config, label, exclude, !no_progress)
        }
        Commands::Restore {
            snapshot,
            device,
            mode,
            partitions,
            root_part,
            root_fs,
            efi_part,
            swap_part,
            no_format,
            boot,
            staging,
            dry_run,
            yes,
        } => {
            let plan = RestorePlan::new(device, boot, staging);
            let plan = match mode {
                RestoreModeArg::Disk => partitions.into_iter().fold(plan, RestorePlan::partition),
                RestoreModeArg::Partition => {
                    let existing = root_part
                        .map(|node| ExistingPartition::new(PartitionRole::Root, node, root_fs).with_format(!no_format))
                        .into_iter()
                        .chain(efi_part.map(|node| ExistingPartition::new(PartitionRole::Efi, node, FilesystemType::Fat32)))
                        .chain(swap_part.map(|node| {
                            ExistingPartition::new(PartitionRole::Swap, node, FilesystemType::Swap).with_format(true)
                        }));
                    // Explicit -p in partition mode is left for validation to reject.
                    let plan = existing.fold(plan.in_partition_mode(), RestorePlan::existing);
                    partitions.into_iter().fold(plan, RestorePlan::partition)
                }
            };
            cmd_restore(config, snapshot, plan, dry_run, yes)
        }
        Commands::Verify { snapshot, all, deep } => cmd_verify(config, snapshot, all, deep),
        Commands::Prune { snapshot, keep } => cmd_prune(config, snapshot, keep),
        Commands::BootFix {
            disk,
            boot,
            root,
            esp,
            mount_point,
        } => cmd_boot_fix(
            config,
            BootFixRequest {
                disk,
                boot,
                root,
                esp,
                mount_point,
            },
        ),
    }
}

fn require_root(action: &str) -> anyhow::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("{} needs root privileges", action);
    }
    Ok(())
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |info: ProgressInfo| {
        pb.set_message(format!(
            "{}: {} entries, {}",
            info.operation,
            info.processed,
            format_bytes(info.bytes_processed)
        ));
    })
}

fn open(config: Config) -> sysback::Result<Sysback> {
    SysbackBuilder::new().config(config).build()
}

fn status_colored(status: SnapshotStatus) -> ColoredString {
    match status {
        SnapshotStatus::Verified => status.to_string().green(),
        SnapshotStatus::Pending => status.to_string().yellow(),
        SnapshotStatus::Corrupt => status.to_string().red().bold(),
    }
}

/// List snapshots
fn cmd_list(config: Config, json: bool) -> anyhow::Result<()> {
    let sysback = open(config)?;
    let snapshots = sysback.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }
    if snapshots.is_empty() {
        println!("{}", "No snapshots found".yellow());
        return Ok(());
    }

    println!("{}", "Snapshots:".blue().bold());
    for snapshot in &snapshots {
        println!(
            "  {} [{}] {} {} entries, {}",
            snapshot.id.yellow().bold(),
            status_colored(snapshot.status),
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            snapshot.entry_count,
            format_bytes(snapshot.compressed_size)
        );
    }
    Ok(())
}

/// Capture a snapshot
fn cmd_backup(config: Config, label: Option<String>, extra: Vec<String>, show_progress: bool) -> anyhow::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        println!(
            "{} not running as root; unreadable files will abort the backup",
            "Warning:".yellow().bold()
        );
    }

    let mut patterns = config.exclusion_rules()?.patterns().to_vec();
    patterns.extend(extra);
    let rules = ExclusionRules::new(patterns)?;

    println!(
        "{} {}",
        "Backing up".blue().bold(),
        config.source_root.display().to_string().cyan()
    );
    let pb = show_progress.then(|| spinner("Scanning..."));
    let mut builder = SysbackBuilder::new().config(config).exclusion_rules(rules);
    if let Some(pb) = &pb {
        builder = builder.progress(progress_callback(pb));
    }
    let sysback = builder.build()?;

    let report = sysback.backup(label.as_deref());
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let report = report?;
    let snapshot = &report.snapshot;

    if snapshot.status == SnapshotStatus::Corrupt {
        print_snapshot(snapshot);
        return Err(SysbackError::SnapshotCorrupt(snapshot.id.clone()).into());
    }

    println!("{} Created snapshot {}", "✓".green().bold(), snapshot.id.yellow().bold());
    print_snapshot(snapshot);
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("  Status: {}", status_colored(snapshot.status));
    println!("  Entries: {}", snapshot.entry_count.to_string().cyan());
    println!("  Data: {}", format_bytes(snapshot.uncompressed_size).cyan());
    println!("  Archive: {} ({})", snapshot.archive_path.display(), format_bytes(snapshot.compressed_size));
    println!("  Checksum: {}", snapshot.checksum.dimmed());
}

/// Restore a snapshot onto a device
fn cmd_restore(config: Config, id: String, plan: RestorePlan, dry_run: bool, yes: bool) -> anyhow::Result<()> {
    plan.validate()?;

    if dry_run {
        println!("{} {} onto {}", "Dry run: restoring".blue().bold(), id.yellow(), plan.device.display());
        for command in planned_commands(&plan)? {
            println!("  {}", command);
        }
        println!("  (archive extraction and /etc/fstab generation follow provisioning)");
        return Ok(());
    }

    if !yes {
        return Err(SysbackError::InvalidPlan(format!(
            "this destroys data on {}; re-run with --yes to confirm",
            plan.device.display()
        ))
        .into());
    }
    require_root("restore")?;

    let device = plan.device.clone();
    println!(
        "{} {} onto {}",
        "Restoring".blue().bold(),
        id.yellow().bold(),
        device.display().to_string().cyan()
    );
    println!(
        "{} do not interrupt once partitioning has started; the disk will be left unusable",
        "Warning:".red().bold()
    );

    let pb = spinner("Verifying archive...");
    let sysback = SysbackBuilder::new()
        .config(config)
        .progress(progress_callback(&pb))
        .build()?;
    let result = sysback.restore(&id, plan);
    pb.finish_and_clear();
    let report = result?;

    println!("{} Restore complete", "✓".green().bold());
    println!("  Entries restored: {}", report.entries_restored.to_string().cyan());
    println!("  Bytes written: {}", format_bytes(report.bytes_written).cyan());
    for partition in &report.layout.partitions {
        println!(
            "  {} {} {}",
            partition.node.display(),
            partition.spec.role,
            partition.spec.filesystem
        );
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );

    if !report.warnings.is_empty() {
        println!("\n{}", "Warnings:".yellow().bold());
        for warning in &report.warnings {
            println!("  - {}", warning.yellow());
        }
    }
    Ok(())
}

/// Verify one or all snapshots
fn cmd_verify(config: Config, id: Option<String>, all: bool, deep: bool) -> anyhow::Result<()> {
    let sysback = open(config)?;
    let ids: Vec<String> = match (id, all) {
        (Some(id), _) => vec![id],
        (None, true) => sysback.list()?.into_iter().map(|s| s.id).collect(),
        (None, false) => bail!("name a snapshot or pass --all"),
    };

    let mut first_corrupt = None;
    for id in ids {
        let report = sysback.verify(&id, deep)?;
        if report.is_valid() {
            println!("{} {}", "✓".green().bold(), report.summary());
        } else {
            println!("{} {}", "✗".red().bold(), report.summary().red());
            first_corrupt.get_or_insert(id);
        }
    }

    match first_corrupt {
        Some(id) => Err(SysbackError::SnapshotCorrupt(id).into()),
        None => Ok(()),
    }
}

/// Delete snapshots
fn cmd_prune(config: Config, id: Option<String>, keep: Option<usize>) -> anyhow::Result<()> {
    let sysback = open(config)?;
    let removed = match (id, keep) {
        (Some(id), _) => vec![sysback.prune(&id)?],
        (None, Some(keep)) => sysback.prune_keep_latest(keep)?,
        (None, None) => bail!("name a snapshot or pass --keep"),
    };

    for snapshot in &removed {
        println!(
            "{} Removed {} ({})",
            "✓".green().bold(),
            snapshot.id.yellow(),
            format_bytes(snapshot.compressed_size)
        );
    }
    if removed.is_empty() {
        println!("{}", "Nothing to prune".yellow());
    }
    Ok(())
}

/// Reinstall the bootloader
fn cmd_boot_fix(config: Config, request: BootFixRequest) -> anyhow::Result<()> {
    require_root("boot-fix")?;
    println!(
        "{} on {} ({})",
        "Repairing bootloader".blue().bold(),
        request.disk.display(),
        request.boot
    );
    let sysback = open(config)?;
    sysback.boot_fix(&request)?;
    println!("{} Bootloader reinstalled", "✓".green().bold());
    Ok(())
}
