//! Device provisioning
//!
//! Turns a [`RestorePlan`] into a partitioned, formatted and mounted target.
//! The steps are strictly ordered and destructive:
//!
//! 1. `WipeSignatures` - `wipefs -a`
//! 2. `Partition` - `parted mklabel` plus one `mkpart` per planned partition
//! 3. `ReloadPartitionTable` - `partprobe`, `udevadm settle`, wait for nodes
//! 4. `Format` - `mkfs.*` / `mkswap`
//! 5. `Mount` - root at the staging point, then deeper mount points
//!
//! In partition mode ([`RestoreMode::Partition`]) the first three steps are
//! skipped: the existing partitions are formatted only where asked and then
//! mounted.
//!
//! A failing step aborts with [`SysbackError::Device`] naming the step. There
//! is no rollback: once the partition table is written the old layout is gone.
//!
//! Every external command goes through the [`Executor`] trait. The
//! [`SystemExecutor`] runs real processes; the [`RecordingExecutor`] only
//! records command lines and is used for dry runs and tests.

use crate::error::{Result, SysbackError};
use crate::types::{
    BootTarget, ExistingPartition, FilesystemType, MountRecord, MountedLayout, PartitionRole,
    PartitionSize, ProvisionStep, ProvisionedPartition, RestoreMode, RestorePlan, StageLog,
};
use crate::utils::{self, MountEntry};
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Default time to wait for partition nodes to appear
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(10);

/// First partition starts here, leaving room for the label and GRUB
const FIRST_PARTITION_START_MIB: u64 = 1;

/// An external command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program name, resolved through `PATH`
    pub program: String,
    /// Arguments
    pub args: Vec<OsString>,
}

impl CommandLine {
    /// Start a command line
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs external commands and touches the host filesystem on behalf of the
/// provisioner and bootloader installer
pub trait Executor: Send + Sync {
    /// Run a command to completion, returning its stdout
    ///
    /// A non-zero exit is an error.
    fn run(&self, command: &CommandLine) -> Result<String>;

    /// Whether a path exists (used to wait for device nodes)
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Create a directory and its parents
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| SysbackError::path_io(path, e))
    }

    /// Current mount table
    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        utils::read_mount_table()
    }

    /// Devices currently in use as swap
    fn active_swaps(&self) -> Result<Vec<PathBuf>> {
        utils::read_swaps()
    }

    /// Write a file on the target
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        utils::atomic_write(path, contents)
    }
}

/// Executor that runs real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(&self, command: &CommandLine) -> Result<String> {
        info!("Running {}", command);
        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .map_err(|e| SysbackError::Command {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SysbackError::Command {
                command: command.to_string(),
                message: match output.status.code() {
                    Some(code) => format!("exit code {}: {}", code, stderr),
                    None => format!("terminated by signal: {}", stderr),
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Executor that records commands instead of running them
///
/// Canned stdout can be registered per command prefix, and commands can be
/// made to fail, which lets tests drive every provisioning branch without a
/// real block device.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<CommandLine>>,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
    files: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    missing_paths: Mutex<Vec<PathBuf>>,
    mounts: Mutex<Vec<MountEntry>>,
    swaps: Mutex<Vec<PathBuf>>,
}

impl RecordingExecutor {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `stdout` for commands whose rendered line starts with `prefix`
    pub fn with_response(self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.responses.lock().push((prefix.into(), stdout.into()));
        self
    }

    /// Fail commands whose rendered line starts with `prefix`
    pub fn failing_on(self, prefix: impl Into<String>) -> Self {
        self.failures.lock().push(prefix.into());
        self
    }

    /// Report this path as missing from [`Executor::path_exists`]
    pub fn with_missing_path(self, path: impl Into<PathBuf>) -> Self {
        self.missing_paths.lock().push(path.into());
        self
    }

    /// Report `source` as mounted at `target` in [`Executor::mount_table`]
    pub fn with_mount(self, source: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        self.mounts.lock().push(MountEntry {
            source: source.into(),
            target: target.into(),
            fstype: "ext4".to_string(),
        });
        self
    }

    /// Report `node` as active swap in [`Executor::active_swaps`]
    pub fn with_active_swap(self, node: impl Into<PathBuf>) -> Self {
        self.swaps.lock().push(node.into());
        self
    }

    /// Commands run so far
    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.lock().clone()
    }

    /// Commands run so far, rendered
    pub fn rendered(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.to_string()).collect()
    }

    /// Files that would have been written
    pub fn files_written(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.files.lock().clone()
    }
}

impl Executor for RecordingExecutor {
    fn run(&self, command: &CommandLine) -> Result<String> {
        let rendered = command.to_string();
        debug!("Recording {}", rendered);
        self.calls.lock().push(command.clone());

        if self.failures.lock().iter().any(|p| rendered.starts_with(p.as_str())) {
            return Err(SysbackError::Command {
                command: rendered,
                message: "simulated failure".to_string(),
            });
        }
        Ok(self
            .responses
            .lock()
            .iter()
            .find(|(p, _)| rendered.starts_with(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    fn path_exists(&self, path: &Path) -> bool {
        !self.missing_paths.lock().iter().any(|p| p == path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        trace!("Recording mkdir {}", path.display());
        Ok(())
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>> {
        Ok(self.mounts.lock().clone())
    }

    fn active_swaps(&self) -> Result<Vec<PathBuf>> {
        Ok(self.swaps.lock().clone())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.files.lock().push((path.to_path_buf(), contents.to_vec()));
        Ok(())
    }
}

/// Node of partition `number` on `device`
///
/// `/dev/sda` → `/dev/sda1`; devices whose name ends in a digit
/// (`/dev/nvme0n1`, `/dev/loop0`, `/dev/mmcblk0`) get a `p` separator.
pub fn partition_node(device: &Path, number: u32) -> PathBuf {
    let name = device.as_os_str().to_string_lossy();
    if name.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        PathBuf::from(format!("{}p{}", name, number))
    } else {
        PathBuf::from(format!("{}{}", name, number))
    }
}

/// Whether `node` is `device` itself or one of its partitions
///
/// Follows the naming of [`partition_node`], so `/dev/sdaa1` is not on
/// `/dev/sda` and `/dev/loop10` is not on `/dev/loop1`.
pub fn is_on_device(node: &Path, device: &Path) -> bool {
    let node = node.as_os_str().to_string_lossy();
    let device = device.as_os_str().to_string_lossy();
    let rest = match node.strip_prefix(device.as_ref()) {
        Some("") => return true,
        Some(rest) => rest,
        None => return false,
    };
    let number = if device.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(n) => n,
            None => return false,
        }
    } else {
        rest
    };
    !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
}

/// Filesystem UUID of a node via `blkid`, `None` when blkid reports nothing
pub fn filesystem_uuid(executor: &dyn Executor, node: &Path) -> Result<Option<String>> {
    let out = executor.run(&CommandLine::new("blkid").args(["-s", "UUID", "-o", "value"]).arg(node))?;
    let uuid = out.trim();
    Ok(if uuid.is_empty() { None } else { Some(uuid.to_string()) })
}

/// Something that can prepare a target device and later release it
pub trait Provisioner: Send + Sync {
    /// Partition, format and mount the target described by `plan`
    fn provision(&self, plan: &RestorePlan) -> Result<MountedLayout>;

    /// Unmount everything `provision` mounted, in reverse order, and sync
    fn release(&self, layout: &MountedLayout) -> Result<()>;
}

/// Provisioner driving `wipefs`, `parted`, `mkfs` and `mount`
pub struct DeviceProvisioner {
    executor: Arc<dyn Executor>,
    node_timeout: Duration,
    poll_interval: Duration,
}

impl fmt::Debug for DeviceProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProvisioner")
            .field("node_timeout", &self.node_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn device_err(step: ProvisionStep) -> impl Fn(SysbackError) -> SysbackError {
    move |e| match e {
        SysbackError::Device { .. } | SysbackError::Timeout { .. } => e,
        other => SysbackError::Device {
            step,
            message: other.to_string(),
        },
    }
}

impl DeviceProvisioner {
    /// Create a provisioner using `executor`
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            node_timeout: DEFAULT_NODE_TIMEOUT,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Change how long to wait for partition nodes
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    fn run(&self, step: ProvisionStep, command: CommandLine) -> Result<String> {
        self.executor.run(&command).map_err(device_err(step))
    }

    fn preflight(&self, plan: &RestorePlan) -> Result<()> {
        plan.validate()?;
        let step = ProvisionStep::Preflight;

        if !self.executor.path_exists(&plan.device) {
            return Err(SysbackError::Device {
                step,
                message: format!("target device {} does not exist", plan.device.display()),
            });
        }

        let existing = plan.existing_partitions();
        if let Some(missing) = existing.iter().find(|p| !self.executor.path_exists(&p.node)) {
            return Err(SysbackError::Device {
                step,
                message: format!("partition {} does not exist", missing.node.display()),
            });
        }

        // Disk mode erases the whole device; partition mode only the listed nodes.
        let in_use = |node: &Path| match plan.mode {
            RestoreMode::Disk => is_on_device(node, &plan.device),
            RestoreMode::Partition(_) => existing.iter().any(|p| p.node == node),
        };

        let table = self.executor.mount_table().map_err(device_err(step))?;
        if let Some(busy) = table.iter().find(|m| in_use(Path::new(&m.source))) {
            return Err(SysbackError::Device {
                step,
                message: format!(
                    "{} is mounted at {}; unmount it before restoring",
                    busy.source,
                    busy.target.display()
                ),
            });
        }
        let swaps = self.executor.active_swaps().map_err(device_err(step))?;
        if let Some(swap) = swaps.iter().find(|s| in_use(s.as_path())) {
            return Err(SysbackError::Device {
                step,
                message: format!("{} is active swap; run swapoff before restoring", swap.display()),
            });
        }
        if utils::is_mount_point(&table, &plan.staging) {
            return Err(SysbackError::Device {
                step,
                message: format!("staging point {} is already a mount point", plan.staging.display()),
            });
        }
        Ok(())
    }

    fn partition(&self, plan: &RestorePlan) -> Result<Vec<ProvisionedPartition>> {
        let step = ProvisionStep::Partition;
        let label = match plan.boot {
            BootTarget::Uefi => "gpt",
            BootTarget::Bios => "msdos",
        };
        self.run(step, CommandLine::new("parted").arg("-s").arg(&plan.device).args(["mklabel", label]))?;

        let esp_index = match plan.boot {
            BootTarget::Uefi => plan.efi_partition(),
            BootTarget::Bios => None,
        };

        let mut start = FIRST_PARTITION_START_MIB;
        let mut created = Vec::with_capacity(plan.partitions.len());
        for (i, spec) in plan.partitions.iter().enumerate() {
            let number = (i + 1) as u32;
            let end = match spec.size {
                PartitionSize::Mib(mib) => {
                    let end = start.checked_add(mib).ok_or_else(|| {
                        SysbackError::InvalidPlan(format!("partition {} ends beyond any addressable offset", number))
                    })?;
                    format!("{}MiB", end)
                }
                PartitionSize::Remaining => "100%".to_string(),
            };
            let name = match plan.boot {
                BootTarget::Uefi => spec.role.to_string(),
                BootTarget::Bios => "primary".to_string(),
            };
            self.run(
                step,
                CommandLine::new("parted")
                    .args(["-s", "-a", "optimal"])
                    .arg(&plan.device)
                    .arg("mkpart")
                    .arg(name)
                    .arg(spec.filesystem.parted_hint())
                    .arg(format!("{}MiB", start))
                    .arg(&end),
            )?;

            if esp_index == Some(i) {
                self.run(
                    step,
                    CommandLine::new("parted").arg("-s").arg(&plan.device).arg("set").arg(number.to_string()).args(["esp", "on"]),
                )?;
            } else if plan.boot == BootTarget::Bios && spec.role == PartitionRole::Boot {
                self.run(
                    step,
                    CommandLine::new("parted").arg("-s").arg(&plan.device).arg("set").arg(number.to_string()).args(["boot", "on"]),
                )?;
            }

            if let PartitionSize::Mib(mib) = spec.size {
                start += mib;
            }
            created.push(ProvisionedPartition {
                number,
                node: partition_node(&plan.device, number),
                spec: spec.clone(),
            });
        }
        Ok(created)
    }

    fn reload(&self, plan: &RestorePlan, partitions: &[ProvisionedPartition]) -> Result<()> {
        let step = ProvisionStep::ReloadPartitionTable;
        self.run(step, CommandLine::new("partprobe").arg(&plan.device))?;
        self.run(step, CommandLine::new("udevadm").arg("settle"))?;

        let started = Instant::now();
        loop {
            let missing: Vec<PathBuf> = partitions
                .iter()
                .filter(|p| !self.executor.path_exists(&p.node))
                .map(|p| p.node.clone())
                .collect();
            if missing.is_empty() {
                debug!("All {} partition nodes present", partitions.len());
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.node_timeout {
                return Err(SysbackError::Timeout { missing, waited });
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn format(&self, partitions: &[ProvisionedPartition]) -> Result<()> {
        let step = ProvisionStep::Format;
        for part in partitions {
            let command = match part.spec.filesystem {
                FilesystemType::Ext4 => CommandLine::new("mkfs.ext4").arg("-F"),
                FilesystemType::Xfs => CommandLine::new("mkfs.xfs").arg("-f"),
                FilesystemType::Btrfs => CommandLine::new("mkfs.btrfs").arg("-f"),
                FilesystemType::Fat32 => CommandLine::new("mkfs.vfat").args(["-F", "32"]),
                FilesystemType::Swap => CommandLine::new("mkswap"),
            };
            self.run(step, command.arg(&part.node))?;
        }
        Ok(())
    }

    fn mount(&self, plan: &RestorePlan, partitions: &[ProvisionedPartition]) -> Result<Vec<MountRecord>> {
        let step = ProvisionStep::Mount;
        let mut ordered: Vec<(PathBuf, &ProvisionedPartition)> = partitions
            .iter()
            .filter_map(|p| p.spec.relative_mount().map(|rel| (rel, p)))
            .collect();
        // Root has depth 0, so it always comes first.
        ordered.sort_by_key(|(rel, _)| rel.components().count());

        let mut mounts = Vec::with_capacity(ordered.len());
        for (relative, part) in ordered {
            let mount_path = if relative.as_os_str().is_empty() {
                plan.staging.clone()
            } else {
                plan.staging.join(&relative)
            };
            self.executor.create_dir_all(&mount_path).map_err(device_err(step))?;
            if let Err(e) = self.run(step, CommandLine::new("mount").arg(&part.node).arg(&mount_path)) {
                // Leave nothing half-mounted behind.
                let partial = MountedLayout {
                    device: plan.device.clone(),
                    staging: plan.staging.clone(),
                    partitions: partitions.to_vec(),
                    mounts,
                };
                if let Err(cleanup) = self.release(&partial) {
                    warn!("Cleanup after failed mount also failed: {}", cleanup);
                }
                return Err(e);
            }
            info!("Mounted {} at {}", part.node.display(), mount_path.display());
            mounts.push(MountRecord {
                node: part.node.clone(),
                role: part.spec.role,
                mount_path,
            });
        }
        Ok(mounts)
    }
}

impl DeviceProvisioner {
    fn provision_existing(&self, plan: &RestorePlan, existing: &[ExistingPartition]) -> Result<MountedLayout> {
        let mut steps = StageLog::new("provision", ProvisionStep::Preflight);
        self.preflight(plan)?;

        let partitions: Vec<ProvisionedPartition> = existing
            .iter()
            .map(|p| ProvisionedPartition {
                number: 0,
                node: p.node.clone(),
                spec: p.as_spec(),
            })
            .collect();

        steps.advance(ProvisionStep::Format);
        let to_format: Vec<ProvisionedPartition> = existing
            .iter()
            .zip(&partitions)
            .filter(|(p, _)| p.format)
            .map(|(_, created)| created.clone())
            .collect();
        for part in &to_format {
            warn!("Erasing all data on {}", part.node.display());
        }
        self.format(&to_format)?;

        steps.advance(ProvisionStep::Mount);
        let mounts = self.mount(plan, &partitions)?;

        Ok(MountedLayout {
            device: plan.device.clone(),
            staging: plan.staging.clone(),
            partitions,
            mounts,
        })
    }
}

impl Provisioner for DeviceProvisioner {
    #[instrument(skip(self, plan), fields(device = %plan.device.display()))]
    fn provision(&self, plan: &RestorePlan) -> Result<MountedLayout> {
        if let RestoreMode::Partition(existing) = &plan.mode {
            return self.provision_existing(plan, existing);
        }

        let mut steps = StageLog::new("provision", ProvisionStep::Preflight);
        self.preflight(plan)?;

        warn!("Erasing all data on {}", plan.device.display());
        steps.advance(ProvisionStep::WipeSignatures);
        self.run(ProvisionStep::WipeSignatures, CommandLine::new("wipefs").arg("-a").arg(&plan.device))?;

        steps.advance(ProvisionStep::Partition);
        let partitions = self.partition(plan)?;

        steps.advance(ProvisionStep::ReloadPartitionTable);
        self.reload(plan, &partitions)?;

        steps.advance(ProvisionStep::Format);
        self.format(&partitions)?;

        steps.advance(ProvisionStep::Mount);
        let mounts = self.mount(plan, &partitions)?;

        Ok(MountedLayout {
            device: plan.device.clone(),
            staging: plan.staging.clone(),
            partitions,
            mounts,
        })
    }

    fn release(&self, layout: &MountedLayout) -> Result<()> {
        let step = ProvisionStep::Release;
        let mut first_error = None;
        for mount in layout.mounts.iter().rev() {
            if let Err(e) = self.executor.run(&CommandLine::new("umount").arg(&mount.mount_path)) {
                warn!("umount {} failed ({}); retrying lazily", mount.mount_path.display(), e);
                if let Err(e) = self.executor.run(&CommandLine::new("umount").arg("-l").arg(&mount.mount_path)) {
                    first_error.get_or_insert(SysbackError::Device {
                        step,
                        message: e.to_string(),
                    });
                }
            }
        }
        self.run(step, CommandLine::new("sync"))?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionSpec;

    fn plan(boot: BootTarget) -> RestorePlan {
        RestorePlan::new("/dev/sdb", boot, "/mnt/target")
            .partition("boot:512MiB:fat32".parse::<PartitionSpec>().unwrap())
            .partition("root:remaining:ext4".parse::<PartitionSpec>().unwrap())
    }

    #[test]
    fn test_partition_node_naming() {
        assert_eq!(partition_node(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
        assert_eq!(partition_node(Path::new("/dev/nvme0n1"), 2), PathBuf::from("/dev/nvme0n1p2"));
        assert_eq!(partition_node(Path::new("/dev/loop0"), 1), PathBuf::from("/dev/loop0p1"));
        assert_eq!(partition_node(Path::new("/dev/mmcblk0"), 3), PathBuf::from("/dev/mmcblk0p3"));
    }

    #[test]
    fn test_provision_command_sequence() {
        let exec = Arc::new(RecordingExecutor::new());
        let provisioner = DeviceProvisioner::new(exec.clone());
        let layout = provisioner.provision(&plan(BootTarget::Uefi)).unwrap();

        assert_eq!(
            exec.rendered(),
            vec![
                "wipefs -a /dev/sdb",
                "parted -s /dev/sdb mklabel gpt",
                "parted -s -a optimal /dev/sdb mkpart boot fat32 1MiB 513MiB",
                "parted -s /dev/sdb set 1 esp on",
                "parted -s -a optimal /dev/sdb mkpart root ext4 513MiB 100%",
                "partprobe /dev/sdb",
                "udevadm settle",
                "mkfs.vfat -F 32 /dev/sdb1",
                "mkfs.ext4 -F /dev/sdb2",
                "mount /dev/sdb2 /mnt/target",
                "mount /dev/sdb1 /mnt/target/boot",
            ]
        );
        assert_eq!(layout.partitions.len(), 2);
        assert_eq!(layout.mounts[0].mount_path, PathBuf::from("/mnt/target"));
        assert_eq!(layout.mounts[1].mount_path, PathBuf::from("/mnt/target/boot"));
    }

    #[test]
    fn test_bios_uses_msdos_label_and_boot_flag() {
        let exec = Arc::new(RecordingExecutor::new());
        DeviceProvisioner::new(exec.clone()).provision(&plan(BootTarget::Bios)).unwrap();
        let rendered = exec.rendered();
        assert!(rendered.contains(&"parted -s /dev/sdb mklabel msdos".to_string()));
        assert!(rendered.contains(&"parted -s /dev/sdb set 1 boot on".to_string()));
        assert!(rendered.iter().any(|c| c.contains("mkpart primary")));
    }

    #[test]
    fn test_failure_names_step() {
        let exec = Arc::new(RecordingExecutor::new().failing_on("mkfs.ext4"));
        let err = DeviceProvisioner::new(exec.clone()).provision(&plan(BootTarget::Uefi)).unwrap_err();
        match err {
            SysbackError::Device { step, .. } => assert_eq!(step, ProvisionStep::Format),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!exec.rendered().iter().any(|c| c.starts_with("mount")));
    }

    #[test]
    fn test_missing_node_times_out() {
        let exec = Arc::new(RecordingExecutor::new().with_missing_path("/dev/sdb2"));
        let err = DeviceProvisioner::new(exec)
            .with_node_timeout(Duration::from_millis(50))
            .provision(&plan(BootTarget::Uefi))
            .unwrap_err();
        match err {
            SysbackError::Timeout { missing, .. } => assert_eq!(missing, vec![PathBuf::from("/dev/sdb2")]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_invalid_plan_touches_nothing() {
        let exec = Arc::new(RecordingExecutor::new());
        let bad = RestorePlan::new("/dev/sdb", BootTarget::Uefi, "/mnt/target");
        let err = DeviceProvisioner::new(exec.clone()).provision(&bad).unwrap_err();
        assert!(matches!(err, SysbackError::InvalidPlan(_)));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_release_unmounts_in_reverse() {
        let exec = Arc::new(RecordingExecutor::new());
        let provisioner = DeviceProvisioner::new(exec.clone());
        let layout = provisioner.provision(&plan(BootTarget::Uefi)).unwrap();
        let before = exec.calls().len();
        provisioner.release(&layout).unwrap();
        assert_eq!(
            exec.rendered()[before..].to_vec(),
            vec!["umount /mnt/target/boot", "umount /mnt/target", "sync"]
        );
    }

    #[test]
    fn test_is_on_device_follows_node_naming() {
        assert!(is_on_device(Path::new("/dev/sda"), Path::new("/dev/sda")));
        assert!(is_on_device(Path::new("/dev/sda12"), Path::new("/dev/sda")));
        assert!(!is_on_device(Path::new("/dev/sdaa1"), Path::new("/dev/sda")));
        assert!(is_on_device(Path::new("/dev/nvme0n1p2"), Path::new("/dev/nvme0n1")));
        assert!(!is_on_device(Path::new("/dev/nvme0n10"), Path::new("/dev/nvme0n1")));
        assert!(!is_on_device(Path::new("/dev/loop10"), Path::new("/dev/loop1")));
    }

    #[test]
    fn test_neighbouring_disk_mount_is_not_busy() {
        let exec = Arc::new(RecordingExecutor::new().with_mount("/dev/sdbb1", "/srv"));
        assert!(DeviceProvisioner::new(exec).provision(&plan(BootTarget::Uefi)).is_ok());
    }

    #[test]
    fn test_mounted_or_swapping_target_refused() {
        let exec = Arc::new(RecordingExecutor::new().with_mount("/dev/sdb2", "/home"));
        let err = DeviceProvisioner::new(exec.clone()).provision(&plan(BootTarget::Uefi)).unwrap_err();
        assert!(matches!(err, SysbackError::Device { step: ProvisionStep::Preflight, .. }));
        assert!(exec.calls().is_empty());

        let exec = Arc::new(RecordingExecutor::new().with_active_swap("/dev/sdb3"));
        let err = DeviceProvisioner::new(exec.clone()).provision(&plan(BootTarget::Uefi)).unwrap_err();
        assert!(matches!(err, SysbackError::Device { step: ProvisionStep::Preflight, .. }));
        assert!(exec.calls().is_empty());
    }

    fn partition_mode(boot: BootTarget) -> RestorePlan {
        RestorePlan::new("/dev/sda", boot, "/mnt/target")
            .existing(ExistingPartition::new(PartitionRole::Root, "/dev/sda3", FilesystemType::Xfs).with_format(true))
            .existing(ExistingPartition::new(PartitionRole::Efi, "/dev/sda1", FilesystemType::Fat32))
            .existing(ExistingPartition::new(PartitionRole::Swap, "/dev/sda4", FilesystemType::Swap).with_format(true))
    }

    #[test]
    fn test_partition_mode_never_repartitions() {
        let exec = Arc::new(RecordingExecutor::new());
        let layout = DeviceProvisioner::new(exec.clone()).provision(&partition_mode(BootTarget::Uefi)).unwrap();

        let rendered = exec.rendered();
        assert!(!rendered.iter().any(|c| c.starts_with("wipefs") || c.starts_with("parted") || c.starts_with("partprobe")));
        assert_eq!(
            rendered,
            vec![
                "mkfs.xfs -f /dev/sda3",
                "mkswap /dev/sda4",
                "mount /dev/sda3 /mnt/target",
                "mount /dev/sda1 /mnt/target/boot/efi",
            ]
        );
        assert_eq!(layout.device, PathBuf::from("/dev/sda"));
        assert_eq!(layout.efi_mount(), Some(Path::new("/mnt/target/boot/efi")));
        assert_eq!(layout.partition(PartitionRole::Swap).map(|p| p.node.clone()), Some(PathBuf::from("/dev/sda4")));
    }

    #[test]
    fn test_partition_mode_allows_other_mounts_on_disk() {
        // Running system lives on sda2; only the reused nodes must be free.
        let exec = Arc::new(RecordingExecutor::new().with_mount("/dev/sda2", "/"));
        assert!(DeviceProvisioner::new(exec).provision(&partition_mode(BootTarget::Uefi)).is_ok());

        let exec = Arc::new(RecordingExecutor::new().with_mount("/dev/sda1", "/boot/efi"));
        let err = DeviceProvisioner::new(exec.clone()).provision(&partition_mode(BootTarget::Uefi)).unwrap_err();
        assert!(matches!(err, SysbackError::Device { step: ProvisionStep::Preflight, .. }));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_partition_mode_missing_node() {
        let exec = Arc::new(RecordingExecutor::new().with_missing_path("/dev/sda3"));
        let err = DeviceProvisioner::new(exec.clone()).provision(&partition_mode(BootTarget::Bios)).unwrap_err();
        assert!(matches!(err, SysbackError::Device { step: ProvisionStep::Preflight, .. }));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_failed_mount_is_unwound() {
        let exec = Arc::new(RecordingExecutor::new().failing_on("mount /dev/sdb1"));
        let err = DeviceProvisioner::new(exec.clone()).provision(&plan(BootTarget::Uefi)).unwrap_err();
        assert!(matches!(err, SysbackError::Device { step: ProvisionStep::Mount, .. }));
        assert!(exec.rendered().contains(&"umount /mnt/target".to_string()));
    }
}
