//! Bootloader installation and repair
//!
//! [`GrubInstaller`] makes a restored root bootable: it bind-mounts the
//! host's `/dev`, `/proc`, `/sys` and `/run` into the target, runs
//! `grub-install` for the requested firmware, regenerates the GRUB
//! configuration inside a chroot and removes the bind mounts again, whether
//! or not the install succeeded.
//!
//! [`boot_fix`] reuses the same installer for an already-restored disk:
//! it finds (or is told) the root and EFI partitions, mounts them, reinstalls
//! GRUB and unmounts.

use crate::device::{CommandLine, Executor};
use crate::error::{Result, SysbackError};
use crate::types::{
    BootTarget, FilesystemType, MountRecord, MountedLayout, PartitionRole, PartitionSize,
    PartitionSpec, ProvisionedPartition,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// GPT partition type of an EFI system partition
pub const ESP_PARTTYPE: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

/// Host pseudo filesystems bound into the target for `grub-install`
const BIND_MOUNTS: &[&str] = &["/dev", "/proc", "/sys", "/run"];

/// Makes a mounted root bootable
pub trait BootloaderInstaller: Send + Sync {
    /// Install the bootloader onto the layout's device and root
    fn install(&self, layout: &MountedLayout, boot: BootTarget) -> Result<()>;
}

/// EFI boot entry name
const BOOTLOADER_ID: &str = "sysback";

/// GRUB 2 installer
pub struct GrubInstaller {
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for GrubInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrubInstaller")
            .field("bootloader_id", &BOOTLOADER_ID)
            .finish()
    }
}

impl GrubInstaller {
    /// Create an installer using `executor`
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    fn run(&self, command: CommandLine) -> Result<String> {
        self.executor
            .run(&command)
            .map_err(|e| SysbackError::Bootloader(e.to_string()))
    }

    fn bind(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut bound = Vec::with_capacity(BIND_MOUNTS.len());
        for source in BIND_MOUNTS {
            let target = root.join(source.trim_start_matches('/'));
            let result = self
                .executor
                .create_dir_all(&target)
                .and_then(|_| self.executor.run(&CommandLine::new("mount").arg("--bind").arg(source).arg(&target)));
            if let Err(e) = result {
                self.unbind(&bound);
                return Err(SysbackError::Bootloader(format!("bind mount of {} failed: {}", source, e)));
            }
            bound.push(target);
        }
        Ok(bound)
    }

    fn unbind(&self, bound: &[PathBuf]) {
        for target in bound.iter().rev() {
            if let Err(e) = self.executor.run(&CommandLine::new("umount").arg("-l").arg(target)) {
                warn!("Could not unbind {}: {}", target.display(), e);
            }
        }
    }

    fn grub_install(&self, layout: &MountedLayout, boot: BootTarget) -> Result<()> {
        let root = &layout.staging;
        let boot_dir = root.join("boot");
        match boot {
            BootTarget::Bios => {
                self.run(
                    CommandLine::new("grub-install")
                        .arg("--target=i386-pc")
                        .arg("--boot-directory")
                        .arg(&boot_dir)
                        .arg(&layout.device),
                )?;
            }
            BootTarget::Uefi => {
                let esp = layout
                    .efi_mount()
                    .ok_or_else(|| SysbackError::Bootloader("no mounted EFI system partition".to_string()))?;
                let base = CommandLine::new("grub-install")
                    .arg("--target=x86_64-efi")
                    .arg("--efi-directory")
                    .arg(esp)
                    .arg("--boot-directory")
                    .arg(&boot_dir);

                let registered = self.run(base.clone().arg("--bootloader-id").arg(BOOTLOADER_ID));
                if let Err(e) = &registered {
                    warn!("NVRAM registration failed ({}); relying on the removable path", e);
                }
                // Firmware without a boot entry still finds \EFI\BOOT\BOOTX64.EFI.
                let removable = self.run(base.args(["--removable", "--no-nvram"]));
                if let (Err(first), Err(_)) = (&registered, &removable) {
                    return Err(SysbackError::Bootloader(format!("grub-install failed: {}", first)));
                }
            }
        }
        Ok(())
    }

    fn update_config(&self, root: &Path) -> Result<()> {
        if self.run(CommandLine::new("chroot").arg(root).arg("update-grub")).is_ok() {
            return Ok(());
        }
        warn!("update-grub unavailable in target; falling back to grub-mkconfig");
        self.run(
            CommandLine::new("chroot")
                .arg(root)
                .args(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"]),
        )
        .map(|_| ())
    }
}

impl BootloaderInstaller for GrubInstaller {
    #[instrument(skip(self, layout), fields(device = %layout.device.display(), boot = %boot))]
    fn install(&self, layout: &MountedLayout, boot: BootTarget) -> Result<()> {
        let bound = self.bind(&layout.staging)?;
        let result = self
            .grub_install(layout, boot)
            .and_then(|_| self.update_config(&layout.staging));
        self.unbind(&bound);
        if result.is_ok() {
            info!("GRUB installed for {} boot", boot);
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    path: Option<String>,
    fstype: Option<String>,
    parttype: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn node(&self) -> PathBuf {
        match &self.path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("/dev").join(&self.name),
        }
    }

    fn collect_partitions<'a>(&'a self, out: &mut Vec<&'a LsblkDevice>) {
        if self.kind.as_deref() == Some("part") {
            out.push(self);
        }
        for child in &self.children {
            child.collect_partitions(out);
        }
    }
}

/// Partitions found on a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPartitions {
    /// Root filesystem node
    pub root: PathBuf,
    /// Root filesystem type
    pub root_fs: FilesystemType,
    /// EFI system partition node, if any
    pub esp: Option<PathBuf>,
}

/// Pick the root and EFI partitions out of `lsblk -J` output
///
/// # Errors
///
/// - [`SysbackError::Bootloader`] if no root, or more than one candidate for
///   either role, is found
pub fn detect_partitions(lsblk_json: &str) -> Result<DetectedPartitions> {
    let parsed: LsblkOutput = serde_json::from_str(lsblk_json)?;
    let mut parts = Vec::new();
    for dev in &parsed.blockdevices {
        dev.collect_partitions(&mut parts);
    }

    let esps: Vec<&LsblkDevice> = parts
        .iter()
        .copied()
        .filter(|p| {
            p.parttype.as_deref().map(|t| t.eq_ignore_ascii_case(ESP_PARTTYPE)).unwrap_or(false)
                || p.fstype.as_deref() == Some("vfat")
        })
        .collect();
    let roots: Vec<(&LsblkDevice, FilesystemType)> = parts
        .iter()
        .copied()
        .filter_map(|p| match p.fstype.as_deref() {
            Some("ext4") => Some((p, FilesystemType::Ext4)),
            Some("xfs") => Some((p, FilesystemType::Xfs)),
            Some("btrfs") => Some((p, FilesystemType::Btrfs)),
            _ => None,
        })
        .collect();

    let (root, root_fs) = match roots.as_slice() {
        [(dev, fs)] => (dev.node(), *fs),
        [] => return Err(SysbackError::Bootloader("no root filesystem found on disk".to_string())),
        many => {
            let names: Vec<String> = many.iter().map(|(d, _)| d.node().display().to_string()).collect();
            return Err(SysbackError::Bootloader(format!(
                "several root candidates ({}); pass --root explicitly",
                names.join(", ")
            )));
        }
    };
    let esp = match esps.as_slice() {
        [] => None,
        [dev] => Some(dev.node()),
        many => {
            let names: Vec<String> = many.iter().map(|d| d.node().display().to_string()).collect();
            return Err(SysbackError::Bootloader(format!(
                "several EFI partitions ({}); pass --esp explicitly",
                names.join(", ")
            )));
        }
    };
    Ok(DetectedPartitions { root, root_fs, esp })
}

/// Parameters for [`boot_fix`]
#[derive(Debug, Clone)]
pub struct BootFixRequest {
    /// Disk to install GRUB onto
    pub disk: PathBuf,
    /// Firmware type
    pub boot: BootTarget,
    /// Root partition; detected when `None`
    pub root: Option<PathBuf>,
    /// EFI partition; detected when `None` and booting UEFI
    pub esp: Option<PathBuf>,
    /// Temporary mount point for the root
    pub mount_point: PathBuf,
}

/// Reinstall the bootloader on an existing system disk
#[instrument(skip(executor, installer, request), fields(disk = %request.disk.display()))]
pub fn boot_fix(
    executor: Arc<dyn Executor>,
    installer: &dyn BootloaderInstaller,
    request: &BootFixRequest,
) -> Result<()> {
    let (root, root_fs, esp) = match (&request.root, &request.esp) {
        (Some(root), esp) if esp.is_some() || request.boot == BootTarget::Bios => {
            (root.clone(), FilesystemType::Ext4, esp.clone())
        }
        _ => {
            let json = executor
                .run(
                    &CommandLine::new("lsblk")
                        .args(["-J", "-o", "NAME,PATH,FSTYPE,PARTTYPE,TYPE"])
                        .arg(&request.disk),
                )
                .map_err(|e| SysbackError::Bootloader(e.to_string()))?;
            let detected = detect_partitions(&json)?;
            match &request.root {
                Some(root) if *root != detected.root => (root.clone(), FilesystemType::Ext4, request.esp.clone().or(detected.esp)),
                _ => (detected.root, detected.root_fs, request.esp.clone().or(detected.esp)),
            }
        }
    };
    if request.boot == BootTarget::Uefi && esp.is_none() {
        return Err(SysbackError::Bootloader("UEFI repair needs an EFI system partition".to_string()));
    }
    info!("Repairing boot: root {}, esp {:?}", root.display(), esp);

    let mut mounts: Vec<MountRecord> = Vec::new();
    let mut partitions = vec![ProvisionedPartition {
        number: 0,
        node: root.clone(),
        spec: PartitionSpec::new(PartitionRole::Root, PartitionSize::Remaining, root_fs),
    }];

    let mount = |node: &Path, at: &Path| -> Result<()> {
        executor.create_dir_all(at)?;
        executor
            .run(&CommandLine::new("mount").arg(node).arg(at))
            .map(|_| ())
            .map_err(|e| SysbackError::Bootloader(e.to_string()))
    };

    let mut result = mount(&root, &request.mount_point).map(|_| {
        mounts.push(MountRecord {
            node: root.clone(),
            role: PartitionRole::Root,
            mount_path: request.mount_point.clone(),
        });
    });

    if result.is_ok() {
        if let (BootTarget::Uefi, Some(esp)) = (request.boot, &esp) {
            let at = request.mount_point.join("boot/efi");
            result = mount(esp, &at).map(|_| {
                mounts.push(MountRecord {
                    node: esp.clone(),
                    role: PartitionRole::Efi,
                    mount_path: at,
                });
                partitions.push(ProvisionedPartition {
                    number: 0,
                    node: esp.clone(),
                    spec: PartitionSpec::new(PartitionRole::Efi, PartitionSize::Mib(1), FilesystemType::Fat32),
                });
            });
        }
    }

    if result.is_ok() {
        let layout = MountedLayout {
            device: request.disk.clone(),
            staging: request.mount_point.clone(),
            partitions,
            mounts: mounts.clone(),
        };
        result = installer.install(&layout, request.boot);
    }

    for m in mounts.iter().rev() {
        if let Err(e) = executor.run(&CommandLine::new("umount").arg(&m.mount_path)) {
            warn!("Could not unmount {}: {}", m.mount_path.display(), e);
        }
    }
    if let Err(e) = executor.run(&CommandLine::new("sync")) {
        warn!("sync after boot fix failed: {}", e);
    }
    result
}
