//! Main `Sysback` implementation
//!
//! Ties the catalog, the orchestrators and the device layer together behind
//! one handle configured through [`SysbackBuilder`].

use crate::backup::{BackupOptions, BackupOrchestrator};
use crate::bootloader::{boot_fix, BootFixRequest, BootloaderInstaller, GrubInstaller};
use crate::catalog::SnapshotCatalog;
use crate::config::Config;
use crate::device::{DeviceProvisioner, Executor, Provisioner, RecordingExecutor, SystemExecutor};
use crate::error::{Result, SysbackError};
use crate::exclusion::ExclusionRules;
use crate::lock::CatalogLock;
use crate::restore::{RestoreOptions, RestoreOrchestrator};
use crate::types::{
    BackupHook, BackupReport, NoOpHook, ProgressCallback, RestorePlan, RestoreReport, Snapshot,
};
use crate::verification::{SnapshotVerifier, VerificationReport};
use std::fs;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Handle for every snapshot operation
///
/// # Examples
///
/// ```rust,no_run
/// use sysback::{Config, SysbackBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sysback = SysbackBuilder::new().config(Config::default()).build()?;
/// let report = sysback.backup(Some("before-upgrade"))?;
/// println!("{} ({})", report.snapshot.id, report.snapshot.status);
///
/// for snapshot in sysback.list()? {
///     println!("{}", snapshot.id);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Sysback {
    config: Config,
    catalog: SnapshotCatalog,
    rules: ExclusionRules,
    executor: Arc<dyn Executor>,
    provisioner: Arc<dyn Provisioner>,
    bootloader: Arc<dyn BootloaderInstaller>,
    hook: Arc<dyn BackupHook>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Sysback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sysback")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .field("rules", &self.rules)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish_non_exhaustive()
    }
}

impl Sysback {
    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying catalog
    pub fn catalog(&self) -> &SnapshotCatalog {
        &self.catalog
    }

    /// Capture the configured source root into a new snapshot
    ///
    /// # Arguments
    ///
    /// * `label` - Optional label appended to the snapshot id
    ///
    /// # Errors
    ///
    /// See [`BackupOrchestrator::run`].
    pub fn backup(&self, label: Option<&str>) -> Result<BackupReport> {
        let mut options = BackupOptions::new(
            &self.config.source_root,
            self.config.snapshots_dir(),
            &self.config.state_dir,
        );
        options.rules = self.rules.clone();
        options.label = label.map(str::to_string);
        options.compression = self.config.compression;
        options.one_file_system = self.config.one_file_system;

        let mut orchestrator = BackupOrchestrator::new(self.catalog.clone()).with_hook(Arc::clone(&self.hook));
        if let Some(cb) = &self.progress {
            orchestrator = orchestrator.with_progress(Arc::clone(cb));
        }
        orchestrator.run(&options)
    }

    /// Restore snapshot `id` onto the device described by `plan`
    ///
    /// Everything on the target device is destroyed.
    ///
    /// # Errors
    ///
    /// See [`RestoreOrchestrator::run`].
    pub fn restore(&self, id: &str, plan: RestorePlan) -> Result<RestoreReport> {
        let options = RestoreOptions::new(id, plan, &self.config.state_dir);
        let mut orchestrator = RestoreOrchestrator::new(
            self.catalog.clone(),
            Arc::clone(&self.provisioner),
            Arc::clone(&self.bootloader),
            Arc::clone(&self.executor),
        );
        if let Some(cb) = &self.progress {
            orchestrator = orchestrator.with_progress(Arc::clone(cb));
        }
        orchestrator.run(&options)
    }

    /// Re-hash a snapshot and record the outcome in the catalog
    ///
    /// # Arguments
    ///
    /// * `id` - Snapshot to check
    /// * `deep` - Also decode every record in the archive
    pub fn verify(&self, id: &str, deep: bool) -> Result<VerificationReport> {
        let _lock = CatalogLock::acquire(&self.config.state_dir)?;
        SnapshotVerifier::new().verify_and_update(&self.catalog, id, deep)
    }

    /// Snapshots, newest first
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        self.catalog.list()
    }

    /// One snapshot record
    pub fn get(&self, id: &str) -> Result<Snapshot> {
        self.catalog.get(id)
    }

    /// Delete a snapshot record and its archive
    #[instrument(skip(self))]
    pub fn prune(&self, id: &str) -> Result<Snapshot> {
        let _lock = CatalogLock::acquire(&self.config.state_dir)?;
        self.remove_unlocked(id)
    }

    /// Keep the `keep` newest snapshots and delete the rest
    ///
    /// Returns the snapshots that were removed.
    #[instrument(skip(self))]
    pub fn prune_keep_latest(&self, keep: usize) -> Result<Vec<Snapshot>> {
        let _lock = CatalogLock::acquire(&self.config.state_dir)?;
        let mut removed = Vec::new();
        for snapshot in self.catalog.list()?.into_iter().skip(keep) {
            removed.push(self.remove_unlocked(&snapshot.id)?);
        }
        info!("Pruned {} snapshot(s), kept {}", removed.len(), keep);
        Ok(removed)
    }

    fn remove_unlocked(&self, id: &str) -> Result<Snapshot> {
        let snapshot = self.catalog.remove(id)?;
        match fs::remove_file(&snapshot.archive_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Archive {:?} was already gone", snapshot.archive_path);
            }
            Err(e) => return Err(SysbackError::path_io(&snapshot.archive_path, e)),
        }
        Ok(snapshot)
    }

    /// Reinstall the bootloader on an already-restored disk
    pub fn boot_fix(&self, request: &BootFixRequest) -> Result<()> {
        boot_fix(Arc::clone(&self.executor), self.bootloader.as_ref(), request)
    }
}

/// Commands a restore of `plan` would run against the device, without
/// running any of them
///
/// Extraction and fstab generation are not included.
pub fn planned_commands(plan: &RestorePlan) -> Result<Vec<String>> {
    let recorder = Arc::new(RecordingExecutor::new());
    let provisioner = DeviceProvisioner::new(recorder.clone());
    let layout = provisioner.provision(plan)?;
    GrubInstaller::new(recorder.clone()).install(&layout, plan.boot)?;
    provisioner.release(&layout)?;
    Ok(recorder.rendered())
}

/// Builder for configuring a [`Sysback`] instance
///
/// Anything not set falls back to the real system: [`SystemExecutor`],
/// a [`DeviceProvisioner`] and a [`GrubInstaller`] on top of it, and the
/// exclusion rules named by the configuration.
pub struct SysbackBuilder {
    config: Config,
    rules: Option<ExclusionRules>,
    executor: Option<Arc<dyn Executor>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    bootloader: Option<Arc<dyn BootloaderInstaller>>,
    hook: Arc<dyn BackupHook>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for SysbackBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysbackBuilder")
            .field("config", &self.config)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Default for SysbackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SysbackBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            rules: None,
            executor: None,
            provisioner: None,
            bootloader: None,
            hook: Arc::new(NoOpHook),
            progress: None,
        }
    }

    /// Use `config` instead of the defaults
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Override the exclusion rules from the configured excludes file
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sysback::{ExclusionRules, SysbackBuilder};
    ///
    /// let builder = SysbackBuilder::new()
    ///     .exclusion_rules(ExclusionRules::new(["/var/cache/*", "*.swp"]).unwrap());
    /// ```
    pub fn exclusion_rules(mut self, rules: ExclusionRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Command executor for the device layer
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replace the device provisioner
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Replace the bootloader installer
    pub fn bootloader(mut self, bootloader: Arc<dyn BootloaderInstaller>) -> Self {
        self.bootloader = Some(bootloader);
        self
    }

    /// Hook called during backups
    pub fn hook(mut self, hook: Arc<dyn BackupHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Progress callback for backup and restore
    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Build the instance, opening (and creating) the catalog
    ///
    /// # Errors
    ///
    /// - [`SysbackError::InvalidConfiguration`] if the configuration is invalid
    /// - [`SysbackError::InvalidPattern`] if the excludes file has a bad pattern
    pub fn build(self) -> Result<Sysback> {
        self.config.validate()?;
        let catalog = SnapshotCatalog::open(&self.config.state_dir)?;

        let rules = match self.rules {
            Some(rules) => rules,
            None => self.config.exclusion_rules()?,
        };
        self.config.check_includes()?;

        let executor: Arc<dyn Executor> = self.executor.unwrap_or_else(|| Arc::new(SystemExecutor));
        let provisioner = self.provisioner.unwrap_or_else(|| {
            Arc::new(DeviceProvisioner::new(Arc::clone(&executor)).with_node_timeout(self.config.device_timeout()))
        });
        let bootloader = self
            .bootloader
            .unwrap_or_else(|| Arc::new(GrubInstaller::new(Arc::clone(&executor))));

        Ok(Sysback {
            config: self.config,
            catalog,
            rules,
            executor,
            provisioner,
            bootloader,
            hook: self.hook,
            progress: self.progress,
        })
    }
}
