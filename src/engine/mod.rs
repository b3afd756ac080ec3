use std::fs;
use std::sync::mpsc::Sender;

use log::{debug, error, info, warn};
use serde_json::Value;
use tempfile::TempDir;

use crate::archive;
use crate::backup::BackupCollaborator;
use crate::config::UpgradeConfig;
use crate::engine::lock::RunLock;
use crate::engine::progress::ProgressLog;
use crate::engine::state::{ProgressEvent, UpgradeOutcome, UpgradeReport, UpgradeStage};
use crate::error::{Result, UpgradeError};
use crate::manifest::Manifest;
use crate::networking::RemoteSource;
use crate::patcher::Patcher;
use crate::preflight;
use crate::release::{ReleaseVersion, is_upgrade, latest_release, resolve_next_release};
use crate::replacer::CodeReplacer;
use crate::storage::RecordStore;

pub mod lock;
pub mod progress;
pub mod state;

const ARCHIVE_NAME: &str = "upgrade.zip";
const EXTRACT_DIR: &str = "code";
const SCRATCH_PREFIX: &str = "upgrade-";

struct StageFailure {
    stage: UpgradeStage,
    error: UpgradeError,
}

enum VersionCheck {
    Current(String),
    Behind(Manifest),
}

fn at(stage: UpgradeStage) -> impl FnOnce(UpgradeError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// Drives one upgrade from version check to data patch.
///
/// Every step gates the next: the first failure ends the run, and nothing
/// after it is attempted. Collaborators are borrowed so callers (and tests)
/// decide what actually touches the network and the install tree.
pub struct Upgrader<'a> {
    config: UpgradeConfig,
    remote: &'a dyn RemoteSource,
    backup: &'a dyn BackupCollaborator,
    patcher: &'a dyn Patcher,
    store: &'a dyn RecordStore,
    observer: Option<Sender<ProgressEvent>>,
}

impl<'a> Upgrader<'a> {
    pub fn new(
        config: UpgradeConfig,
        remote: &'a dyn RemoteSource,
        backup: &'a dyn BackupCollaborator,
        patcher: &'a dyn Patcher,
        store: &'a dyn RecordStore,
    ) -> Self {
        Self {
            config,
            remote,
            backup,
            patcher,
            store,
            observer: None,
        }
    }

    /// Mirror every progress line, stage change and download tick to `tx`.
    pub fn with_observer(mut self, tx: Sender<ProgressEvent>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Re-resolve current, next and latest versions from the release feed and
    /// persist the manifest under the application id. The record is only
    /// rewritten when one of its fields changed.
    pub fn refresh_manifest(&self) -> Result<Manifest> {
        let stored = self.store.load(&self.config.app_id)?;
        let mut manifest = Manifest::bundled()?;
        let url = manifest.releases_url(&self.config.channel)?;
        let releases = self.remote.fetch_releases(&url)?;

        manifest.version = self.installed_version(stored.as_ref());
        manifest.latest_version = latest_release(&releases)?.to_owned();
        manifest.next_version = resolve_next_release(&releases, &manifest.version)?;
        let value = manifest.to_value()?;
        if stored.as_ref() != Some(&value) {
            self.store.save(&self.config.app_id, value)?;
        }

        info!(
            "check: current {}, next {}, latest {} ({} channel)",
            manifest.version, manifest.next_version, manifest.latest_version, self.config.channel
        );
        Ok(manifest)
    }

    /// The version recorded by the last upgrade, or the configured one when
    /// nothing newer was recorded.
    fn installed_version(&self, stored: Option<&Value>) -> String {
        let configured = &self.config.current_version;
        let Some(recorded) = stored.and_then(|v| v.get("version")).and_then(Value::as_str) else {
            return configured.clone();
        };
        match (ReleaseVersion::parse(recorded), ReleaseVersion::parse(configured)) {
            (Ok(recorded_v), Ok(configured_v)) if recorded_v > configured_v => {
                recorded.to_owned()
            }
            (Ok(_), Err(_)) => recorded.to_owned(),
            _ => configured.clone(),
        }
    }

    /// The manifest saved by the last version check, if any.
    pub fn stored_manifest(&self) -> Result<Option<Manifest>> {
        self.store
            .load(&self.config.app_id)?
            .map(Manifest::from_value)
            .transpose()
    }

    /// Check for a newer release, then run the rest of the pipeline under the
    /// run lock.
    ///
    /// The lock is only taken once an upgrade is due, so a run that finds
    /// nothing to do leaves the install tree alone. Returns `Err` only when
    /// the lock cannot be taken; every step failure is reported through the
    /// outcome and the last progress line instead.
    pub fn run(&self) -> Result<UpgradeReport> {
        let mut log = ProgressLog::new(self.observer.clone());
        let result = match self.check_version(&mut log) {
            Ok(VersionCheck::Current(version)) => Ok(UpgradeOutcome::AlreadyCurrent { version }),
            Ok(VersionCheck::Behind(manifest)) => {
                let lock = RunLock::acquire(&self.config.lock_file())?;
                debug!("upgrade: holding {}", lock.path().display());
                self.drive(&mut log, manifest)
            }
            Err(failure) => Err(failure),
        };

        let outcome = match result {
            Ok(outcome) => {
                log.enter(UpgradeStage::Done);
                outcome
            }
            Err(StageFailure { stage, error }) => {
                match &error {
                    UpgradeError::Preflight { unexpected } => {
                        for name in unexpected {
                            log.push(format!(
                                "Extra file found in install directory, aborting upgrade: {name}"
                            ));
                        }
                    }
                    other => log.push(format!("{}: {other}", stage.failure_line())),
                }
                error!("upgrade: {stage} failed: {error}");
                log.enter(UpgradeStage::Failed);
                UpgradeOutcome::Failed {
                    stage,
                    reason: error.to_string(),
                }
            }
        };
        log.finish(&outcome);

        Ok(UpgradeReport {
            outcome,
            log: log.into_lines(),
        })
    }

    fn check_version(
        &self,
        log: &mut ProgressLog,
    ) -> std::result::Result<VersionCheck, StageFailure> {
        let stage = UpgradeStage::CheckVersion;
        log.enter(stage);
        let manifest = self.refresh_manifest().map_err(at(stage))?;
        if is_upgrade(&manifest.version, &manifest.next_version).map_err(at(stage))? {
            log.push(format!(
                "Starting upgrade from {} to {}...",
                manifest.version, manifest.next_version
            ));
            Ok(VersionCheck::Behind(manifest))
        } else {
            log.push(format!(
                "Already on the current version {}, not upgrading",
                manifest.version
            ));
            Ok(VersionCheck::Current(manifest.version))
        }
    }

    fn drive(
        &self,
        log: &mut ProgressLog,
        mut manifest: Manifest,
    ) -> std::result::Result<UpgradeOutcome, StageFailure> {
        use UpgradeStage::*;

        let current = manifest.version.clone();
        let next = manifest.next_version.clone();

        log.enter(Preflight);
        preflight::check_expected_files(&self.config.install_dir, &self.config.expected_entries)
            .map_err(at(Preflight))?;

        log.enter(Permissions);
        self.backup
            .check_write_permissions()
            .map_err(at(Permissions))?;

        log.enter(Backup);
        let backup_path = self.backup.backup_all().map_err(at(Backup))?;
        log.push(format!("Backup saved to {}", backup_path.display()));

        log.enter(Download);
        // Dropped on every early return below, taking the scratch files with it.
        let scratch = self.scratch_dir().map_err(at(Download))?;
        let url = manifest
            .zipball_url(&self.config.channel, &next)
            .map_err(at(Download))?;
        let archive_path = scratch.path().join(ARCHIVE_NAME);
        {
            let ticks: &ProgressLog = log;
            let mut on_chunk =
                |downloaded: u64, total: Option<u64>| ticks.download(downloaded, total);
            let bytes = self
                .remote
                .download(&url, &archive_path, Some(&mut on_chunk))
                .map_err(at(Download))?;
            debug!("upgrade: downloaded {bytes} bytes from {url}");
        }

        log.enter(Extract);
        let code_root = archive::extract_release(&archive_path, &scratch.path().join(EXTRACT_DIR))
            .map_err(at(Extract))?;

        let replacer = CodeReplacer::new(self.backup);
        log.enter(DeleteOld);
        replacer.delete_old().map_err(at(DeleteOld))?;

        log.enter(InstallNew);
        replacer.install_new(&code_root).map_err(at(InstallNew))?;

        log.enter(CleanupTemp);
        let scratch_path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            warn!("cleanup: could not remove {}: {err}", scratch_path.display());
            log.push(format!("Could not fully clean tmp area: {err}"));
        }

        log.enter(Patch);
        self.patcher
            .patch_upgrade(&self.config, &next)
            .map_err(at(Patch))?;

        manifest.version = next.clone();
        if let Err(err) = manifest
            .to_value()
            .and_then(|value| self.store.save(&self.config.app_id, value))
        {
            warn!("upgrade: could not record installed version {next}: {err}");
        }

        log.push(format!("Upgrade to {next} complete"));
        Ok(UpgradeOutcome::Upgraded {
            from: current,
            to: next,
            backup: backup_path,
        })
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let tmp = self.config.tmp_dir();
        fs::create_dir_all(&tmp)
            .map_err(|e| UpgradeError::io(format!("creating {}", tmp.display()), e))?;
        tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&tmp)
            .map_err(|e| UpgradeError::io(format!("creating scratch dir in {}", tmp.display()), e))
    }
}
