use std::fs;
use std::path::PathBuf;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::UpgradeConfig;
use crate::env;
use crate::error::{Result, UpgradeError};
use crate::release::ReleaseVersion;

/// Applies data migrations after new code is in place.
pub trait Patcher {
    fn patch_upgrade(&self, config: &UpgradeConfig, target_version: &str) -> Result<()>;
}

pub type PatchFn = fn(&UpgradeConfig) -> Result<()>;

/// A migration introduced by `version`.
#[derive(Clone)]
pub struct DataPatch {
    pub version: ReleaseVersion,
    pub name: &'static str,
    pub apply: PatchFn,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PatchState {
    patched_version: Option<String>,
}

/// Runs every registered patch newer than the last patched version and not
/// newer than the target, then records the target.
pub struct DataPatcher {
    patches: Vec<DataPatch>,
    state_file: Option<PathBuf>,
}

impl DataPatcher {
    pub fn new() -> Self {
        Self {
            patches: builtin_patches(),
            state_file: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            patches: Vec::new(),
            state_file: None,
        }
    }

    pub fn with_patch(mut self, patch: DataPatch) -> Self {
        self.patches.push(patch);
        self.patches.sort_by_key(|p| p.version);
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    fn state_path(&self, config: &UpgradeConfig) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| env::patch_state_file(&config.data_dir()))
    }

    fn read_state(&self, config: &UpgradeConfig) -> Result<PatchState> {
        let path = self.state_path(config);
        if !path.exists() {
            return Ok(PatchState::default());
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| UpgradeError::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| UpgradeError::json("patch state", e))
    }

    fn write_state(&self, config: &UpgradeConfig, version: &str) -> Result<()> {
        let path = self.state_path(config);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpgradeError::Patch(format!("creating {}: {e}", parent.display())))?;
        }
        let state = PatchState {
            patched_version: Some(version.to_owned()),
        };
        let text = serde_json::to_string_pretty(&state)
            .map_err(|e| UpgradeError::Patch(e.to_string()))?;
        fs::write(&path, text)
            .map_err(|e| UpgradeError::Patch(format!("writing {}: {e}", path.display())))
    }
}

impl Default for DataPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Patcher for DataPatcher {
    fn patch_upgrade(&self, config: &UpgradeConfig, target_version: &str) -> Result<()> {
        let target = ReleaseVersion::parse(target_version)?;
        let state = self.read_state(config)?;
        let from = ReleaseVersion::parse(
            state
                .patched_version
                .as_deref()
                .unwrap_or(&config.current_version),
        )?;
        if from >= target {
            debug!("patch: data already at {from}, nothing to do for {target}");
            return Ok(());
        }

        for patch in self
            .patches
            .iter()
            .filter(|p| p.version > from && p.version <= target)
        {
            info!("patch: applying {} ({})", patch.name, patch.version);
            (patch.apply)(config)
                .map_err(|e| UpgradeError::Patch(format!("{}: {e}", patch.name)))?;
        }
        self.write_state(config, target_version)?;
        info!("patch: data at {target}");
        Ok(())
    }
}

fn builtin_patches() -> Vec<DataPatch> {
    vec![DataPatch {
        version: ReleaseVersion::new(0, 2, 0),
        name: "create scratch and backup directories",
        apply: ensure_data_dirs,
    }]
}

fn ensure_data_dirs(config: &UpgradeConfig) -> Result<()> {
    for dir in [config.tmp_dir(), config.backup_dir()] {
        fs::create_dir_all(&dir)
            .map_err(|e| UpgradeError::io(format!("creating {}", dir.display()), e))?;
    }
    Ok(())
}
