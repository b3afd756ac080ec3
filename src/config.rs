use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{Result, UpgradeError};

pub const DEFAULT_APP_ID: &str = "upkeeper";
pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_USER_AGENT: &str = concat!("upkeeper/", env!("CARGO_PKG_VERSION"));

/// Top-level names a healthy install root may contain. Anything else means
/// the upgrader was pointed at the wrong directory.
const EXPECTED_ENTRIES: &[&str] = &[
    ".git",
    ".gitignore",
    "bin",
    "lib",
    "resources",
    "plugins",
    "plugins_ext",
    "data",
    "config.json",
    "CHANGELOG.md",
    "CONTRIBUTING.md",
    "LICENSE",
    "README.md",
    "Dockerfile",
    "docker-compose.yml",
];

/// Top-level names that hold user data. They survive the code swap untouched.
const PRESERVED_ENTRIES: &[&str] = &["data", "config.json", "plugins_ext", ".git"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub install_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub channel: String,
    pub current_version: String,
    pub app_id: String,
    pub expected_entries: Vec<String>,
    pub preserved_entries: Vec<String>,
    pub release_list_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            install_dir: env::default_install_dir(),
            data_dir: None,
            tmp_dir: None,
            backup_dir: None,
            lock_file: None,
            channel: DEFAULT_CHANNEL.to_owned(),
            current_version: env!("CARGO_PKG_VERSION").to_owned(),
            app_id: DEFAULT_APP_ID.to_owned(),
            expected_entries: EXPECTED_ENTRIES.iter().map(|s| (*s).to_owned()).collect(),
            preserved_entries: PRESERVED_ENTRIES.iter().map(|s| (*s).to_owned()).collect(),
            release_list_timeout_secs: 10,
            download_timeout_secs: 10 * 60,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl UpgradeConfig {
    /// Defaults rooted at `install_dir`.
    pub fn for_install_dir(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("config: {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| UpgradeError::io(format!("reading {}", path.display()), e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| UpgradeError::Config(format!("{}: {e}", path.display())))?;
        info!("config: loaded {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(UpgradeError::Config("channel must not be empty".into()));
        }
        if self.app_id.trim().is_empty() {
            return Err(UpgradeError::Config("app_id must not be empty".into()));
        }
        if self.expected_entries.is_empty() {
            return Err(UpgradeError::Config(
                "expected_entries must list the install layout".into(),
            ));
        }
        if let Some(missing) = self
            .preserved_entries
            .iter()
            .find(|name| !self.expected_entries.contains(name))
        {
            return Err(UpgradeError::Config(format!(
                "preserved entry '{missing}' is not in expected_entries"
            )));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| env::data_dir(&self.install_dir))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| env::tmp_dir(&self.data_dir()))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| env::backup_dir(&self.data_dir()))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| env::lock_file(&self.data_dir()))
    }

    pub fn release_list_timeout(&self) -> Duration {
        Duration::from_secs(self.release_list_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
