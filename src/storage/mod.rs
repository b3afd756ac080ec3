use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{CatalogStore, PluginRecord, RepoSettings};
use crate::error::{Result, UpgradeError};

/// Key-value persistence of JSON records keyed by application/plugin id.
pub trait RecordStore {
    fn load(&self, id: &str) -> Result<Option<Value>>;
    fn save(&self, id: &str, value: Value) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    records: BTreeMap<String, Value>,
    #[serde(default)]
    plugins: Vec<PluginRecord>,
    #[serde(default)]
    repos: BTreeMap<String, RepoSettings>,
}

impl StoreData {
    fn matching_plugins(
        &self,
        installed: Option<bool>,
        repo_id: Option<&str>,
        plugin_id: Option<&str>,
    ) -> Vec<PluginRecord> {
        self.plugins
            .iter()
            .filter(|p| installed.is_none_or(|want| p.version.installed.is_installed() == want))
            .filter(|p| repo_id.is_none_or(|want| p.repo_id == want))
            .filter(|p| plugin_id.is_none_or(|want| p.id == want))
            .cloned()
            .collect()
    }

    fn upsert_plugin(&mut self, record: &PluginRecord) {
        match self
            .plugins
            .iter_mut()
            .find(|p| p.id == record.id && p.repo_id == record.repo_id)
        {
            Some(existing) => *existing = record.clone(),
            None => self.plugins.push(record.clone()),
        }
    }
}

/// All records in one JSON document on disk, rewritten atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreData> {
        if !self.path.exists() {
            return Ok(StoreData::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| UpgradeError::io(format!("reading {}", self.path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| UpgradeError::json(self.path.display().to_string(), e))
    }

    fn write(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpgradeError::Storage(format!("unable to create store dir: {e}")))?;
        }
        let text = serde_json::to_string_pretty(data)
            .map_err(|e| UpgradeError::Storage(format!("unable to encode records: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .map_err(|e| UpgradeError::Storage(format!("unable to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            UpgradeError::Storage(format!("unable to replace {}: {e}", self.path.display()))
        })?;
        debug!("storage: wrote {}", self.path.display());
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut StoreData)) -> Result<()> {
        let mut data = self.read()?;
        change(&mut data);
        self.write(&data)
    }
}

impl RecordStore for JsonFileStore {
    fn load(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.read()?.records.remove(id))
    }

    fn save(&self, id: &str, value: Value) -> Result<()> {
        self.update(|data| {
            data.records.insert(id.to_owned(), value);
        })
    }
}

impl CatalogStore for JsonFileStore {
    fn get_plugins(
        &self,
        installed: Option<bool>,
        repo_id: Option<&str>,
        plugin_id: Option<&str>,
    ) -> Result<Vec<PluginRecord>> {
        Ok(self.read()?.matching_plugins(installed, repo_id, plugin_id))
    }

    fn save_plugin(&self, record: &PluginRecord) -> Result<()> {
        self.update(|data| data.upsert_plugin(record))
    }

    fn save_repo(&self, repo: &RepoSettings) -> Result<()> {
        self.update(|data| {
            data.repos.insert(repo.id.clone(), repo.clone());
        })
    }
}

/// In-process store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    fn with<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> Result<T> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| UpgradeError::Storage("memory store lock poisoned".into()))?;
        Ok(f(&mut guard))
    }

    pub fn repos(&self) -> Vec<RepoSettings> {
        self.with(|data| data.repos.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl RecordStore for MemoryStore {
    fn load(&self, id: &str) -> Result<Option<Value>> {
        self.with(|data| data.records.get(id).cloned())
    }

    fn save(&self, id: &str, value: Value) -> Result<()> {
        self.with(|data| {
            data.records.insert(id.to_owned(), value);
        })
    }
}

impl CatalogStore for MemoryStore {
    fn get_plugins(
        &self,
        installed: Option<bool>,
        repo_id: Option<&str>,
        plugin_id: Option<&str>,
    ) -> Result<Vec<PluginRecord>> {
        self.with(|data| data.matching_plugins(installed, repo_id, plugin_id))
    }

    fn save_plugin(&self, record: &PluginRecord) -> Result<()> {
        self.with(|data| data.upsert_plugin(record))
    }

    fn save_repo(&self, repo: &RepoSettings) -> Result<()> {
        self.with(|data| {
            data.repos.insert(repo.id.clone(), repo.clone());
        })
    }
}
