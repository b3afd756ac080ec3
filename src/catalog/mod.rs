//! Plugin catalog records and the rule for folding a published plugin list
//! into them.
//!
//! Local install state (`installed`, `current`, `external`) always wins over
//! the published list; only `latest` comes from upstream.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, UpgradeError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstalledState {
    Flag(bool),
    Version(String),
}

impl Default for InstalledState {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl InstalledState {
    pub fn is_installed(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Version(version) => !version.is_empty(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersion {
    #[serde(default)]
    pub installed: InstalledState,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub latest: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    #[serde(default)]
    pub category: String,
    #[serde(rename = "repoid")]
    pub repo_id: String,
    pub version: PluginVersion,
    #[serde(default)]
    pub external: bool,
    /// Published fields this crate has no use for (name, description, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A repository of plugins, as described by its own manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSettings {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repo_url: String,
}

/// A plugin as listed by a repository. Its `version` is the published one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPlugin {
    pub id: String,
    #[serde(default)]
    pub category: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A repository manifest: its settings plus the plugins it publishes.
#[derive(Clone, Debug, Deserialize)]
pub struct RepoManifest {
    #[serde(flatten)]
    pub repo: RepoSettings,
    #[serde(default)]
    pub plugins: Vec<PublishedPlugin>,
}

impl RepoManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| UpgradeError::json("repository manifest", e))
    }
}

/// Persistence for catalog records.
pub trait CatalogStore {
    /// Records matching every filter that is `Some`.
    fn get_plugins(
        &self,
        installed: Option<bool>,
        repo_id: Option<&str>,
        plugin_id: Option<&str>,
    ) -> Result<Vec<PluginRecord>>;

    fn save_plugin(&self, record: &PluginRecord) -> Result<()>;

    fn save_repo(&self, repo: &RepoSettings) -> Result<()>;
}

/// Merge one published plugin into the catalog and return the saved record.
pub fn merge_published_plugin(
    store: &dyn CatalogStore,
    repo_id: &str,
    published: &PublishedPlugin,
) -> Result<PluginRecord> {
    let local = store
        .get_plugins(None, Some(repo_id), Some(&published.id))?
        .into_iter()
        .next();

    let record = match local {
        Some(local) => {
            debug!("catalog: updating {}/{}", repo_id, published.id);
            PluginRecord {
                id: published.id.clone(),
                category: published.category.clone(),
                repo_id: repo_id.to_owned(),
                version: PluginVersion {
                    installed: local.version.installed,
                    current: local.version.current,
                    latest: published.version.clone(),
                },
                external: local.external,
                extra: {
                    let mut extra = local.extra;
                    extra.extend(published.extra.clone());
                    extra
                },
            }
        }
        None => {
            debug!("catalog: new plugin {}/{}", repo_id, published.id);
            PluginRecord {
                id: published.id.clone(),
                category: published.category.clone(),
                repo_id: repo_id.to_owned(),
                version: PluginVersion {
                    installed: InstalledState::Flag(false),
                    current: None,
                    latest: published.version.clone(),
                },
                external: false,
                extra: published.extra.clone(),
            }
        }
    };
    store.save_plugin(&record)?;
    Ok(record)
}

/// Save `repo` and merge its published plugin list. Entries that are
/// themselves repositories are skipped. Returns the number merged.
pub fn sync_plugins(
    store: &dyn CatalogStore,
    repo: &RepoSettings,
    published: &[PublishedPlugin],
) -> Result<usize> {
    store.save_repo(repo)?;
    let mut merged = 0;
    for plugin in published {
        if plugin.category.contains("repository") {
            continue;
        }
        merge_published_plugin(store, &repo.id, plugin)?;
        merged += 1;
    }
    info!("catalog: merged {merged} plugins from repo {}", repo.id);
    Ok(merged)
}
