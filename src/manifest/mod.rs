use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, UpgradeError};

const EMBEDDED_MANIFEST: &str = include_str!("../../resources/manifest.json");
const CHANNEL_KEY_PREFIX: &str = "github_repo_";

/// Persisted description of the application's own release state.
///
/// Fields other than the three versions (channel URLs, display name, ...) are
/// carried through untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub next_version: String,
    #[serde(default)]
    pub latest_version: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Manifest {
    /// The default manifest shipped inside the binary.
    pub fn bundled() -> Result<Self> {
        Self::from_json(EMBEDDED_MANIFEST)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| UpgradeError::json("manifest", e))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| UpgradeError::json("manifest record", e))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| UpgradeError::json("manifest record", e))
    }

    /// Base API URL of the release feed for `channel`.
    pub fn channel_url(&self, channel: &str) -> Result<&str> {
        let key = format!("{CHANNEL_KEY_PREFIX}{channel}");
        self.extra
            .get(&key)
            .and_then(Value::as_str)
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| UpgradeError::Config(format!("manifest has no '{key}' release channel")))
    }

    pub fn channels(&self) -> Vec<&str> {
        self.extra
            .keys()
            .filter_map(|key| key.strip_prefix(CHANNEL_KEY_PREFIX))
            .collect()
    }

    pub fn releases_url(&self, channel: &str) -> Result<String> {
        Ok(format!("{}/releases", self.channel_url(channel)?))
    }

    pub fn zipball_url(&self, channel: &str, version: &str) -> Result<String> {
        Ok(format!("{}/zipball/{version}", self.channel_url(channel)?))
    }

    pub fn set_channel_url(&mut self, channel: &str, url: &str) {
        self.extra.insert(
            format!("{CHANNEL_KEY_PREFIX}{channel}"),
            Value::String(url.to_owned()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_manifest_has_stable_and_beta() {
        let manifest = Manifest::bundled().unwrap();
        let mut channels = manifest.channels();
        channels.sort_unstable();
        assert_eq!(channels, vec!["beta", "stable"]);
    }

    #[test]
    fn builds_feed_and_archive_urls() {
        let mut manifest = Manifest::default();
        manifest.set_channel_url("stable", "https://api.example.com/repos/o/r/");
        assert_eq!(
            manifest.releases_url("stable").unwrap(),
            "https://api.example.com/repos/o/r/releases"
        );
        assert_eq!(
            manifest.zipball_url("stable", "5.1.0").unwrap(),
            "https://api.example.com/repos/o/r/zipball/5.1.0"
        );
    }

    #[test]
    fn unknown_channel_is_config_error() {
        let manifest = Manifest::bundled().unwrap();
        assert!(matches!(
            manifest.channel_url("nightly"),
            Err(UpgradeError::Config(_))
        ));
    }

    #[test]
    fn unknown_fields_survive_a_round_trip_through_the_store_format() {
        let manifest = Manifest::from_json(
            r#"{"version":"5.0.0","name":"App","github_repo_stable":"https://x"}"#,
        )
        .unwrap();
        let value = manifest.to_value().unwrap();
        assert_eq!(value["name"], "App");
        assert_eq!(value["next_version"], "");
        assert_eq!(Manifest::from_value(value).unwrap(), manifest);
    }

    #[test]
    fn malformed_manifest_is_json_error() {
        assert!(matches!(
            Manifest::from_json("[1, 2]"),
            Err(UpgradeError::JsonDecode { .. })
        ));
    }
}
