//! Release tags and the upgrade-path rule.
//!
//! Tags are `major.minor.patch` (an optional leading `v` and a trailing
//! pre-release/build suffix are tolerated). The upgrade path moves one minor
//! line at a time: from `5.0.x` the next step is the oldest published `5.1.x`,
//! even when `5.2.x` already exists.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, UpgradeError};

// Whole-tag match: surrounding text or a fourth component is rejected, not
// trimmed down to the first three numbers.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)(?:[-+][0-9A-Za-z.\-+]*)?$")
        .unwrap_or_else(|err| panic!("version pattern must compile: {err}"))
});

/// One entry of the upstream release feed, newest first.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub tag_name: String,
}

impl ReleaseInfo {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReleaseVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ReleaseVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a tag such as `5.1.0` or `v5.1.0`.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let caps = VERSION_RE
            .captures(trimmed)
            .ok_or_else(|| UpgradeError::VersionFormat {
                value: value.to_owned(),
            })?;
        let part = |idx: usize| -> Result<u64> {
            caps[idx].parse::<u64>().map_err(|_| UpgradeError::VersionFormat {
                value: value.to_owned(),
            })
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }

    /// The `major.minor` pair the upgrade path is computed on. Patch releases
    /// inside one minor line are not separate steps.
    pub const fn minor_line(&self) -> (u64, u64) {
        (self.major, self.minor)
    }

    /// Compare on the minor line only.
    pub fn cmp_line(&self, other: &Self) -> Ordering {
        self.minor_line().cmp(&other.minor_line())
    }
}

impl FromStr for ReleaseVersion {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Tag of the newest release in the feed.
pub fn latest_release(releases: &[ReleaseInfo]) -> Result<&str> {
    releases
        .first()
        .map(|release| release.tag_name.as_str())
        .ok_or_else(|| UpgradeError::json("release list", "feed contains no releases"))
}

/// Pick the next step on the upgrade path from `current_version`.
///
/// Walks the feed newest to oldest, keeping the last tag whose minor line is
/// still above the current one. When nothing is above, the newest tag comes
/// back unchanged and [`is_upgrade`] reports `false` for it.
pub fn resolve_next_release(releases: &[ReleaseInfo], current_version: &str) -> Result<String> {
    let current = ReleaseVersion::parse(current_version)?;
    let mut candidate = latest_release(releases)?;
    for release in releases {
        let version = ReleaseVersion::parse(&release.tag_name)?;
        if version.cmp_line(&current) != Ordering::Greater {
            break;
        }
        candidate = &release.tag_name;
    }
    Ok(candidate.to_owned())
}

/// Whether moving from `current_version` to `next_version` crosses a minor line.
pub fn is_upgrade(current_version: &str, next_version: &str) -> Result<bool> {
    if current_version.trim() == next_version.trim() {
        return Ok(false);
    }
    let current = ReleaseVersion::parse(current_version)?;
    let next = ReleaseVersion::parse(next_version)?;
    Ok(next.cmp_line(&current) == Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tags: &[&str]) -> Vec<ReleaseInfo> {
        tags.iter().map(|tag| ReleaseInfo::new(*tag)).collect()
    }

    #[test]
    fn parses_plain_and_prefixed_tags() {
        assert_eq!(
            ReleaseVersion::parse("5.1.0").unwrap(),
            ReleaseVersion::new(5, 1, 0)
        );
        assert_eq!(
            ReleaseVersion::parse(" v0.9.12 ").unwrap(),
            ReleaseVersion::new(0, 9, 12)
        );
        assert_eq!(
            ReleaseVersion::parse("1.2.3-beta.1").unwrap(),
            ReleaseVersion::new(1, 2, 3)
        );
    }

    #[test]
    fn rejects_malformed_tags() {
        for bad in ["", "5.1", "five.one.zero", "5.1.0.4", "release-5.1.0"] {
            let err = ReleaseVersion::parse(bad).unwrap_err();
            assert!(
                matches!(err, UpgradeError::VersionFormat { .. }),
                "{bad} gave {err:?}"
            );
        }
    }

    #[test]
    fn decorated_feed_tag_stops_resolution() {
        let feed = [ReleaseInfo::new("release-5.2.0"), ReleaseInfo::new("5.1.0")];
        let err = resolve_next_release(&feed, "5.0.0").unwrap_err();
        assert!(matches!(err, UpgradeError::VersionFormat { .. }), "{err:?}");
    }

    #[test]
    fn orders_numerically_not_lexically() {
        let a = ReleaseVersion::parse("0.10.0").unwrap();
        let b = ReleaseVersion::parse("0.9.30").unwrap();
        assert!(a > b);
        assert_eq!(a.cmp_line(&b), Ordering::Greater);
    }

    #[test]
    fn picks_immediate_next_minor_step() {
        let releases = feed(&["5.2.1", "5.1.0", "4.9.3"]);
        assert_eq!(resolve_next_release(&releases, "5.0.0").unwrap(), "5.1.0");
    }

    #[test]
    fn picks_oldest_patch_of_next_line() {
        let releases = feed(&["5.2.0", "5.1.2", "5.1.1", "5.0.4"]);
        assert_eq!(resolve_next_release(&releases, "5.0.4").unwrap(), "5.1.1");
    }

    #[test]
    fn falls_back_to_newest_when_nothing_is_above() {
        let releases = feed(&["5.1.3", "5.1.0", "5.0.0"]);
        let next = resolve_next_release(&releases, "5.1.0").unwrap();
        assert_eq!(next, "5.1.3");
        assert!(!is_upgrade("5.1.0", &next).unwrap());
    }

    #[test]
    fn minor_ten_beats_minor_nine() {
        let releases = feed(&["0.10.0", "0.9.5"]);
        assert_eq!(resolve_next_release(&releases, "0.9.5").unwrap(), "0.10.0");
    }

    #[test]
    fn malformed_tag_in_feed_is_an_error() {
        let releases = feed(&["latest", "5.1.0"]);
        assert!(matches!(
            resolve_next_release(&releases, "5.0.0"),
            Err(UpgradeError::VersionFormat { .. })
        ));
        assert!(matches!(
            resolve_next_release(&feed(&["5.1.0"]), "5.0"),
            Err(UpgradeError::VersionFormat { .. })
        ));
    }

    #[test]
    fn empty_feed_is_rejected() {
        assert!(matches!(
            resolve_next_release(&[], "5.0.0"),
            Err(UpgradeError::JsonDecode { .. })
        ));
    }

    #[test]
    fn upgrade_requires_a_higher_minor_line() {
        assert!(is_upgrade("5.0.0", "5.1.0").unwrap());
        assert!(!is_upgrade("5.1.0", "5.1.0").unwrap());
        assert!(!is_upgrade("5.2.0", "5.1.9").unwrap());
    }
}
