use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::error::{Result, UpgradeError};

/// Confirm `install_dir` holds only names from `expected`.
///
/// Every unexpected top-level name is reported, sorted, not just the first.
pub fn check_expected_files(install_dir: &Path, expected: &[String]) -> Result<()> {
    let allowed: HashSet<&str> = expected.iter().map(String::as_str).collect();
    let entries = fs::read_dir(install_dir).map_err(|e| {
        UpgradeError::io(format!("listing install dir {}", install_dir.display()), e)
    })?;

    let mut unexpected = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| UpgradeError::io("reading install dir entry", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if allowed.contains(name.as_str()) {
            debug!("preflight: {name} ok");
        } else {
            warn!("preflight: unexpected entry {name}");
            unexpected.push(name);
        }
    }

    if unexpected.is_empty() {
        info!("preflight: {} matches the expected layout", install_dir.display());
        Ok(())
    } else {
        unexpected.sort();
        Err(UpgradeError::Preflight { unexpected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn allow(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn accepts_allow_listed_layout() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("README.md"), "hi").unwrap();
        check_expected_files(dir.path(), &allow(&["lib", "data", "README.md", "LICENSE"]))
            .unwrap();
    }

    #[test]
    fn reports_every_unexpected_name() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("Downloads")).unwrap();
        let err = check_expected_files(dir.path(), &allow(&["lib"])).unwrap_err();
        match err {
            UpgradeError::Preflight { unexpected } => {
                assert_eq!(unexpected, vec!["Downloads".to_owned(), "notes.txt".to_owned()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn single_stray_file_is_named_in_message() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("stray.bin"), "").unwrap();
        let err = check_expected_files(dir.path(), &allow(&["lib"])).unwrap_err();
        assert!(err.to_string().contains("stray.bin"));
    }

    #[test]
    fn missing_install_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = check_expected_files(&dir.path().join("nope"), &allow(&["lib"])).unwrap_err();
        assert!(matches!(err, UpgradeError::Io { .. }));
    }
}
