//! Unpacks a downloaded source archive.
//!
//! Code-hosting "download source as zip" archives list a single top-level
//! folder (`owner-repo-<sha>/`) as their first entry. That folder is the
//! extraction root handed to the code swap.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
use zip::read::ZipArchive;

use crate::error::{Result, UpgradeError};

/// Extract `archive_path` under `out_dir` and return `out_dir/<root folder>`.
pub fn extract_release(archive_path: &Path, out_dir: &Path) -> Result<PathBuf> {
    info!(
        "extract: {} -> {}",
        archive_path.display(),
        out_dir.display()
    );
    let archive_err = |reason: String| UpgradeError::Archive {
        path: archive_path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(archive_path).map_err(|e| archive_err(format!("open error: {e}")))?;
    let mut archive = ZipArchive::new(file).map_err(|e| archive_err(format!("zip parse error: {e}")))?;
    if archive.is_empty() {
        return Err(archive_err("archive has no entries".into()));
    }

    let root = {
        let first = archive
            .by_index(0)
            .map_err(|e| archive_err(format!("zip entry error: {e}")))?;
        root_folder(first.name()).ok_or_else(|| {
            archive_err(format!("first entry '{}' does not name a folder", first.name()))
        })?
    };
    debug!("extract: archive root is {root}");

    fs::create_dir_all(out_dir).map_err(|e| archive_err(format!("output dir error: {e}")))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| archive_err(format!("zip entry error: {e}")))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| archive_err(format!("unsafe entry path '{}'", entry.name())))?;
        if !relative.starts_with(&root) {
            return Err(archive_err(format!(
                "entry '{}' is outside root folder '{root}'",
                entry.name()
            )));
        }

        let out_path = out_dir.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| archive_err(format!("dir create error: {e}")))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| archive_err(format!("parent dir error: {e}")))?;
        }
        let mut out_file =
            fs::File::create(&out_path).map_err(|e| archive_err(format!("create file error: {e}")))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| archive_err(format!("write error: {e}")))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            apply_mode(&out_path, mode);
        }
    }

    let extracted = out_dir.join(&root);
    info!("extract: release unpacked at {}", extracted.display());
    Ok(extracted)
}

/// Carry the archived permission bits over. A refusal (e.g. a filesystem
/// without unix modes) is logged and the file is kept as written.
#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)) {
        Ok(()) => true,
        Err(err) => {
            warn!("extract: could not set mode {:o} on {}: {err}", mode & 0o777, path.display());
            false
        }
    }
}

/// First path component of an entry name, when it is a plain folder name.
fn root_folder(entry_name: &str) -> Option<String> {
    let path = Path::new(entry_name);
    let mut components = path.components();
    let first = match components.next()? {
        Component::Normal(name) => name.to_string_lossy().into_owned(),
        _ => return None,
    };
    // A bare file at the top level has no folder to act as root.
    let is_folder = entry_name.ends_with('/') || components.next().is_some();
    is_folder.then_some(first)
}

#[cfg(test)]
pub(crate) mod test_archive {
    use std::io::Write;
    use std::path::Path;

    use zip::CompressionMethod;
    use zip::write::{SimpleFileOptions, ZipWriter};

    /// Write a zip whose entries appear in the given order. Names ending in
    /// `/` become directory entries.
    pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, contents) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_archive::write_zip;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn returns_root_folder_under_output_dir() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("release.zip");
        write_zip(
            &zip_path,
            &[
                ("myrepo-v5.2.1/", ""),
                ("myrepo-v5.2.1/lib/", ""),
                ("myrepo-v5.2.1/lib/main.py", "print('5.2.1')"),
                ("myrepo-v5.2.1/README.md", "readme"),
            ],
        );
        let out = dir.path().join("code");

        let root = extract_release(&zip_path, &out).unwrap();

        assert_eq!(root, out.join("myrepo-v5.2.1"));
        assert_eq!(
            fs::read_to_string(root.join("lib").join("main.py")).unwrap(),
            "print('5.2.1')"
        );
        assert!(root.join("README.md").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_survives_extraction() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use zip::write::{SimpleFileOptions, ZipWriter};

        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("release.zip");
        let mut zip = ZipWriter::new(fs::File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        zip.add_directory("myrepo-5.1.0/", options).unwrap();
        zip.start_file("myrepo-5.1.0/run.sh", options.unix_permissions(0o755))
            .unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();
        zip.finish().unwrap();

        let root = extract_release(&archive, &dir.path().join("out")).unwrap();

        let mode = fs::metadata(root.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn refused_mode_change_is_reported() {
        let dir = TempDir::new().unwrap();
        assert!(!apply_mode(&dir.path().join("gone"), 0o644));
        let present = dir.path().join("present");
        fs::write(&present, "x").unwrap();
        assert!(apply_mode(&present, 0o600));
    }

    #[test]
    fn corrupt_archive_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("release.zip");
        fs::write(&zip_path, b"PK\x03\x04 definitely not a zip").unwrap();
        let err = extract_release(&zip_path, &dir.path().join("code")).unwrap_err();
        assert!(matches!(err, UpgradeError::Archive { .. }));
    }

    #[test]
    fn missing_archive_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let err = extract_release(&dir.path().join("absent.zip"), &dir.path().join("code"))
            .unwrap_err();
        assert!(matches!(err, UpgradeError::Archive { .. }));
    }

    #[test]
    fn entries_outside_the_root_are_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("release.zip");
        write_zip(
            &zip_path,
            &[("app-1/", ""), ("app-1/a.txt", "a"), ("other/b.txt", "b")],
        );
        let err = extract_release(&zip_path, &dir.path().join("code")).unwrap_err();
        assert!(err.to_string().contains("outside root folder"));
    }

    #[test]
    fn root_folder_requires_a_directory() {
        assert_eq!(root_folder("repo-1.0.0/"), Some("repo-1.0.0".into()));
        assert_eq!(root_folder("repo-1.0.0/src/lib.rs"), Some("repo-1.0.0".into()));
        assert_eq!(root_folder("README.md"), None);
        assert_eq!(root_folder("/abs/path"), None);
    }
}
