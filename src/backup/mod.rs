use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::UpgradeConfig;
use crate::error::{Result, UpgradeError};

const WRITE_PROBE: &str = ".upkeeper-write-probe";
const RETIRED_DIR: &str = "retired";

/// Snapshot and swap operations on the install tree.
///
/// `delete_code` must leave the old code recoverable until `restore_code`
/// succeeds; `reinstate_code` puts it back when the install step fails.
pub trait BackupCollaborator {
    fn check_write_permissions(&self) -> Result<()>;

    /// Copy code and data somewhere safe. Returns where the copy went.
    fn backup_all(&self) -> Result<PathBuf>;

    fn delete_code(&self) -> Result<()>;

    /// Move the contents of `extracted` into the install root.
    fn restore_code(&self, extracted: &Path) -> Result<()>;

    /// Undo `delete_code` after a failed `restore_code`.
    fn reinstate_code(&self) -> Result<()>;
}

/// Filesystem implementation working directly on the install root.
#[derive(Debug, Clone)]
pub struct InstallBackup {
    install_dir: PathBuf,
    backup_dir: PathBuf,
    tmp_dir: PathBuf,
    preserved: Vec<String>,
    version: String,
}

impl InstallBackup {
    pub fn new(config: &UpgradeConfig) -> Self {
        Self {
            install_dir: config.install_dir.clone(),
            backup_dir: config.backup_dir(),
            tmp_dir: config.tmp_dir(),
            preserved: config.preserved_entries.clone(),
            version: config.current_version.clone(),
        }
    }

    pub fn retired_dir(&self) -> PathBuf {
        self.tmp_dir.join(RETIRED_DIR)
    }

    fn is_preserved(&self, name: &str) -> bool {
        self.preserved.iter().any(|p| p == name)
    }

    /// Top-level entries of the install root that count as code.
    fn code_entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let listing = fs::read_dir(&self.install_dir).map_err(|e| {
            UpgradeError::io(format!("listing {}", self.install_dir.display()), e)
        })?;
        for entry in listing {
            let entry = entry.map_err(|e| UpgradeError::io("reading install dir entry", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_preserved(&name) || entry.path() == self.tmp_dir || entry.path() == self.backup_dir
            {
                continue;
            }
            entries.push(entry.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn next_backup_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let base = format!("{stamp}-{}", self.version);
        let mut candidate = self.backup_dir.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.backup_dir.join(format!("{base}-{n}"));
            n += 1;
        }
        candidate
    }
}

impl BackupCollaborator for InstallBackup {
    fn check_write_permissions(&self) -> Result<()> {
        info!("permissions: checking {}", self.install_dir.display());
        let mut denied = Vec::new();

        let probe = self.install_dir.join(WRITE_PROBE);
        match fs::write(&probe, b"") {
            Ok(()) => {
                let _ = fs::remove_file(&probe);
            }
            Err(err) => {
                warn!("permissions: cannot write in {}: {err}", self.install_dir.display());
                denied.push(self.install_dir.clone());
            }
        }

        for top in self.code_entries()? {
            for entry in WalkDir::new(&top) {
                let entry = entry.map_err(|e| {
                    UpgradeError::io(format!("walking {}", top.display()), e.into())
                })?;
                let metadata = entry.metadata().map_err(|e| {
                    UpgradeError::io(format!("stat {}", entry.path().display()), e.into())
                })?;
                if metadata.permissions().readonly() {
                    debug!("permissions: {} is read-only", entry.path().display());
                    denied.push(entry.path().to_path_buf());
                }
            }
        }

        if denied.is_empty() {
            Ok(())
        } else {
            Err(UpgradeError::Permission { paths: denied })
        }
    }

    fn backup_all(&self) -> Result<PathBuf> {
        let dest = self.next_backup_path();
        info!("backup: copying {} to {}", self.install_dir.display(), dest.display());
        fs::create_dir_all(&dest)
            .map_err(|e| UpgradeError::Backup(format!("creating {}: {e}", dest.display())))?;

        let skip = [self.backup_dir.as_path(), self.tmp_dir.as_path()];
        let walker = WalkDir::new(&self.install_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !skip.contains(&entry.path()));
        let mut files = 0usize;
        for entry in walker {
            let entry = entry.map_err(|e| UpgradeError::Backup(format!("walk error: {e}")))?;
            let relative = entry
                .path()
                .strip_prefix(&self.install_dir)
                .map_err(|e| UpgradeError::Backup(e.to_string()))?;
            let target = dest.join(relative);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target).map_err(|e| {
                    UpgradeError::Backup(format!("creating {}: {e}", target.display()))
                })?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &target).map_err(|e| {
                    UpgradeError::Backup(format!("copying {}: {e}", entry.path().display()))
                })?;
                files += 1;
            } else {
                warn!("backup: skipping special file {}", entry.path().display());
            }
        }

        info!("backup: {files} files saved in {}", dest.display());
        Ok(dest)
    }

    fn delete_code(&self) -> Result<()> {
        let retired = self.retired_dir();
        if retired.exists()
            && fs::read_dir(&retired)
                .map(|mut it| it.next().is_some())
                .unwrap_or(true)
        {
            return Err(UpgradeError::DeleteCode(format!(
                "leftover code from an earlier run in {}; recover or remove it first",
                retired.display()
            )));
        }
        fs::create_dir_all(&retired)
            .map_err(|e| UpgradeError::DeleteCode(format!("creating {}: {e}", retired.display())))?;

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        for path in self.code_entries()? {
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = retired.join(name);
            debug!("delete: retiring {}", path.display());
            if let Err(err) = move_entry(&path, &target) {
                warn!("delete: failed on {}; putting retired code back", path.display());
                // Only what this call moved goes back; nothing else is removed.
                if fs::symlink_metadata(&path).is_ok() && fs::symlink_metadata(&target).is_ok() {
                    if let Err(partial) = remove_entry(&target) {
                        warn!("delete: could not drop partial copy: {partial}");
                    }
                }
                for (from, to) in moved.iter().rev() {
                    if let Err(undo) = move_entry(to, from) {
                        warn!("delete: could not put back {}: {undo}", from.display());
                    }
                }
                if let Err(undo) = fs::remove_dir(&retired) {
                    warn!("delete: could not remove {}: {undo}", retired.display());
                }
                return Err(UpgradeError::DeleteCode(err.to_string()));
            }
            moved.push((path, target));
        }
        info!("delete: old code moved to {}", retired.display());
        Ok(())
    }

    fn restore_code(&self, extracted: &Path) -> Result<()> {
        info!("install: moving {} into {}", extracted.display(), self.install_dir.display());
        let listing = fs::read_dir(extracted).map_err(|e| {
            UpgradeError::InstallCode(format!("listing {}: {e}", extracted.display()))
        })?;
        for entry in listing {
            let entry = entry.map_err(|e| UpgradeError::InstallCode(e.to_string()))?;
            let name = entry.file_name();
            let target = self.install_dir.join(&name);
            if self.is_preserved(&name.to_string_lossy()) && target.exists() {
                debug!("install: keeping existing {}", target.display());
                continue;
            }
            if target.exists() {
                return Err(UpgradeError::InstallCode(format!(
                    "{} still exists after old code was removed",
                    target.display()
                )));
            }
            move_entry(&entry.path(), &target)
                .map_err(|e| UpgradeError::InstallCode(e.to_string()))?;
        }

        let retired = self.retired_dir();
        if let Err(err) = fs::remove_dir_all(&retired) {
            warn!("install: could not discard {}: {err}", retired.display());
        }
        info!("install: new code in place");
        Ok(())
    }

    fn reinstate_code(&self) -> Result<()> {
        let retired = self.retired_dir();
        warn!("reinstate: restoring old code from {}", retired.display());
        for path in self.code_entries()? {
            remove_entry(&path).map_err(|e| UpgradeError::InstallCode(e.to_string()))?;
        }
        let listing = fs::read_dir(&retired).map_err(|e| {
            UpgradeError::InstallCode(format!("listing {}: {e}", retired.display()))
        })?;
        for entry in listing {
            let entry = entry.map_err(|e| UpgradeError::InstallCode(e.to_string()))?;
            move_entry(&entry.path(), &self.install_dir.join(entry.file_name()))
                .map_err(|e| UpgradeError::InstallCode(e.to_string()))?;
        }
        let _ = fs::remove_dir(&retired);
        info!("reinstate: old code back in place");
        Ok(())
    }
}

/// Rename `from` to `to`, copying when the rename crosses devices.
pub fn move_entry(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let is_dir = fs::symlink_metadata(from)
        .map_err(|e| UpgradeError::io(format!("stat {}", from.display()), e))?
        .is_dir();
    if is_dir {
        copy_dir(from, to)?;
    } else {
        fs::copy(from, to).map_err(|e| {
            UpgradeError::io(format!("copying {} to {}", from.display(), to.display()), e)
        })?;
    }
    remove_entry(from)
}

fn remove_entry(path: &Path) -> Result<()> {
    let result = if fs::symlink_metadata(path).is_ok_and(|m| m.is_dir()) {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| UpgradeError::io(format!("removing {}", path.display()), e))
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| UpgradeError::io(format!("creating {}", to.display()), e))?;
    let listing =
        fs::read_dir(from).map_err(|e| UpgradeError::io(format!("listing {}", from.display()), e))?;
    for entry in listing {
        let entry = entry.map_err(|e| UpgradeError::io("reading dir entry", e))?;
        let src_path = entry.path();
        let dst_path = to.join(entry.file_name());
        let is_dir = entry
            .file_type()
            .map_err(|e| UpgradeError::io(format!("stat {}", src_path.display()), e))?
            .is_dir();
        if is_dir {
            copy_dir(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| {
                UpgradeError::io(format!("copying {}", src_path.display()), e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install_layout() -> (TempDir, UpgradeConfig) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib").join("app.py"), "old").unwrap();
        fs::write(root.join("README.md"), "old readme").unwrap();
        fs::create_dir_all(root.join("data").join("db")).unwrap();
        fs::write(root.join("data").join("db").join("store.db"), "records").unwrap();
        fs::write(root.join("config.json"), "{}").unwrap();
        let config = UpgradeConfig {
            current_version: "5.0.0".into(),
            ..UpgradeConfig::for_install_dir(root)
        };
        fs::create_dir_all(config.tmp_dir()).unwrap();
        (dir, config)
    }

    fn new_release(parent: &Path) -> PathBuf {
        let root = parent.join("release-5.1.0");
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib").join("app.py"), "new").unwrap();
        fs::write(root.join("README.md"), "new readme").unwrap();
        fs::write(root.join("config.json"), r#"{"shipped": true}"#).unwrap();
        root
    }

    #[test]
    fn writable_tree_passes_permission_check() {
        let (_dir, config) = install_layout();
        InstallBackup::new(&config).check_write_permissions().unwrap();
        assert!(!config.install_dir.join(WRITE_PROBE).exists());
    }

    #[test]
    fn read_only_file_fails_permission_check() {
        let (_dir, config) = install_layout();
        let locked = config.install_dir.join("lib").join("app.py");
        let mut perms = fs::metadata(&locked).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&locked, perms).unwrap();

        let err = InstallBackup::new(&config)
            .check_write_permissions()
            .unwrap_err();
        match err {
            UpgradeError::Permission { paths } => assert!(paths.contains(&locked)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn backup_copies_code_and_data_but_not_itself() {
        let (_dir, config) = install_layout();
        fs::write(config.tmp_dir().join("scratch.zip"), "tmp").unwrap();
        let backup = InstallBackup::new(&config);

        let first = backup.backup_all().unwrap();
        let second = backup.backup_all().unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with(config.backup_dir()));
        assert_eq!(fs::read_to_string(first.join("lib").join("app.py")).unwrap(), "old");
        assert!(first.join("data").join("db").join("store.db").is_file());
        assert!(!first.join("data").join("tmp").exists());
        assert!(!second.join("data").join("backups").exists());
    }

    #[test]
    fn delete_then_restore_swaps_code_and_keeps_data() {
        let (dir, config) = install_layout();
        let extracted = new_release(&dir.path().join("data").join("tmp").join("code"));
        let backup = InstallBackup::new(&config);

        backup.delete_code().unwrap();
        assert!(!config.install_dir.join("lib").exists());
        assert!(backup.retired_dir().join("lib").join("app.py").is_file());

        backup.restore_code(&extracted).unwrap();
        let root = &config.install_dir;
        assert_eq!(fs::read_to_string(root.join("lib").join("app.py")).unwrap(), "new");
        assert_eq!(fs::read_to_string(root.join("README.md")).unwrap(), "new readme");
        assert_eq!(fs::read_to_string(root.join("config.json")).unwrap(), "{}");
        assert!(root.join("data").join("db").join("store.db").is_file());
        assert!(!backup.retired_dir().exists());
    }

    #[test]
    fn reinstate_puts_old_code_back() {
        let (dir, config) = install_layout();
        let backup = InstallBackup::new(&config);
        backup.delete_code().unwrap();
        // Simulate a half-finished install.
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib").join("partial.py"), "half").unwrap();

        backup.reinstate_code().unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("lib").join("app.py")).unwrap(),
            "old"
        );
        assert!(!dir.path().join("lib").join("partial.py").exists());
        assert_eq!(fs::read_to_string(dir.path().join("README.md")).unwrap(), "old readme");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_delete_puts_back_only_what_it_moved() {
        let (_dir, mut config) = install_layout();
        let long_name = "z".repeat(200);
        fs::write(config.install_dir.join(&long_name), "long").unwrap();

        // A retired dir close to PATH_MAX: short names still fit under it, the
        // long one does not, so both rename and copy fail on that entry.
        let scratch = TempDir::new().unwrap();
        let mut tmp = scratch.path().to_path_buf();
        while tmp.as_os_str().len() + 251 < 3950 {
            tmp.push("d".repeat(250));
        }
        let pad = 3950 - tmp.as_os_str().len() - 1;
        if pad > 0 {
            tmp.push("d".repeat(pad));
        }
        fs::create_dir_all(&tmp).unwrap();
        config.tmp_dir = Some(tmp);
        let backup = InstallBackup::new(&config);

        let err = backup.delete_code().unwrap_err();

        assert!(matches!(err, UpgradeError::DeleteCode(_)), "{err:?}");
        let root = &config.install_dir;
        assert_eq!(fs::read_to_string(root.join("lib").join("app.py")).unwrap(), "old");
        assert_eq!(fs::read_to_string(root.join("README.md")).unwrap(), "old readme");
        assert_eq!(fs::read_to_string(root.join(&long_name)).unwrap(), "long");
        assert_eq!(
            fs::read_to_string(root.join("data").join("db").join("store.db")).unwrap(),
            "records"
        );
        assert!(!backup.retired_dir().exists());
    }

    #[test]
    fn leftover_retired_code_blocks_delete() {
        let (_dir, config) = install_layout();
        let backup = InstallBackup::new(&config);
        fs::create_dir_all(backup.retired_dir()).unwrap();
        fs::write(backup.retired_dir().join("lib"), "left behind").unwrap();
        assert!(matches!(
            backup.delete_code(),
            Err(UpgradeError::DeleteCode(_))
        ));
        assert!(config.install_dir.join("lib").join("app.py").is_file());
    }

    #[test]
    fn copy_fallback_moves_directories() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested").join("f.txt"), "x").unwrap();
        let dst = dir.path().join("dst");
        copy_dir(&src, &dst).unwrap();
        remove_entry(&src).unwrap();
        assert_eq!(fs::read_to_string(dst.join("nested").join("f.txt")).unwrap(), "x");
        assert!(!src.exists());
    }
}
