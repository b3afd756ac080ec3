use std::env;
use std::path::{Path, PathBuf};

/// Install root used when nothing else is configured: the directory holding
/// the running executable, or the working directory as a last resort.
pub fn default_install_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn data_dir(install_dir: &Path) -> PathBuf {
    install_dir.join("data")
}

pub fn tmp_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("tmp")
}

pub fn backup_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backups")
}

pub fn lock_file(data_dir: &Path) -> PathBuf {
    data_dir.join("upgrade.lock")
}

pub fn records_file(data_dir: &Path) -> PathBuf {
    data_dir.join("records.json")
}

pub fn patch_state_file(data_dir: &Path) -> PathBuf {
    data_dir.join("patch_state.json")
}
