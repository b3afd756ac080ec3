use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every way a single upgrade step can fail.
///
/// Each component returns its own subset of these; the engine turns whichever
/// one stops the pipeline into the final progress line.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("malformed version string '{value}' (expected major.minor.patch)")]
    VersionFormat { value: String },

    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("invalid JSON in {context}: {reason}")]
    JsonDecode { context: String, reason: String },

    #[error("archive {} is unusable: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },

    #[error("unexpected entries in install directory: {}", unexpected.join(", "))]
    Preflight { unexpected: Vec<String> },

    #[error("install tree is not writable: {}", display_paths(paths))]
    Permission { paths: Vec<PathBuf> },

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("removing old code failed: {0}")]
    DeleteCode(String),

    #[error("installing new code failed: {0}")]
    InstallCode(String),

    #[error("data patch failed: {0}")]
    Patch(String),

    #[error("another upgrade is already running (lock held on {})", lock_path.display())]
    AlreadyRunning { lock_path: PathBuf },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("record store error: {0}")]
    Storage(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl UpgradeError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::JsonDecode {
            context: context.into(),
            reason: err.to_string(),
        }
    }

    pub fn network(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            reason: err.to_string(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = UpgradeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_message_lists_every_name() {
        let err = UpgradeError::Preflight {
            unexpected: vec!["stray.txt".into(), "notes".into()],
        };
        let text = err.to_string();
        assert!(text.contains("stray.txt"));
        assert!(text.contains("notes"));
    }

    #[test]
    fn io_helper_keeps_context() {
        let err = UpgradeError::io(
            "reading manifest",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "reading manifest: gone");
    }
}
