use std::fmt;
use std::path::PathBuf;

/// Steps of one upgrade run, in order. `Done` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeStage {
    CheckVersion,
    Preflight,
    Permissions,
    Backup,
    Download,
    Extract,
    DeleteOld,
    InstallNew,
    CleanupTemp,
    Patch,
    Done,
    Failed,
}

impl UpgradeStage {
    pub fn label(self) -> &'static str {
        match self {
            UpgradeStage::CheckVersion => "version check",
            UpgradeStage::Preflight => "preflight",
            UpgradeStage::Permissions => "permission check",
            UpgradeStage::Backup => "backup",
            UpgradeStage::Download => "download",
            UpgradeStage::Extract => "extract",
            UpgradeStage::DeleteOld => "delete old code",
            UpgradeStage::InstallNew => "install new code",
            UpgradeStage::CleanupTemp => "cleanup",
            UpgradeStage::Patch => "data patch",
            UpgradeStage::Done => "done",
            UpgradeStage::Failed => "failed",
        }
    }

    // Line appended to the progress log when the stage begins.
    pub(crate) fn start_line(self) -> Option<&'static str> {
        match self {
            UpgradeStage::CheckVersion => Some("Checking for a newer release..."),
            UpgradeStage::Preflight => Some("Checking current install area for expected files..."),
            UpgradeStage::Permissions => Some("Checking write permissions..."),
            UpgradeStage::Backup => Some("Creating backup of code and data..."),
            UpgradeStage::Download => Some("Downloading new version..."),
            UpgradeStage::Extract => Some("Extracting zip..."),
            UpgradeStage::DeleteOld => Some("Deleting old code..."),
            UpgradeStage::InstallNew => Some("Moving new code in place..."),
            UpgradeStage::CleanupTemp => Some("Cleaning tmp area..."),
            UpgradeStage::Patch => Some("Patching data..."),
            UpgradeStage::Done | UpgradeStage::Failed => None,
        }
    }

    pub(crate) fn failure_line(self) -> String {
        match self {
            UpgradeStage::Permissions => "Install tree is not writable, aborting upgrade".into(),
            UpgradeStage::Backup => "Backup failed, aborting upgrade".into(),
            UpgradeStage::Download => "Download of the new version failed, aborting upgrade".into(),
            UpgradeStage::Extract => "Extracting from zip failed, aborting upgrade".into(),
            UpgradeStage::DeleteOld => "Deleting old files failed, aborting upgrade".into(),
            UpgradeStage::InstallNew => "Moving new code in place failed, aborting upgrade".into(),
            other => format!("Upgrade stopped during {}", other.label()),
        }
    }
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Upgraded {
        from: String,
        to: String,
        backup: PathBuf,
    },
    AlreadyCurrent {
        version: String,
    },
    Failed {
        stage: UpgradeStage,
        reason: String,
    },
}

impl UpgradeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, UpgradeOutcome::Failed { .. })
    }

    pub fn stage(&self) -> UpgradeStage {
        match self {
            UpgradeOutcome::Upgraded { .. } | UpgradeOutcome::AlreadyCurrent { .. } => {
                UpgradeStage::Done
            }
            UpgradeOutcome::Failed { .. } => UpgradeStage::Failed,
        }
    }
}

/// Sent to an observer while a run progresses.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Stage(UpgradeStage),
    Line(String),
    Download { downloaded: u64, total: Option<u64> },
    Finished(UpgradeOutcome),
}

/// Result of [`crate::engine::Upgrader::run`]: the outcome plus every line
/// the run logged.
#[derive(Clone, Debug)]
pub struct UpgradeReport {
    pub outcome: UpgradeOutcome,
    pub log: Vec<String>,
}

impl UpgradeReport {
    pub fn last_line(&self) -> Option<&str> {
        self.log.last().map(String::as_str)
    }
}
