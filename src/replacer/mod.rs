use std::path::Path;

use log::{error, info};

use crate::backup::BackupCollaborator;
use crate::error::{Result, UpgradeError};

/// Sequences removal of the old code and installation of the new code on top
/// of a [`BackupCollaborator`].
pub struct CodeReplacer<'a> {
    backup: &'a dyn BackupCollaborator,
}

impl<'a> CodeReplacer<'a> {
    pub fn new(backup: &'a dyn BackupCollaborator) -> Self {
        Self { backup }
    }

    pub fn delete_old(&self) -> Result<()> {
        self.backup.delete_code()
    }

    /// Install `extracted`. When that fails the retired code is moved back;
    /// the returned error says whether that worked.
    pub fn install_new(&self, extracted: &Path) -> Result<()> {
        let Err(install_err) = self.backup.restore_code(extracted) else {
            return Ok(());
        };
        error!("replace: install failed ({install_err}); reinstating previous code");
        match self.backup.reinstate_code() {
            Ok(()) => {
                info!("replace: previous code reinstated");
                Err(UpgradeError::InstallCode(format!(
                    "{install_err}; previous code reinstated"
                )))
            }
            Err(undo_err) => Err(UpgradeError::InstallCode(format!(
                "{install_err}; reinstating previous code also failed ({undo_err}), restore from backup"
            ))),
        }
    }

    pub fn replace(&self, extracted: &Path) -> Result<()> {
        self.delete_old()?;
        self.install_new(extracted)
    }
}
