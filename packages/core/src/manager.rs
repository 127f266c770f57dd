//! Transactional fstab manager.
//!
//! [`FstabManager`] is the only code that touches the mount table on disk.
//! Reads are unprivileged (the file is world-readable); mutations go through
//! a [`PrivilegedSession`] as backup → write → `systemctl daemon-reload`, so
//! the whole transaction costs the user at most one authentication prompt.
//!
//! The write path is diff-gated: when the rendered document equals the file's
//! current bytes, no privileged command is issued at all. Reapplying an
//! identical configuration is observably a no-op.

use std::fs;
use std::path::{Path, PathBuf};

use snafu::ensure;

use crate::error::{Error, IoResultExt, Result};
use crate::fstab::{self, FstabDocument, ManagedEntry, MountIdentity};
use crate::session::{CommandOutcome, PrivilegedSession};

/// Manages the managed block of one fstab file.
#[derive(Debug, Clone)]
pub struct FstabManager {
    fstab_path: PathBuf,
    backup_path: PathBuf,
}

impl FstabManager {
    /// Manager for the system fstab.
    pub fn new() -> Self {
        Self::with_path(fstab::FSTAB_PATH)
    }

    /// Manager for an arbitrary fstab file; the backup lands at the fixed
    /// sibling path next to it.
    pub fn with_path(fstab_path: impl Into<PathBuf>) -> Self {
        let fstab_path = fstab_path.into();
        let backup_path = fstab::backup_path(&fstab_path);
        Self {
            fstab_path,
            backup_path,
        }
    }

    pub fn fstab_path(&self) -> &Path {
        &self.fstab_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Reads and parses the current document.
    pub fn load(&self) -> Result<FstabDocument> {
        let content =
            fs::read_to_string(&self.fstab_path).fstab_read_context(&self.fstab_path)?;
        FstabDocument::parse(&content)
    }

    /// The managed entry currently recorded for an identity, if any.
    pub fn current_entry(&self, identity: &MountIdentity) -> Result<Option<ManagedEntry>> {
        Ok(self.load()?.entry(identity).cloned())
    }

    /// All managed entries, in block order.
    pub fn entries(&self) -> Result<Vec<ManagedEntry>> {
        Ok(self.load()?.entries().to_vec())
    }

    /// Drives the managed block towards the desired state for one identity:
    /// `Some(entry)` upserts, `None` deconfigures.
    ///
    /// When the result differs from the file's current content, the original
    /// is first copied to the backup sibling, then the new content is
    /// written, then systemd is reloaded, all through `session`. A backup
    /// failure aborts with the real file untouched; a write failure leaves
    /// the backup in place for manual recovery and is reported, not retried.
    pub fn apply(
        &self,
        session: &mut PrivilegedSession,
        identity: &MountIdentity,
        desired: Option<ManagedEntry>,
    ) -> Result<()> {
        if let Some(entry) = &desired {
            ensure!(
                &entry.identity == identity,
                crate::error::InvalidIdentitySnafu {
                    message: format!(
                        "desired entry is keyed by {} but apply targets {identity}",
                        entry.identity
                    ),
                }
            );
        }

        let original =
            fs::read_to_string(&self.fstab_path).fstab_read_context(&self.fstab_path)?;
        let mut document = FstabDocument::parse(&original)?;

        match desired {
            Some(entry) => document.upsert(entry),
            None => {
                document.remove(identity);
            }
        }

        let updated = document.render();
        if updated == original {
            log::debug!("fstab already in desired state; no privileged write needed");
            return Ok(());
        }

        let fstab = self.fstab_path.display().to_string();
        let backup = self.backup_path.display().to_string();

        let outcome = session.copy_file(&fstab, &backup)?;
        if !outcome.success {
            return Err(Error::BackupFailed {
                path: self.fstab_path.clone(),
                backup: self.backup_path.clone(),
                message: failure_message(&outcome),
            });
        }

        let outcome = session.write_file(&fstab, &updated)?;
        if !outcome.success {
            // The verified backup stays behind for manual recovery.
            return Err(Error::WriteFailed {
                path: self.fstab_path.clone(),
                message: failure_message(&outcome),
            });
        }

        let outcome = session.exec("systemctl", &["daemon-reload"])?;
        if !outcome.success {
            return Err(Error::Systemd {
                message: format!("daemon-reload failed: {}", failure_message(&outcome)),
            });
        }

        log::info!("updated managed fstab block for {identity}");
        Ok(())
    }
}

impl Default for FstabManager {
    fn default() -> Self {
        Self::new()
    }
}

fn failure_message(outcome: &CommandOutcome) -> String {
    if let Some(error) = &outcome.error {
        error.clone()
    } else if !outcome.stderr.is_empty() {
        outcome.stderr.clone()
    } else {
        format!("exit code {:?}", outcome.exit_code)
    }
}
