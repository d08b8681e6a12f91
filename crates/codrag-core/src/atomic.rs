//! Atomic stage-then-swap commits for index directories.
//!
//! All index mutations follow the same protocol: write every output into a
//! sibling staging directory (write → flush → fsync → close per file), rename
//! any existing target aside as a backup, rename staging into place, then
//! drop the backup. A partially written staging directory never becomes live;
//! a crash between backup and swap is repaired at the next startup by
//! promoting the backup.
//!
//! The embedding build and the trace build commit disjoint file sets into the
//! same index directory, so a commit carries target files that are not part
//! of its own output set into staging before the swap.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use crate::error::{CoreError, CoreResult};

const STAGING_PREFIX: &str = ".index_build_";
const BACKUP_PREFIX: &str = ".index_backup_";

/// Sibling staging/backup directories older than this are removed at startup.
const STALE_AFTER: Duration = Duration::from_secs(3600);

static COMMIT_SEQ: AtomicU64 = AtomicU64::new(0);

fn commit_suffix() -> String {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = COMMIT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{millis}_{seq}")
}

/// An in-progress staged commit against a target index directory.
///
/// Dropping an uncommitted `StagedCommit` deletes its staging directory.
pub struct StagedCommit {
    target: PathBuf,
    staging: PathBuf,
    committed: bool,
}

impl StagedCommit {
    /// Create a staging directory sibling to `target`.
    pub fn begin(target: &Path) -> CoreResult<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| CoreError::Internal(format!("target has no parent: {}", target.display())))?;
        fs::create_dir_all(parent)?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "index".to_string());
        let staging = parent.join(format!("{STAGING_PREFIX}{}_{name}", commit_suffix()));
        fs::create_dir_all(&staging)?;

        Ok(Self { target: target.to_path_buf(), staging, committed: false })
    }

    /// The staging directory outputs should be written into.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Path of a named output inside staging. Use for writers (e.g. SQLite)
    /// that manage their own file handles; call [`Self::sync_file`] after.
    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.staging.join(name)
    }

    /// Write a named output: write, flush, fsync, close.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> CoreResult<()> {
        let path = self.staging.join(name);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Fsync a staged output written through an external handle.
    pub fn sync_file(&self, name: &str) -> CoreResult<()> {
        let file = File::open(self.staging.join(name))?;
        file.sync_all()?;
        Ok(())
    }

    /// Swap staging into place.
    ///
    /// Files present in the existing target but absent from staging are
    /// carried over first, so commits with disjoint output sets do not erase
    /// each other's artifacts.
    pub fn commit(mut self) -> CoreResult<()> {
        if self.target.exists() {
            self.carry_over_existing()?;
        }

        let backup = if self.target.exists() {
            let backup = self
                .target
                .parent()
                .map(|p| p.join(format!("{BACKUP_PREFIX}{}", commit_suffix())))
                .ok_or_else(|| CoreError::Internal("target has no parent".into()))?;
            if let Err(e) = fs::rename(&self.target, &backup) {
                self.cleanup_staging();
                return Err(e.into());
            }
            Some(backup)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.staging, &self.target) {
            // Roll back: restore the backup as the live target.
            if let Some(backup) = &backup {
                if let Err(restore_err) = fs::rename(backup, &self.target) {
                    tracing::error!(
                        backup = %backup.display(),
                        target = %self.target.display(),
                        error = %restore_err,
                        "failed to restore backup after aborted swap"
                    );
                }
            }
            self.cleanup_staging();
            return Err(e.into());
        }

        self.committed = true;

        if let Some(backup) = backup {
            if let Err(e) = fs::remove_dir_all(&backup) {
                tracing::warn!(backup = %backup.display(), error = %e, "failed to remove backup");
            }
        }

        Ok(())
    }

    fn carry_over_existing(&self) -> CoreResult<()> {
        for entry in fs::read_dir(&self.target)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let staged = self.staging.join(&name);
            if !staged.exists() {
                fs::copy(entry.path(), &staged)?;
            }
        }
        Ok(())
    }

    fn cleanup_staging(&mut self) {
        if self.staging.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                tracing::warn!(staging = %self.staging.display(), error = %e, "failed to remove staging");
            }
        }
        self.committed = true; // nothing left for Drop to do
    }
}

impl Drop for StagedCommit {
    fn drop(&mut self) {
        if !self.committed {
            self.cleanup_staging();
        }
    }
}

/// Startup maintenance for an index directory.
///
/// Removes sibling staging/backup directories older than one hour. If the
/// target is missing and exactly one backup younger than one hour remains
/// (the signature of a crash between backup and swap), that backup is
/// promoted back to the target.
pub fn startup_recovery(target: &Path) {
    let Some(parent) = target.parent() else { return };
    let Ok(entries) = fs::read_dir(parent) else { return };

    let now = SystemTime::now();
    let mut young_backups: Vec<PathBuf> = Vec::new();

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_staging = name.starts_with(STAGING_PREFIX);
        let is_backup = name.starts_with(BACKUP_PREFIX);
        if !is_staging && !is_backup {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);

        if age > STALE_AFTER {
            tracing::info!(path = %path.display(), "removing stale build artifact");
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale artifact");
            }
        } else if is_backup {
            young_backups.push(path);
        }
    }

    if !target.exists() && young_backups.len() == 1 {
        let backup = &young_backups[0];
        tracing::info!(
            backup = %backup.display(),
            target = %target.display(),
            "promoting backup to target after interrupted swap"
        );
        if let Err(e) = fs::rename(backup, target) {
            tracing::error!(backup = %backup.display(), error = %e, "backup promotion failed");
        }
    }
}
