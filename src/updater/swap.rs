//! Backup-swap protocol
//!
//! The live install is renamed to a hidden sibling before anything new is
//! written, the new build is extracted into a second sibling, files the user
//! kept in the old install are copied in with [`carry_over`], and only a
//! rename moves it into place. Renames within one directory are atomic, so
//! the install path always holds either the old tree, the new tree, or (for
//! the instant between the two renames) nothing.
//!
//! [`SwapTransaction`] restores the backup on every path that does not end
//! in [`SwapTransaction::commit`], including unwinding through `Drop`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::error::UpdateError;
use crate::paths;

/// The three locations involved in one swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPaths {
    pub target: PathBuf,
    pub backup: PathBuf,
    pub staging: PathBuf,
}

impl SwapPaths {
    pub fn for_target(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            backup: paths::backup_path(target),
            staging: paths::staging_path(target),
        }
    }
}

/// What [`recover`] had to clean up from an earlier run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// The install was missing and the backup was moved back
    pub restored_backup: bool,
    /// Both existed; the stale backup was deleted
    pub removed_stale_backup: bool,
    /// A leftover staging directory was deleted
    pub removed_staging: bool,
}

impl Recovery {
    pub fn is_clean(&self) -> bool {
        *self == Recovery::default()
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Repair leftovers of an interrupted install before starting a new one
///
/// The install path is authoritative when it exists: a stale backup next to
/// it is removed. When only the backup exists, the previous run died between
/// the two renames and the backup is moved back.
pub fn recover(paths: &SwapPaths) -> Result<Recovery, UpdateError> {
    let mut recovery = Recovery::default();

    if paths.staging.exists() {
        remove_path(&paths.staging).map_err(|e| {
            UpdateError::filesystem(
                format!("Failed to remove leftover {}", paths.staging.display()),
                e,
            )
        })?;
        recovery.removed_staging = true;
    }

    if paths.backup.exists() {
        if paths.target.exists() {
            warn!(
                "Stale backup {} found next to {}, removing it",
                paths.backup.display(),
                paths.target.display()
            );
            remove_path(&paths.backup).map_err(|e| {
                UpdateError::filesystem(
                    format!("Failed to remove stale backup {}", paths.backup.display()),
                    e,
                )
            })?;
            recovery.removed_stale_backup = true;
        } else {
            warn!(
                "Install {} missing but backup exists, restoring it",
                paths.target.display()
            );
            fs::rename(&paths.backup, &paths.target).map_err(|e| {
                UpdateError::filesystem(
                    format!("Failed to restore {} from backup", paths.target.display()),
                    e,
                )
            })?;
            recovery.restored_backup = true;
        }
    }

    Ok(recovery)
}

/// Copy what the new build lacks from the previous install into staging
///
/// Files shipped by the new build win. Everything else the user kept in the
/// install folder (`User/`, `portable.txt`, extra files inside `Sys/`) is
/// copied across. The backup itself is not modified, so a rollback still
/// restores it exactly. Returns the number of files copied.
pub fn carry_over(backup: &Path, staging: &Path) -> io::Result<usize> {
    let mut copied = 0;
    let mut walker = walkdir::WalkDir::new(backup).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(backup).map_err(io::Error::other)?;
        let dest = staging.join(rel);
        let file_type = entry.file_type();

        if let Ok(existing) = fs::symlink_metadata(&dest) {
            // The new build put a file where the user had a folder
            if file_type.is_dir() && !existing.is_dir() {
                warn!("Not keeping {}: replaced by a file in the new build", rel.display());
                walker.skip_current_dir();
            }
            continue;
        }

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }

        #[cfg(unix)]
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &dest)?;
            copied += 1;
            continue;
        }

        fs::copy(entry.path(), &dest)?;
        copied += 1;
    }

    Ok(copied)
}

/// An in-progress swap holding the previous install aside
#[derive(Debug)]
pub struct SwapTransaction {
    paths: SwapPaths,
    /// The backup rename happened and has not been undone
    holds_backup: bool,
    /// The staging tree now lives at the target
    swapped: bool,
    finished: bool,
}

impl SwapTransaction {
    /// Prepare an empty staging directory and rename the live install aside
    ///
    /// When this fails nothing has changed on disk.
    pub fn begin(paths: SwapPaths) -> Result<Self, UpdateError> {
        fs::create_dir_all(&paths.staging).map_err(|e| {
            UpdateError::filesystem(format!("Failed to create {}", paths.staging.display()), e)
        })?;

        if let Err(e) = fs::rename(&paths.target, &paths.backup) {
            if let Err(cleanup) = remove_path(&paths.staging) {
                warn!("Could not remove {}: {}", paths.staging.display(), cleanup);
            }
            return Err(UpdateError::filesystem(
                format!(
                    "Failed to move {} aside to {}",
                    paths.target.display(),
                    paths.backup.display()
                ),
                e,
            ));
        }
        debug!("Backed up {} -> {}", paths.target.display(), paths.backup.display());

        Ok(Self {
            paths,
            holds_backup: true,
            swapped: false,
            finished: false,
        })
    }

    pub fn paths(&self) -> &SwapPaths {
        &self.paths
    }

    pub fn staging(&self) -> &Path {
        &self.paths.staging
    }

    /// Move the extracted staging tree to the install path
    pub fn swap_in(&mut self) -> Result<(), UpdateError> {
        fs::rename(&self.paths.staging, &self.paths.target).map_err(|e| {
            UpdateError::filesystem(
                format!("Failed to move new build into {}", self.paths.target.display()),
                e,
            )
        })?;
        self.swapped = true;
        Ok(())
    }

    /// Keep the new tree and delete the backup
    ///
    /// A backup that can't be deleted is left behind with a warning; the next
    /// install's [`recover`] removes it.
    pub fn commit(mut self) {
        self.finished = true;
        if let Err(e) = remove_path(&self.paths.backup) {
            warn!(
                "Could not remove backup {}: {}",
                self.paths.backup.display(),
                e
            );
        }
        self.holds_backup = false;
        info!("Committed new build at {}", self.paths.target.display());
    }

    /// Discard whatever was written and put the previous install back
    pub fn rollback(mut self) -> Result<(), String> {
        self.finished = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<(), String> {
        if let Err(e) = remove_path(&self.paths.staging) {
            warn!("Could not remove {}: {}", self.paths.staging.display(), e);
        }

        if !self.holds_backup {
            return Ok(());
        }

        // Anything at the target now is (part of) the new build
        if self.swapped || self.paths.target.exists() {
            remove_path(&self.paths.target).map_err(|e| {
                format!("could not clear {}: {}", self.paths.target.display(), e)
            })?;
        }

        fs::rename(&self.paths.backup, &self.paths.target).map_err(|e| {
            format!(
                "could not rename {} back to {}: {}",
                self.paths.backup.display(),
                self.paths.target.display(),
                e
            )
        })?;

        self.holds_backup = false;
        self.swapped = false;
        info!("Restored previous install at {}", self.paths.target.display());
        Ok(())
    }
}

impl Drop for SwapTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("Swap for {} abandoned, rolling back", self.paths.target.display());
        if let Err(e) = self.restore() {
            error!("Rollback of {} failed: {}", self.paths.target.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_install(root: &Path, marker: &str) -> PathBuf {
        let target = root.join("Dolphin-x64");
        fs::create_dir_all(target.join("Sys")).unwrap();
        fs::write(target.join("Dolphin.exe"), marker).unwrap();
        fs::write(target.join("Sys/a.ini"), "ini").unwrap();
        target
    }

    #[test]
    fn test_commit_replaces_install() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "old");
        let paths = SwapPaths::for_target(&target);

        let mut txn = SwapTransaction::begin(paths.clone()).unwrap();
        assert!(!target.exists());
        assert!(paths.backup.is_dir());
        fs::write(txn.staging().join("Dolphin.exe"), "new").unwrap();

        txn.swap_in().unwrap();
        txn.commit();

        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "new");
        assert!(!target.join("Sys").exists());
        assert!(!paths.backup.exists());
        assert!(!paths.staging.exists());
    }

    #[test]
    fn test_rollback_before_swap() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "old");
        let paths = SwapPaths::for_target(&target);

        let txn = SwapTransaction::begin(paths.clone()).unwrap();
        fs::write(txn.staging().join("partial.bin"), "half").unwrap();
        txn.rollback().unwrap();

        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "old");
        assert!(target.join("Sys/a.ini").exists());
        assert!(!paths.backup.exists());
        assert!(!paths.staging.exists());
    }

    #[test]
    fn test_rollback_after_swap() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "old");
        let paths = SwapPaths::for_target(&target);

        let mut txn = SwapTransaction::begin(paths.clone()).unwrap();
        fs::write(txn.staging().join("Dolphin.exe"), "new").unwrap();
        txn.swap_in().unwrap();
        txn.rollback().unwrap();

        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "old");
        assert!(!paths.backup.exists());
    }

    #[test]
    fn test_drop_rolls_back() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "old");
        let paths = SwapPaths::for_target(&target);

        {
            let txn = SwapTransaction::begin(paths.clone()).unwrap();
            fs::write(txn.staging().join("junk"), "x").unwrap();
        }

        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "old");
        assert!(!paths.backup.exists());
        assert!(!paths.staging.exists());
    }

    #[test]
    fn test_begin_on_missing_target_changes_nothing() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("missing");
        let paths = SwapPaths::for_target(&target);

        let err = SwapTransaction::begin(paths.clone()).unwrap_err();
        assert!(matches!(err, UpdateError::Filesystem { .. }));
        assert!(!paths.backup.exists());
        assert!(!paths.staging.exists());
    }

    #[test]
    fn test_begin_without_staging_leaves_install_live() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "old");
        let paths = SwapPaths::for_target(&target);
        // A file in the way makes the staging directory impossible to create
        fs::write(&paths.staging, "in the way").unwrap();

        let err = SwapTransaction::begin(paths.clone()).unwrap_err();

        assert!(matches!(err, UpdateError::Filesystem { .. }));
        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "old");
        assert!(!paths.backup.exists());
    }

    #[test]
    fn test_carry_over_keeps_user_files() {
        let temp = tempdir().unwrap();
        let backup = temp.path().join("backup");
        let staging = temp.path().join("staging");
        fs::create_dir_all(backup.join("User/GC")).unwrap();
        fs::create_dir_all(backup.join("Sys")).unwrap();
        fs::write(backup.join("Dolphin.exe"), "old").unwrap();
        fs::write(backup.join("portable.txt"), "").unwrap();
        fs::write(backup.join("User/GC/MemoryCardA.USA.raw"), "saves").unwrap();
        fs::write(backup.join("Sys/custom.ini"), "mine").unwrap();
        fs::create_dir_all(staging.join("Sys")).unwrap();
        fs::write(staging.join("Dolphin.exe"), "new").unwrap();
        fs::write(staging.join("Sys/a.ini"), "shipped").unwrap();

        let copied = carry_over(&backup, &staging).unwrap();

        assert_eq!(copied, 3);
        assert_eq!(fs::read_to_string(staging.join("Dolphin.exe")).unwrap(), "new");
        assert!(staging.join("portable.txt").is_file());
        assert_eq!(
            fs::read_to_string(staging.join("User/GC/MemoryCardA.USA.raw")).unwrap(),
            "saves"
        );
        assert_eq!(fs::read_to_string(staging.join("Sys/custom.ini")).unwrap(), "mine");
        assert!(staging.join("Sys/a.ini").is_file());
        // Backup is copied from, never moved out of
        assert!(backup.join("User/GC/MemoryCardA.USA.raw").is_file());
        assert_eq!(fs::read_to_string(backup.join("Dolphin.exe")).unwrap(), "old");
    }

    #[test]
    fn test_carry_over_skips_folder_replaced_by_file() {
        let temp = tempdir().unwrap();
        let backup = temp.path().join("backup");
        let staging = temp.path().join("staging");
        fs::create_dir_all(backup.join("Docs")).unwrap();
        fs::write(backup.join("Docs/readme.txt"), "old docs").unwrap();
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("Docs"), "new docs").unwrap();

        assert_eq!(carry_over(&backup, &staging).unwrap(), 0);
        assert_eq!(fs::read_to_string(staging.join("Docs")).unwrap(), "new docs");
    }

    #[test]
    fn test_recover_restores_orphaned_backup() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "old");
        let paths = SwapPaths::for_target(&target);
        fs::rename(&target, &paths.backup).unwrap();
        fs::create_dir_all(&paths.staging).unwrap();

        let recovery = recover(&paths).unwrap();
        assert!(recovery.restored_backup);
        assert!(recovery.removed_staging);
        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "old");
    }

    #[test]
    fn test_recover_prefers_live_target() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "live");
        let paths = SwapPaths::for_target(&target);
        fs::create_dir_all(&paths.backup).unwrap();
        fs::write(paths.backup.join("Dolphin.exe"), "stale").unwrap();

        let recovery = recover(&paths).unwrap();
        assert!(recovery.removed_stale_backup);
        assert!(!recovery.restored_backup);
        assert!(!paths.backup.exists());
        assert_eq!(fs::read_to_string(target.join("Dolphin.exe")).unwrap(), "live");
    }

    #[test]
    fn test_recover_clean() {
        let temp = tempdir().unwrap();
        let target = make_install(temp.path(), "live");
        assert!(recover(&SwapPaths::for_target(&target)).unwrap().is_clean());
    }
}
