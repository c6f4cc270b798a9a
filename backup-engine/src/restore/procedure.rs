//! The destructive part of a restore, once the archive is local.
//!
//! Steps run strictly in order. Nothing touches the live store before the
//! insurance copy exists; after the store files are replaced, any failure
//! rolls back to that copy.

use super::RestoreError;
use crate::archive::{self, ArchiveError};
use crate::catalog::BackupEntry;
use crate::store::{PersistentStore, StoreError};
use std::fs;
use std::io;
use std::path::Path;
use tempfile::TempDir;
use tracing::{error, info, warn};

/// Restore `entry` over the live store, using `scratch_root` for the unpacked
/// archive and the insurance copy. Both scratch directories are removed on
/// every path out.
pub fn run(store: &dyn PersistentStore, entry: &BackupEntry, scratch_root: &Path) -> Result<(), RestoreError> {
    let schema_version = entry.marker().schema_version.as_str();
    if !store.recognizes_schema_version(schema_version) {
        return Err(RestoreError::UnsupportedVersion(schema_version.to_string()));
    }
    if !entry.archive_path().is_file() {
        return Err(RestoreError::MissingDataArchive(entry.archive_path().to_path_buf()));
    }

    // Unpacking space is part of the unpack step
    let unpack_space = |e: io::Error| RestoreError::UnpackArchiveFailure(ArchiveError::Io(e));
    fs::create_dir_all(scratch_root).map_err(unpack_space)?;
    let unpacked = scratch_dir(scratch_root, "restore-unpacked-").map_err(unpack_space)?;
    let result = restore_from(store, entry, unpacked.path(), scratch_root);
    discard(unpacked);
    result
}

fn restore_from(
    store: &dyn PersistentStore,
    entry: &BackupEntry,
    unpacked: &Path,
    scratch_root: &Path,
) -> Result<(), RestoreError> {
    archive::unpack_archive(entry.archive_path(), unpacked).map_err(RestoreError::UnpackArchiveFailure)?;

    let insurance = take_insurance(store, scratch_root)?;
    let result = replace_with_rollback(store, entry, unpacked, insurance.path());
    discard(insurance);
    result
}

fn replace_with_rollback(
    store: &dyn PersistentStore,
    entry: &BackupEntry,
    unpacked: &Path,
    insurance: &Path,
) -> Result<(), RestoreError> {
    // Point of no return: the live files are about to be replaced
    let outcome = store
        .replace_files(unpacked)
        .map_err(RestoreError::ReplaceStoreFailure)
        .and_then(|()| {
            store
                .reinitialize(&entry.marker().schema_version)
                .map_err(RestoreError::InitialisationFailure)
        });

    let Err(original) = outcome else {
        info!(directory = %entry.directory().display(), "Store replaced from backup");
        return Ok(());
    };

    warn!(error = %original, "Restore failed after replacing store files, rolling back");
    let current = store.current_schema_version();
    let recovered = store
        .replace_files(insurance)
        .and_then(|()| store.reinitialize(&current));

    match recovered {
        Ok(()) => {
            info!("Rolled back to the pre-restore store");
            Err(original)
        }
        Err(e) => {
            error!(error = %e, original = %original, "Rollback failed, store state is unknown");
            Err(RestoreError::ErrorRecoveryFailure(Box::new(original)))
        }
    }
}

/// Copy the live store aside. Any failure here, including making room for
/// the copy, leaves the store untouched.
fn take_insurance(store: &dyn PersistentStore, scratch_root: &Path) -> Result<TempDir, RestoreError> {
    let insurance = scratch_dir(scratch_root, "restore-insurance-")
        .map_err(|e| RestoreError::BackupCreationFailure(StoreError::Io(e)))?;
    if let Err(e) = store.snapshot_copy(insurance.path()) {
        discard(insurance);
        return Err(RestoreError::BackupCreationFailure(e));
    }
    Ok(insurance)
}

fn scratch_dir(scratch_root: &Path, prefix: &str) -> io::Result<TempDir> {
    tempfile::Builder::new().prefix(prefix).tempdir_in(scratch_root)
}

fn discard(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(path = %path.display(), error = %e, "Failed to remove restore scratch directory");
    }
}
