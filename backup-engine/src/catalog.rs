//! Discovery and ranking of the backups visible in the container.

use crate::archive::ARCHIVE_FILE_NAME;
use crate::cloud::{CloudContainer, ItemFilter};
use crate::marker::{BackupMarkerRecord, DeviceClass, MARKER_FILE_NAME};
use crate::store::PersistentStore;
use crate::utils::format::format_bytes;
use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory below the container root holding one slot per installation.
pub const BACKUPS_DIR_NAME: &str = "Backups";

pub fn backups_root(container: &dyn CloudContainer) -> Option<PathBuf> {
    container.root().map(|root| root.join(BACKUPS_DIR_NAME))
}

/// A backup found in the container: its marker plus where its files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    marker: BackupMarkerRecord,
    directory: PathBuf,
    archive_path: PathBuf,
}

impl BackupEntry {
    pub(crate) fn new(marker: BackupMarkerRecord, directory: PathBuf) -> Self {
        let archive_path = directory.join(ARCHIVE_FILE_NAME);
        Self {
            marker,
            directory,
            archive_path,
        }
    }

    pub fn marker(&self) -> &BackupMarkerRecord {
        &self.marker
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn marker_path(&self) -> PathBuf {
        self.directory.join(MARKER_FILE_NAME)
    }

    pub fn is_from_installation(&self, installation_id: Option<&str>) -> bool {
        installation_id == Some(self.marker.device_vendor_id.as_str())
    }

    /// Strict preference: a backup from the current installation beats any
    /// other, otherwise the earlier backup wins. Never true for `self`.
    pub fn is_preferable_to(&self, other: &BackupEntry, current_installation_id: Option<&str>) -> bool {
        let mine = self.is_from_installation(current_installation_id);
        let theirs = other.is_from_installation(current_installation_id);
        if mine != theirs {
            return mine;
        }
        self.marker.created_at < other.marker.created_at
    }

    /// Same device class and a schema version this installation can open.
    pub fn is_restorable_on(&self, device_class: DeviceClass, store: &dyn PersistentStore) -> bool {
        self.marker.device_class == device_class
            && store.recognizes_schema_version(&self.marker.schema_version)
    }

    pub fn display_size(&self) -> String {
        format_bytes(self.marker.archive_size_bytes)
    }

    pub fn description(&self) -> String {
        format!(
            "{} ({}), {}, {}",
            self.marker.device_name,
            self.marker.device_class,
            self.marker.created_at.format("%Y-%m-%d %H:%M UTC"),
            self.display_size()
        )
    }
}

fn preference_order(a: &BackupEntry, b: &BackupEntry, current: Option<&str>) -> Ordering {
    if a.is_preferable_to(b, current) {
        Ordering::Less
    } else if b.is_preferable_to(a, current) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Read every backup slot with a readable marker, most preferable first.
///
/// Slots whose marker is missing, not downloaded yet, or corrupt are skipped
/// so one bad backup never hides the others. An unavailable container yields
/// an empty list.
pub fn read_backups(container: &dyn CloudContainer, current_installation_id: Option<&str>) -> Vec<BackupEntry> {
    let Some(root) = backups_root(container) else {
        debug!("No container available, no backups to list");
        return Vec::new();
    };

    let items = match container.gather(&ItemFilter::FileName(MARKER_FILE_NAME.to_string())) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "Failed to list backup markers");
            return Vec::new();
        }
    };

    let mut entries = Vec::new();
    for item in items {
        let Some(directory) = item.path.parent() else {
            continue;
        };
        if directory.parent() != Some(root.as_path()) {
            continue;
        }
        match BackupMarkerRecord::read_from(&item.path) {
            Ok(marker) => entries.push(BackupEntry::new(marker, directory.to_path_buf())),
            Err(e) => {
                warn!(path = %item.path.display(), status = ?item.status, error = %e, "Skipping unreadable backup")
            }
        }
    }

    entries.sort_by(|a, b| preference_order(a, b, current_installation_id));
    entries
}

/// Most preferable entry, by min-reduction over [`BackupEntry::is_preferable_to`].
pub fn best_backup<'a>(entries: &'a [BackupEntry], current_installation_id: Option<&str>) -> Option<&'a BackupEntry> {
    entries.iter().fold(None, |best, candidate| match best {
        Some(best) if !candidate.is_preferable_to(best, current_installation_id) => Some(best),
        _ => Some(candidate),
    })
}

/// Entries this installation may restore, keeping their order.
pub fn eligible_backups(
    entries: &[BackupEntry],
    device_class: DeviceClass,
    store: &dyn PersistentStore,
) -> Vec<BackupEntry> {
    entries
        .iter()
        .filter(|entry| entry.is_restorable_on(device_class, store))
        .cloned()
        .collect()
}

/// Delete a backup slot locally and remotely.
pub fn delete_backup(container: &dyn CloudContainer, entry: &BackupEntry) -> io::Result<()> {
    container.remove_directory(entry.directory())?;
    info!(directory = %entry.directory().display(), "Deleted backup");
    Ok(())
}
