//! Packing a store snapshot directory into a single archive and back.
//!
//! Entries are stored relative to the snapshot directory with no wrapper
//! folder, so unpacking reproduces the directory's contents directly.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// File name of the archive inside each backup directory.
pub const ARCHIVE_FILE_NAME: &str = "data.zip";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("source directory not found: {0}")]
    MissingSource(PathBuf),

    #[error("archive entry escapes the destination: {0}")]
    UnsafeEntry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Deflate,
    Zstd,
    Stored,
}

impl Compression {
    fn method(&self) -> CompressionMethod {
        match self {
            Compression::Deflate => CompressionMethod::Deflated,
            Compression::Zstd => CompressionMethod::Zstd,
            Compression::Stored => CompressionMethod::Stored,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub compression: Compression,

    /// Method-specific level; `None` uses the method's default
    pub level: Option<i64>,
}

/// Pack every file below `source_dir` into `archive_path`, replacing any
/// existing archive there. Returns the archive size in bytes.
pub fn pack_directory(
    source_dir: &Path,
    archive_path: &Path,
    options: &ArchiveOptions,
) -> Result<u64, ArchiveError> {
    if !source_dir.is_dir() {
        return Err(ArchiveError::MissingSource(source_dir.to_path_buf()));
    }

    let partial = partial_path(archive_path);
    let result = write_archive(source_dir, &partial, options);
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    let entries = result?;

    fs::rename(&partial, archive_path)?;
    let size = fs::metadata(archive_path)?.len();
    debug!(archive = %archive_path.display(), entries, size, "Packed archive");
    Ok(size)
}

fn write_archive(source_dir: &Path, destination: &Path, options: &ArchiveOptions) -> Result<usize, ArchiveError> {
    let file_options = SimpleFileOptions::default()
        .compression_method(options.compression.method())
        .compression_level(options.level);

    let mut writer = ZipWriter::new(File::create(destination)?);
    let mut entries = 0;

    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(source_dir).unwrap_or(entry.path());
        writer.start_file(entry_name(relative), file_options)?;
        let mut input = File::open(entry.path())?;
        io::copy(&mut input, &mut writer)?;
        entries += 1;
    }

    let file = writer.finish()?;
    file.sync_all()?;
    Ok(entries)
}

/// Unpack `archive_path` into `destination_dir`, which is created if needed.
pub fn unpack_archive(archive_path: &Path, destination_dir: &Path) -> Result<usize, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    fs::create_dir_all(destination_dir)?;

    let mut files = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ArchiveError::UnsafeEntry(entry.name().to_string()));
        };
        let target = destination_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&target)?;
        io::copy(&mut entry, &mut output)?;
        files += 1;
    }

    debug!(archive = %archive_path.display(), files, "Unpacked archive");
    Ok(files)
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn partial_path(archive_path: &Path) -> PathBuf {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ARCHIVE_FILE_NAME.to_string());
    archive_path.with_file_name(format!("{}.partial", name))
}
