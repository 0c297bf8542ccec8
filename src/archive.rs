//! Pulls the frpc executable out of a release archive.
//!
//! The archive format is not trusted to match the file name (uploads have no
//! name at all), so every supported format is attempted in [`DETECTION_ORDER`]
//! and the most specific failure is reported once all of them are exhausted.

use crate::error::{AttemptFailure, ExtractError};
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Container formats frp releases ship in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Windows packages
    Zip,
    /// Every other platform
    TarGz,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveFormat::Zip => f.write_str("zip"),
            ArchiveFormat::TarGz => f.write_str("tar.gz"),
        }
    }
}

/// Order in which formats are tried
pub const DETECTION_ORDER: [ArchiveFormat; 2] = [ArchiveFormat::Zip, ArchiveFormat::TarGz];

/// Extract the first regular file whose base name is exactly `binary_name`
/// from `archive_path` into `install_path`, replacing any existing file and
/// marking it executable.
///
/// The entry is written to a temporary file beside `install_path` and renamed
/// into place, so on failure the install path is left untouched.
pub fn extract_binary(
    archive_path: &Path,
    binary_name: &str,
    install_path: &Path,
) -> Result<PathBuf, ExtractError> {
    let mut attempts = Vec::with_capacity(DETECTION_ORDER.len());

    for format in DETECTION_ORDER {
        let result = match format {
            ArchiveFormat::Zip => extract_from_zip(archive_path, binary_name, install_path),
            ArchiveFormat::TarGz => extract_from_tar_gz(archive_path, binary_name, install_path),
        };
        match result {
            Ok(()) => {
                info!(
                    binary = binary_name,
                    %format,
                    path = %install_path.display(),
                    "Extracted binary from archive"
                );
                return Ok(install_path.to_path_buf());
            }
            Err(failure) => {
                debug!(%format, error = %failure, "Archive format attempt failed");
                attempts.push(failure);
            }
        }
    }

    Err(most_specific(binary_name, attempts))
}

/// An I/O failure beats a missing entry, which beats an unreadable container
fn most_specific(binary_name: &str, attempts: Vec<AttemptFailure>) -> ExtractError {
    let mut binary_missing = false;
    let mut unopened = Vec::with_capacity(attempts.len());

    for attempt in attempts {
        match attempt {
            AttemptFailure::Io { source, .. } => return ExtractError::Io(source),
            AttemptFailure::NotFound { .. } => binary_missing = true,
            open @ AttemptFailure::Open { .. } => unopened.push(open),
        }
    }

    if binary_missing {
        ExtractError::BinaryNotFoundInArchive {
            binary: binary_name.to_string(),
        }
    } else {
        ExtractError::UnsupportedFormat { attempts: unopened }
    }
}

fn extract_from_zip(
    archive_path: &Path,
    binary_name: &str,
    install_path: &Path,
) -> Result<(), AttemptFailure> {
    let format = ArchiveFormat::Zip;
    let file = File::open(archive_path).map_err(|source| AttemptFailure::Io { format, source })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| AttemptFailure::Open {
        format,
        reason: e.to_string(),
    })?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| AttemptFailure::Open {
            format,
            reason: e.to_string(),
        })?;
        if !entry.is_file() || base_name(entry.name()) != binary_name {
            continue;
        }
        return install_entry(&mut entry, install_path)
            .map_err(|source| AttemptFailure::Io { format, source });
    }

    Err(AttemptFailure::NotFound {
        format,
        binary: binary_name.to_string(),
    })
}

fn extract_from_tar_gz(
    archive_path: &Path,
    binary_name: &str,
    install_path: &Path,
) -> Result<(), AttemptFailure> {
    let format = ArchiveFormat::TarGz;
    let open_failed = |reason: String| AttemptFailure::Open { format, reason };

    let file = File::open(archive_path).map_err(|source| AttemptFailure::Io { format, source })?;
    let mut reader = BufReader::new(file);

    // An empty or non-gzip blob would otherwise read as an empty tar stream
    let head = reader
        .fill_buf()
        .map_err(|source| AttemptFailure::Io { format, source })?;
    if !head.starts_with(&GZIP_MAGIC) {
        return Err(open_failed("missing gzip header".to_string()));
    }

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive.entries().map_err(|e| open_failed(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| open_failed(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = {
            let path = entry.path_bytes();
            base_name(&String::from_utf8_lossy(&path)) == binary_name
        };
        if !matches {
            continue;
        }
        return install_entry(&mut entry, install_path)
            .map_err(|source| AttemptFailure::Io { format, source });
    }

    Err(AttemptFailure::NotFound {
        format,
        binary: binary_name.to_string(),
    })
}

/// Final path component of an archive entry name.
/// Archives written on Windows may use backslashes.
fn base_name(entry_name: &str) -> &str {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(entry_name)
}

fn install_entry<R: Read>(reader: &mut R, install_path: &Path) -> io::Result<()> {
    let dir = match install_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    io::copy(reader, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    set_executable(staged.path())?;
    staged.persist(install_path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
