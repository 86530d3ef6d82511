//! File utilities: search-path resolution, digests, box archive
//! extraction and scratch directories.

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to unarchive file: file='{file}' error='{source}'")]
    Unpack {
        file: String,
        source: std::io::Error,
    },
}

/// Candidate locations for a file across the configured search paths.
///
/// Absolute names resolve to themselves.
pub fn get_path_names(file_name: &str, path_list: &[PathBuf]) -> Vec<PathBuf> {
    if Path::new(file_name).is_absolute() || path_list.is_empty() {
        return vec![PathBuf::from(file_name)];
    }

    path_list.iter().map(|path| path.join(file_name)).collect()
}

/// Hex-encoded sha256 digest of a file's contents.
pub fn sha256_sum(file_name: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(file_name)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract a gzip tar archive and map the destination's top-level entry
/// names to their paths.
pub fn unarchive_file(
    archive_name: &Path,
    dest_dir: &Path,
) -> Result<BTreeMap<String, PathBuf>, ArchiveError> {
    let unpack = || -> Result<(), std::io::Error> {
        let file = File::open(archive_name)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.unpack(dest_dir)
    };

    unpack().map_err(|source| ArchiveError::Unpack {
        file: archive_name.display().to_string(),
        source,
    })?;

    let mut entries = BTreeMap::new();
    let dir = fs::read_dir(dest_dir).map_err(|source| ArchiveError::Unpack {
        file: archive_name.display().to_string(),
        source,
    })?;
    for entry in dir.flatten() {
        entries.insert(entry.file_name().to_string_lossy().into_owned(), entry.path());
    }

    Ok(entries)
}

/// A scratch directory removed on drop, on every exit path.
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    /// Create a scratch directory, optionally under `root`.
    pub fn new(root: Option<&Path>) -> Result<Scratch, std::io::Error> {
        let dir = match root {
            Some(root) => TempDir::new_in(root)?,
            None => TempDir::new()?,
        };

        Ok(Scratch { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
