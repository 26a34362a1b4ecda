// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: firmware :: cache
//
//  Downloaded firmware lives under the cache root, one directory per version:
//
//    <cache root>/<version>/firmware.bin
//                          /bootloader.bin
//                          /partitions.bin
//
//  A version counts as downloaded when its firmware.bin is present.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{FlashError, Result};
use super::{FirmwareSet, FlashImage, ImageRole, APP_FILE};

/// Presence record for one cached version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDownload {
    pub version:    String,
    pub dir:        PathBuf,
    pub firmware:   bool,
    pub bootloader: bool,
    pub partitions: bool,
    pub bytes:      u64,
}

impl CachedDownload {
    pub fn is_downloaded(&self) -> bool {
        self.firmware
    }
}

#[derive(Debug, Clone)]
pub struct FirmwareCache {
    root: PathBuf,
}

impl FirmwareCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FirmwareCache { root: root.into() }
    }

    /// `<data dir>/esp32-flasher/firmware`
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("esp32-flasher")
            .join("firmware")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one version. The label is percent-encoded, so it is a
    /// single path component and distinct labels never share a directory.
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(dir_name(version))
    }

    pub fn is_downloaded(&self, version: &str) -> bool {
        self.version_dir(version).join(APP_FILE).is_file()
    }

    pub fn status(&self, version: &str) -> CachedDownload {
        let dir = self.version_dir(version);
        let has = |f: &str| dir.join(f).is_file();
        CachedDownload {
            version:    version.to_owned(),
            firmware:   has(APP_FILE),
            bootloader: has(ImageRole::Bootloader.file_name()),
            partitions: has(ImageRole::PartitionTable.file_name()),
            bytes:      dir_size(&dir),
            dir,
        }
    }

    /// Firmware set for an already downloaded version.
    pub fn cached_set(&self, version: &str, description: &str) -> Result<FirmwareSet> {
        let dir = self.version_dir(version);
        if !dir.join(APP_FILE).is_file() {
            return Err(FlashError::NotDownloaded(version.to_owned()));
        }
        let images = ImageRole::ALL
            .iter()
            .map(|&role| FlashImage::new(role, dir.join(role.file_name())))
            .filter(|img| img.path.is_file())
            .collect();
        FirmwareSet::new(version, description, images)
    }

    /// Every version directory under the root, sorted by name.
    pub fn list(&self) -> Result<Vec<CachedDownload>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out: Vec<CachedDownload> = fs::read_dir(&self.root)?
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| self.status(&version_label(&e.file_name().to_string_lossy())))
            .collect();
        out.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(out)
    }

    /// Delete one version directory. Used to roll back a failed download.
    pub fn remove_version(&self, version: &str) -> Result<()> {
        let dir = self.version_dir(version);
        if dir.exists() {
            debug!("cache: removing {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Delete and recreate the whole cache root.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            warn!("cache: clearing {}", self.root.display());
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Reversible file-name form of a version label.
fn dir_name(version: &str) -> String {
    if version.is_empty() {
        return "%".to_owned();
    }
    // "." and ".." are the only labels encoding leaves special.
    if version.chars().all(|c| c == '.') {
        return version.replace('.', "%2E");
    }
    urlencoding::encode(version).into_owned()
}

fn version_label(dir_name: &str) -> String {
    if dir_name == "%" {
        return String::new();
    }
    urlencoding::decode(dir_name).map(|v| v.into_owned()).unwrap_or_else(|_| dir_name.to_owned())
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// SHA-256 of the file content, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against a declared size and SHA-256. Either check is
/// skipped when the declaration is absent. Accepts an optional `SHA-256:`
/// or `sha256:` prefix on the checksum.
pub fn verify_file(path: &Path, size: Option<u64>, checksum: Option<&str>) -> Result<()> {
    let actual_size = fs::metadata(path)
        .map_err(|_| FlashError::FirmwareFileNotFound(path.to_path_buf()))?
        .len();

    if let Some(expected) = size {
        if expected != actual_size {
            return Err(FlashError::SizeMismatch { path: path.to_path_buf(), expected, actual: actual_size });
        }
    }

    if let Some(cs) = checksum {
        let expected = cs
            .trim()
            .trim_start_matches("SHA-256:")
            .trim_start_matches("sha256:")
            .trim()
            .to_lowercase();
        let actual = hash_file(path)?;
        if actual != expected {
            return Err(FlashError::ChecksumMismatch { path: path.to_path_buf(), expected, actual });
        }
    }

    Ok(())
}
