// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: firmware  -  firmware sets and where they come from
//
//  A firmware set is what gets written in one flash attempt: the application
//  image plus, optionally, the bootloader and the partition table. Sets come
//  from three places:
//
//    local folder     firmware.bin [+ bootloader.bin + partitions.bin]
//    cached download  <cache root>/<version>/ with the same layout
//    remote catalogue descriptor -> download into the cache, then as above
// ─────────────────────────────────────────────────────────────────────────────

pub mod cache;
pub mod download;
pub mod resolve;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;

use crate::error::{FlashError, Result};

pub const APP_FILE:        &str = "firmware.bin";
pub const BOOTLOADER_FILE: &str = "bootloader.bin";
pub const PARTITIONS_FILE: &str = "partitions.bin";

pub const BOOTLOADER_OFFSET: u32 = 0x0000;
pub const PARTITIONS_OFFSET: u32 = 0x8000;
pub const APP_OFFSET:        u32 = 0x10000;

/// Sanity bounds for a single firmware file.
pub const MIN_FIRMWARE_SIZE: u64 = 1024;
pub const MAX_FIRMWARE_SIZE: u64 = 16 * 1024 * 1024;

const SUPPORTED_EXTENSIONS: &[&str] = &["bin", "elf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    Bootloader,
    PartitionTable,
    Application,
}

impl ImageRole {
    pub const ALL: [ImageRole; 3] = [ImageRole::Bootloader, ImageRole::PartitionTable, ImageRole::Application];

    pub fn file_name(self) -> &'static str {
        match self {
            ImageRole::Bootloader     => BOOTLOADER_FILE,
            ImageRole::PartitionTable => PARTITIONS_FILE,
            ImageRole::Application    => APP_FILE,
        }
    }

    pub fn offset(self) -> u32 {
        match self {
            ImageRole::Bootloader     => BOOTLOADER_OFFSET,
            ImageRole::PartitionTable => PARTITIONS_OFFSET,
            ImageRole::Application    => APP_OFFSET,
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageRole::Bootloader     => "bootloader",
            ImageRole::PartitionTable => "partition table",
            ImageRole::Application    => "application",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub role:   ImageRole,
    pub offset: u32,
    pub path:   PathBuf,
}

impl FlashImage {
    pub fn new(role: ImageRole, path: PathBuf) -> Self {
        FlashImage { role, offset: role.offset(), path }
    }
}

/// One flashable firmware generation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSet {
    version:     String,
    description: String,
    images:      Vec<FlashImage>,
    total_size:  u64,
    checksum:    Option<String>,
    recommended: bool,
}

impl FirmwareSet {
    /// Build a set from its images. The application image is mandatory.
    pub fn new(
        version: impl Into<String>,
        description: impl Into<String>,
        mut images: Vec<FlashImage>,
    ) -> Result<Self> {
        if !images.iter().any(|i| i.role == ImageRole::Application) {
            return Err(FlashError::MissingRequiredFile {
                dir:  images.first().and_then(|i| i.path.parent()).map(Path::to_path_buf).unwrap_or_default(),
                file: APP_FILE,
            });
        }
        images.sort_by_key(|i| i.offset);
        let total_size = images
            .iter()
            .filter_map(|i| std::fs::metadata(&i.path).ok())
            .map(|m| m.len())
            .sum();

        Ok(FirmwareSet {
            version: version.into(),
            description: description.into(),
            images,
            total_size,
            checksum: None,
            recommended: false,
        })
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_declared_size(mut self, size: Option<u64>) -> Self {
        if let Some(s) = size {
            self.total_size = s;
        }
        self
    }

    pub fn recommended(mut self, flag: bool) -> Self {
        self.recommended = flag;
        self
    }

    /// Scan a local folder for the conventional file names.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let app = dir.join(APP_FILE);
        if !app.is_file() {
            return Err(FlashError::MissingRequiredFile { dir: dir.to_path_buf(), file: APP_FILE });
        }

        let images: Vec<FlashImage> = ImageRole::ALL
            .iter()
            .map(|&role| FlashImage::new(role, dir.join(role.file_name())))
            .filter(|img| img.path.is_file())
            .collect();

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "local".into());
        let version = version_from_name(&name).unwrap_or_else(|| "local".into());

        FirmwareSet::new(version, dir.display().to_string(), images)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Images in ascending offset order.
    pub fn images(&self) -> &[FlashImage] {
        &self.images
    }

    pub fn image(&self, role: ImageRole) -> Option<&FlashImage> {
        self.images.iter().find(|i| i.role == role)
    }

    pub fn application(&self) -> &FlashImage {
        // Presence is checked in `new`.
        self.image(ImageRole::Application)
            .unwrap_or_else(|| unreachable!("firmware set without application image"))
    }

    /// Bootloader and partition table both present.
    pub fn is_complete(&self) -> bool {
        self.image(ImageRole::Bootloader).is_some() && self.image(ImageRole::PartitionTable).is_some()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn is_recommended(&self) -> bool {
        self.recommended
    }

    /// Check that the application image exists and is non-empty, and that
    /// every optional image is still on disk.
    pub fn check_files(&self) -> Result<()> {
        for img in &self.images {
            let ok = std::fs::metadata(&img.path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false);
            if !ok {
                return Err(FlashError::FirmwareFileNotFound(img.path.clone()));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  File inspection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FirmwareInfo {
    pub path:       PathBuf,
    pub size:       u64,
    pub sha256:     String,
    pub version:    Option<String>,
    pub chip:       Option<&'static str>,
    pub modified:   Option<DateTime<Local>>,
    pub bootloader: Option<PathBuf>,
    pub partitions: Option<PathBuf>,
}

impl FirmwareInfo {
    pub fn is_complete_bundle(&self) -> bool {
        self.bootloader.is_some() && self.partitions.is_some()
    }
}

/// Validate a single firmware file and gather what can be learned from it.
pub fn inspect(path: &Path) -> Result<FirmwareInfo> {
    let invalid = |reason: String| FlashError::InvalidFirmware { path: path.to_path_buf(), reason };

    let meta = std::fs::metadata(path).map_err(|_| FlashError::FirmwareFileNotFound(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(FlashError::FirmwareFileNotFound(path.to_path_buf()));
    }

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(invalid(format!("unsupported extension '.{ext}' (expected .bin or .elf)")));
    }

    let size = meta.len();
    if !(MIN_FIRMWARE_SIZE..=MAX_FIRMWARE_SIZE).contains(&size) {
        return Err(invalid(format!(
            "size {} outside {}..{}",
            format_size(size), format_size(MIN_FIRMWARE_SIZE), format_size(MAX_FIRMWARE_SIZE)
        )));
    }

    let sha256 = cache::hash_file(path)?;
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let dir = path.parent().unwrap_or(Path::new("."));
    let companion = |file: &str| Some(dir.join(file)).filter(|p| p.is_file());

    Ok(FirmwareInfo {
        path:       path.to_path_buf(),
        size,
        sha256,
        version:    version_from_name(&name),
        chip:       chip_from_name(&name),
        modified:   meta.modified().ok().map(DateTime::<Local>::from),
        bootloader: companion(BOOTLOADER_FILE),
        partitions: companion(PARTITIONS_FILE),
    })
}

fn version_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [r"(?i)v?(\d+\.\d+\.\d+)", r"(?i)v?(\d+\.\d+)", r"(?i)_v(\d+)"]
            .iter()
            .map(|p| Regex::new(p).expect("static regex"))
            .collect()
    })
}

/// Pull a version label out of a file or folder name (`v1.2.3`, `1.2`, `_v3`).
pub fn version_from_name(name: &str) -> Option<String> {
    version_patterns()
        .iter()
        .find_map(|re| re.captures(name))
        .map(|c| c[1].to_owned())
}

/// Guess the chip family from a file name.
pub fn chip_from_name(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    let table: &[(&[&str], &str)] = &[
        (&["esp32-s3", "esp32s3"], "ESP32-S3"),
        (&["esp32-s2", "esp32s2"], "ESP32-S2"),
        (&["esp32-c3", "esp32c3"], "ESP32-C3"),
        (&["esp32-c6", "esp32c6"], "ESP32-C6"),
        (&["esp32"],               "ESP32"),
    ];
    table
        .iter()
        .find(|(keys, _)| keys.iter().any(|k| lower.contains(k)))
        .map(|(_, chip)| *chip)
}

/// Human-readable size: `512 B`, `1.5 KB`, `2.0 MB`.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
