// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: error
// ─────────────────────────────────────────────────────────────────────────────

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlashError {
    // ── configuration ────────────────────────────────────────────────────────
    #[error("esptool not found: {0}\n  Hint: install with `pip install esptool` or set `esptool` in settings.toml")]
    ExecutableNotFound(String),

    #[error("Cloud credentials missing: {0}\n  Hint: set ESP32_FLASHER_API_KEY / ESP32_FLASHER_PROJECT or the [cloud] table in settings.toml")]
    MissingCredentials(String),

    #[error("Invalid settings file {path}: {reason}")]
    InvalidSettings { path: PathBuf, reason: String },

    // ── resources ────────────────────────────────────────────────────────────
    #[error("Required firmware file '{file}' not found in {dir}")]
    MissingRequiredFile { dir: PathBuf, file: &'static str },

    #[error("Firmware file not found or empty: {0}")]
    FirmwareFileNotFound(PathBuf),

    #[error("Invalid firmware file {path}: {reason}")]
    InvalidFirmware { path: PathBuf, reason: String },

    #[error("Firmware version '{0}' not found in the cloud catalogue")]
    UnknownVersion(String),

    #[error("Firmware version '{0}' has not been downloaded yet\n  Hint: run `esp32-flasher download {0}` first")]
    NotDownloaded(String),

    #[error("No ESP32 device detected on any serial port\n  Hint: check the USB cable and drivers (CP210x, CH340), or pass --port")]
    NoDeviceDetected,

    #[error("Several ESP32 devices detected ({0})\n  Hint: pick one with --port")]
    AmbiguousDevice(String),

    // ── network ──────────────────────────────────────────────────────────────
    #[error("Download failed ({url}): {reason}")]
    Download { url: String, reason: String },

    #[error("Metadata query failed ({collection}): {reason}")]
    Metadata { collection: String, reason: String },

    #[error("Size mismatch for {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch { path: PathBuf, expected: u64, actual: u64 },

    #[error("Checksum mismatch for {path}\n  expected: {expected}\n  actual:   {actual}")]
    ChecksumMismatch { path: PathBuf, expected: String, actual: String },

    // ── subprocess ───────────────────────────────────────────────────────────
    #[error("Flash erase failed on {port}: {summary}")]
    EraseFailed { port: String, summary: String, output: String },

    #[error("Firmware write failed on {port}: {summary}")]
    WriteFailed { port: String, summary: String, output: String },

    #[error("esptool {verb} failed on {port}: {summary}")]
    ToolFailed { verb: &'static str, port: String, summary: String, output: String },

    // ── concurrency ──────────────────────────────────────────────────────────
    #[error("Another {0} is already in progress")]
    Busy(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FlashError {
    /// Full captured esptool output, for subprocess failures.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            FlashError::EraseFailed { output, .. }
            | FlashError::WriteFailed { output, .. }
            | FlashError::ToolFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Last `n` non-empty lines of the captured output.
    pub fn output_tail(&self, n: usize) -> Vec<&str> {
        let Some(output) = self.tool_output() else { return Vec::new() };
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].to_vec()
    }
}

pub type Result<T> = std::result::Result<T, FlashError>;
