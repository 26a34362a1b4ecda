// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: esptool :: output  -  esptool text output recognition
//
//  esptool has no machine-readable output, so success and progress are read
//  from its human-readable log. Every phrase and pattern the invoker depends
//  on lives in this file; if a newer esptool changes its wording, only this
//  file needs to follow.
// ─────────────────────────────────────────────────────────────────────────────

use std::sync::OnceLock;

use regex::Regex;

/// Printed by `erase_flash` when the chip erase finished.
pub const ERASE_OK: &str = "Chip erase completed successfully";
/// Printed after each region written by `write_flash`.
pub const HASH_VERIFIED: &str = "Hash of data verified";
/// Printed by every command that exits normally.
pub const LEAVING: &str = "Leaving...";
/// Printed by `verify_flash` for every matching region.
pub const VERIFY_OK: &str = "-- verify OK";
/// Printed by `verify_flash` on a mismatch.
pub const VERIFY_FAILED: &str = "verify FAILED";
pub const CONNECTING: &str = "Connecting...";
pub const FATAL: &str = "A fatal error occurred";

/// Fixed points of the overall flash progress band.
pub const PCT_ERASED: u8 = 10;
pub const PCT_WRITE_START: u8 = 20;
pub const PCT_WRITE_DONE: u8 = 90;
pub const PCT_DONE: u8 = 100;

/// Known chip families, most specific first so "ESP32-S3" wins over "ESP32".
pub const CHIP_FAMILIES: &[&str] = &[
    "ESP32-S3", "ESP32-S2", "ESP32-C61", "ESP32-C6", "ESP32-C5", "ESP32-C3",
    "ESP32-C2", "ESP32-H2", "ESP32-P4", "ESP32", "ESP8266",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    Connecting,
    ChipDetected(&'static str),
    /// Raw percentage inside the write step, 0-100.
    WriteProgress { address: u32, percent: u8 },
    EraseCompleted,
    HashVerified,
    Leaving,
    VerifyOk,
    VerifyFailed,
    Fatal(String),
}

fn write_progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Writing at 0x([0-9a-fA-F]+)\.\.\. \((\d{1,3}) ?%\)")
            .expect("static regex")
    })
}

/// Recognise one line of esptool output.
pub fn parse_progress_line(line: &str) -> Option<ToolEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(caps) = write_progress_re().captures(line) {
        let address = u32::from_str_radix(&caps[1], 16).ok()?;
        let percent = caps[2].parse::<u8>().ok()?.min(100);
        return Some(ToolEvent::WriteProgress { address, percent });
    }

    if line.contains(ERASE_OK) {
        Some(ToolEvent::EraseCompleted)
    } else if line.contains(HASH_VERIFIED) {
        Some(ToolEvent::HashVerified)
    } else if line.contains(VERIFY_OK) {
        Some(ToolEvent::VerifyOk)
    } else if line.contains(VERIFY_FAILED) {
        Some(ToolEvent::VerifyFailed)
    } else if line.starts_with(LEAVING) {
        Some(ToolEvent::Leaving)
    } else if line.starts_with(CONNECTING) {
        Some(ToolEvent::Connecting)
    } else if line.starts_with(FATAL) {
        Some(ToolEvent::Fatal(line.to_owned()))
    } else if line.starts_with("Chip is") || line.starts_with("Chip type") {
        classify_chip(line).map(ToolEvent::ChipDetected)
    } else {
        None
    }
}

/// Map a raw write percentage onto the overall 20..90 band.
pub fn scale_write_percent(raw: u8) -> u8 {
    let raw = u32::from(raw.min(100));
    let band = u32::from(PCT_WRITE_DONE - PCT_WRITE_START);
    (u32::from(PCT_WRITE_START) + raw * band / 100) as u8
}

/// Find the first known chip family named anywhere in `text`.
pub fn classify_chip(text: &str) -> Option<&'static str> {
    let upper = text.to_uppercase();
    CHIP_FAMILIES.iter().copied().find(|family| upper.contains(family))
}

/// Whether the erase step reported success.
pub fn erase_succeeded(output: &str) -> bool {
    output.contains(ERASE_OK)
}

/// Whether the write step reported success.
pub fn write_succeeded(output: &str) -> bool {
    output.contains(HASH_VERIFIED) || output.lines().any(|l| l.trim().starts_with(LEAVING))
}

/// Whether `verify_flash` matched every region.
pub fn verify_succeeded(output: &str) -> bool {
    output.contains(VERIFY_OK) && !output.contains(VERIFY_FAILED)
}
