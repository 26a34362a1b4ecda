// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: render  -  terminal output
// ─────────────────────────────────────────────────────────────────────────────

use std::io::Write;

use colored::Colorize;

use esp32_flasher::detect::{DeviceCandidate, MatchKind, PortInfo};
use esp32_flasher::firmware::cache::{CachedDownload, FirmwareCache};
use esp32_flasher::firmware::{format_size, FirmwareInfo, FirmwareSet};
use esp32_flasher::{FirmwareDescriptor, FlashError, FlashReport, Phase, ProgressUpdate};

const BAR_WIDTH: usize = 30;
const TAIL_LINES: usize = 12;

pub fn rule(width: usize) {
    println!("{}", "─".repeat(width).dimmed());
}

pub fn header(verb: &str, tags: &[String]) {
    let tags: Vec<String> = tags.iter().map(|t| format!("[{t}]").dimmed().to_string()).collect();
    println!("{} {}", verb.cyan().bold(), tags.join(" "));
    rule(60);
}

// ── progress ─────────────────────────────────────────────────────────────────

/// Redraw the single progress line in place.
pub fn progress(u: &ProgressUpdate) {
    let filled = usize::from(u.percent) * BAR_WIDTH / 100;
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled));
    let label = match u.phase {
        Phase::Download => "download",
        Phase::Flash => "flash",
    };
    let mut msg = u.message.clone();
    if msg.chars().count() > 40 {
        msg = msg.chars().take(39).collect::<String>() + "…";
    }
    print!("\r  {:<8} {} {:>3}%  {:<40}", label.dimmed(), bar.cyan(), u.percent, msg);
    let _ = std::io::stdout().flush();
}

pub fn progress_end() {
    println!();
}

// ── tables ───────────────────────────────────────────────────────────────────

pub fn candidates(list: &[DeviceCandidate]) {
    if list.is_empty() {
        println!("{} No ESP32 device found", "!".yellow());
        return;
    }
    println!("{:<22} {:<10} {:<10} {:<9}  {}", "PORT", "FAMILY", "VID:PID", "REACHABLE", "DESCRIPTION");
    rule(78);
    for c in list {
        let ids = if c.vid == 0 && c.pid == 0 { "-".to_owned() } else { format!("{:04X}:{:04X}", c.vid, c.pid) };
        let reach = if c.reachable { "yes".green() } else { "busy".yellow() };
        let how = match c.matched_by {
            MatchKind::UsbId => "",
            MatchKind::Keyword => " (by name)",
        };
        println!(
            "{:<22} {:<10} {:<10} {:<9}  {}{}",
            c.port.bold(), c.chip_family, ids, reach, c.description, how.dimmed()
        );
    }
}

pub fn ports(list: &[PortInfo]) {
    if list.is_empty() {
        println!("{} No serial ports found", "!".yellow());
        return;
    }
    println!("{:<22} {:<10}  {}", "PORT", "VID:PID", "DESCRIPTION");
    rule(70);
    for p in list {
        let ids = match (p.vid, p.pid) {
            (Some(v), Some(d)) => format!("{v:04X}:{d:04X}"),
            _ => "-".into(),
        };
        println!("{:<22} {:<10}  {}", p.port, ids, p.description.as_deref().unwrap_or("-"));
    }
}

pub fn firmware_list(list: &[FirmwareDescriptor], cache: &FirmwareCache) {
    if list.is_empty() {
        println!("{} No firmware published", "!".yellow());
        return;
    }
    println!("{:<14} {:<11} {:>9}  {:<12} {}", "VERSION", "RELEASED", "SIZE", "STATUS", "DESCRIPTION");
    rule(78);
    for d in list {
        let released = d.released_at.map(|t| t.format("%Y-%m-%d").to_string()).unwrap_or_else(|| "-".into());
        let size = d.size.map(format_size).unwrap_or_else(|| "-".into());
        let mut status = Vec::new();
        if d.recommended {
            status.push("★ stable".green().to_string());
        }
        if cache.is_downloaded(&d.version) {
            status.push("cached".cyan().to_string());
        }
        println!(
            "{:<14} {:<11} {:>9}  {:<12} {}",
            d.version.bold(), released, size, status.join(" "), d.description.dimmed()
        );
    }
}

pub fn cache_list(list: &[CachedDownload]) {
    if list.is_empty() {
        println!("{} Cache is empty", "!".yellow());
        return;
    }
    let mark = |b: bool| if b { "✓".green() } else { "·".dimmed() };
    println!("{:<16} {:^4} {:^4} {:^4} {:>10}", "VERSION", "APP", "BOOT", "PART", "SIZE");
    rule(46);
    for c in list {
        println!(
            "{:<16} {:^4} {:^4} {:^4} {:>10}",
            c.version, mark(c.firmware), mark(c.bootloader), mark(c.partitions), format_size(c.bytes)
        );
    }
}

// ── single items ─────────────────────────────────────────────────────────────

pub fn firmware_set(set: &FirmwareSet) {
    println!("  {} {}", "version:".dimmed(), set.version().bold());
    if !set.description().is_empty() {
        println!("  {} {}", "source: ".dimmed(), set.description());
    }
    for img in set.images() {
        println!("  {} 0x{:05x}  {}", "image:  ".dimmed(), img.offset, img.path.display());
    }
    println!("  {} {}", "size:   ".dimmed(), format_size(set.total_size()));
    if let Some(cs) = set.checksum() {
        println!("  {} {}", "sha256: ".dimmed(), cs);
    }
    if !set.is_complete() {
        println!(
            "  {} application only; bootloader and partition table stay as they are",
            "!".yellow()
        );
    }
}

pub fn firmware_info(info: &FirmwareInfo) {
    println!("{} {}", "✓".green().bold(), info.path.display().to_string().bold());
    println!("  {} {} ({} bytes)", "size:      ".dimmed(), format_size(info.size), info.size);
    println!("  {} {}", "sha256:    ".dimmed(), info.sha256);
    println!("  {} {}", "version:   ".dimmed(), info.version.as_deref().unwrap_or("-"));
    println!("  {} {}", "chip:      ".dimmed(), info.chip.unwrap_or("-"));
    if let Some(m) = info.modified {
        println!("  {} {}", "modified:  ".dimmed(), m.format("%Y-%m-%d %H:%M"));
    }
    let show = |p: &Option<std::path::PathBuf>| p.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into());
    println!("  {} {}", "bootloader:".dimmed(), show(&info.bootloader));
    println!("  {} {}", "partitions:".dimmed(), show(&info.partitions));
    if !info.is_complete_bundle() {
        println!("  {} incomplete bundle: only the application image can be written", "!".yellow());
    }
}

pub fn flash_report(r: &FlashReport) {
    println!(
        "{} firmware {} written to {} in {:.1}s",
        "✓".green().bold(),
        r.version.bold(),
        r.port.bold(),
        r.duration.as_secs_f64()
    );
    println!("  {} {}", "chip:    ".dimmed(), r.chip.unwrap_or("unknown"));
    println!("  {} {}{}", "images:  ".dimmed(), r.images, if r.complete { "" } else { " (application only)" });
    let verified = match r.verified {
        Some(true) => "ok".green(),
        Some(false) => "not confirmed (advisory)".yellow(),
        None => "skipped".dimmed(),
    };
    println!("  {} {}", "verify:  ".dimmed(), verified);
}

// ── errors ───────────────────────────────────────────────────────────────────

pub fn flash_error(e: &FlashError) {
    let title = match e {
        FlashError::EraseFailed { .. } => "EraseError",
        FlashError::WriteFailed { .. } => "WriteError",
        FlashError::ToolFailed { .. } => "ToolError",
        FlashError::Download { .. }
        | FlashError::Metadata { .. }
        | FlashError::SizeMismatch { .. }
        | FlashError::ChecksumMismatch { .. } => "NetworkError",
        _ => "Error",
    };
    eprintln!("\n{} {}", title.red().bold(), e);

    if e.tool_output().is_none() {
        return;
    }

    eprintln!("{}", "─".repeat(60).dimmed());
    for line in e.output_tail(TAIL_LINES) {
        if line.to_lowercase().contains("error") {
            eprintln!("  {}", line.red());
        } else {
            eprintln!("  {}", line.dimmed());
        }
    }
    eprintln!();
    eprintln!("  {}", "Hints:".bold());
    eprintln!("  • Hold BOOT while pressing RESET to enter the bootloader");
    eprintln!("  • Try a lower baud rate: --baud 115200");
    eprintln!("  • Try a different USB cable / port, or pass --port explicitly");
    eprintln!("  • Re-run with --verbose for the full esptool output");
    eprintln!("{}", "─".repeat(60).dimmed());
}
