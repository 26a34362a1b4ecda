// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: esptool :: command  -  executable lookup and arguments
// ─────────────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::firmware::FlashImage;

/// Names esptool is installed under by pip and by distro packages.
const CANDIDATES: &[&str] = &["esptool.py", "esptool"];

/// Serial and flash parameters passed to every esptool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashParams {
    pub baud:        u32,
    pub before:      String,
    pub after:       String,
    pub flash_mode:  String,
    pub flash_freq:  String,
    pub flash_size:  String,
    /// Run `verify_flash` after a successful write (advisory only).
    pub verify:      bool,
}

impl Default for FlashParams {
    fn default() -> Self {
        FlashParams {
            baud:       460_800,
            before:     "default_reset".into(),
            after:      "hard_reset".into(),
            flash_mode: "dio".into(),
            flash_freq: "80m".into(),
            flash_size: "detect".into(),
            verify:     true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Verb<'a> {
    ChipId,
    EraseFlash,
    WriteFlash(&'a [FlashImage]),
    VerifyFlash(&'a [FlashImage]),
}

impl Verb<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::ChipId         => "chip_id",
            Verb::EraseFlash     => "erase_flash",
            Verb::WriteFlash(_)  => "write_flash",
            Verb::VerifyFlash(_) => "verify_flash",
        }
    }
}

/// Build the full argument list for one esptool call.
pub fn build_args(params: &FlashParams, port: &str, verb: Verb<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--port".into(), port.into(),
        "--baud".into(), params.baud.to_string(),
        "--before".into(), params.before.clone(),
        "--after".into(), params.after.clone(),
        verb.name().into(),
    ];

    match verb {
        Verb::ChipId | Verb::EraseFlash => {}
        Verb::WriteFlash(images) => {
            args.extend([
                "--flash_mode".into(), params.flash_mode.clone(),
                "--flash_freq".into(), params.flash_freq.clone(),
                "--flash_size".into(), params.flash_size.clone(),
            ]);
            push_images(&mut args, images);
        }
        Verb::VerifyFlash(images) => push_images(&mut args, images),
    }

    args
}

fn push_images(args: &mut Vec<String>, images: &[FlashImage]) {
    for img in images {
        args.push(format!("0x{:x}", img.offset));
        args.push(img.path.to_string_lossy().into_owned());
    }
}

/// Locate the esptool executable: an explicit override must exist on disk,
/// otherwise the first candidate name found on PATH wins.
pub fn locate(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = override_path {
        return if p.is_file() {
            Ok(p.to_path_buf())
        } else {
            Err(FlashError::ExecutableNotFound(p.display().to_string()))
        };
    }

    CANDIDATES
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| FlashError::ExecutableNotFound(format!("none of {} on PATH", CANDIDATES.join(", "))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::ImageRole;
    use pretty_assertions::assert_eq;

    fn images() -> Vec<FlashImage> {
        vec![
            FlashImage { role: ImageRole::Bootloader, offset: 0x0, path: "/fw/bootloader.bin".into() },
            FlashImage { role: ImageRole::PartitionTable, offset: 0x8000, path: "/fw/partitions.bin".into() },
            FlashImage { role: ImageRole::Application, offset: 0x10000, path: "/fw/firmware.bin".into() },
        ]
    }

    #[test]
    fn write_flash_lists_every_offset_pair() {
        let args = build_args(&FlashParams::default(), "/dev/ttyUSB0", Verb::WriteFlash(&images()));
        assert_eq!(
            args.join(" "),
            "--port /dev/ttyUSB0 --baud 460800 --before default_reset --after hard_reset \
             write_flash --flash_mode dio --flash_freq 80m --flash_size detect \
             0x0 /fw/bootloader.bin 0x8000 /fw/partitions.bin 0x10000 /fw/firmware.bin"
        );
    }

    #[test]
    fn erase_and_chip_id_take_no_images() {
        let params = FlashParams { baud: 115_200, ..FlashParams::default() };
        let erase = build_args(&params, "COM3", Verb::EraseFlash);
        assert_eq!(erase.last().map(String::as_str), Some("erase_flash"));
        assert!(erase.contains(&"115200".to_string()));
        let chip = build_args(&params, "COM3", Verb::ChipId);
        assert_eq!(chip.last().map(String::as_str), Some("chip_id"));
    }

    #[test]
    fn verify_flash_omits_flash_geometry() {
        let args = build_args(&FlashParams::default(), "COM3", Verb::VerifyFlash(&images()[2..]));
        assert!(!args.iter().any(|a| a == "--flash_mode"));
        assert_eq!(&args[args.len() - 2..], &["0x10000".to_string(), "/fw/firmware.bin".to_string()]);
    }

    #[test]
    fn missing_override_is_executable_not_found() {
        let err = locate(Some(Path::new("/definitely/not/here/esptool.py"))).unwrap_err();
        assert!(matches!(err, FlashError::ExecutableNotFound(_)));
    }
}
