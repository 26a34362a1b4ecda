// End-to-end runs of the flasher against a scripted stand-in for esptool.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use esp32_flasher::{
    CancelToken, FirmwareSet, FlashError, FlashParams, FlashReport, FlashState, Flasher, Outcome, Phase,
    ProgressHub,
};

const CHIP_OK: &str = r#"echo "Connecting...."
echo "Detecting chip type... ESP32-S3"
echo "Chip is ESP32-S3 (QFN56) (revision v0.2)"
echo "Hard resetting via RTS pin...""#;

const ERASE_OK: &str = r#"echo "Erasing flash (this may take a while)..."
echo "Chip erase completed successfully in 3.2s"
echo "Hard resetting via RTS pin...""#;

const WRITE_OK: &str = r#"echo "Compressed 4096 bytes to 2048..."
echo "Writing at 0x00010000... (0 %)"
echo "Writing at 0x00010400... (15 %)"
echo "Writing at 0x00010800... (40 %)" >&2
echo "Writing at 0x00010c00... (77 %)"
echo "Writing at 0x00011000... (100 %)"
echo "Wrote 4096 bytes (2048 compressed) at 0x00010000 in 0.1 seconds"
echo "Hash of data verified."
echo ""
echo "Leaving...""#;

const VERIFY_OK: &str = r#"echo "Verifying 0x1000 (4096) bytes @ 0x00010000 in flash against firmware.bin..."
echo "-- verify OK (digest matched)""#;

struct Script {
    chip:   &'static str,
    erase:  &'static str,
    write:  &'static str,
    verify: &'static str,
}

impl Default for Script {
    fn default() -> Self {
        Script { chip: CHIP_OK, erase: ERASE_OK, write: WRITE_OK, verify: VERIFY_OK }
    }
}

struct Rig {
    tmp:     TempDir,
    esptool: PathBuf,
    log:     PathBuf,
}

impl Rig {
    fn new(script: Script) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let esptool = tmp.path().join("esptool.py");
        let body = format!(
            r#"#!/bin/sh
VERB=""
for a in "$@"; do
  case "$a" in chip_id|erase_flash|write_flash|verify_flash) VERB="$a" ;; esac
done
echo "$*" >> "{log}"
case "$VERB" in
  chip_id)
{chip}
  ;;
  erase_flash)
{erase}
  ;;
  write_flash)
{write}
  ;;
  verify_flash)
{verify}
  ;;
esac
"#,
            log = log.display(),
            chip = script.chip,
            erase = script.erase,
            write = script.write,
            verify = script.verify,
        );
        fs::write(&esptool, body).unwrap();
        fs::set_permissions(&esptool, fs::Permissions::from_mode(0o755)).unwrap();
        Rig { tmp, esptool, log }
    }

    fn flasher(&self) -> Flasher {
        Flasher::new(FlashParams::default()).with_esptool(Some(self.esptool.clone()))
    }

    fn firmware(&self, complete: bool) -> FirmwareSet {
        let dir = self.tmp.path().join("fw");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("firmware.bin"), vec![0xE9u8; 4096]).unwrap();
        if complete {
            fs::write(dir.join("bootloader.bin"), vec![0xE9u8; 2048]).unwrap();
            fs::write(dir.join("partitions.bin"), vec![0xAAu8; 3072]).unwrap();
        }
        FirmwareSet::from_dir(&dir).unwrap()
    }

    /// One line per esptool invocation.
    fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn verbs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| {
                c.split_whitespace()
                    .find(|w| matches!(*w, "chip_id" | "erase_flash" | "write_flash" | "verify_flash"))
                    .map(str::to_owned)
            })
            .collect()
    }
}

fn percents(rx: &std::sync::mpsc::Receiver<esp32_flasher::ProgressUpdate>) -> Vec<u8> {
    rx.try_iter().map(|u| u.percent).collect()
}

#[test]
fn complete_set_runs_every_step_in_order() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let report = flasher
        .flash(&set, "/dev/ttyUSB0", &mut rep, &CancelToken::new())
        .unwrap()
        .done()
        .unwrap();

    assert_eq!(report.chip, Some("ESP32-S3"));
    assert_eq!(report.verified, Some(true));
    assert_eq!(report.images, 3);
    assert!(report.complete);
    assert_eq!(flasher.state(), FlashState::Succeeded);
    assert_eq!(rig.verbs(), vec!["chip_id", "erase_flash", "write_flash", "verify_flash"]);

    let write = rig.calls().into_iter().find(|c| c.contains("write_flash")).unwrap();
    assert!(write.contains("--port /dev/ttyUSB0 --baud 460800"));
    assert!(write.contains("0x0 ") && write.contains("0x8000 ") && write.contains("0x10000 "));
}

#[test]
fn progress_is_monotonic_and_scaled() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(true);
    let hub = ProgressHub::new();
    let rx = hub.channel();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    rig.flasher().flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap();
    drop(rep);

    let pcts = percents(&rx);
    assert!(pcts.windows(2).all(|w| w[0] <= w[1]), "{pcts:?}");
    assert!(pcts.iter().all(|&p| p <= 100));
    assert_eq!(pcts.last().copied(), Some(100));
    // 15 % inside the write step is 30 % overall.
    assert!(pcts.contains(&30), "{pcts:?}");
    assert!(pcts.contains(&10) && pcts.contains(&20) && pcts.contains(&90));
}

#[test]
fn application_only_set_writes_one_image() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(false);
    assert!(!set.is_complete());

    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();
    let report = rig.flasher().flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap().done().unwrap();

    assert!(!report.complete);
    let write = rig.calls().into_iter().find(|c| c.contains("write_flash")).unwrap();
    assert!(write.contains("0x10000 "));
    assert!(!write.contains("0x8000"));
}

#[test]
fn erase_error_fails_before_writing() {
    let rig = Rig::new(Script {
        erase: r#"echo "A fatal error occurred: Failed to connect to ESP32: No serial data received."
exit 2"#,
        ..Script::default()
    });
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let err = flasher.flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap_err();

    match &err {
        FlashError::EraseFailed { summary, .. } => assert!(summary.contains("exit code 2"), "{summary}"),
        other => panic!("expected EraseFailed, got {other:?}"),
    }
    assert_eq!(err.output_tail(1), vec!["A fatal error occurred: Failed to connect to ESP32: No serial data received."]);
    assert_eq!(flasher.state(), FlashState::Failed);
    assert!(!rig.verbs().contains(&"write_flash".to_string()));
}

#[test]
fn erase_without_success_phrase_fails_despite_exit_zero() {
    let rig = Rig::new(Script { erase: r#"echo "Erasing flash (this may take a while)...""#, ..Script::default() });
    let set = rig.firmware(true);
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let err = rig.flasher().flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, FlashError::EraseFailed { .. }));
}

#[test]
fn write_error_is_write_failed() {
    let rig = Rig::new(Script {
        write: r#"echo "Writing at 0x00010000... (5 %)"
echo "A fatal error occurred: Packet content transfer stopped" >&2
exit 2"#,
        ..Script::default()
    });
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let err = flasher.flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, FlashError::WriteFailed { .. }));
    assert!(err.tool_output().unwrap().contains("Packet content transfer stopped"));
    assert_eq!(flasher.state(), FlashState::Failed);
    assert!(!rig.verbs().contains(&"verify_flash".to_string()));
}

#[test]
fn verify_failure_still_succeeds() {
    let rig = Rig::new(Script {
        verify: r#"echo "verify FAILED (digest mismatch)"
exit 2"#,
        ..Script::default()
    });
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let report = flasher.flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap().done().unwrap();
    assert_eq!(report.verified, Some(false));
    assert_eq!(flasher.state(), FlashState::Succeeded);
}

#[test]
fn verification_can_be_skipped() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(true);
    let flasher = Flasher::new(FlashParams { verify: false, ..FlashParams::default() })
        .with_esptool(Some(rig.esptool.clone()));
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let report = flasher.flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap().done().unwrap();
    assert_eq!(report.verified, None);
    assert!(!rig.verbs().contains(&"verify_flash".to_string()));
}

#[test]
fn unrecognised_chip_does_not_block_flashing() {
    let rig = Rig::new(Script {
        chip: r#"echo "Detecting chip type... Unsupported detection protocol""#,
        ..Script::default()
    });
    let set = rig.firmware(true);
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let report = rig.flasher().flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap().done().unwrap();
    assert_eq!(report.chip, None);
}

/// Keeps the tool running until it is killed.
const HANG: &str = r#"echo "Connecting...."
exec sleep 30"#;

/// Flash a complete set and cancel once the flasher reaches `target`.
/// Returns the outcome, the states seen along the way and the elapsed time.
fn cancel_in(rig: &Rig, target: FlashState) -> (Outcome<FlashReport>, Vec<FlashState>, Duration) {
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let hub = ProgressHub::new();
    let cancel = CancelToken::new();
    let finished = AtomicBool::new(false);
    let started = Instant::now();

    let (result, seen) = thread::scope(|s| {
        let watcher = s.spawn(|| {
            let mut seen = vec![flasher.state()];
            while !finished.load(Ordering::SeqCst) {
                let now = flasher.state();
                if seen.last() != Some(&now) {
                    seen.push(now);
                }
                if now == target && !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(100));
                    cancel.cancel();
                }
                thread::sleep(Duration::from_millis(5));
            }
            let last = flasher.state();
            if seen.last() != Some(&last) {
                seen.push(last);
            }
            seen
        });
        let mut rep = hub.reporter(Phase::Flash).unwrap();
        let result = flasher.flash(&set, "COM3", &mut rep, &cancel);
        finished.store(true, Ordering::SeqCst);
        (result, watcher.join().unwrap())
    });

    (result.unwrap(), seen, started.elapsed())
}

fn assert_cancelled(outcome: &Outcome<FlashReport>, seen: &[FlashState], elapsed: Duration) {
    assert!(outcome.is_cancelled());
    assert_eq!(seen.last(), Some(&FlashState::Cancelled), "{seen:?}");
    assert!(!seen.iter().any(|s| matches!(s, FlashState::Succeeded | FlashState::Failed)), "{seen:?}");
    assert!(elapsed < Duration::from_secs(15));
}

#[test]
fn cancel_during_chip_detection() {
    let rig = Rig::new(Script { chip: HANG, ..Script::default() });
    let (outcome, seen, elapsed) = cancel_in(&rig, FlashState::DetectingChip);

    assert_cancelled(&outcome, &seen, elapsed);
    assert_eq!(rig.verbs(), vec!["chip_id"]);
}

#[test]
fn cancel_during_erase() {
    let rig = Rig::new(Script { erase: HANG, ..Script::default() });
    let (outcome, seen, elapsed) = cancel_in(&rig, FlashState::Erasing);

    assert_cancelled(&outcome, &seen, elapsed);
    assert_eq!(rig.verbs(), vec!["chip_id", "erase_flash"]);
}

#[test]
fn cancel_during_write_kills_the_tool() {
    let rig = Rig::new(Script {
        write: r#"echo "Writing at 0x00010000... (5 %)"
exec sleep 30"#,
        ..Script::default()
    });
    let (outcome, seen, elapsed) = cancel_in(&rig, FlashState::Writing);

    assert_cancelled(&outcome, &seen, elapsed);
    assert!(!rig.verbs().contains(&"verify_flash".to_string()));
}

#[test]
fn cancel_during_verification() {
    let rig = Rig::new(Script { verify: HANG, ..Script::default() });
    let (outcome, seen, elapsed) = cancel_in(&rig, FlashState::Verifying);

    assert_cancelled(&outcome, &seen, elapsed);
    assert_eq!(rig.verbs(), vec!["chip_id", "erase_flash", "write_flash", "verify_flash"]);
}

#[test]
fn cancel_before_start_runs_nothing() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let out = flasher.flash(&set, "COM3", &mut rep, &cancel).unwrap();
    assert!(out.is_cancelled());
    assert_eq!(flasher.state(), FlashState::Cancelled);
    assert!(rig.calls().is_empty());
}

#[test]
fn second_flash_while_one_is_running_is_busy() {
    let rig = Rig::new(Script {
        write: r#"echo "Writing at 0x00010000... (5 %)"
exec sleep 30"#,
        ..Script::default()
    });
    let set = rig.firmware(true);
    let flasher = rig.flasher();
    let cancel = CancelToken::new();

    thread::scope(|s| {
        let first = s.spawn(|| {
            let hub = ProgressHub::new();
            let mut rep = hub.reporter(Phase::Flash).unwrap();
            flasher.flash(&set, "COM3", &mut rep, &cancel)
        });

        while flasher.state() != FlashState::Writing {
            thread::sleep(Duration::from_millis(10));
        }
        let hub = ProgressHub::new();
        let mut rep = hub.reporter(Phase::Flash).unwrap();
        let second = flasher.flash(&set, "COM4", &mut rep, &CancelToken::new());
        assert!(matches!(second, Err(FlashError::Busy(_))));

        cancel.cancel();
        assert!(first.join().unwrap().unwrap().is_cancelled());
    });
}

#[test]
fn missing_esptool_fails_in_preparing() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(true);
    let flasher = Flasher::new(FlashParams::default()).with_esptool(Some(rig.tmp.path().join("nope.py")));
    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();

    let err = flasher.flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, FlashError::ExecutableNotFound(_)));
    assert_eq!(flasher.state(), FlashState::Failed);
}

#[test]
fn firmware_removed_after_resolution_fails_in_preparing() {
    let rig = Rig::new(Script::default());
    let set = rig.firmware(false);
    fs::write(rig.tmp.path().join("fw").join("firmware.bin"), b"").unwrap();

    let hub = ProgressHub::new();
    let mut rep = hub.reporter(Phase::Flash).unwrap();
    let err = rig.flasher().flash(&set, "COM3", &mut rep, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, FlashError::FirmwareFileNotFound(_)));
    assert!(rig.calls().is_empty());
}

#[test]
fn standalone_erase_and_chip_id() {
    let rig = Rig::new(Script::default());
    let flasher = rig.flasher();
    let cancel = CancelToken::new();

    assert_eq!(flasher.chip_id("COM3", &cancel).unwrap(), Outcome::Done(Some("ESP32-S3")));
    assert_eq!(flasher.erase("COM3", &cancel).unwrap(), Outcome::Done(()));
    assert_eq!(rig.verbs(), vec!["chip_id", "erase_flash"]);
}
