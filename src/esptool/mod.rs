// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: esptool  -  ESP32 programmer driven through esptool
//
//  One flash attempt walks a fixed state machine:
//
//    Idle -> Preparing -> DetectingChip -> Erasing -> Writing -> Verifying -> Succeeded
//
//  Cancelled is reachable from every non-terminal state, Failed from
//  Preparing, DetectingChip, Erasing and Writing. Verification is advisory:
//  its result is reported but never turns a written flash into a failure.
// ─────────────────────────────────────────────────────────────────────────────

pub mod command;
pub mod output;
pub mod runner;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cancel::{CancelToken, Outcome, Slot};
use crate::error::{FlashError, Result};
use crate::firmware::FirmwareSet;
use crate::progress::Reporter;

pub use command::{build_args, locate, FlashParams, Verb};
pub use output::{parse_progress_line, ToolEvent};
use runner::Captured;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Preparing,
    DetectingChip,
    Erasing,
    Writing,
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl FlashState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlashState::Succeeded | FlashState::Failed | FlashState::Cancelled)
    }

    pub fn can_transition(self, to: FlashState) -> bool {
        use FlashState::*;
        match (self, to) {
            (Idle, Preparing)
            | (Preparing, DetectingChip)
            | (DetectingChip, Erasing)
            | (Erasing, Writing)
            | (Writing, Verifying)
            | (Verifying, Succeeded) => true,
            (Preparing | DetectingChip | Erasing | Writing, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// What a successful flash did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub port:     String,
    pub version:  String,
    /// Family from the chip_id step; `None` when it could not be classified.
    pub chip:     Option<&'static str>,
    /// `None` when verification was skipped or could not run.
    pub verified: Option<bool>,
    pub images:   usize,
    pub complete: bool,
    pub duration: Duration,
}

pub struct Flasher {
    esptool: Option<PathBuf>,
    params:  FlashParams,
    busy:    Slot,
    state:   Mutex<FlashState>,
}

impl Flasher {
    pub fn new(params: FlashParams) -> Self {
        Flasher { esptool: None, params, busy: Slot::new(), state: Mutex::new(FlashState::Idle) }
    }

    /// Use this esptool instead of searching PATH.
    pub fn with_esptool(mut self, path: Option<PathBuf>) -> Self {
        self.esptool = path;
        self
    }

    pub fn params(&self) -> &FlashParams {
        &self.params
    }

    /// State of the current or most recent attempt.
    pub fn state(&self) -> FlashState {
        self.state.lock().map(|s| *s).unwrap_or(FlashState::Idle)
    }

    /// Write `set` to the device on `port`.
    pub fn flash(
        &self,
        set: &FirmwareSet,
        port: &str,
        progress: &mut Reporter<'_>,
        cancel: &CancelToken,
    ) -> Result<Outcome<FlashReport>> {
        let _guard = self.busy.try_claim().ok_or(FlashError::Busy("flash operation"))?;
        let started = Instant::now();
        self.reset_state();

        // ── Preparing ───────────────────────────────────────────────────────
        if !self.advance(cancel, FlashState::Preparing) {
            return Ok(Outcome::Cancelled);
        }
        progress.report(0, format!("Preparing {} for {port}", set.version()));
        if let Err(e) = set.check_files() {
            return Err(self.failed(e));
        }
        let exe = match locate(self.esptool.as_deref()) {
            Ok(p) => p,
            Err(e) => return Err(self.failed(e)),
        };
        if !set.is_complete() {
            warn!("flash: {} is application-only; bootloader and partition table are left as they are", set.version());
        }

        // ── DetectingChip ───────────────────────────────────────────────────
        if !self.advance(cancel, FlashState::DetectingChip) {
            return Ok(Outcome::Cancelled);
        }
        progress.status("Detecting chip");
        let chip = match runner::run(&exe, &self.args(port, Verb::ChipId), cancel, &mut |_| {}) {
            Ok(Outcome::Done(c)) => {
                let chip = detect_chip(&c.output);
                match chip {
                    Some(family) => info!("flash: chip is {family}"),
                    None => warn!("flash: could not classify chip ({})", c.summary()),
                }
                chip
            }
            Ok(Outcome::Cancelled) => return Ok(self.cancelled()),
            Err(e) => {
                warn!("flash: chip detection failed: {e}");
                None
            }
        };

        // ── Erasing ─────────────────────────────────────────────────────────
        if !self.advance(cancel, FlashState::Erasing) {
            return Ok(Outcome::Cancelled);
        }
        progress.status(match chip {
            Some(family) => format!("Erasing flash ({family})"),
            None => "Erasing flash".to_owned(),
        });
        let erased = match self.invoke(&exe, port, Verb::EraseFlash, cancel, &mut |_| {})? {
            Outcome::Done(c) => c,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        if !(erased.success && output::erase_succeeded(&erased.output)) {
            return Err(self.failed(FlashError::EraseFailed {
                port:    port.to_owned(),
                summary: missing_marker(&erased, output::ERASE_OK),
                output:  erased.output,
            }));
        }
        progress.report(output::PCT_ERASED, "Flash erased");

        // ── Writing ─────────────────────────────────────────────────────────
        if !self.advance(cancel, FlashState::Writing) {
            return Ok(Outcome::Cancelled);
        }
        progress.report(output::PCT_WRITE_START, format!("Writing {} image(s)", set.images().len()));
        let mut on_line = |line: &str| match parse_progress_line(line) {
            Some(ToolEvent::WriteProgress { address, percent }) => {
                progress.report(
                    output::scale_write_percent(percent),
                    format!("Writing at 0x{address:08x} ({percent}%)"),
                );
            }
            Some(other) => debug!("flash: {other:?}"),
            None => {}
        };
        let written = match self.invoke(&exe, port, Verb::WriteFlash(set.images()), cancel, &mut on_line)? {
            Outcome::Done(c) => c,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        if !(written.success && output::write_succeeded(&written.output)) {
            return Err(self.failed(FlashError::WriteFailed {
                port:    port.to_owned(),
                summary: missing_marker(&written, output::HASH_VERIFIED),
                output:  written.output,
            }));
        }
        progress.report(output::PCT_WRITE_DONE, "Write complete");

        // ── Verifying ───────────────────────────────────────────────────────
        if !self.advance(cancel, FlashState::Verifying) {
            return Ok(Outcome::Cancelled);
        }
        let verified = if self.params.verify {
            progress.status("Verifying");
            match runner::run(&exe, &self.args(port, Verb::VerifyFlash(set.images())), cancel, &mut |_| {}) {
                Ok(Outcome::Done(c)) => {
                    let ok = c.success && output::verify_succeeded(&c.output);
                    if !ok {
                        warn!("flash: verification did not confirm the write ({})", c.summary());
                    }
                    Some(ok)
                }
                Ok(Outcome::Cancelled) => return Ok(self.cancelled()),
                Err(e) => {
                    warn!("flash: verification could not run: {e}");
                    None
                }
            }
        } else {
            None
        };

        // ── Succeeded ───────────────────────────────────────────────────────
        if !self.advance(cancel, FlashState::Succeeded) {
            return Ok(Outcome::Cancelled);
        }
        progress.report(output::PCT_DONE, "Flash complete");

        Ok(Outcome::Done(FlashReport {
            port: port.to_owned(),
            version: set.version().to_owned(),
            chip,
            verified,
            images: set.images().len(),
            complete: set.is_complete(),
            duration: started.elapsed(),
        }))
    }

    /// Standalone full-chip erase.
    pub fn erase(&self, port: &str, cancel: &CancelToken) -> Result<Outcome<()>> {
        let _guard = self.busy.try_claim().ok_or(FlashError::Busy("flash operation"))?;
        let exe = locate(self.esptool.as_deref())?;
        let c = match runner::run(&exe, &self.args(port, Verb::EraseFlash), cancel, &mut |_| {})? {
            Outcome::Done(c) => c,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        if c.success && output::erase_succeeded(&c.output) {
            Ok(Outcome::Done(()))
        } else {
            Err(FlashError::EraseFailed {
                port:    port.to_owned(),
                summary: missing_marker(&c, output::ERASE_OK),
                output:  c.output,
            })
        }
    }

    /// Run only the chip identification step.
    pub fn chip_id(&self, port: &str, cancel: &CancelToken) -> Result<Outcome<Option<&'static str>>> {
        let _guard = self.busy.try_claim().ok_or(FlashError::Busy("flash operation"))?;
        let exe = locate(self.esptool.as_deref())?;
        let c = match runner::run(&exe, &self.args(port, Verb::ChipId), cancel, &mut |_| {})? {
            Outcome::Done(c) => c,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        };
        if !c.success {
            return Err(FlashError::ToolFailed {
                verb:    Verb::ChipId.name(),
                port:    port.to_owned(),
                summary: c.summary(),
                output:  c.output,
            });
        }
        Ok(Outcome::Done(detect_chip(&c.output)))
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn args(&self, port: &str, verb: Verb<'_>) -> Vec<String> {
        build_args(&self.params, port, verb)
    }

    /// Run a step whose errors fail the operation.
    fn invoke(
        &self,
        exe: &std::path::Path,
        port: &str,
        verb: Verb<'_>,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<Outcome<Captured>> {
        match runner::run(exe, &self.args(port, verb), cancel, on_line) {
            Ok(Outcome::Done(c)) => Ok(Outcome::Done(c)),
            Ok(Outcome::Cancelled) => Ok(self.cancelled()),
            Err(e) => Err(self.failed(e)),
        }
    }

    fn reset_state(&self) {
        if let Ok(mut s) = self.state.lock() {
            *s = FlashState::Idle;
        }
    }

    fn set_state(&self, next: FlashState) {
        if let Ok(mut s) = self.state.lock() {
            if !s.can_transition(next) {
                warn!("flash: unexpected transition {:?} -> {next:?}", *s);
            }
            info!("flash: {:?} -> {next:?}", *s);
            *s = next;
        }
    }

    /// Check the cancel token, then move to `next`. `false` means cancelled.
    fn advance(&self, cancel: &CancelToken, next: FlashState) -> bool {
        if cancel.is_cancelled() {
            self.set_state(FlashState::Cancelled);
            return false;
        }
        self.set_state(next);
        true
    }

    fn cancelled<T>(&self) -> Outcome<T> {
        self.set_state(FlashState::Cancelled);
        Outcome::Cancelled
    }

    fn failed(&self, e: FlashError) -> FlashError {
        warn!("flash: failed: {e}");
        self.set_state(FlashState::Failed);
        e
    }
}

/// Family named in chip_id output, if any.
pub fn detect_chip(text: &str) -> Option<&'static str> {
    text.lines().find_map(|line| match parse_progress_line(line) {
        Some(ToolEvent::ChipDetected(family)) => Some(family),
        _ if line.trim_start().starts_with("Detecting chip type") => output::classify_chip(line),
        _ => None,
    })
}

fn missing_marker(c: &Captured, marker: &str) -> String {
    if c.success {
        format!("esptool exited normally but never printed \"{marker}\"")
    } else {
        c.summary()
    }
}
