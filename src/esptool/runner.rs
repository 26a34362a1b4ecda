// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: esptool :: runner  -  one cancellable esptool process
//
//  stdout and stderr are drained by one reader thread each and funnelled into
//  a single channel, so lines reach the caller in the order each stream
//  produced them. The calling thread only ever waits with a timeout, which
//  keeps it responsive to the cancel token; on cancel the child is killed.
// ─────────────────────────────────────────────────────────────────────────────

use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::cancel::{CancelToken, Outcome};
use crate::error::{FlashError, Result};

const POLL: Duration = Duration::from_millis(50);

/// Everything a finished process left behind.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub code:    Option<i32>,
    pub success: bool,
    /// stdout and stderr lines, interleaved in arrival order.
    pub output:  String,
}

impl Captured {
    /// `exit code N` plus the last fatal-error line, if esptool printed one.
    pub fn summary(&self) -> String {
        let code = match self.code {
            Some(c) => format!("exit code {c}"),
            None => "terminated by signal".to_owned(),
        };
        let fatal = self
            .output
            .lines()
            .rev()
            .find(|l| l.contains(super::output::FATAL) || l.to_lowercase().contains("error"));
        match fatal {
            Some(line) => format!("{code}: {}", line.trim()),
            None => code,
        }
    }
}

/// Run `program args...`, handing every output line to `on_line` as it arrives.
pub fn run(
    program: &Path,
    args: &[String],
    cancel: &CancelToken,
    on_line: &mut dyn FnMut(&str),
) -> Result<Outcome<Captured>> {
    debug!("esptool: {} {}", program.display(), args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Python esptool otherwise block-buffers a piped stdout.
        .env("PYTHONUNBUFFERED", "1")
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                FlashError::ExecutableNotFound(format!("{}: {e}", program.display()))
            }
            _ => FlashError::Io(e),
        })?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(thread::spawn(move || pump(out, tx)));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(thread::spawn(move || pump(err, tx)));
    }
    drop(tx);

    let mut output = String::new();

    loop {
        if cancel.is_cancelled() {
            return kill(&mut child);
        }
        match rx.recv_timeout(POLL) {
            Ok(line) => {
                debug!("esptool> {line}");
                on_line(&line);
                output.push_str(&line);
                output.push('\n');
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Both pipes are closed; the process is exiting or already gone.
    let status = loop {
        if cancel.is_cancelled() {
            return kill(&mut child);
        }
        match child.try_wait()? {
            Some(s) => break s,
            None => thread::sleep(POLL),
        }
    };

    for r in readers {
        let _ = r.join();
    }

    debug!("esptool: exited with {status}");
    Ok(Outcome::Done(Captured { code: status.code(), success: status.success(), output }))
}

fn kill(child: &mut std::process::Child) -> Result<Outcome<Captured>> {
    debug!("esptool: cancelled, killing pid {}", child.id());
    // Already exited is fine.
    let _ = child.kill();
    let _ = child.wait();
    Ok(Outcome::Cancelled)
}

/// Forward complete lines from `src`. Both `\n` and `\r` end a line.
fn pump(mut src: impl Read, tx: Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    let flush = |pending: &mut Vec<u8>, tx: &Sender<String>| -> bool {
        let line = String::from_utf8_lossy(pending).trim_end().to_owned();
        pending.clear();
        line.trim().is_empty() || tx.send(line).is_ok()
    };

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !flush(&mut pending, &tx) {
                    return;
                }
            } else {
                pending.push(b);
            }
        }
    }
    flush(&mut pending, &tx);
}
