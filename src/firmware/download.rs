// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: firmware :: download
//
//  Plain HTTP GET, streamed to disk with a byte-counting callback. No range
//  requests and no resumption: a failed download is simply started over.
//  Each file is written to `<name>.part` and renamed into place once the body
//  has been read completely.
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::cancel::{CancelToken, Outcome};
use crate::error::{FlashError, Result};

const CHUNK: usize = 64 * 1024;

/// Source of remote firmware files.
pub trait Fetcher {
    /// Stream `url` into `dest`, calling `on_bytes(done, total)` after each
    /// chunk. Returns the number of bytes written.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        on_bytes: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<Outcome<u64>>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(60))
            .build();
        HttpFetcher { agent }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        on_bytes: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<Outcome<u64>> {
        debug!("download: GET {url}");

        let resp = self.agent.get(url).call().map_err(|e| FlashError::Download {
            url:    url.to_owned(),
            reason: e.to_string(),
        })?;

        let total = resp.header("Content-Length").and_then(|v| v.trim().parse::<u64>().ok());
        let reader = resp.into_reader();

        copy_to_file(url, reader, dest, total, cancel, on_bytes)
    }
}

/// Stream `reader` into `dest` through a `.part` file.
pub(crate) fn copy_to_file(
    url: &str,
    mut reader: impl Read,
    dest: &Path,
    total: Option<u64>,
    cancel: &CancelToken,
    on_bytes: &mut dyn FnMut(u64, Option<u64>),
) -> Result<Outcome<u64>> {
    let part = part_path(dest);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(&part)?;

    let mut buf = vec![0u8; CHUNK];
    let mut done: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            drop(out);
            let _ = fs::remove_file(&part);
            return Ok(Outcome::Cancelled);
        }

        let n = reader.read(&mut buf).map_err(|e| FlashError::Download {
            url:    url.to_owned(),
            reason: format!("failed to read response body: {e}"),
        })?;
        if n == 0 {
            break;
        }

        out.write_all(&buf[..n])?;
        done += n as u64;
        on_bytes(done, total);
    }

    out.flush()?;
    drop(out);

    if let Some(t) = total {
        if t != done {
            let _ = fs::remove_file(&part);
            return Err(FlashError::Download {
                url:    url.to_owned(),
                reason: format!("body truncated: got {done} of {t} bytes"),
            });
        }
    }

    fs::rename(&part, dest)?;
    Ok(Outcome::Done(done))
}

fn part_path(dest: &Path) -> PathBuf {
    let name = dest.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    dest.with_file_name(format!("{name}.part"))
}
