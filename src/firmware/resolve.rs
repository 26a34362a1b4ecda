// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: firmware :: resolve  -  descriptor or folder -> FirmwareSet
//
//  Remote mode downloads into the cache. The companion images go first and
//  firmware.bin last, so an application image on disk means its companions
//  were written before it. A failed or cancelled download removes the version
//  directory again; nothing half-written is ever treated as downloaded.
// ─────────────────────────────────────────────────────────────────────────────

use std::path::Path;

use log::{debug, info, warn};

use crate::cancel::{CancelToken, Outcome, Slot};
use crate::error::{FlashError, Result};
use crate::metadata::FirmwareDescriptor;
use crate::progress::Reporter;

use super::cache::{self, FirmwareCache};
use super::download::{Fetcher, HttpFetcher};
use super::{FirmwareSet, ImageRole};

pub struct Resolver<F = HttpFetcher> {
    cache:   FirmwareCache,
    fetcher: F,
    busy:    Slot,
}

impl Resolver<HttpFetcher> {
    pub fn new(cache: FirmwareCache) -> Self {
        Resolver::with_fetcher(cache, HttpFetcher::new())
    }
}

impl<F: Fetcher> Resolver<F> {
    pub fn with_fetcher(cache: FirmwareCache, fetcher: F) -> Self {
        Resolver { cache, fetcher, busy: Slot::new() }
    }

    pub fn cache(&self) -> &FirmwareCache {
        &self.cache
    }

    /// Local mode: the folder's conventional files.
    pub fn resolve_local(&self, dir: &Path) -> Result<FirmwareSet> {
        let set = FirmwareSet::from_dir(dir)?;
        info!(
            "firmware: local set '{}' ({} image(s), {})",
            set.version(),
            set.images().len(),
            if set.is_complete() { "complete" } else { "application only" }
        );
        Ok(set)
    }

    /// Remote mode: serve from the cache, downloading first when needed.
    pub fn resolve_remote(
        &self,
        desc: &FirmwareDescriptor,
        progress: &mut Reporter<'_>,
        cancel: &CancelToken,
    ) -> Result<Outcome<FirmwareSet>> {
        let _guard = self.busy.try_claim().ok_or(FlashError::Busy("download"))?;

        if self.cache.is_downloaded(&desc.version) {
            info!("firmware: {} served from cache", desc.version);
            self.warn_missing_companions(desc);
            progress.report(100, format!("{} already downloaded", desc.version));
            return self.cached(desc).map(Outcome::Done);
        }

        match self.download(desc, progress, cancel) {
            Ok(Outcome::Done(())) => {
                progress.report(100, format!("{} downloaded", desc.version));
                self.cached(desc).map(Outcome::Done)
            }
            Ok(Outcome::Cancelled) => {
                info!("firmware: download of {} cancelled", desc.version);
                self.cache.remove_version(&desc.version)?;
                Ok(Outcome::Cancelled)
            }
            Err(e) => {
                warn!("firmware: download of {} failed: {e}", desc.version);
                if let Err(cleanup) = self.cache.remove_version(&desc.version) {
                    warn!("firmware: could not remove partial download: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Re-check a downloaded application image against its declared size and hash.
    pub fn verify(&self, desc: &FirmwareDescriptor) -> Result<()> {
        if !self.cache.is_downloaded(&desc.version) {
            return Err(FlashError::NotDownloaded(desc.version.clone()));
        }
        let app = self.cache.version_dir(&desc.version).join(ImageRole::Application.file_name());
        cache::verify_file(&app, desc.size, desc.checksum.as_deref())
    }

    fn cached(&self, desc: &FirmwareDescriptor) -> Result<FirmwareSet> {
        Ok(self
            .cache
            .cached_set(&desc.version, &desc.description)?
            .with_declared_size(desc.size)
            .with_checksum(desc.checksum.clone())
            .recommended(desc.recommended))
    }

    fn download(
        &self,
        desc: &FirmwareDescriptor,
        progress: &mut Reporter<'_>,
        cancel: &CancelToken,
    ) -> Result<Outcome<()>> {
        let dir = self.cache.version_dir(&desc.version);
        let files = desc.files();
        let count = files.len() as u64;

        for (index, (role, url)) in files.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let dest = dir.join(role.file_name());
            let label = format!("Downloading {role}");
            debug!("firmware: {url} -> {}", dest.display());
            progress.status(label.clone());

            // Every file weighs the same share of the phase.
            let index = index as u64;
            let mut on_bytes = |done: u64, total: Option<u64>| match total {
                Some(t) if t > 0 => progress.report_bytes(index * t + done.min(t), Some(count * t), label.clone()),
                _ => progress.report_bytes(index, Some(count), label.clone()),
            };

            match self.fetcher.fetch(url, &dest, cancel, &mut on_bytes)? {
                Outcome::Done(bytes) => debug!("firmware: {role} complete ({bytes} bytes)"),
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
            }
        }

        Ok(Outcome::Done(()))
    }

    fn warn_missing_companions(&self, desc: &FirmwareDescriptor) {
        let st = self.cache.status(&desc.version);
        if desc.bootloader_url.is_some() && !st.bootloader {
            warn!("firmware: {} is cached without its bootloader", desc.version);
        }
        if desc.partitions_url.is_some() && !st.partitions {
            warn!("firmware: {} is cached without its partition table", desc.version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{Phase, ProgressHub};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::fs;

    /// Serves fixed bodies and records every URL it was asked for.
    #[derive(Default)]
    struct FakeFetcher {
        requested: RefCell<Vec<String>>,
        fail_on:   Option<&'static str>,
        cancel_on: Option<&'static str>,
    }

    impl Fetcher for FakeFetcher {
        fn fetch(
            &self,
            url: &str,
            dest: &Path,
            cancel: &CancelToken,
            on_bytes: &mut dyn FnMut(u64, Option<u64>),
        ) -> Result<Outcome<u64>> {
            self.requested.borrow_mut().push(url.to_owned());
            if self.fail_on.is_some_and(|f| url.ends_with(f)) {
                return Err(FlashError::Download { url: url.into(), reason: "HTTP 500".into() });
            }
            if self.cancel_on.is_some_and(|f| url.ends_with(f)) {
                cancel.cancel();
            }
            let body = vec![0x42u8; 2048];
            super::super::download::copy_to_file(
                url,
                body.as_slice(),
                dest,
                Some(body.len() as u64),
                cancel,
                on_bytes,
            )
        }
    }

    fn descriptor(version: &str) -> FirmwareDescriptor {
        FirmwareDescriptor {
            id:             version.into(),
            version:        version.into(),
            description:    "test build".into(),
            firmware_url:   "http://fw/firmware.bin".into(),
            bootloader_url: Some("http://fw/bootloader.bin".into()),
            partitions_url: Some("http://fw/partitions.bin".into()),
            size:           None,
            checksum:       None,
            recommended:    true,
            released_at:    None,
        }
    }

    #[test]
    fn download_fetches_application_last() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = Resolver::with_fetcher(FirmwareCache::new(tmp.path()), FakeFetcher::default());
        let hub = ProgressHub::new();
        let rx = hub.channel();
        let mut rep = hub.reporter(Phase::Download).unwrap();

        let set = resolver
            .resolve_remote(&descriptor("1.0.0"), &mut rep, &CancelToken::new())
            .unwrap()
            .done()
            .unwrap();
        drop(rep);

        assert!(set.is_complete());
        assert!(set.is_recommended());
        let urls = resolver.fetcher.requested.borrow().clone();
        assert_eq!(urls.last().map(String::as_str), Some("http://fw/firmware.bin"));
        assert_eq!(urls.len(), 3);

        let pcts: Vec<u8> = rx.try_iter().map(|u| u.percent).collect();
        assert!(pcts.windows(2).all(|w| w[0] <= w[1]));
        // Three equal shares: each finished file moves the phase by a third.
        assert!(pcts.contains(&33) && pcts.contains(&66), "{pcts:?}");
        assert_eq!(pcts.last().copied(), Some(100));
    }

    #[test]
    fn cache_hit_makes_no_network_request() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FirmwareCache::new(tmp.path());
        let dir = cache.version_dir("2.0.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("firmware.bin"), vec![1u8; 4096]).unwrap();

        let resolver = Resolver::with_fetcher(cache, FakeFetcher::default());
        let hub = ProgressHub::new();
        let mut rep = hub.reporter(Phase::Download).unwrap();
        let set = resolver
            .resolve_remote(&descriptor("2.0.0"), &mut rep, &CancelToken::new())
            .unwrap()
            .done()
            .unwrap();

        assert!(resolver.fetcher.requested.borrow().is_empty());
        assert!(!set.is_complete());
        assert_eq!(set.version(), "2.0.0");
    }

    #[test]
    fn failed_download_leaves_no_version_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher { fail_on: Some("firmware.bin"), ..Default::default() };
        let resolver = Resolver::with_fetcher(FirmwareCache::new(tmp.path()), fetcher);
        let hub = ProgressHub::new();
        let mut rep = hub.reporter(Phase::Download).unwrap();

        let err = resolver
            .resolve_remote(&descriptor("3.0.0"), &mut rep, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, FlashError::Download { .. }));
        assert!(!resolver.cache().version_dir("3.0.0").exists());
        assert!(!resolver.cache().is_downloaded("3.0.0"));
    }

    #[test]
    fn cancelled_download_is_rolled_back() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher { cancel_on: Some("partitions.bin"), ..Default::default() };
        let resolver = Resolver::with_fetcher(FirmwareCache::new(tmp.path()), fetcher);
        let hub = ProgressHub::new();
        let mut rep = hub.reporter(Phase::Download).unwrap();

        let out = resolver
            .resolve_remote(&descriptor("4.0.0"), &mut rep, &CancelToken::new())
            .unwrap();
        assert!(out.is_cancelled());
        assert!(!resolver.cache().version_dir("4.0.0").exists());
        assert_eq!(resolver.fetcher.requested.borrow().len(), 2);
    }

    #[test]
    fn stale_checksum_does_not_block_the_download() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = Resolver::with_fetcher(FirmwareCache::new(tmp.path()), FakeFetcher::default());
        let hub = ProgressHub::new();
        let mut rep = hub.reporter(Phase::Download).unwrap();
        let desc = FirmwareDescriptor {
            size: Some(9999),
            checksum: Some("deadbeef".into()),
            ..descriptor("5.0.0")
        };

        let set = resolver
            .resolve_remote(&desc, &mut rep, &CancelToken::new())
            .unwrap()
            .done()
            .unwrap();
        assert!(resolver.cache().is_downloaded("5.0.0"));
        assert_eq!(set.total_size(), 9999);
        assert_eq!(set.checksum(), Some("deadbeef"));

        // Checking is a separate, explicit step.
        assert!(matches!(resolver.verify(&desc), Err(FlashError::SizeMismatch { .. })));
        let desc = FirmwareDescriptor { size: None, ..desc };
        assert!(matches!(resolver.verify(&desc), Err(FlashError::ChecksumMismatch { .. })));
    }

    #[test]
    fn verify_accepts_a_matching_download() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = Resolver::with_fetcher(FirmwareCache::new(tmp.path()), FakeFetcher::default());
        let hub = ProgressHub::new();
        let mut rep = hub.reporter(Phase::Download).unwrap();
        let desc = descriptor("5.1.0");
        resolver.resolve_remote(&desc, &mut rep, &CancelToken::new()).unwrap();

        let app = resolver.cache().version_dir("5.1.0").join("firmware.bin");
        let desc = FirmwareDescriptor {
            size: Some(2048),
            checksum: Some(cache::hash_file(&app).unwrap()),
            ..desc
        };
        resolver.verify(&desc).unwrap();
    }

    #[test]
    fn verify_requires_a_download() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = Resolver::with_fetcher(FirmwareCache::new(tmp.path()), FakeFetcher::default());
        assert!(matches!(resolver.verify(&descriptor("6.0.0")), Err(FlashError::NotDownloaded(_))));
    }
}
