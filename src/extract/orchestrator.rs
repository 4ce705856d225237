//! Run-level orchestration: request validation, image selection, and the
//! sequential extraction loop.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::cache::DyldCache;
use crate::error::{Error, Result};

use super::{CacheReader, ExtractOptions, ExtractOutcome, ImageExtractor, ImageHandle};

// =============================================================================
// Request
// =============================================================================

/// A fully-described extraction run.
#[derive(Debug, Clone, Default)]
pub struct ExtractionRequest {
    /// Path to the shared cache file (may be a symlink, see
    /// [`resolve_cache_path`]).
    pub cache_path: PathBuf,
    /// Names of the images to extract (path or basename).
    pub images: Vec<String>,
    /// Extract every image in the cache.
    pub all: bool,
    /// Overwrite existing destination files.
    pub force: bool,
    /// Apply slide info to extracted files.
    pub slide: bool,
    /// Output directory; defaults to the cache file's parent directory.
    pub output: Option<PathBuf>,
}

impl ExtractionRequest {
    /// Validates the request before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.all && !self.images.is_empty() {
            return Err(Error::validation("cannot specify images when using --all"));
        }
        if !self.all && self.images.is_empty() {
            return Err(Error::validation(
                "must specify at least one image to extract",
            ));
        }
        Ok(())
    }
}

/// Resolves the on-disk cache path, following one level of symlink.
///
/// A symlink's target is joined onto the link's *grandparent* directory.
/// This mirrors the long-standing behavior of the original tool and is
/// deliberately left as is; changing it would silently move which file
/// gets opened for setups that rely on it.
// TODO: joining onto the grandparent breaks for a relative link target
// that points inside the link's own directory.
pub fn resolve_cache_path(path: &Path) -> Result<PathBuf> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !meta.file_type().is_symlink() {
        return Ok(path.to_path_buf());
    }

    let target = fs::read_link(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    let link_parent = path.parent().unwrap_or(Path::new("."));
    let link_root = link_parent.parent().unwrap_or(Path::new("."));
    Ok(link_root.join(target))
}

// =============================================================================
// Progress Observation
// =============================================================================

/// Receives one callback per processed image, plus a terminal signal in
/// bulk mode.
///
/// The sequential driver invokes observers from a single thread; a parallel
/// driver must keep funneling completions through one reporting point.
pub trait ProgressObserver {
    /// Called once per image, whether it was created or soft-skipped.
    fn image_completed(&self, image: &ImageHandle, outcome: &ExtractOutcome);

    /// Called once after the last image in bulk mode.
    fn finished(&self) {}
}

/// Observer that reports through `tracing`, matching the original tool's
/// selective-mode output.
#[derive(Debug, Default)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn image_completed(&self, _image: &ImageHandle, outcome: &ExtractOutcome) {
        match outcome {
            ExtractOutcome::Created(path) => info!("Created {}", path.display()),
            ExtractOutcome::Skipped(path) => {
                warn!("Dylib already exists: {}", path.display())
            }
        }
    }
}

/// Observer that ignores all events, for library callers.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn image_completed(&self, _image: &ImageHandle, _outcome: &ExtractOutcome) {}
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Counts of what a run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Images exported (and rebased, if requested).
    pub created: usize,
    /// Images soft-skipped because the destination existed.
    pub skipped: usize,
}

/// Drives [`ImageExtractor`] over a resolved image set.
pub struct ExtractionOrchestrator<'a, C: CacheReader> {
    cache: &'a C,
    extractor: ImageExtractor<'a, C>,
    all: bool,
    requested: Vec<String>,
}

impl<'a, C: CacheReader> ExtractionOrchestrator<'a, C> {
    /// Creates an orchestrator for a validated request against an opened
    /// cache.
    pub fn new(cache: &'a C, request: &ExtractionRequest, output_dir: PathBuf) -> Self {
        let options = ExtractOptions {
            output_dir,
            force: request.force,
            slide: request.slide,
            preserve_paths: request.all,
        };
        Self {
            cache,
            extractor: ImageExtractor::new(cache, options),
            all: request.all,
            requested: request.images.clone(),
        }
    }

    /// Resolves the image set and extracts each image in order.
    ///
    /// Selection happens up front, so a name that is not in the cache
    /// aborts before any file is written. The first fatal per-image error
    /// ends the run; soft skips are counted and reported but never abort.
    pub fn run(&self, observer: &dyn ProgressObserver) -> Result<ExtractionSummary> {
        let images = self.select_images()?;

        let mut summary = ExtractionSummary::default();
        for image in &images {
            let outcome = self.extractor.extract(image)?;
            if outcome.is_skip() {
                summary.skipped += 1;
            } else {
                summary.created += 1;
            }
            observer.image_completed(image, &outcome);
        }

        if self.all {
            observer.finished();
        }

        Ok(summary)
    }

    fn select_images(&self) -> Result<Vec<ImageHandle>> {
        if self.all {
            return Ok(self.cache.list_images().to_vec());
        }

        let mut images = Vec::with_capacity(self.requested.len());
        for name in &self.requested {
            let image = self
                .cache
                .lookup_image(name)
                .ok_or_else(|| Error::ImageNotFound { name: name.clone() })?;
            images.push(image.clone());
        }
        Ok(images)
    }
}

/// Validates a request, resolves and opens the cache, and runs extraction.
pub fn run_extraction(
    request: &ExtractionRequest,
    observer: &dyn ProgressObserver,
) -> Result<ExtractionSummary> {
    request.validate()?;

    let cache_path = resolve_cache_path(&request.cache_path)?;
    let output_dir = match &request.output {
        Some(dir) => dir.clone(),
        None => cache_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf(),
    };

    info!("Opening cache: {}", cache_path.display());
    let cache = DyldCache::open(&cache_path)?;

    ExtractionOrchestrator::new(&cache, request, output_dir).run(observer)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::super::testing::FakeCache;
    use super::*;

    const BASE: u64 = 0x1_8000_0000;

    #[derive(Default)]
    struct RecordingObserver {
        completed: RefCell<Vec<(String, bool)>>,
        finished: RefCell<bool>,
    }

    impl ProgressObserver for RecordingObserver {
        fn image_completed(&self, image: &ImageHandle, outcome: &ExtractOutcome) {
            self.completed
                .borrow_mut()
                .push((image.path.clone(), outcome.is_skip()));
        }

        fn finished(&self) {
            *self.finished.borrow_mut() = true;
        }
    }

    fn request(all: bool, images: &[&str]) -> ExtractionRequest {
        ExtractionRequest {
            cache_path: PathBuf::from("unused"),
            images: images.iter().map(|s| s.to_string()).collect(),
            all,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_all_with_explicit_images() {
        let err = request(true, &["libfoo.dylib"]).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn rejects_empty_selection() {
        let err = request(false, &[]).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn unknown_image_aborts_before_any_file_is_written() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, false);
        cache.add_image("/usr/lib/liba.dylib", BASE);

        let dir = tempfile::tempdir().unwrap();
        let req = request(false, &["liba.dylib", "libmissing.dylib"]);
        let orch = ExtractionOrchestrator::new(&cache, &req, dir.path().to_path_buf());

        let err = orch.run(&NullObserver).unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { ref name } if name == "libmissing.dylib"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn bulk_run_extracts_every_image_to_unique_paths() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x100000, false);
        cache.add_image("/usr/lib/libx.dylib", BASE);
        cache.add_image("/System/Library/libx.dylib", BASE + 0x1000);

        let dir = tempfile::tempdir().unwrap();
        let req = request(true, &[]);
        let orch = ExtractionOrchestrator::new(&cache, &req, dir.path().to_path_buf());
        let observer = RecordingObserver::default();

        let summary = orch.run(&observer).unwrap();
        assert_eq!(summary, ExtractionSummary { created: 2, skipped: 0 });

        // Shared basenames stay distinct because the hierarchy is kept.
        assert!(dir.path().join("usr/lib/libx.dylib").is_file());
        assert!(dir.path().join("System/Library/libx.dylib").is_file());
        assert_eq!(observer.completed.borrow().len(), 2);
        assert!(*observer.finished.borrow());
    }

    #[test]
    fn soft_skip_is_reported_and_does_not_abort() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x100000, false);
        cache.add_image("/usr/lib/liba.dylib", BASE);
        cache.add_image("/usr/lib/libb.dylib", BASE + 0x1000);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("liba.dylib"), b"sentinel").unwrap();

        let req = request(false, &["liba.dylib", "libb.dylib"]);
        let orch = ExtractionOrchestrator::new(&cache, &req, dir.path().to_path_buf());
        let observer = RecordingObserver::default();

        let summary = orch.run(&observer).unwrap();
        assert_eq!(summary, ExtractionSummary { created: 1, skipped: 1 });
        assert_eq!(
            *observer.completed.borrow(),
            vec![
                ("/usr/lib/liba.dylib".to_string(), true),
                ("/usr/lib/libb.dylib".to_string(), false),
            ]
        );
        assert_eq!(
            std::fs::read(dir.path().join("liba.dylib")).unwrap(),
            b"sentinel"
        );
        // Selective mode: no terminal signal.
        assert!(!*observer.finished.borrow());
    }

    #[test]
    fn first_fatal_error_ends_the_run() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, true);
        cache.add_image("/usr/lib/liba.dylib", BASE);
        // libb's segments resolve to no mapping, so its rebase pass fails.
        cache.add_image("/usr/lib/libb.dylib", 0x7_0000_0000);
        cache.add_image("/usr/lib/libc.dylib", BASE + 0x1000);

        let dir = tempfile::tempdir().unwrap();
        let mut req = request(false, &["liba.dylib", "libb.dylib", "libc.dylib"]);
        req.slide = true;
        let orch = ExtractionOrchestrator::new(&cache, &req, dir.path().to_path_buf());
        let observer = RecordingObserver::default();

        let err = orch.run(&observer).unwrap_err();
        assert!(matches!(err, Error::ImageExport { ref name, .. } if name == "/usr/lib/libb.dylib"));

        // liba completed and survives; libc was never attempted.
        assert!(dir.path().join("liba.dylib").is_file());
        assert!(!dir.path().join("libc.dylib").exists());
        assert_eq!(observer.completed.borrow().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_resolves_against_grandparent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let link = sub.join("cache");
        std::os::unix::fs::symlink("real_cache", &link).unwrap();

        let resolved = resolve_cache_path(&link).unwrap();
        assert_eq!(resolved, dir.path().join("real_cache"));
    }

    #[test]
    fn regular_file_path_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(resolve_cache_path(&path).unwrap(), path);
    }
}
