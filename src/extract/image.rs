//! Per-image extraction driver.
//!
//! One [`ImageExtractor`] serves a whole run: it computes the output path
//! for each image, applies the existing-file policy, and drives the load →
//! fixup decode → export → rebase sequence for the images that need it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

use super::{rebase_exported_file, CacheReader, ExtractOutcome, ImageHandle, LoadedImage};

/// Options governing a run's per-image behavior.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Directory extracted files are written under.
    pub output_dir: PathBuf,
    /// Overwrite existing destination files instead of skipping them.
    pub force: bool,
    /// Apply slide info to the exported file.
    pub slide: bool,
    /// Preserve the cache-internal directory hierarchy (bulk mode).
    ///
    /// Bulk extraction must keep the hierarchy: distinct images can share a
    /// basename, and flattening them would collide.
    pub preserve_paths: bool,
}

/// Extracts single images from an opened cache.
pub struct ImageExtractor<'a, C: CacheReader> {
    cache: &'a C,
    options: ExtractOptions,
}

impl<'a, C: CacheReader> ImageExtractor<'a, C> {
    /// Creates an extractor over `cache` with the given options.
    pub fn new(cache: &'a C, options: ExtractOptions) -> Self {
        Self { cache, options }
    }

    /// Returns the destination path for an image.
    pub fn output_path(&self, image: &ImageHandle) -> PathBuf {
        if self.options.preserve_paths {
            self.options
                .output_dir
                .join(image.path.trim_start_matches('/'))
        } else {
            self.options.output_dir.join(image.basename())
        }
    }

    /// Produces a standalone binary file for one image.
    ///
    /// Returns [`ExtractOutcome::Skipped`] when the destination exists and
    /// overwriting was not requested; any other shortfall is an error that
    /// aborts the run.
    pub fn extract(&self, image: &ImageHandle) -> Result<ExtractOutcome> {
        let dest = self.output_path(image);

        if dest.exists() && !self.options.force {
            return Ok(ExtractOutcome::Skipped(dest));
        }

        self.extract_to(image, &dest)
            .map_err(|e| e.for_image(&image.path))?;

        Ok(ExtractOutcome::Created(dest))
    }

    fn extract_to(&self, image: &ImageHandle, dest: &Path) -> Result<()> {
        let binary = self.cache.load_image(image)?;

        let fixups = if binary.has_fixups() {
            debug!("{}: decoding chained fixups", image.basename());
            Some(binary.decode_fixups()?)
        } else {
            None
        };

        // Local-symbol decoding is comparatively expensive; the reader
        // caches it so repeated requests for the same image stay free.
        let symbols = self.cache.local_symbols(image)?;

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        binary.export(dest, fixups.as_ref(), binary.base_address(), &symbols)?;

        if self.options.slide {
            rebase_exported_file(self.cache, dest)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{minimal_macho, FakeCache};
    use super::super::RebaseEntry;
    use super::*;

    const BASE: u64 = 0x1_8000_0000;

    fn options(dir: &std::path::Path) -> ExtractOptions {
        ExtractOptions {
            output_dir: dir.to_path_buf(),
            force: false,
            slide: false,
            preserve_paths: false,
        }
    }

    #[test]
    fn selective_mode_uses_basename() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, false);
        cache.add_image("/usr/lib/libfoo.dylib", BASE);

        let dir = tempfile::tempdir().unwrap();
        let extractor = ImageExtractor::new(&cache, options(dir.path()));

        let outcome = extractor.extract(&cache.images[0]).unwrap();
        assert_eq!(
            outcome,
            ExtractOutcome::Created(dir.path().join("libfoo.dylib"))
        );
        assert!(dir.path().join("libfoo.dylib").is_file());
    }

    #[test]
    fn bulk_mode_preserves_hierarchy() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, false);
        cache.add_image("/usr/lib/system/libsystem_c.dylib", BASE);

        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.preserve_paths = true;
        let extractor = ImageExtractor::new(&cache, opts);

        extractor.extract(&cache.images[0]).unwrap();
        assert!(dir
            .path()
            .join("usr/lib/system/libsystem_c.dylib")
            .is_file());
    }

    #[test]
    fn existing_destination_is_soft_skipped() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, false);
        cache.add_image("/usr/lib/libfoo.dylib", BASE);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("libfoo.dylib");
        std::fs::write(&dest, b"sentinel").unwrap();

        let extractor = ImageExtractor::new(&cache, options(dir.path()));
        let outcome = extractor.extract(&cache.images[0]).unwrap();

        assert!(outcome.is_skip());
        // Zero bytes of the pre-existing file were modified.
        assert_eq!(std::fs::read(&dest).unwrap(), b"sentinel");
    }

    #[test]
    fn force_overwrites_existing_destination() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, false);
        cache.add_image("/usr/lib/libfoo.dylib", BASE);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("libfoo.dylib");
        std::fs::write(&dest, b"sentinel").unwrap();

        let mut opts = options(dir.path());
        opts.force = true;
        let extractor = ImageExtractor::new(&cache, opts);

        let outcome = extractor.extract(&cache.images[0]).unwrap();
        assert_eq!(outcome, ExtractOutcome::Created(dest.clone()));
        assert_eq!(std::fs::read(&dest).unwrap(), minimal_macho(BASE));
    }

    #[test]
    fn slide_patches_exported_file() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, true);
        cache.add_image("/usr/lib/libfoo.dylib", BASE);
        // Lands in the fake image's __DATA segment: file offset 0x110.
        cache.entries.push(RebaseEntry {
            cache_address: BASE + 0x110,
            target: 0xdeadbeef00000000,
        });

        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.slide = true;
        let extractor = ImageExtractor::new(&cache, opts);

        extractor.extract(&cache.images[0]).unwrap();

        let bytes = std::fs::read(dir.path().join("libfoo.dylib")).unwrap();
        assert_eq!(
            u64::from_le_bytes(bytes[0x110..0x118].try_into().unwrap()),
            0xdeadbeef00000000
        );
    }

    #[test]
    fn slide_without_slide_info_is_byte_identical() {
        let mut cache = FakeCache::new(0x1000);
        cache.add_mapping(BASE, 0x10000, false);
        cache.add_image("/usr/lib/libbar.dylib", BASE);

        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.slide = true;
        let extractor = ImageExtractor::new(&cache, opts);

        extractor.extract(&cache.images[0]).unwrap();

        let bytes = std::fs::read(dir.path().join("libbar.dylib")).unwrap();
        assert_eq!(bytes, minimal_macho(BASE));
    }
}
