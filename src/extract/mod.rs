//! Core extraction pipeline.
//!
//! This module contains the run orchestration and the slide/rebase engine
//! that turn images embedded in a shared cache back into standalone files:
//!
//! 1. **Orchestration** - validates the request, resolves the cache path and
//!    image set, and drives extraction image by image
//! 2. **Per-image extraction** - fixup decoding, local-symbol attachment,
//!    output-path and existing-file policy, export
//! 3. **Rebase application** - patches the exported file in place with the
//!    pointer values the cache's slide info compressed out
//!
//! The cache reader and the binary exporter are reached only through the
//! [`CacheReader`], [`LoadedImage`] and [`ExportedImage`] traits, so the
//! pipeline can be exercised against in-memory fakes without any real cache
//! parsing.

mod image;
mod orchestrator;
mod rebase;
mod types;

pub use image::*;
pub use orchestrator::*;
pub use rebase::*;
pub use types::*;

use std::path::Path;

use crate::error::Result;

// =============================================================================
// Collaborator Capabilities
// =============================================================================

/// Read-side capabilities of an opened shared cache.
///
/// Implemented by [`crate::cache::DyldCache`]; all methods take `&self` so
/// one reader can serve many images (and, eventually, many workers).
pub trait CacheReader {
    /// The in-memory binary representation this cache produces.
    type Binary: LoadedImage;

    /// Returns every image in the cache, in the cache's native order.
    fn list_images(&self) -> &[ImageHandle];

    /// Looks up a single image by path or basename.
    fn lookup_image(&self, name: &str) -> Option<&ImageHandle>;

    /// Loads the in-memory binary representation of an image.
    fn load_image(&self, image: &ImageHandle) -> Result<Self::Binary>;

    /// Returns the image's unexported symbols from the cache's
    /// local-symbols store.
    ///
    /// Decoding is lazy and cached, so calling this is free for images whose
    /// symbols were already decoded this run.
    fn local_symbols(&self, image: &ImageHandle) -> Result<Vec<LocalSymbol>>;

    /// Resolves a virtual address to its owning mapping and that mapping's
    /// identifier.
    fn mapping_for_address(&self, addr: u64) -> Result<(usize, CacheMapping)>;

    /// Enumerates the rebase entries recorded in a mapping's slide info for
    /// the page range `[start_page, end_page)`.
    fn rebase_entries(
        &self,
        mapping_id: usize,
        mapping: &CacheMapping,
        start_page: u64,
        end_page: u64,
    ) -> Result<Vec<RebaseEntry>>;

    /// Returns the page size slide info is indexed by.
    fn page_size(&self) -> u64;

    /// Returns the cache's declared byte order.
    fn byte_order(&self) -> Endianness;
}

/// An image's in-memory binary representation, ready to export.
pub trait LoadedImage {
    /// Decoded relocation-fixup data, opaque to the pipeline.
    type Fixups;

    /// Returns true if the binary declares chained-fixup data.
    fn has_fixups(&self) -> bool;

    /// Decodes the binary's chained-fixup data.
    ///
    /// Only called when [`has_fixups`](Self::has_fixups) is true; a failure
    /// is fatal for the image since the export would be unusable without it.
    fn decode_fixups(&self) -> Result<Self::Fixups>;

    /// Returns the image's base address (lowest segment address).
    fn base_address(&self) -> u64;

    /// Writes a standalone binary to `path`, materializing `fixups` and
    /// attaching `symbols` as an auxiliary symbol source.
    fn export(
        &self,
        path: &Path,
        fixups: Option<&Self::Fixups>,
        base_address: u64,
        symbols: &[LocalSymbol],
    ) -> Result<()>;
}

/// Address-space view of an already-exported standalone binary.
pub trait ExportedImage {
    /// Returns the binary's loadable segments.
    fn segments(&self) -> Vec<Segment>;

    /// Translates a virtual address into a file offset within the exported
    /// binary, or `None` if the address is not part of the exported content.
    fn address_to_offset(&self, addr: u64) -> Option<u64>;
}

// =============================================================================
// Test Fakes
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::Path;

    use zerocopy::IntoBytes;

    use super::*;
    use crate::error::{Error, Result};
    use crate::macho::{
        MachHeader64, SegmentCommand64, CPU_SUBTYPE_ARM64_ALL, CPU_TYPE_ARM64, MH_DYLIB,
        MH_MAGIC_64,
    };

    /// In-memory stand-in for an opened cache.
    pub struct FakeCache {
        pub mappings: Vec<CacheMapping>,
        pub entries: Vec<RebaseEntry>,
        pub images: Vec<ImageHandle>,
        pub symbols: Vec<LocalSymbol>,
        pub page_size: u64,
    }

    impl FakeCache {
        pub fn new(page_size: u64) -> Self {
            Self {
                mappings: Vec::new(),
                entries: Vec::new(),
                images: Vec::new(),
                symbols: Vec::new(),
                page_size,
            }
        }

        pub fn add_mapping(&mut self, address: u64, size: u64, slide: bool) {
            self.mappings.push(CacheMapping {
                address,
                size,
                file_offset: 0,
                slide_info_offset: if slide { 0x8000 } else { 0 },
                slide_info_size: if slide { 0x100 } else { 0 },
                max_prot: 3,
                init_prot: 3,
            });
        }

        pub fn add_image(&mut self, path: &str, address: u64) {
            self.images.push(ImageHandle {
                index: self.images.len(),
                address,
                file_offset: 0,
                path: path.to_string(),
            });
        }
    }

    impl CacheReader for FakeCache {
        type Binary = FakeImage;

        fn list_images(&self) -> &[ImageHandle] {
            &self.images
        }

        fn lookup_image(&self, name: &str) -> Option<&ImageHandle> {
            self.images
                .iter()
                .find(|img| img.path == name || img.basename() == name)
        }

        fn load_image(&self, image: &ImageHandle) -> Result<FakeImage> {
            Ok(FakeImage::standalone(image.address))
        }

        fn local_symbols(&self, _image: &ImageHandle) -> Result<Vec<LocalSymbol>> {
            Ok(self.symbols.clone())
        }

        fn mapping_for_address(&self, addr: u64) -> Result<(usize, CacheMapping)> {
            self.mappings
                .iter()
                .enumerate()
                .find(|(_, m)| m.contains_addr(addr))
                .map(|(i, m)| (i, m.clone()))
                .ok_or(Error::AddressNotFound { addr })
        }

        fn rebase_entries(
            &self,
            _mapping_id: usize,
            mapping: &CacheMapping,
            start_page: u64,
            end_page: u64,
        ) -> Result<Vec<RebaseEntry>> {
            let lo = mapping.address + start_page * self.page_size;
            let hi = mapping.address + end_page * self.page_size;
            Ok(self
                .entries
                .iter()
                .copied()
                .filter(|e| {
                    e.cache_address >= lo
                        && e.cache_address < hi
                        && mapping.contains_addr(e.cache_address)
                })
                .collect())
        }

        fn page_size(&self) -> u64 {
            self.page_size
        }

        fn byte_order(&self) -> Endianness {
            Endianness::Little
        }
    }

    /// Fake binary: a fixed segment layout plus the bytes `export` writes.
    pub struct FakeImage {
        pub base: u64,
        /// (segment, file offset) pairs.
        pub layout: Vec<(Segment, u64)>,
        pub bytes: Vec<u8>,
    }

    impl FakeImage {
        /// A fake image whose exported form is a minimal, re-parseable
        /// Mach-O: `__TEXT` (header) at file 0, `__DATA` at file 0x100,
        /// 0x200 bytes total.
        pub fn standalone(base: u64) -> Self {
            Self {
                base,
                layout: vec![
                    (
                        Segment {
                            vmaddr: base,
                            vmsize: 0x100,
                        },
                        0,
                    ),
                    (
                        Segment {
                            vmaddr: base + 0x100,
                            vmsize: 0x100,
                        },
                        0x100,
                    ),
                ],
                bytes: minimal_macho(base),
            }
        }
    }

    impl LoadedImage for FakeImage {
        type Fixups = ();

        fn has_fixups(&self) -> bool {
            false
        }

        fn decode_fixups(&self) -> Result<()> {
            Ok(())
        }

        fn base_address(&self) -> u64 {
            self.base
        }

        fn export(
            &self,
            path: &Path,
            _fixups: Option<&()>,
            _base_address: u64,
            _symbols: &[LocalSymbol],
        ) -> Result<()> {
            fs::write(path, &self.bytes).map_err(|e| Error::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }

    impl ExportedImage for FakeImage {
        fn segments(&self) -> Vec<Segment> {
            self.layout.iter().map(|(seg, _)| *seg).collect()
        }

        fn address_to_offset(&self, addr: u64) -> Option<u64> {
            self.layout.iter().find_map(|(seg, fileoff)| {
                if addr >= seg.vmaddr && addr < seg.vmaddr + seg.vmsize {
                    Some(fileoff + (addr - seg.vmaddr))
                } else {
                    None
                }
            })
        }
    }

    /// Builds a minimal two-segment Mach-O image based at `base`:
    /// `__TEXT` covers the header at file offset 0, `__DATA` holds 0x100
    /// patchable bytes at file offset 0x100.
    pub fn minimal_macho(base: u64) -> Vec<u8> {
        let mut data = vec![0u8; 0x200];

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: MH_DYLIB,
            ncmds: 2,
            sizeofcmds: (2 * SegmentCommand64::SIZE) as u32,
            flags: 0,
            reserved: 0,
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());

        let mut text = SegmentCommand64::default();
        text.set_name("__TEXT");
        text.vmaddr = base;
        text.vmsize = 0x100;
        text.fileoff = 0;
        text.filesize = 0x100;

        let mut dseg = SegmentCommand64::default();
        dseg.set_name("__DATA");
        dseg.vmaddr = base + 0x100;
        dseg.vmsize = 0x100;
        dseg.fileoff = 0x100;
        dseg.filesize = 0x100;

        let mut off = MachHeader64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(text.as_bytes());
        off += SegmentCommand64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(dseg.as_bytes());

        data
    }
}
