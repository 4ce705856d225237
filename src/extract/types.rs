//! Core data model for the extraction pipeline.
//!
//! These types are the vocabulary shared between the orchestration code and
//! the collaborator traits: they carry no cache-format knowledge of their
//! own, which is what lets the pipeline run against fakes in tests.

use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

// =============================================================================
// Cache-Side Types
// =============================================================================

/// A contiguous virtual-address range within the cache.
///
/// A mapping may carry slide info describing the pointer values that were
/// compressed out of it at cache-build time; a mapping without slide info
/// needs no rebasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMapping {
    /// Virtual memory address of the mapping.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
    /// File offset of the mapping's data within the cache.
    pub file_offset: u64,
    /// File offset to slide info (0 if none).
    pub slide_info_offset: u64,
    /// Size of slide info (0 if none).
    pub slide_info_size: u64,
    /// Maximum protection.
    pub max_prot: u32,
    /// Initial protection.
    pub init_prot: u32,
}

impl CacheMapping {
    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size
    }

    /// Converts a virtual address to a cache file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    /// Returns true if this mapping carries slide info.
    #[inline]
    pub fn has_slide_info(&self) -> bool {
        self.slide_info_size > 0
    }

    /// Returns true if this mapping is readable.
    #[inline]
    pub fn is_readable(&self) -> bool {
        (self.init_prot & 1) != 0
    }

    /// Returns true if this mapping is writable.
    #[inline]
    pub fn is_writable(&self) -> bool {
        (self.init_prot & 2) != 0
    }

    /// Returns true if this mapping is executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        (self.init_prot & 4) != 0
    }
}

/// One pointer slot recovered from slide info: the cache virtual address of
/// the slot and the value it must hold after decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseEntry {
    /// Cache virtual address of the pointer slot.
    pub cache_address: u64,
    /// Value the slot holds once rebased.
    pub target: u64,
}

/// An image known to the cache.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Index in the cache's image table.
    pub index: usize,
    /// Virtual address of the image's Mach-O header.
    pub address: u64,
    /// File offset of the image's Mach-O header within the cache.
    pub file_offset: u64,
    /// Cache-internal path (e.g., "/usr/lib/libc.dylib").
    pub path: String,
}

impl ImageHandle {
    /// Returns the basename of the cache-internal path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path or basename contains the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

/// An unexported symbol recovered from the cache's local-symbols store.
///
/// The fields mirror an nlist entry so the exporter can attach the symbol
/// without re-deriving type information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSymbol {
    /// Symbol name.
    pub name: String,
    /// Symbol value (address).
    pub value: u64,
    /// Symbol type byte.
    pub ntype: u8,
    /// Section number.
    pub sect: u8,
    /// Description field.
    pub desc: u16,
}

// =============================================================================
// Binary-Side Types
// =============================================================================

/// A loadable region of a binary, as recorded in its segment commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Virtual address of the segment.
    pub vmaddr: u64,
    /// Memory size of the segment.
    pub vmsize: u64,
}

// =============================================================================
// Byte Order
// =============================================================================

/// Byte order declared by the cache, used to encode patched pointer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Little-endian (all shipping caches).
    #[default]
    Little,
    /// Big-endian.
    Big,
}

impl Endianness {
    /// Encodes a u64 into `buf` in this byte order.
    #[inline]
    pub fn write_u64(self, buf: &mut [u8], value: u64) {
        match self {
            Endianness::Little => LittleEndian::write_u64(buf, value),
            Endianness::Big => BigEndian::write_u64(buf, value),
        }
    }

    /// Decodes a u64 from `buf` in this byte order.
    #[inline]
    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endianness::Little => LittleEndian::read_u64(buf),
            Endianness::Big => BigEndian::read_u64(buf),
        }
    }
}

// =============================================================================
// Per-Image Outcome
// =============================================================================

/// Result of processing one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// The image was exported (and rebased, if requested) to this path.
    Created(PathBuf),
    /// The destination already existed and overwriting was not requested.
    Skipped(PathBuf),
}

impl ExtractOutcome {
    /// Returns the output path the outcome refers to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            ExtractOutcome::Created(p) | ExtractOutcome::Skipped(p) => p,
        }
    }

    /// Returns true if the image was skipped because the file existed.
    pub fn is_skip(&self) -> bool {
        matches!(self, ExtractOutcome::Skipped(_))
    }
}
