//! Shared cache reading.
//!
//! [`DyldCache`] memory-maps a cache file, parses its header, mappings and
//! image table, and serves the read-side capabilities the extraction
//! pipeline needs. The struct is immutable after [`DyldCache::open`] (the
//! lazy local-symbol cache uses `OnceCell`), so a single instance can be
//! shared freely across images.

use std::fs::File;
use std::mem::offset_of;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use once_cell::sync::OnceCell;
use tracing::debug;
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::extract::{
    CacheMapping, CacheReader, Endianness, ImageHandle, LocalSymbol, RebaseEntry,
};
use crate::macho::{LoadCommand, MachBinary, MachHeader64, Nlist64, SegmentCommand64, LC_SEGMENT_64};
use crate::util::{memchr_null, read_u32_le};

use super::slide;
use super::structs::*;

/// A loaded `.symbols` side file.
#[derive(Debug)]
struct SymbolsFile {
    mmap: Mmap,
    header: DyldCacheHeader,
    #[allow(dead_code)]
    path: PathBuf,
}

/// An opened dyld shared cache.
#[derive(Debug)]
pub struct DyldCache {
    /// Memory-mapped cache file.
    mmap: Mmap,
    /// Path the cache was opened from.
    path: PathBuf,
    /// Parsed header.
    header: DyldCacheHeader,
    /// All mappings, in file order.
    mappings: Vec<CacheMapping>,
    /// All images, in the cache's native order.
    images: Vec<ImageHandle>,
    /// Separate local-symbols file, when the cache uses one.
    symbols_file: Option<SymbolsFile>,
    /// Lazily decoded local symbols, one slot per image.
    symbol_cache: Vec<OnceCell<Vec<LocalSymbol>>>,
    /// Page size slide info is indexed by.
    page_size: u64,
}

impl DyldCache {
    /// Opens a dyld shared cache from the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        let header = Self::parse_header(&mmap)?;
        let mappings = Self::parse_mappings(&mmap, &header)?;

        let mut cache = Self {
            mmap,
            path: path.clone(),
            header,
            mappings,
            images: Vec::new(),
            symbols_file: None,
            symbol_cache: Vec::new(),
            page_size: 0,
        };

        cache.load_symbols_file(&path)?;
        cache.images = cache.parse_images()?;
        cache.symbol_cache = (0..cache.images.len()).map(|_| OnceCell::new()).collect();
        cache.page_size = cache.detect_page_size();

        debug!(
            "opened cache {}: {} images, {} mappings, page size {:#x}",
            cache.path.display(),
            cache.images.len(),
            cache.mappings.len(),
            cache.page_size
        );

        Ok(cache)
    }

    /// Parses and validates a cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < std::mem::size_of::<DyldCacheHeader>() {
            return Err(Error::buffer_too_small(
                std::mem::size_of::<DyldCacheHeader>(),
                data.len(),
            ));
        }

        let header = DyldCacheHeader::read_from_prefix(data)
            .map_err(|_| Error::parse(0, "failed to parse dyld cache header"))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMagic([
                header.magic[0],
                header.magic[1],
                header.magic[2],
                header.magic[3],
            ]));
        }

        Ok(header)
    }

    /// Parses mapping entries, preferring the extended format when present.
    fn parse_mappings(data: &[u8], header: &DyldCacheHeader) -> Result<Vec<CacheMapping>> {
        let use_extended = header
            .contains_field(offset_of!(DyldCacheHeader, mapping_with_slide_offset))
            && header.mapping_with_slide_offset != 0;

        let mut mappings = Vec::with_capacity(header.mapping_count as usize);

        if use_extended {
            let offset = header.mapping_with_slide_offset as usize;
            for i in 0..header.mapping_with_slide_count as usize {
                let entry_offset =
                    offset + i * std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
                let info = DyldCacheMappingAndSlideInfo::read_from_prefix(
                    data.get(entry_offset..).unwrap_or(&[]),
                )
                .map_err(|_| Error::parse(entry_offset, "failed to parse extended mapping"))?
                .0;
                mappings.push(CacheMapping {
                    address: info.address,
                    size: info.size,
                    file_offset: info.file_offset,
                    slide_info_offset: info.slide_info_file_offset,
                    slide_info_size: info.slide_info_file_size,
                    max_prot: info.max_prot,
                    init_prot: info.init_prot,
                });
            }
        } else {
            let offset = header.mapping_offset as usize;
            for i in 0..header.mapping_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingInfo>();
                let info =
                    DyldCacheMappingInfo::read_from_prefix(data.get(entry_offset..).unwrap_or(&[]))
                        .map_err(|_| Error::parse(entry_offset, "failed to parse mapping"))?
                        .0;
                mappings.push(CacheMapping {
                    address: info.address,
                    size: info.size,
                    file_offset: info.file_offset,
                    slide_info_offset: 0,
                    slide_info_size: 0,
                    max_prot: info.max_prot,
                    init_prot: info.init_prot,
                });
            }
        }

        Ok(mappings)
    }

    /// Loads the `.symbols` side file when the header announces one.
    fn load_symbols_file(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }

        let parent = main_path.parent().unwrap_or(Path::new("."));
        let name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let symbols_path = parent.join(format!("{}.symbols", name));

        if !symbols_path.exists() {
            // The side file is optional; extraction just loses local symbols.
            return Ok(());
        }

        let file = File::open(&symbols_path).map_err(|e| Error::FileOpen {
            path: symbols_path.clone(),
            source: e,
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: symbols_path.clone(),
            source: e,
        })?;

        let header = Self::parse_header(&mmap)?;
        if header.uuid != self.header.symbol_file_uuid {
            return Err(Error::SymbolsUuidMismatch {
                path: symbols_path,
                expected: uuid_to_string(&self.header.symbol_file_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        self.symbols_file = Some(SymbolsFile {
            mmap,
            header,
            path: symbols_path,
        });

        Ok(())
    }

    /// Parses the image table.
    fn parse_images(&self) -> Result<Vec<ImageHandle>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;

        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            let entry_offset = offset + i * std::mem::size_of::<DyldCacheImageInfo>();
            let info =
                DyldCacheImageInfo::read_from_prefix(self.mmap.get(entry_offset..).unwrap_or(&[]))
                    .map_err(|_| Error::parse(entry_offset, "failed to parse image info"))?
                    .0;

            let path = self.read_string(info.path_file_offset as usize)?;
            let file_offset = self.addr_to_offset(info.address).unwrap_or(0);

            images.push(ImageHandle {
                index: i,
                address: info.address,
                file_offset,
                path,
            });
        }

        Ok(images)
    }

    /// Reads the slide-info page size from the first rebased mapping.
    fn detect_page_size(&self) -> u64 {
        for mapping in &self.mappings {
            if !mapping.has_slide_info() {
                continue;
            }
            // page_size is the second field of every slide info version.
            let offset = mapping.slide_info_offset as usize + 4;
            if offset + 4 <= self.mmap.len() {
                return read_u32_le(&self.mmap[offset..]) as u64;
            }
        }
        PAGE_SIZE_16K as u64
    }

    /// Reads a null-terminated string from the cache.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        if offset >= self.mmap.len() {
            return Err(Error::parse(offset, "string offset out of bounds"));
        }
        let bytes = &self.mmap[offset..];
        let end = memchr_null(bytes);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| Error::parse(offset, "invalid UTF-8 string"))
    }

    /// Converts a virtual address to a cache file offset.
    ///
    /// Mappings are sorted by address, so the common case is a binary
    /// search; a linear scan backs it up for unsorted caches.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        let idx = self
            .mappings
            .partition_point(|m| m.address + m.size <= addr);
        if idx < self.mappings.len() && self.mappings[idx].contains_addr(addr) {
            return Some(self.mappings[idx].addr_to_offset(addr));
        }
        self.mappings
            .iter()
            .find(|m| m.contains_addr(addr))
            .map(|m| m.addr_to_offset(addr))
    }

    /// Returns `len` bytes of cache data at a virtual address.
    #[inline]
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let offset = self
            .addr_to_offset(addr)
            .ok_or(Error::AddressNotFound { addr })? as usize;
        if offset + len > self.mmap.len() {
            return Err(Error::buffer_too_small(offset + len, self.mmap.len()));
        }
        Ok(&self.mmap[offset..offset + len])
    }

    /// Returns the path the cache was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the parsed cache header.
    pub fn header(&self) -> &DyldCacheHeader {
        &self.header
    }

    /// Returns the cache's mappings.
    pub fn mappings(&self) -> &[CacheMapping] {
        &self.mappings
    }

    /// Returns the architecture string from the cache magic.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Assembles the standalone-layout buffer for an image.
    ///
    /// The cache stores an image's segments scattered across mappings; this
    /// gathers the header, load commands and each segment's data into one
    /// buffer positioned at the file offsets the load commands declare.
    fn image_buffer(&self, image: &ImageHandle) -> Result<Vec<u8>> {
        let header_data = self.data_at_addr(image.address, MachHeader64::SIZE)?;
        let header = MachHeader64::read_from_prefix(header_data)
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let cmds_size = MachHeader64::SIZE + header.sizeofcmds as usize;
        let header_and_cmds = self.data_at_addr(image.address, cmds_size)?;

        let mut segments: Vec<SegmentCommand64> = Vec::new();
        let mut max_file_end = cmds_size as u64;

        let mut offset = MachHeader64::SIZE;
        for _ in 0..header.ncmds {
            if offset + LoadCommand::SIZE > header_and_cmds.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let lc = LoadCommand::read_from_prefix(&header_and_cmds[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;
            if lc.cmdsize < LoadCommand::SIZE as u32 {
                return Err(Error::parse(offset, "load command size too small"));
            }

            if lc.cmd == LC_SEGMENT_64 {
                let seg = SegmentCommand64::read_from_prefix(&header_and_cmds[offset..])
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;
                if seg.filesize > 0 {
                    max_file_end = max_file_end.max(seg.fileoff + seg.filesize);
                    segments.push(seg);
                }
            }

            offset += lc.cmdsize as usize;
        }

        let mut buffer = vec![0u8; max_file_end as usize];
        buffer[..cmds_size].copy_from_slice(header_and_cmds);

        for seg in &segments {
            // Segment data lives at its vmaddr in the cache but belongs at
            // its declared file offset in the standalone layout. Regions
            // the cache cannot serve (stripped linkedit parts) stay zeroed.
            if let Ok(data) = self.data_at_addr(seg.vmaddr, seg.filesize as usize) {
                let dst_start = seg.fileoff as usize;
                let dst_end = dst_start + seg.filesize as usize;
                if dst_end <= buffer.len() {
                    buffer[dst_start..dst_end].copy_from_slice(data);
                }
            }
        }

        Ok(buffer)
    }

    /// Locates the local-symbols store: `(data, info_offset, entries_64bit)`.
    fn local_symbols_store(&self) -> Option<(&[u8], usize, bool)> {
        if let Some(ref sf) = self.symbols_file {
            if sf.header.local_symbols_offset != 0 {
                return Some((&sf.mmap[..], sf.header.local_symbols_offset as usize, true));
            }
        }
        if self.header.local_symbols_offset != 0 && self.header.local_symbols_size != 0 {
            return Some((&self.mmap[..], self.header.local_symbols_offset as usize, false));
        }
        None
    }

    /// Decodes the local symbols recorded for one image.
    fn decode_local_symbols(&self, image: &ImageHandle) -> Result<Vec<LocalSymbol>> {
        let Some((data, info_offset, entries_64)) = self.local_symbols_store() else {
            return Ok(Vec::new());
        };

        let info = DyldCacheLocalSymbolsInfo::read_from_prefix(
            data.get(info_offset..).unwrap_or(&[]),
        )
        .map_err(|_| Error::parse(info_offset, "failed to parse local symbols info"))?
        .0;

        // Find this image's entry by its file offset in the cache.
        let entries_offset = info_offset + info.entries_offset as usize;
        let mut range: Option<(u32, u32)> = None;
        for i in 0..info.entries_count as usize {
            let (dylib_offset, start, count) = if entries_64 {
                let off = entries_offset + i * std::mem::size_of::<DyldCacheLocalSymbolsEntry64>();
                let e = DyldCacheLocalSymbolsEntry64::read_from_prefix(
                    data.get(off..).unwrap_or(&[]),
                )
                .map_err(|_| Error::parse(off, "failed to parse local symbols entry"))?
                .0;
                (e.dylib_offset, e.nlist_start_index, e.nlist_count)
            } else {
                let off = entries_offset + i * std::mem::size_of::<DyldCacheLocalSymbolsEntry>();
                let e =
                    DyldCacheLocalSymbolsEntry::read_from_prefix(data.get(off..).unwrap_or(&[]))
                        .map_err(|_| Error::parse(off, "failed to parse local symbols entry"))?
                        .0;
                (e.dylib_offset as u64, e.nlist_start_index, e.nlist_count)
            };

            if dylib_offset == image.file_offset {
                range = Some((start, count));
                break;
            }
        }

        let Some((start, count)) = range else {
            return Ok(Vec::new());
        };

        let nlist_base = info_offset + info.nlist_offset as usize;
        let strings_base = info_offset + info.strings_offset as usize;
        let strings_end = strings_base + info.strings_size as usize;

        let mut symbols = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let off = nlist_base + (start as usize + i) * std::mem::size_of::<Nlist64>();
            let nlist = Nlist64::read_from_prefix(data.get(off..).unwrap_or(&[]))
                .map_err(|_| Error::parse(off, "failed to parse nlist entry"))?
                .0;

            let str_off = strings_base + nlist.n_strx as usize;
            if str_off >= strings_end || str_off >= data.len() {
                return Err(Error::parse(str_off, "local symbol name out of bounds"));
            }
            let bytes = &data[str_off..strings_end.min(data.len())];
            let end = memchr_null(bytes);
            let name = String::from_utf8_lossy(&bytes[..end]).into_owned();

            symbols.push(LocalSymbol {
                name,
                value: nlist.n_value,
                ntype: nlist.n_type,
                sect: nlist.n_sect,
                desc: nlist.n_desc,
            });
        }

        debug!(
            "{}: decoded {} local symbols",
            image.basename(),
            symbols.len()
        );
        Ok(symbols)
    }
}

impl CacheReader for DyldCache {
    type Binary = MachBinary;

    fn list_images(&self) -> &[ImageHandle] {
        &self.images
    }

    fn lookup_image(&self, name: &str) -> Option<&ImageHandle> {
        self.images
            .iter()
            .find(|img| img.path == name)
            .or_else(|| self.images.iter().find(|img| img.basename() == name))
    }

    fn load_image(&self, image: &ImageHandle) -> Result<MachBinary> {
        MachBinary::parse(self.image_buffer(image)?)
    }

    fn local_symbols(&self, image: &ImageHandle) -> Result<Vec<LocalSymbol>> {
        let cell = self
            .symbol_cache
            .get(image.index)
            .ok_or_else(|| Error::ImageNotFound {
                name: image.path.clone(),
            })?;
        cell.get_or_try_init(|| self.decode_local_symbols(image))
            .map(|symbols| symbols.clone())
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
        if !mapping.has_slide_info() {
            return Ok(Vec::new());
        }
        slide::rebase_entries_for_pages(&self.mmap, mapping, start_page, end_page)
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn byte_order(&self) -> Endianness {
        // The magic string is plain ASCII; every cache Apple ships is
        // little-endian, matching its target architectures.
        Endianness::Little
    }
}
