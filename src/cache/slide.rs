//! Rebase-entry enumeration from slide info.
//!
//! In the shared cache, pointers in rebased mappings are stored in an
//! encoded form that chains rebase locations together page by page. This
//! module walks those chains and reports each location as a
//! [`RebaseEntry`]: the slot's cache virtual address and the decoded value
//! it must hold.
//!
//! Three slide info versions are handled:
//! - V2: standard arm64 / x86_64, delta-chained with an extras table
//! - V3: arm64e with pointer authentication
//! - V5: arm64e (iOS 18+, macOS 15+)

use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::extract::{CacheMapping, RebaseEntry};
use crate::util::{read_u16_le, read_u32_le, read_u64_le};

use super::structs::*;

/// Decodes the rebase entries of `mapping` for pages `[start_page, end_page)`.
///
/// `data` is the cache file containing both the slide info and the
/// mapping's page content. The requested range may overshoot the mapping
/// (callers pad the end to cover segments ending mid-page); pages past
/// `page_starts_count` are ignored.
pub(crate) fn rebase_entries_for_pages(
    data: &[u8],
    mapping: &CacheMapping,
    start_page: u64,
    end_page: u64,
) -> Result<Vec<RebaseEntry>> {
    let offset = mapping.slide_info_offset as usize;
    if offset + 4 > data.len() {
        return Err(Error::InvalidSlideInfo {
            offset: offset as u64,
            reason: "slide info offset out of bounds".into(),
        });
    }

    let version = read_u32_le(&data[offset..]);
    match version {
        2 => entries_v2(data, offset, mapping, start_page, end_page),
        3 => entries_v3(data, offset, mapping, start_page, end_page),
        5 => entries_v5(data, offset, mapping, start_page, end_page),
        _ => Err(Error::UnsupportedSlideVersion(version)),
    }
}

/// Reads one u16 page-starts entry from the array at `base`.
fn page_start_at(data: &[u8], base: usize, index: usize) -> Result<u16> {
    let pos = base + index * 2;
    if pos + 2 > data.len() {
        return Err(Error::InvalidSlideInfo {
            offset: pos as u64,
            reason: "page starts array out of bounds".into(),
        });
    }
    Ok(read_u16_le(&data[pos..]))
}

/// Reads the encoded u64 at `offset` in the cache file.
fn pointer_at(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(Error::InvalidSlideInfo {
            offset: offset as u64,
            reason: "rebase location out of bounds".into(),
        });
    }
    Ok(read_u64_le(&data[offset..]))
}

// =============================================================================
// Version 2
// =============================================================================

fn entries_v2(
    data: &[u8],
    offset: usize,
    mapping: &CacheMapping,
    start_page: u64,
    end_page: u64,
) -> Result<Vec<RebaseEntry>> {
    let info = DyldCacheSlideInfo2::read_from_prefix(&data[offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: offset as u64,
            reason: "failed to parse slide info v2".into(),
        })?
        .0;

    let page_size = info.page_size as u64;
    let starts_base = offset + info.page_starts_offset as usize;
    let extras_base = offset + info.page_extras_offset as usize;

    let end = end_page.min(info.page_starts_count as u64);
    let mut entries = Vec::new();

    for page_idx in start_page..end {
        let start = page_start_at(data, starts_base, page_idx as usize)?;

        if start == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
            continue;
        }

        let page_addr = mapping.address + page_idx * page_size;
        let page_offset = mapping.file_offset as usize + (page_idx * page_size) as usize;

        if start & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
            // The entry indexes a list of chain starts in the extras array,
            // terminated by the END attribute.
            let mut extra_idx = (start & !DYLD_CACHE_SLIDE_PAGE_ATTRS) as usize;
            loop {
                if extra_idx >= info.page_extras_count as usize {
                    return Err(Error::InvalidSlideInfo {
                        offset: extras_base as u64,
                        reason: format!("page extras index {} out of bounds", extra_idx),
                    });
                }
                let extra = page_start_at(data, extras_base, extra_idx)?;
                let chain_start = ((extra & !DYLD_CACHE_SLIDE_PAGE_ATTRS) as u64) * 4;
                walk_v2_chain(
                    data,
                    page_addr,
                    page_offset,
                    chain_start,
                    page_size,
                    &info,
                    &mut entries,
                )?;
                if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                    break;
                }
                extra_idx += 1;
            }
        } else {
            walk_v2_chain(
                data,
                page_addr,
                page_offset,
                (start as u64) * 4,
                page_size,
                &info,
                &mut entries,
            )?;
        }
    }

    Ok(entries)
}

/// Walks one v2 delta chain within a page.
fn walk_v2_chain(
    data: &[u8],
    page_addr: u64,
    page_offset: usize,
    mut offset_in_page: u64,
    page_size: u64,
    info: &DyldCacheSlideInfo2,
    entries: &mut Vec<RebaseEntry>,
) -> Result<()> {
    let delta_shift = info.delta_shift();
    let value_mask = info.value_mask();

    loop {
        if offset_in_page + 8 > page_size {
            return Err(Error::InvalidSlideInfo {
                offset: page_offset as u64 + offset_in_page,
                reason: "v2 chain runs past page end".into(),
            });
        }

        let raw = pointer_at(data, page_offset + offset_in_page as usize)?;
        // The delta field is in 4-byte units.
        let delta = ((raw & info.delta_mask) >> delta_shift) * 4;

        let mut value = raw & value_mask;
        if value != 0 {
            value += info.value_add;
        }

        entries.push(RebaseEntry {
            cache_address: page_addr + offset_in_page,
            target: value,
        });

        if delta == 0 {
            break;
        }
        offset_in_page += delta;
    }

    Ok(())
}

// =============================================================================
// Version 3
// =============================================================================

fn entries_v3(
    data: &[u8],
    offset: usize,
    mapping: &CacheMapping,
    start_page: u64,
    end_page: u64,
) -> Result<Vec<RebaseEntry>> {
    let info = DyldCacheSlideInfo3::read_from_prefix(&data[offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: offset as u64,
            reason: "failed to parse slide info v3".into(),
        })?
        .0;

    let page_size = info.page_size as u64;
    // Page starts immediately follow the header.
    let starts_base = offset + std::mem::size_of::<DyldCacheSlideInfo3>();

    let end = end_page.min(info.page_starts_count as u64);
    let mut entries = Vec::new();

    for page_idx in start_page..end {
        let start = page_start_at(data, starts_base, page_idx as usize)?;
        if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
            continue;
        }

        let page_addr = mapping.address + page_idx * page_size;
        let page_offset = mapping.file_offset as usize + (page_idx * page_size) as usize;

        // The page-start value is the byte offset of the first rebase
        // location in the page.
        let mut offset_in_page = start as u64;
        loop {
            if offset_in_page + 8 > page_size {
                return Err(Error::InvalidSlideInfo {
                    offset: page_offset as u64 + offset_in_page,
                    reason: "v3 chain runs past page end".into(),
                });
            }

            let ptr = SlidePointer3(pointer_at(data, page_offset + offset_in_page as usize)?);
            let delta = ptr.offset_to_next() * 8;

            let target = if ptr.is_auth() {
                ptr.auth_offset() as u64 + info.auth_value_add
            } else {
                ptr.plain_value()
            };

            entries.push(RebaseEntry {
                cache_address: page_addr + offset_in_page,
                target,
            });

            if delta == 0 {
                break;
            }
            offset_in_page += delta;
        }
    }

    Ok(entries)
}

// =============================================================================
// Version 5
// =============================================================================

fn entries_v5(
    data: &[u8],
    offset: usize,
    mapping: &CacheMapping,
    start_page: u64,
    end_page: u64,
) -> Result<Vec<RebaseEntry>> {
    let info = DyldCacheSlideInfo5::read_from_prefix(&data[offset..])
        .map_err(|_| Error::InvalidSlideInfo {
            offset: offset as u64,
            reason: "failed to parse slide info v5".into(),
        })?
        .0;

    let page_size = info.page_size as u64;
    let starts_base = offset + std::mem::size_of::<DyldCacheSlideInfo5>();

    let end = end_page.min(info.page_starts_count as u64);
    let mut entries = Vec::new();

    for page_idx in start_page..end {
        let start = page_start_at(data, starts_base, page_idx as usize)?;
        if start == DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE {
            continue;
        }

        let page_addr = mapping.address + page_idx * page_size;
        let page_offset = mapping.file_offset as usize + (page_idx * page_size) as usize;

        let mut offset_in_page = start as u64;
        loop {
            if offset_in_page + 8 > page_size {
                return Err(Error::InvalidSlideInfo {
                    offset: page_offset as u64 + offset_in_page,
                    reason: "v5 chain runs past page end".into(),
                });
            }

            let ptr = SlidePointer5(pointer_at(data, page_offset + offset_in_page as usize)?);
            let delta = ptr.next() * 8;

            let target = if ptr.is_auth() {
                ptr.runtime_offset() + info.value_add
            } else {
                ptr.runtime_offset() + info.value_add + ((ptr.high8() as u64) << 56)
            };

            entries.push(RebaseEntry {
                cache_address: page_addr + offset_in_page,
                target,
            });

            if delta == 0 {
                break;
            }
            offset_in_page += delta;
        }
    }

    Ok(entries)
}
