//! In-place rebasing of exported binaries.
//!
//! The cache format compresses pointer values out of its data pages
//! ("slide info"). Export alone therefore produces a file whose pointer
//! slots still hold the encoded forms. This pass re-opens the exported
//! file, asks the cache for the decoded `(address, value)` pairs covering
//! each segment, and overwrites the slots with their real values.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::macho::MachBinary;

use super::{CacheReader, Endianness, ExportedImage};

/// Applies all applicable rebase entries to an exported binary.
///
/// `binary` is the parsed view of the exported file and `out` is the same
/// file opened for random-access writing (tests pass an in-memory cursor).
///
/// For each segment the owning cache mapping is resolved; a lookup failure
/// aborts the whole pass, since a segment address outside the cache means
/// the export does not belong to this cache. Mappings without slide info
/// are skipped and their segments stay byte-identical. Entries whose
/// address does not translate into the exported file are skipped silently:
/// slide info covers whole mapping pages, so entries for neighboring
/// content are expected.
///
/// The pass is idempotent: entry targets are absolute values, not deltas.
pub fn apply_rebase<C, B, W>(cache: &C, binary: &B, out: &mut W) -> Result<()>
where
    C: CacheReader + ?Sized,
    B: ExportedImage + ?Sized,
    W: Write + Seek,
{
    let page_size = cache.page_size();
    let order = cache.byte_order();
    let mut skipped = 0usize;

    for seg in binary.segments() {
        let (mapping_id, mapping) = cache.mapping_for_address(seg.vmaddr)?;

        if !mapping.has_slide_info() {
            continue;
        }

        // The +page_size guards against a segment ending mid-page.
        let start_page = (seg.vmaddr - mapping.address) / page_size;
        let end_page = (seg.vmaddr + seg.vmsize - mapping.address + page_size) / page_size;

        debug!(
            "rebasing segment at {:#x} via mapping {} pages [{}, {})",
            seg.vmaddr, mapping_id, start_page, end_page
        );

        let entries = cache.rebase_entries(mapping_id, &mapping, start_page, end_page)?;

        for entry in entries {
            let Some(offset) = binary.address_to_offset(entry.cache_address) else {
                trace!(
                    "address {:#x} not in exported binary, skipping",
                    entry.cache_address
                );
                skipped += 1;
                continue;
            };

            patch_pointer(out, offset, entry.target, order)?;
        }
    }

    if skipped > 0 {
        debug!("{} rebase entries outside exported content", skipped);
    }

    Ok(())
}

/// Overwrites one pointer-width slot at `offset` with `value`.
fn patch_pointer<W: Write + Seek>(
    out: &mut W,
    offset: u64,
    value: u64,
    order: Endianness,
) -> Result<()> {
    out.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::PatchSeek { offset, source: e })?;

    let mut buf = [0u8; 8];
    order.write_u64(&mut buf, value);
    out.write_all(&buf).map_err(|e| Error::PatchWrite {
        offset,
        value,
        source: e,
    })?;

    Ok(())
}

/// Rebases an already-exported file on disk.
///
/// Parses the file to recover its segment layout, re-opens it read-write,
/// and runs [`apply_rebase`] against it.
pub fn rebase_exported_file<C>(cache: &C, path: &Path) -> Result<()>
where
    C: CacheReader + ?Sized,
{
    let data = fs::read(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;
    let binary = MachBinary::parse(data)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

    apply_rebase(cache, &binary, &mut file)
}
