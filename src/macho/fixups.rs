//! Chained-fixup decoding and materialization.
//!
//! Binaries that carry `LC_DYLD_CHAINED_FIXUPS` encode their rebases as
//! in-place chains: each pointer slot packs its target together with the
//! distance to the next slot. [`decode`] recovers the per-segment chain
//! starts; [`apply`] walks the chains and rewrites rebase slots as plain
//! pointers so the exported file no longer depends on the encoding.
//!
//! Bind entries are left untouched: resolving them would need the import
//! table, and the standalone file keeps that information anyway.

use tracing::trace;

use crate::error::{Error, Result};
use crate::util::{read_u16_le, read_u32_le, read_u64_le};

use super::binary::MachBinary;
use super::constants::*;

/// Decoded chained-fixup data for one binary.
#[derive(Debug, Clone)]
pub struct ChainedFixups {
    /// Format version from the fixups header.
    pub version: u32,
    /// Number of imports in the imports table.
    pub imports_count: u32,
    /// Import entry format.
    pub imports_format: u32,
    /// Chain starts for each segment that has fixups.
    pub segments: Vec<SegmentChains>,
}

/// Chain-start information for one segment.
#[derive(Debug, Clone)]
pub struct SegmentChains {
    /// Offset of the segment from the image's base address.
    pub segment_offset: u64,
    /// Page size the chain starts are indexed by.
    pub page_size: u16,
    /// Pointer encoding used in this segment.
    pub pointer_format: u16,
    /// First-fixup offset per page (`DYLD_CHAINED_PTR_START_NONE` = none).
    pub page_starts: Vec<u16>,
}

fn fixups_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    data.get(offset..offset + len).ok_or(Error::InvalidFixups {
        reason: format!("range {:#x}..{:#x} out of bounds", offset, offset + len),
    })
}

/// Decodes the `LC_DYLD_CHAINED_FIXUPS` payload of a binary.
pub(crate) fn decode(binary: &MachBinary) -> Result<ChainedFixups> {
    let lc = binary
        .linkedit_data_command(LC_DYLD_CHAINED_FIXUPS)
        .ok_or(Error::InvalidFixups {
            reason: "no chained fixups command".into(),
        })?;

    let data = binary.as_bytes();
    let base = lc.command.dataoff as usize;
    let size = lc.command.datasize as usize;
    fixups_slice(data, base, size)?;

    let header_bytes = fixups_slice(data, base, 28)?;
    let version = read_u32_le(header_bytes);
    if version != 0 {
        return Err(Error::InvalidFixups {
            reason: format!("unsupported fixups version {}", version),
        });
    }
    let starts_offset = read_u32_le(&header_bytes[4..]) as usize;
    let imports_count = read_u32_le(&header_bytes[16..]);
    let imports_format = read_u32_le(&header_bytes[20..]);

    // dyld_chained_starts_in_image: seg_count then per-segment offsets.
    let starts_base = base + starts_offset;
    let seg_count = read_u32_le(fixups_slice(data, starts_base, 4)?) as usize;

    let mut segments = Vec::new();
    for i in 0..seg_count {
        let info_offset = read_u32_le(fixups_slice(data, starts_base + 4 + i * 4, 4)?) as usize;
        if info_offset == 0 {
            continue;
        }

        // dyld_chained_starts_in_segment.
        let seg_base = starts_base + info_offset;
        let fixed = fixups_slice(data, seg_base, 22)?;
        let page_size = read_u16_le(&fixed[4..]);
        let pointer_format = read_u16_le(&fixed[6..]);
        let segment_offset = read_u64_le(&fixed[8..]);
        let page_count = read_u16_le(&fixed[20..]) as usize;

        match pointer_format {
            DYLD_CHAINED_PTR_ARM64E
            | DYLD_CHAINED_PTR_64
            | DYLD_CHAINED_PTR_64_OFFSET
            | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {}
            other => return Err(Error::UnsupportedPointerFormat(other)),
        }

        let starts_bytes = fixups_slice(data, seg_base + 22, page_count * 2)?;
        let page_starts = (0..page_count)
            .map(|p| read_u16_le(&starts_bytes[p * 2..]))
            .collect();

        segments.push(SegmentChains {
            segment_offset,
            page_size,
            pointer_format,
            page_starts,
        });
    }

    Ok(ChainedFixups {
        version,
        imports_count,
        imports_format,
        segments,
    })
}

/// Walks every chain and rewrites rebase slots as plain pointers.
///
/// `binary` provides the address translation of the original layout;
/// `data` is the output buffer being patched (same layout).
pub(crate) fn apply(
    binary: &MachBinary,
    data: &mut [u8],
    fixups: &ChainedFixups,
    base_address: u64,
) -> Result<()> {
    for seg in &fixups.segments {
        let stride = match seg.pointer_format {
            DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => 4u64,
            _ => 8u64,
        };

        for (page_idx, &start) in seg.page_starts.iter().enumerate() {
            if start == DYLD_CHAINED_PTR_START_NONE {
                continue;
            }
            if start & DYLD_CHAINED_PTR_START_MULTI != 0 {
                return Err(Error::InvalidFixups {
                    reason: "multi-start pages are not supported".into(),
                });
            }

            let page_addr = base_address
                + seg.segment_offset
                + page_idx as u64 * seg.page_size as u64
                + start as u64;
            let Some(mut offset) = binary.addr_to_offset(page_addr) else {
                trace!("fixup page at {:#x} not in image, skipping", page_addr);
                continue;
            };

            loop {
                let off = offset as usize;
                let raw = read_u64_le(data.get(off..off + 8).ok_or(Error::InvalidFixups {
                    reason: format!("fixup slot {:#x} out of bounds", off),
                })?);

                let next = rewrite_slot(data, off, raw, seg.pointer_format, base_address);

                if next == 0 {
                    break;
                }
                offset += next * stride;
            }
        }
    }

    Ok(())
}

/// Rewrites one fixup slot; returns the chain distance to the next slot.
fn rewrite_slot(data: &mut [u8], offset: usize, raw: u64, format: u16, base: u64) -> u64 {
    match format {
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
            let next = (raw >> 51) & 0xFFF;
            let bind = (raw >> 63) & 1 != 0;
            if !bind {
                let target = raw & 0xF_FFFF_FFFF;
                let high8 = (raw >> 36) & 0xFF;
                let value = if format == DYLD_CHAINED_PTR_64_OFFSET {
                    (high8 << 56) | (base + target)
                } else {
                    (high8 << 56) | target
                };
                data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            } else {
                trace!("bind at offset {:#x} left in place", offset);
            }
            next
        }
        // arm64e variants.
        _ => {
            let next = (raw >> 51) & 0x7FF;
            let auth = (raw >> 63) & 1 != 0;
            let bind = (raw >> 62) & 1 != 0;
            if !bind {
                let value = if auth {
                    base + (raw & 0xFFFF_FFFF)
                } else {
                    let target = raw & 0x7FF_FFFF_FFFF;
                    let high8 = (raw >> 43) & 0xFF;
                    if format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                        (high8 << 56) | (base + target)
                    } else {
                        (high8 << 56) | target
                    }
                };
                data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            } else {
                trace!("bind at offset {:#x} left in place", offset);
            }
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;
    use crate::extract::LoadedImage;
    use crate::macho::structs::*;

    const BASE: u64 = 0x1_8000_0000;

    /// A Mach-O with __TEXT, __DATA and a chained-fixups payload at 0x300
    /// describing one chain of two rebases in __DATA.
    fn macho_with_fixups(pointer_format: u16) -> Vec<u8> {
        let mut data = vec![0u8; 0x400];

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: MH_DYLIB,
            ncmds: 3,
            sizeofcmds: (2 * SegmentCommand64::SIZE + LinkeditDataCommand::SIZE) as u32,
            flags: 0,
            reserved: 0,
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());

        let mut text = SegmentCommand64::default();
        text.set_name("__TEXT");
        text.vmaddr = BASE;
        text.vmsize = 0x200;
        text.fileoff = 0;
        text.filesize = 0x200;

        let mut dseg = SegmentCommand64::default();
        dseg.set_name("__DATA");
        dseg.vmaddr = BASE + 0x200;
        dseg.vmsize = 0x100;
        dseg.fileoff = 0x200;
        dseg.filesize = 0x100;

        let mut off = MachHeader64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(text.as_bytes());
        off += SegmentCommand64::SIZE;
        data[off..off + SegmentCommand64::SIZE].copy_from_slice(dseg.as_bytes());
        off += SegmentCommand64::SIZE;

        let fixups_cmd = LinkeditDataCommand {
            cmd: LC_DYLD_CHAINED_FIXUPS,
            cmdsize: LinkeditDataCommand::SIZE as u32,
            dataoff: 0x300,
            datasize: 0x100,
        };
        data[off..off + LinkeditDataCommand::SIZE].copy_from_slice(fixups_cmd.as_bytes());

        let fixups_header = DyldChainedFixupsHeader {
            fixups_version: 0,
            starts_offset: 28,
            imports_offset: 0x80,
            symbols_offset: 0x80,
            imports_count: 0,
            imports_format: 1,
            symbols_format: 0,
        };
        data[0x300..0x31c].copy_from_slice(fixups_header.as_bytes());

        // starts_in_image: two segments, only __DATA has chains.
        let starts_base = 0x300 + 28;
        data[starts_base..starts_base + 4].copy_from_slice(&2u32.to_le_bytes());
        data[starts_base + 4..starts_base + 8].copy_from_slice(&0u32.to_le_bytes());
        data[starts_base + 8..starts_base + 12].copy_from_slice(&12u32.to_le_bytes());

        // starts_in_segment for __DATA.
        let seg_base = starts_base + 12;
        data[seg_base..seg_base + 4].copy_from_slice(&24u32.to_le_bytes()); // size
        data[seg_base + 4..seg_base + 6].copy_from_slice(&0x1000u16.to_le_bytes()); // page_size
        data[seg_base + 6..seg_base + 8].copy_from_slice(&pointer_format.to_le_bytes());
        data[seg_base + 8..seg_base + 16].copy_from_slice(&0x200u64.to_le_bytes()); // segment_offset
        data[seg_base + 16..seg_base + 20].copy_from_slice(&0u32.to_le_bytes()); // max_valid_pointer
        data[seg_base + 20..seg_base + 22].copy_from_slice(&1u16.to_le_bytes()); // page_count
        data[seg_base + 22..seg_base + 24].copy_from_slice(&0x10u16.to_le_bytes()); // page_start

        data
    }

    #[test]
    fn decode_recovers_segment_chains() {
        let binary = MachBinary::parse(macho_with_fixups(DYLD_CHAINED_PTR_64_OFFSET)).unwrap();
        assert!(binary.has_fixups());

        let fixups = binary.decode_fixups().unwrap();
        assert_eq!(fixups.version, 0);
        assert_eq!(fixups.segments.len(), 1);

        let seg = &fixups.segments[0];
        assert_eq!(seg.segment_offset, 0x200);
        assert_eq!(seg.pointer_format, DYLD_CHAINED_PTR_64_OFFSET);
        assert_eq!(seg.page_starts, vec![0x10]);
    }

    #[test]
    fn unknown_pointer_format_is_rejected() {
        let binary = MachBinary::parse(macho_with_fixups(9)).unwrap();
        let err = binary.decode_fixups().unwrap_err();
        assert!(matches!(err, Error::UnsupportedPointerFormat(9)));
    }

    #[test]
    fn apply_materializes_rebase_chain() {
        let mut raw_file = macho_with_fixups(DYLD_CHAINED_PTR_64_OFFSET);
        // Chain at __DATA+0x10 (file 0x210): rebase of 0x1000, next slot
        // 2 strides (8 bytes) away; then rebase of 0x2000, end of chain.
        raw_file[0x210..0x218].copy_from_slice(&((2u64 << 51) | 0x1000).to_le_bytes());
        raw_file[0x218..0x220].copy_from_slice(&0x2000u64.to_le_bytes());

        let binary = MachBinary::parse(raw_file).unwrap();
        let fixups = binary.decode_fixups().unwrap();

        let mut out = binary.as_bytes().to_vec();
        apply(&binary, &mut out, &fixups, BASE).unwrap();

        assert_eq!(
            u64::from_le_bytes(out[0x210..0x218].try_into().unwrap()),
            BASE + 0x1000
        );
        assert_eq!(
            u64::from_le_bytes(out[0x218..0x220].try_into().unwrap()),
            BASE + 0x2000
        );
    }

    #[test]
    fn apply_leaves_binds_in_place() {
        let mut raw_file = macho_with_fixups(DYLD_CHAINED_PTR_64_OFFSET);
        // A bind entry (bit 63) terminating the chain.
        let bind = (1u64 << 63) | 0x42;
        raw_file[0x210..0x218].copy_from_slice(&bind.to_le_bytes());

        let binary = MachBinary::parse(raw_file).unwrap();
        let fixups = binary.decode_fixups().unwrap();

        let mut out = binary.as_bytes().to_vec();
        apply(&binary, &mut out, &fixups, BASE).unwrap();

        assert_eq!(u64::from_le_bytes(out[0x210..0x218].try_into().unwrap()), bind);
    }

    #[test]
    fn apply_handles_arm64e_auth_rebase() {
        let mut raw_file = macho_with_fixups(DYLD_CHAINED_PTR_ARM64E);
        // Auth rebase: target 0x4000, end of chain.
        let auth = (1u64 << 63) | 0x4000;
        raw_file[0x210..0x218].copy_from_slice(&auth.to_le_bytes());

        let binary = MachBinary::parse(raw_file).unwrap();
        let fixups = binary.decode_fixups().unwrap();

        let mut out = binary.as_bytes().to_vec();
        apply(&binary, &mut out, &fixups, BASE).unwrap();

        assert_eq!(
            u64::from_le_bytes(out[0x210..0x218].try_into().unwrap()),
            BASE + 0x4000
        );
    }
}
