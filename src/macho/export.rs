//! Standalone file export.
//!
//! Writes an image's in-memory buffer out as a self-contained binary:
//! chained fixups are materialized, the in-cache header flag is cleared,
//! segments are re-packed at page-aligned file offsets, and `__LINKEDIT`
//! is rebuilt to hold only this image's own data (function starts,
//! data-in-code, and a symbol table that carries the attached local
//! symbols alongside the existing entries).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Error, Result};
use crate::extract::LocalSymbol;
use crate::util::{align_up, memchr_null, read_u32_le};

use super::binary::MachBinary;
use super::constants::*;
use super::fixups::{self, ChainedFixups};
use super::structs::*;

/// Page size used for segment alignment in the output file.
const PAGE_SIZE: u64 = 0x4000;

/// Offset of the flags field within the Mach-O header.
const HEADER_FLAGS_OFFSET: usize = 24;

/// Field offsets within a segment command / section header.
const SEG_FILEOFF_OFFSET: usize = 40;
const SEG_FILESIZE_OFFSET: usize = 48;
const SEG_VMSIZE_OFFSET: usize = 32;
const SEG_NSECTS_OFFSET: usize = 64;
const SECT_OFFSET_FIELD: usize = 48;

/// One copy step of the output plan: `size` bytes from `read_offset` in
/// the working buffer land at `write_offset` in the file.
struct WriteProcedure {
    write_offset: u64,
    read_offset: u64,
    size: u64,
}

/// Exports `binary` to `path` as a standalone file.
pub(crate) fn export_binary(
    binary: &MachBinary,
    path: &Path,
    fixups_data: Option<&ChainedFixups>,
    base_address: u64,
    symbols: &[LocalSymbol],
) -> Result<()> {
    let mut data = binary.as_bytes().to_vec();

    if let Some(fx) = fixups_data {
        fixups::apply(binary, &mut data, fx, base_address)?;
    }

    clear_in_cache_flag(&mut data);

    let (procedures, linkedit_off, linkedit) = build_layout(binary, &mut data, symbols)?;

    write_output(path, &data, binary, &procedures, linkedit_off, &linkedit)
}

/// Clears `MH_DYLIB_IN_CACHE` so the file loads as an ordinary dylib.
fn clear_in_cache_flag(data: &mut [u8]) {
    let flags = read_u32_le(&data[HEADER_FLAGS_OFFSET..]);
    if flags & MH_DYLIB_IN_CACHE != 0 {
        let cleared = flags & !MH_DYLIB_IN_CACHE;
        data[HEADER_FLAGS_OFFSET..HEADER_FLAGS_OFFSET + 4]
            .copy_from_slice(&cleared.to_le_bytes());
    }
}

/// Computes the compact output layout and rebuilds `__LINKEDIT`.
///
/// Returns the segment write plan, the new linkedit file offset, and the
/// rebuilt linkedit bytes. All load commands in `data` are updated to the
/// new offsets.
fn build_layout(
    binary: &MachBinary,
    data: &mut Vec<u8>,
    symbols: &[LocalSymbol],
) -> Result<(Vec<WriteProcedure>, u64, Vec<u8>)> {
    // Non-linkedit segments with file content, in file order.
    let mut segs: Vec<(usize, SegmentCommand64)> = binary
        .segments()
        .filter(|s| s.name() != "__LINKEDIT" && s.command.filesize > 0)
        .map(|s| (s.command_offset, s.command))
        .collect();
    segs.sort_by_key(|(_, cmd)| cmd.fileoff);

    let mut procedures = Vec::with_capacity(segs.len());
    let mut cursor = 0u64;

    for &(cmd_offset, cmd) in &segs {
        let new_off = if procedures.is_empty() {
            // The first segment keeps offset 0; it contains the header.
            0
        } else {
            align_up(cursor, PAGE_SIZE)
        };

        procedures.push(WriteProcedure {
            write_offset: new_off,
            read_offset: cmd.fileoff,
            size: cmd.filesize,
        });

        rewrite_u64(data, cmd_offset + SEG_FILEOFF_OFFSET, new_off)?;
        rewrite_sections(data, cmd_offset, cmd.fileoff, new_off)?;

        cursor = new_off + cmd.filesize;
    }

    let linkedit_off = align_up(cursor, PAGE_SIZE);
    let linkedit = rebuild_linkedit(binary, data, linkedit_off, symbols)?;

    // Point the __LINKEDIT segment at the rebuilt blob.
    if let Some(le) = binary.segment("__LINKEDIT") {
        let off = le.command_offset;
        rewrite_u64(data, off + SEG_FILEOFF_OFFSET, linkedit_off)?;
        rewrite_u64(data, off + SEG_FILESIZE_OFFSET, linkedit.len() as u64)?;
        rewrite_u64(
            data,
            off + SEG_VMSIZE_OFFSET,
            align_up(linkedit.len() as u64, PAGE_SIZE),
        )?;
    }

    Ok((procedures, linkedit_off, linkedit))
}

fn rewrite_u64(data: &mut [u8], offset: usize, value: u64) -> Result<()> {
    if offset + 8 > data.len() {
        return Err(Error::buffer_too_small(offset + 8, data.len()));
    }
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Shifts the section file offsets of one segment to its new base.
fn rewrite_sections(
    data: &mut [u8],
    cmd_offset: usize,
    old_fileoff: u64,
    new_fileoff: u64,
) -> Result<()> {
    let nsects = read_u32_le(&data[cmd_offset + SEG_NSECTS_OFFSET..]) as usize;
    for i in 0..nsects {
        let sect_offset = cmd_offset + SegmentCommand64::SIZE + i * Section64::SIZE;
        let field = sect_offset + SECT_OFFSET_FIELD;
        if field + 4 > data.len() {
            return Err(Error::buffer_too_small(field + 4, data.len()));
        }
        let old = read_u32_le(&data[field..]);
        if old != 0 {
            let new = new_fileoff + (old as u64 - old_fileoff);
            data[field..field + 4].copy_from_slice(&(new as u32).to_le_bytes());
        }
    }
    Ok(())
}

/// Rebuilds the linkedit blob and updates the commands that point into it.
fn rebuild_linkedit(
    binary: &MachBinary,
    data: &mut [u8],
    linkedit_off: u64,
    symbols: &[LocalSymbol],
) -> Result<Vec<u8>> {
    let mut blob: Vec<u8> = Vec::new();

    // Carry over the per-image linkedit payloads that stay valid.
    for lc in binary.linkedit_data_commands() {
        let cmd = lc.command;
        match cmd.cmd {
            LC_FUNCTION_STARTS | LC_DATA_IN_CODE => {
                let mut updated = cmd;
                if cmd.datasize > 0 {
                    let start = cmd.dataoff as usize;
                    let end = start + cmd.datasize as usize;
                    if end > data.len() {
                        return Err(Error::buffer_too_small(end, data.len()));
                    }
                    pad_to_alignment(&mut blob, 8);
                    updated.dataoff = (linkedit_off as usize + blob.len()) as u32;
                    blob.extend_from_slice(&data[start..end]);
                }
                write_struct_at(data, lc.command_offset, &updated)?;
            }
            // Fixups are materialized, the trie's exports live in the
            // symbol table, and signatures are invalid after re-layout.
            LC_DYLD_CHAINED_FIXUPS
            | LC_DYLD_EXPORTS_TRIE
            | LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO => {
                let mut updated = cmd;
                updated.dataoff = 0;
                updated.datasize = 0;
                write_struct_at(data, lc.command_offset, &updated)?;
            }
            _ => {}
        }
    }

    rebuild_symtab(binary, data, linkedit_off, &mut blob, symbols)?;

    if let Some(&(dysym, offset)) = binary.dysymtab() {
        // The tables the dysymtab references lived in the shared linkedit;
        // only the symbol index ranges stay meaningful.
        let mut updated = dysym;
        updated.tocoff = 0;
        updated.ntoc = 0;
        updated.modtaboff = 0;
        updated.nmodtab = 0;
        updated.extrefsymoff = 0;
        updated.nextrefsyms = 0;
        updated.indirectsymoff = 0;
        updated.nindirectsyms = 0;
        updated.extreloff = 0;
        updated.nextrel = 0;
        updated.locreloff = 0;
        updated.nlocrel = 0;
        write_struct_at(data, offset, &updated)?;
    }

    Ok(blob)
}

/// Rebuilds the symbol table: existing entries with their strings
/// re-pointed into a fresh pool, followed by the attached local symbols.
fn rebuild_symtab(
    binary: &MachBinary,
    data: &mut [u8],
    linkedit_off: u64,
    blob: &mut Vec<u8>,
    symbols: &[LocalSymbol],
) -> Result<()> {
    let Some(&(symtab, cmd_offset)) = binary.symtab() else {
        if !symbols.is_empty() {
            debug!("no symtab command; dropping {} local symbols", symbols.len());
        }
        return Ok(());
    };

    let mut nlists: Vec<Nlist64> = Vec::with_capacity(symtab.nsyms as usize + symbols.len());
    // Index 0 is the traditional empty name.
    let mut strings: Vec<u8> = vec![0];

    let sym_start = symtab.symoff as usize;
    let str_start = symtab.stroff as usize;
    let str_end = str_start + symtab.strsize as usize;

    for i in 0..symtab.nsyms as usize {
        let off = sym_start + i * Nlist64::SIZE;
        let mut nlist = Nlist64::read_from_prefix(data.get(off..).unwrap_or(&[]))
            .map_err(|_| Error::parse(off, "failed to parse symbol entry"))?
            .0;

        let name_off = str_start + nlist.n_strx as usize;
        let name: &[u8] = if nlist.n_strx != 0 && name_off < str_end.min(data.len()) {
            let bytes = &data[name_off..str_end.min(data.len())];
            &bytes[..memchr_null(bytes)]
        } else {
            b""
        };

        nlist.n_strx = append_string(&mut strings, name);
        nlists.push(nlist);
    }

    for sym in symbols {
        nlists.push(Nlist64 {
            n_strx: append_string(&mut strings, sym.name.as_bytes()),
            n_type: sym.ntype,
            n_sect: sym.sect,
            n_desc: sym.desc,
            n_value: sym.value,
        });
    }

    pad_to_alignment(blob, 8);
    let symoff = linkedit_off as usize + blob.len();
    for nlist in &nlists {
        blob.extend_from_slice(nlist.as_bytes());
    }

    pad_to_alignment(blob, 8);
    let stroff = linkedit_off as usize + blob.len();
    blob.extend_from_slice(&strings);

    let updated = SymtabCommand {
        cmd: symtab.cmd,
        cmdsize: symtab.cmdsize,
        symoff: symoff as u32,
        nsyms: nlists.len() as u32,
        stroff: stroff as u32,
        strsize: strings.len() as u32,
    };
    write_struct_at(data, cmd_offset, &updated)?;

    debug!(
        "rebuilt symtab: {} existing + {} local symbols",
        symtab.nsyms,
        symbols.len()
    );
    Ok(())
}

/// Appends a null-terminated string to the pool, returning its index.
fn append_string(pool: &mut Vec<u8>, name: &[u8]) -> u32 {
    if name.is_empty() {
        return 0;
    }
    let index = pool.len() as u32;
    pool.extend_from_slice(name);
    pool.push(0);
    index
}

fn pad_to_alignment(blob: &mut Vec<u8>, alignment: usize) {
    while blob.len() % alignment != 0 {
        blob.push(0);
    }
}

fn write_struct_at<T: IntoBytes + zerocopy::Immutable>(
    data: &mut [u8],
    offset: usize,
    value: &T,
) -> Result<()> {
    let bytes = value.as_bytes();
    if offset + bytes.len() > data.len() {
        return Err(Error::buffer_too_small(offset + bytes.len(), data.len()));
    }
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Writes the planned output file.
fn write_output(
    path: &Path,
    data: &[u8],
    binary: &MachBinary,
    procedures: &[WriteProcedure],
    linkedit_off: u64,
    linkedit: &[u8],
) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut out = BufWriter::new(file);
    let mut pos = 0u64;

    let io_err = |e: std::io::Error| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    };

    let cmds_size = MachHeader64::SIZE + binary.header().sizeofcmds as usize;

    for (i, proc) in procedures.iter().enumerate() {
        pos = pad_until(&mut out, pos, proc.write_offset).map_err(io_err)?;

        let start = proc.read_offset as usize;
        let end = start + proc.size as usize;
        if end > data.len() {
            return Err(Error::buffer_too_small(end, data.len()));
        }

        if i == 0 {
            // The first segment starts with the header and load commands;
            // write the updated copy instead of the segment's stale one.
            let split = cmds_size.min(proc.size as usize);
            out.write_all(&data[..split]).map_err(io_err)?;
            out.write_all(&data[start + split..end]).map_err(io_err)?;
        } else {
            out.write_all(&data[start..end]).map_err(io_err)?;
        }
        pos += proc.size;
    }

    pad_until(&mut out, pos, linkedit_off).map_err(io_err)?;
    out.write_all(linkedit).map_err(io_err)?;

    out.flush().map_err(io_err)?;
    Ok(())
}

/// Writes zero padding from `pos` up to `target`, returning `target`.
fn pad_until<W: Write>(out: &mut W, pos: u64, target: u64) -> std::io::Result<u64> {
    debug_assert!(target >= pos);
    let mut remaining = target - pos;
    let zeros = [0u8; 4096];
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        out.write_all(&zeros[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::LoadedImage;

    const BASE: u64 = 0x1_8000_0000;

    /// A cache-layout image: __TEXT (with header), __DATA, __LINKEDIT with
    /// a one-symbol symtab, the in-cache header flag set.
    fn cache_layout_macho() -> Vec<u8> {
        let mut data = vec![0u8; 0x400];

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: MH_DYLIB,
            ncmds: 4,
            sizeofcmds: (3 * SegmentCommand64::SIZE + SymtabCommand::SIZE) as u32,
            flags: MH_DYLIB_IN_CACHE,
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

        let mut linkedit = SegmentCommand64::default();
        linkedit.set_name("__LINKEDIT");
        linkedit.vmaddr = BASE + 0x300;
        linkedit.vmsize = 0x100;
        linkedit.fileoff = 0x300;
        linkedit.filesize = 0x100;

        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: 0x300,
            nsyms: 1,
            stroff: 0x310,
            strsize: 0x10,
        };

        let mut off = MachHeader64::SIZE;
        for seg in [&text, &dseg, &linkedit] {
            data[off..off + SegmentCommand64::SIZE].copy_from_slice(seg.as_bytes());
            off += SegmentCommand64::SIZE;
        }
        data[off..off + SymtabCommand::SIZE].copy_from_slice(symtab.as_bytes());

        // One existing symbol named "_old".
        let nlist = Nlist64 {
            n_strx: 1,
            n_type: 0x0F,
            n_sect: 1,
            n_desc: 0,
            n_value: BASE + 0x40,
        };
        data[0x300..0x310].copy_from_slice(nlist.as_bytes());
        data[0x310] = 0;
        data[0x311..0x315].copy_from_slice(b"_old");

        // Recognizable __DATA content.
        for (i, b) in data[0x200..0x300].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        data
    }

    #[test]
    fn export_produces_reparseable_compact_file() {
        let binary = MachBinary::parse(cache_layout_macho()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libexported.dylib");

        let locals = vec![LocalSymbol {
            name: "_hidden".into(),
            value: BASE + 0x80,
            ntype: 0x0E,
            sect: 1,
            desc: 0,
        }];
        binary
            .export(&path, None, MachBinary::base_address(&binary), &locals)
            .unwrap();

        let out = MachBinary::parse(std::fs::read(&path).unwrap()).unwrap();

        // In-cache flag cleared, segments re-packed page aligned.
        assert_eq!(out.header().flags & MH_DYLIB_IN_CACHE, 0);
        let dseg = out.segment("__DATA").unwrap().command;
        assert_eq!(dseg.fileoff, 0x4000);
        let le = out.segment("__LINKEDIT").unwrap().command;
        assert_eq!(le.fileoff, 0x8000);

        // __DATA content survived the move.
        let bytes = out.as_bytes();
        let original = cache_layout_macho();
        assert_eq!(&bytes[0x4000..0x4100], &original[0x200..0x300]);

        // Symtab holds the old entry plus the attached local.
        let (symtab, _) = *out.symtab().unwrap();
        assert_eq!(symtab.nsyms, 2);
        let names: Vec<String> = (0..2)
            .map(|i| {
                let nlist = Nlist64::read_from_prefix(
                    &bytes[symtab.symoff as usize + i * Nlist64::SIZE..],
                )
                .unwrap()
                .0;
                let start = symtab.stroff as usize + nlist.n_strx as usize;
                let raw = &bytes[start..];
                String::from_utf8_lossy(&raw[..memchr_null(raw)]).into_owned()
            })
            .collect();
        assert_eq!(names, vec!["_old", "_hidden"]);
    }

    #[test]
    fn export_without_symbols_keeps_existing_symtab() {
        let binary = MachBinary::parse(cache_layout_macho()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libplain.dylib");

        binary
            .export(&path, None, MachBinary::base_address(&binary), &[])
            .unwrap();

        let out = MachBinary::parse(std::fs::read(&path).unwrap()).unwrap();
        let (symtab, _) = *out.symtab().unwrap();
        assert_eq!(symtab.nsyms, 1);
    }
}
