//! Parsed Mach-O binary.
//!
//! [`MachBinary`] owns a Mach-O buffer (either assembled from the cache or
//! read back from an exported file) and exposes the structure the
//! extraction pipeline needs: segments, address translation, symbol and
//! linkedit-data commands, and raw read/write access for patching.

use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, Result};
use crate::extract::{ExportedImage, LoadedImage, LocalSymbol, Segment};
use crate::util::{read_u32_le, read_u64_le};

use super::constants::*;
use super::structs::*;
use super::{export, fixups, ChainedFixups};

/// A segment command and where it sits in the file.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The parsed segment command.
    pub command: SegmentCommand64,
    /// File offset of the command itself.
    pub command_offset: usize,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }
}

/// A linkedit-data command and where it sits in the file.
#[derive(Debug, Clone)]
pub struct LinkeditDataInfo {
    /// The parsed command.
    pub command: LinkeditDataCommand,
    /// File offset of the command itself.
    pub command_offset: usize,
}

/// A parsed Mach-O binary with its backing buffer.
#[derive(Debug)]
pub struct MachBinary {
    data: Vec<u8>,
    header: MachHeader64,
    segments: Vec<SegmentInfo>,
    symtab: Option<(SymtabCommand, usize)>,
    dysymtab: Option<(DysymtabCommand, usize)>,
    linkedit_data: Vec<LinkeditDataInfo>,
}

impl MachBinary {
    /// Parses a Mach-O from an owned buffer.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let header = MachHeader64::read_from_prefix(&data[..])
            .map_err(|_| Error::InvalidMachoMagic(0))?
            .0;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let cmds_end = MachHeader64::SIZE + header.sizeofcmds as usize;
        if cmds_end > data.len() {
            return Err(Error::buffer_too_small(cmds_end, data.len()));
        }

        let mut segments = Vec::new();
        let mut symtab = None;
        let mut dysymtab = None;
        let mut linkedit_data = Vec::new();

        let mut offset = MachHeader64::SIZE;
        for _ in 0..header.ncmds {
            if offset + LoadCommand::SIZE > cmds_end {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let lc = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;
            if lc.cmdsize < LoadCommand::SIZE as u32 || offset + lc.cmdsize as usize > cmds_end {
                return Err(Error::LoadCommandOverflow { offset });
            }

            match lc.cmd {
                LC_SEGMENT_64 => {
                    let seg = SegmentCommand64::read_from_prefix(&data[offset..])
                        .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                        .0;
                    segments.push(SegmentInfo {
                        command: seg,
                        command_offset: offset,
                    });
                }
                LC_SYMTAB => {
                    let cmd = SymtabCommand::read_from_prefix(&data[offset..])
                        .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?
                        .0;
                    symtab = Some((cmd, offset));
                }
                LC_DYSYMTAB => {
                    let cmd = DysymtabCommand::read_from_prefix(&data[offset..])
                        .map_err(|_| Error::parse(offset, "failed to parse dysymtab command"))?
                        .0;
                    dysymtab = Some((cmd, offset));
                }
                LC_DYLD_CHAINED_FIXUPS | LC_DYLD_EXPORTS_TRIE | LC_FUNCTION_STARTS
                | LC_DATA_IN_CODE | LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO => {
                    let cmd = LinkeditDataCommand::read_from_prefix(&data[offset..])
                        .map_err(|_| {
                            Error::parse(offset, "failed to parse linkedit data command")
                        })?
                        .0;
                    linkedit_data.push(LinkeditDataInfo {
                        command: cmd,
                        command_offset: offset,
                    });
                }
                _ => {}
            }

            offset += lc.cmdsize as usize;
        }

        Ok(Self {
            data,
            header,
            segments,
            symtab,
            dysymtab,
            linkedit_data,
        })
    }

    /// Returns the parsed header.
    pub fn header(&self) -> &MachHeader64 {
        &self.header
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.segments.iter()
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Returns the symbol table command and its file offset.
    pub fn symtab(&self) -> Option<&(SymtabCommand, usize)> {
        self.symtab.as_ref()
    }

    /// Returns the dynamic symbol table command and its file offset.
    pub fn dysymtab(&self) -> Option<&(DysymtabCommand, usize)> {
        self.dysymtab.as_ref()
    }

    /// Returns all parsed linkedit-data commands.
    pub fn linkedit_data_commands(&self) -> &[LinkeditDataInfo] {
        &self.linkedit_data
    }

    /// Returns the linkedit-data command with the given type.
    pub fn linkedit_data_command(&self, cmd: u32) -> Option<&LinkeditDataInfo> {
        self.linkedit_data.iter().find(|lc| lc.command.cmd == cmd)
    }

    /// Converts a virtual address to a file offset within this binary.
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.segments.iter().find_map(|seg| {
            let cmd = &seg.command;
            if cmd.contains_addr(addr) {
                Some(cmd.fileoff + (addr - cmd.vmaddr))
            } else {
                None
            }
        })
    }

    /// Returns the image's base address: the lowest segment address.
    pub fn base_address(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.command.vmaddr)
            .min()
            .unwrap_or(0)
    }

    /// Reads `len` bytes at the given file offset.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset + len > self.data.len() {
            return Err(Error::buffer_too_small(offset + len, self.data.len()));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Reads a u32 at the given file offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(read_u32_le(self.read_at(offset, 4)?))
    }

    /// Reads a u64 at the given file offset.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        Ok(read_u64_le(self.read_at(offset, 8)?))
    }

    /// Writes bytes at the given file offset.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.data.len() {
            return Err(Error::buffer_too_small(offset + bytes.len(), self.data.len()));
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Writes a structure at the given file offset.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.write_at(offset, value.as_bytes())
    }

    /// Returns the raw buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the binary, returning its buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl LoadedImage for MachBinary {
    type Fixups = ChainedFixups;

    fn has_fixups(&self) -> bool {
        self.linkedit_data_command(LC_DYLD_CHAINED_FIXUPS)
            .is_some_and(|lc| lc.command.datasize > 0)
    }

    fn decode_fixups(&self) -> Result<ChainedFixups> {
        fixups::decode(self)
    }

    fn base_address(&self) -> u64 {
        MachBinary::base_address(self)
    }

    fn export(
        &self,
        path: &Path,
        fixups: Option<&ChainedFixups>,
        base_address: u64,
        symbols: &[LocalSymbol],
    ) -> Result<()> {
        export::export_binary(self, path, fixups, base_address, symbols)
    }
}

impl ExportedImage for MachBinary {
    fn segments(&self) -> Vec<Segment> {
        self.segments
            .iter()
            .map(|s| Segment {
                vmaddr: s.command.vmaddr,
                vmsize: s.command.vmsize,
            })
            .collect()
    }

    fn address_to_offset(&self, addr: u64) -> Option<u64> {
        self.addr_to_offset(addr)
    }
}
