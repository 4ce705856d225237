//! Mach-O constants.
//!
//! Only the subset this crate consumes: magics, CPU types, the load
//! commands the extractor inspects or rewrites, and the chained-fixup
//! pointer formats it can materialize.

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (native byte order).
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (swapped byte order).
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

// =============================================================================
// File Types
// =============================================================================

/// Dynamically bound shared library.
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// Header Flags
// =============================================================================

/// The binary is part of the dyld shared cache. Must be cleared for
/// standalone operation.
pub const MH_DYLIB_IN_CACHE: u32 = 0x8000_0000;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit ABI flag.
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type.
pub const CPU_TYPE_ARM: u32 = 12;

/// ARM64 CPU type.
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type.
pub const CPU_TYPE_X86: u32 = 7;

/// x86-64 CPU type.
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// Generic ARM64 subtype.
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

/// ARM64e (pointer authentication) subtype.
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

// =============================================================================
// Load Commands
// =============================================================================

/// Command is required to be understood by dyld.
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Symbol table.
pub const LC_SYMTAB: u32 = 0x2;

/// Dynamic symbol table.
pub const LC_DYSYMTAB: u32 = 0xB;

/// 64-bit segment.
pub const LC_SEGMENT_64: u32 = 0x19;

/// Code signature data in `__LINKEDIT`.
pub const LC_CODE_SIGNATURE: u32 = 0x1D;

/// Segment split info data in `__LINKEDIT`.
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;

/// Function starts data in `__LINKEDIT`.
pub const LC_FUNCTION_STARTS: u32 = 0x26;

/// Data-in-code entries in `__LINKEDIT`.
pub const LC_DATA_IN_CODE: u32 = 0x29;

/// Exports trie (newer binaries).
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;

/// Chained fixups data.
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// =============================================================================
// Chained Fixup Pointer Formats
// =============================================================================

/// arm64e pointers, targets are vm addresses.
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;

/// Plain 64-bit pointers, targets are vm addresses.
pub const DYLD_CHAINED_PTR_64: u16 = 2;

/// Plain 64-bit pointers, targets are offsets from the load address.
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;

/// arm64e pointers with 24-bit bind ordinals, targets are offsets.
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

/// Page-starts value meaning the page has no fixups.
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;

/// Page-starts value flagging multiple chains per page.
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;
