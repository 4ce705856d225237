//! Error types for shared-cache extraction.
//!
//! This module covers the whole pipeline: opening and parsing the cache,
//! Mach-O handling, slide info decoding, export, and the in-place rebase
//! patching of exported files.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for extraction operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to seek in exported file to offset {offset:#x}: {source}")]
    PatchSeek {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write rebase value {value:#x} at offset {offset:#x}: {source}")]
    PatchWrite {
        offset: u64,
        value: u64,
        #[source]
        source: std::io::Error,
    },

    // ==================== Run Validation ====================
    #[error("invalid arguments: {reason}")]
    Validation { reason: String },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("symbols file UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SymbolsUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ==================== Slide Info Errors ====================
    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    #[error("invalid slide info at offset {offset:#x}: {reason}")]
    InvalidSlideInfo { offset: u64, reason: String },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("invalid chained fixups: {reason}")]
    InvalidFixups { reason: String },

    #[error("unsupported chained pointer format: {0}")]
    UnsupportedPointerFormat(u16),

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    #[error("failed to extract image '{name}': {source}")]
    ImageExport {
        name: String,
        #[source]
        source: Box<Error>,
    },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a run-validation error.
    #[inline]
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation {
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Wraps an error with the name of the image being extracted.
    #[inline]
    pub fn for_image(self, name: impl Into<String>) -> Self {
        Error::ImageExport {
            name: name.into(),
            source: Box::new(self),
        }
    }
}
