//! Dyld shared cache handling.
//!
//! Types and utilities for reading Apple's dyld shared cache format: the
//! header, mappings, image table, slide info, and the local-symbols store
//! (in the main cache or a separate `.symbols` file).
//!
//! The cache bundles many images into a few large mappings and strips the
//! per-image relocation state while doing so; [`DyldCache`] exposes what
//! the extraction pipeline needs to reverse that, through the
//! [`crate::extract::CacheReader`] trait.

mod reader;
mod slide;
mod structs;

pub use reader::*;
pub use structs::*;
