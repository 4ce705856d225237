//! Mach-O file format handling.
//!
//! Parsing and rewriting of the Mach-O structures the extractor touches,
//! plus the standalone-file exporter and chained-fixup materialization.

mod binary;
mod constants;
mod export;
mod fixups;
mod structs;

pub use binary::*;
pub use constants::*;
pub use fixups::{ChainedFixups, SegmentChains};
pub use structs::*;
