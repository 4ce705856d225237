//! dscextract - extract Mach-O images from Apple's dyld shared cache.
//!
//! The shared cache bundles system libraries into one container and strips
//! per-image relocation state while building it. This library re-exports
//! individual images as standalone files and, optionally, re-applies the
//! pointer values the cache's slide info compressed out, so the extracted
//! file matches a rebased standalone binary byte for byte.
//!
//! # Features
//!
//! - Memory-mapped cache reading
//! - Slide info rebasing (v2, v3, v5)
//! - Chained-fixup materialization
//! - Local-symbol recovery (including the `.symbols` side file)
//!
//! # Example
//!
//! ```no_run
//! use dscextract::{run_extraction, ExtractionRequest, NullObserver};
//!
//! fn main() -> dscextract::Result<()> {
//!     let request = ExtractionRequest {
//!         cache_path: "/path/to/dyld_shared_cache_arm64e".into(),
//!         images: vec!["libSystem.B.dylib".into()],
//!         slide: true,
//!         ..Default::default()
//!     };
//!     let summary = run_extraction(&request, &NullObserver)?;
//!     println!("extracted {} image(s)", summary.created);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod extract;
pub mod macho;
pub mod util;

// Re-export the main entry points.
pub use cache::DyldCache;
pub use error::{Error, Result};
pub use extract::{
    run_extraction, CacheReader, ExtractOutcome, ExtractionRequest, ExtractionSummary,
    LogObserver, NullObserver, ProgressObserver,
};
