//! # unclamp
//!
//! Finds compiled floating-point clamp idioms in x86-64 images and rewrites
//! them so the unclamped path is always taken.
//!
//! ## Overview
//!
//! A clamp of a value into `[lower, upper]` compiles to two `comiss` compares,
//! each followed by a conditional branch to a bound assignment. This crate:
//!
//! 1. Walks every method declared in the image's method table, recovering
//!    just enough control flow to see the blocks each one reaches
//! 2. Matches the clamp idiom inside those blocks and encodes the branch
//!    rewrites as position-independent patches
//! 3. Records how each patch site was reached, and decides with path-based
//!    rules which sites are in scope
//! 4. Applies the in-scope patches and caches the result, keyed by content
//!    hashes of everything that went into the scan
//!
//! ## Usage
//!
//! ```no_run
//! use unclamp::{ImageView, MappedImage, PatchSource, Session, SessionConfig};
//! use unclamp::patch::BufferWriter;
//!
//! # fn main() -> unclamp::Result<()> {
//! let file = std::fs::read("GameAssembly.dll")?;
//! let mut image = MappedImage::map(&file)?;
//!
//! let session = Session::open(SessionConfig::new(
//!     "config",
//!     "state",
//!     "GameAssembly.dll",
//!     "methods.json",
//! ))?;
//! let plan = session.plan(&image.view());
//! assert_ne!(plan.source, PatchSource::Unavailable);
//!
//! let base = image.image_base();
//! let size = image.bytes().len();
//! session.apply(&plan, &mut BufferWriter::new(base, image.bytes_mut()), base, size);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

pub mod error;
pub mod memory;
pub mod instr;
pub mod block;
pub mod explorer;
pub mod clamp;
pub mod path;
pub mod filter;
pub mod metadata;
pub mod scanner;
pub mod cache;
pub mod patch;
pub mod session;
pub mod pe;

pub use error::{Error, Result};
pub use memory::ImageView;
pub use block::{BlockIndex, CodeBlock};
pub use explorer::Explorer;
pub use clamp::{BranchRewrite, ClampMatcher};
pub use path::{BlockPath, MethodInfo, PathKind, PathSegment};
pub use filter::{RuleAction, RuleDoc, RuleSet};
pub use metadata::{MethodProbe, MethodTable};
pub use scanner::{
    scan, scan_methods, ProgressCallback, ScanConfig, ScanProgress, ScanResult, ScanStage,
    ScanStats,
};
pub use cache::{CacheLookup, CachedBlock, MissReason, PatchCache};
pub use patch::{apply_patches, ApplyStats, CodeWriter, PatchRecord};
pub use session::{PatchPlan, PatchSource, Session, SessionConfig, SessionReport};
pub use pe::MappedImage;
