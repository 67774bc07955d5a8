//! Error types for unclamp.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scanning, encoding or applying patches.
///
/// Expected negative outcomes (cache miss, no clamp in a block, a block that
/// stops decoding early) are not errors and never show up here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read metadata file {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed metadata file {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed rule document: {0}")]
    RuleDocument(#[source] serde_json::Error),

    #[error("invalid regular expression `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("code block has no instructions")]
    EmptyBlock,

    #[error("blocks are not contiguous: first ends at 0x{end:X}, second starts at 0x{start:X}")]
    DiscontiguousBlocks { end: u64, start: u64 },

    #[error("block 0x{start:X}..0x{end:X} overlaps an indexed block")]
    BlockOverlap { start: u64, end: u64 },

    #[error("failed to encode patch at RVA 0x{rva:X}: {reason}")]
    Encode { rva: u64, reason: String },

    #[error("patch at RVA 0x{rva:X} needs {encoded} bytes, original instruction has {original}")]
    PatchOverflow {
        rva: u64,
        encoded: usize,
        original: usize,
    },

    #[error("patch at RVA 0x{rva:X} ({len} bytes) lies outside the image")]
    PatchOutOfBounds { rva: u64, len: usize },

    #[error("failed to change memory protection at 0x{0:X}")]
    ProtectFailed(u64),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X}")]
    UnsupportedMachine(u16),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("section '{name}' lies outside the file")]
    SectionOutOfBounds { name: String },

    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[cfg(target_os = "windows")]
    #[error("windows API error: {0}")]
    WindowsApi(#[from] windows::core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
