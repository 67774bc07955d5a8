//! Persisted scan results.
//!
//! The cache is a line-oriented text file:
//!
//! ```text
//! version:1
//! va_base:180000000
//! cache_keys:{"Block Filter":"…","Epoch":"1",…}
//!
//! fields:{"AnimationKeyInfo.Controller:GetInfo":"1a2b30"}
//!
//! block: VA:18000a000 Matched:True
//!   {Assembly-CSharp.dll::Character.HumanBody:Update()};sub0^entry
//!     patch: VA:18000a00b EB00
//!     patch: VA:18000a010 EB08
//!
//! ```
//!
//! Addresses are stored as RVAs rebased onto [`REF_VA_BASE`] so the file reads
//! like a disassembly listing. A file is only reused when its cache keys equal
//! the freshly computed ones; anything else is a [`CacheLookup::Miss`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::filter::md5_upper_hex;
use crate::patch::PatchRecord;
use crate::scanner::BlockPatchInfo;

use tracing::debug;

const VERSION_LINE: &str = "version:1";

/// Base the stored addresses are rebased onto.
pub const REF_VA_BASE: u64 = 0x1_8000_0000;

/// One block as persisted: paths are kept in their text form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedBlock {
    pub rva: u64,
    pub matched: bool,
    pub paths: Vec<String>,
    pub patches: Vec<PatchRecord>,
}

impl CachedBlock {
    pub fn from_patch_info(rva: u64, info: &BlockPatchInfo) -> Self {
        Self {
            rva,
            matched: info.matched,
            paths: info.paths.iter().map(|p| p.to_string()).collect(),
            patches: info.patches.clone(),
        }
    }
}

/// Contents of a cache file that passed validation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedScan {
    pub fields: BTreeMap<String, String>,
    pub blocks: Vec<CachedBlock>,
}

impl CachedScan {
    /// Patches of every matched block.
    pub fn matched_patches(&self) -> impl Iterator<Item = &PatchRecord> {
        self.blocks
            .iter()
            .filter(|b| b.matched)
            .flat_map(|b| b.patches.iter())
    }
}

/// Why a cache file was not used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    Unreadable(std::io::ErrorKind),
    Version(String),
    VaBase(u64),
    KeysChanged,
    Malformed { line: usize },
    Truncated,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::NotFound => f.write_str("no cache file"),
            MissReason::Unreadable(kind) => write!(f, "cache file unreadable ({})", kind),
            MissReason::Version(line) => write!(f, "unknown cache version `{}`", line),
            MissReason::VaBase(base) => write!(f, "unexpected va_base 0x{:X}", base),
            MissReason::KeysChanged => f.write_str("cache keys changed"),
            MissReason::Malformed { line } => write!(f, "malformed line {}", line),
            MissReason::Truncated => f.write_str("cache file truncated"),
        }
    }
}

/// Result of [`PatchCache::try_load`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(CachedScan),
    Miss(MissReason),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Version,
    VaBase,
    CacheKeys,
    AfterKeys,
    Fields,
    AfterFields,
    Block,
    Paths,
    Patches,
}

/// A cache file plus the keys that must match for it to be reused.
#[derive(Clone, Debug)]
pub struct PatchCache {
    path: PathBuf,
    keys: BTreeMap<String, String>,
}

impl PatchCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keys: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }

    pub fn add_key(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(name.into(), value.into());
    }

    /// Key `name` on the MD5 of `data`. Returns the hash.
    pub fn add_data_hash(&mut self, name: impl Into<String>, data: &[u8]) -> String {
        let hash = md5_upper_hex(data);
        self.add_key(name, hash.clone());
        hash
    }

    /// Key `name` on the MD5 of the file at `path`. Returns the hash.
    pub fn add_file_hash(&mut self, name: impl Into<String>, path: &Path) -> Result<String> {
        let data = fs::read(path)?;
        Ok(self.add_data_hash(name, &data))
    }

    pub fn try_load(&self) -> CacheLookup {
        match fs::read_to_string(&self.path) {
            Ok(text) => self.parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                CacheLookup::Miss(MissReason::NotFound)
            }
            Err(e) => CacheLookup::Miss(MissReason::Unreadable(e.kind())),
        }
    }

    /// Validate and parse cache text against this cache's keys.
    pub fn parse(&self, text: &str) -> CacheLookup {
        match self.parse_lines(text) {
            Ok(scan) => CacheLookup::Hit(scan),
            Err(reason) => CacheLookup::Miss(reason),
        }
    }

    fn parse_lines(&self, text: &str) -> std::result::Result<CachedScan, MissReason> {
        let mut scan = CachedScan::default();
        let mut state = State::Version;

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            let malformed = || MissReason::Malformed { line: n + 1 };

            state = match state {
                State::Version => {
                    if line != VERSION_LINE {
                        return Err(MissReason::Version(line.to_string()));
                    }
                    State::VaBase
                }
                State::VaBase => {
                    let base = line
                        .strip_prefix("va_base:")
                        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                        .ok_or_else(malformed)?;
                    if base != REF_VA_BASE {
                        return Err(MissReason::VaBase(base));
                    }
                    State::CacheKeys
                }
                State::CacheKeys => {
                    let keys: BTreeMap<String, String> =
                        json_line(line, "cache_keys:").ok_or_else(malformed)?;
                    if keys != self.keys {
                        return Err(MissReason::KeysChanged);
                    }
                    State::AfterKeys
                }
                State::AfterKeys | State::AfterFields if !line.is_empty() => {
                    return Err(malformed());
                }
                State::AfterKeys => State::Fields,
                State::Fields => {
                    scan.fields = json_line(line, "fields:").ok_or_else(malformed)?;
                    State::AfterFields
                }
                State::AfterFields => State::Block,
                State::Block if line.is_empty() => State::Block,
                State::Block => {
                    let block = line
                        .strip_prefix("block:")
                        .and_then(parse_block_header)
                        .ok_or_else(malformed)?;
                    scan.blocks.push(block);
                    State::Paths
                }
                State::Paths | State::Patches => {
                    let block = scan.blocks.last_mut().ok_or_else(malformed)?;
                    if line.is_empty() {
                        // a block needs at least one patch
                        if state == State::Paths {
                            return Err(malformed());
                        }
                        State::Block
                    } else if let Some(rest) = line.strip_prefix("patch:") {
                        block.patches.push(parse_patch(rest).ok_or_else(malformed)?);
                        State::Patches
                    } else if state == State::Paths {
                        block.paths.push(line.to_string());
                        State::Paths
                    } else {
                        return Err(malformed());
                    }
                }
            };
        }

        if state != State::Block {
            return Err(MissReason::Truncated);
        }
        Ok(scan)
    }

    /// Render a cache file for `fields` and `blocks` under this cache's keys.
    pub fn render(&self, fields: &BTreeMap<String, String>, blocks: &[CachedBlock]) -> String {
        CacheDocument {
            keys: &self.keys,
            fields,
            blocks,
        }
        .to_string()
    }

    /// Replace the cache file, creating its directory if needed.
    pub fn save(&self, fields: &BTreeMap<String, String>, blocks: &[CachedBlock]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, self.render(fields, blocks))?;
        debug!("saved {} blocks to {}", blocks.len(), self.path.display());
        Ok(())
    }
}

fn json_line<T: serde::de::DeserializeOwned>(line: &str, prefix: &str) -> Option<T> {
    serde_json::from_str(line.strip_prefix(prefix)?).ok()
}

/// `VA:<hex>` back to an RVA.
fn parse_va(text: &str) -> Option<u64> {
    let va = u64::from_str_radix(text.strip_prefix("VA:")?, 16).ok()?;
    if va == 0 {
        return None;
    }
    va.checked_sub(REF_VA_BASE)
}

fn parse_block_header(rest: &str) -> Option<CachedBlock> {
    let mut parts = rest.split_whitespace();
    let rva = parse_va(parts.next()?)?;
    let matched = match parts.next()?.strip_prefix("Matched:")? {
        m if m.eq_ignore_ascii_case("true") => true,
        m if m.eq_ignore_ascii_case("false") => false,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(CachedBlock {
        rva,
        matched,
        ..Default::default()
    })
}

fn parse_patch(rest: &str) -> Option<PatchRecord> {
    let mut parts = rest.split_whitespace();
    let rva = parse_va(parts.next()?)?;
    let bytes = hex::decode(parts.next()?).ok()?;
    if bytes.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(PatchRecord::from_bytes(rva, bytes))
}

struct CacheDocument<'a> {
    keys: &'a BTreeMap<String, String>,
    fields: &'a BTreeMap<String, String>,
    blocks: &'a [CachedBlock],
}

impl fmt::Display for CacheDocument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = serde_json::to_string(self.keys).map_err(|_| fmt::Error)?;
        let fields = serde_json::to_string(self.fields).map_err(|_| fmt::Error)?;

        writeln!(f, "{}", VERSION_LINE)?;
        writeln!(f, "va_base:{:x}", REF_VA_BASE)?;
        writeln!(f, "cache_keys:{}", keys)?;
        writeln!(f)?;
        writeln!(f, "fields:{}", fields)?;
        writeln!(f)?;

        for block in self.blocks {
            let matched = if block.matched { "True" } else { "False" };
            writeln!(f, "block: VA:{:x} Matched:{}", block.rva + REF_VA_BASE, matched)?;
            for path in &block.paths {
                writeln!(f, "  {}", path)?;
            }
            for patch in &block.patches {
                writeln!(
                    f,
                    "    patch: VA:{:x} {}",
                    patch.rva + REF_VA_BASE,
                    hex::encode_upper(&patch.bytes)
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
