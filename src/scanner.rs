//! Scan orchestration.
//!
//! Every declared method that passes the pre-filter becomes an exploration
//! root. Patch-bearing blocks are keyed by RVA; each way a block is reached
//! adds one [`BlockPath`] to it. Undeclared call targets are walked as
//! sub-function roots, breadth-first, down to [`ScanConfig::max_sub_depth`].
//! A root walked once is never explored again: later visits replay its
//! recorded block and sub-function segments under the new parent path.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::clamp::{BranchRewrite, ClampMatcher, DEFAULT_MATCH_WINDOW};
use crate::error::Result;
use crate::block::CodeBlock;
use crate::explorer::Explorer;
use crate::filter::RuleSet;
use crate::memory::ImageView;
use crate::metadata::{MethodProbe, MethodTable};
use crate::patch::PatchRecord;
use crate::path::{BlockPath, PathSegment};

use tracing::{debug, info, warn};

/// Stage of a scan, for progress reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStage {
    LoadingMetadata,
    WalkingMethods,
    WalkingSubFunctions,
    Filtering,
    Complete,
}

impl ScanStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadingMetadata => "Loading metadata",
            Self::WalkingMethods => "Walking declared methods",
            Self::WalkingSubFunctions => "Walking sub-functions",
            Self::Filtering => "Filtering patch sites",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a scan.
#[derive(Clone, Debug)]
pub struct ScanProgress {
    pub stage: ScanStage,
    /// Roots or queue entries processed in this stage.
    pub current: usize,
    /// Total for this stage, if known.
    pub total: usize,
    /// Patch-bearing blocks found so far.
    pub blocks_found: usize,
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ScanProgress) + Send + Sync>;

/// Configuration for a scan.
pub struct ScanConfig {
    /// Deepest sub-function level that is still walked.
    pub max_sub_depth: usize,
    /// Step limit of each forward search in the clamp matcher.
    pub match_window: usize,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanConfig")
            .field("max_sub_depth", &self.max_sub_depth)
            .field("match_window", &self.match_window)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_sub_depth: 2,
            match_window: DEFAULT_MATCH_WINDOW,
            progress_callback: None,
        }
    }
}

/// Counters collected during a scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub roots_total: usize,
    pub roots_skipped: usize,
    pub roots_walked: usize,
    pub sub_walks: usize,
    pub blocks_examined: usize,
    pub candidate_blocks: usize,
    pub patch_sites: usize,
    pub patches_dropped: usize,
    pub matched_blocks: usize,
}

/// Patches of one block and every path that reaches it.
#[derive(Clone, Debug, Default)]
pub struct BlockPatchInfo {
    pub patches: Vec<PatchRecord>,
    pub paths: Vec<BlockPath>,
    /// Filter verdict; only matched blocks are applied.
    pub matched: bool,
}

/// Outcome of a fresh scan.
#[derive(Clone, Debug, Default)]
pub struct ScanResult {
    /// Patch-bearing blocks by block RVA.
    pub blocks: BTreeMap<u64, BlockPatchInfo>,
    /// Resolved probe RVAs by probe key, 0 when not found.
    pub probes: BTreeMap<String, u64>,
    pub stats: ScanStats,
}

impl ScanResult {
    /// Patches of every matched block.
    pub fn matched_patches(&self) -> impl Iterator<Item = &PatchRecord> {
        self.blocks
            .values()
            .filter(|b| b.matched)
            .flat_map(|b| b.patches.iter())
    }
}

/// Load the method table at `metadata_path` and scan `image`.
///
/// Only an unreadable or malformed method table is an error.
pub fn scan(
    image: &ImageView<'_>,
    metadata_path: &Path,
    pre_filter: &RuleSet,
    filter: &RuleSet,
    probes: &[MethodProbe],
    config: &ScanConfig,
) -> Result<ScanResult> {
    report(
        config,
        &ScanProgress {
            stage: ScanStage::LoadingMetadata,
            current: 0,
            total: 0,
            blocks_found: 0,
        },
    );
    let methods = MethodTable::load(metadata_path)?;
    Ok(scan_methods(image, &methods, pre_filter, filter, probes, config))
}

/// Scan `image` with an already loaded method table.
pub fn scan_methods(
    image: &ImageView<'_>,
    methods: &MethodTable,
    pre_filter: &RuleSet,
    filter: &RuleSet,
    probes: &[MethodProbe],
    config: &ScanConfig,
) -> ScanResult {
    info!(
        "scanning {} method addresses in image at 0x{:X} ({} bytes)",
        methods.len(),
        image.base(),
        image.size()
    );

    let probes = probes
        .iter()
        .map(|probe| {
            let rva = methods.find(probe).unwrap_or(0);
            if rva == 0 {
                warn!("RVA of {} not found", probe.key);
            }
            (probe.key.clone(), rva)
        })
        .collect();

    let (mut blocks, mut stats) = Scanner::new(image, methods, config).run(pre_filter);

    report(
        config,
        &ScanProgress {
            stage: ScanStage::Filtering,
            current: 0,
            total: blocks.len(),
            blocks_found: blocks.len(),
        },
    );
    for info in blocks.values_mut() {
        info.matched = filter.is_in_scope(&info.paths);
        stats.patch_sites += info.patches.len();
        if info.matched {
            stats.matched_blocks += 1;
        }
    }

    info!(
        "included patch set count {}/{} ({} roots walked, {} skipped, {} sub-function walks)",
        stats.matched_blocks,
        blocks.len(),
        stats.roots_walked,
        stats.roots_skipped,
        stats.sub_walks
    );
    report(
        config,
        &ScanProgress {
            stage: ScanStage::Complete,
            current: blocks.len(),
            total: blocks.len(),
            blocks_found: blocks.len(),
        },
    );

    ScanResult {
        blocks,
        probes,
        stats,
    }
}

fn report(config: &ScanConfig, progress: &ScanProgress) {
    if let Some(ref cb) = config.progress_callback {
        cb(progress);
    }
}

/// What one root contributed, replayed when the root is reached again.
#[derive(Default)]
struct RootRecord {
    blocks: Vec<(u64, PathSegment)>,
    subs: Vec<(u64, PathSegment)>,
}

/// Scan-scoped state: everything here lives for one scan only.
struct Scanner<'a> {
    image: &'a ImageView<'a>,
    methods: &'a MethodTable,
    config: &'a ScanConfig,
    explorer: Explorer<'a>,
    matcher: ClampMatcher<'a>,
    blocks: BTreeMap<u64, BlockPatchInfo>,
    /// Candidate blocks that yielded no patch, by RVA.
    barren: HashSet<u64>,
    roots: HashMap<u64, RootRecord>,
    pending: VecDeque<(u64, BlockPath, usize)>,
    stats: ScanStats,
}

impl<'a> Scanner<'a> {
    fn new(image: &'a ImageView<'a>, methods: &'a MethodTable, config: &'a ScanConfig) -> Self {
        Self {
            image,
            methods,
            config,
            explorer: Explorer::new(image),
            matcher: ClampMatcher::with_window(image, config.match_window),
            blocks: BTreeMap::new(),
            barren: HashSet::new(),
            roots: HashMap::new(),
            pending: VecDeque::new(),
            stats: ScanStats::default(),
        }
    }

    fn run(mut self, pre_filter: &RuleSet) -> (BTreeMap<u64, BlockPatchInfo>, ScanStats) {
        let methods = self.methods;
        let total = methods.len();
        self.stats.roots_total = total;

        for (i, (rva, list)) in methods.iter().enumerate() {
            if i % 1024 == 0 {
                self.report(ScanStage::WalkingMethods, i, total);
            }

            let path = BlockPath::root(list.clone());
            if !pre_filter.is_in_scope([&path]) {
                self.stats.roots_skipped += 1;
                continue;
            }

            let va = self.image.base().checked_add(rva);
            let Some(va) = va.filter(|&va| self.image.contains(va)) else {
                warn!("method RVA 0x{:X} lies outside the image, skipped", rva);
                continue;
            };

            self.stats.roots_walked += 1;
            self.walk(va, path, 0);
        }

        let mut processed = 0;
        while let Some((va, path, depth)) = self.pending.pop_front() {
            if processed % 1024 == 0 {
                self.report(
                    ScanStage::WalkingSubFunctions,
                    processed,
                    processed + self.pending.len() + 1,
                );
            }
            processed += 1;

            if depth > self.config.max_sub_depth {
                continue;
            }
            self.stats.sub_walks += 1;
            self.walk(va, path, depth);
        }

        (self.blocks, self.stats)
    }

    fn report(&self, stage: ScanStage, current: usize, total: usize) {
        report(
            self.config,
            &ScanProgress {
                stage,
                current,
                total,
                blocks_found: self.blocks.len(),
            },
        );
    }

    fn walk(&mut self, va: u64, parent: BlockPath, depth: usize) {
        if let Some(record) = self.roots.get(&va) {
            for (rva, segment) in &record.blocks {
                if let Some(info) = self.blocks.get_mut(rva) {
                    info.paths.push(parent.with(segment.clone()));
                }
            }
            for (target, segment) in &record.subs {
                self.pending
                    .push_back((*target, parent.with(segment.clone()), depth + 1));
            }
            return;
        }

        let index = self.explorer.explore(va);
        let mut record = RootRecord::default();

        for block in index.blocks() {
            self.stats.blocks_examined += 1;
            let Some(rva) = self.image.rva(block.start()) else {
                continue;
            };

            if !self.blocks.contains_key(&rva) && !self.register_site(rva, block) {
                continue;
            }

            let position = record.blocks.len();
            let segment = if block.start() == va {
                PathSegment::EntryBlock { index: position }
            } else {
                PathSegment::SubBlock {
                    index: position,
                    methods: self.methods.get(rva).cloned(),
                }
            };

            if let Some(info) = self.blocks.get_mut(&rva) {
                info.paths.push(parent.with(segment.clone()));
            }
            record.blocks.push((rva, segment));
        }

        for &target in index.call_targets() {
            if self.image.rva(target).is_some_and(|rva| self.methods.contains(rva)) {
                continue;
            }
            let segment = PathSegment::SubFunction {
                index: record.subs.len(),
            };
            self.pending
                .push_back((target, parent.with(segment.clone()), depth + 1));
            record.subs.push((target, segment));
        }

        self.roots.insert(va, record);
    }

    /// Match and encode a block not seen before. A candidate that yields no
    /// patch is remembered, so other roots reaching it skip it.
    fn register_site(&mut self, rva: u64, block: &CodeBlock) -> bool {
        if self.barren.contains(&rva) || !self.matcher.has_candidate(block) {
            return false;
        }
        self.stats.candidate_blocks += 1;

        let rewrites = self.matcher.find_rewrites(block);
        self.insert_site(rva, &rewrites)
    }

    fn insert_site(&mut self, rva: u64, rewrites: &[BranchRewrite]) -> bool {
        let patches = self.encode(rewrites);
        if patches.is_empty() {
            self.barren.insert(rva);
            return false;
        }

        debug!("clamp at block RVA 0x{:X}, {} patches", rva, patches.len());
        self.blocks.insert(
            rva,
            BlockPatchInfo {
                patches,
                ..Default::default()
            },
        );
        true
    }

    fn encode(&mut self, rewrites: &[BranchRewrite]) -> Vec<PatchRecord> {
        let mut patches = Vec::with_capacity(rewrites.len());
        for rewrite in rewrites {
            match PatchRecord::encode(rewrite, self.image.base()) {
                Ok(patch) => patches.push(patch),
                Err(e) => {
                    warn!("dropping patch: {}", e);
                    self.stats.patches_dropped += 1;
                }
            }
        }
        patches
    }
}
