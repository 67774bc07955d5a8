//! End-to-end driver.
//!
//! A [`Session`] loads the scope rules, derives the cache keys from the image,
//! the metadata, the rule sets and the logic epoch, and then either replays a
//! valid cache or runs a fresh scan and saves it. Whatever happens, the result
//! is a [`PatchPlan`]; a failed scan is an empty plan, never an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::{CacheLookup, CachedBlock, PatchCache};
use crate::error::Result;
use crate::filter::{
    default_filter_rules, default_pre_filter_rules, md5_upper_hex, LoadedRules, RuleSet,
    RULES_README,
};
use crate::memory::ImageView;
use crate::metadata::MethodProbe;
use crate::patch::{apply_patches, ApplyStats, CodeWriter, PatchRecord};
use crate::scanner::{self, ScanConfig, ScanStats};

use tracing::{debug, error, info, warn};

pub const PRE_FILTER_FILE: &str = "pre_filter.json";
pub const PRE_FILTER_DEFAULT_FILE: &str = "pre_filter.default.json";
pub const FILTER_FILE: &str = "filter.json";
pub const FILTER_DEFAULT_FILE: &str = "filter.default.json";
pub const README_FILE: &str = "README_filter_rules.txt";

pub const KEY_PRE_FILTER: &str = "Block Filter Pre";
pub const KEY_FILTER: &str = "Block Filter";
pub const KEY_EPOCH: &str = "Epoch";

/// Bumped whenever scan logic changes in a way that invalidates old caches.
pub const DEFAULT_EPOCH: &str = "1";

/// Configuration for a scan-and-patch session.
#[derive(Debug)]
pub struct SessionConfig {
    /// Directory holding the rule files.
    pub config_dir: PathBuf,
    /// Directory holding cache files.
    pub state_dir: PathBuf,
    /// Image file on disk, hashed for the cache key.
    pub image_path: PathBuf,
    /// Method table of the image.
    pub metadata_path: PathBuf,
    pub epoch: String,
    /// Auxiliary methods to locate; a cache is only reused when all resolved.
    pub probes: Vec<MethodProbe>,
    pub use_cache: bool,
    pub scan: ScanConfig,
}

impl SessionConfig {
    pub fn new(
        config_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        image_path: impl Into<PathBuf>,
        metadata_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            state_dir: state_dir.into(),
            image_path: image_path.into(),
            metadata_path: metadata_path.into(),
            epoch: DEFAULT_EPOCH.to_string(),
            probes: vec![MethodProbe::get_info()],
            use_cache: true,
            scan: ScanConfig::default(),
        }
    }
}

/// Pre-filter and filter, with the hashes that key the cache.
#[derive(Clone, Debug)]
pub struct Rules {
    pub pre_filter: LoadedRules,
    pub filter: LoadedRules,
}

impl Rules {
    /// Load the rule overrides from `config_dir`, rewriting the reference
    /// defaults and README next to them.
    pub fn load(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)?;
        fs::write(config_dir.join(README_FILE), RULES_README)?;

        let pre_filter = RuleSet::load_or_default(
            &config_dir.join(PRE_FILTER_FILE),
            &config_dir.join(PRE_FILTER_DEFAULT_FILE),
            &default_pre_filter_rules(),
        )?;
        let filter = RuleSet::load_or_default(
            &config_dir.join(FILTER_FILE),
            &config_dir.join(FILTER_DEFAULT_FILE),
            &default_filter_rules(),
        )?;

        info!(
            "rules: {} pre-filter ({}), {} filter ({})",
            pre_filter.rules.len(),
            if pre_filter.from_override { "override" } else { "default" },
            filter.rules.len(),
            if filter.from_override { "override" } else { "default" },
        );
        Ok(Self { pre_filter, filter })
    }
}

/// Where a plan's patches came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchSource {
    Cache,
    FreshScan,
    /// The scan failed; nothing is patched.
    Unavailable,
}

/// Patches to apply plus the fields stored beside them.
#[derive(Clone, Debug)]
pub struct PatchPlan {
    pub source: PatchSource,
    pub blocks: Vec<CachedBlock>,
    pub fields: BTreeMap<String, String>,
    /// Present for fresh scans only.
    pub scan_stats: Option<ScanStats>,
}

impl PatchPlan {
    fn unavailable() -> Self {
        Self {
            source: PatchSource::Unavailable,
            blocks: Vec::new(),
            fields: BTreeMap::new(),
            scan_stats: None,
        }
    }

    pub fn matched_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.matched).count()
    }

    pub fn matched_patches(&self) -> impl Iterator<Item = &PatchRecord> {
        self.blocks
            .iter()
            .filter(|b| b.matched)
            .flat_map(|b| b.patches.iter())
    }

    /// Resolved RVA of a probe, `None` when unknown or zero.
    pub fn probe_rva(&self, key: &str) -> Option<u64> {
        self.fields
            .get(key)
            .and_then(|v| u64::from_str_radix(v, 16).ok())
            .filter(|&rva| rva != 0)
    }
}

/// Summary of one plan-and-apply pass, built by [`Session::report`].
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub source: PatchSource,
    pub blocks: usize,
    pub matched_blocks: usize,
    pub apply: ApplyStats,
    pub probes: BTreeMap<String, Option<u64>>,
    pub scan_stats: Option<ScanStats>,
}

/// Rules and cache keys for one image.
pub struct Session {
    config: SessionConfig,
    rules: Rules,
    cache: PatchCache,
}

impl Session {
    /// Load rules and hash the inputs.
    ///
    /// Fails only when the rule directory cannot be written or the image or
    /// metadata file cannot be read.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let rules = Rules::load(&config.config_dir)?;

        let image_data = fs::read(&config.image_path)?;
        let image_key = file_key(&config.image_path, "image");
        let image_hash = md5_upper_hex(&image_data);
        let prefix = image_hash.get(..7).unwrap_or(&image_hash).to_lowercase();

        let cache_path = config.state_dir.join(format!("scan_cache_{}.txt", prefix));
        let mut cache = PatchCache::new(cache_path);
        cache.add_key(image_key, image_hash);
        cache.add_file_hash(file_key(&config.metadata_path, "metadata"), &config.metadata_path)?;
        cache.add_key(KEY_PRE_FILTER, rules.pre_filter.hash.clone());
        cache.add_key(KEY_FILTER, rules.filter.hash.clone());
        cache.add_key(KEY_EPOCH, config.epoch.clone());

        debug!("cache file {}", cache.path().display());
        Ok(Self {
            config,
            rules,
            cache,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn cache(&self) -> &PatchCache {
        &self.cache
    }

    /// Decide what to patch in `image`: a valid cache, else a fresh scan.
    pub fn plan(&self, image: &ImageView<'_>) -> PatchPlan {
        if self.config.use_cache {
            match self.cache.try_load() {
                CacheLookup::Hit(cached) => {
                    let plan = PatchPlan {
                        source: PatchSource::Cache,
                        blocks: cached.blocks,
                        fields: cached.fields,
                        scan_stats: None,
                    };
                    if self.probes_resolved(&plan) {
                        info!("cache hit, patching with cache");
                        return plan;
                    }
                    info!("cache hit without resolved probes, rescanning");
                }
                CacheLookup::Miss(reason) => info!("cache miss: {}", reason),
            }
        }

        info!("start scanning clamping codes");
        let result = match scanner::scan(
            image,
            &self.config.metadata_path,
            &self.rules.pre_filter.rules,
            &self.rules.filter.rules,
            &self.config.probes,
            &self.config.scan,
        ) {
            Ok(result) => result,
            Err(e) => {
                error!("scan failed, nothing will be patched: {}", e);
                return PatchPlan::unavailable();
            }
        };

        let plan = PatchPlan {
            source: PatchSource::FreshScan,
            blocks: result
                .blocks
                .iter()
                .map(|(rva, info)| CachedBlock::from_patch_info(*rva, info))
                .collect(),
            fields: result
                .probes
                .iter()
                .map(|(key, rva)| (key.clone(), format!("{:x}", rva)))
                .collect(),
            scan_stats: Some(result.stats),
        };

        if let Err(e) = self.cache.save(&plan.fields, &plan.blocks) {
            warn!("failed to save {}: {}", self.cache.path().display(), e);
        }
        plan
    }

    fn probes_resolved(&self, plan: &PatchPlan) -> bool {
        self.config
            .probes
            .iter()
            .all(|probe| plan.probe_rva(&probe.key).is_some())
    }

    /// Apply the matched patches of `plan` to the image at `image_base`.
    pub fn apply<W: CodeWriter + ?Sized>(
        &self,
        plan: &PatchPlan,
        writer: &mut W,
        image_base: u64,
        image_size: usize,
    ) -> ApplyStats {
        let stats = apply_patches(writer, image_base, image_size, plan.matched_patches());
        info!(
            "included patch set count {}/{}, {} patches applied, {} skipped",
            plan.matched_blocks(),
            plan.blocks.len(),
            stats.applied,
            stats.skipped
        );
        stats
    }

    /// Summarize a plan and its apply pass.
    pub fn report(&self, plan: &PatchPlan, apply: ApplyStats) -> SessionReport {
        SessionReport {
            source: plan.source,
            blocks: plan.blocks.len(),
            matched_blocks: plan.matched_blocks(),
            apply,
            probes: self
                .config
                .probes
                .iter()
                .map(|p| (p.key.clone(), plan.probe_rva(&p.key)))
                .collect(),
            scan_stats: plan.scan_stats.clone(),
        }
    }
}

/// Cache key name for an input file: its file name, or `fallback`.
fn file_key(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

/// Scan and patch a module of the current process.
///
/// The module file named by `config.image_path` must be the one loaded as
/// `module_name`; it is only read for hashing.
#[cfg(target_os = "windows")]
pub fn run_in_process(module_name: &str, config: SessionConfig) -> Result<SessionReport> {
    use crate::memory::module_range;
    use crate::patch::ProcessWriter;

    let (base, size) = module_range(module_name)?;
    let session = Session::open(config)?;

    let plan = {
        // SAFETY: the module stays loaded while the host holds it; nothing
        // writes to it until the view is dropped.
        let view = unsafe { ImageView::from_raw(base, size) };
        session.plan(&view)
    };

    // SAFETY: patches target the module's own code, which has not run yet.
    let mut writer = unsafe { ProcessWriter::new() };
    let apply = session.apply(&plan, &mut writer, base as u64, size);
    Ok(session.report(&plan, apply))
}

#[cfg(not(target_os = "windows"))]
pub fn run_in_process(_module_name: &str, _config: SessionConfig) -> Result<SessionReport> {
    Err(crate::error::Error::Unsupported("in-process patching"))
}
