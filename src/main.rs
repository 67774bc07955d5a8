//! unclamp CLI - offline clamp scanning and patching of PE images.
//!
//! The `scan` command maps an image from disk, scans it against its method
//! table and rule files, and optionally writes a patched copy. Scan results
//! are cached in the state directory exactly as an in-process run would.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use unclamp::patch::BufferWriter;
use unclamp::session::{Rules, DEFAULT_EPOCH};
use unclamp::{
    MappedImage, PatchSource, ScanProgress, ScanStage, Session, SessionConfig, SessionReport,
};

/// Finds and neutralizes compiled float clamps in x86-64 images.
#[derive(Parser)]
#[command(name = "unclamp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan an image and apply in-scope patches
    Scan {
        /// PE image to scan
        #[arg(short, long)]
        image: PathBuf,

        /// Method table of the image (JSON)
        #[arg(short, long)]
        metadata: PathBuf,

        /// Directory holding the rule files
        #[arg(short, long, default_value = "config")]
        config_dir: PathBuf,

        /// Directory holding scan caches
        #[arg(short, long, default_value = "state")]
        state_dir: PathBuf,

        /// Write the patched image here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Logic epoch stored in the cache keys
        #[arg(long, default_value = DEFAULT_EPOCH)]
        epoch: String,

        /// Deepest sub-function level to walk
        #[arg(long, default_value = "2")]
        max_sub_depth: usize,

        /// Ignore any existing cache
        #[arg(long)]
        no_cache: bool,

        /// Report patches without applying them
        #[arg(long)]
        dry_run: bool,
    },

    /// Write the default rule files and show which rules are in effect
    Rules {
        /// Directory holding the rule files
        #[arg(short, long, default_value = "config")]
        config_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            image,
            metadata,
            config_dir,
            state_dir,
            output,
            epoch,
            max_sub_depth,
            no_cache,
            dry_run,
        } => {
            let mut config = SessionConfig::new(config_dir, state_dir, &image, metadata);
            config.epoch = epoch;
            config.use_cache = !no_cache;
            config.scan.max_sub_depth = max_sub_depth;

            scan_image(&image, output.as_deref(), config, dry_run)?;
        }

        Commands::Rules { config_dir } => {
            show_rules(&config_dir)?;
        }
    }

    Ok(())
}

fn scan_image(
    image: &Path,
    output: Option<&Path>,
    mut config: SessionConfig,
    dry_run: bool,
) -> anyhow::Result<()> {
    let file = fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    println!("Image: {} ({})", image.display(), ByteSize::b(file.len() as u64));

    let mut mapped = MappedImage::map(&file)?;
    let base = mapped.image_base();
    let size = mapped.bytes().len();
    println!(
        "Mapped at 0x{:X}, {} in {} sections",
        base,
        ByteSize::b(size as u64),
        mapped.headers().sections.len()
    );

    // Create progress bar
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    config.scan.progress_callback = Some(Box::new(move |info: &ScanProgress| {
        let pct = if info.total > 0 {
            (info.current as f64 / info.total as f64 * 100.0) as u64
        } else {
            0
        };

        let msg = match info.stage {
            ScanStage::WalkingMethods | ScanStage::WalkingSubFunctions => format!(
                "{} - {}/{} ({} blocks)",
                info.stage.name(),
                info.current,
                info.total,
                info.blocks_found
            ),
            ScanStage::Complete => {
                format!("{} - {} blocks", info.stage.name(), info.blocks_found)
            }
            _ => info.stage.name().to_string(),
        };

        pb_clone.set_position(pct);
        pb_clone.set_message(msg);
    }));

    let session = Session::open(config)?;
    let plan = session.plan(&mapped.view());
    pb.finish_and_clear();

    if dry_run {
        for block in plan.blocks.iter().filter(|b| b.matched) {
            println!("block RVA 0x{:X}", block.rva);
            for path in &block.paths {
                println!("  {}", path);
            }
            for patch in &block.patches {
                println!("    RVA 0x{:X}: {}", patch.rva, hex::encode_upper(&patch.bytes));
            }
        }
        print_report(&session.report(&plan, Default::default()));
        return Ok(());
    }

    let apply = session.apply(
        &plan,
        &mut BufferWriter::new(base, mapped.bytes_mut()),
        base,
        size,
    );
    print_report(&session.report(&plan, apply));

    if let Some(output) = output {
        let mut patched = file.clone();
        let changed = mapped.write_back(&mut patched)?;
        fs::write(output, &patched).with_context(|| format!("writing {}", output.display()))?;
        println!("\nWrote {} ({} bytes changed)", output.display(), changed);
    }

    Ok(())
}

fn print_report(report: &SessionReport) {
    let source = match report.source {
        PatchSource::Cache => "cache",
        PatchSource::FreshScan => "fresh scan",
        PatchSource::Unavailable => "unavailable (scan failed)",
    };

    println!("Source:         {}", source);
    println!("Patch sets:     {}/{} in scope", report.matched_blocks, report.blocks);
    println!(
        "Patches:        {} applied, {} skipped",
        report.apply.applied, report.apply.skipped
    );

    if let Some(stats) = &report.scan_stats {
        println!(
            "Roots:          {} walked, {} skipped of {}",
            stats.roots_walked, stats.roots_skipped, stats.roots_total
        );
        println!("Sub-functions:  {} walked", stats.sub_walks);
        println!(
            "Blocks:         {} examined, {} candidates",
            stats.blocks_examined, stats.candidate_blocks
        );
        if stats.patches_dropped > 0 {
            println!("Dropped:        {} patches did not fit", stats.patches_dropped);
        }
    }

    for (key, rva) in &report.probes {
        match rva {
            Some(rva) => println!("Probe:          {} at RVA 0x{:X}", key, rva),
            None => println!("Probe:          {} not found", key),
        }
    }
}

fn show_rules(config_dir: &Path) -> anyhow::Result<()> {
    let rules = Rules::load(config_dir)?;

    for (name, loaded) in [("Pre-filter", &rules.pre_filter), ("Filter", &rules.filter)] {
        println!(
            "{:<11} {:>3} rules, {} (MD5 {})",
            name,
            loaded.rules.len(),
            if loaded.from_override { "override" } else { "default" },
            loaded.hash
        );
    }
    println!("Defaults written to {}", config_dir.display());

    Ok(())
}
