//! dscextract - extract dylibs from Apple's dyld shared cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dscextract::cache::DyldCache;
use dscextract::extract::{
    resolve_cache_path, CacheReader, ExtractOutcome, ExtractionOrchestrator, ExtractionRequest,
    ImageHandle, LogObserver, ProgressObserver,
};

/// Extract dylibs from a dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "dscextract")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, global = true, default_value = "1")]
    verbosity: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract one or more images from the cache
    Extract {
        /// Path to the dyld shared cache file
        cache: PathBuf,

        /// Images to extract (path or basename)
        images: Vec<String>,

        /// Extract ALL images, preserving the cache-internal hierarchy
        #[arg(short, long)]
        all: bool,

        /// Overwrite existing extracted files
        #[arg(long)]
        force: bool,

        /// Apply slide info to extracted files
        #[arg(long)]
        slide: bool,

        /// Output directory (defaults to the cache file's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the images in the cache
    List {
        /// Path to the dyld shared cache file
        cache: PathBuf,

        /// Filter images by substring match
        #[arg(short, long)]
        filter: Option<String>,

        /// Show header addresses
        #[arg(short = 'A', long)]
        addresses: bool,

        /// Show only basenames
        #[arg(short, long)]
        basenames: bool,
    },

    /// Show cache information
    Info {
        /// Path to the dyld shared cache file
        cache: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Extract {
            cache,
            images,
            all,
            force,
            slide,
            output,
        } => cmd_extract(ExtractionRequest {
            cache_path: cache,
            images,
            all,
            force,
            slide,
            output,
        }),
        Commands::List {
            cache,
            filter,
            addresses,
            basenames,
        } => cmd_list(&cache, filter.as_deref(), addresses, basenames),
        Commands::Info { cache } => cmd_info(&cache),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Progress bar observer for bulk extraction.
struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl ProgressObserver for BarObserver {
    fn image_completed(&self, _image: &ImageHandle, _outcome: &ExtractOutcome) {
        self.bar.inc(1);
    }

    fn finished(&self) {
        self.bar.finish_with_message("done");
    }
}

fn open_cache(path: &Path) -> Result<DyldCache> {
    DyldCache::open(path).with_context(|| format!("failed to open cache: {}", path.display()))
}

fn cmd_extract(request: ExtractionRequest) -> Result<()> {
    request.validate()?;

    let cache_path = resolve_cache_path(&request.cache_path)?;
    let output_dir = match &request.output {
        Some(dir) => dir.clone(),
        None => cache_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf(),
    };

    info!("Opening cache: {}", cache_path.display());
    let cache = open_cache(&cache_path)?;

    let orchestrator = ExtractionOrchestrator::new(&cache, &request, output_dir);

    let summary = if request.all {
        info!("Extracting all dylibs from {}", cache_path.display());
        let observer = BarObserver::new(cache.image_count() as u64);
        orchestrator.run(&observer)?
    } else {
        orchestrator.run(&LogObserver)?
    };

    info!(
        "Extracted {} image(s), {} skipped",
        summary.created, summary.skipped
    );
    Ok(())
}

fn cmd_list(
    cache_path: &Path,
    filter: Option<&str>,
    addresses: bool,
    basenames: bool,
) -> Result<()> {
    let cache = open_cache(&resolve_cache_path(cache_path)?)?;

    for img in cache.list_images() {
        if let Some(f) = filter {
            if !img.matches_filter(f) {
                continue;
            }
        }

        let name = if basenames { img.basename() } else { &img.path };

        if addresses {
            println!("{:#018x}  {}", img.address, name);
        } else {
            println!("{}", name);
        }
    }

    Ok(())
}

fn cmd_info(cache_path: &Path) -> Result<()> {
    let cache = open_cache(&resolve_cache_path(cache_path)?)?;

    println!("Dyld Shared Cache Information");
    println!("==============================");
    println!("Path:         {}", cache.path().display());
    println!("Architecture: {}", cache.architecture());
    println!("Images:       {}", cache.image_count());
    println!("Mappings:     {}", cache.mappings().len());
    println!("Page size:    {:#x}", cache.page_size());

    println!("\nMappings:");
    for (i, mapping) in cache.mappings().iter().enumerate() {
        let prot = format!(
            "{}{}{}",
            if mapping.is_readable() { "r" } else { "-" },
            if mapping.is_writable() { "w" } else { "-" },
            if mapping.is_executable() { "x" } else { "-" },
        );
        println!(
            "  [{:2}] {:#018x} - {:#018x} {} {}",
            i,
            mapping.address,
            mapping.address + mapping.size,
            prot,
            if mapping.has_slide_info() {
                "[slide]"
            } else {
                ""
            }
        );
    }

    Ok(())
}
