//! dscextract - extract standalone dylibs from Apple's dyld shared cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dscextract::converter::StatusSink;
use dscextract::macho::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use dscextract::{
    default_output_path, extract_image_with_options, extract_image_with_sink, find_images,
    list_images, DyldContext, ExtractionOptions, ImageEntry, DEFAULT_OUTPUT_DIR,
};

/// Default locations to search for dyld shared caches on macOS.
const DEFAULT_CACHE_PATHS: &[&str] = &[
    // macOS Ventura+ (cryptex)
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    "/System/Library/dyld",
    "/var/db/dyld",
];

const CACHE_PREFIX: &str = "dyld_shared_cache_";

/// Extracts standalone dylibs from the dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "dscextract")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract images from the cache
    Extract {
        /// Image to extract (e.g. "UIKit" or a full install path); matched
        /// case-insensitively against install paths
        #[arg(short, long)]
        image: Option<String>,

        /// Extract every image whose install path contains this substring
        #[arg(short, long)]
        filter: Option<String>,

        /// Architecture to use when CACHE is a directory (substring match)
        #[arg(short, long)]
        arch: Option<String>,

        /// Output path (file for a single image, directory for --filter)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the install path below the output directory
        /// (default: true for --filter, false for a single image)
        #[arg(long)]
        preserve_paths: Option<bool>,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,

        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// List images in the cache
    List {
        /// Architecture to use when CACHE is a directory
        #[arg(short, long)]
        arch: Option<String>,

        /// Only list images whose install path contains this substring
        #[arg(short, long)]
        filter: Option<String>,

        /// Show header addresses
        #[arg(short = 'A', long)]
        addresses: bool,

        /// Show only basenames
        #[arg(short, long)]
        basenames: bool,

        /// Path to the dyld shared cache (file or directory)
        cache: Option<PathBuf>,
    },

    /// Show cache information
    Info {
        /// Architecture to use when CACHE is a directory
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the dyld shared cache (file or directory)
        cache: Option<PathBuf>,
    },

    /// List available cache architectures
    Arches {
        /// Directory holding dyld shared caches
        path: Option<PathBuf>,
    },
}

/// A main cache file found in a directory.
#[derive(Debug, Clone)]
struct CacheInfo {
    path: PathBuf,
    /// Architecture suffix of the file name (e.g. "arm64e")
    arch: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            cache,
            image,
            filter,
            arch,
            output,
            preserve_paths,
            verbosity,
            jobs,
        } => {
            let options = ExtractionOptions {
                verbosity,
                ..Default::default()
            };
            setup_logging(options.verbosity);
            let request = ExtractRequest {
                image,
                filter,
                output,
                preserve_paths,
                jobs,
            };
            cmd_extract(cache, arch, request, options)
        }
        Commands::List {
            cache,
            arch,
            filter,
            addresses,
            basenames,
        } => cmd_list(cache, arch, filter, addresses, basenames),
        Commands::Info { cache, arch } => cmd_info(cache, arch),
        Commands::Arches { path } => cmd_arches(path),
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

/// Finds the default dyld cache directory by checking known locations.
fn find_default_cache_dir() -> Result<PathBuf> {
    for path_str in DEFAULT_CACHE_PATHS {
        let path = Path::new(path_str);
        if path.is_dir() && discover_caches(path).is_ok_and(|caches| !caches.is_empty()) {
            return Ok(path.to_path_buf());
        }
    }

    bail!(
        "No dyld shared cache found in default locations:\n  {}",
        DEFAULT_CACHE_PATHS.join("\n  ")
    );
}

/// Gets the cache path, using defaults if not specified.
fn get_cache_path(cache: Option<PathBuf>) -> Result<PathBuf> {
    match cache {
        Some(path) => Ok(path),
        None => find_default_cache_dir(),
    }
}

/// Discovers the main cache files in a directory. Sub-caches (`.1`,
/// `.symbols`, ...) are skipped.
fn discover_caches(dir: &Path) -> Result<Vec<CacheInfo>> {
    if !dir.is_dir() {
        bail!("Path is not a directory: {}", dir.display());
    }

    let mut caches = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(arch) = name.strip_prefix(CACHE_PREFIX) else {
            continue;
        };
        if arch.contains('.') {
            continue;
        }
        caches.push(CacheInfo {
            arch: arch.to_string(),
            path: path.clone(),
        });
    }

    caches.sort_by(|a, b| a.arch.cmp(&b.arch));
    Ok(caches)
}

/// Resolves a cache path with an optional architecture filter.
///
/// Files are used as given; directories are scanned and must contain
/// exactly one cache matching `arch`.
fn resolve_cache_path(path: &Path, arch: Option<&str>) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        bail!("Cache path does not exist: {}", path.display());
    }

    let caches = discover_caches(path)?;
    if caches.is_empty() {
        bail!("No dyld shared caches found in: {}", path.display());
    }

    let matching: Vec<_> = caches
        .iter()
        .filter(|c| arch.map_or(true, |a| c.arch.contains(a)))
        .collect();

    match matching.as_slice() {
        [one] => Ok(one.path.clone()),
        [] => {
            let available: Vec<_> = caches.iter().map(|c| c.arch.as_str()).collect();
            bail!(
                "No cache matches architecture '{}'. Available: {}",
                arch.unwrap_or(""),
                available.join(", ")
            );
        }
        many => {
            let available: Vec<_> = many.iter().map(|c| c.arch.as_str()).collect();
            bail!(
                "Multiple caches match. Please specify --arch. Available: {}",
                available.join(", ")
            );
        }
    }
}

fn open_cache(cache: Option<PathBuf>, arch: Option<&str>) -> Result<(PathBuf, DyldContext)> {
    let cache_path = get_cache_path(cache)?;
    let resolved = resolve_cache_path(&cache_path, arch)?;
    info!("Opening cache: {}", resolved.display());
    let context = DyldContext::open(&resolved)
        .with_context(|| format!("Failed to open cache: {}", resolved.display()))?;
    Ok((resolved, context))
}

/// What `extract` was asked to produce.
struct ExtractRequest {
    image: Option<String>,
    filter: Option<String>,
    output: Option<PathBuf>,
    preserve_paths: Option<bool>,
    jobs: Option<usize>,
}

fn cmd_extract(
    cache: Option<PathBuf>,
    arch: Option<String>,
    request: ExtractRequest,
    options: ExtractionOptions,
) -> Result<()> {
    let start = Instant::now();
    let (_, cache) = open_cache(cache, arch.as_deref())?;
    let cache = Arc::new(cache);

    if let Some(name) = &request.image {
        let image = cache
            .find_image(name)
            .with_context(|| format!("Image not found: {}", name))?
            .clone();
        let output_path = request.output.unwrap_or_else(|| {
            default_output_path(&image.path, None, request.preserve_paths.unwrap_or(false))
        });

        info!("Extracting {} to {}", image.path, output_path.display());
        let warnings = extract_image_with_options(&cache, &image.path, &output_path, options)
            .with_context(|| format!("Failed to extract: {}", image.path))?;

        info!(
            "Extracted {} in {:.2}s ({} warnings)",
            image.basename(),
            start.elapsed().as_secs_f64(),
            warnings.len()
        );
        return Ok(());
    }

    let Some(filter) = &request.filter else {
        bail!("Either --image or --filter must be specified");
    };
    let images: Vec<ImageEntry> = find_images(&cache, filter).cloned().collect();
    if images.is_empty() {
        warn!("No images match '{}'", filter);
        return Ok(());
    }

    let output_dir = request
        .output
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let preserve = request.preserve_paths.unwrap_or(true);
    info!(
        "Extracting {} images to {}",
        images.len(),
        output_dir.display()
    );

    let progress = ProgressBar::new(images.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )?
            .progress_chars("#>-"),
    );
    let sink: Arc<dyn StatusSink> = Arc::new(ProgressStatus {
        bar: progress.clone(),
        show_warnings: options.verbosity > 0,
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(request.jobs.unwrap_or(0))
        .build()
        .context("Failed to build thread pool")?;

    let results: Vec<(String, Result<Vec<String>>)> = pool.install(|| {
        images
            .par_iter()
            .map(|image| {
                let output_path =
                    default_output_path(&image.path, Some(output_dir.as_path()), preserve);
                let result = extract_image_with_sink(
                    &cache,
                    &image.path,
                    &output_path,
                    options.clone(),
                    Arc::clone(&sink),
                )
                .map_err(anyhow::Error::from);
                progress.inc(1);
                (image.path.clone(), result)
            })
            .collect()
    });
    progress.finish_with_message("done");

    let mut failed = 0usize;
    let mut warned = 0usize;
    for (path, result) in &results {
        match result {
            Ok(warnings) if !warnings.is_empty() => warned += 1,
            Ok(_) => {}
            Err(err) => {
                failed += 1;
                error!("  {}: {:#}", path, err);
            }
        }
    }
    if failed > 0 {
        warn!("{} images failed to extract", failed);
    }

    info!(
        "Extracted {}/{} images in {:.2}s, {} with warnings",
        images.len() - failed,
        images.len(),
        start.elapsed().as_secs_f64(),
        warned
    );
    Ok(())
}

/// Status sink for batch extraction that reports through a progress bar.
struct ProgressStatus {
    bar: ProgressBar,
    show_warnings: bool,
}

impl StatusSink for ProgressStatus {
    fn stage(&self, image: &str, stage: &str) {
        let name = image.rsplit('/').next().unwrap_or(image);
        self.bar.set_message(format!("{}: {}", name, stage));
    }

    fn warning(&self, image: &str, message: &str) {
        if self.show_warnings {
            self.bar.println(format!("warning: {}: {}", image, message));
        }
    }
}

fn cmd_list(
    cache: Option<PathBuf>,
    arch: Option<String>,
    filter: Option<String>,
    addresses: bool,
    basenames: bool,
) -> Result<()> {
    let (_, cache) = open_cache(cache, arch.as_deref())?;

    let images: Box<dyn Iterator<Item = &ImageEntry>> = match &filter {
        Some(f) => Box::new(find_images(&cache, f)),
        None => Box::new(list_images(&cache)),
    };

    for img in images {
        let name = if basenames { img.basename() } else { &img.path };
        if addresses {
            println!("{:#018x}  {}", img.address, name);
        } else {
            println!("{}", name);
        }
    }

    Ok(())
}

fn cmd_info(cache: Option<PathBuf>, arch: Option<String>) -> Result<()> {
    let (path, cache) = open_cache(cache, arch.as_deref())?;

    println!("Dyld Shared Cache Information");
    println!("==============================");
    println!("Path:         {}", path.display());
    println!("Architecture: {}", cache.architecture());
    println!("Images:       {}", cache.image_count());
    println!("Mappings:     {}", cache.mappings.len());
    println!("Subcaches:    {}", cache.subcaches.len());
    println!("Total size:   {}", format_size(cache.total_size()));

    println!("\nMappings:");
    for (i, mapping) in cache.mappings.iter().enumerate() {
        let prot = format!(
            "{}{}{}",
            if mapping.init_prot & VM_PROT_READ != 0 { "r" } else { "-" },
            if mapping.init_prot & VM_PROT_WRITE != 0 { "w" } else { "-" },
            if mapping.init_prot & VM_PROT_EXECUTE != 0 { "x" } else { "-" },
        );
        println!(
            "  [{:2}] {:#018x} - {:#018x} ({:>8}) {} {}",
            i,
            mapping.address,
            mapping.end(),
            format_size(mapping.size),
            prot,
            if mapping.has_slide_info() { "[slide]" } else { "" }
        );
    }

    if !cache.subcaches.is_empty() {
        println!("\nSubcaches:");
        for (i, sc) in cache.subcaches.iter().enumerate() {
            println!(
                "  [{:2}] {} ({})",
                i + 1,
                sc.path.file_name().unwrap_or_default().to_string_lossy(),
                format_size(sc.mmap.len() as u64)
            );
        }
    }

    if let Some(symbols) = &cache.symbols_file {
        println!("\nSymbols file:");
        println!(
            "  {} ({})",
            symbols.path.file_name().unwrap_or_default().to_string_lossy(),
            format_size(symbols.mmap.len() as u64)
        );
    }

    Ok(())
}

fn cmd_arches(path: Option<PathBuf>) -> Result<()> {
    let cache_path = get_cache_path(path)?;
    let caches = discover_caches(&cache_path)?;

    if caches.is_empty() {
        println!("No dyld shared caches found in: {}", cache_path.display());
        return Ok(());
    }

    println!("Available architectures in {}:", cache_path.display());
    for cache in &caches {
        println!("  {} - {}", cache.arch, cache.path.display());
    }

    Ok(())
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
