//! dscextract - extracts standalone dylibs from Apple's dyld shared cache.
//!
//! The cache builder merges every system library into one shared cache and
//! rewrites them on the way in: pointers are slide-encoded, the linkedit
//! data of all images is pooled, cross-image calls go through stub islands
//! and ObjC metadata is uniqued across images. Extraction undoes each of
//! these and writes an image back out as a Mach-O that stands on its own.
//!
//! # Features
//!
//! - Memory-mapped, copy-on-write access to split caches (iOS 15+, macOS 12+)
//! - Slide info v1, v2, v3 and v5
//! - Rebuilt `__LINKEDIT` with the image's own symbols
//! - Stub and stub-island repair
//! - ObjC metadata repair
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dscextract::{DyldContext, extract_image};
//!
//! fn main() -> dscextract::Result<()> {
//!     let cache = Arc::new(DyldContext::open("/path/to/dyld_shared_cache_arm64e")?);
//!     extract_image(&cache, "UIKit", "binaries/UIKit")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arm64;
pub mod converter;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use dyld::{DyldContext, ImageEntry, MappingEntry};
pub use error::{Error, Result};
pub use macho::MachOContext;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, info_span};

use converter::{run_pipeline, write_macho, ExtractionContext, LogStatus, StatusSink};

/// Directory extracted images go to when no output path is given.
pub const DEFAULT_OUTPUT_DIR: &str = "binaries";

/// Options for image extraction.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    pub verbosity: u8,
    /// Skip slide info processing
    pub skip_slide_info: bool,
    /// Skip LINKEDIT optimization
    pub skip_linkedit: bool,
    /// Skip stub fixing
    pub skip_stubs: bool,
    /// Skip ObjC fixing
    pub skip_objc: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            verbosity: 1,
            skip_slide_info: false,
            skip_linkedit: false,
            skip_stubs: false,
            skip_objc: false,
        }
    }
}

/// Extracts a single image from the cache.
///
/// `image_name` may be an install path, a basename or a substring of an
/// install path; matching ignores case.
pub fn extract_image<P: AsRef<Path>>(
    cache: &Arc<DyldContext>,
    image_name: &str,
    output_path: P,
) -> Result<()> {
    extract_image_with_options(cache, image_name, output_path, ExtractionOptions::default())
        .map(|_| ())
}

/// Extracts a single image with custom options and returns the warnings
/// the stages reported.
pub fn extract_image_with_options<P: AsRef<Path>>(
    cache: &Arc<DyldContext>,
    image_name: &str,
    output_path: P,
    options: ExtractionOptions,
) -> Result<Vec<String>> {
    extract_image_with_sink(cache, image_name, output_path, options, Arc::new(LogStatus))
}

/// Extracts a single image, reporting progress to `status`.
///
/// Nothing is written when the image cannot be found, and a partial output
/// file is removed if writing fails.
pub fn extract_image_with_sink<P: AsRef<Path>>(
    cache: &Arc<DyldContext>,
    image_name: &str,
    output_path: P,
    options: ExtractionOptions,
    status: Arc<dyn StatusSink>,
) -> Result<Vec<String>> {
    let image = cache
        .find_image(image_name)
        .ok_or_else(|| Error::ImageNotFound {
            name: image_name.to_string(),
        })?;

    let span = info_span!("extract", image = %image.path);
    let _guard = span.enter();

    let macho = MachOContext::new(Arc::clone(cache), image.address)?;
    let mut ctx =
        ExtractionContext::new(Arc::clone(cache), macho, image.path.clone(), image.address)
            .with_status(status);

    let procedures = run_pipeline(&mut ctx, &options)?;
    write_macho(&ctx, &procedures, output_path.as_ref())?;

    info!(
        "wrote {} ({} warnings)",
        output_path.as_ref().display(),
        ctx.warnings.len()
    );
    Ok(ctx.warnings)
}

/// Lists all images in the cache.
pub fn list_images(cache: &DyldContext) -> impl Iterator<Item = &ImageEntry> {
    cache.iter_images()
}

/// Finds images whose install path contains `filter`, ignoring case.
pub fn find_images<'a>(
    cache: &'a DyldContext,
    filter: &'a str,
) -> impl Iterator<Item = &'a ImageEntry> {
    cache
        .iter_images()
        .filter(move |img| img.matches_filter(filter))
}

/// Output path for an image under `output_dir` (default `binaries/`).
///
/// With `preserve_paths` the install path is kept below the directory,
/// otherwise only the basename is used.
pub fn default_output_path(
    image_path: &str,
    output_dir: Option<&Path>,
    preserve_paths: bool,
) -> PathBuf {
    let dir = output_dir.unwrap_or(Path::new(DEFAULT_OUTPUT_DIR));
    if preserve_paths {
        dir.join(image_path.trim_start_matches('/'))
    } else {
        dir.join(image_path.rsplit('/').next().unwrap_or(image_path))
    }
}
