//! Converters for extracting images from the dyld shared cache.
//!
//! Each converter undoes one optimization the cache builder applied to an
//! image. They all operate on one [`ExtractionContext`] and run in a fixed
//! order, since each relies on the normalization done before it:
//!
//! 1. **Slide info** rebases pointers so later stages read plain addresses
//! 2. **Linkedit** rebuilds the image's own `__LINKEDIT` and publishes the
//!    symbol table
//! 3. **Stubs** regenerates stubs and retargets island calls, naming them
//!    from that symbol table
//! 4. **ObjC** points ObjC metadata back into the image
//!
//! The offset optimizer then lays out the file and the writer streams it.

mod context;
mod linkedit;
mod objc;
mod slide;
mod stub;
mod writer;

pub use context::*;
pub use linkedit::*;
pub use objc::*;
pub use slide::*;
pub use stub::*;
pub use writer::*;

use tracing::debug;

use crate::error::Result;
use crate::ExtractionOptions;

/// A converter stage.
#[derive(Clone, Copy)]
pub struct Stage {
    /// Short name used in logs
    pub name: &'static str,
    /// The converter
    pub run: fn(&mut ExtractionContext) -> Result<()>,
    /// Whether the options ask to skip this stage
    pub skipped: fn(&ExtractionOptions) -> bool,
}

/// Converter stages in the order they must run.
pub const STAGES: [Stage; 4] = [
    Stage {
        name: "slide",
        run: process_slide_info,
        skipped: |options| options.skip_slide_info,
    },
    Stage {
        name: "linkedit",
        run: optimize_linkedit,
        skipped: |options| options.skip_linkedit,
    },
    Stage {
        name: "stubs",
        run: fix_stubs,
        skipped: |options| options.skip_stubs,
    },
    Stage {
        name: "objc",
        run: fix_objc,
        skipped: |options| options.skip_objc,
    },
];

/// Runs every stage that is not skipped, then lays out the output file.
pub fn run_pipeline(
    ctx: &mut ExtractionContext,
    options: &ExtractionOptions,
) -> Result<Vec<WriteProcedure>> {
    for stage in &STAGES {
        if (stage.skipped)(options) {
            debug!("skipping {} stage", stage.name);
            continue;
        }
        (stage.run)(ctx)?;
    }
    optimize_offsets(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CacheBuilder, TEXT_SECTION_ADDR};

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = STAGES.iter().map(|s| s.name).collect();
        assert_eq!(names, ["slide", "linkedit", "stubs", "objc"]);
    }

    #[test]
    fn test_skipped_stages_do_not_run() {
        let fixture = CacheBuilder::new().build();
        let mut ctx = fixture.context();
        let options = ExtractionOptions {
            skip_linkedit: true,
            skip_stubs: true,
            ..Default::default()
        };

        run_pipeline(&mut ctx, &options).unwrap();
        assert!(ctx.symbols.is_none());
    }

    #[test]
    fn test_full_pipeline_publishes_symbols() {
        let fixture = CacheBuilder::new()
            .export_symbol("_entry", TEXT_SECTION_ADDR)
            .build();
        let mut ctx = fixture.context();

        let procedures = run_pipeline(&mut ctx, &ExtractionOptions::default()).unwrap();

        assert!(!procedures.is_empty());
        let symbols = ctx.symbols.as_ref().unwrap();
        assert!(symbols.entries.iter().any(|s| s.name == "_entry"));
    }
}
