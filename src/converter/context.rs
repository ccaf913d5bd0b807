//! Extraction context that holds state during the conversion process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::dyld::{DyldContext, PointerAuth};
use crate::error::{Error, Result};
use crate::macho::{MachOContext, Nlist64, INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};
use crate::util::align_up;

/// Extra segment name for ObjC data that needs to be pulled into the image.
pub const EXTRA_SEGMENT_NAME: &str = "__EXTRA_OBJC";

// =============================================================================
// Status Sink
// =============================================================================

/// Receives progress notifications from the pipeline.
pub trait StatusSink: Send + Sync {
    /// A pipeline stage started for `image`.
    fn stage(&self, image: &str, stage: &str);

    /// A recoverable problem was found in `image`.
    fn warning(&self, image: &str, message: &str);
}

/// Status sink that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn stage(&self, image: &str, stage: &str) {
        info!("{}: {}", image, stage);
    }

    fn warning(&self, image: &str, message: &str) {
        warn!("{}: {}", image, message);
    }
}

// =============================================================================
// Symbol Table
// =============================================================================

/// One entry of the rebuilt symbol table.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    /// Symbol name
    pub name: String,
    /// The nlist as written to the new string table
    pub nlist: Nlist64,
}

/// The standalone symbol table produced by the linkedit converter.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    /// Symbols in output order
    pub entries: Vec<SymbolEntry>,
    /// Indirect symbol table, indexing `entries`
    pub indirect: Vec<u32>,
}

impl SymbolTable {
    /// Returns the name of the symbol at `index`.
    pub fn name(&self, index: u32) -> Option<&str> {
        self.entries.get(index as usize).map(|e| e.name.as_str())
    }

    /// Returns the symbol named by indirect entry `index`.
    ///
    /// Local and absolute entries name nothing.
    pub fn indirect_name(&self, index: usize) -> Option<&str> {
        let sym = *self.indirect.get(index)?;
        if sym & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
            return None;
        }
        self.name(sym)
    }
}

// =============================================================================
// Extra Segment
// =============================================================================

/// Bytes destined for the `__EXTRA_OBJC` segment.
///
/// The load command is reserved with a zero size before anything is
/// allocated; [`ExtractionContext::finish_extra_segment`] sizes it and moves
/// the bytes into the image view.
#[derive(Debug, Clone)]
pub struct ExtraSegment {
    /// Virtual address of the segment
    pub vmaddr: u64,
    /// Offset of the reserved segment command from the header
    pub command_offset: usize,
    data: Vec<u8>,
}

impl ExtraSegment {
    /// Creates an empty segment at `vmaddr`.
    pub fn new(vmaddr: u64, command_offset: usize) -> Self {
        Self {
            vmaddr,
            command_offset,
            data: Vec::new(),
        }
    }

    /// Appends `bytes` at the given alignment and returns their address.
    pub fn alloc(&mut self, bytes: &[u8], align: usize) -> u64 {
        let start = align_up(self.data.len() as u64, align as u64) as usize;
        self.data.resize(start, 0);
        self.data.extend_from_slice(bytes);
        self.vmaddr + start as u64
    }

    /// Overwrites previously allocated bytes at `addr`.
    pub fn patch(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let start = addr
            .checked_sub(self.vmaddr)
            .map(|off| off as usize)
            .filter(|&off| off + bytes.len() <= self.data.len())
            .ok_or(Error::out_of_bounds(addr, bytes.len()))?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Returns the bytes allocated so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns true if nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// Extraction Context
// =============================================================================

/// Context for the extraction process.
///
/// This holds all state needed during the multi-step extraction process:
/// the shared cache, the image view being rewritten, and what earlier
/// stages hand to later ones.
pub struct ExtractionContext {
    /// Reference to the dyld cache
    pub cache: Arc<DyldContext>,
    /// The Mach-O being extracted and modified
    pub macho: MachOContext,
    /// Path of the image being extracted
    pub image_path: String,
    /// Image address in the cache
    pub image_address: u64,
    /// Symbol table published by the linkedit converter
    pub symbols: Option<SymbolTable>,
    /// Pointer authentication metadata, keyed by slot address
    pub auth_pointers: BTreeMap<u64, PointerAuth>,
    /// Extra segment for ObjC data pulled into the image
    pub extra: Option<ExtraSegment>,
    /// Whether indirect symbols were redacted
    pub has_redacted_indirect: bool,
    /// Warnings emitted so far
    pub warnings: Vec<String>,
    status: Arc<dyn StatusSink>,
}

impl fmt::Debug for ExtractionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionContext")
            .field("image_path", &self.image_path)
            .field("image_address", &format_args!("{:#x}", self.image_address))
            .field("macho", &self.macho)
            .field("auth_pointers", &self.auth_pointers.len())
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

impl ExtractionContext {
    /// Creates a new extraction context for the given image.
    pub fn new(
        cache: Arc<DyldContext>,
        macho: MachOContext,
        image_path: String,
        image_address: u64,
    ) -> Self {
        Self {
            cache,
            macho,
            image_path,
            image_address,
            symbols: None,
            auth_pointers: BTreeMap::new(),
            extra: None,
            has_redacted_indirect: false,
            warnings: Vec::new(),
            status: Arc::new(LogStatus),
        }
    }

    /// Replaces the status sink.
    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    /// Returns true if the image is ARM64e (pointer authentication).
    pub fn is_arm64e(&self) -> bool {
        self.macho.is_arm64e()
    }

    /// Returns the basename of the image path.
    pub fn image_name(&self) -> &str {
        self.image_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.image_path)
    }

    /// Reports the start of a pipeline stage.
    pub fn stage(&self, stage: &str) {
        self.status.stage(self.image_name(), stage);
    }

    /// Records a recoverable problem.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.status.warning(self.image_name(), &message);
        self.warnings.push(message);
    }

    /// Authentication metadata of the pointer stored in `slot`.
    ///
    /// Image slots answer from what the slide pass recorded; slots elsewhere
    /// in the cache are decoded from their mapping's slide info.
    pub fn pointer_auth(&self, slot: u64) -> Option<PointerAuth> {
        if let Some(&auth) = self.auth_pointers.get(&slot) {
            return Some(auth);
        }
        if self.macho.contains_addr(slot) {
            return None;
        }
        self.cache.read_pointer_auth(slot).ok().flatten()
    }

    /// Stores `value` in an image pointer slot. Metadata recorded for the
    /// slot stays attached to it.
    pub fn write_pointer(&mut self, slot: u64, value: u64) -> Result<()> {
        self.macho.write_u64(slot, value)
    }

    /// Gives `slot` the authentication metadata of the pointer in `source`.
    pub fn copy_pointer_auth(&mut self, source: u64, slot: u64) {
        match self.pointer_auth(source) {
            Some(auth) => {
                self.auth_pointers.insert(slot, auth);
            }
            None => {
                self.auth_pointers.remove(&slot);
            }
        }
    }

    /// Appends `data` to the end of `__LINKEDIT` and returns its file offset.
    ///
    /// The segment grows to fit; the data is 8-byte aligned.
    pub fn append_linkedit(&mut self, data: &[u8]) -> Result<u32> {
        let linkedit = self
            .macho
            .segment("__LINKEDIT")
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?
            .command;

        let start = align_up(linkedit.filesize, 8);
        let new_filesize = align_up(start + data.len() as u64, 8);
        self.macho.rewrite_segment("__LINKEDIT", |seg| {
            seg.filesize = new_filesize;
            seg.vmsize = seg.vmsize.max(align_up(new_filesize, 0x1000));
        })?;

        let addr = linkedit.vmaddr + start;
        let mut padded = data.to_vec();
        padded.resize((new_filesize - start) as usize, 0);
        self.macho.write_bytes(addr, &padded)?;

        Ok((linkedit.fileoff + start) as u32)
    }

    /// Sizes the reserved extra segment and moves its bytes into the view.
    ///
    /// An unused reservation is removed again.
    pub fn finish_extra_segment(&mut self) -> Result<()> {
        let Some(extra) = self.extra.take() else {
            return Ok(());
        };

        if extra.is_empty() {
            return self.macho.remove_load_command(extra.command_offset);
        }

        let size = align_up(extra.data().len() as u64, 0x4000);
        self.macho.rewrite_segment(EXTRA_SEGMENT_NAME, |seg| {
            seg.vmsize = size;
            seg.filesize = size;
        })?;
        self.macho.claim_zeroed(extra.vmaddr, size)?;
        self.macho.write_bytes(extra.vmaddr, extra.data())?;
        Ok(())
    }
}

// =============================================================================
// Write Procedures
// =============================================================================

/// Write procedure for assembling the final output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProcedure {
    /// Offset in the output file
    pub write_offset: u64,
    /// Offset in the source: a file offset for cache data, a virtual
    /// address for view pages, unused for zero fill
    pub read_offset: u64,
    /// Number of bytes to copy
    pub size: u64,
    /// Where the bytes come from
    pub source: WriteSource,
}

/// Source of data for a write procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// Untouched bytes in a cache file
    Cache { subcache_index: usize },
    /// Pages the pipeline rewrote
    Page,
    /// Zero fill
    Zero,
}

impl WriteProcedure {
    /// Creates a write procedure from the cache.
    pub fn from_cache(
        write_offset: u64,
        read_offset: u64,
        size: u64,
        subcache_index: usize,
    ) -> Self {
        Self {
            write_offset,
            read_offset,
            size,
            source: WriteSource::Cache { subcache_index },
        }
    }

    /// Creates a write procedure from rewritten pages at `addr`.
    pub fn from_page(write_offset: u64, addr: u64, size: u64) -> Self {
        Self {
            write_offset,
            read_offset: addr,
            size,
            source: WriteSource::Page,
        }
    }

    /// Creates a zero-fill write procedure.
    pub fn zero(write_offset: u64, size: u64) -> Self {
        Self {
            write_offset,
            read_offset: 0,
            size,
            source: WriteSource::Zero,
        }
    }

    /// Exclusive end offset in the output file.
    pub fn write_end(&self) -> u64 {
        self.write_offset + self.size
    }

    /// Extends `self` with `next` if it continues the same source run.
    pub fn try_merge(&mut self, next: &WriteProcedure) -> bool {
        if self.source != next.source || self.write_end() != next.write_offset {
            return false;
        }
        if self.source != WriteSource::Zero && self.read_offset + self.size != next.read_offset {
            return false;
        }
        self.size += next.size;
        true
    }
}
