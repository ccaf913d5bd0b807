//! LINKEDIT segment optimizer.
//!
//! In the dyld shared cache, the LINKEDIT segment is merged across all images.
//! This module rebuilds a standalone LINKEDIT for the extracted image:
//!
//! - local symbols come back from the cache's local symbols table
//! - external definitions and undefined symbols are copied from the image's
//!   own symbol table, plus a definition for every export trie entry that
//!   has none
//! - the indirect symbol table is remapped onto the new symbol indices
//! - bind, weak bind, lazy bind, export, function starts and data-in-code
//!   blobs are copied; rebase info and cache-only payloads are dropped
//!
//! The rebuilt table is published in [`ExtractionContext::symbols`] for the
//! stub fixer.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use tracing::debug;
use zerocopy::{FromBytes, IntoBytes};

use crate::dyld::trie::{
    ExportTrieParser, EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, EXPORT_SYMBOL_FLAGS_KIND_MASK,
    EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION,
};
use crate::error::{Error, Result};
use crate::macho::{
    DyldInfoCommand, DysymtabCommand, MachOFlags, Nlist64, SegmentCommand64, SymtabCommand,
    INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, LC_DATA_IN_CODE, LC_DYLD_EXPORTS_TRIE,
    LC_FUNCTION_STARTS, LINKEDIT_ZEROED_COMMANDS, N_ABS, N_EXT, N_SECT, N_WEAK_DEF,
};
use crate::util::{align_up, cstr_at};

use super::{ExtractionContext, SymbolEntry, SymbolTable};

/// Name given to the placeholder for redacted indirect symbols.
pub const REDACTED_SYMBOL: &str = "<redacted>";

// =============================================================================
// String Pool
// =============================================================================

/// A string pool for building the new LINKEDIT string table.
///
/// Deduplicates strings and tracks their offsets in the final table.
#[derive(Debug)]
struct StringPool {
    /// Map from string content to offset in pool
    map: HashMap<String, u32>,
    /// The table as built so far
    bytes: Vec<u8>,
}

impl StringPool {
    /// Creates a new string pool with the initial null byte.
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            bytes: vec![0],
        }
    }

    /// Adds a string to the pool and returns its offset.
    ///
    /// If the string already exists, returns the existing offset.
    fn add(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.map.get(s) {
            return offset;
        }

        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.map.insert(s.to_string(), offset);
        offset
    }

    /// Compiles the string pool into a byte vector.
    fn compile(self) -> Vec<u8> {
        self.bytes
    }
}

// =============================================================================
// New Layout
// =============================================================================

/// Offsets of each blob, relative to the start of the new LINKEDIT.
#[derive(Debug, Default, Clone, Copy)]
struct Blob {
    offset: u32,
    size: u32,
}

#[derive(Debug, Default)]
struct NewLayout {
    bind: Blob,
    weak_bind: Blob,
    lazy_bind: Blob,
    export: Blob,
    /// Whether the export trie came from `LC_DYLD_INFO`
    export_in_dyld_info: bool,
    symbols: Blob,
    function_starts: Blob,
    data_in_code: Blob,
    indirect: Blob,
    strings: Blob,
    locals: Range<u32>,
    extdefs: Range<u32>,
    undefs: Range<u32>,
}

/// Everything the rebuild produces before the image is touched.
struct Rebuilt {
    data: Vec<u8>,
    layout: NewLayout,
    symbols: SymbolTable,
    redacted: usize,
    warnings: Vec<String>,
}

// =============================================================================
// LINKEDIT Optimizer
// =============================================================================

/// State for the LINKEDIT optimization process.
///
/// Only reads the image; [`apply`] writes the result back.
struct LinkeditOptimizer<'a> {
    ctx: &'a ExtractionContext,
    linkedit: SegmentCommand64,
    symtab: Option<SymtabCommand>,
    dysymtab: Option<DysymtabCommand>,
    dyld_info: Option<DyldInfoCommand>,

    /// The new LINKEDIT data being built
    new_linkedit: Vec<u8>,
    /// String pool for symbol names
    string_pool: StringPool,
    /// Symbols in output order
    entries: Vec<SymbolEntry>,
    /// Maps old symbol indices to new indices
    old_to_new_symbol_index: HashMap<u32, u32>,
    layout: NewLayout,
    warnings: Vec<String>,
}

impl<'a> LinkeditOptimizer<'a> {
    fn new(ctx: &'a ExtractionContext) -> Result<Self> {
        let linkedit = ctx
            .macho
            .segment("__LINKEDIT")
            .ok_or_else(|| Error::SegmentNotFound {
                name: "__LINKEDIT".into(),
            })?
            .command;

        Ok(Self {
            ctx,
            linkedit,
            symtab: ctx.macho.symtab().map(|(_, cmd)| cmd),
            dysymtab: ctx.macho.dysymtab().map(|(_, cmd)| cmd),
            dyld_info: ctx.macho.dyld_info().map(|(_, cmd)| cmd),
            new_linkedit: Vec::new(),
            string_pool: StringPool::new(),
            entries: Vec::new(),
            old_to_new_symbol_index: HashMap::new(),
            layout: NewLayout::default(),
            warnings: Vec::new(),
        })
    }

    /// Reads `size` bytes at file offset `offset` of the old LINKEDIT.
    ///
    /// Offsets are translated through the segment's address, so the read
    /// sees the image view rather than the main cache file.
    fn read_linkedit_data(&self, offset: u32, size: u32) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let rel = (offset as u64)
            .checked_sub(self.linkedit.fileoff)
            .ok_or_else(|| Error::parse(offset as usize, "offset precedes __LINKEDIT"))?;
        let data = self
            .ctx
            .macho
            .read_bytes(self.linkedit.vmaddr + rel, size as usize)?;
        Ok(data.into_owned())
    }

    /// Appends `data` and returns where it landed.
    fn push_blob(&mut self, data: &[u8]) -> Blob {
        let blob = Blob {
            offset: self.new_linkedit.len() as u32,
            size: data.len() as u32,
        };
        self.new_linkedit.extend_from_slice(data);
        blob
    }

    fn align(&mut self) {
        let aligned = align_up(self.new_linkedit.len() as u64, 8) as usize;
        self.new_linkedit.resize(aligned, 0);
    }

    /// Copies binding info to the new LINKEDIT.
    fn copy_binding_info(&mut self) -> Result<()> {
        let Some(dyld_info) = self.dyld_info else {
            return Ok(());
        };

        let bind = self.read_linkedit_data(dyld_info.bind_off, dyld_info.bind_size)?;
        self.layout.bind = self.push_blob(&bind);
        let weak = self.read_linkedit_data(dyld_info.weak_bind_off, dyld_info.weak_bind_size)?;
        self.layout.weak_bind = self.push_blob(&weak);
        let lazy = self.read_linkedit_data(dyld_info.lazy_bind_off, dyld_info.lazy_bind_size)?;
        self.layout.lazy_bind = self.push_blob(&lazy);
        Ok(())
    }

    /// Copies export info and returns the trie bytes.
    fn copy_export_info(&mut self) -> Result<Vec<u8>> {
        // LC_DYLD_EXPORTS_TRIE takes precedence
        if let Some((_, trie)) = self.ctx.macho.linkedit_data(LC_DYLD_EXPORTS_TRIE) {
            if trie.datasize > 0 {
                let data = self.read_linkedit_data(trie.dataoff, trie.datasize)?;
                self.layout.export = self.push_blob(&data);
                return Ok(data);
            }
        }

        if let Some(dyld_info) = self.dyld_info {
            if dyld_info.export_size > 0 {
                let data = self.read_linkedit_data(dyld_info.export_off, dyld_info.export_size)?;
                self.layout.export = self.push_blob(&data);
                self.layout.export_in_dyld_info = true;
                return Ok(data);
            }
        }

        Ok(Vec::new())
    }

    fn add_symbol(&mut self, name: &str, mut nlist: Nlist64) -> u32 {
        nlist.n_strx = self.string_pool.add(name);
        self.entries.push(SymbolEntry {
            name: name.to_string(),
            nlist,
        });
        (self.entries.len() - 1) as u32
    }

    /// Copies local symbols from the cache's local symbols table, followed
    /// by any locals the image still carries itself.
    fn copy_local_symbols(&mut self, old: &OldSymbols) -> Result<()> {
        let start = self.entries.len() as u32;

        let locals = match self.ctx.cache.local_symbols_for(self.ctx.image_address) {
            Ok(locals) => locals,
            Err(e) if e.is_recoverable() => {
                self.warnings.push(format!("unable to read local symbols: {e}"));
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        if locals.is_empty() {
            debug!("no local symbols in the cache for this image");
        }
        for local in locals {
            self.add_symbol(&local.name, local.nlist);
        }

        if let Some(dysymtab) = self.dysymtab {
            self.copy_old_range(old, dysymtab.ilocalsym, dysymtab.nlocalsym);
        }

        self.layout.locals = start..self.entries.len() as u32;
        Ok(())
    }

    /// Copies external definitions, then synthesizes one for every export
    /// that the symbol table lacks.
    fn copy_exported_symbols(&mut self, old: &OldSymbols, trie: &[u8]) {
        let start = self.entries.len() as u32;
        if let Some(dysymtab) = self.dysymtab {
            self.copy_old_range(old, dysymtab.iextdefsym, dysymtab.nextdefsym);
        }

        if !trie.is_empty() {
            match ExportTrieParser::new(trie).parse_all() {
                Ok(exports) => {
                    let defined: HashSet<String> = self.entries[start as usize..]
                        .iter()
                        .map(|e| e.name.clone())
                        .collect();
                    let mut added = 0usize;
                    for export in exports {
                        if export.is_reexport() || defined.contains(&export.name) {
                            continue;
                        }
                        let nlist = self.export_nlist(export.flags, export.address);
                        self.add_symbol(&export.name, nlist);
                        added += 1;
                    }
                    if added > 0 {
                        debug!("synthesized {} symbols from the export trie", added);
                    }
                }
                Err(e) => self.warnings.push(format!("unable to parse export trie: {e}")),
            }
        }

        self.layout.extdefs = start..self.entries.len() as u32;
    }

    /// Builds a defined external nlist for a trie export.
    fn export_nlist(&self, flags: u64, address: u64) -> Nlist64 {
        let n_desc = if flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0 {
            N_WEAK_DEF
        } else {
            0
        };

        if flags & EXPORT_SYMBOL_FLAGS_KIND_MASK == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE {
            return Nlist64 {
                n_type: N_ABS | N_EXT,
                n_desc,
                n_value: address,
                ..Default::default()
            };
        }

        let addr = self.ctx.image_address + address;
        match section_number(self.ctx, addr) {
            Some(n_sect) => Nlist64 {
                n_type: N_SECT | N_EXT,
                n_sect,
                n_desc,
                n_value: addr,
                ..Default::default()
            },
            None => Nlist64 {
                n_type: N_ABS | N_EXT,
                n_desc,
                n_value: addr,
                ..Default::default()
            },
        }
    }

    /// Copies undefined symbols.
    fn copy_imported_symbols(&mut self, old: &OldSymbols) {
        let start = self.entries.len() as u32;
        if let Some(dysymtab) = self.dysymtab {
            self.copy_old_range(old, dysymtab.iundefsym, dysymtab.nundefsym);
        }
        self.layout.undefs = start..self.entries.len() as u32;
    }

    fn copy_old_range(&mut self, old: &OldSymbols, first: u32, count: u32) {
        for index in first..first.saturating_add(count) {
            let Some((name, nlist)) = old.get(index) else {
                self.warnings
                    .push(format!("symbol index {index} is outside the symbol table"));
                break;
            };
            let new_index = self.add_symbol(&name, nlist);
            self.old_to_new_symbol_index.insert(index, new_index);
        }
    }

    /// Remaps the indirect symbol table, pointing unresolved entries at a
    /// single `<redacted>` placeholder appended to the undefined symbols.
    fn remap_indirect_symbols(&mut self) -> Result<(Vec<u32>, usize)> {
        let Some(dysymtab) = self.dysymtab else {
            return Ok((Vec::new(), 0));
        };
        let data = self.read_linkedit_data(
            dysymtab.indirectsymoff,
            dysymtab.nindirectsyms.saturating_mul(4),
        )?;

        let mut redacted = 0usize;
        let mut placeholder = None;
        let mut indirect = Vec::with_capacity(data.len() / 4);
        for chunk in data.chunks_exact(4) {
            let old = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if old & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                indirect.push(old);
                continue;
            }

            let mapped = if old == 0 {
                None
            } else {
                self.old_to_new_symbol_index.get(&old).copied()
            };
            match mapped {
                Some(index) => indirect.push(index),
                None => {
                    redacted += 1;
                    let index = match placeholder {
                        Some(index) => index,
                        None => {
                            let index =
                                self.add_symbol(REDACTED_SYMBOL, Nlist64::undefined(0, 0));
                            self.layout.undefs.end = index + 1;
                            placeholder = Some(index);
                            index
                        }
                    };
                    indirect.push(index);
                }
            }
        }

        if redacted > 0 {
            self.warnings.push(format!(
                "{redacted} indirect symbols were redacted and point at {REDACTED_SYMBOL}"
            ));
        }
        Ok((indirect, redacted))
    }

    fn copy_linkedit_data(&mut self, cmd: u32) -> Result<Blob> {
        let Some((_, lc)) = self.ctx.macho.linkedit_data(cmd) else {
            return Ok(Blob::default());
        };
        let data = self.read_linkedit_data(lc.dataoff, lc.datasize)?;
        Ok(self.push_blob(&data))
    }

    /// Runs the rebuild.
    fn build(mut self) -> Result<Rebuilt> {
        let old = OldSymbols::read(&self)?;

        self.copy_binding_info()?;
        let trie = self.copy_export_info()?;

        // Symbols are gathered first; their nlists go in once the string
        // table offsets are final.
        self.copy_local_symbols(&old)?;
        self.copy_exported_symbols(&old, &trie);
        self.copy_imported_symbols(&old);
        let (indirect, redacted) = self.remap_indirect_symbols()?;

        self.align();
        let nlists: Vec<u8> = self
            .entries
            .iter()
            .flat_map(|e| e.nlist.as_bytes().to_vec())
            .collect();
        self.layout.symbols = self.push_blob(&nlists);

        self.layout.function_starts = self.copy_linkedit_data(LC_FUNCTION_STARTS)?;
        self.layout.data_in_code = self.copy_linkedit_data(LC_DATA_IN_CODE)?;

        let indirect_bytes: Vec<u8> = indirect.iter().flat_map(|i| i.to_le_bytes()).collect();
        self.layout.indirect = self.push_blob(&indirect_bytes);

        self.align();
        let strings = std::mem::replace(&mut self.string_pool, StringPool::new()).compile();
        self.layout.strings = self.push_blob(&strings);
        self.align();

        Ok(Rebuilt {
            data: self.new_linkedit,
            layout: self.layout,
            symbols: SymbolTable {
                entries: self.entries,
                indirect,
            },
            redacted,
            warnings: self.warnings,
        })
    }
}

/// The image's original symbol table.
struct OldSymbols {
    nlists: Vec<u8>,
    strings: Vec<u8>,
}

impl OldSymbols {
    fn read(optimizer: &LinkeditOptimizer<'_>) -> Result<Self> {
        let Some(symtab) = optimizer.symtab else {
            return Ok(Self {
                nlists: Vec::new(),
                strings: Vec::new(),
            });
        };
        Ok(Self {
            nlists: optimizer.read_linkedit_data(
                symtab.symoff,
                symtab.nsyms.saturating_mul(Nlist64::SIZE as u32),
            )?,
            strings: optimizer.read_linkedit_data(symtab.stroff, symtab.strsize)?,
        })
    }

    fn get(&self, index: u32) -> Option<(String, Nlist64)> {
        let start = index as usize * Nlist64::SIZE;
        let (nlist, _) = Nlist64::read_from_prefix(self.nlists.get(start..)?).ok()?;
        let name = self
            .strings
            .get(nlist.n_strx as usize..)
            .map(cstr_at)
            .unwrap_or_default()
            .to_string();
        Some((name, nlist))
    }
}

/// One-based section number containing `addr`, counted across segments.
fn section_number(ctx: &ExtractionContext, addr: u64) -> Option<u8> {
    ctx.macho
        .segments()
        .flat_map(|seg| seg.sections.iter())
        .position(|sect| sect.section.contains_addr(addr))
        .and_then(|i| u8::try_from(i + 1).ok())
}

// =============================================================================
// Applying the result
// =============================================================================

/// Writes the rebuilt LINKEDIT into the image and updates its load commands.
fn apply(ctx: &mut ExtractionContext, rebuilt: Rebuilt) -> Result<()> {
    let Rebuilt {
        data,
        layout,
        symbols,
        redacted,
        warnings,
    } = rebuilt;

    let linkedit = ctx
        .macho
        .segment("__LINKEDIT")
        .ok_or_else(|| Error::SegmentNotFound {
            name: "__LINKEDIT".into(),
        })?
        .command;
    let vmsize = align_up(data.len() as u64, 0x1000);
    ctx.macho.rewrite_segment("__LINKEDIT", |seg| {
        seg.filesize = data.len() as u64;
        seg.vmsize = vmsize;
    })?;
    ctx.macho.claim_zeroed(linkedit.vmaddr, vmsize)?;
    ctx.macho.write_bytes(linkedit.vmaddr, &data)?;

    let base = linkedit.fileoff as u32;
    let file_off = |blob: Blob| if blob.size == 0 { 0 } else { base + blob.offset };

    if let Some((offset, mut symtab)) = ctx.macho.symtab() {
        symtab.symoff = file_off(layout.symbols);
        symtab.nsyms = symbols.entries.len() as u32;
        symtab.stroff = file_off(layout.strings);
        symtab.strsize = layout.strings.size;
        ctx.macho.write_lc(offset, &symtab)?;
    }

    if let Some((offset, mut dysymtab)) = ctx.macho.dysymtab() {
        dysymtab.ilocalsym = layout.locals.start;
        dysymtab.nlocalsym = layout.locals.len() as u32;
        dysymtab.iextdefsym = layout.extdefs.start;
        dysymtab.nextdefsym = layout.extdefs.len() as u32;
        dysymtab.iundefsym = layout.undefs.start;
        dysymtab.nundefsym = layout.undefs.len() as u32;
        dysymtab.tocoff = 0;
        dysymtab.ntoc = 0;
        dysymtab.modtaboff = 0;
        dysymtab.nmodtab = 0;
        dysymtab.extrefsymoff = 0;
        dysymtab.nextrefsyms = 0;
        dysymtab.indirectsymoff = file_off(layout.indirect);
        dysymtab.nindirectsyms = symbols.indirect.len() as u32;
        dysymtab.extreloff = 0;
        dysymtab.nextrel = 0;
        dysymtab.locreloff = 0;
        dysymtab.nlocrel = 0;
        ctx.macho.write_lc(offset, &dysymtab)?;
    }

    if let Some((offset, mut dyld_info)) = ctx.macho.dyld_info() {
        dyld_info.rebase_off = 0;
        dyld_info.rebase_size = 0;
        dyld_info.bind_off = file_off(layout.bind);
        dyld_info.bind_size = layout.bind.size;
        dyld_info.weak_bind_off = file_off(layout.weak_bind);
        dyld_info.weak_bind_size = layout.weak_bind.size;
        dyld_info.lazy_bind_off = file_off(layout.lazy_bind);
        dyld_info.lazy_bind_size = layout.lazy_bind.size;
        if layout.export_in_dyld_info {
            dyld_info.export_off = file_off(layout.export);
            dyld_info.export_size = layout.export.size;
        } else {
            dyld_info.export_off = 0;
            dyld_info.export_size = 0;
        }
        ctx.macho.write_lc(offset, &dyld_info)?;
    }

    let trie = if layout.export_in_dyld_info {
        Blob::default()
    } else {
        layout.export
    };
    let kept = [
        (LC_DYLD_EXPORTS_TRIE, trie),
        (LC_FUNCTION_STARTS, layout.function_starts),
        (LC_DATA_IN_CODE, layout.data_in_code),
    ];
    for (cmd, blob) in kept {
        if let Some((offset, mut lc)) = ctx.macho.linkedit_data(cmd) {
            lc.dataoff = file_off(blob);
            lc.datasize = blob.size;
            ctx.macho.write_lc(offset, &lc)?;
        }
    }
    for cmd in LINKEDIT_ZEROED_COMMANDS {
        if let Some((offset, mut lc)) = ctx.macho.linkedit_data(cmd) {
            lc.dataoff = 0;
            lc.datasize = 0;
            ctx.macho.write_lc(offset, &lc)?;
        }
    }

    let mut header = *ctx.macho.header();
    header.flags &= !MachOFlags::DYLIB_IN_CACHE.bits();
    ctx.macho.write_header(&header)?;

    for warning in warnings {
        ctx.warn(warning);
    }
    ctx.has_redacted_indirect = redacted > 0;
    debug!(
        "rebuilt __LINKEDIT: {} bytes, {} symbols ({} local, {} defined, {} undefined)",
        data.len(),
        symbols.entries.len(),
        layout.locals.len(),
        layout.extdefs.len(),
        layout.undefs.len()
    );
    ctx.symbols = Some(symbols);
    Ok(())
}

/// Optimizes the LINKEDIT segment for a standalone image.
pub fn optimize_linkedit(ctx: &mut ExtractionContext) -> Result<()> {
    ctx.stage("optimizing linkedit");
    let rebuilt = LinkeditOptimizer::new(ctx)?.build()?;
    apply(ctx, rebuilt)
}
