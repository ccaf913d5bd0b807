//! Stub fixer for restoring optimized stubs.
//!
//! In the dyld shared cache, calls to other images are routed through stub
//! islands that live outside every image, and an image's own stubs are
//! often rewritten to branch straight at their targets. This module:
//!
//! 1. names addresses from the export tries of the image's dependencies and
//!    from the image's own symbol pointer slots
//! 2. regenerates the image's `__stubs`/`__auth_stubs` entries so they load
//!    through the image's own slots again, adding a bind record per slot
//! 3. retargets every call site that reaches into a stub island, either to
//!    the in-image function or to the image's own stub for the symbol. An
//!    import without a stub gets a new stub and bound slot in segment slack;
//!    only calls that name nothing become `brk #1`
//!
//! Requires the symbol table published by the linkedit optimizer.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use rayon::prelude::*;
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::arm64;
use crate::dyld::trie::{bind_opcodes, encode_bind_info, parse_bind_info, BindRecord};
use crate::dyld::{DyldContext, ExportTrieParser, PointerAuth};
use crate::error::{Error, Result};
use crate::macho::{
    DyldInfoCommand, MachOContext, SectionInfo, SegmentInfo, LC_DATA_IN_CODE,
    LC_DYLD_EXPORTS_TRIE, LC_REEXPORT_DYLIB, S_LAZY_DYLIB_SYMBOL_POINTERS, S_LAZY_SYMBOL_POINTERS,
    S_NON_LAZY_SYMBOL_POINTERS, S_SYMBOL_STUBS, VM_PROT_EXECUTE, VM_PROT_WRITE,
};

use crate::util::align_up;

use super::{ExtractionContext, SymbolTable};

/// How deep re-exports are followed.
const MAX_REEXPORT_DEPTH: usize = 4;

/// How many islands may chain into each other before giving up.
const MAX_ISLAND_DEPTH: usize = 4;

// =============================================================================
// Stub Format Detection
// =============================================================================

/// Stub format classification.
///
/// Each variant carries what the stub ultimately reaches: a code address
/// or the pointer slot it loads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFormat {
    /// B target
    Branch { target: u64 },
    /// ADRP + ADD + BR, optionally followed by BRK or NOP
    DirectAddress { target: u64 },
    /// ADRP + LDR + BR (standard arm64)
    PointerLoad { slot: u64 },
    /// ADRP + ADD + LDR + BRAA (standard arm64e)
    AuthPointerLoad { slot: u64 },
    /// ADRP + LDR + BRAAZ (arm64e resolver)
    AuthResolver { slot: u64 },
}

impl StubFormat {
    /// The pointer slot the stub loads from, if any.
    pub fn slot(&self) -> Option<u64> {
        match *self {
            Self::PointerLoad { slot }
            | Self::AuthPointerLoad { slot }
            | Self::AuthResolver { slot } => Some(slot),
            Self::Branch { .. } | Self::DirectAddress { .. } => None,
        }
    }
}

fn words(data: &[u8]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (word, chunk) in out.iter_mut().zip(data.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

/// Decodes the stub at `addr`. Returns `None` for anything unrecognized.
pub fn decode_stub(addr: u64, data: &[u8]) -> Option<StubFormat> {
    let count = (data.len() / 4).min(4);
    if count == 0 {
        return None;
    }
    let [instr0, instr1, instr2, instr3] = words(data);

    if arm64::is_b(instr0) {
        return Some(StubFormat::Branch {
            target: arm64::decode_branch(instr0, addr),
        });
    }

    if count < 3 || !arm64::is_adrp(instr0) || arm64::rn(instr1) != arm64::rd(instr0) {
        return None;
    }
    let page = arm64::decode_adrp(instr0, addr);

    if arm64::is_add_imm(instr1) && arm64::is_br(instr2) {
        return Some(StubFormat::DirectAddress {
            target: page + arm64::decode_add_imm(instr1) as u64,
        });
    }
    if arm64::is_ldr_unsigned_imm(instr1) && arm64::is_br(instr2) {
        return Some(StubFormat::PointerLoad {
            slot: page + arm64::decode_ldr_offset(instr1) as u64,
        });
    }
    if arm64::is_ldr_unsigned_imm(instr1) && arm64::is_braaz(instr2) {
        return Some(StubFormat::AuthResolver {
            slot: page + arm64::decode_ldr_offset(instr1) as u64,
        });
    }
    if count == 4
        && arm64::is_add_imm(instr1)
        && arm64::is_ldr_unsigned_imm(instr2)
        && arm64::is_braa(instr3)
    {
        let slot = page + arm64::decode_add_imm(instr1) as u64;
        return Some(StubFormat::AuthPointerLoad {
            slot: slot + arm64::decode_ldr_offset(instr2) as u64,
        });
    }

    None
}

// =============================================================================
// Stub Generation
// =============================================================================

/// Generates a standard ARM64 stub (ADRP + LDR + BR).
pub fn generate_stub_normal(stub_addr: u64, ptr_addr: u64) -> [u8; 12] {
    let adrp = arm64::encode_adrp(16, stub_addr, ptr_addr);
    let ldr = arm64::encode_ldr_unsigned(16, 16, ptr_addr & 0xFFF);
    let br = arm64::encode_br(16);

    let mut result = [0u8; 12];
    result[0..4].copy_from_slice(&adrp.to_le_bytes());
    result[4..8].copy_from_slice(&ldr.to_le_bytes());
    result[8..12].copy_from_slice(&br.to_le_bytes());
    result
}

/// Generates an ARM64e authenticated stub (ADRP + ADD + LDR + BRAA).
pub fn generate_stub_auth(stub_addr: u64, ptr_addr: u64) -> [u8; 16] {
    let adrp = arm64::encode_adrp(17, stub_addr, ptr_addr);
    let add = arm64::encode_add_imm(17, 17, (ptr_addr & 0xFFF) as u32);
    let ldr = arm64::encode_ldr_unsigned(16, 17, 0);
    let braa = arm64::encode_braa(16, 17);

    let mut result = [0u8; 16];
    result[0..4].copy_from_slice(&adrp.to_le_bytes());
    result[4..8].copy_from_slice(&add.to_le_bytes());
    result[8..12].copy_from_slice(&ldr.to_le_bytes());
    result[12..16].copy_from_slice(&braa.to_le_bytes());
    result
}

// =============================================================================
// Symbolizer
// =============================================================================

/// Reads `size` bytes of `__LINKEDIT` data at file offset `offset`.
fn linkedit_bytes(macho: &MachOContext, offset: u32, size: u32) -> Result<Vec<u8>> {
    let linkedit = macho
        .segment("__LINKEDIT")
        .ok_or_else(|| Error::SegmentNotFound {
            name: "__LINKEDIT".into(),
        })?
        .command;
    let rel = (offset as u64)
        .checked_sub(linkedit.fileoff)
        .ok_or_else(|| Error::parse(offset as usize, "linkedit data precedes __LINKEDIT"))?;
    Ok(macho
        .read_bytes(linkedit.vmaddr + rel, size as usize)?
        .into_owned())
}

/// Reads an image's export trie, from `LC_DYLD_EXPORTS_TRIE` or dyld info.
fn read_export_trie(macho: &MachOContext) -> Result<Vec<u8>> {
    let (offset, size) = match macho.linkedit_data(LC_DYLD_EXPORTS_TRIE) {
        Some((_, lc)) if lc.datasize > 0 => (lc.dataoff, lc.datasize),
        _ => match macho.dyld_info() {
            Some((_, info)) if info.export_size > 0 => (info.export_off, info.export_size),
            _ => return Ok(Vec::new()),
        },
    };
    linkedit_bytes(macho, offset, size)
}

/// Code ranges `LC_DATA_IN_CODE` marks as data.
fn data_in_code_ranges(macho: &MachOContext) -> Result<Vec<Range<u64>>> {
    let Some((_, lc)) = macho.linkedit_data(LC_DATA_IN_CODE) else {
        return Ok(Vec::new());
    };
    if lc.datasize == 0 {
        return Ok(Vec::new());
    }
    let entries = linkedit_bytes(macho, lc.dataoff, lc.datasize)?;
    Ok(entries
        .chunks_exact(8)
        .map(|entry| {
            let offset = LittleEndian::read_u32(&entry[..4]) as u64;
            let length = LittleEndian::read_u16(&entry[4..6]) as u64;
            let start = macho.base_addr + offset;
            start..start + length
        })
        .collect())
}

/// Opens the cache image installed at `path`.
fn open_dylib(cache: &Arc<DyldContext>, path: &str) -> Result<Option<MachOContext>> {
    let Some(image) = cache.image_by_path(path) else {
        return Ok(None);
    };
    MachOContext::new(Arc::clone(cache), image.address).map(Some)
}

/// Collects `(name, address)` for everything `path` exports, including
/// re-exported symbols and the exports of re-exported dylibs.
fn dylib_exports(
    cache: &Arc<DyldContext>,
    path: &str,
    depth: usize,
) -> Result<Vec<(String, u64)>> {
    let Some(macho) = open_dylib(cache, path)? else {
        debug!("dependency {} is not in the cache", path);
        return Ok(Vec::new());
    };
    let base = macho.base_addr;
    let trie = read_export_trie(&macho)?;
    let deps: Vec<(String, u32)> = macho.dylibs().map(|(p, cmd)| (p.to_string(), cmd)).collect();

    let mut out = Vec::new();
    for export in ExportTrieParser::new(&trie).parse_all()? {
        if export.is_reexport() {
            if depth >= MAX_REEXPORT_DEPTH {
                continue;
            }
            let Some((dep, _)) = export
                .reexport_ordinal
                .and_then(|ord| deps.get((ord as usize).checked_sub(1)?))
            else {
                continue;
            };
            if let Some(addr) = lookup_export(cache, dep, export.imported_name(), depth + 1)? {
                out.push((export.name.clone(), addr));
            }
            continue;
        }
        out.push((export.name.clone(), base + export.address));
    }

    if depth < MAX_REEXPORT_DEPTH {
        for (child, _) in deps.iter().filter(|(_, cmd)| *cmd == LC_REEXPORT_DYLIB) {
            out.extend(dylib_exports(cache, child, depth + 1)?);
        }
    }
    Ok(out)
}

/// Finds the address of `name` as exported by `path`.
fn lookup_export(
    cache: &Arc<DyldContext>,
    path: &str,
    name: &str,
    depth: usize,
) -> Result<Option<u64>> {
    let Some(macho) = open_dylib(cache, path)? else {
        return Ok(None);
    };
    let trie = read_export_trie(&macho)?;
    let deps: Vec<(String, u32)> = macho.dylibs().map(|(p, cmd)| (p.to_string(), cmd)).collect();

    if let Some(export) = ExportTrieParser::new(&trie).lookup(name)? {
        if !export.is_reexport() {
            return Ok(Some(macho.base_addr + export.address));
        }
        if depth >= MAX_REEXPORT_DEPTH {
            return Ok(None);
        }
        let dep = export
            .reexport_ordinal
            .and_then(|ord| deps.get((ord as usize).checked_sub(1)?));
        return match dep {
            Some((dep, _)) => lookup_export(cache, dep, export.imported_name(), depth + 1),
            None => Ok(None),
        };
    }

    if depth < MAX_REEXPORT_DEPTH {
        for (child, _) in deps.iter().filter(|(_, cmd)| *cmd == LC_REEXPORT_DYLIB) {
            if let Some(addr) = lookup_export(cache, child, name, depth + 1)? {
                return Ok(Some(addr));
            }
        }
    }
    Ok(None)
}

/// Names for addresses and pointer slots.
#[derive(Debug, Default)]
struct Symbolizer {
    /// Code address to symbol name
    by_addr: HashMap<u64, String>,
    /// Symbol name to the dylib ordinal that exports it
    ordinals: HashMap<String, i64>,
    /// The image's own pointer slots, by address
    slot_names: HashMap<u64, String>,
    /// First own pointer slot for each name
    slots_by_name: HashMap<String, u64>,
}

impl Symbolizer {
    fn build(ctx: &mut ExtractionContext, symbols: &SymbolTable) -> Result<Self> {
        let mut symbolizer = Self::default();

        let deps: Vec<(i64, String)> = ctx
            .macho
            .dylibs()
            .enumerate()
            .map(|(i, (path, _))| (i as i64 + 1, path.to_string()))
            .collect();
        let cache = Arc::clone(&ctx.cache);
        let loaded: Vec<(i64, &str, Result<Vec<(String, u64)>>)> = deps
            .par_iter()
            .map(|(ordinal, path)| (*ordinal, path.as_str(), dylib_exports(&cache, path, 0)))
            .collect();

        for (ordinal, path, exports) in loaded {
            match exports {
                Ok(exports) => {
                    trace!("{} exports from {}", exports.len(), path);
                    for (name, addr) in exports {
                        symbolizer.by_addr.entry(addr).or_insert_with(|| name.clone());
                        symbolizer.ordinals.entry(name).or_insert(ordinal);
                    }
                }
                Err(e) => ctx.warn(format!("unable to read exports of {path}: {e}")),
            }
        }

        // Own pointer slots, named through the indirect symbol table.
        let pointer_sections: Vec<SectionInfo> = ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter())
            .filter(|s| {
                matches!(
                    s.section.section_type(),
                    S_NON_LAZY_SYMBOL_POINTERS
                        | S_LAZY_SYMBOL_POINTERS
                        | S_LAZY_DYLIB_SYMBOL_POINTERS
                )
            })
            .cloned()
            .collect();
        for sect in pointer_sections {
            let first = sect.section.indirect_symbol_index() as usize;
            for i in 0..(sect.section.size / 8) as usize {
                let Some(name) = symbols.indirect_name(first + i) else {
                    continue;
                };
                let slot = sect.section.addr + i as u64 * 8;
                symbolizer.slot_names.insert(slot, name.to_string());
                symbolizer
                    .slots_by_name
                    .entry(name.to_string())
                    .or_insert(slot);
                if let Ok(value) = ctx.macho.read_u64(slot) {
                    if value != 0 {
                        symbolizer.by_addr.entry(value).or_insert_with(|| name.to_string());
                    }
                }
            }
        }

        // Undefined symbols carry their own ordinal.
        for entry in &symbols.entries {
            let ordinal = (entry.nlist.n_desc >> 8) as u8;
            if entry.nlist.is_undefined() && entry.nlist.is_external() && ordinal != 0 {
                let ordinal = match ordinal {
                    0xFE => bind_opcodes::BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
                    0xFF => -1,
                    n => n as i64,
                };
                symbolizer.ordinals.insert(entry.name.clone(), ordinal);
            }
        }

        debug!(
            "symbolizer: {} named addresses, {} own slots",
            symbolizer.by_addr.len(),
            symbolizer.slot_names.len()
        );
        Ok(symbolizer)
    }
}

// =============================================================================
// Stub Fixer
// =============================================================================

/// Where a call through a stub island should go instead.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    /// Code inside the image, or one of its stubs
    Address(u64),
    /// An imported symbol that has no stub in the image yet
    Symbol(String),
}

/// Unused bytes between a segment's last section and the end of its file
/// contents.
#[derive(Debug, Clone, Copy)]
struct Slack {
    next: u64,
    end: u64,
}

impl Slack {
    fn of(seg: &SegmentInfo) -> Self {
        let next = seg
            .sections
            .iter()
            .map(|s| s.section.addr + s.section.size)
            .max()
            .unwrap_or(seg.command.vm_end());
        Self {
            next,
            end: seg.command.vmaddr + seg.command.filesize,
        }
    }

    /// First segment with sections and the given protection bit.
    fn find(macho: &MachOContext, prot: u32) -> Option<Self> {
        macho
            .segments()
            .filter(|seg| seg.command.initprot & prot != 0 && !seg.sections.is_empty())
            .map(Slack::of)
            .find(|slack| slack.next < slack.end)
    }

    fn take(&mut self, size: u64, align: u64) -> Option<u64> {
        let start = align_up(self.next, align);
        if start + size > self.end {
            return None;
        }
        self.next = start + size;
        Some(start)
    }
}

struct StubFixer<'a> {
    ctx: &'a mut ExtractionContext,
    symbols: Symbolizer,
    islands: Vec<Range<u64>>,
    /// Own stub address for each symbol name
    stubs_by_name: HashMap<String, u64>,
    /// Resolved destination of each island, `None` if unresolved
    island_targets: HashMap<u64, Option<Destination>>,
    /// Slots that need a bind record
    bound_slots: BTreeSet<u64>,
    /// Room for synthesized stubs
    code_slack: Option<Slack>,
    /// Room for synthesized pointer slots
    slot_slack: Option<Slack>,
}

impl<'a> StubFixer<'a> {
    /// Regenerates the image's own stubs.
    fn fix_own_stubs(&mut self) -> Result<usize> {
        let symbols = self.ctx.symbols.clone().unwrap_or_default();
        let stub_sections: Vec<SectionInfo> = self
            .ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter())
            .filter(|s| s.section.section_type() == S_SYMBOL_STUBS && s.section.stub_size() > 0)
            .cloned()
            .collect();

        let mut fixed = 0;
        for sect in stub_sections {
            let auth = sect.name() == "__auth_stubs";
            let stub_size = sect.section.stub_size() as u64;
            let needed = if auth { 16 } else { 12 };
            if stub_size < needed {
                self.ctx.warn(format!(
                    "{} stubs are {} bytes, too small to regenerate",
                    sect.name(),
                    stub_size
                ));
                continue;
            }

            let first = sect.section.indirect_symbol_index() as usize;
            for i in 0..sect.section.size / stub_size {
                let stub_addr = sect.section.addr + i * stub_size;
                let Some(name) = symbols.indirect_name(first + i as usize) else {
                    continue;
                };
                self.stubs_by_name
                    .entry(name.to_string())
                    .or_insert(stub_addr);

                let format = {
                    let bytes = self.ctx.macho.read_bytes(stub_addr, stub_size as usize)?;
                    decode_stub(stub_addr, &bytes)
                };
                let already_local = format
                    .and_then(|f| f.slot())
                    .is_some_and(|slot| self.ctx.macho.contains_addr(slot));
                if already_local {
                    continue;
                }
                if format.is_none() {
                    trace!("stub {:#x} has an unknown encoding", stub_addr);
                }

                let Some(&slot) = self.symbols.slots_by_name.get(name) else {
                    self.ctx
                        .warn(format!("no pointer slot for stub {name} at {stub_addr:#x}"));
                    continue;
                };

                let mut stub = if auth {
                    generate_stub_auth(stub_addr, slot).to_vec()
                } else {
                    generate_stub_normal(stub_addr, slot).to_vec()
                };
                while (stub.len() as u64) < stub_size {
                    stub.extend_from_slice(&arm64::encode_nop().to_le_bytes());
                }
                stub.truncate(stub_size as usize);
                self.ctx.macho.write_bytes(stub_addr, &stub)?;
                self.bound_slots.insert(slot);
                fixed += 1;
            }
        }
        Ok(fixed)
    }

    fn in_island(&self, addr: u64) -> bool {
        !self.ctx.macho.contains_addr(addr) && self.islands.iter().any(|r| r.contains(&addr))
    }

    /// The image's stub for `name`, or the symbol itself when it has none.
    fn destination_for(&self, name: &str) -> Destination {
        match self.stubs_by_name.get(name) {
            Some(&stub) => Destination::Address(stub),
            None => Destination::Symbol(name.to_string()),
        }
    }

    /// Resolves a code address to where a call site should go.
    fn resolve_target(&mut self, target: u64, depth: usize) -> Result<Option<Destination>> {
        if self.ctx.macho.contains_addr(target) {
            return Ok(Some(Destination::Address(target)));
        }
        if self.in_island(target) {
            if depth >= MAX_ISLAND_DEPTH {
                return Ok(None);
            }
            return self.resolve_island(target, depth + 1);
        }
        Ok(self
            .symbols
            .by_addr
            .get(&target)
            .map(|name| self.destination_for(name)))
    }

    /// Resolves the island at `addr`, memoized.
    fn resolve_island(&mut self, addr: u64, depth: usize) -> Result<Option<Destination>> {
        if let Some(resolved) = self.island_targets.get(&addr) {
            return Ok(resolved.clone());
        }

        let cache = Arc::clone(&self.ctx.cache);
        let data = cache.data_to_mapping_end(addr)?;
        let data = &data[..data.len().min(16)];
        let format = decode_stub(addr, data).ok_or(Error::UnknownStubEncoding {
            addr,
            instrs: words(data),
        })?;

        let resolved = match format {
            StubFormat::Branch { target } | StubFormat::DirectAddress { target } => {
                self.resolve_target(target, depth)?
            }
            StubFormat::PointerLoad { slot }
            | StubFormat::AuthPointerLoad { slot }
            | StubFormat::AuthResolver { slot } => {
                if let Some(name) = self.symbols.slot_names.get(&slot) {
                    Some(self.destination_for(name))
                } else {
                    match cache.read_pointer(slot) {
                        Ok(value) if value != 0 => self.resolve_target(value, depth)?,
                        _ => None,
                    }
                }
            }
        };

        trace!("island {:#x} ({:?}) -> {:x?}", addr, format, resolved);
        self.island_targets.insert(addr, resolved.clone());
        Ok(resolved)
    }

    /// Builds a stub and a bound pointer slot for `name` in segment slack.
    ///
    /// Returns `None` when the image has no room left.
    fn synthesize_stub(&mut self, name: &str) -> Result<Option<u64>> {
        if let Some(&stub) = self.stubs_by_name.get(name) {
            return Ok(Some(stub));
        }

        let auth = self.ctx.is_arm64e();
        let stub_size = if auth { 16 } else { 12 };
        let Some(stub_addr) = self.code_slack.as_mut().and_then(|s| s.take(stub_size, 4)) else {
            return Ok(None);
        };
        let slot = match self.symbols.slots_by_name.get(name) {
            Some(&slot) => slot,
            None => {
                let Some(slot) = self.slot_slack.as_mut().and_then(|s| s.take(8, 8)) else {
                    return Ok(None);
                };
                self.ctx.write_pointer(slot, 0)?;
                self.symbols.slot_names.insert(slot, name.to_string());
                self.symbols.slots_by_name.insert(name.to_string(), slot);
                slot
            }
        };

        let stub = if auth {
            self.ctx.auth_pointers.entry(slot).or_insert(PointerAuth {
                key: 0,
                diversity: 0,
                addr_div: true,
            });
            generate_stub_auth(stub_addr, slot).to_vec()
        } else {
            generate_stub_normal(stub_addr, slot).to_vec()
        };
        self.ctx.macho.write_bytes(stub_addr, &stub)?;
        self.bound_slots.insert(slot);
        self.stubs_by_name.insert(name.to_string(), stub_addr);
        debug!("stub for {} synthesized at {:#x}, slot {:#x}", name, stub_addr, slot);
        Ok(Some(stub_addr))
    }

    /// Retargets call sites that branch into stub islands.
    ///
    /// Words `LC_DATA_IN_CODE` marks as data are left alone.
    fn fix_call_sites(&mut self) -> Result<(usize, usize)> {
        let data_in_code = data_in_code_ranges(&self.ctx.macho)?;
        let code_sections: Vec<SectionInfo> = self
            .ctx
            .macho
            .segments()
            .flat_map(|seg| seg.sections.iter())
            .filter(|s| s.section.has_instructions() && s.section.section_type() != S_SYMBOL_STUBS)
            .cloned()
            .collect();

        let mut patches = Vec::new();
        let mut unresolved = Vec::new();
        for sect in code_sections {
            let code = self
                .ctx
                .macho
                .read_bytes(sect.section.addr, sect.section.size as usize)?
                .into_owned();
            for (i, chunk) in code.chunks_exact(4).enumerate() {
                let instr = LittleEndian::read_u32(chunk);
                if !arm64::is_branch(instr) {
                    continue;
                }
                let site = sect.section.addr + i as u64 * 4;
                if data_in_code.iter().any(|range| range.contains(&site)) {
                    continue;
                }
                let island = arm64::decode_branch(instr, site);
                if !self.in_island(island) {
                    continue;
                }

                let dest = match self.resolve_island(island, 0)? {
                    Some(Destination::Address(dest)) => Some(dest),
                    Some(Destination::Symbol(name)) => self.synthesize_stub(&name)?,
                    None => None,
                };
                let patched = match dest.map(|dest| arm64::retarget_branch(instr, site, dest)) {
                    Some(Ok(patched)) => Some(patched),
                    Some(Err(err)) if err.is_recoverable() => {
                        trace!("{}", err);
                        None
                    }
                    Some(Err(err)) => return Err(err),
                    None => None,
                };
                match patched {
                    Some(patched) => patches.push((site, patched)),
                    None => {
                        patches.push((site, arm64::encode_brk(1)));
                        unresolved.push((site, island));
                    }
                }
            }
        }

        for &(site, instr) in &patches {
            self.ctx.macho.write_u32(site, instr)?;
        }
        for &(site, island) in &unresolved {
            self.ctx.warn(format!(
                "call at {site:#x} through island {island:#x} is unresolved, replaced with brk #1"
            ));
        }
        Ok((patches.len() - unresolved.len(), unresolved.len()))
    }

    /// Adds a bind record for every regenerated stub's slot.
    fn emit_binds(&mut self) -> Result<()> {
        if self.bound_slots.is_empty() {
            return Ok(());
        }

        let mut records = Vec::new();
        if let Some((_, info)) = self.ctx.macho.dyld_info() {
            if info.bind_size > 0 {
                let linkedit = self
                    .ctx
                    .macho
                    .segment("__LINKEDIT")
                    .ok_or_else(|| Error::SegmentNotFound {
                        name: "__LINKEDIT".into(),
                    })?
                    .command;
                let rel = (info.bind_off as u64).saturating_sub(linkedit.fileoff);
                let addr = linkedit.vmaddr + rel;
                let existing = self
                    .ctx
                    .macho
                    .read_bytes(addr, info.bind_size as usize)?
                    .into_owned();
                match parse_bind_info(&existing) {
                    Ok(parsed) => records = parsed,
                    Err(e) => {
                        let message = format!("existing bind info is unreadable: {e}");
                        self.ctx.warn(message);
                    }
                }
            }
        }
        let already: BTreeSet<(u8, u64)> = records
            .iter()
            .map(|r| (r.segment_index, r.segment_offset))
            .collect();

        let mut added = 0;
        let slots: Vec<u64> = self.bound_slots.iter().copied().collect();
        for slot in slots {
            let Some((segment_index, segment_offset)) = self.ctx.macho.segment_index_of(slot) else {
                continue;
            };
            if already.contains(&(segment_index, segment_offset)) {
                continue;
            }
            let Some(name) = self.symbols.slot_names.get(&slot) else {
                continue;
            };
            let ordinal = self
                .symbols
                .ordinals
                .get(name)
                .copied()
                .unwrap_or(bind_opcodes::BIND_SPECIAL_DYLIB_FLAT_LOOKUP);
            records.push(BindRecord {
                segment_index,
                segment_offset,
                bind_type: bind_opcodes::BIND_TYPE_POINTER,
                symbol_name: name.clone(),
                ordinal,
                addend: 0,
            });
            added += 1;
        }
        if added == 0 {
            return Ok(());
        }
        records.sort_by(|a, b| {
            (a.ordinal, &a.symbol_name, a.segment_index, a.segment_offset).cmp(&(
                b.ordinal,
                &b.symbol_name,
                b.segment_index,
                b.segment_offset,
            ))
        });

        let encoded = encode_bind_info(&records);
        match self.ctx.macho.dyld_info() {
            Some((offset, mut info)) => {
                let bind_off = self.ctx.append_linkedit(&encoded)?;
                info.bind_off = bind_off;
                info.bind_size = encoded.len() as u32;
                self.ctx.macho.write_lc(offset, &info)?;
            }
            None => {
                if self.ctx.macho.load_command_space() < DyldInfoCommand::SIZE {
                    self.ctx
                        .warn("no room for LC_DYLD_INFO_ONLY, regenerated stubs are unbound");
                    return Ok(());
                }
                let bind_off = self.ctx.append_linkedit(&encoded)?;
                let info = DyldInfoCommand {
                    bind_off,
                    bind_size: encoded.len() as u32,
                    ..Default::default()
                };
                self.ctx.macho.insert_load_command(info.as_bytes())?;
            }
        }
        debug!("added {} bind records", added);
        Ok(())
    }
}

/// Fixes stubs and stub island call sites in the extracted image.
pub fn fix_stubs(ctx: &mut ExtractionContext) -> Result<()> {
    if !ctx.macho.is_arm64() {
        debug!("skipping stub fixing, not arm64");
        return Ok(());
    }
    ctx.stage("fixing stubs");

    let symbols = match ctx.symbols.clone() {
        Some(symbols) => symbols,
        None => {
            ctx.warn("symbol table was not rebuilt, stubs cannot be named");
            SymbolTable::default()
        }
    };
    let symbolizer = Symbolizer::build(ctx, &symbols)?;
    let islands = ctx.cache.stub_island_ranges();

    let mut fixer = StubFixer {
        ctx,
        symbols: symbolizer,
        islands,
        stubs_by_name: HashMap::new(),
        island_targets: HashMap::new(),
        bound_slots: BTreeSet::new(),
        code_slack: None,
        slot_slack: None,
    };

    let regenerated = fixer.fix_own_stubs()?;
    fixer.code_slack = Slack::find(&fixer.ctx.macho, VM_PROT_EXECUTE);
    fixer.slot_slack = Slack::find(&fixer.ctx.macho, VM_PROT_WRITE);
    let (retargeted, trapped) = fixer.fix_call_sites()?;
    fixer.emit_binds()?;

    debug!(
        "stubs: {} regenerated, {} call sites retargeted, {} trapped",
        regenerated, retargeted, trapped
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
