//! Mach-O image view over the shared cache.
//!
//! [`MachOContext`] presents one cached image as an editable Mach-O. Reads
//! go straight to the cache maps until a page is written; the first write to
//! a 4 KiB page copies it into a private buffer, and from then on that
//! buffer is what reads see. The cache files themselves are never touched.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::dyld::DyldContext;
use crate::error::{Error, Result};
use crate::util::{align_down, memchr_null};

/// Granularity of the copy-on-write page arena.
pub const VIEW_PAGE_SIZE: u64 = 0x1000;

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command from the Mach-O header
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure
    pub section: Section64,
    /// Offset of the section structure from the Mach-O header
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        self.section.name()
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Dysymtab {
        command: DysymtabCommand,
        offset: usize,
    },
    DyldInfo {
        command: DyldInfoCommand,
        offset: usize,
    },
    LinkeditData {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Dylib {
        command: DylibCommand,
        name: String,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. }
            | LoadCommandInfo::Dysymtab { offset, .. }
            | LoadCommandInfo::DyldInfo { offset, .. }
            | LoadCommandInfo::LinkeditData { offset, .. }
            | LoadCommandInfo::Dylib { offset, .. }
            | LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }

    /// Returns the load command type.
    pub fn cmd(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmd,
            LoadCommandInfo::Symtab { command, .. } => command.cmd,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmd,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmd,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmd,
            LoadCommandInfo::Dylib { command, .. } => command.cmd,
            LoadCommandInfo::Unknown { cmd, .. } => *cmd,
        }
    }
}

// =============================================================================
// Load Command Table
// =============================================================================

/// A Mach-O header and its parsed load commands.
#[derive(Debug, Clone)]
pub struct LoadCommandTable {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Parsed load commands, in file order
    pub commands: Vec<LoadCommandInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

/// Parses the header and load commands at the start of `data`.
pub fn parse_macho(data: &[u8]) -> Result<LoadCommandTable> {
    LoadCommandTable::parse(data)
}

fn lc_parse_error(offset: usize, what: &str) -> Error {
    Error::parse(offset, format!("failed to parse {what}"))
}

impl LoadCommandTable {
    /// Parses the header and load commands at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader64::SIZE {
            return Err(Error::buffer_too_small(MachHeader64::SIZE, data.len()));
        }

        let (header, _) =
            MachHeader64::read_from_prefix(data).map_err(|_| Error::InvalidMachoMagic(0))?;
        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut table = Self {
            header,
            commands: Vec::with_capacity(header.ncmds as usize),
            segment_indices: HashMap::new(),
        };

        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + header.sizeofcmds as usize;

        for _ in 0..header.ncmds {
            if offset + LoadCommand::SIZE > end_offset || offset + LoadCommand::SIZE > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let (lc, _) = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| lc_parse_error(offset, "load command"))?;

            let cmd_end = offset + lc.cmdsize as usize;
            if lc.cmdsize < LoadCommand::SIZE as u32 || cmd_end > end_offset || cmd_end > data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let info = Self::parse_load_command(lc.cmd, &data[offset..cmd_end], offset)?;
            if let LoadCommandInfo::Segment(ref seg) = info {
                table
                    .segment_indices
                    .insert(seg.name().to_string(), table.commands.len());
            }

            table.commands.push(info);
            offset = cmd_end;
        }

        Ok(table)
    }

    /// Parses a single load command. `data` spans exactly `cmdsize` bytes.
    fn parse_load_command(cmd: u32, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        match cmd {
            LC_SEGMENT_64 => {
                let (seg, _) = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| lc_parse_error(offset, "segment command"))?;

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                for i in 0..seg.nsects as usize {
                    let rel = SegmentCommand64::SIZE + i * Section64::SIZE;
                    let (section, _) = data
                        .get(rel..)
                        .and_then(|d| Section64::read_from_prefix(d).ok())
                        .ok_or_else(|| lc_parse_error(offset + rel, "section"))?;
                    sections.push(SectionInfo {
                        section,
                        struct_offset: offset + rel,
                    });
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SYMTAB => {
                let (command, _) = SymtabCommand::read_from_prefix(data)
                    .map_err(|_| lc_parse_error(offset, "symtab command"))?;
                Ok(LoadCommandInfo::Symtab { command, offset })
            }

            LC_DYSYMTAB => {
                let (command, _) = DysymtabCommand::read_from_prefix(data)
                    .map_err(|_| lc_parse_error(offset, "dysymtab command"))?;
                Ok(LoadCommandInfo::Dysymtab { command, offset })
            }

            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                let (command, _) = DyldInfoCommand::read_from_prefix(data)
                    .map_err(|_| lc_parse_error(offset, "dyld info command"))?;
                Ok(LoadCommandInfo::DyldInfo { command, offset })
            }

            LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS
            | LC_LINKER_OPTIMIZATION_HINT
            | LC_ATOM_INFO => {
                let (command, _) = LinkeditDataCommand::read_from_prefix(data)
                    .map_err(|_| lc_parse_error(offset, "linkedit data command"))?;
                Ok(LoadCommandInfo::LinkeditData { command, offset })
            }

            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                let (command, _) = DylibCommand::read_from_prefix(data)
                    .map_err(|_| lc_parse_error(offset, "dylib command"))?;

                let name = data
                    .get(command.dylib.name_offset as usize..)
                    .map(|bytes| String::from_utf8_lossy(&bytes[..memchr_null(bytes)]).into_owned())
                    .unwrap_or_default();

                Ok(LoadCommandInfo::Dylib {
                    command,
                    name,
                    offset,
                })
            }

            _ => Ok(LoadCommandInfo::Unknown {
                cmd,
                cmdsize: data.len() as u32,
                offset,
            }),
        }
    }

    /// Returns a reference to a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices
            .get(name)
            .and_then(|&idx| match self.commands.get(idx) {
                Some(LoadCommandInfo::Segment(seg)) => Some(seg),
                _ => None,
            })
    }

    /// Returns an iterator over all segments in load command order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Segment(seg) => Some(seg),
            _ => None,
        })
    }

    /// Returns the symbol table command and its offset.
    pub fn symtab(&self) -> Option<(usize, SymtabCommand)> {
        self.commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Symtab { command, offset } => Some((*offset, *command)),
            _ => None,
        })
    }

    /// Returns the dynamic symbol table command and its offset.
    pub fn dysymtab(&self) -> Option<(usize, DysymtabCommand)> {
        self.commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dysymtab { command, offset } => Some((*offset, *command)),
            _ => None,
        })
    }

    /// Returns the dyld info command and its offset.
    pub fn dyld_info(&self) -> Option<(usize, DyldInfoCommand)> {
        self.commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::DyldInfo { command, offset } => Some((*offset, *command)),
            _ => None,
        })
    }

    /// Returns the linkedit data command of type `cmd` and its offset.
    pub fn linkedit_data(&self, cmd: u32) -> Option<(usize, LinkeditDataCommand)> {
        self.commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::LinkeditData { command, offset } if command.cmd == cmd => {
                Some((*offset, *command))
            }
            _ => None,
        })
    }

    /// Returns `(install name, load command type)` for every dependency,
    /// in ordinal order. `LC_ID_DYLIB` is not a dependency.
    pub fn dylibs(&self) -> impl Iterator<Item = (&str, u32)> {
        self.commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name, .. } if command.cmd != LC_ID_DYLIB => {
                Some((name.as_str(), command.cmd))
            }
            _ => None,
        })
    }

    /// Returns the image's own install name.
    pub fn install_name(&self) -> Option<&str> {
        self.commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name, .. } if command.cmd == LC_ID_DYLIB => {
                Some(name.as_str())
            }
            _ => None,
        })
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Editable view of one image inside the shared cache.
///
/// All addresses are unslid cache virtual addresses. Every read and write
/// must stay inside one of the image's segments.
pub struct MachOContext {
    cache: Arc<DyldContext>,
    /// Address of the Mach-O header
    pub base_addr: u64,
    table: LoadCommandTable,
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl fmt::Debug for MachOContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachOContext")
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("header", &self.table.header)
            .field("load_commands", &self.table.commands.len())
            .field("owned_pages", &self.pages.len())
            .finish()
    }
}

impl MachOContext {
    /// Creates a view of the image whose header is at `base_addr`.
    pub fn new(cache: Arc<DyldContext>, base_addr: u64) -> Result<Self> {
        let table = parse_macho(cache.data_to_mapping_end(base_addr)?)?;
        Ok(Self {
            cache,
            base_addr,
            table,
            pages: BTreeMap::new(),
        })
    }

    /// Returns the cache backing this view.
    pub fn cache(&self) -> &Arc<DyldContext> {
        &self.cache
    }

    /// Returns the current Mach-O header.
    pub fn header(&self) -> &MachHeader64 {
        &self.table.header
    }

    /// Returns the parsed load commands.
    pub fn load_commands(&self) -> &[LoadCommandInfo] {
        &self.table.commands
    }

    /// Re-reads the header and load commands through the view.
    pub fn reparse(&mut self) -> Result<()> {
        let header: MachHeader64 = self.read_struct(self.base_addr)?;
        let len = MachHeader64::SIZE + header.sizeofcmds as usize;
        let table = LoadCommandTable::parse(&self.read_bytes(self.base_addr, len)?)?;
        self.table = table;
        Ok(())
    }

    // =========================================================================
    // Structure queries
    // =========================================================================

    /// Returns a reference to a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.table.segment(name)
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.table.segments()
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&SectionInfo> {
        self.segment(segment)?.section(section)
    }

    /// Returns every section with the given name, in any segment.
    ///
    /// ObjC sections move between `__DATA`, `__DATA_CONST` and `__AUTH_CONST`
    /// depending on the OS release.
    pub fn sections_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a SectionInfo> + 'a {
        self.segments()
            .flat_map(|seg| seg.sections.iter())
            .filter(move |s| s.name() == name)
    }

    /// Returns the first section with the given name, in any segment.
    pub fn find_section<'a>(&'a self, name: &'a str) -> Option<&'a SectionInfo> {
        self.sections_named(name).next()
    }

    /// Returns the segment whose VM range contains `addr`.
    pub fn segment_containing(&self, addr: u64) -> Option<&SegmentInfo> {
        self.segments().find(|seg| seg.command.contains_addr(addr))
    }

    /// Returns `(segment index, offset in segment)` for `addr`, as bind
    /// opcodes address it.
    pub fn segment_index_of(&self, addr: u64) -> Option<(u8, u64)> {
        self.segments()
            .enumerate()
            .find(|(_, seg)| seg.command.contains_addr(addr))
            .map(|(i, seg)| (i as u8, addr - seg.command.vmaddr))
    }

    /// Returns true if the address is within this image.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segment_containing(addr).is_some()
    }

    /// Returns the symbol table command and its offset.
    pub fn symtab(&self) -> Option<(usize, SymtabCommand)> {
        self.table.symtab()
    }

    /// Returns the dynamic symbol table command and its offset.
    pub fn dysymtab(&self) -> Option<(usize, DysymtabCommand)> {
        self.table.dysymtab()
    }

    /// Returns the dyld info command and its offset.
    pub fn dyld_info(&self) -> Option<(usize, DyldInfoCommand)> {
        self.table.dyld_info()
    }

    /// Returns the linkedit data command of type `cmd` and its offset.
    pub fn linkedit_data(&self, cmd: u32) -> Option<(usize, LinkeditDataCommand)> {
        self.table.linkedit_data(cmd)
    }

    /// Returns an iterator over dependency dylibs.
    pub fn dylibs(&self) -> impl Iterator<Item = (&str, u32)> {
        self.table.dylibs()
    }

    /// Returns the image's own install name.
    pub fn install_name(&self) -> Option<&str> {
        self.table.install_name()
    }

    /// Returns true if this is an ARM64 binary.
    pub fn is_arm64(&self) -> bool {
        self.table.header.is_arm64()
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    pub fn is_arm64e(&self) -> bool {
        self.table.header.is_arm64e()
    }

    // =========================================================================
    // Byte access
    // =========================================================================

    fn check_range(&self, addr: u64, len: usize) -> Result<()> {
        let inside = self.segments().any(|seg| {
            seg.command.contains_addr(addr) && len as u64 <= seg.command.vm_end() - addr
        });
        if inside {
            Ok(())
        } else {
            Err(Error::out_of_bounds(addr, len))
        }
    }

    /// Returns true if the page starting at `page_addr` has a private copy.
    pub fn is_page_owned(&self, page_addr: u64) -> bool {
        self.pages.contains_key(&page_addr)
    }

    /// Returns the private copy of the page starting at `page_addr`.
    pub fn owned_page(&self, page_addr: u64) -> Option<&[u8]> {
        self.pages.get(&page_addr).map(|p| &p[..])
    }

    /// Number of pages that have been copied out of the cache.
    pub fn owned_page_count(&self) -> usize {
        self.pages.len()
    }

    /// Reads `len` bytes at `addr`.
    ///
    /// Borrows from the cache or from a single owned page when it can, and
    /// assembles a copy when the range spans owned and cache-backed pages.
    /// Only the zero-fill tail of a segment may lie outside every mapping.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        self.check_range(addr, len)?;
        if len == 0 {
            return Ok(Cow::Borrowed(&[]));
        }

        let first_page = align_down(addr, VIEW_PAGE_SIZE);
        let last_page = align_down(addr + len as u64 - 1, VIEW_PAGE_SIZE);

        if self.pages.range(first_page..=last_page).next().is_none() {
            if let Ok(bytes) = self.cache.data_at_addr(addr, len) {
                return Ok(Cow::Borrowed(bytes));
            }
        } else if first_page == last_page {
            if let Some(page) = self.pages.get(&first_page) {
                let start = (addr - first_page) as usize;
                return Ok(Cow::Borrowed(&page[start..start + len]));
            }
        }

        let mut out = Vec::with_capacity(len);
        let end = addr + len as u64;
        let mut cur = addr;
        while cur < end {
            let page_addr = align_down(cur, VIEW_PAGE_SIZE);
            let chunk_end = end.min(page_addr + VIEW_PAGE_SIZE);
            let chunk_len = (chunk_end - cur) as usize;

            match self.pages.get(&page_addr) {
                Some(page) => {
                    let start = (cur - page_addr) as usize;
                    out.extend_from_slice(&page[start..start + chunk_len]);
                }
                None => {
                    let start = out.len();
                    out.resize(start + chunk_len, 0);
                    self.copy_from_cache(cur, &mut out[start..], false)?;
                }
            }
            cur = chunk_end;
        }

        Ok(Cow::Owned(out))
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.read_bytes(addr, 4)?))
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        Ok(LittleEndian::read_u64(&self.read_bytes(addr, 8)?))
    }

    /// Reads an on-disk structure.
    pub fn read_struct<T: FromBytes>(&self, addr: u64) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let bytes = self.read_bytes(addr, size)?;
        T::read_from_prefix(&bytes[..])
            .map(|(value, _)| value)
            .map_err(|_| Error::out_of_bounds(addr, size))
    }

    /// Reads a NUL-terminated string, stopping at the end of the segment.
    pub fn read_cstr(&self, addr: u64) -> Result<String> {
        let seg_end = self
            .segment_containing(addr)
            .map(|seg| seg.command.vm_end())
            .ok_or(Error::out_of_bounds(addr, 1))?;

        let mut out = Vec::new();
        let mut cur = addr;
        while cur < seg_end {
            let chunk_end = seg_end.min(align_down(cur, VIEW_PAGE_SIZE) + VIEW_PAGE_SIZE);
            let bytes = self.read_bytes(cur, (chunk_end - cur) as usize)?;
            let nul = memchr_null(&bytes);
            out.extend_from_slice(&bytes[..nul]);
            if nul < bytes.len() {
                break;
            }
            cur = chunk_end;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Fills `out` with the cache bytes at `addr`, one mapping at a time.
    ///
    /// Bytes no mapping covers are left zero when they fall outside every
    /// segment's file contents or when `fill_unmapped` is set; otherwise the
    /// address is reported unmapped.
    fn copy_from_cache(&self, addr: u64, out: &mut [u8], fill_unmapped: bool) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let cur = addr + done as u64;
            let remaining = out.len() - done;
            let n = match self.cache.mapping_for_addr(cur) {
                Some(mapping) => {
                    let n = ((mapping.end() - cur) as usize).min(remaining);
                    out[done..done + n].copy_from_slice(self.cache.data_at_addr(cur, n)?);
                    n
                }
                None => {
                    let file_backed = self.segments().any(|seg| {
                        cur >= seg.command.vmaddr && cur < seg.command.vmaddr + seg.command.filesize
                    });
                    if file_backed && !fill_unmapped {
                        return Err(Error::not_mapped(cur));
                    }
                    let next = self
                        .segments()
                        .map(|seg| seg.command.vmaddr)
                        .chain(self.cache.mappings.iter().map(|m| m.address))
                        .filter(|&start| start > cur)
                        .min()
                        .unwrap_or(u64::MAX);
                    ((next - cur) as usize).min(remaining)
                }
            };
            done += n;
        }
        Ok(())
    }

    /// Returns the private copy of a page, copying it out of the cache on
    /// first use. Parts of the page no mapping backs start out zeroed, since
    /// a write there is what gives them contents.
    fn page_mut(&mut self, page_addr: u64) -> Result<&mut [u8]> {
        if !self.pages.contains_key(&page_addr) {
            let mut page = vec![0u8; VIEW_PAGE_SIZE as usize].into_boxed_slice();
            self.copy_from_cache(page_addr, &mut page, true)?;
            self.pages.insert(page_addr, page);
        }
        self.pages
            .get_mut(&page_addr)
            .map(|page| &mut page[..])
            .ok_or(Error::not_mapped(page_addr))
    }

    /// Writes `data` at `addr`.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len())?;

        let end = addr + data.len() as u64;
        let mut cur = addr;
        while cur < end {
            let page_addr = align_down(cur, VIEW_PAGE_SIZE);
            let chunk_end = end.min(page_addr + VIEW_PAGE_SIZE);
            let src = &data[(cur - addr) as usize..(chunk_end - addr) as usize];
            let start = (cur - page_addr) as usize;
            self.page_mut(page_addr)?[start..start + src.len()].copy_from_slice(src);
            cur = chunk_end;
        }
        Ok(())
    }

    /// Writes a little-endian u32.
    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes a little-endian u64.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes an on-disk structure.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, addr: u64, value: &T) -> Result<()> {
        self.write_bytes(addr, value.as_bytes())
    }

    /// Replaces every page overlapping `addr..addr + len` with a zeroed
    /// private page without reading the cache.
    pub fn claim_zeroed(&mut self, addr: u64, len: u64) -> Result<()> {
        self.check_range(addr, len as usize)?;
        let mut page_addr = align_down(addr, VIEW_PAGE_SIZE);
        while page_addr < addr + len {
            self.pages
                .insert(page_addr, vec![0u8; VIEW_PAGE_SIZE as usize].into_boxed_slice());
            page_addr += VIEW_PAGE_SIZE;
        }
        Ok(())
    }

    // =========================================================================
    // Load command editing
    // =========================================================================

    /// Reads a load command structure at `offset` from the header.
    pub fn read_lc<T: FromBytes>(&self, offset: usize) -> Result<T> {
        self.read_struct(self.base_addr + offset as u64)
    }

    /// Writes a load command structure at `offset` from the header and
    /// re-parses the load commands.
    pub fn write_lc<T: IntoBytes + Immutable>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.write_struct(self.base_addr + offset as u64, value)?;
        self.reparse()
    }

    /// Writes a new header and re-parses the load commands.
    pub fn write_header(&mut self, header: &MachHeader64) -> Result<()> {
        self.write_lc(0, header)
    }

    /// Applies `edit` to the named segment command.
    pub fn rewrite_segment<F>(&mut self, name: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut SegmentCommand64),
    {
        let seg = self.segment(name).ok_or_else(|| Error::SegmentNotFound {
            name: name.to_string(),
        })?;
        let offset = seg.command_offset;
        let mut command = seg.command;
        edit(&mut command);
        self.write_lc(offset, &command)
    }

    /// Bytes free between the end of the load commands and the first
    /// `__TEXT` section.
    pub fn load_command_space(&self) -> usize {
        let used = (MachHeader64::SIZE + self.table.header.sizeofcmds as usize) as u64;
        let Some(text) = self.segment("__TEXT") else {
            return 0;
        };
        let limit = text
            .sections
            .iter()
            .filter(|s| s.section.size > 0)
            .map(|s| s.section.addr)
            .min()
            .unwrap_or(text.command.vmaddr + text.command.filesize);
        limit.saturating_sub(self.base_addr).saturating_sub(used) as usize
    }

    /// Appends a load command after the existing ones and returns its
    /// offset from the header.
    pub fn insert_load_command(&mut self, bytes: &[u8]) -> Result<usize> {
        let available = self.load_command_space();
        if bytes.len() > available {
            return Err(Error::InsufficientLoadCommandSpace {
                needed: bytes.len(),
                available,
            });
        }

        let offset = MachHeader64::SIZE + self.table.header.sizeofcmds as usize;
        self.write_bytes(self.base_addr + offset as u64, bytes)?;

        let mut header = self.table.header;
        header.ncmds += 1;
        header.sizeofcmds += bytes.len() as u32;
        self.write_header(&header)?;
        Ok(offset)
    }

    /// Removes the load command at `offset`, moving later commands down.
    pub fn remove_load_command(&mut self, offset: usize) -> Result<()> {
        let cmdsize = self
            .table
            .commands
            .iter()
            .find(|lc| lc.offset() == offset)
            .map(|_| self.read_lc::<LoadCommand>(offset))
            .transpose()?
            .ok_or_else(|| Error::parse(offset, "no load command at offset"))?
            .cmdsize as usize;

        let end = MachHeader64::SIZE + self.table.header.sizeofcmds as usize;
        let tail = self
            .read_bytes(
                self.base_addr + (offset + cmdsize) as u64,
                end - offset - cmdsize,
            )?
            .into_owned();
        self.write_bytes(self.base_addr + offset as u64, &tail)?;
        self.write_bytes(
            self.base_addr + (end - cmdsize) as u64,
            &vec![0u8; cmdsize],
        )?;

        let mut header = self.table.header;
        header.ncmds -= 1;
        header.sizeofcmds -= cmdsize as u32;
        self.write_header(&header)
    }
}
