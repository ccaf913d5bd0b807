//! Synthetic shared caches for unit tests.
//!
//! [`CacheBuilder`] lays out a single-file cache with two mappings and one
//! small arm64 dylib:
//!
//! ```text
//! file 0x0000  header, mapping tables, image table, strings   mapping 0 (r-x)
//! file 0x1000  image __TEXT   (IMAGE_ADDR, 0x3000)
//! file 0x4000  dependency dylibs, 0x2000 each (max two)
//! file 0x8000  image __DATA   (DATA_ADDR, 0x4000)             mapping 1 (rw-)
//! file 0xC000  image __LINKEDIT (LINKEDIT_ADDR, 0x4000)
//! file 0x10000 extra mappings, slide info, local symbols
//! ```

use std::mem::offset_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zerocopy::{Immutable, IntoBytes};

use crate::converter::ExtractionContext;
use crate::dyld::trie::write_uleb128;
use crate::dyld::{
    DyldCacheHeader, DyldCacheImageInfo, DyldCacheLocalSymbolsEntry, DyldCacheLocalSymbolsInfo,
    DyldCacheMappingAndSlideInfo, DyldCacheMappingInfo, DyldCacheSlideInfo2, DyldCacheSlideInfo3,
    DyldContext, DyldSubcacheEntry, MappingFlags, ObjcOptimizationHeader,
};
use crate::macho::*;

pub const TEXT_MAPPING_ADDR: u64 = 0x1_8000_0000;
pub const DATA_MAPPING_ADDR: u64 = 0x1_8001_0000;
pub const IMAGE_ADDR: u64 = TEXT_MAPPING_ADDR + 0x1000;
pub const TEXT_SECTION_ADDR: u64 = IMAGE_ADDR + 0x1000;
pub const DATA_ADDR: u64 = DATA_MAPPING_ADDR;
pub const LINKEDIT_ADDR: u64 = DATA_MAPPING_ADDR + 0x4000;
/// Header address of the first dependency dylib; the second sits 0x2000 later.
pub const DYLIB_ADDR: u64 = TEXT_MAPPING_ADDR + 0x4000;
/// Address of the ObjC optimization header, when one is requested.
pub const OBJC_OPT_ADDR: u64 = TEXT_MAPPING_ADDR + 0x700;

const MAPPING_SIZE: u64 = 0x8000;
const BASIC_MAPPINGS_OFF: usize = 0x200;
const EXT_MAPPINGS_OFF: usize = 0x300;
const IMAGES_OFF: usize = 0x500;
const SUBCACHES_OFF: usize = 0x600;
const STRINGS_OFF: usize = 0x800;
const BODY_END: usize = 0x10000;

// =============================================================================
// Trie and slide info helpers
// =============================================================================

/// Value of one export trie terminal.
#[derive(Debug, Clone)]
pub enum TrieValue {
    /// Regular export at an image-relative offset
    Regular(u64),
    /// Re-export of `name` from dependency `ordinal`
    Reexport { ordinal: u64, name: String },
}

/// Builds a trie with one edge per symbol hanging off the root.
pub fn export_trie(symbols: &[(&str, TrieValue)]) -> Vec<u8> {
    let mut terminals = Vec::new();
    for (_, value) in symbols {
        let mut info = Vec::new();
        match value {
            TrieValue::Regular(offset) => {
                write_uleb128(0, &mut info);
                write_uleb128(*offset, &mut info);
            }
            TrieValue::Reexport { ordinal, name } => {
                write_uleb128(crate::dyld::trie::EXPORT_SYMBOL_FLAGS_REEXPORT, &mut info);
                write_uleb128(*ordinal, &mut info);
                info.extend_from_slice(name.as_bytes());
                info.push(0);
            }
        }
        let mut node = Vec::new();
        write_uleb128(info.len() as u64, &mut node);
        node.extend_from_slice(&info);
        node.push(0);
        terminals.push(node);
    }

    // Two-byte child offsets cover every test trie.
    let mut root_len = 2;
    for (name, _) in symbols {
        root_len += name.len() + 1 + 2;
    }

    let mut root = vec![0u8, symbols.len() as u8];
    let mut next = root_len;
    for (i, (name, _)) in symbols.iter().enumerate() {
        root.extend_from_slice(name.as_bytes());
        root.push(0);
        root.push(0x80 | (next & 0x7F) as u8);
        root.push((next >> 7) as u8);
        next += terminals[i].len();
    }

    root.into_iter().chain(terminals.into_iter().flatten()).collect()
}

/// Builds a trie of regular exports over `(name, offset)` pairs.
pub fn flat_trie(symbols: &[(&str, u64)]) -> Vec<u8> {
    let entries: Vec<_> = symbols
        .iter()
        .map(|&(name, offset)| (name, TrieValue::Regular(offset)))
        .collect();
    export_trie(&entries)
}

/// Builds a v2 slide info blob with 4 KiB pages and no page extras.
pub fn slide_info_v2(starts: &[u16], delta_mask: u64, value_add: u64) -> Vec<u8> {
    let header_len = std::mem::size_of::<DyldCacheSlideInfo2>();
    let info = DyldCacheSlideInfo2 {
        version: 2,
        page_size: 0x1000,
        page_starts_offset: header_len as u32,
        page_starts_count: starts.len() as u32,
        page_extras_offset: (header_len + starts.len() * 2) as u32,
        page_extras_count: 0,
        delta_mask,
        value_add,
    };
    let mut blob = info.as_bytes().to_vec();
    blob.extend(starts.iter().flat_map(|s| s.to_le_bytes()));
    blob
}

/// Builds a v3 slide info blob with 4 KiB pages.
pub fn slide_info_v3(starts: &[u16], auth_value_add: u64) -> Vec<u8> {
    let info = DyldCacheSlideInfo3 {
        version: 3,
        page_size: 0x1000,
        page_starts_count: starts.len() as u32,
        _pad: 0,
        auth_value_add,
    };
    let mut blob = info.as_bytes().to_vec();
    blob.extend(starts.iter().flat_map(|s| s.to_le_bytes()));
    blob
}

// =============================================================================
// Specs
// =============================================================================

/// A section of the main image.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub segment: &'static str,
    pub name: &'static str,
    pub addr: u64,
    pub size: u64,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl SectionSpec {
    pub fn new(segment: &'static str, name: &'static str, addr: u64, size: u64) -> Self {
        Self {
            segment,
            name,
            addr,
            size,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
        }
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn reserved(mut self, reserved1: u32, reserved2: u32) -> Self {
        self.reserved1 = reserved1;
        self.reserved2 = reserved2;
        self
    }
}

/// A dependency dylib placed in mapping 0.
#[derive(Debug, Clone)]
pub struct DylibSpec {
    pub path: String,
    pub exports: Vec<(String, TrieValue)>,
    pub reexports: Vec<String>,
    /// Whether the main image loads it with `LC_LOAD_DYLIB`
    pub linked: bool,
}

impl DylibSpec {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            exports: Vec::new(),
            reexports: Vec::new(),
            linked: true,
        }
    }

    /// Exports `name` at absolute address `addr`.
    pub fn export(mut self, name: &str, addr: u64) -> Self {
        self.exports.push((name.to_string(), TrieValue::Regular(addr)));
        self
    }

    pub fn reexport_symbol(mut self, name: &str, ordinal: u64, imported: &str) -> Self {
        self.exports.push((
            name.to_string(),
            TrieValue::Reexport {
                ordinal,
                name: imported.to_string(),
            },
        ));
        self
    }

    pub fn reexport_dylib(mut self, path: &str) -> Self {
        self.reexports.push(path.to_string());
        self
    }

    pub fn unlinked(mut self) -> Self {
        self.linked = false;
        self
    }
}

struct ExtraMapping {
    address: u64,
    size: u64,
    flags: MappingFlags,
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a synthetic cache file.
pub struct CacheBuilder {
    magic: [u8; 16],
    arm64e: bool,
    image_path: String,
    aliases: Vec<String>,
    sections: Vec<SectionSpec>,
    extra_mappings: Vec<ExtraMapping>,
    subcaches: Vec<[u8; 16]>,
    symbol_file_uuid: [u8; 16],
    slide_info: Option<Vec<u8>>,
    exports: Vec<(String, u64)>,
    trie_only_exports: Vec<(String, u64)>,
    imports: Vec<(String, u8)>,
    indirect: Vec<u32>,
    local_symbols: Vec<(String, u64)>,
    dylibs: Vec<DylibSpec>,
    dyld_info: Option<Vec<u8>>,
    data_in_code: Vec<(u64, u16)>,
    objc_selector_base: Option<u64>,
    patches: Vec<(u64, Vec<u8>)>,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self {
            magic: *b"dyld_v1   arm64\0",
            arm64e: false,
            image_path: "/usr/lib/libtest.dylib".to_string(),
            aliases: Vec::new(),
            sections: vec![
                SectionSpec::new("__TEXT", "__text", TEXT_SECTION_ADDR, 0x400)
                    .flags(S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS),
                SectionSpec::new("__DATA", "__data", DATA_ADDR + 0x2000, 0x1000),
            ],
            extra_mappings: Vec::new(),
            subcaches: Vec::new(),
            symbol_file_uuid: [0u8; 16],
            slide_info: None,
            exports: Vec::new(),
            trie_only_exports: Vec::new(),
            imports: Vec::new(),
            indirect: Vec::new(),
            local_symbols: Vec::new(),
            dylibs: Vec::new(),
            dyld_info: None,
            data_in_code: Vec::new(),
            objc_selector_base: None,
            patches: Vec::new(),
        }
    }

    pub fn magic(mut self, magic: [u8; 16]) -> Self {
        self.magic = magic;
        self
    }

    pub fn arm64e(mut self) -> Self {
        self.magic = *b"dyld_v1  arm64e\0";
        self.arm64e = true;
        self
    }

    pub fn image_path(mut self, path: &str) -> Self {
        self.image_path = path.to_string();
        self
    }

    /// Adds another image table entry pointing at the same image.
    pub fn alias_image(mut self, path: &str) -> Self {
        self.aliases.push(path.to_string());
        self
    }

    pub fn section(mut self, section: SectionSpec) -> Self {
        self.sections.push(section);
        self
    }

    pub fn extra_mapping(mut self, address: u64, size: u64, flags: MappingFlags) -> Self {
        self.extra_mappings.push(ExtraMapping {
            address,
            size,
            flags,
        });
        self
    }

    pub fn subcache_entry(mut self, uuid: [u8; 16]) -> Self {
        self.subcaches.push(uuid);
        self
    }

    pub fn symbol_file_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.symbol_file_uuid = uuid;
        self
    }

    /// Attaches a slide info blob to the data mapping.
    pub fn slide_info(mut self, blob: Vec<u8>) -> Self {
        self.slide_info = Some(blob);
        self
    }

    /// Adds an external definition, also listed in the export trie.
    pub fn export_symbol(mut self, name: &str, addr: u64) -> Self {
        self.exports.push((name.to_string(), addr));
        self
    }

    /// Adds an export trie entry with no symbol table entry.
    pub fn trie_export(mut self, name: &str, addr: u64) -> Self {
        self.trie_only_exports.push((name.to_string(), addr));
        self
    }

    pub fn import_symbol(mut self, name: &str, ordinal: u8) -> Self {
        self.imports.push((name.to_string(), ordinal));
        self
    }

    pub fn indirect_symbols(mut self, indirect: &[u32]) -> Self {
        self.indirect = indirect.to_vec();
        self
    }

    /// Adds a symbol to the cache's local symbols table.
    pub fn local_symbol(mut self, name: &str, addr: u64) -> Self {
        self.local_symbols.push((name.to_string(), addr));
        self
    }

    pub fn dylib(mut self, dylib: DylibSpec) -> Self {
        assert!(self.dylibs.len() < 2, "at most two dependency dylibs");
        self.dylibs.push(dylib);
        self
    }

    /// Adds `LC_DYLD_INFO_ONLY` with the given bind opcodes.
    pub fn dyld_info(mut self, bind: Vec<u8>) -> Self {
        self.dyld_info = Some(bind);
        self
    }

    /// Adds an ObjC optimization header with the given selector base.
    pub fn objc_opt(mut self, selector_base: u64) -> Self {
        self.objc_selector_base = Some(selector_base);
        self
    }

    /// Marks `(addr, length)` ranges of the image's code as data.
    pub fn data_in_code(mut self, ranges: &[(u64, u16)]) -> Self {
        self.data_in_code.extend_from_slice(ranges);
        self
    }

    /// Overwrites cache bytes at `addr` after layout.
    pub fn patch(mut self, addr: u64, bytes: &[u8]) -> Self {
        self.patches.push((addr, bytes.to_vec()));
        self
    }

    pub fn build(self) -> CacheFixture {
        let bytes = self.layout();
        let fixture = CacheFixture::new();
        std::fs::write(&fixture.path, bytes).unwrap();
        fixture
    }

    fn layout(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BODY_END];

        // (address, size, file offset, init prot, flags)
        let mut mappings: Vec<(u64, u64, u64, u32, MappingFlags)> = vec![
            (TEXT_MAPPING_ADDR, MAPPING_SIZE, 0, 5, MappingFlags::empty()),
            (DATA_MAPPING_ADDR, MAPPING_SIZE, 0x8000, 3, MappingFlags::DIRTY_DATA),
        ];
        for extra in &self.extra_mappings {
            let file_offset = buf.len() as u64;
            buf.resize(buf.len() + extra.size as usize, 0);
            mappings.push((extra.address, extra.size, file_offset, 5, extra.flags));
        }

        let mut slide = (0u64, 0u64);
        if let Some(blob) = &self.slide_info {
            slide = (buf.len() as u64, blob.len() as u64);
            buf.extend_from_slice(blob);
        }

        for (i, &(address, size, file_offset, prot, flags)) in mappings.iter().enumerate() {
            let basic = DyldCacheMappingInfo {
                address,
                size,
                file_offset,
                max_prot: prot,
                init_prot: prot,
            };
            put(&mut buf, BASIC_MAPPINGS_OFF + i * 32, &basic);

            let (slide_off, slide_size) = if i == 1 { slide } else { (0, 0) };
            let extended = DyldCacheMappingAndSlideInfo {
                address,
                size,
                file_offset,
                slide_info_file_offset: slide_off,
                slide_info_file_size: slide_size,
                flags: flags.bits(),
                max_prot: prot,
                init_prot: prot,
            };
            put(&mut buf, EXT_MAPPINGS_OFF + i * 56, &extended);
        }

        // Image table and paths
        let mut strings = STRINGS_OFF;
        let mut images = Vec::new();
        for path in std::iter::once(&self.image_path).chain(&self.aliases) {
            images.push((IMAGE_ADDR, path.as_str()));
        }
        for (i, dylib) in self.dylibs.iter().enumerate() {
            images.push((DYLIB_ADDR + i as u64 * 0x2000, dylib.path.as_str()));
        }
        for (i, &(address, path)) in images.iter().enumerate() {
            let info = DyldCacheImageInfo {
                address,
                mod_time: 0,
                inode: 0,
                path_file_offset: strings as u32,
                pad: 0,
            };
            put(&mut buf, IMAGES_OFF + i * 32, &info);
            buf[strings..strings + path.len()].copy_from_slice(path.as_bytes());
            strings += path.len() + 1;
        }

        for (i, uuid) in self.subcaches.iter().enumerate() {
            let entry = DyldSubcacheEntry {
                uuid: *uuid,
                cache_vm_offset: 0x1000_0000 * (i as u64 + 1),
            };
            put(&mut buf, SUBCACHES_OFF + i * 24, &entry);
        }

        if let Some(base) = self.objc_selector_base {
            let opt = ObjcOptimizationHeader {
                version: 1,
                flags: 0,
                header_info_ro_cache_offset: 0,
                header_info_rw_cache_offset: 0,
                selector_hash_table_cache_offset: 0,
                class_hash_table_cache_offset: 0,
                protocol_hash_table_cache_offset: 0,
                relative_method_selector_base_address_offset: base - TEXT_MAPPING_ADDR,
            };
            put(&mut buf, (OBJC_OPT_ADDR - TEXT_MAPPING_ADDR) as usize, &opt);
        }

        let local_symbols = self.local_symbols_blob();
        let local_symbols_offset = buf.len() as u64;
        buf.extend_from_slice(&local_symbols);

        // Header
        buf[..16].copy_from_slice(&self.magic);
        put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), BASIC_MAPPINGS_OFF as u32);
        put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), mappings.len() as u32);
        buf[offset_of!(DyldCacheHeader, uuid)..][..16].copy_from_slice(&[1u8; 16]);
        put_u32(
            &mut buf,
            offset_of!(DyldCacheHeader, mapping_with_slide_offset),
            EXT_MAPPINGS_OFF as u32,
        );
        put_u32(
            &mut buf,
            offset_of!(DyldCacheHeader, mapping_with_slide_count),
            mappings.len() as u32,
        );
        put_u32(&mut buf, offset_of!(DyldCacheHeader, images_offset), IMAGES_OFF as u32);
        put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count), images.len() as u32);
        if !self.subcaches.is_empty() {
            put_u32(
                &mut buf,
                offset_of!(DyldCacheHeader, sub_cache_array_offset),
                SUBCACHES_OFF as u32,
            );
            put_u32(
                &mut buf,
                offset_of!(DyldCacheHeader, sub_cache_array_count),
                self.subcaches.len() as u32,
            );
        }
        buf[offset_of!(DyldCacheHeader, symbol_file_uuid)..][..16]
            .copy_from_slice(&self.symbol_file_uuid);
        if !self.local_symbols.is_empty() {
            put_u64(
                &mut buf,
                offset_of!(DyldCacheHeader, local_symbols_offset),
                local_symbols_offset,
            );
            put_u64(
                &mut buf,
                offset_of!(DyldCacheHeader, local_symbols_size),
                local_symbols.len() as u64,
            );
        }
        if self.objc_selector_base.is_some() {
            put_u64(
                &mut buf,
                offset_of!(DyldCacheHeader, objc_opts_offset),
                OBJC_OPT_ADDR - TEXT_MAPPING_ADDR,
            );
            put_u64(
                &mut buf,
                offset_of!(DyldCacheHeader, objc_opts_size),
                std::mem::size_of::<ObjcOptimizationHeader>() as u64,
            );
        }

        self.layout_image(&mut buf);
        for (i, dylib) in self.dylibs.iter().enumerate() {
            layout_dylib(&mut buf, dylib, DYLIB_ADDR + i as u64 * 0x2000);
        }

        for (addr, bytes) in &self.patches {
            let &(address, _, file_offset, _, _) = mappings
                .iter()
                .find(|m| *addr >= m.0 && *addr < m.0 + m.1)
                .unwrap_or_else(|| panic!("patch address {addr:#x} is not mapped"));
            let off = (file_offset + (addr - address)) as usize;
            buf[off..off + bytes.len()].copy_from_slice(bytes);
        }

        buf
    }

    fn local_symbols_blob(&self) -> Vec<u8> {
        if self.local_symbols.is_empty() {
            return Vec::new();
        }
        let info_len = std::mem::size_of::<DyldCacheLocalSymbolsInfo>();
        let entry_len = std::mem::size_of::<DyldCacheLocalSymbolsEntry>();
        let nlist_offset = info_len + entry_len;
        let strings_offset = nlist_offset + self.local_symbols.len() * Nlist64::SIZE;

        let mut strings = vec![0u8];
        let mut nlists = Vec::new();
        for (name, addr) in &self.local_symbols {
            nlists.push(Nlist64 {
                n_strx: strings.len() as u32,
                n_type: N_SECT,
                n_sect: 1,
                n_desc: 0,
                n_value: *addr,
            });
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }

        let info = DyldCacheLocalSymbolsInfo {
            nlist_offset: nlist_offset as u32,
            nlist_count: nlists.len() as u32,
            strings_offset: strings_offset as u32,
            strings_size: strings.len() as u32,
            entries_offset: info_len as u32,
            entries_count: 1,
        };
        let entry = DyldCacheLocalSymbolsEntry {
            dylib_offset: (IMAGE_ADDR - TEXT_MAPPING_ADDR) as u32,
            nlist_start_index: 0,
            nlist_count: nlists.len() as u32,
        };

        let mut blob = info.as_bytes().to_vec();
        blob.extend_from_slice(entry.as_bytes());
        for nlist in &nlists {
            blob.extend_from_slice(nlist.as_bytes());
        }
        blob.extend_from_slice(&strings);
        blob
    }

    /// Writes the main image's header, load commands and linkedit.
    fn layout_image(&self, buf: &mut [u8]) {
        let linkedit_file = 0xC000usize;

        // Linkedit contents
        let mut linkedit = vec![0x80u8, 0x20, 0, 0, 0, 0, 0, 0];
        let function_starts = (0usize, 8usize);

        let mut trie_entries: Vec<(&str, u64)> = self
            .exports
            .iter()
            .chain(&self.trie_only_exports)
            .map(|(name, addr)| (name.as_str(), addr - IMAGE_ADDR))
            .collect();
        trie_entries.sort_by(|a, b| a.0.cmp(b.0));
        let trie = flat_trie(&trie_entries);
        let trie_range = (linkedit.len(), trie.len());
        linkedit.extend_from_slice(&trie);
        pad8(&mut linkedit);

        let mut strings = vec![0u8];
        let mut nlists = Vec::new();
        for (name, addr) in &self.exports {
            nlists.push(Nlist64 {
                n_strx: strings.len() as u32,
                n_type: N_SECT | N_EXT,
                n_sect: 1,
                n_desc: 0,
                n_value: *addr,
            });
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        for (name, ordinal) in &self.imports {
            nlists.push(Nlist64::undefined(strings.len() as u32, *ordinal));
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        let symoff = linkedit.len();
        for nlist in &nlists {
            linkedit.extend_from_slice(nlist.as_bytes());
        }

        let indirectoff = linkedit.len();
        for index in &self.indirect {
            linkedit.extend_from_slice(&index.to_le_bytes());
        }
        pad8(&mut linkedit);

        let bind_range = self.dyld_info.as_ref().map(|bind| {
            let start = linkedit.len();
            linkedit.extend_from_slice(bind);
            pad8(&mut linkedit);
            (start, bind.len())
        });

        let stroff = linkedit.len();
        linkedit.extend_from_slice(&strings);
        pad8(&mut linkedit);

        let data_in_code = (linkedit.len(), self.data_in_code.len() * 8);
        for &(addr, length) in &self.data_in_code {
            linkedit.extend_from_slice(&((addr - IMAGE_ADDR) as u32).to_le_bytes());
            linkedit.extend_from_slice(&length.to_le_bytes());
            linkedit.extend_from_slice(&0x0001u16.to_le_bytes());
        }

        let codesig = linkedit.len();
        linkedit.extend_from_slice(&[0xFA, 0xDE, 0x0C, 0xC0, 0, 0, 0, 16, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(linkedit.len() <= 0x4000);
        buf[linkedit_file..linkedit_file + linkedit.len()].copy_from_slice(&linkedit);

        let file_of = |rel: usize| (linkedit_file + rel) as u32;

        // Load commands
        let mut cmds = Vec::new();
        let mut ncmds = 0u32;
        let segments = [
            ("__TEXT", IMAGE_ADDR, 0x3000u64, 0x1000u64, 5u32),
            ("__DATA", DATA_ADDR, 0x4000, 0x8000, 3),
            ("__LINKEDIT", LINKEDIT_ADDR, 0x4000, 0xC000, 1),
        ];
        for (name, vmaddr, size, fileoff, prot) in segments {
            let sections: Vec<_> = self.sections.iter().filter(|s| s.segment == name).collect();
            let mut seg = SegmentCommand64 {
                cmdsize: (SegmentCommand64::SIZE + sections.len() * Section64::SIZE) as u32,
                vmaddr,
                vmsize: size,
                fileoff,
                filesize: size,
                maxprot: prot,
                initprot: prot,
                nsects: sections.len() as u32,
                ..Default::default()
            };
            seg.set_name(name);
            cmds.extend_from_slice(seg.as_bytes());
            for info in sections {
                let mut sect = Section64 {
                    addr: info.addr,
                    size: info.size,
                    offset: (fileoff + (info.addr - vmaddr)) as u32,
                    align: 3,
                    flags: info.flags,
                    reserved1: info.reserved1,
                    reserved2: info.reserved2,
                    ..Default::default()
                };
                sect.set_name(info.name);
                sect.segname[..name.len()].copy_from_slice(name.as_bytes());
                cmds.extend_from_slice(sect.as_bytes());
            }
            ncmds += 1;
        }

        push_dylib_command(&mut cmds, LC_ID_DYLIB, &self.image_path);
        ncmds += 1;
        for dylib in self.dylibs.iter().filter(|d| d.linked) {
            push_dylib_command(&mut cmds, LC_LOAD_DYLIB, &dylib.path);
            ncmds += 1;
        }

        if let Some((bind_off, bind_size)) = bind_range {
            let info = DyldInfoCommand {
                bind_off: file_of(bind_off),
                bind_size: bind_size as u32,
                ..Default::default()
            };
            cmds.extend_from_slice(info.as_bytes());
            ncmds += 1;
        }

        let symtab = SymtabCommand {
            symoff: file_of(symoff),
            nsyms: nlists.len() as u32,
            stroff: file_of(stroff),
            strsize: strings.len() as u32,
            ..Default::default()
        };
        cmds.extend_from_slice(symtab.as_bytes());
        let dysymtab = DysymtabCommand {
            ilocalsym: 0,
            nlocalsym: 0,
            iextdefsym: 0,
            nextdefsym: self.exports.len() as u32,
            iundefsym: self.exports.len() as u32,
            nundefsym: self.imports.len() as u32,
            indirectsymoff: if self.indirect.is_empty() { 0 } else { file_of(indirectoff) },
            nindirectsyms: self.indirect.len() as u32,
            ..Default::default()
        };
        cmds.extend_from_slice(dysymtab.as_bytes());
        ncmds += 2;

        let mut data_commands = vec![
            (LC_DYLD_EXPORTS_TRIE, trie_range),
            (LC_FUNCTION_STARTS, function_starts),
        ];
        if !self.data_in_code.is_empty() {
            data_commands.push((LC_DATA_IN_CODE, data_in_code));
        }
        data_commands.push((LC_CODE_SIGNATURE, (codesig, 16)));
        for (cmd, (rel, len)) in data_commands {
            let lc = LinkeditDataCommand {
                cmd,
                cmdsize: LinkeditDataCommand::SIZE as u32,
                dataoff: file_of(rel),
                datasize: len as u32,
            };
            cmds.extend_from_slice(lc.as_bytes());
            ncmds += 1;
        }

        let header = MachHeader64 {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: if self.arm64e { CPU_SUBTYPE_ARM64E } else { CPU_SUBTYPE_ARM64_ALL },
            filetype: MH_DYLIB,
            ncmds,
            sizeofcmds: cmds.len() as u32,
            flags: (MachOFlags::NOUNDEFS
                | MachOFlags::DYLDLINK
                | MachOFlags::TWOLEVEL
                | MachOFlags::DYLIB_IN_CACHE)
                .bits(),
            ..Default::default()
        };
        let image_file = (IMAGE_ADDR - TEXT_MAPPING_ADDR) as usize;
        put(buf, image_file, &header);
        buf[image_file + MachHeader64::SIZE..][..cmds.len()].copy_from_slice(&cmds);
    }
}

/// Writes a dependency dylib with an export trie at `base`.
fn layout_dylib(buf: &mut [u8], dylib: &DylibSpec, base: u64) {
    let file = (base - TEXT_MAPPING_ADDR) as usize;
    let linkedit_file = file + 0x1000;

    let entries: Vec<(&str, TrieValue)> = dylib
        .exports
        .iter()
        .map(|(name, value)| match value {
            TrieValue::Regular(addr) => (name.as_str(), TrieValue::Regular(addr - base)),
            other => (name.as_str(), other.clone()),
        })
        .collect();
    let trie = export_trie(&entries);
    buf[linkedit_file..linkedit_file + trie.len()].copy_from_slice(&trie);

    let mut cmds = Vec::new();
    let mut ncmds = 0;
    for (name, vmaddr, fileoff) in [
        ("__TEXT", base, file as u64),
        ("__LINKEDIT", base + 0x1000, linkedit_file as u64),
    ] {
        let mut seg = SegmentCommand64 {
            vmaddr,
            vmsize: 0x1000,
            fileoff,
            filesize: 0x1000,
            maxprot: 5,
            initprot: 5,
            ..Default::default()
        };
        seg.set_name(name);
        cmds.extend_from_slice(seg.as_bytes());
        ncmds += 1;
    }
    push_dylib_command(&mut cmds, LC_ID_DYLIB, &dylib.path);
    ncmds += 1;
    for child in &dylib.reexports {
        push_dylib_command(&mut cmds, LC_REEXPORT_DYLIB, child);
        ncmds += 1;
    }
    let lc = LinkeditDataCommand {
        cmd: LC_DYLD_EXPORTS_TRIE,
        cmdsize: LinkeditDataCommand::SIZE as u32,
        dataoff: linkedit_file as u32,
        datasize: trie.len() as u32,
    };
    cmds.extend_from_slice(lc.as_bytes());
    ncmds += 1;

    let header = MachHeader64 {
        cputype: CPU_TYPE_ARM64,
        filetype: MH_DYLIB,
        ncmds,
        sizeofcmds: cmds.len() as u32,
        ..Default::default()
    };
    put(buf, file, &header);
    buf[file + MachHeader64::SIZE..][..cmds.len()].copy_from_slice(&cmds);
}

fn push_dylib_command(cmds: &mut Vec<u8>, cmd: u32, path: &str) {
    let name_len = (path.len() + 1 + 7) & !7;
    let lc = DylibCommand {
        cmd,
        cmdsize: (DylibCommand::SIZE + name_len) as u32,
        dylib: Dylib {
            name_offset: DylibCommand::SIZE as u32,
            timestamp: 2,
            current_version: 0x10000,
            compatibility_version: 0x10000,
        },
    };
    cmds.extend_from_slice(lc.as_bytes());
    let start = cmds.len();
    cmds.extend_from_slice(path.as_bytes());
    cmds.resize(start + name_len, 0);
}

fn pad8(data: &mut Vec<u8>) {
    data.resize((data.len() + 7) & !7, 0);
}

fn put<T: IntoBytes + Immutable>(buf: &mut [u8], offset: usize, value: &T) {
    let bytes = value.as_bytes();
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Fixture
// =============================================================================

static NEXT_FIXTURE: AtomicUsize = AtomicUsize::new(0);

/// A cache file in its own temporary directory, removed on drop.
pub struct CacheFixture {
    dir: PathBuf,
    path: PathBuf,
}

impl CacheFixture {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!(
            "dscextract-test-{}-{}",
            std::process::id(),
            NEXT_FIXTURE.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dyld_shared_cache_arm64");
        Self { dir, path }
    }

    /// Path of the main cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The fixture's temporary directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens the cache.
    pub fn open(&self) -> Arc<DyldContext> {
        Arc::new(DyldContext::open(&self.path).unwrap())
    }

    /// Opens the cache and an extraction context for the main image.
    pub fn context(&self) -> ExtractionContext {
        let cache = self.open();
        let macho = MachOContext::new(cache.clone(), IMAGE_ADDR).unwrap();
        let path = cache.images[0].path.clone();
        ExtractionContext::new(cache, macho, path, IMAGE_ADDR)
    }
}

impl Drop for CacheFixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
