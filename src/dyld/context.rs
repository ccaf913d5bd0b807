//! Dyld shared cache context and file handling.
//!
//! [`DyldContext`] owns the memory maps of the main cache file, its numbered
//! sub-caches and the optional `.symbols` file, and answers address
//! questions over the union of their mappings.

use std::fs::File;
use std::mem::offset_of;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};
use zerocopy::FromBytes;

use super::slide::{PointerAuth, SlideInfo};
use super::structs::*;
use crate::error::{Error, Result};
use crate::macho::{parse_macho, Nlist64};
use crate::util::{cstr_at, memchr_null, read_u64_le};

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry that works with both basic and extended mapping formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
    /// File offset to slide info (0 if none)
    pub slide_info_offset: u64,
    /// Size of slide info (0 if none)
    pub slide_info_size: u64,
    /// Mapping flags
    pub flags: MappingFlags,
    /// Index of the file containing this mapping (0 = main cache)
    pub subcache_index: usize,
}

impl MappingEntry {
    /// Creates a mapping entry from basic mapping info.
    pub fn from_basic(info: &DyldCacheMappingInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            slide_info_offset: 0,
            slide_info_size: 0,
            flags: MappingFlags::empty(),
            subcache_index,
        }
    }

    /// Creates a mapping entry from extended mapping info.
    pub fn from_extended(info: &DyldCacheMappingAndSlideInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            slide_info_offset: info.slide_info_file_offset,
            slide_info_size: info.slide_info_file_size,
            flags: MappingFlags::from_bits_truncate(info.flags),
            subcache_index,
        }
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// Exclusive end address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    /// Returns true if this mapping has slide info.
    #[inline]
    pub fn has_slide_info(&self) -> bool {
        self.slide_info_size > 0
    }
}

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Install path of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Index of the file containing the image header
    pub subcache_index: usize,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the install path contains `filter`, ignoring case.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.to_lowercase().contains(&filter.to_lowercase())
    }
}

// =============================================================================
// Subcache Entry
// =============================================================================

/// A loaded sub-cache or symbols file.
#[derive(Debug)]
pub struct SubcacheFile {
    /// Memory-mapped file data
    pub mmap: Mmap,
    /// Path to the file
    pub path: PathBuf,
    /// VM offset from the main cache
    pub vm_offset: u64,
    /// Parsed header
    pub header: DyldCacheHeader,
}

/// A local symbol the cache stripped out of an image.
#[derive(Debug, Clone)]
pub struct LocalSymbol {
    pub name: String,
    pub nlist: Nlist64,
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// Read-only once [`DyldContext::open`] returns; extractions share it
/// through an `Arc`. Dropping it unmaps every cache file.
#[derive(Debug)]
pub struct DyldContext {
    /// Main cache file (memory-mapped)
    pub mmap: Mmap,
    /// Path to the main cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
    /// All mappings (including from subcaches), sorted by address
    pub mappings: Vec<MappingEntry>,
    /// All images
    pub images: Vec<ImageEntry>,
    /// Subcache files
    pub subcaches: Vec<SubcacheFile>,
    /// Symbols file (if separate)
    pub symbols_file: Option<SubcacheFile>,
    /// Local symbols info (if available)
    pub local_symbols_info: Option<DyldCacheLocalSymbolsInfo>,
    /// Address of the main cache's first mapping
    pub base_address: u64,
    /// Shared region start address
    pub shared_region_start: u64,
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    ///
    /// Sub-caches named by the header are loaded from the same directory and
    /// a missing one is an error. A missing `.symbols` file only costs the
    /// local symbols.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mmap = map_file(&path)?;
        let header = Self::parse_header(&mmap)?;
        let mappings = Self::parse_mappings(&mmap, &header, 0)?;
        let base_address = mappings.first().map(|m| m.address).unwrap_or(0);

        let shared_region_start = if header
            .contains_field(offset_of!(DyldCacheHeader, shared_region_start))
            && header.shared_region_start != 0
        {
            header.shared_region_start
        } else {
            base_address
        };

        let mut ctx = Self {
            mmap,
            path: path.clone(),
            header,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
            symbols_file: None,
            local_symbols_info: None,
            base_address,
            shared_region_start,
        };

        ctx.load_subcaches(&path)?;
        ctx.load_symbols_file(&path)?;
        ctx.sort_and_check_mappings()?;

        ctx.images = ctx.parse_images()?;
        ctx.parse_local_symbols()?;

        debug!(
            "opened {} ({} mappings, {} images, {} sub-caches)",
            path.display(),
            ctx.mappings.len(),
            ctx.images.len(),
            ctx.subcaches.len()
        );

        Ok(ctx)
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < 16 {
            return Err(Error::buffer_too_small(16, data.len()));
        }
        if &data[..4] != DYLD_CACHE_MAGIC_PREFIX {
            return Err(Error::InvalidMagic([data[0], data[1], data[2], data[3]]));
        }

        // Older headers are shorter than the struct. Zero-fill the tail so
        // only `contains_field` decides what is present.
        let mut raw = [0u8; std::mem::size_of::<DyldCacheHeader>()];
        let n = raw.len().min(data.len());
        raw[..n].copy_from_slice(&data[..n]);

        let (header, _) = DyldCacheHeader::read_from_prefix(&raw[..])
            .map_err(|_| Error::parse(0, "failed to parse dyld cache header"))?;
        Ok(header)
    }

    /// Parses mapping entries from one cache file.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        let use_extended = header
            .contains_field(offset_of!(DyldCacheHeader, mapping_with_slide_offset))
            && header.mapping_with_slide_offset != 0;

        let mut mappings = Vec::with_capacity(header.mapping_count as usize);

        if use_extended {
            let offset = header.mapping_with_slide_offset as usize;
            for i in 0..header.mapping_with_slide_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
                let (info, _) = data
                    .get(entry_offset..)
                    .and_then(|d| DyldCacheMappingAndSlideInfo::read_from_prefix(d).ok())
                    .ok_or_else(|| Error::parse(entry_offset, "failed to parse extended mapping"))?;
                mappings.push(MappingEntry::from_extended(&info, subcache_index));
            }
        } else {
            let offset = header.mapping_offset as usize;
            for i in 0..header.mapping_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingInfo>();
                let (info, _) = data
                    .get(entry_offset..)
                    .and_then(|d| DyldCacheMappingInfo::read_from_prefix(d).ok())
                    .ok_or_else(|| Error::parse(entry_offset, "failed to parse mapping"))?;
                mappings.push(MappingEntry::from_basic(&info, subcache_index));
            }

            // Legacy caches carry one slide info blob in the header; it
            // always describes the data mapping.
            if header.slide_info_offset_unused != 0 && mappings.len() > 1 {
                mappings[1].slide_info_offset = header.slide_info_offset_unused;
                mappings[1].slide_info_size = header.slide_info_size_unused;
            }
        }

        Ok(mappings)
    }

    /// Loads subcache files.
    fn load_subcaches(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        let count = self.header.sub_cache_array_count as usize;
        let offset = self.header.sub_cache_array_offset as usize;
        let v2 = self.has_v2_subcache_entries();

        let entry_size = if v2 {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        for i in 0..count {
            let entry_offset = offset + i * entry_size;
            let bytes = self
                .mmap
                .get(entry_offset..)
                .ok_or_else(|| Error::parse(entry_offset, "subcache entry out of bounds"))?;

            let (uuid, vm_offset, suffix) = if v2 {
                let (entry, _) = DyldSubcacheEntry2::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry v2"))?;
                (entry.uuid, entry.cache_vm_offset, entry.suffix_str().to_string())
            } else {
                let (entry, _) = DyldSubcacheEntry::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry"))?;
                (entry.uuid, entry.cache_vm_offset, format!(".{}", i + 1))
            };

            let subcache_path = parent_dir.join(format!("{}{}", main_name, suffix));
            self.load_subcache_file(&subcache_path, uuid, vm_offset, i + 1)?;
        }

        Ok(())
    }

    /// Loads a single subcache file.
    fn load_subcache_file(
        &mut self,
        path: &Path,
        expected_uuid: [u8; 16],
        vm_offset: u64,
        subcache_index: usize,
    ) -> Result<()> {
        if !path.exists() {
            return Err(Error::SubcacheNotFound {
                path: path.to_path_buf(),
            });
        }

        let mmap = map_file(path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != expected_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(&expected_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        let subcache_mappings = Self::parse_mappings(&mmap, &header, subcache_index)?;
        debug!(
            "loaded sub-cache {} with {} mappings",
            path.display(),
            subcache_mappings.len()
        );
        self.mappings.extend(subcache_mappings);

        self.subcaches.push(SubcacheFile {
            mmap,
            path: path.to_path_buf(),
            vm_offset,
            header,
        });

        Ok(())
    }

    /// Loads the symbols file if the header names one.
    fn load_symbols_file(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let symbols_path = parent_dir.join(format!("{}.symbols", main_name));

        if !symbols_path.exists() {
            warn!(
                "symbols file {} not found, local symbols will not be restored",
                symbols_path.display()
            );
            return Ok(());
        }

        let mmap = map_file(&symbols_path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != self.header.symbol_file_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: symbols_path,
                expected: uuid_to_string(&self.header.symbol_file_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        self.symbols_file = Some(SubcacheFile {
            mmap,
            path: symbols_path,
            vm_offset: 0,
            header,
        });

        Ok(())
    }

    /// Sorts mappings by address and rejects overlapping neighbours.
    fn sort_and_check_mappings(&mut self) -> Result<()> {
        self.mappings.sort_by_key(|m| m.address);
        for pair in self.mappings.windows(2) {
            if pair[0].end() > pair[1].address {
                return Err(Error::OverlappingMappings {
                    first: pair[0].address,
                    second: pair[1].address,
                });
            }
        }
        Ok(())
    }

    /// Parses the image list.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;

        let mut images = Vec::with_capacity(count);

        for i in 0..count {
            let entry_offset = offset + i * std::mem::size_of::<DyldCacheImageInfo>();
            let (info, _) = self
                .mmap
                .get(entry_offset..)
                .and_then(|d| DyldCacheImageInfo::read_from_prefix(d).ok())
                .ok_or_else(|| Error::parse(entry_offset, "failed to parse image info"))?;

            let path = self.read_string(info.path_file_offset as usize)?;
            let subcache_index = self
                .mapping_for_addr(info.address)
                .map(|m| m.subcache_index)
                .unwrap_or(0);

            images.push(ImageEntry {
                index: i,
                address: info.address,
                path,
                subcache_index,
            });
        }

        Ok(images)
    }

    /// Parses local symbols info.
    fn parse_local_symbols(&mut self) -> Result<()> {
        let (Some(data), Some(offset)) = (self.symbols_cache_data(), self.local_symbols_offset())
        else {
            return Ok(());
        };
        let offset = offset as usize;

        let Some(bytes) = data.get(offset..) else {
            warn!("local symbols offset {:#x} is past the end of the file", offset);
            return Ok(());
        };

        let (info, _) = DyldCacheLocalSymbolsInfo::read_from_prefix(bytes)
            .map_err(|_| Error::parse(offset, "failed to parse local symbols info"))?;

        self.local_symbols_info = Some(info);
        Ok(())
    }

    /// Checks if this cache uses v2 subcache entries (with a file suffix).
    fn has_v2_subcache_entries(&self) -> bool {
        let offset = self.header.sub_cache_array_offset as usize;
        match self
            .mmap
            .get(offset..)
            .and_then(|d| DyldSubcacheEntry2::read_from_prefix(d).ok())
        {
            Some((entry, _)) => entry.file_suffix[0] == b'.',
            None => false,
        }
    }

    /// Reads a null-terminated string at a main cache file offset.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        let bytes = self
            .mmap
            .get(offset..)
            .ok_or_else(|| Error::parse(offset, "string offset out of bounds"))?;
        let end = memchr_null(bytes);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| Error::parse(offset, "invalid UTF-8 string"))
    }

    /// Converts a virtual address to a file offset in its own file.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.mapping_for_addr(addr).map(|m| m.addr_to_offset(addr))
    }

    /// Returns `len` bytes at `addr`. The range must lie within one mapping.
    #[inline]
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let mapping = self.mapping_for_addr(addr).ok_or(Error::not_mapped(addr))?;
        if len as u64 > mapping.end() - addr {
            return Err(Error::not_mapped(mapping.end()));
        }

        let offset = mapping.addr_to_offset(addr) as usize;
        let data = self.data_for_subcache(mapping.subcache_index);
        data.get(offset..offset + len)
            .ok_or_else(|| Error::buffer_too_small(offset + len, data.len()))
    }

    /// Returns the bytes from `addr` to the end of its mapping.
    pub fn data_to_mapping_end(&self, addr: u64) -> Result<&[u8]> {
        let mapping = self.mapping_for_addr(addr).ok_or(Error::not_mapped(addr))?;
        let data = self.data_for_subcache(mapping.subcache_index);
        let start = (mapping.addr_to_offset(addr) as usize).min(data.len());
        let end = (mapping.addr_to_offset(mapping.end()) as usize).min(data.len());
        Ok(&data[start..end])
    }

    /// Reads the NUL-terminated string at a cache address.
    pub fn read_cstr_at(&self, addr: u64) -> Result<&str> {
        Ok(cstr_at(self.data_to_mapping_end(addr)?))
    }

    /// Reads a pointer at `addr`, undoing the slide encoding of its mapping.
    pub fn read_pointer(&self, addr: u64) -> Result<u64> {
        let mapping = self.mapping_for_addr(addr).ok_or(Error::not_mapped(addr))?;
        let raw = read_u64_le(self.data_at_addr(addr, 8)?);
        match self.slide_info(mapping)? {
            Some(slide) => Ok(slide.decode_pointer(raw)),
            None => Ok(raw),
        }
    }

    /// Reads the authentication metadata of the pointer at `addr`, if it
    /// is an authenticated slot.
    pub fn read_pointer_auth(&self, addr: u64) -> Result<Option<PointerAuth>> {
        let mapping = self.mapping_for_addr(addr).ok_or(Error::not_mapped(addr))?;
        let raw = read_u64_le(self.data_at_addr(addr, 8)?);
        Ok(self
            .slide_info(mapping)?
            .and_then(|slide| slide.pointer_auth(raw)))
    }

    /// Parses the slide info of `mapping`, if it has any.
    pub fn slide_info(&self, mapping: &MappingEntry) -> Result<Option<SlideInfo<'_>>> {
        if !mapping.has_slide_info() {
            return Ok(None);
        }
        let data = self.data_for_subcache(mapping.subcache_index);
        let start = mapping.slide_info_offset as usize;
        let end = start.saturating_add(mapping.slide_info_size as usize);
        let blob = data.get(start..end).ok_or_else(|| Error::InvalidSlideInfo {
            offset: mapping.slide_info_offset,
            reason: "slide info extends past the end of the file".into(),
        })?;
        SlideInfo::parse(blob, mapping.slide_info_offset).map(Some)
    }

    /// Returns the mmap data for a given subcache index.
    #[inline]
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.mmap[..]
        } else if let Some(subcache) = self.subcaches.get(index - 1) {
            &subcache.mmap[..]
        } else {
            &[]
        }
    }

    /// Returns the mapping for a given virtual address.
    #[inline]
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self.mappings.partition_point(|m| m.end() <= addr);
        self.mappings.get(idx).filter(|m| m.contains_addr(addr))
    }

    /// Address ranges holding stub islands: mappings flagged as text stubs
    /// plus the `__TEXT` of every branch-pool image.
    pub fn stub_island_ranges(&self) -> Vec<Range<u64>> {
        let mut ranges: Vec<Range<u64>> = self
            .mappings
            .iter()
            .filter(|m| m.flags.contains(MappingFlags::TEXT_STUBS))
            .map(|m| m.address..m.end())
            .collect();

        if self
            .header
            .contains_field(offset_of!(DyldCacheHeader, branch_pools_count))
        {
            let offset = self.header.branch_pools_offset as usize;
            for i in 0..self.header.branch_pools_count as usize {
                let Some(bytes) = self.mmap.get(offset + i * 8..offset + i * 8 + 8) else {
                    break;
                };
                let pool_addr = read_u64_le(bytes);
                match self.data_to_mapping_end(pool_addr).and_then(parse_macho) {
                    Ok(pool) => {
                        if let Some(text) = pool.segment("__TEXT") {
                            let cmd = &text.command;
                            ranges.push(cmd.vmaddr..cmd.vmaddr + cmd.vmsize);
                        }
                    }
                    Err(e) => debug!("skipping branch pool at {:#x}: {}", pool_addr, e),
                }
            }
        }

        ranges
    }

    /// Returns the ObjC optimization header, when the cache has one.
    pub fn objc_opt_header(&self) -> Option<ObjcOptimizationHeader> {
        if !self
            .header
            .contains_field(offset_of!(DyldCacheHeader, objc_opts_size))
            || self.header.objc_opts_offset == 0
        {
            return None;
        }
        let addr = self.base_address + self.header.objc_opts_offset;
        let bytes = self
            .data_at_addr(addr, std::mem::size_of::<ObjcOptimizationHeader>())
            .ok()?;
        ObjcOptimizationHeader::read_from_prefix(bytes).ok().map(|(h, _)| h)
    }

    /// Returns an iterator over all images.
    pub fn iter_images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Returns the image whose install path is exactly `path`.
    pub fn image_by_path(&self, path: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.path == path)
    }

    /// Finds an image by install path, basename, or path substring, in that
    /// order of preference. Matching ignores case.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.images
            .iter()
            .find(|img| img.path.eq_ignore_ascii_case(name))
            .or_else(|| {
                self.images
                    .iter()
                    .find(|img| img.basename().eq_ignore_ascii_case(name))
            })
            .or_else(|| self.images.iter().find(|img| img.matches_filter(name)))
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns true if this cache has subcaches.
    pub fn has_subcaches(&self) -> bool {
        !self.subcaches.is_empty()
    }

    /// Returns the total size of all cache files.
    pub fn total_size(&self) -> u64 {
        let main_size = self.mmap.len() as u64;
        let subcache_size: u64 = self.subcaches.iter().map(|s| s.mmap.len() as u64).sum();
        let symbols_size = self
            .symbols_file
            .as_ref()
            .map(|s| s.mmap.len() as u64)
            .unwrap_or(0);
        main_size + subcache_size + symbols_size
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }

    /// Returns the data holding the local symbols (main cache or `.symbols` file).
    pub fn symbols_cache_data(&self) -> Option<&[u8]> {
        if let Some(ref symbols_file) = self.symbols_file {
            if symbols_file.header.local_symbols_offset != 0 {
                return Some(&symbols_file.mmap[..]);
            }
        }

        if self.header.local_symbols_offset != 0 && self.header.local_symbols_size != 0 {
            return Some(&self.mmap[..]);
        }

        None
    }

    /// Returns the local symbols offset in the symbols cache.
    pub fn local_symbols_offset(&self) -> Option<u64> {
        if let Some(ref symbols_file) = self.symbols_file {
            if symbols_file.header.local_symbols_offset != 0 {
                return Some(symbols_file.header.local_symbols_offset);
            }
        }

        if self.header.local_symbols_offset != 0 && self.header.local_symbols_size != 0 {
            return Some(self.header.local_symbols_offset);
        }

        None
    }

    /// Returns true if local symbol entries use 64-bit VM offsets.
    ///
    /// Caches with a separate symbols file key entries by VM offset from the
    /// shared region start, older ones by file offset of the image header.
    pub fn uses_64bit_local_symbol_entries(&self) -> bool {
        self.header.has_symbol_file()
    }

    /// Returns the local symbols the cache recorded for the image whose
    /// header is at `image_addr`.
    pub fn local_symbols_for(&self, image_addr: u64) -> Result<Vec<LocalSymbol>> {
        let (Some(data), Some(base), Some(info)) = (
            self.symbols_cache_data(),
            self.local_symbols_offset(),
            self.local_symbols_info,
        ) else {
            return Ok(Vec::new());
        };
        let base = base as usize;
        let entries_start = base + info.entries_offset as usize;

        let found = if self.uses_64bit_local_symbol_entries() {
            let key = image_addr.wrapping_sub(self.shared_region_start);
            let size = std::mem::size_of::<DyldCacheLocalSymbolsEntry64>();
            (0..info.entries_count as usize)
                .map_while(|i| {
                    data.get(entries_start + i * size..)
                        .and_then(|d| DyldCacheLocalSymbolsEntry64::read_from_prefix(d).ok())
                        .map(|(e, _)| e)
                })
                .find(|e| e.dylib_offset == key)
                .map(|e| (e.nlist_start_index, e.nlist_count))
        } else {
            let key = self.addr_to_offset(image_addr).unwrap_or(u64::MAX);
            let size = std::mem::size_of::<DyldCacheLocalSymbolsEntry>();
            (0..info.entries_count as usize)
                .map_while(|i| {
                    data.get(entries_start + i * size..)
                        .and_then(|d| DyldCacheLocalSymbolsEntry::read_from_prefix(d).ok())
                        .map(|(e, _)| e)
                })
                .find(|e| e.dylib_offset as u64 == key)
                .map(|e| (e.nlist_start_index, e.nlist_count))
        };

        let Some((start, count)) = found else {
            return Ok(Vec::new());
        };

        let nlist_base = base + info.nlist_offset as usize;
        let strings_start = base + info.strings_offset as usize;
        let strings = data
            .get(strings_start..)
            .ok_or_else(|| Error::parse(strings_start, "local symbol strings out of bounds"))?;
        let strings = &strings[..strings.len().min(info.strings_size as usize)];

        let mut symbols = Vec::with_capacity(count as usize);
        for i in start..start.saturating_add(count) {
            let offset = nlist_base + i as usize * Nlist64::SIZE;
            let (nlist, _) = data
                .get(offset..)
                .and_then(|d| Nlist64::read_from_prefix(d).ok())
                .ok_or_else(|| Error::parse(offset, "failed to parse local nlist"))?;
            let name = strings
                .get(nlist.n_strx as usize..)
                .map(cstr_at)
                .unwrap_or("")
                .to_string();
            symbols.push(LocalSymbol { name, nlist });
        }

        Ok(symbols)
    }
}

/// Opens and memory-maps a file read-only.
fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{slide_info_v3, CacheBuilder, DATA_ADDR, TEXT_MAPPING_ADDR};

    fn mapping(address: u64, size: u64) -> MappingEntry {
        MappingEntry {
            address,
            size,
            file_offset: 0,
            max_prot: 7,
            init_prot: 5,
            slide_info_offset: 0,
            slide_info_size: 0,
            flags: MappingFlags::empty(),
            subcache_index: 0,
        }
    }

    #[test]
    fn test_mapping_entry_contains() {
        let mapping = mapping(0x1000, 0x1000);
        assert!(mapping.contains_addr(0x1000));
        assert!(mapping.contains_addr(0x1FFF));
        assert!(!mapping.contains_addr(0x2000));
        assert!(!mapping.contains_addr(0x0FFF));
    }

    #[test]
    fn test_mapping_conversion() {
        let mut mapping = mapping(0x1_0000_0000, 0x1000_0000);
        mapping.file_offset = 0x1000;
        assert_eq!(mapping.addr_to_offset(0x1_0000_0000), 0x1000);
        assert_eq!(mapping.addr_to_offset(0x1_0001_0000), 0x11000);
    }

    #[test]
    fn test_open_minimal_cache() {
        let fixture = CacheBuilder::new().build();
        let cache = DyldContext::open(fixture.path()).unwrap();

        assert_eq!(cache.architecture(), "arm64");
        assert_eq!(cache.image_count(), 1);
        assert_eq!(cache.base_address, TEXT_MAPPING_ADDR);
        assert!(cache.mapping_for_addr(TEXT_MAPPING_ADDR + 0x10).is_some());
        assert!(cache.mapping_for_addr(0x10).is_none());
        assert!(matches!(
            cache.data_at_addr(0x10, 4),
            Err(Error::AddressNotMapped { addr: 0x10 })
        ));
        assert!(cache.read_cstr_at(TEXT_MAPPING_ADDR).unwrap().starts_with("dyld_v1"));
    }

    #[test]
    fn test_data_at_addr_stops_at_mapping_end() {
        let fixture = CacheBuilder::new().build();
        let cache = DyldContext::open(fixture.path()).unwrap();
        let end = cache.mappings[0].end();
        assert!(cache.data_at_addr(end - 8, 8).is_ok());
        assert!(cache.data_at_addr(end - 8, 16).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let fixture = CacheBuilder::new().magic(*b"nope_v1   arm64\0").build();
        assert!(matches!(
            DyldContext::open(fixture.path()),
            Err(Error::InvalidMagic(m)) if &m == b"nope"
        ));
    }

    #[test]
    fn test_overlapping_mappings_rejected() {
        let fixture = CacheBuilder::new()
            .extra_mapping(TEXT_MAPPING_ADDR + 0x7000, 0x2000, MappingFlags::empty())
            .build();
        assert!(matches!(
            DyldContext::open(fixture.path()),
            Err(Error::OverlappingMappings { .. })
        ));
    }

    #[test]
    fn test_missing_subcache_is_fatal() {
        let fixture = CacheBuilder::new().subcache_entry([7u8; 16]).build();
        assert!(matches!(
            DyldContext::open(fixture.path()),
            Err(Error::SubcacheNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_symbols_file_is_tolerated() {
        let fixture = CacheBuilder::new().symbol_file_uuid([9u8; 16]).build();
        let cache = DyldContext::open(fixture.path()).unwrap();
        assert!(cache.symbols_file.is_none());
        assert!(cache.local_symbols_info.is_none());
        assert!(cache.local_symbols_for(cache.images[0].address).unwrap().is_empty());
    }

    #[test]
    fn test_find_image_preference() {
        let fixture = CacheBuilder::new()
            .image_path("/System/Library/Frameworks/Foo.framework/Foo")
            .alias_image("/usr/lib/libFoo.dylib")
            .alias_image("/usr/lib/Foo")
            .build();
        let cache = DyldContext::open(fixture.path()).unwrap();

        assert_eq!(cache.find_image("/usr/lib/libfoo.dylib").unwrap().index, 1);
        // Exact basename beats an earlier substring hit.
        assert_eq!(cache.find_image("foo").unwrap().index, 0);
        assert_eq!(cache.find_image("FOO.framework").unwrap().index, 0);
        assert_eq!(cache.find_image("lib/Foo").unwrap().index, 2);
        assert!(cache.find_image("Bar").is_none());
        assert_eq!(cache.image_by_path("/usr/lib/Foo").unwrap().index, 2);
    }

    #[test]
    fn test_stub_island_ranges_from_flags() {
        let fixture = CacheBuilder::new()
            .extra_mapping(0x1_9000_0000, 0x4000, MappingFlags::TEXT_STUBS)
            .build();
        let cache = DyldContext::open(fixture.path()).unwrap();
        assert_eq!(cache.stub_island_ranges(), vec![0x1_9000_0000..0x1_9000_4000]);
    }

    #[test]
    fn test_read_pointer_without_slide() {
        let fixture = CacheBuilder::new().build();
        let cache = DyldContext::open(fixture.path()).unwrap();
        let image = &cache.images[0];
        assert_eq!(cache.read_pointer(image.address).unwrap() as u32, 0xFEEDFACF);
        assert!(cache.objc_opt_header().is_none());
    }

    #[test]
    fn test_read_pointer_auth_from_slide_encoding() {
        // auth=1, key IB (1), diversity 0xBEEF, offset 0x4000
        let auth = (1u64 << 63) | (1 << 49) | (0xBEEF << 32) | 0x4000;
        let plain = 0x1_8000_8000u64;
        let fixture = CacheBuilder::new()
            .slide_info(slide_info_v3(&[0x20], 0x1_8000_0000))
            .patch(DATA_ADDR + 0x20, &auth.to_le_bytes())
            .patch(DATA_ADDR + 0x28, &plain.to_le_bytes())
            .build();
        let cache = DyldContext::open(fixture.path()).unwrap();

        assert_eq!(
            cache.read_pointer_auth(DATA_ADDR + 0x20).unwrap(),
            Some(PointerAuth {
                key: 1,
                diversity: 0xBEEF,
                addr_div: false
            })
        );
        assert_eq!(cache.read_pointer(DATA_ADDR + 0x20).unwrap(), 0x1_8000_4000);
        assert_eq!(cache.read_pointer_auth(DATA_ADDR + 0x28).unwrap(), None);
        assert!(cache.read_pointer_auth(0x10).is_err());
    }
}
