//! ObjC metadata fixer.
//!
//! When dyld builds the cache it optimizes ObjC metadata: selector
//! references are uniqued into a shared pool, method lists switch to
//! offsets from that pool, protocols are canonicalized across images, and
//! categories are attached to their classes ahead of time. This module
//! points the metadata back at data the image owns.
//!
//! Strings and selector references the image has no copy of are
//! materialized in the `__EXTRA_OBJC` segment, as are flattened method,
//! protocol and property lists.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::dyld::DyldContext;
use crate::error::{Error, Result};
use crate::macho::{MachOContext, SegmentCommand64, VM_PROT_READ, VM_PROT_WRITE};
use crate::util::{align_up, cstr_at};

use super::{ExtraSegment, ExtractionContext, EXTRA_SEGMENT_NAME};

/// ObjC image info flags.
pub const OBJC_IMAGE_IS_SIMULATED: u32 = 1 << 0;
pub const OBJC_IMAGE_IS_REPLACEMENT: u32 = 1 << 1;
pub const OBJC_IMAGE_SUPPORTS_GC: u32 = 1 << 2;
pub const OBJC_IMAGE_OPTIMIZED_BY_DYLD: u32 = 1 << 3;
pub const OBJC_IMAGE_SIGNED_CLASS_RO: u32 = 1 << 4;

/// Method list flags.
pub const METHOD_LIST_RELATIVE_FLAG: u32 = 0x8000_0000;
pub const METHOD_LIST_SELECTORS_DIRECT_FLAG: u32 = 0x4000_0000;
pub const METHOD_LIST_FLAGS_MASK: u32 = 0xFFFF_0000;

const PTR_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const FAST_DATA_MASK: u64 = 0x0000_7FFF_FFFF_FFF8;
const LIST_OF_LISTS_TAG: u64 = 1;

const SMALL_METHOD_SIZE: u32 = 12;
const BIG_METHOD_SIZE: u32 = 24;
const PROPERTY_SIZE: u32 = 16;

const LIBOBJC_PATH: &str = "/usr/lib/libobjc.A.dylib";
/// First `__objc_opt_ro` version that records the selector base.
const OPT_RO_SELECTOR_BASE_VERSION: u32 = 16;
const OPT_RO_SELECTOR_BASE_OFFSET: u64 = 40;

/// Sections whose strings the fixer may point metadata back at.
const STRING_SECTIONS: &[&str] = &[
    "__objc_methname",
    "__objc_classname",
    "__objc_methtype",
    "__cstring",
];

// Field offsets of the 64-bit runtime structures.
const CLASS_ISA: u64 = 0;
const CLASS_DATA: u64 = 32;

const RO_NAME: u64 = 24;
const RO_METHODS: u64 = 32;
const RO_PROTOCOLS: u64 = 40;
const RO_IVARS: u64 = 48;
const RO_PROPERTIES: u64 = 64;

const CATEGORY_NAME: u64 = 0;
const CATEGORY_INSTANCE_METHODS: u64 = 16;
const CATEGORY_CLASS_METHODS: u64 = 24;
const CATEGORY_PROTOCOLS: u64 = 32;
const CATEGORY_PROPERTIES: u64 = 40;

const PROTOCOL_NAME: u64 = 8;
const PROTOCOL_PROTOCOLS: u64 = 16;
const PROTOCOL_METHODS: [u64; 4] = [24, 32, 40, 48];
const PROTOCOL_PROPERTIES: u64 = 56;
const PROTOCOL_SIZE: u64 = 64;
const PROTOCOL_DEMANGLED_NAME: u64 = 80;
const PROTOCOL_CLASS_PROPERTIES: u64 = 88;

const IVAR_NAME: u64 = 8;
const IVAR_TYPE: u64 = 16;

/// Fixes ObjC metadata in the extracted image.
pub fn fix_objc(ctx: &mut ExtractionContext) -> Result<()> {
    ctx.stage("fixing objc metadata");

    let Some((info_addr, flags)) = image_info(&ctx.macho)? else {
        debug!("no __objc_imageinfo, skipping");
        return Ok(());
    };
    if flags & OBJC_IMAGE_OPTIMIZED_BY_DYLD == 0 {
        debug!("objc metadata was not optimized by dyld");
        return Ok(());
    }

    ctx.extra = reserve_extra_segment(ctx)?;
    let selector_base = selector_base(&ctx.cache);
    trace!("relative selector base: {:x?}", selector_base);

    let mut fixer = ObjcFixer::new(ctx, selector_base)?;
    fixer.run()?;
    let (unresolved, unreadable, converted) =
        (fixer.unresolved, fixer.first_unreadable, fixer.converted);

    debug!("converted {} method lists", converted);
    if unresolved > 0 {
        let mut message = format!(
            "{} objc references still point into the shared cache",
            unresolved
        );
        if let Some(addr) = unreadable {
            message.push_str(&format!(", first unreadable one at {:#x}", addr));
        }
        ctx.warn(message);
    }

    ctx.macho
        .write_u32(info_addr + 4, flags & !OBJC_IMAGE_OPTIMIZED_BY_DYLD)?;
    ctx.finish_extra_segment()
}

/// Returns the address and flags of `__objc_imageinfo`.
fn image_info(macho: &MachOContext) -> Result<Option<(u64, u32)>> {
    let Some(section) = macho.find_section("__objc_imageinfo") else {
        return Ok(None);
    };
    if section.section.size < 8 {
        return Ok(None);
    }
    let addr = section.section.addr;
    Ok(Some((addr, macho.read_u32(addr + 4)?)))
}

/// Appends an empty `__EXTRA_OBJC` segment command after the image's
/// highest segment. Returns `None` when the header has no room for it.
fn reserve_extra_segment(ctx: &mut ExtractionContext) -> Result<Option<ExtraSegment>> {
    let end = ctx
        .macho
        .segments()
        .map(|seg| seg.command.vm_end())
        .max()
        .unwrap_or(0);
    let vmaddr = align_up(end, 0x4000);

    let mut command = SegmentCommand64 {
        vmaddr,
        maxprot: VM_PROT_READ | VM_PROT_WRITE,
        initprot: VM_PROT_READ | VM_PROT_WRITE,
        ..Default::default()
    };
    command.set_name(EXTRA_SEGMENT_NAME);

    match ctx.macho.insert_load_command(command.as_bytes()) {
        Ok(offset) => Ok(Some(ExtraSegment::new(vmaddr, offset))),
        Err(Error::InsufficientLoadCommandSpace { needed, available }) => {
            ctx.warn(format!(
                "no room for {} ({} bytes needed, {} free), \
                 objc data outside the image stays in place",
                EXTRA_SEGMENT_NAME, needed, available
            ));
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Address that direct selector offsets in relative method lists count
/// from.
fn selector_base(cache: &Arc<DyldContext>) -> Option<u64> {
    if let Some(header) = cache.objc_opt_header() {
        if header.relative_method_selector_base_address_offset != 0 {
            return Some(cache.base_address + header.relative_method_selector_base_address_offset);
        }
    }

    // Older caches keep it in libobjc's __objc_opt_ro.
    let image = cache.image_by_path(LIBOBJC_PATH)?;
    let libobjc = MachOContext::new(Arc::clone(cache), image.address).ok()?;
    let opt_ro = libobjc.section("__TEXT", "__objc_opt_ro")?.section;
    if opt_ro.size < OPT_RO_SELECTOR_BASE_OFFSET + 8 {
        return None;
    }
    let version = libobjc.read_u32(opt_ro.addr).ok()?;
    if version < OPT_RO_SELECTOR_BASE_VERSION {
        return None;
    }
    let offset = libobjc
        .read_u64(opt_ro.addr + OPT_RO_SELECTOR_BASE_OFFSET)
        .ok()? as i64;
    Some(opt_ro.addr.wrapping_add_signed(offset))
}

fn slots(addr: u64, size: u64) -> impl Iterator<Item = u64> {
    (0..size / 8).map(move |i| addr + i * 8)
}

fn relative_offset(from: u64, to: u64) -> Result<i32> {
    i32::try_from(to as i64 - from as i64).map_err(|_| Error::InvalidObjcMethodList { addr: from })
}

#[derive(Debug, Clone, Copy)]
enum ListKind {
    Methods,
    Protocols,
    Properties,
    Ivars,
}

#[derive(Debug)]
struct Method {
    name: String,
    types: u64,
    imp: u64,
}

struct ObjcFixer<'a> {
    ctx: &'a mut ExtractionContext,
    selector_base: Option<u64>,
    /// String contents to the address of the image's (or extra) copy
    strings: HashMap<String, u64>,
    /// Selector name to a selector reference slot
    selrefs: HashMap<String, u64>,
    /// Protocol name to the image's own definition
    protocols: HashMap<String, u64>,
    visited: HashSet<u64>,
    unresolved: usize,
    /// First address a reference led to that could not be read
    first_unreadable: Option<u64>,
    converted: usize,
}

impl<'a> ObjcFixer<'a> {
    fn new(ctx: &'a mut ExtractionContext, selector_base: Option<u64>) -> Result<Self> {
        let mut fixer = Self {
            ctx,
            selector_base,
            strings: HashMap::new(),
            selrefs: HashMap::new(),
            protocols: HashMap::new(),
            visited: HashSet::new(),
            unresolved: 0,
            first_unreadable: None,
            converted: 0,
        };
        fixer.index_strings()?;
        Ok(fixer)
    }

    fn run(&mut self) -> Result<()> {
        self.fix_selector_refs()?;
        self.index_protocols()?;

        for name in ["__objc_protolist", "__objc_protorefs"] {
            for (addr, size) in self.section_ranges(name) {
                for slot in slots(addr, size) {
                    self.fix_protocol_ref(slot)?;
                }
            }
        }

        for name in ["__objc_classlist", "__objc_nlclslist"] {
            for (addr, size) in self.section_ranges(name) {
                for slot in slots(addr, size) {
                    let result = self.read_ptr(slot).and_then(|class| self.fix_class(class));
                    self.tolerate(result)?;
                }
            }
        }

        for name in ["__objc_catlist", "__objc_nlcatlist", "__objc_catlist2"] {
            for (addr, size) in self.section_ranges(name) {
                for slot in slots(addr, size) {
                    let result = self
                        .read_ptr(slot)
                        .and_then(|category| self.fix_category(category));
                    self.tolerate(result)?;
                }
            }
        }

        let mut protocols: Vec<u64> = self.protocols.values().copied().collect();
        protocols.sort_unstable();
        for protocol in protocols {
            let result = self.fix_protocol(protocol);
            self.tolerate(result)?;
        }
        Ok(())
    }

    /// Counts a reference whose target cannot be read as unresolved and
    /// lets the walk continue. Anything else is passed through.
    fn tolerate<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(Error::AddressNotMapped { addr } | Error::OutOfBoundsAccess { addr, .. }) => {
                Error::UnresolvedObjcReference { addr }
            }
            Err(err) => err,
        };
        if !err.is_recoverable() {
            return Err(err);
        }
        debug!("{}", err);
        if let Error::UnresolvedObjcReference { addr } = err {
            self.first_unreadable.get_or_insert(addr);
        }
        self.unresolved += 1;
        Ok(None)
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    fn section_ranges(&self, name: &str) -> Vec<(u64, u64)> {
        self.ctx
            .macho
            .sections_named(name)
            .filter(|s| !s.section.is_zerofill())
            .map(|s| (s.section.addr, s.section.size))
            .collect()
    }

    fn index_strings(&mut self) -> Result<()> {
        for name in STRING_SECTIONS {
            for (addr, size) in self.section_ranges(name) {
                let bytes = self.ctx.macho.read_bytes(addr, size as usize)?;
                let mut offset = 0u64;
                for piece in bytes.split(|&b| b == 0) {
                    if !piece.is_empty() {
                        self.strings
                            .entry(String::from_utf8_lossy(piece).into_owned())
                            .or_insert(addr + offset);
                    }
                    offset += piece.len() as u64 + 1;
                }
            }
        }
        trace!("indexed {} objc strings", self.strings.len());
        Ok(())
    }

    /// Points every selector reference at the image's copy of its string.
    fn fix_selector_refs(&mut self) -> Result<()> {
        for (addr, size) in self.section_ranges("__objc_selrefs") {
            for slot in slots(addr, size) {
                let result = self.fix_selector_ref(slot);
                self.tolerate(result)?;
            }
        }
        debug!("{} selector references", self.selrefs.len());
        Ok(())
    }

    fn fix_selector_ref(&mut self, slot: u64) -> Result<()> {
        let target = self.read_ptr(slot)?;
        if target == 0 {
            return Ok(());
        }
        let name = self.read_string(target)?;
        if !self.is_local(target) {
            match self.intern(&name) {
                Some(local) => self.write_pointer(slot, local)?,
                None => self.unresolved += 1,
            }
        }
        self.selrefs.entry(name).or_insert(slot);
        Ok(())
    }

    fn index_protocols(&mut self) -> Result<()> {
        for (addr, size) in self.section_ranges("__objc_protolist") {
            for slot in slots(addr, size) {
                let result = self.index_protocol(slot);
                self.tolerate(result)?;
            }
        }
        Ok(())
    }

    fn index_protocol(&mut self, slot: u64) -> Result<()> {
        let protocol = self.read_ptr(slot)?;
        if protocol == 0 || !self.ctx.macho.contains_addr(protocol) {
            return Ok(());
        }
        let name = self.read_string(self.read_ptr(protocol + PROTOCOL_NAME)?)?;
        self.protocols.entry(name).or_insert(protocol);
        Ok(())
    }

    // =========================================================================
    // Metadata walkers
    // =========================================================================

    fn fix_class(&mut self, class: u64) -> Result<()> {
        if class == 0 || !self.ctx.macho.contains_addr(class) || !self.visited.insert(class) {
            return Ok(());
        }

        let ro = self.ctx.macho.read_u64(class + CLASS_DATA)? & FAST_DATA_MASK;
        if self.ctx.macho.contains_addr(ro) {
            self.fix_string_field(ro + RO_NAME)?;
            self.fix_list_field(ro + RO_METHODS, ListKind::Methods)?;
            self.fix_list_field(ro + RO_PROTOCOLS, ListKind::Protocols)?;
            self.fix_list_field(ro + RO_IVARS, ListKind::Ivars)?;
            self.fix_list_field(ro + RO_PROPERTIES, ListKind::Properties)?;
        } else {
            trace!("class {:#x} has no class_ro in the image", class);
        }

        // Metaclass
        let isa = self.read_ptr(class + CLASS_ISA)?;
        self.fix_class(isa)
    }

    fn fix_category(&mut self, category: u64) -> Result<()> {
        if category == 0
            || !self.ctx.macho.contains_addr(category)
            || !self.visited.insert(category)
        {
            return Ok(());
        }
        self.fix_string_field(category + CATEGORY_NAME)?;
        self.fix_list_field(category + CATEGORY_INSTANCE_METHODS, ListKind::Methods)?;
        self.fix_list_field(category + CATEGORY_CLASS_METHODS, ListKind::Methods)?;
        self.fix_list_field(category + CATEGORY_PROTOCOLS, ListKind::Protocols)?;
        self.fix_list_field(category + CATEGORY_PROPERTIES, ListKind::Properties)
    }

    fn fix_protocol(&mut self, protocol: u64) -> Result<()> {
        if !self.visited.insert(protocol) {
            return Ok(());
        }
        self.fix_string_field(protocol + PROTOCOL_NAME)?;
        self.fix_list_field(protocol + PROTOCOL_PROTOCOLS, ListKind::Protocols)?;
        for field in PROTOCOL_METHODS {
            self.fix_list_field(protocol + field, ListKind::Methods)?;
        }
        self.fix_list_field(protocol + PROTOCOL_PROPERTIES, ListKind::Properties)?;

        let size = self.ctx.macho.read_u32(protocol + PROTOCOL_SIZE)? as u64;
        if size >= PROTOCOL_DEMANGLED_NAME + 8 {
            self.fix_string_field(protocol + PROTOCOL_DEMANGLED_NAME)?;
        }
        if size >= PROTOCOL_CLASS_PROPERTIES + 8 {
            self.fix_list_field(protocol + PROTOCOL_CLASS_PROPERTIES, ListKind::Properties)?;
        }
        Ok(())
    }

    /// Points a protocol reference at the image's own definition.
    fn fix_protocol_ref(&mut self, slot: u64) -> Result<()> {
        let result = self.fix_protocol_ref_inner(slot);
        self.tolerate(result).map(drop)
    }

    fn fix_protocol_ref_inner(&mut self, slot: u64) -> Result<()> {
        let protocol = self.read_ptr(slot)?;
        if protocol == 0 || self.is_local(protocol) {
            return Ok(());
        }
        match self.resolve_protocol(protocol)? {
            Some(local) => self.write_pointer(slot, local)?,
            None => self.unresolved += 1,
        }
        Ok(())
    }

    fn resolve_protocol(&self, protocol: u64) -> Result<Option<u64>> {
        if self.is_local(protocol) {
            return Ok(Some(protocol));
        }
        let name = self.read_string(self.read_ptr(protocol + PROTOCOL_NAME)?)?;
        Ok(self.protocols.get(&name).copied())
    }

    fn fix_string_field(&mut self, field: u64) -> Result<()> {
        let result = self.fix_string_field_inner(field);
        self.tolerate(result).map(drop)
    }

    fn fix_string_field_inner(&mut self, field: u64) -> Result<()> {
        let target = self.read_ptr(field)?;
        if target == 0 || self.is_local(target) {
            return Ok(());
        }
        match self.localize(target)? {
            Some(local) => self.write_pointer(field, local)?,
            None => self.unresolved += 1,
        }
        Ok(())
    }

    /// Repairs a string referenced by a relative offset stored at `field`.
    fn fix_relative_string(&mut self, field: u64) -> Result<()> {
        let result = self.fix_relative_string_inner(field);
        self.tolerate(result).map(drop)
    }

    fn fix_relative_string_inner(&mut self, field: u64) -> Result<()> {
        let offset = self.read_u32(field)? as i32;
        if offset == 0 {
            return Ok(());
        }
        let target = field.wrapping_add_signed(offset as i64);
        if self.is_local(target) {
            return Ok(());
        }
        match self.localize(target)? {
            Some(local) => {
                let offset = relative_offset(field, local)?;
                self.ctx.macho.write_u32(field, offset as u32)?;
            }
            None => self.unresolved += 1,
        }
        Ok(())
    }

    // =========================================================================
    // Lists
    // =========================================================================

    /// Repairs the list a metadata field points at.
    ///
    /// Lists of lists (pre-attached categories) and lists outside the image
    /// are rebuilt in the extra segment; everything else is fixed in place.
    fn fix_list_field(&mut self, field: u64, kind: ListKind) -> Result<()> {
        let result = self.fix_list_field_inner(field, kind);
        match result {
            Err(Error::InvalidObjcMethodList { addr }) => {
                self.ctx
                    .warn(format!("skipping malformed method list at {:#x}", addr));
                Ok(())
            }
            other => self.tolerate(other).map(drop),
        }
    }

    fn fix_list_field_inner(&mut self, field: u64, kind: ListKind) -> Result<()> {
        let raw = self.read_ptr(field)?;
        if raw == 0 {
            return Ok(());
        }

        let replacement = if raw & LIST_OF_LISTS_TAG != 0 {
            let lists = self.lists_in_image(raw & !LIST_OF_LISTS_TAG)?;
            self.rebuild(&lists, kind)?
        } else if !self.is_local(raw) {
            self.rebuild(&[raw], kind)?
        } else {
            return self.fix_list_in_place(raw, kind);
        };

        match replacement {
            Some(addr) => self.write_pointer(field, addr)?,
            None => self.unresolved += 1,
        }
        Ok(())
    }

    /// Lists referenced by a `relative_list_list_t` that belong to this
    /// image. Lists attached from other images are dropped.
    fn lists_in_image(&self, addr: u64) -> Result<Vec<u64>> {
        let entsize = (self.read_u32(addr)? & !3).max(8) as u64;
        let count = self.read_u32(addr + 4)? as u64;

        let mut lists = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry = addr + 8 + i * entsize;
            let packed = self.read_u64(entry)? as i64;
            let list = entry.wrapping_add_signed(packed >> 16);
            if self.ctx.macho.contains_addr(list) {
                lists.push(list);
            } else {
                trace!(
                    "dropping list {:#x} from image index {}",
                    list,
                    packed & 0xFFFF
                );
            }
        }
        Ok(lists)
    }

    fn fix_list_in_place(&mut self, list: u64, kind: ListKind) -> Result<()> {
        if !self.visited.insert(list) {
            return Ok(());
        }
        match kind {
            ListKind::Methods => self.fix_methods_in_place(list),
            ListKind::Protocols => {
                let count = self.read_u64(list)?;
                for slot in slots(list + 8, count * 8) {
                    self.fix_protocol_ref(slot)?;
                }
                Ok(())
            }
            ListKind::Properties => {
                for entry in self.entries(list)? {
                    self.fix_string_field(entry)?;
                    self.fix_string_field(entry + 8)?;
                }
                Ok(())
            }
            ListKind::Ivars => {
                for entry in self.entries(list)? {
                    self.fix_string_field(entry + IVAR_NAME)?;
                    self.fix_string_field(entry + IVAR_TYPE)?;
                }
                Ok(())
            }
        }
    }

    /// Entry addresses of an `entsize_list_tt` style list.
    fn entries(&self, list: u64) -> Result<Vec<u64>> {
        let entsize = (self.read_u32(list)? & !METHOD_LIST_FLAGS_MASK & !3) as u64;
        let count = self.read_u32(list + 4)? as u64;
        if entsize == 0 {
            return Ok(Vec::new());
        }
        Ok((0..count).map(|i| list + 8 + i * entsize).collect())
    }

    fn fix_methods_in_place(&mut self, list: u64) -> Result<()> {
        let header = self.read_u32(list)?;
        let relative = header & METHOD_LIST_RELATIVE_FLAG != 0;
        let direct = header & METHOD_LIST_SELECTORS_DIRECT_FLAG != 0;
        let entries = self.entries(list)?;

        if !relative {
            for entry in entries {
                self.fix_string_field(entry)?;
                self.fix_string_field(entry + 8)?;
            }
            return Ok(());
        }

        if direct {
            let methods = self.read_methods(list)?;
            let mut selrefs = Vec::with_capacity(methods.len());
            for method in &methods {
                match self.selref_for(&method.name) {
                    Some(selref) => selrefs.push(selref),
                    None => {
                        self.unresolved += 1;
                        return Ok(());
                    }
                }
            }
            for (&entry, selref) in entries.iter().zip(selrefs) {
                let offset = relative_offset(entry, selref)?;
                self.ctx.macho.write_u32(entry, offset as u32)?;
            }
            self.ctx
                .macho
                .write_u32(list, header & !METHOD_LIST_SELECTORS_DIRECT_FLAG)?;
            self.converted += 1;
        }

        for entry in entries {
            self.fix_relative_string(entry + 4)?;
        }
        Ok(())
    }

    fn read_methods(&self, list: u64) -> Result<Vec<Method>> {
        let header = self.read_u32(list)?;
        let relative = header & METHOD_LIST_RELATIVE_FLAG != 0;
        let direct = header & METHOD_LIST_SELECTORS_DIRECT_FLAG != 0;
        let entsize = header & !METHOD_LIST_FLAGS_MASK & !3;
        let expected = if relative {
            SMALL_METHOD_SIZE
        } else {
            BIG_METHOD_SIZE
        };
        if entsize != expected {
            return Err(Error::InvalidObjcMethodList { addr: list });
        }

        let mut methods = Vec::new();
        for entry in self.entries(list)? {
            let method = if relative {
                let name_offset = self.read_u32(entry)? as i32 as i64;
                let selector = if direct {
                    self.selector_base
                        .ok_or(Error::InvalidObjcMethodList { addr: list })?
                        .wrapping_add_signed(name_offset)
                } else {
                    self.read_ptr(entry.wrapping_add_signed(name_offset))?
                };
                Method {
                    name: self.read_string(selector)?,
                    types: self.read_relative(entry + 4)?,
                    imp: self.read_relative(entry + 8)?,
                }
            } else {
                Method {
                    name: self.read_string(self.read_ptr(entry)?)?,
                    types: self.read_ptr(entry + 8)?,
                    imp: self.read_ptr(entry + 16)?,
                }
            };
            methods.push(method);
        }
        Ok(methods)
    }

    fn rebuild(&mut self, lists: &[u64], kind: ListKind) -> Result<Option<u64>> {
        if self.ctx.extra.is_none() {
            return Ok(None);
        }
        match kind {
            ListKind::Methods => {
                let mut methods = Vec::new();
                for &list in lists {
                    methods.extend(self.read_methods(list)?);
                }
                self.emit_methods(&methods)
            }
            ListKind::Protocols => {
                let mut protocols: Vec<(u64, u64)> = Vec::new();
                for &list in lists {
                    let count = self.read_u64(list)?;
                    for slot in slots(list + 8, count * 8) {
                        let resolved = self
                            .read_ptr(slot)
                            .and_then(|protocol| self.resolve_protocol(protocol));
                        match self.tolerate(resolved)? {
                            Some(Some(local)) if !protocols.iter().any(|&(p, _)| p == local) => {
                                protocols.push((local, slot))
                            }
                            Some(Some(_)) | None => {}
                            Some(None) => self.unresolved += 1,
                        }
                    }
                }
                Ok(self.emit_protocols(&protocols))
            }
            ListKind::Properties => {
                let mut properties = Vec::new();
                for &list in lists {
                    for entry in self.entries(list)? {
                        properties.push((self.read_ptr(entry)?, self.read_ptr(entry + 8)?));
                    }
                }
                self.emit_properties(&properties)
            }
            ListKind::Ivars => Ok(None),
        }
    }

    /// Writes a relative method list that names selectors through
    /// selector references.
    fn emit_methods(&mut self, methods: &[Method]) -> Result<Option<u64>> {
        let mut resolved = Vec::with_capacity(methods.len());
        for method in methods {
            let Some(selref) = self.selref_for(&method.name) else {
                return Ok(None);
            };
            let types = match method.types {
                0 => 0,
                types => match self.localize(types)? {
                    Some(local) => local,
                    None => return Ok(None),
                },
            };
            resolved.push((selref, types, method.imp));
        }

        let size = 8 + resolved.len() * SMALL_METHOD_SIZE as usize;
        let Some(extra) = self.ctx.extra.as_mut() else {
            return Ok(None);
        };
        let list = extra.alloc(&vec![0u8; size], 4);

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&(SMALL_METHOD_SIZE | METHOD_LIST_RELATIVE_FLAG).to_le_bytes());
        bytes.extend_from_slice(&(resolved.len() as u32).to_le_bytes());
        for (i, &(selref, types, imp)) in resolved.iter().enumerate() {
            let entry = list + 8 + i as u64 * SMALL_METHOD_SIZE as u64;
            for (field, target) in [(entry, selref), (entry + 4, types), (entry + 8, imp)] {
                let offset = if target == 0 {
                    0
                } else {
                    relative_offset(field, target)?
                };
                bytes.extend_from_slice(&offset.to_le_bytes());
            }
        }
        extra.patch(list, &bytes)?;
        Ok(Some(list))
    }

    /// Writes a protocol list from `(protocol, source slot)` pairs. Each new
    /// slot carries the authentication metadata of its source.
    fn emit_protocols(&mut self, protocols: &[(u64, u64)]) -> Option<u64> {
        let extra = self.ctx.extra.as_mut()?;
        let mut bytes = (protocols.len() as u64).to_le_bytes().to_vec();
        for (protocol, _) in protocols {
            bytes.extend_from_slice(&protocol.to_le_bytes());
        }
        let list = extra.alloc(&bytes, 8);
        let new_slots = slots(list + 8, protocols.len() as u64 * 8);
        for (&(_, source), slot) in protocols.iter().zip(new_slots) {
            self.ctx.copy_pointer_auth(source, slot);
        }
        Some(list)
    }

    fn emit_properties(&mut self, properties: &[(u64, u64)]) -> Result<Option<u64>> {
        let mut bytes = PROPERTY_SIZE.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(properties.len() as u32).to_le_bytes());
        for &(name, attributes) in properties {
            for target in [name, attributes] {
                let local = match target {
                    0 => 0,
                    target => match self.localize(target)? {
                        Some(local) => local,
                        None => return Ok(None),
                    },
                };
                bytes.extend_from_slice(&local.to_le_bytes());
            }
        }
        Ok(self.ctx.extra.as_mut().map(|extra| extra.alloc(&bytes, 8)))
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    /// Returns the address of an image-owned copy of `name`, copying it to
    /// the extra segment when the image has none.
    fn intern(&mut self, name: &str) -> Option<u64> {
        if let Some(&addr) = self.strings.get(name) {
            return Some(addr);
        }
        let extra = self.ctx.extra.as_mut()?;
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        let addr = extra.alloc(&bytes, 1);
        self.strings.insert(name.to_string(), addr);
        Some(addr)
    }

    /// Returns a selector reference slot for `name`, creating one in the
    /// extra segment when the image has none.
    fn selref_for(&mut self, name: &str) -> Option<u64> {
        if let Some(&slot) = self.selrefs.get(name) {
            return Some(slot);
        }
        let string = self.intern(name)?;
        let extra = self.ctx.extra.as_mut()?;
        let slot = extra.alloc(&string.to_le_bytes(), 8);
        self.selrefs.insert(name.to_string(), slot);
        Some(slot)
    }

    fn write_pointer(&mut self, slot: u64, value: u64) -> Result<()> {
        self.ctx.write_pointer(slot, value)
    }

    fn localize(&mut self, addr: u64) -> Result<Option<u64>> {
        if self.is_local(addr) {
            return Ok(Some(addr));
        }
        let name = self.read_string(addr)?;
        Ok(self.intern(&name))
    }

    // =========================================================================
    // Reading
    // =========================================================================

    fn extra_bytes(&self, addr: u64) -> Option<&[u8]> {
        let extra = self.ctx.extra.as_ref()?;
        let start = addr.checked_sub(extra.vmaddr)? as usize;
        extra.data().get(start..).filter(|rest| !rest.is_empty())
    }

    /// True for addresses in the image or already materialized.
    fn is_local(&self, addr: u64) -> bool {
        self.ctx.macho.contains_addr(addr) || self.extra_bytes(addr).is_some()
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        if self.ctx.macho.contains_addr(addr) {
            return self.ctx.macho.read_bytes(addr, len);
        }
        if let Some(bytes) = self.extra_bytes(addr) {
            return bytes
                .get(..len)
                .map(Cow::Borrowed)
                .ok_or(Error::out_of_bounds(addr, len));
        }
        Ok(Cow::Borrowed(self.ctx.cache.data_at_addr(addr, len)?))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.read_bytes(addr, 4)?))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        Ok(LittleEndian::read_u64(&self.read_bytes(addr, 8)?))
    }

    /// Reads a pointer, decoding the slide encoding of slots outside the
    /// image.
    fn read_ptr(&self, addr: u64) -> Result<u64> {
        let value = if self.is_local(addr) {
            self.read_u64(addr)?
        } else {
            self.ctx.cache.read_pointer(addr)?
        };
        Ok(value & PTR_MASK)
    }

    /// Target of a relative offset stored at `field`, or 0 for no target.
    fn read_relative(&self, field: u64) -> Result<u64> {
        let offset = self.read_u32(field)? as i32;
        Ok(match offset {
            0 => 0,
            offset => field.wrapping_add_signed(offset as i64),
        })
    }

    fn read_string(&self, addr: u64) -> Result<String> {
        if self.ctx.macho.contains_addr(addr) {
            return self.ctx.macho.read_cstr(addr);
        }
        if let Some(bytes) = self.extra_bytes(addr) {
            return Ok(cstr_at(bytes).to_string());
        }
        Ok(self.ctx.cache.read_cstr_at(addr)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::PointerAuth;
    use crate::testutil::{
        CacheBuilder, SectionSpec, DATA_ADDR, LINKEDIT_ADDR, TEXT_MAPPING_ADDR, TEXT_SECTION_ADDR,
    };

    /// Shared selector and protocol name pool outside the image.
    const POOL: u64 = TEXT_MAPPING_ADDR + 0xE00;
    const POOL_STRINGS: &[u8] = b"init\0dealloc\0Proto\0Missing\0";
    const FOREIGN: u64 = TEXT_MAPPING_ADDR + 0xF00;

    const METHNAME: u64 = TEXT_SECTION_ADDR + 0x800;
    const METHTYPE: u64 = TEXT_SECTION_ADDR + 0x900;
    const CLASSNAME: u64 = TEXT_SECTION_ADDR + 0x980;
    const METHLIST: u64 = TEXT_SECTION_ADDR + 0xA00;

    const IMAGEINFO: u64 = DATA_ADDR + 0x200;
    const SELREFS: u64 = DATA_ADDR + 0x300;
    const PROTOREFS: u64 = DATA_ADDR + 0x380;
    const CLASSLIST: u64 = DATA_ADDR + 0x400;
    const PROTOLIST: u64 = DATA_ADDR + 0x440;
    const OBJC_CONST: u64 = DATA_ADDR + 0x500;
    const OBJC_DATA: u64 = DATA_ADDR + 0x700;

    const EXTRA_ADDR: u64 = LINKEDIT_ADDR + 0x4000;

    fn u64s(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn rel(from: u64, to: u64) -> u32 {
        (to as i64 - from as i64) as i32 as u32
    }

    fn objc_builder(imageinfo_flags: u32, selrefs: &[u64]) -> CacheBuilder {
        CacheBuilder::new()
            .section(SectionSpec::new("__TEXT", "__objc_methname", METHNAME, 0x40))
            .section(SectionSpec::new("__TEXT", "__objc_methtype", METHTYPE, 0x40))
            .section(SectionSpec::new("__TEXT", "__objc_classname", CLASSNAME, 0x40))
            .section(SectionSpec::new("__DATA", "__objc_imageinfo", IMAGEINFO, 8))
            .section(SectionSpec::new(
                "__DATA",
                "__objc_selrefs",
                SELREFS,
                selrefs.len() as u64 * 8,
            ))
            .patch(POOL, POOL_STRINGS)
            .patch(METHNAME, b"init\0")
            .patch(METHTYPE, b"v16@0:8\0")
            .patch(CLASSNAME, b"Widget\0Proto\0")
            .patch(IMAGEINFO, &u32s(&[0, imageinfo_flags]))
            .patch(SELREFS, &u64s(selrefs))
    }

    /// One class with a metaclass, whose class_ro has `methods` as its
    /// method list field.
    fn with_class(builder: CacheBuilder, methods: u64) -> CacheBuilder {
        let ro = OBJC_CONST;
        let meta_ro = OBJC_CONST + 0x50;
        let class = OBJC_DATA;
        let meta = OBJC_DATA + 0x28;

        let mut ro_bytes = vec![0u8; 72];
        ro_bytes[24..32].copy_from_slice(&CLASSNAME.to_le_bytes());
        ro_bytes[32..40].copy_from_slice(&methods.to_le_bytes());
        let mut meta_bytes = vec![0u8; 72];
        meta_bytes[..4].copy_from_slice(&1u32.to_le_bytes());
        meta_bytes[24..32].copy_from_slice(&CLASSNAME.to_le_bytes());

        builder
            .section(SectionSpec::new("__DATA", "__objc_classlist", CLASSLIST, 8))
            .section(SectionSpec::new("__DATA", "__objc_const", OBJC_CONST, 0x100))
            .section(SectionSpec::new("__DATA", "__objc_data", OBJC_DATA, 0x80))
            .section(SectionSpec::new("__TEXT", "__objc_methlist", METHLIST, 0x40))
            .patch(CLASSLIST, &class.to_le_bytes())
            .patch(ro, &ro_bytes)
            .patch(meta_ro, &meta_bytes)
            .patch(class, &u64s(&[meta, 0, 0, 0, ro]))
            .patch(meta, &u64s(&[0, 0, 0, 0, meta_ro]))
    }

    /// A direct-selector relative method list with one method.
    fn direct_list(list: u64, selector_offset: u32, imp: u64) -> Vec<u8> {
        let entry = list + 8;
        u32s(&[
            SMALL_METHOD_SIZE | METHOD_LIST_RELATIVE_FLAG | METHOD_LIST_SELECTORS_DIRECT_FLAG,
            1,
            selector_offset,
            rel(entry + 4, METHTYPE),
            rel(entry + 8, imp),
        ])
    }

    /// Name of the selector a relative method entry references.
    fn selector_name(ctx: &ExtractionContext, entry: u64) -> String {
        let offset = ctx.macho.read_u32(entry).unwrap() as i32 as i64;
        let selref = entry.wrapping_add_signed(offset);
        let selector = ctx.macho.read_u64(selref).unwrap();
        ctx.macho.read_cstr(selector).unwrap()
    }

    #[test]
    fn test_unoptimized_image_is_untouched() {
        let fixture = objc_builder(0, &[POOL]).build();
        let mut ctx = fixture.context();
        let ncmds = ctx.macho.header().ncmds;

        fix_objc(&mut ctx).unwrap();

        assert_eq!(ctx.macho.read_u64(SELREFS).unwrap(), POOL);
        assert_eq!(ctx.macho.header().ncmds, ncmds);
        assert_eq!(ctx.macho.owned_page_count(), 0);
    }

    #[test]
    fn test_selector_refs_point_into_image() {
        let fixture = objc_builder(OBJC_IMAGE_OPTIMIZED_BY_DYLD, &[POOL, POOL + 5]).build();
        let mut ctx = fixture.context();

        fix_objc(&mut ctx).unwrap();

        // "init" has a copy in __objc_methname, "dealloc" does not.
        assert_eq!(ctx.macho.read_u64(SELREFS).unwrap(), METHNAME);
        let dealloc = ctx.macho.read_u64(SELREFS + 8).unwrap();
        assert!(dealloc >= EXTRA_ADDR);
        assert_eq!(ctx.macho.read_cstr(dealloc).unwrap(), "dealloc");

        let extra = ctx.macho.segment(EXTRA_SEGMENT_NAME).unwrap();
        assert_eq!(extra.command.vmaddr, EXTRA_ADDR);
        assert_eq!(extra.command.vmsize, 0x4000);

        assert_eq!(ctx.macho.read_u32(IMAGEINFO + 4).unwrap(), 0);
        assert!(ctx.warnings.is_empty());
    }

    #[test]
    fn test_unused_extra_segment_is_removed() {
        let fixture = objc_builder(
            OBJC_IMAGE_OPTIMIZED_BY_DYLD | OBJC_IMAGE_SIGNED_CLASS_RO,
            &[POOL],
        )
        .build();
        let mut ctx = fixture.context();
        let ncmds = ctx.macho.header().ncmds;

        fix_objc(&mut ctx).unwrap();

        assert!(ctx.macho.segment(EXTRA_SEGMENT_NAME).is_none());
        assert_eq!(ctx.macho.header().ncmds, ncmds);
        assert_eq!(
            ctx.macho.read_u32(IMAGEINFO + 4).unwrap(),
            OBJC_IMAGE_SIGNED_CLASS_RO
        );
    }

    #[test]
    fn test_direct_selectors_become_selector_refs() {
        let builder = objc_builder(OBJC_IMAGE_OPTIMIZED_BY_DYLD, &[POOL])
            .objc_opt(POOL)
            .patch(METHLIST, &direct_list(METHLIST, 0, TEXT_SECTION_ADDR));
        let fixture = with_class(builder, METHLIST).build();
        let mut ctx = fixture.context();

        fix_objc(&mut ctx).unwrap();

        assert_eq!(
            ctx.macho.read_u32(METHLIST).unwrap(),
            SMALL_METHOD_SIZE | METHOD_LIST_RELATIVE_FLAG
        );
        let offset = ctx.macho.read_u32(METHLIST + 8).unwrap() as i32 as i64;
        assert_eq!((METHLIST + 8).wrapping_add_signed(offset), SELREFS);
        assert_eq!(selector_name(&ctx, METHLIST + 8), "init");

        // Types and implementation keep their targets.
        let types = ctx.macho.read_u32(METHLIST + 12).unwrap() as i32 as i64;
        assert_eq!((METHLIST + 12).wrapping_add_signed(types), METHTYPE);
        let imp = ctx.macho.read_u32(METHLIST + 16).unwrap() as i32 as i64;
        assert_eq!((METHLIST + 16).wrapping_add_signed(imp), TEXT_SECTION_ADDR);
    }

    #[test]
    fn test_preattached_lists_are_flattened() {
        let category_list = METHLIST + 0x20;
        let lists = OBJC_CONST + 0xA0;
        let entry = |i: u64| lists + 8 + i * 8;
        let packed = |entry: u64, target: u64, image: u64| {
            (((target as i64 - entry as i64) << 16) as u64) | image
        };

        let builder = objc_builder(OBJC_IMAGE_OPTIMIZED_BY_DYLD, &[POOL])
            .objc_opt(POOL)
            .patch(METHLIST, &direct_list(METHLIST, 0, TEXT_SECTION_ADDR))
            .patch(
                category_list,
                &direct_list(category_list, 5, TEXT_SECTION_ADDR + 0x10),
            )
            .patch(
                lists,
                &[
                    u32s(&[8, 3]),
                    u64s(&[
                        packed(entry(0), category_list, 0),
                        packed(entry(1), FOREIGN, 7),
                        packed(entry(2), METHLIST, 0),
                    ]),
                ]
                .concat(),
            );
        let fixture = with_class(builder, lists | LIST_OF_LISTS_TAG).build();
        let mut ctx = fixture.context();

        fix_objc(&mut ctx).unwrap();

        let flattened = ctx.macho.read_u64(OBJC_CONST + RO_METHODS).unwrap();
        assert!(flattened >= EXTRA_ADDR);
        assert_eq!(flattened & LIST_OF_LISTS_TAG, 0);
        assert_eq!(
            ctx.macho.read_u32(flattened).unwrap(),
            SMALL_METHOD_SIZE | METHOD_LIST_RELATIVE_FLAG
        );
        assert_eq!(ctx.macho.read_u32(flattened + 4).unwrap(), 2);

        // Category methods come first; the foreign list is dropped.
        let first = flattened + 8;
        let second = first + SMALL_METHOD_SIZE as u64;
        assert_eq!(selector_name(&ctx, first), "dealloc");
        assert_eq!(selector_name(&ctx, second), "init");

        let imp = ctx.macho.read_u32(first + 8).unwrap() as i32 as i64;
        assert_eq!((first + 8).wrapping_add_signed(imp), TEXT_SECTION_ADDR + 0x10);
        let types = ctx.macho.read_u32(second + 4).unwrap() as i32 as i64;
        assert_eq!((second + 4).wrapping_add_signed(types), METHTYPE);
    }

    #[test]
    fn test_protocol_refs_use_own_definition() {
        let own = OBJC_DATA;
        let mut protocol = vec![0u8; 72];
        protocol[8..16].copy_from_slice(&(CLASSNAME + 7).to_le_bytes());
        protocol[64..68].copy_from_slice(&72u32.to_le_bytes());

        let missing = FOREIGN + 0x40;
        let fixture = objc_builder(OBJC_IMAGE_OPTIMIZED_BY_DYLD, &[POOL])
            .section(SectionSpec::new("__DATA", "__objc_data", OBJC_DATA, 0x80))
            .section(SectionSpec::new("__DATA", "__objc_protolist", PROTOLIST, 8))
            .section(SectionSpec::new("__DATA", "__objc_protorefs", PROTOREFS, 16))
            .patch(own, &protocol)
            .patch(PROTOLIST, &own.to_le_bytes())
            .patch(FOREIGN + 8, &(POOL + 13).to_le_bytes())
            .patch(missing + 8, &(POOL + 19).to_le_bytes())
            .patch(PROTOREFS, &u64s(&[FOREIGN, missing]))
            .build();
        let mut ctx = fixture.context();

        fix_objc(&mut ctx).unwrap();

        assert_eq!(ctx.macho.read_u64(PROTOREFS).unwrap(), own);
        assert_eq!(ctx.macho.read_u64(PROTOREFS + 8).unwrap(), missing);
        assert_eq!(ctx.warnings.len(), 1);
        assert!(ctx.warnings[0].contains("1 objc references"));
    }

    #[test]
    fn test_reference_outside_cache_is_skipped() {
        let fixture = objc_builder(OBJC_IMAGE_OPTIMIZED_BY_DYLD, &[POOL, 0x7777_0000]).build();
        let mut ctx = fixture.context();

        fix_objc(&mut ctx).unwrap();

        assert_eq!(ctx.macho.read_u64(SELREFS).unwrap(), METHNAME);
        assert_eq!(ctx.macho.read_u64(SELREFS + 8).unwrap(), 0x7777_0000);
        assert_eq!(ctx.warnings.len(), 1);
        assert!(ctx.warnings[0].contains("1 objc references"), "{:?}", ctx.warnings);
        assert!(ctx.warnings[0].contains("0x77770000"), "{:?}", ctx.warnings);
    }

    #[test]
    fn test_rewritten_slots_keep_pointer_auth() {
        let field = OBJC_CONST + RO_PROTOCOLS;
        let protocol = OBJC_DATA + 0x60;
        let proto_list = OBJC_CONST + 0xA0;
        let lists = OBJC_CONST + 0xC0;
        let entry = lists + 8;
        let packed = ((proto_list as i64 - entry as i64) << 16) as u64;

        let builder = objc_builder(OBJC_IMAGE_OPTIMIZED_BY_DYLD, &[POOL])
            .patch(proto_list, &u64s(&[1, protocol]))
            .patch(lists, &[u32s(&[8, 1]), u64s(&[packed])].concat());
        let fixture = with_class(builder, 0)
            .patch(field, &(lists | LIST_OF_LISTS_TAG).to_le_bytes())
            .build();
        let mut ctx = fixture.context();

        let field_auth = PointerAuth {
            key: 2,
            diversity: 0xC0DE,
            addr_div: true,
        };
        let entry_auth = PointerAuth {
            key: 0,
            diversity: 0x1234,
            addr_div: false,
        };
        ctx.auth_pointers.insert(field, field_auth);
        ctx.auth_pointers.insert(proto_list + 8, entry_auth);

        fix_objc(&mut ctx).unwrap();

        let rebuilt = ctx.macho.read_u64(field).unwrap();
        assert!(rebuilt >= EXTRA_ADDR);
        assert_eq!(ctx.auth_pointers.get(&field), Some(&field_auth));
        assert_eq!(ctx.macho.read_u64(rebuilt).unwrap(), 1);
        assert_eq!(ctx.macho.read_u64(rebuilt + 8).unwrap(), protocol);
        assert_eq!(ctx.auth_pointers.get(&(rebuilt + 8)), Some(&entry_auth));
    }
}
