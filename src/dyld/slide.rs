//! Slide info decoding.
//!
//! Each cache mapping that holds pointers carries a slide info blob that
//! tells dyld where those pointers are and how they are packed. The blob
//! is parsed once into a [`SlideInfo`] borrowing the cache bytes, and then
//! asked for the fixups of individual pages.

use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::util::{read_u16_le_at, read_u32_le_at, read_u64_le_at};

use super::structs::*;

/// Pointer-authentication metadata carried by an arm64e pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerAuth {
    /// 0 = IA, 1 = IB, 2 = DA, 3 = DB
    pub key: u8,
    pub diversity: u16,
    pub addr_div: bool,
}

/// One pointer slot inside a page and its unslid target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Byte offset within the page
    pub offset: u32,
    pub value: u64,
    /// 4 for v1 slots, 8 otherwise
    pub width: u8,
    pub auth: Option<PointerAuth>,
}

/// A parsed slide info blob.
#[derive(Debug, Clone, Copy)]
pub enum SlideInfo<'a> {
    V1 {
        info: DyldCacheSlideInfo1,
        data: &'a [u8],
    },
    V2 {
        info: DyldCacheSlideInfo2,
        page_starts: &'a [u8],
        page_extras: &'a [u8],
    },
    V3 {
        info: DyldCacheSlideInfo3,
        page_starts: &'a [u8],
    },
    V5 {
        info: DyldCacheSlideInfo5,
        page_starts: &'a [u8],
    },
}

/// Returns `data[offset..offset + len]` or an `InvalidSlideInfo` error.
fn slice_at<'a>(
    data: &'a [u8],
    base: u64,
    offset: usize,
    len: usize,
    what: &str,
) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| Error::InvalidSlideInfo {
            offset: base,
            reason: format!("{what} extends past the slide info blob"),
        })
}

impl<'a> SlideInfo<'a> {
    /// Parses the blob. `file_offset` is only used for error messages.
    pub fn parse(data: &'a [u8], file_offset: u64) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::InvalidSlideInfo {
                offset: file_offset,
                reason: "truncated header".into(),
            });
        }
        let version = read_u32_le_at(data, 0);
        let truncated = || Error::InvalidSlideInfo {
            offset: file_offset,
            reason: format!("truncated v{version} header"),
        };

        match version {
            1 => {
                let (info, _) =
                    DyldCacheSlideInfo1::read_from_prefix(data).map_err(|_| truncated())?;
                slice_at(
                    data,
                    file_offset,
                    info.toc_offset as usize,
                    info.toc_count as usize * 2,
                    "toc",
                )?;
                slice_at(
                    data,
                    file_offset,
                    info.entries_offset as usize,
                    info.entries_count as usize * info.entries_size as usize,
                    "bitmap entries",
                )?;
                if info.entries_size < 128 {
                    return Err(Error::InvalidSlideInfo {
                        offset: file_offset,
                        reason: format!("bitmap entry size {}", info.entries_size),
                    });
                }
                Ok(SlideInfo::V1 { info, data })
            }
            2 => {
                let (info, _) =
                    DyldCacheSlideInfo2::read_from_prefix(data).map_err(|_| truncated())?;
                let page_starts = slice_at(
                    data,
                    file_offset,
                    info.page_starts_offset as usize,
                    info.page_starts_count as usize * 2,
                    "page starts",
                )?;
                let page_extras = slice_at(
                    data,
                    file_offset,
                    info.page_extras_offset as usize,
                    info.page_extras_count as usize * 2,
                    "page extras",
                )?;
                Ok(SlideInfo::V2 {
                    info,
                    page_starts,
                    page_extras,
                })
            }
            3 => {
                let (info, _) =
                    DyldCacheSlideInfo3::read_from_prefix(data).map_err(|_| truncated())?;
                let page_starts = slice_at(
                    data,
                    file_offset,
                    std::mem::size_of::<DyldCacheSlideInfo3>(),
                    info.page_starts_count as usize * 2,
                    "page starts",
                )?;
                Ok(SlideInfo::V3 { info, page_starts })
            }
            5 => {
                let (info, _) =
                    DyldCacheSlideInfo5::read_from_prefix(data).map_err(|_| truncated())?;
                let page_starts = slice_at(
                    data,
                    file_offset,
                    std::mem::size_of::<DyldCacheSlideInfo5>(),
                    info.page_starts_count as usize * 2,
                    "page starts",
                )?;
                Ok(SlideInfo::V5 { info, page_starts })
            }
            other => Err(Error::UnsupportedSlideFormat(other)),
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            SlideInfo::V1 { .. } => 1,
            SlideInfo::V2 { .. } => 2,
            SlideInfo::V3 { .. } => 3,
            SlideInfo::V5 { .. } => 5,
        }
    }

    /// Number of bytes covered by one page entry.
    pub fn page_size(&self) -> u64 {
        match self {
            SlideInfo::V1 { .. } => PAGE_SIZE_4K as u64,
            SlideInfo::V2 { info, .. } => info.page_size as u64,
            SlideInfo::V3 { info, .. } => info.page_size as u64,
            SlideInfo::V5 { info, .. } => info.page_size as u64,
        }
    }

    /// Number of page entries in the blob.
    pub fn page_count(&self) -> usize {
        match self {
            SlideInfo::V1 { info, .. } => info.toc_count as usize,
            SlideInfo::V2 { info, .. } => info.page_starts_count as usize,
            SlideInfo::V3 { info, .. } => info.page_starts_count as usize,
            SlideInfo::V5 { info, .. } => info.page_starts_count as usize,
        }
    }

    /// Authentication metadata of a single slide-encoded pointer.
    pub fn pointer_auth(&self, raw: u64) -> Option<PointerAuth> {
        let (is_auth, key, diversity, addr_div) = match self {
            SlideInfo::V3 { .. } => {
                let ptr = SlidePointer3(raw);
                (ptr.is_auth(), ptr.key(), ptr.diversity(), ptr.has_addr_diversity())
            }
            SlideInfo::V5 { .. } => {
                let ptr = SlidePointer5(raw);
                (ptr.is_auth(), ptr.key(), ptr.diversity(), ptr.has_addr_diversity())
            }
            SlideInfo::V1 { .. } | SlideInfo::V2 { .. } => return None,
        };
        is_auth.then_some(PointerAuth {
            key,
            diversity,
            addr_div,
        })
    }

    /// Decodes a single slide-encoded pointer without walking a chain.
    pub fn decode_pointer(&self, raw: u64) -> u64 {
        match self {
            SlideInfo::V1 { .. } => raw,
            SlideInfo::V2 { info, .. } => {
                let value = raw & info.value_mask();
                if value != 0 { value + info.value_add } else { 0 }
            }
            SlideInfo::V3 { info, .. } => {
                let ptr = SlidePointer3(raw);
                if ptr.is_auth() {
                    info.auth_value_add + ptr.auth_offset()
                } else {
                    ptr.plain_value()
                }
            }
            SlideInfo::V5 { info, .. } => {
                let ptr = SlidePointer5(raw);
                if ptr.is_auth() {
                    info.value_add + ptr.runtime_offset()
                } else {
                    (info.value_add + ptr.runtime_offset()) | (ptr.high8() << 56)
                }
            }
        }
    }

    /// Returns the fixups of page `page_index`, decoded from the page's
    /// original bytes.
    ///
    /// The result only depends on `page`, so decoding the same cache page
    /// twice always yields the same fixups.
    pub fn page_fixups(&self, page_index: usize, page: &[u8]) -> Result<Vec<Fixup>> {
        if page_index >= self.page_count() {
            return Ok(Vec::new());
        }

        match self {
            SlideInfo::V1 { info, data } => {
                let toc = read_u16_le_at(data, info.toc_offset as usize + page_index * 2) as usize;
                if toc >= info.entries_count as usize {
                    return Err(self.invalid(page_index, format!("toc entry {toc} out of range")));
                }
                let entry_off = info.entries_offset as usize + toc * info.entries_size as usize;
                let bitmap = &data[entry_off..entry_off + 128];

                let mut fixups = Vec::new();
                for (byte_idx, &bits) in bitmap.iter().enumerate() {
                    for bit in 0..8 {
                        if bits & (1 << bit) == 0 {
                            continue;
                        }
                        let offset = (byte_idx * 8 + bit) * 4;
                        if offset + 4 > page.len() {
                            let reason = format!("slot {offset:#x} past page end");
                            return Err(self.invalid(page_index, reason));
                        }
                        fixups.push(Fixup {
                            offset: offset as u32,
                            value: read_u32_le_at(page, offset) as u64,
                            width: 4,
                            auth: None,
                        });
                    }
                }
                Ok(fixups)
            }
            SlideInfo::V2 {
                info,
                page_starts,
                page_extras,
            } => {
                let start = read_u16_le_at(page_starts, page_index * 2);
                if start == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
                    return Ok(Vec::new());
                }

                let mut fixups = Vec::new();
                if start & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
                    let mut extra_index = (start & !DYLD_CACHE_SLIDE_PAGE_ATTRS) as usize;
                    loop {
                        if extra_index * 2 + 2 > page_extras.len() {
                            let reason = format!("extra {extra_index} out of range");
                            return Err(self.invalid(page_index, reason));
                        }
                        let extra = read_u16_le_at(page_extras, extra_index * 2);
                        let chain_start = (extra & !DYLD_CACHE_SLIDE_PAGE_ATTRS) as usize * 4;
                        self.walk_v2_chain(info, page_index, page, chain_start, &mut fixups)?;
                        if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                            break;
                        }
                        extra_index += 1;
                    }
                } else {
                    self.walk_v2_chain(info, page_index, page, start as usize * 4, &mut fixups)?;
                }
                Ok(fixups)
            }
            SlideInfo::V3 { info, page_starts } => {
                let start = read_u16_le_at(page_starts, page_index * 2);
                if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
                    return Ok(Vec::new());
                }

                let mut fixups = Vec::new();
                let mut offset = start as usize;
                loop {
                    let raw = self.chain_slot(page_index, page, offset)?;
                    let ptr = SlidePointer3(raw);
                    let auth = self.pointer_auth(raw);
                    let value = if ptr.is_auth() {
                        info.auth_value_add + ptr.auth_offset()
                    } else {
                        ptr.plain_value()
                    };
                    fixups.push(Fixup {
                        offset: offset as u32,
                        value,
                        width: 8,
                        auth,
                    });

                    match ptr.offset_to_next() {
                        0 => break,
                        delta => offset += delta as usize,
                    }
                }
                Ok(fixups)
            }
            SlideInfo::V5 { page_starts, .. } => {
                let start = read_u16_le_at(page_starts, page_index * 2);
                if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
                    return Ok(Vec::new());
                }

                let mut fixups = Vec::new();
                let mut offset = start as usize;
                loop {
                    let raw = self.chain_slot(page_index, page, offset)?;
                    let ptr = SlidePointer5(raw);
                    let auth = self.pointer_auth(raw);
                    fixups.push(Fixup {
                        offset: offset as u32,
                        value: self.decode_pointer(raw),
                        width: 8,
                        auth,
                    });

                    match ptr.next() {
                        0 => break,
                        delta => offset += delta as usize,
                    }
                }
                Ok(fixups)
            }
        }
    }

    fn walk_v2_chain(
        &self,
        info: &DyldCacheSlideInfo2,
        page_index: usize,
        page: &[u8],
        start: usize,
        fixups: &mut Vec<Fixup>,
    ) -> Result<()> {
        let delta_shift = info.delta_shift();
        let mut offset = start;
        loop {
            let raw = self.chain_slot(page_index, page, offset)?;
            let delta = ((raw & info.delta_mask) >> delta_shift) as usize;

            let mut value = raw & info.value_mask();
            if value != 0 {
                value += info.value_add;
            }
            fixups.push(Fixup {
                offset: offset as u32,
                value,
                width: 8,
                auth: None,
            });

            if delta == 0 {
                return Ok(());
            }
            offset += delta;
        }
    }

    fn chain_slot(&self, page_index: usize, page: &[u8], offset: usize) -> Result<u64> {
        if offset + 8 > page.len() {
            return Err(self.invalid(page_index, format!("chain slot {offset:#x} past page end")));
        }
        Ok(read_u64_le_at(page, offset))
    }

    fn invalid(&self, page_index: usize, reason: String) -> Error {
        Error::InvalidSlideInfo {
            offset: page_index as u64 * self.page_size(),
            reason: format!("v{} page {}: {}", self.version(), page_index, reason),
        }
    }
}
