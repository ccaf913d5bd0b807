//! Slide info processing for pointer rebasing.
//!
//! In the dyld shared cache, pointers contain encoded information for ASLR.
//! This module removes that encoding to produce normal pointers.
//!
//! Pages are decoded from the original cache bytes in parallel and the
//! resulting fixups are then written into the image view one by one, so
//! running the stage twice leaves the same bytes behind.

use std::collections::BTreeSet;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::dyld::{Fixup, MappingEntry};
use crate::error::Result;
use crate::util::align_up;

use super::ExtractionContext;

/// Processes slide info for all mappings that overlap with the image.
pub fn process_slide_info(ctx: &mut ExtractionContext) -> Result<()> {
    ctx.stage("processing slide info");

    let cache = Arc::clone(&ctx.cache);
    let ranges: Vec<(u64, u64)> = ctx
        .macho
        .segments()
        .map(|seg| (seg.command.vmaddr, seg.command.vm_end()))
        .collect();

    let mut applied = 0usize;
    for mapping in cache.mappings.iter().filter(|m| m.has_slide_info()) {
        if !ranges
            .iter()
            .any(|&(start, end)| start < mapping.end() && end > mapping.address)
        {
            continue;
        }

        let Some(slide) = cache.slide_info(mapping)? else {
            continue;
        };
        let page_size = slide.page_size();
        let pages = pages_touching(mapping, page_size, &ranges);

        debug!(
            "slide info v{} for mapping {:#x}: {} of {} pages touch the image",
            slide.version(),
            mapping.address,
            pages.len(),
            slide.page_count()
        );

        let decoded: Vec<(u64, Vec<Fixup>)> = pages
            .par_iter()
            .map(|&index| {
                let page_addr = mapping.address + index as u64 * page_size;
                let len = (mapping.end() - page_addr).min(page_size) as usize;
                let page = cache.data_at_addr(page_addr, len)?;
                Ok((page_addr, slide.page_fixups(index, page)?))
            })
            .collect::<Result<_>>()?;

        for (page_addr, fixups) in decoded {
            for fixup in fixups {
                if apply_fixup(ctx, page_addr, &fixup)? {
                    applied += 1;
                }
            }
        }
    }

    debug!(
        "rebased {} pointers, {} authenticated",
        applied,
        ctx.auth_pointers.len()
    );
    Ok(())
}

/// Indices of the mapping's pages that overlap any of `ranges`.
fn pages_touching(mapping: &MappingEntry, page_size: u64, ranges: &[(u64, u64)]) -> Vec<usize> {
    let mut pages = BTreeSet::new();
    for &(start, end) in ranges {
        let start = start.max(mapping.address);
        let end = end.min(mapping.end());
        if start >= end {
            continue;
        }
        let first = (start - mapping.address) / page_size;
        let last = align_up(end - mapping.address, page_size) / page_size;
        pages.extend(first as usize..last as usize);
    }
    pages.into_iter().collect()
}

/// Writes one decoded slot into the view. Slots outside the image are
/// skipped, since a page can be shared with a neighbouring image.
fn apply_fixup(ctx: &mut ExtractionContext, page_addr: u64, fixup: &Fixup) -> Result<bool> {
    let addr = page_addr + fixup.offset as u64;
    let inside = ctx
        .macho
        .segment_containing(addr)
        .is_some_and(|seg| addr + fixup.width as u64 <= seg.command.vm_end());
    if !inside {
        trace!("slot {:#x} is outside the image", addr);
        return Ok(false);
    }

    match fixup.width {
        4 => ctx.macho.write_u32(addr, fixup.value as u32)?,
        _ => ctx.macho.write_u64(addr, fixup.value)?,
    }
    match fixup.auth {
        Some(auth) => {
            ctx.auth_pointers.insert(addr, auth);
        }
        None => {
            ctx.auth_pointers.remove(&addr);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::PointerAuth;
    use crate::error::Error;
    use crate::testutil::{slide_info_v2, slide_info_v3, CacheBuilder, DATA_ADDR, LINKEDIT_ADDR};

    const DELTA_MASK: u64 = 0x00FF_FF00_0000_0000;

    #[test]
    fn test_v2_single_slot() {
        let fixture = CacheBuilder::new()
            // Page 0 chain starts at 0x10 (4-byte units).
            .slide_info(slide_info_v2(&[0x4], DELTA_MASK, 0x1000_0000))
            .patch(DATA_ADDR + 0x10, &0x0000_0002_0000_0100u64.to_le_bytes())
            .build();
        let mut ctx = fixture.context();
        process_slide_info(&mut ctx).unwrap();

        assert_eq!(ctx.macho.read_u64(DATA_ADDR + 0x10).unwrap(), 0x2_1000_0100);
        // The cache itself still holds the encoded value.
        assert_eq!(
            ctx.cache.data_at_addr(DATA_ADDR + 0x10, 8).unwrap(),
            &0x0000_0002_0000_0100u64.to_le_bytes()
        );
    }

    #[test]
    fn test_v2_chain_is_idempotent() {
        // Slot at 0x0 points 0x8 bytes on (delta 2 in 4-byte units).
        let first = 0x0000_0200_0000_4000u64;
        let second = 0x0000_0000_0000_5000u64;
        let fixture = CacheBuilder::new()
            .slide_info(slide_info_v2(&[0x0], DELTA_MASK, 0x1_8000_0000))
            .patch(DATA_ADDR, &first.to_le_bytes())
            .patch(DATA_ADDR + 8, &second.to_le_bytes())
            .build();
        let mut ctx = fixture.context();

        process_slide_info(&mut ctx).unwrap();
        let once = ctx.macho.read_bytes(DATA_ADDR, 16).unwrap().into_owned();
        process_slide_info(&mut ctx).unwrap();
        let twice = ctx.macho.read_bytes(DATA_ADDR, 16).unwrap().into_owned();

        assert_eq!(once, twice);
        assert_eq!(ctx.macho.read_u64(DATA_ADDR).unwrap(), 0x1_8000_4000);
        assert_eq!(ctx.macho.read_u64(DATA_ADDR + 8).unwrap(), 0x1_8000_5000);
    }

    #[test]
    fn test_no_rebase_pages_stay_borrowed() {
        // Mapping 1 covers __DATA and __LINKEDIT; only the first linkedit
        // page has a chain.
        let fixture = CacheBuilder::new()
            .slide_info(slide_info_v2(
                &[0x4000, 0x4000, 0x4000, 0x4000, 0x0, 0x4000, 0x4000, 0x4000],
                DELTA_MASK,
                0x1000,
            ))
            .patch(LINKEDIT_ADDR, &0x20u64.to_le_bytes())
            .build();
        let mut ctx = fixture.context();
        process_slide_info(&mut ctx).unwrap();
        assert_eq!(ctx.macho.read_u64(LINKEDIT_ADDR).unwrap(), 0x1020);
        assert_eq!(ctx.macho.owned_page_count(), 1);
    }

    #[test]
    fn test_v3_auth_metadata_recorded() {
        // auth=1, key DA (2), addr div, diversity 0x1234, offset 0x4000
        let raw = (1u64 << 63) | (2 << 49) | (1 << 48) | (0x1234 << 32) | 0x4000;
        let fixture = CacheBuilder::new()
            .slide_info(slide_info_v3(&[0x20], 0x1_8000_0000))
            .patch(DATA_ADDR + 0x20, &raw.to_le_bytes())
            .build();
        let mut ctx = fixture.context();
        process_slide_info(&mut ctx).unwrap();

        assert_eq!(ctx.macho.read_u64(DATA_ADDR + 0x20).unwrap(), 0x1_8000_4000);
        assert_eq!(
            ctx.auth_pointers.get(&(DATA_ADDR + 0x20)),
            Some(&PointerAuth {
                key: 2,
                diversity: 0x1234,
                addr_div: true
            })
        );
    }

    #[test]
    fn test_unsupported_version_is_fatal() {
        let mut blob = slide_info_v2(&[0x4000], DELTA_MASK, 0);
        blob[..4].copy_from_slice(&4u32.to_le_bytes());
        let fixture = CacheBuilder::new().slide_info(blob).build();
        let mut ctx = fixture.context();
        assert!(matches!(
            process_slide_info(&mut ctx),
            Err(Error::UnsupportedSlideFormat(4))
        ));
    }
}
