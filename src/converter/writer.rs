//! File writer for assembled Mach-O output.
//!
//! Segments get new, compact file offsets in virtual-address order. The
//! output is then described as a list of [`WriteProcedure`]s: pages the
//! pipeline rewrote come from the image view, everything else is copied
//! straight out of the cache files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::macho::{
    SegmentCommand64, LINKEDIT_KEPT_COMMANDS, LINKEDIT_ZEROED_COMMANDS, VIEW_PAGE_SIZE,
};
use crate::util::{align_down, align_up};

use super::{ExtractionContext, WriteProcedure, WriteSource};

/// Segment alignment in the output file for arm64 images.
const ARM64_SEGMENT_ALIGN: u64 = 0x4000;
/// Segment alignment for everything else.
const SEGMENT_ALIGN: u64 = 0x1000;

const ZERO_CHUNK: [u8; 0x1000] = [0; 0x1000];

/// Assigns compact file offsets to every segment and returns the write
/// procedures that produce the output file.
///
/// Section offsets follow their segment, and every load command that
/// addresses `__LINKEDIT` by file offset is shifted with it.
pub fn optimize_offsets(ctx: &mut ExtractionContext) -> Result<Vec<WriteProcedure>> {
    ctx.stage("optimizing offsets");

    let align = if ctx.macho.is_arm64() {
        ARM64_SEGMENT_ALIGN
    } else {
        SEGMENT_ALIGN
    };

    let mut segments: Vec<(usize, SegmentCommand64)> = ctx
        .macho
        .segments()
        .map(|seg| (seg.command_offset, seg.command))
        .collect();
    segments.sort_by_key(|(_, command)| command.vmaddr);

    let mut procedures: Vec<WriteProcedure> = Vec::new();
    let mut write_offset = 0u64;
    let mut linkedit_shift: Option<(u64, u64)> = None;

    for (command_offset, old) in segments {
        if write_offset > 0 && old.filesize > 0 {
            let aligned = align_up(write_offset, align);
            push(&mut procedures, WriteProcedure::zero(write_offset, aligned - write_offset));
            write_offset = aligned;
        }

        trace!(
            "{}: file offset {:#x} -> {:#x}",
            old.name(),
            old.fileoff,
            write_offset
        );
        if old.is_linkedit() {
            linkedit_shift = Some((old.fileoff, write_offset));
        }
        relocate_segment(ctx, command_offset, &old, write_offset)?;

        for procedure in segment_procedures(ctx, &old, write_offset)? {
            push(&mut procedures, procedure);
        }
        write_offset += old.filesize;
    }

    if let Some((old, new)) = linkedit_shift {
        shift_linkedit_commands(ctx, new as i64 - old as i64)?;
    }

    debug!(
        "{} write procedures, {:#x} bytes",
        procedures.len(),
        write_offset
    );
    Ok(procedures)
}

fn push(procedures: &mut Vec<WriteProcedure>, procedure: WriteProcedure) {
    if procedure.size == 0 {
        return;
    }
    if let Some(last) = procedures.last_mut() {
        if last.try_merge(&procedure) {
            return;
        }
    }
    procedures.push(procedure);
}

/// Rewrites a segment command and its sections for a new file offset.
fn relocate_segment(
    ctx: &mut ExtractionContext,
    command_offset: usize,
    old: &SegmentCommand64,
    fileoff: u64,
) -> Result<()> {
    let mut command = *old;
    command.fileoff = fileoff;
    ctx.macho.write_lc(command_offset, &command)?;

    let sections: Vec<_> = ctx
        .macho
        .segments()
        .find(|seg| seg.command_offset == command_offset)
        .map(|seg| seg.sections.clone())
        .unwrap_or_default();
    for info in sections {
        let mut section = info.section;
        section.offset = if section.is_zerofill() {
            0
        } else {
            (fileoff + (section.addr - old.vmaddr)) as u32
        };
        ctx.macho.write_lc(info.struct_offset, &section)?;
    }
    Ok(())
}

/// Describes where each page of a segment's file contents comes from.
///
/// File-backed bytes must come from the view or from a cache mapping; a
/// range crossing a mapping end is split per mapping.
fn segment_procedures(
    ctx: &ExtractionContext,
    segment: &SegmentCommand64,
    fileoff: u64,
) -> Result<Vec<WriteProcedure>> {
    let mut procedures = Vec::new();
    let end = segment.vmaddr + segment.filesize;
    let mut cur = segment.vmaddr;

    while cur < end {
        let page = align_down(cur, VIEW_PAGE_SIZE);
        let mut chunk_end = end.min(page + VIEW_PAGE_SIZE);
        let write_offset = fileoff + (cur - segment.vmaddr);

        let procedure = if ctx.macho.is_page_owned(page) {
            WriteProcedure::from_page(write_offset, cur, chunk_end - cur)
        } else {
            let mapping = ctx
                .cache
                .mapping_for_addr(cur)
                .ok_or(Error::not_mapped(cur))?;
            chunk_end = chunk_end.min(mapping.end());
            WriteProcedure::from_cache(
                write_offset,
                mapping.addr_to_offset(cur),
                chunk_end - cur,
                mapping.subcache_index,
            )
        };
        push(&mut procedures, procedure);
        cur = chunk_end;
    }
    Ok(procedures)
}

/// Moves every `__LINKEDIT` file offset by `delta`.
fn shift_linkedit_commands(ctx: &mut ExtractionContext, delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let shift = |off: u32| {
        if off == 0 {
            off
        } else {
            (off as i64 + delta) as u32
        }
    };

    if let Some((offset, mut symtab)) = ctx.macho.symtab() {
        symtab.symoff = shift(symtab.symoff);
        symtab.stroff = shift(symtab.stroff);
        ctx.macho.write_lc(offset, &symtab)?;
    }

    if let Some((offset, mut dysymtab)) = ctx.macho.dysymtab() {
        dysymtab.tocoff = shift(dysymtab.tocoff);
        dysymtab.modtaboff = shift(dysymtab.modtaboff);
        dysymtab.extrefsymoff = shift(dysymtab.extrefsymoff);
        dysymtab.indirectsymoff = shift(dysymtab.indirectsymoff);
        dysymtab.extreloff = shift(dysymtab.extreloff);
        dysymtab.locreloff = shift(dysymtab.locreloff);
        ctx.macho.write_lc(offset, &dysymtab)?;
    }

    if let Some((offset, mut info)) = ctx.macho.dyld_info() {
        info.rebase_off = shift(info.rebase_off);
        info.bind_off = shift(info.bind_off);
        info.weak_bind_off = shift(info.weak_bind_off);
        info.lazy_bind_off = shift(info.lazy_bind_off);
        info.export_off = shift(info.export_off);
        ctx.macho.write_lc(offset, &info)?;
    }

    for cmd in LINKEDIT_KEPT_COMMANDS.into_iter().chain(LINKEDIT_ZEROED_COMMANDS) {
        if let Some((offset, mut data)) = ctx.macho.linkedit_data(cmd) {
            data.dataoff = shift(data.dataoff);
            ctx.macho.write_lc(offset, &data)?;
        }
    }
    Ok(())
}

/// Writes the extracted Mach-O to `output_path`.
///
/// The procedures must tile the file from offset 0 without gaps. A
/// partially written file is removed on failure.
pub fn write_macho<P: AsRef<Path>>(
    ctx: &ExtractionContext,
    procedures: &[WriteProcedure],
    output_path: P,
) -> Result<()> {
    ctx.stage("writing");
    let path = output_path.as_ref();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let file = File::create(path).map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    let result = write_procedures(ctx, procedures, BufWriter::new(file));
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result.map_err(|err| match err {
        Error::Io(source) => Error::FileWrite {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

fn write_procedures<W: Write>(
    ctx: &ExtractionContext,
    procedures: &[WriteProcedure],
    mut out: W,
) -> Result<()> {
    let mut written = 0u64;
    for procedure in procedures {
        if procedure.write_offset != written {
            return Err(Error::parse(
                procedure.write_offset as usize,
                format!("write procedures are not contiguous at {:#x}", written),
            ));
        }

        match procedure.source {
            WriteSource::Cache { subcache_index } => {
                let data = ctx.cache.data_for_subcache(subcache_index);
                let start = procedure.read_offset as usize;
                let bytes = data
                    .get(start..start + procedure.size as usize)
                    .ok_or(Error::out_of_bounds(procedure.read_offset, procedure.size as usize))?;
                out.write_all(bytes)?;
            }
            WriteSource::Page => {
                let end = procedure.read_offset + procedure.size;
                let mut cur = procedure.read_offset;
                while cur < end {
                    let page = align_down(cur, VIEW_PAGE_SIZE);
                    let chunk_end = end.min(page + VIEW_PAGE_SIZE);
                    let bytes = ctx
                        .macho
                        .owned_page(page)
                        .ok_or(Error::out_of_bounds(cur, (chunk_end - cur) as usize))?;
                    out.write_all(&bytes[(cur - page) as usize..(chunk_end - page) as usize])?;
                    cur = chunk_end;
                }
            }
            WriteSource::Zero => {
                let mut remaining = procedure.size;
                while remaining > 0 {
                    let n = remaining.min(ZERO_CHUNK.len() as u64);
                    out.write_all(&ZERO_CHUNK[..n as usize])?;
                    remaining -= n;
                }
            }
        }
        written = procedure.write_end();
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::optimize_linkedit;
    use crate::macho::{MachHeader64, MH_MAGIC_64};
    use crate::testutil::{CacheBuilder, DATA_ADDR, IMAGE_ADDR, TEXT_SECTION_ADDR};
    use zerocopy::FromBytes;

    #[test]
    fn test_segments_are_packed_in_vm_order() {
        let fixture = CacheBuilder::new().build();
        let mut ctx = fixture.context();
        let old_symoff = ctx.macho.symtab().unwrap().1.symoff;

        let procedures = optimize_offsets(&mut ctx).unwrap();

        let offsets: Vec<(String, u64)> = ctx
            .macho
            .segments()
            .map(|seg| (seg.name().to_string(), seg.command.fileoff))
            .collect();
        assert_eq!(
            offsets,
            vec![
                ("__TEXT".to_string(), 0),
                ("__DATA".to_string(), 0x4000),
                ("__LINKEDIT".to_string(), 0x8000),
            ]
        );

        let text = ctx.macho.section("__TEXT", "__text").unwrap();
        assert_eq!(text.section.offset as u64, TEXT_SECTION_ADDR - IMAGE_ADDR);
        let data = ctx.macho.section("__DATA", "__data").unwrap();
        assert_eq!(data.section.offset as u64, 0x4000 + 0x2000);

        // __LINKEDIT moved from 0xC000 to 0x8000.
        assert_eq!(ctx.macho.symtab().unwrap().1.symoff, old_symoff - 0x4000);

        assert_eq!(procedures[0].write_offset, 0);
        for pair in procedures.windows(2) {
            assert_eq!(pair[0].write_end(), pair[1].write_offset);
        }
    }

    #[test]
    fn test_rewritten_pages_come_from_view() {
        let fixture = CacheBuilder::new().build();
        let mut ctx = fixture.context();
        ctx.macho.write_u64(DATA_ADDR + 0x1010, 0xDEAD_BEEF).unwrap();

        let procedures = optimize_offsets(&mut ctx).unwrap();

        let page = procedures
            .iter()
            .find(|p| {
                matches!(p.source, WriteSource::Page)
                    && p.read_offset <= DATA_ADDR + 0x1000
                    && p.read_offset + p.size > DATA_ADDR + 0x1000
            })
            .unwrap();
        assert_eq!(page.write_offset, 0x4000 + (page.read_offset - DATA_ADDR));
    }

    #[test]
    fn test_unbacked_segment_bytes_are_fatal() {
        let fixture = CacheBuilder::new().build();
        let mut ctx = fixture.context();
        ctx.macho
            .rewrite_segment("__LINKEDIT", |seg| {
                seg.vmsize = 0x100_0000;
                seg.filesize = 0x100_0000;
            })
            .unwrap();

        let err = optimize_offsets(&mut ctx).unwrap_err();
        assert!(matches!(err, Error::AddressNotMapped { .. }), "{err}");
    }

    #[test]
    fn test_written_file_matches_layout() {
        let fixture = CacheBuilder::new().build();
        let mut ctx = fixture.context();
        let ncmds = ctx.macho.header().ncmds;
        optimize_linkedit(&mut ctx).unwrap();
        ctx.macho.write_u64(DATA_ADDR + 0x10, 0x1234_5678).unwrap();

        let procedures = optimize_offsets(&mut ctx).unwrap();
        let path = fixture.dir().join("out").join("image.dylib");
        write_macho(&ctx, &procedures, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let linkedit = ctx.macho.segment("__LINKEDIT").unwrap().command;
        assert_eq!(bytes.len() as u64, linkedit.fileoff + linkedit.filesize);

        let header = MachHeader64::read_from_prefix(&bytes).unwrap().0;
        assert_eq!(header.magic, MH_MAGIC_64);
        assert_eq!(header.ncmds, ncmds);
        assert_eq!(&bytes[0x4010..0x4018], &0x1234_5678u64.to_le_bytes());
    }

    #[test]
    fn test_gap_removes_partial_file() {
        let fixture = CacheBuilder::new().build();
        let ctx = fixture.context();
        let path = fixture.dir().join("broken.dylib");
        let procedures = [
            WriteProcedure::zero(0, 0x10),
            WriteProcedure::zero(0x20, 0x10),
        ];

        assert!(write_macho(&ctx, &procedures, &path).is_err());
        assert!(!path.exists());
    }
}
