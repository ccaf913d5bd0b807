//! ARM64 instruction encoding and decoding.
//!
//! Covers the handful of instruction forms that appear in dyld stubs and
//! stub islands, plus the B/BL call sites that reach them.

use crate::error::{Error, Result};

// =============================================================================
// Instruction Detection
// =============================================================================

/// Returns true if the instruction is ADRP.
#[inline]
pub fn is_adrp(instr: u32) -> bool {
    (instr & 0x9F00_0000) == 0x9000_0000
}

/// Returns true if the instruction is ADD (immediate).
#[inline]
pub fn is_add_imm(instr: u32) -> bool {
    (instr & 0x7F80_0000) == 0x1100_0000
}

/// Returns true if the instruction is a 64-bit LDR (unsigned immediate).
#[inline]
pub fn is_ldr_unsigned_imm(instr: u32) -> bool {
    (instr & 0xFFC0_0000) == 0xF940_0000
}

/// Returns true if the instruction is BR (branch to register).
#[inline]
pub fn is_br(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_0000
}

/// Returns true if the instruction is B.
#[inline]
pub fn is_b(instr: u32) -> bool {
    (instr & 0xFC00_0000) == 0x1400_0000
}

/// Returns true if the instruction is BL (branch with link).
#[inline]
pub fn is_bl(instr: u32) -> bool {
    (instr & 0xFC00_0000) == 0x9400_0000
}

/// Returns true if the instruction is B or BL.
#[inline]
pub fn is_branch(instr: u32) -> bool {
    (instr & 0x7C00_0000) == 0x1400_0000
}

/// Returns true if the instruction is BRAA (authenticated branch, register modifier).
#[inline]
pub fn is_braa(instr: u32) -> bool {
    (instr & 0xFFFF_FC00) == 0xD71F_0800
}

/// Returns true if the instruction is BRAAZ (authenticated branch, zero modifier).
#[inline]
pub fn is_braaz(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_081F
}

/// Returns true if the instruction is a trap (BRK).
#[inline]
pub fn is_trap(instr: u32) -> bool {
    (instr & 0xFFE0_001F) == 0xD420_0000
}

/// Returns true if the instruction is NOP.
#[inline]
pub fn is_nop(instr: u32) -> bool {
    instr == 0xD503_201F
}

// =============================================================================
// Instruction Decoding
// =============================================================================

/// Decodes an ADRP instruction, returning the target page address.
pub fn decode_adrp(instr: u32, pc: u64) -> u64 {
    let immlo = ((instr >> 29) & 0x3) as u64;
    let immhi = ((instr >> 5) & 0x7_FFFF) as u64;
    let imm = (immhi << 2) | immlo;

    // Sign extend the 21-bit immediate
    let imm = if (imm & (1 << 20)) != 0 {
        imm | 0xFFFF_FFFF_FFE0_0000
    } else {
        imm
    };

    (pc & !0xFFF).wrapping_add(imm << 12)
}

/// Decodes an ADD (immediate) instruction, returning the immediate value.
pub fn decode_add_imm(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let shift = (instr >> 22) & 0x3;
    if shift == 1 { imm12 << 12 } else { imm12 }
}

/// Decodes an LDR (unsigned immediate) instruction, returning the byte offset.
pub fn decode_ldr_offset(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let size = (instr >> 30) & 0x3;
    imm12 << size
}

/// Decodes a B/BL instruction, returning the target address.
pub fn decode_branch(instr: u32, pc: u64) -> u64 {
    let imm26 = (instr & 0x03FF_FFFF) as i64;

    let imm26 = if (imm26 & (1 << 25)) != 0 {
        imm26 | !0x03FF_FFFF
    } else {
        imm26
    };

    pc.wrapping_add((imm26 << 2) as u64)
}

/// Destination register of ADRP/ADD/LDR.
#[inline]
pub fn rd(instr: u32) -> u8 {
    (instr & 0x1F) as u8
}

/// First source register of ADD/LDR and the target register of BR/BRAA.
#[inline]
pub fn rn(instr: u32) -> u8 {
    ((instr >> 5) & 0x1F) as u8
}

/// Modifier register of BRAA.
#[inline]
pub fn braa_rm(instr: u32) -> u8 {
    (instr & 0x1F) as u8
}

// =============================================================================
// Instruction Encoding
// =============================================================================

/// Maximum reach of B/BL in either direction.
pub const BRANCH_RANGE: i64 = 128 * 1024 * 1024;

/// Returns true if a B/BL at `pc` can reach `target`.
#[inline]
pub fn branch_in_range(pc: u64, target: u64) -> bool {
    let delta = target.wrapping_sub(pc) as i64;
    (-BRANCH_RANGE..BRANCH_RANGE).contains(&delta) && delta & 3 == 0
}

/// Encodes an ADRP instruction.
pub fn encode_adrp(rd: u8, pc: u64, target: u64) -> u32 {
    let target_page = target & !0xFFF;
    let pc_page = pc & !0xFFF;
    let delta = target_page.wrapping_sub(pc_page) as i64;
    let imm = (delta >> 12) as u32;

    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_FFFF) << 5;

    0x9000_0000 | immlo | immhi | (rd as u32)
}

/// Encodes a 64-bit ADD (immediate) instruction.
pub fn encode_add_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    let imm12 = (imm & 0xFFF) << 10;
    0x9100_0000 | imm12 | ((rn as u32) << 5) | (rd as u32)
}

/// Encodes a 64-bit LDR (unsigned immediate). `offset` is a byte offset
/// within the page and must be a multiple of 8.
pub fn encode_ldr_unsigned(rt: u8, rn: u8, offset: u64) -> u32 {
    let imm12 = ((offset >> 3) & 0xFFF) as u32;
    0xF940_0000 | (imm12 << 10) | ((rn as u32) << 5) | (rt as u32)
}

/// Encodes a BR (branch to register) instruction.
pub fn encode_br(rn: u8) -> u32 {
    0xD61F_0000 | ((rn as u32) << 5)
}

fn branch_imm26(pc: u64, target: u64) -> Result<u32> {
    if !branch_in_range(pc, target) {
        return Err(Error::BranchOutOfRange { from: pc, target });
    }
    let offset = target.wrapping_sub(pc) as i64;
    Ok(((offset >> 2) & 0x03FF_FFFF) as u32)
}

/// Encodes a B (branch) instruction.
pub fn encode_b(pc: u64, target: u64) -> Result<u32> {
    Ok(0x1400_0000 | branch_imm26(pc, target)?)
}

/// Encodes a BL (branch with link) instruction.
pub fn encode_bl(pc: u64, target: u64) -> Result<u32> {
    Ok(0x9400_0000 | branch_imm26(pc, target)?)
}

/// Re-targets a B or BL, keeping its link bit.
pub fn retarget_branch(instr: u32, pc: u64, target: u64) -> Result<u32> {
    if is_bl(instr) {
        encode_bl(pc, target)
    } else {
        encode_b(pc, target)
    }
}

/// Encodes a BRAA instruction.
pub fn encode_braa(rn: u8, rm: u8) -> u32 {
    0xD71F_0800 | ((rn as u32) << 5) | (rm as u32)
}

/// Encodes a BRAAZ instruction.
pub fn encode_braaz(rn: u8) -> u32 {
    0xD61F_081F | ((rn as u32) << 5)
}

/// Encodes a NOP instruction.
pub fn encode_nop() -> u32 {
    0xD503_201F
}

/// Encodes a BRK (trap) instruction.
pub fn encode_brk(imm: u16) -> u32 {
    0xD420_0000 | ((imm as u32) << 5)
}

// =============================================================================
// High-Level Helpers
// =============================================================================

/// Follows an ADRP+ADD or ADRP+LDR pair to the address it forms.
pub fn follow_adrp_add(adrp_addr: u64, instr0: u32, instr1: u32) -> Option<u64> {
    if !is_adrp(instr0) {
        return None;
    }

    let page = decode_adrp(instr0, adrp_addr);

    if is_add_imm(instr1) {
        Some(page + decode_add_imm(instr1) as u64)
    } else if is_ldr_unsigned_imm(instr1) {
        Some(page + decode_ldr_offset(instr1) as u64)
    } else {
        None
    }
}
