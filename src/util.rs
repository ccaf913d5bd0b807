//! Byte-level helpers shared by the cache reader, the image view and the
//! converter stages.
//!
//! Everything here is little-endian: dyld caches only ship for
//! little-endian targets.

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 8`.
#[inline(always)]
pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Reads a little-endian u64 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 8 > data.len()`.
#[inline(always)]
pub fn read_u64_le_at(data: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&data[offset..])
}

/// Reads a little-endian u32 from an unaligned byte slice.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

/// Reads a little-endian u32 from a byte slice at the given offset.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..])
}

/// Reads a little-endian u16 from a byte slice at the given offset.
#[inline(always)]
pub fn read_u16_le_at(data: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&data[offset..])
}

/// Bounds-checked u32 read, `None` past the end of `data`.
#[inline]
pub fn get_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?).map(LittleEndian::read_u32)
}

/// Bounds-checked u64 read, `None` past the end of `data`.
#[inline]
pub fn get_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset.checked_add(8)?).map(LittleEndian::read_u64)
}

// =============================================================================
// Writes
// =============================================================================

#[inline(always)]
pub fn write_u64_le_at(data: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut data[offset..], value);
}

#[inline(always)]
pub fn write_u32_le_at(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..], value);
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice, or its length.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the NUL-terminated string at the start of `data`.
///
/// Invalid UTF-8 yields an empty string; Mach-O symbol and class names
/// are ASCII in practice.
#[inline]
pub fn cstr_at(data: &[u8]) -> &str {
    std::str::from_utf8(&data[..memchr_null(data)]).unwrap_or("")
}

// =============================================================================
// ULEB128 Fast Path
// =============================================================================

/// Reads an unsigned LEB128 value.
///
/// One- and two-byte encodings cover nearly every value found in export
/// tries and bind opcodes, so those skip the loop.
///
/// Returns `(value, bytes_consumed)` or `None` if truncated or overlong.
#[inline(always)]
pub fn read_uleb128_fast(data: &[u8]) -> Option<(u64, usize)> {
    let b0 = *data.first()?;
    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    let b1 = *data.get(1)?;
    if b1 < 0x80 {
        let value = ((b0 & 0x7F) as u64) | ((b1 as u64) << 7);
        return Some((value, 2));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Reads a signed LEB128 value.
#[inline(always)]
pub fn read_sleb128_fast(data: &[u8]) -> Option<(i64, usize)> {
    let b0 = *data.first()?;
    if b0 < 0x80 {
        let value = if (b0 & 0x40) != 0 {
            (b0 as i64) | !0x7F_i64
        } else {
            b0 as i64
        };
        return Some((value, 1));
    }

    let mut result: i64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;

        if byte < 0x80 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= !0_i64 << shift;
            }
            return Some((result, i + 1));
        }
    }

    None
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Aligns a value down to the given power-of-two alignment.
#[inline(always)]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u64_le() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u64_le(&data), 0x0807060504030201);
    }

    #[test]
    fn test_checked_reads_stop_at_end() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        assert_eq!(get_u32_le(&data, 0), Some(0xDDCCBBAA));
        assert_eq!(get_u32_le(&data, 2), None);
        assert_eq!(get_u64_le(&data, 0), None);
        assert_eq!(get_u32_le(&data, usize::MAX - 1), None);
    }

    #[test]
    fn test_write_helpers() {
        let mut data = [0u8; 12];
        write_u32_le_at(&mut data, 0, 0xD503201F);
        write_u64_le_at(&mut data, 4, 0x1_8000_4000);
        assert_eq!(read_u32_le(&data), 0xD503201F);
        assert_eq!(read_u64_le_at(&data, 4), 0x1_8000_4000);
    }

    #[test]
    fn test_memchr_null_and_cstr() {
        assert_eq!(memchr_null(b"hello\0world"), 5);
        assert_eq!(memchr_null(b"hello"), 5);
        assert_eq!(cstr_at(b"_objc_msgSend\0junk"), "_objc_msgSend");
        assert_eq!(cstr_at(b"\xff\xfe\0"), "");
    }

    #[test]
    fn test_uleb128_fast() {
        assert_eq!(read_uleb128_fast(&[0x00]), Some((0, 1)));
        assert_eq!(read_uleb128_fast(&[0x7F]), Some((127, 1)));
        assert_eq!(read_uleb128_fast(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_uleb128_fast(&[0xE5, 0x8E, 0x26]), Some((624485, 3)));
        assert_eq!(read_uleb128_fast(&[0x80]), None);
        assert_eq!(read_uleb128_fast(&[]), None);
    }

    #[test]
    fn test_sleb128_fast() {
        assert_eq!(read_sleb128_fast(&[0x3F]), Some((63, 1)));
        assert_eq!(read_sleb128_fast(&[0x7F]), Some((-1, 1)));
        assert_eq!(read_sleb128_fast(&[0x80, 0x7F]), Some((-128, 2)));
    }

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(0x1000, 0x4000), 0x4000);
        assert_eq!(align_down(0x5FFF, 0x1000), 0x5000);
    }
}
