//! Export trie and bind opcode handling.
//!
//! The export trie is a prefix tree over exported symbol names. Each node
//! holds optional terminal information (flags, address or re-export
//! source) followed by its child edges, each a label and the ULEB offset of
//! the child node.
//!
//! Bind opcodes are the compressed binding stream of `LC_DYLD_INFO`. The
//! extractor parses the existing stream to learn which slots are bound and
//! encodes new records for the stubs it regenerates.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::util::memchr_null;

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

/// Regular export.
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;

/// Thread-local variable.
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;

/// Absolute symbol (not relative to any section).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;

/// Weak definition.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;

/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

/// Stub and resolver.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

// =============================================================================
// LEB128
// =============================================================================

/// Reads an unsigned LEB128 value at `offset`.
///
/// Returns the decoded value and the number of bytes consumed.
#[inline(always)]
pub fn read_uleb128(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    data.get(offset..)
        .and_then(crate::util::read_uleb128_fast)
        .ok_or(Error::InvalidUleb128 { offset })
}

/// Reads a signed LEB128 value at `offset`.
#[inline(always)]
pub fn read_sleb128(data: &[u8], offset: usize) -> Result<(i64, usize)> {
    data.get(offset..)
        .and_then(crate::util::read_sleb128_fast)
        .ok_or(Error::InvalidUleb128 { offset })
}

/// Writes an unsigned LEB128 value to a buffer.
pub fn write_uleb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

// =============================================================================
// Export Info
// =============================================================================

/// Information about an exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Symbol address (relative to image base)
    pub address: u64,
    /// For re-exports: ordinal of the source dylib
    pub reexport_ordinal: Option<u32>,
    /// For re-exports: imported symbol name (if different)
    pub reexport_name: Option<String>,
    /// For stub+resolver: resolver function address
    pub resolver_address: Option<u64>,
}

impl ExportInfo {
    /// Returns true if this is a re-export.
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    /// Returns true if this is a weak definition.
    #[inline]
    pub fn is_weak(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) != 0
    }

    /// Returns true if this is a stub with resolver.
    #[inline]
    pub fn is_stub_and_resolver(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0
    }

    /// Returns the symbol kind.
    #[inline]
    pub fn kind(&self) -> u64 {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK
    }

    /// Name of the symbol in the re-export source.
    pub fn imported_name(&self) -> &str {
        self.reexport_name.as_deref().unwrap_or(&self.name)
    }
}

// =============================================================================
// Export Trie Parser
// =============================================================================

/// Parser for export tries.
pub struct ExportTrieParser<'a> {
    data: &'a [u8],
}

/// A child edge of a trie node.
struct Edge<'a> {
    label: &'a [u8],
    child: usize,
}

/// A decoded trie node: its terminal bytes and child edges.
struct Node<'a> {
    terminal: &'a [u8],
    edges: Vec<Edge<'a>>,
}

impl<'a> ExportTrieParser<'a> {
    /// Creates a new parser for the given export trie data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Parses all exports from the trie.
    ///
    /// A node reachable twice is rejected, so malformed tries with cycles
    /// fail instead of looping.
    pub fn parse_all(&self) -> Result<Vec<ExportInfo>> {
        let mut exports = Vec::new();
        if self.data.is_empty() {
            return Ok(exports);
        }

        let mut visited = HashSet::new();
        let mut stack = vec![(0usize, Vec::<u8>::new())];

        while let Some((offset, prefix)) = stack.pop() {
            if !visited.insert(offset) {
                return Err(Error::InvalidExportTrie { offset });
            }
            let node = self.node(offset)?;

            if !node.terminal.is_empty() {
                let name = String::from_utf8_lossy(&prefix).into_owned();
                exports.push(parse_terminal_info(node.terminal, name, offset)?);
            }

            // Reverse so children come out in edge order.
            for edge in node.edges.into_iter().rev() {
                let mut child_prefix = prefix.clone();
                child_prefix.extend_from_slice(edge.label);
                stack.push((edge.child, child_prefix));
            }
        }

        Ok(exports)
    }

    /// Looks up a single symbol by name.
    ///
    /// Empty edge labels are never followed, so every step consumes part of
    /// `name` and the walk terminates.
    pub fn lookup(&self, name: &str) -> Result<Option<ExportInfo>> {
        if self.data.is_empty() {
            return Ok(None);
        }

        let wanted = name.as_bytes();
        let mut offset = 0usize;
        let mut matched = 0usize;

        loop {
            let node = self.node(offset)?;
            if matched == wanted.len() {
                if node.terminal.is_empty() {
                    return Ok(None);
                }
                return parse_terminal_info(node.terminal, name.to_string(), offset).map(Some);
            }

            let rest = &wanted[matched..];
            let Some(edge) = node
                .edges
                .iter()
                .find(|e| !e.label.is_empty() && rest.starts_with(e.label))
            else {
                return Ok(None);
            };
            matched += edge.label.len();
            offset = edge.child;
        }
    }

    /// Decodes the node at `offset`.
    fn node(&self, offset: usize) -> Result<Node<'a>> {
        let bad = || Error::InvalidExportTrie { offset };
        if offset >= self.data.len() {
            return Err(bad());
        }

        let (terminal_size, mut cursor) = read_uleb128(self.data, offset)?;
        cursor += offset;
        let terminal_end = cursor
            .checked_add(terminal_size as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(bad)?;
        let terminal = &self.data[cursor..terminal_end];
        cursor = terminal_end;

        let mut edges = Vec::new();
        let Some(&child_count) = self.data.get(cursor) else {
            return Ok(Node { terminal, edges });
        };
        cursor += 1;

        for _ in 0..child_count {
            let rest = self.data.get(cursor..).ok_or_else(bad)?;
            let label_len = memchr_null(rest);
            if label_len == rest.len() {
                return Err(bad());
            }
            let label = &rest[..label_len];
            cursor += label_len + 1;

            let (child, len) = read_uleb128(self.data, cursor)?;
            cursor += len;
            edges.push(Edge {
                label,
                child: child as usize,
            });
        }

        Ok(Node { terminal, edges })
    }
}

/// Parses terminal export info.
fn parse_terminal_info(data: &[u8], name: String, node_offset: usize) -> Result<ExportInfo> {
    let bad = |_| Error::InvalidExportTrie {
        offset: node_offset,
    };
    let (flags, mut cursor) = read_uleb128(data, 0).map_err(bad)?;

    let mut export = ExportInfo {
        name,
        flags,
        address: 0,
        reexport_ordinal: None,
        reexport_name: None,
        resolver_address: None,
    };

    if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
        let (ordinal, len) = read_uleb128(data, cursor).map_err(bad)?;
        cursor += len;
        export.reexport_ordinal = Some(ordinal as u32);

        if let Some(rest) = data.get(cursor..) {
            let end = memchr_null(rest);
            if end > 0 {
                export.reexport_name = Some(String::from_utf8_lossy(&rest[..end]).into_owned());
            }
        }
    } else {
        let (addr, len) = read_uleb128(data, cursor).map_err(bad)?;
        cursor += len;
        export.address = addr;

        if (flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0 {
            let (resolver, _) = read_uleb128(data, cursor).map_err(bad)?;
            export.resolver_address = Some(resolver);
        }
    }

    Ok(export)
}

// =============================================================================
// Bind Opcodes
// =============================================================================

/// Bind opcodes used in the dyld bind info.
#[allow(missing_docs)]
pub mod bind_opcodes {
    /// Terminates a binding sequence.
    pub const BIND_OPCODE_DONE: u8 = 0x00;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
    pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
    pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
    pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
    pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
    pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
    pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
    pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
    pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
    pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
    pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
    pub const BIND_OPCODE_THREADED: u8 = 0xD0;

    pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
    pub const BIND_OPCODE_MASK: u8 = 0xF0;

    pub const BIND_TYPE_POINTER: u8 = 1;

    /// Ordinal meaning "search every loaded image".
    pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
}

/// A binding record from parsing bind opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRecord {
    /// Segment index
    pub segment_index: u8,
    /// Offset within segment
    pub segment_offset: u64,
    /// Binding type
    pub bind_type: u8,
    /// Symbol name
    pub symbol_name: String,
    /// Dylib ordinal
    pub ordinal: i64,
    /// Addend
    pub addend: i64,
}

/// Parses bind info opcodes.
pub fn parse_bind_info(data: &[u8]) -> Result<Vec<BindRecord>> {
    use bind_opcodes::*;

    let mut records = Vec::new();
    let mut cursor = 0usize;

    let mut segment_index: u8 = 0;
    let mut segment_offset: u64 = 0;
    let mut bind_type: u8 = BIND_TYPE_POINTER;
    let mut symbol_name = String::new();
    let mut ordinal: i64 = 0;
    let mut addend: i64 = 0;

    while cursor < data.len() {
        let byte = data[cursor];
        let opcode = byte & BIND_OPCODE_MASK;
        let immediate = byte & BIND_IMMEDIATE_MASK;
        let op_offset = cursor;
        cursor += 1;

        match opcode {
            // Lazy bind streams separate entries with DONE, so keep going.
            BIND_OPCODE_DONE => {}

            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                ordinal = immediate as i64;
            }

            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (val, len) = read_uleb128(data, cursor)?;
                cursor += len;
                ordinal = val as i64;
            }

            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                ordinal = if immediate == 0 {
                    0
                } else {
                    (BIND_OPCODE_MASK | immediate) as i8 as i64
                };
            }

            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let rest = &data[cursor..];
                let end = memchr_null(rest);
                symbol_name = String::from_utf8_lossy(&rest[..end]).into_owned();
                cursor += end + 1;
            }

            BIND_OPCODE_SET_TYPE_IMM => {
                bind_type = immediate;
            }

            BIND_OPCODE_SET_ADDEND_SLEB => {
                let (val, len) = read_sleb128(data, cursor)?;
                cursor += len;
                addend = val;
            }

            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment_index = immediate;
                let (val, len) = read_uleb128(data, cursor)?;
                cursor += len;
                segment_offset = val;
            }

            BIND_OPCODE_ADD_ADDR_ULEB => {
                let (val, len) = read_uleb128(data, cursor)?;
                cursor += len;
                segment_offset = segment_offset.wrapping_add(val);
            }

            BIND_OPCODE_DO_BIND => {
                records.push(BindRecord {
                    segment_index,
                    segment_offset,
                    bind_type,
                    symbol_name: symbol_name.clone(),
                    ordinal,
                    addend,
                });
                segment_offset = segment_offset.wrapping_add(8);
            }

            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                records.push(BindRecord {
                    segment_index,
                    segment_offset,
                    bind_type,
                    symbol_name: symbol_name.clone(),
                    ordinal,
                    addend,
                });
                let (val, len) = read_uleb128(data, cursor)?;
                cursor += len;
                segment_offset = segment_offset.wrapping_add(8).wrapping_add(val);
            }

            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                records.push(BindRecord {
                    segment_index,
                    segment_offset,
                    bind_type,
                    symbol_name: symbol_name.clone(),
                    ordinal,
                    addend,
                });
                segment_offset = segment_offset.wrapping_add(8 + (immediate as u64 * 8));
            }

            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let (count, len1) = read_uleb128(data, cursor)?;
                cursor += len1;
                let (skip, len2) = read_uleb128(data, cursor)?;
                cursor += len2;

                for _ in 0..count {
                    records.push(BindRecord {
                        segment_index,
                        segment_offset,
                        bind_type,
                        symbol_name: symbol_name.clone(),
                        ordinal,
                        addend,
                    });
                    segment_offset = segment_offset.wrapping_add(8).wrapping_add(skip);
                }
            }

            // Threaded binds only appear in chained-fixup era binaries,
            // whose slots the slide info already resolved.
            BIND_OPCODE_THREADED => {
                if immediate == 0 {
                    let (_, len) = read_uleb128(data, cursor)?;
                    cursor += len;
                }
            }

            _ => {
                return Err(Error::parse(op_offset, format!("unknown bind opcode {byte:#04x}")));
            }
        }
    }

    Ok(records)
}

/// Encodes bind records as a pointer-bind opcode stream ending in `DONE`.
///
/// Ordinal and symbol opcodes are only emitted when they change from the
/// previous record.
pub fn encode_bind_info(records: &[BindRecord]) -> Vec<u8> {
    use bind_opcodes::*;

    let mut out = Vec::new();
    let mut last_ordinal = None;
    let mut last_name: Option<&str> = None;
    let mut last_type = None;

    for record in records {
        if last_ordinal != Some(record.ordinal) {
            match record.ordinal {
                ord if ord <= 0 => {
                    out.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (ord as u8 & BIND_IMMEDIATE_MASK));
                }
                ord if ord <= BIND_IMMEDIATE_MASK as i64 => {
                    out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ord as u8);
                }
                ord => {
                    out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                    write_uleb128(ord as u64, &mut out);
                }
            }
            last_ordinal = Some(record.ordinal);
        }

        if last_name != Some(record.symbol_name.as_str()) {
            out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
            out.extend_from_slice(record.symbol_name.as_bytes());
            out.push(0);
            last_name = Some(&record.symbol_name);
        }

        if last_type != Some(record.bind_type) {
            out.push(BIND_OPCODE_SET_TYPE_IMM | (record.bind_type & BIND_IMMEDIATE_MASK));
            last_type = Some(record.bind_type);
        }

        out.push(
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | (record.segment_index & BIND_IMMEDIATE_MASK),
        );
        write_uleb128(record.segment_offset, &mut out);
        out.push(BIND_OPCODE_DO_BIND);
    }

    out.push(BIND_OPCODE_DONE);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::flat_trie;

    #[test]
    fn test_uleb128() {
        assert_eq!(read_uleb128(&[0x00], 0).unwrap(), (0, 1));
        assert_eq!(read_uleb128(&[0x7F], 0).unwrap(), (127, 1));
        assert_eq!(read_uleb128(&[0x80, 0x01], 0).unwrap(), (128, 2));
        assert_eq!(read_uleb128(&[0xFF, 0x80, 0x7F], 1).unwrap(), (16256, 2));
        assert!(matches!(
            read_uleb128(&[0x80], 0),
            Err(Error::InvalidUleb128 { offset: 0 })
        ));
    }

    #[test]
    fn test_sleb128() {
        assert_eq!(read_sleb128(&[0x00], 0).unwrap(), (0, 1));
        assert_eq!(read_sleb128(&[0x7F], 0).unwrap(), (-1, 1));
        assert_eq!(read_sleb128(&[0x80, 0x7F], 0).unwrap(), (-128, 2));
    }

    #[test]
    fn test_write_uleb128() {
        let mut buf = Vec::new();
        write_uleb128(0, &mut buf);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        write_uleb128(624485, &mut buf);
        assert_eq!(buf, vec![0xE5, 0x8E, 0x26]);
    }

    #[test]
    fn test_parse_and_lookup_exports() {
        let trie = flat_trie(&[("_foo", 0x1000), ("_bar", 0x2040)]);
        let parser = ExportTrieParser::new(&trie);

        let exports = parser.parse_all().unwrap();
        let names: Vec<_> = exports.iter().map(|e| (e.name.as_str(), e.address)).collect();
        assert_eq!(names, vec![("_foo", 0x1000), ("_bar", 0x2040)]);

        assert_eq!(parser.lookup("_bar").unwrap().unwrap().address, 0x2040);
        assert!(parser.lookup("_baz").unwrap().is_none());
        assert!(parser.lookup("_fo").unwrap().is_none());
    }

    #[test]
    fn test_reexport_terminal() {
        // flags REEXPORT, ordinal 2, imported name "_real"
        let mut info = vec![EXPORT_SYMBOL_FLAGS_REEXPORT as u8, 2];
        info.extend_from_slice(b"_real\0");
        let export = parse_terminal_info(&info, "_alias".into(), 0).unwrap();
        assert!(export.is_reexport());
        assert_eq!(export.reexport_ordinal, Some(2));
        assert_eq!(export.imported_name(), "_real");
    }

    #[test]
    fn test_cyclic_trie_rejected() {
        // Root with one child edge "a" pointing back at the root.
        let trie = [0u8, 1, b'a', 0, 0];
        assert!(matches!(
            ExportTrieParser::new(&trie).parse_all(),
            Err(Error::InvalidExportTrie { offset: 0 })
        ));
    }

    #[test]
    fn test_bind_opcodes_parse_what_we_encode() {
        let records = vec![
            BindRecord {
                segment_index: 2,
                segment_offset: 0x10,
                bind_type: bind_opcodes::BIND_TYPE_POINTER,
                symbol_name: "_malloc".into(),
                ordinal: 1,
                addend: 0,
            },
            BindRecord {
                segment_index: 2,
                segment_offset: 0x18,
                bind_type: bind_opcodes::BIND_TYPE_POINTER,
                symbol_name: "_objc_msgSend".into(),
                ordinal: 20,
                addend: 0,
            },
            BindRecord {
                segment_index: 3,
                segment_offset: 0x200,
                bind_type: bind_opcodes::BIND_TYPE_POINTER,
                symbol_name: "_flat".into(),
                ordinal: bind_opcodes::BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
                addend: 0,
            },
        ];
        let encoded = encode_bind_info(&records);
        assert_eq!(*encoded.last().unwrap(), bind_opcodes::BIND_OPCODE_DONE);
        assert_eq!(parse_bind_info(&encoded).unwrap(), records);
    }

    #[test]
    fn test_bind_times_skipping() {
        use bind_opcodes::*;
        let mut data = vec![
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
        ];
        data.extend_from_slice(b"_x\0");
        data.extend_from_slice(&[
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x00,
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB,
            3,
            8,
            BIND_OPCODE_DONE,
        ]);
        let offsets: Vec<_> = parse_bind_info(&data)
            .unwrap()
            .iter()
            .map(|r| r.segment_offset)
            .collect();
        assert_eq!(offsets, vec![0, 16, 32]);
    }

    #[test]
    fn test_unknown_bind_opcode_is_an_error() {
        assert!(parse_bind_info(&[0xE0]).is_err());
    }
}
