//! Error types for single-image extraction.
//!
//! Errors are grouped by the layer that raises them: file access, cache
//! parsing, the image view, slide decoding, symbol parsing, and the
//! converter stages.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for extraction operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} not mapped by any cache file")]
    AddressNotMapped { addr: u64 },

    #[error("cache mappings overlap: {first:#x} and {second:#x}")]
    OverlappingMappings { first: u64, second: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ==================== Image View Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("insufficient space for new load commands (need {needed} bytes, have {available})")]
    InsufficientLoadCommandSpace { needed: usize, available: usize },

    #[error("access of {len:#x} bytes at {addr:#x} is outside the image")]
    OutOfBoundsAccess { addr: u64, len: usize },

    // ==================== Slide Info Errors ====================
    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideFormat(u32),

    #[error("invalid slide info at offset {offset:#x}: {reason}")]
    InvalidSlideInfo { offset: u64, reason: String },

    // ==================== Symbol Errors ====================
    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    // ==================== Stub Fixer Errors ====================
    #[error("unknown stub encoding at {addr:#x}: {instrs:08x?}")]
    UnknownStubEncoding { addr: u64, instrs: [u32; 4] },

    #[error("unable to resolve stub at {addr:#x}")]
    UnresolvableStub { addr: u64 },

    #[error("branch target {target:#x} out of range from {from:#x}")]
    BranchOutOfRange { from: u64, target: u64 },

    // ==================== ObjC Fixer Errors ====================
    #[error("invalid ObjC method list at {addr:#x}")]
    InvalidObjcMethodList { addr: u64 },

    #[error("selector not found in image: {selector}")]
    SelectorNotFound { selector: String },

    #[error("no extra segment available for relocated ObjC data")]
    NoExtraSegmentSpace,

    #[error("ObjC reference at {addr:#x} cannot be followed")]
    UnresolvedObjcReference { addr: u64 },

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error is logged and skipped rather than
    /// aborting the extraction.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SelectorNotFound { .. }
                | Error::UnresolvableStub { .. }
                | Error::BranchOutOfRange { .. }
                | Error::InvalidObjcMethodList { .. }
                | Error::NoExtraSegmentSpace
                | Error::UnresolvedObjcReference { .. }
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an address-not-mapped error.
    #[inline]
    pub fn not_mapped(addr: u64) -> Self {
        Error::AddressNotMapped { addr }
    }

    /// Creates an out-of-bounds view access error.
    #[inline]
    pub fn out_of_bounds(addr: u64, len: usize) -> Self {
        Error::OutOfBoundsAccess { addr, len }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::UnresolvableStub { addr: 0x1000 }.is_recoverable());
        assert!(Error::NoExtraSegmentSpace.is_recoverable());
        assert!(Error::UnresolvedObjcReference { addr: 0x1000 }.is_recoverable());
        assert!(!Error::not_mapped(0x1000).is_recoverable());
        assert!(!Error::UnsupportedSlideFormat(4).is_recoverable());
    }

    #[test]
    fn test_stub_encoding_message_lists_words() {
        let err = Error::UnknownStubEncoding {
            addr: 0x4000,
            instrs: [0xd503201f, 0, 0, 0],
        };
        let msg = err.to_string();
        assert!(msg.contains("0x4000"));
        assert!(msg.contains("d503201f"));
    }
}
