//! Dyld shared cache handling.
//!
//! A cache is a main file plus, on newer systems, numbered sub-caches
//! (`dyld_shared_cache_arm64e.1`, `.2`, ...) and a `.symbols` file holding
//! the local symbols stripped from every image. All of them share one
//! virtual address space described by their mappings.

mod context;
mod slide;
mod structs;
pub mod trie;

pub use context::*;
pub use slide::*;
pub use structs::*;
pub use trie::*;
