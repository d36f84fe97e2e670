//! Parsers for the per-process files a Linux host resolves virtual pages with.

mod maps;
pub use maps::*;

mod pagemap;
pub use pagemap::*;
