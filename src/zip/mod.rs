//! ZIP archive parsing and resumable extraction.
//!
//! - [`structures`]: ZIP format records (EOCD, ZIP64, central directory entries)
//! - [`parser`]: locating and decoding those records through a [`ReadAt`](crate::io::ReadAt)
//! - [`extractor`]: the resumable [`Extractor`](crate::Extractor) driver
//! - `fallback`: one-shot decoders for methods that can't resume mid-entry
//!
//! The EOCD is read first, from the end of the file, then the Central
//! Directory. Listing never touches entry data, which keeps HTTP sources cheap.
//!
//! ## Supported Features
//!
//! - ZIP64 extensions for files > 4GB
//! - STORED and DEFLATE, resumable inside an entry
//! - BZIP2, LZMA and ZSTD, restarted from the entry's start when interrupted
//! - Unix modes and symlinks from archives made on unix
//!
//! Encrypted entries and multi-disk archives are not supported.

mod extractor;
mod fallback;
mod parser;
mod structures;

pub use extractor::ZipExtractor;
pub use parser::ZipParser;
pub use structures::*;
