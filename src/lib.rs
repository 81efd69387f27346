//! # resunzip
//!
//! Resumable ZIP extraction, from local files or HTTP URLs (through Range
//! requests).
//!
//! An extraction can be interrupted at any time and picked up later from a
//! [`Checkpoint`]. Stored entries resume at any byte; deflated entries
//! resume at the last deflate block boundary, replaying at most one block.
//! Everything written is verified against the archive's sizes and CRC-32s.
//!
//! ## Pieces
//!
//! - [`Source`]: produces an entry's bytes and knows where it can be rebuilt
//! - [`Sink`]: receives directories, symlinks and file data
//! - [`Copier`]: moves bytes between the two and drives save points
//! - [`SaveConsumer`]: decides when to checkpoint and whether to go on
//! - [`ZipExtractor`]: the [`Extractor`] tying it all together
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use resunzip::{Checkpoint, Extractor, FileSaveConsumer, FolderSink, LocalFileReader, ZipExtractor};
//!
//! #[tokio::main]
//! async fn main() -> resunzip::Result<()> {
//!     let reader = Arc::new(LocalFileReader::new("archive.zip")?);
//!     let mut extractor = ZipExtractor::open(reader).await?;
//!     extractor.set_save_consumer(Box::new(FileSaveConsumer::new("archive.ckpt", 1 << 20)));
//!
//!     let checkpoint = Checkpoint::load("archive.ckpt".as_ref()).await?;
//!     let result = extractor.resume(checkpoint, &mut FolderSink::new("out")).await?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod cli;
pub mod copier;
pub mod entry;
pub mod error;
pub mod extractor;
pub mod io;
pub mod sink;
pub mod source;
pub mod zip;

pub use checkpoint::{
    AfterSaveAction, ArchiveFingerprint, CallbackSaveConsumer, Checkpoint, FileSaveConsumer,
    FlateCheckpoint, NopSaveConsumer, SaveConsumer, SourceCheckpoint,
};
pub use cli::Cli;
pub use copier::{CopyOutcome, CopyParams, Copier, SourceSaveConsumer};
pub use entry::{Entry, EntryKind};
pub use error::{Error, Phase, Result};
pub use extractor::{
    Extractor, ExtractorFeatures, ExtractorResult, ExtractorStats, ProgressListener,
    ResumeSupport, format_size,
};
pub use io::{HttpRangeReader, LocalFileReader, MemoryReader, ReadAt};
pub use sink::{EntryWriter, FolderSink, MemorySink, Op, Sink};
pub use source::{FlateSource, SeekSource, Source, discard_by_read};
pub use zip::{CompressionMethod, ZipExtractor, ZipFileEntry};
