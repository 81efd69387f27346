//! Destinations for extracted entries.

mod folder;
mod memory;

pub use folder::FolderSink;
pub use memory::{MemorySink, Op};

use async_trait::async_trait;

use crate::entry::Entry;
use crate::error::Result;

/// Receives the directories, symlinks and file data of an extraction.
#[async_trait]
pub trait Sink: Send {
    /// Reserve `entry.uncompressed_size` bytes for a file entry.
    async fn preallocate(&mut self, entry: &Entry) -> Result<()>;

    async fn mkdir(&mut self, entry: &Entry) -> Result<()>;

    async fn symlink(&mut self, entry: &Entry, target: &str) -> Result<()>;

    /// Open a writer positioned at `entry.write_offset`.
    async fn get_writer(&mut self, entry: &Entry) -> Result<Box<dyn EntryWriter>>;
}

/// Appends to one entry's data, starting where the previous run stopped.
#[async_trait]
pub trait EntryWriter: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Make everything written so far durable.
    async fn sync(&mut self) -> Result<()>;

    /// Flush buffered data once the entry is complete.
    async fn close(&mut self) -> Result<()>;
}
