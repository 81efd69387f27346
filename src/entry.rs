//! Archive members and their write state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
            EntryKind::Symlink => "symlink",
        })
    }
}

/// One member of an archive.
///
/// Everything but `write_offset` and `write_crc32` is fixed by the archive.
/// Those two only move through [`Entry::advance`] and [`Entry::rewind`], so
/// the CRC always covers exactly the first `write_offset` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub canonical_path: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Unix permission bits
    pub mode: u32,
    /// Output bytes written to the sink for this entry
    pub write_offset: u64,
    /// CRC-32 recorded in the archive
    pub crc32: u32,
    /// CRC-32 of the bytes written so far
    #[serde(default)]
    pub write_crc32: u32,
}

impl Entry {
    /// Account for `data` having been written at `write_offset`.
    pub fn advance(&mut self, data: &[u8]) {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.write_crc32);
        hasher.update(data);
        self.write_crc32 = hasher.finalize();
        self.write_offset += data.len() as u64;
    }

    /// Forget everything written, for entries that can only restart from zero.
    pub fn rewind(&mut self) {
        self.write_offset = 0;
        self.write_crc32 = 0;
    }

    /// Check a fully written file against the archive's size and checksum.
    pub fn verify(&self) -> Result<()> {
        if self.write_offset != self.uncompressed_size {
            return Err(Error::corrupt(format!(
                "wrote {} bytes, archive says {}",
                self.write_offset, self.uncompressed_size
            )));
        }
        if self.write_crc32 != self.crc32 {
            return Err(Error::corrupt(format!(
                "crc32 mismatch: got {:08x}, archive says {:08x}",
                self.write_crc32, self.crc32
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} bytes, mode {:o})",
            self.kind, self.canonical_path, self.uncompressed_size, self.mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(data: &[u8]) -> Entry {
        Entry {
            kind: EntryKind::File,
            canonical_path: "f".to_string(),
            compressed_size: data.len() as u64,
            uncompressed_size: data.len() as u64,
            mode: 0o644,
            write_offset: 0,
            crc32: crc32fast::hash(data),
            write_crc32: 0,
        }
    }

    #[test]
    fn crc_survives_split_writes() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut entry = file(data);
        entry.advance(&data[..7]);

        // as if restored from a checkpoint
        let mut restored = entry.clone();
        restored.advance(&data[7..30]);
        restored.advance(&data[30..]);

        assert_eq!(restored.write_offset, data.len() as u64);
        restored.verify().unwrap();
    }

    #[test]
    fn verify_catches_bad_content_and_size() {
        let mut entry = file(b"abc");
        entry.advance(b"abd");
        assert!(entry.verify().unwrap_err().is_corruption());

        entry.rewind();
        entry.advance(b"ab");
        assert!(entry.verify().is_err());
        entry.advance(b"c");
        entry.verify().unwrap();
    }
}
