use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{EntryWriter, Sink};
use crate::entry::Entry;
use crate::error::{Error, Result};

/// One call received by a [`MemorySink`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Preallocate { path: String, size: u64 },
    Mkdir { path: String },
    Symlink { path: String, target: String },
    Write { path: String, offset: u64, len: usize },
    Sync { path: String },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Preallocate { path, .. }
            | Op::Mkdir { path }
            | Op::Symlink { path, .. }
            | Op::Write { path, .. }
            | Op::Sync { path } => path,
        }
    }
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeMap<String, u32>,
    symlinks: BTreeMap<String, String>,
    ops: Vec<Op>,
}

/// Keeps the extracted tree in memory and records every operation.
///
/// Clones share the same tree, so a sink can be handed to an extractor and
/// inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    tree: Arc<Mutex<Tree>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // a panicking writer leaves plain data behind, keep using it
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock().files.clone()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains_key(path)
    }

    pub fn symlink_target(&self, path: &str) -> Option<String> {
        self.lock().symlinks.get(path).cloned()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Forget recorded operations, keeping the tree.
    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn preallocate(&mut self, entry: &Entry) -> Result<()> {
        let mut tree = self.lock();
        let size = usize::try_from(entry.uncompressed_size)
            .map_err(|_| Error::Unsupported(format!("{} bytes in memory", entry.uncompressed_size)))?;
        tree.files
            .entry(entry.canonical_path.clone())
            .or_default()
            .resize(size, 0);
        tree.ops.push(Op::Preallocate {
            path: entry.canonical_path.clone(),
            size: entry.uncompressed_size,
        });
        Ok(())
    }

    async fn mkdir(&mut self, entry: &Entry) -> Result<()> {
        let mut tree = self.lock();
        tree.dirs.insert(entry.canonical_path.clone(), entry.mode);
        tree.ops.push(Op::Mkdir {
            path: entry.canonical_path.clone(),
        });
        Ok(())
    }

    async fn symlink(&mut self, entry: &Entry, target: &str) -> Result<()> {
        let mut tree = self.lock();
        tree.symlinks
            .insert(entry.canonical_path.clone(), target.to_string());
        tree.ops.push(Op::Symlink {
            path: entry.canonical_path.clone(),
            target: target.to_string(),
        });
        Ok(())
    }

    async fn get_writer(&mut self, entry: &Entry) -> Result<Box<dyn EntryWriter>> {
        let mut tree = self.lock();
        let data = tree.files.entry(entry.canonical_path.clone()).or_default();
        if (data.len() as u64) < entry.write_offset {
            return Err(Error::corrupt(format!(
                "{}: existing data too small ({} bytes), can't resume from offset {}",
                entry.canonical_path,
                data.len(),
                entry.write_offset
            )));
        }
        Ok(Box::new(MemoryWriter {
            tree: self.tree.clone(),
            path: entry.canonical_path.clone(),
            offset: entry.write_offset,
        }))
    }
}

struct MemoryWriter {
    tree: Arc<Mutex<Tree>>,
    path: String,
    offset: u64,
}

impl MemoryWriter {
    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EntryWriter for MemoryWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let start = self.offset as usize;
        {
            let mut tree = self.lock();
            let data = tree.files.entry(self.path.clone()).or_default();
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            tree.ops.push(Op::Write {
                path: self.path.clone(),
                offset: self.offset,
                len: buf.len(),
            });
        }
        self.offset += buf.len() as u64;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        let mut tree = self.lock();
        tree.ops.push(Op::Sync {
            path: self.path.clone(),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    #[tokio::test]
    async fn writes_land_at_offsets_and_are_logged() {
        let mut sink = MemorySink::new();
        let mut entry = Entry {
            kind: EntryKind::File,
            canonical_path: "a.txt".to_string(),
            compressed_size: 6,
            uncompressed_size: 6,
            mode: 0o644,
            write_offset: 0,
            crc32: 0,
            write_crc32: 0,
        };
        sink.preallocate(&entry).await.unwrap();

        entry.write_offset = 2;
        let mut writer = sink.get_writer(&entry).await.unwrap();
        writer.write_all(b"cd").await.unwrap();
        writer.write_all(b"ef").await.unwrap();

        assert_eq!(sink.file("a.txt").unwrap(), b"\0\0cdef");
        assert_eq!(
            sink.ops(),
            vec![
                Op::Preallocate {
                    path: "a.txt".to_string(),
                    size: 6
                },
                Op::Write {
                    path: "a.txt".to_string(),
                    offset: 2,
                    len: 2
                },
                Op::Write {
                    path: "a.txt".to_string(),
                    offset: 4,
                    len: 2
                },
            ]
        );
    }
}
