//! Resumption state and the policies deciding when to persist it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::entry::Entry;
use crate::error::{Error, Result};

/// Identifies the archive a checkpoint was taken against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFingerprint {
    /// Archive size in bytes
    pub size: u64,
    /// Number of central directory entries
    pub entries: usize,
    /// Sum of uncompressed sizes
    pub total_bytes: u64,
}

/// Everything needed to pick an extraction back up.
///
/// `entry` is `None` when the payload of `entry_index` had not started.
/// Otherwise it is the entry as of the last save, and its `write_offset` is
/// authoritative over what the source checkpoint says it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub entry_index: usize,
    pub progress: f64,
    pub entry: Option<Entry>,
    pub source_checkpoint: Option<SourceCheckpoint>,
    pub archive: ArchiveFingerprint,
}

impl Checkpoint {
    pub fn new(archive: ArchiveFingerprint) -> Self {
        Self {
            entry_index: 0,
            progress: 0.0,
            entry: None,
            source_checkpoint: None,
            archive,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Read a checkpoint written by [`Checkpoint::store`]. A missing file
    /// means there is nothing to resume.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => Ok(Some(Self::from_json(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Durably replace the checkpoint at `path`.
    pub async fn store(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Internal state of a [`Source`](crate::source::Source), tagged by the
/// source kind that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceCheckpoint {
    /// Raw section reader: next byte to read.
    Seek { offset: u64 },
    /// Inflate stream captured at a block boundary.
    Flate(FlateCheckpoint),
}

impl SourceCheckpoint {
    /// Decompressed offset the source resumes producing from.
    pub fn produced(&self) -> u64 {
        match self {
            SourceCheckpoint::Seek { offset } => *offset,
            SourceCheckpoint::Flate(flate) => flate.produced,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlateCheckpoint {
    /// Decompressed bytes produced before the block boundary
    pub produced: u64,
    /// Compressed position of the next block header, in bits
    pub input_bits: u64,
    /// Last `min(produced, 32 KiB)` output bytes, oldest first
    #[serde(with = "hex_bytes")]
    pub window: Vec<u8>,
}

impl std::fmt::Debug for FlateCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlateCheckpoint")
            .field("produced", &self.produced)
            .field("input_bits", &self.input_bits)
            .field("window_len", &self.window.len())
            .finish()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Verdict of a [`SaveConsumer`] after it was offered a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSaveAction {
    Continue,
    Stop,
}

/// Decides when checkpoints are taken and what happens after each one.
#[async_trait]
pub trait SaveConsumer: Send {
    /// Called after every copied chunk with its length. Returning `true`
    /// asks the current source for a checkpoint at its next safe point.
    fn should_save(&mut self, copied: u64) -> bool;

    /// Persist (or inspect) a checkpoint. Destination data covered by it has
    /// been synced before this is called.
    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<AfterSaveAction>;
}

/// Never asks for checkpoints; any offered one is ignored.
#[derive(Debug, Default)]
pub struct NopSaveConsumer;

#[async_trait]
impl SaveConsumer for NopSaveConsumer {
    fn should_save(&mut self, _copied: u64) -> bool {
        false
    }

    async fn save(&mut self, _checkpoint: &Checkpoint) -> Result<AfterSaveAction> {
        Ok(AfterSaveAction::Continue)
    }
}

/// Counts copied bytes and fires once `interval` is reached.
#[derive(Debug, Clone)]
struct ByteInterval {
    interval: u64,
    since_last: u64,
}

impl ByteInterval {
    fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            since_last: 0,
        }
    }

    fn tick(&mut self, copied: u64) -> bool {
        self.since_last += copied;
        if self.since_last >= self.interval {
            self.since_last = 0;
            true
        } else {
            false
        }
    }
}

/// Asks for a checkpoint every `interval` bytes and hands it to a closure.
pub struct CallbackSaveConsumer<F> {
    interval: ByteInterval,
    on_save: F,
}

impl<F> CallbackSaveConsumer<F>
where
    F: FnMut(&Checkpoint) -> Result<AfterSaveAction> + Send,
{
    pub fn new(interval: u64, on_save: F) -> Self {
        Self {
            interval: ByteInterval::new(interval),
            on_save,
        }
    }
}

#[async_trait]
impl<F> SaveConsumer for CallbackSaveConsumer<F>
where
    F: FnMut(&Checkpoint) -> Result<AfterSaveAction> + Send,
{
    fn should_save(&mut self, copied: u64) -> bool {
        self.interval.tick(copied)
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<AfterSaveAction> {
        (self.on_save)(checkpoint)
    }
}

/// Writes every checkpoint to a file, replacing the previous one.
pub struct FileSaveConsumer {
    path: PathBuf,
    interval: ByteInterval,
    saves: u64,
}

impl FileSaveConsumer {
    pub fn new(path: impl Into<PathBuf>, interval: u64) -> Self {
        Self {
            path: path.into(),
            interval: ByteInterval::new(interval),
            saves: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of checkpoints written so far
    pub fn saves(&self) -> u64 {
        self.saves
    }
}

#[async_trait]
impl SaveConsumer for FileSaveConsumer {
    fn should_save(&mut self, copied: u64) -> bool {
        self.interval.tick(copied)
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<AfterSaveAction> {
        checkpoint.store(&self.path).await.map_err(|e| match e {
            Error::Io(io) => Error::Io(std::io::Error::new(
                io.kind(),
                format!("writing checkpoint {}: {}", self.path.display(), io),
            )),
            other => other,
        })?;
        self.saves += 1;
        tracing::debug!(
            "checkpoint saved @ {:.1}% (entry {})",
            checkpoint.progress * 100.0,
            checkpoint.entry_index
        );
        Ok(AfterSaveAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    fn sample() -> Checkpoint {
        Checkpoint {
            entry_index: 2,
            progress: 0.25,
            entry: Some(Entry {
                kind: EntryKind::File,
                canonical_path: "c.bin".to_string(),
                compressed_size: 10,
                uncompressed_size: 100,
                mode: 0o644,
                write_offset: 40,
                crc32: 0xdeadbeef,
                write_crc32: 0x1234,
            }),
            source_checkpoint: Some(SourceCheckpoint::Flate(FlateCheckpoint {
                produced: 32,
                input_bits: 83,
                window: (0..32).collect(),
            })),
            archive: ArchiveFingerprint {
                size: 4096,
                entries: 3,
                total_bytes: 110,
            },
        }
    }

    #[test]
    fn json_round_trip() {
        let checkpoint = sample();
        let json = checkpoint.to_json().unwrap();
        assert!(json.contains(r#""kind":"flate""#));
        assert_eq!(Checkpoint::from_json(&json).unwrap(), checkpoint);
    }

    #[test]
    fn rejects_garbage_window() {
        let json = sample().to_json().unwrap().replace("000102", "zz0102");
        assert!(Checkpoint::from_json(&json).is_err());
    }

    #[tokio::test]
    async fn file_consumer_replaces_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(Checkpoint::load(&path).await.unwrap().is_none());

        let mut consumer = FileSaveConsumer::new(&path, 10);
        assert!(!consumer.should_save(4));
        assert!(consumer.should_save(6));
        assert!(!consumer.should_save(1));

        let mut checkpoint = sample();
        consumer.save(&checkpoint).await.unwrap();
        checkpoint.entry_index = 3;
        consumer.save(&checkpoint).await.unwrap();

        assert_eq!(consumer.saves(), 2);
        assert_eq!(Checkpoint::load(&path).await.unwrap(), Some(checkpoint));
    }
}
