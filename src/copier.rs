//! The chunk loop shared by every resumable entry.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{AfterSaveAction, SourceCheckpoint};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::sink::EntryWriter;
use crate::source::Source;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Where a [`Copier`] sends save points and progress for one entry.
#[async_trait]
pub trait SourceSaveConsumer: Send {
    /// Whether a checkpoint should be requested after `copied` more bytes.
    fn should_save(&mut self, copied: u64) -> bool;

    /// Called with a checkpoint once the writer has been synced. `entry`
    /// reflects everything written so far.
    async fn save(&mut self, checkpoint: SourceCheckpoint, entry: &Entry) -> Result<AfterSaveAction>;

    fn progress(&mut self, entry: &Entry);
}

pub struct CopyParams<'a> {
    pub src: &'a mut dyn Source,
    pub dst: &'a mut dyn EntryWriter,
    pub entry: &'a mut Entry,
    pub consumer: &'a mut dyn SourceSaveConsumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The source ran dry.
    Done,
    /// A stop was requested and honoured after a save point.
    Stopped,
}

/// Moves bytes from a [`Source`] to an [`EntryWriter`], one buffer at a time.
pub struct Copier {
    buf: Vec<u8>,
    cancel: CancellationToken,
    stop: bool,
}

impl Copier {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            buf: vec![0u8; COPY_BUFFER_SIZE],
            cancel,
            stop: false,
        }
    }

    /// Stop before the next chunk, without forcing a save point.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop
    }

    pub async fn copy(&mut self, params: CopyParams<'_>) -> Result<CopyOutcome> {
        let CopyParams {
            src,
            dst,
            entry,
            consumer,
        } = params;

        // set once cancellation asked for a final save point
        let mut forced = false;

        loop {
            if self.stop {
                return Ok(CopyOutcome::Stopped);
            }

            let n = src.read(&mut self.buf).await?;
            if n == 0 {
                break;
            }
            let chunk = &self.buf[..n];
            dst.write_all(chunk).await?;
            entry.advance(chunk);
            if entry.write_offset > entry.uncompressed_size {
                return Err(Error::corrupt(format!(
                    "stream produced more than {} bytes",
                    entry.uncompressed_size
                )));
            }
            consumer.progress(entry);

            if consumer.should_save(n as u64) {
                src.want_save();
            }
            if !forced && self.cancel.is_cancelled() {
                tracing::debug!("{}: cancelled, waiting for a save point", entry.canonical_path);
                src.want_save();
                forced = true;
            }

            if let Some(checkpoint) = src.take_checkpoint() {
                dst.sync().await?;
                let action = consumer.save(checkpoint, entry).await?;
                if action == AfterSaveAction::Stop || forced {
                    self.stop = true;
                }
            }
        }

        Ok(CopyOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use crate::io::MemoryReader;
    use crate::sink::{MemorySink, Op, Sink};
    use crate::source::SeekSource;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        interval: u64,
        since: u64,
        stop_after: Option<usize>,
        saves: Vec<(SourceCheckpoint, u64)>,
        progress: Vec<u64>,
    }

    #[async_trait]
    impl SourceSaveConsumer for Recorder {
        fn should_save(&mut self, copied: u64) -> bool {
            self.since += copied;
            if self.interval > 0 && self.since >= self.interval {
                self.since = 0;
                return true;
            }
            false
        }

        async fn save(&mut self, checkpoint: SourceCheckpoint, entry: &Entry) -> Result<AfterSaveAction> {
            self.saves.push((checkpoint, entry.write_offset));
            if self.stop_after == Some(self.saves.len()) {
                Ok(AfterSaveAction::Stop)
            } else {
                Ok(AfterSaveAction::Continue)
            }
        }

        fn progress(&mut self, entry: &Entry) {
            self.progress.push(entry.write_offset);
        }
    }

    fn entry(data: &[u8]) -> Entry {
        Entry {
            kind: EntryKind::File,
            canonical_path: "data.bin".to_string(),
            compressed_size: data.len() as u64,
            uncompressed_size: data.len() as u64,
            mode: 0o644,
            write_offset: 0,
            crc32: crc32fast::hash(data),
            write_crc32: 0,
        }
    }

    fn payload() -> Vec<u8> {
        (0..200_000u32).map(|i| (i * 31 % 253) as u8).collect()
    }

    async fn seek_source(data: &[u8]) -> SeekSource<MemoryReader> {
        let mut src = SeekSource::new(
            Arc::new(MemoryReader::new(data.to_vec())),
            0,
            data.len() as u64,
        );
        src.resume(None).await.unwrap();
        src
    }

    #[tokio::test]
    async fn copies_everything_and_syncs_before_each_save() {
        let data = payload();
        let mut entry = entry(&data);
        let mut sink = MemorySink::new();
        let mut writer = sink.get_writer(&entry).await.unwrap();
        let mut src = seek_source(&data).await;
        let mut consumer = Recorder {
            interval: 50_000,
            ..Default::default()
        };

        let outcome = Copier::new(CancellationToken::new())
            .copy(CopyParams {
                src: &mut src,
                dst: writer.as_mut(),
                entry: &mut entry,
                consumer: &mut consumer,
            })
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Done);
        entry.verify().unwrap();
        assert_eq!(sink.file("data.bin").unwrap(), data);
        assert!(consumer.saves.len() >= 3);
        for (checkpoint, written) in &consumer.saves {
            assert_eq!(checkpoint.produced(), *written);
        }
        assert!(consumer.progress.windows(2).all(|w| w[0] <= w[1]));

        let ops = sink.ops();
        let syncs = ops.iter().filter(|op| matches!(op, Op::Sync { .. })).count();
        assert_eq!(syncs, consumer.saves.len());
    }

    #[tokio::test]
    async fn stop_verdict_ends_the_copy() {
        let data = payload();
        let mut entry = entry(&data);
        let mut sink = MemorySink::new();
        let mut writer = sink.get_writer(&entry).await.unwrap();
        let mut src = seek_source(&data).await;
        let mut consumer = Recorder {
            interval: 40_000,
            stop_after: Some(2),
            ..Default::default()
        };

        let mut copier = Copier::new(CancellationToken::new());
        let outcome = copier
            .copy(CopyParams {
                src: &mut src,
                dst: writer.as_mut(),
                entry: &mut entry,
                consumer: &mut consumer,
            })
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Stopped);
        assert!(copier.is_stopped());
        assert_eq!(consumer.saves.len(), 2);
        assert_eq!(consumer.saves[1].1, entry.write_offset);
        assert!(entry.write_offset < data.len() as u64);
    }

    #[tokio::test]
    async fn cancellation_forces_a_save_point() {
        let data = payload();
        let mut entry = entry(&data);
        let mut sink = MemorySink::new();
        let mut writer = sink.get_writer(&entry).await.unwrap();
        let mut src = seek_source(&data).await;
        // never asks for a save on its own
        let mut consumer = Recorder::default();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = Copier::new(cancel)
            .copy(CopyParams {
                src: &mut src,
                dst: writer.as_mut(),
                entry: &mut entry,
                consumer: &mut consumer,
            })
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Stopped);
        assert_eq!(consumer.saves.len(), 1);
        assert_eq!(consumer.saves[0].0.produced(), entry.write_offset);
    }

    #[tokio::test]
    async fn overlong_stream_is_corrupt() {
        let data = payload();
        let mut entry = entry(&data[..1000]);
        let mut sink = MemorySink::new();
        let mut writer = sink.get_writer(&entry).await.unwrap();
        let mut src = seek_source(&data).await;
        let mut consumer = Recorder::default();

        let err = Copier::new(CancellationToken::new())
            .copy(CopyParams {
                src: &mut src,
                dst: writer.as_mut(),
                entry: &mut entry,
                consumer: &mut consumer,
            })
            .await
            .unwrap_err();
        assert!(err.is_corruption());
    }
}
