use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    AfterSaveAction, ArchiveFingerprint, Checkpoint, NopSaveConsumer, SaveConsumer,
    SourceCheckpoint,
};
use crate::copier::{CopyOutcome, CopyParams, Copier, SourceSaveConsumer};
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Phase, Result, ResultExt};
use crate::extractor::{
    Extractor, ExtractorFeatures, ExtractorResult, ProgressListener, ResumeSupport, format_size,
};
use crate::io::ReadAt;
use crate::sink::{EntryWriter, Sink};
use crate::source::{self, FlateSource, SeekSource, Source};

use super::fallback;
use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

const MAX_SYMLINK_TARGET: usize = 64 * 1024;

/// Resumable extractor for ZIP archives.
///
/// Stored and deflated entries resume mid-entry; other methods restart the
/// interrupted entry from its first byte.
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
    files: Vec<ZipFileEntry>,
    save_consumer: Box<dyn SaveConsumer>,
    progress: ProgressListener,
    cancel: CancellationToken,
}

impl<R: ReadAt + 'static> ZipExtractor<R> {
    /// Read the central directory of the archive behind `reader`.
    pub async fn open(reader: Arc<R>) -> Result<Self> {
        let parser = ZipParser::new(reader);
        let files = parser.list_files().await?;
        Ok(Self {
            parser,
            files,
            save_consumer: Box::new(NopSaveConsumer),
            progress: Box::new(|_| {}),
            cancel: CancellationToken::new(),
        })
    }

    /// Central directory entries, in archive order
    pub fn list_files(&self) -> &[ZipFileEntry] {
        &self.files
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.files.iter().map(ZipFileEntry::to_entry).collect()
    }

    pub fn fingerprint(&self) -> ArchiveFingerprint {
        ArchiveFingerprint {
            size: self.parser.size(),
            entries: self.files.len(),
            total_bytes: self.files.iter().map(|f| f.uncompressed_size).sum(),
        }
    }

    /// Cancelling `token` makes a running extraction stop at its next save
    /// point, after offering the checkpoint taken there.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reject checkpoints that don't belong to this archive.
    fn validate(&self, checkpoint: &Checkpoint) -> Result<()> {
        let fingerprint = self.fingerprint();
        if checkpoint.archive != fingerprint {
            return Err(Error::corrupt(format!(
                "archive changed since checkpoint: was {:?}, now {:?}",
                checkpoint.archive, fingerprint
            )));
        }
        if checkpoint.entry_index > self.files.len() {
            return Err(Error::corrupt(format!(
                "checkpoint at entry {}, archive has {}",
                checkpoint.entry_index,
                self.files.len()
            )));
        }

        let Some(entry) = &checkpoint.entry else {
            if checkpoint.source_checkpoint.is_some() {
                return Err(Error::corrupt("checkpoint has source state but no entry"));
            }
            return Ok(());
        };
        let expected = self
            .files
            .get(checkpoint.entry_index)
            .map(ZipFileEntry::to_entry)
            .ok_or_else(|| Error::corrupt("checkpoint entry past the end of the archive"))?;
        if entry.canonical_path != expected.canonical_path
            || entry.uncompressed_size != expected.uncompressed_size
            || entry.crc32 != expected.crc32
        {
            return Err(Error::corrupt(format!(
                "checkpoint entry {} is '{}', archive has '{}'",
                checkpoint.entry_index, entry.canonical_path, expected.canonical_path
            )));
        }
        if entry.write_offset > entry.uncompressed_size {
            return Err(Error::corrupt(format!(
                "{}: checkpoint wrote {} of {} bytes",
                entry.canonical_path, entry.write_offset, entry.uncompressed_size
            )));
        }
        Ok(())
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

/// Fills in the extractor checkpoint around each source checkpoint.
struct EntrySaver<'a> {
    checkpoint: &'a mut Checkpoint,
    consumer: &'a mut dyn SaveConsumer,
    progress: &'a mut (dyn FnMut(f64) + Send),
    done_bytes: u64,
    total_bytes: u64,
}

#[async_trait]
impl SourceSaveConsumer for EntrySaver<'_> {
    fn should_save(&mut self, copied: u64) -> bool {
        self.consumer.should_save(copied)
    }

    async fn save(&mut self, checkpoint: SourceCheckpoint, entry: &Entry) -> Result<AfterSaveAction> {
        tracing::trace!(
            "{}: save point, source at {}, writer at {}",
            entry.canonical_path,
            checkpoint.produced(),
            entry.write_offset
        );
        self.checkpoint.source_checkpoint = Some(checkpoint);
        self.checkpoint.entry = Some(entry.clone());
        self.checkpoint.progress = ratio(self.done_bytes + entry.write_offset, self.total_bytes);
        self.consumer.save(self.checkpoint).await
    }

    fn progress(&mut self, entry: &Entry) {
        (self.progress)(ratio(self.done_bytes + entry.write_offset, self.total_bytes));
    }
}

fn check_supported(zip_entry: &ZipFileEntry) -> Result<()> {
    if zip_entry.is_encrypted() {
        return Err(Error::Unsupported("encrypted entry".to_string()));
    }
    if let CompressionMethod::Unknown(method) = zip_entry.compression_method {
        return Err(Error::Unsupported(format!("compression method {}", method)));
    }
    Ok(())
}

/// A resumable source for stored and deflated entries, `None` for methods
/// that need a one-shot decoder.
async fn open_source<R: ReadAt + 'static>(
    parser: &ZipParser<R>,
    zip_entry: &ZipFileEntry,
) -> Result<Option<Box<dyn Source>>> {
    check_supported(zip_entry)?;
    if !zip_entry.compression_method.is_resumable() {
        return Ok(None);
    }
    let data_offset = parser.get_data_offset(zip_entry).await?;
    let raw = SeekSource::new(parser.reader().clone(), data_offset, zip_entry.compressed_size);
    let source: Box<dyn Source> = if zip_entry.compression_method == CompressionMethod::Deflate {
        Box::new(FlateSource::new(raw))
    } else {
        Box::new(raw)
    };
    Ok(Some(source))
}

async fn symlink_target<R: ReadAt + 'static>(
    parser: &ZipParser<R>,
    zip_entry: &ZipFileEntry,
) -> Result<String> {
    if zip_entry.uncompressed_size > MAX_SYMLINK_TARGET as u64 {
        return Err(Error::corrupt(format!(
            "symlink target of {} bytes",
            zip_entry.uncompressed_size
        )));
    }
    let target = match open_source(parser, zip_entry).await? {
        Some(mut source) => {
            source.resume(None).await?;
            source::read_to_end(source.as_mut(), MAX_SYMLINK_TARGET).await?
        }
        None => {
            let data_offset = parser.get_data_offset(zip_entry).await?;
            let mut buffer = TargetBuffer::default();
            let mut entry = zip_entry.to_entry();
            fallback::copy(
                parser.reader().clone(),
                zip_entry,
                data_offset,
                &mut buffer,
                &mut entry,
                &mut |_: &Entry| {},
            )
            .await?;
            buffer.0
        }
    };
    String::from_utf8(target).map_err(|_| Error::corrupt("symlink target is not UTF-8"))
}

/// Collects a symlink target decoded by a fallback decoder.
#[derive(Default)]
struct TargetBuffer(Vec<u8>);

#[async_trait]
impl EntryWriter for TargetBuffer {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.0.extend_from_slice(buf);
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Everything one entry's extraction borrows from the extractor.
struct EntryJob<'a, R: ReadAt> {
    parser: &'a ZipParser<R>,
    zip_entry: &'a ZipFileEntry,
    checkpoint: &'a mut Checkpoint,
    sink: &'a mut dyn Sink,
    copier: &'a mut Copier,
    consumer: &'a mut dyn SaveConsumer,
    progress: &'a mut (dyn FnMut(f64) + Send),
    done_bytes: u64,
    total_bytes: u64,
}

impl<R: ReadAt + 'static> EntryJob<'_, R> {
    async fn run(self) -> Result<CopyOutcome> {
        let entry = self
            .checkpoint
            .entry
            .take()
            .unwrap_or_else(|| self.zip_entry.to_entry());
        tracing::debug!("→ {}", entry);

        let path = entry.canonical_path.clone();
        match entry.kind {
            EntryKind::Dir => {
                self.sink.mkdir(&entry).await.phase(&path, Phase::Mkdir)?;
                Ok(CopyOutcome::Done)
            }
            EntryKind::Symlink => {
                let target = symlink_target(self.parser, self.zip_entry)
                    .await
                    .phase(&path, Phase::Symlink)?;
                self.sink
                    .symlink(&entry, &target)
                    .await
                    .phase(&path, Phase::Symlink)?;
                Ok(CopyOutcome::Done)
            }
            EntryKind::File => self.file(entry).await,
        }
    }

    async fn file(self, mut entry: Entry) -> Result<CopyOutcome> {
        let path = entry.canonical_path.clone();
        let Some(mut source) = open_source(self.parser, self.zip_entry)
            .await
            .phase(&path, Phase::Resume)?
        else {
            self.fallback(entry).await.phase(&path, Phase::Copy)?;
            return Ok(CopyOutcome::Done);
        };

        let produced = source
            .resume(self.checkpoint.source_checkpoint.take())
            .await
            .phase(&path, Phase::Resume)?;
        if produced > entry.write_offset {
            return Err(Error::corrupt(format!(
                "source resumed at {}, past the {} bytes already written",
                produced, entry.write_offset
            )))
            .phase(&path, Phase::Align);
        }
        let delta = entry.write_offset - produced;
        if delta > 0 {
            tracing::debug!(
                "{}: discarding {} bytes to align source and writer (source at {}, writer at {})",
                path,
                delta,
                produced,
                entry.write_offset
            );
            source::discard_by_read(source.as_mut(), delta)
                .await
                .phase(&path, Phase::Align)?;
        }
        if entry.write_offset > 0 {
            tracing::debug!("{}: resuming from {}", path, format_size(entry.write_offset));
        }

        let mut writer = self
            .sink
            .get_writer(&entry)
            .await
            .phase(&path, Phase::Copy)?;

        let mut saver = EntrySaver {
            checkpoint: self.checkpoint,
            consumer: self.consumer,
            progress: self.progress,
            done_bytes: self.done_bytes,
            total_bytes: self.total_bytes,
        };
        let outcome = self
            .copier
            .copy(CopyParams {
                src: source.as_mut(),
                dst: writer.as_mut(),
                entry: &mut entry,
                consumer: &mut saver,
            })
            .await
            .phase(&path, Phase::Copy)?;
        if outcome == CopyOutcome::Stopped {
            return Ok(outcome);
        }

        writer.close().await.phase(&path, Phase::Copy)?;
        entry.verify().phase(&path, Phase::Verify)?;
        Ok(CopyOutcome::Done)
    }

    async fn fallback(self, mut entry: Entry) -> Result<()> {
        if entry.write_offset > 0 {
            tracing::debug!(
                "{}: {} can't resume, restarting from zero",
                entry.canonical_path,
                self.zip_entry.compression_method
            );
        }
        entry.rewind();
        let data_offset = self.parser.get_data_offset(self.zip_entry).await?;
        let mut writer = self.sink.get_writer(&entry).await?;

        let (done_bytes, total_bytes) = (self.done_bytes, self.total_bytes);
        let progress = self.progress;
        let mut on_progress = |e: &Entry| progress(ratio(done_bytes + e.write_offset, total_bytes));
        fallback::copy(
            self.parser.reader().clone(),
            self.zip_entry,
            data_offset,
            writer.as_mut(),
            &mut entry,
            &mut on_progress,
        )
        .await?;

        writer.close().await?;
        entry.verify()
    }
}

#[async_trait]
impl<R: ReadAt + 'static> Extractor for ZipExtractor<R> {
    async fn resume(
        &mut self,
        checkpoint: Option<Checkpoint>,
        sink: &mut dyn Sink,
    ) -> Result<ExtractorResult> {
        let fingerprint = self.fingerprint();
        let total_bytes = fingerprint.total_bytes;

        let fresh = checkpoint.is_none();
        let mut checkpoint = match checkpoint {
            None => {
                tracing::info!(
                    "→ starting fresh extraction of {} entries ({})",
                    self.files.len(),
                    format_size(total_bytes)
                );
                Checkpoint::new(fingerprint)
            }
            Some(checkpoint) => {
                self.validate(&checkpoint)?;
                tracing::info!(
                    "↻ resuming @ {:.1}% (entry {} of {})",
                    checkpoint.progress * 100.0,
                    checkpoint.entry_index,
                    self.files.len()
                );
                checkpoint
            }
        };

        if fresh {
            tracing::info!("⇓ preallocating {}", format_size(total_bytes));
            let start = Instant::now();
            for zip_entry in &self.files {
                let entry = zip_entry.to_entry();
                if entry.kind == EntryKind::File {
                    sink.preallocate(&entry)
                        .await
                        .phase(&entry.canonical_path, Phase::Preallocate)?;
                }
            }
            tracing::info!("⇒ preallocated in {:?}", start.elapsed());
        }

        let Self {
            parser,
            files,
            save_consumer,
            progress,
            cancel,
        } = self;
        let progress = progress.as_mut();

        let mut done_bytes: u64 = files[..checkpoint.entry_index]
            .iter()
            .map(|f| f.uncompressed_size)
            .sum();
        let mut copier = Copier::new(cancel.clone());

        for (index, zip_entry) in files.iter().enumerate().skip(checkpoint.entry_index) {
            checkpoint.entry_index = index;

            if checkpoint.entry.is_none() && cancel.is_cancelled() {
                checkpoint.source_checkpoint = None;
                checkpoint.progress = ratio(done_bytes, total_bytes);
                save_consumer.save(&checkpoint).await?;
                tracing::info!("stopped before entry {}", index);
                return Err(Error::Stopped);
            }

            let job = EntryJob {
                parser,
                zip_entry,
                checkpoint: &mut checkpoint,
                sink: &mut *sink,
                copier: &mut copier,
                consumer: save_consumer.as_mut(),
                progress: &mut *progress,
                done_bytes,
                total_bytes,
            };
            if job.run().await? == CopyOutcome::Stopped {
                tracing::info!(
                    "stopped @ {:.1}% in {}",
                    checkpoint.progress * 100.0,
                    zip_entry.file_name
                );
                return Err(Error::Stopped);
            }

            done_bytes += zip_entry.uncompressed_size;
            checkpoint.entry = None;
            checkpoint.source_checkpoint = None;
            progress(ratio(done_bytes, total_bytes));
        }

        progress(1.0);
        let result = ExtractorResult {
            entries: files.iter().map(ZipFileEntry::to_entry).collect(),
        };
        tracing::info!("extracted {}", result);
        Ok(result)
    }

    fn features(&self) -> ExtractorFeatures {
        ExtractorFeatures {
            name: "zip",
            resume_support: ResumeSupport::Block,
            preallocate: true,
            random_access: true,
        }
    }

    fn set_save_consumer(&mut self, consumer: Box<dyn SaveConsumer>) {
        self.save_consumer = consumer;
    }

    fn set_progress_listener(&mut self, listener: ProgressListener) {
        self.progress = listener;
    }
}
