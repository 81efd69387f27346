use async_trait::async_trait;
use std::sync::Arc;

use super::Source;
use crate::checkpoint::SourceCheckpoint;
use crate::error::{Error, Result};
use crate::io::ReadAt;

/// A window of `size` bytes starting at `start` of a [`ReadAt`].
///
/// Every byte offset is a safe point, so a requested checkpoint is captured
/// right away.
pub struct SeekSource<R: ReadAt> {
    reader: Arc<R>,
    start: u64,
    size: u64,
    offset: u64,
    pending: Option<SourceCheckpoint>,
}

impl<R: ReadAt> SeekSource<R> {
    pub fn new(reader: Arc<R>, start: u64, size: u64) -> Self {
        Self {
            reader,
            start,
            size,
            offset: 0,
            pending: None,
        }
    }

    /// Position within the window
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl<R: ReadAt> Source for SeekSource<R> {
    async fn resume(&mut self, checkpoint: Option<SourceCheckpoint>) -> Result<u64> {
        self.pending = None;
        self.offset = match checkpoint {
            None => 0,
            Some(SourceCheckpoint::Seek { offset }) if offset <= self.size => offset,
            Some(SourceCheckpoint::Seek { offset }) => {
                return Err(Error::decode(format!(
                    "seek checkpoint at {} is past the end of a {} byte section",
                    offset, self.size
                )));
            }
            Some(other) => {
                return Err(Error::decode(format!(
                    "raw source can't resume from {:?}",
                    other
                )));
            }
        };
        Ok(self.offset)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.size - self.offset;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = self
            .reader
            .read_at(self.start + self.offset, &mut buf[..want])
            .await?;
        if n == 0 {
            return Err(Error::corrupt(format!(
                "archive truncated: section ends {} bytes early",
                remaining
            )));
        }
        self.offset += n as u64;
        Ok(n)
    }

    fn want_save(&mut self) {
        self.pending = Some(SourceCheckpoint::Seek {
            offset: self.offset,
        });
    }

    fn take_checkpoint(&mut self) -> Option<SourceCheckpoint> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FlateCheckpoint;
    use crate::io::MemoryReader;

    fn source() -> SeekSource<MemoryReader> {
        let reader = Arc::new(MemoryReader::new(b"headerPAYLOADtrailer".to_vec()));
        SeekSource::new(reader, 6, 7)
    }

    #[tokio::test]
    async fn reads_only_its_window() {
        let mut src = source();
        assert_eq!(src.resume(None).await.unwrap(), 0);
        let mut buf = [0u8; 32];
        let n = src.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PAYLOAD");
        assert_eq!(src.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_is_the_current_offset() {
        let mut src = source();
        src.resume(None).await.unwrap();
        let mut buf = [0u8; 3];
        src.read(&mut buf).await.unwrap();
        assert!(src.take_checkpoint().is_none());
        src.want_save();
        let checkpoint = src.take_checkpoint().unwrap();
        assert_eq!(checkpoint, SourceCheckpoint::Seek { offset: 3 });

        let mut resumed = source();
        assert_eq!(resumed.resume(Some(checkpoint)).await.unwrap(), 3);
        let mut buf = [0u8; 8];
        let n = resumed.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"LOAD");
    }

    #[tokio::test]
    async fn rejects_foreign_or_out_of_range_checkpoints() {
        let mut src = source();
        let err = src
            .resume(Some(SourceCheckpoint::Seek { offset: 8 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let flate = SourceCheckpoint::Flate(FlateCheckpoint {
            produced: 0,
            input_bits: 0,
            window: Vec::new(),
        });
        assert!(src.resume(Some(flate)).await.is_err());
    }
}
