//! Resumable byte producers.
//!
//! A [`Source`] yields an entry's decompressed bytes in order and can be
//! rebuilt mid-stream from a [`SourceCheckpoint`]. Where it can be rebuilt is
//! up to the source: [`SeekSource`] anywhere, [`FlateSource`] only at deflate
//! block boundaries.

mod flate;
mod inflate;
mod seek;

pub use flate::FlateSource;
pub use seek::SeekSource;

use async_trait::async_trait;

use crate::checkpoint::SourceCheckpoint;
use crate::error::{Error, Result};

const DISCARD_BUFFER_SIZE: usize = 32 * 1024;

#[async_trait]
pub trait Source: Send {
    /// Restore state from `checkpoint` (or start over on `None`) and return
    /// the offset the next [`read`](Source::read) produces from.
    async fn resume(&mut self, checkpoint: Option<SourceCheckpoint>) -> Result<u64>;

    /// Produce the next bytes. Returns 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Capture a checkpoint at the next safe point.
    fn want_save(&mut self);

    /// The checkpoint captured since the last call, if any.
    fn take_checkpoint(&mut self) -> Option<SourceCheckpoint>;
}

/// Read and drop exactly `n` bytes.
pub async fn discard_by_read(source: &mut dyn Source, n: u64) -> Result<()> {
    let mut buf = vec![0u8; DISCARD_BUFFER_SIZE.min(n as usize)];
    let mut remaining = n;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let read = source.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(Error::decode(format!(
                "stream ended {} bytes short while discarding {} bytes",
                remaining, n
            )));
        }
        remaining -= read as u64;
    }
    Ok(())
}

/// Read a whole (small) stream into memory, failing past `limit` bytes.
pub async fn read_to_end(source: &mut dyn Source, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > limit {
            return Err(Error::corrupt(format!("stream longer than {} bytes", limit)));
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use std::sync::Arc;

    fn source(data: &[u8]) -> SeekSource<MemoryReader> {
        let len = data.len() as u64;
        SeekSource::new(Arc::new(MemoryReader::new(data.to_vec())), 0, len)
    }

    #[tokio::test]
    async fn discards_exactly() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut src = source(&data);
        src.resume(None).await.unwrap();
        discard_by_read(&mut src, 70_001).await.unwrap();

        let rest = read_to_end(&mut src, usize::MAX).await.unwrap();
        assert_eq!(rest, &data[70_001..]);
    }

    #[tokio::test]
    async fn discarding_past_the_end_is_a_decode_error() {
        let mut src = source(b"tiny");
        src.resume(None).await.unwrap();
        let err = discard_by_read(&mut src, 5).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn read_to_end_enforces_limit() {
        let mut src = source(&[7u8; 100]);
        src.resume(None).await.unwrap();
        assert!(read_to_end(&mut src, 99).await.is_err());
    }
}
