use async_trait::async_trait;

use super::inflate::{Inflater, Status};
use super::{SeekSource, Source};
use crate::checkpoint::SourceCheckpoint;
use crate::error::{Error, Result};
use crate::io::ReadAt;

const INPUT_CHUNK_SIZE: usize = 64 * 1024;

/// Streaming inflate over a raw [`SeekSource`].
///
/// Safe points are deflate block boundaries only, so a requested checkpoint
/// lands at the end of the block being decoded and usually trails what has
/// already been handed out by `read`.
pub struct FlateSource<R: ReadAt> {
    raw: SeekSource<R>,
    inflater: Inflater,
    input: Vec<u8>,
    want_save: bool,
    pending: Option<SourceCheckpoint>,
}

impl<R: ReadAt> FlateSource<R> {
    pub fn new(raw: SeekSource<R>) -> Self {
        Self {
            raw,
            inflater: Inflater::new(),
            input: vec![0u8; INPUT_CHUNK_SIZE],
            want_save: false,
            pending: None,
        }
    }

    /// Feed the next compressed chunk. Returns `false` at end of input.
    async fn refill(&mut self) -> Result<bool> {
        let n = self.raw.read(&mut self.input).await?;
        if n == 0 {
            self.inflater.finish_input();
            return Ok(false);
        }
        self.inflater.feed(&self.input[..n]);
        Ok(true)
    }
}

#[async_trait]
impl<R: ReadAt> Source for FlateSource<R> {
    async fn resume(&mut self, checkpoint: Option<SourceCheckpoint>) -> Result<u64> {
        self.want_save = false;
        self.pending = None;
        match checkpoint {
            None => {
                self.raw.resume(None).await?;
                self.inflater = Inflater::new();
                Ok(self.inflater.produced())
            }
            Some(SourceCheckpoint::Flate(checkpoint)) => {
                let input_offset = checkpoint.input_bits / 8;
                if input_offset > self.raw.size() {
                    return Err(Error::decode(format!(
                        "flate checkpoint at input byte {} is past the end of {} compressed bytes",
                        input_offset,
                        self.raw.size()
                    )));
                }
                self.inflater = Inflater::restore(&checkpoint)?;
                self.raw
                    .resume(Some(SourceCheckpoint::Seek {
                        offset: input_offset,
                    }))
                    .await?;
                tracing::trace!(
                    produced = checkpoint.produced,
                    input_bits = checkpoint.input_bits,
                    "inflate restored"
                );
                Ok(self.inflater.produced())
            }
            Some(other) => Err(Error::decode(format!(
                "inflate source can't resume from {:?}",
                other
            ))),
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.want_save && self.inflater.at_block_boundary() {
                self.pending = self.inflater.checkpoint().map(SourceCheckpoint::Flate);
                self.want_save = false;
                if filled > 0 {
                    break;
                }
            }

            let (n, status) = self.inflater.inflate(&mut buf[filled..], self.want_save)?;
            filled += n;
            match status {
                Status::Done => break,
                Status::OutputFull | Status::Boundary => {}
                Status::NeedInput => {
                    self.refill().await?;
                }
            }
        }
        Ok(filled)
    }

    fn want_save(&mut self) {
        self.want_save = true;
    }

    fn take_checkpoint(&mut self) -> Option<SourceCheckpoint> {
        self.pending.take()
    }
}
