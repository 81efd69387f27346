//! One-shot decoding for methods without resumable state.
//!
//! These entries are always copied from byte zero. The compressed bytes are
//! streamed out of the [`ReadAt`] in chunks and fed to `async-compression`.

use async_compression::tokio::bufread::{BzDecoder, LzmaDecoder, ZstdDecoder};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use super::structures::{CompressionMethod, FLAG_LZMA_EOS, ZipFileEntry};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::sink::EntryWriter;

const CHUNK_SIZE: u64 = 256 * 1024;
const COPY_BUFFER_SIZE: usize = 32 * 1024;
const LZMA_PROPS_SIZE: usize = 5;

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Compressed bytes `[start, end)` of `reader`, in chunks.
fn chunks<R: ReadAt + 'static>(reader: Arc<R>, start: u64, end: u64) -> ByteStream {
    Box::pin(stream::try_unfold(start, move |offset| {
        let reader = reader.clone();
        async move {
            if offset >= end {
                return Ok(None);
            }
            let mut buf = vec![0u8; (end - offset).min(CHUNK_SIZE) as usize];
            let n = reader
                .read_at(offset, &mut buf)
                .await
                .map_err(io::Error::other)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("archive truncated at {}", offset),
                ));
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), offset + n as u64)))
        }
    }))
}

/// Zip stores LZMA as a 4 byte header (version, properties size), the
/// properties, then the raw stream. The decoder wants the `.lzma` layout:
/// properties followed by the uncompressed size, or all ones when the
/// stream carries an end marker.
async fn lzma_stream<R: ReadAt + 'static>(
    reader: Arc<R>,
    zip_entry: &ZipFileEntry,
    data_offset: u64,
) -> Result<ByteStream> {
    let mut header = [0u8; 4];
    reader.read_exact_at(data_offset, &mut header).await?;
    let props_size = u16::from_le_bytes([header[2], header[3]]) as usize;
    if props_size != LZMA_PROPS_SIZE {
        return Err(Error::decode(format!(
            "lzma properties are {} bytes, expected {}",
            props_size, LZMA_PROPS_SIZE
        )));
    }
    let body = data_offset + 4 + props_size as u64;
    if body > data_offset + zip_entry.compressed_size {
        return Err(Error::decode("lzma header longer than the entry"));
    }

    let mut alone = vec![0u8; props_size];
    reader.read_exact_at(data_offset + 4, &mut alone).await?;
    let size = if zip_entry.flags & FLAG_LZMA_EOS != 0 {
        u64::MAX
    } else {
        zip_entry.uncompressed_size
    };
    alone.extend_from_slice(&size.to_le_bytes());

    let head = stream::once(async move { Ok::<_, io::Error>(Bytes::from(alone)) });
    let end = data_offset + zip_entry.compressed_size;
    Ok(Box::pin(head.chain(chunks(reader, body, end))))
}

/// Turn an I/O error surfaced by a decoder back into ours: errors from the
/// archive reader pass through, everything else is a decode failure.
fn from_io(method: CompressionMethod, e: io::Error) -> Error {
    let kind = e.kind();
    match e.into_inner() {
        Some(inner) => match inner.downcast::<Error>() {
            Ok(err) => *err,
            Err(other) => Error::decode(format!("{} stream: {}", method, other)),
        },
        None => Error::decode(format!("{} stream: {}", method, kind)),
    }
}

/// Decode the whole entry into `writer`, which must start at offset zero.
pub(crate) async fn copy<R: ReadAt + 'static>(
    reader: Arc<R>,
    zip_entry: &ZipFileEntry,
    data_offset: u64,
    writer: &mut dyn EntryWriter,
    entry: &mut Entry,
    on_progress: &mut (dyn FnMut(&Entry) + Send),
) -> Result<()> {
    let method = zip_entry.compression_method;
    let end = data_offset + zip_entry.compressed_size;

    let mut decoder: Box<dyn AsyncRead + Send + Unpin> = match method {
        CompressionMethod::Bzip2 => Box::new(BzDecoder::new(StreamReader::new(chunks(
            reader,
            data_offset,
            end,
        )))),
        CompressionMethod::Zstd => Box::new(ZstdDecoder::new(StreamReader::new(chunks(
            reader,
            data_offset,
            end,
        )))),
        CompressionMethod::Lzma => {
            let stream = lzma_stream(reader, zip_entry, data_offset).await?;
            Box::new(LzmaDecoder::new(StreamReader::new(stream)))
        }
        other => {
            return Err(Error::Unsupported(format!(
                "no decoder for compression {}",
                other
            )));
        }
    };

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = decoder
            .read(&mut buf)
            .await
            .map_err(|e| from_io(method, e))?;
        if n == 0 {
            break;
        }
        if entry.write_offset + n as u64 > entry.uncompressed_size {
            return Err(Error::corrupt(format!(
                "{} stream produced more than {} bytes",
                method, entry.uncompressed_size
            )));
        }
        writer.write_all(&buf[..n]).await?;
        entry.advance(&buf[..n]);
        on_progress(entry);
    }
    Ok(())
}
