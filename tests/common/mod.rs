//! Archive fixtures and run helpers shared by the integration tests.

#![allow(dead_code)]

use async_compression::tokio::write::{BzEncoder, LzmaEncoder, ZstdEncoder};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

use resunzip::{
    AfterSaveAction, CallbackSaveConsumer, Checkpoint, Extractor, ExtractorResult, MemoryReader,
    MemorySink, Result, SaveConsumer, ZipExtractor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflate,
    Bzip2,
    Lzma,
    Zstd,
}

struct Member {
    name: String,
    data: Vec<u8>,
    method: Method,
    mode: u32,
    flags: u16,
}

/// Builds zip archives the way a unix `zip` would: version made by 3.0 on
/// unix, with the full mode in the external attributes.
#[derive(Default)]
pub struct ZipBuilder {
    members: Vec<Member>,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(self, name: &str, data: &[u8], method: Method) -> Self {
        self.member(name, data, method, 0o100644, 0)
    }

    pub fn file_with_mode(self, name: &str, data: &[u8], method: Method, mode: u32) -> Self {
        self.member(name, data, method, 0o100000 | mode, 0)
    }

    pub fn dir(self, name: &str) -> Self {
        self.member(name, b"", Method::Stored, 0o040755, 0)
    }

    pub fn symlink(self, name: &str, target: &str) -> Self {
        self.symlink_with(name, target, Method::Stored)
    }

    pub fn symlink_with(self, name: &str, target: &str, method: Method) -> Self {
        self.member(name, target.as_bytes(), method, 0o120777, 0)
    }

    /// A stored entry flagged as encrypted (the data itself is plain).
    pub fn encrypted(self, name: &str, data: &[u8]) -> Self {
        self.member(name, data, Method::Stored, 0o100644, 0x0001)
    }

    fn member(mut self, name: &str, data: &[u8], method: Method, mode: u32, flags: u16) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            data: data.to_vec(),
            method,
            mode,
            flags,
        });
        self
    }

    pub async fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for member in &self.members {
            let (method, compressed, extra_flags) = compress(member.method, &member.data).await;
            let flags = member.flags | extra_flags;
            let crc = crc32fast::hash(&member.data);
            let lfh_offset = out.len() as u32;

            out.extend_from_slice(b"PK\x03\x04");
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&method.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0x0021u16.to_le_bytes());
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(member.name.as_bytes());
            out.extend_from_slice(&compressed);

            central.extend_from_slice(b"PK\x01\x02");
            central.extend_from_slice(&0x031Eu16.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&flags.to_le_bytes());
            central.extend_from_slice(&method.to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes());
            central.extend_from_slice(&0x0021u16.to_le_bytes());
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            central.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
            central.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes()); // extra
            central.extend_from_slice(&0u16.to_le_bytes()); // comment
            central.extend_from_slice(&0u16.to_le_bytes()); // disk
            central.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            central.extend_from_slice(&(member.mode << 16).to_le_bytes());
            central.extend_from_slice(&lfh_offset.to_le_bytes());
            central.extend_from_slice(member.name.as_bytes());
        }

        let cd_offset = out.len() as u32;
        let cd_size = central.len() as u32;
        let count = self.members.len() as u16;
        out.extend_from_slice(&central);
        out.extend_from_slice(b"PK\x05\x06");
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }
}

/// Returns (zip method code, compressed bytes, extra general purpose flags).
async fn compress(method: Method, data: &[u8]) -> (u16, Vec<u8>, u16) {
    match method {
        Method::Stored => (0, data.to_vec(), 0),
        Method::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(data).unwrap();
            (8, encoder.finish().unwrap(), 0)
        }
        Method::Bzip2 => {
            let mut encoder = BzEncoder::new(Vec::new());
            encoder.write_all(data).await.unwrap();
            encoder.shutdown().await.unwrap();
            (12, encoder.into_inner(), 0)
        }
        Method::Zstd => {
            let mut encoder = ZstdEncoder::new(Vec::new());
            encoder.write_all(data).await.unwrap();
            encoder.shutdown().await.unwrap();
            (93, encoder.into_inner(), 0)
        }
        Method::Lzma => {
            let mut encoder = LzmaEncoder::new(Vec::new());
            encoder.write_all(data).await.unwrap();
            encoder.shutdown().await.unwrap();
            let alone = encoder.into_inner();
            // .lzma: 5 property bytes, 8 byte size, stream.
            // zip: version, property size, properties, stream.
            let mut zipped = vec![0x10, 0x02, 0x05, 0x00];
            zipped.extend_from_slice(&alone[..5]);
            zipped.extend_from_slice(&alone[13..]);
            (14, zipped, 0x0002)
        }
    }
}

/// Word salad: compresses like text, into many deflate blocks.
pub fn text(len: usize, seed: u64) -> Vec<u8> {
    const WORDS: &[&str] = &[
        "archive", "block", "checkpoint", "deflate", "entry", "flush", "header", "inflate",
        "journal", "kernel", "length", "marker", "offset", "payload", "quota", "resume",
        "stream", "table", "unzip", "volume", "window", "extract", "yield", "zero",
    ];
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let pick = (state >> 33) as usize;
        out.extend_from_slice(WORDS[pick % WORDS.len()].as_bytes());
        match pick % 11 {
            0 => out.extend_from_slice(format!(" {}\n", pick % 10_000).as_bytes()),
            1 => out.push(b'\n'),
            _ => out.push(b' '),
        }
    }
    out.truncate(len);
    out
}

pub async fn open(archive: &[u8]) -> ZipExtractor<MemoryReader> {
    ZipExtractor::open(Arc::new(MemoryReader::new(archive.to_vec())))
        .await
        .unwrap()
}

/// Checkpoints a run offered to its save consumer, in order.
pub type Saved = Arc<Mutex<Vec<Checkpoint>>>;

/// Every `interval` bytes, save; stop at the first save `stop_when` accepts.
/// Each offered checkpoint goes through JSON, as it would through a file.
pub fn recording_consumer(
    interval: u64,
    stop_when: impl Fn(&Checkpoint) -> bool + Send + 'static,
) -> (Box<dyn SaveConsumer>, Saved) {
    let saved: Saved = Arc::default();
    let log = saved.clone();
    let consumer = CallbackSaveConsumer::new(interval, move |checkpoint: &Checkpoint| {
        let json = checkpoint.to_json()?;
        log.lock().unwrap().push(Checkpoint::from_json(&json)?);
        Ok(if stop_when(checkpoint) {
            AfterSaveAction::Stop
        } else {
            AfterSaveAction::Continue
        })
    });
    (Box::new(consumer), saved)
}

pub fn last(saved: &Saved) -> Option<Checkpoint> {
    saved.lock().unwrap().last().cloned()
}

/// One invocation: open the archive, run from `checkpoint` into `sink`.
pub async fn run(
    archive: &[u8],
    sink: &MemorySink,
    checkpoint: Option<Checkpoint>,
    interval: u64,
    stop_when: impl Fn(&Checkpoint) -> bool + Send + 'static,
) -> (Result<ExtractorResult>, Option<Checkpoint>) {
    let mut extractor = open(archive).await;
    let (consumer, saved) = recording_consumer(interval, stop_when);
    extractor.set_save_consumer(consumer);
    let result = extractor.resume(checkpoint, &mut sink.clone()).await;
    (result, last(&saved))
}

/// Extract without interruption into a new sink.
pub async fn extract_all(archive: &[u8]) -> MemorySink {
    let sink = MemorySink::new();
    let (result, _) = run(archive, &sink, None, u64::MAX, |_| false).await;
    result.unwrap();
    sink
}
