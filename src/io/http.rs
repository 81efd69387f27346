use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::ReadAt;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 10;
const BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Reads a remote archive through HTTP `Range` requests.
///
/// A dropped connection or a timeout is retried a bounded number of times,
/// continuing from the last byte received.
pub struct HttpRangeReader {
    client: Client,
    url: String,
    size: u64,
    transferred_bytes: AtomicU64,
}

fn header<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body()
}

impl HttpRangeReader {
    /// Probe `url` with a HEAD request for its size and `Range` support.
    pub async fn new(url: String) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(client, url).await
    }

    pub async fn with_client(client: Client, url: String) -> Result<Self> {
        let resp = client.head(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("HEAD {} returned {}", url, resp.status())));
        }

        let headers = resp.headers();
        if !header(headers, ACCEPT_RANGES).is_some_and(|v| v.contains("bytes")) {
            return Err(Error::Unsupported(format!(
                "{} can't be resumed: server does not accept Range requests",
                url
            )));
        }
        let size = header(headers, CONTENT_LENGTH)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Http(format!("HEAD {} has no Content-Length", url)))?;

        tracing::debug!(%url, size, "opened remote archive");
        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bytes received from the network so far
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// One attempt at `[start, end]`, inclusive.
    async fn fetch(&self, start: u64, end: u64) -> std::result::Result<Bytes, FetchError> {
        let range = format!("bytes={}-{}", start, end);
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, &range)
            .send()
            .await
            .map_err(FetchError::Request)?;

        // a 200 would be the whole archive, which no caller wants
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::Fatal(Error::Http(format!(
                "{} for {} returned {}",
                range,
                self.url,
                resp.status()
            ))));
        }
        let bytes = resp.bytes().await.map_err(FetchError::Request)?;
        if bytes.is_empty() {
            return Err(FetchError::Fatal(Error::Http(format!(
                "{} for {} returned no data",
                range, self.url
            ))));
        }
        Ok(bytes)
    }
}

enum FetchError {
    Request(reqwest::Error),
    Fatal(Error),
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(self.size) - 1;
        let wanted = (end - offset + 1) as usize;

        let mut received = 0;
        let mut attempt = 0;
        while received < wanted {
            match self.fetch(offset + received as u64, end).await {
                Ok(bytes) => {
                    let n = bytes.len().min(wanted - received);
                    buf[received..received + n].copy_from_slice(&bytes[..n]);
                    received += n;
                    self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(FetchError::Request(e)) if is_transient(&e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::Http(format!(
                            "giving up on {} at offset {} after {} attempts: {}",
                            self.url,
                            offset + received as u64,
                            attempt,
                            e
                        )));
                    }
                    tracing::warn!("connection error, retry {}/{}: {}", attempt, MAX_ATTEMPTS, e);
                    tokio::time::sleep(BACKOFF_STEP * attempt).await;
                }
                Err(FetchError::Request(e)) => return Err(e.into()),
                Err(FetchError::Fatal(e)) => return Err(e),
            }
        }
        Ok(received)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
