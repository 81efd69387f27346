//! The archive-format independent face of an extraction.

use async_trait::async_trait;
use std::fmt;

use crate::checkpoint::{Checkpoint, SaveConsumer};
use crate::entry::{Entry, EntryKind};
use crate::error::Result;
use crate::sink::Sink;

/// How finely an extractor can pick up after a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSupport {
    /// Every run starts over.
    None,
    /// Resumes at the start of the interrupted entry.
    Entry,
    /// Resumes inside an entry, at a compressed block boundary.
    Block,
}

impl fmt::Display for ResumeSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResumeSupport::None => "none",
            ResumeSupport::Entry => "entry",
            ResumeSupport::Block => "block",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorFeatures {
    pub name: &'static str,
    pub resume_support: ResumeSupport,
    pub preallocate: bool,
    pub random_access: bool,
}

impl fmt::Display for ExtractorFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (resume: {}", self.name, self.resume_support)?;
        if self.preallocate {
            f.write_str(", preallocate")?;
        }
        if self.random_access {
            f.write_str(", random access")?;
        }
        f.write_str(")")
    }
}

/// Returned by an uninterrupted extraction: every entry of the archive.
#[derive(Debug, Clone, Default)]
pub struct ExtractorResult {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub total_size: u64,
}

impl ExtractorResult {
    pub fn stats(&self) -> ExtractorStats {
        let mut stats = ExtractorStats::default();
        for entry in &self.entries {
            match entry.kind {
                EntryKind::File => stats.files += 1,
                EntryKind::Dir => stats.dirs += 1,
                EntryKind::Symlink => stats.symlinks += 1,
            }
            stats.total_size += entry.uncompressed_size;
        }
        stats
    }
}

impl fmt::Display for ExtractorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.files > 0 {
            parts.push(plural(self.files, "file"));
        }
        if self.dirs > 0 {
            parts.push(plural(self.dirs, "dir"));
        }
        if self.symlinks > 0 {
            parts.push(plural(self.symlinks, "symlink"));
        }
        if parts.is_empty() {
            parts.push("nothing".to_string());
        }
        write!(f, "{}, {}", parts.join(", "), format_size(self.total_size))
    }
}

impl fmt::Display for ExtractorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.stats().fmt(f)
    }
}

fn plural(n: usize, what: &str) -> String {
    if n == 1 {
        format!("1 {}", what)
    } else {
        format!("{} {}s", n, what)
    }
}

/// Format a byte size into a human-readable string.
///
/// ```
/// use resunzip::format_size;
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}

/// Progress callback, called with values in `[0, 1]`.
pub type ProgressListener = Box<dyn FnMut(f64) + Send>;

/// A resumable extraction of one archive into a [`Sink`].
#[async_trait]
pub trait Extractor: Send {
    /// Extract everything, starting fresh on `None` or from `checkpoint`.
    ///
    /// Returns [`Error::Stopped`](crate::Error::Stopped) when the save
    /// consumer or a cancellation ended the run early. The last checkpoint
    /// handed to the save consumer is then the one to resume from.
    async fn resume(
        &mut self,
        checkpoint: Option<Checkpoint>,
        sink: &mut dyn Sink,
    ) -> Result<ExtractorResult>;

    fn features(&self) -> ExtractorFeatures;

    fn set_save_consumer(&mut self, consumer: Box<dyn SaveConsumer>);

    fn set_progress_listener(&mut self, listener: ProgressListener);
}
