use std::fmt;
use std::io;

/// Step of an entry's extraction an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preallocate,
    Mkdir,
    Symlink,
    Resume,
    Align,
    Copy,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Preallocate => "preallocate",
            Phase::Mkdir => "mkdir",
            Phase::Symlink => "symlink",
            Phase::Resume => "resume",
            Phase::Align => "align",
            Phase::Copy => "copy",
            Phase::Verify => "verify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// The archive, a checkpoint or the destination disagree with each other.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// A compressed stream or a source checkpoint could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("entry path escapes destination: '{0}'")]
    UnsafePath(String),

    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{path}: {phase}: {source}")]
    Entry {
        path: String,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    /// Extraction was asked to stop. Not a failure: the last checkpoint
    /// handed to the save consumer is where the next run picks up.
    #[error("extraction stopped")]
    Stopped,
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stopped)
    }

    /// Corruption is fatal for the checkpoint it happened with.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Corrupt(_) | Error::Decode(_) => true,
            Error::Entry { source, .. } => source.is_corruption(),
            _ => false,
        }
    }

    /// Whether retrying the same `resume` call with the last checkpoint may
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) | Error::Http(_) | Error::Request(_) => true,
            Error::Entry { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Attach entry path and phase. The stop sentinel passes through as is.
    pub fn in_entry(self, path: &str, phase: Phase) -> Self {
        match self {
            Error::Stopped | Error::Entry { .. } => self,
            other => Error::Entry {
                path: path.to_string(),
                phase,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) trait ResultExt<T> {
    fn phase(self, path: &str, phase: Phase) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn phase(self, path: &str, phase: Phase) -> Result<T> {
        self.map_err(|e| e.in_entry(path, phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_context_keeps_classification() {
        let err = Error::corrupt("bad header").in_entry("a/b.txt", Phase::Resume);
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "a/b.txt: resume: corrupt: bad header");

        let err = Error::Io(io::Error::other("disk")).in_entry("c", Phase::Copy);
        assert!(err.is_retryable());
    }

    #[test]
    fn stop_is_never_wrapped() {
        let err = Error::Stopped.in_entry("a", Phase::Copy);
        assert!(err.is_stop());
        assert!(!err.is_corruption());
    }
}
