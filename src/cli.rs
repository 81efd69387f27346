use clap::Parser;
use std::path::{Path, PathBuf};

/// Default bytes copied between two checkpoints
pub const DEFAULT_SAVE_INTERVAL: u64 = 4 * 1024 * 1024;

const CHECKPOINT_FILE_NAME: &str = ".resunzip-checkpoint.json";

#[derive(Parser, Debug)]
#[command(name = "resunzip")]
#[command(version)]
#[command(about = "Resumable unzip, for local files and HTTP URLs", long_about = None)]
#[command(after_help = "Examples:\n  \
  resunzip big.zip -d out          extract, resuming if a previous run was interrupted\n  \
  resunzip --fresh big.zip -d out  ignore any previous checkpoint\n  \
  resunzip -l https://example.com/archive.zip   list files from remote ZIP")]
pub struct Cli {
    /// ZIP file path or HTTP URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<PathBuf>,

    /// Checkpoint file [default: DIR/.resunzip-checkpoint.json]
    #[arg(long, value_name = "PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Bytes to copy between two checkpoints
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_SAVE_INTERVAL)]
    pub save_interval: u64,

    /// Start over even if a checkpoint exists
    #[arg(long)]
    pub fresh: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.file.starts_with("http://") || self.file.starts_with("https://")
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    pub fn destination(&self) -> &Path {
        self.extract_dir.as_deref().unwrap_or(Path::new("."))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .clone()
            .unwrap_or_else(|| self.destination().join(CHECKPOINT_FILE_NAME))
    }

    /// Default `tracing` filter, overridden by `RUST_LOG`.
    pub fn log_filter(&self) -> &'static str {
        match self.quiet {
            0 => "resunzip=info",
            1 => "resunzip=warn",
            _ => "resunzip=error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_defaults_into_destination() {
        let cli = Cli::parse_from(["resunzip", "a.zip", "-d", "out"]);
        assert_eq!(cli.checkpoint_path(), Path::new("out").join(CHECKPOINT_FILE_NAME));
        assert_eq!(cli.save_interval, DEFAULT_SAVE_INTERVAL);
        assert!(!cli.fresh);

        let cli = Cli::parse_from(["resunzip", "-qq", "--checkpoint", "/tmp/c.json", "a.zip"]);
        assert_eq!(cli.checkpoint_path(), Path::new("/tmp/c.json"));
        assert!(cli.is_very_quiet());
        assert_eq!(cli.log_filter(), "resunzip=error");
    }
}
