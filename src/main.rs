//! Command-line front end: list or resumably extract a ZIP archive from a
//! local path or an HTTP URL.

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use resunzip::{
    Checkpoint, Cli, EntryKind, Extractor, FileSaveConsumer, FolderSink, HttpRangeReader,
    LocalFileReader, ReadAt, ZipExtractor, format_size,
};

const PROGRESS_STEPS: u64 = 10_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter())),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    if cli.is_http_url() {
        let reader = HttpRangeReader::new(cli.file.clone()).await?;
        let transferred_before = reader.transferred_bytes();
        let reader = Arc::new(reader);

        process_zip(reader.clone(), &cli).await?;

        if !cli.is_quiet() {
            let transferred = reader.transferred_bytes() - transferred_before;
            eprintln!("\nTotal bytes transferred: {}", format_size(transferred));
        }
    } else {
        let reader = Arc::new(
            LocalFileReader::new(&cli.file)
                .with_context(|| format!("opening {}", cli.file))?,
        );
        process_zip(reader, &cli).await?;
    }

    Ok(())
}

async fn process_zip<R: ReadAt + 'static>(reader: Arc<R>, cli: &Cli) -> Result<()> {
    let extractor = ZipExtractor::open(reader)
        .await
        .with_context(|| format!("reading {}", cli.file))?;

    if cli.list || cli.verbose {
        list_files(&extractor, cli.verbose);
        return Ok(());
    }

    extract(extractor, cli).await
}

/// Simple (`-l`) or tabular (`-v`) listing.
fn list_files<R: ReadAt + 'static>(extractor: &ZipExtractor<R>, verbose: bool) {
    if !verbose {
        for entry in extractor.list_files() {
            println!("{}", entry.file_name);
        }
        return;
    }

    println!(
        "{:>10}  {:>10}  {:>5}  {:>7}  {:>10}  {:>5}  Name",
        "Length", "Size", "Cmpr", "Method", "Date", "Time"
    );
    println!("{}", "-".repeat(79));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in extractor.list_files() {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:>7}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            saved_ratio(entry.compressed_size, entry.uncompressed_size),
            entry.compression_method.to_string(),
            year,
            month,
            day,
            hour,
            minute,
            entry.file_name
        );

        if entry.kind() != EntryKind::Dir {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(79));
    println!(
        "{:>10}  {:>10}  {}  {:>30}  {} files",
        total_uncompressed,
        total_compressed,
        saved_ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );
}

/// Space saved by compression, as a percentage.
fn saved_ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

async fn remove_checkpoint(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("removing checkpoint {}", path.display()))
        }
        _ => Ok(()),
    }
}

async fn extract<R: ReadAt + 'static>(mut extractor: ZipExtractor<R>, cli: &Cli) -> Result<()> {
    let destination = cli.destination();
    tokio::fs::create_dir_all(destination)
        .await
        .with_context(|| format!("creating {}", destination.display()))?;

    let checkpoint_path = cli.checkpoint_path();
    let checkpoint = if cli.fresh {
        remove_checkpoint(&checkpoint_path).await?;
        None
    } else {
        Checkpoint::load(&checkpoint_path)
            .await
            .with_context(|| format!("loading checkpoint {}", checkpoint_path.display()))?
    };
    let resuming = checkpoint.is_some();

    extractor.set_save_consumer(Box::new(FileSaveConsumer::new(
        &checkpoint_path,
        cli.save_interval,
    )));

    let bar = if cli.is_quiet() {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(PROGRESS_STEPS);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% ({eta})")?
                .progress_chars("#>-"),
        );
        bar
    };
    let listener_bar = bar.clone();
    extractor.set_progress_listener(Box::new(move |progress| {
        listener_bar.set_position((progress * PROGRESS_STEPS as f64) as u64);
    }));

    let cancel = extractor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut sink = FolderSink::new(destination);
    match extractor.resume(checkpoint, &mut sink).await {
        Ok(result) => {
            bar.finish_and_clear();
            remove_checkpoint(&checkpoint_path).await?;
            if !cli.is_very_quiet() {
                println!("Extracted {}", result);
            }
            Ok(())
        }
        Err(e) if e.is_stop() => {
            bar.abandon();
            bail!(
                "interrupted, run again to resume from {}",
                checkpoint_path.display()
            )
        }
        Err(e) if resuming && e.is_corruption() => Err(e).context(format!(
            "can't resume from {}, rerun with --fresh to start over",
            checkpoint_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}
