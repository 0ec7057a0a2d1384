//! Command-line front end: argument parsing, batch iteration, output path
//! resolution, and progress rendering around the core download engine.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ktor_core::download::{download, DownloadOptions};
use ktor_core::progress::ProgressStats;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use url::Url;

const DEFAULT_CHUNK_SIZE: &str = "100mb";

/// Download files over independent anonymizing circuits, splitting each
/// file into byte ranges fetched in parallel. Interrupted downloads resume
/// when rerun with the same arguments.
#[derive(Debug, Parser)]
#[command(name = "ktor", version)]
pub struct Cli {
    /// Remote URL to download (omit when --input-file is set).
    url: Option<String>,

    /// Downloaded file output path; with --input-file and multiple URLs,
    /// a directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Chunk size, e.g. "100mb", "256KiB", or plain bytes [default: 100mb].
    #[arg(short = 's', long)]
    chunk_size: Option<String>,

    /// Number of chunks (overrides --chunk-size).
    #[arg(short = 'n', long = "chunks", default_value_t = 0)]
    chunks: u32,

    /// Number of parallel downloads.
    #[arg(short = 'p', long, default_value_t = 3)]
    parallel_downloads: usize,

    /// Number of circuits to use; 0 connects directly.
    #[arg(short = 'c', long, default_value_t = 1)]
    tor_circuits: usize,

    /// Path to a text file with one URL per line.
    #[arg(short = 'i', long)]
    input_file: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    ktor_core::logging::init(cli.verbose);

    if cli.chunks > 0 && cli.chunk_size.is_some() {
        bail!("cannot set both --chunks and --chunk-size");
    }
    let chunk_size = parse_chunk_size(cli.chunk_size.as_deref().unwrap_or(DEFAULT_CHUNK_SIZE))?;

    let urls = match &cli.input_file {
        Some(path) => {
            if cli.url.is_some() {
                bail!("when --input-file is set, do not pass a remote url argument");
            }
            let urls = read_urls_from_file(path)?;
            if urls.is_empty() {
                bail!("input file {} contains no URLs", path.display());
            }
            urls
        }
        None => vec![cli
            .url
            .clone()
            .context("requires a single remote url argument")?],
    };

    if cli.chunks > 0 {
        tracing::info!(chunks = cli.chunks, "chunk size: auto (from --chunks)");
    } else {
        tracing::info!(chunk_size, "chunk size");
    }
    tracing::info!(
        parallel = cli.parallel_downloads,
        circuits = cli.tor_circuits,
        "download settings"
    );

    let output_dir = resolve_output_dir(cli.output.as_deref(), urls.len())?;
    let opts = DownloadOptions {
        chunk_size,
        chunk_count: cli.chunks,
        max_parallel: cli.parallel_downloads,
        num_circuits: cli.tor_circuits,
    };

    let total = urls.len();
    let mut downloaded = 0usize;
    let mut errors = 0usize;
    for (index, url) in urls.iter().enumerate() {
        let destination = destination_for(url, index, cli.output.as_deref(), output_dir.as_deref());
        tracing::info!(url = %url, output = %destination.display(), "downloading");

        let (progress_tx, progress_rx) = mpsc::channel::<ProgressStats>(16);
        let printer = tokio::spawn(print_progress(progress_rx));
        let result = download(url, &destination, opts, Some(progress_tx)).await;
        let _ = printer.await;

        match result {
            Ok(()) => downloaded += 1,
            Err(e) => {
                tracing::error!(url = %url, error = %format!("{:#}", e), "download failed");
                errors += 1;
            }
        }
    }

    tracing::info!(total, downloaded, errors, "download summary");
    if errors > 0 {
        bail!("{} of {} download(s) failed", errors, total);
    }
    Ok(())
}

/// Render progress snapshots as a carriage-return status line, throttled
/// to twice a second plus a final line when the transfer finishes.
async fn print_progress(mut rx: mpsc::Receiver<ProgressStats>) {
    const PRINT_INTERVAL_MS: u128 = 500;
    let mut last_print: Option<Instant> = None;
    let mut printed = false;
    while let Some(stats) = rx.recv().await {
        let due = last_print.is_none_or(|t| t.elapsed().as_millis() >= PRINT_INTERVAL_MS);
        if due || stats.bytes_done >= stats.total_bytes {
            let done_mib = stats.bytes_done as f64 / 1_048_576.0;
            let total_mib = stats.total_bytes as f64 / 1_048_576.0;
            let rate_mib = stats.bytes_per_sec() / 1_048_576.0;
            let eta = stats
                .eta_secs()
                .map(|s| format!("{:.0}s", s))
                .unwrap_or_else(|| "?".to_string());
            print!(
                "\r  {:.1} / {:.1} MiB ({:.1}%)  chunks {}/{}  {:.2} MiB/s  ETA {}   ",
                done_mib,
                total_mib,
                stats.fraction() * 100.0,
                stats.chunks_done,
                stats.chunk_count,
                rate_mib,
                eta
            );
            use std::io::Write;
            let _ = std::io::stdout().flush();
            last_print = Some(Instant::now());
            printed = true;
        }
    }
    if printed {
        println!();
    }
}

/// Parse a human chunk size: plain bytes, decimal units (kb/mb/gb), or
/// binary units (kib/mib/gib). Case-insensitive.
fn parse_chunk_size(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let number: u64 = digits
        .parse()
        .with_context(|| format!("cannot parse chunk size: {}", value))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "mb" | "m" => 1_000_000,
        "gb" | "g" => 1_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        other => bail!("unknown chunk size unit: {}", other),
    };
    let bytes = number
        .checked_mul(multiplier)
        .with_context(|| format!("chunk size overflows: {}", value))?;
    if bytes == 0 {
        bail!("chunk size cannot be 0");
    }
    Ok(bytes)
}

/// Read one URL per line, skipping blank lines and `#` comments.
fn read_urls_from_file(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read input file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// With multiple URLs, `--output` names a directory (created if absent).
/// Returns the directory to place files in, or `None` for single-URL /
/// current-directory mode.
fn resolve_output_dir(output: Option<&Path>, url_count: usize) -> Result<Option<PathBuf>> {
    let Some(output) = output else {
        return Ok(None);
    };
    if url_count > 1 {
        if output.exists() && !output.is_dir() {
            bail!("output path must be a directory when downloading multiple URLs");
        }
        fs::create_dir_all(output)
            .with_context(|| format!("cannot create output directory {}", output.display()))?;
        return Ok(Some(output.to_path_buf()));
    }
    if output.is_dir() {
        return Ok(Some(output.to_path_buf()));
    }
    Ok(None)
}

fn destination_for(
    url: &str,
    index: usize,
    output: Option<&Path>,
    output_dir: Option<&Path>,
) -> PathBuf {
    if let Some(dir) = output_dir {
        return dir.join(default_output_name(url, index));
    }
    match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(default_output_name(url, index)),
    }
}

/// Last path segment of the URL, or `download-<n>` when the URL has none.
fn default_output_name(url: &str, index: usize) -> String {
    if let Ok(parsed) = Url::parse(url) {
        if let Some(segments) = parsed.path_segments() {
            if let Some(name) = segments.filter(|s| !s.is_empty()).last() {
                return name.to_string();
            }
        }
    }
    format!("download-{}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_accepts_plain_bytes_and_units() {
        assert_eq!(parse_chunk_size("1048576").unwrap(), 1_048_576);
        assert_eq!(parse_chunk_size("100mb").unwrap(), 100_000_000);
        assert_eq!(parse_chunk_size("256KiB").unwrap(), 256 * 1024);
        assert_eq!(parse_chunk_size("2GiB").unwrap(), 2 << 30);
        assert_eq!(parse_chunk_size("5k").unwrap(), 5_000);
    }

    #[test]
    fn chunk_size_rejects_zero_and_garbage() {
        assert!(parse_chunk_size("0").is_err());
        assert!(parse_chunk_size("0mb").is_err());
        assert!(parse_chunk_size("mb").is_err());
        assert!(parse_chunk_size("10parsecs").is_err());
    }

    #[test]
    fn output_name_comes_from_url_path() {
        assert_eq!(
            default_output_name("http://example.com/files/archive.tar.gz", 0),
            "archive.tar.gz"
        );
        assert_eq!(
            default_output_name("http://example.com/files/deep/x.bin?sig=abc", 3),
            "x.bin"
        );
    }

    #[test]
    fn output_name_falls_back_to_indexed_default() {
        assert_eq!(default_output_name("http://example.com/", 0), "download-1");
        assert_eq!(default_output_name("not a url", 4), "download-5");
    }

    #[test]
    fn urls_file_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        fs::write(
            &path,
            "# mirrors\nhttp://a.example/f\n\n  http://b.example/g  \n#x\n",
        )
        .unwrap();
        assert_eq!(
            read_urls_from_file(&path).unwrap(),
            vec!["http://a.example/f".to_string(), "http://b.example/g".to_string()]
        );
    }

    #[test]
    fn multi_url_output_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        assert!(resolve_output_dir(Some(file.as_path()), 2).is_err());

        let fresh = dir.path().join("batch");
        let resolved = resolve_output_dir(Some(fresh.as_path()), 2).unwrap();
        assert_eq!(resolved.as_deref(), Some(fresh.as_path()));
        assert!(fresh.is_dir());
    }
}
