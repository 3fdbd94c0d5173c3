use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use cos_transfer::config::{Config, CosUri, TransferSettings, parse_cos_uri, parse_size};
use cos_transfer::filter::NameFilter;
use cos_transfer::s3::S3Client;
use cos_transfer::transfer::{
    ChannelSink, Direction, ProgressEvent, ProgressSink, TransferEngine, TransferError,
    TransferRequest, no_progress,
};

#[derive(Parser, Debug)]
#[command(
    name = "cosxfer",
    version = env!("CARGO_PKG_VERSION"),
    about = "Resumable, chunked transfers to and from COS / S3-compatible storage",
    long_about = "Uploads files with multipart uploads and downloads them with ranged reads. \
                  Interrupted downloads resume from a checkpoint on the next run. \
                  Configure the connection via .env and tune transfers with flags, COS_* variables or a YAML file.",
    after_help = "Examples:\n  \
                  cosxfer upload ./video.mp4 cos://my-bucket/videos/         # Upload a single file\n  \
                  cosxfer upload -r ./photos cos://my-bucket/photos          # Upload a directory\n  \
                  cosxfer download cos://my-bucket/videos/a.mp4 ./a.mp4      # Download (resumes if interrupted)\n  \
                  cosxfer download -r cos://my-bucket/photos ./photos -c 8   # Download a prefix with 8 workers\n\n\
                  Configuration (.env):\n  \
                  COS_REGION=ap-guangzhou\n  \
                  COS_ENDPOINT_URL=https://cos.ap-guangzhou.myqcloud.com\n  \
                  COS_CHUNK_SIZE=16MiB"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file or directory
    Upload {
        /// Local file, or directory with --recursive
        local: PathBuf,

        /// Destination, e.g. cos://bucket/key or cos://bucket/prefix/
        dest: String,

        #[command(flatten)]
        opts: TransferOpts,
    },

    /// Download an object or a prefix
    Download {
        /// Source, e.g. cos://bucket/key or cos://bucket/prefix with --recursive
        src: String,

        /// Local file or directory
        local: PathBuf,

        #[command(flatten)]
        opts: TransferOpts,
    },
}

#[derive(Args, Debug)]
struct TransferOpts {
    /// Transfer a whole directory / prefix
    #[arg(long, short = 'r')]
    recursive: bool,

    /// Bytes per part or range, e.g. 8MB, 64MiB
    #[arg(long, value_parser = size_arg)]
    chunk_size: Option<u64>,

    /// Retries per chunk after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delay before the first retry, in milliseconds
    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    /// Upper bound for a single retry delay, in milliseconds
    #[arg(long)]
    retry_backoff_max_ms: Option<u64>,

    /// Ignore and do not write download checkpoints
    #[arg(long)]
    no_resume: bool,

    /// Maximum number of concurrent file transfers
    #[arg(long, short = 'c')]
    concurrency: Option<usize>,

    /// Bandwidth limit per transfer, e.g. 10MB (bytes per second)
    #[arg(long, value_parser = size_arg)]
    limit_rate: Option<u64>,

    /// Compare downloads with the remote ETag (single-part objects only)
    #[arg(long)]
    verify: bool,

    /// Give up on a file after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only transfer files matching this glob (repeatable), e.g. "*.log"
    #[arg(long)]
    include: Vec<String>,

    /// Skip files matching this glob (repeatable); wins over --include
    #[arg(long)]
    exclude: Vec<String>,

    /// Do not draw a progress bar
    #[arg(long)]
    no_progress: bool,
}

fn size_arg(s: &str) -> std::result::Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

impl TransferOpts {
    /// File and environment settings with command line flags on top
    fn settings(&self) -> Result<TransferSettings> {
        let mut settings = TransferSettings::load(self.config.as_deref())?;
        if let Some(v) = self.chunk_size {
            settings.chunk_size = v;
        }
        if let Some(v) = self.max_retries {
            settings.max_retries = v;
        }
        if let Some(v) = self.retry_backoff_ms {
            settings.retry_backoff_ms = v;
        }
        if let Some(v) = self.retry_backoff_max_ms {
            settings.retry_backoff_max_ms = v;
        }
        if let Some(v) = self.concurrency {
            settings.concurrency = v;
        }
        if self.limit_rate.is_some() {
            settings.limit_rate = self.limit_rate;
        }
        if self.timeout_secs.is_some() {
            settings.timeout_secs = self.timeout_secs;
        }
        if self.no_resume {
            settings.resume = false;
        }
        if self.verify {
            settings.verify = true;
        }
        Ok(settings)
    }

    fn filter(&self) -> Result<NameFilter> {
        NameFilter::new(&self.include, &self.exclude)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    // Initialize tracing/logging with support for LOG_LEVEL from .env
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    info!("cosxfer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let s3_client = S3Client::new(config).await?;

    let (requests, opts) = match &cli.command {
        Command::Upload { local, dest, opts } => {
            let dest = parse_cos_uri(dest)?;
            let requests = upload_requests(local, &dest, opts.recursive, &opts.filter()?)?;
            (requests, opts)
        }
        Command::Download { src, local, opts } => {
            let src = parse_cos_uri(src)?;
            let requests =
                download_requests(&s3_client, &src, local, opts.recursive, &opts.filter()?)
                    .await?;
            (requests, opts)
        }
    };
    let settings = opts.settings()?;

    if requests.is_empty() {
        println!("{}", style("Nothing to transfer").yellow());
        return Ok(());
    }

    let requests: Vec<TransferRequest> = requests.into_iter().map(|r| settings.apply(r)).collect();
    let engine = TransferEngine::new(Arc::new(s3_client.backend()), settings.checkpoint_store());
    let summary = Summary::new(&requests);

    let (sink, renderer): (Arc<dyn ProgressSink>, _) = if opts.no_progress {
        (no_progress(), None)
    } else {
        let (sink, events) = ChannelSink::new();
        let sink: Arc<dyn ProgressSink> = Arc::new(sink);
        (sink, Some(spawn_progress_bar(events)))
    };

    let result = if let [request] = requests.as_slice() {
        engine.transfer(request, sink).await
    } else {
        info!("Concurrent workers: {}", settings.concurrency);
        engine
            .run_many(requests.clone(), settings.concurrency, sink)
            .await
    };

    // All sink clones are gone once the transfer returns, which ends the renderer
    if let Some(renderer) = renderer {
        if let Err(e) = renderer.await {
            warn!("Progress display failed: {}", e);
        }
    }

    match result {
        Ok(()) => {
            summary.print();
            Ok(())
        }
        Err(e) => {
            report_failure(&engine, &requests, &e).await;
            std::process::exit(1);
        }
    }
}

/// One request per file: a single file, or every file below a directory
/// that passes `filter`
fn upload_requests(
    local: &Path,
    dest: &CosUri,
    recursive: bool,
    filter: &NameFilter,
) -> Result<Vec<TransferRequest>> {
    if local.is_file() {
        let key = if dest.key.is_empty() || dest.key.ends_with('/') {
            let name = local
                .file_name()
                .context("Failed to get filename")?
                .to_string_lossy();
            dest.join(&name)
        } else {
            dest.key.clone()
        };
        return Ok(vec![TransferRequest::upload(local, &dest.bucket, key)]);
    }

    if !local.is_dir() {
        anyhow::bail!("Path does not exist: {}", local.display());
    }
    if !recursive {
        anyhow::bail!("{} is a directory, use --recursive", local.display());
    }

    let mut requests = Vec::new();
    for entry in WalkDir::new(local)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let relative = entry
            .path()
            .strip_prefix(local)
            .context("Failed to strip prefix")?;
        // Keys always use forward slashes
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !filter.matches(&relative) {
            debug!("Skipping {} (filtered)", relative);
            continue;
        }
        requests.push(TransferRequest::upload(
            entry.path(),
            &dest.bucket,
            dest.join(&relative),
        ));
    }
    Ok(requests)
}

async fn download_requests(
    s3_client: &S3Client,
    src: &CosUri,
    local: &Path,
    recursive: bool,
    filter: &NameFilter,
) -> Result<Vec<TransferRequest>> {
    if !recursive {
        let name = src
            .key
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .with_context(|| format!("cos://{}/{} names no object", src.bucket, src.key))?;
        let target = if local.is_dir() {
            local.join(name)
        } else {
            local.to_path_buf()
        };
        return Ok(vec![TransferRequest::download(&src.bucket, &src.key, target)]);
    }

    let prefix = if src.key.is_empty() || src.key.ends_with('/') {
        src.key.clone()
    } else {
        format!("{}/", src.key)
    };
    let objects = s3_client.list_objects(&src.bucket, &prefix).await?;
    let listed: u64 = objects.iter().map(|o| o.size).sum();
    debug!("{} objects, {} listed", objects.len(), format_size(listed));

    let mut requests = Vec::new();
    for object in objects {
        let relative = &object.key[prefix.len()..];
        let Some(target) = local_target(local, relative) else {
            warn!(
                "Skipping cos://{}/{}: key does not map to a path below {}",
                src.bucket,
                object.key,
                local.display()
            );
            continue;
        };
        if !filter.matches(relative) {
            debug!("Skipping {} (filtered)", relative);
            continue;
        }
        requests.push(TransferRequest::download(&src.bucket, &object.key, target));
    }
    Ok(requests)
}

/// Local path for a listed key relative to the download root, or `None` if
/// the key would land outside it (absolute, `..`, or empty segments)
fn local_target(local: &Path, relative: &str) -> Option<PathBuf> {
    if relative.is_empty() || relative.starts_with('/') || relative.contains('\\') {
        return None;
    }
    let mut target = local.to_path_buf();
    for segment in relative.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        target.push(segment);
    }
    Some(target)
}

/// Draw one bar for the whole run from progress events
fn spawn_progress_bar(mut events: UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);

        while let Some(event) = events.recv().await {
            // A zero total means the size is not known yet
            if event.bytes_total > 0 {
                pb.set_length(event.bytes_total);
            }
            pb.set_position(event.bytes_done);
        }
        pb.finish_and_clear();
    })
}

struct Summary {
    direction: Direction,
    files: usize,
    started: Instant,
    local_paths: Vec<PathBuf>,
}

impl Summary {
    fn new(requests: &[TransferRequest]) -> Self {
        Self {
            direction: requests
                .first()
                .map(|r| r.direction)
                .unwrap_or(Direction::Upload),
            files: requests.len(),
            started: Instant::now(),
            local_paths: requests.iter().map(|r| r.local_path.clone()).collect(),
        }
    }

    fn print(&self) {
        let duration = self.started.elapsed();
        let total_bytes: u64 = self
            .local_paths
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        println!("\n{}", style("═".repeat(70)).dim());
        println!(
            "{} {}",
            style("✓").green(),
            style(format!("{} {} file(s)", past_tense(self.direction), self.files)).bold()
        );
        println!(
            "{}",
            style(format!("Total: {} ({} bytes)", format_size(total_bytes), total_bytes)).dim()
        );
        if duration.as_secs_f64() > 0.0 {
            let speed = total_bytes as f64 / duration.as_secs_f64() / 1024.0 / 1024.0;
            println!(
                "{}",
                style(format!(
                    "Time: {:.2}s, Average speed: {:.2} MB/s",
                    duration.as_secs_f64(),
                    speed
                ))
                .dim()
            );
        }
    }
}

fn past_tense(direction: Direction) -> &'static str {
    match direction {
        Direction::Upload => "Uploaded",
        Direction::Download => "Downloaded",
    }
}

async fn report_failure(engine: &TransferEngine, requests: &[TransferRequest], error: &TransferError) {
    eprintln!("{} {}", style("✗").red(), style(error.user_message()).red());

    // Which request failed: the one named by the error, or the only one
    let failed = match error {
        TransferError::FileFailed { path, .. } => requests.iter().find(|r| &r.local_path == path),
        _ => requests.first().filter(|_| requests.len() == 1),
    };
    let Some(request) = failed.filter(|r| r.direction == Direction::Download) else {
        return;
    };

    match engine.resume_state(request).await {
        Ok(state) if state.is_resumable() => {
            if let Some(checkpoint) = state.checkpoint {
                eprintln!(
                    "  {} {} of {} saved; re-run the same command to resume",
                    style("↻").yellow(),
                    format_size(checkpoint.offset),
                    format_size(checkpoint.total_size)
                );
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Could not inspect checkpoint: {}", e),
    }
}

/// Format file size for display
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
