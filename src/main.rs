use chunkdown::config::{DownloadConfig, DownloadConfigBuilder};
use chunkdown::error::DownloadError;
use chunkdown::job::DownloadJob;
use chunkdown::online::AlwaysOnline;
use chunkdown::progress::JobProgressDisplay;
use chunkdown::scheduler::Scheduler;
use chunkdown::store::{StoreType, open_store};
use clap::Parser;
use log::{LevelFilter, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Notify;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "chunkdown")]
#[command(about = "A resilient chunked download tool", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, value_name = "DIR", default_value = "downloads")]
    download_dir: PathBuf,

    #[arg(short = 'j', long, default_value_t = 2)]
    concurrency: usize,

    /// Wipe the chunk store before starting.
    #[arg(long)]
    fresh: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short = 'u', long = "urls", value_name = "URLS", num_args = 1.., required = true)]
    urls: Vec<String>,

    /// Destination filenames, parallel to --urls. Derived from the URL
    /// path when omitted.
    #[arg(long = "names", value_name = "NAMES", num_args = 1..)]
    names: Vec<String>,
}

fn derive_file_name(url: &str, id: u32) -> String {
    if let Ok(parsed) = Url::parse(url) {
        parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("download_{}.tmp", id))
    } else {
        format!("download_{}.tmp", id)
    }
}

#[tokio::main]
async fn main() -> Result<(), DownloadError> {
    let cli = Cli::parse();
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .filter_module("sqlx::query", LevelFilter::Info)
        .init();

    let config = match cli.config {
        Some(path) => DownloadConfig::from_file(&path)?,
        None => DownloadConfigBuilder::new()
            .download_dir(cli.download_dir.clone())
            .concurrency(cli.concurrency)
            .store(StoreType::Sqlite(
                cli.download_dir.join("downloads.db").display().to_string(),
            ))
            .build()?,
    };

    info!("Download directory: {}", config.download_dir.display());
    info!("Concurrency: {}", config.concurrency);

    let store = open_store(&config.store).await?;
    if cli.fresh {
        info!("Wiping chunk store");
        store.reset().await?;
    }

    let names: Vec<String> = if cli.names.is_empty() {
        cli.urls
            .iter()
            .enumerate()
            .map(|(i, url)| derive_file_name(url, i as u32 + 1))
            .collect()
    } else if cli.names.len() == cli.urls.len() {
        cli.names.clone()
    } else {
        return Err(DownloadError::ConfigError(format!(
            "--names must match --urls ({} vs {})",
            cli.names.len(),
            cli.urls.len()
        )));
    };

    let config = Arc::new(config);
    let job = DownloadJob::new(
        cli.urls.clone(),
        names,
        Arc::clone(&config),
        store,
        Arc::new(AlwaysOnline),
    )?;

    let display = Arc::new(JobProgressDisplay::new(&config.progress_throttle));
    for task in &job.tasks {
        display.register(task.id, &task.file_name);
    }

    // Fold job events into the progress display.
    {
        let mut rx = job.subscribe();
        let display = Arc::clone(&display);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => display.apply(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let scheduler = Scheduler::new(config.concurrency);
    for task in &job.tasks {
        scheduler.add(Arc::clone(task)).await?;
    }
    scheduler.start().await;

    // Stdin commands drive the scheduler, never the tasks directly.
    // `cancel` clears the pool and ends the run.
    let shutdown = Arc::new(Notify::new());
    {
        let scheduler = Arc::clone(&scheduler);
        let job = Arc::clone(&job);
        let display = Arc::clone(&display);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.trim().to_lowercase().as_str() {
                    "pause" => {
                        scheduler.pause().await;
                        display.println("paused; type resume to continue");
                    }
                    "resume" => {
                        for task in &job.tasks {
                            if let Err(e) = scheduler.resume_job(task).await {
                                warn!("Failed to resume task {}: {}", task.id, e);
                            }
                        }
                        scheduler.start().await;
                    }
                    "cancel" => {
                        scheduler.clear().await;
                        shutdown.notify_one();
                    }
                    "" => {}
                    other => {
                        display.println(&format!(
                            "Unknown command: {} (try pause/resume/cancel)",
                            other
                        ));
                    }
                }
            }
        });
    }

    tokio::select! {
        _ = job.wait() => {}
        _ = shutdown.notified() => {}
    }

    for task in &job.tasks {
        let snap = task.stats.snapshot();
        info!(
            "[Task {}] {} in {} ({}/s), {} retries",
            task.id,
            bytesize::to_string(snap.total_bytes, true),
            humantime::format_duration(Duration::from_secs(snap.elapsed as u64)),
            bytesize::to_string(snap.average_speed_bps, true),
            snap.retry_count
        );
    }
    info!("Download process finished");
    Ok(())
}
