use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::events::TaskEvent;
use crate::online::NetworkMonitor;
use crate::probe;
use crate::stats::DownloadStats;
use crate::status::TaskState;
use crate::store::{ChunkStore, TaskMeta};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

pub const TARGET_CHUNKS: u64 = 50;
pub const MIN_CHUNK_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_CHUNK_BYTES: u64 = 100 * 1024 * 1024;

/// Chunk length for a resource of `total_bytes`, fixed once committed to
/// metadata. Unknown sizes fall back to the minimum.
pub fn calculate_chunk_size(total_bytes: u64) -> u64 {
    if total_bytes == 0 {
        return MIN_CHUNK_BYTES;
    }
    total_bytes
        .div_ceil(TARGET_CHUNKS)
        .clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES)
}

/// Inclusive byte range covered by chunk `index`. With an unknown total the
/// end is speculative; the server clamps it.
fn chunk_range(index: u32, chunk_size: u64, total_bytes: u64) -> (u64, u64) {
    let start = index as u64 * chunk_size;
    let end = if total_bytes > 0 {
        (start + chunk_size).min(total_bytes) - 1
    } else {
        start + chunk_size - 1
    };
    (start, end)
}

enum ChunkOutcome {
    /// Chunk committed to the store; loop continues.
    Committed,
    /// Pause or cancel observed mid-request; partial bytes discarded.
    Interrupted,
    /// The whole resource arrived in one response; go straight to assembly.
    AssembleNow,
}

/// Per-resource download engine.
///
/// Owns one in-flight HTTP request at a time. Discovers server
/// capabilities, splits the resource into chunks, writes each to the chunk
/// store, retries transient failures with exponential backoff, and
/// assembles the final artifact once all bytes are committed. Progress is
/// persisted after every chunk so a process restart resumes from the store.
pub struct DownloadTask {
    pub id: u32,
    pub url: String,
    pub file_name: String,
    pub state: Mutex<TaskState>,
    pub config: Arc<DownloadConfig>,
    pub store: Arc<dyn ChunkStore>,
    pub monitor: Arc<dyn NetworkMonitor>,
    pub client: Arc<reqwest::Client>,
    pub stats: Arc<DownloadStats>,

    total_bytes: AtomicU64,
    downloaded_bytes: AtomicU64,
    chunk_size: AtomicU64,
    chunk_index: AtomicU32,
    retry_count: AtomicU32,
    supports_resume: AtomicBool,
    paused: AtomicBool,
    canceled: AtomicBool,
    last_progress: AtomicU64,

    event_tx: broadcast::Sender<TaskEvent>,
}

impl DownloadTask {
    pub fn new(
        id: u32,
        url: String,
        file_name: String,
        config: Arc<DownloadConfig>,
        store: Arc<dyn ChunkStore>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Result<Arc<Self>, DownloadError> {
        let (event_tx, _) = broadcast::channel(256);

        let client = Arc::new(
            reqwest::Client::builder()
                .connect_timeout(config.connect_timeout)
                .timeout(config.request_timeout)
                .pool_max_idle_per_host(50)
                .pool_idle_timeout(Duration::from_secs(60))
                .build()
                .map_err(|e| DownloadError::Other(format!("Failed to build HTTP client: {}", e)))?,
        );

        Ok(Arc::new(Self {
            id,
            url,
            file_name,
            state: Mutex::new(TaskState::Idle),
            config,
            store,
            monitor,
            client,
            stats: Arc::new(DownloadStats::new()),
            total_bytes: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            chunk_size: AtomicU64::new(0),
            chunk_index: AtomicU32::new(0),
            retry_count: AtomicU32::new(0),
            supports_resume: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            last_progress: AtomicU64::new(0),
            event_tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    pub async fn state(&self) -> TaskState {
        *self.state.lock().await
    }

    pub fn loaded(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Begins or retries the download. No-op unless the task is `Idle` or
    /// `Error`. Resumes from stored metadata when a record exists for the
    /// url; otherwise runs capability discovery first.
    pub async fn start(self: &Arc<Self>) -> Result<(), DownloadError> {
        {
            let state = self.state.lock().await;
            if !matches!(*state, TaskState::Idle | TaskState::Error) {
                debug!("[Task {}] start() ignored in state {}", self.id, *state);
                return Ok(());
            }
        }
        self.paused.store(false, Ordering::Relaxed);
        self.canceled.store(false, Ordering::Relaxed);
        let _ = self.event_tx.send(TaskEvent::Start { id: self.id });

        if let Err(e) = self.prepare().await {
            return self.fail(e).await;
        }
        if let Err(e) = self.chunk_loop().await {
            return self.fail(e).await;
        }
        Ok(())
    }

    /// Aborts the in-flight request without losing committed progress.
    /// No-op unless downloading.
    pub async fn pause(&self) {
        {
            let mut state = self.state.lock().await;
            if *state != TaskState::Downloading {
                debug!("[Task {}] pause() ignored in state {}", self.id, *state);
                return;
            }
            *state = TaskState::Paused;
        }
        self.paused.store(true, Ordering::Relaxed);
        info!("[Task {}] paused", self.id);
        let _ = self.event_tx.send(TaskEvent::StateChange {
            id: self.id,
            state: TaskState::Paused,
        });
        let _ = self.event_tx.send(TaskEvent::Pause { id: self.id });
    }

    /// Continues a paused download, driving the next chunk. No-op unless
    /// paused.
    pub async fn resume(self: &Arc<Self>) -> Result<(), DownloadError> {
        {
            let mut state = self.state.lock().await;
            if *state != TaskState::Paused {
                debug!("[Task {}] resume() ignored in state {}", self.id, *state);
                return Ok(());
            }
            *state = TaskState::Downloading;
        }
        self.paused.store(false, Ordering::Relaxed);
        info!("[Task {}] resumed", self.id);
        let _ = self.event_tx.send(TaskEvent::StateChange {
            id: self.id,
            state: TaskState::Downloading,
        });
        let _ = self.event_tx.send(TaskEvent::Resume { id: self.id });

        if let Err(e) = self.chunk_loop().await {
            return self.fail(e).await;
        }
        Ok(())
    }

    /// Cancels from any non-terminal state, aborts the in-flight request
    /// and purges the task's store entries.
    pub async fn cancel(&self) -> Result<(), DownloadError> {
        {
            let mut state = self.state.lock().await;
            if state.is_terminal() {
                debug!("[Task {}] cancel() ignored in state {}", self.id, *state);
                return Ok(());
            }
            *state = TaskState::Canceled;
        }
        self.canceled.store(true, Ordering::Relaxed);
        info!("[Task {}] canceled", self.id);
        let _ = self.event_tx.send(TaskEvent::StateChange {
            id: self.id,
            state: TaskState::Canceled,
        });
        let _ = self.event_tx.send(TaskEvent::Cancel { id: self.id });

        self.purge().await
    }

    /// Scheduler-facing reset: moves a paused task back to `Idle` so a
    /// re-added task resumes through the normal `start()` metadata path.
    /// The store is untouched. Returns false if the task was not paused.
    pub(crate) async fn requeue(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if *state != TaskState::Paused {
                return false;
            }
            *state = TaskState::Idle;
        }
        self.paused.store(false, Ordering::Relaxed);
        let _ = self.event_tx.send(TaskEvent::StateChange {
            id: self.id,
            state: TaskState::Idle,
        });
        true
    }

    async fn set_state(&self, state: TaskState) {
        *self.state.lock().await = state;
        let _ = self.event_tx.send(TaskEvent::StateChange { id: self.id, state });
    }

    /// Terminal failure: records it, transitions to `Error` and emits the
    /// error event last. Errors racing a pause or cancel are dropped; the
    /// aborted request must be a no-op.
    async fn fail(&self, err: DownloadError) -> Result<(), DownloadError> {
        if self.canceled.load(Ordering::Relaxed) {
            debug!("[Task {}] late error after cancel: {}", self.id, err);
            return Ok(());
        }
        {
            let state = self.state.lock().await;
            if *state == TaskState::Paused {
                debug!("[Task {}] late error after pause: {}", self.id, err);
                return Ok(());
            }
        }
        self.stats.record_failure();
        error!("[Task {}] {}", self.id, err);
        self.set_state(TaskState::Error).await;
        let _ = self.event_tx.send(TaskEvent::Error {
            id: self.id,
            error: err.clone(),
        });
        Err(err)
    }

    /// Start protocol: seed counters from stored metadata when present,
    /// otherwise run capability discovery and pick a chunk size.
    async fn prepare(self: &Arc<Self>) -> Result<(), DownloadError> {
        self.retry_count.store(0, Ordering::Relaxed);

        if let Some(meta) = self.store.get_metadata(&self.url).await? {
            info!(
                "[Task {}] resuming {} at {}/{} bytes (chunk {})",
                self.id,
                self.url,
                meta.downloaded_bytes,
                meta.total_bytes,
                meta.resume_index()
            );
            self.total_bytes.store(meta.total_bytes, Ordering::Relaxed);
            self.downloaded_bytes
                .store(meta.downloaded_bytes, Ordering::Relaxed);
            self.supports_resume
                .store(meta.supports_resume, Ordering::Relaxed);
            self.chunk_size.store(meta.chunk_size, Ordering::Relaxed);
            self.chunk_index.store(meta.resume_index(), Ordering::Relaxed);
            self.last_progress
                .store(meta.downloaded_bytes, Ordering::Relaxed);
            self.set_state(TaskState::Downloading).await;
            self.emit_progress(meta.downloaded_bytes);
            return Ok(());
        }

        self.set_state(TaskState::FetchingMetadata).await;
        match probe::discover(&self.client, &self.url).await {
            Ok(caps) => {
                self.total_bytes.store(caps.total_bytes, Ordering::Relaxed);
                self.supports_resume
                    .store(caps.supports_resume, Ordering::Relaxed);
            }
            Err(e) => {
                // Degraded mode: the first ranged GET may still reveal the
                // total via Content-Range.
                warn!(
                    "[Task {}] capability discovery failed ({}), proceeding with unknown size",
                    self.id, e
                );
                self.total_bytes.store(0, Ordering::Relaxed);
                self.supports_resume.store(true, Ordering::Relaxed);
            }
        }
        if self.canceled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.downloaded_bytes.store(0, Ordering::Relaxed);
        self.chunk_index.store(0, Ordering::Relaxed);
        self.last_progress.store(0, Ordering::Relaxed);
        self.chunk_size.store(
            calculate_chunk_size(self.total_bytes.load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );
        self.set_state(TaskState::Downloading).await;
        Ok(())
    }

    /// One chunk per iteration, in strictly ascending index order; the next
    /// request does not begin until the previous chunk is committed.
    async fn chunk_loop(self: &Arc<Self>) -> Result<(), DownloadError> {
        loop {
            if self.canceled.load(Ordering::Relaxed)
                || self.state().await != TaskState::Downloading
            {
                return Ok(());
            }

            if !self.monitor.is_online() {
                warn!("[Task {}] network lost, pausing", self.id);
                let _ = self.event_tx.send(TaskEvent::NetworkLost { id: self.id });
                self.pause().await;
                return Ok(());
            }

            let total = self.total_bytes.load(Ordering::Relaxed);
            let downloaded = self.downloaded_bytes.load(Ordering::Relaxed);
            if total > 0 && downloaded >= total {
                return self.assemble().await;
            }

            match self.fetch_chunk().await {
                Ok(ChunkOutcome::Committed) => {
                    self.retry_count.store(0, Ordering::Relaxed);
                }
                Ok(ChunkOutcome::Interrupted) => return Ok(()),
                Ok(ChunkOutcome::AssembleNow) => return self.assemble().await,
                Err(e) if e.is_retryable() => {
                    let attempt = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if attempt > self.config.retry.max_retries {
                        return Err(e);
                    }
                    self.stats.record_retry();
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        "[Task {}] retryable error ({}), retry {}/{} in {:?}",
                        self.id, e, attempt, self.config.retry.max_retries, delay
                    );
                    // A pause or cancel arriving during the backoff window
                    // pre-empts the retry at the top of the loop.
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issues the GET for the current chunk and commits the body.
    async fn fetch_chunk(self: &Arc<Self>) -> Result<ChunkOutcome, DownloadError> {
        let chunk_size = self.chunk_size.load(Ordering::Relaxed);
        let index = self.chunk_index.load(Ordering::Relaxed);
        let total = self.total_bytes.load(Ordering::Relaxed);
        let (start, end) = chunk_range(index, chunk_size, total);
        let supports_resume = self.supports_resume.load(Ordering::Relaxed);

        if !supports_resume && start > 0 {
            return Err(DownloadError::UnsupportedServer);
        }

        let busted = probe::cache_busted(&self.url)?;
        let mut request = self.client.get(&busted);
        if supports_resume {
            request = request.header(RANGE, format!("bytes={}-{}", start, end));
        }
        debug!(
            "[Task {}] GET chunk {} (bytes {}-{})",
            self.id, index, start, end
        );

        let resp = request.send().await?;
        let status = resp.status();

        if status.as_u16() >= 500 {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                text: status.to_string(),
            });
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                text: status.to_string(),
            });
        }

        if status == StatusCode::OK {
            // Either the server never supported ranges, or it silently
            // ignored ours and served the whole file.
            let progress_base = if start == 0 { Some(0) } else { None };
            let body = match self.read_body(resp, progress_base).await? {
                Some(b) => b,
                None => return Ok(ChunkOutcome::Interrupted),
            };
            let len = body.len() as u64;

            if start > 0 {
                warn!(
                    "[Task {}] server ignored range at offset {}, restarting as single chunk",
                    self.id, start
                );
                self.supports_resume.store(false, Ordering::Relaxed);
                self.store.delete_chunks(&self.url).await?;
                self.total_bytes.store(len, Ordering::Relaxed);
                self.chunk_index.store(0, Ordering::Relaxed);
            } else if total == 0 {
                self.total_bytes.store(len, Ordering::Relaxed);
            }

            self.store.put_chunk(&self.url, 0, &body).await?;
            self.downloaded_bytes.store(len, Ordering::Relaxed);
            self.persist_meta().await?;
            self.stats.record_bytes(len);
            self.emit_progress(len);
            return Ok(ChunkOutcome::AssembleNow);
        }

        // 206: the expected path.
        if total == 0 {
            let parsed = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(probe::parse_content_range_total);
            match parsed {
                Some(t) if t > 0 => self.total_bytes.store(t, Ordering::Relaxed),
                _ => return Err(DownloadError::UnsupportedServer),
            }
        }
        let total = self.total_bytes.load(Ordering::Relaxed);
        let expected = (start + chunk_size).min(total).saturating_sub(start);

        let body = match self.read_body(resp, Some(start)).await? {
            Some(b) => b,
            None => return Ok(ChunkOutcome::Interrupted),
        };
        if body.len() as u64 != expected {
            return Err(DownloadError::Network(format!(
                "truncated chunk {}: got {} of {} bytes",
                index,
                body.len(),
                expected
            )));
        }

        if self.canceled.load(Ordering::Relaxed) {
            return Ok(ChunkOutcome::Interrupted);
        }
        self.store.put_chunk(&self.url, index, &body).await?;
        let downloaded =
            self.downloaded_bytes.fetch_add(expected, Ordering::Relaxed) + expected;
        self.chunk_index.store(index + 1, Ordering::Relaxed);
        self.persist_meta().await?;
        self.stats.record_bytes(expected);
        debug!(
            "[Task {}] committed chunk {} ({}/{} bytes)",
            self.id, index, downloaded, total
        );
        self.emit_progress(downloaded);
        Ok(ChunkOutcome::Committed)
    }

    /// Streams a response body, honoring pause/cancel between frames and
    /// throttling progress emissions. Returns `None` when interrupted; the
    /// partial bytes are discarded without loss of committed progress.
    async fn read_body(
        &self,
        resp: reqwest::Response,
        progress_base: Option<u64>,
    ) -> Result<Option<Bytes>, DownloadError> {
        let throttle = &self.config.progress_throttle;
        let emit_interval = Duration::from_millis(throttle.interval_ms);
        let mut last_emit = tokio::time::Instant::now();
        let mut last_reported = 0u64;

        let mut buf = BytesMut::new();
        let mut stream = resp.bytes_stream();
        while let Some(piece) = stream.next().await {
            if self.canceled.load(Ordering::Relaxed) || self.paused.load(Ordering::Relaxed) {
                debug!("[Task {}] request aborted mid-body", self.id);
                return Ok(None);
            }
            let piece = piece?;
            buf.extend_from_slice(&piece);

            if let Some(base) = progress_base {
                let received = buf.len() as u64;
                if received - last_reported >= throttle.threshold_bytes
                    || last_emit.elapsed() >= emit_interval
                {
                    self.emit_progress(base + received);
                    last_reported = received;
                    last_emit = tokio::time::Instant::now();
                }
            }
        }
        Ok(Some(buf.freeze()))
    }

    /// Suppressed while the total is unknown; clamped non-decreasing
    /// because a retried chunk restarts its byte count.
    fn emit_progress(&self, loaded: u64) {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return;
        }
        if loaded < self.last_progress.load(Ordering::Relaxed) {
            return;
        }
        self.last_progress.store(loaded, Ordering::Relaxed);
        let percent = loaded as f64 * 100.0 / total as f64;
        let _ = self.event_tx.send(TaskEvent::Progress {
            id: self.id,
            loaded,
            total,
            percent,
        });
    }

    async fn persist_meta(&self) -> Result<(), DownloadError> {
        // A commit racing cancel() must not resurrect purged entries.
        if self.canceled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let meta = TaskMeta {
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            supports_resume: self.supports_resume.load(Ordering::Relaxed),
            chunk_size: self.chunk_size.load(Ordering::Relaxed),
            created_at: None,
            updated_at: None,
        };
        self.store.put_metadata(&meta).await
    }

    async fn purge(&self) -> Result<(), DownloadError> {
        self.store.delete_metadata(&self.url).await?;
        self.store.delete_chunks(&self.url).await?;
        Ok(())
    }

    /// Verifies density and size, concatenates the chunks, writes the
    /// artifact and purges the store entries.
    async fn assemble(self: &Arc<Self>) -> Result<(), DownloadError> {
        self.set_state(TaskState::Assembling).await;
        info!("[Task {}] assembling {}", self.id, self.file_name);

        let chunks = self.store.list_chunks(&self.url).await?;
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.index != i as u32 {
                self.purge().await?;
                return Err(DownloadError::Assembly(format!("missing chunk at {}", i)));
            }
        }

        let total = self.total_bytes.load(Ordering::Relaxed);
        let mut artifact = Vec::with_capacity(total as usize);
        for chunk in &chunks {
            artifact.extend_from_slice(&chunk.data);
        }

        if total > 0 && artifact.len() as u64 != total {
            self.purge().await?;
            return Err(DownloadError::Assembly("size mismatch".into()));
        }

        let path = self.config.download_dir.join(&self.file_name);
        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        tokio::fs::write(&path, &artifact).await?;

        self.purge().await?;
        self.stats.record_success();
        self.set_state(TaskState::Completed).await;
        info!(
            "[Task {}] completed: {} ({} bytes)",
            self.id,
            path.display(),
            artifact.len()
        );
        let _ = self.event_tx.send(TaskEvent::Complete {
            id: self.id,
            path,
            bytes: artifact.len() as u64,
        });
        Ok(())
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("file_name", &self.file_name)
            .field("total_bytes", &self.total_bytes)
            .field("downloaded_bytes", &self.downloaded_bytes)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_index", &self.chunk_index)
            .field("supports_resume", &self.supports_resume)
            .finish()
    }
}
