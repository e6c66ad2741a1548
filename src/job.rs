use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::events::{JobEvent, TaskEvent};
use crate::online::NetworkMonitor;
use crate::store::ChunkStore;
use crate::task::DownloadTask;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Aggregates a fixed set of tasks into combined progress and completion.
///
/// The job owns its tasks and forwards their lifecycle events upward; it
/// never drives them. Starting, pausing and canceling go through the
/// scheduler or the tasks' own public surface.
pub struct DownloadJob {
    pub tasks: Vec<Arc<DownloadTask>>,
    progress: DashMap<u32, (u64, u64)>,
    completed: AtomicUsize,
    errored: AtomicUsize,
    finished: AtomicBool,
    event_tx: broadcast::Sender<JobEvent>,
}

impl DownloadJob {
    /// Materializes one task per `(url, filename)` pair. The arrays must be
    /// parallel and non-empty.
    pub fn new(
        urls: Vec<String>,
        filenames: Vec<String>,
        config: Arc<DownloadConfig>,
        store: Arc<dyn ChunkStore>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Result<Arc<Self>, DownloadError> {
        if urls.len() != filenames.len() {
            return Err(DownloadError::ConfigError(format!(
                "urls and filenames must be parallel arrays (got {} and {})",
                urls.len(),
                filenames.len()
            )));
        }
        if urls.is_empty() {
            return Err(DownloadError::ConfigError("no download URLs provided".into()));
        }

        let mut tasks = Vec::with_capacity(urls.len());
        for (i, (url, file_name)) in urls.into_iter().zip(filenames).enumerate() {
            tasks.push(DownloadTask::new(
                i as u32 + 1,
                url,
                file_name,
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&monitor),
            )?);
        }

        let (event_tx, _) = broadcast::channel(256);
        let job = Arc::new(Self {
            tasks,
            progress: DashMap::new(),
            completed: AtomicUsize::new(0),
            errored: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            event_tx,
        });

        for task in &job.tasks {
            job.progress.insert(task.id, (0, 0));
            job.attach(task);
        }

        Ok(job)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn get_task(&self, id: u32) -> Option<Arc<DownloadTask>> {
        self.tasks.iter().find(|t| t.id == id).cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.completed.load(Ordering::Relaxed) + self.errored.load(Ordering::Relaxed)
            >= self.tasks.len()
    }

    pub fn loaded(&self) -> u64 {
        self.progress.iter().map(|e| e.value().0).sum()
    }

    pub fn total(&self) -> u64 {
        self.progress.iter().map(|e| e.value().1).sum()
    }

    /// Resolves when every task has reached `Complete` or `Error`.
    pub async fn wait(self: &Arc<Self>) {
        let mut rx = self.subscribe();
        while !self.is_finished() {
            match rx.recv().await {
                Ok(JobEvent::Complete) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Forwards one task's events into the job-level stream.
    fn attach(self: &Arc<Self>, task: &Arc<DownloadTask>) {
        let mut rx = task.subscribe();
        let job = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("[Job] listener lagged, skipped {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(job) = job.upgrade() else { break };

                match event {
                    TaskEvent::Progress {
                        id, loaded, total, ..
                    } => {
                        job.progress.insert(id, (loaded, total));
                        job.emit_progress();
                        let _ = job
                            .event_tx
                            .send(JobEvent::TaskProgress { id, loaded, total });
                    }
                    TaskEvent::Complete { id, path, bytes } => {
                        job.progress.insert(id, (bytes, bytes));
                        job.completed.fetch_add(1, Ordering::Relaxed);
                        job.emit_progress();
                        let _ = job.event_tx.send(JobEvent::TaskComplete { id, path });
                        job.check_finished();
                    }
                    TaskEvent::Error { id, error } => {
                        job.errored.fetch_add(1, Ordering::Relaxed);
                        let _ = job.event_tx.send(JobEvent::TaskError { id, error });
                        job.check_finished();
                    }
                    _ => {}
                }
            }
        });
    }

    fn emit_progress(&self) {
        let loaded = self.loaded();
        let total = self.total();
        let percent = if total > 0 {
            loaded as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        let _ = self.event_tx.send(JobEvent::Progress {
            loaded,
            total,
            percent,
        });
    }

    fn check_finished(&self) {
        if self.is_finished() && !self.finished.swap(true, Ordering::Relaxed) {
            debug!(
                "[Job] finished: {} completed, {} errored",
                self.completed.load(Ordering::Relaxed),
                self.errored.load(Ordering::Relaxed)
            );
            let _ = self.event_tx.send(JobEvent::Complete);
        }
    }
}
