use crate::error::DownloadError;
use crate::events::TaskEvent;
use crate::status::TaskState;
use crate::task::DownloadTask;
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Bounded-concurrency runner driving a set of tasks.
///
/// Holds a FIFO waiting queue and an insertion-ordered active set; the
/// scheduler is the only component that transitions a task from idle to
/// running. Dispatch is serial: the `processing` guard admits one pass at a
/// time and `pending_run` records dispatch requests that arrive meanwhile.
pub struct Scheduler {
    concurrency: usize,
    queue: Mutex<VecDeque<Arc<DownloadTask>>>,
    active: Mutex<Vec<Arc<DownloadTask>>>,
    running: AtomicBool,
    processing: AtomicBool,
    pending_run: AtomicBool,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            concurrency: concurrency.max(1),
            queue: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            pending_run: AtomicBool::new(false),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn active_len(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Enqueues a task. Rejects tasks already queued or active, and tasks
    /// in a terminal state.
    pub async fn add(self: &Arc<Self>, task: Arc<DownloadTask>) -> Result<(), DownloadError> {
        if task.state().await.is_terminal() {
            return Err(DownloadError::Other(format!(
                "task {} is already terminal",
                task.id
            )));
        }
        {
            let mut queue = self.queue.lock().await;
            let active = self.active.lock().await;
            if queue.iter().any(|t| t.id == task.id) || active.iter().any(|t| t.id == task.id) {
                return Err(DownloadError::Other(format!(
                    "task {} is already scheduled",
                    task.id
                )));
            }
            debug!("[Scheduler] queued task {}", task.id);
            queue.push_back(task);
        }
        if self.running.load(Ordering::Relaxed) {
            self.dispatch().await;
        }
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);
        info!("[Scheduler] started (concurrency {})", self.concurrency);
        self.dispatch().await;
    }

    /// Stops pulling new tasks and pauses the active ones, returning them
    /// to the head of the queue in their original priority order.
    pub async fn pause(self: &Arc<Self>) {
        self.running.store(false, Ordering::Relaxed);
        let drained: Vec<Arc<DownloadTask>> = {
            let mut active = self.active.lock().await;
            active.drain(..).collect()
        };
        info!("[Scheduler] pausing {} active task(s)", drained.len());
        for task in drained.into_iter().rev() {
            task.pause().await;
            self.queue.lock().await.push_front(task);
        }
    }

    /// Re-admits a paused task. A pause-freed slot is never auto-resumed;
    /// this call is the explicit re-entry point.
    pub async fn resume_job(
        self: &Arc<Self>,
        task: &Arc<DownloadTask>,
    ) -> Result<(), DownloadError> {
        if !task.requeue().await {
            debug!("[Scheduler] resume_job ignored for task {}", task.id);
            return Ok(());
        }
        let already_scheduled = {
            let queue = self.queue.lock().await;
            let active = self.active.lock().await;
            queue.iter().any(|t| t.id == task.id) || active.iter().any(|t| t.id == task.id)
        };
        if already_scheduled {
            if self.running.load(Ordering::Relaxed) {
                self.dispatch().await;
            }
            return Ok(());
        }
        self.add(Arc::clone(task)).await
    }

    /// Empties both collections and cancels every previously active task.
    pub async fn clear(self: &Arc<Self>) {
        self.running.store(false, Ordering::Relaxed);
        self.queue.lock().await.clear();
        let drained: Vec<Arc<DownloadTask>> = {
            let mut active = self.active.lock().await;
            active.drain(..).collect()
        };
        info!("[Scheduler] cleared, canceling {} active task(s)", drained.len());
        let results = join_all(drained.iter().map(|task| task.cancel())).await;
        for (task, result) in drained.iter().zip(results) {
            if let Err(e) = result {
                warn!("[Scheduler] failed to cancel task {}: {}", task.id, e);
            }
        }
    }

    /// Fills free slots from the queue. Reentrancy-safe: a call arriving
    /// while another is processing sets `pending_run` and returns; the
    /// processing call drains it on exit.
    pub async fn dispatch(self: &Arc<Self>) {
        if self.processing.swap(true, Ordering::SeqCst) {
            self.pending_run.store(true, Ordering::SeqCst);
            return;
        }
        loop {
            while self.running.load(Ordering::Relaxed) {
                if self.active.lock().await.len() >= self.concurrency {
                    break;
                }
                let Some(task) = self.queue.lock().await.pop_front() else {
                    break;
                };
                let state = task.state().await;
                if state.is_terminal() || state == TaskState::Paused {
                    debug!("[Scheduler] skipping task {} in state {}", task.id, state);
                    continue;
                }

                self.active.lock().await.push(Arc::clone(&task));
                self.attach_listener(&task);
                debug!("[Scheduler] activating task {}", task.id);
                let runner = Arc::clone(&task);
                tokio::spawn(async move {
                    if let Err(e) = runner.start().await {
                        debug!("[Scheduler] task {} ended with error: {}", runner.id, e);
                    }
                });
            }

            self.processing.store(false, Ordering::SeqCst);
            if !self.pending_run.swap(false, Ordering::SeqCst) {
                break;
            }
            if self.processing.swap(true, Ordering::SeqCst) {
                // Another dispatch took over; it will see any further work.
                break;
            }
        }
    }

    /// Listens for the events that free a slot. Detaches itself after the
    /// first one so a released task holds no scheduler reference.
    fn attach_listener(self: &Arc<Self>, task: &Arc<DownloadTask>) {
        let mut rx = task.subscribe();
        let scheduler = Arc::downgrade(self);
        let task_id = task.id;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(
                        TaskEvent::Complete { .. }
                        | TaskEvent::Error { .. }
                        | TaskEvent::Cancel { .. }
                        | TaskEvent::Pause { .. },
                    ) => {
                        if let Some(scheduler) = scheduler.upgrade() {
                            scheduler.release(task_id).await;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn release(self: &Arc<Self>, task_id: u32) {
        {
            let mut active = self.active.lock().await;
            active.retain(|t| t.id != task_id);
        }
        debug!("[Scheduler] slot freed by task {}", task_id);
        self.dispatch().await;
    }
}
