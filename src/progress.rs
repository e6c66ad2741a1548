use crate::config::ProgressThrottleConfig;
use crate::events::JobEvent;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TaskBar {
    bar: ProgressBar,
    last_draw: Instant,
    last_drawn_bytes: u64,
}

/// Terminal renderer for a job: one bar per task, fed by folding job
/// events through `apply`. Display only; the engine never touches this.
///
/// Redraws are throttled with the same interval/threshold the engine uses
/// for progress emission, so a lowered threshold in config speeds up both.
pub struct JobProgressDisplay {
    multi: MultiProgress,
    bars: Mutex<HashMap<u32, TaskBar>>,
    interval: Duration,
    threshold_bytes: u64,
}

impl JobProgressDisplay {
    pub fn new(throttle: &ProgressThrottleConfig) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            interval: Duration::from_millis(throttle.interval_ms),
            threshold_bytes: throttle.threshold_bytes,
        }
    }

    /// Adds a bar for a task before its first event arrives. The length is
    /// unknown until the first progress report sets it.
    pub fn register(&self, task_id: u32, name: &str) {
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>24} [{bar:40.green/white}] {bytes}/{total_bytes} {bytes_per_sec} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_prefix(name.to_string());
        self.bars.lock().unwrap().insert(
            task_id,
            TaskBar {
                bar,
                last_draw: Instant::now(),
                last_drawn_bytes: 0,
            },
        );
    }

    pub fn apply(&self, event: &JobEvent) {
        match event {
            JobEvent::TaskProgress { id, loaded, total } => {
                let mut bars = self.bars.lock().unwrap();
                let Some(entry) = bars.get_mut(id) else { return };
                let due = entry.last_draw.elapsed() >= self.interval
                    || loaded.saturating_sub(entry.last_drawn_bytes) >= self.threshold_bytes;
                if !due {
                    return;
                }
                if *total > 0 {
                    entry.bar.set_length(*total);
                }
                entry.bar.set_position(*loaded);
                entry.last_draw = Instant::now();
                entry.last_drawn_bytes = *loaded;
            }
            JobEvent::TaskComplete { id, path } => {
                if let Some(entry) = self.bars.lock().unwrap().get(id) {
                    let len = entry.bar.length().unwrap_or(0);
                    entry.bar.set_position(len);
                    entry.bar.finish_with_message(format!(
                        "saved to {} ({})",
                        path.display(),
                        bytesize::to_string(len, true)
                    ));
                }
            }
            JobEvent::TaskError { id, error } => {
                if let Some(entry) = self.bars.lock().unwrap().get(id) {
                    entry.bar.abandon_with_message(format!("failed: {}", error));
                }
            }
            JobEvent::Progress { .. } | JobEvent::Complete => {}
        }
    }

    /// Prints a line above the bars without tearing them.
    pub fn println(&self, msg: &str) {
        let _ = self.multi.println(msg);
    }
}
