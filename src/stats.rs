use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DownloadStatsSnapshot {
    pub total_bytes: u64,
    pub average_speed_bps: u64,
    pub elapsed: f64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub retry_count: u64,
}

/// Transfer counters fed by the chunk loop.
pub struct DownloadStats {
    pub created_at: SystemTime,
    started_at: Mutex<Option<Instant>>,
    total_bytes: AtomicU64,
    successful_downloads: AtomicU64,
    failed_downloads: AtomicU64,
    retry_count: AtomicU64,
}

impl Default for DownloadStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadStats {
    pub fn new() -> Self {
        Self {
            created_at: SystemTime::now(),
            started_at: Mutex::new(None),
            total_bytes: AtomicU64::new(0),
            successful_downloads: AtomicU64::new(0),
            failed_downloads: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self) {
        self.successful_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        let mut started = self.started_at.lock().unwrap();
        if started.is_none() {
            *started = Some(Instant::now());
        }
        drop(started);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DownloadStatsSnapshot {
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let elapsed = match *self.started_at.lock().unwrap() {
            Some(t) => t.elapsed().as_secs_f64().max(0.001),
            None => 0.0,
        };
        let average_speed_bps = if elapsed > 0.0 {
            (total_bytes as f64 / elapsed) as u64
        } else {
            0
        };

        DownloadStatsSnapshot {
            total_bytes,
            average_speed_bps,
            elapsed,
            successful_downloads: self.successful_downloads.load(Ordering::Relaxed),
            failed_downloads: self.failed_downloads.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
        }
    }

    pub fn debug_summary(&self) -> String {
        format!(
            "Stats: total={} | success={} | failed={} | retries={}",
            format_bytes(self.total_bytes.load(Ordering::Relaxed)),
            self.successful_downloads.load(Ordering::Relaxed),
            self.failed_downloads.load(Ordering::Relaxed),
            self.retry_count.load(Ordering::Relaxed)
        )
    }
}

/// Formats a byte count as B / KB / MB / GB.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = DownloadStats::new();
        stats.record_bytes(1000);
        stats.record_bytes(500);
        stats.record_retry();
        stats.record_success();

        let snap = stats.snapshot();
        assert_eq!(snap.total_bytes, 1500);
        assert_eq!(snap.retry_count, 1);
        assert_eq!(snap.successful_downloads, 1);
        assert_eq!(snap.failed_downloads, 0);
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
    }
}
