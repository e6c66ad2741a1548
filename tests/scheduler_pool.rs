//! Scheduler and job integration: the bounded pool, pause/resume of a whole
//! job, clear-with-cancel, and job-level event aggregation.

mod common;

use chunkdown::config::{DownloadConfig, DownloadConfigBuilder, ProgressThrottleConfig, RetryConfig};
use chunkdown::events::JobEvent;
use chunkdown::job::DownloadJob;
use chunkdown::online::AlwaysOnline;
use chunkdown::scheduler::Scheduler;
use chunkdown::status::TaskState;
use chunkdown::store::{ChunkStore, MemoryChunkStore, StoreType};
use common::range_server::{self, ServerOptions};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::timeout;

fn test_config(dir: &Path, concurrency: usize) -> Arc<DownloadConfig> {
    Arc::new(
        DownloadConfigBuilder::new()
            .download_dir(dir)
            .concurrency(concurrency)
            .retry(RetryConfig {
                max_retries: 3,
                initial_delay_ms: 20,
                backoff_factor: 2.0,
            })
            .progress_throttle(ProgressThrottleConfig {
                interval_ms: 10,
                threshold_bytes: 16 * 1024,
            })
            .store(StoreType::Memory)
            .build()
            .expect("valid test config"),
    )
}

fn patterned(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

async fn wait_finished(job: &Arc<DownloadJob>) {
    timeout(Duration::from_secs(30), job.wait())
        .await
        .expect("job should finish in time");
}

#[tokio::test]
async fn concurrency_bound_is_respected() {
    let body = patterned(64 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            write_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());

    let names: Vec<String> = (0..4).map(|i| format!("f{}.bin", i)).collect();
    let urls: Vec<String> = names.iter().map(|n| format!("{}{}", server.url, n)).collect();
    let job = DownloadJob::new(
        urls,
        names.clone(),
        test_config(dir.path(), 2),
        Arc::clone(&store),
        Arc::new(AlwaysOnline),
    )
    .unwrap();

    let scheduler = Scheduler::new(2);
    for task in &job.tasks {
        scheduler.add(Arc::clone(task)).await.unwrap();
    }
    scheduler.start().await;
    wait_finished(&job).await;

    for task in &job.tasks {
        assert_eq!(task.state().await, TaskState::Completed);
    }
    for name in &names {
        assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), body);
    }
    assert!(
        server.max_concurrent.load(Ordering::SeqCst) <= 2,
        "active set must not exceed the configured concurrency"
    );
    assert_eq!(scheduler.active_len().await, 0);
    assert_eq!(scheduler.queue_len().await, 0);
}

#[tokio::test]
async fn duplicate_and_terminal_adds_are_rejected() {
    let body = patterned(1024);
    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());

    let job = DownloadJob::new(
        vec![
            format!("{}a.bin", server.url),
            format!("{}b.bin", server.url),
        ],
        vec!["a.bin".into(), "b.bin".into()],
        test_config(dir.path(), 2),
        Arc::clone(&store),
        Arc::new(AlwaysOnline),
    )
    .unwrap();

    let scheduler = Scheduler::new(2);
    let first = Arc::clone(&job.tasks[0]);
    scheduler.add(Arc::clone(&first)).await.unwrap();
    assert!(scheduler.add(Arc::clone(&first)).await.is_err());

    // Run the second task to completion outside the scheduler, then try to
    // add it.
    let second = Arc::clone(&job.tasks[1]);
    second.start().await.unwrap();
    assert_eq!(second.state().await, TaskState::Completed);
    assert!(scheduler.add(second).await.is_err());
}

#[tokio::test]
async fn scheduler_pause_frees_slots_and_resume_job_completes() {
    let body = patterned(256 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            write_delay: Some(Duration::from_millis(15)),
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());

    let names = vec!["s0.bin".to_string(), "s1.bin".to_string()];
    let urls: Vec<String> = names.iter().map(|n| format!("{}{}", server.url, n)).collect();
    let job = DownloadJob::new(
        urls,
        names.clone(),
        test_config(dir.path(), 2),
        Arc::clone(&store),
        Arc::new(AlwaysOnline),
    )
    .unwrap();

    let scheduler = Scheduler::new(2);
    for task in &job.tasks {
        scheduler.add(Arc::clone(task)).await.unwrap();
    }
    scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    scheduler.pause().await;
    assert_eq!(scheduler.active_len().await, 0);
    assert_eq!(scheduler.queue_len().await, 2);
    assert!(!scheduler.is_running());

    for task in &job.tasks {
        scheduler.resume_job(task).await.unwrap();
    }
    scheduler.start().await;
    wait_finished(&job).await;

    for (task, name) in job.tasks.iter().zip(&names) {
        assert_eq!(task.state().await, TaskState::Completed);
        assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), body);
    }
}

#[tokio::test]
async fn clear_cancels_active_tasks_and_purges() {
    let body = patterned(256 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        ServerOptions {
            write_delay: Some(Duration::from_millis(15)),
            ..Default::default()
        },
    );
    let dir = tempdir().unwrap();
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());

    let names = vec!["k0.bin".to_string(), "k1.bin".to_string()];
    let urls: Vec<String> = names.iter().map(|n| format!("{}{}", server.url, n)).collect();
    let job = DownloadJob::new(
        urls.clone(),
        names,
        test_config(dir.path(), 2),
        Arc::clone(&store),
        Arc::new(AlwaysOnline),
    )
    .unwrap();

    let scheduler = Scheduler::new(2);
    for task in &job.tasks {
        scheduler.add(Arc::clone(task)).await.unwrap();
    }
    scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    scheduler.clear().await;
    assert_eq!(scheduler.active_len().await, 0);
    assert_eq!(scheduler.queue_len().await, 0);

    // Give the aborted runners a beat to observe the flag.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for (task, url) in job.tasks.iter().zip(&urls) {
        assert_eq!(task.state().await, TaskState::Canceled);
        assert!(store.get_metadata(url).await.unwrap().is_none());
        assert!(store.list_chunks(url).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn job_aggregates_progress_and_completion() {
    let body = patterned(64 * 1024);
    let server = range_server::start(body.clone());
    let dir = tempdir().unwrap();
    let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());

    let names = vec!["j0.bin".to_string(), "j1.bin".to_string()];
    let urls: Vec<String> = names.iter().map(|n| format!("{}{}", server.url, n)).collect();
    let job = DownloadJob::new(
        urls,
        names,
        test_config(dir.path(), 2),
        Arc::clone(&store),
        Arc::new(AlwaysOnline),
    )
    .unwrap();

    let mut rx = job.subscribe();
    let scheduler = Scheduler::new(2);
    for task in &job.tasks {
        scheduler.add(Arc::clone(task)).await.unwrap();
    }
    scheduler.start().await;
    wait_finished(&job).await;

    assert!(job.is_finished());
    let expected_total = 2 * body.len() as u64;
    assert_eq!(job.total(), expected_total);
    assert_eq!(job.loaded(), expected_total);

    let mut task_completes = 0;
    let mut job_complete = 0;
    let mut last_loaded = 0u64;
    while let Ok(event) = rx.try_recv() {
        match event {
            JobEvent::TaskComplete { .. } => task_completes += 1,
            JobEvent::Complete => job_complete += 1,
            JobEvent::Progress { loaded, total, .. } => {
                assert!(loaded >= last_loaded, "job progress must be non-decreasing");
                assert!(loaded <= total.max(expected_total));
                last_loaded = loaded;
            }
            JobEvent::TaskProgress { .. } | JobEvent::TaskError { .. } => {}
        }
    }
    assert_eq!(task_completes, 2);
    assert_eq!(job_complete, 1);
}
