use crate::DownloadError;
use crate::status::TaskState;
use std::path::PathBuf;

/// Per-task lifecycle events, broadcast by `DownloadTask`.
///
/// For a given task, events arrive in occurrence order: a `StateChange`
/// into `Downloading` precedes any `Progress`, and `Complete`/`Error`
/// are always last.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Start {
        id: u32,
    },
    StateChange {
        id: u32,
        state: TaskState,
    },
    Progress {
        id: u32,
        loaded: u64,
        total: u64,
        percent: f64,
    },
    NetworkLost {
        id: u32,
    },
    Pause {
        id: u32,
    },
    Resume {
        id: u32,
    },
    Cancel {
        id: u32,
    },
    Complete {
        id: u32,
        path: PathBuf,
        bytes: u64,
    },
    Error {
        id: u32,
        error: DownloadError,
    },
}

/// Job-level events, broadcast by `DownloadJob`.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress {
        loaded: u64,
        total: u64,
        percent: f64,
    },
    TaskProgress {
        id: u32,
        loaded: u64,
        total: u64,
    },
    TaskComplete {
        id: u32,
        path: PathBuf,
    },
    TaskError {
        id: u32,
        error: DownloadError,
    },
    Complete,
}
