pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod online;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod stats;
pub mod status;
pub mod store;
pub mod task;

pub use config::DownloadConfig;
pub use error::DownloadError;
pub use stats::DownloadStats;
pub use status::TaskState;

pub use events::{JobEvent, TaskEvent};
pub use job::DownloadJob;
pub use online::{AlwaysOnline, NetworkMonitor, SharedOnlineFlag};
pub use scheduler::Scheduler;
pub use store::{ChunkStore, StoreType};
pub use task::DownloadTask;
