pub mod memory;
pub mod models;
pub mod sqlite;

pub use memory::MemoryChunkStore;
pub use models::{ChunkRecord, TaskMeta};
pub use sqlite::SqliteChunkStore;

use crate::error::DownloadError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Durable persistence for in-progress downloads.
///
/// Two logical collections: metadata records keyed by url, and chunk
/// records keyed by `(url, index)`. Every mutation is atomic from the
/// caller's perspective. The store is process-wide shared state; tasks
/// operate on disjoint keyspaces by url.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get_metadata(&self, url: &str) -> Result<Option<TaskMeta>, DownloadError>;
    async fn put_metadata(&self, meta: &TaskMeta) -> Result<(), DownloadError>;
    async fn delete_metadata(&self, url: &str) -> Result<(), DownloadError>;

    /// Idempotent: if `(url, index)` is already present the call is a no-op,
    /// not an overwrite. A retry that crosses a successful-write boundary
    /// must not corrupt a stored chunk.
    async fn put_chunk(&self, url: &str, index: u32, data: &[u8]) -> Result<(), DownloadError>;

    /// Chunks for `url`, sorted ascending by index.
    async fn list_chunks(&self, url: &str) -> Result<Vec<ChunkRecord>, DownloadError>;
    async fn delete_chunks(&self, url: &str) -> Result<(), DownloadError>;

    /// Wipes both collections.
    async fn reset(&self) -> Result<(), DownloadError>;
}

/// Store backend selection, from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreType {
    Memory,
    Sqlite(String),
}

/// Opens the configured backend as the process-wide shared store.
pub async fn open_store(store_type: &StoreType) -> Result<Arc<dyn ChunkStore>, DownloadError> {
    match store_type {
        StoreType::Memory => Ok(Arc::new(MemoryChunkStore::new())),
        StoreType::Sqlite(path) => Ok(Arc::new(
            SqliteChunkStore::new(&std::path::PathBuf::from(path)).await?,
        )),
    }
}
