use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};

/// Per-resource metadata record, keyed by `url`, alive while a download is
/// in progress.
///
/// `downloaded_bytes` only ever grows, and stays at or below `total_bytes`
/// once the total is known. `chunk_size` is fixed when first committed;
/// resumption must reuse the stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub url: String,
    pub file_name: String,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub supports_resume: bool,
    pub chunk_size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskMeta {
    /// Chunk index a resumed download continues from.
    pub fn resume_index(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        (self.downloaded_bytes / self.chunk_size) as u32
    }
}

/// One stored chunk of a resource; `(url, index)` is unique in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: u32,
    pub data: Vec<u8>,
}
