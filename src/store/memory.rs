use super::models::{ChunkRecord, TaskMeta};
use super::ChunkStore;
use crate::DownloadError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Non-durable backend, used by tests and as a fallback when no database
/// path is configured.
#[derive(Default)]
pub struct MemoryChunkStore {
    metadata: RwLock<HashMap<String, TaskMeta>>,
    // BTreeMap keeps enumeration ordered by index.
    chunks: RwLock<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn get_metadata(&self, url: &str) -> Result<Option<TaskMeta>, DownloadError> {
        Ok(self.metadata.read().await.get(url).cloned())
    }

    async fn put_metadata(&self, meta: &TaskMeta) -> Result<(), DownloadError> {
        self.metadata
            .write()
            .await
            .insert(meta.url.clone(), meta.clone());
        Ok(())
    }

    async fn delete_metadata(&self, url: &str) -> Result<(), DownloadError> {
        self.metadata.write().await.remove(url);
        Ok(())
    }

    async fn put_chunk(&self, url: &str, index: u32, data: &[u8]) -> Result<(), DownloadError> {
        let mut chunks = self.chunks.write().await;
        chunks
            .entry(url.to_string())
            .or_default()
            .entry(index)
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn list_chunks(&self, url: &str) -> Result<Vec<ChunkRecord>, DownloadError> {
        Ok(self
            .chunks
            .read()
            .await
            .get(url)
            .map(|per_url| {
                per_url
                    .iter()
                    .map(|(index, data)| ChunkRecord {
                        index: *index,
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_chunks(&self, url: &str) -> Result<(), DownloadError> {
        self.chunks.write().await.remove(url);
        Ok(())
    }

    async fn reset(&self) -> Result<(), DownloadError> {
        self.metadata.write().await.clear();
        self.chunks.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(url: &str) -> TaskMeta {
        TaskMeta {
            url: url.into(),
            file_name: "f.bin".into(),
            total_bytes: 100,
            downloaded_bytes: 0,
            supports_resume: true,
            chunk_size: 10,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn metadata_upsert_and_delete() {
        let store = MemoryChunkStore::new();
        assert!(store.get_metadata("http://h/a").await.unwrap().is_none());

        store.put_metadata(&meta("http://h/a")).await.unwrap();
        let mut updated = meta("http://h/a");
        updated.downloaded_bytes = 50;
        store.put_metadata(&updated).await.unwrap();

        let loaded = store.get_metadata("http://h/a").await.unwrap().unwrap();
        assert_eq!(loaded.downloaded_bytes, 50);

        store.delete_metadata("http://h/a").await.unwrap();
        assert!(store.get_metadata("http://h/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_chunk_is_idempotent_first_write_wins() {
        let store = MemoryChunkStore::new();
        store.put_chunk("http://h/a", 0, b"first").await.unwrap();
        store.put_chunk("http://h/a", 0, b"second").await.unwrap();

        let chunks = store.list_chunks("http://h/a").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, b"first");
    }

    #[tokio::test]
    async fn list_chunks_is_sorted_by_index() {
        let store = MemoryChunkStore::new();
        store.put_chunk("http://h/a", 2, b"c").await.unwrap();
        store.put_chunk("http://h/a", 0, b"a").await.unwrap();
        store.put_chunk("http://h/a", 1, b"b").await.unwrap();

        let indices: Vec<u32> = store
            .list_chunks("http://h/a")
            .await
            .unwrap()
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn urls_have_disjoint_chunk_keyspaces() {
        let store = MemoryChunkStore::new();
        store.put_chunk("http://h/a", 0, b"a").await.unwrap();
        store.put_chunk("http://h/b", 0, b"b").await.unwrap();

        store.delete_chunks("http://h/a").await.unwrap();
        assert!(store.list_chunks("http://h/a").await.unwrap().is_empty());
        assert_eq!(store.list_chunks("http://h/b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_wipes_both_collections() {
        let store = MemoryChunkStore::new();
        store.put_metadata(&meta("http://h/a")).await.unwrap();
        store.put_chunk("http://h/a", 0, b"a").await.unwrap();

        store.reset().await.unwrap();
        assert!(store.get_metadata("http://h/a").await.unwrap().is_none());
        assert!(store.list_chunks("http://h/a").await.unwrap().is_empty());
    }
}
