use super::models::{ChunkRecord, TaskMeta};
use super::ChunkStore;
use crate::DownloadError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Durable backend: survives process restarts, which is what makes
/// resumption work at all.
pub struct SqliteChunkStore {
    pool: Arc<SqlitePool>,
}

impl SqliteChunkStore {
    pub async fn new(db_path: &PathBuf) -> Result<Self, DownloadError> {
        let cwd = std::env::current_dir()?;
        let db_abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            cwd.join(db_path)
        };

        if let Some(parent) = db_abs.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    DownloadError::Storage(format!(
                        "Failed to create directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        if !db_abs.exists() {
            fs::File::create(&db_abs).map_err(|e| {
                DownloadError::Storage(format!("Failed to create DB file {:?}: {}", db_abs, e))
            })?;
        }

        let conn_str = format!("sqlite://{}", db_abs.display());
        let pool = SqlitePool::connect(&conn_str)
            .await
            .map_err(|e| DownloadError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS download_meta (
                url TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                supports_resume INTEGER NOT NULL DEFAULT 0,
                chunk_size INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS download_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                "idx" INTEGER NOT NULL,
                data BLOB NOT NULL,
                UNIQUE(url, "idx")
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn row_to_meta(row: &sqlx::sqlite::SqliteRow) -> TaskMeta {
        TaskMeta {
            url: row.get("url"),
            file_name: row.get("file_name"),
            total_bytes: row.get::<i64, _>("total_bytes") as u64,
            downloaded_bytes: row.get::<i64, _>("downloaded_bytes") as u64,
            supports_resume: row.get::<i64, _>("supports_resume") != 0,
            chunk_size: row.get::<i64, _>("chunk_size") as u64,
            created_at: row.try_get::<String, _>("created_at").ok().and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
            updated_at: row.try_get::<String, _>("updated_at").ok().and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        }
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn get_metadata(&self, url: &str) -> Result<Option<TaskMeta>, DownloadError> {
        let row = sqlx::query("SELECT * FROM download_meta WHERE url = ?1")
            .bind(url)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_meta))
    }

    async fn put_metadata(&self, meta: &TaskMeta) -> Result<(), DownloadError> {
        sqlx::query(
            r#"
            INSERT INTO download_meta
                (url, file_name, total_bytes, downloaded_bytes, supports_resume, chunk_size, created_at, updated_at)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, CURRENT_TIMESTAMP), CURRENT_TIMESTAMP)
            ON CONFLICT(url) DO UPDATE SET
                file_name=excluded.file_name,
                total_bytes=excluded.total_bytes,
                downloaded_bytes=excluded.downloaded_bytes,
                supports_resume=excluded.supports_resume,
                chunk_size=excluded.chunk_size,
                updated_at=CURRENT_TIMESTAMP
            "#,
        )
        .bind(&meta.url)
        .bind(&meta.file_name)
        .bind(meta.total_bytes as i64)
        .bind(meta.downloaded_bytes as i64)
        .bind(if meta.supports_resume { 1i64 } else { 0i64 })
        .bind(meta.chunk_size as i64)
        .bind(meta.created_at.map(|dt| dt.to_rfc3339()))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn delete_metadata(&self, url: &str) -> Result<(), DownloadError> {
        sqlx::query("DELETE FROM download_meta WHERE url = ?1")
            .bind(url)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn put_chunk(&self, url: &str, index: u32, data: &[u8]) -> Result<(), DownloadError> {
        // DO NOTHING keeps the first committed chunk; a retried write for
        // the same (url, idx) is a no-op.
        sqlx::query(
            r#"
            INSERT INTO download_chunks (url, "idx", data)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(url, "idx") DO NOTHING
            "#,
        )
        .bind(url)
        .bind(index as i64)
        .bind(data)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn list_chunks(&self, url: &str) -> Result<Vec<ChunkRecord>, DownloadError> {
        let rows = sqlx::query(
            r#"SELECT "idx", data FROM download_chunks WHERE url = ?1 ORDER BY "idx""#,
        )
        .bind(url)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ChunkRecord {
                index: r.get::<i64, _>("idx") as u32,
                data: r.get("data"),
            })
            .collect())
    }

    async fn delete_chunks(&self, url: &str) -> Result<(), DownloadError> {
        sqlx::query("DELETE FROM download_chunks WHERE url = ?1")
            .bind(url)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), DownloadError> {
        sqlx::query("DELETE FROM download_meta")
            .execute(&*self.pool)
            .await?;
        sqlx::query("DELETE FROM download_chunks")
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}
