use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "mock"))]
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors reported by a record store
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// A persisted image record. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    pub id: Uuid,
    /// Client-supplied display name; not unique
    pub filename: String,
    pub upload_time: DateTime<Utc>,
    /// Serialized analysis document, absent if analysis produced nothing
    pub recognition_result: Option<String>,
    /// Locator of the uploaded bytes in the blob store
    pub object_url: String,
}

/// Relational store for image records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record in a single committed transaction
    async fn insert(&self, record: &ImageRecord) -> Result<(), PersistenceError>;

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, PersistenceError>;

    /// Page through records in store order. An offset past the end yields
    /// an empty page.
    async fn list(&self, offset: u32, limit: u32) -> Result<Vec<ImageRecord>, PersistenceError>;

    /// Trivial round trip used by health checks
    async fn ping(&self) -> Result<(), PersistenceError>;
}

/// Record store backed by PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(image_id = %record.id))]
    async fn insert(&self, record: &ImageRecord) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO images (
                id, filename, upload_time, recognition_result, object_url
            ) VALUES (
                $1, $2, $3, $4, $5
            )
            "#,
        )
        .bind(record.id)
        .bind(&record.filename)
        .bind(record.upload_time)
        .bind(&record.recognition_result)
        .bind(&record.object_url)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(object_url = %record.object_url, "Image record inserted");

        metrics::counter!("record_store.records.inserted").increment(1);

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, PersistenceError> {
        let record = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, filename, upload_time, recognition_result, object_url
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn list(&self, offset: u32, limit: u32) -> Result<Vec<ImageRecord>, PersistenceError> {
        let records = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, filename, upload_time, recognition_result, object_url
            FROM images
            ORDER BY upload_time ASC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process record store that keeps insertion order
#[cfg(any(test, feature = "mock"))]
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<ImageRecord>>,
}

#[cfg(any(test, feature = "mock"))]
impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &ImageRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.id == record.id) {
            return Err(PersistenceError::Unavailable(format!(
                "duplicate primary key {}",
                record.id
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, PersistenceError> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, offset: u32, limit: u32) -> Result<Vec<ImageRecord>, PersistenceError> {
        Ok(self
            .records
            .read()
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(filename: &str) -> ImageRecord {
        ImageRecord {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            upload_time: Utc::now(),
            recognition_result: None,
            object_url: format!("http://minio:9000/images/x/{filename}"),
        }
    }

    #[tokio::test]
    async fn test_memory_store_get() {
        let store = MemoryRecordStore::new();
        let rec = record("a.png");
        store.insert(&rec).await.unwrap();

        assert_eq!(store.get(rec.id).await.unwrap(), Some(rec));
        assert_eq!(store.get(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_duplicate_id() {
        let store = MemoryRecordStore::new();
        let rec = record("a.png");
        store.insert(&rec).await.unwrap();

        assert!(store.insert(&rec).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_pagination() {
        let store = MemoryRecordStore::new();
        for i in 0..15 {
            store.insert(&record(&format!("{i}.png"))).await.unwrap();
        }

        let first = store.list(0, 10).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].filename, "0.png");
        assert_eq!(first[9].filename, "9.png");

        let second = store.list(10, 10).await.unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[0].filename, "10.png");

        assert!(store.list(15, 10).await.unwrap().is_empty());
        assert!(store.list(u32::MAX, 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_record_serializes_with_snake_case_fields() {
        let json = serde_json::to_value(record("cat.png")).unwrap();

        assert_eq!(json["filename"], "cat.png");
        assert!(json.get("upload_time").is_some());
        assert!(json["recognition_result"].is_null());
        assert!(json["object_url"].as_str().unwrap().ends_with("cat.png"));
    }
}
