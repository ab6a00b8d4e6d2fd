use crate::config::DatabaseConfig;
use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Width of the `poem_title` column
pub const MAX_TITLE_CHARS: usize = 200;

/// Where the bytes of an image live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Local => "local",
            StorageBackend::S3 => "s3",
        }
    }
}

/// Stored image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Unique image ID
    pub id: i64,
    /// Stored filename (`<uuid><ext>`)
    pub filename: String,
    /// Filename supplied by the client
    pub original_filename: String,
    /// Local path or durable object URL
    pub file_path: String,
    /// Backend holding the bytes
    pub storage_backend: StorageBackend,
    /// Object key when stored in S3
    pub object_key: Option<String>,
    /// File size in bytes
    pub file_size: i64,
    /// MIME type of the upload
    pub mime_type: String,
    /// Pixel width, when it could be read
    pub width: Option<i32>,
    /// Pixel height, when it could be read
    pub height: Option<i32>,
    pub poem_title: Option<String>,
    pub poem_body: Option<String>,
    /// True once a generation has written both title and body
    pub poem_generated: bool,
    pub upload_ip: Option<String>,
    pub user_agent: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last changed
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn is_remote(&self) -> bool {
        self.storage_backend == StorageBackend::S3
    }

    pub fn has_body(&self) -> bool {
        self.poem_body.as_deref().is_some_and(|b| !b.is_empty())
    }
}

/// Fields supplied when an image is first stored
#[derive(Debug, Clone)]
pub struct NewImage {
    pub filename: String,
    pub original_filename: String,
    pub file_path: String,
    pub storage_backend: StorageBackend,
    pub object_key: Option<String>,
    pub file_size: i64,
    pub mime_type: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub upload_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Aggregate figures for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecordStats {
    pub total_images: i64,
    pub total_bytes: i64,
    pub poems_generated: i64,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, filename, original_filename, file_path, storage_backend,
           object_key, file_size, mime_type, width, height,
           poem_title, poem_body, poem_generated, upload_ip, user_agent,
           created_at, updated_at
    FROM images
"#;

/// Image records in SQLite
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Create a new record store with connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database URL: {}", config.url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite")?;

        info!(url = %config.url, "Connected to image database");

        Ok(Self { pool })
    }

    /// Private in-memory database with migrations applied
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?;

        // A single connection that never expires, or the database goes with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite")?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a freshly stored image; generation starts incomplete
    #[instrument(skip(self, image), fields(filename = %image.filename))]
    pub async fn insert(&self, image: NewImage) -> Result<ImageRecord> {
        ensure!(image.file_size > 0, "file size must be positive");
        ensure!(
            image.width.map_or(true, |w| w >= 1) && image.height.map_or(true, |h| h >= 1),
            "image dimensions must be at least 1 pixel"
        );

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO images (
                filename, original_filename, file_path, storage_backend,
                object_key, file_size, mime_type, width, height,
                poem_generated, upload_ip, user_agent, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4,
                $5, $6, $7, $8, $9,
                0, $10, $11, $12, $12
            )
            "#,
        )
        .bind(&image.filename)
        .bind(&image.original_filename)
        .bind(&image.file_path)
        .bind(image.storage_backend)
        .bind(&image.object_key)
        .bind(image.file_size)
        .bind(&image.mime_type)
        .bind(image.width)
        .bind(image.height)
        .bind(&image.upload_ip)
        .bind(&image.user_agent)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert image record")?;

        let id = result.last_insert_rowid();
        debug!(image_id = id, "Image record created");

        self.get(id)
            .await?
            .context("Inserted image record disappeared")
    }

    /// Get an image record by ID
    pub async fn get(&self, id: i64) -> Result<Option<ImageRecord>> {
        let record = sqlx::query_as::<_, ImageRecord>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query image")?;

        Ok(record)
    }

    /// Page of records, newest first
    #[instrument(skip(self))]
    pub async fn list(&self, skip: i64, limit: i64) -> Result<Vec<ImageRecord>> {
        let records = sqlx::query_as::<_, ImageRecord>(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list images")?;

        Ok(records)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count images")?;

        Ok(count.0)
    }

    /// Record a successful generation. Returns `None` when the image is gone.
    #[instrument(skip(self, title, body))]
    pub async fn mark_generated(
        &self,
        id: i64,
        title: &str,
        body: &str,
    ) -> Result<Option<ImageRecord>> {
        ensure!(
            !title.trim().is_empty() && !body.trim().is_empty(),
            "generated poem needs both a title and a body"
        );

        let result = sqlx::query(
            r#"
            UPDATE images
            SET poem_title = $1, poem_body = $2, poem_generated = 1, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(title)
        .bind(body)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to store generated poem")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        debug!(image_id = id, "Poem stored");
        self.get(id).await
    }

    /// Delete a record, returning it so the caller can remove its blob
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<Option<ImageRecord>> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete image record")?;

        info!(image_id = id, "Image record deleted");
        Ok(Some(record))
    }

    pub async fn stats(&self) -> Result<RecordStats> {
        let stats: RecordStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) as total_images,
                COALESCE(SUM(file_size), 0) as total_bytes,
                COALESCE(SUM(CASE WHEN poem_generated THEN 1 ELSE 0 END), 0) as poems_generated
            FROM images
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to get image stats")?;

        Ok(stats)
    }

    /// Cheap connectivity check for readiness probes
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database unreachable")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn new_image(filename: &str) -> NewImage {
        NewImage {
            filename: filename.to_string(),
            original_filename: "sunset.jpg".to_string(),
            file_path: format!("uploads/{filename}"),
            storage_backend: StorageBackend::Local,
            object_key: None,
            file_size: 2048,
            mime_type: "image/jpeg".to_string(),
            width: Some(100),
            height: Some(100),
            upload_ip: Some("127.0.0.1".to_string()),
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn test_insert_starts_incomplete() {
        let store = RecordStore::in_memory().await.unwrap();
        let record = store.insert(new_image("a.jpg")).await.unwrap();

        assert!(record.id > 0);
        assert!(!record.poem_generated);
        assert!(record.poem_title.is_none());
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(store.get(record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_insert_rejects_empty_file() {
        let store = RecordStore::in_memory().await.unwrap();
        let mut image = new_image("a.jpg");
        image.file_size = 0;

        assert!(store.insert(image).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let store = RecordStore::in_memory().await.unwrap();
        let first = store.insert(new_image("a.jpg")).await.unwrap();
        store.delete(first.id).await.unwrap();
        let second = store.insert(new_image("b.jpg")).await.unwrap();

        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_paging() {
        let store = RecordStore::in_memory().await.unwrap();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            store.insert(new_image(name)).await.unwrap();
        }

        let page = store.list(0, 2).await.unwrap();
        let names: Vec<_> = page.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["c.jpg", "b.jpg"]);

        let rest = store.list(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].filename, "a.jpg");
    }

    #[tokio::test]
    async fn test_mark_generated() {
        let store = RecordStore::in_memory().await.unwrap();
        let record = store.insert(new_image("a.jpg")).await.unwrap();

        let updated = store
            .mark_generated(record.id, "노을", "붉은 하늘\n저무는 해")
            .await
            .unwrap()
            .unwrap();

        assert!(updated.poem_generated);
        assert_eq!(updated.poem_title.as_deref(), Some("노을"));
        assert!(updated.has_body());
        assert!(updated.updated_at >= record.updated_at);
        assert_eq!(updated.created_at, record.created_at);
    }

    #[tokio::test]
    async fn test_mark_generated_requires_content() {
        let store = RecordStore::in_memory().await.unwrap();
        let record = store.insert(new_image("a.jpg")).await.unwrap();

        assert!(store.mark_generated(record.id, "Title", "  ").await.is_err());
        let unchanged = store.get(record.id).await.unwrap().unwrap();
        assert!(!unchanged.poem_generated);
    }

    #[tokio::test]
    async fn test_mark_generated_missing_record() {
        let store = RecordStore::in_memory().await.unwrap();
        let result = store.mark_generated(42, "Title", "Body").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_delete_returns_record() {
        let store = RecordStore::in_memory().await.unwrap();
        let record = store.insert(new_image("a.jpg")).await.unwrap();

        let deleted = store.delete(record.id).await.unwrap();
        assert_eq!(deleted.map(|r| r.id), Some(record.id));
        assert!(store.get(record.id).await.unwrap().is_none());
        assert!(store.delete(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = RecordStore::in_memory().await.unwrap();
        let record = store.insert(new_image("a.jpg")).await.unwrap();
        store.insert(new_image("b.jpg")).await.unwrap();
        store.mark_generated(record.id, "T", "B").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.total_bytes, 4096);
        assert_eq!(stats.poems_generated, 1);
    }
}
