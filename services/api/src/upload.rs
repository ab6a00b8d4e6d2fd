use crate::local_store::LocalStore;
use crate::object_store::ObjectStore;
use crate::record_store::{ImageRecord, NewImage, RecordStore, StorageBackend};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".webp", ".gif"];

pub const ALLOWED_MIME_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "image/gif",
];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File too large. Maximum size is {} MB", .max_bytes / (1024 * 1024))]
    TooLarge { max_bytes: usize },

    #[error("Uploaded file is empty")]
    EmptyFile,

    #[error("File type {extension} not allowed. Allowed types: {}", ALLOWED_EXTENSIONS.join(", "))]
    ExtensionNotAllowed { extension: String },

    #[error("MIME type {mime_type} not allowed")]
    MimeTypeNotAllowed { mime_type: String },

    #[error("{0}")]
    Storage(#[source] anyhow::Error),
}

/// An uploaded file as received from the client
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Request details stored alongside the image
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub upload_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Lowercased extension including the dot, e.g. `.jpg`
fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

fn mime_for_extension(extension: Option<&str>) -> &'static str {
    match extension {
        Some(".jpg" | ".jpeg") => "image/jpeg",
        Some(".png") => "image/png",
        Some(".webp") => "image/webp",
        Some(".gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Checks run before anything touches storage
pub fn validate_file(file: &IncomingFile, max_bytes: usize) -> Result<(), UploadError> {
    if file.bytes.len() > max_bytes {
        return Err(UploadError::TooLarge { max_bytes });
    }
    if file.bytes.is_empty() {
        return Err(UploadError::EmptyFile);
    }

    if let Some(filename) = file.filename.as_deref() {
        let extension = extension_of(filename).unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(UploadError::ExtensionNotAllowed { extension });
        }
    }

    if let Some(mime_type) = file.content_type.as_deref() {
        if !ALLOWED_MIME_TYPES.contains(&mime_type) {
            return Err(UploadError::MimeTypeNotAllowed {
                mime_type: mime_type.to_string(),
            });
        }
    }

    Ok(())
}

/// Validates, stores and records uploads
pub struct UploadService {
    local: LocalStore,
    objects: Option<Arc<dyn ObjectStore>>,
    records: RecordStore,
    max_file_size: usize,
    key_prefix: String,
}

impl UploadService {
    pub fn new(
        local: LocalStore,
        objects: Option<Arc<dyn ObjectStore>>,
        records: RecordStore,
        max_file_size: usize,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            local,
            objects,
            records,
            max_file_size,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn backend(&self) -> StorageBackend {
        if self.objects.is_some() {
            StorageBackend::S3
        } else {
            StorageBackend::Local
        }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn objects(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.objects.as_ref()
    }

    /// Bytes of a stored image, `None` when the blob is gone
    pub async fn read_image(&self, record: &ImageRecord) -> anyhow::Result<Option<Vec<u8>>> {
        if record.is_remote() {
            let objects = self
                .objects
                .as_ref()
                .context("Object storage is not configured")?;
            let key = record
                .object_key
                .as_deref()
                .context("Remote image has no object key")?;
            Ok(objects.get(key).await?)
        } else {
            self.local.read(Path::new(&record.file_path)).await
        }
    }

    /// Whether the blob behind a record is still present
    pub async fn image_exists(&self, record: &ImageRecord) -> anyhow::Result<bool> {
        if !record.is_remote() {
            return Ok(self.local.exists(Path::new(&record.file_path)).await);
        }
        match (&self.objects, record.object_key.as_deref()) {
            (Some(objects), Some(key)) => Ok(objects.exists(key).await?),
            _ => Ok(false),
        }
    }

    /// Remove the blob behind a record, logging failures
    pub async fn remove_image(&self, record: &ImageRecord) {
        if !record.is_remote() {
            self.local.remove_quietly(Path::new(&record.file_path)).await;
            return;
        }
        match (&self.objects, record.object_key.as_deref()) {
            (Some(objects), Some(key)) => {
                if let Err(e) = objects.delete(key).await {
                    warn!(error = %e, key = %key, "Failed to delete object");
                }
            }
            _ => warn!(
                image_id = record.id,
                "Object storage not configured, remote object left in place"
            ),
        }
    }

    /// Validate and persist an upload, returning the new record
    #[instrument(skip(self, file, meta), fields(filename = ?file.filename, size_bytes = file.bytes.len()))]
    pub async fn store(
        &self,
        file: IncomingFile,
        meta: UploadMeta,
    ) -> Result<ImageRecord, UploadError> {
        if let Err(e) = validate_file(&file, self.max_file_size) {
            metrics::counter!("imagepoet.uploads.rejected").increment(1);
            info!(reason = %e, "Upload rejected");
            return Err(e);
        }

        let extension = file.filename.as_deref().and_then(extension_of);
        let stored_name = format!("{}{}", Uuid::new_v4(), extension.as_deref().unwrap_or(""));
        let mime_type = file
            .content_type
            .clone()
            .unwrap_or_else(|| mime_for_extension(extension.as_deref()).to_string());
        let original_filename = file.filename.clone().unwrap_or_else(|| stored_name.clone());
        let file_size = file.bytes.len() as i64;

        let local_path = self
            .local
            .write(&stored_name, &file.bytes)
            .await
            .map_err(UploadError::Storage)?;
        let dimensions = self.local.image_dimensions(&local_path).await;
        if dimensions.is_none() {
            warn!(path = %local_path.display(), "Could not read image dimensions");
        }

        let (file_path, backend, object_key) = match &self.objects {
            Some(objects) => {
                let key = format!("{}/{}", self.key_prefix, stored_name);
                let put = objects
                    .put(&key, file.bytes, &mime_type, &original_filename)
                    .await;
                // Only the object copy is kept
                self.local.remove_quietly(&local_path).await;
                let url = put.map_err(|e| UploadError::Storage(e.into()))?;
                (url, StorageBackend::S3, Some(key))
            }
            None => (
                local_path.to_string_lossy().into_owned(),
                StorageBackend::Local,
                None,
            ),
        };

        let (width, height) = match dimensions {
            Some((w, h)) => (i32::try_from(w).ok(), i32::try_from(h).ok()),
            None => (None, None),
        };

        let new_image = NewImage {
            filename: stored_name,
            original_filename,
            file_path,
            storage_backend: backend,
            object_key: object_key.clone(),
            file_size,
            mime_type,
            width,
            height,
            upload_ip: meta.upload_ip,
            user_agent: meta.user_agent,
        };

        let record = match self.records.insert(new_image).await {
            Ok(record) => record,
            Err(e) => {
                self.cleanup(&local_path, object_key.as_deref()).await;
                return Err(UploadError::Storage(e));
            }
        };

        metrics::counter!("imagepoet.uploads.stored").increment(1);
        info!(
            image_id = record.id,
            backend = record.storage_backend.as_str(),
            "Image stored"
        );

        Ok(record)
    }

    /// Remove whatever was written for a failed upload
    async fn cleanup(&self, local_path: &Path, object_key: Option<&str>) {
        self.local.remove_quietly(local_path).await;
        if let (Some(objects), Some(key)) = (&self.objects, object_key) {
            if let Err(e) = objects.delete(key).await {
                warn!(error = %e, key = %key, "Failed to remove object after failed upload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_prep::tests::sample_jpeg;
    use crate::object_store::{MockObjectStore, ObjectStoreError};
    use tempfile::TempDir;

    const MAX: usize = 10 * 1024 * 1024;

    fn jpeg_file(name: &str) -> IncomingFile {
        IncomingFile {
            bytes: sample_jpeg(100, 100),
            filename: Some(name.to_string()),
            content_type: Some("image/jpeg".to_string()),
        }
    }

    async fn local_service(dir: &TempDir, objects: Option<Arc<dyn ObjectStore>>) -> UploadService {
        let local = LocalStore::new(dir.path()).await.unwrap();
        let records = RecordStore::in_memory().await.unwrap();
        UploadService::new(local, objects, records, MAX, "images")
    }

    fn dir_is_empty(dir: &TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[test]
    fn test_validate_size_checked_first() {
        let file = IncomingFile {
            bytes: vec![0; 11],
            filename: Some("notes.txt".to_string()),
            content_type: Some("text/plain".to_string()),
        };
        let err = validate_file(&file, 10).unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { max_bytes: 10 }));
    }

    #[test]
    fn test_validate_too_large_message() {
        let file = IncomingFile {
            bytes: vec![0; MAX + 1],
            filename: None,
            content_type: None,
        };
        let err = validate_file(&file, MAX).unwrap_err();
        assert_eq!(err.to_string(), "File too large. Maximum size is 10 MB");
    }

    #[test]
    fn test_validate_empty_file() {
        let file = IncomingFile {
            bytes: vec![],
            filename: Some("a.jpg".to_string()),
            content_type: None,
        };
        assert!(matches!(validate_file(&file, MAX), Err(UploadError::EmptyFile)));
    }

    #[test]
    fn test_validate_extension_case_insensitive() {
        let mut file = jpeg_file("HOLIDAY.JPG");
        assert!(validate_file(&file, MAX).is_ok());

        file.filename = Some("readme.txt".to_string());
        let err = validate_file(&file, MAX).unwrap_err();
        assert!(err.to_string().contains(".txt not allowed"));

        file.filename = Some("no_extension".to_string());
        assert!(matches!(
            validate_file(&file, MAX),
            Err(UploadError::ExtensionNotAllowed { .. })
        ));
    }

    #[test]
    fn test_validate_mime_type() {
        let mut file = jpeg_file("a.png");
        file.content_type = Some("application/pdf".to_string());
        assert!(matches!(
            validate_file(&file, MAX),
            Err(UploadError::MimeTypeNotAllowed { .. })
        ));

        file.content_type = None;
        assert!(validate_file(&file, MAX).is_ok());
    }

    #[tokio::test]
    async fn test_store_local() {
        let dir = TempDir::new().unwrap();
        let service = local_service(&dir, None).await;

        let record = service
            .store(jpeg_file("beach.jpg"), UploadMeta::default())
            .await
            .unwrap();

        assert_eq!(record.storage_backend, StorageBackend::Local);
        assert_eq!(record.original_filename, "beach.jpg");
        assert!(record.filename.ends_with(".jpg"));
        assert_eq!(record.filename.len(), 36 + 4);
        assert_eq!((record.width, record.height), (Some(100), Some(100)));
        assert!(!record.poem_generated);
        assert!(Path::new(&record.file_path).exists());
        assert_eq!(record.file_size as usize, sample_jpeg(100, 100).len());
    }

    #[tokio::test]
    async fn test_store_unreadable_image_keeps_record() {
        let dir = TempDir::new().unwrap();
        let service = local_service(&dir, None).await;
        let file = IncomingFile {
            bytes: b"GIF89a but not really".to_vec(),
            filename: Some("broken.gif".to_string()),
            content_type: Some("image/gif".to_string()),
        };

        let record = service.store(file, UploadMeta::default()).await.unwrap();
        assert_eq!(record.width, None);
        assert_eq!(record.height, None);
    }

    #[tokio::test]
    async fn test_rejected_upload_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let service = local_service(&dir, None).await;

        let err = service
            .store(jpeg_file("script.exe"), UploadMeta::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::ExtensionNotAllowed { .. }));
        assert!(dir_is_empty(&dir));
        assert_eq!(service.records.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_in_object_store() {
        let dir = TempDir::new().unwrap();
        let mut objects = MockObjectStore::new();
        objects
            .expect_put()
            .withf(|key, data, content_type, original| {
                key.starts_with("images/")
                    && key.ends_with(".png")
                    && !data.is_empty()
                    && content_type == "image/jpeg"
                    && original == "sky.png"
            })
            .times(1)
            .returning(|key, _, _, _| Ok(format!("https://poems.s3.us-east-1.amazonaws.com/{key}")));

        let service = local_service(&dir, Some(Arc::new(objects))).await;
        let record = service
            .store(jpeg_file("sky.png"), UploadMeta::default())
            .await
            .unwrap();

        assert_eq!(record.storage_backend, StorageBackend::S3);
        let key = record.object_key.clone().unwrap();
        assert_eq!(key, format!("images/{}", record.filename));
        assert!(record.file_path.ends_with(&key));
        assert_eq!(record.width, Some(100));
        // The transient local copy is gone
        assert!(dir_is_empty(&dir));
    }

    #[tokio::test]
    async fn test_read_and_remove_local_image() {
        let dir = TempDir::new().unwrap();
        let service = local_service(&dir, None).await;
        let record = service
            .store(jpeg_file("beach.jpg"), UploadMeta::default())
            .await
            .unwrap();

        let bytes = service.read_image(&record).await.unwrap().unwrap();
        assert_eq!(bytes, sample_jpeg(100, 100));

        service.remove_image(&record).await;
        assert!(service.read_image(&record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_image_exists_checks_backend() {
        let dir = TempDir::new().unwrap();
        let mut objects = MockObjectStore::new();
        objects
            .expect_put()
            .returning(|key, _, _, _| Ok(format!("https://poems.s3.us-east-1.amazonaws.com/{key}")));
        objects
            .expect_exists()
            .withf(|key| key.starts_with("images/"))
            .times(1)
            .returning(|_| Ok(true));

        let service = local_service(&dir, Some(Arc::new(objects))).await;
        let remote = service
            .store(jpeg_file("sky.png"), UploadMeta::default())
            .await
            .unwrap();
        assert!(service.image_exists(&remote).await.unwrap());

        let local_only = local_service(&dir, None).await;
        let record = local_only
            .store(jpeg_file("beach.jpg"), UploadMeta::default())
            .await
            .unwrap();
        assert!(local_only.image_exists(&record).await.unwrap());
        local_only.remove_image(&record).await;
        assert!(!local_only.image_exists(&record).await.unwrap());
        // No object store to ask
        assert!(!local_only.image_exists(&remote).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_remote_image_without_object_store() {
        let dir = TempDir::new().unwrap();
        let service = local_service(&dir, None).await;
        let mut image = crate::record_store::tests::new_image("x.jpg");
        image.storage_backend = StorageBackend::S3;
        image.object_key = Some("images/x.jpg".to_string());
        let record = service.records.insert(image).await.unwrap();

        assert!(service.read_image(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_object_store_failure_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut objects = MockObjectStore::new();
        objects.expect_put().returning(|key, _, _, _| {
            Err(ObjectStoreError::Request {
                operation: "put",
                key: key.to_string(),
                message: "access denied".to_string(),
            })
        });

        let service = local_service(&dir, Some(Arc::new(objects))).await;
        let err = service
            .store(jpeg_file("sky.jpg"), UploadMeta::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Storage(_)));
        assert!(err.to_string().contains("access denied"));
        assert!(dir_is_empty(&dir));
        assert_eq!(service.records.count().await.unwrap(), 0);
    }
}
