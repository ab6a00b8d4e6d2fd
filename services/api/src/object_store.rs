use crate::config::S3Config;
use crate::local_store::round2;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("S3 {operation} failed for '{key}': {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("Failed to read object body for '{key}': {message}")]
    Body { key: String, message: String },
}

/// Bucket figures for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketInfo {
    pub bucket_name: String,
    pub region: String,
    pub object_count: u64,
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub total_size_gb: f64,
}

impl BucketInfo {
    pub fn new(bucket_name: &str, region: &str, object_count: u64, total_size_bytes: u64) -> Self {
        let mb = total_size_bytes as f64 / (1024.0 * 1024.0);
        Self {
            bucket_name: bucket_name.to_string(),
            region: region.to_string(),
            object_count,
            total_size_bytes,
            total_size_mb: round2(mb),
            total_size_gb: round2(mb / 1024.0),
        }
    }
}

/// Remote blob storage for uploaded images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object and return its durable URL
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        original_filename: &str,
    ) -> Result<String, ObjectStoreError>;

    /// Object bytes, `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    async fn bucket_info(&self) -> Result<BucketInfo, ObjectStoreError>;

    fn bucket(&self) -> &str;

    fn region(&self) -> &str;
}

/// URL of an object, honouring an endpoint override
pub fn object_url(bucket: &str, region: &str, endpoint_url: Option<&str>, key: &str) -> String {
    match endpoint_url {
        Some(endpoint) => format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/')),
        None => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    }
}

/// Object metadata values must be plain ASCII
fn metadata_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

fn request_error<E>(operation: &'static str, key: &str, err: E) -> ObjectStoreError
where
    E: std::error::Error,
{
    ObjectStoreError::Request {
        operation,
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
}

impl S3ObjectStore {
    /// Build a client for the configured bucket. Returns `None` without a bucket.
    pub async fn new(config: &S3Config) -> Option<Self> {
        let bucket = config.bucket.clone()?;

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // LocalStack/MinIO
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %bucket,
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Some(Self {
            client,
            bucket,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    async fn usage(&self) -> Result<(u64, u64), ObjectStoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();

        let (mut count, mut bytes) = (0u64, 0u64);
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| request_error("list", &self.bucket, e))?;
            for object in page.contents() {
                count += 1;
                bytes += object.size().unwrap_or(0).max(0) as u64;
            }
        }
        Ok((count, bytes))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        original_filename: &str,
    ) -> Result<String, ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .metadata("original-filename", metadata_value(original_filename))
            .metadata("upload-timestamp", Utc::now().to_rfc3339())
            .send()
            .await
            .map_err(|e| request_error("put", key, e))?;

        let url = object_url(&self.bucket, &self.region, self.endpoint_url.as_deref(), key);
        info!(key = %key, "Object uploaded to S3");
        Ok(url)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(request_error("get", key, e));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Body {
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();

        Ok(Some(bytes.to_vec()))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_error("delete", key, e))?;

        debug!(key = %key, "Object deleted from S3");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(request_error("head", key, e))
                }
            }
        }
    }

    /// Fails when the bucket is unreachable. Listing errors only zero the counts.
    async fn bucket_info(&self) -> Result<BucketInfo, ObjectStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| request_error("head_bucket", &self.bucket, e))?;

        let (count, bytes) = match self.usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, bucket = %self.bucket, "Failed to list bucket contents");
                (0, 0)
            }
        };

        Ok(BucketInfo::new(&self.bucket, &self.region, count, bytes))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn region(&self) -> &str {
        &self.region
    }
}
