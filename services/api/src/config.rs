use crate::generation_task::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the image poet API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Poem generation configuration
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Deployment environment (development, test, production)
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Take the client address from `X-Forwarded-For` (only behind a proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Upload storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for locally stored uploads
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Largest accepted upload in bytes (10MB default)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: usize,
    /// Store uploads in S3 instead of the upload directory
    #[serde(default)]
    pub use_s3: bool,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for image storage
    pub bucket: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, MinIO, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for uploaded images
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Vision model and retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// API key for the chat completions endpoint
    pub api_key: Option<String>,
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Vision-capable model name
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens in the reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Longest image side sent to the model
    #[serde(default = "default_max_image_side")]
    pub max_image_side: u32,
    /// JPEG quality of the re-encoded image
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Delay before the first background attempt in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay between background attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Total background attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

// Default value functions
fn default_service_name() -> String {
    "imagepoet-api".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_database_url() -> String {
    "sqlite://image_poet.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_file_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_region() -> String {
    "ap-northeast-2".to_string()
}

fn default_key_prefix() -> String {
    "images".to_string()
}

fn default_api_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_image_side() -> u32 {
    1024
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/imagepoet").required(false))
            .add_source(config::File::with_name("/etc/imagepoet/api").required(false))
            // Override with environment variables
            // IMAGEPOET__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("IMAGEPOET")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that are unsafe outside development
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.is_production() && self.database.url == default_database_url() {
            anyhow::bail!("database.url must be set explicitly in production");
        }
        if self.generation.max_attempts == 0 {
            anyhow::bail!("generation.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.service.environment == "development"
    }

    pub fn is_production(&self) -> bool {
        self.service.environment == "production"
    }

    /// CORS origins to allow; `None` means any origin
    pub fn cors_origins(&self) -> Option<&[String]> {
        if self.is_development() || self.api.cors_origins.is_empty() {
            None
        } else {
            Some(&self.api.cors_origins)
        }
    }

    /// Whether uploads should go to S3
    pub fn s3_enabled(&self) -> bool {
        self.storage.use_s3 && self.s3.bucket.is_some()
    }

    /// Retry policy for background generation
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.generation.initial_delay_ms),
            retry_delay: Duration::from_millis(self.generation.retry_delay_ms),
            max_attempts: self.generation.max_attempts,
        }
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl GenerationConfig {
    /// Get API request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
            metrics_port: default_metrics_port(),
            metrics_enabled: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            trust_forwarded_for: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_file_size_bytes: default_max_file_size(),
            use_s3: false,
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: default_api_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            max_image_side: default_max_image_side(),
            jpeg_quality: default_jpeg_quality(),
            initial_delay_ms: default_initial_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.storage.max_file_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.s3.region, "ap-northeast-2");
        assert_eq!(config.api.port, 8000);
        assert!(!config.storage.use_s3);
        assert!(!config.api.trust_forwarded_for);
        assert_eq!(config.generation.jpeg_quality, 85);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.retry_delay, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = Config::default();
        config.storage.use_s3 = true;
        assert!(!config.s3_enabled());

        config.s3.bucket = Some("poems".to_string());
        assert!(config.s3_enabled());
    }

    #[test]
    fn test_cors_any_in_development() {
        let mut config = Config::default();
        config.api.cors_origins = vec!["http://localhost:3000".to_string()];
        assert!(config.cors_origins().is_none());

        config.service.environment = "production".to_string();
        assert_eq!(config.cors_origins().map(|o| o.len()), Some(1));
    }

    #[test]
    fn test_production_requires_database_url() {
        let mut config = Config::default();
        config.service.environment = "production".to_string();
        assert!(config.validate().is_err());

        config.database.url = "sqlite:///var/lib/imagepoet/poems.db".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "storage": { "use_s3": true },
            "s3": { "bucket": "poems" }
        }))
        .unwrap();

        assert!(config.s3_enabled());
        assert_eq!(config.storage.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.generation.max_attempts, 3);
    }
}
