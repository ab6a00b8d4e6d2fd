//! Image Poet API Service
//!
//! HTTP service that accepts image uploads, keeps them on local disk or in
//! S3, records them in SQLite and asks a vision model to write a poem about
//! each one.
//!
//! ## Features
//!
//! - **Validated Uploads**: size, extension and MIME checks before any I/O,
//!   with cleanup when storage or indexing fails
//! - **Pluggable Blob Storage**: local upload directory or S3 (LocalStack and
//!   MinIO via endpoint override)
//! - **Poem Generation**: OpenAI-compatible vision requests in Korean,
//!   English or Japanese across four styles
//! - **Background Retry**: detached generation tasks with a fixed-delay retry
//!   budget
//!
//! ## Architecture
//!
//! ```text
//!  HTTP client
//!      │
//!      ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ API router   │───▶│ Upload       │───▶│ Local dir /  │
//! │ (axum)       │    │ Service      │    │ S3 bucket    │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!      │                     │                   ▲
//!      │                     ▼                   │
//!      │              ┌──────────────┐           │
//!      │              │ Record Store │           │
//!      │              │ (SQLite)     │           │
//!      │              └──────────────┘           │
//!      │                     ▲                   │
//!      ▼                     │                   │
//! ┌──────────────┐    ┌──────────────┐           │
//! │ Generation   │───▶│ Poetry       │           │
//! │ Task         │    │ Client       │           │
//! └──────────────┘    └──────────────┘           │
//!      └─────────────── reads image bytes ───────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod generation_task;
pub mod image_prep;
pub mod local_store;
pub mod object_store;
pub mod poem_parser;
pub mod poetry_client;
pub mod prompts;
pub mod record_store;
pub mod upload;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use error::ApiError;
pub use generation_task::{GenerationOutcome, GenerationTask, RetryPolicy};
pub use local_store::LocalStore;
pub use object_store::{BucketInfo, ObjectStore, S3ObjectStore};
pub use poetry_client::{GenerationError, OpenAiPoetClient, Poem, PoemGenerator};
pub use prompts::{PoemLanguage, PoemStyle};
pub use record_store::{ImageRecord, RecordStore, StorageBackend};
pub use upload::{UploadError, UploadService};
