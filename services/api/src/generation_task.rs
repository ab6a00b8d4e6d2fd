use crate::poetry_client::{GenerationError, Poem, PoemGenerator};
use crate::prompts::{PoemLanguage, PoemStyle};
use crate::record_store::{ImageRecord, RecordStore};
use crate::upload::UploadService;
use backoff::backoff::{Backoff, Constant};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Timing and attempt budget for background generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Three attempts with no waiting
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_attempts: 3,
        }
    }
}

/// How a background generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Poem stored
    Done,
    /// Record was missing, nothing to do
    Skipped,
    /// Every attempt failed; the record is unchanged
    Failed,
}

/// Generates poems for stored images
#[derive(Clone)]
pub struct GenerationTask {
    records: RecordStore,
    uploads: Arc<UploadService>,
    generator: Option<Arc<dyn PoemGenerator>>,
    policy: RetryPolicy,
}

impl GenerationTask {
    pub fn new(
        records: RecordStore,
        uploads: Arc<UploadService>,
        generator: Option<Arc<dyn PoemGenerator>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            records,
            uploads,
            generator,
            policy,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.generator.is_some()
    }

    /// Run generation for an image in the background
    pub fn spawn(
        &self,
        image_id: i64,
        style: PoemStyle,
        language: PoemLanguage,
    ) -> JoinHandle<GenerationOutcome> {
        let task = self.clone();
        tokio::spawn(async move { task.run(image_id, style, language).await })
    }

    #[instrument(skip(self), fields(max_attempts = self.policy.max_attempts))]
    pub async fn run(
        &self,
        image_id: i64,
        style: PoemStyle,
        language: PoemLanguage,
    ) -> GenerationOutcome {
        match self.records.get(image_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(image_id, "Image gone before generation started");
                return GenerationOutcome::Skipped;
            }
            Err(e) => {
                error!(image_id, error = ?e, "Failed to load image for generation");
                return GenerationOutcome::Failed;
            }
        }

        tokio::time::sleep(self.policy.initial_delay).await;

        let mut backoff = Constant::new(self.policy.retry_delay);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            // Reload each attempt so a delete in the meantime is noticed
            let record = match self.records.get(image_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    info!(image_id, attempt, "Image deleted during generation");
                    return GenerationOutcome::Skipped;
                }
                Err(e) => {
                    error!(image_id, error = ?e, "Failed to reload image for generation");
                    return GenerationOutcome::Failed;
                }
            };

            match self.generate_once(&record, style, language).await {
                Ok(poem) => return self.store_poem(image_id, &poem, attempt).await,
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.policy.retry_delay);
                    warn!(
                        image_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Poetry generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!("imagepoet.generation.failed").increment(1);
                    error!(
                        image_id,
                        attempts = attempt,
                        error = %e,
                        "Poetry generation failed after all attempts"
                    );
                    return GenerationOutcome::Failed;
                }
            }
        }
    }

    /// One generation attempt for a record, without persisting the result
    pub async fn generate_once(
        &self,
        record: &ImageRecord,
        style: PoemStyle,
        language: PoemLanguage,
    ) -> Result<Poem, GenerationError> {
        let generator = self
            .generator
            .as_ref()
            .ok_or(GenerationError::MissingApiKey)?;
        let bytes = self.load_image_bytes(record).await?;
        generator.generate(bytes, style, language).await
    }

    async fn load_image_bytes(&self, record: &ImageRecord) -> Result<Vec<u8>, GenerationError> {
        match self.uploads.read_image(record).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(GenerationError::ImageUnavailable(
                "Image file not found".to_string(),
            )),
            Err(e) => Err(GenerationError::ImageUnavailable(format!("{e:#}"))),
        }
    }

    async fn store_poem(&self, image_id: i64, poem: &Poem, attempt: u32) -> GenerationOutcome {
        match self
            .records
            .mark_generated(image_id, &poem.title, &poem.body)
            .await
        {
            Ok(Some(_)) => {
                metrics::counter!("imagepoet.generation.succeeded").increment(1);
                info!(image_id, attempt, title = %poem.title, "Poem stored");
                GenerationOutcome::Done
            }
            Ok(None) => {
                info!(image_id, "Image deleted before poem could be stored");
                GenerationOutcome::Skipped
            }
            Err(e) => {
                error!(image_id, error = ?e, "Failed to store generated poem");
                GenerationOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_prep::tests::sample_jpeg;
    use crate::local_store::LocalStore;
    use crate::poetry_client::MockPoemGenerator;
    use crate::upload::{IncomingFile, UploadMeta};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        records: RecordStore,
        uploads: Arc<UploadService>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let records = RecordStore::in_memory().await.unwrap();
        let local = LocalStore::new(dir.path()).await.unwrap();
        let uploads = Arc::new(UploadService::new(
            local,
            None,
            records.clone(),
            10 * 1024 * 1024,
            "images",
        ));
        Fixture {
            _dir: dir,
            records,
            uploads,
        }
    }

    async fn upload(fixture: &Fixture) -> ImageRecord {
        let file = IncomingFile {
            bytes: sample_jpeg(32, 32),
            filename: Some("field.jpg".to_string()),
            content_type: Some("image/jpeg".to_string()),
        };
        fixture
            .uploads
            .store(file, UploadMeta::default())
            .await
            .unwrap()
    }

    fn task(fixture: &Fixture, generator: MockPoemGenerator) -> GenerationTask {
        GenerationTask::new(
            fixture.records.clone(),
            fixture.uploads.clone(),
            Some(Arc::new(generator)),
            RetryPolicy::immediate(),
        )
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let fixture = fixture().await;
        let record = upload(&fixture).await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut generator = MockPoemGenerator::new();
        generator.expect_generate().times(3).returning(move |_, _, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(GenerationError::EmptyReply)
            } else {
                Ok(Poem {
                    title: format!("Attempt {n}"),
                    body: "third time lucky".to_string(),
                })
            }
        });

        let outcome = task(&fixture, generator)
            .spawn(record.id, PoemStyle::Classic, PoemLanguage::English)
            .await
            .unwrap();

        assert_eq!(outcome, GenerationOutcome::Done);
        let stored = fixture.records.get(record.id).await.unwrap().unwrap();
        assert!(stored.poem_generated);
        assert_eq!(stored.poem_title.as_deref(), Some("Attempt 3"));
        assert_eq!(stored.poem_body.as_deref(), Some("third time lucky"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let fixture = fixture().await;
        let record = upload(&fixture).await;

        let mut generator = MockPoemGenerator::new();
        generator
            .expect_generate()
            .times(3)
            .returning(|_, _, _| Err(GenerationError::Remote("model overloaded".to_string())));

        let outcome = task(&fixture, generator)
            .run(record.id, PoemStyle::Haiku, PoemLanguage::Japanese)
            .await;

        assert_eq!(outcome, GenerationOutcome::Failed);
        let stored = fixture.records.get(record.id).await.unwrap().unwrap();
        assert!(!stored.poem_generated);
        assert!(stored.poem_title.is_none());
        assert_eq!(stored.updated_at, record.updated_at);
    }

    #[tokio::test]
    async fn test_missing_record_is_noop() {
        let fixture = fixture().await;
        let mut generator = MockPoemGenerator::new();
        generator.expect_generate().never();

        let outcome = task(&fixture, generator)
            .run(99999, PoemStyle::Classic, PoemLanguage::Korean)
            .await;
        assert_eq!(outcome, GenerationOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_passes_style_language_and_bytes() {
        let fixture = fixture().await;
        let record = upload(&fixture).await;

        let mut generator = MockPoemGenerator::new();
        generator
            .expect_generate()
            .withf(|image, style, language| {
                *image == sample_jpeg(32, 32)
                    && *style == PoemStyle::FreeVerse
                    && *language == PoemLanguage::Korean
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(Poem {
                    title: "들판".to_string(),
                    body: "바람이 분다".to_string(),
                })
            });

        let outcome = task(&fixture, generator)
            .run(record.id, PoemStyle::FreeVerse, PoemLanguage::Korean)
            .await;
        assert_eq!(outcome, GenerationOutcome::Done);
    }

    #[tokio::test]
    async fn test_missing_blob_counts_as_failed_attempt() {
        let fixture = fixture().await;
        let record = upload(&fixture).await;
        fixture.uploads.remove_image(&record).await;

        let mut generator = MockPoemGenerator::new();
        generator.expect_generate().never();

        let task = task(&fixture, generator);
        let err = task
            .generate_once(&record, PoemStyle::Classic, PoemLanguage::Korean)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::ImageUnavailable(_)));

        let outcome = task
            .run(record.id, PoemStyle::Classic, PoemLanguage::Korean)
            .await;
        assert_eq!(outcome, GenerationOutcome::Failed);
    }

    #[tokio::test]
    async fn test_without_generator() {
        let fixture = fixture().await;
        let record = upload(&fixture).await;
        let task = GenerationTask::new(
            fixture.records.clone(),
            fixture.uploads.clone(),
            None,
            RetryPolicy::immediate(),
        );

        assert!(!task.is_configured());
        let err = task
            .generate_once(&record, PoemStyle::Classic, PoemLanguage::Korean)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::MissingApiKey));
        assert_eq!(
            task.run(record.id, PoemStyle::Classic, PoemLanguage::Korean).await,
            GenerationOutcome::Failed
        );
    }
}
