use crate::config::GenerationConfig;
use crate::image_prep::{prepare_for_vision, PrepError};
use crate::poem_parser::parse_reply;
use crate::prompts::{prompt_for, PoemLanguage, PoemStyle};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use crate::poem_parser::Poem;

/// Errors that can occur while generating a poem
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("OpenAI API key is not configured")]
    MissingApiKey,

    #[error(transparent)]
    Prep(#[from] PrepError),

    #[error("Request to generation API failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Generation API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Generation API error: {0}")]
    Remote(String),

    #[error("Generation API returned no content")]
    EmptyReply,

    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("Image preparation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Turns image bytes into a poem
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PoemGenerator: Send + Sync {
    async fn generate(
        &self,
        image: Vec<u8>,
        style: PoemStyle,
        language: PoemLanguage,
    ) -> Result<Poem, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Option<Vec<ChatChoice>>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: Option<String>,
}

/// Vision chat-completions client for OpenAI-compatible APIs
pub struct OpenAiPoetClient {
    http: Client,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_image_side: u32,
    jpeg_quality: u8,
}

impl OpenAiPoetClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(GenerationError::MissingApiKey)?
            .to_string();

        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        let endpoint = format!(
            "{}/chat/completions",
            config.api_base_url.trim_end_matches('/')
        );

        info!(model = %config.model, endpoint = %endpoint, "Poetry client initialized");

        Ok(Self {
            http,
            api_key,
            endpoint,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_image_side: config.max_image_side,
            jpeg_quality: config.jpeg_quality,
        })
    }

    fn request_body(&self, prompt: &str, data_url: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": prompt},
                        {"type": "image_url", "image_url": {"url": data_url, "detail": "high"}}
                    ]
                }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature
        })
    }

    async fn complete(&self, body: &Value) -> Result<String, GenerationError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ChatCompletionResponse = response.json().await?;
        reply_content(payload)
    }
}

fn reply_content(payload: ChatCompletionResponse) -> Result<String, GenerationError> {
    if let Some(message) = payload.error.and_then(|err| err.message) {
        return Err(GenerationError::Remote(message));
    }

    payload
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(GenerationError::EmptyReply)
}

#[async_trait]
impl PoemGenerator for OpenAiPoetClient {
    #[instrument(skip(self, image), fields(image_bytes = image.len()))]
    async fn generate(
        &self,
        image: Vec<u8>,
        style: PoemStyle,
        language: PoemLanguage,
    ) -> Result<Poem, GenerationError> {
        let start = Instant::now();
        let (max_side, quality) = (self.max_image_side, self.jpeg_quality);
        let prepared =
            tokio::task::spawn_blocking(move || prepare_for_vision(&image, max_side, quality))
                .await??;

        debug!(
            width = prepared.width,
            height = prepared.height,
            jpeg_bytes = prepared.jpeg.len(),
            "Image prepared for vision request"
        );

        let body = self.request_body(prompt_for(language, style), &prepared.data_url());
        let reply = self.complete(&body).await?;
        let poem = parse_reply(&reply, language);

        let elapsed = start.elapsed();
        metrics::histogram!("imagepoet.generation.duration_seconds").record(elapsed.as_secs_f64());
        info!(
            title = %poem.title,
            elapsed_ms = elapsed.as_millis() as u64,
            "Poem generated"
        );

        Ok(poem)
    }
}
