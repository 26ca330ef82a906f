//! Generator adapter: deterministic text generation with retry
//!
//! The generative model is an external collaborator behind the `Generator`
//! trait. The shipped implementation talks to an Ollama-compatible
//! `/api/generate` endpoint at temperature 0 and retries transient failures
//! with a fixed backoff schedule (3 attempts, 0.5/1/2 s).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// Text generation contract: `generate(prompt) -> text`, deterministic at
/// temperature 0, no streaming.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama-compatible generation client with automatic retry.
pub struct HttpGenerator {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::generator(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn generate_once(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.config.base_url);
        let request = GenerateRequest {
            model: self.config.generate_model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::generator(format!("generation request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::generator(format!(
                "generation failed: HTTP {status} - {body}"
            )));
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::generator(format!("failed to parse generation response: {e}")))?;
        Ok(payload.response)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..self.config.max_retries {
            match self.generate_once(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < self.config.max_retries {
                        // Backoff schedule: 0.5 s, 1 s, 2 s.
                        let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                        tracing::warn!(
                            attempt = attempt + 1,
                            retries = self.config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "generation attempt failed, retrying"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::generator("generation failed with no attempts")))
    }
}
