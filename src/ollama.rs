//! Caption generator backed by an Ollama vision model.

use std::io::Cursor;

use base64::Engine;
use futures::future::join_all;
use image::ImageFormat;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::WorkerConfig;
use crate::error::GenerationError;
use crate::generator::{BatchOutput, CaptionGenerator};
use crate::parser;
use crate::types::{DecodedImage, GenerationParameters, MemoryUsage};

const MEMORY_EXHAUSTION_MARKERS: &[&str] = &[
    "out of memory",
    "requires more system memory",
    "insufficient memory",
    "cudamalloc failed",
];

/// Ollama sampling options. Captioning runs greedy for repeatable output.
#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    repeat_penalty: f32,
}

impl GenerateOptions {
    fn for_params(params: &GenerationParameters) -> Self {
        Self {
            // Words to tokens, with headroom for punctuation
            num_predict: params.max_length.saturating_mul(2).max(16),
            temperature: 0.0,
            repeat_penalty: 1.05,
        }
    }
}

/// `/api/ps` response: models currently loaded by the server.
#[derive(Debug, Deserialize)]
struct RunningModels {
    #[serde(default)]
    models: Vec<RunningModel>,
}

#[derive(Debug, Deserialize)]
struct RunningModel {
    name: String,
    #[serde(default)]
    size_vram: u64,
}

impl From<RunningModels> for MemoryUsage {
    fn from(running: RunningModels) -> Self {
        MemoryUsage {
            accelerator_bytes: running.models.iter().map(|m| m.size_vram).sum(),
            loaded_models: running.models.into_iter().map(|m| m.name).collect(),
        }
    }
}

/// Generator that sends each image to Ollama's `/api/generate`.
///
/// Ollama has no beam search, so `num_beams` only shows up in model info.
/// A batch is the group's requests in flight together; Ollama schedules them
/// on the loaded model according to its own parallelism settings.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: Client,
    config: WorkerConfig,
}

impl OllamaGenerator {
    pub fn new(client: Client, config: WorkerConfig) -> Self {
        Self { client, config }
    }

    async fn post_generate(&self, body: &serde_json::Value) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.config.endpoint);
        let resp = self
            .client
            .post(&url)
            .timeout(self.config.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| GenerationError::Connection(self.config.endpoint.clone(), e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_engine_error(status, text));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return Err(classify_engine_error(500, err.to_string()));
        }

        Ok(json
            .get("response")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string())
    }
}

impl CaptionGenerator for OllamaGenerator {
    async fn generate(
        &self,
        image: &DecodedImage,
        params: &GenerationParameters,
    ) -> Result<String, GenerationError> {
        let image_b64 = encode_png_base64(image)?;

        let body = json!({
            "model": self.config.model,
            "prompt": caption_instruction(params),
            "images": [image_b64],
            "stream": false,
            "options": GenerateOptions::for_params(params),
        });

        let raw = self.post_generate(&body).await?;
        let caption =
            parser::clean_caption(&raw, &params.prompt).ok_or(GenerationError::EmptyCaption)?;

        let words = parser::word_count(&caption);
        if words < params.min_length as usize {
            tracing::debug!(
                "Caption for {} has {} words (min_length {})",
                image.identifier,
                words,
                params.min_length
            );
        }
        Ok(caption)
    }

    async fn generate_batch(
        &self,
        images: &[DecodedImage],
        params: &GenerationParameters,
    ) -> Result<BatchOutput, GenerationError> {
        let results = join_all(images.iter().map(|image| self.generate(image, params))).await;

        if let Some(exhausted) = results
            .iter()
            .find_map(|r| r.as_ref().err().filter(|e| e.is_resource_exhausted()))
        {
            return Err(exhausted.clone());
        }
        Ok(results)
    }

    async fn release_memory(&self) {
        // keep_alive 0 unloads the model and frees its VRAM
        let body = json!({ "model": self.config.model, "keep_alive": 0 });
        match self.post_generate(&body).await {
            Ok(_) => tracing::info!("Unloaded {} to release accelerator memory", self.config.model),
            Err(e) => tracing::warn!("Failed to unload {}: {}", self.config.model, e),
        }
    }

    async fn health(&self) -> Result<(), GenerationError> {
        let url = format!("{}/api/tags", self.config.endpoint);
        let resp = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| GenerationError::Connection(self.config.endpoint.clone(), e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Engine(status, text));
        }
        Ok(())
    }

    async fn memory_usage(&self) -> Option<MemoryUsage> {
        let url = format!("{}/api/ps", self.config.endpoint);
        let resp = match self
            .client
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::debug!("{} returned HTTP {}", url, resp.status().as_u16());
                return None;
            }
            Err(e) => {
                tracing::debug!("Cannot read running models from {}: {}", url, e);
                return None;
            }
        };

        match resp.json::<RunningModels>().await {
            Ok(running) => Some(running.into()),
            Err(e) => {
                tracing::debug!("Invalid /api/ps response: {}", e);
                None
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn device(&self) -> &str {
        &self.config.device
    }
}

fn caption_instruction(params: &GenerationParameters) -> String {
    format!(
        "Write one caption for this image, between {} and {} words long. \
         It must begin with \"{}\". Reply with the caption only.",
        params.min_length, params.max_length, params.prompt
    )
}

fn classify_engine_error(status: u16, text: String) -> GenerationError {
    let lower = text.to_lowercase();
    if MEMORY_EXHAUSTION_MARKERS.iter().any(|m| lower.contains(m)) {
        GenerationError::ResourceExhausted(text)
    } else {
        GenerationError::Engine(status, text)
    }
}

fn encode_png_base64(image: &DecodedImage) -> Result<String, GenerationError> {
    let mut png = Cursor::new(Vec::new());
    image
        .image
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| GenerationError::Encode(format!("{}: {}", image.identifier, e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png.into_inner()))
}
