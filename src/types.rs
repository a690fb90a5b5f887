use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::GenerationLimits;
use crate::error::JobError;

pub const DEFAULT_PROMPT: &str = "a photo of";
pub const DEFAULT_BATCH_SIZE: usize = 4;
pub const DEFAULT_NUM_BEAMS: u32 = 3;

/// The `input` object of a job.
///
/// Exactly one of `data_url` / `data_urls` must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobInput {
    /// A single image URL, zip archive URL, or base64 data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    /// A list of image URLs or base64 data URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_beams: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// Where a job's images come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    /// `data_url`: one image, or one archive.
    Single(String),
    /// `data_urls`: a list of images.
    Many(Vec<String>),
}

impl JobInput {
    pub fn with_data_url(data_url: impl Into<String>) -> Self {
        Self {
            data_url: Some(data_url.into()),
            ..Default::default()
        }
    }

    pub fn with_data_urls<I, S>(data_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            data_urls: Some(data_urls.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Pick the single source field, rejecting none or both.
    pub fn source(&self) -> Result<JobSource, JobError> {
        match (&self.data_url, &self.data_urls) {
            (Some(_), Some(_)) => Err(JobError::input(
                "provide either data_url or data_urls, not both",
            )),
            (None, None) => Err(JobError::input("one of data_url or data_urls is required")),
            (Some(url), None) => {
                if url.trim().is_empty() {
                    return Err(JobError::input("data_url is empty"));
                }
                Ok(JobSource::Single(url.trim().to_string()))
            }
            (None, Some(urls)) => {
                if urls.is_empty() {
                    return Err(JobError::input("Empty data_urls array"));
                }
                if let Some(pos) = urls.iter().position(|u| u.trim().is_empty()) {
                    return Err(JobError::input(format!("data_urls[{}] is empty", pos)));
                }
                Ok(JobSource::Many(
                    urls.iter().map(|u| u.trim().to_string()).collect(),
                ))
            }
        }
    }
}

/// Generation parameters, validated once per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationParameters {
    pub prompt: String,
    pub max_length: u32,
    pub min_length: u32,
    pub num_beams: u32,
    pub batch_size: usize,
}

impl GenerationParameters {
    /// Apply defaults and ceilings to a job's optional parameters.
    ///
    /// Defaults follow the source shape: the single-image path favors short
    /// captions (40/8), the list path allows longer ones (50/5). Values over
    /// a ceiling are clamped.
    pub fn resolve(
        input: &JobInput,
        source: &JobSource,
        limits: &GenerationLimits,
    ) -> Result<Self, JobError> {
        let (default_max, default_min) = match source {
            JobSource::Single(_) => (40, 8),
            JobSource::Many(_) => (50, 5),
        };

        let max_length = input.max_length.unwrap_or(default_max);
        let num_beams = input.num_beams.unwrap_or(DEFAULT_NUM_BEAMS);
        let batch_size = input.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);

        if max_length == 0 {
            return Err(JobError::input("max_length must be at least 1"));
        }
        if num_beams == 0 {
            return Err(JobError::input("num_beams must be at least 1"));
        }
        if batch_size == 0 {
            return Err(JobError::input("batch_size must be at least 1"));
        }

        let max_length = clamp_logged("max_length", max_length, limits.max_length);
        let num_beams = clamp_logged("num_beams", num_beams, limits.num_beams);
        let batch_size = clamp_logged("batch_size", batch_size, limits.batch_size);
        let min_length = clamp_logged(
            "min_length",
            input.min_length.unwrap_or(default_min),
            max_length,
        );

        Ok(Self {
            prompt: input
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            max_length,
            min_length,
            num_beams,
            batch_size,
        })
    }
}

fn clamp_logged<T>(field: &str, value: T, ceiling: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if value > ceiling {
        tracing::warn!("{} clamped to {} (was {})", field, ceiling, value);
        ceiling
    } else {
        value
    }
}

/// Raw bytes of one image, as resolved from the job input.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    /// File path, URL, or positional name of the image.
    pub identifier: String,
    pub bytes: Vec<u8>,
}

/// An image decoded to 8-bit RGB and ready for captioning.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub identifier: String,
    pub image: RgbImage,
    pub width: u32,
    pub height: u32,
}

/// An archive entry that could not be read and was left out of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Caption text, or the message of the error that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionOutcome {
    Caption(String),
    Error(String),
}

impl CaptionOutcome {
    /// Render as caption text. Errors become `[ERROR: <message>]`.
    pub fn render(&self) -> String {
        match self {
            CaptionOutcome::Caption(text) => text.clone(),
            CaptionOutcome::Error(message) => format!("[ERROR: {}]", message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CaptionOutcome::Error(_))
    }
}

/// The result for one image that entered the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionResult {
    pub identifier: String,
    pub outcome: CaptionOutcome,
}

impl CaptionResult {
    pub fn caption(identifier: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            outcome: CaptionOutcome::Caption(caption.into()),
        }
    }

    pub fn error(identifier: impl Into<String>, message: impl ToString) -> Self {
        Self {
            identifier: identifier.into(),
            outcome: CaptionOutcome::Error(message.to_string()),
        }
    }
}

/// Response shape, fixed once per job after sources are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One image submitted through `data_url`.
    Single,
    /// Everything else: lists and archives.
    Batch,
}

/// One `{image_path, caption}` entry of a batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionEntry {
    pub image_path: String,
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub device: String,
    pub model: String,
    pub max_length: u32,
    pub num_beams: u32,
}

/// Job output in either response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Single {
        caption: String,
        /// Seconds from job start to assembly.
        processing_time: f64,
        model_info: ModelInfo,
    },
    Batch {
        captions: Vec<CaptionEntry>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        skipped: Vec<SkippedEntry>,
    },
}

/// A job as delivered by the serverless runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// The handler's reply: `output` on success, `error` on job failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Accelerator memory held by the engine's loaded models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub loaded_models: Vec<String>,
    pub accelerator_bytes: u64,
}

impl MemoryUsage {
    /// Whether `model` is among the loaded models. An untagged name matches
    /// its `:latest` tag.
    pub fn has_model(&self, model: &str) -> bool {
        self.loaded_models
            .iter()
            .any(|name| name == model || name.strip_suffix(":latest") == Some(model))
    }

    pub fn gibibytes(&self) -> f64 {
        self.accelerator_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub device: String,
    pub model: String,
    pub engine_reachable: bool,
    /// `None` when the engine does not report loaded models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_loaded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 timestamp of the check.
    pub timestamp: String,
}
