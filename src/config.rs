use std::time::Duration;

use crate::decoder::DEFAULT_MAX_DIMENSION;
use crate::error::ConfigError;

/// 64 MiB
pub const DEFAULT_MAX_SOURCE_BYTES: u64 = 64 * 1024 * 1024;

/// Upper bounds applied to per-job generation parameters.
///
/// Requests above a ceiling are clamped, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_length: u32,
    pub num_beams: u32,
    pub batch_size: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_length: 50,
            num_beams: 3,
            batch_size: 8,
        }
    }
}

/// Configuration for the caption worker.
///
/// Use [`WorkerConfig::builder()`] for ergonomic construction,
/// [`WorkerConfig::from_env()`] inside the deployed worker, or
/// [`WorkerConfig::default()`] for a local Ollama instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Ollama API endpoint (e.g., "http://localhost:11434")
    pub endpoint: String,
    /// Vision model name (e.g., "llava", "moondream", "llama3.2-vision")
    pub model: String,
    /// Timeout for one caption request (default: 120s)
    pub request_timeout: Duration,
    /// Timeout for fetching a source URL or archive (default: 30s)
    pub fetch_timeout: Duration,
    /// Images larger than this on either side are downscaled (default: 512)
    pub max_dimension: u32,
    /// Largest fetched body, data URL payload, or unpacked archive entry
    pub max_source_bytes: u64,
    /// Device label reported in model info (default: "cuda")
    pub device: String,
    pub limits: GenerationLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llava".to_string(),
            request_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(30),
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            device: "cuda".to_string(),
            limits: GenerationLimits::default(),
        }
    }
}

impl WorkerConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// Build a config from `CAPTION_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("CAPTION_OLLAMA_ENDPOINT") {
            config.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("CAPTION_MODEL") {
            config.model = model;
        }
        if let Some(device) = lookup("CAPTION_DEVICE") {
            config.device = device;
        }
        if let Some(secs) = lookup("CAPTION_REQUEST_TIMEOUT_SECS") {
            config.request_timeout =
                Duration::from_secs(parse_positive("CAPTION_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("CAPTION_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout =
                Duration::from_secs(parse_positive("CAPTION_FETCH_TIMEOUT_SECS", &secs)?);
        }
        if let Some(dim) = lookup("CAPTION_MAX_DIMENSION") {
            config.max_dimension = parse_positive("CAPTION_MAX_DIMENSION", &dim)? as u32;
        }
        if let Some(bytes) = lookup("CAPTION_MAX_SOURCE_BYTES") {
            config.max_source_bytes = parse_positive("CAPTION_MAX_SOURCE_BYTES", &bytes)?;
        }

        Ok(config)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let parsed: u64 = value
        .trim()
        .parse()
        .map_err(|_| invalid("expected a positive integer"))?;
    if parsed == 0 || parsed > u32::MAX as u64 {
        return Err(invalid("out of range"));
    }
    Ok(parsed)
}

/// Builder for [`WorkerConfig`].
#[derive(Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Set the Ollama endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Set the vision model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the timeout for fetching source URLs and archives.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the downscale threshold in pixels.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.config.max_dimension = max_dimension;
        self
    }

    /// Set the size cap for source bodies and archive entries.
    pub fn with_max_source_bytes(mut self, max_source_bytes: u64) -> Self {
        self.config.max_source_bytes = max_source_bytes;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.config.device = device.into();
        self
    }

    pub fn with_limits(mut self, limits: GenerationLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Build the final [`WorkerConfig`].
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}
