//! # caption-worker
//!
//! Serverless image captioning worker. A job names its images as a URL, a
//! list of URLs, a zip archive, or base64 data URLs; the worker normalizes
//! them into decoded RGB images, captions them in memory-bounded groups, and
//! returns the captions as JSON.
//!
//! ## Features
//!
//! - **Input normalization**: http(s) URLs, base64 data URLs, and zip
//!   archives (fetched or inline) all become one ordered list of images
//! - **Bounded batching**: images are captioned in groups of `batch_size`,
//!   with the engine's cache cleared between groups
//! - **Out-of-memory fallback**: a group that exhausts accelerator memory is
//!   retried one image at a time
//! - **Partial results**: undecodable images and failed generations become
//!   `[ERROR: ...]` captions instead of failing the job
//! - **Pluggable engine**: any [`CaptionGenerator`]; [`OllamaGenerator`]
//!   ships in the box
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use caption_worker::{CaptionHandler, JobInput, OllamaGenerator, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::builder().with_model("llava").build();
//!     let client = reqwest::Client::new();
//!     let generator = OllamaGenerator::new(client.clone(), config.clone());
//!     let handler = CaptionHandler::new(&generator, client, config);
//!
//!     let output = handler
//!         .handle(&JobInput::with_data_url("https://example.com/cat.jpg"))
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&output)?);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod config;
pub mod decoder;
pub mod error;
pub mod generator;
pub mod handler;
pub mod ollama;
pub mod orchestrator;
pub mod parser;
pub mod resolver;
pub mod types;

// Re-export main types at crate root
pub use config::{GenerationLimits, WorkerConfig, WorkerConfigBuilder};
pub use error::{ConfigError, DecodeError, GenerationError, JobError};
pub use generator::{BatchOutput, CaptionGenerator};
pub use handler::CaptionHandler;
pub use ollama::OllamaGenerator;
pub use orchestrator::{
    BatchOrchestrator, BatchStrategy, ExecutionStrategy, OrchestrationStats, SingleStrategy,
};
pub use resolver::{ResolvedSources, SourceResolver};
pub use types::{
    CaptionEntry, CaptionOutcome, CaptionResult, DecodedImage, GenerationParameters,
    HealthReport, HealthStatus, ImageDescriptor, JobInput, JobOutput, JobRequest, JobResponse,
    JobSource, MemoryUsage, ModelInfo, ResponseMode, SkippedEntry,
};
