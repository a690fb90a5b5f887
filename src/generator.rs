use std::future::Future;

use crate::error::GenerationError;
use crate::types::{DecodedImage, GenerationParameters, MemoryUsage};

/// Per-image results of one batched generator call.
pub type BatchOutput = Vec<Result<String, GenerationError>>;

/// An image-captioning inference engine.
///
/// The worker creates one generator at startup and hands it to every job by
/// reference. Implementations must be safe to share across the worker's
/// lifetime; jobs never mutate it.
///
/// # Example
///
/// ```
/// use caption_worker::{CaptionGenerator, DecodedImage, GenerationError, GenerationParameters};
///
/// struct FixedCaption;
///
/// impl CaptionGenerator for FixedCaption {
///     async fn generate(
///         &self,
///         _image: &DecodedImage,
///         params: &GenerationParameters,
///     ) -> Result<String, GenerationError> {
///         Ok(format!("{} something", params.prompt))
///     }
///
///     async fn generate_batch(
///         &self,
///         images: &[DecodedImage],
///         params: &GenerationParameters,
///     ) -> Result<Vec<Result<String, GenerationError>>, GenerationError> {
///         Ok(images.iter().map(|_| Ok(format!("{} something", params.prompt))).collect())
///     }
///
///     fn model_name(&self) -> &str {
///         "fixed"
///     }
/// }
/// ```
pub trait CaptionGenerator: Send + Sync {
    /// Caption a single image.
    fn generate(
        &self,
        image: &DecodedImage,
        params: &GenerationParameters,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send;

    /// Caption a group of images in one call.
    ///
    /// The outer error fails the whole group. A
    /// [`GenerationError::ResourceExhausted`] outer error makes the caller
    /// retry the group one image at a time. On success the result must hold
    /// one entry per input image, in input order.
    fn generate_batch(
        &self,
        images: &[DecodedImage],
        params: &GenerationParameters,
    ) -> impl Future<Output = Result<BatchOutput, GenerationError>> + Send;

    /// Cheap cleanup run after every group.
    fn clear_cache(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Free held accelerator memory after a resource-exhaustion failure.
    fn release_memory(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Check that the engine can serve requests.
    fn health(&self) -> impl Future<Output = Result<(), GenerationError>> + Send {
        async { Ok(()) }
    }

    /// Accelerator memory currently held by the engine, if it reports it.
    fn memory_usage(&self) -> impl Future<Output = Option<MemoryUsage>> + Send {
        async { None }
    }

    /// Model identifier reported in responses.
    fn model_name(&self) -> &str;

    /// Device label reported in responses.
    fn device(&self) -> &str {
        "cpu"
    }
}
