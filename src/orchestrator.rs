//! Memory-bounded batch execution.
//!
//! Decoded images are captioned in contiguous groups of `batch_size`. Each
//! group first runs through [`BatchStrategy`] (one generator call for the
//! whole group). If the engine runs out of memory, its memory is released
//! and the same group is retried through [`SingleStrategy`] (one call per
//! image). The generator's cache is cleared after every group, so peak
//! memory stays at one group's worth regardless of job size.

use std::future::Future;

use crate::error::{DecodeError, GenerationError};
use crate::generator::CaptionGenerator;
use crate::types::{CaptionResult, DecodedImage, GenerationParameters};

/// A way of running one group of images through a generator.
pub trait ExecutionStrategy: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &'static str;

    /// Caption `group`, returning one result per image in input order.
    ///
    /// An `Err` fails the whole group; per-image failures are returned as
    /// error results.
    fn generate<G: CaptionGenerator>(
        &self,
        generator: &G,
        group: &[DecodedImage],
        params: &GenerationParameters,
    ) -> impl Future<Output = Result<Vec<CaptionResult>, GenerationError>> + Send;
}

/// One batched generator call for the whole group.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStrategy;

impl ExecutionStrategy for BatchStrategy {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn generate<G: CaptionGenerator>(
        &self,
        generator: &G,
        group: &[DecodedImage],
        params: &GenerationParameters,
    ) -> Result<Vec<CaptionResult>, GenerationError> {
        let outputs = generator.generate_batch(group, params).await?;

        if outputs.len() != group.len() {
            return Err(GenerationError::InvalidResponse(format!(
                "engine returned {} captions for {} images",
                outputs.len(),
                group.len()
            )));
        }

        Ok(group
            .iter()
            .zip(outputs)
            .map(|(image, output)| to_result(image, output))
            .collect())
    }
}

/// One generator call per image, sequentially.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleStrategy;

impl ExecutionStrategy for SingleStrategy {
    fn name(&self) -> &'static str {
        "single"
    }

    async fn generate<G: CaptionGenerator>(
        &self,
        generator: &G,
        group: &[DecodedImage],
        params: &GenerationParameters,
    ) -> Result<Vec<CaptionResult>, GenerationError> {
        let mut results = Vec::with_capacity(group.len());
        for image in group {
            let output = generator.generate(image, params).await;
            results.push(to_result(image, output));
        }
        Ok(results)
    }
}

fn to_result(image: &DecodedImage, output: Result<String, GenerationError>) -> CaptionResult {
    match output {
        Ok(caption) => {
            tracing::debug!("Captioned {}: {:?}", image.identifier, caption);
            CaptionResult::caption(&image.identifier, caption)
        }
        Err(e) => {
            tracing::warn!("Caption generation failed for {}: {}", image.identifier, e);
            CaptionResult::error(&image.identifier, e)
        }
    }
}

/// Counters from one orchestration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestrationStats {
    /// Groups processed.
    pub groups: usize,
    /// Groups that fell back to per-image calls.
    pub fallbacks: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Drives a generator over a job's images in bounded groups.
pub struct BatchOrchestrator<'a, G: CaptionGenerator> {
    generator: &'a G,
    params: &'a GenerationParameters,
    primary: BatchStrategy,
    fallback: SingleStrategy,
}

impl<'a, G: CaptionGenerator> BatchOrchestrator<'a, G> {
    pub fn new(generator: &'a G, params: &'a GenerationParameters) -> Self {
        Self {
            generator,
            params,
            primary: BatchStrategy,
            fallback: SingleStrategy,
        }
    }

    /// Caption every decoded image and return one result per input item, in
    /// input order. Decode failures pass straight through as error results.
    pub async fn run(
        &self,
        items: Vec<Result<DecodedImage, (String, DecodeError)>>,
    ) -> (Vec<CaptionResult>, OrchestrationStats) {
        let mut slots: Vec<Option<CaptionResult>> = vec![None; items.len()];
        let mut positions = Vec::new();
        let mut decoded = Vec::new();

        for (idx, item) in items.into_iter().enumerate() {
            match item {
                Ok(image) => {
                    positions.push(idx);
                    decoded.push(image);
                }
                Err((identifier, e)) => slots[idx] = Some(CaptionResult::error(identifier, e)),
            }
        }

        let batch_size = self.params.batch_size.max(1);
        let total_groups = decoded.len().div_ceil(batch_size);
        let mut stats = OrchestrationStats::default();

        for (group_idx, (group, group_positions)) in decoded
            .chunks(batch_size)
            .zip(positions.chunks(batch_size))
            .enumerate()
        {
            tracing::info!(
                "Processing group {}/{} ({} images)",
                group_idx + 1,
                total_groups,
                group.len()
            );

            let (results, fell_back) = self.run_group(group).await;
            stats.groups += 1;
            if fell_back {
                stats.fallbacks += 1;
            }

            for (pos, result) in group_positions.iter().zip(results) {
                slots[*pos] = Some(result);
            }

            self.generator.clear_cache().await;
            if tracing::enabled!(tracing::Level::DEBUG) {
                if let Some(usage) = self.generator.memory_usage().await {
                    tracing::debug!(
                        "Accelerator memory after group {}: {:.2} GiB",
                        group_idx + 1,
                        usage.gibibytes()
                    );
                }
            }
        }

        let results: Vec<CaptionResult> = slots.into_iter().flatten().collect();
        stats.failed = results.iter().filter(|r| r.outcome.is_error()).count();
        stats.succeeded = results.len() - stats.failed;
        (results, stats)
    }

    async fn run_group(&self, group: &[DecodedImage]) -> (Vec<CaptionResult>, bool) {
        match self.primary.generate(self.generator, group, self.params).await {
            Ok(results) => (results, false),
            Err(e) if e.is_resource_exhausted() => {
                tracing::warn!(
                    "{} strategy exhausted accelerator memory ({}), retrying {} images with {} strategy",
                    self.primary.name(),
                    e,
                    group.len(),
                    self.fallback.name()
                );
                self.generator.release_memory().await;
                if let Some(usage) = self.generator.memory_usage().await {
                    tracing::info!(
                        "Accelerator memory after release: {:.2} GiB across {} loaded models",
                        usage.gibibytes(),
                        usage.loaded_models.len()
                    );
                }
                let results = match self.fallback.generate(self.generator, group, self.params).await {
                    Ok(results) => results,
                    Err(e) => fail_group(group, &e),
                };
                (results, true)
            }
            Err(e) => {
                tracing::warn!("{} strategy failed for group: {}", self.primary.name(), e);
                (fail_group(group, &e), false)
            }
        }
    }
}

fn fail_group(group: &[DecodedImage], error: &GenerationError) -> Vec<CaptionResult> {
    group
        .iter()
        .map(|image| CaptionResult::error(&image.identifier, error))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryUsage;
    use image::RgbImage;
    use std::sync::Mutex;

    /// Fails batches larger than `capacity` with an OOM, records call sizes.
    struct LimitedGenerator {
        capacity: usize,
        calls: Mutex<Vec<usize>>,
        releases: Mutex<usize>,
        clears: Mutex<usize>,
        memory_reads: Mutex<usize>,
    }

    impl LimitedGenerator {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                calls: Mutex::new(Vec::new()),
                releases: Mutex::new(0),
                clears: Mutex::new(0),
                memory_reads: Mutex::new(0),
            }
        }
    }

    impl CaptionGenerator for LimitedGenerator {
        async fn generate(
            &self,
            image: &DecodedImage,
            params: &GenerationParameters,
        ) -> Result<String, GenerationError> {
            self.calls.lock().unwrap().push(1);
            if image.identifier.contains("fail") {
                return Err(GenerationError::Other("model refused".to_string()));
            }
            Ok(format!("{} {}", params.prompt, image.identifier))
        }

        async fn generate_batch(
            &self,
            images: &[DecodedImage],
            params: &GenerationParameters,
        ) -> Result<Vec<Result<String, GenerationError>>, GenerationError> {
            self.calls.lock().unwrap().push(images.len());
            if images.len() > self.capacity {
                return Err(GenerationError::ResourceExhausted("CUDA out of memory".into()));
            }
            Ok(images
                .iter()
                .map(|i| Ok(format!("{} {}", params.prompt, i.identifier)))
                .collect())
        }

        async fn clear_cache(&self) {
            *self.clears.lock().unwrap() += 1;
        }

        async fn release_memory(&self) {
            *self.releases.lock().unwrap() += 1;
        }

        async fn memory_usage(&self) -> Option<MemoryUsage> {
            *self.memory_reads.lock().unwrap() += 1;
            Some(MemoryUsage {
                loaded_models: vec!["limited".to_string()],
                accelerator_bytes: 1024,
            })
        }

        fn model_name(&self) -> &str {
            "limited"
        }
    }

    fn image(id: &str) -> DecodedImage {
        DecodedImage {
            identifier: id.to_string(),
            image: RgbImage::new(1, 1),
            width: 1,
            height: 1,
        }
    }

    fn params(batch_size: usize) -> GenerationParameters {
        GenerationParameters {
            prompt: "a photo of".to_string(),
            max_length: 40,
            min_length: 8,
            num_beams: 3,
            batch_size,
        }
    }

    fn ids(results: &[CaptionResult]) -> Vec<&str> {
        results.iter().map(|r| r.identifier.as_str()).collect()
    }

    #[tokio::test]
    async fn groups_are_contiguous_and_bounded() {
        let generator = LimitedGenerator::new(8);
        let params = params(2);
        let items = ["a", "b", "c", "d", "e"].iter().map(|i| Ok(image(i))).collect();

        let (results, stats) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(ids(&results), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(*generator.calls.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(*generator.clears.lock().unwrap(), 3);
        assert_eq!(stats.groups, 3);
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(stats.succeeded, 5);
    }

    #[tokio::test]
    async fn exhausted_group_falls_back_to_single_calls() {
        let generator = LimitedGenerator::new(2);
        let params = params(3);
        let items = ["a", "b", "c", "d"].iter().map(|i| Ok(image(i))).collect();

        let (results, stats) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(ids(&results), vec!["a", "b", "c", "d"]);
        assert!(results.iter().all(|r| !r.outcome.is_error()));
        // group of 3 fails, retried as 1+1+1; group of 1 fits
        assert_eq!(*generator.calls.lock().unwrap(), vec![3, 1, 1, 1, 1]);
        assert_eq!(*generator.releases.lock().unwrap(), 1);
        assert!(*generator.memory_reads.lock().unwrap() >= 1);
        assert_eq!(stats.fallbacks, 1);
    }

    #[tokio::test]
    async fn single_failures_become_markers() {
        let generator = LimitedGenerator::new(0);
        let params = params(2);
        let items = ["a", "fail-b"].iter().map(|i| Ok(image(i))).collect();

        let (results, stats) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome.render(), "a photo of a");
        assert_eq!(results[1].outcome.render(), "[ERROR: model refused]");
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn decode_failures_keep_their_slot() {
        let generator = LimitedGenerator::new(8);
        let params = params(2);
        let items = vec![
            Ok(image("a")),
            Err(("broken".to_string(), DecodeError::UnknownFormat)),
            Ok(image("c")),
        ];

        let (results, _) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(ids(&results), vec!["a", "broken", "c"]);
        assert_eq!(
            results[1].outcome.render(),
            "[ERROR: Unrecognized image format]"
        );
        // decoded images still share one group
        assert_eq!(*generator.calls.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn nothing_decoded_means_no_calls() {
        let generator = LimitedGenerator::new(8);
        let params = params(2);
        let items = vec![Err(("x".to_string(), DecodeError::UnknownFormat))];

        let (results, stats) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(results.len(), 1);
        assert_eq!(stats.groups, 0);
        assert!(generator.calls.lock().unwrap().is_empty());
    }

    enum BatchFault {
        Engine,
        ShortResult,
    }

    /// Batch calls fail in a way that is not memory exhaustion.
    struct FaultyBatchGenerator {
        fault: BatchFault,
        single_calls: Mutex<usize>,
        releases: Mutex<usize>,
    }

    impl FaultyBatchGenerator {
        fn new(fault: BatchFault) -> Self {
            Self {
                fault,
                single_calls: Mutex::new(0),
                releases: Mutex::new(0),
            }
        }
    }

    impl CaptionGenerator for FaultyBatchGenerator {
        async fn generate(
            &self,
            image: &DecodedImage,
            params: &GenerationParameters,
        ) -> Result<String, GenerationError> {
            *self.single_calls.lock().unwrap() += 1;
            Ok(format!("{} {}", params.prompt, image.identifier))
        }

        async fn generate_batch(
            &self,
            images: &[DecodedImage],
            params: &GenerationParameters,
        ) -> Result<Vec<Result<String, GenerationError>>, GenerationError> {
            match self.fault {
                BatchFault::Engine => Err(GenerationError::Engine(500, "model crashed".into())),
                BatchFault::ShortResult => Ok(images
                    .iter()
                    .skip(1)
                    .map(|i| Ok(format!("{} {}", params.prompt, i.identifier)))
                    .collect()),
            }
        }

        async fn release_memory(&self) {
            *self.releases.lock().unwrap() += 1;
        }

        fn model_name(&self) -> &str {
            "faulty"
        }
    }

    #[tokio::test]
    async fn engine_failure_marks_whole_group_without_fallback() {
        let generator = FaultyBatchGenerator::new(BatchFault::Engine);
        let params = params(2);
        let items = ["a", "b", "c"].iter().map(|i| Ok(image(i))).collect();

        let (results, stats) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(ids(&results), vec!["a", "b", "c"]);
        for result in &results {
            assert_eq!(
                result.outcome.render(),
                "[ERROR: Inference engine returned HTTP 500: model crashed]"
            );
        }
        assert_eq!(*generator.releases.lock().unwrap(), 0);
        assert_eq!(*generator.single_calls.lock().unwrap(), 0);
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(stats.failed, 3);
    }

    #[tokio::test]
    async fn short_batch_result_marks_whole_group() {
        let generator = FaultyBatchGenerator::new(BatchFault::ShortResult);
        let params = params(2);
        let items = ["a", "b", "c"].iter().map(|i| Ok(image(i))).collect();

        let (results, stats) = BatchOrchestrator::new(&generator, &params).run(items).await;

        assert_eq!(ids(&results), vec!["a", "b", "c"]);
        assert_eq!(
            results[0].outcome.render(),
            "[ERROR: Invalid response from inference engine: engine returned 1 captions for 2 images]"
        );
        assert!(results[1].outcome.is_error());
        // group of one comes back with zero captions
        assert_eq!(
            results[2].outcome.render(),
            "[ERROR: Invalid response from inference engine: engine returned 0 captions for 1 images]"
        );
        assert_eq!(*generator.releases.lock().unwrap(), 0);
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(stats.succeeded, 0);
    }
}
