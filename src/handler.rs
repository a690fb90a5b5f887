use std::time::Instant;

use reqwest::Client;

use crate::assembler;
use crate::config::WorkerConfig;
use crate::decoder;
use crate::error::JobError;
use crate::generator::CaptionGenerator;
use crate::orchestrator::BatchOrchestrator;
use crate::resolver::SourceResolver;
use crate::types::{
    GenerationParameters, HealthReport, HealthStatus, JobInput, JobOutput, JobRequest,
    JobResponse, ModelInfo,
};

/// Runs caption jobs end to end: validate, resolve, decode, caption, assemble.
///
/// The generator is borrowed, never owned: the worker creates it once at
/// startup and every job shares it read-only.
pub struct CaptionHandler<'a, G: CaptionGenerator> {
    generator: &'a G,
    client: Client,
    config: WorkerConfig,
}

impl<'a, G: CaptionGenerator> CaptionHandler<'a, G> {
    pub fn new(generator: &'a G, client: Client, config: WorkerConfig) -> Self {
        Self {
            generator,
            client,
            config,
        }
    }

    /// Run one job.
    ///
    /// # Errors
    ///
    /// Only input misconfiguration ([`JobError::Input`]) and unreadable
    /// archives ([`JobError::Archive`]) fail the job. Per-image problems
    /// come back as `[ERROR: ...]` captions inside a successful output.
    #[tracing::instrument(name = "CaptionHandler::handle", skip_all, err(Display))]
    pub async fn handle(&self, input: &JobInput) -> Result<JobOutput, JobError> {
        let started = Instant::now();

        let source = input.source()?;
        let params = GenerationParameters::resolve(input, &source, &self.config.limits)?;
        tracing::info!(
            "Processing job: max_length={}, min_length={}, num_beams={}, batch_size={}",
            params.max_length,
            params.min_length,
            params.num_beams,
            params.batch_size
        );

        let resolved = SourceResolver::new(&self.client, self.config.fetch_timeout)
            .with_max_bytes(self.config.max_source_bytes)
            .resolve(&source)
            .await?;
        let submitted = resolved.descriptors.len();
        tracing::info!(
            "Resolved {} images in {:.3}s",
            submitted,
            started.elapsed().as_secs_f64()
        );

        let decoded = decoder::decode_all(resolved.descriptors, self.config.max_dimension);
        let (results, stats) = BatchOrchestrator::new(self.generator, &params)
            .run(decoded)
            .await;
        debug_assert_eq!(results.len(), submitted);

        tracing::info!(
            "Captioned {} images ({} failed) in {} groups, {} fallbacks, {:.3}s total",
            stats.succeeded + stats.failed,
            stats.failed,
            stats.groups,
            stats.fallbacks,
            started.elapsed().as_secs_f64()
        );

        let model_info = ModelInfo {
            device: self.generator.device().to_string(),
            model: self.generator.model_name().to_string(),
            max_length: params.max_length,
            num_beams: params.num_beams,
        };

        Ok(assembler::assemble(
            resolved.mode,
            results,
            resolved.skipped,
            started.elapsed(),
            model_info,
        ))
    }

    /// Run a job envelope and wrap the outcome for the runtime.
    pub async fn handle_request(&self, request: JobRequest) -> JobResponse {
        let id = request.id;
        let outcome = match parse_input(request.input) {
            Ok(input) => self.handle(&input).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => JobResponse {
                id,
                output: Some(output),
                error: None,
            },
            Err(e) => JobResponse {
                id,
                output: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Report whether the worker can serve jobs.
    pub async fn health(&self) -> HealthReport {
        let check = self.generator.health().await;
        let usage = match check {
            Ok(()) => self.generator.memory_usage().await,
            Err(_) => None,
        };
        HealthReport {
            status: if check.is_ok() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            device: self.generator.device().to_string(),
            model: self.generator.model_name().to_string(),
            engine_reachable: check.is_ok(),
            model_loaded: usage
                .as_ref()
                .map(|u| u.has_model(self.generator.model_name())),
            accelerator_memory_bytes: usage.map(|u| u.accelerator_bytes),
            error: check.err().map(|e| e.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn parse_input(value: serde_json::Value) -> Result<JobInput, JobError> {
    if value.is_null() {
        return Err(JobError::input("No input provided"));
    }
    serde_json::from_value(value).map_err(|e| JobError::input(e.to_string()))
}
