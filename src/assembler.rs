use std::time::Duration;

use crate::types::{
    CaptionEntry, CaptionResult, JobOutput, ModelInfo, ResponseMode, SkippedEntry,
};

/// Build the job output for the chosen response mode.
///
/// Never fails: error markers are valid captions. In single mode the first
/// result is used; an empty result list renders an error marker so the
/// response shape stays intact.
pub fn assemble(
    mode: ResponseMode,
    results: Vec<CaptionResult>,
    skipped: Vec<SkippedEntry>,
    elapsed: Duration,
    model_info: ModelInfo,
) -> JobOutput {
    match mode {
        ResponseMode::Single => {
            let caption = results
                .into_iter()
                .next()
                .map(|r| r.outcome.render())
                .unwrap_or_else(|| "[ERROR: no image was processed]".to_string());
            JobOutput::Single {
                caption,
                processing_time: elapsed.as_secs_f64(),
                model_info,
            }
        }
        ResponseMode::Batch => JobOutput::Batch {
            captions: results
                .into_iter()
                .map(|r| CaptionEntry {
                    caption: r.outcome.render(),
                    image_path: r.identifier,
                })
                .collect(),
            skipped,
        },
    }
}
