use caption_worker::{CaptionHandler, JobInput, JobOutput, OllamaGenerator, WorkerConfig};

/// Captions every image in a zip archive with a local Ollama vision model.
///
/// The archive can be an http(s) URL or a local path, which is sent as a
/// base64 data URL.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: caption_zip <archive_url_or_path> [model]");
        std::process::exit(1);
    });

    let model = std::env::args().nth(2).unwrap_or("llava".to_string());

    let data_url = if source.starts_with("http://") || source.starts_with("https://") {
        source.clone()
    } else {
        use base64::Engine;
        let bytes = std::fs::read(&source)?;
        format!(
            "data:application/zip;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    };

    let config = WorkerConfig::builder().with_model(&model).build();
    let client = reqwest::Client::new();
    let generator = OllamaGenerator::new(client.clone(), config.clone());
    let handler = CaptionHandler::new(&generator, client, config);

    println!("Captioning {} with model '{}'...", source, model);

    let mut input = JobInput::with_data_url(data_url);
    input.batch_size = Some(2);

    match handler.handle(&input).await? {
        JobOutput::Batch { captions, skipped } => {
            println!("\nCaptions ({}):", captions.len());
            for entry in &captions {
                println!("  {}: {}", entry.image_path, entry.caption);
            }
            for entry in &skipped {
                println!("  skipped {}: {}", entry.name, entry.reason);
            }
        }
        JobOutput::Single { caption, .. } => println!("\nCaption: {}", caption),
    }

    Ok(())
}
