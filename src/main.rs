use anyhow::Context;
use caption_worker::{CaptionHandler, JobRequest, JobResponse, OllamaGenerator, WorkerConfig};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "caption-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Serverless image captioning worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read newline-delimited jobs from stdin, write one response per line
    Serve,
    /// Process a single job and print the response
    Run {
        /// Job JSON (`{"input": {...}}` or a bare input object), or @path to a file
        #[arg(short, long)]
        input: String,
    },
    /// Check that the inference engine is reachable
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries responses, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        "Starting caption worker: model={}, endpoint={}, device={}",
        config.model,
        config.endpoint,
        config.device
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let generator = OllamaGenerator::new(client.clone(), config.clone());
    let handler = CaptionHandler::new(&generator, client, config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&handler).await?,
        Command::Run { input } => {
            let request = load_request(&input)?;
            let response = handler.handle_request(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Health => {
            let report = handler.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn serve(handler: &CaptionHandler<'_, OllamaGenerator>) -> anyhow::Result<()> {
    let report = handler.health().await;
    if report.engine_reachable {
        tracing::info!("Inference engine reachable, ready for jobs");
        if let Some(bytes) = report.accelerator_memory_bytes {
            tracing::info!(
                "Accelerator memory in use: {:.2} GiB (model loaded: {})",
                bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                report.model_loaded.unwrap_or(false)
            );
        }
    } else {
        tracing::warn!(
            "Inference engine not reachable yet: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JobRequest>(&line) {
            Ok(request) => handler.handle_request(request).await,
            Err(e) => JobResponse {
                id: None,
                output: None,
                error: Some(format!("Malformed job: {}", e)),
            },
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

fn load_request(arg: &str) -> anyhow::Result<JobRequest> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path))?,
        None => arg.to_string(),
    };

    let value: serde_json::Value = serde_json::from_str(&text).context("job is not valid JSON")?;
    if value.get("input").is_some() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(JobRequest {
            id: None,
            input: value,
        })
    }
}
