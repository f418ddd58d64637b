//! Count and summarize documents through rate-limited LLM calls.
//!
//! Reads model limits and prices from a JSON config and the API key from the
//! `OPENROUTER_KEY` environment variable (not needed for `count` or
//! `--dry-run`).
//!
//! # Examples
//!
//! ```sh
//! # How much of the context does this document take?
//! throttle count --config models.json --model openai/gpt-4o-mini report.txt
//!
//! # Estimate the cost of summarizing two files
//! throttle summarize --config models.json --dry-run a.txt b.txt
//!
//! # Summarize, stopping after three excerpts
//! throttle -v summarize --config models.json --max-excerpts 3 report.txt
//!
//! # Back off exponentially when the provider is shared
//! throttle summarize --config models.json --backoff --max-attempts 8 report.txt
//! ```

use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use throttle_rs::api::Usage;
use throttle_rs::context::{LoggingProgress, SummaryOutcome};
use throttle_rs::prelude::*;
use throttle_rs::{DEFAULT_MODEL, model::ModelHandle};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Count and summarize documents through rate-limited LLM calls.
#[derive(Parser)]
#[command(name = "throttle", version)]
struct Cli {
    /// Log more (-v info, -vv debug). Overrides RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// JSON file with model limits and prices
    #[arg(long, default_value = "models.json")]
    config: PathBuf,

    /// Model to use
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
}

#[derive(Subcommand)]
enum Command {
    /// Token count of a document wrapped in the summarization prompt
    Count {
        #[command(flatten)]
        models: ModelArgs,

        file: PathBuf,
    },
    /// Summarize documents excerpt by excerpt
    Summarize {
        #[command(flatten)]
        models: ModelArgs,

        /// Estimate tokens and cost without calling the provider
        #[arg(long)]
        dry_run: bool,

        /// Stop each document after this many excerpts
        #[arg(long)]
        max_excerpts: Option<usize>,

        /// Excerpt size in tokens (derived from the model when omitted)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Tokens shared between consecutive excerpts
        #[arg(long, default_value_t = 0)]
        overlap: usize,

        /// Tokens reserved for each response
        #[arg(long, default_value_t = 1024)]
        response_tokens: usize,

        /// What the summary should capture
        #[arg(long)]
        instructions: Option<String>,

        /// Completion attempts per excerpt, including the first
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,

        /// Delay before the first retry, in milliseconds
        #[arg(long, default_value_t = 1000)]
        retry_delay_ms: u64,

        /// Double the delay after each retry, with jitter
        #[arg(long)]
        backoff: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Count { models, file } => {
            let summarizer = build_summarizer(&models, SummarizerConfig::default(), true)?;
            count(&summarizer, &file).await
        }
        Command::Summarize {
            models,
            dry_run,
            max_excerpts,
            chunk_size,
            overlap,
            response_tokens,
            instructions,
            max_attempts,
            retry_delay_ms,
            backoff,
            files,
        } => {
            let mut config = SummarizerConfig::default()
                .with_overlap(overlap)
                .with_response_token_length(response_tokens)
                .with_dry_run(dry_run);
            if let Some(size) = chunk_size {
                config = config.with_chunk_size(size);
            }
            if let Some(max) = max_excerpts {
                config = config.with_max_excerpts(max);
            }
            if let Some(text) = instructions {
                config = config.with_instructions(text);
            }
            let delay = Duration::from_millis(retry_delay_ms);
            let retry = if backoff {
                RetryConfig::exponential(max_attempts, delay)
            } else {
                RetryConfig::fixed(max_attempts, delay)
            };
            let summarizer = build_summarizer(&models, config, dry_run)?.with_retry(retry);
            summarize(&summarizer, &files).await
        }
    }
}

fn build_summarizer(
    args: &ModelArgs,
    config: SummarizerConfig,
    offline: bool,
) -> Result<DocumentSummarizer, Box<dyn Error>> {
    let registry = Arc::new(ModelRegistry::load(&args.config)?);
    debug!("Loaded models: {}", registry.model_ids().join(", "));

    let api_key = match std::env::var("OPENROUTER_KEY") {
        Ok(key) => key,
        Err(_) if offline => String::new(),
        Err(_) => return Err("OPENROUTER_KEY environment variable is not set".into()),
    };
    let backend = Arc::new(OpenRouterClient::with_headers(
        api_key,
        "https://github.com/tacryt-socryp/throttle-rs",
        "throttle-rs",
    )?);

    Ok(DocumentSummarizer::new(registry, backend, &args.model, config)?)
}

async fn count(summarizer: &DocumentSummarizer, file: &Path) -> Result<(), Box<dyn Error>> {
    let text = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("failed to read '{}': {e}", file.display()))?;
    let model: &ModelHandle = summarizer.prompt().model();

    println!("model:             {}", model.id());
    println!("context window:    {}", model.profile.max_context_tokens());
    println!("document tokens:   {}", model.profile.count_tokens(&text));
    println!("with prompt:       {}", summarizer.count_tokens(&text));
    println!("remaining:         {}", summarizer.count_remaining_tokens(&text));
    match summarizer.chunker() {
        Ok(chunker) => {
            let document = chunker.split(&text);
            println!("chunk size:        {}", chunker.window());
            println!("excerpts:          {}", document.len());
        }
        Err(e) => println!("chunk size:        unavailable ({e})"),
    }
    Ok(())
}

async fn summarize(
    summarizer: &DocumentSummarizer,
    files: &[PathBuf],
) -> Result<(), Box<dyn Error>> {
    let runs = files.iter().map(|file| async move {
        let text = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| format!("failed to read '{}': {e}", file.display()))?;
        summarizer
            .summarize(&text, &LoggingProgress)
            .await
            .map_err(|e| e.to_string())
    });
    let results: Vec<Result<SummaryOutcome, String>> = join_all(runs).await;

    let mut total = Usage::default();
    let mut failures = 0;
    for (file, result) in files.iter().zip(results) {
        match result {
            Ok(outcome) => {
                total += outcome.usage;
                let report = json!({
                    "file": file.display().to_string(),
                    "run_id": outcome.run_id,
                    "phase": format!("{:?}", outcome.phase),
                    "excerpts": outcome.excerpt_count,
                    "processed": outcome.excerpts_processed,
                    "failed": outcome.excerpts_failed,
                    "tokens_sent": outcome.usage.tokens_sent,
                    "tokens_received": outcome.usage.tokens_received,
                    "cost": outcome.usage.cost,
                    "response": outcome.response,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(e) => {
                failures += 1;
                error!("{}: {e}", file.display());
            }
        }
    }

    eprintln!("Total {}", total.summary());
    if failures > 0 {
        return Err(format!("{failures} of {} file(s) failed", files.len()).into());
    }
    Ok(())
}
