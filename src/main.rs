use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nano_serve::engine::synthetic::{ByteTokenizer, SyntheticDraft, SyntheticExecutor};
use nano_serve::{HandlerOptions, LLMHandler, Priority, SamplingParams, StatusCode};

#[derive(Parser, Debug)]
#[command(name = "nano-serve")]
#[command(about = "Run a synthetic workload through the LLM serving core")]
struct Args {
    /// Handler options as JSON; missing fields take their defaults
    #[arg(short, long, env = "NANO_SERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short = 'n', long, default_value = "32")]
    num_requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "64")]
    prompt_len: usize,

    /// Leading prompt tokens shared by every request
    #[arg(long, default_value = "32")]
    shared_prefix_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Priorities assigned round-robin
    #[arg(long, value_delimiter = ',', default_value = "high,medium,low")]
    priorities: Vec<Priority>,

    /// KV cache budget in bytes (overrides the config file)
    #[arg(long)]
    max_cache_size: Option<u64>,

    /// Draft tokens per step (overrides the config file)
    #[arg(long)]
    num_speculative_tokens: Option<usize>,

    /// Probability that a sampled token ends the completion
    #[arg(long, default_value = "0.02")]
    eos_probability: f64,

    /// Stream outputs instead of only reporting the final one
    #[arg(long)]
    stream: bool,

    /// Seed for the synthetic executors
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[derive(Debug, Default)]
struct Summary {
    ok: usize,
    failed: usize,
    generated_tokens: usize,
    stream_chunks: usize,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!("nano-serve v{}", env!("CARGO_PKG_VERSION"));

    let mut options = match &args.config {
        Some(path) => HandlerOptions::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HandlerOptions::default(),
    };
    if let Some(max_cache_size) = args.max_cache_size {
        options.max_cache_size = max_cache_size;
    }
    if let Some(k) = args.num_speculative_tokens {
        options.speculative.num_speculative_tokens = k;
    }
    let speculative = options.speculative.is_enabled();

    let executor = SyntheticExecutor::new(args.seed).with_eos_probability(args.eos_probability);
    let mut handler = LLMHandler::new(options, Box::new(executor), Arc::new(ByteTokenizer::new()))
        .context("failed to create handler")?;
    if speculative {
        handler = handler.with_draft_executor(Box::new(SyntheticDraft::new(args.seed + 1, 0.2)));
    }
    info!(total_blocks = handler.total_blocks(), "handler ready");

    let summary = Arc::new(Mutex::new(Summary::default()));
    let shared_prefix = "s".repeat(args.shared_prefix_len.min(args.prompt_len));
    let priorities = if args.priorities.is_empty() {
        vec![Priority::Medium]
    } else {
        args.priorities.clone()
    };

    handler.start().context("failed to start handler loop")?;
    let started = Instant::now();

    for i in 0..args.num_requests {
        let tail_len = args.prompt_len - shared_prefix.len();
        let tail: String = (0..tail_len)
            .map(|j| char::from(b'a' + ((i + j) % 26) as u8))
            .collect();
        let prompt = format!("{shared_prefix}{tail}");
        let params = SamplingParams::default().max_tokens(args.max_tokens);
        let priority = priorities[i % priorities.len()];

        let summary = Arc::clone(&summary);
        handler.schedule_async(&prompt, params, priority, args.stream, move |output| {
            let mut summary = summary.lock();
            if !output.finished {
                summary.stream_chunks += 1;
                return true;
            }
            match output.status.as_ref().map(|status| status.code) {
                Some(StatusCode::Ok) => summary.ok += 1,
                _ => summary.failed += 1,
            }
            if let Some(usage) = output.usage {
                summary.generated_tokens += usage.num_generated_tokens;
            }
            true
        });
    }

    handler.run_until_complete()?;
    handler.stop();

    let elapsed = started.elapsed();
    let summary = summary.lock();
    info!(
        ok = summary.ok,
        failed = summary.failed,
        generated_tokens = summary.generated_tokens,
        stream_chunks = summary.stream_chunks,
        elapsed_ms = elapsed.as_millis() as u64,
        tokens_per_sec = summary.generated_tokens as f64 / elapsed.as_secs_f64().max(1e-9),
        "workload finished"
    );
    Ok(())
}
