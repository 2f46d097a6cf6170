use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use digestbot::cleanup;
use digestbot::config;
use digestbot::digest::{self, HttpDigestSender};
use digestbot::poller;
use digestbot::processor::{self, ProcessorDeps};
use digestbot::queue;
use digestbot::sources::{HttpSourceListing, HttpTranscriptFetcher};
use digestbot::store;
use digestbot::summarizer::LlmSummarizer;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

/// One subcommand per scheduled or queue-triggered invocation. Scheduling
/// lives outside the process; every run loads config, acts once on the
/// current clock, and exits.
#[derive(Debug, Subcommand)]
enum Command {
    /// Discover new items and sweep due retries onto the work queue
    Poll,
    /// Receive and process queued items
    Work {
        /// Maximum messages to lease in this invocation
        #[arg(long, default_value_t = 10)]
        max_messages: i64,
    },
    /// Compile and deliver the digest of unsent summaries
    Digest,
    /// Delete aged permanently-failed and TTL-expired records
    Cleanup,
    /// Report queue depths and item counts by status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/digestbot.db", cfg.app.data_dir));

    let pool = store::init_pool(&database_url).await?;
    store::run_migrations(&pool).await?;

    let now = Utc::now();
    // Hard wall-clock budget per invocation; the queue's visibility
    // timeout is validated to exceed it so in-flight work is never
    // redelivered early.
    let budget = Duration::from_secs(cfg.app.invocation_timeout_secs as u64);
    let run = run_command(args.command, &pool, &cfg, now);
    tokio::time::timeout(budget, run)
        .await
        .map_err(|_| anyhow!("invocation exceeded {}s budget", cfg.app.invocation_timeout_secs))?
}

async fn run_command(
    command: Command,
    pool: &store::Pool,
    cfg: &config::Config,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    match command {
        Command::Poll => {
            let listing = HttpSourceListing::from_config(cfg);
            let stats = poller::run_poll(pool, &listing, cfg, now).await?;
            info!(?stats, "poll finished");
        }
        Command::Work { max_messages } => {
            let fetcher = HttpTranscriptFetcher::from_config(cfg);
            let summarizer = LlmSummarizer::from_config(cfg);
            let deps = ProcessorDeps {
                fetcher: &fetcher,
                summarizer: &summarizer,
            };
            let stats = processor::run_worker(pool, &deps, cfg, now, max_messages).await?;
            info!(?stats, "work finished");
        }
        Command::Digest => {
            let sender = HttpDigestSender::from_config(cfg);
            let stats = digest::run_digest(pool, &sender, cfg, now).await?;
            info!(?stats, "digest finished");
        }
        Command::Cleanup => {
            let stats = cleanup::run_cleanup(pool, cfg, now).await?;
            info!(?stats, "cleanup finished");
        }
        Command::Status => {
            let depth = queue::depth(pool).await?;
            let dead = queue::dead_letter_depth(pool).await?;
            println!("work queue depth: {depth}");
            println!("dead letter depth: {dead}");
            for (status, count) in store::status_counts(pool).await? {
                println!("items {status}: {count}");
            }
        }
    }

    Ok(())
}
