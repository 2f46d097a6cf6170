//! Item processor: consumes leased queue messages one at a time, fetches
//! the transcript, summarizes it, and writes the classified outcome back
//! to the record store.
//!
//! Outcome handling is the retry state machine:
//! - transient failures nack the message and write nothing, leaving the
//!   short-term retry to queue redelivery;
//! - content-unavailable failures consume one attempt from the multi-day
//!   retry budget and ack;
//! - dependency-missing failures are written FAILED without a retry
//!   schedule and surfaced at error level;
//! - terminal rejections and exhausted budgets go PERMANENTLY_FAILED.
use crate::config::Config;
use crate::model::{FailureReason, QueueMessage, WorkItem};
use crate::queue;
use crate::sources::{FetchError, TranscriptFetcher};
use crate::store::{self, FailureWrite, Pool};
use crate::summarizer::{SummarizeError, Summarizer};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

pub struct ProcessorDeps<'a> {
    pub fetcher: &'a dyn TranscriptFetcher,
    pub summarizer: &'a dyn Summarizer,
}

/// Per-batch accounting. Failures are tracked per message: one failing
/// item never rolls back or blocks the rest of the batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub processed: u64,
    pub retries_scheduled: u64,
    pub exhausted: u64,
    pub dependency_failures: u64,
    pub rejected: u64,
    pub redeliveries_requested: u64,
    pub malformed: u64,
}

#[derive(Debug)]
enum Outcome {
    Processed,
    RetryScheduled,
    Exhausted,
    DependencyMissing,
    Rejected,
    Redeliver,
    Malformed,
}

/// Receive up to `max_messages` and process them. Used by the `work`
/// invocation; tests drive `process_batch` directly.
#[instrument(skip_all)]
pub async fn run_worker(
    pool: &Pool,
    deps: &ProcessorDeps<'_>,
    cfg: &Config,
    now: DateTime<Utc>,
    max_messages: i64,
) -> Result<BatchStats> {
    let msgs = queue::receive(pool, &cfg.queue, now, max_messages).await?;
    process_batch(pool, deps, msgs, cfg, now).await
}

#[instrument(skip_all, fields(batch = msgs.len()))]
pub async fn process_batch(
    pool: &Pool,
    deps: &ProcessorDeps<'_>,
    msgs: Vec<QueueMessage>,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<BatchStats> {
    let mut stats = BatchStats::default();

    for msg in msgs {
        let outcome = match process_message(pool, deps, &msg, cfg, now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Store/infrastructure error: leave the message for
                // redelivery rather than losing the item.
                warn!(?err, message_id = %msg.message_id, "processing error; requesting redelivery");
                Outcome::Redeliver
            }
        };

        match outcome {
            Outcome::Redeliver => {
                stats.redeliveries_requested += 1;
                queue::nack(pool, msg.id, msg.deliveries, &cfg.queue, now).await?;
            }
            other => {
                match other {
                    Outcome::Processed => stats.processed += 1,
                    Outcome::RetryScheduled => stats.retries_scheduled += 1,
                    Outcome::Exhausted => stats.exhausted += 1,
                    Outcome::DependencyMissing => stats.dependency_failures += 1,
                    Outcome::Rejected => stats.rejected += 1,
                    Outcome::Malformed => stats.malformed += 1,
                    Outcome::Redeliver => unreachable!(),
                }
                queue::ack(pool, msg.id).await?;
            }
        }
    }

    info!(?stats, "batch complete");
    Ok(stats)
}

async fn process_message(
    pool: &Pool,
    deps: &ProcessorDeps<'_>,
    msg: &QueueMessage,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    let work: WorkItem = match serde_json::from_str(&msg.payload) {
        Ok(work) => work,
        Err(err) => {
            // A malformed payload will never parse on redelivery either.
            warn!(?err, message_id = %msg.message_id, "dropping malformed payload");
            return Ok(Outcome::Malformed);
        }
    };

    info!(item_id = %work.item_id, title = %work.title, "processing item");

    let transcript = match deps.fetcher.fetch_transcript(&work.item_id).await {
        Ok(transcript) => transcript,
        Err(FetchError::ContentUnavailable(reason)) => {
            let write =
                store::mark_item_content_unavailable(pool, &work.item_id, &reason, cfg, now)
                    .await?;
            return Ok(match write {
                FailureWrite::RetryScheduled { retry_count, next_retry_at } => {
                    info!(
                        item_id = %work.item_id,
                        retry_count,
                        %next_retry_at,
                        "content unavailable; retry scheduled"
                    );
                    Outcome::RetryScheduled
                }
                FailureWrite::Exhausted => {
                    warn!(item_id = %work.item_id, "content unavailable; retry budget exhausted");
                    Outcome::Exhausted
                }
            });
        }
        Err(FetchError::DependencyMissing(reason)) => {
            // Operational defect, not content state: keep it out of the
            // content-retry loop and make it loud for operators.
            error!(item_id = %work.item_id, %reason, "dependency missing while fetching transcript");
            store::mark_item_dependency_missing(pool, &work.item_id, &reason, now).await?;
            return Ok(Outcome::DependencyMissing);
        }
        Err(FetchError::Transient(reason)) => {
            warn!(item_id = %work.item_id, %reason, "transient fetch failure; leaving to redelivery");
            return Ok(Outcome::Redeliver);
        }
    };

    let summary = match deps
        .summarizer
        .summarize(&work.title, &work.source_label, &transcript)
        .await
    {
        Ok(summary) => summary,
        Err(SummarizeError::Transient(reason)) => {
            warn!(item_id = %work.item_id, %reason, "transient summarizer failure; leaving to redelivery");
            return Ok(Outcome::Redeliver);
        }
        Err(SummarizeError::Rejected(reason)) => {
            warn!(item_id = %work.item_id, %reason, "summarizer rejected item");
            store::mark_item_permanently_failed(
                pool,
                &work.item_id,
                FailureReason::SummaryRejected,
                &reason,
                now,
            )
            .await?;
            return Ok(Outcome::Rejected);
        }
    };

    // Both writes are idempotent overwrites, so a crash between them (or a
    // redelivered duplicate) converges on the same terminal state.
    store::upsert_summary(pool, &work, &summary, now, cfg.app.ttl_days).await?;
    store::mark_item_processed(pool, &work, now, cfg.app.ttl_days).await?;
    info!(item_id = %work.item_id, "item processed");
    Ok(Outcome::Processed)
}
