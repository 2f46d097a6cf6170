//! Discovery poller: lists recently published items per source, wins or
//! loses the conditional create for each, and enqueues only the winners.
//! Also sweeps content-unavailable failures whose retry window elapsed.
use crate::config::Config;
use crate::model::WorkItem;
use crate::sources::SourceListing;
use crate::store::{self, Pool};
use crate::queue;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub sources_checked: u64,
    pub items_found: u64,
    pub items_queued: u64,
    pub items_skipped: u64,
    pub retries_requeued: u64,
    pub errors: u64,
}

#[instrument(skip_all)]
pub async fn run_poll(
    pool: &Pool,
    listing: &dyn SourceListing,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<PollStats> {
    let mut stats = PollStats::default();
    let published_after = now - Duration::hours(cfg.app.look_back_hours);

    for source in &cfg.sources {
        stats.sources_checked += 1;

        // One broken source must not block the rest of the sweep.
        let items = match listing.list_recent(source, published_after).await {
            Ok(items) => items,
            Err(err) => {
                warn!(?err, source = %source.id, "failed to list source");
                stats.errors += 1;
                continue;
            }
        };
        stats.items_found += items.len() as u64;

        for item in items {
            // The conditional create is the idempotency gate: overlapping
            // poller runs race here and exactly one wins the enqueue.
            match store::create_item_if_absent(pool, &source.id, &item, now, cfg.app.ttl_days).await
            {
                Ok(true) => {
                    let work = WorkItem {
                        item_id: item.item_id.clone(),
                        title: item.title.clone(),
                        source_label: item.source_label.clone(),
                        published_at: item.published_at,
                    };
                    match queue::enqueue(pool, &work, now).await {
                        Ok(_) => {
                            info!(item_id = %item.item_id, title = %item.title, "queued item");
                            stats.items_queued += 1;
                        }
                        Err(err) => {
                            warn!(?err, item_id = %item.item_id, "failed to enqueue item");
                            stats.errors += 1;
                        }
                    }
                }
                Ok(false) => {
                    stats.items_skipped += 1;
                }
                Err(err) => {
                    warn!(?err, item_id = %item.item_id, "failed to record item");
                    stats.errors += 1;
                }
            }
        }
    }

    let retry = sweep_due_retries(pool, now).await?;
    stats.retries_requeued = retry.requeued;
    stats.errors += retry.errors;

    info!(?stats, "poll complete");
    Ok(stats)
}

#[derive(Debug, Default)]
struct SweepStats {
    requeued: u64,
    errors: u64,
}

/// Re-enqueue content-unavailable failures whose next_retry_at has
/// passed. The attempt was counted when the failure was written, so the
/// flip back to QUEUED leaves retry_count alone.
async fn sweep_due_retries(pool: &Pool, now: DateTime<Utc>) -> Result<SweepStats> {
    let mut stats = SweepStats::default();
    let due = store::due_retry_items(pool, now).await?;
    if due.is_empty() {
        return Ok(stats);
    }
    info!(count = due.len(), "retry window elapsed; re-queuing items");

    for record in due {
        let work = WorkItem {
            item_id: record.item_id.clone(),
            title: record.title.clone(),
            source_label: record.source_label.clone(),
            published_at: record.published_at,
        };
        if let Err(err) = queue::enqueue(pool, &work, now).await {
            warn!(?err, item_id = %record.item_id, "failed to re-enqueue item");
            stats.errors += 1;
            continue;
        }
        match store::requeue_item_for_retry(pool, &record.item_id).await {
            Ok(()) => {
                info!(
                    item_id = %record.item_id,
                    retry_count = record.retry_count,
                    "re-queued for retry"
                );
                stats.requeued += 1;
            }
            Err(err) => {
                warn!(?err, item_id = %record.item_id, "failed to flip item back to QUEUED");
                stats.errors += 1;
            }
        }
    }
    Ok(stats)
}
