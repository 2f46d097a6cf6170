//! Retention cleanup: drops permanently failed records past the retention
//! threshold, plus TTL-expired rows (SQLite has no native expiry).
use crate::config::Config;
use crate::store::{self, Pool};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub scanned: u64,
    pub deleted: u64,
    pub errors: u64,
    pub expired_items: u64,
    pub expired_summaries: u64,
}

#[instrument(skip_all)]
pub async fn run_cleanup(pool: &Pool, cfg: &Config, now: DateTime<Utc>) -> Result<CleanupStats> {
    let mut stats = CleanupStats::default();
    let cutoff = now - Duration::days(cfg.cleanup.age_days);

    let candidates = store::aged_permanent_failures(pool, cutoff).await?;
    stats.scanned = candidates.len() as u64;

    for item_id in candidates {
        // A delete error on one record must not abort the rest.
        match store::delete_item_and_summary(pool, &item_id).await {
            Ok(()) => {
                info!(item_id, "deleted permanently failed item");
                stats.deleted += 1;
            }
            Err(err) => {
                warn!(?err, item_id, "failed to delete item");
                stats.errors += 1;
            }
        }
    }

    let (expired_items, expired_summaries) = store::purge_expired(pool, now).await?;
    stats.expired_items = expired_items;
    stats.expired_summaries = expired_summaries;

    info!(?stats, "cleanup complete");
    Ok(stats)
}
