use crate::config::Config;
use crate::model::{DiscoveredItem, FailureReason, ItemRecord, ItemStatus, SummaryRecord, WorkItem};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

/// Outcome of a content-unavailable failure write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureWrite {
    RetryScheduled {
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
    },
    Exhausted,
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn expiry(now: DateTime<Utc>, ttl_days: i64) -> DateTime<Utc> {
    now + Duration::days(ttl_days)
}

fn truncate_error(error: &str) -> String {
    error.chars().take(500).collect()
}

/// Conditional create: the idempotency mechanism for discovery. Returns
/// true only when this call inserted the record; a duplicate listing (or an
/// overlapping poller run) gets false and must not enqueue.
#[instrument(skip_all)]
pub async fn create_item_if_absent(
    pool: &Pool,
    source_id: &str,
    item: &DiscoveredItem,
    now: DateTime<Utc>,
    ttl_days: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO items (item_id, title, source_id, source_label, published_at, status, retry_count, queued_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?) \
         ON CONFLICT(item_id) DO NOTHING",
    )
    .bind(&item.item_id)
    .bind(&item.title)
    .bind(source_id)
    .bind(&item.source_label)
    .bind(item.published_at)
    .bind(ItemStatus::Queued.as_str())
    .bind(now)
    .bind(expiry(now, ttl_days))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn row_to_item(row: &SqliteRow) -> Result<ItemRecord> {
    let status_str: String = row.get("status");
    let status = ItemStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("item has unknown status {}", status_str))?;
    let reason: Option<String> = row.get("failure_reason");
    Ok(ItemRecord {
        item_id: row.get("item_id"),
        title: row.get("title"),
        source_id: row.get("source_id"),
        source_label: row.get("source_label"),
        published_at: row.get("published_at"),
        status,
        failure_reason: reason.as_deref().and_then(FailureReason::parse),
        last_error: row.get("last_error"),
        retry_count: row.get("retry_count"),
        queued_at: row.get("queued_at"),
        processed_at: row.get("processed_at"),
        first_failed_at: row.get("first_failed_at"),
        failed_at: row.get("failed_at"),
        next_retry_at: row.get("next_retry_at"),
    })
}

#[instrument(skip_all)]
pub async fn get_item(pool: &Pool, item_id: &str) -> Result<Option<ItemRecord>> {
    let row = sqlx::query("SELECT * FROM items WHERE item_id = ?")
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_item).transpose()
}

/// Terminal success write. Unconditional overwrite: redelivery of an
/// already-processed message lands here again with equivalent data, which
/// is the required idempotent no-op.
#[instrument(skip_all)]
pub async fn mark_item_processed(
    pool: &Pool,
    work: &WorkItem,
    now: DateTime<Utc>,
    ttl_days: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE items SET status = ?, processed_at = ?, failure_reason = NULL, \
         last_error = NULL, next_retry_at = NULL, expires_at = ? WHERE item_id = ?",
    )
    .bind(ItemStatus::Processed.as_str())
    .bind(now)
    .bind(expiry(now, ttl_days))
    .bind(&work.item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create or refresh the Digest-Ready Summary for a processed item. The
/// upsert never touches newsletter_sent_at / newsletter_sent_count, so a
/// redelivered message cannot re-arm an already-delivered summary.
#[instrument(skip_all)]
pub async fn upsert_summary(
    pool: &Pool,
    work: &WorkItem,
    summary: &str,
    now: DateTime<Utc>,
    ttl_days: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO summaries (item_id, title, source_label, summary, published_at, summarized_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(item_id) DO UPDATE SET \
           title = excluded.title, \
           source_label = excluded.source_label, \
           summary = excluded.summary, \
           summarized_at = excluded.summarized_at, \
           expires_at = excluded.expires_at",
    )
    .bind(&work.item_id)
    .bind(&work.title)
    .bind(&work.source_label)
    .bind(summary)
    .bind(work.published_at)
    .bind(now)
    .bind(expiry(now, ttl_days))
    .execute(pool)
    .await?;
    Ok(())
}

/// Content-unavailable failure write: one consumed attempt. While the
/// retry budget lasts, schedules the next attempt per the configured
/// interval ladder; once retry_count has reached max_retries, the item
/// goes terminal instead.
#[instrument(skip_all)]
pub async fn mark_item_content_unavailable(
    pool: &Pool,
    item_id: &str,
    error: &str,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<FailureWrite> {
    let mut tx = pool.begin().await?;
    let retry_count: Option<i64> =
        sqlx::query_scalar("SELECT retry_count FROM items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(retry_count) = retry_count else {
        return Err(anyhow!("item {} not found", item_id));
    };

    let write = if retry_count < cfg.retry.max_retries {
        let next_retry_at = now + Duration::days(cfg.retry_interval_days(retry_count));
        sqlx::query(
            "UPDATE items SET status = ?, failure_reason = ?, last_error = ?, \
             retry_count = retry_count + 1, \
             first_failed_at = COALESCE(first_failed_at, ?), failed_at = ?, \
             next_retry_at = ? WHERE item_id = ?",
        )
        .bind(ItemStatus::Failed.as_str())
        .bind(FailureReason::ContentUnavailable.as_str())
        .bind(truncate_error(error))
        .bind(now)
        .bind(now)
        .bind(next_retry_at)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        FailureWrite::RetryScheduled {
            retry_count: retry_count + 1,
            next_retry_at,
        }
    } else {
        sqlx::query(
            "UPDATE items SET status = ?, failure_reason = ?, last_error = ?, \
             first_failed_at = COALESCE(first_failed_at, ?), failed_at = ?, \
             next_retry_at = NULL WHERE item_id = ?",
        )
        .bind(ItemStatus::PermanentlyFailed.as_str())
        .bind(FailureReason::ContentUnavailableExhausted.as_str())
        .bind(truncate_error(error))
        .bind(now)
        .bind(now)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        FailureWrite::Exhausted
    };
    tx.commit().await?;
    Ok(write)
}

/// Dependency-missing failure write. Marked FAILED but never scheduled for
/// the content-retry sweep: a missing library or broken proxy is an
/// operational defect the sweep cannot fix.
#[instrument(skip_all)]
pub async fn mark_item_dependency_missing(
    pool: &Pool,
    item_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE items SET status = ?, failure_reason = ?, last_error = ?, \
         first_failed_at = COALESCE(first_failed_at, ?), failed_at = ?, \
         next_retry_at = NULL WHERE item_id = ?",
    )
    .bind(ItemStatus::Failed.as_str())
    .bind(FailureReason::DependencyMissing.as_str())
    .bind(truncate_error(error))
    .bind(now)
    .bind(now)
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Non-retryable terminal failure write (e.g. the summarization provider
/// rejected the content outright).
#[instrument(skip_all)]
pub async fn mark_item_permanently_failed(
    pool: &Pool,
    item_id: &str,
    reason: FailureReason,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE items SET status = ?, failure_reason = ?, last_error = ?, \
         first_failed_at = COALESCE(first_failed_at, ?), failed_at = ?, \
         next_retry_at = NULL WHERE item_id = ?",
    )
    .bind(ItemStatus::PermanentlyFailed.as_str())
    .bind(reason.as_str())
    .bind(truncate_error(error))
    .bind(now)
    .bind(now)
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Items eligible for the poller's retry sweep: content-unavailable
/// failures whose retry window has elapsed. Dependency-missing failures
/// never match.
#[instrument(skip_all)]
pub async fn due_retry_items(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<ItemRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM items WHERE status = ? AND failure_reason = ? \
         AND next_retry_at IS NOT NULL AND datetime(next_retry_at) <= datetime(?) \
         ORDER BY datetime(next_retry_at) ASC",
    )
    .bind(ItemStatus::Failed.as_str())
    .bind(FailureReason::ContentUnavailable.as_str())
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_item).collect()
}

/// Flip a swept item back to QUEUED. retry_count stays put: the attempt
/// was already counted when the failure was classified.
#[instrument(skip_all)]
pub async fn requeue_item_for_retry(pool: &Pool, item_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE items SET status = ?, next_retry_at = NULL WHERE item_id = ? AND status = ?",
    )
    .bind(ItemStatus::Queued.as_str())
    .bind(item_id)
    .bind(ItemStatus::Failed.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_summary(row: &SqliteRow) -> SummaryRecord {
    SummaryRecord {
        item_id: row.get("item_id"),
        title: row.get("title"),
        source_label: row.get("source_label"),
        summary: row.get("summary"),
        published_at: row.get("published_at"),
        summarized_at: row.get("summarized_at"),
        newsletter_sent_at: row.get("newsletter_sent_at"),
        newsletter_sent_count: row.get("newsletter_sent_count"),
    }
}

/// Digest selection: summaries published within the window that have never
/// been delivered, newest first.
#[instrument(skip_all)]
pub async fn unsent_summaries_since(
    pool: &Pool,
    published_after: DateTime<Utc>,
) -> Result<Vec<SummaryRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM summaries WHERE datetime(published_at) >= datetime(?) \
         AND newsletter_sent_at IS NULL \
         ORDER BY datetime(published_at) DESC",
    )
    .bind(published_after)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_summary).collect())
}

#[instrument(skip_all)]
pub async fn get_summary(pool: &Pool, item_id: &str) -> Result<Option<SummaryRecord>> {
    let row = sqlx::query("SELECT * FROM summaries WHERE item_id = ?")
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_summary))
}

/// Stamp delivered summaries. The IS NULL guard makes the stamp
/// first-writer-wins: a summary already marked by an overlapping run is
/// left untouched. Returns the number of rows actually stamped.
#[instrument(skip_all)]
pub async fn mark_summaries_sent(
    pool: &Pool,
    item_ids: &[String],
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut stamped = 0;
    for item_id in item_ids {
        let result = sqlx::query(
            "UPDATE summaries SET newsletter_sent_at = ?, \
             newsletter_sent_count = newsletter_sent_count + 1 \
             WHERE item_id = ? AND newsletter_sent_at IS NULL",
        )
        .bind(now)
        .bind(item_id)
        .execute(pool)
        .await?;
        stamped += result.rows_affected();
    }
    Ok(stamped)
}

/// Item counts grouped by status, for the operator status view.
#[instrument(skip_all)]
pub async fn status_counts(pool: &Pool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM items GROUP BY status ORDER BY status")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
        .collect())
}

/// Permanently failed items whose terminal failure is older than the
/// cutoff; cleanup candidates.
#[instrument(skip_all)]
pub async fn aged_permanent_failures(
    pool: &Pool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT item_id FROM items WHERE status = ? \
         AND failed_at IS NOT NULL AND datetime(failed_at) <= datetime(?)",
    )
    .bind(ItemStatus::PermanentlyFailed.as_str())
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn delete_item_and_summary(pool: &Pool, item_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM items WHERE item_id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;
    // The summary may not exist for failed items; deleting nothing is fine.
    sqlx::query("DELETE FROM summaries WHERE item_id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// TTL purge: drop expired non-failed records. Failed records are left to
/// the aged-failure policy above. Returns (items, summaries) deleted.
#[instrument(skip_all)]
pub async fn purge_expired(pool: &Pool, now: DateTime<Utc>) -> Result<(u64, u64)> {
    let items = sqlx::query(
        "DELETE FROM items WHERE datetime(expires_at) <= datetime(?) AND status NOT IN (?, ?)",
    )
    .bind(now)
    .bind(ItemStatus::Failed.as_str())
    .bind(ItemStatus::PermanentlyFailed.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    let summaries = sqlx::query(
        "DELETE FROM summaries WHERE datetime(expires_at) <= datetime(?) \
         AND item_id NOT IN (SELECT item_id FROM items)",
    )
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok((items, summaries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn test_config() -> Config {
        serde_yaml::from_str(crate::config::example()).unwrap()
    }

    fn item(id: &str) -> DiscoveredItem {
        DiscoveredItem {
            item_id: id.into(),
            title: format!("Title {id}"),
            source_label: "Example Channel".into(),
            published_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn work(id: &str) -> WorkItem {
        WorkItem {
            item_id: id.into(),
            title: format!("Title {id}"),
            source_label: "Example Channel".into(),
            published_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn conditional_create_is_idempotent() {
        let pool = setup_pool().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();

        assert!(create_item_if_absent(&pool, "src-1", &item("a"), now, 30)
            .await
            .unwrap());
        // Second discovery of the same item must not win the create.
        assert!(!create_item_if_absent(&pool, "src-1", &item("a"), now, 30)
            .await
            .unwrap());

        let rec = get_item(&pool, "a").await.unwrap().unwrap();
        assert_eq!(rec.status, ItemStatus::Queued);
        assert_eq!(rec.retry_count, 0);
    }

    #[tokio::test]
    async fn content_unavailable_schedules_then_exhausts() {
        let pool = setup_pool().await;
        let cfg = test_config();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        create_item_if_absent(&pool, "src-1", &item("x"), now, 30)
            .await
            .unwrap();

        // Attempts 1..=3 schedule a retry and bump the counter.
        for attempt in 1..=3 {
            let write = mark_item_content_unavailable(&pool, "x", "no transcript", &cfg, now)
                .await
                .unwrap();
            match write {
                FailureWrite::RetryScheduled { retry_count, next_retry_at } => {
                    assert_eq!(retry_count, attempt);
                    assert_eq!(next_retry_at, now + Duration::days(2));
                }
                FailureWrite::Exhausted => panic!("exhausted too early"),
            }
        }

        let rec = get_item(&pool, "x").await.unwrap().unwrap();
        assert_eq!(rec.retry_count, 3);
        assert_eq!(rec.status, ItemStatus::Failed);

        // The budget is spent; the next failure goes terminal.
        let write = mark_item_content_unavailable(&pool, "x", "still nothing", &cfg, now)
            .await
            .unwrap();
        assert_eq!(write, FailureWrite::Exhausted);

        let rec = get_item(&pool, "x").await.unwrap().unwrap();
        assert_eq!(rec.status, ItemStatus::PermanentlyFailed);
        assert_eq!(
            rec.failure_reason,
            Some(FailureReason::ContentUnavailableExhausted)
        );
        assert_eq!(rec.retry_count, 3);
        assert!(rec.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn dependency_missing_is_excluded_from_sweep() {
        let pool = setup_pool().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        create_item_if_absent(&pool, "src-1", &item("d"), now, 30)
            .await
            .unwrap();

        mark_item_dependency_missing(&pool, "d", "proxy credentials rejected", now)
            .await
            .unwrap();

        let rec = get_item(&pool, "d").await.unwrap().unwrap();
        assert_eq!(rec.status, ItemStatus::Failed);
        assert_eq!(rec.failure_reason, Some(FailureReason::DependencyMissing));
        assert!(rec.next_retry_at.is_none());

        let due = due_retry_items(&pool, now + Duration::days(365)).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn summary_upsert_preserves_sent_markers() {
        let pool = setup_pool().await;
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let w = work("s");

        upsert_summary(&pool, &w, "first pass", now, 30).await.unwrap();
        let stamped = mark_summaries_sent(&pool, &[w.item_id.clone()], now)
            .await
            .unwrap();
        assert_eq!(stamped, 1);

        // Queue redelivery reprocesses the item and rewrites the summary.
        upsert_summary(&pool, &w, "second pass", now + Duration::hours(1), 30)
            .await
            .unwrap();

        let rec = get_summary(&pool, "s").await.unwrap().unwrap();
        assert_eq!(rec.summary, "second pass");
        assert_eq!(rec.newsletter_sent_at, Some(now));
        assert_eq!(rec.newsletter_sent_count, 1);

        // Already-sent summaries never get stamped twice.
        let stamped = mark_summaries_sent(&pool, &[w.item_id.clone()], now)
            .await
            .unwrap();
        assert_eq!(stamped, 0);
    }

    #[tokio::test]
    async fn purge_expired_spares_failed_items() {
        let pool = setup_pool().await;
        let cfg = test_config();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();

        create_item_if_absent(&pool, "src-1", &item("old"), now, 30)
            .await
            .unwrap();
        create_item_if_absent(&pool, "src-1", &item("failed"), now, 30)
            .await
            .unwrap();
        mark_item_content_unavailable(&pool, "failed", "gone", &cfg, now)
            .await
            .unwrap();

        let (items, _) = purge_expired(&pool, now + Duration::days(31)).await.unwrap();
        assert_eq!(items, 1);
        assert!(get_item(&pool, "old").await.unwrap().is_none());
        assert!(get_item(&pool, "failed").await.unwrap().is_some());
    }
}
