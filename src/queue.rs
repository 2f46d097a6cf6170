//! SQLite-backed work queue with at-least-once delivery semantics.
//!
//! A received message is leased, not removed: it turns invisible until
//! `visible_at` passes, then gets redelivered. Consumers must ack to
//! delete or nack to reschedule. Messages that burn through their
//! redelivery budget are diverted to the dead-letter table at receive
//! time, as a backstop for crashed or wedged consumers.
use crate::config::Queue as QueueCfg;
use crate::model::{QueueMessage, WorkItem};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::store::Pool;

#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, work: &WorkItem, now: DateTime<Utc>) -> Result<String> {
    let message_id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(work)?;
    sqlx::query(
        "INSERT INTO work_queue (message_id, payload, deliveries, visible_at, enqueued_at) \
         VALUES (?, ?, 0, ?, ?)",
    )
    .bind(&message_id)
    .bind(payload)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(message_id)
}

/// Lease up to `max_messages` visible messages. Each returned message has
/// its delivery counted and stays invisible for the configured visibility
/// timeout; messages past the redelivery budget are moved to dead_letters
/// instead of being returned.
#[instrument(skip_all)]
pub async fn receive(
    pool: &Pool,
    cfg: &QueueCfg,
    now: DateTime<Utc>,
    max_messages: i64,
) -> Result<Vec<QueueMessage>> {
    let mut leased = Vec::new();
    while (leased.len() as i64) < max_messages {
        let mut tx = pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, message_id, payload, deliveries FROM work_queue \
             WHERE datetime(visible_at) <= datetime(?) ORDER BY id ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            break;
        };

        let id: i64 = row.get("id");
        let message_id: String = row.get("message_id");
        let payload: String = row.get("payload");
        let deliveries: i64 = row.get("deliveries");

        if deliveries >= cfg.max_deliveries {
            warn!(message_id, deliveries, "redelivery budget exhausted; moving to dead letters");
            sqlx::query(
                "INSERT INTO dead_letters (message_id, payload, deliveries, last_error, dead_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&message_id)
            .bind(&payload)
            .bind(deliveries)
            .bind("redelivery limit exceeded")
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM work_queue WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            continue;
        }

        let lease_until = now + Duration::seconds(cfg.visibility_timeout_secs);
        sqlx::query("UPDATE work_queue SET deliveries = deliveries + 1, visible_at = ? WHERE id = ?")
            .bind(lease_until)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        leased.push(QueueMessage {
            id,
            message_id,
            payload,
            deliveries: deliveries + 1,
        });
    }
    Ok(leased)
}

/// Acknowledge: the message is done and leaves the queue for good.
#[instrument(skip_all)]
pub async fn ack(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM work_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Negative-acknowledge: hand the message back for redelivery after an
/// exponential backoff (base * 2^(deliveries-1), capped).
#[instrument(skip_all)]
pub async fn nack(
    pool: &Pool,
    id: i64,
    deliveries: i64,
    cfg: &QueueCfg,
    now: DateTime<Utc>,
) -> Result<()> {
    let shift = (deliveries - 1).clamp(0, 10) as u32;
    let secs = cfg
        .nack_base_secs
        .saturating_mul(1_i64 << shift)
        .min(cfg.nack_cap_secs);
    sqlx::query("UPDATE work_queue SET visible_at = ? WHERE id = ?")
        .bind(now + Duration::seconds(secs))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn depth(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn dead_letter_depth(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
