//! Retry state machine scenarios: the multi-day content-unavailable
//! window, budget exhaustion, and the dependency-missing carve-out.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use digestbot::config::{Config, Source};
use digestbot::model::{DiscoveredItem, FailureReason, ItemStatus};
use digestbot::poller;
use digestbot::processor::{self, ProcessorDeps};
use digestbot::queue;
use digestbot::sources::{FetchError, SourceListing, TranscriptFetcher};
use digestbot::store;
use digestbot::summarizer::{SummarizeError, Summarizer};
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    serde_yaml::from_str(digestbot::config::example()).unwrap()
}

fn day0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Listing that returns a fixed set once, then nothing: discovery happens
/// on the first poll and later polls only exercise the retry sweep.
#[derive(Clone, Default)]
struct OneShotListing {
    items: Arc<Mutex<Vec<DiscoveredItem>>>,
}

#[async_trait]
impl SourceListing for OneShotListing {
    async fn list_recent(
        &self,
        _source: &Source,
        _published_after: DateTime<Utc>,
    ) -> Result<Vec<DiscoveredItem>> {
        Ok(std::mem::take(&mut *self.items.lock().await))
    }
}

/// Fetcher whose every answer is "this content has no transcript yet".
#[derive(Clone, Default)]
struct NoTranscriptFetcher;

#[async_trait]
impl TranscriptFetcher for NoTranscriptFetcher {
    async fn fetch_transcript(&self, item_id: &str) -> Result<String, FetchError> {
        Err(FetchError::ContentUnavailable(format!(
            "no transcript for {item_id}"
        )))
    }
}

#[derive(Clone, Default)]
struct BrokenProxyFetcher;

#[async_trait]
impl TranscriptFetcher for BrokenProxyFetcher {
    async fn fetch_transcript(&self, _item_id: &str) -> Result<String, FetchError> {
        Err(FetchError::DependencyMissing(
            "transcript endpoint rejected credentials (403)".into(),
        ))
    }
}

#[derive(Clone, Default)]
struct NeverCalledSummarizer;

#[async_trait]
impl Summarizer for NeverCalledSummarizer {
    async fn summarize(
        &self,
        _title: &str,
        _source_label: &str,
        _transcript: &str,
    ) -> Result<String, SummarizeError> {
        panic!("summarizer must not be called when the fetch fails");
    }
}

async fn discover_one(pool: &sqlx::SqlitePool, cfg: &Config, id: &str, now: DateTime<Utc>) {
    let listing = OneShotListing::default();
    *listing.items.lock().await = vec![DiscoveredItem {
        item_id: id.into(),
        title: format!("Title {id}"),
        source_label: "Example Channel".into(),
        published_at: now - Duration::hours(1),
    }];
    let stats = poller::run_poll(pool, &listing, cfg, now).await.unwrap();
    assert_eq!(stats.items_queued, 1);
}

#[tokio::test]
async fn content_unavailable_waits_out_the_retry_window() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = day0();
    discover_one(&pool, &cfg, "x", now).await;

    let fetcher = NoTranscriptFetcher;
    let summarizer = NeverCalledSummarizer;
    let deps = ProcessorDeps {
        fetcher: &fetcher,
        summarizer: &summarizer,
    };

    // Attempt 1 fails on day 0: one attempt consumed, retry at ~day 2.
    let stats = processor::run_worker(&pool, &deps, &cfg, now, 10).await.unwrap();
    assert_eq!(stats.retries_scheduled, 1);
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);

    let rec = store::get_item(&pool, "x").await.unwrap().unwrap();
    assert_eq!(rec.status, ItemStatus::Failed);
    assert_eq!(rec.failure_reason, Some(FailureReason::ContentUnavailable));
    assert_eq!(rec.retry_count, 1);
    assert_eq!(rec.next_retry_at, Some(now + Duration::days(2)));
    assert_eq!(rec.first_failed_at, Some(now));

    // Day 1 sweep: before next_retry_at, nothing moves.
    let empty = OneShotListing::default();
    let stats = poller::run_poll(&pool, &empty, &cfg, now + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(stats.retries_requeued, 0);
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);

    // Day 2 sweep: the window has elapsed, the item is re-queued with its
    // counter untouched.
    let stats = poller::run_poll(&pool, &empty, &cfg, now + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(stats.retries_requeued, 1);
    assert_eq!(queue::depth(&pool).await.unwrap(), 1);

    let rec = store::get_item(&pool, "x").await.unwrap().unwrap();
    assert_eq!(rec.status, ItemStatus::Queued);
    assert_eq!(rec.retry_count, 1);
    assert!(rec.next_retry_at.is_none());
}

#[tokio::test]
async fn retry_budget_exhaustion_goes_terminal() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let mut now = day0();
    discover_one(&pool, &cfg, "y", now).await;

    let fetcher = NoTranscriptFetcher;
    let summarizer = NeverCalledSummarizer;
    let deps = ProcessorDeps {
        fetcher: &fetcher,
        summarizer: &summarizer,
    };
    let empty = OneShotListing::default();

    // Initial attempt plus the full retry ladder, every one failing.
    for expected_count in 1..=cfg.retry.max_retries {
        let stats = processor::run_worker(&pool, &deps, &cfg, now, 10).await.unwrap();
        assert_eq!(stats.retries_scheduled, 1);

        let rec = store::get_item(&pool, "y").await.unwrap().unwrap();
        assert_eq!(rec.retry_count, expected_count);
        assert!(rec.retry_count <= cfg.retry.max_retries);

        now = now + Duration::days(2);
        let stats = poller::run_poll(&pool, &empty, &cfg, now).await.unwrap();
        assert_eq!(stats.retries_requeued, 1);
    }

    // The budget is spent: the next failure is terminal, not rescheduled.
    let stats = processor::run_worker(&pool, &deps, &cfg, now, 10).await.unwrap();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.retries_scheduled, 0);

    let rec = store::get_item(&pool, "y").await.unwrap().unwrap();
    assert_eq!(rec.status, ItemStatus::PermanentlyFailed);
    assert_eq!(
        rec.failure_reason,
        Some(FailureReason::ContentUnavailableExhausted)
    );
    assert_eq!(rec.retry_count, cfg.retry.max_retries);
    assert!(rec.next_retry_at.is_none());

    // Terminal items never re-enter the queue.
    let stats = poller::run_poll(&pool, &empty, &cfg, now + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(stats.retries_requeued, 0);
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn dependency_missing_is_not_swept_for_retry() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = day0();
    discover_one(&pool, &cfg, "d", now).await;

    let fetcher = BrokenProxyFetcher;
    let summarizer = NeverCalledSummarizer;
    let deps = ProcessorDeps {
        fetcher: &fetcher,
        summarizer: &summarizer,
    };

    let stats = processor::run_worker(&pool, &deps, &cfg, now, 10).await.unwrap();
    assert_eq!(stats.dependency_failures, 1);

    let rec = store::get_item(&pool, "d").await.unwrap().unwrap();
    assert_eq!(rec.status, ItemStatus::Failed);
    assert_eq!(rec.failure_reason, Some(FailureReason::DependencyMissing));
    assert_eq!(rec.retry_count, 0);
    assert!(rec.next_retry_at.is_none());

    // The content-retry sweep must never pick it up, however long it sits.
    let empty = OneShotListing::default();
    let stats = poller::run_poll(&pool, &empty, &cfg, now + Duration::days(365))
        .await
        .unwrap();
    assert_eq!(stats.retries_requeued, 0);
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn summarizer_rejection_is_terminal() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = day0();
    discover_one(&pool, &cfg, "r", now).await;

    #[derive(Clone, Default)]
    struct OkFetcher;

    #[async_trait]
    impl TranscriptFetcher for OkFetcher {
        async fn fetch_transcript(&self, item_id: &str) -> Result<String, FetchError> {
            Ok(format!("transcript for {item_id}"))
        }
    }

    #[derive(Clone, Default)]
    struct RejectingSummarizer;

    #[async_trait]
    impl Summarizer for RejectingSummarizer {
        async fn summarize(
            &self,
            _title: &str,
            _source_label: &str,
            _transcript: &str,
        ) -> Result<String, SummarizeError> {
            Err(SummarizeError::Rejected("content policy".into()))
        }
    }

    let fetcher = OkFetcher;
    let summarizer = RejectingSummarizer;
    let deps = ProcessorDeps {
        fetcher: &fetcher,
        summarizer: &summarizer,
    };

    let stats = processor::run_worker(&pool, &deps, &cfg, now, 10).await.unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(queue::depth(&pool).await.unwrap(), 0);

    let rec = store::get_item(&pool, "r").await.unwrap().unwrap();
    assert_eq!(rec.status, ItemStatus::PermanentlyFailed);
    assert_eq!(rec.failure_reason, Some(FailureReason::SummaryRejected));
    assert!(store::get_summary(&pool, "r").await.unwrap().is_none());
}
