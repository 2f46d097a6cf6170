//! Clients for the external content ecosystem: the listing API that
//! enumerates recently published items, and the transcript endpoint that
//! serves the input artifact for summarization.
use crate::config::{Config, Source};
use crate::model::DiscoveredItem;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

const LISTING_API_BASE: &str = "https://listing.example.com/";
const TRANSCRIPT_API_BASE: &str = "https://transcripts.example.com/";

/// Closed classification of transcript-fetch outcomes. Consumers match
/// exhaustively; each arm drives a different leg of the retry design.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The content itself cannot provide a transcript right now (not
    /// published yet, disabled, taken down). Retried on the multi-day
    /// schedule.
    #[error("content unavailable: {0}")]
    ContentUnavailable(String),
    /// A required local dependency is broken: rejected proxy credentials,
    /// missing configuration. An operational defect, never content state.
    #[error("dependency missing: {0}")]
    DependencyMissing(String),
    /// Network, quota, or provider outage. Left to queue redelivery.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait SourceListing: Send + Sync {
    async fn list_recent(
        &self,
        source: &Source,
        published_after: DateTime<Utc>,
    ) -> Result<Vec<DiscoveredItem>>;
}

#[async_trait]
pub trait TranscriptFetcher: Send + Sync {
    async fn fetch_transcript(&self, item_id: &str) -> Result<String, FetchError>;
}

#[derive(Deserialize)]
struct ListingResponse {
    items: Vec<ListingEntry>,
}

#[derive(Deserialize)]
struct ListingEntry {
    item_id: String,
    title: String,
    #[serde(default)]
    source_label: Option<String>,
    published_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HttpSourceListing {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for HttpSourceListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSourceListing")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSourceListing {
    pub fn from_config(cfg: &Config) -> Self {
        let base_url = cfg
            .listing
            .base_url
            .as_deref()
            .unwrap_or(LISTING_API_BASE)
            .parse()
            .expect("valid listing base URL");
        Self::with_base_url(cfg.listing.api_key.clone(), base_url)
    }

    pub fn with_base_url(api_key: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("digestbot/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl SourceListing for HttpSourceListing {
    async fn list_recent(
        &self,
        source: &Source,
        published_after: DateTime<Utc>,
    ) -> Result<Vec<DiscoveredItem>> {
        let endpoint = self
            .base_url
            .join("v1/search")
            .context("invalid listing base URL")?;
        let res = self
            .http
            .get(endpoint)
            .query(&[
                ("source_id", source.id.as_str()),
                ("published_after", &published_after.to_rfc3339()),
                ("max_results", "50"),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("failed to reach listing API")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("listing error {} for source {}: {}", status, source.id, body);
        }

        let payload: ListingResponse = res
            .json()
            .await
            .context("invalid listing response JSON")?;

        Ok(payload
            .items
            .into_iter()
            .map(|entry| DiscoveredItem {
                item_id: entry.item_id,
                title: entry.title,
                source_label: entry.source_label.unwrap_or_else(|| source.label.clone()),
                published_at: entry.published_at,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    transcript: String,
}

#[derive(Clone)]
pub struct HttpTranscriptFetcher {
    http: Client,
    base_url: Url,
    proxy_username: Option<String>,
    proxy_password: Option<String>,
}

impl fmt::Debug for HttpTranscriptFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTranscriptFetcher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTranscriptFetcher {
    pub fn from_config(cfg: &Config) -> Self {
        let base_url = cfg
            .transcripts
            .base_url
            .as_deref()
            .unwrap_or(TRANSCRIPT_API_BASE)
            .parse()
            .expect("valid transcript base URL");
        Self::with_base_url(
            base_url,
            cfg.transcripts.proxy_username.clone(),
            cfg.transcripts.proxy_password.clone(),
        )
    }

    pub fn with_base_url(
        base_url: Url,
        proxy_username: Option<String>,
        proxy_password: Option<String>,
    ) -> Self {
        let http = Client::builder()
            .user_agent("digestbot/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            proxy_username,
            proxy_password,
        }
    }
}

/// Map an HTTP status onto the fetch taxonomy. 404/410 mean the content
/// has no transcript to give; 401/403/407 mean our credentials or proxy
/// are broken; everything else non-2xx is worth a redelivery.
fn classify_status(status: StatusCode, item_id: &str) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            FetchError::ContentUnavailable(format!("no transcript for item {item_id}"))
        }
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::PROXY_AUTHENTICATION_REQUIRED => FetchError::DependencyMissing(format!(
            "transcript endpoint rejected credentials ({status}) for item {item_id}"
        )),
        _ => FetchError::Transient(format!(
            "transcript endpoint returned {status} for item {item_id}"
        )),
    }
}

#[async_trait]
impl TranscriptFetcher for HttpTranscriptFetcher {
    async fn fetch_transcript(&self, item_id: &str) -> Result<String, FetchError> {
        let endpoint = self
            .base_url
            .join(&format!("v1/transcripts/{item_id}"))
            .map_err(|err| FetchError::DependencyMissing(format!("bad transcript URL: {err}")))?;

        let mut req = self.http.get(endpoint);
        if let (Some(user), Some(pass)) = (&self.proxy_username, &self.proxy_password) {
            req = req.basic_auth(user, Some(pass));
        }

        let res = req
            .send()
            .await
            .map_err(|err| FetchError::Transient(format!("transcript request failed: {err}")))?;

        if !res.status().is_success() {
            return Err(classify_status(res.status(), item_id));
        }

        let payload: TranscriptResponse = res
            .json()
            .await
            .map_err(|err| FetchError::Transient(format!("invalid transcript JSON: {err}")))?;

        if payload.transcript.trim().is_empty() {
            return Err(FetchError::ContentUnavailable(format!(
                "empty transcript for item {item_id}"
            )));
        }
        Ok(payload.transcript)
    }
}
