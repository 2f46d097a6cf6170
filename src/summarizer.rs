//! Summarization provider client. The processor only cares whether a
//! failure is worth a redelivery or terminal, so the error type carries
//! exactly that split.
use crate::config::Config;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const PROVIDER_API_BASE: &str = "https://api.anthropic.com/";

#[derive(Debug, Error)]
pub enum SummarizeError {
    /// Quota, network, or provider outage; the message should be
    /// redelivered, nothing written to the store.
    #[error("transient summarizer failure: {0}")]
    Transient(String),
    /// The provider rejected this content outright; retrying the same
    /// input will not help.
    #[error("summarizer rejected content: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        title: &str,
        source_label: &str,
        transcript: &str,
    ) -> Result<String, SummarizeError>;
}

#[derive(Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Clone)]
pub struct LlmSummarizer {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    language: String,
    max_input_chars: usize,
}

impl fmt::Debug for LlmSummarizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSummarizer")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl LlmSummarizer {
    pub fn from_config(cfg: &Config) -> Self {
        let base_url = cfg
            .summarizer
            .base_url
            .as_deref()
            .unwrap_or(PROVIDER_API_BASE)
            .parse()
            .expect("valid summarizer base URL");
        Self::with_base_url(
            base_url,
            cfg.summarizer.api_key.clone(),
            cfg.summarizer.model.clone(),
            cfg.summarizer.language.clone(),
            cfg.summarizer.max_input_chars,
        )
    }

    pub fn with_base_url(
        base_url: Url,
        api_key: String,
        model: String,
        language: String,
        max_input_chars: usize,
    ) -> Self {
        let http = Client::builder()
            .user_agent("digestbot/0.1")
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            model,
            language,
            max_input_chars,
        }
    }

    fn build_prompt(&self, title: &str, source_label: &str, transcript: &str) -> String {
        // Truncate on a char boundary before prompting; transcripts can
        // run far past the provider's useful context.
        let clipped: String = transcript.chars().take(self.max_input_chars).collect();
        let marker = if clipped.len() < transcript.len() {
            "\n... [transcript truncated]"
        } else {
            ""
        };
        format!(
            "Summarize this item for a newsletter digest, in {language}.\n\
             Structure: a one-sentence TL;DR, then 3-5 bulleted key takeaways \
             with bold headers, then a short conversational paragraph. \
             Use Markdown and keep paragraphs short.\n\n\
             Title: {title}\n\
             Source: {source_label}\n\n\
             Transcript:\n{clipped}{marker}",
            language = self.language,
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        title: &str,
        source_label: &str,
        transcript: &str,
    ) -> Result<String, SummarizeError> {
        let endpoint = self
            .base_url
            .join("v1/messages")
            .map_err(|err| SummarizeError::Rejected(format!("bad provider URL: {err}")))?;

        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            system: "You are a professional content curator writing newsletter-ready summaries."
                .to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: self.build_prompt(title, source_label, transcript),
            }],
        };

        let res = self
            .http
            .post(endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .map_err(|err| SummarizeError::Transient(format!("provider request failed: {err}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            // 429 and 5xx are outages worth redelivery; other 4xx mean the
            // request itself is unacceptable.
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(SummarizeError::Transient(format!(
                    "provider returned {status}: {body}"
                )));
            }
            return Err(SummarizeError::Rejected(format!(
                "provider returned {status}: {body}"
            )));
        }

        let payload: MessageResponse = res
            .json()
            .await
            .map_err(|err| SummarizeError::Transient(format!("invalid provider JSON: {err}")))?;

        let summary = payload
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");

        if summary.trim().is_empty() {
            return Err(SummarizeError::Rejected(
                "provider returned an empty summary".to_string(),
            ));
        }
        Ok(summary)
    }
}
