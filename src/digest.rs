//! Digest compilation and delivery. Selection and sent-marking share one
//! code path for scheduled and manual runs, so an ad-hoc invocation can
//! never double-send: anything already stamped is invisible to the next
//! selection, and stamping happens only after confirmed delivery.
use crate::config::Config;
use crate::model::SummaryRecord;
use crate::store::{self, Pool};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Serialize;
use std::fmt;
use tracing::{info, instrument, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DigestStats {
    pub selected: u64,
    pub stamped: u64,
}

/// Rendered digest handed to the delivery channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DigestPayload {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

#[async_trait]
pub trait DigestSender: Send + Sync {
    async fn send(&self, digest: &DigestPayload) -> Result<()>;
}

static MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s*").unwrap());
static MD_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());

/// Down-render markdown summaries for the plain-text body.
fn markdown_to_text(md: &str) -> String {
    let no_headings = MD_HEADING.replace_all(md, "");
    MD_BOLD.replace_all(&no_headings, "$1").into_owned()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn html_paragraphs(md: &str) -> String {
    md.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the selected summaries into one digest payload.
pub fn render_digest(
    summaries: &[SummaryRecord],
    cfg: &Config,
    now: DateTime<Utc>,
) -> DigestPayload {
    let window_start = now - Duration::days(cfg.digest.window_days);
    let date_range = format!(
        "{} - {}",
        window_start.format("%b %d"),
        now.format("%b %d, %Y")
    );

    let subject = if summaries.len() == 1 {
        "Digest: 1 new summary".to_string()
    } else {
        format!("Digest: {} new summaries", summaries.len())
    };

    let mut text = format!("Content Digest ({date_range})\n");
    let mut html = format!(
        "<h1>Content Digest</h1>\n<p>{}</p>\n",
        escape_html(&date_range)
    );
    for (i, s) in summaries.iter().enumerate() {
        text.push_str(&format!(
            "\n{}. {} ({})\n   Published: {}\n\n{}\n",
            i + 1,
            s.title,
            s.source_label,
            s.published_at.format("%b %d, %Y"),
            markdown_to_text(&s.summary)
        ));
        html.push_str(&format!(
            "<h2>{}</h2>\n<p class=\"meta\">{} · {}</p>\n{}\n",
            escape_html(&s.title),
            escape_html(&s.source_label),
            s.published_at.format("%b %d, %Y"),
            html_paragraphs(&s.summary)
        ));
    }

    DigestPayload {
        sender: cfg.digest.sender.clone(),
        recipient: cfg.digest.recipient.clone(),
        subject,
        text_body: text,
        html_body: html,
    }
}

/// Compile and deliver the digest. Zero unsent summaries means no
/// delivery attempt and no mutation at all; a delivery failure leaves
/// every summary unmarked so the next run retries the same set.
#[instrument(skip_all)]
pub async fn run_digest(
    pool: &Pool,
    sender: &dyn DigestSender,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<DigestStats> {
    let window_start = now - Duration::days(cfg.digest.window_days);
    let summaries = store::unsent_summaries_since(pool, window_start).await?;

    let mut stats = DigestStats {
        selected: summaries.len() as u64,
        stamped: 0,
    };
    if summaries.is_empty() {
        info!("no unsent summaries in window; skipping digest");
        return Ok(stats);
    }

    let payload = render_digest(&summaries, cfg, now);
    info!(
        count = summaries.len(),
        recipient = %payload.recipient,
        "sending digest"
    );

    if let Err(err) = sender.send(&payload).await {
        warn!(?err, "digest delivery failed; summaries left unmarked");
        return Err(err).context("failed to deliver digest");
    }

    let item_ids: Vec<String> = summaries.iter().map(|s| s.item_id.clone()).collect();
    stats.stamped = store::mark_summaries_sent(pool, &item_ids, now).await?;
    info!(stamped = stats.stamped, "digest delivered");
    Ok(stats)
}

/// Delivery-channel client: posts the rendered digest to a mail API.
#[derive(Clone)]
pub struct HttpDigestSender {
    http: Client,
    endpoint: Url,
    api_key: String,
}

impl fmt::Debug for HttpDigestSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDigestSender")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpDigestSender {
    pub fn from_config(cfg: &Config) -> Self {
        let endpoint = cfg
            .digest
            .endpoint
            .parse()
            .expect("valid digest endpoint URL");
        Self::new(endpoint, cfg.digest.api_key.clone())
    }

    pub fn new(endpoint: Url, api_key: String) -> Self {
        let http = Client::builder()
            .user_agent("digestbot/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl DigestSender for HttpDigestSender {
    async fn send(&self, digest: &DigestPayload) -> Result<()> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(digest)
            .send()
            .await
            .context("failed to reach delivery channel")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("delivery channel error {}: {}", status, body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(id: &str, body: &str) -> SummaryRecord {
        SummaryRecord {
            item_id: id.into(),
            title: format!("Title {id}"),
            source_label: "Example Channel".into(),
            summary: body.into(),
            published_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            summarized_at: Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap(),
            newsletter_sent_at: None,
            newsletter_sent_count: 0,
        }
    }

    #[test]
    fn markdown_down_render() {
        let text = markdown_to_text("## Key Takeaways\n**Point one** matters");
        assert_eq!(text, "Key Takeaways\nPoint one matters");
    }

    #[test]
    fn render_includes_every_summary() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 9, 0, 0).unwrap();
        let summaries = vec![summary("a", "First summary"), summary("b", "Second summary")];

        let payload = render_digest(&summaries, &cfg, now);
        assert_eq!(payload.subject, "Digest: 2 new summaries");
        assert!(payload.text_body.contains("Title a"));
        assert!(payload.text_body.contains("Second summary"));
        assert!(payload.html_body.contains("<h2>Title b</h2>"));
        assert_eq!(payload.recipient, cfg.digest.recipient);
    }

    #[test]
    fn render_escapes_html_in_titles() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 9, 0, 0).unwrap();
        let mut s = summary("a", "Body");
        s.title = "Tags <em> & friends".into();

        let payload = render_digest(&[s], &cfg, now);
        assert!(payload.html_body.contains("Tags &lt;em&gt; &amp; friends"));
    }
}
