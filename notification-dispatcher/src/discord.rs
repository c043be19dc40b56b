//! Render and deliver the outbound webhook body.

use chrono::{DateTime, Utc};
use reqwest::header;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use watcher_common::models::NotificationPayload;
use watcher_common::retry::RetryPolicy;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// In-handler attempts per delivery; the broker's redelivery budget is the
/// outer retry loop on top of this.
const MAX_ATTEMPTS: u32 = 3;

const EMBED_COLOR: u32 = 9_520_383;
const FOOTER_TEXT: &str = "Twitch Watcher";

/// Enumeration of errors for one webhook dispatch.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("webhook delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("dispatch cancelled during backoff")]
    Cancelled,
}

#[derive(Serialize)]
struct WebhookBody {
    embeds: Vec<Embed>,
}

#[derive(Serialize)]
struct Embed {
    title: String,
    description: String,
    url: String,
    color: u32,
    timestamp: DateTime<Utc>,
    image: EmbedImage,
    footer: EmbedFooter,
    fields: Vec<EmbedField>,
}

#[derive(Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Serialize)]
struct EmbedFooter {
    text: String,
}

#[derive(Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

/// Sends rich-embed webhook notifications with bounded backoff.
pub struct Sender {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl Sender {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Twitch Watcher Notification Dispatcher")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to construct reqwest client for webhook dispatch");

        Self {
            client,
            retry_policy,
        }
    }

    /// POST the rendered body to the subscriber's webhook URL.
    ///
    /// Any 2xx ends the call successfully. A non-2xx or a transport fault
    /// is retried with backoff, up to [`MAX_ATTEMPTS`] attempts in total.
    /// Cancellation during a backoff sleep aborts immediately with no
    /// further attempts.
    pub async fn send(
        &self,
        payload: &NotificationPayload,
        shutdown: &CancellationToken,
    ) -> Result<(), SendError> {
        let body = build_body(payload);
        let mut last = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let wait = self.retry_policy.time_until_next_retry(attempt - 1);
                debug!(attempt, wait = ?wait, "webhook retry backoff");
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(SendError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            match self
                .client
                .post(&payload.discord_webhook)
                .json(&body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last = format!("webhook returned {}", response.status()),
                Err(error) => last = format!("webhook POST failed: {}", error),
            }
        }

        Err(SendError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last,
        })
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

fn build_body(payload: &NotificationPayload) -> WebhookBody {
    WebhookBody {
        embeds: vec![Embed {
            title: format!("{} is live on Twitch!", payload.user_name),
            description: payload.title.clone(),
            url: payload.stream_url.clone(),
            color: EMBED_COLOR,
            timestamp: payload.started_at,
            image: EmbedImage {
                url: payload.thumbnail_url.clone(),
            },
            footer: EmbedFooter {
                text: FOOTER_TEXT.to_owned(),
            },
            fields: vec![
                EmbedField {
                    name: "Game".to_owned(),
                    value: payload.game_name.clone(),
                    inline: true,
                },
                EmbedField {
                    name: "Viewers".to_owned(),
                    value: payload.viewer_count.to_string(),
                    inline: true,
                },
            ],
        }],
    }
}
