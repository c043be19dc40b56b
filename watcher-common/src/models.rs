//! Data model shared across the pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a subscription watches a game or a single streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Game,
    Streamer,
}

/// An active subscription as served by the subscription source.
///
/// Read-only in the pipeline; only the poller ever sees full records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub discord_webhook: String,
    pub watch_type: WatchKind,
    pub watch_target: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// The projection of a subscription carried through the pipeline.
///
/// Downstream of the poller this is the only identity a subscription has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub subscription_id: String,
    pub discord_webhook: String,
}

/// A raw live-stream record as returned by the Helix `streams` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwitchStream {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    pub game_id: String,
    pub game_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub viewer_count: i64,
    pub started_at: DateTime<Utc>,
    pub language: String,
    pub thumbnail_url: String,
}

/// One live broadcast observed during a poll cycle, published to the raw
/// topic with every subscription that matched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: String,
    pub user_login: String,
    pub user_name: String,
    pub game_id: String,
    pub game_name: String,
    pub title: String,
    pub viewer_count: i64,
    pub started_at: DateTime<Utc>,
    pub thumbnail_url: String,
    pub stream_url: String,
    pub subscriptions: Vec<SubscriptionRef>,
    pub polled_at: DateTime<Utc>,
}

/// The per-subscription unit of work published to the notifications topic.
/// One message per SubscriptionRef on the event that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub subscription_id: String,
    pub discord_webhook: String,
    pub stream_id: String,
    pub user_login: String,
    pub user_name: String,
    pub game_name: String,
    pub title: String,
    pub viewer_count: i64,
    pub started_at: DateTime<Utc>,
    pub thumbnail_url: String,
    pub stream_url: String,
}

impl NotificationPayload {
    /// Flatten a subscription ref and the broadcast facts it matched into
    /// one delivery unit.
    pub fn from_event(event: &StreamEvent, subscription: &SubscriptionRef) -> Self {
        Self {
            subscription_id: subscription.subscription_id.clone(),
            discord_webhook: subscription.discord_webhook.clone(),
            stream_id: event.stream_id.clone(),
            user_login: event.user_login.clone(),
            user_name: event.user_name.clone(),
            game_name: event.game_name.clone(),
            title: event.title.clone(),
            viewer_count: event.viewer_count,
            started_at: event.started_at,
            thumbnail_url: event.thumbnail_url.clone(),
            stream_url: event.stream_url.clone(),
        }
    }
}
