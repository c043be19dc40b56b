//! Cross-cycle dedup and per-subscription fan-out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use watcher_common::broker::Topic;
use watcher_common::envelope::Envelope;
use watcher_common::models::{NotificationPayload, StreamEvent};
use watcher_common::redis::CacheClient;

/// Longer than any plausible live session, short enough that a broadcaster
/// restarting the next day announces again.
const SEEN_TTL: Duration = Duration::from_secs(26 * 60 * 60);

/// Where the fan-out publishes to. Behind a trait so the dedup and fan-out
/// logic can be exercised without a live broker.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, payload: NotificationPayload) -> Result<()>;
}

#[async_trait]
impl NotificationPublisher for Topic {
    async fn publish(&self, payload: NotificationPayload) -> Result<()> {
        Topic::publish(self, &Envelope::new(payload))
            .await
            .context("publish notification")
    }
}

/// What the filter decided about one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The broadcast was announced within the marker lifetime; nothing emitted.
    Duplicate,
    /// The broadcast is new; one notification was emitted per subscription ref.
    Published(usize),
}

/// Deduplicates stream events across poll cycles via an atomic seen-marker
/// and fans each surviving event out into per-subscription notifications.
#[derive(Clone)]
pub struct Filter {
    cache: Arc<dyn CacheClient>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl Filter {
    pub fn new(cache: Arc<dyn CacheClient>, publisher: Arc<dyn NotificationPublisher>) -> Self {
        Self { cache, publisher }
    }

    /// Process one stream event.
    ///
    /// Publishes all notifications or returns an error at the first
    /// failure; the caller naks on error, so a partial fan-out is only
    /// ever retried whole. Duplicates downstream of a partial fan-out are
    /// the accepted trade; a missed notification is not.
    pub async fn process(&self, event: &StreamEvent) -> Result<Outcome> {
        let key = seen_key(&event.stream_id, &event.user_login);

        let fresh = self
            .cache
            .set_nx_ex(key.clone(), "1".to_owned(), SEEN_TTL)
            .await
            .with_context(|| format!("seen-marker set {}", key))?;

        if !fresh {
            return Ok(Outcome::Duplicate);
        }

        let mut published = 0;
        for subscription in &event.subscriptions {
            let payload = NotificationPayload::from_event(event, subscription);
            self.publisher.publish(payload).await.with_context(|| {
                format!(
                    "publish notification for subscription {}",
                    subscription.subscription_id
                )
            })?;
            published += 1;
        }

        Ok(Outcome::Published(published))
    }
}

/// Broadcast ids are only unique within a user, so the marker key carries
/// both: the same id on two accounts must produce two distinct keys.
fn seen_key(stream_id: &str, user_login: &str) -> String {
    format!("seen:{}:{}", stream_id, user_login)
}
