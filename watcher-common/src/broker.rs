//! # Broker
//!
//! Durable work-queue topics backed by a PostgreSQL table.
//!
//! Each topic behaves like a platform stream/consumer pair: messages are
//! delivered at least once, must be explicitly acked, and are redelivered
//! when a consumer naks or fails to ack within the topic's ack-wait.
//! Acking removes the message; naks past the max-deliver budget discard
//! it; messages older than the topic's max-age are dropped undelivered so
//! a stuck pipeline sheds stale work instead of replaying it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::envelope::Envelope;

pub const STREAMS_RAW_TOPIC: &str = "twitch.streams.raw";
pub const STREAMS_NEW_TOPIC: &str = "twitch.streams.new";

pub const STREAM_FILTER_CONSUMER: &str = "stream-filter";
pub const NOTIFICATION_DISPATCHER_CONSUMER: &str = "notification-dispatcher";

/// Enumeration of errors for operations on broker topics.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("failed to serialize envelope: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Enumeration of possible statuses for a broker message.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "message_status")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting in the topic to be picked up by a consumer.
    Available,
    /// Leased to a consumer; redeliverable once ack-wait elapses.
    Running,
    /// Redelivery budget exhausted; kept for tracking, never delivered.
    Discarded,
}

/// Delivery settings for one topic and its durable consumer.
#[derive(Debug, Clone, Copy)]
pub struct TopicConfig {
    pub name: &'static str,
    pub consumer: &'static str,
    pub max_deliver: i32,
    pub ack_wait: Duration,
    pub max_age: Duration,
}

/// The raw topic: one message per live broadcast per poll cycle.
pub fn streams_raw() -> TopicConfig {
    TopicConfig {
        name: STREAMS_RAW_TOPIC,
        consumer: STREAM_FILTER_CONSUMER,
        max_deliver: 5,
        ack_wait: Duration::from_secs(30),
        max_age: Duration::from_secs(5 * 60),
    }
}

/// The notifications topic: one message per broadcast and subscription.
pub fn streams_new() -> TopicConfig {
    TopicConfig {
        name: STREAMS_NEW_TOPIC,
        consumer: NOTIFICATION_DISPATCHER_CONSUMER,
        max_deliver: 3,
        ack_wait: Duration::from_secs(30),
        max_age: Duration::from_secs(30 * 60),
    }
}

/// Connect a PostgreSQL pool for use with [`Topic::new_from_pool`].
///
/// Services that talk to more than one topic share a single pool.
pub async fn connect(url: &str) -> Result<PgPool, BrokerError> {
    PgPoolOptions::new()
        .connect(url)
        .await
        .map_err(|error| BrokerError::ConnectionError { error })
}

/// A message row as stored in the broker table.
#[derive(sqlx::FromRow, Debug)]
pub struct Message {
    pub id: i64,
    pub topic: String,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub status: MessageStatus,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub attempted_by: Vec<String>,
}

/// What happened to a naked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakOutcome {
    /// The message went back to available and will be redelivered.
    Requeued,
    /// The redelivery budget is exhausted; the message was discarded.
    Discarded,
}

/// A message leased to a consumer.
///
/// Must be acked or naked before the topic's ack-wait elapses, or the
/// broker treats the lease as lost and redelivers.
pub struct Delivery {
    pub message: Message,
    pool: PgPool,
    max_deliver: i32,
}

impl Delivery {
    /// The envelope carried by this delivery, as raw JSON.
    pub fn envelope_json(&self) -> &serde_json::Value {
        &self.message.payload.0
    }

    /// Acknowledge the message, removing it from the topic.
    pub async fn ack(self) -> Result<(), BrokerError> {
        sqlx::query("DELETE FROM broker_message WHERE id = $1")
            .bind(self.message.id)
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Negatively acknowledge the message.
    ///
    /// Requeues it for immediate redelivery, or discards it when the
    /// delivery that just failed was the last one in the budget.
    pub async fn nak(self) -> Result<NakOutcome, BrokerError> {
        if self.message.attempt >= self.max_deliver {
            sqlx::query("UPDATE broker_message SET status = 'discarded' WHERE id = $1")
                .bind(self.message.id)
                .execute(&self.pool)
                .await
                .map_err(|error| BrokerError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;

            return Ok(NakOutcome::Discarded);
        }

        sqlx::query(
            "UPDATE broker_message SET status = 'available', scheduled_at = NOW() WHERE id = $1",
        )
        .bind(self.message.id)
        .execute(&self.pool)
        .await
        .map_err(|error| BrokerError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(NakOutcome::Requeued)
    }
}

/// One durable topic plus the identity of the consumer dequeuing from it.
#[derive(Clone)]
pub struct Topic {
    config: TopicConfig,
    pool: PgPool,
}

impl Topic {
    /// Initialize a topic on its own connection pool.
    pub async fn new(config: TopicConfig, url: &str) -> Result<Self, BrokerError> {
        let pool = connect(url).await?;
        Ok(Self::new_from_pool(config, pool))
    }

    /// Initialize a topic on an existing pool.
    pub fn new_from_pool(config: TopicConfig, pool: PgPool) -> Self {
        Self { config, pool }
    }

    /// Publish an envelope to this topic.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_value(envelope)?;

        sqlx::query("INSERT INTO broker_message (topic, payload) VALUES ($1, $2)")
            .bind(self.config.name)
            .bind(sqlx::types::Json(payload))
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Lease the next deliverable message, if any.
    ///
    /// A message is deliverable when it is available and due, or when a
    /// previous lease on it has outlived the topic's ack-wait. Expired
    /// messages are swept first so they are never delivered.
    pub async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        self.expire_old().await?;

        // The query that follows uses a FOR UPDATE SKIP LOCKED clause so
        // concurrent consumers never lease the same message twice.
        let query = r#"
WITH deliverable AS (
    SELECT
        id
    FROM
        broker_message
    WHERE
        topic = $1
        AND attempt < $2
        AND (
            (status = 'available' AND scheduled_at <= NOW())
            OR (status = 'running' AND attempted_at <= NOW() - make_interval(secs => $3))
        )
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    broker_message
SET
    status = 'running',
    attempt = broker_message.attempt + 1,
    attempted_at = NOW(),
    attempted_by = array_append(broker_message.attempted_by, $4::text)
FROM
    deliverable
WHERE
    broker_message.id = deliverable.id
RETURNING
    broker_message.*
        "#;

        let message: Option<Message> = sqlx::query_as(query)
            .bind(self.config.name)
            .bind(self.config.max_deliver)
            .bind(self.config.ack_wait.as_secs_f64())
            .bind(self.config.consumer)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(message.map(|message| Delivery {
            message,
            pool: self.pool.clone(),
            max_deliver: self.config.max_deliver,
        }))
    }

    /// Drop messages older than the topic's max-age, whatever their status.
    async fn expire_old(&self) -> Result<(), BrokerError> {
        sqlx::query(
            "DELETE FROM broker_message WHERE topic = $1 AND created_at <= NOW() - make_interval(secs => $2)",
        )
        .bind(self.config.name)
        .bind(self.config.max_age.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|error| BrokerError::QueryError {
            command: "DELETE".to_owned(),
            error,
        })?;

        Ok(())
    }
}
