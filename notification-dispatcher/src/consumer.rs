//! Consume notification payloads and dispatch each to its webhook.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use watcher_common::broker::{BrokerError, Delivery, NakOutcome, Topic};
use watcher_common::envelope::{self, Envelope, EnvelopeError};
use watcher_common::health::HealthHandle;
use watcher_common::models::NotificationPayload;

use crate::discord::{SendError, Sender};

/// Enumeration of errors that stop the consume loop. Anything here is
/// fatal to the process; the supervisor restarts it.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("an error occurred in the underlying broker")]
    BrokerError(#[from] BrokerError),
}

/// Polls the notifications topic and spawns one bounded handler task per
/// delivery.
pub struct DispatchConsumer {
    topic: Topic,
    sender: Arc<Sender>,
    poll_interval: Duration,
    max_concurrent: usize,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl DispatchConsumer {
    pub fn new(
        topic: Topic,
        sender: Arc<Sender>,
        poll_interval: Duration,
        max_concurrent: usize,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            topic,
            sender,
            poll_interval,
            max_concurrent,
            liveness,
            shutdown,
        }
    }

    /// Run until cancelled, then drain in-flight handlers before returning.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.liveness.report_healthy().await;

            while !self.shutdown.is_cancelled() {
                let Some(delivery) = self.topic.dequeue().await? else {
                    break;
                };

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore has been closed");
                let sender = self.sender.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    handle_delivery(sender, shutdown, delivery).await;
                    drop(permit);
                });
            }
        }

        let _ = semaphore.acquire_many(self.max_concurrent as u32).await;
        info!("dispatch consumer stopped");
        Ok(())
    }
}

/// Handle one delivery end to end: decode, render, POST, ack or nak.
pub(crate) async fn handle_delivery(
    sender: Arc<Sender>,
    shutdown: CancellationToken,
    delivery: Delivery,
) {
    let envelope: Envelope<NotificationPayload> =
        match envelope::decode_value(delivery.envelope_json().clone()) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnsupportedVersion(version)) => {
                warn!(version = %version, "skipping notification with unsupported version");
                ack_logged(delivery).await;
                return;
            }
            Err(error) => {
                error!("decode notification payload failed: {}", error);
                nak_logged(delivery).await;
                return;
            }
        };

    let payload = envelope.payload;
    let started = tokio::time::Instant::now();

    match sender.send(&payload, &shutdown).await {
        Ok(()) => {
            info!(
                subscription_id = %payload.subscription_id,
                stream_id = %payload.stream_id,
                user_login = %payload.user_login,
                "notification dispatched"
            );
            metrics::counter!("webhook_dispatch_completed_total").increment(1);
            metrics::histogram!("webhook_dispatch_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            ack_logged(delivery).await;
        }
        Err(SendError::Cancelled) => {
            warn!(
                subscription_id = %payload.subscription_id,
                "dispatch cancelled; leaving the notification for redelivery"
            );
            nak_logged(delivery).await;
        }
        Err(error) => {
            error!(
                subscription_id = %payload.subscription_id,
                stream_id = %payload.stream_id,
                "webhook dispatch failed: {}",
                error
            );
            metrics::counter!("webhook_dispatch_failed_total").increment(1);
            nak_logged(delivery).await;
        }
    }
}

async fn ack_logged(delivery: Delivery) {
    if let Err(error) = delivery.ack().await {
        error!("ack failed: {}", error);
    }
}

async fn nak_logged(delivery: Delivery) {
    match delivery.nak().await {
        Ok(NakOutcome::Requeued) => {}
        Ok(NakOutcome::Discarded) => warn!("notification dropped after redelivery exhaustion"),
        Err(error) => error!("nak failed: {}", error),
    }
}
