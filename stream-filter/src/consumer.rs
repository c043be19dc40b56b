//! Consume raw stream events and delegate each to the filter.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use watcher_common::broker::{BrokerError, Delivery, NakOutcome, Topic};
use watcher_common::envelope::{self, Envelope, EnvelopeError};
use watcher_common::health::HealthHandle;
use watcher_common::models::StreamEvent;

use crate::filter::{Filter, Outcome};

/// Enumeration of errors that stop the consume loop. Anything here is
/// fatal to the process; the supervisor restarts it.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("an error occurred in the underlying broker")]
    BrokerError(#[from] BrokerError),
}

/// Polls the raw topic and spawns one bounded handler task per delivery.
pub struct FilterConsumer {
    topic: Topic,
    filter: Filter,
    poll_interval: Duration,
    max_concurrent: usize,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl FilterConsumer {
    pub fn new(
        topic: Topic,
        filter: Filter,
        poll_interval: Duration,
        max_concurrent: usize,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            topic,
            filter,
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
                let filter = self.filter.clone();
                tokio::spawn(async move {
                    handle_delivery(filter, delivery).await;
                    drop(permit);
                });
            }
        }

        let _ = semaphore.acquire_many(self.max_concurrent as u32).await;
        info!("filter consumer stopped");
        Ok(())
    }
}

/// Handle one delivery end to end: decode, dedup, fan out, ack or nak.
///
/// Safe under concurrent invocation; the only shared state it touches is
/// the external seen-marker store, which is atomic.
pub(crate) async fn handle_delivery(filter: Filter, delivery: Delivery) {
    let envelope: Envelope<StreamEvent> =
        match envelope::decode_value(delivery.envelope_json().clone()) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnsupportedVersion(version)) => {
                warn!(version = %version, "skipping stream event with unsupported version");
                ack_logged(delivery).await;
                return;
            }
            Err(error) => {
                error!("decode stream event failed: {}", error);
                nak_logged(delivery).await;
                return;
            }
        };

    let event = envelope.payload;
    match filter.process(&event).await {
        Ok(Outcome::Duplicate) => {
            debug!(stream_id = %event.stream_id, "duplicate broadcast discarded");
            ack_logged(delivery).await;
        }
        Ok(Outcome::Published(count)) => {
            info!(
                stream_id = %event.stream_id,
                notifications = count,
                "stream processed"
            );
            metrics::counter!("notifications_published_total").increment(count as u64);
            ack_logged(delivery).await;
        }
        Err(error) => {
            error!(stream_id = %event.stream_id, "filter process failed: {:#}", error);
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
        Ok(NakOutcome::Discarded) => warn!("stream event dropped after redelivery exhaustion"),
        Err(error) => error!("nak failed: {}", error),
    }
}
