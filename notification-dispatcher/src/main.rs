//! Consume notification payloads and deliver each to its subscriber's
//! webhook with bounded retries.

use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use notification_dispatcher::config::Config;
use notification_dispatcher::consumer::DispatchConsumer;
use notification_dispatcher::discord::Sender;
use watcher_common::broker::{self, Topic};
use watcher_common::health::HealthRegistry;
use watcher_common::metrics;
use watcher_common::signals;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let topic = Topic::new(broker::streams_new(), &config.database_url)
        .await
        .expect("failed to connect to the broker");
    let sender = Arc::new(Sender::new());

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness
        .register("consumer".to_string(), chrono::Duration::seconds(30))
        .await;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        signals::wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let bind = config.bind();
    let router = metrics::observability_router(liveness);
    tokio::spawn(async move {
        if let Err(error) = metrics::serve(router, &bind).await {
            tracing::error!("failed to start serving metrics: {}", error);
        }
    });

    let consumer = DispatchConsumer::new(
        topic,
        sender,
        config.dequeue_interval.0,
        config.max_concurrent_jobs,
        consumer_liveness,
        shutdown,
    );

    tracing::info!("notification-dispatcher started");
    if let Err(error) = consumer.run().await {
        tracing::error!("consumer error: {}", error);
        std::process::exit(1);
    }
    tracing::info!("notification-dispatcher stopped");
}
