//! Consume raw stream events, drop cross-cycle duplicates, and fan each
//! surviving event out into one notification per subscription.

use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use stream_filter::config::Config;
use stream_filter::consumer::FilterConsumer;
use stream_filter::filter::Filter;
use watcher_common::broker::{self, Topic};
use watcher_common::health::HealthRegistry;
use watcher_common::metrics;
use watcher_common::redis::RedisClient;
use watcher_common::signals;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = broker::connect(&config.database_url)
        .await
        .expect("failed to connect to the broker");
    let raw_topic = Topic::new_from_pool(broker::streams_raw(), pool.clone());
    let notifications_topic = Topic::new_from_pool(broker::streams_new(), pool);

    let cache = Arc::new(
        RedisClient::new(config.redis_url.clone()).expect("failed to create redis client"),
    );
    let filter = Filter::new(cache, Arc::new(notifications_topic));

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

    let consumer = FilterConsumer::new(
        raw_topic,
        filter,
        config.dequeue_interval.0,
        config.max_concurrent_jobs,
        consumer_liveness,
        shutdown,
    );

    tracing::info!("stream-filter started");
    if let Err(error) = consumer.run().await {
        tracing::error!("consumer error: {}", error);
        std::process::exit(1);
    }
    tracing::info!("stream-filter stopped");
}
