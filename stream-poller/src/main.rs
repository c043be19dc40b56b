//! Poll the platform on behalf of every active subscription and publish
//! one raw event per live broadcast.

use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use stream_poller::config::Config;
use stream_poller::poller::Poller;
use stream_poller::subscription::SubscriptionClient;
use stream_poller::token::TokenManager;
use stream_poller::twitch::HelixClient;
use watcher_common::broker::{self, Topic};
use watcher_common::health::HealthRegistry;
use watcher_common::metrics;
use watcher_common::redis::RedisClient;
use watcher_common::signals;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let topic = Topic::new(broker::streams_raw(), &config.database_url)
        .await
        .expect("failed to connect to the broker");
    let cache = Arc::new(
        RedisClient::new(config.redis_url.clone()).expect("failed to create redis client"),
    );
    let tokens = Arc::new(TokenManager::new(
        &config.twitch_client_id,
        &config.twitch_client_secret,
    ));
    let twitch = HelixClient::new(&config.twitch_client_id, tokens);
    let subscriptions =
        SubscriptionClient::new(&config.subscription_svc_url, &config.internal_api_key);

    let liveness = HealthRegistry::new("liveness");
    let poll_deadline = chrono::Duration::from_std(config.poll_interval.0 * 3)
        .expect("poll interval out of range");
    let poller_liveness = liveness.register("poller".to_string(), poll_deadline).await;

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

    let poller = Poller::new(subscriptions, twitch, topic, cache);

    tracing::info!(interval = ?config.poll_interval.0, "stream-poller started");
    poller
        .run(config.poll_interval.0, poller_liveness, shutdown)
        .await;
    tracing::info!("stream-poller stopped");
}
