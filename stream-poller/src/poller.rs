//! The poll loop: one cycle per tick, one raw event per live broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use watcher_common::broker::Topic;
use watcher_common::envelope::Envelope;
use watcher_common::health::HealthHandle;
use watcher_common::models::{StreamEvent, Subscription, SubscriptionRef, TwitchStream, WatchKind};
use watcher_common::redis::CacheClient;

use crate::subscription::SubscriptionClient;
use crate::twitch::HelixClient;

const GAME_ID_CACHE_PREFIX: &str = "game:";
const GAME_ID_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const THUMBNAIL_WIDTH: u32 = 440;
const THUMBNAIL_HEIGHT: u32 = 248;

type RefMap = HashMap<String, Vec<SubscriptionRef>>;

/// The core poll loop.
pub struct Poller {
    subscriptions: SubscriptionClient,
    twitch: HelixClient,
    topic: Topic,
    cache: Arc<dyn CacheClient>,
}

impl Poller {
    pub fn new(
        subscriptions: SubscriptionClient,
        twitch: HelixClient,
        topic: Topic,
        cache: Arc<dyn CacheClient>,
    ) -> Self {
        Self {
            subscriptions,
            twitch,
            topic,
            cache,
        }
    }

    /// Run the polling loop until cancelled. The first cycle starts
    /// immediately; later cycles follow the tick.
    pub async fn run(
        &self,
        interval: Duration,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("poll loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            liveness.report_healthy().await;
            self.poll().await;
        }
    }

    /// One poll cycle. Failures of the subscription fetch, the game-id
    /// resolve, or the streams query abort the cycle; the next tick is the
    /// retry. Publish failures degrade per record.
    async fn poll(&self) {
        info!("poll cycle started");

        let subscriptions = match self.subscriptions.list_active().await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                error!("fetch subscriptions failed: {}", error);
                return;
            }
        };
        if subscriptions.is_empty() {
            info!("no active subscriptions");
            return;
        }

        let (game_map, streamer_map) = partition_subscriptions(subscriptions);

        let game_names: Vec<String> = game_map.keys().cloned().collect();
        let game_ids =
            match resolve_game_ids(self.cache.as_ref(), &self.twitch, game_names).await {
                Ok(game_ids) => game_ids,
                Err(error) => {
                    error!("resolve game ids failed: {:#}", error);
                    return;
                }
            };

        let ids: Vec<String> = game_ids.values().cloned().collect();
        let logins: Vec<String> = streamer_map.keys().cloned().collect();
        if ids.is_empty() && logins.is_empty() {
            info!("no resolvable watch targets this cycle");
            return;
        }

        let streams = match self.twitch.get_streams(&ids, &logins).await {
            Ok(streams) => streams,
            Err(error) => {
                error!("fetch streams failed: {}", error);
                return;
            }
        };

        let polled_at = Utc::now();
        let total = streams.len();
        let mut published = 0;

        for stream in streams {
            let refs = collect_refs(&stream, &game_map, &streamer_map);
            if refs.is_empty() {
                continue;
            }

            let event = StreamEvent {
                stream_id: stream.id.clone(),
                user_login: stream.user_login.clone(),
                user_name: stream.user_name,
                game_id: stream.game_id,
                game_name: stream.game_name,
                title: stream.title,
                viewer_count: stream.viewer_count,
                started_at: stream.started_at,
                thumbnail_url: format_thumbnail(
                    &stream.thumbnail_url,
                    THUMBNAIL_WIDTH,
                    THUMBNAIL_HEIGHT,
                ),
                stream_url: format!("https://twitch.tv/{}", stream.user_login),
                subscriptions: refs,
                polled_at,
            };

            match self.topic.publish(&Envelope::new(event)).await {
                Ok(()) => {
                    published += 1;
                    metrics::counter!("stream_events_published_total").increment(1);
                }
                Err(error) => {
                    error!(stream_id = %stream.id, "publish stream event failed: {}", error)
                }
            }
        }

        info!(streams = total, published, "poll cycle complete");
    }
}

/// Split the active set into per-target lookup maps, one keyed by game
/// name and one by user login.
fn partition_subscriptions(subscriptions: Vec<Subscription>) -> (RefMap, RefMap) {
    let mut game_map: RefMap = HashMap::new();
    let mut streamer_map: RefMap = HashMap::new();

    for subscription in subscriptions {
        let subscription_ref = SubscriptionRef {
            subscription_id: subscription.id,
            discord_webhook: subscription.discord_webhook,
        };
        let map = match subscription.watch_type {
            WatchKind::Game => &mut game_map,
            WatchKind::Streamer => &mut streamer_map,
        };
        map.entry(subscription.watch_target)
            .or_default()
            .push(subscription_ref);
    }

    (game_map, streamer_map)
}

/// Gather every ref matching a stream, game watchers first, deduplicated
/// by webhook URL in insertion order. A subscriber watching both the game
/// and the streamer gets one notification, not two.
fn collect_refs(
    stream: &TwitchStream,
    game_map: &RefMap,
    streamer_map: &RefMap,
) -> Vec<SubscriptionRef> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    let matches = game_map
        .get(&stream.game_name)
        .into_iter()
        .chain(streamer_map.get(&stream.user_login))
        .flatten();

    for subscription_ref in matches {
        if seen.insert(subscription_ref.discord_webhook.clone()) {
            refs.push(subscription_ref.clone());
        }
    }

    refs
}

/// Resolve game names to ids through the external cache, fetching only the
/// miss set from the platform and writing it back with a day's expiry.
async fn resolve_game_ids(
    cache: &dyn CacheClient,
    twitch: &HelixClient,
    names: Vec<String>,
) -> anyhow::Result<HashMap<String, String>> {
    let mut resolved = HashMap::with_capacity(names.len());
    let mut to_fetch = Vec::new();

    for name in names {
        let key = format!("{}{}", GAME_ID_CACHE_PREFIX, name);
        match cache.get(key).await.context("game-id cache read failed")? {
            Some(id) => {
                resolved.insert(name, id);
            }
            None => to_fetch.push(name),
        }
    }

    if to_fetch.is_empty() {
        return Ok(resolved);
    }

    let fetched = twitch.get_game_ids(&to_fetch).await?;

    for (name, id) in fetched {
        let key = format!("{}{}", GAME_ID_CACHE_PREFIX, name);
        if let Err(error) = cache.set_ex(key, id.clone(), GAME_ID_CACHE_TTL).await {
            // The id still resolves this cycle; the next cycle pays for
            // another fetch.
            warn!(game = %name, "game-id cache write failed: {:#}", error);
        }
        resolved.insert(name, id);
    }

    Ok(resolved)
}

/// Substitute the platform's thumbnail size placeholders, in both their
/// literal and URL-encoded spellings. An empty template stays empty.
fn format_thumbnail(template: &str, width: u32, height: u32) -> String {
    if template.is_empty() {
        return String::new();
    }

    template
        .replace("{width}", &width.to_string())
        .replace("%7Bwidth%7D", &width.to_string())
        .replace("{height}", &height.to_string())
        .replace("%7Bheight%7D", &height.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenManager;
    use chrono::Duration as ChronoDuration;
    use httpmock::prelude::*;
    use watcher_common::redis::MockCacheClient;

    fn subscription_ref(id: &str, webhook: &str) -> SubscriptionRef {
        SubscriptionRef {
            subscription_id: id.to_owned(),
            discord_webhook: webhook.to_owned(),
        }
    }

    fn subscription(id: &str, webhook: &str, kind: WatchKind, target: &str) -> Subscription {
        Subscription {
            id: id.to_owned(),
            discord_webhook: webhook.to_owned(),
            watch_type: kind,
            watch_target: target.to_owned(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn stream(game_name: &str, user_login: &str) -> TwitchStream {
        TwitchStream {
            id: "stream-1".to_owned(),
            user_id: "1000".to_owned(),
            user_login: user_login.to_owned(),
            user_name: user_login.to_owned(),
            game_id: "33214".to_owned(),
            game_name: game_name.to_owned(),
            kind: "live".to_owned(),
            title: "a stream".to_owned(),
            viewer_count: 42,
            started_at: Utc::now(),
            language: "en".to_owned(),
            thumbnail_url: String::new(),
        }
    }

    async fn helix_client(server: &MockServer) -> HelixClient {
        let tokens = TokenManager::new("client-id", "client-secret")
            .with_token_url(&server.url("/oauth2/token"));
        tokens
            .seed("tok", Utc::now() + ChronoDuration::hours(1))
            .await;

        HelixClient::new("client-id", Arc::new(tokens)).with_base_url(&server.base_url())
    }

    #[test]
    fn test_partition_splits_by_watch_kind() {
        let (game_map, streamer_map) = partition_subscriptions(vec![
            subscription("s1", "https://hook/1", WatchKind::Game, "Fortnite"),
            subscription("s2", "https://hook/2", WatchKind::Streamer, "streamer1"),
            subscription("s3", "https://hook/3", WatchKind::Game, "Fortnite"),
        ]);

        assert_eq!(game_map.len(), 1);
        assert_eq!(game_map["Fortnite"].len(), 2);
        assert_eq!(streamer_map.len(), 1);
        assert_eq!(streamer_map["streamer1"][0].subscription_id, "s2");
    }

    #[test]
    fn test_collect_refs_game_only() {
        let mut game_map = RefMap::new();
        game_map.insert(
            "Fortnite".to_owned(),
            vec![subscription_ref("s1", "https://hook/1")],
        );

        let refs = collect_refs(&stream("Fortnite", "streamer1"), &game_map, &RefMap::new());

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].subscription_id, "s1");
    }

    #[test]
    fn test_collect_refs_streamer_only() {
        let mut streamer_map = RefMap::new();
        streamer_map.insert(
            "streamer1".to_owned(),
            vec![subscription_ref("s2", "https://hook/2")],
        );

        let refs = collect_refs(
            &stream("Fortnite", "streamer1"),
            &RefMap::new(),
            &streamer_map,
        );

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].subscription_id, "s2");
    }

    #[test]
    fn test_collect_refs_same_webhook_deduplicated_first_wins() {
        let webhook = "https://discord.com/api/webhooks/1/a";
        let mut game_map = RefMap::new();
        game_map.insert(
            "Fortnite".to_owned(),
            vec![subscription_ref("s1", webhook)],
        );
        let mut streamer_map = RefMap::new();
        streamer_map.insert(
            "streamer1".to_owned(),
            vec![subscription_ref("s2", webhook)],
        );

        let refs = collect_refs(&stream("Fortnite", "streamer1"), &game_map, &streamer_map);

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].subscription_id, "s1");
    }

    #[test]
    fn test_collect_refs_distinct_webhooks_kept_in_order() {
        let mut game_map = RefMap::new();
        game_map.insert(
            "Fortnite".to_owned(),
            vec![subscription_ref("s1", "https://hook/1")],
        );
        let mut streamer_map = RefMap::new();
        streamer_map.insert(
            "streamer1".to_owned(),
            vec![subscription_ref("s2", "https://hook/2")],
        );

        let refs = collect_refs(&stream("Fortnite", "streamer1"), &game_map, &streamer_map);

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].subscription_id, "s1");
        assert_eq!(refs[1].subscription_id, "s2");
    }

    #[test]
    fn test_collect_refs_no_match_is_empty() {
        let refs = collect_refs(
            &stream("Fortnite", "streamer1"),
            &RefMap::new(),
            &RefMap::new(),
        );
        assert!(refs.is_empty());
    }

    #[test]
    fn test_format_thumbnail_expands_placeholders() {
        assert_eq!(
            format_thumbnail(
                "https://example.com/live_user_foo-{width}x{height}.jpg",
                440,
                248
            ),
            "https://example.com/live_user_foo-440x248.jpg"
        );
        assert_eq!(
            format_thumbnail(
                "https://example.com/live_user_foo-%7Bwidth%7Dx%7Bheight%7D.jpg",
                440,
                248
            ),
            "https://example.com/live_user_foo-440x248.jpg"
        );
    }

    #[test]
    fn test_format_thumbnail_empty_template() {
        assert_eq!(format_thumbnail("", 440, 248), "");
    }

    #[test]
    fn test_format_thumbnail_without_placeholders_is_unchanged() {
        assert_eq!(
            format_thumbnail("https://example.com/static.jpg", 440, 248),
            "https://example.com/static.jpg"
        );
    }

    #[tokio::test]
    async fn test_resolve_game_ids_cache_hit_skips_the_network() {
        let server = MockServer::start();
        let games = server.mock(|when, then| {
            when.method(GET).path("/games");
            then.status(200).json_body(serde_json::json!({"data": []}));
        });

        let cache = MockCacheClient::new();
        cache
            .set_ex(
                "game:Fortnite".to_owned(),
                "33214".to_owned(),
                GAME_ID_CACHE_TTL,
            )
            .await
            .unwrap();

        let twitch = helix_client(&server).await;
        let resolved = resolve_game_ids(&cache, &twitch, vec!["Fortnite".to_owned()])
            .await
            .unwrap();

        assert_eq!(resolved.get("Fortnite").map(String::as_str), Some("33214"));
        games.assert_hits(0);
    }

    #[tokio::test]
    async fn test_resolve_game_ids_fetches_misses_and_writes_back() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/games").query_param("name", "Fortnite");
            then.status(200).json_body(serde_json::json!({
                "data": [{"id": "33214", "name": "Fortnite"}]
            }));
        });

        let cache = MockCacheClient::new();
        let twitch = helix_client(&server).await;

        let resolved = resolve_game_ids(&cache, &twitch, vec!["Fortnite".to_owned()])
            .await
            .unwrap();

        assert_eq!(resolved.get("Fortnite").map(String::as_str), Some("33214"));
        assert!(cache.contains("game:Fortnite"));
    }

    #[tokio::test]
    async fn test_resolve_game_ids_drops_unknown_names() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/games");
            then.status(200).json_body(serde_json::json!({
                "data": [{"id": "33214", "name": "Fortnite"}]
            }));
        });

        let cache = MockCacheClient::new();
        let twitch = helix_client(&server).await;

        let resolved = resolve_game_ids(
            &cache,
            &twitch,
            vec!["Fortnite".to_owned(), "NotARealGame".to_owned()],
        )
        .await
        .unwrap();

        assert_eq!(resolved.len(), 1);
        assert!(!resolved.contains_key("NotARealGame"));
    }

    #[tokio::test]
    async fn test_resolve_game_ids_cache_read_failure_is_an_error() {
        let server = MockServer::start();
        let cache = MockCacheClient::failing();
        let twitch = helix_client(&server).await;

        let result = resolve_game_ids(&cache, &twitch, vec!["Fortnite".to_owned()]).await;

        assert!(result.is_err());
    }
}
