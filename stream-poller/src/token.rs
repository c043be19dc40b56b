//! App-access token cache with proactive refresh.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::twitch::TwitchApiError;

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Tokens this close to expiry are treated as stale and refreshed early.
const EXPIRY_SKEW_MINUTES: i64 = 5;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Default)]
struct TokenState {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn fresh_token(&self, now: DateTime<Utc>) -> Option<String> {
        if self.token.is_empty() {
            return None;
        }
        match self.expires_at {
            Some(expires_at) if expires_at - now > Duration::minutes(EXPIRY_SKEW_MINUTES) => {
                Some(self.token.clone())
            }
            _ => None,
        }
    }
}

/// Holds the app-access token under concurrent readers.
///
/// Readers that observe a stale token serialize on the write lock; only
/// the first of them performs the client-credentials exchange, the rest
/// see the fresh state and return it.
pub struct TokenManager {
    client_id: String,
    client_secret: String,
    token_url: String,
    client: reqwest::Client,
    state: RwLock<TokenState>,
}

impl TokenManager {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to construct reqwest client for token manager");

        Self {
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            token_url: TOKEN_URL.to_owned(),
            client,
            state: RwLock::new(TokenState::default()),
        }
    }

    /// Point the manager at a different token endpoint.
    pub fn with_token_url(mut self, token_url: &str) -> Self {
        self.token_url = token_url.to_owned();
        self
    }

    /// The current access token, refreshed first if it expires within the
    /// skew window.
    pub async fn token(&self) -> Result<String, TwitchApiError> {
        if let Some(token) = self.state.read().await.fresh_token(Utc::now()) {
            return Ok(token);
        }

        let mut state = self.state.write().await;
        // Another task may have refreshed while we waited on the lock.
        if let Some(token) = state.fresh_token(Utc::now()) {
            return Ok(token);
        }

        self.fetch_into(&mut state).await
    }

    /// Force a new token fetch, discarding the current one. Used after the
    /// API rejected a token that still looked fresh.
    pub async fn refresh(&self) -> Result<String, TwitchApiError> {
        let mut state = self.state.write().await;
        self.fetch_into(&mut state).await
    }

    async fn fetch_into(&self, state: &mut TokenState) -> Result<String, TwitchApiError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|error| TwitchApiError::AuthUnavailable(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TwitchApiError::AuthUnavailable(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|error| TwitchApiError::AuthUnavailable(error.to_string()))?;

        state.token = body.access_token.clone();
        state.expires_at = Some(Utc::now() + Duration::seconds(body.expires_in));

        Ok(body.access_token)
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, token: &str, expires_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.token = token.to_owned();
        state.expires_at = Some(expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn manager(server: &MockServer) -> TokenManager {
        TokenManager::new("client-id", "client-secret").with_token_url(&server.url("/oauth2/token"))
    }

    #[tokio::test]
    async fn test_fresh_token_skips_the_network() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200)
                .json_body(serde_json::json!({"access_token": "tok-new", "expires_in": 3600}));
        });

        let manager = manager(&server);
        manager.seed("tok-seeded", Utc::now() + Duration::hours(1)).await;

        let token = manager.token().await.expect("token fetch failed");

        assert_eq!(token, "tok-seeded");
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_token_within_skew_window_is_refreshed() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth2/token")
                .body_contains("grant_type=client_credentials");
            then.status(200)
                .json_body(serde_json::json!({"access_token": "tok-new", "expires_in": 3600}));
        });

        let manager = manager(&server);
        manager.seed("tok-stale", Utc::now() + Duration::minutes(4)).await;

        let token = manager.token().await.expect("token fetch failed");

        assert_eq!(token, "tok-new");
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_refresh_window_fetches_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200)
                .json_body(serde_json::json!({"access_token": "tok-new", "expires_in": 3600}));
        });

        let manager = manager(&server);

        // The first call fetches and records the expiry; the second sees a
        // fresh token and returns without touching the endpoint.
        let first = manager.token().await.expect("token fetch failed");
        let second = manager.token().await.expect("token fetch failed");

        assert_eq!(first, "tok-new");
        assert_eq!(second, "tok-new");
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_token_endpoint_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(500);
        });

        let manager = manager(&server);
        let result = manager.token().await;

        assert!(matches!(result, Err(TwitchApiError::AuthUnavailable(_))));
    }

    #[tokio::test]
    async fn test_malformed_token_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).body("not json");
        });

        let manager = manager(&server);
        let result = manager.token().await;

        assert!(matches!(result, Err(TwitchApiError::AuthUnavailable(_))));
    }
}
