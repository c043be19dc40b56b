//! Helix API client for batched live-stream and game lookups.

use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use watcher_common::models::TwitchStream;

use crate::token::TokenManager;

const HELIX_BASE: &str = "https://api.twitch.tv/helix";

/// The Helix page-size cap; every streams query asks for full pages.
const PAGE_SIZE: &str = "100";

/// Enumeration of errors for platform API calls.
#[derive(Error, Debug)]
pub enum TwitchApiError {
    #[error("token endpoint unavailable: {0}")]
    AuthUnavailable(String),
    #[error("helix returned status {0}")]
    UpstreamError(StatusCode),
    #[error("helix unreachable: {0}")]
    UpstreamUnavailable(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct GamesResponse {
    data: Vec<Game>,
}

#[derive(Deserialize)]
struct Game {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct StreamsResponse {
    data: Vec<TwitchStream>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Deserialize, Default)]
struct Pagination {
    cursor: Option<String>,
}

/// A Helix API client carrying app-access auth on every request.
pub struct HelixClient {
    client_id: String,
    base_url: String,
    tokens: Arc<TokenManager>,
    client: reqwest::Client,
}

impl HelixClient {
    pub fn new(client_id: &str, tokens: Arc<TokenManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("failed to construct reqwest client for helix");

        Self {
            client_id: client_id.to_owned(),
            base_url: HELIX_BASE.to_owned(),
            tokens,
            client,
        }
    }

    /// Point the client at a different API host.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_owned();
        self
    }

    /// Resolve game names to game ids. Only names the platform recognizes
    /// appear in the result; an empty input performs no network call.
    pub async fn get_game_ids(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, TwitchApiError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let query: Vec<(&str, &str)> = names.iter().map(|name| ("name", name.as_str())).collect();
        let response: GamesResponse = self.get("/games", &query).await?;

        Ok(response
            .data
            .into_iter()
            .map(|game| (game.name, game.id))
            .collect())
    }

    /// Fetch every live stream matching the given game ids and/or user
    /// logins, following the pagination cursor until exhausted.
    pub async fn get_streams(
        &self,
        game_ids: &[String],
        user_logins: &[String],
    ) -> Result<Vec<TwitchStream>, TwitchApiError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> = vec![("first", PAGE_SIZE)];
            for id in game_ids {
                query.push(("game_id", id.as_str()));
            }
            for login in user_logins {
                query.push(("user_login", login.as_str()));
            }
            if let Some(after) = &cursor {
                query.push(("after", after.as_str()));
            }

            let page: StreamsResponse = self.get("/streams", &query).await?;
            let empty_page = page.data.is_empty();
            all.extend(page.data);

            cursor = match page.pagination.cursor {
                Some(next) if !next.is_empty() && !empty_page => Some(next),
                _ => break,
            };
        }

        Ok(all)
    }

    /// Perform an authenticated GET, refreshing the token and retrying
    /// exactly once if the platform rejects it.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TwitchApiError> {
        let token = self.tokens.token().await?;
        let mut response = self.send(path, query, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let token = self.tokens.refresh().await?;
            response = self.send(path, query, &token).await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(TwitchApiError::AuthUnavailable(
                    "helix rejected a freshly refreshed token".to_owned(),
                ));
            }
        }

        if !response.status().is_success() {
            return Err(TwitchApiError::UpstreamError(response.status()));
        }

        Ok(response.json().await?)
    }

    async fn send(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: &str,
    ) -> Result<reqwest::Response, TwitchApiError> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header("Client-ID", &self.client_id)
            .bearer_auth(token)
            .send()
            .await?)
    }
}
