//! Client for the subscription source's internal read API.

use http::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use watcher_common::models::Subscription;

const INTERNAL_API_KEY_HEADER: &str = "X-Internal-API-Key";

/// Enumeration of errors for subscription source fetches. Any of them
/// aborts the poll cycle that observed it.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("subscription source returned {0}")]
    Status(StatusCode),
    #[error("subscription source unreachable: {0}")]
    Unavailable(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct ActiveResponse {
    subscriptions: Vec<Subscription>,
    #[allow(dead_code)]
    total: i64,
}

/// Fetches the active-subscription set on behalf of the poll loop.
pub struct SubscriptionClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl SubscriptionClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to construct reqwest client for subscription source");

        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            client,
        }
    }

    /// Fetch all active subscriptions.
    pub async fn list_active(&self) -> Result<Vec<Subscription>, SubscriptionError> {
        let response = self
            .client
            .get(format!("{}/internal/subscriptions/active", self.base_url))
            .header(INTERNAL_API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(SubscriptionError::Status(response.status()));
        }

        let body: ActiveResponse = response.json().await?;

        Ok(body.subscriptions)
    }
}
