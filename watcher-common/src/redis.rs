//! A thin async wrapper over the external cache.
//!
//! The pipeline only ever needs three primitives: a read, a write with
//! expiry, and an atomic set-if-absent with expiry. Everything else about
//! correctness (dedup atomicity in particular) rides on the store's own
//! guarantees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::timeout;

const CACHE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, k: String) -> Result<Option<String>>;

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<()>;

    /// Atomic set-if-absent with expiry. Returns true when the key was
    /// newly set, false when it already existed.
    async fn set_nx_ex(&self, k: String, v: String, ttl: Duration) -> Result<bool>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl CacheClient for RedisClient {
    async fn get(&self, k: String) -> Result<Option<String>> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get(k);
        let fut = timeout(CACHE_TIMEOUT, results).await?;

        Ok(fut?)
    }

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.set_ex(k, v, ttl.as_secs());
        let fut = timeout(CACHE_TIMEOUT, results).await?;

        Ok(fut?)
    }

    async fn set_nx_ex(&self, k: String, v: String, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.get_async_connection().await?;

        let cmd = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .clone();
        let results = cmd.query_async::<_, Option<String>>(&mut conn);
        let reply = timeout(CACHE_TIMEOUT, results).await??;

        Ok(reply.is_some())
    }
}

/// An in-memory stand-in for tests.
///
/// Behaves like the real store for the three primitives (expiry aside,
/// which no test depends on) and can be constructed failing to exercise
/// cache-outage paths.
#[derive(Clone, Default)]
pub struct MockCacheClient {
    store: Arc<Mutex<HashMap<String, String>>>,
    failing: bool,
}

impl MockCacheClient {
    pub fn new() -> MockCacheClient {
        MockCacheClient::default()
    }

    /// A client whose every operation fails, as if the store were down.
    pub fn failing() -> MockCacheClient {
        MockCacheClient {
            failing: true,
            ..MockCacheClient::default()
        }
    }

    pub fn contains(&self, k: &str) -> bool {
        self.store.lock().expect("poisoned mock store").contains_key(k)
    }
}

#[async_trait]
impl CacheClient for MockCacheClient {
    async fn get(&self, k: String) -> Result<Option<String>> {
        if self.failing {
            return Err(anyhow!("cache unavailable"));
        }
        Ok(self.store.lock().expect("poisoned mock store").get(&k).cloned())
    }

    async fn set_ex(&self, k: String, v: String, _ttl: Duration) -> Result<()> {
        if self.failing {
            return Err(anyhow!("cache unavailable"));
        }
        self.store.lock().expect("poisoned mock store").insert(k, v);
        Ok(())
    }

    async fn set_nx_ex(&self, k: String, v: String, _ttl: Duration) -> Result<bool> {
        if self.failing {
            return Err(anyhow!("cache unavailable"));
        }
        let mut store = self.store.lock().expect("poisoned mock store");
        if store.contains_key(&k) {
            return Ok(false);
        }
        store.insert(k, v);
        Ok(true)
    }
}
