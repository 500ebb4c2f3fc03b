//! Webhook deduplication.
//!
//! Providers deliver at least once. Each canonical event key is claimed with
//! a check-and-set that expires after a bounded TTL; a second claim inside
//! the window is a duplicate.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Claim `key`. Returns `false` when it is already claimed and unexpired.
    async fn should_process(&self, key: &str) -> Result<bool, AppError>;

    /// Drop a claim so a provider retry is processed again.
    async fn release(&self, key: &str) -> Result<(), AppError>;
}

/// Single-instance dedup store.
#[derive(Clone)]
pub struct InMemoryDedupStore {
    claims: Arc<DashMap<String, Instant>>,
    ttl: Duration,
}

impl InMemoryDedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            claims: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Remove expired claims. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.claims.len();
        self.claims.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.claims.len())
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn should_process(&self, key: &str) -> Result<bool, AppError> {
        let now = Instant::now();
        let claimed = match self.claims.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    false
                } else {
                    entry.insert(now + self.ttl);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.ttl);
                true
            }
        };
        Ok(claimed)
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        self.claims.remove(key);
        Ok(())
    }
}

/// Dedup store shared across instances via `SET key 1 NX EX ttl`.
#[derive(Clone)]
pub struct RedisDedupStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisDedupStore {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    #[instrument(skip(self))]
    async fn should_process(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        let claimed = reply.is_some();
        debug!(claimed, "Dedup claim");
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
