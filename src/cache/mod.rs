//! Short-TTL caching.
//!
//! Redis when configured, with graceful degradation: every cached value is
//! mirrored in-process, so a Redis outage costs cross-process sharing but
//! never correctness.

pub mod price_cache;
pub mod redis_client;

pub use price_cache::PriceCache;
pub use redis_client::{RedisClient, RedisConfig};

use std::sync::Arc;
use std::time::Duration;

pub struct CacheManager {
    redis: Option<Arc<RedisClient>>,
    prices: PriceCache,
}

impl CacheManager {
    /// Connects to Redis when a URL is configured; otherwise runs in-process
    /// only. A failed connection degrades rather than aborting startup.
    pub async fn new(url: Option<&str>, price_ttl: Duration) -> Self {
        let redis = match url {
            Some(url) => match RedisClient::from_url(url).await {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    tracing::warn!("redis unavailable, using in-process cache only: {}", e);
                    None
                }
            },
            None => None,
        };
        let prices = PriceCache::new(redis.clone(), price_ttl);
        Self { redis, prices }
    }

    pub fn is_redis_available(&self) -> bool {
        self.redis.is_some()
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }
}
