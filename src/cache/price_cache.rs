//! Reference-price cache.
//!
//! External spot prices keyed by pair, stored with a short TTL. Values are
//! written to Redis when available and always mirrored in-process with the
//! same TTL, so the market maker keeps quoting through a Redis outage and
//! goes quiet (rather than quoting stale) once the TTL lapses.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::redis_client::RedisClient;

pub struct PriceCache {
    redis: Option<Arc<RedisClient>>,
    mirror: DashMap<String, (Decimal, Instant)>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(redis: Option<Arc<RedisClient>>, ttl: Duration) -> Self {
        Self {
            redis,
            mirror: DashMap::new(),
            ttl,
        }
    }

    fn key(pair: &str) -> String {
        format!("price:reference:{}", pair)
    }

    pub async fn set_reference_price(&self, pair: &str, price: Decimal) {
        self.mirror
            .insert(pair.to_string(), (price, Instant::now()));
        if let Some(redis) = &self.redis {
            if let Err(e) = redis
                .set_ex(&Self::key(pair), price.to_string(), self.ttl.as_secs())
                .await
            {
                tracing::warn!("failed to cache reference price for {}: {}", pair, e);
            }
        }
    }

    /// Latest reference price, or None once the TTL has lapsed.
    pub async fn reference_price(&self, pair: &str) -> Option<Decimal> {
        if let Some(entry) = self.mirror.get(pair) {
            let (price, stored_at) = *entry;
            if stored_at.elapsed() <= self.ttl {
                return Some(price);
            }
        }
        // Another process may have refreshed Redis more recently.
        if let Some(redis) = &self.redis {
            match redis.get(&Self::key(pair)).await {
                Ok(Some(value)) => return value.parse().ok(),
                Ok(None) => {}
                Err(e) => tracing::warn!("failed to read reference price for {}: {}", pair, e),
            }
        }
        None
    }
}
