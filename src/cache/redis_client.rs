//! Redis connection management.
//!
//! Connection manager with lazy reconnection. Operations return errors
//! instead of panicking; callers degrade to their in-process mirrors.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

pub struct RedisClient {
    client: Client,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisClient {
    pub async fn new(config: RedisConfig) -> Result<Self, RedisError> {
        let client = Client::open(config.url.as_str())?;
        let redis_client = Self {
            client,
            connection: Arc::new(RwLock::new(None)),
        };
        redis_client.ensure_connected().await?;
        Ok(redis_client)
    }

    pub async fn from_url(url: &str) -> Result<Self, RedisError> {
        Self::new(RedisConfig {
            url: url.to_string(),
        })
        .await
    }

    async fn ensure_connected(&self) -> Result<ConnectionManager, RedisError> {
        {
            let conn = self.connection.read().await;
            if let Some(manager) = conn.as_ref() {
                return Ok(manager.clone());
            }
        }
        let mut conn = self.connection.write().await;
        if let Some(manager) = conn.as_ref() {
            return Ok(manager.clone());
        }
        tracing::info!("establishing redis connection");
        let manager = ConnectionManager::new(self.client.clone()).await?;
        *conn = Some(manager.clone());
        Ok(manager)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.ensure_connected().await?;
        conn.get(key).await
    }

    pub async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), RedisError> {
        let mut conn = self.ensure_connected().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await
    }

    pub async fn del(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.ensure_connected().await?;
        conn.del(key).await
    }
}
