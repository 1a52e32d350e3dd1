//! External reference price poller.
//!
//! Fetches last prices for the configured pairs from an external spot
//! exchange on a fixed interval and stores them in the short-TTL price
//! cache. The market maker is the only consumer. Cooperative shutdown via
//! the process-wide watch channel.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::ExternalFeedConfig;

#[derive(Debug, Deserialize)]
struct SpotPrice {
    price: Decimal,
}

pub struct PriceFeedService {
    client: reqwest::Client,
    url: String,
    pairs: Vec<String>,
    cache: Arc<CacheManager>,
    poll_interval: Duration,
}

impl PriceFeedService {
    /// None when no feed URL is configured (the market maker then idles).
    pub fn new(
        config: &ExternalFeedConfig,
        pairs: Vec<String>,
        cache: Arc<CacheManager>,
    ) -> Option<Self> {
        let url = config.url.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(4))
            .build()
            .ok()?;
        Some(Self {
            client,
            url,
            pairs,
            cache,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            info!("reference price poller started ({} pairs)", self.pairs.len());
            let mut tick = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.poll_once().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reference price poller stopping");
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn poll_once(&self) {
        for pair in &self.pairs {
            // External venues key by concatenated symbol (SOLUSDC).
            let symbol = pair.replace('/', "");
            let url = format!("{}?symbol={}", self.url, symbol);
            match self.fetch(&url).await {
                Ok(price) => {
                    debug!("reference price {} = {}", pair, price);
                    self.cache.prices().set_reference_price(pair, price).await;
                }
                Err(e) => warn!("reference price fetch failed for {}: {}", pair, e),
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Decimal, reqwest::Error> {
        let spot: SpotPrice = self.client.get(url).send().await?.json().await?;
        Ok(spot.price)
    }
}
