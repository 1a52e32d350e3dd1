//! Application configuration.
//!
//! Loaded from an optional `config.{toml,yaml,json}` file with a
//! `SPOTDX__`-prefixed environment overlay (e.g. `SPOTDX__SERVER__PORT=8080`,
//! `SPOTDX__PERSISTENCE__URL=postgres://...`). `.env` is read first via dotenvy.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{Asset, TradingPair};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub market_maker: MarketMakerConfig,
    #[serde(default)]
    pub external_feed: ExternalFeedConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: default_environment(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Postgres connection string.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Redis connection string. Absent means in-process cache only.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Default maker fee rate for pairs that omit their own.
    #[serde(default = "default_maker_fee")]
    pub fee_maker: Decimal,
    /// Default taker fee rate for pairs that omit their own.
    #[serde(default = "default_taker_fee")]
    pub fee_taker: Decimal,
    /// Same-user matches are permitted unless this is switched off.
    #[serde(default = "default_true")]
    pub allow_self_match: bool,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default)]
    pub min_deposit: Decimal,
    #[serde(default)]
    pub min_withdrawal: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub base: String,
    pub quote: String,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    pub price_step: Decimal,
    pub size_step: Decimal,
    /// Falls back to `trading.fee_maker` when absent.
    pub maker_fee: Option<Decimal>,
    pub taker_fee: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketMakerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Synthetic principal the quotes are submitted under.
    #[serde(default = "default_market_maker_id")]
    pub user_id: Uuid,
    /// Pre-funding applied at startup, per asset.
    #[serde(default)]
    pub seed_balances: Vec<SeedBalance>,
    #[serde(default)]
    pub pairs: Vec<MarketMakerPairConfig>,
}

impl Default for MarketMakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: default_market_maker_id(),
            seed_balances: Vec::new(),
            pairs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedBalance {
    pub asset: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketMakerPairConfig {
    pub pair: String,
    /// Full spread as a fraction, e.g. 0.002.
    pub spread: Decimal,
    pub order_size: Decimal,
    /// Per side.
    pub max_orders: usize,
    /// Cancel resting quotes deviating more than this fraction from reference.
    pub price_deviation: Decimal,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalFeedConfig {
    /// Base URL of the external spot price endpoint; the pair symbol is
    /// appended as a `symbol` query parameter.
    pub url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,
}

impl Default for ExternalFeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            poll_interval_ms: default_poll_interval_ms(),
            price_ttl_secs: default_price_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Bounded frames buffered per session before the session is dropped.
    #[serde(default = "default_session_queue")]
    pub max_per_session_queue: usize,
    /// Minimum interval between ticker pushes per pair.
    #[serde(default = "default_ticker_interval_ms")]
    pub ticker_interval_ms: u64,
    /// Book snapshot depth delivered on change.
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_per_session_queue: default_session_queue(),
            ticker_interval_ms: default_ticker_interval_ms(),
            book_depth: default_book_depth(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("SPOTDX").separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    /// Assets declared in config, as registry rows.
    pub fn assets(&self) -> Vec<Asset> {
        self.trading
            .assets
            .iter()
            .map(|a| Asset {
                symbol: a.symbol.clone(),
                chain: a.chain.clone(),
                decimals: a.decimals,
                min_deposit: a.min_deposit,
                min_withdrawal: a.min_withdrawal,
                active: true,
            })
            .collect()
    }

    /// Pairs declared in config, with fee defaults applied.
    pub fn trading_pairs(&self) -> Vec<TradingPair> {
        self.trading
            .pairs
            .iter()
            .map(|p| TradingPair {
                symbol: TradingPair::pair_symbol(&p.base, &p.quote),
                base: p.base.clone(),
                quote: p.quote.clone(),
                min_order_size: p.min_order_size,
                max_order_size: p.max_order_size,
                price_step: p.price_step,
                size_step: p.size_step,
                maker_fee: p.maker_fee.unwrap_or(self.trading.fee_maker),
                taker_fee: p.taker_fee.unwrap_or(self.trading.fee_taker),
                active: true,
            })
            .collect()
    }
}

fn default_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_maker_fee() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_taker_fee() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

fn default_chain() -> String {
    "native".to_string()
}

fn default_decimals() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_market_maker_id() -> Uuid {
    // Stable synthetic principal so restarts keep ownership of resting quotes.
    Uuid::from_u128(0x4d4d_0000_0000_0000_0000_0000_0000_0001)
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_price_ttl_secs() -> u64 {
    15
}

fn default_session_queue() -> usize {
    256
}

fn default_ticker_interval_ms() -> u64 {
    500
}

fn default_book_depth() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_fee_defaults() {
        let cfg = AppConfig {
            server: ServerConfig::default(),
            persistence: PersistenceConfig {
                url: "postgres://localhost/spotdx".to_string(),
                max_connections: 5,
            },
            cache: CacheConfig::default(),
            trading: TradingConfig {
                fee_maker: dec!(0.001),
                fee_taker: dec!(0.002),
                allow_self_match: true,
                assets: vec![],
                pairs: vec![PairConfig {
                    base: "SOL".to_string(),
                    quote: "USDC".to_string(),
                    min_order_size: dec!(0.1),
                    max_order_size: dec!(10000),
                    price_step: dec!(0.01),
                    size_step: dec!(0.1),
                    maker_fee: None,
                    taker_fee: Some(dec!(0.003)),
                }],
            },
            market_maker: MarketMakerConfig::default(),
            external_feed: ExternalFeedConfig::default(),
            bus: BusConfig::default(),
        };

        let pairs = cfg.trading_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].symbol, "SOL/USDC");
        assert_eq!(pairs[0].maker_fee, dec!(0.001));
        assert_eq!(pairs[0].taker_fee, dec!(0.003));
    }
}
