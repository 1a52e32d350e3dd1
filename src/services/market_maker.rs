//! Reference-price market maker.
//!
//! One task per enabled pair on a randomized 3–8s cadence: read the external
//! reference price, cancel resting quotes that drifted past the deviation
//! threshold, then place one jittered limit order on the deficient (or a
//! random) side. Quotes are submitted through the matching engine exactly
//! like any client's order, under the synthetic market-maker principal.

use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::{MarketMakerConfig, MarketMakerPairConfig};
use crate::models::{OrderSide, OrderType, TimeInForce, TradingPair};
use crate::services::ledger::Ledger;
use crate::services::matching::{MatchingEngine, MatchingError, OrderSubmit};
use crate::services::registry::Registry;

pub struct MarketMakerService {
    config: MarketMakerConfig,
    engine: Arc<MatchingEngine>,
    ledger: Arc<Ledger>,
    registry: Arc<Registry>,
    cache: Arc<CacheManager>,
}

impl MarketMakerService {
    pub fn new(
        config: MarketMakerConfig,
        engine: Arc<MatchingEngine>,
        ledger: Arc<Ledger>,
        registry: Arc<Registry>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            config,
            engine,
            ledger,
            registry,
            cache,
        }
    }

    /// Pre-fund the synthetic principal from config.
    pub fn seed_funding(&self) {
        for seed in &self.config.seed_balances {
            match self.ledger.credit(
                self.config.user_id,
                &seed.asset,
                seed.amount,
                "market maker funding",
            ) {
                Ok(_) => info!("market maker funded with {} {}", seed.amount, seed.asset),
                Err(e) => warn!("market maker funding failed for {}: {}", seed.asset, e),
            }
        }
    }

    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("market maker disabled");
            return;
        }
        for pair_config in self.config.pairs.clone() {
            if !pair_config.enabled {
                continue;
            }
            if self.registry.pair(&pair_config.pair).is_none() {
                warn!("market maker pair {} not registered, skipping", pair_config.pair);
                continue;
            }
            tokio::spawn(Self::run_pair(self.clone(), pair_config, shutdown.clone()));
        }
    }

    async fn run_pair(
        service: Arc<Self>,
        config: MarketMakerPairConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "market maker started for {} (spread {}, size {}, max {} per side)",
            config.pair, config.spread, config.order_size, config.max_orders
        );
        loop {
            let delay = rand::thread_rng().gen_range(3_000..=8_000);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    if let Err(e) = service.tick(&config).await {
                        warn!("market maker tick failed for {}: {}", config.pair, e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("market maker stopped for {}", config.pair);
    }

    async fn tick(&self, config: &MarketMakerPairConfig) -> Result<(), MatchingError> {
        let Some(reference) = self.cache.prices().reference_price(&config.pair).await else {
            debug!("no reference price for {}, skipping quote cycle", config.pair);
            return Ok(());
        };
        let pair = self
            .registry
            .pair(&config.pair)
            .ok_or_else(|| MatchingError::UnknownPair(config.pair.clone()))?;

        // Cancel quotes that drifted past the deviation threshold.
        let mut bids = 0usize;
        let mut asks = 0usize;
        for order in self.engine.open_orders(&config.pair, self.config.user_id)? {
            let Some(price) = order.price else { continue };
            let drift = (price - reference).abs() / reference;
            if drift > config.price_deviation {
                debug!(
                    "cancelling stale quote {} ({} vs reference {})",
                    order.id, price, reference
                );
                if let Err(e) = self.engine.cancel(self.config.user_id, order.id) {
                    warn!("stale quote cancel failed: {}", e);
                }
                continue;
            }
            match order.side {
                OrderSide::Buy => bids += 1,
                OrderSide::Sell => asks += 1,
            }
        }

        let Some(submit) = self.plan_quote(config, &pair, reference, bids, asks) else {
            return Ok(());
        };

        match self.engine.submit(submit.clone()) {
            Ok(result) => {
                debug!(
                    "quote placed on {}: {} {} @ {:?} -> {}",
                    config.pair, submit.side, submit.amount, submit.price, result.status
                );
                Ok(())
            }
            Err(MatchingError::InsufficientFunds(funds)) => {
                // One-shot self-top-up, one retry.
                warn!("market maker short of funds ({}), topping up", funds);
                self.top_up(&pair, submit.side);
                match self.engine.submit(submit) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("quote retry failed for {}: {}", config.pair, e);
                        Ok(())
                    }
                }
            }
            Err(e) => {
                // Rejections are logged; the loop continues.
                warn!("quote rejected on {}: {}", config.pair, e);
                Ok(())
            }
        }
    }

    /// Pick a side and price/size with jitter. Pure and synchronous so the
    /// thread-local RNG never lives across an await.
    fn plan_quote(
        &self,
        config: &MarketMakerPairConfig,
        pair: &TradingPair,
        reference: Decimal,
        bids: usize,
        asks: usize,
    ) -> Option<OrderSubmit> {
        let mut rng = rand::thread_rng();

        let side = if bids < config.max_orders && asks < config.max_orders {
            if rng.gen_bool(0.5) {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            }
        } else if bids < config.max_orders {
            OrderSide::Buy
        } else if asks < config.max_orders {
            OrderSide::Sell
        } else {
            return None;
        };

        let half_spread = config.spread / Decimal::TWO;
        let level = match side {
            OrderSide::Buy => bids,
            OrderSide::Sell => asks,
        };
        // Each deeper level steps 0.1% further from the target price.
        let level_offset = Decimal::from(level as u64) * Decimal::new(1, 3) * reference;
        let raw_price = match side {
            OrderSide::Buy => reference * (Decimal::ONE - half_spread) - level_offset,
            OrderSide::Sell => reference * (Decimal::ONE + half_spread) + level_offset,
        };
        let price = match side {
            OrderSide::Buy => floor_to_step(raw_price, pair.price_step),
            OrderSide::Sell => ceil_to_step(raw_price, pair.price_step),
        };
        if price <= Decimal::ZERO {
            return None;
        }

        // Size jittered ±10%.
        let jitter = Decimal::from(rng.gen_range(90u32..=110)) / Decimal::ONE_HUNDRED;
        let size = floor_to_step(config.order_size * jitter, pair.size_step)
            .max(pair.min_order_size);

        Some(OrderSubmit {
            user_id: self.config.user_id,
            pair: pair.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            amount: size,
            price: Some(price),
            quote_budget: None,
            time_in_force: TimeInForce::Gtc,
            client_order_id: None,
        })
    }

    fn top_up(&self, pair: &TradingPair, side: OrderSide) {
        let asset = match side {
            OrderSide::Buy => &pair.quote,
            OrderSide::Sell => &pair.base,
        };
        let Some(seed) = self
            .config
            .seed_balances
            .iter()
            .find(|s| &s.asset == asset)
        else {
            warn!("no seed balance configured for {}", asset);
            return;
        };
        if let Err(e) = self.ledger.credit(
            self.config.user_id,
            &seed.asset,
            seed.amount,
            "market maker top-up",
        ) {
            warn!("market maker top-up failed: {}", e);
        }
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).ceil() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeedBalance;
    use crate::models::Asset;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn asset(symbol: &str) -> Asset {
        Asset {
            symbol: symbol.to_string(),
            chain: "native".to_string(),
            decimals: 8,
            min_deposit: dec!(0),
            min_withdrawal: dec!(0),
            active: true,
        }
    }

    fn sol_usdc() -> TradingPair {
        TradingPair {
            symbol: "SOL/USDC".to_string(),
            base: "SOL".to_string(),
            quote: "USDC".to_string(),
            min_order_size: dec!(0.1),
            max_order_size: dec!(10000),
            price_step: dec!(0.01),
            size_step: dec!(0.1),
            maker_fee: dec!(0.001),
            taker_fee: dec!(0.001),
            active: true,
        }
    }

    fn service(max_orders: usize) -> (MarketMakerService, MarketMakerPairConfig) {
        let registry = Arc::new(Registry::new());
        registry.register_asset(asset("SOL"));
        registry.register_asset(asset("USDC"));
        registry.register_pair(sol_usdc()).unwrap();
        let ledger = Arc::new(Ledger::new());
        let engine = Arc::new(MatchingEngine::new(registry.clone(), ledger.clone(), true));
        let config = MarketMakerConfig {
            enabled: true,
            user_id: Uuid::new_v4(),
            seed_balances: vec![
                SeedBalance {
                    asset: "SOL".to_string(),
                    amount: dec!(100),
                },
                SeedBalance {
                    asset: "USDC".to_string(),
                    amount: dec!(10000),
                },
            ],
            pairs: vec![],
        };
        let pair_config = MarketMakerPairConfig {
            pair: "SOL/USDC".to_string(),
            spread: dec!(0.002),
            order_size: dec!(1.0),
            max_orders: max_orders,
            price_deviation: dec!(0.01),
            enabled: true,
        };
        let cache = Arc::new(futures::executor::block_on(CacheManager::new(
            None,
            Duration::from_secs(15),
        )));
        (
            MarketMakerService::new(config, engine, ledger, registry, cache),
            pair_config,
        )
    }

    #[test]
    fn test_plan_quote_inside_deviation() {
        let (service, config) = service(5);
        let pair = sol_usdc();
        let reference = dec!(100);

        let plan = service.plan_quote(&config, &pair, reference, 0, 0).unwrap();
        let price = plan.price.unwrap();
        // First level sits half a spread off the reference, tick-aligned.
        match plan.side {
            OrderSide::Buy => assert_eq!(price, dec!(99.90)),
            OrderSide::Sell => assert_eq!(price, dec!(100.10)),
        }
        assert!(pair.is_tick_aligned(price));
        assert!(pair.is_lot_aligned(plan.amount));
        // ±10% of the configured size.
        assert!(plan.amount >= dec!(0.9) && plan.amount <= dec!(1.1));
    }

    #[test]
    fn test_plan_quote_prefers_deficient_side() {
        let (service, config) = service(3);
        let pair = sol_usdc();
        let plan = service.plan_quote(&config, &pair, dec!(100), 3, 1).unwrap();
        assert_eq!(plan.side, OrderSide::Sell);
        let plan = service.plan_quote(&config, &pair, dec!(100), 0, 3).unwrap();
        assert_eq!(plan.side, OrderSide::Buy);
    }

    #[test]
    fn test_plan_quote_skips_when_full() {
        let (service, config) = service(2);
        let pair = sol_usdc();
        assert!(service.plan_quote(&config, &pair, dec!(100), 2, 2).is_none());
    }

    #[test]
    fn test_deeper_levels_step_away() {
        let (service, config) = service(10);
        let pair = sol_usdc();
        let plan = service.plan_quote(&config, &pair, dec!(100), 10, 4).unwrap();
        assert_eq!(plan.side, OrderSide::Sell);
        // Level 4: target ask 100.10 plus 4 × 0.1% of reference.
        assert_eq!(plan.price.unwrap(), dec!(100.50));
    }

    #[tokio::test]
    async fn test_seed_funding_and_quote_cycle() {
        let (service, config) = service(5);
        service.seed_funding();
        service
            .cache
            .prices()
            .set_reference_price("SOL/USDC", dec!(100))
            .await;

        // A few cycles place resting quotes within bounds on both sides.
        for _ in 0..10 {
            service.tick(&config).await.unwrap();
        }
        let open = service
            .engine
            .open_orders("SOL/USDC", service.config.user_id)
            .unwrap();
        assert!(!open.is_empty());
        for order in &open {
            let price = order.price.unwrap();
            let drift = (price - dec!(100)).abs() / dec!(100);
            assert!(drift <= config.price_deviation);
        }
    }
}
