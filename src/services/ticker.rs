//! Rolling 24h ticker stats, fed by the trade stream.
//!
//! Ticker pushes are coalesced: trades mark a pair dirty and a flush task
//! publishes the latest state on a minimum interval.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;

use crate::services::matching::PairStats;

const WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default)]
struct PairWindow {
    /// (timestamp ms, price, amount), oldest first.
    trades: VecDeque<(i64, Decimal, Decimal)>,
    last_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickerData {
    pub pair: String,
    pub last_price: Option<Decimal>,
    pub price_change_24h: Decimal,
    pub price_change_percent_24h: Decimal,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub timestamp: i64,
}

pub struct TickerService {
    windows: DashMap<String, Mutex<PairWindow>>,
    dirty: DashSet<String>,
}

impl TickerService {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            dirty: DashSet::new(),
        }
    }

    pub fn record_trade(&self, pair: &str, price: Decimal, amount: Decimal, timestamp_ms: i64) {
        let entry = self
            .windows
            .entry(pair.to_string())
            .or_insert_with(|| Mutex::new(PairWindow::default()));
        let mut window = entry.lock();
        window.trades.push_back((timestamp_ms, price, amount));
        window.last_price = Some(price);
        let cutoff = timestamp_ms - WINDOW_MS;
        while window.trades.front().is_some_and(|(ts, _, _)| *ts < cutoff) {
            window.trades.pop_front();
        }
        drop(window);
        self.dirty.insert(pair.to_string());
    }

    /// Pairs with unstreamed updates; clears the dirty set.
    pub fn take_dirty(&self) -> Vec<String> {
        let pairs: Vec<String> = self.dirty.iter().map(|p| p.clone()).collect();
        for pair in &pairs {
            self.dirty.remove(pair);
        }
        pairs
    }

    /// Merge the trade window with the book's current best prices.
    pub fn ticker(&self, pair: &str, stats: &PairStats) -> TickerData {
        let now = chrono::Utc::now().timestamp_millis();
        let (last_price, open, high, low, volume) = match self.windows.get(pair) {
            Some(entry) => {
                let window = entry.lock();
                let cutoff = now - WINDOW_MS;
                let mut open = None;
                let mut high: Option<Decimal> = None;
                let mut low: Option<Decimal> = None;
                let mut volume = Decimal::ZERO;
                for (ts, price, amount) in window.trades.iter() {
                    if *ts < cutoff {
                        continue;
                    }
                    if open.is_none() {
                        open = Some(*price);
                    }
                    high = Some(high.map_or(*price, |h| h.max(*price)));
                    low = Some(low.map_or(*price, |l| l.min(*price)));
                    volume += *amount;
                }
                (window.last_price, open, high, low, volume)
            }
            None => (None, None, None, None, Decimal::ZERO),
        };

        let (change, change_percent) = match (open, last_price) {
            (Some(open), Some(last)) if !open.is_zero() => {
                let change = last - open;
                (change, change / open * Decimal::ONE_HUNDRED)
            }
            _ => (Decimal::ZERO, Decimal::ZERO),
        };

        TickerData {
            pair: pair.to_string(),
            last_price,
            price_change_24h: change,
            price_change_percent_24h: change_percent,
            high_24h: high,
            low_24h: low,
            volume_24h: volume,
            best_bid: stats.best_bid,
            best_ask: stats.best_ask,
            spread: stats.spread,
            mid_price: stats.mid_price,
            timestamp: now,
        }
    }
}

impl Default for TickerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stats() -> PairStats {
        PairStats {
            pair: "SOL/USDC".to_string(),
            best_bid: Some(dec!(99.50)),
            best_ask: Some(dec!(100.50)),
            spread: Some(dec!(1.00)),
            mid_price: Some(dec!(100.00)),
            bid_amount: dec!(10),
            bid_orders: 3,
            ask_amount: dec!(8),
            ask_orders: 2,
            sequence: 42,
        }
    }

    #[test]
    fn test_ticker_aggregates() {
        let service = TickerService::new();
        let now = chrono::Utc::now().timestamp_millis();
        service.record_trade("SOL/USDC", dec!(100), dec!(1.0), now - 3000);
        service.record_trade("SOL/USDC", dec!(104), dec!(0.5), now - 2000);
        service.record_trade("SOL/USDC", dec!(102), dec!(2.0), now - 1000);

        let ticker = service.ticker("SOL/USDC", &stats());
        assert_eq!(ticker.last_price, Some(dec!(102)));
        assert_eq!(ticker.high_24h, Some(dec!(104)));
        assert_eq!(ticker.low_24h, Some(dec!(100)));
        assert_eq!(ticker.volume_24h, dec!(3.5));
        assert_eq!(ticker.price_change_24h, dec!(2));
        assert_eq!(ticker.price_change_percent_24h, dec!(2));
        assert_eq!(ticker.best_bid, Some(dec!(99.50)));
    }

    #[test]
    fn test_window_prunes_old_trades() {
        let service = TickerService::new();
        let now = chrono::Utc::now().timestamp_millis();
        service.record_trade("SOL/USDC", dec!(90), dec!(1.0), now - WINDOW_MS - 1000);
        service.record_trade("SOL/USDC", dec!(100), dec!(1.0), now);

        let ticker = service.ticker("SOL/USDC", &stats());
        assert_eq!(ticker.volume_24h, dec!(1.0));
        assert_eq!(ticker.low_24h, Some(dec!(100)));
    }

    #[test]
    fn test_dirty_tracking() {
        let service = TickerService::new();
        assert!(service.take_dirty().is_empty());
        let now = chrono::Utc::now().timestamp_millis();
        service.record_trade("SOL/USDC", dec!(100), dec!(1.0), now);
        assert_eq!(service.take_dirty(), vec!["SOL/USDC".to_string()]);
        assert!(service.take_dirty().is_empty());
    }

    #[test]
    fn test_empty_pair() {
        let service = TickerService::new();
        let ticker = service.ticker("SOL/USDC", &stats());
        assert_eq!(ticker.last_price, None);
        assert_eq!(ticker.volume_24h, dec!(0));
        assert_eq!(ticker.mid_price, Some(dec!(100.00)));
    }
}
