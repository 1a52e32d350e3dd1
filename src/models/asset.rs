use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A listed asset. Immutable after registration except for `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub chain: String,
    pub decimals: u32,
    pub min_deposit: Decimal,
    pub min_withdrawal: Decimal,
    pub active: bool,
}

/// A trading pair `BASE/QUOTE` with its order constraints and fee rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPair {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    /// Minimum price increment (tick).
    pub price_step: Decimal,
    /// Minimum size increment (lot).
    pub size_step: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub active: bool,
}

impl TradingPair {
    pub fn pair_symbol(base: &str, quote: &str) -> String {
        format!("{}/{}", base, quote)
    }

    /// True when `price` is a positive multiple of the pair's tick.
    pub fn is_tick_aligned(&self, price: Decimal) -> bool {
        price > Decimal::ZERO && (price % self.price_step).is_zero()
    }

    /// True when `amount` is a positive multiple of the pair's lot.
    pub fn is_lot_aligned(&self, amount: Decimal) -> bool {
        amount > Decimal::ZERO && (amount % self.size_step).is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
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

    #[test]
    fn test_tick_alignment() {
        let p = pair();
        assert!(p.is_tick_aligned(dec!(100.00)));
        assert!(p.is_tick_aligned(dec!(99.99)));
        assert!(!p.is_tick_aligned(dec!(100.001)));
        assert!(!p.is_tick_aligned(dec!(0)));
        assert!(!p.is_tick_aligned(dec!(-1)));
    }

    #[test]
    fn test_lot_alignment() {
        let p = pair();
        assert!(p.is_lot_aligned(dec!(0.1)));
        assert!(p.is_lot_aligned(dec!(2.5)));
        assert!(!p.is_lot_aligned(dec!(0.15)));
    }

    #[test]
    fn test_pair_symbol() {
        assert_eq!(TradingPair::pair_symbol("SOL", "USDC"), "SOL/USDC");
    }
}
