//! Matching engine types.
//!
//! Shared types and DTOs for the order book and engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::{FillResponse, OrderSide, OrderStatus};

// ============================================================================
// Price Key
// ============================================================================

/// Price scaled to an integer at 8 decimal places for exact ordering in the
/// book's BTreeMap. All arithmetic stays in `Decimal`; this is only a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i64);

impl PriceKey {
    const SCALE: i64 = 100_000_000;

    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = (price * Decimal::from(Self::SCALE)).trunc();
        let value = scaled.mantissa() / 10i128.pow(scaled.scale());
        PriceKey(value as i64)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(Self::SCALE)
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Book entries
// ============================================================================

/// A resting order inside the book. `seq` is the pair-scoped insertion
/// sequence that breaks price ties (earlier first).
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub remaining: Decimal,
    pub seq: u64,
}

/// One aggregated price level of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotLevel {
    pub price: Decimal,
    pub amount: Decimal,
    pub orders: usize,
    /// Running total from best price through this level.
    pub cumulative: Decimal,
}

/// Depth-bounded view of one pair's book.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub pair: String,
    pub bids: Vec<SnapshotLevel>,
    pub asks: Vec<SnapshotLevel>,
    pub sequence: u64,
    pub last_updated: i64,
}

// ============================================================================
// Engine events
// ============================================================================

/// A fill from the taker's perspective, for the trade stream.
#[derive(Debug, Clone, Serialize)]
pub struct TradeExecuted {
    pub pair: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub taker_side: OrderSide,
    pub taker_order_id: Uuid,
    pub maker_order_id: Uuid,
    pub sequence: u64,
    pub timestamp: i64,
}

/// Status transition of one order, for the private stream.
#[derive(Debug, Clone, Serialize)]
pub struct OrderTransition {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub pair: String,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_price: Option<Decimal>,
    pub sequence: u64,
    pub timestamp: i64,
}

/// Everything the engine publishes. Book mutations and trades consume
/// sequence ticks; order transitions and fill rows ride along for the
/// private stream and the persistence worker.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    BookChanged { pair: String, sequence: u64 },
    TradeExecuted(TradeExecuted),
    OrderUpdated(OrderTransition),
    FillRecorded(FillRecord),
}

/// Fill rows produced while matching, one per side of each match.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub counter_order_id: Uuid,
    pub user_id: Uuid,
    pub pair: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub is_maker: bool,
    pub created_at: DateTime<Utc>,
}

impl FillRecord {
    pub fn to_response(&self) -> FillResponse {
        FillResponse {
            price: self.price,
            amount: self.amount,
            fee: self.fee,
            fee_asset: self.fee_asset.clone(),
            is_maker: self.is_maker,
        }
    }
}

// ============================================================================
// Engine input
// ============================================================================

/// A fully-identified submission crossing into the engine.
#[derive(Debug, Clone)]
pub struct OrderSubmit {
    pub user_id: Uuid,
    pub pair: String,
    pub side: OrderSide,
    pub order_type: crate::models::OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub quote_budget: Option<Decimal>,
    pub time_in_force: crate::models::TimeInForce,
    pub client_order_id: Option<String>,
}

// ============================================================================
// Results and errors
// ============================================================================

/// Outcome of a submission, returned to the caller synchronously.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub average_price: Option<Decimal>,
    pub fills: Vec<FillRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("unknown trading pair: {0}")]
    UnknownPair(String),
    #[error("trading pair inactive: {0}")]
    PairInactive(String),
    #[error("unknown user")]
    UnknownUser,
    #[error("{0}")]
    InvalidOrder(String),
    #[error("limit orders require a price")]
    PriceRequired,
    #[error("market buys require a quote budget")]
    QuoteBudgetRequired,
    #[error("insufficient funds: {0}")]
    InsufficientFunds(#[from] crate::services::ledger::LedgerError),
    #[error("no liquidity on the opposing side")]
    NoLiquidity,
    #[error("order not found")]
    NotFound,
    #[error("pair engine halted: {0}")]
    Unavailable(String),
}

impl MatchingError {
    pub fn code(&self) -> &'static str {
        match self {
            MatchingError::UnknownPair(_) => "UNKNOWN_PAIR",
            MatchingError::PairInactive(_) => "PAIR_INACTIVE",
            MatchingError::UnknownUser => "UNKNOWN_USER",
            MatchingError::InvalidOrder(_) => "INVALID_ORDER",
            MatchingError::PriceRequired => "PRICE_REQUIRED",
            MatchingError::QuoteBudgetRequired => "QUOTE_BUDGET_REQUIRED",
            MatchingError::InsufficientFunds(e) => e.code(),
            MatchingError::NoLiquidity => "NO_LIQUIDITY",
            MatchingError::NotFound => "NOT_FOUND",
            MatchingError::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_key_round_trip() {
        let price = dec!(97500.12345678);
        let key = PriceKey::from_decimal(price);
        assert_eq!(key.to_decimal(), price);
    }

    #[test]
    fn test_price_key_ordering() {
        let lo = PriceKey::from_decimal(dec!(100.00));
        let hi = PriceKey::from_decimal(dec!(100.01));
        assert!(lo < hi);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MatchingError::NoLiquidity.code(), "NO_LIQUIDITY");
        assert_eq!(
            MatchingError::Unavailable("halted".to_string()).code(),
            "UNAVAILABLE"
        );
        let funds: MatchingError = crate::services::ledger::LedgerError::InsufficientAvailable {
            asset: "USDC".to_string(),
            needed: dec!(1),
            available: dec!(0),
        }
        .into();
        assert_eq!(funds.code(), "INSUFFICIENT_AVAILABLE");
    }
}
