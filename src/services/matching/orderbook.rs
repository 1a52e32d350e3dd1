//! Price-time order book for one pair.
//!
//! Bids iterate by descending price, asks ascending; FIFO within a level.
//! Level aggregates are maintained incrementally and an id index gives O(1)
//! cancellation. The book holds no lock of its own: every call happens under
//! the owning pair lock, and validation is the engine's job.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

use super::types::{BookOrder, PriceKey, SnapshotLevel};
use crate::models::OrderSide;

#[derive(Debug, Default)]
struct Level {
    queue: VecDeque<BookOrder>,
    total: Decimal,
}

#[derive(Debug)]
pub struct OrderBook {
    bids: BTreeMap<PriceKey, Level>,
    asks: BTreeMap<PriceKey, Level>,
    index: HashMap<uuid::Uuid, (OrderSide, PriceKey)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn side(&self, side: OrderSide) -> &BTreeMap<PriceKey, Level> {
        match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        }
    }

    fn side_mut(&mut self, side: OrderSide) -> &mut BTreeMap<PriceKey, Level> {
        match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        }
    }

    /// Best price level of a side: highest bid, lowest ask.
    fn best_key(&self, side: OrderSide) -> Option<PriceKey> {
        match side {
            OrderSide::Buy => self.bids.keys().next_back().copied(),
            OrderSide::Sell => self.asks.keys().next().copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, order_id: &uuid::Uuid) -> bool {
        self.index.contains_key(order_id)
    }

    /// Append to the tail of the order's price level FIFO.
    pub fn insert(&mut self, order: BookOrder) {
        let key = PriceKey::from_decimal(order.price);
        let side = order.side;
        self.index.insert(order.id, (side, key));
        let level = self.side_mut(side).entry(key).or_default();
        level.total += order.remaining;
        level.queue.push_back(order);
    }

    /// Remove an order wherever it rests. Returns it for unwinding.
    pub fn remove(&mut self, order_id: &uuid::Uuid) -> Option<BookOrder> {
        let (side, key) = self.index.remove(order_id)?;
        let book_side = self.side_mut(side);
        let level = book_side.get_mut(&key)?;
        let pos = level.queue.iter().position(|o| o.id == *order_id)?;
        let order = level.queue.remove(pos)?;
        level.total -= order.remaining;
        if level.queue.is_empty() {
            book_side.remove(&key);
        }
        Some(order)
    }

    /// In-place remaining update as a maker gets partially filled. Time
    /// priority is unchanged. Returns false for unknown orders.
    pub fn amend_remaining(&mut self, order_id: &uuid::Uuid, new_remaining: Decimal) -> bool {
        debug_assert!(new_remaining > Decimal::ZERO);
        let Some((side, key)) = self.index.get(order_id).copied() else {
            return false;
        };
        let Some(level) = self.side_mut(side).get_mut(&key) else {
            return false;
        };
        let Some(order) = level.queue.iter_mut().find(|o| o.id == *order_id) else {
            return false;
        };
        level.total += new_remaining - order.remaining;
        order.remaining = new_remaining;
        true
    }

    /// Head of a side's ordered sequence, without mutation.
    pub fn peek_best(&self, side: OrderSide) -> Option<BookOrder> {
        let key = self.best_key(side)?;
        self.side(side)
            .get(&key)
            .and_then(|level| level.queue.front())
            .cloned()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.best_key(OrderSide::Buy).map(PriceKey::to_decimal)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.best_key(OrderSide::Sell).map(PriceKey::to_decimal)
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// All resting orders of one side in price-time order (best first).
    pub fn iter_side(&self, side: OrderSide) -> Box<dyn Iterator<Item = &BookOrder> + '_> {
        match side {
            OrderSide::Buy => Box::new(self.bids.values().rev().flat_map(|l| l.queue.iter())),
            OrderSide::Sell => Box::new(self.asks.values().flat_map(|l| l.queue.iter())),
        }
    }

    /// Head of a side in price-time order, skipping one user's orders.
    pub fn peek_best_excluding(&self, side: OrderSide, excluded: uuid::Uuid) -> Option<BookOrder> {
        self.iter_side(side)
            .find(|o| o.user_id != excluded)
            .cloned()
    }

    /// Resting orders of one user, for quote maintenance.
    pub fn orders_for_user(&self, user_id: uuid::Uuid) -> Vec<BookOrder> {
        let mut out: Vec<BookOrder> = self
            .bids
            .values()
            .chain(self.asks.values())
            .flat_map(|level| level.queue.iter())
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|o| o.seq);
        out
    }

    /// (total resting amount, order count) of one side.
    pub fn side_totals(&self, side: OrderSide) -> (Decimal, usize) {
        self.side(side)
            .values()
            .fold((Decimal::ZERO, 0), |(amount, count), level| {
                (amount + level.total, count + level.queue.len())
            })
    }

    /// Top `depth` aggregated levels per side, with cumulative totals.
    pub fn snapshot(&self, depth: usize) -> (Vec<SnapshotLevel>, Vec<SnapshotLevel>) {
        let mut cumulative = Decimal::ZERO;
        let bids = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(key, level)| {
                cumulative += level.total;
                SnapshotLevel {
                    price: key.to_decimal(),
                    amount: level.total,
                    orders: level.queue.len(),
                    cumulative,
                }
            })
            .collect();

        let mut cumulative = Decimal::ZERO;
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(key, level)| {
                cumulative += level.total;
                SnapshotLevel {
                    price: key.to_decimal(),
                    amount: level.total,
                    orders: level.queue.len(),
                    cumulative,
                }
            })
            .collect();

        (bids, asks)
    }

    /// Drop every resting order, returning them for unwinding. Admin only.
    pub fn clear(&mut self) -> Vec<BookOrder> {
        let orders: Vec<BookOrder> = self
            .bids
            .values()
            .chain(self.asks.values())
            .flat_map(|level| level.queue.iter())
            .cloned()
            .collect();
        self.bids.clear();
        self.asks.clear();
        self.index.clear();
        orders
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}
