//! Matching engine.
//!
//! One `PairEngine` per trading pair. A single mutex per pair covers the
//! book, the sequence counter and the order records; the whole submission
//! pipeline for one order runs under it, so two concurrent submissions to
//! the same pair linearize and price-time priority holds. The ledger takes
//! its own (user, asset) locks while the pair lock is held; pair locks are
//! never taken from inside the ledger, so the order is acyclic.
//!
//! Events are buffered during the critical section and published on the
//! broadcast channel only after the pair lock is released.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::orderbook::OrderBook;
use super::types::*;
use crate::metrics::names;
use crate::models::{Order, OrderSide, OrderStatus, OrderType, TimeInForce, TradingPair};
use crate::services::ledger::{Ledger, LedgerError, SettleTrade};
use crate::services::registry::Registry;

const EVENT_CHANNEL_CAPACITY: usize = 8192;

/// Per-pair spread/liquidity stats for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PairStats {
    pub pair: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub bid_amount: Decimal,
    pub bid_orders: usize,
    pub ask_amount: Decimal,
    pub ask_orders: usize,
    pub sequence: u64,
}

struct PairState {
    book: OrderBook,
    sequence: u64,
    /// Every order this engine has seen for the pair, terminal ones included
    /// (idempotent cancel needs the terminal state).
    orders: HashMap<Uuid, Order>,
    /// Set when an invariant broke inside the critical section; submissions
    /// then refuse with UNAVAILABLE until operator intervention.
    halted: Option<String>,
}

struct PairEngine {
    pair: TradingPair,
    state: Mutex<PairState>,
}

pub struct MatchingEngine {
    registry: Arc<Registry>,
    ledger: Arc<Ledger>,
    pairs: DashMap<String, Arc<PairEngine>>,
    /// Order id -> pair symbol, so cancel does not need the pair.
    order_pairs: DashMap<Uuid, String>,
    events_tx: broadcast::Sender<EngineEvent>,
    allow_self_match: bool,
}

impl MatchingEngine {
    pub fn new(registry: Arc<Registry>, ledger: Arc<Ledger>, allow_self_match: bool) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Self {
            registry,
            ledger,
            pairs: DashMap::new(),
            order_pairs: DashMap::new(),
            events_tx,
            allow_self_match,
        };
        for pair in engine.registry.pairs() {
            engine.pairs.insert(
                pair.symbol.clone(),
                Arc::new(PairEngine {
                    pair,
                    state: Mutex::new(PairState {
                        book: OrderBook::new(),
                        sequence: 0,
                        orders: HashMap::new(),
                        halted: None,
                    }),
                }),
            );
        }
        engine
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        for event in events {
            let _ = self.events_tx.send(event);
        }
    }

    fn pair_engine(&self, pair: &str) -> Result<Arc<PairEngine>, MatchingError> {
        self.pairs
            .get(pair)
            .map(|e| e.clone())
            .ok_or_else(|| MatchingError::UnknownPair(pair.to_string()))
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    pub fn submit(&self, submit: OrderSubmit) -> Result<MatchResult, MatchingError> {
        let pair = self.validate(&submit)?;
        let engine = self.pair_engine(&pair.symbol)?;
        let now = Utc::now();

        let mut state = engine.state.lock();
        if let Some(reason) = &state.halted {
            return Err(MatchingError::Unavailable(reason.clone()));
        }

        // FOK checks the whole prospective fill before anything moves.
        if submit.time_in_force == TimeInForce::Fok {
            let fillable = self.prospective_fill(&state, &submit);
            if fillable < submit.amount {
                return Err(MatchingError::NoLiquidity);
            }
        }

        // Reserve funds. Market buys lock the caller-provided quote budget.
        let (locked_asset, locked_amount) = match (submit.side, submit.order_type) {
            (OrderSide::Buy, OrderType::Limit) => {
                (pair.quote.clone(), submit.amount * submit.price.unwrap())
            }
            (OrderSide::Buy, OrderType::Market) => {
                (pair.quote.clone(), submit.quote_budget.unwrap())
            }
            (OrderSide::Sell, _) => (pair.base.clone(), submit.amount),
        };
        let order_id = Uuid::new_v4();
        self.ledger
            .lock(submit.user_id, &locked_asset, locked_amount, order_id)?;

        let mut order = Order {
            id: order_id,
            user_id: submit.user_id,
            pair: pair.symbol.clone(),
            side: submit.side,
            order_type: submit.order_type,
            price: submit.price,
            amount: submit.amount,
            filled: Decimal::ZERO,
            average_price: None,
            status: OrderStatus::Pending,
            time_in_force: submit.time_in_force,
            locked_amount,
            locked_asset: locked_asset.clone(),
            client_order_id: submit.client_order_id.clone(),
            created_at: now,
            filled_at: None,
            cancelled_at: None,
        };

        let mut events = Vec::new();
        let walk = self.match_walk(&mut state, &pair, &mut order, &mut events);

        let result = match walk {
            Ok(fills) => self.finish_submission(&mut state, &pair, order, fills, &mut events),
            Err(abort) => abort.into_result(self, &mut state, &pair, order, &mut events),
        };

        drop(state);
        self.publish(events);
        metrics::counter!(names::ORDERS_SUBMITTED_TOTAL, "pair" => pair.symbol.clone())
            .increment(1);
        result
    }

    fn validate(&self, submit: &OrderSubmit) -> Result<TradingPair, MatchingError> {
        let pair = self
            .registry
            .pair(&submit.pair)
            .ok_or_else(|| MatchingError::UnknownPair(submit.pair.clone()))?;
        if !pair.active {
            return Err(MatchingError::PairInactive(pair.symbol.clone()));
        }
        if !self.ledger.user_known(submit.user_id) {
            return Err(MatchingError::UnknownUser);
        }
        if !pair.is_lot_aligned(submit.amount) {
            return Err(MatchingError::InvalidOrder(format!(
                "amount {} is not a positive multiple of lot {}",
                submit.amount, pair.size_step
            )));
        }
        if submit.amount < pair.min_order_size || submit.amount > pair.max_order_size {
            return Err(MatchingError::InvalidOrder(format!(
                "amount {} outside [{}, {}]",
                submit.amount, pair.min_order_size, pair.max_order_size
            )));
        }
        match submit.order_type {
            OrderType::Limit => {
                let price = submit.price.ok_or(MatchingError::PriceRequired)?;
                if !pair.is_tick_aligned(price) {
                    return Err(MatchingError::InvalidOrder(format!(
                        "price {} is not a positive multiple of tick {}",
                        price, pair.price_step
                    )));
                }
            }
            OrderType::Market => {
                if submit.side == OrderSide::Buy {
                    match submit.quote_budget {
                        Some(budget) if budget > Decimal::ZERO => {}
                        _ => return Err(MatchingError::QuoteBudgetRequired),
                    }
                }
            }
        }
        Ok(pair)
    }

    /// Dry-run walk: how much of this order could fill right now.
    fn prospective_fill(&self, state: &PairState, submit: &OrderSubmit) -> Decimal {
        let mut fillable = Decimal::ZERO;
        let mut budget = submit.quote_budget.unwrap_or(Decimal::MAX);
        let pair = match self.registry.pair(&submit.pair) {
            Some(p) => p,
            None => return Decimal::ZERO,
        };
        for maker in state.book.iter_side(submit.side.opposite()) {
            if fillable >= submit.amount {
                break;
            }
            if !self.allow_self_match && maker.user_id == submit.user_id {
                continue;
            }
            if let Some(limit) = submit.price {
                let crossed = match submit.side {
                    OrderSide::Buy => maker.price <= limit,
                    OrderSide::Sell => maker.price >= limit,
                };
                if !crossed {
                    break;
                }
            }
            let mut take = (submit.amount - fillable).min(maker.remaining);
            if submit.order_type == OrderType::Market && submit.side == OrderSide::Buy {
                let cap = floor_to_step(budget / maker.price, pair.size_step);
                take = take.min(cap);
                if take <= Decimal::ZERO {
                    break;
                }
                budget -= take * maker.price;
            }
            fillable += take;
        }
        fillable
    }

    /// The price-time match walk. Returns the fills, or the abort context
    /// when a settlement failed mid-way.
    fn match_walk(
        &self,
        state: &mut PairState,
        pair: &TradingPair,
        order: &mut Order,
        events: &mut Vec<EngineEvent>,
    ) -> Result<Vec<FillRecord>, WalkAbort> {
        let mut fills = Vec::new();
        let mut spent_quote = Decimal::ZERO;
        let opposing = order.side.opposite();

        loop {
            if order.remaining() <= Decimal::ZERO {
                break;
            }
            let maker = if self.allow_self_match {
                state.book.peek_best(opposing)
            } else {
                state.book.peek_best_excluding(opposing, order.user_id)
            };
            let Some(maker) = maker else { break };

            // No crossing past the limit.
            if let Some(limit) = order.price {
                let crossed = match order.side {
                    OrderSide::Buy => maker.price <= limit,
                    OrderSide::Sell => maker.price >= limit,
                };
                if !crossed {
                    break;
                }
            }

            // Execution price is the maker's; improvement goes to the taker.
            let price = maker.price;
            let mut amount = order.remaining().min(maker.remaining);
            if order.order_type == OrderType::Market && order.side == OrderSide::Buy {
                let budget_left = order.locked_amount - spent_quote;
                let cap = floor_to_step(budget_left / price, pair.size_step);
                amount = amount.min(cap);
                if amount <= Decimal::ZERO {
                    break;
                }
            }

            let cost = amount * price;
            // Fees come out of the asset each side receives.
            let (taker_fee, maker_fee) = match order.side {
                OrderSide::Buy => (amount * pair.taker_fee, cost * pair.maker_fee),
                OrderSide::Sell => (cost * pair.taker_fee, amount * pair.maker_fee),
            };
            let taker_lock_refund = match (order.side, order.order_type, order.price) {
                (OrderSide::Buy, OrderType::Limit, Some(limit)) => (limit - price) * amount,
                _ => Decimal::ZERO,
            };

            let settle = SettleTrade {
                pair: pair.symbol.clone(),
                base: pair.base.clone(),
                quote: pair.quote.clone(),
                taker: order.user_id,
                maker: maker.user_id,
                taker_order: order.id,
                maker_order: maker.id,
                taker_side: order.side,
                base_amount: amount,
                price,
                taker_fee,
                maker_fee,
                taker_lock_refund,
            };
            if let Err(err) = self.ledger.settle_trade(&settle) {
                // Settled fills are committed trades; the walk stops here.
                tracing::error!(
                    pair = %pair.symbol,
                    taker = %order.id,
                    maker = %maker.id,
                    error = %err,
                    "settlement failed mid-walk, aborting taker"
                );
                return Err(WalkAbort { fills, err });
            }

            let now = Utc::now();
            spent_quote += cost;

            // Maker bookkeeping: amend in place or remove when exhausted.
            let maker_remaining = maker.remaining - amount;
            if maker_remaining <= Decimal::ZERO {
                if state.book.remove(&maker.id).is_none() {
                    state.halted = Some(format!("book index lost maker {}", maker.id));
                }
            } else if !state.book.amend_remaining(&maker.id, maker_remaining) {
                state.halted = Some(format!("book amend lost maker {}", maker.id));
            }
            let maker_transition =
                apply_fill(state.orders.get_mut(&maker.id), amount, price, now);

            let (taker_fee_asset, maker_fee_asset) = match order.side {
                OrderSide::Buy => (pair.base.clone(), pair.quote.clone()),
                OrderSide::Sell => (pair.quote.clone(), pair.base.clone()),
            };
            fills.push(FillRecord {
                id: Uuid::new_v4(),
                order_id: order.id,
                counter_order_id: maker.id,
                user_id: order.user_id,
                pair: pair.symbol.clone(),
                amount,
                price,
                fee: taker_fee,
                fee_asset: taker_fee_asset,
                is_maker: false,
                created_at: now,
            });
            fills.push(FillRecord {
                id: Uuid::new_v4(),
                order_id: maker.id,
                counter_order_id: order.id,
                user_id: maker.user_id,
                pair: pair.symbol.clone(),
                amount,
                price,
                fee: maker_fee,
                fee_asset: maker_fee_asset,
                is_maker: true,
                created_at: now,
            });

            // Taker accounting: filled, remaining, volume-weighted average.
            let prior_value = order.average_price.unwrap_or_default() * order.filled;
            order.filled += amount;
            order.average_price = Some((prior_value + cost) / order.filled);
            order.status = if order.remaining() <= Decimal::ZERO {
                order.filled_at = Some(now);
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };

            events.push(EngineEvent::FillRecorded(fills[fills.len() - 2].clone()));
            events.push(EngineEvent::FillRecorded(fills[fills.len() - 1].clone()));

            // One sequence tick per trade; the trade stream carries it.
            state.sequence += 1;
            events.push(EngineEvent::TradeExecuted(TradeExecuted {
                pair: pair.symbol.clone(),
                price,
                amount,
                taker_side: order.side,
                taker_order_id: order.id,
                maker_order_id: maker.id,
                sequence: state.sequence,
                timestamp: now.timestamp_millis(),
            }));
            if let Some(transition) = maker_transition {
                events.push(EngineEvent::OrderUpdated(with_seq(transition, state.sequence)));
            }
            metrics::counter!(names::TRADES_EXECUTED_TOTAL, "pair" => pair.symbol.clone())
                .increment(1);

            if state.halted.is_some() {
                return Err(WalkAbort {
                    fills,
                    err: LedgerError::Inconsistent(
                        state.halted.clone().unwrap_or_default(),
                    ),
                });
            }
        }

        Ok(fills)
    }

    /// The resting decision and the response, after a clean walk.
    fn finish_submission(
        &self,
        state: &mut PairState,
        pair: &TradingPair,
        mut order: Order,
        fills: Vec<FillRecord>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<MatchResult, MatchingError> {
        let remaining = order.remaining();
        let mut book_changed = !fills.is_empty();
        let mut inserted_seq: Option<u64> = None;

        if order.order_type == OrderType::Market {
            if fills.is_empty() {
                // Nothing matched: release the reservation and reject.
                self.ledger.unlock(
                    order.user_id,
                    &order.locked_asset,
                    order.locked_amount,
                    order.id,
                )?;
                self.forget_order(state, &order);
                return Err(MatchingError::NoLiquidity);
            }
            // Market orders never rest; release whatever the reservation did
            // not spend (a buy can exhaust its amount below budget).
            self.release_market_remainder(&order, &fills)?;
            if remaining > Decimal::ZERO {
                order.status = OrderStatus::Partial;
            }
        } else if remaining > Decimal::ZERO {
            match order.time_in_force {
                TimeInForce::Gtc => {
                    state.sequence += 1;
                    inserted_seq = Some(state.sequence);
                    state.book.insert(BookOrder {
                        id: order.id,
                        user_id: order.user_id,
                        side: order.side,
                        price: order.price.unwrap(),
                        amount: order.amount,
                        remaining,
                        seq: state.sequence,
                    });
                    book_changed = true;
                }
                // IOC cancels the remainder; an FOK remainder cannot happen
                // (the dry-run guards it) but gets the same treatment.
                TimeInForce::Ioc | TimeInForce::Fok => {
                    self.release_remainder(&order)?;
                    order.status = OrderStatus::Cancelled;
                    order.cancelled_at = Some(Utc::now());
                }
            }
        }

        if book_changed {
            // The insert already took its tick; a fills-only change takes one
            // here. Either way the event stream stays contiguous.
            let sequence = match inserted_seq {
                Some(seq) => seq,
                None => {
                    state.sequence += 1;
                    state.sequence
                }
            };
            events.push(EngineEvent::BookChanged {
                pair: pair.symbol.clone(),
                sequence,
            });
        }

        events.push(EngineEvent::OrderUpdated(transition_of(&order, state.sequence)));
        let result = MatchResult {
            order_id: order.id,
            status: order.status,
            filled: order.filled,
            remaining: order.remaining(),
            average_price: order.average_price,
            fills,
        };
        self.order_pairs.insert(order.id, pair.symbol.clone());
        state.orders.insert(order.id, order);
        Ok(result)
    }

    /// Unlock the pro-rata unfilled share of a limit reservation.
    fn release_remainder(&self, order: &Order) -> Result<(), LedgerError> {
        let release = order.locked_amount * order.remaining() / order.amount;
        if release > Decimal::ZERO {
            self.ledger
                .unlock(order.user_id, &order.locked_asset, release, order.id)?;
        }
        Ok(())
    }

    /// Unlock whatever a market order reserved but did not spend.
    fn release_market_remainder(
        &self,
        order: &Order,
        fills: &[FillRecord],
    ) -> Result<(), LedgerError> {
        let spent: Decimal = match order.side {
            // Quote budget was reserved; fills consumed amount × price.
            OrderSide::Buy => fills
                .iter()
                .filter(|f| !f.is_maker)
                .map(|f| f.amount * f.price)
                .sum(),
            // Base was reserved; fills consumed amount.
            OrderSide::Sell => fills.iter().filter(|f| !f.is_maker).map(|f| f.amount).sum(),
        };
        let release = order.locked_amount - spent;
        if release > Decimal::ZERO {
            self.ledger
                .unlock(order.user_id, &order.locked_asset, release, order.id)?;
        }
        Ok(())
    }

    fn forget_order(&self, state: &mut PairState, order: &Order) {
        state.orders.remove(&order.id);
        self.order_pairs.remove(&order.id);
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel a resting order. Owned by `user_id` or reported NOT_FOUND;
    /// existence is not leaked. Idempotent: cancelling a terminal order
    /// returns its terminal state without side effects.
    pub fn cancel(&self, user_id: Uuid, order_id: Uuid) -> Result<Order, MatchingError> {
        let pair_symbol = self
            .order_pairs
            .get(&order_id)
            .map(|p| p.clone())
            .ok_or(MatchingError::NotFound)?;
        let engine = self.pair_engine(&pair_symbol)?;

        let mut state = engine.state.lock();
        let Some(order) = state.orders.get(&order_id).cloned() else {
            return Err(MatchingError::NotFound);
        };
        if order.user_id != user_id {
            return Err(MatchingError::NotFound);
        }
        if order.status.is_terminal() {
            return Ok(order);
        }

        if state.book.remove(&order_id).is_none() {
            state.halted = Some(format!("cancel lost resting order {}", order_id));
            return Err(MatchingError::Unavailable(
                "book index inconsistent".to_string(),
            ));
        }
        self.release_remainder(&order)?;

        let mut events = Vec::new();
        state.sequence += 1;
        events.push(EngineEvent::BookChanged {
            pair: pair_symbol.clone(),
            sequence: state.sequence,
        });

        let stored = state.orders.get_mut(&order_id).unwrap();
        stored.status = OrderStatus::Cancelled;
        stored.cancelled_at = Some(Utc::now());
        let cancelled = stored.clone();
        events.push(EngineEvent::OrderUpdated(transition_of(&cancelled, state.sequence)));

        drop(state);
        self.publish(events);
        metrics::counter!(names::ORDERS_CANCELLED_TOTAL, "pair" => pair_symbol).increment(1);
        Ok(cancelled)
    }

    // ------------------------------------------------------------------
    // Queries and maintenance
    // ------------------------------------------------------------------

    pub fn snapshot(&self, pair: &str, depth: usize) -> Result<BookSnapshot, MatchingError> {
        let engine = self.pair_engine(pair)?;
        let state = engine.state.lock();
        let (bids, asks) = state.book.snapshot(depth);
        Ok(BookSnapshot {
            pair: pair.to_string(),
            bids,
            asks,
            sequence: state.sequence,
            last_updated: Utc::now().timestamp_millis(),
        })
    }

    pub fn pair_stats(&self, pair: &str) -> Result<PairStats, MatchingError> {
        let engine = self.pair_engine(pair)?;
        let state = engine.state.lock();
        let (bid_amount, bid_orders) = state.book.side_totals(OrderSide::Buy);
        let (ask_amount, ask_orders) = state.book.side_totals(OrderSide::Sell);
        Ok(PairStats {
            pair: pair.to_string(),
            best_bid: state.book.best_bid(),
            best_ask: state.book.best_ask(),
            spread: state.book.spread(),
            mid_price: state.book.mid_price(),
            bid_amount,
            bid_orders,
            ask_amount,
            ask_orders,
            sequence: state.sequence,
        })
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        let pair = self.order_pairs.get(&order_id)?.clone();
        let engine = self.pairs.get(&pair)?;
        let state = engine.state.lock();
        state.orders.get(&order_id).cloned()
    }

    /// Non-terminal orders of one user on one pair, oldest first.
    pub fn open_orders(&self, pair: &str, user_id: Uuid) -> Result<Vec<Order>, MatchingError> {
        let engine = self.pair_engine(pair)?;
        let state = engine.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// Admin: drop every resting order of a pair, releasing reservations.
    pub fn clear_pair(&self, pair: &str) -> Result<usize, MatchingError> {
        let engine = self.pair_engine(pair)?;
        let mut state = engine.state.lock();
        let removed = state.book.clear();
        let mut events = Vec::new();
        let now = Utc::now();
        for entry in &removed {
            if let Some(order) = state.orders.get(&entry.id).cloned() {
                self.release_remainder(&order)?;
                let stored = state.orders.get_mut(&entry.id).unwrap();
                stored.status = OrderStatus::Cancelled;
                stored.cancelled_at = Some(now);
            }
        }
        state.sequence += 1;
        events.push(EngineEvent::BookChanged {
            pair: pair.to_string(),
            sequence: state.sequence,
        });
        drop(state);
        self.publish(events);
        Ok(removed.len())
    }

    /// Startup recovery: re-index a resting order whose funds are already
    /// locked. No ledger calls, no events.
    pub fn restore_resting_order(&self, order: Order) -> Result<(), MatchingError> {
        let engine = self.pair_engine(&order.pair)?;
        let mut state = engine.state.lock();
        state.sequence += 1;
        let seq = state.sequence;
        state.book.insert(BookOrder {
            id: order.id,
            user_id: order.user_id,
            side: order.side,
            price: order.price.unwrap_or_default(),
            amount: order.amount,
            remaining: order.remaining(),
            seq,
        });
        self.order_pairs.insert(order.id, order.pair.clone());
        state.orders.insert(order.id, order);
        Ok(())
    }
}

/// Context for a walk aborted by a settlement failure.
struct WalkAbort {
    fills: Vec<FillRecord>,
    err: LedgerError,
}

impl WalkAbort {
    /// Settled fills stand; the taker terminates `rejected_partial` (or plain
    /// rejected when nothing settled) and the unfilled reservation is freed.
    fn into_result(
        self,
        engine: &MatchingEngine,
        state: &mut PairState,
        pair: &TradingPair,
        mut order: Order,
        events: &mut Vec<EngineEvent>,
    ) -> Result<MatchResult, MatchingError> {
        if let Err(unlock_err) = match order.order_type {
            OrderType::Limit => engine.release_remainder(&order),
            OrderType::Market => engine.release_market_remainder(&order, &self.fills),
        } {
            tracing::error!(order = %order.id, error = %unlock_err, "failed to release reservation after abort");
        }

        order.status = if self.fills.is_empty() {
            OrderStatus::Rejected
        } else {
            OrderStatus::RejectedPartial
        };
        if !self.fills.is_empty() {
            state.sequence += 1;
            events.push(EngineEvent::BookChanged {
                pair: pair.symbol.clone(),
                sequence: state.sequence,
            });
        }
        events.push(EngineEvent::OrderUpdated(transition_of(&order, state.sequence)));
        tracing::error!(
            order = %order.id,
            pair = %pair.symbol,
            error = %self.err,
            status = %order.status,
            "match walk aborted"
        );

        let result = MatchResult {
            order_id: order.id,
            status: order.status,
            filled: order.filled,
            remaining: order.remaining(),
            average_price: order.average_price,
            fills: self.fills,
        };
        engine.order_pairs.insert(order.id, pair.symbol.clone());
        state.orders.insert(order.id, order);
        Ok(result)
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

fn transition_of(order: &Order, sequence: u64) -> OrderTransition {
    OrderTransition {
        order_id: order.id,
        user_id: order.user_id,
        pair: order.pair.clone(),
        status: order.status,
        filled: order.filled,
        remaining: order.remaining(),
        average_price: order.average_price,
        sequence,
        timestamp: Utc::now().timestamp_millis(),
    }
}

fn with_seq(mut transition: OrderTransition, sequence: u64) -> OrderTransition {
    transition.sequence = sequence;
    transition
}

/// Update a maker's stored record after a fill; returns the transition.
fn apply_fill(
    order: Option<&mut Order>,
    amount: Decimal,
    price: Decimal,
    now: DateTime<Utc>,
) -> Option<OrderTransition> {
    let order = order?;
    let prior_value = order.average_price.unwrap_or_default() * order.filled;
    order.filled += amount;
    order.average_price = Some((prior_value + amount * price) / order.filled);
    order.status = if order.remaining() <= Decimal::ZERO {
        order.filled_at = Some(now);
        OrderStatus::Filled
    } else {
        OrderStatus::Partial
    };
    Some(transition_of(order, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Asset;
    use rust_decimal_macros::dec;

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

    fn setup() -> (Arc<Ledger>, MatchingEngine) {
        setup_with(true)
    }

    fn setup_with(allow_self_match: bool) -> (Arc<Ledger>, MatchingEngine) {
        let registry = Arc::new(Registry::new());
        registry.register_asset(asset("SOL"));
        registry.register_asset(asset("USDC"));
        registry.register_pair(sol_usdc()).unwrap();
        let ledger = Arc::new(Ledger::new());
        let engine = MatchingEngine::new(registry, ledger.clone(), allow_self_match);
        (ledger, engine)
    }

    fn fund(ledger: &Ledger, user: Uuid, asset: &str, amount: Decimal) {
        ledger.credit(user, asset, amount, "deposit").unwrap();
    }

    fn limit(user: Uuid, side: OrderSide, amount: Decimal, price: Decimal) -> OrderSubmit {
        OrderSubmit {
            user_id: user,
            pair: "SOL/USDC".to_string(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            quote_budget: None,
            time_in_force: TimeInForce::Gtc,
            client_order_id: None,
        }
    }

    fn market(user: Uuid, side: OrderSide, amount: Decimal, budget: Option<Decimal>) -> OrderSubmit {
        OrderSubmit {
            user_id: user,
            pair: "SOL/USDC".to_string(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            quote_budget: budget,
            time_in_force: TimeInForce::Gtc,
            client_order_id: None,
        }
    }

    #[test]
    fn test_s1_uncrossing_limit_rests() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(500));

        let result = engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        assert_eq!(result.status, OrderStatus::Pending);
        assert_eq!(result.filled, dec!(0));
        assert_eq!(result.remaining, dec!(1.0));

        let stats = engine.pair_stats("SOL/USDC").unwrap();
        assert_eq!(stats.best_bid, Some(dec!(100.00)));
        assert_eq!(stats.bid_amount, dec!(1.0));
        assert_eq!(stats.best_ask, None);

        let account = ledger.balance(alice, "USDC");
        assert_eq!(account.available, dec!(400));
        assert_eq!(account.locked, dec!(100));
    }

    #[test]
    fn test_s2_taker_fill_partial_maker() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(100));
        fund(&ledger, bob, "SOL", dec!(1));

        let mut events = engine.subscribe_events();
        let alice_result = engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();

        let bob_result = engine.submit(limit(bob, OrderSide::Sell, dec!(0.3), dec!(100.00))).unwrap();
        assert_eq!(bob_result.status, OrderStatus::Filled);
        assert_eq!(bob_result.filled, dec!(0.3));
        assert_eq!(bob_result.average_price, Some(dec!(100.00)));

        let alice_order = engine.order(alice_result.order_id).unwrap();
        assert_eq!(alice_order.status, OrderStatus::Partial);
        assert_eq!(alice_order.filled, dec!(0.3));
        assert_eq!(alice_order.remaining(), dec!(0.7));

        // Taker (Bob) pays 0.1% of the 30 USDC received, maker (Alice) 0.1%
        // of the 0.3 SOL received.
        assert_eq!(ledger.balance(bob, "USDC").available, dec!(29.97));
        assert_eq!(ledger.balance(alice, "SOL").available, dec!(0.2997));

        let stats = engine.pair_stats("SOL/USDC").unwrap();
        assert_eq!(stats.best_bid, Some(dec!(100.00)));
        assert_eq!(stats.bid_amount, dec!(0.7));
        assert_eq!(stats.ask_orders, 0);

        // Insert took one sequence tick, the trade the next.
        let mut insert_seq = None;
        let mut trade_seq = None;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::BookChanged { sequence, .. } if insert_seq.is_none() => {
                    insert_seq = Some(sequence)
                }
                EngineEvent::TradeExecuted(t) if trade_seq.is_none() => {
                    trade_seq = Some(t.sequence);
                    assert_eq!(t.price, dec!(100.00));
                    assert_eq!(t.amount, dec!(0.3));
                    assert_eq!(t.taker_side, OrderSide::Sell);
                }
                _ => {}
            }
        }
        assert_eq!(trade_seq.unwrap(), insert_seq.unwrap() + 1);
    }

    #[test]
    fn test_s3_market_buy_walks_levels() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let dan = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(300));
        fund(&ledger, carol, "SOL", dec!(2));
        fund(&ledger, dan, "SOL", dec!(1));

        engine.submit(limit(carol, OrderSide::Sell, dec!(2.0), dec!(101.00))).unwrap();
        engine.submit(limit(dan, OrderSide::Sell, dec!(1.0), dec!(101.50))).unwrap();

        let result = engine
            .submit(market(alice, OrderSide::Buy, dec!(2.5), Some(dec!(260.00))))
            .unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled, dec!(2.5));
        let taker_fills: Vec<_> = result.fills.iter().filter(|f| !f.is_maker).collect();
        assert_eq!(taker_fills.len(), 2);
        assert_eq!(taker_fills[0].price, dec!(101.00));
        assert_eq!(taker_fills[0].amount, dec!(2.0));
        assert_eq!(taker_fills[1].price, dec!(101.50));
        assert_eq!(taker_fills[1].amount, dec!(0.5));

        // 202 + 50.75 spent, 7.25 of the 260 budget released.
        let account = ledger.balance(alice, "USDC");
        assert_eq!(account.available, dec!(300) - dec!(252.75));
        assert_eq!(account.locked, dec!(0));
        // 2.5 SOL received minus the 0.1% taker fee in SOL.
        assert_eq!(ledger.balance(alice, "SOL").available, dec!(2.5) - dec!(0.0025));

        let carol_orders = engine.open_orders("SOL/USDC", carol).unwrap();
        assert!(carol_orders.is_empty());
        let dan_orders = engine.open_orders("SOL/USDC", dan).unwrap();
        assert_eq!(dan_orders.len(), 1);
        assert_eq!(dan_orders[0].remaining(), dec!(0.5));
    }

    #[test]
    fn test_s4_cancel_pro_rata_unlock() {
        let (ledger, engine) = setup();
        let eve = Uuid::new_v4();
        let seller = Uuid::new_v4();
        fund(&ledger, eve, "USDC", dec!(200));
        fund(&ledger, seller, "SOL", dec!(1));

        let eve_result = engine.submit(limit(eve, OrderSide::Buy, dec!(2.0), dec!(100.00))).unwrap();
        assert_eq!(ledger.balance(eve, "USDC").locked, dec!(200));

        engine.submit(limit(seller, OrderSide::Sell, dec!(0.4), dec!(100.00))).unwrap();

        let cancelled = engine.cancel(eve, eve_result.order_id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.filled, dec!(0.4));

        // 200 × (1.6 / 2.0) = 160 returned to available.
        let account = ledger.balance(eve, "USDC");
        assert_eq!(account.locked, dec!(0));
        assert_eq!(account.available, dec!(160));
    }

    #[test]
    fn test_s5_fok_all_or_nothing() {
        let (ledger, engine) = setup();
        let frank = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        fund(&ledger, frank, "SOL", dec!(10));
        fund(&ledger, buyer, "USDC", dec!(1000));

        engine.submit(limit(buyer, OrderSide::Buy, dec!(2.5), dec!(99.50))).unwrap();
        engine.submit(limit(buyer, OrderSide::Buy, dec!(1.5), dec!(99.00))).unwrap();

        let mut submit = limit(frank, OrderSide::Sell, dec!(5.0), dec!(99.00));
        submit.time_in_force = TimeInForce::Fok;
        let err = engine.submit(submit).unwrap_err();
        assert_eq!(err.code(), "NO_LIQUIDITY");

        // No book change, no funds moved.
        let stats = engine.pair_stats("SOL/USDC").unwrap();
        assert_eq!(stats.bid_amount, dec!(4.0));
        let account = ledger.balance(frank, "SOL");
        assert_eq!(account.available, dec!(10));
        assert_eq!(account.locked, dec!(0));
    }

    #[test]
    fn test_s6_idempotent_cancel() {
        let (ledger, engine) = setup();
        let gina = Uuid::new_v4();
        fund(&ledger, gina, "SOL", dec!(5));

        let result = engine.submit(limit(gina, OrderSide::Sell, dec!(1.0), dec!(105.00))).unwrap();

        let mut audit = ledger.subscribe_entries();
        let first = engine.cancel(gina, result.order_id).unwrap();
        assert_eq!(first.status, OrderStatus::Cancelled);
        // One unlock entry from the first cancel.
        assert!(audit.try_recv().is_ok());
        assert!(audit.try_recv().is_err());

        let second = engine.cancel(gina, result.order_id).unwrap();
        assert_eq!(second.status, OrderStatus::Cancelled);
        assert_eq!(second.cancelled_at, first.cancelled_at);
        // No additional ledger entries.
        assert!(audit.try_recv().is_err());
    }

    #[test]
    fn test_price_time_priority() {
        let (ledger, engine) = setup();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let taker = Uuid::new_v4();
        fund(&ledger, first, "SOL", dec!(1));
        fund(&ledger, second, "SOL", dec!(1));
        fund(&ledger, taker, "USDC", dec!(200));

        let first_result = engine.submit(limit(first, OrderSide::Sell, dec!(1.0), dec!(100.00))).unwrap();
        let second_result = engine.submit(limit(second, OrderSide::Sell, dec!(1.0), dec!(100.00))).unwrap();

        let taken = engine.submit(limit(taker, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        assert_eq!(taken.status, OrderStatus::Filled);
        // The earlier maker at the same price fills first.
        assert_eq!(engine.order(first_result.order_id).unwrap().status, OrderStatus::Filled);
        assert_eq!(engine.order(second_result.order_id).unwrap().status, OrderStatus::Pending);
    }

    #[test]
    fn test_better_price_first() {
        let (ledger, engine) = setup();
        let cheap = Uuid::new_v4();
        let pricey = Uuid::new_v4();
        let taker = Uuid::new_v4();
        fund(&ledger, cheap, "SOL", dec!(1));
        fund(&ledger, pricey, "SOL", dec!(1));
        fund(&ledger, taker, "USDC", dec!(200));

        engine.submit(limit(pricey, OrderSide::Sell, dec!(1.0), dec!(101.00))).unwrap();
        engine.submit(limit(cheap, OrderSide::Sell, dec!(1.0), dec!(100.00))).unwrap();

        let result = engine.submit(limit(taker, OrderSide::Buy, dec!(1.0), dec!(101.00))).unwrap();
        // Maker-price rule: executes at the best ask, not the limit.
        assert_eq!(result.average_price, Some(dec!(100.00)));
        // Price improvement refunded: only 100 spent of the 101 reserved.
        let account = ledger.balance(taker, "USDC");
        assert_eq!(account.available, dec!(100));
        assert_eq!(account.locked, dec!(0));
    }

    #[test]
    fn test_market_buy_requires_budget() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(100));
        let err = engine.submit(market(alice, OrderSide::Buy, dec!(1.0), None)).unwrap_err();
        assert_eq!(err.code(), "QUOTE_BUDGET_REQUIRED");
    }

    #[test]
    fn test_market_no_liquidity_releases_reservation() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(100));

        let err = engine
            .submit(market(alice, OrderSide::Buy, dec!(1.0), Some(dec!(100))))
            .unwrap_err();
        assert_eq!(err.code(), "NO_LIQUIDITY");
        let account = ledger.balance(alice, "USDC");
        assert_eq!(account.available, dec!(100));
        assert_eq!(account.locked, dec!(0));
    }

    #[test]
    fn test_validation_rejections() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(100));

        // Unknown pair
        let mut bad = limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00));
        bad.pair = "BTC/USDC".to_string();
        assert_eq!(engine.submit(bad).unwrap_err().code(), "UNKNOWN_PAIR");

        // Unknown user
        let ghost = limit(Uuid::new_v4(), OrderSide::Buy, dec!(1.0), dec!(100.00));
        assert_eq!(engine.submit(ghost).unwrap_err().code(), "UNKNOWN_USER");

        // Lot misaligned
        let err = engine.submit(limit(alice, OrderSide::Buy, dec!(0.15), dec!(100.00))).unwrap_err();
        assert_eq!(err.code(), "INVALID_ORDER");

        // Tick misaligned
        let err = engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.001))).unwrap_err();
        assert_eq!(err.code(), "INVALID_ORDER");

        // Above maximum size
        let err = engine.submit(limit(alice, OrderSide::Buy, dec!(20000), dec!(100.00))).unwrap_err();
        assert_eq!(err.code(), "INVALID_ORDER");

        // Missing price on limit
        let mut no_price = limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00));
        no_price.price = None;
        assert_eq!(engine.submit(no_price).unwrap_err().code(), "PRICE_REQUIRED");

        // Insufficient funds
        let err = engine.submit(limit(alice, OrderSide::Buy, dec!(10.0), dec!(100.00))).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_AVAILABLE");
    }

    #[test]
    fn test_ioc_cancels_remainder() {
        let (ledger, engine) = setup();
        let maker = Uuid::new_v4();
        let taker = Uuid::new_v4();
        fund(&ledger, maker, "SOL", dec!(1));
        fund(&ledger, taker, "USDC", dec!(500));

        engine.submit(limit(maker, OrderSide::Sell, dec!(1.0), dec!(100.00))).unwrap();

        let mut submit = limit(taker, OrderSide::Buy, dec!(3.0), dec!(100.00));
        submit.time_in_force = TimeInForce::Ioc;
        let result = engine.submit(submit).unwrap();
        assert_eq!(result.status, OrderStatus::Cancelled);
        assert_eq!(result.filled, dec!(1.0));

        // Remainder released, nothing rests.
        let stats = engine.pair_stats("SOL/USDC").unwrap();
        assert_eq!(stats.bid_orders, 0);
        assert_eq!(ledger.balance(taker, "USDC").locked, dec!(0));
    }

    #[test]
    fn test_self_match_permitted_by_default() {
        let (ledger, engine) = setup();
        let trader = Uuid::new_v4();
        fund(&ledger, trader, "SOL", dec!(10));
        fund(&ledger, trader, "USDC", dec!(1000));

        engine.submit(limit(trader, OrderSide::Sell, dec!(1.0), dec!(100.00))).unwrap();
        let result = engine.submit(limit(trader, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[test]
    fn test_self_match_skipped_when_disabled() {
        let (ledger, engine) = setup_with(false);
        let trader = Uuid::new_v4();
        let other = Uuid::new_v4();
        fund(&ledger, trader, "SOL", dec!(10));
        fund(&ledger, trader, "USDC", dec!(1000));
        fund(&ledger, other, "SOL", dec!(10));

        engine.submit(limit(trader, OrderSide::Sell, dec!(1.0), dec!(100.00))).unwrap();
        engine.submit(limit(other, OrderSide::Sell, dec!(1.0), dec!(100.50))).unwrap();

        // The trader's own ask is skipped; the other user's worse ask fills.
        let result = engine.submit(limit(trader, OrderSide::Buy, dec!(1.0), dec!(100.50))).unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.average_price, Some(dec!(100.50)));
        let own_asks = engine.open_orders("SOL/USDC", trader).unwrap();
        assert_eq!(own_asks.len(), 1);
    }

    #[test]
    fn test_sequence_contiguous_across_streams() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(1000));
        fund(&ledger, bob, "SOL", dec!(10));

        let mut events = engine.subscribe_events();
        engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        engine.submit(limit(bob, OrderSide::Sell, dec!(2.0), dec!(100.00))).unwrap();
        let cancel_target = engine.submit(limit(bob, OrderSide::Sell, dec!(1.0), dec!(101.00))).unwrap();
        engine.cancel(bob, cancel_target.order_id).unwrap();

        let mut seqs = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::BookChanged { sequence, .. } => seqs.push(sequence),
                EngineEvent::TradeExecuted(t) => seqs.push(t.sequence),
                EngineEvent::OrderUpdated(_) | EngineEvent::FillRecorded(_) => {}
            }
        }
        assert!(!seqs.is_empty());
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "sequence gap in {:?}", seqs);
        }
    }

    #[test]
    fn test_order_accounting_invariant() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(1000));
        fund(&ledger, bob, "SOL", dec!(10));

        engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        engine.submit(limit(alice, OrderSide::Buy, dec!(2.0), dec!(99.00))).unwrap();
        let result = engine.submit(limit(bob, OrderSide::Sell, dec!(2.5), dec!(99.00))).unwrap();

        let order = engine.order(result.order_id).unwrap();
        assert_eq!(order.filled + order.remaining(), order.amount);
        // VWAP: (1.0×100 + 1.5×99) / 2.5
        assert_eq!(order.average_price, Some(dec!(99.4)));

        // Conservation across the whole session.
        assert_eq!(ledger.asset_total("SOL"), dec!(10));
        assert_eq!(ledger.asset_total("USDC"), dec!(1000.00));
    }

    #[test]
    fn test_cancel_foreign_order_not_found() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        let mallory = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(100));
        fund(&ledger, mallory, "USDC", dec!(100));

        let result = engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        let err = engine.cancel(mallory, result.order_id).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_clear_pair_releases_everything() {
        let (ledger, engine) = setup();
        let alice = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(500));

        engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap();
        engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(99.00))).unwrap();

        let removed = engine.clear_pair("SOL/USDC").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(ledger.balance(alice, "USDC").available, dec!(500));
        assert_eq!(ledger.balance(alice, "USDC").locked, dec!(0));
    }

    #[test]
    fn test_inactive_pair_rejected() {
        let registry = Arc::new(Registry::new());
        registry.register_asset(asset("SOL"));
        registry.register_asset(asset("USDC"));
        registry.register_pair(sol_usdc()).unwrap();
        registry.set_pair_active("SOL/USDC", false);
        let ledger = Arc::new(Ledger::new());
        let engine = MatchingEngine::new(registry, ledger.clone(), true);
        let alice = Uuid::new_v4();
        fund(&ledger, alice, "USDC", dec!(100));

        let err = engine.submit(limit(alice, OrderSide::Buy, dec!(1.0), dec!(100.00))).unwrap_err();
        assert_eq!(err.code(), "PAIR_INACTIVE");
    }
}
