//! Balance ledger.
//!
//! Authoritative in-memory balances with an append-only audit stream. Every
//! mutation happens under the owning (user, asset) lock and emits one
//! `LedgerEntry` per change of `available`, so `balance_after =
//! balance_before + amount` holds for every entry. The persistence worker
//! consumes the audit stream and snapshots balances to Postgres.
//!
//! Lock order: callers may hold a pair lock while calling in; the ledger only
//! ever takes its own account locks, in sorted (user, asset) order when an
//! operation touches more than one account.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{BalanceResponse, EntryKind, LedgerEntry, OrderSide};

/// Synthetic principal that collects trading fees. Modeling fee revenue as a
/// user keeps per-asset conservation exact.
pub const FEE_TREASURY: Uuid = Uuid::from_u128(0xfee0_0000_0000_0000_0000_0000_0000_0001);

const AUDIT_CHANNEL_CAPACITY: usize = 8192;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient available {asset}: need {needed}, have {available}")]
    InsufficientAvailable {
        asset: String,
        needed: Decimal,
        available: Decimal,
    },
    #[error("insufficient locked {asset}: need {needed}, have {locked}")]
    InsufficientLocked {
        asset: String,
        needed: Decimal,
        locked: Decimal,
    },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("ledger inconsistent: {0}")]
    Inconsistent(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientAvailable { .. } => "INSUFFICIENT_AVAILABLE",
            LedgerError::InsufficientLocked { .. } => "INSUFFICIENT_LOCKED",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::Inconsistent(_) => "LEDGER_INCONSISTENT",
        }
    }
}

/// One user's holdings of one asset. Invariant: both fields non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub available: Decimal,
    pub locked: Decimal,
}

/// Everything the ledger needs to settle one fill atomically.
#[derive(Debug, Clone)]
pub struct SettleTrade {
    pub pair: String,
    pub base: String,
    pub quote: String,
    pub taker: Uuid,
    pub maker: Uuid,
    pub taker_order: Uuid,
    pub maker_order: Uuid,
    pub taker_side: OrderSide,
    pub base_amount: Decimal,
    /// Execution price (the maker's price).
    pub price: Decimal,
    /// Fee charged from the asset the taker receives.
    pub taker_fee: Decimal,
    /// Fee charged from the asset the maker receives.
    pub maker_fee: Decimal,
    /// Extra quote to release from the taker's reservation when a buy limit
    /// fills below its limit price. Zero for sells and market orders.
    pub taker_lock_refund: Decimal,
}

type AccountKey = (Uuid, String);

pub struct Ledger {
    accounts: DashMap<AccountKey, Arc<Mutex<Account>>>,
    audit_tx: broadcast::Sender<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        let (audit_tx, _) = broadcast::channel(AUDIT_CHANNEL_CAPACITY);
        Self {
            accounts: DashMap::new(),
            audit_tx,
        }
    }

    /// Audit stream for persistence and private balance pushes.
    pub fn subscribe_entries(&self) -> broadcast::Receiver<LedgerEntry> {
        self.audit_tx.subscribe()
    }

    fn cell(&self, user: Uuid, asset: &str) -> Arc<Mutex<Account>> {
        self.accounts
            .entry((user, asset.to_string()))
            .or_default()
            .clone()
    }

    fn emit(&self, entries: Vec<LedgerEntry>) {
        for entry in entries {
            let _ = self.audit_tx.send(entry);
        }
    }

    /// True once the user holds (or ever held) any account. Used by order
    /// admission as the "user exists" check.
    pub fn user_known(&self, user: Uuid) -> bool {
        self.accounts.iter().any(|e| e.key().0 == user)
    }

    pub fn balance(&self, user: Uuid, asset: &str) -> Account {
        self.accounts
            .get(&(user, asset.to_string()))
            .map(|cell| *cell.lock())
            .unwrap_or_default()
    }

    pub fn balances(&self, user: Uuid) -> Vec<BalanceResponse> {
        let mut out: Vec<BalanceResponse> = self
            .accounts
            .iter()
            .filter(|e| e.key().0 == user)
            .map(|e| {
                let account = *e.value().lock();
                BalanceResponse {
                    asset: e.key().1.clone(),
                    available: account.available,
                    locked: account.locked,
                    total: account.available + account.locked,
                }
            })
            .collect();
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        out
    }

    /// Sum of available + locked over all users. Conservation probe.
    pub fn asset_total(&self, asset: &str) -> Decimal {
        self.accounts
            .iter()
            .filter(|e| e.key().1 == asset)
            .map(|e| {
                let account = *e.value().lock();
                account.available + account.locked
            })
            .sum()
    }

    /// Startup recovery: install a balance snapshot without audit entries.
    pub fn seed_account(&self, user: Uuid, asset: &str, available: Decimal, locked: Decimal) {
        let cell = self.cell(user, asset);
        let mut account = cell.lock();
        account.available = available;
        account.locked = locked;
    }

    // ------------------------------------------------------------------
    // Single-account operations
    // ------------------------------------------------------------------

    pub fn credit(
        &self,
        user: Uuid,
        asset: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        require_positive(amount)?;
        let cell = self.cell(user, asset);
        let entry = {
            let mut account = cell.lock();
            let before = account.available;
            account.available += amount;
            make_entry(user, None, EntryKind::Deposit, asset, amount, before, reason)
        };
        self.emit(vec![entry.clone()]);
        Ok(entry)
    }

    pub fn debit(
        &self,
        user: Uuid,
        asset: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        require_positive(amount)?;
        let cell = self.cell(user, asset);
        let entry = {
            let mut account = cell.lock();
            if account.available < amount {
                return Err(LedgerError::InsufficientAvailable {
                    asset: asset.to_string(),
                    needed: amount,
                    available: account.available,
                });
            }
            let before = account.available;
            account.available -= amount;
            make_entry(user, None, EntryKind::Withdrawal, asset, -amount, before, reason)
        };
        self.emit(vec![entry.clone()]);
        Ok(entry)
    }

    /// Move from available to locked, reserving for an order.
    pub fn lock(
        &self,
        user: Uuid,
        asset: &str,
        amount: Decimal,
        order_id: Uuid,
    ) -> Result<(), LedgerError> {
        require_positive(amount)?;
        let cell = self.cell(user, asset);
        let entry = {
            let mut account = cell.lock();
            if account.available < amount {
                return Err(LedgerError::InsufficientAvailable {
                    asset: asset.to_string(),
                    needed: amount,
                    available: account.available,
                });
            }
            let before = account.available;
            account.available -= amount;
            account.locked += amount;
            make_entry(
                user,
                Some(order_id),
                EntryKind::Lock,
                asset,
                -amount,
                before,
                "order reservation",
            )
        };
        self.emit(vec![entry]);
        Ok(())
    }

    /// Reverse of `lock`.
    pub fn unlock(
        &self,
        user: Uuid,
        asset: &str,
        amount: Decimal,
        order_id: Uuid,
    ) -> Result<(), LedgerError> {
        require_positive(amount)?;
        let cell = self.cell(user, asset);
        let entry = {
            let mut account = cell.lock();
            if account.locked < amount {
                return Err(LedgerError::InsufficientLocked {
                    asset: asset.to_string(),
                    needed: amount,
                    locked: account.locked,
                });
            }
            let before = account.available;
            account.locked -= amount;
            account.available += amount;
            make_entry(
                user,
                Some(order_id),
                EntryKind::Unlock,
                asset,
                amount,
                before,
                "reservation released",
            )
        };
        self.emit(vec![entry]);
        Ok(())
    }

    /// Internal debit + credit, atomic across both accounts.
    pub fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        asset: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), LedgerError> {
        require_positive(amount)?;
        if from == to {
            return Ok(());
        }

        let mut keys = vec![(from, asset.to_string()), (to, asset.to_string())];
        keys.sort();
        let cells: Vec<_> = keys.iter().map(|(u, a)| self.cell(*u, a)).collect();
        let mut guards: Vec<MutexGuard<'_, Account>> = cells.iter().map(|c| c.lock()).collect();

        let from_idx = keys.iter().position(|k| k.0 == from).unwrap();
        let to_idx = keys.iter().position(|k| k.0 == to).unwrap();

        if guards[from_idx].available < amount {
            return Err(LedgerError::InsufficientAvailable {
                asset: asset.to_string(),
                needed: amount,
                available: guards[from_idx].available,
            });
        }

        let from_before = guards[from_idx].available;
        guards[from_idx].available -= amount;
        let to_before = guards[to_idx].available;
        guards[to_idx].available += amount;

        let entries = vec![
            make_entry(from, None, EntryKind::Withdrawal, asset, -amount, from_before, reason),
            make_entry(to, None, EntryKind::Deposit, asset, amount, to_before, reason),
        ];
        drop(guards);
        self.emit(entries);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Settle one fill: both sides' reservations are consumed, proceeds are
    /// credited net of fees, fees accrue to the treasury. All mutations and
    /// audit entries land together or not at all: validation runs first
    /// under every involved account lock.
    pub fn settle_trade(&self, st: &SettleTrade) -> Result<(), LedgerError> {
        require_positive(st.base_amount)?;
        require_positive(st.price)?;
        let cost = st.base_amount * st.price;

        // (payer asset out of lock, receiver asset in) per side
        let (taker_spends, taker_spend_amt, taker_receives, taker_receive_amt) =
            match st.taker_side {
                OrderSide::Buy => (&st.quote, cost, &st.base, st.base_amount),
                OrderSide::Sell => (&st.base, st.base_amount, &st.quote, cost),
            };
        let (maker_spends, maker_spend_amt, maker_receives, maker_receive_amt) =
            match st.taker_side {
                OrderSide::Buy => (&st.base, st.base_amount, &st.quote, cost),
                OrderSide::Sell => (&st.quote, cost, &st.base, st.base_amount),
            };

        let mut keys: Vec<AccountKey> = vec![
            (st.taker, taker_spends.clone()),
            (st.taker, taker_receives.clone()),
            (st.maker, maker_spends.clone()),
            (st.maker, maker_receives.clone()),
            (FEE_TREASURY, taker_receives.clone()),
            (FEE_TREASURY, maker_receives.clone()),
        ];
        keys.sort();
        keys.dedup();

        let cells: Vec<_> = keys.iter().map(|(u, a)| self.cell(*u, a)).collect();
        let mut guards: Vec<MutexGuard<'_, Account>> = cells.iter().map(|c| c.lock()).collect();
        let index: HashMap<AccountKey, usize> = keys
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, k)| (k, i))
            .collect();
        let idx = |user: Uuid, asset: &str| index[&(user, asset.to_string())];

        // Validate both reservations before touching anything.
        let taker_locked_needed = taker_spend_amt + st.taker_lock_refund;
        let taker_spend_idx = idx(st.taker, taker_spends);
        if guards[taker_spend_idx].locked < taker_locked_needed {
            return Err(LedgerError::Inconsistent(format!(
                "taker {} locked {} short of {} {}",
                st.taker, guards[taker_spend_idx].locked, taker_locked_needed, taker_spends
            )));
        }
        // The two sides always spend opposite legs of the pair, so even in a
        // self-match these are distinct accounts of the same user, validated
        // independently here and deduped by the key sort above.
        let maker_spend_idx = idx(st.maker, maker_spends);
        if guards[maker_spend_idx].locked < maker_spend_amt {
            return Err(LedgerError::Inconsistent(format!(
                "maker {} locked {} short of {} {}",
                st.maker, guards[maker_spend_idx].locked, maker_spend_amt, maker_spends
            )));
        }

        let mut entries = Vec::with_capacity(10);
        let describe = format!("trade {} {} @ {}", st.pair, st.base_amount, st.price);

        // Taker: release reservation (incl. price-improvement refund), pay,
        // receive gross, pay fee.
        {
            let g = &mut guards[taker_spend_idx];
            let release = taker_spend_amt + st.taker_lock_refund;
            let before = g.available;
            g.locked -= release;
            g.available += release;
            entries.push(make_entry(
                st.taker,
                Some(st.taker_order),
                EntryKind::Unlock,
                taker_spends,
                release,
                before,
                &describe,
            ));
            let before = g.available;
            g.available -= taker_spend_amt;
            entries.push(make_entry(
                st.taker,
                Some(st.taker_order),
                EntryKind::Trade,
                taker_spends,
                -taker_spend_amt,
                before,
                &describe,
            ));
        }
        {
            let g = &mut guards[idx(st.taker, taker_receives)];
            let before = g.available;
            g.available += taker_receive_amt;
            entries.push(make_entry(
                st.taker,
                Some(st.taker_order),
                EntryKind::Trade,
                taker_receives,
                taker_receive_amt,
                before,
                &describe,
            ));
            if st.taker_fee > Decimal::ZERO {
                let before = g.available;
                g.available -= st.taker_fee;
                entries.push(make_entry(
                    st.taker,
                    Some(st.taker_order),
                    EntryKind::Fee,
                    taker_receives,
                    -st.taker_fee,
                    before,
                    "taker fee",
                ));
            }
        }

        // Maker: symmetric, no refund (resting orders fill at their own price).
        {
            let g = &mut guards[maker_spend_idx];
            let before = g.available;
            g.locked -= maker_spend_amt;
            g.available += maker_spend_amt;
            entries.push(make_entry(
                st.maker,
                Some(st.maker_order),
                EntryKind::Unlock,
                maker_spends,
                maker_spend_amt,
                before,
                &describe,
            ));
            let before = g.available;
            g.available -= maker_spend_amt;
            entries.push(make_entry(
                st.maker,
                Some(st.maker_order),
                EntryKind::Trade,
                maker_spends,
                -maker_spend_amt,
                before,
                &describe,
            ));
        }
        {
            let g = &mut guards[idx(st.maker, maker_receives)];
            let before = g.available;
            g.available += maker_receive_amt;
            entries.push(make_entry(
                st.maker,
                Some(st.maker_order),
                EntryKind::Trade,
                maker_receives,
                maker_receive_amt,
                before,
                &describe,
            ));
            if st.maker_fee > Decimal::ZERO {
                let before = g.available;
                g.available -= st.maker_fee;
                entries.push(make_entry(
                    st.maker,
                    Some(st.maker_order),
                    EntryKind::Fee,
                    maker_receives,
                    -st.maker_fee,
                    before,
                    "maker fee",
                ));
            }
        }

        // Treasury collects both fees.
        if st.taker_fee > Decimal::ZERO {
            let g = &mut guards[idx(FEE_TREASURY, taker_receives)];
            let before = g.available;
            g.available += st.taker_fee;
            entries.push(make_entry(
                FEE_TREASURY,
                Some(st.taker_order),
                EntryKind::Fee,
                taker_receives,
                st.taker_fee,
                before,
                "taker fee collected",
            ));
        }
        if st.maker_fee > Decimal::ZERO {
            let g = &mut guards[idx(FEE_TREASURY, maker_receives)];
            let before = g.available;
            g.available += st.maker_fee;
            entries.push(make_entry(
                FEE_TREASURY,
                Some(st.maker_order),
                EntryKind::Fee,
                maker_receives,
                st.maker_fee,
                before,
                "maker fee collected",
            ));
        }

        drop(guards);
        self.emit(entries);
        Ok(())
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

fn require_positive(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn make_entry(
    user_id: Uuid,
    order_id: Option<Uuid>,
    kind: EntryKind,
    asset: &str,
    amount: Decimal,
    balance_before: Decimal,
    description: &str,
) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        user_id,
        order_id,
        kind,
        asset: asset.to_string(),
        amount,
        balance_before,
        balance_after: balance_before + amount,
        description: Some(description.to_string()),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn user() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn test_credit_debit() {
        let ledger = Ledger::new();
        let alice = user();

        ledger.credit(alice, "USDC", dec!(100), "deposit").unwrap();
        assert_eq!(ledger.balance(alice, "USDC").available, dec!(100));

        ledger.debit(alice, "USDC", dec!(40), "withdrawal").unwrap();
        assert_eq!(ledger.balance(alice, "USDC").available, dec!(60));

        let err = ledger.debit(alice, "USDC", dec!(100), "withdrawal").unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_AVAILABLE");
        assert_eq!(ledger.balance(alice, "USDC").available, dec!(60));
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        let ledger = Ledger::new();
        let alice = user();
        assert!(ledger.credit(alice, "USDC", dec!(0), "x").is_err());
        assert!(ledger.credit(alice, "USDC", dec!(-5), "x").is_err());
    }

    #[test]
    fn test_lock_unlock_round_trip() {
        let ledger = Ledger::new();
        let mut audit = ledger.subscribe_entries();
        let alice = user();
        let order = Uuid::new_v4();

        ledger.credit(alice, "USDC", dec!(100), "deposit").unwrap();
        ledger.lock(alice, "USDC", dec!(30), order).unwrap();
        let account = ledger.balance(alice, "USDC");
        assert_eq!(account.available, dec!(70));
        assert_eq!(account.locked, dec!(30));

        ledger.unlock(alice, "USDC", dec!(30), order).unwrap();
        let account = ledger.balance(alice, "USDC");
        assert_eq!(account.available, dec!(100));
        assert_eq!(account.locked, dec!(0));

        // lock + unlock entries sum to zero signed amount
        let _deposit = audit.try_recv().unwrap();
        let lock_entry = audit.try_recv().unwrap();
        let unlock_entry = audit.try_recv().unwrap();
        assert_eq!(lock_entry.kind, EntryKind::Lock);
        assert_eq!(unlock_entry.kind, EntryKind::Unlock);
        assert_eq!(lock_entry.amount + unlock_entry.amount, dec!(0));
    }

    #[test]
    fn test_unlock_more_than_locked_fails() {
        let ledger = Ledger::new();
        let alice = user();
        let order = Uuid::new_v4();
        ledger.credit(alice, "USDC", dec!(100), "deposit").unwrap();
        ledger.lock(alice, "USDC", dec!(30), order).unwrap();

        let err = ledger.unlock(alice, "USDC", dec!(31), order).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_LOCKED");
    }

    #[test]
    fn test_transfer() {
        let ledger = Ledger::new();
        let alice = user();
        let bob = user();
        ledger.credit(alice, "SOL", dec!(10), "deposit").unwrap();

        ledger.transfer(alice, bob, "SOL", dec!(4), "internal").unwrap();
        assert_eq!(ledger.balance(alice, "SOL").available, dec!(6));
        assert_eq!(ledger.balance(bob, "SOL").available, dec!(4));
        assert_eq!(ledger.asset_total("SOL"), dec!(10));
    }

    fn settle_fixture(
        taker_side: OrderSide,
        base_amount: Decimal,
        price: Decimal,
        refund: Decimal,
    ) -> (Uuid, Uuid, SettleTrade) {
        let taker = user();
        let maker = user();
        (
            taker,
            maker,
            SettleTrade {
                pair: "SOL/USDC".to_string(),
                base: "SOL".to_string(),
                quote: "USDC".to_string(),
                taker,
                maker,
                taker_order: Uuid::new_v4(),
                maker_order: Uuid::new_v4(),
                taker_side,
                base_amount,
                price,
                taker_fee: base_amount * dec!(0.001),
                maker_fee: base_amount * price * dec!(0.001),
                taker_lock_refund: refund,
            },
        )
    }

    #[test]
    fn test_settle_taker_buy() {
        let ledger = Ledger::new();
        let (taker, maker, mut st) = settle_fixture(OrderSide::Buy, dec!(0.3), dec!(100), dec!(0));
        // taker fee in base, maker fee in quote
        st.taker_fee = dec!(0.0003);
        st.maker_fee = dec!(0.03);

        ledger.credit(taker, "USDC", dec!(100), "deposit").unwrap();
        ledger.lock(taker, "USDC", dec!(30), st.taker_order).unwrap();
        ledger.credit(maker, "SOL", dec!(1), "deposit").unwrap();
        ledger.lock(maker, "SOL", dec!(0.3), st.maker_order).unwrap();

        ledger.settle_trade(&st).unwrap();

        let taker_usdc = ledger.balance(taker, "USDC");
        assert_eq!(taker_usdc.available, dec!(70));
        assert_eq!(taker_usdc.locked, dec!(0));
        assert_eq!(ledger.balance(taker, "SOL").available, dec!(0.2997));

        let maker_sol = ledger.balance(maker, "SOL");
        assert_eq!(maker_sol.available, dec!(0.7));
        assert_eq!(maker_sol.locked, dec!(0));
        assert_eq!(ledger.balance(maker, "USDC").available, dec!(29.97));

        assert_eq!(ledger.balance(FEE_TREASURY, "SOL").available, dec!(0.0003));
        assert_eq!(ledger.balance(FEE_TREASURY, "USDC").available, dec!(0.03));

        // Conservation to the last decimal, fee treasury included.
        assert_eq!(ledger.asset_total("USDC"), dec!(100));
        assert_eq!(ledger.asset_total("SOL"), dec!(1.0000));
    }

    #[test]
    fn test_settle_taker_sell() {
        let ledger = Ledger::new();
        let (taker, maker, mut st) = settle_fixture(OrderSide::Sell, dec!(2), dec!(50), dec!(0));
        st.taker_fee = dec!(0.1); // quote
        st.maker_fee = dec!(0.002); // base

        ledger.credit(taker, "SOL", dec!(5), "deposit").unwrap();
        ledger.lock(taker, "SOL", dec!(2), st.taker_order).unwrap();
        ledger.credit(maker, "USDC", dec!(200), "deposit").unwrap();
        ledger.lock(maker, "USDC", dec!(100), st.maker_order).unwrap();

        ledger.settle_trade(&st).unwrap();

        assert_eq!(ledger.balance(taker, "SOL").available, dec!(3));
        assert_eq!(ledger.balance(taker, "USDC").available, dec!(99.9));
        assert_eq!(ledger.balance(maker, "USDC").available, dec!(100));
        assert_eq!(ledger.balance(maker, "USDC").locked, dec!(0));
        assert_eq!(ledger.balance(maker, "SOL").available, dec!(1.998));
        assert_eq!(ledger.asset_total("SOL"), dec!(5));
        assert_eq!(ledger.asset_total("USDC"), dec!(200.0));
    }

    #[test]
    fn test_settle_price_improvement_refund() {
        let ledger = Ledger::new();
        let (taker, maker, mut st) = settle_fixture(OrderSide::Buy, dec!(1), dec!(99), dec!(1));
        st.taker_fee = dec!(0);
        st.maker_fee = dec!(0);

        // Taker reserved at a 100 limit, fill executes at 99: 1 USDC refund.
        ledger.credit(taker, "USDC", dec!(100), "deposit").unwrap();
        ledger.lock(taker, "USDC", dec!(100), st.taker_order).unwrap();
        ledger.credit(maker, "SOL", dec!(1), "deposit").unwrap();
        ledger.lock(maker, "SOL", dec!(1), st.maker_order).unwrap();

        ledger.settle_trade(&st).unwrap();

        let taker_usdc = ledger.balance(taker, "USDC");
        assert_eq!(taker_usdc.available, dec!(1));
        assert_eq!(taker_usdc.locked, dec!(0));
    }

    #[test]
    fn test_settle_insufficient_lock_is_inconsistent_and_atomic() {
        let ledger = Ledger::new();
        let (taker, maker, st) = settle_fixture(OrderSide::Buy, dec!(1), dec!(100), dec!(0));

        ledger.credit(taker, "USDC", dec!(100), "deposit").unwrap();
        ledger.lock(taker, "USDC", dec!(100), st.taker_order).unwrap();
        // Maker never locked base.
        ledger.credit(maker, "SOL", dec!(1), "deposit").unwrap();

        let err = ledger.settle_trade(&st).unwrap_err();
        assert_eq!(err.code(), "LEDGER_INCONSISTENT");

        // Nothing moved.
        assert_eq!(ledger.balance(taker, "USDC").locked, dec!(100));
        assert_eq!(ledger.balance(maker, "SOL").available, dec!(1));
        assert_eq!(ledger.balance(maker, "USDC").available, dec!(0));
    }

    #[test]
    fn test_settle_self_match() {
        let ledger = Ledger::new();
        let trader = user();
        let st = SettleTrade {
            pair: "SOL/USDC".to_string(),
            base: "SOL".to_string(),
            quote: "USDC".to_string(),
            taker: trader,
            maker: trader,
            taker_order: Uuid::new_v4(),
            maker_order: Uuid::new_v4(),
            taker_side: OrderSide::Buy,
            base_amount: dec!(1),
            price: dec!(100),
            taker_fee: dec!(0.001),
            maker_fee: dec!(0.1),
            taker_lock_refund: dec!(0),
        };

        ledger.credit(trader, "USDC", dec!(100), "deposit").unwrap();
        ledger.lock(trader, "USDC", dec!(100), st.taker_order).unwrap();
        ledger.credit(trader, "SOL", dec!(1), "deposit").unwrap();
        ledger.lock(trader, "SOL", dec!(1), st.maker_order).unwrap();

        ledger.settle_trade(&st).unwrap();

        // Trader pays both fees, otherwise nets out.
        assert_eq!(ledger.balance(trader, "USDC").available, dec!(99.9));
        assert_eq!(ledger.balance(trader, "SOL").available, dec!(0.999));
        assert_eq!(ledger.asset_total("USDC"), dec!(100.0));
        assert_eq!(ledger.asset_total("SOL"), dec!(1.000));
    }

    #[test]
    fn test_audit_entry_integrity() {
        let ledger = Ledger::new();
        let mut audit = ledger.subscribe_entries();
        let (taker, maker, st) = settle_fixture(OrderSide::Buy, dec!(0.5), dec!(80), dec!(0));

        ledger.credit(taker, "USDC", dec!(50), "deposit").unwrap();
        ledger.lock(taker, "USDC", dec!(40), st.taker_order).unwrap();
        ledger.credit(maker, "SOL", dec!(1), "deposit").unwrap();
        ledger.lock(maker, "SOL", dec!(0.5), st.maker_order).unwrap();
        ledger.settle_trade(&st).unwrap();

        while let Ok(entry) = audit.try_recv() {
            assert_eq!(entry.balance_after, entry.balance_before + entry.amount);
        }
    }

    #[test]
    fn test_user_known() {
        let ledger = Ledger::new();
        let alice = user();
        assert!(!ledger.user_known(alice));
        ledger.credit(alice, "USDC", dec!(1), "deposit").unwrap();
        assert!(ledger.user_known(alice));
    }
}
