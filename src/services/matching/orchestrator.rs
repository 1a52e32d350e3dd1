//! Async persistence worker.
//!
//! The engine and the ledger run entirely in memory; this worker trails them,
//! consuming their broadcast streams and writing orders, fills, ledger
//! entries and balance snapshots to Postgres. Writes never block the pair
//! critical section. Repeated failures flip the database health flag, which
//! order admission checks before accepting new work.

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::types::{EngineEvent, FillRecord};
use crate::db::Database;
use crate::metrics::names;
use crate::models::LedgerEntry;
use crate::services::ledger::Ledger;
use crate::services::matching::MatchingEngine;
use std::sync::Arc;

/// Consecutive failures before the database is considered down.
const UNHEALTHY_THRESHOLD: u32 = 3;

pub fn start_persistence_workers(db: Database, engine: Arc<MatchingEngine>, ledger: &Ledger) {
    let engine_rx = engine.subscribe_events();
    let ledger_rx = ledger.subscribe_entries();

    tokio::spawn(run_engine_worker(db.clone(), engine, engine_rx));
    tokio::spawn(run_ledger_worker(db, ledger_rx));
}

async fn run_engine_worker(
    db: Database,
    engine: Arc<MatchingEngine>,
    mut rx: broadcast::Receiver<EngineEvent>,
) {
    info!("order/fill persistence worker started");
    let mut failures = 0u32;

    loop {
        match rx.recv().await {
            Ok(EngineEvent::OrderUpdated(transition)) => {
                let Some(order) = engine.order(transition.order_id) else {
                    continue;
                };
                let result = sqlx::query(
                    r#"
                    INSERT INTO orders (id, user_id, pair, side, order_type, price, amount, filled,
                                        average_price, status, time_in_force, locked_amount,
                                        locked_asset, client_order_id, created_at, filled_at, cancelled_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                    ON CONFLICT (id) DO UPDATE SET
                        filled = $8,
                        average_price = $9,
                        status = $10,
                        filled_at = $16,
                        cancelled_at = $17,
                        updated_at = NOW()
                    "#,
                )
                .bind(order.id)
                .bind(order.user_id)
                .bind(&order.pair)
                .bind(order.side)
                .bind(order.order_type)
                .bind(order.price)
                .bind(order.amount)
                .bind(order.filled)
                .bind(order.average_price)
                .bind(order.status)
                .bind(order.time_in_force)
                .bind(order.locked_amount)
                .bind(&order.locked_asset)
                .bind(&order.client_order_id)
                .bind(order.created_at)
                .bind(order.filled_at)
                .bind(order.cancelled_at)
                .execute(&db.pool)
                .await;

                track(&db, &mut failures, result.map(|_| ()), "persist order");
            }
            Ok(EngineEvent::FillRecorded(fill)) => {
                let result = persist_fill(&db, &fill).await;
                track(&db, &mut failures, result, "persist fill");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("order persistence lagged {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("engine event channel closed, stopping order persistence");
                break;
            }
        }
    }
}

async fn persist_fill(db: &Database, fill: &FillRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO order_fills (id, order_id, counter_order_id, amount, price, fee, fee_asset, is_maker, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(fill.id)
    .bind(fill.order_id)
    .bind(fill.counter_order_id)
    .bind(fill.amount)
    .bind(fill.price)
    .bind(fill.fee)
    .bind(&fill.fee_asset)
    .bind(fill.is_maker)
    .bind(fill.created_at)
    .execute(&db.pool)
    .await?;
    Ok(())
}

async fn run_ledger_worker(db: Database, mut rx: broadcast::Receiver<LedgerEntry>) {
    info!("ledger persistence worker started");
    let mut failures = 0u32;

    loop {
        match rx.recv().await {
            Ok(entry) => {
                let result = persist_entry(&db, &entry).await;
                track(&db, &mut failures, result, "persist ledger entry");
                metrics::counter!(names::LEDGER_ENTRIES_TOTAL).increment(1);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Balance snapshots self-heal on the next entry; the audit
                // rows in the gap are lost to the DB and flagged loudly.
                error!("ledger persistence lagged {} entries", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("ledger audit channel closed, stopping ledger persistence");
                break;
            }
        }
    }
}

/// Entry insert plus balance snapshot upsert in one transaction.
async fn persist_entry(db: &Database, entry: &LedgerEntry) -> Result<(), sqlx::Error> {
    let mut tx = db.pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, user_id, order_id, kind, asset, amount, balance_before, balance_after, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(entry.id)
    .bind(entry.user_id)
    .bind(entry.order_id)
    .bind(entry.kind)
    .bind(&entry.asset)
    .bind(entry.amount)
    .bind(entry.balance_before)
    .bind(entry.balance_after)
    .bind(&entry.description)
    .bind(entry.created_at)
    .execute(&mut *tx)
    .await?;

    // The locked component is derivable from lock/unlock deltas; snapshot
    // available directly from the entry and adjust locked by the same delta.
    let locked_delta = match entry.kind {
        crate::models::EntryKind::Lock => -entry.amount,
        crate::models::EntryKind::Unlock => -entry.amount,
        _ => rust_decimal::Decimal::ZERO,
    };
    sqlx::query(
        r#"
        INSERT INTO balances (user_id, asset, available, locked, updated_at)
        VALUES ($1, $2, $3, GREATEST($4, 0), NOW())
        ON CONFLICT (user_id, asset) DO UPDATE SET
            available = $3,
            locked = GREATEST(balances.locked + $4, 0),
            updated_at = NOW()
        "#,
    )
    .bind(entry.user_id)
    .bind(&entry.asset)
    .bind(entry.balance_after)
    .bind(locked_delta)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

fn track(db: &Database, failures: &mut u32, result: Result<(), sqlx::Error>, what: &str) {
    match result {
        Ok(()) => {
            if *failures >= UNHEALTHY_THRESHOLD {
                info!("database writes recovered");
            }
            *failures = 0;
            db.mark_healthy(true);
        }
        Err(e) => {
            *failures += 1;
            error!("failed to {}: {}", what, e);
            metrics::counter!(names::DB_WRITES_FAILED_TOTAL).increment(1);
            if *failures >= UNHEALTHY_THRESHOLD {
                db.mark_healthy(false);
            }
        }
    }
}
