//! Postgres access.
//!
//! The in-memory core is authoritative at runtime; rows here are the durable
//! source of truth the core is rebuilt from at startup. A health flag flips
//! on persistent write failure so order admission can refuse with
//! UNAVAILABLE instead of accepting state it cannot durably record.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Balance, EntryKind, LedgerEntry, Order, OrderStatus};

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
    healthy: Arc<AtomicBool>,
}

impl Database {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!().run(&pool).await?;
        Ok(Self {
            pool,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Resting orders in book-rebuild order: pair, then admission order.
    pub async fn resting_orders(&self) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders
             WHERE status IN ('pending', 'partial')
             ORDER BY pair, created_at, id",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// All balance snapshots, for ledger seeding at startup.
    pub async fn all_balances(&self) -> Result<Vec<Balance>, sqlx::Error> {
        sqlx::query_as::<_, Balance>("SELECT * FROM balances")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn orders_page(
        &self,
        user_id: Uuid,
        status: Option<OrderStatus>,
        pair: Option<String>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Order>, i64), sqlx::Error> {
        let offset = (page.max(1) - 1) * page_size;
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders
             WHERE user_id = $1
               AND ($2::order_status IS NULL OR status = $2)
               AND ($3::text IS NULL OR pair = $3)
             ORDER BY created_at DESC, id DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(user_id)
        .bind(status)
        .bind(&pair)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders
             WHERE user_id = $1
               AND ($2::order_status IS NULL OR status = $2)
               AND ($3::text IS NULL OR pair = $3)",
        )
        .bind(user_id)
        .bind(status)
        .bind(&pair)
        .fetch_one(&self.pool)
        .await?;

        Ok((orders, total))
    }

    pub async fn ledger_page(
        &self,
        user_id: Uuid,
        asset: Option<String>,
        kind: Option<EntryKind>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<LedgerEntry>, i64), sqlx::Error> {
        let offset = (page.max(1) - 1) * page_size;
        let entries = sqlx::query_as::<_, LedgerEntry>(
            "SELECT * FROM ledger_entries
             WHERE user_id = $1
               AND ($2::text IS NULL OR asset = $2)
               AND ($3::ledger_entry_kind IS NULL OR kind = $3)
             ORDER BY created_at DESC, id DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(user_id)
        .bind(&asset)
        .bind(kind)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ledger_entries
             WHERE user_id = $1
               AND ($2::text IS NULL OR asset = $2)
               AND ($3::ledger_entry_kind IS NULL OR kind = $3)",
        )
        .bind(user_id)
        .bind(&asset)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        Ok((entries, total))
    }
}
