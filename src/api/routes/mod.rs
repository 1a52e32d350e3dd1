use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::AppState;

pub fn create_router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public market data
    let public_routes = Router::new()
        .route("/markets", get(handlers::market::list_markets))
        .route("/markets/:pair/orderbook", get(handlers::market::get_orderbook))
        .route("/markets/:pair/ticker", get(handlers::market::get_ticker))
        .route("/markets/:pair/stats", get(handlers::market::get_stats));

    // Authenticated (principal stamped by the upstream gateway)
    let account_routes = Router::new()
        .route("/orders", post(handlers::order::submit_order))
        .route("/orders/:order_id", get(handlers::order::get_order))
        .route("/orders/:order_id", delete(handlers::order::cancel_order))
        .route("/orders/:order_id/fills", get(handlers::order::get_order_fills))
        .route("/account/orders", get(handlers::order::list_orders))
        .route("/account/balances", get(handlers::account::get_balances))
        .route("/account/ledger", get(handlers::account::get_ledger_history));

    // Internal surface: custody credits/debits and admin maintenance
    let internal_routes = Router::new()
        .route("/internal/deposit", post(handlers::account::internal_deposit))
        .route("/internal/withdraw", post(handlers::account::internal_withdraw))
        .route(
            "/internal/pairs/:pair/clear",
            post(handlers::account::internal_clear_pair),
        );

    public_routes.merge(account_routes).merge(internal_routes)
}
