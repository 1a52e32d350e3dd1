//! Public market data endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::TradingPair;
use crate::services::matching::{BookSnapshot, PairStats};
use crate::services::ticker::TickerData;
use crate::utils::response::AppError;
use crate::AppState;

/// GET /markets
pub async fn list_markets(State(state): State<Arc<AppState>>) -> Json<Vec<TradingPair>> {
    let mut pairs = state.registry.pairs();
    pairs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Json(pairs)
}

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub depth: Option<usize>,
}

/// GET /markets/:pair/orderbook?depth=N
pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<BookSnapshot>, AppError> {
    let depth = query.depth.unwrap_or(state.config.bus.book_depth).clamp(1, 200);
    Ok(Json(state.engine.snapshot(&pair, depth)?))
}

/// GET /markets/:pair/ticker
pub async fn get_ticker(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
) -> Result<Json<TickerData>, AppError> {
    let stats = state.engine.pair_stats(&pair)?;
    Ok(Json(state.ticker.ticker(&pair, &stats)))
}

/// GET /markets/:pair/stats
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(pair): Path<String>,
) -> Result<Json<PairStats>, AppError> {
    Ok(Json(state.engine.pair_stats(&pair)?))
}
