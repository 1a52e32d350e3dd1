//! Order endpoints: submission, cancellation, lookups.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::AuthUser;
use crate::models::{
    OrderFill, OrderResponse, OrderStatus, SubmitOrderRequest, SubmitOrderResponse,
};
use crate::services::matching::OrderSubmit;
use crate::utils::response::{AppError, Paginated};
use crate::AppState;

/// POST /orders
pub async fn submit_order(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(req): Json<SubmitOrderRequest>,
) -> Result<Json<SubmitOrderResponse>, AppError> {
    // Refuse outright while persistence is down; no partial state.
    if !state.db.is_healthy() {
        return Err(AppError::unavailable("persistence unavailable"));
    }

    let result = state.engine.submit(OrderSubmit {
        user_id: auth.user_id,
        pair: req.pair,
        side: req.side,
        order_type: req.order_type,
        amount: req.amount,
        price: req.price,
        quote_budget: req.quote_budget,
        time_in_force: req.time_in_force,
        client_order_id: req.client_order_id,
    })?;

    Ok(Json(SubmitOrderResponse {
        order_id: result.order_id,
        status: result.status,
        filled: result.filled,
        remaining: result.remaining,
        average_price: result.average_price,
        fills: result
            .fills
            .iter()
            .filter(|f| !f.is_maker)
            .map(|f| f.to_response())
            .collect(),
    }))
}

/// DELETE /orders/:order_id
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state.engine.cancel(auth.user_id, order_id)?;
    Ok(Json(order.into()))
}

/// GET /orders/:order_id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    // Live record first, falling back to the durable row.
    if let Some(order) = state.engine.order(order_id) {
        if order.user_id != auth.user_id {
            return Err(AppError::not_found("order not found"));
        }
        return Ok(Json(order.into()));
    }

    let order: Option<crate::models::Order> =
        sqlx::query_as("SELECT * FROM orders WHERE id = $1 AND user_id = $2")
            .bind(order_id)
            .bind(auth.user_id)
            .fetch_optional(&state.db.pool)
            .await?;
    order
        .map(|o| Json(o.into()))
        .ok_or_else(|| AppError::not_found("order not found"))
}

/// GET /orders/:order_id/fills
pub async fn get_order_fills(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<OrderFill>>, AppError> {
    // Ownership gate first; fills are then read from the durable rows.
    let owned: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM orders WHERE id = $1 AND user_id = $2")
            .bind(order_id)
            .bind(auth.user_id)
            .fetch_optional(&state.db.pool)
            .await?;
    if owned.is_none() && state.engine.order(order_id).map(|o| o.user_id) != Some(auth.user_id) {
        return Err(AppError::not_found("order not found"));
    }

    let fills: Vec<OrderFill> = sqlx::query_as(
        "SELECT * FROM order_fills WHERE order_id = $1 ORDER BY created_at, id",
    )
    .bind(order_id)
    .fetch_all(&state.db.pool)
    .await?;
    Ok(Json(fills))
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub status: Option<OrderStatus>,
    pub pair: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

/// GET /account/orders
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Paginated<OrderResponse>>, AppError> {
    let page_size = query.page_size.clamp(1, 200);
    let (orders, total) = state
        .db
        .orders_page(auth.user_id, query.status, query.pair, query.page, page_size)
        .await?;
    Ok(Json(Paginated {
        items: orders.into_iter().map(Into::into).collect(),
        page: query.page.max(1),
        page_size,
        total,
    }))
}
