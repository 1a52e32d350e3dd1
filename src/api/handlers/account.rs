//! Account endpoints: balances, ledger history, and the internal funding
//! surface. Deposits and withdrawals arrive as opaque credit/debit events
//! from the custody layer; on-chain watching is not this service's job.

use axum::{
    extract::{Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::AuthUser;
use crate::models::{BalanceResponse, EntryKind, LedgerEntry};
use crate::utils::response::{AppError, Paginated};
use crate::AppState;

/// GET /account/balances
pub async fn get_balances(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Json<Vec<BalanceResponse>> {
    Json(state.ledger.balances(auth.user_id))
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub asset: Option<String>,
    pub kind: Option<EntryKind>,
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

/// GET /account/ledger
pub async fn get_ledger_history(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Paginated<LedgerEntry>>, AppError> {
    let page_size = query.page_size.clamp(1, 200);
    let (entries, total) = state
        .db
        .ledger_page(auth.user_id, query.asset, query.kind, query.page, page_size)
        .await?;
    Ok(Json(Paginated {
        items: entries,
        page: query.page.max(1),
        page_size,
        total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FundingRequest {
    pub user_id: Uuid,
    pub asset: String,
    pub amount: Decimal,
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FundingResponse {
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
}

/// POST /internal/deposit: credit from the custody layer.
pub async fn internal_deposit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundingRequest>,
) -> Result<Json<FundingResponse>, AppError> {
    let asset = state
        .registry
        .asset(&req.asset)
        .ok_or_else(|| AppError::bad_request("UNKNOWN_ASSET", &req.asset))?;
    if !asset.active {
        return Err(AppError::bad_request("ASSET_INACTIVE", &req.asset));
    }
    if req.amount < asset.min_deposit {
        return Err(AppError::bad_request(
            "BELOW_MINIMUM",
            &format!("minimum deposit is {}", asset.min_deposit),
        ));
    }

    let reference = req.reference.as_deref().unwrap_or("deposit");
    state
        .ledger
        .credit(req.user_id, &req.asset, req.amount, reference)?;
    let account = state.ledger.balance(req.user_id, &req.asset);
    Ok(Json(FundingResponse {
        asset: req.asset,
        available: account.available,
        locked: account.locked,
    }))
}

/// POST /internal/withdraw: debit toward the custody layer.
pub async fn internal_withdraw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundingRequest>,
) -> Result<Json<FundingResponse>, AppError> {
    let asset = state
        .registry
        .asset(&req.asset)
        .ok_or_else(|| AppError::bad_request("UNKNOWN_ASSET", &req.asset))?;
    if req.amount < asset.min_withdrawal {
        return Err(AppError::bad_request(
            "BELOW_MINIMUM",
            &format!("minimum withdrawal is {}", asset.min_withdrawal),
        ));
    }

    let reference = req.reference.as_deref().unwrap_or("withdrawal");
    state
        .ledger
        .debit(req.user_id, &req.asset, req.amount, reference)?;
    let account = state.ledger.balance(req.user_id, &req.asset);
    Ok(Json(FundingResponse {
        asset: req.asset,
        available: account.available,
        locked: account.locked,
    }))
}

#[derive(Debug, Serialize)]
pub struct ClearPairResponse {
    pub pair: String,
    pub cancelled: usize,
}

/// POST /internal/pairs/:pair/clear: admin book wipe.
pub async fn internal_clear_pair(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(pair): axum::extract::Path<String>,
) -> Result<Json<ClearPairResponse>, AppError> {
    let cancelled = state.engine.clear_pair(&pair)?;
    Ok(Json(ClearPairResponse { pair, cancelled }))
}
