use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::accounts::BalanceAccounts;
use crate::db::models::WagerStatus;
use crate::db::Database;
use crate::error::SettlementError;
use crate::settlement::{PlaceWagerRequest, SettlementEngine};

pub struct AppState {
    pub db: Database,
    pub engine: Arc<SettlementEngine>,
    pub accounts: Arc<dyn BalanceAccounts>,
}

type ApiError = (StatusCode, String);

/// Build the Axum router for the wager API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/wagers", get(list_wagers_handler).post(place_wager_handler))
        .route("/api/wagers/:id", get(wager_handler))
        .route("/api/wagers/:id/task", get(task_handler))
        .route("/api/accounts/:id/balance", get(balance_handler))
        .route("/api/accounts/:id/transactions", get(transactions_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn api_error(e: SettlementError) -> ApiError {
    let status = match &e {
        SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
        SettlementError::InsufficientFunds { .. } => StatusCode::CONFLICT,
        SettlementError::UnknownWager(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/wagers?status=pending&limit=50&offset=0
async fn list_wagers_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(str::parse::<WagerStatus>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let offset = q.offset.unwrap_or(0).max(0);
    state
        .engine
        .ledger()
        .list(status, limit, offset)
        .map(Json)
        .map_err(api_error)
}

/// GET /api/wagers/:id
async fn wager_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.ledger().get(&id).map(Json).map_err(api_error)
}

/// GET /api/wagers/:id/task
async fn task_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.get_task_for_wager(&id).map_err(internal)? {
        Some(task) => Ok(Json(task)),
        None => Err((StatusCode::NOT_FOUND, format!("No settlement task for wager {}", id))),
    }
}

/// POST /api/wagers
async fn place_wager_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceWagerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let wager = state.engine.place_wager(req).await.map_err(api_error)?;
    info!(
        "Placed {} wager {} for {}: stake {:.2} @ {:.3}",
        wager.kind.as_str(),
        wager.id,
        wager.account_id,
        wager.stake,
        wager.total_odds
    );
    Ok((StatusCode::CREATED, Json(wager)))
}

/// GET /api/accounts/:id/balance
async fn balance_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let balance = state.accounts.balance(&id).await.map_err(api_error)?;
    Ok(Json(json!({ "account_id": id, "balance": balance })))
}

/// GET /api/accounts/:id/transactions
async fn transactions_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .list_balance_transactions(&id)
        .map(Json)
        .map_err(internal)
}

/// GET /api/jobs
async fn jobs_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.db.list_jobs().map(Json).map_err(internal)
}

/// GET /api/stats
async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.engine.ledger().stats().map(Json).map_err(api_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            api_error(SettlementError::Validation("bad".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            api_error(SettlementError::InsufficientFunds {
                required: 10.0,
                available: 1.0
            })
            .0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            api_error(SettlementError::UnknownWager("w".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            api_error(SettlementError::Provider("down".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
