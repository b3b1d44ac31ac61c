//! Arbitrage endpoints: engine control and history.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Claims;
use crate::engines::{ArbitrageScanner, EngineKey, EngineKind};
use crate::models::Strategy;
use crate::store::TradeFilter;

use super::copy::{HistoryQuery, StartRequest};
use super::{bad_request, internal_error, ApiResult, AppState};

/// POST /api/arb/start
pub async fn start(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Json<Value>> {
    let dry_run = body.map(|Json(b)| b.dry_run).unwrap_or(false);
    let user = claims.sub.clone();

    if !dry_run && !state.has_trading_credentials(&user).await {
        return Err(bad_request(
            "No trading credentials configured. Add venue API credentials or run in dry-run mode.",
        ));
    }

    let gateway = Arc::new(state.gateway_for(&user).await);
    let worker = ArbitrageScanner::new(
        state.store.clone(),
        gateway,
        &user,
        dry_run,
        state.config.auto_execute,
        state.config.min_profit_pct,
        state.config.trade_amount,
        state.config.max_position_size,
        Duration::from_secs(state.config.poll_interval_secs),
    );

    let started = state
        .supervisor
        .start(EngineKey::new(&user, EngineKind::Arb), |cancel| worker.run(cancel));
    if !started {
        return Err(bad_request("Arbitrage already running"));
    }

    super::positions_routes::ensure_position_tracker(&state);
    Ok(Json(json!({ "message": "Arbitrage started", "dry_run": dry_run })))
}

/// POST /api/arb/stop
pub async fn stop(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    if state
        .supervisor
        .stop(&EngineKey::new(&claims.sub, EngineKind::Arb))
    {
        Ok(Json(json!({ "message": "Arbitrage stopped" })))
    } else {
        Err(bad_request("Not running"))
    }
}

/// GET /api/arb/trades
pub async fn trades(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let trades = state
        .store
        .list_trades(&TradeFilter {
            strategy: Some(Strategy::Arbitrage),
            user_address: Some(claims.sub.clone()),
            status: query.status,
            search: query.search,
            limit: query.limit.unwrap_or(50),
            offset: query.offset.unwrap_or(0),
        })
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(trades)))
}

/// GET /api/arb/stats
pub async fn stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let stats = state
        .store
        .strategy_stats(&claims.sub, Strategy::Arbitrage)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({
        "total_trades": stats.total_trades,
        "total_spent": stats.total_spent,
        "total_expected_profit": stats.total_expected_profit,
        "failed_trades": stats.failed_trades,
    })))
}

/// GET /api/arb/pnl
pub async fn pnl(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let series = state
        .store
        .pnl_series(&claims.sub, Some(Strategy::Arbitrage), query.days.unwrap_or(30))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(series)))
}
