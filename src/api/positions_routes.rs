//! Position endpoints: open/closed listings, flatten, redeem resolved.

use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::Claims;
use crate::engines::{EngineKey, EngineKind, PositionTracker};
use crate::gateway::Gateway;
use crate::models::Side;

use super::{bad_request, internal_error, ApiResult, AppState};

/// A market is considered resolved once its live price pins to either end.
const RESOLVED_HIGH: f64 = 0.95;
const RESOLVED_LOW: f64 = 0.05;

const TRACKER_INTERVAL: Duration = Duration::from_secs(30);

/// Start the global position price tracker if it is not already running.
/// Called whenever a trading engine starts.
pub fn ensure_position_tracker(state: &AppState) {
    let key = EngineKey::global(EngineKind::Positions);
    if state.supervisor.is_running(&key) {
        return;
    }
    let tracker = PositionTracker::new(
        state.store.clone(),
        Arc::new(state.gateway.clone()),
        TRACKER_INTERVAL,
    );
    state.supervisor.start(key, |cancel| tracker.run(cancel));
}

/// GET /api/positions
pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let positions = state
        .store
        .list_open_positions(Some(&claims.sub))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(positions)))
}

/// GET /api/positions/summary
pub async fn summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let summary = state
        .store
        .positions_summary(&claims.sub)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(summary)))
}

/// GET /api/positions/closed — last 30 days.
pub async fn closed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let positions = state
        .store
        .list_closed_positions(&claims.sub, 30)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(positions)))
}

/// POST /api/positions/close-all — flatten the caller's book with market
/// orders: SELL every LONG, BUY back every SHORT.
pub async fn close_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let positions = state
        .store
        .list_open_positions(Some(&claims.sub))
        .await
        .map_err(internal_error)?;
    if positions.is_empty() {
        return Err(bad_request("No open positions to close"));
    }
    if !state.has_trading_credentials(&claims.sub).await {
        return Err(bad_request("No trading credentials configured"));
    }

    let gateway = state.gateway_for(&claims.sub).await;
    let mut closed = 0;
    let mut failed = 0;
    let mut errors: Vec<String> = Vec::new();

    for position in &positions {
        if position.size <= 0.0 {
            continue;
        }
        let close_side = if position.side == "LONG" {
            Side::Sell
        } else {
            Side::Buy
        };
        let amount = (position.size * position.current_price.max(0.01) * 100.0).round() / 100.0;
        let amount = amount.max(0.01);

        let result = gateway
            .place_market_order(&position.token_id, amount, close_side)
            .await;
        if result.is_executed() {
            state
                .store
                .close_position(position.id)
                .await
                .map_err(internal_error)?;
            closed += 1;
            info!(
                position_id = position.id,
                side = close_side.as_str(),
                usd = amount,
                "closed position"
            );
        } else {
            failed += 1;
            let market = position.market.as_deref().unwrap_or("unknown");
            let reason = result.reason.unwrap_or_else(|| "order failed".to_string());
            warn!(position_id = position.id, reason = %reason, "failed to close position");
            errors.push(format!("{market}: {reason}"));
        }
    }

    Ok(Json(json!({
        "message": format!("Closed {closed}/{} positions", positions.len()),
        "closed": closed,
        "failed": failed,
        "errors": errors,
    })))
}

/// POST /api/positions/redeem-all — mark resolved positions closed. The
/// venue auto-redeems settled tokens to the wallet, so prices pinned near
/// 0 or 1 just need cleanup here.
pub async fn redeem_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let positions = state
        .store
        .list_open_positions(Some(&claims.sub))
        .await
        .map_err(internal_error)?;
    if positions.is_empty() {
        return Err(bad_request("No open positions"));
    }

    let mut redeemed = 0;
    let mut skipped = 0;
    for position in &positions {
        let price = position.current_price;
        if price >= RESOLVED_HIGH || price <= RESOLVED_LOW {
            state
                .store
                .close_position(position.id)
                .await
                .map_err(internal_error)?;
            redeemed += 1;
            let won = (position.side == "LONG" && price >= RESOLVED_HIGH)
                || (position.side == "SHORT" && price <= RESOLVED_LOW);
            info!(
                position_id = position.id,
                market = %position.market.as_deref().unwrap_or("unknown"),
                outcome = if won { "WON" } else { "LOST" },
                "redeemed resolved position"
            );
        } else {
            skipped += 1;
        }
    }

    Ok(Json(json!({
        "message": format!("Redeemed {redeemed} positions ({skipped} still active)"),
        "redeemed": redeemed,
        "skipped": skipped,
    })))
}
