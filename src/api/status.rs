//! Liveness and engine status endpoints.

use axum::{extract::State, Extension, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::auth::Claims;
use crate::engines::{EngineKey, EngineKind};

use super::AppState;

/// GET /api/health (public)
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn state_label(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}

/// GET /api/status — caller's engine states plus default config.
pub async fn status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<Value> {
    let user = &claims.sub;
    let copy = state
        .supervisor
        .is_running(&EngineKey::new(user, EngineKind::Copy));
    let arb = state
        .supervisor
        .is_running(&EngineKey::new(user, EngineKind::Arb));
    let fund = state
        .supervisor
        .is_running(&EngineKey::global(EngineKind::Fund));
    let positions = state
        .supervisor
        .is_running(&EngineKey::global(EngineKind::Positions));

    let config = &state.config;
    Json(json!({
        "copy_trading": state_label(copy),
        "arbitrage": state_label(arb),
        "fund_manager": state_label(fund),
        "position_tracker": state_label(positions),
        "config": {
            "copy_percentage": config.copy_percentage,
            "min_copy_size": config.min_copy_size,
            "max_copy_size": config.max_copy_size,
            "max_daily_spend": config.max_daily_spend,
            "max_trade_age": config.max_trade_age_secs,
            "order_mode": config.order_mode.as_str(),
            "max_slippage": config.max_slippage,
            "min_profit_pct": config.min_profit_pct,
            "trade_amount": config.trade_amount,
            "max_position_size": config.max_position_size,
            "poll_interval": config.poll_interval_secs,
            "auto_execute": config.auto_execute,
        },
    }))
}
