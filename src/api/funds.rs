//! Fund endpoints: lifecycle, allocations, investment, performance, engine
//! control.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{require_owner, Claims};
use crate::engines::{EngineKey, EngineKind, FundManager};
use crate::store::FundAllocationInput;

use super::copy::{HistoryQuery, StartRequest};
use super::{bad_request, internal_error, not_found, validate_address, ApiResult, AppState};

/// GET /api/funds
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let funds = state.store.list_funds(true).await.map_err(internal_error)?;
    Ok(Json(json!(funds)))
}

#[derive(Debug, Deserialize)]
pub struct CreateFundRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// POST /api/funds (owner)
pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<CreateFundRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    let id = state
        .store
        .create_fund(&claims.sub, &body.name, &body.description)
        .await
        .map_err(bad_request)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "message": format!("Fund '{}' created", body.name.trim()) })),
    ))
}

/// GET /api/funds/:id — details including active allocations.
pub async fn get(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let fund = state
        .store
        .get_fund(fund_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Fund not found"))?;
    let allocations = state
        .store
        .list_allocations(fund_id)
        .await
        .map_err(internal_error)?;

    let mut value = serde_json::to_value(&fund).map_err(internal_error)?;
    value["allocations"] = json!(allocations);
    Ok(Json(value))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateFundRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
}

/// PATCH /api/funds/:id (owner)
pub async fn update(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(fund_id): Path<i64>,
    Json(body): Json<UpdateFundRequest>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    if body.name.is_none() && body.description.is_none() && body.active.is_none() {
        return Err(bad_request("No valid fields provided"));
    }
    let updated = state
        .store
        .update_fund(
            fund_id,
            &claims.sub,
            body.name.as_deref(),
            body.description.as_deref(),
            body.active,
        )
        .await
        .map_err(bad_request)?;
    if updated {
        Ok(Json(json!({ "message": "Fund updated" })))
    } else {
        Err(not_found("Fund not found or not owner"))
    }
}

#[derive(Debug, Deserialize)]
pub struct SetAllocationsRequest {
    pub allocations: Vec<FundAllocationInput>,
}

/// PUT /api/funds/:id/allocations (owner) — weights must sum to 1.0 ± 0.01.
pub async fn set_allocations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(fund_id): Path<i64>,
    Json(body): Json<SetAllocationsRequest>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;

    for alloc in &body.allocations {
        validate_address(&alloc.trader_address)?;
    }

    let fund = state
        .store
        .get_fund(fund_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Fund not found"))?;
    if fund.owner_address != claims.sub {
        return Err(not_found("Fund not found or not owner"));
    }

    state
        .store
        .replace_allocations(fund_id, &body.allocations)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({ "message": "Allocations updated" })))
}

#[derive(Debug, Deserialize)]
pub struct InvestRequest {
    pub amount: f64,
}

/// POST /api/funds/:id/invest
pub async fn invest(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(fund_id): Path<i64>,
    Json(body): Json<InvestRequest>,
) -> ApiResult<Json<Value>> {
    if !body.amount.is_finite() || body.amount <= 0.0 {
        return Err(bad_request("Amount must be positive"));
    }
    let investment = state
        .store
        .invest(fund_id, &claims.sub, body.amount)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({
        "message": format!("Invested ${:.2}", body.amount),
        "shares": investment.shares,
        "investment_id": investment.id,
    })))
}

/// POST /api/funds/investments/:id/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(investment_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let amount = state
        .store
        .withdraw(investment_id, &claims.sub)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({
        "message": format!("Withdrawn ${amount:.2}"),
        "amount": (amount * 100.0).round() / 100.0,
    })))
}

/// GET /api/funds/my-investments
pub async fn my_investments(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let investments = state
        .store
        .investor_investments(&claims.sub)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(investments)))
}

/// GET /api/funds/:id/performance
pub async fn performance(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let series = state
        .store
        .fund_performance(fund_id, query.days.unwrap_or(30))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(series)))
}

/// GET /api/funds/:id/trades
pub async fn trades(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    state
        .store
        .get_fund(fund_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Fund not found"))?;
    let trades = state
        .store
        .fund_trades(fund_id, query.limit.unwrap_or(50))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!(trades)))
}

/// POST /api/funds/engine/start (owner)
pub async fn engine_start(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    let dry_run = body.map(|Json(b)| b.dry_run).unwrap_or(false);

    if !dry_run && !state.has_trading_credentials(&claims.sub).await {
        return Err(bad_request(
            "No trading credentials configured. Add venue API credentials or run in dry-run mode.",
        ));
    }

    let gateway = Arc::new(state.gateway_for(&claims.sub).await);
    let worker = FundManager::new(
        state.store.clone(),
        gateway,
        state.config.copy_defaults(),
        Duration::from_secs(state.config.poll_interval_secs),
        dry_run,
    );

    let started = state
        .supervisor
        .start(EngineKey::global(EngineKind::Fund), |cancel| worker.run(cancel));
    if !started {
        return Err(bad_request("Fund manager already running"));
    }
    Ok(Json(json!({ "message": "Fund manager started", "dry_run": dry_run })))
}

/// POST /api/funds/engine/stop (owner)
pub async fn engine_stop(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    require_owner(&claims).map_err(|e| e.into_api_error())?;
    if state.supervisor.stop(&EngineKey::global(EngineKind::Fund)) {
        Ok(Json(json!({ "message": "Fund manager stopped" })))
    } else {
        Err(bad_request("Not running"))
    }
}
