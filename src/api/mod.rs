//! HTTP/WS boundary.
//!
//! Handlers translate authenticated requests into supervisor commands and
//! store queries; they read only from the store, never from live engine
//! memory. Errors use the `{error}` JSON shape with 4xx for client
//! mistakes and 5xx for internal failures.

pub mod account;
pub mod arb;
pub mod auth_routes;
pub mod copy;
pub mod funds;
pub mod positions_routes;
pub mod status;
pub mod whitelist;
pub mod ws;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::JwtHandler;
use crate::engines::Supervisor;
use crate::gateway::PolymarketGateway;
use crate::models::{Config, WsServerEvent};
use crate::notify::TelegramNotifier;
use crate::store::Store;

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub supervisor: Supervisor,
    pub gateway: PolymarketGateway,
    pub notifier: TelegramNotifier,
    pub jwt: Arc<JwtHandler>,
    pub owner_address: Option<String>,
    /// Runtime-toggleable whitelist enforcement (owner always exempt).
    pub whitelist_enabled: Arc<AtomicBool>,
    pub events: broadcast::Sender<WsServerEvent>,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = Result<T, ApiError>;

pub fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

pub fn bad_request(message: impl std::fmt::Display) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, message)
}

pub fn not_found(message: impl std::fmt::Display) -> ApiError {
    api_error(StatusCode::NOT_FOUND, message)
}

pub fn internal_error(err: impl std::fmt::Display) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err)
}

impl crate::auth::AuthError {
    pub fn into_api_error(self) -> ApiError {
        match self {
            crate::auth::AuthError::OwnerRequired => {
                api_error(StatusCode::FORBIDDEN, "Owner access required")
            }
            _ => api_error(StatusCode::UNAUTHORIZED, "Unauthorized"),
        }
    }
}

/// Quick shape check for Ethereum addresses at the API boundary.
pub fn validate_address(address: &str) -> Result<String, ApiError> {
    let address = address.trim();
    if !address.starts_with("0x") || address.len() != 42 {
        return Err(bad_request("Invalid Ethereum address"));
    }
    Ok(address.to_lowercase())
}

impl AppState {
    /// Gateway variant for a user: their stored credentials when present,
    /// otherwise the server-level credentials.
    pub async fn gateway_for(&self, user_address: &str) -> PolymarketGateway {
        match self.store.get_credentials(user_address).await {
            Ok(Some(creds)) => self
                .gateway
                .with_credentials(creds, Some(user_address.to_string())),
            _ => {
                let server_creds = self.config.server_credentials();
                match server_creds {
                    Some(creds) => self
                        .gateway
                        .with_credentials(creds, self.owner_address.clone()),
                    None => self.gateway.clone(),
                }
            }
        }
    }

    /// Whether the user can place real orders: stored per-user credentials
    /// or server-level wallet credentials.
    pub async fn has_trading_credentials(&self, user_address: &str) -> bool {
        if self.config.has_wallet_credentials() {
            return true;
        }
        matches!(
            self.store.get_credentials(user_address).await,
            Ok(Some(creds)) if !creds.api_key.is_empty() && !creds.api_secret.is_empty()
        )
    }
}
