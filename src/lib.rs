//! Mirrorbot backend library.
//!
//! Exposes every module for use by the server binary and the integration
//! tests. The binary in `main.rs` is a thin wiring layer over this crate.

pub mod api;
pub mod auth;
pub mod engines;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod sizing;
pub mod store;

pub use api::AppState;
pub use engines::{EngineKey, EngineKind, Supervisor};
pub use gateway::{Gateway, GatewayError, PolymarketGateway, UpstreamTrade};
pub use models::{Config, OrderMode, Side, Strategy, TradeStatus};
pub use store::Store;
