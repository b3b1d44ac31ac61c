//! Outbound client boundary to the market venue.
//!
//! Engines talk to the venue only through the [`Gateway`] trait so the
//! production client and test stubs are interchangeable. Order signing and
//! the order-book protocol live on the venue's side of this boundary.

mod polymarket;
mod upstream;

pub use polymarket::PolymarketGateway;
pub use upstream::{canonicalize_trade, UpstreamTrade};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::Side;

/// Upstream failure taxonomy. Workers treat everything except `Invalid` as
/// transient: log, record an event, retry next iteration.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("rate limited by venue")]
    RateLimit,
    #[error("authentication rejected")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("venue unavailable")]
    Unavailable,
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("network error: {0}")]
    Network(String),
}

impl GatewayError {
    pub fn from_status(status: u16, body: &str) -> GatewayError {
        match status {
            429 => GatewayError::RateLimit,
            401 | 403 => GatewayError::Auth,
            404 => GatewayError::NotFound,
            500..=599 => GatewayError::Unavailable,
            _ => GatewayError::Invalid(body.chars().take(200).collect()),
        }
    }
}

/// A price observation in (0, 1). Values pinned to either end of the range
/// mean the market has settled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceQuote {
    pub value: f64,
}

impl PriceQuote {
    pub fn new(value: f64) -> Option<PriceQuote> {
        (value > 0.0 && value < 1.0).then_some(PriceQuote { value })
    }

    pub fn is_settled(&self) -> bool {
        self.value <= 0.001 || self.value >= 0.999
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Executed,
    Failed,
}

/// Outcome of an order submission. Failures carry a machine-readable reason
/// so the trade row can record why.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub status: OrderStatus,
    pub reason: Option<String>,
    pub raw: serde_json::Value,
}

impl OrderResult {
    pub fn executed(raw: serde_json::Value) -> OrderResult {
        OrderResult {
            status: OrderStatus::Executed,
            reason: None,
            raw,
        }
    }

    pub fn failed(reason: impl Into<String>) -> OrderResult {
        OrderResult {
            status: OrderStatus::Failed,
            reason: Some(reason.into()),
            raw: serde_json::Value::Null,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status == OrderStatus::Executed
    }
}

/// A binary market's complementary token pair, for the arbitrage scanner.
#[derive(Debug, Clone, Serialize)]
pub struct MarketPair {
    pub question: String,
    pub yes_token: String,
    pub no_token: String,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Recent trades of a wallet, canonicalized. Best-effort: transport
    /// errors yield an empty list, never a loud failure.
    async fn get_trader_trades(&self, address: &str, limit: usize) -> Vec<UpstreamTrade>;

    /// Raw positions payload of a wallet (profile endpoint pass-through).
    async fn get_trader_positions(&self, address: &str) -> Vec<serde_json::Value>;

    /// Best price for one side of a token's book.
    async fn get_price(&self, token_id: &str, side: Side) -> Option<PriceQuote>;

    /// Midpoint of the token's book.
    async fn get_midpoint(&self, token_id: &str) -> Option<PriceQuote>;

    /// Active binary markets with their YES/NO token pair.
    async fn get_active_markets(&self, limit: usize) -> Result<Vec<MarketPair>, GatewayError>;

    /// Fill-or-kill market order for a USD amount.
    async fn place_market_order(&self, token_id: &str, usd_amount: f64, side: Side) -> OrderResult;

    /// Good-til-cancelled limit order for a share count.
    async fn place_limit_order(
        &self,
        token_id: &str,
        limit_price: f64,
        size_shares: f64,
        side: Side,
    ) -> OrderResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_quote_range() {
        assert!(PriceQuote::new(0.5).is_some());
        assert!(PriceQuote::new(0.0).is_none());
        assert!(PriceQuote::new(1.0).is_none());
        assert!(PriceQuote::new(-0.1).is_none());
    }

    #[test]
    fn test_price_quote_settled_detection() {
        assert!(PriceQuote::new(0.0005).unwrap().is_settled());
        assert!(PriceQuote::new(0.9995).unwrap().is_settled());
        assert!(!PriceQuote::new(0.42).unwrap().is_settled());
    }

    #[test]
    fn test_error_taxonomy_from_status() {
        assert!(matches!(GatewayError::from_status(429, ""), GatewayError::RateLimit));
        assert!(matches!(GatewayError::from_status(401, ""), GatewayError::Auth));
        assert!(matches!(GatewayError::from_status(404, ""), GatewayError::NotFound));
        assert!(matches!(GatewayError::from_status(503, ""), GatewayError::Unavailable));
        assert!(matches!(GatewayError::from_status(422, "bad"), GatewayError::Invalid(_)));
    }
}
