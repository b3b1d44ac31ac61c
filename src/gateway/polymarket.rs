//! Production venue client.
//!
//! One reqwest client per process; per-user credential variants share the
//! connection pool and the per-host pacing state. Reads are best-effort,
//! order submissions carry L2 HMAC auth headers.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::models::{Config, Side};
use crate::store::ApiCredentials;

use super::{
    canonicalize_trade, Gateway, GatewayError, MarketPair, OrderResult, PriceQuote, UpstreamTrade,
};

/// Minimum spacing between requests to the same host.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(150);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PolymarketGateway {
    client: Client,
    clob_host: String,
    gamma_host: String,
    data_host: String,
    last_request: Arc<Mutex<HashMap<String, Instant>>>,
    credentials: Option<ApiCredentials>,
    wallet_address: Option<String>,
}

impl PolymarketGateway {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("mirrorbot/0.1.0");
        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url).context("invalid proxy url")?);
        }
        let client = builder.build().context("build http client")?;

        Ok(Self {
            client,
            clob_host: config.clob_host.trim_end_matches('/').to_string(),
            gamma_host: config.gamma_host.trim_end_matches('/').to_string(),
            data_host: config.data_host.trim_end_matches('/').to_string(),
            last_request: Arc::new(Mutex::new(HashMap::new())),
            credentials: None,
            wallet_address: None,
        })
    }

    /// Variant bound to specific credentials. The HTTP client and its
    /// connection pool, and the pacing state, are shared with the original.
    pub fn with_credentials(
        &self,
        credentials: ApiCredentials,
        wallet_address: Option<String>,
    ) -> Self {
        let mut gw = self.clone();
        gw.credentials = Some(credentials);
        gw.wallet_address = wallet_address.map(|a| a.to_lowercase());
        gw
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials
            .as_ref()
            .map(|c| !c.api_key.is_empty() && !c.api_secret.is_empty())
            .unwrap_or(false)
    }

    /// Enforce per-host spacing. The sleep happens off-lock.
    async fn pace(&self, host: &str) {
        let wait = {
            let last = self.last_request.lock();
            last.get(host).and_then(|prev| {
                let elapsed = prev.elapsed();
                (elapsed < MIN_REQUEST_INTERVAL).then(|| MIN_REQUEST_INTERVAL - elapsed)
            })
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        self.last_request
            .lock()
            .insert(host.to_string(), Instant::now());
    }

    async fn get_json(
        &self,
        host: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        self.pace(host).await;

        let url = format!("{host}{path}");
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), &body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))
    }

    /// L2 auth headers: timestamp + HMAC-SHA256 over
    /// `{timestamp}{method}{path}{body}` keyed by the base64url-decoded
    /// API secret.
    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Vec<(String, String)> {
        let Some(creds) = &self.credentials else {
            return Vec::new();
        };
        let timestamp = Utc::now().timestamp().to_string();
        let message = format!("{timestamp}{method}{path}{body}");
        let key = URL_SAFE
            .decode(creds.api_secret.as_bytes())
            .unwrap_or_else(|_| creds.api_secret.as_bytes().to_vec());

        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        let signature = URL_SAFE.encode(mac.finalize().into_bytes());

        let mut headers = vec![
            ("POLY_API_KEY".to_string(), creds.api_key.clone()),
            ("POLY_PASSPHRASE".to_string(), creds.api_passphrase.clone()),
            ("POLY_TIMESTAMP".to_string(), timestamp),
            ("POLY_SIGNATURE".to_string(), signature),
        ];
        if let Some(address) = &self.wallet_address {
            headers.push(("POLY_ADDRESS".to_string(), address.clone()));
        }
        headers
    }

    async fn post_order(&self, payload: Value) -> OrderResult {
        if !self.has_credentials() {
            return OrderResult::failed("no venue credentials configured");
        }
        self.pace(&self.clob_host).await;

        let path = "/order";
        let body = payload.to_string();
        let mut request = self
            .client
            .post(format!("{}{}", self.clob_host, path))
            .header("Content-Type", "application/json")
            .body(body.clone());
        for (name, value) in self.auth_headers("POST", path, &body) {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return OrderResult::failed(GatewayError::Network(e.to_string()).to_string()),
        };

        let status = response.status();
        let raw: Value = match response.json().await {
            Ok(v) => v,
            Err(_) => Value::Null,
        };
        if !status.is_success() {
            let reason = raw
                .get("error")
                .or_else(|| raw.get("errorMsg"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    GatewayError::from_status(status.as_u16(), "order rejected").to_string()
                });
            return OrderResult::failed(reason);
        }

        // The venue reports placement failures inside a 200 body.
        let error_msg = raw
            .get("errorMsg")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        if let Some(msg) = error_msg {
            return OrderResult::failed(msg);
        }
        let success = raw.get("success").and_then(|v| v.as_bool()).unwrap_or(true);
        if !success {
            return OrderResult::failed("order not accepted");
        }
        OrderResult::executed(raw)
    }

    fn parse_price(value: &Value, keys: &[&str]) -> Option<PriceQuote> {
        keys.iter()
            .filter_map(|k| value.get(k))
            .find_map(|v| {
                v.as_f64()
                    .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
            })
            .and_then(PriceQuote::new)
    }

    fn parse_market_pair(market: &Value) -> Option<MarketPair> {
        let question = market
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();

        // CLOB-shaped payloads carry a tokens array; Gamma encodes the pair
        // as a JSON string under clobTokenIds.
        if let Some(tokens) = market.get("tokens").and_then(|v| v.as_array()) {
            if tokens.len() >= 2 {
                let yes = tokens[0].get("token_id").and_then(|v| v.as_str())?;
                let no = tokens[1].get("token_id").and_then(|v| v.as_str())?;
                return Some(MarketPair {
                    question,
                    yes_token: yes.to_string(),
                    no_token: no.to_string(),
                });
            }
        }
        if let Some(raw) = market.get("clobTokenIds").and_then(|v| v.as_str()) {
            if let Ok(Value::Array(ids)) = serde_json::from_str::<Value>(raw) {
                if ids.len() >= 2 {
                    let yes = ids[0].as_str()?;
                    let no = ids[1].as_str()?;
                    return Some(MarketPair {
                        question,
                        yes_token: yes.to_string(),
                        no_token: no.to_string(),
                    });
                }
            }
        }
        None
    }
}

#[async_trait]
impl Gateway for PolymarketGateway {
    async fn get_trader_trades(&self, address: &str, limit: usize) -> Vec<UpstreamTrade> {
        let params = [
            ("user", address.to_lowercase()),
            ("limit", limit.to_string()),
        ];
        match self.get_json(&self.data_host, "/trades", &params).await {
            Ok(Value::Array(raw)) => raw.iter().filter_map(canonicalize_trade).collect(),
            Ok(other) => {
                warn!(
                    address = %&address[..address.len().min(10)],
                    "unexpected trades payload shape: {}",
                    other.to_string().chars().take(80).collect::<String>()
                );
                Vec::new()
            }
            Err(e) => {
                debug!(address = %&address[..address.len().min(10)], error = %e, "trades fetch failed");
                Vec::new()
            }
        }
    }

    async fn get_trader_positions(&self, address: &str) -> Vec<Value> {
        let params = [("user", address.to_lowercase())];
        match self.get_json(&self.data_host, "/positions", &params).await {
            Ok(Value::Array(raw)) => raw,
            _ => Vec::new(),
        }
    }

    async fn get_price(&self, token_id: &str, side: Side) -> Option<PriceQuote> {
        let params = [
            ("token_id", token_id.to_string()),
            ("side", side.as_str().to_string()),
        ];
        match self.get_json(&self.clob_host, "/price", &params).await {
            Ok(value) => Self::parse_price(&value, &["price"]),
            Err(e) => {
                debug!(token = %&token_id[..token_id.len().min(16)], error = %e, "price fetch failed");
                None
            }
        }
    }

    async fn get_midpoint(&self, token_id: &str) -> Option<PriceQuote> {
        let params = [("token_id", token_id.to_string())];
        match self.get_json(&self.clob_host, "/midpoint", &params).await {
            Ok(value) => Self::parse_price(&value, &["mid", "midpoint"]),
            Err(e) => {
                debug!(token = %&token_id[..token_id.len().min(16)], error = %e, "midpoint fetch failed");
                None
            }
        }
    }

    async fn get_active_markets(&self, limit: usize) -> Result<Vec<MarketPair>, GatewayError> {
        let params = [
            ("limit", limit.to_string()),
            ("active", "true".to_string()),
            ("closed", "false".to_string()),
        ];
        let value = self
            .get_json(&self.gamma_host, "/markets", &params)
            .await?;
        let markets = match value {
            Value::Array(markets) => markets,
            other => {
                return Err(GatewayError::Invalid(format!(
                    "unexpected markets payload: {}",
                    other.to_string().chars().take(80).collect::<String>()
                )))
            }
        };
        Ok(markets.iter().filter_map(Self::parse_market_pair).collect())
    }

    async fn place_market_order(&self, token_id: &str, usd_amount: f64, side: Side) -> OrderResult {
        debug!(
            token = %&token_id[..token_id.len().min(16)],
            side = side.as_str(),
            usd = usd_amount,
            "placing market order (FOK)"
        );
        self.post_order(json!({
            "token_id": token_id,
            "amount": usd_amount,
            "side": side.as_str(),
            "order_type": "FOK",
        }))
        .await
    }

    async fn place_limit_order(
        &self,
        token_id: &str,
        limit_price: f64,
        size_shares: f64,
        side: Side,
    ) -> OrderResult {
        debug!(
            token = %&token_id[..token_id.len().min(16)],
            side = side.as_str(),
            price = limit_price,
            shares = size_shares,
            "placing limit order (GTC)"
        );
        self.post_order(json!({
            "token_id": token_id,
            "price": limit_price,
            "size": size_shares,
            "side": side.as_str(),
            "order_type": "GTC",
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway() -> PolymarketGateway {
        let config = Config::from_env();
        PolymarketGateway::new(&config).unwrap()
    }

    #[test]
    fn test_auth_headers_absent_without_credentials() {
        let gw = test_gateway();
        assert!(gw.auth_headers("POST", "/order", "{}").is_empty());
        assert!(!gw.has_credentials());
    }

    #[test]
    fn test_auth_headers_present_with_credentials() {
        let gw = test_gateway().with_credentials(
            ApiCredentials {
                api_key: "key".into(),
                api_secret: URL_SAFE.encode(b"secret"),
                api_passphrase: "pass".into(),
            },
            Some("0xABCD".into()),
        );
        assert!(gw.has_credentials());

        let headers = gw.auth_headers("POST", "/order", "{}");
        let names: Vec<&str> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"POLY_API_KEY"));
        assert!(names.contains(&"POLY_SIGNATURE"));
        assert!(names.contains(&"POLY_ADDRESS"));

        let address = &headers.iter().find(|(n, _)| n == "POLY_ADDRESS").unwrap().1;
        assert_eq!(address, "0xabcd");
    }

    #[test]
    fn test_parse_market_pair_shapes() {
        let clob_shape = serde_json::json!({
            "question": "Will it happen?",
            "tokens": [{"token_id": "0xyes"}, {"token_id": "0xno"}],
        });
        let pair = PolymarketGateway::parse_market_pair(&clob_shape).unwrap();
        assert_eq!(pair.yes_token, "0xyes");
        assert_eq!(pair.no_token, "0xno");

        let gamma_shape = serde_json::json!({
            "question": "Will it happen?",
            "clobTokenIds": "[\"0xyes\", \"0xno\"]",
        });
        let pair = PolymarketGateway::parse_market_pair(&gamma_shape).unwrap();
        assert_eq!(pair.yes_token, "0xyes");

        let incomplete = serde_json::json!({"question": "?", "tokens": [{"token_id": "0xyes"}]});
        assert!(PolymarketGateway::parse_market_pair(&incomplete).is_none());
    }

    #[test]
    fn test_parse_price_accepts_string_numbers() {
        let quote =
            PolymarketGateway::parse_price(&serde_json::json!({"price": "0.42"}), &["price"]);
        assert_eq!(quote.unwrap().value, 0.42);

        let none = PolymarketGateway::parse_price(&serde_json::json!({"price": "1.0"}), &["price"]);
        assert!(none.is_none());
    }
}
