use serde::{Deserialize, Serialize};
use std::env;

/// Trading strategy that produced a trade or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Copy,
    Arbitrage,
    Fund,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Copy => "copy",
            Strategy::Arbitrage => "arbitrage",
            Strategy::Fund => "fund",
        }
    }
}

/// Order side. Upstream payloads are normalized to upper-case before parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Position direction derived from the opening trade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn from_trade_side(side: Side) -> PositionSide {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

/// How copy orders are submitted: FOK market orders or GTC limit orders
/// at the trader's price plus a slippage allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Market,
    Limit,
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderMode::Market => "market",
            OrderMode::Limit => "limit",
        }
    }

    pub fn parse(raw: &str) -> Option<OrderMode> {
        match raw.to_ascii_lowercase().as_str() {
            "market" => Some(OrderMode::Market),
            "limit" => Some(OrderMode::Limit),
            _ => None,
        }
    }
}

/// Outcome of a downstream order as recorded in the trades table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Executed,
    Failed,
    DryRun,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Executed => "executed",
            TradeStatus::Failed => "failed",
            TradeStatus::DryRun => "dry_run",
        }
    }
}

/// Events pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerEvent {
    EngineStatus {
        user_address: String,
        engine: String,
        state: String,
    },
}

/// User-level copy defaults a per-trader override falls back to.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CopyDefaults {
    pub copy_percentage: f64,
    pub min_copy_size: f64,
    pub max_copy_size: f64,
    pub max_daily_spend: f64,
    pub max_trade_age_secs: i64,
    pub order_mode: OrderMode,
    /// Limit-order slippage allowance as a percentage (2.0 = 2%).
    pub limit_order_pct: f64,
}

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    // Wallet
    pub private_key: String,
    pub signature_type: i64,
    pub funder: Option<String>,

    // Server-level venue API credentials (per-user credentials in the store
    // take precedence)
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,

    // Auth
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // Copy trading defaults
    pub copy_percentage: f64,
    pub min_copy_size: f64,
    pub max_copy_size: f64,
    pub max_daily_spend: f64,
    pub max_trade_age_secs: i64,
    pub order_mode: OrderMode,
    pub max_slippage: f64,

    // Arbitrage
    pub min_profit_pct: f64,
    pub trade_amount: f64,
    pub max_position_size: f64,

    // General
    pub poll_interval_secs: u64,
    pub auto_execute: bool,
    pub db_path: String,
    pub port: u16,

    // Venue hosts
    pub clob_host: String,
    pub gamma_host: String,
    pub data_host: String,
    pub chain_id: u64,
    pub proxy_url: Option<String>,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    // Optional bootstrap: trader addresses re-seeded for the owner on start.
    pub seed_traders: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let raw_key = env::var("POLYMARKET_PRIVATE_KEY")
            .or_else(|_| env::var("PRIVATE_KEY"))
            .unwrap_or_default();
        // The CLOB signer expects raw hex without the 0x prefix.
        let private_key = raw_key
            .strip_prefix("0x")
            .or_else(|| raw_key.strip_prefix("0X"))
            .unwrap_or(&raw_key)
            .to_string();

        let order_mode = env::var("ORDER_MODE")
            .ok()
            .and_then(|v| OrderMode::parse(&v))
            .unwrap_or(OrderMode::Limit);

        let seed_traders = env::var("SEED_TRADERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.starts_with("0x") && s.len() == 42)
            .collect();

        Self {
            private_key,
            signature_type: env_or("POLYMARKET_SIGNATURE_TYPE", 0),
            funder: env_opt("POLYMARKET_FUNDER"),
            api_key: env_opt("POLYMARKET_API_KEY"),
            api_secret: env_opt("POLYMARKET_API_SECRET"),
            api_passphrase: env_opt("POLYMARKET_API_PASSPHRASE"),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "change-me-in-production".to_string()),
            jwt_expiry_hours: env_or("JWT_EXPIRY_HOURS", 72),
            copy_percentage: env_or("COPY_PERCENTAGE", 0.10),
            min_copy_size: env_or("MIN_COPY_SIZE", 5.0),
            max_copy_size: env_or("MAX_COPY_SIZE", 100.0),
            max_daily_spend: env_or("MAX_DAILY_SPEND", 500.0),
            max_trade_age_secs: env_or("MAX_TRADE_AGE", 300),
            order_mode,
            max_slippage: env_or("MAX_SLIPPAGE", 0.02),
            min_profit_pct: env_or("MIN_PROFIT_PCT", 1.0),
            trade_amount: env_or("TRADE_AMOUNT", 10.0),
            max_position_size: env_or("MAX_POSITION_SIZE", 100.0),
            poll_interval_secs: env_or("POLL_INTERVAL", 15),
            auto_execute: env_or("AUTO_EXECUTE", true),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "mirrorbot.db".to_string()),
            port: env_or("PORT", 8080),
            clob_host: env::var("CLOB_HOST")
                .unwrap_or_else(|_| "https://clob.polymarket.com".to_string()),
            gamma_host: env::var("GAMMA_HOST")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            data_host: env::var("DATA_HOST")
                .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
            chain_id: env_or("CHAIN_ID", 137),
            proxy_url: env_opt("PROXY_URL"),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
            seed_traders,
        }
    }

    pub fn has_wallet_credentials(&self) -> bool {
        !self.private_key.trim().is_empty()
    }

    /// Server-level venue API credentials, when all three parts are set.
    pub fn server_credentials(&self) -> Option<crate::store::ApiCredentials> {
        match (&self.api_key, &self.api_secret, &self.api_passphrase) {
            (Some(key), Some(secret), Some(passphrase)) => Some(crate::store::ApiCredentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
                api_passphrase: passphrase.clone(),
            }),
            _ => None,
        }
    }

    /// User-level sizing defaults used when a trader carries no override.
    pub fn copy_defaults(&self) -> CopyDefaults {
        CopyDefaults {
            copy_percentage: self.copy_percentage,
            min_copy_size: self.min_copy_size,
            max_copy_size: self.max_copy_size,
            max_daily_spend: self.max_daily_spend,
            max_trade_age_secs: self.max_trade_age_secs,
            order_mode: self.order_mode,
            limit_order_pct: self.max_slippage * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parse_normalizes_case() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn test_position_side_from_trade_side() {
        assert_eq!(PositionSide::from_trade_side(Side::Buy), PositionSide::Long);
        assert_eq!(
            PositionSide::from_trade_side(Side::Sell),
            PositionSide::Short
        );
    }

    #[test]
    fn test_order_mode_parse() {
        assert_eq!(OrderMode::parse("LIMIT"), Some(OrderMode::Limit));
        assert_eq!(OrderMode::parse("market"), Some(OrderMode::Market));
        assert_eq!(OrderMode::parse("ioc"), None);
    }
}
