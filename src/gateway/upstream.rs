//! Canonicalizer for upstream trade payloads.
//!
//! The venue's feeds are not consistent about key names: the token id
//! arrives as `asset_id`, `token_id`, or `asset`; timestamps as
//! `timestamp`, `created_at`, or `time`, either unix numbers or ISO
//! strings. Everything funnels through here into one strongly typed shape;
//! unknown fields are ignored.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::Side;

/// One observed trade of a followed wallet.
#[derive(Debug, Clone)]
pub struct UpstreamTrade {
    /// Canonical unique id: transaction hash when present, else explicit id
    /// fields, else `{token_id}_{timestamp}`.
    pub fingerprint: String,
    pub token_id: Option<String>,
    pub side: Option<Side>,
    pub raw_side: String,
    /// Share count reported upstream.
    pub size: f64,
    /// Execution price in (0,1); 0.0 when the feed omitted it.
    pub price: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub market: String,
}

impl UpstreamTrade {
    /// Estimated USD notional of the upstream trade.
    pub fn original_usd(&self) -> f64 {
        if self.price > 0.0 {
            self.size * self.price
        } else {
            self.size
        }
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.timestamp.map(|ts| (now - ts).num_seconds())
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(k))
        .filter_map(|v| v.as_str())
        .find(|s| !s.trim().is_empty())
}

fn num_field(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| value.get(k)).find_map(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
    })
}

fn parse_timestamp(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        let Some(raw) = value.get(*key) else { continue };

        if let Some(secs) = raw.as_f64() {
            if let Some(ts) = Utc.timestamp_opt(secs as i64, 0).single() {
                return Some(ts);
            }
        }

        if let Some(s) = raw.as_str() {
            let s = s.trim();
            if s.is_empty() {
                continue;
            }
            // Integer-in-a-string unix timestamps show up too.
            if let Ok(secs) = s.parse::<i64>() {
                if let Some(ts) = Utc.timestamp_opt(secs, 0).single() {
                    return Some(ts);
                }
            }
            let iso = s.replace('Z', "+00:00");
            if let Ok(ts) = DateTime::parse_from_rfc3339(&iso) {
                return Some(ts.with_timezone(&Utc));
            }
        }
    }
    None
}

/// Canonicalize one raw trade object. Returns None for non-object payloads.
pub fn canonicalize_trade(raw: &Value) -> Option<UpstreamTrade> {
    if !raw.is_object() {
        return None;
    }

    let token_id = str_field(raw, &["asset_id", "token_id", "asset"]).map(str::to_string);
    let timestamp = parse_timestamp(raw, &["timestamp", "created_at", "time"]);

    let fingerprint = str_field(raw, &["transactionHash", "transaction_hash"])
        .or_else(|| str_field(raw, &["id", "trade_id"]))
        .map(str::to_string)
        .unwrap_or_else(|| {
            // Last resort: token + raw timestamp field.
            let ts = raw
                .get("timestamp")
                .or_else(|| raw.get("created_at"))
                .or_else(|| raw.get("time"))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            format!("{}_{}", token_id.clone().unwrap_or_default(), ts)
        });

    let raw_side = str_field(raw, &["side"]).unwrap_or("").to_uppercase();
    let side = Side::parse(&raw_side);

    let market = str_field(raw, &["market", "title", "question"])
        .unwrap_or("")
        .to_string();

    Some(UpstreamTrade {
        fingerprint,
        token_id,
        side,
        raw_side,
        size: num_field(raw, &["size"]).unwrap_or(0.0),
        price: num_field(raw, &["price"]).unwrap_or(0.0),
        timestamp,
        market,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_prefers_transaction_hash() {
        let trade = canonicalize_trade(&json!({
            "transactionHash": "0xhash",
            "id": "trade-1",
            "asset_id": "0xtok",
            "side": "BUY",
            "size": 100,
            "price": 0.42,
        }))
        .unwrap();
        assert_eq!(trade.fingerprint, "0xhash");
    }

    #[test]
    fn test_fingerprint_falls_back_to_id_then_token_timestamp() {
        let by_id = canonicalize_trade(&json!({
            "id": "trade-1", "asset_id": "0xtok", "side": "SELL",
        }))
        .unwrap();
        assert_eq!(by_id.fingerprint, "trade-1");

        let synthetic = canonicalize_trade(&json!({
            "asset_id": "0xtok", "timestamp": 1700000000, "side": "BUY",
        }))
        .unwrap();
        assert_eq!(synthetic.fingerprint, "0xtok_1700000000");
    }

    #[test]
    fn test_token_id_aliases() {
        for key in ["asset_id", "token_id", "asset"] {
            let trade = canonicalize_trade(&json!({ key: "0xtok", "side": "BUY" })).unwrap();
            assert_eq!(trade.token_id.as_deref(), Some("0xtok"));
        }
    }

    #[test]
    fn test_timestamp_formats() {
        let unix = canonicalize_trade(&json!({"timestamp": 1700000000})).unwrap();
        assert!(unix.timestamp.is_some());

        let iso = canonicalize_trade(&json!({"created_at": "2024-01-02T03:04:05Z"})).unwrap();
        assert_eq!(
            iso.timestamp.unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
        );

        let string_unix = canonicalize_trade(&json!({"time": "1700000000"})).unwrap();
        assert!(string_unix.timestamp.is_some());

        let missing = canonicalize_trade(&json!({"side": "BUY"})).unwrap();
        assert!(missing.timestamp.is_none());
    }

    #[test]
    fn test_side_normalization_and_garbage() {
        let buy = canonicalize_trade(&json!({"side": "buy"})).unwrap();
        assert_eq!(buy.side, Some(Side::Buy));
        assert_eq!(buy.raw_side, "BUY");

        let junk = canonicalize_trade(&json!({"side": "MERGE"})).unwrap();
        assert_eq!(junk.side, None);
        assert_eq!(junk.raw_side, "MERGE");
    }

    #[test]
    fn test_original_usd_falls_back_to_size() {
        let priced = canonicalize_trade(&json!({"size": 1000, "price": 0.42})).unwrap();
        assert!((priced.original_usd() - 420.0).abs() < 1e-9);

        let unpriced = canonicalize_trade(&json!({"size": 55})).unwrap();
        assert!((unpriced.original_usd() - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(canonicalize_trade(&json!("not a trade")).is_none());
        assert!(canonicalize_trade(&json!(42)).is_none());
    }
}
