//! SQLite persistence layer.
//!
//! Single source of truth for users, followed traders, trades, positions,
//! funds, dedup fingerprints, and engine events. Every multi-row mutation
//! runs inside one transaction; the store owns no domain logic beyond the
//! position upsert rule.

mod events;
mod funds;
mod positions;
mod traders;
mod trades;

pub use events::EngineEventRecord;
pub use funds::{FundAllocationInput, FundAllocationRecord, FundInvestmentRecord, FundPerformanceRecord, FundRecord, FundTradeRecord};
pub use positions::{PositionRecord, PositionsSummary, PriceUpdate};
pub use traders::{FollowedTraderRecord, TraderOverridePatch};
pub use trades::{NewTrade, PnlPoint, StrategyStats, TradeFilter, TradeRecord};

use anyhow::{bail, Context, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Handle to the embedded database. Cheap to clone; all workers share one
/// connection guarded by an async mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub address: String,
    pub role: String,
    pub display_name: Option<String>,
    pub created_at: String,
    pub last_login: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhitelistEntry {
    pub address: String,
    pub added_at: String,
    pub added_by: Option<String>,
}

/// Stored venue API credentials for a user. Secrets are never exposed over
/// the HTTP API; handlers return presence flags only.
#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

pub(crate) fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

impl Store {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000).ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                address TEXT PRIMARY KEY,
                role TEXT NOT NULL DEFAULT 'user',
                display_name TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_login TEXT
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT,
                nonce TEXT NOT NULL,
                token TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                expires_at TEXT,
                verified INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS whitelist (
                address TEXT PRIMARY KEY,
                added_at TEXT NOT NULL DEFAULT (datetime('now')),
                added_by TEXT
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                user_address TEXT NOT NULL DEFAULT 'legacy',
                strategy TEXT NOT NULL,
                market TEXT,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                amount REAL NOT NULL,
                price REAL,
                expected_profit REAL,
                copied_from TEXT,
                original_trade_id TEXT,
                status TEXT NOT NULL DEFAULT 'executed',
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS followed_traders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_address TEXT NOT NULL DEFAULT 'legacy',
                address TEXT NOT NULL,
                alias TEXT,
                added_at TEXT NOT NULL DEFAULT (datetime('now')),
                active INTEGER NOT NULL DEFAULT 1,
                total_copied INTEGER NOT NULL DEFAULT 0,
                total_spent REAL NOT NULL DEFAULT 0.0,
                copy_percentage REAL,
                min_copy_size REAL,
                max_copy_size REAL,
                max_daily_spend REAL,
                order_mode TEXT,
                limit_order_pct REAL,
                UNIQUE(user_address, address)
            );

            CREATE TABLE IF NOT EXISTS seen_trade_ids (
                trade_id TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_address TEXT NOT NULL,
                token_id TEXT NOT NULL,
                market TEXT,
                side TEXT NOT NULL DEFAULT 'LONG',
                size REAL NOT NULL DEFAULT 0.0,
                avg_entry_price REAL NOT NULL DEFAULT 0.0,
                current_price REAL NOT NULL DEFAULT 0.0,
                unrealized_pnl REAL NOT NULL DEFAULT 0.0,
                cost_basis REAL NOT NULL DEFAULT 0.0,
                strategy TEXT,
                copied_from TEXT,
                opened_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_updated TEXT NOT NULL DEFAULT (datetime('now')),
                status TEXT NOT NULL DEFAULT 'open'
            );

            CREATE TABLE IF NOT EXISTS funds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_address TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                active INTEGER NOT NULL DEFAULT 1,
                total_aum REAL NOT NULL DEFAULT 0.0,
                nav_per_share REAL NOT NULL DEFAULT 1.0,
                total_shares REAL NOT NULL DEFAULT 0.0
            );

            CREATE TABLE IF NOT EXISTS fund_allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fund_id INTEGER NOT NULL REFERENCES funds(id),
                trader_address TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 0.0,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE(fund_id, trader_address)
            );

            CREATE TABLE IF NOT EXISTS fund_investments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fund_id INTEGER NOT NULL REFERENCES funds(id),
                investor_address TEXT NOT NULL,
                amount_invested REAL NOT NULL,
                shares REAL NOT NULL,
                invested_at TEXT NOT NULL DEFAULT (datetime('now')),
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS fund_performance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fund_id INTEGER NOT NULL REFERENCES funds(id),
                date TEXT NOT NULL,
                nav REAL NOT NULL,
                daily_return REAL NOT NULL DEFAULT 0.0,
                cumulative_return REAL NOT NULL DEFAULT 0.0,
                UNIQUE(fund_id, date)
            );

            CREATE TABLE IF NOT EXISTS fund_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fund_id INTEGER NOT NULL REFERENCES funds(id),
                trade_id INTEGER REFERENCES trades(id),
                trader_address TEXT NOT NULL,
                amount REAL NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS engine_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                user_address TEXT,
                strategy TEXT,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_address TEXT PRIMARY KEY,
                prefs TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS api_credentials (
                user_address TEXT PRIMARY KEY,
                api_key TEXT NOT NULL DEFAULT '',
                api_secret TEXT NOT NULL DEFAULT '',
                api_passphrase TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open
                ON positions(user_address, token_id, side) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);
            CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy);
            CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_address);
            CREATE INDEX IF NOT EXISTS idx_trades_copied_from ON trades(copied_from);
            CREATE INDEX IF NOT EXISTS idx_seen_first_seen ON seen_trade_ids(first_seen);
            CREATE INDEX IF NOT EXISTS idx_sessions_nonce ON sessions(nonce);
            CREATE INDEX IF NOT EXISTS idx_followed_user ON followed_traders(user_address);
            CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_address);
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            CREATE INDEX IF NOT EXISTS idx_funds_owner ON funds(owner_address);
            CREATE INDEX IF NOT EXISTS idx_fund_alloc_fund ON fund_allocations(fund_id);
            CREATE INDEX IF NOT EXISTS idx_fund_invest_fund ON fund_investments(fund_id);
            CREATE INDEX IF NOT EXISTS idx_fund_invest_investor ON fund_investments(investor_address);
            CREATE INDEX IF NOT EXISTS idx_fund_perf_fund_date ON fund_performance(fund_id, date);
            CREATE INDEX IF NOT EXISTS idx_fund_trades_fund ON fund_trades(fund_id);
            CREATE INDEX IF NOT EXISTS idx_events_user ON engine_events(user_address);
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON engine_events(timestamp);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Create the user on first login or refresh `last_login` on return
    /// visits. Never downgrades an existing role.
    pub async fn upsert_user(&self, address: &str, role: &str) -> Result<UserRecord> {
        let address = normalize_address(address);
        let conn = self.lock().await;

        let existing = conn
            .prepare_cached("SELECT address FROM users WHERE address = ?1")?
            .query_row(params![address], |row| row.get::<_, String>(0))
            .optional()?;

        if existing.is_some() {
            conn.execute(
                "UPDATE users SET last_login = datetime('now') WHERE address = ?1",
                params![address],
            )?;
            if role == "owner" {
                conn.execute(
                    "UPDATE users SET role = 'owner' WHERE address = ?1",
                    params![address],
                )?;
            }
        } else {
            conn.execute(
                "INSERT INTO users (address, role, last_login) VALUES (?1, ?2, datetime('now'))",
                params![address, role],
            )?;
        }

        let user = conn
            .prepare_cached(
                "SELECT address, role, display_name, created_at, last_login
                 FROM users WHERE address = ?1",
            )?
            .query_row(params![address], Self::map_user)?;
        Ok(user)
    }

    pub async fn get_user(&self, address: &str) -> Result<Option<UserRecord>> {
        let address = normalize_address(address);
        let conn = self.lock().await;
        let user = conn
            .prepare_cached(
                "SELECT address, role, display_name, created_at, last_login
                 FROM users WHERE address = ?1",
            )?
            .query_row(params![address], Self::map_user)
            .optional()?;
        Ok(user)
    }

    fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
        Ok(UserRecord {
            address: row.get(0)?,
            role: row.get(1)?,
            display_name: row.get(2)?,
            created_at: row.get(3)?,
            last_login: row.get(4)?,
        })
    }

    /// Adopt rows written before multi-tenancy under the `'legacy'` key.
    pub async fn claim_legacy_data(&self, owner_address: &str) -> Result<()> {
        let owner = normalize_address(owner_address);
        let conn = self.lock().await;
        conn.execute(
            "UPDATE followed_traders SET user_address = ?1 WHERE user_address = 'legacy'",
            params![owner],
        )?;
        conn.execute(
            "UPDATE trades SET user_address = ?1 WHERE user_address = 'legacy'",
            params![owner],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session nonces
    // ------------------------------------------------------------------

    pub async fn create_nonce(&self) -> Result<String> {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);

        let conn = self.lock().await;
        conn.execute("INSERT INTO sessions (nonce) VALUES (?1)", params![nonce])?;
        Ok(nonce)
    }

    /// Atomically consume an issued-and-unverified nonce. Returns false when
    /// the nonce was never issued or was already used.
    pub async fn consume_nonce(
        &self,
        nonce: &str,
        address: &str,
        token: &str,
        expires_at: &str,
    ) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET address = ?1, token = ?2, expires_at = ?3, verified = 1
             WHERE nonce = ?4 AND verified = 0",
            params![normalize_address(address), token, expires_at, nonce],
        )?;
        Ok(updated > 0)
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at < datetime('now')
             OR (verified = 0 AND created_at < datetime('now', '-1 hour'))",
            [],
        )?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Whitelist
    // ------------------------------------------------------------------

    pub async fn is_whitelisted(&self, address: &str) -> Result<bool> {
        let address = normalize_address(address);
        let conn = self.lock().await;
        let found = conn
            .prepare_cached("SELECT 1 FROM whitelist WHERE address = ?1")?
            .query_row(params![address], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns false if the address was already whitelisted.
    pub async fn add_whitelist(&self, address: &str, added_by: &str) -> Result<bool> {
        let address = normalize_address(address);
        let conn = self.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO whitelist (address, added_by) VALUES (?1, ?2)",
            params![address, normalize_address(added_by)],
        )?;
        Ok(inserted > 0)
    }

    /// Removes an address from the whitelist. The owner cannot be removed.
    pub async fn remove_whitelist(&self, address: &str, owner: Option<&str>) -> Result<bool> {
        let address = normalize_address(address);
        if let Some(owner) = owner {
            if normalize_address(owner) == address {
                bail!("cannot remove owner from whitelist");
            }
        }
        let conn = self.lock().await;
        let deleted = conn.execute("DELETE FROM whitelist WHERE address = ?1", params![address])?;
        Ok(deleted > 0)
    }

    pub async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT address, added_at, added_by FROM whitelist ORDER BY added_at")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WhitelistEntry {
                    address: row.get(0)?,
                    added_at: row.get(1)?,
                    added_by: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Preferences
    // ------------------------------------------------------------------

    pub async fn get_preferences(&self, address: &str) -> Result<serde_json::Value> {
        let address = normalize_address(address);
        let conn = self.lock().await;
        let raw = conn
            .prepare_cached("SELECT prefs FROM user_preferences WHERE user_address = ?1")?
            .query_row(params![address], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::json!({})))
    }

    /// Shallow-merge a patch into the stored preference map. Null values
    /// delete keys.
    pub async fn merge_preferences(
        &self,
        address: &str,
        patch: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut prefs = self.get_preferences(address).await?;
        if let (Some(map), Some(patch)) = (prefs.as_object_mut(), patch.as_object()) {
            for (k, v) in patch {
                if v.is_null() {
                    map.remove(k);
                } else {
                    map.insert(k.clone(), v.clone());
                }
            }
        }

        let address = normalize_address(address);
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO user_preferences (user_address, prefs, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(user_address) DO UPDATE SET
                prefs = excluded.prefs, updated_at = excluded.updated_at",
            params![address, serde_json::to_string(&prefs)?],
        )?;
        Ok(prefs)
    }

    // ------------------------------------------------------------------
    // Venue API credentials
    // ------------------------------------------------------------------

    pub async fn get_credentials(&self, address: &str) -> Result<Option<ApiCredentials>> {
        let address = normalize_address(address);
        let conn = self.lock().await;
        let creds = conn
            .prepare_cached(
                "SELECT api_key, api_secret, api_passphrase
                 FROM api_credentials WHERE user_address = ?1",
            )?
            .query_row(params![address], |row| {
                Ok(ApiCredentials {
                    api_key: row.get(0)?,
                    api_secret: row.get(1)?,
                    api_passphrase: row.get(2)?,
                })
            })
            .optional()?;
        Ok(creds)
    }

    /// Partial update: empty fields preserve the stored values so operators
    /// can rotate a single secret.
    pub async fn save_credentials(&self, address: &str, update: &ApiCredentials) -> Result<()> {
        let existing = self.get_credentials(address).await?.unwrap_or_default();
        let pick = |new: &str, old: String| {
            if new.trim().is_empty() {
                old
            } else {
                new.trim().to_string()
            }
        };
        let merged = ApiCredentials {
            api_key: pick(&update.api_key, existing.api_key),
            api_secret: pick(&update.api_secret, existing.api_secret),
            api_passphrase: pick(&update.api_passphrase, existing.api_passphrase),
        };

        let address = normalize_address(address);
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO api_credentials (user_address, api_key, api_secret, api_passphrase, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(user_address) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                api_passphrase = excluded.api_passphrase,
                updated_at = excluded.updated_at",
            params![address, merged.api_key, merged.api_secret, merged.api_passphrase],
        )?;
        Ok(())
    }

    pub async fn delete_credentials(&self, address: &str) -> Result<bool> {
        let address = normalize_address(address);
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM api_credentials WHERE user_address = ?1",
            params![address],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::Store;
    use tempfile::NamedTempFile;

    pub fn open_temp_store() -> (Store, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Store::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::open_temp_store;
    use super::*;

    #[tokio::test]
    async fn test_upsert_user_is_idempotent() {
        let (store, _f) = open_temp_store();

        let first = store.upsert_user("0xABCD", "user").await.unwrap();
        assert_eq!(first.address, "0xabcd");
        assert_eq!(first.role, "user");

        // Second login keeps the row and refreshes last_login.
        let second = store.upsert_user("0xabcd", "user").await.unwrap();
        assert_eq!(second.address, first.address);
        assert!(second.last_login.is_some());
    }

    #[tokio::test]
    async fn test_role_never_downgrades() {
        let (store, _f) = open_temp_store();

        store.upsert_user("0xo", "owner").await.unwrap();
        let again = store.upsert_user("0xo", "user").await.unwrap();
        assert_eq!(again.role, "owner");
    }

    #[tokio::test]
    async fn test_nonce_single_use() {
        let (store, _f) = open_temp_store();

        let nonce = store.create_nonce().await.unwrap();
        assert!(store
            .consume_nonce(&nonce, "0xa", "tok", "2099-01-01T00:00:00Z")
            .await
            .unwrap());
        // Replay is rejected.
        assert!(!store
            .consume_nonce(&nonce, "0xa", "tok", "2099-01-01T00:00:00Z")
            .await
            .unwrap());
        // Unknown nonce is rejected.
        assert!(!store
            .consume_nonce("deadbeef", "0xa", "tok", "2099-01-01T00:00:00Z")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_whitelist_owner_protected() {
        let (store, _f) = open_temp_store();

        assert!(store.add_whitelist("0xOwner", "system").await.unwrap());
        assert!(!store.add_whitelist("0xowner", "system").await.unwrap());
        assert!(store.is_whitelisted("0xOWNER").await.unwrap());

        let err = store
            .remove_whitelist("0xowner", Some("0xOwner"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("owner"));

        assert!(store.add_whitelist("0xfriend", "0xowner").await.unwrap());
        assert!(store
            .remove_whitelist("0xfriend", Some("0xowner"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_preferences_merge_and_delete_keys() {
        let (store, _f) = open_temp_store();

        let merged = store
            .merge_preferences("0xa", &serde_json::json!({"theme": "dark", "limit": 10}))
            .await
            .unwrap();
        assert_eq!(merged["theme"], "dark");

        let merged = store
            .merge_preferences("0xa", &serde_json::json!({"theme": null, "limit": 20}))
            .await
            .unwrap();
        assert!(merged.get("theme").is_none());
        assert_eq!(merged["limit"], 20);
    }

    #[tokio::test]
    async fn test_credentials_partial_update_preserves_fields() {
        let (store, _f) = open_temp_store();

        store
            .save_credentials(
                "0xa",
                &ApiCredentials {
                    api_key: "key1".into(),
                    api_secret: "sec1".into(),
                    api_passphrase: "pass1".into(),
                },
            )
            .await
            .unwrap();

        // Rotate only the secret; other fields must survive.
        store
            .save_credentials(
                "0xa",
                &ApiCredentials {
                    api_key: "".into(),
                    api_secret: "sec2".into(),
                    api_passphrase: "".into(),
                },
            )
            .await
            .unwrap();

        let creds = store.get_credentials("0xa").await.unwrap().unwrap();
        assert_eq!(creds.api_key, "key1");
        assert_eq!(creds.api_secret, "sec2");
        assert_eq!(creds.api_passphrase, "pass1");

        assert!(store.delete_credentials("0xa").await.unwrap());
        assert!(store.get_credentials("0xa").await.unwrap().is_none());
    }
}
