//! Trade history, daily budgets, and the dedup ledger.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::models::{Side, Strategy, TradeStatus};

use super::{normalize_address, Store};

#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: i64,
    pub timestamp: String,
    pub user_address: String,
    pub strategy: String,
    pub market: Option<String>,
    pub token_id: String,
    pub side: String,
    pub amount: f64,
    pub price: Option<f64>,
    pub expected_profit: Option<f64>,
    pub copied_from: Option<String>,
    pub original_trade_id: Option<String>,
    pub status: String,
    pub notes: Option<String>,
}

/// Parameters for one appended trade row.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub user_address: String,
    pub strategy: Strategy,
    pub token_id: String,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub market: String,
    pub expected_profit: f64,
    pub copied_from: Option<String>,
    pub original_trade_id: Option<String>,
    pub status: TradeStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub strategy: Option<Strategy>,
    pub user_address: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlPoint {
    pub date: String,
    pub trades: i64,
    pub spent: f64,
    pub profit: f64,
    pub cumulative_profit: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub total_trades: i64,
    pub total_spent: f64,
    pub total_executed: f64,
    pub total_expected_profit: f64,
    pub failed_trades: i64,
    pub unique_traders_copied: i64,
}

const TRADE_COLUMNS: &str = "id, timestamp, user_address, strategy, market, token_id, side, \
                             amount, price, expected_profit, copied_from, original_trade_id, \
                             status, notes";

fn map_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    Ok(TradeRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        user_address: row.get(2)?,
        strategy: row.get(3)?,
        market: row.get(4)?,
        token_id: row.get(5)?,
        side: row.get(6)?,
        amount: row.get(7)?,
        price: row.get(8)?,
        expected_profit: row.get(9)?,
        copied_from: row.get(10)?,
        original_trade_id: row.get(11)?,
        status: row.get(12)?,
        notes: row.get(13)?,
    })
}

impl Store {
    pub async fn record_trade(&self, trade: &NewTrade) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO trades
             (user_address, strategy, market, token_id, side, amount, price, expected_profit,
              copied_from, original_trade_id, status, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                normalize_address(&trade.user_address),
                trade.strategy.as_str(),
                trade.market,
                trade.token_id,
                trade.side.as_str(),
                trade.amount,
                trade.price,
                trade.expected_profit,
                trade.copied_from.as_deref().map(normalize_address),
                trade.original_trade_id,
                trade.status.as_str(),
                trade.notes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_trades(&self, filter: &TradeFilter) -> Result<Vec<TradeRecord>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

        if let Some(strategy) = filter.strategy {
            conditions.push("strategy = ?".into());
            args.push(Box::new(strategy.as_str().to_string()));
        }
        if let Some(user) = &filter.user_address {
            conditions.push("user_address = ?".into());
            args.push(Box::new(normalize_address(user)));
        }
        if let Some(status) = &filter.status {
            conditions.push("status = ?".into());
            args.push(Box::new(status.clone()));
        }
        if let Some(search) = &filter.search {
            conditions.push("(market LIKE ? OR token_id LIKE ? OR copied_from LIKE ?)".into());
            let like = format!("%{}%", search);
            args.push(Box::new(like.clone()));
            args.push(Box::new(like.clone()));
            args.push(Box::new(like));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit = if filter.limit == 0 { 50 } else { filter.limit.min(1000) };
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades {where_clause}
             ORDER BY timestamp DESC, id DESC LIMIT {limit} OFFSET {offset}",
            offset = filter.offset,
        );

        let conn = self.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), map_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Total executed spend for a user+strategy over the current UTC day,
    /// optionally scoped to one followed trader.
    pub async fn daily_executed_spend(
        &self,
        user_address: &str,
        strategy: Strategy,
        trader: Option<&str>,
    ) -> Result<f64> {
        let user = normalize_address(user_address);
        let conn = self.lock().await;
        let total: f64 = if let Some(trader) = trader {
            conn.prepare_cached(
                "SELECT COALESCE(SUM(amount), 0) FROM trades
                 WHERE user_address = ?1 AND strategy = ?2 AND status = 'executed'
                   AND copied_from = ?3 AND date(timestamp) = date('now')",
            )?
            .query_row(params![user, strategy.as_str(), normalize_address(trader)], |row| {
                row.get(0)
            })?
        } else {
            conn.prepare_cached(
                "SELECT COALESCE(SUM(amount), 0) FROM trades
                 WHERE user_address = ?1 AND strategy = ?2 AND status = 'executed'
                   AND date(timestamp) = date('now')",
            )?
            .query_row(params![user, strategy.as_str()], |row| row.get(0))?
        };
        Ok(total)
    }

    /// One row per UTC day with cumulative expected profit over the window.
    pub async fn pnl_series(
        &self,
        user_address: &str,
        strategy: Option<Strategy>,
        days: i64,
    ) -> Result<Vec<PnlPoint>> {
        let user = normalize_address(user_address);
        let days = days.clamp(1, 3650);
        let conn = self.lock().await;

        let mut conditions = vec![
            "status IN ('executed', 'dry_run')".to_string(),
            "user_address = ?1".to_string(),
            format!("date(timestamp) >= date('now', '-{days} days')"),
        ];
        let mut args: Vec<Box<dyn rusqlite::ToSql + Send>> = vec![Box::new(user)];
        if let Some(strategy) = strategy {
            conditions.push("strategy = ?2".into());
            args.push(Box::new(strategy.as_str().to_string()));
        }

        let sql = format!(
            "SELECT date(timestamp) AS day, COUNT(*),
                    COALESCE(SUM(amount), 0), COALESCE(SUM(expected_profit), 0)
             FROM trades WHERE {}
             GROUP BY date(timestamp) ORDER BY date(timestamp) ASC",
            conditions.join(" AND ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut cumulative = 0.0;
        let series = raw
            .into_iter()
            .map(|(date, trades, spent, profit)| {
                cumulative += profit;
                PnlPoint {
                    date,
                    trades,
                    spent: (spent * 100.0).round() / 100.0,
                    profit: (profit * 100.0).round() / 100.0,
                    cumulative_profit: (cumulative * 100.0).round() / 100.0,
                }
            })
            .collect();
        Ok(series)
    }

    pub async fn strategy_stats(
        &self,
        user_address: &str,
        strategy: Strategy,
    ) -> Result<StrategyStats> {
        let user = normalize_address(user_address);
        let conn = self.lock().await;
        let stats = conn
            .prepare_cached(
                "SELECT COUNT(*),
                        COALESCE(SUM(amount), 0),
                        COALESCE(SUM(CASE WHEN status = 'executed' THEN amount ELSE 0 END), 0),
                        COALESCE(SUM(expected_profit), 0),
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                        COUNT(DISTINCT copied_from)
                 FROM trades WHERE user_address = ?1 AND strategy = ?2",
            )?
            .query_row(params![user, strategy.as_str()], |row| {
                Ok(StrategyStats {
                    total_trades: row.get(0)?,
                    total_spent: row.get(1)?,
                    total_executed: row.get(2)?,
                    total_expected_profit: row.get(3)?,
                    failed_trades: row.get(4)?,
                    unique_traders_copied: row.get(5)?,
                })
            })?;
        Ok(stats)
    }

    /// Number of trade rows a user recorded against one upstream fingerprint.
    /// Used by the duplicate-execution invariant checks.
    pub async fn count_trades_for_fingerprint(
        &self,
        user_address: &str,
        fingerprint: &str,
    ) -> Result<i64> {
        let conn = self.lock().await;
        let count = conn
            .prepare_cached(
                "SELECT COUNT(*) FROM trades
                 WHERE user_address = ?1 AND original_trade_id = ?2",
            )?
            .query_row(params![normalize_address(user_address), fingerprint], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Dedup ledger
    // ------------------------------------------------------------------

    /// Idempotent: re-marking an already-seen fingerprint is a no-op.
    pub async fn mark_seen(&self, fingerprint: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO seen_trade_ids (trade_id) VALUES (?1)",
            params![fingerprint],
        )?;
        Ok(())
    }

    pub async fn is_seen(&self, fingerprint: &str) -> Result<bool> {
        let conn = self.lock().await;
        let found = conn
            .prepare_cached("SELECT 1 FROM seen_trade_ids WHERE trade_id = ?1")?
            .query_row(params![fingerprint], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Drop dedup entries older than `days` days. Returns the number expired.
    pub async fn expire_seen(&self, days: i64) -> Result<usize> {
        let conn = self.lock().await;
        let deleted = conn.execute(
            "DELETE FROM seen_trade_ids WHERE first_seen < datetime('now', ?1)",
            params![format!("-{days} days")],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_temp_store;
    use super::*;

    fn sample_trade(user: &str, amount: f64, status: TradeStatus) -> NewTrade {
        NewTrade {
            user_address: user.to_string(),
            strategy: Strategy::Copy,
            token_id: "0xtok".to_string(),
            side: Side::Buy,
            amount,
            price: 0.42,
            market: "Test market".to_string(),
            expected_profit: 0.0,
            copied_from: Some("0xtrader".to_string()),
            original_trade_id: Some("fp-1".to_string()),
            status,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_mark_seen_is_idempotent() {
        let (store, _f) = open_temp_store();

        store.mark_seen("abc").await.unwrap();
        store.mark_seen("abc").await.unwrap();
        assert!(store.is_seen("abc").await.unwrap());

        let conn = store.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM seen_trade_ids", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_expire_seen_keeps_fresh_entries() {
        let (store, _f) = open_temp_store();

        store.mark_seen("fresh").await.unwrap();
        {
            let conn = store.lock().await;
            conn.execute(
                "INSERT INTO seen_trade_ids (trade_id, first_seen)
                 VALUES ('stale', datetime('now', '-10 days'))",
                [],
            )
            .unwrap();
        }

        let expired = store.expire_seen(7).await.unwrap();
        assert_eq!(expired, 1);
        assert!(store.is_seen("fresh").await.unwrap());
        assert!(!store.is_seen("stale").await.unwrap());
    }

    #[tokio::test]
    async fn test_daily_spend_counts_only_executed() {
        let (store, _f) = open_temp_store();

        store
            .record_trade(&sample_trade("0xu", 10.0, TradeStatus::Executed))
            .await
            .unwrap();
        store
            .record_trade(&sample_trade("0xu", 25.0, TradeStatus::Executed))
            .await
            .unwrap();
        store
            .record_trade(&sample_trade("0xu", 99.0, TradeStatus::Failed))
            .await
            .unwrap();
        store
            .record_trade(&sample_trade("0xother", 7.0, TradeStatus::Executed))
            .await
            .unwrap();

        let spend = store
            .daily_executed_spend("0xu", Strategy::Copy, None)
            .await
            .unwrap();
        assert!((spend - 35.0).abs() < 1e-9);

        let per_trader = store
            .daily_executed_spend("0xu", Strategy::Copy, Some("0xTRADER"))
            .await
            .unwrap();
        assert!((per_trader - 35.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_list_trades_filters_and_search() {
        let (store, _f) = open_temp_store();

        let mut t = sample_trade("0xu", 10.0, TradeStatus::Executed);
        t.market = "Will it rain tomorrow?".to_string();
        store.record_trade(&t).await.unwrap();

        let mut t2 = sample_trade("0xu", 12.0, TradeStatus::Failed);
        t2.market = "Election winner".to_string();
        store.record_trade(&t2).await.unwrap();

        let all = store
            .list_trades(&TradeFilter {
                user_address: Some("0xU".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let rain = store
            .list_trades(&TradeFilter {
                user_address: Some("0xu".to_string()),
                search: Some("rain".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rain.len(), 1);
        assert_eq!(rain[0].market.as_deref(), Some("Will it rain tomorrow?"));

        let failed = store
            .list_trades(&TradeFilter {
                status: Some("failed".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_pnl_series_accumulates() {
        let (store, _f) = open_temp_store();

        let mut t = sample_trade("0xu", 10.0, TradeStatus::Executed);
        t.strategy = Strategy::Arbitrage;
        t.expected_profit = 1.5;
        store.record_trade(&t).await.unwrap();
        store.record_trade(&t).await.unwrap();

        let series = store
            .pnl_series("0xu", Some(Strategy::Arbitrage), 30)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].trades, 2);
        assert!((series[0].cumulative_profit - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stats_track_failures() {
        let (store, _f) = open_temp_store();

        store
            .record_trade(&sample_trade("0xu", 10.0, TradeStatus::Executed))
            .await
            .unwrap();
        store
            .record_trade(&sample_trade("0xu", 5.0, TradeStatus::Failed))
            .await
            .unwrap();

        let stats = store.strategy_stats("0xu", Strategy::Copy).await.unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.failed_trades, 1);
        assert!((stats.total_executed - 10.0).abs() < 1e-9);
    }
}
