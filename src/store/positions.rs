//! Open-position state and the trade→position delta rule.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::models::{PositionSide, Side};

use super::{normalize_address, Store};

/// A position is closed once its share count drops below this epsilon.
const CLOSE_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Serialize)]
pub struct PositionRecord {
    pub id: i64,
    pub user_address: String,
    pub token_id: String,
    pub market: Option<String>,
    pub side: String,
    pub size: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub cost_basis: f64,
    pub strategy: Option<String>,
    pub copied_from: Option<String>,
    pub opened_at: String,
    pub last_updated: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsSummary {
    pub open_count: i64,
    pub total_value: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceUpdate {
    pub id: i64,
    pub price: f64,
}

const POSITION_COLUMNS: &str = "id, user_address, token_id, market, side, size, avg_entry_price, \
                                current_price, unrealized_pnl, cost_basis, strategy, copied_from, \
                                opened_at, last_updated, status";

fn map_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRecord> {
    Ok(PositionRecord {
        id: row.get(0)?,
        user_address: row.get(1)?,
        token_id: row.get(2)?,
        market: row.get(3)?,
        side: row.get(4)?,
        size: row.get(5)?,
        avg_entry_price: row.get(6)?,
        current_price: row.get(7)?,
        unrealized_pnl: row.get(8)?,
        cost_basis: row.get(9)?,
        strategy: row.get(10)?,
        copied_from: row.get(11)?,
        opened_at: row.get(12)?,
        last_updated: row.get(13)?,
        status: row.get(14)?,
    })
}

fn unrealized(side: PositionSide, avg: f64, current: f64, size: f64) -> f64 {
    let pnl = match side {
        PositionSide::Long => (current - avg) * size,
        PositionSide::Short => (avg - current) * size,
    };
    (pnl * 100.0).round() / 100.0
}

impl Store {
    /// Apply an executed trade to position state.
    ///
    /// BUY adds to (or opens) the LONG side and reduces the SHORT side;
    /// SELL is symmetric. Reducing keeps the average entry price and scales
    /// cost basis; a position whose size falls below epsilon is closed.
    /// Only call for trades with price > 0.
    pub async fn upsert_position(
        &self,
        user_address: &str,
        token_id: &str,
        market: &str,
        side: Side,
        trade_amount: f64,
        trade_price: f64,
        strategy: &str,
        copied_from: Option<&str>,
    ) -> Result<i64> {
        let user = normalize_address(user_address);
        let pos_side = PositionSide::from_trade_side(side);

        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        // BUY reduces an open SHORT before opening a LONG, and vice versa.
        let opposite = match pos_side {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        };
        let reduce_target: Option<(i64, f64, f64, f64)> = tx
            .prepare_cached(
                "SELECT id, size, cost_basis, avg_entry_price FROM positions
                 WHERE user_address = ?1 AND token_id = ?2 AND side = ?3 AND status = 'open'",
            )?
            .query_row(params![user, token_id, opposite.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .optional()?;

        let id = if let Some((id, old_size, old_cost, old_avg)) = reduce_target {
            // Reducing: shrink size, scale cost basis, keep avg entry.
            let reduce = if trade_price > 0.0 {
                trade_amount / trade_price
            } else {
                trade_amount
            };
            let new_size = (old_size - reduce).max(0.0);
            let new_cost = if old_size > 0.0 {
                old_cost * (new_size / old_size)
            } else {
                0.0
            };

            if new_size < CLOSE_EPSILON {
                tx.execute(
                    "UPDATE positions SET size = 0, cost_basis = 0, status = 'closed',
                     last_updated = datetime('now') WHERE id = ?1",
                    params![id],
                )?;
            } else {
                tx.execute(
                    "UPDATE positions SET size = ?1, cost_basis = ?2, avg_entry_price = ?3,
                     last_updated = datetime('now') WHERE id = ?4",
                    params![new_size, new_cost, old_avg, id],
                )?;
            }
            id
        } else {
            let existing: Option<(i64, f64, f64)> = tx
                .prepare_cached(
                    "SELECT id, size, cost_basis FROM positions
                     WHERE user_address = ?1 AND token_id = ?2 AND side = ?3 AND status = 'open'",
                )?
                .query_row(params![user, token_id, pos_side.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()?;

            if let Some((id, old_size, old_cost)) = existing {
                // Adding to the same side: recompute the weighted average.
                let added = if trade_price > 0.0 {
                    trade_amount / trade_price
                } else {
                    trade_amount
                };
                let new_size = old_size + added;
                let new_cost = old_cost + trade_amount;
                let new_avg = if new_size > 0.0 { new_cost / new_size } else { 0.0 };
                tx.execute(
                    "UPDATE positions SET size = ?1, avg_entry_price = ?2, cost_basis = ?3,
                     market = COALESCE(NULLIF(?4, ''), market),
                     strategy = COALESCE(NULLIF(?5, ''), strategy),
                     last_updated = datetime('now') WHERE id = ?6",
                    params![new_size, new_avg, new_cost, market, strategy, id],
                )?;
                id
            } else {
                let size = if trade_price > 0.0 {
                    trade_amount / trade_price
                } else {
                    trade_amount
                };
                tx.execute(
                    "INSERT INTO positions
                     (user_address, token_id, market, side, size, avg_entry_price,
                      current_price, cost_basis, strategy, copied_from)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        user,
                        token_id,
                        market,
                        pos_side.as_str(),
                        size,
                        trade_price,
                        trade_price,
                        trade_amount,
                        strategy,
                        copied_from.map(normalize_address),
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.commit()?;
        Ok(id)
    }

    /// Open positions, all users when `user_address` is None (the global
    /// price tracker path).
    pub async fn list_open_positions(
        &self,
        user_address: Option<&str>,
    ) -> Result<Vec<PositionRecord>> {
        let conn = self.lock().await;
        let rows = if let Some(user) = user_address {
            let sql = format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE user_address = ?1 AND status = 'open' ORDER BY unrealized_pnl DESC"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let result = stmt
                .query_map(params![normalize_address(user)], map_position)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result
        } else {
            let sql = format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE status = 'open' ORDER BY unrealized_pnl DESC"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let result = stmt
                .query_map([], map_position)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result
        };
        Ok(rows)
    }

    pub async fn list_closed_positions(
        &self,
        user_address: &str,
        days: i64,
    ) -> Result<Vec<PositionRecord>> {
        let conn = self.lock().await;
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE user_address = ?1 AND status = 'closed'
               AND last_updated >= datetime('now', ?2)
             ORDER BY last_updated DESC LIMIT 50"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![normalize_address(user_address), format!("-{days} days")],
                map_position,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn positions_summary(&self, user_address: &str) -> Result<PositionsSummary> {
        let conn = self.lock().await;
        let summary = conn
            .prepare_cached(
                "SELECT COUNT(*),
                        COALESCE(SUM(size * current_price), 0),
                        COALESCE(SUM(unrealized_pnl), 0)
                 FROM positions WHERE user_address = ?1 AND status = 'open'",
            )?
            .query_row(params![normalize_address(user_address)], |row| {
                Ok(PositionsSummary {
                    open_count: row.get(0)?,
                    total_value: row.get(1)?,
                    unrealized_pnl: row.get(2)?,
                })
            })?;
        Ok(summary)
    }

    pub async fn close_position(&self, position_id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE positions SET status = 'closed', size = 0,
             last_updated = datetime('now') WHERE id = ?1",
            params![position_id],
        )?;
        Ok(())
    }

    /// Apply a batch of live prices in one transaction, recomputing
    /// unrealized P&L per position.
    pub async fn batch_update_prices(&self, updates: &[PriceUpdate]) -> Result<usize> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let mut applied = 0;

        for update in updates {
            let pos: Option<(String, f64, f64)> = tx
                .prepare_cached(
                    "SELECT side, avg_entry_price, size FROM positions
                     WHERE id = ?1 AND status = 'open'",
                )?
                .query_row(params![update.id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()?;

            let Some((side, avg, size)) = pos else {
                continue;
            };
            let side = if side == "SHORT" {
                PositionSide::Short
            } else {
                PositionSide::Long
            };
            let pnl = unrealized(side, avg, update.price, size);
            tx.execute(
                "UPDATE positions SET current_price = ?1, unrealized_pnl = ?2,
                 last_updated = datetime('now') WHERE id = ?3",
                params![update.price, pnl, update.id],
            )?;
            applied += 1;
        }

        tx.commit()?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_temp_store;
    use super::*;

    async fn open_long(store: &Store, amount: f64, price: f64) -> i64 {
        store
            .upsert_position("0xu", "0xtok", "Test", Side::Buy, amount, price, "copy", None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_then_add_recomputes_average() {
        let (store, _f) = open_temp_store();

        open_long(&store, 42.0, 0.42).await;
        let positions = store.list_open_positions(Some("0xu")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].size - 100.0).abs() < 1e-9);
        assert!((positions[0].avg_entry_price - 0.42).abs() < 1e-9);

        // Second buy at a higher price moves the average.
        open_long(&store, 50.0, 0.50).await;
        let positions = store.list_open_positions(Some("0xu")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].size - 200.0).abs() < 1e-9);
        assert!((positions[0].cost_basis - 92.0).abs() < 1e-9);
        assert!((positions[0].avg_entry_price - 0.46).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sell_reduces_long_and_keeps_avg() {
        let (store, _f) = open_temp_store();

        open_long(&store, 42.0, 0.42).await;
        store
            .upsert_position("0xu", "0xtok", "Test", Side::Sell, 21.0, 0.42, "copy", None)
            .await
            .unwrap();

        let positions = store.list_open_positions(Some("0xu")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].size - 50.0).abs() < 1e-9);
        assert!((positions[0].cost_basis - 21.0).abs() < 1e-9);
        assert!((positions[0].avg_entry_price - 0.42).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_net_zero_sequence_closes_position() {
        let (store, _f) = open_temp_store();

        // Applying trades whose net is zero must end closed regardless of order.
        open_long(&store, 42.0, 0.42).await;
        open_long(&store, 21.0, 0.42).await;
        store
            .upsert_position("0xu", "0xtok", "Test", Side::Sell, 63.0, 0.42, "copy", None)
            .await
            .unwrap();

        assert!(store.list_open_positions(Some("0xu")).await.unwrap().is_empty());
        let closed = store.list_closed_positions("0xu", 30).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].size, 0.0);
        assert_eq!(closed[0].cost_basis, 0.0);
    }

    #[tokio::test]
    async fn test_sell_without_long_opens_short() {
        let (store, _f) = open_temp_store();

        store
            .upsert_position("0xu", "0xtok", "Test", Side::Sell, 30.0, 0.60, "copy", None)
            .await
            .unwrap();
        let positions = store.list_open_positions(Some("0xu")).await.unwrap();
        assert_eq!(positions[0].side, "SHORT");
        assert!((positions[0].size - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_batch_update_prices_recomputes_pnl() {
        let (store, _f) = open_temp_store();

        let id = open_long(&store, 42.0, 0.42).await;
        store
            .batch_update_prices(&[PriceUpdate { id, price: 0.50 }])
            .await
            .unwrap();

        let positions = store.list_open_positions(Some("0xu")).await.unwrap();
        assert!((positions[0].current_price - 0.50).abs() < 1e-9);
        // (0.50 - 0.42) * 100 shares
        assert!((positions[0].unrealized_pnl - 8.0).abs() < 1e-9);

        // Closed positions are skipped.
        store.close_position(id).await.unwrap();
        let applied = store
            .batch_update_prices(&[PriceUpdate { id, price: 0.99 }])
            .await
            .unwrap();
        assert_eq!(applied, 0);
    }

    #[tokio::test]
    async fn test_short_pnl_sign() {
        let (store, _f) = open_temp_store();

        let id = store
            .upsert_position("0xu", "0xtok", "Test", Side::Sell, 30.0, 0.60, "copy", None)
            .await
            .unwrap();
        store
            .batch_update_prices(&[PriceUpdate { id, price: 0.40 }])
            .await
            .unwrap();

        let positions = store.list_open_positions(Some("0xu")).await.unwrap();
        // Short gains when price falls: (0.60 - 0.40) * 50 shares.
        assert!((positions[0].unrealized_pnl - 10.0).abs() < 1e-9);
    }
}
