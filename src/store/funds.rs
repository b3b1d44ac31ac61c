//! Curated funds: allocations, investor shares, NAV history, fund trades.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{normalize_address, Store};

/// Active allocation weights must sum to 1.0 within this tolerance.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize)]
pub struct FundRecord {
    pub id: i64,
    pub owner_address: String,
    pub name: String,
    pub description: String,
    pub created_at: String,
    pub active: bool,
    pub total_aum: f64,
    pub nav_per_share: f64,
    pub total_shares: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundAllocationRecord {
    pub fund_id: i64,
    pub trader_address: String,
    pub weight: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundAllocationInput {
    pub trader_address: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundInvestmentRecord {
    pub id: i64,
    pub fund_id: i64,
    pub investor_address: String,
    pub amount_invested: f64,
    pub shares: f64,
    pub invested_at: String,
    pub status: String,
    pub fund_name: Option<String>,
    pub nav_per_share: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundPerformanceRecord {
    pub fund_id: i64,
    pub date: String,
    pub nav: f64,
    pub daily_return: f64,
    pub cumulative_return: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundTradeRecord {
    pub id: i64,
    pub fund_id: i64,
    pub trader_address: String,
    pub amount: f64,
    pub timestamp: String,
    pub token_id: Option<String>,
    pub side: Option<String>,
    pub market: Option<String>,
    pub status: Option<String>,
}

const FUND_COLUMNS: &str =
    "id, owner_address, name, description, created_at, active, total_aum, nav_per_share, total_shares";

fn map_fund(row: &rusqlite::Row<'_>) -> rusqlite::Result<FundRecord> {
    Ok(FundRecord {
        id: row.get(0)?,
        owner_address: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        total_aum: row.get(6)?,
        nav_per_share: row.get(7)?,
        total_shares: row.get(8)?,
    })
}

impl Store {
    pub async fn create_fund(
        &self,
        owner_address: &str,
        name: &str,
        description: &str,
    ) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            bail!("fund name is required");
        }
        if name.len() > 50 {
            bail!("fund name too long (max 50 chars)");
        }
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO funds (owner_address, name, description) VALUES (?1, ?2, ?3)",
            params![normalize_address(owner_address), name, description.trim()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_fund(&self, fund_id: i64) -> Result<Option<FundRecord>> {
        let conn = self.lock().await;
        let sql = format!("SELECT {FUND_COLUMNS} FROM funds WHERE id = ?1");
        let fund = conn
            .prepare_cached(&sql)?
            .query_row(params![fund_id], map_fund)
            .optional()?;
        Ok(fund)
    }

    pub async fn get_fund_by_name(&self, name: &str) -> Result<Option<FundRecord>> {
        let conn = self.lock().await;
        let sql = format!("SELECT {FUND_COLUMNS} FROM funds WHERE name = ?1");
        let fund = conn
            .prepare_cached(&sql)?
            .query_row(params![name], map_fund)
            .optional()?;
        Ok(fund)
    }

    pub async fn list_funds(&self, active_only: bool) -> Result<Vec<FundRecord>> {
        let conn = self.lock().await;
        let sql = if active_only {
            format!("SELECT {FUND_COLUMNS} FROM funds WHERE active = 1 ORDER BY created_at DESC")
        } else {
            format!("SELECT {FUND_COLUMNS} FROM funds ORDER BY created_at DESC")
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], map_fund)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Owner-scoped partial update of name/description/active.
    pub async fn update_fund(
        &self,
        fund_id: i64,
        owner_address: &str,
        name: Option<&str>,
        description: Option<&str>,
        active: Option<bool>,
    ) -> Result<bool> {
        let mut sets: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() || name.len() > 50 {
                bail!("invalid fund name");
            }
            sets.push("name = ?");
            args.push(Box::new(name.to_string()));
        }
        if let Some(description) = description {
            sets.push("description = ?");
            args.push(Box::new(description.trim().to_string()));
        }
        if let Some(active) = active {
            sets.push("active = ?");
            args.push(Box::new(active as i64));
        }
        if sets.is_empty() {
            return Ok(false);
        }
        args.push(Box::new(fund_id));
        args.push(Box::new(normalize_address(owner_address)));

        let sql = format!(
            "UPDATE funds SET {} WHERE id = ? AND owner_address = ?",
            sets.join(", ")
        );
        let conn = self.lock().await;
        let updated = conn.execute(
            &sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        )?;
        Ok(updated > 0)
    }

    /// Atomically replace a fund's allocation set. Rejects weight sets that
    /// do not sum to 1.0 within tolerance.
    pub async fn replace_allocations(
        &self,
        fund_id: i64,
        allocations: &[FundAllocationInput],
    ) -> Result<()> {
        if allocations.is_empty() {
            bail!("allocations list is required");
        }
        let total: f64 = allocations.iter().map(|a| a.weight).sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            bail!("weights must sum to 1.0 (got {total:.4})");
        }
        for alloc in allocations {
            if alloc.weight <= 0.0 {
                bail!("weight must be > 0 for {}", alloc.trader_address);
            }
        }

        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE fund_allocations SET active = 0 WHERE fund_id = ?1",
            params![fund_id],
        )?;
        for alloc in allocations {
            tx.execute(
                "INSERT INTO fund_allocations (fund_id, trader_address, weight, active)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(fund_id, trader_address)
                 DO UPDATE SET weight = excluded.weight, active = 1",
                params![fund_id, normalize_address(&alloc.trader_address), alloc.weight],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn list_allocations(&self, fund_id: i64) -> Result<Vec<FundAllocationRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT fund_id, trader_address, weight, active FROM fund_allocations
             WHERE fund_id = ?1 AND active = 1 ORDER BY weight DESC",
        )?;
        let rows = stmt
            .query_map(params![fund_id], |row| {
                Ok(FundAllocationRecord {
                    fund_id: row.get(0)?,
                    trader_address: row.get(1)?,
                    weight: row.get(2)?,
                    active: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Buy fund shares at the current NAV. Returns the investment row.
    pub async fn invest(
        &self,
        fund_id: i64,
        investor_address: &str,
        amount: f64,
    ) -> Result<FundInvestmentRecord> {
        if amount <= 0.0 {
            bail!("amount must be positive");
        }
        let investor = normalize_address(investor_address);

        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        let fund: Option<(f64,)> = tx
            .prepare_cached("SELECT nav_per_share FROM funds WHERE id = ?1 AND active = 1")?
            .query_row(params![fund_id], |row| Ok((row.get(0)?,)))
            .optional()?;
        let Some((nav,)) = fund else {
            bail!("fund not found or inactive");
        };
        let shares = amount / nav;

        tx.execute(
            "INSERT INTO fund_investments (fund_id, investor_address, amount_invested, shares)
             VALUES (?1, ?2, ?3, ?4)",
            params![fund_id, investor, amount, shares],
        )?;
        let investment_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE funds SET total_aum = total_aum + ?1, total_shares = total_shares + ?2
             WHERE id = ?3",
            params![amount, shares, fund_id],
        )?;

        let record = tx
            .prepare_cached(
                "SELECT id, fund_id, investor_address, amount_invested, shares, invested_at, status
                 FROM fund_investments WHERE id = ?1",
            )?
            .query_row(params![investment_id], |row| {
                Ok(FundInvestmentRecord {
                    id: row.get(0)?,
                    fund_id: row.get(1)?,
                    investor_address: row.get(2)?,
                    amount_invested: row.get(3)?,
                    shares: row.get(4)?,
                    invested_at: row.get(5)?,
                    status: row.get(6)?,
                    fund_name: None,
                    nav_per_share: None,
                })
            })?;
        tx.commit()?;
        Ok(record)
    }

    /// Redeem an active investment at the current NAV. Returns USD value.
    pub async fn withdraw(&self, investment_id: i64, investor_address: &str) -> Result<f64> {
        let investor = normalize_address(investor_address);
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        let investment: Option<(i64, f64)> = tx
            .prepare_cached(
                "SELECT fund_id, shares FROM fund_investments
                 WHERE id = ?1 AND investor_address = ?2 AND status = 'active'",
            )?
            .query_row(params![investment_id, investor], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        let Some((fund_id, shares)) = investment else {
            bail!("investment not found or already withdrawn");
        };

        let nav: f64 = tx
            .prepare_cached("SELECT nav_per_share FROM funds WHERE id = ?1")?
            .query_row(params![fund_id], |row| row.get(0))?;
        let amount = shares * nav;

        tx.execute(
            "UPDATE fund_investments SET status = 'withdrawn' WHERE id = ?1",
            params![investment_id],
        )?;
        tx.execute(
            "UPDATE funds SET total_aum = MAX(total_aum - ?1, 0),
             total_shares = MAX(total_shares - ?2, 0) WHERE id = ?3",
            params![amount, shares, fund_id],
        )?;

        tx.commit()?;
        Ok(amount)
    }

    pub async fn investor_investments(
        &self,
        investor_address: &str,
    ) -> Result<Vec<FundInvestmentRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT fi.id, fi.fund_id, fi.investor_address, fi.amount_invested, fi.shares,
                    fi.invested_at, fi.status, f.name, f.nav_per_share
             FROM fund_investments fi JOIN funds f ON fi.fund_id = f.id
             WHERE fi.investor_address = ?1 ORDER BY fi.invested_at DESC",
        )?;
        let rows = stmt
            .query_map(params![normalize_address(investor_address)], |row| {
                Ok(FundInvestmentRecord {
                    id: row.get(0)?,
                    fund_id: row.get(1)?,
                    investor_address: row.get(2)?,
                    amount_invested: row.get(3)?,
                    shares: row.get(4)?,
                    invested_at: row.get(5)?,
                    status: row.get(6)?,
                    fund_name: row.get(7)?,
                    nav_per_share: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Upsert one performance row per fund per UTC day, and sync the fund's
    /// live NAV to the recorded value.
    pub async fn record_performance(
        &self,
        fund_id: i64,
        nav: f64,
        daily_return: f64,
        cumulative_return: f64,
    ) -> Result<()> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO fund_performance (fund_id, date, nav, daily_return, cumulative_return)
             VALUES (?1, date('now'), ?2, ?3, ?4)
             ON CONFLICT(fund_id, date) DO UPDATE SET
                nav = excluded.nav,
                daily_return = excluded.daily_return,
                cumulative_return = excluded.cumulative_return",
            params![fund_id, nav, daily_return, cumulative_return],
        )?;
        tx.execute(
            "UPDATE funds SET nav_per_share = ?1 WHERE id = ?2",
            params![nav, fund_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn fund_performance(
        &self,
        fund_id: i64,
        days: i64,
    ) -> Result<Vec<FundPerformanceRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT fund_id, date, nav, daily_return, cumulative_return
             FROM fund_performance WHERE fund_id = ?1 AND date >= date('now', ?2)
             ORDER BY date ASC",
        )?;
        let rows = stmt
            .query_map(params![fund_id, format!("-{days} days")], |row| {
                Ok(FundPerformanceRecord {
                    fund_id: row.get(0)?,
                    date: row.get(1)?,
                    nav: row.get(2)?,
                    daily_return: row.get(3)?,
                    cumulative_return: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Link a trade row to the fund that produced it.
    pub async fn record_fund_trade(
        &self,
        fund_id: i64,
        trade_id: i64,
        trader_address: &str,
        amount: f64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO fund_trades (fund_id, trade_id, trader_address, amount)
             VALUES (?1, ?2, ?3, ?4)",
            params![fund_id, trade_id, normalize_address(trader_address), amount],
        )?;
        Ok(())
    }

    pub async fn fund_trades(&self, fund_id: i64, limit: usize) -> Result<Vec<FundTradeRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ft.id, ft.fund_id, ft.trader_address, ft.amount, ft.timestamp,
                    t.token_id, t.side, t.market, t.status
             FROM fund_trades ft LEFT JOIN trades t ON ft.trade_id = t.id
             WHERE ft.fund_id = ?1 ORDER BY ft.timestamp DESC, ft.id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![fund_id, limit], |row| {
                Ok(FundTradeRecord {
                    id: row.get(0)?,
                    fund_id: row.get(1)?,
                    trader_address: row.get(2)?,
                    amount: row.get(3)?,
                    timestamp: row.get(4)?,
                    token_id: row.get(5)?,
                    side: row.get(6)?,
                    market: row.get(7)?,
                    status: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_temp_store;
    use super::*;

    fn alloc(addr: &str, weight: f64) -> FundAllocationInput {
        FundAllocationInput {
            trader_address: addr.to_string(),
            weight,
        }
    }

    #[tokio::test]
    async fn test_allocation_weight_sum_bounds() {
        let (store, _f) = open_temp_store();
        let fund_id = store.create_fund("0xowner", "Alpha", "").await.unwrap();

        // Sum 1.01 is inside tolerance.
        store
            .replace_allocations(fund_id, &[alloc("0xa", 0.51), alloc("0xb", 0.50)])
            .await
            .unwrap();

        // Sum 1.02 is rejected.
        let err = store
            .replace_allocations(fund_id, &[alloc("0xa", 0.52), alloc("0xb", 0.50)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));

        // The earlier allocation set survives a rejected replacement.
        let allocs = store.list_allocations(fund_id).await.unwrap();
        assert_eq!(allocs.len(), 2);
        let total: f64 = allocs.iter().map(|a| a.weight).sum();
        assert!((total - 1.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_replace_allocations_deactivates_dropped_traders() {
        let (store, _f) = open_temp_store();
        let fund_id = store.create_fund("0xowner", "Alpha", "").await.unwrap();

        store
            .replace_allocations(fund_id, &[alloc("0xa", 0.5), alloc("0xb", 0.5)])
            .await
            .unwrap();
        store
            .replace_allocations(fund_id, &[alloc("0xa", 1.0)])
            .await
            .unwrap();

        let allocs = store.list_allocations(fund_id).await.unwrap();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].trader_address, "0xa");
    }

    #[tokio::test]
    async fn test_invest_then_withdraw_roundtrip() {
        let (store, _f) = open_temp_store();
        let fund_id = store.create_fund("0xowner", "Alpha", "").await.unwrap();

        let investment = store.invest(fund_id, "0xinv", 250.0).await.unwrap();
        assert!((investment.shares - 250.0).abs() < 1e-9); // NAV starts at 1.0

        let fund = store.get_fund(fund_id).await.unwrap().unwrap();
        assert!((fund.total_aum - 250.0).abs() < 1e-9);
        assert!((fund.total_shares - 250.0).abs() < 1e-9);

        // With no NAV change, withdrawal returns exactly the invested amount.
        let amount = store.withdraw(investment.id, "0xinv").await.unwrap();
        assert!((amount - 250.0).abs() < 1e-9);

        let fund = store.get_fund(fund_id).await.unwrap().unwrap();
        assert!(fund.total_aum.abs() < 1e-9);
        assert!(fund.total_shares.abs() < 1e-9);

        // Double withdrawal is rejected.
        assert!(store.withdraw(investment.id, "0xinv").await.is_err());
    }

    #[tokio::test]
    async fn test_invest_requires_active_fund() {
        let (store, _f) = open_temp_store();
        let fund_id = store.create_fund("0xowner", "Alpha", "").await.unwrap();
        store
            .update_fund(fund_id, "0xowner", None, None, Some(false))
            .await
            .unwrap();

        assert!(store.invest(fund_id, "0xinv", 10.0).await.is_err());
    }

    #[tokio::test]
    async fn test_performance_upserts_per_day() {
        let (store, _f) = open_temp_store();
        let fund_id = store.create_fund("0xowner", "Alpha", "").await.unwrap();

        store.record_performance(fund_id, 1.05, 5.0, 5.0).await.unwrap();
        store.record_performance(fund_id, 1.10, 4.76, 10.0).await.unwrap();

        let perf = store.fund_performance(fund_id, 7).await.unwrap();
        assert_eq!(perf.len(), 1);
        assert!((perf[0].nav - 1.10).abs() < 1e-9);

        let fund = store.get_fund(fund_id).await.unwrap().unwrap();
        assert!((fund.nav_per_share - 1.10).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fund_name_validation() {
        let (store, _f) = open_temp_store();
        assert!(store.create_fund("0xo", "", "").await.is_err());
        assert!(store.create_fund("0xo", &"x".repeat(51), "").await.is_err());
    }
}
