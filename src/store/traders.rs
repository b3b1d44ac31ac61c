//! Followed-trader relations, per-trader overrides, and copy counters.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::models::OrderMode;

use super::{normalize_address, Store};

/// A wallet a user follows, with optional per-trader sizing overrides.
/// Null overrides fall back to the user-level defaults.
#[derive(Debug, Clone, Serialize)]
pub struct FollowedTraderRecord {
    pub user_address: String,
    pub address: String,
    pub alias: Option<String>,
    pub added_at: String,
    pub active: bool,
    pub total_copied: i64,
    pub total_spent: f64,
    pub copy_percentage: Option<f64>,
    pub min_copy_size: Option<f64>,
    pub max_copy_size: Option<f64>,
    pub max_daily_spend: Option<f64>,
    pub order_mode: Option<OrderMode>,
    pub limit_order_pct: Option<f64>,
}

/// Partial update of per-trader settings. `Some(None)` clears an override
/// back to the user default; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct TraderOverridePatch {
    pub alias: Option<String>,
    pub active: Option<bool>,
    pub copy_percentage: Option<Option<f64>>,
    pub min_copy_size: Option<Option<f64>>,
    pub max_copy_size: Option<Option<f64>>,
    pub max_daily_spend: Option<Option<f64>>,
    pub order_mode: Option<Option<OrderMode>>,
    pub limit_order_pct: Option<Option<f64>>,
}

impl TraderOverridePatch {
    pub fn is_empty(&self) -> bool {
        self.alias.is_none()
            && self.active.is_none()
            && self.copy_percentage.is_none()
            && self.min_copy_size.is_none()
            && self.max_copy_size.is_none()
            && self.max_daily_spend.is_none()
            && self.order_mode.is_none()
            && self.limit_order_pct.is_none()
    }
}

const TRADER_COLUMNS: &str = "user_address, address, alias, added_at, active, total_copied, \
                              total_spent, copy_percentage, min_copy_size, max_copy_size, \
                              max_daily_spend, order_mode, limit_order_pct";

fn map_trader(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowedTraderRecord> {
    let mode: Option<String> = row.get(11)?;
    Ok(FollowedTraderRecord {
        user_address: row.get(0)?,
        address: row.get(1)?,
        alias: row.get(2)?,
        added_at: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        total_copied: row.get(5)?,
        total_spent: row.get(6)?,
        copy_percentage: row.get(7)?,
        min_copy_size: row.get(8)?,
        max_copy_size: row.get(9)?,
        max_daily_spend: row.get(10)?,
        order_mode: mode.as_deref().and_then(OrderMode::parse),
        limit_order_pct: row.get(12)?,
    })
}

impl Store {
    /// Follow a trader. Reactivates a soft-deleted follow (counters survive).
    /// Returns false when the follow already exists and is active.
    pub async fn add_follow(&self, user_address: &str, address: &str, alias: &str) -> Result<bool> {
        let user = normalize_address(user_address);
        let address = normalize_address(address);
        let conn = self.lock().await;

        let active: Option<i64> = conn
            .prepare_cached(
                "SELECT active FROM followed_traders WHERE user_address = ?1 AND address = ?2",
            )?
            .query_row(params![user, address], |row| row.get(0))
            .optional()?;

        match active {
            Some(1) => Ok(false),
            Some(_) => {
                conn.execute(
                    "UPDATE followed_traders SET active = 1, alias = ?3
                     WHERE user_address = ?1 AND address = ?2",
                    params![user, address, alias],
                )?;
                Ok(true)
            }
            None => {
                conn.execute(
                    "INSERT INTO followed_traders (user_address, address, alias)
                     VALUES (?1, ?2, ?3)",
                    params![user, address, alias],
                )?;
                Ok(true)
            }
        }
    }

    /// Soft delete: sets active=0 so counters and overrides survive.
    pub async fn remove_follow(&self, user_address: &str, address: &str) -> Result<bool> {
        let conn = self.lock().await;
        let updated = conn.execute(
            "UPDATE followed_traders SET active = 0
             WHERE user_address = ?1 AND address = ?2 AND active = 1",
            params![normalize_address(user_address), normalize_address(address)],
        )?;
        Ok(updated > 0)
    }

    pub async fn list_follows(
        &self,
        user_address: &str,
        include_inactive: bool,
    ) -> Result<Vec<FollowedTraderRecord>> {
        let user = normalize_address(user_address);
        let conn = self.lock().await;
        let sql = if include_inactive {
            format!(
                "SELECT {TRADER_COLUMNS} FROM followed_traders
                 WHERE user_address = ?1 ORDER BY active DESC, added_at"
            )
        } else {
            format!(
                "SELECT {TRADER_COLUMNS} FROM followed_traders
                 WHERE user_address = ?1 AND active = 1 ORDER BY added_at"
            )
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![user], map_trader)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn get_follow(
        &self,
        user_address: &str,
        address: &str,
    ) -> Result<Option<FollowedTraderRecord>> {
        let conn = self.lock().await;
        let sql = format!(
            "SELECT {TRADER_COLUMNS} FROM followed_traders
             WHERE user_address = ?1 AND address = ?2"
        );
        let row = conn
            .prepare_cached(&sql)?
            .query_row(
                params![normalize_address(user_address), normalize_address(address)],
                map_trader,
            )
            .optional()?;
        Ok(row)
    }

    /// Apply a partial override patch. Returns false when the follow does
    /// not exist.
    pub async fn update_follow_overrides(
        &self,
        user_address: &str,
        address: &str,
        patch: &TraderOverridePatch,
    ) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

        if let Some(alias) = &patch.alias {
            sets.push("alias = ?");
            args.push(Box::new(alias.clone()));
        }
        if let Some(active) = patch.active {
            sets.push("active = ?");
            args.push(Box::new(active as i64));
        }
        if let Some(v) = &patch.copy_percentage {
            sets.push("copy_percentage = ?");
            args.push(Box::new(*v));
        }
        if let Some(v) = &patch.min_copy_size {
            sets.push("min_copy_size = ?");
            args.push(Box::new(*v));
        }
        if let Some(v) = &patch.max_copy_size {
            sets.push("max_copy_size = ?");
            args.push(Box::new(*v));
        }
        if let Some(v) = &patch.max_daily_spend {
            sets.push("max_daily_spend = ?");
            args.push(Box::new(*v));
        }
        if let Some(v) = &patch.order_mode {
            sets.push("order_mode = ?");
            args.push(Box::new((*v).map(|m| m.as_str().to_string())));
        }
        if let Some(v) = &patch.limit_order_pct {
            sets.push("limit_order_pct = ?");
            args.push(Box::new(*v));
        }

        args.push(Box::new(normalize_address(user_address)));
        args.push(Box::new(normalize_address(address)));

        let sql = format!(
            "UPDATE followed_traders SET {} WHERE user_address = ? AND address = ?",
            sets.join(", ")
        );
        let conn = self.lock().await;
        let updated = conn.execute(
            &sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        )?;
        Ok(updated > 0)
    }

    /// Bump copy counters after an executed copy.
    pub async fn increment_follow_counters(
        &self,
        user_address: &str,
        address: &str,
        amount_spent: f64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE followed_traders
             SET total_copied = total_copied + 1, total_spent = total_spent + ?3
             WHERE user_address = ?1 AND address = ?2",
            params![
                normalize_address(user_address),
                normalize_address(address),
                amount_spent
            ],
        )?;
        Ok(())
    }

    /// Optional bootstrap: follow a list of addresses for the owner, skipping
    /// ones already followed. Returns the number newly added.
    pub async fn seed_traders(&self, owner_address: &str, addresses: &[String]) -> Result<usize> {
        let mut added = 0;
        for addr in addresses {
            if self.add_follow(owner_address, addr, "").await? {
                added += 1;
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_temp_store;
    use super::*;

    #[tokio::test]
    async fn test_follow_soft_delete_preserves_counters() {
        let (store, _f) = open_temp_store();

        assert!(store.add_follow("0xU", "0xT", "whale").await.unwrap());
        assert!(!store.add_follow("0xu", "0xt", "whale").await.unwrap());

        store.increment_follow_counters("0xu", "0xt", 42.0).await.unwrap();
        assert!(store.remove_follow("0xu", "0xt").await.unwrap());
        assert!(!store.remove_follow("0xu", "0xt").await.unwrap());

        // Inactive follows stay listable and keep their counters.
        let active = store.list_follows("0xu", false).await.unwrap();
        assert!(active.is_empty());
        let all = store.list_follows("0xu", true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].total_copied, 1);
        assert!((all[0].total_spent - 42.0).abs() < 1e-9);

        // Re-follow reactivates the same row.
        assert!(store.add_follow("0xu", "0xt", "whale2").await.unwrap());
        let active = store.list_follows("0xu", false).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].total_copied, 1);
    }

    #[tokio::test]
    async fn test_follows_are_user_scoped() {
        let (store, _f) = open_temp_store();

        store.add_follow("0xa", "0xt", "").await.unwrap();
        store.add_follow("0xb", "0xt", "").await.unwrap();

        assert_eq!(store.list_follows("0xa", false).await.unwrap().len(), 1);
        store.remove_follow("0xa", "0xt").await.unwrap();
        assert_eq!(store.list_follows("0xb", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_override_patch_set_and_clear() {
        let (store, _f) = open_temp_store();

        store.add_follow("0xu", "0xt", "").await.unwrap();

        let patch = TraderOverridePatch {
            copy_percentage: Some(Some(0.25)),
            order_mode: Some(Some(OrderMode::Market)),
            ..Default::default()
        };
        assert!(store.update_follow_overrides("0xu", "0xt", &patch).await.unwrap());

        let follow = store.get_follow("0xu", "0xt").await.unwrap().unwrap();
        assert_eq!(follow.copy_percentage, Some(0.25));
        assert_eq!(follow.order_mode, Some(OrderMode::Market));

        // Clearing an override sets the column back to NULL.
        let clear = TraderOverridePatch {
            copy_percentage: Some(None),
            ..Default::default()
        };
        assert!(store.update_follow_overrides("0xu", "0xt", &clear).await.unwrap());
        let follow = store.get_follow("0xu", "0xt").await.unwrap().unwrap();
        assert_eq!(follow.copy_percentage, None);
        assert_eq!(follow.order_mode, Some(OrderMode::Market));

        let empty = TraderOverridePatch::default();
        assert!(!store.update_follow_overrides("0xu", "0xt", &empty).await.unwrap());
    }

    #[tokio::test]
    async fn test_seed_traders_skips_existing() {
        let (store, _f) = open_temp_store();

        store.add_follow("0xowner", "0xaaa", "").await.unwrap();
        let added = store
            .seed_traders(
                "0xowner",
                &["0xaaa".to_string(), "0xbbb".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.list_follows("0xowner", false).await.unwrap().len(), 2);
    }
}
