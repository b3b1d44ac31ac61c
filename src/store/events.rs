//! Append-only engine event log.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use crate::models::Strategy;

use super::{normalize_address, Store};

#[derive(Debug, Clone, Serialize)]
pub struct EngineEventRecord {
    pub id: i64,
    pub timestamp: String,
    pub user_address: Option<String>,
    pub strategy: Option<String>,
    pub event_type: String,
    pub message: String,
    pub details: Option<String>,
}

impl Store {
    pub async fn record_event(
        &self,
        user_address: Option<&str>,
        strategy: Option<Strategy>,
        event_type: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO engine_events (user_address, strategy, event_type, message, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_address.map(normalize_address),
                strategy.map(|s| s.as_str()),
                event_type,
                message,
                details,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_events(
        &self,
        user_address: Option<&str>,
        strategy: Option<Strategy>,
        limit: usize,
    ) -> Result<Vec<EngineEventRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();
        if let Some(user) = user_address {
            conditions.push("user_address = ?");
            args.push(Box::new(normalize_address(user)));
        }
        if let Some(strategy) = strategy {
            conditions.push("strategy = ?");
            args.push(Box::new(strategy.as_str().to_string()));
        }
        args.push(Box::new(limit));

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT id, timestamp, user_address, strategy, event_type, message, details
             FROM engine_events {where_clause} ORDER BY timestamp DESC, id DESC LIMIT ?"
        );

        let conn = self.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| {
                    Ok(EngineEventRecord {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        user_address: row.get(2)?,
                        strategy: row.get(3)?,
                        event_type: row.get(4)?,
                        message: row.get(5)?,
                        details: row.get(6)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_temp_store;
    use super::*;

    #[tokio::test]
    async fn test_events_append_and_filter() {
        let (store, _f) = open_temp_store();

        store
            .record_event(Some("0xU"), Some(Strategy::Copy), "engine_start", "started", None)
            .await
            .unwrap();
        store
            .record_event(Some("0xu"), Some(Strategy::Arbitrage), "engine_start", "started", None)
            .await
            .unwrap();
        store
            .record_event(None, None, "supervisor", "boot", Some("{}"))
            .await
            .unwrap();

        let all = store.list_events(None, None, 50).await.unwrap();
        assert_eq!(all.len(), 3);

        let copy_only = store
            .list_events(Some("0xu"), Some(Strategy::Copy), 50)
            .await
            .unwrap();
        assert_eq!(copy_only.len(), 1);
        assert_eq!(copy_only[0].event_type, "engine_start");
    }
}
