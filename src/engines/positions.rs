//! Global position price tracker.
//!
//! Periodically refreshes the live price of every open position (all
//! users) and recomputes unrealized P&L in one batch transaction. Prices
//! pinned near 0 or 1 are passed through unchanged; the redeem-resolved
//! operation interprets them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::gateway::Gateway;
use crate::models::Side;
use crate::store::{PriceUpdate, Store};

pub struct PositionTracker {
    store: Store,
    gateway: Arc<dyn Gateway>,
    interval: Duration,
}

impl PositionTracker {
    pub fn new(store: Store, gateway: Arc<dyn Gateway>, interval: Duration) -> Self {
        Self {
            store,
            gateway,
            interval,
        }
    }

    /// One refresh pass. Returns the number of positions updated.
    pub async fn update_once(&self) -> Result<usize> {
        let positions = self.store.list_open_positions(None).await?;
        if positions.is_empty() {
            return Ok(0);
        }

        let mut updates = Vec::with_capacity(positions.len());
        for position in &positions {
            // Midpoint first, best BUY price as fallback.
            let quote = match self.gateway.get_midpoint(&position.token_id).await {
                Some(quote) => Some(quote),
                None => self.gateway.get_price(&position.token_id, Side::Buy).await,
            };
            if let Some(quote) = quote {
                updates.push(PriceUpdate {
                    id: position.id,
                    price: quote.value,
                });
            }
        }

        if updates.is_empty() {
            return Ok(0);
        }
        let applied = self.store.batch_update_prices(&updates).await?;
        debug!(applied, "position prices refreshed");
        Ok(applied)
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "position tracker started");

        loop {
            if *cancel.borrow() {
                break;
            }
            if let Err(e) = self.update_once().await {
                error!(error = %e, "position price update error");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.changed() => {}
            }
        }

        info!("position tracker stopped");
    }
}
