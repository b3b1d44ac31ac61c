//! Global fund engine.
//!
//! Fans each fresh upstream trade of a fund's allocated traders into one
//! weighted downstream order per allocation. Fund copies are deduplicated
//! under a fund-scoped fingerprint so they never collide with per-user
//! copies of the same upstream event. Fund positions live under the
//! synthetic user key `fund:{id}`; investors hold shares, not tokens.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::gateway::{Gateway, UpstreamTrade};
use crate::models::{CopyDefaults, Strategy, TradeStatus};
use crate::store::{FundRecord, NewTrade, Store};

/// Iterations between NAV updates, fund-list refreshes, and dedup expiry.
const NAV_UPDATE_EVERY: u64 = 10;
/// Per-trade cap as a fraction of fund AUM.
const MAX_AUM_FRACTION: f64 = 0.05;
const TRADES_PER_POLL: usize = 10;
const DEDUP_TTL_DAYS: i64 = 7;

pub struct FundManager {
    store: Store,
    gateway: Arc<dyn Gateway>,
    defaults: CopyDefaults,
    poll_interval: Duration,
    dry_run: bool,
}

/// Synthetic store key holding a fund's positions and trade rows.
pub fn fund_user_key(fund_id: i64) -> String {
    format!("fund:{fund_id}")
}

fn fund_fingerprint(fund_id: i64, fingerprint: &str) -> String {
    format!("fund:{fund_id}:{fingerprint}")
}

impl FundManager {
    pub fn new(
        store: Store,
        gateway: Arc<dyn Gateway>,
        defaults: CopyDefaults,
        poll_interval: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            defaults,
            poll_interval,
            dry_run,
        }
    }

    /// Weighted copy size for one allocation:
    /// `originalUsd × copyPct × weight`, floored at the minimum copy size
    /// and capped by min(maxCopy, 5% of AUM). A fund with no AUM trades
    /// nothing.
    pub fn copy_size(&self, fund: &FundRecord, weight: f64, original_usd: f64) -> f64 {
        if fund.total_aum <= 0.0 {
            return 0.0;
        }
        let sized = original_usd * self.defaults.copy_percentage * weight;
        let sized = sized.max(self.defaults.min_copy_size);
        let cap = self.defaults.max_copy_size.min(fund.total_aum * MAX_AUM_FRACTION);
        let sized = sized.min(cap);
        (sized * 100.0).round() / 100.0
    }

    async fn execute_fund_trade(
        &self,
        fund: &FundRecord,
        trade: &UpstreamTrade,
        trader_address: &str,
        weight: f64,
    ) -> Result<bool> {
        let Some(token_id) = trade.token_id.as_deref() else {
            return Ok(false);
        };
        let Some(side) = trade.side else {
            return Ok(false);
        };

        let amount = self.copy_size(fund, weight, trade.original_usd());
        if amount <= 0.0 {
            return Ok(false);
        }

        info!(
            fund = %fund.name,
            trader = %&trader_address[..trader_address.len().min(10)],
            side = side.as_str(),
            usd = amount,
            weight,
            dry_run = self.dry_run,
            "fund copying trade"
        );

        let (status, reason) = if self.dry_run {
            (TradeStatus::DryRun, None)
        } else {
            let result = self.gateway.place_market_order(token_id, amount, side).await;
            if result.is_executed() {
                (TradeStatus::Executed, None)
            } else {
                (
                    TradeStatus::Failed,
                    Some(result.reason.unwrap_or_else(|| "order failed".to_string())),
                )
            }
        };

        let trade_id = self
            .store
            .record_trade(&NewTrade {
                user_address: fund_user_key(fund.id),
                strategy: Strategy::Fund,
                token_id: token_id.to_string(),
                side,
                amount,
                price: trade.price,
                market: trade.market.clone(),
                expected_profit: 0.0,
                copied_from: Some(trader_address.to_string()),
                original_trade_id: Some(fund_fingerprint(fund.id, &trade.fingerprint)),
                status,
                notes: reason.clone().or_else(|| Some(format!("Fund: {}", fund.name))),
            })
            .await?;

        self.store
            .record_fund_trade(fund.id, trade_id, trader_address, amount)
            .await?;

        if status == TradeStatus::Failed {
            error!(fund = %fund.name, reason = ?reason, "fund trade failed");
            let _ = self
                .store
                .record_event(
                    Some(&fund_user_key(fund.id)),
                    Some(Strategy::Fund),
                    "trade_failed",
                    &format!("[{}] failed {} ${amount:.2}", fund.name, side.as_str()),
                    reason.as_deref(),
                )
                .await;
            return Ok(false);
        }

        if status == TradeStatus::Executed && trade.price > 0.0 {
            if let Err(e) = self
                .store
                .upsert_position(
                    &fund_user_key(fund.id),
                    token_id,
                    &trade.market,
                    side,
                    amount,
                    trade.price,
                    Strategy::Fund.as_str(),
                    Some(trader_address),
                )
                .await
            {
                warn!(error = %e, "failed to upsert fund position");
            }
        }
        Ok(true)
    }

    /// Poll every allocated trader of one fund. Returns trades copied. The
    /// cancellation handle is checked between traders.
    pub async fn poll_fund(
        &self,
        fund: &FundRecord,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<usize> {
        let allocations = self.store.list_allocations(fund.id).await?;
        if allocations.is_empty() {
            return Ok(0);
        }

        let mut copied = 0;
        for alloc in &allocations {
            if cancel.map(|c| *c.borrow()).unwrap_or(false) {
                break;
            }
            let trades = self
                .gateway
                .get_trader_trades(&alloc.trader_address, TRADES_PER_POLL)
                .await;

            for trade in &trades {
                let scoped = fund_fingerprint(fund.id, &trade.fingerprint);
                if self.store.is_seen(&scoped).await? {
                    continue;
                }

                // Stale or malformed candidates are retired without copying.
                if let Some(age) = trade.age_seconds(Utc::now()) {
                    if age > self.defaults.max_trade_age_secs {
                        self.store.mark_seen(&scoped).await?;
                        continue;
                    }
                }
                if trade.token_id.is_none() || trade.side.is_none() {
                    self.store.mark_seen(&scoped).await?;
                    continue;
                }

                // Fingerprint first, then submit.
                self.store.mark_seen(&scoped).await?;
                match self
                    .execute_fund_trade(fund, trade, &alloc.trader_address, alloc.weight)
                    .await
                {
                    Ok(true) => copied += 1,
                    Ok(false) => {}
                    Err(e) => warn!(fund = %fund.name, error = %e, "fund trade error"),
                }
            }
        }
        Ok(copied)
    }

    /// Recompute NAV and upsert today's performance row.
    pub async fn update_fund_nav(&self, fund_id: i64) -> Result<()> {
        let Some(fund) = self.store.get_fund(fund_id).await? else {
            return Ok(());
        };

        let nav = if fund.total_shares > 0.0 {
            fund.total_aum / fund.total_shares
        } else {
            1.0
        };
        let nav = (nav * 1_000_000.0).round() / 1_000_000.0;

        let history = self.store.fund_performance(fund_id, 2).await?;
        let daily_return = history
            .last()
            .filter(|prev| prev.nav > 0.0)
            .map(|prev| (nav - prev.nav) / prev.nav * 100.0)
            .unwrap_or(0.0);
        let cumulative_return = (nav - 1.0) * 100.0;

        self.store
            .record_performance(
                fund_id,
                nav,
                (daily_return * 10_000.0).round() / 10_000.0,
                (cumulative_return * 10_000.0).round() / 10_000.0,
            )
            .await?;
        debug!(fund_id, nav, daily_return, "fund NAV updated");
        Ok(())
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        let funds = match self.store.list_funds(true).await {
            Ok(funds) => funds,
            Err(e) => {
                error!(error = %e, "could not load funds");
                return;
            }
        };
        if funds.is_empty() {
            warn!("no active funds, fund engine exiting");
            return;
        }

        info!(funds = funds.len(), dry_run = self.dry_run, "fund engine started");
        let _ = self
            .store
            .record_event(
                None,
                Some(Strategy::Fund),
                "engine_start",
                &format!("Fund engine started: managing {} funds", funds.len()),
                Some(&format!("dry_run={}", self.dry_run)),
            )
            .await;

        let mut iteration: u64 = 0;
        loop {
            if *cancel.borrow() {
                break;
            }
            iteration += 1;

            // Reload each pass so newly created funds and edited
            // allocations take effect without a restart.
            let funds = match self.store.list_funds(true).await {
                Ok(funds) => funds,
                Err(e) => {
                    warn!(error = %e, "fund list reload failed");
                    Vec::new()
                }
            };

            let mut copied = 0;
            for fund in &funds {
                if *cancel.borrow() {
                    break;
                }
                match self.poll_fund(fund, Some(&cancel)).await {
                    Ok(n) => copied += n,
                    Err(e) => error!(fund = %fund.name, error = %e, "fund poll error"),
                }
            }
            if copied > 0 {
                info!(iteration, copied, "fund scan copied trades");
            }

            if iteration % NAV_UPDATE_EVERY == 0 {
                for fund in &funds {
                    if let Err(e) = self.update_fund_nav(fund.id).await {
                        error!(fund_id = fund.id, error = %e, "NAV update error");
                    }
                }
                if let Err(e) = self.store.expire_seen(DEDUP_TTL_DAYS).await {
                    warn!(error = %e, "dedup expiry failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.changed() => {}
            }
        }

        // Final NAV snapshot on the way out.
        if let Ok(funds) = self.store.list_funds(true).await {
            for fund in &funds {
                let _ = self.update_fund_nav(fund.id).await;
            }
        }
        let _ = self
            .store
            .record_event(None, Some(Strategy::Fund), "engine_stop", "Fund engine stopped", None)
            .await;
    }
}
