//! Per-user copy trading worker.
//!
//! Polls every followed trader, runs candidates through the sizing
//! pipeline, and mirrors admitted trades. The fingerprint is recorded
//! before the order goes out: an upstream trade is a point event, so a
//! failed submission is never retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::gateway::{Gateway, UpstreamTrade};
use crate::models::{CopyDefaults, OrderMode, Strategy, TradeStatus};
use crate::notify::TelegramNotifier;
use crate::sizing::{self, SizingDecision, SpendState, TargetOrder};
use crate::store::{FollowedTraderRecord, NewTrade, Store};

/// How many recent trades to pull per trader per poll.
const TRADES_PER_POLL: usize = 20;
/// Iterations between stats events and dedup expiry sweeps.
const MAINTENANCE_EVERY: u64 = 20;
const DEDUP_TTL_DAYS: i64 = 7;

pub struct CopyTrader {
    store: Store,
    gateway: Arc<dyn Gateway>,
    notifier: Option<TelegramNotifier>,
    defaults: CopyDefaults,
    poll_interval: Duration,
    user_address: String,
    dry_run: bool,
}

fn short(addr: &str) -> String {
    if addr.len() > 10 {
        format!("{}...", &addr[..10])
    } else {
        addr.to_string()
    }
}

fn alias_of(trader: &FollowedTraderRecord) -> String {
    trader
        .alias
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| short(&trader.address))
}

impl CopyTrader {
    pub fn new(
        store: Store,
        gateway: Arc<dyn Gateway>,
        notifier: Option<TelegramNotifier>,
        defaults: CopyDefaults,
        poll_interval: Duration,
        user_address: &str,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            defaults,
            poll_interval,
            user_address: user_address.to_lowercase(),
            dry_run,
        }
    }

    async fn record_event(&self, event_type: &str, message: &str, details: Option<&str>) {
        if let Err(e) = self
            .store
            .record_event(
                Some(&self.user_address),
                Some(Strategy::Copy),
                event_type,
                message,
                details,
            )
            .await
        {
            // Event logging must never break the engine.
            debug!(error = %e, "failed to record engine event");
        }
    }

    /// Historical catch-up: mark the recent trades of every followed trader
    /// as seen without executing, so pre-start history is never replayed.
    pub async fn bootstrap(&self) -> Result<usize> {
        let traders = self.store.list_follows(&self.user_address, false).await?;
        let mut marked = 0;

        for trader in &traders {
            let trades = self
                .gateway
                .get_trader_trades(&trader.address, TRADES_PER_POLL)
                .await;
            for trade in trades {
                if !self.store.is_seen(&trade.fingerprint).await? {
                    self.store.mark_seen(&trade.fingerprint).await?;
                    marked += 1;
                }
            }
        }

        info!(
            user = %short(&self.user_address),
            traders = traders.len(),
            marked,
            "initial scan complete, monitoring for new trades only"
        );
        self.record_event(
            "engine_start",
            &format!(
                "Copy engine started: following {} traders, marked {} historical trades as seen",
                traders.len(),
                marked
            ),
            Some(&format!(
                "dry_run={}, poll={}s, mode={}",
                self.dry_run,
                self.poll_interval.as_secs(),
                self.defaults.order_mode.as_str()
            )),
        )
        .await;
        Ok(marked)
    }

    /// One poll pass over all followed traders. Returns the number of trades
    /// copied. The cancellation handle is checked between traders so a stop
    /// takes effect within one trader's worth of work.
    pub async fn poll_once(&self, cancel: Option<&watch::Receiver<bool>>) -> Result<usize> {
        // Reload follows every pass so live edits take effect immediately.
        let traders = self.store.list_follows(&self.user_address, false).await?;
        let mut copied = 0;

        for trader in &traders {
            if cancel.map(|c| *c.borrow()).unwrap_or(false) {
                break;
            }
            match self.poll_trader(trader).await {
                Ok(n) => copied += n,
                Err(e) => {
                    let alias = alias_of(trader);
                    error!(trader = %alias, error = %e, "poll error");
                    self.record_event(
                        "poll_error",
                        &format!("Error polling {alias}: {e}"),
                        Some(&trader.address),
                    )
                    .await;
                }
            }
        }

        Ok(copied)
    }

    async fn poll_trader(&self, trader: &FollowedTraderRecord) -> Result<usize> {
        let trades = self
            .gateway
            .get_trader_trades(&trader.address, TRADES_PER_POLL)
            .await;
        let mut copied = 0;

        debug!(
            trader = %alias_of(trader),
            fetched = trades.len(),
            "polled trader"
        );

        for trade in &trades {
            let already_seen = self.store.is_seen(&trade.fingerprint).await?;
            let spend = SpendState {
                global_spent: self
                    .store
                    .daily_executed_spend(&self.user_address, Strategy::Copy, None)
                    .await?,
                trader_spent: self
                    .store
                    .daily_executed_spend(&self.user_address, Strategy::Copy, Some(&trader.address))
                    .await?,
            };

            let decision = sizing::evaluate(
                trade,
                already_seen,
                trader,
                &self.defaults,
                spend,
                Utc::now(),
            );

            match decision {
                SizingDecision::Reject(reason) => {
                    if reason.marks_seen() {
                        self.store.mark_seen(&trade.fingerprint).await?;
                    }
                    if reason != sizing::RejectReason::AlreadySeen {
                        debug!(
                            trader = %alias_of(trader),
                            fingerprint = %short(&trade.fingerprint),
                            reason = reason.as_str(),
                            "skipped candidate"
                        );
                    }
                }
                SizingDecision::Execute(order) => {
                    if self.execute_copy(trade, trader, order).await? {
                        copied += 1;
                    }
                }
            }
        }

        Ok(copied)
    }

    /// Mirror one admitted trade. The linearization point against duplicates
    /// is the mark_seen before submission.
    async fn execute_copy(
        &self,
        trade: &UpstreamTrade,
        trader: &FollowedTraderRecord,
        order: TargetOrder,
    ) -> Result<bool> {
        self.store.mark_seen(&trade.fingerprint).await?;

        let alias = alias_of(trader);
        if let Some(notifier) = &self.notifier {
            notifier
                .trader_trade_alert(
                    &trader.address,
                    &alias,
                    order.side,
                    &trade.market,
                    trade.size,
                    trade.price,
                )
                .await;
        }

        info!(
            trader = %alias,
            side = order.side.as_str(),
            usd = order.usd_amount,
            mode = order.mode.as_str(),
            dry_run = self.dry_run,
            market = %trade.market.chars().take(50).collect::<String>(),
            "copying trade"
        );

        let (status, fail_reason) = if self.dry_run {
            (TradeStatus::DryRun, None)
        } else {
            let result = match order.mode {
                OrderMode::Limit => {
                    self.gateway
                        .place_limit_order(
                            &order.token_id,
                            order.limit_price.unwrap_or(0.0),
                            order.shares.unwrap_or(0.0),
                            order.side,
                        )
                        .await
                }
                OrderMode::Market => {
                    self.gateway
                        .place_market_order(&order.token_id, order.usd_amount, order.side)
                        .await
                }
            };
            if result.is_executed() {
                (TradeStatus::Executed, None)
            } else {
                (TradeStatus::Failed, result.reason)
            }
        };

        self.store
            .record_trade(&NewTrade {
                user_address: self.user_address.clone(),
                strategy: Strategy::Copy,
                token_id: order.token_id.clone(),
                side: order.side,
                amount: order.usd_amount,
                price: trade.price,
                market: trade.market.clone(),
                expected_profit: 0.0,
                copied_from: Some(trader.address.clone()),
                original_trade_id: Some(trade.fingerprint.clone()),
                status,
                notes: fail_reason.clone(),
            })
            .await?;

        match status {
            TradeStatus::Failed => {
                let reason = fail_reason.unwrap_or_else(|| "unknown".to_string());
                error!(trader = %alias, reason = %reason, "copy order failed");
                self.record_event(
                    "trade_failed",
                    &format!(
                        "FAILED {} ${:.2} from {alias}: {}",
                        order.side.as_str(),
                        order.usd_amount,
                        trade.market.chars().take(60).collect::<String>()
                    ),
                    Some(&format!(
                        "reason={reason}, token={}, mode={}",
                        short(&order.token_id),
                        order.mode.as_str()
                    )),
                )
                .await;
                if let Some(notifier) = &self.notifier {
                    notifier
                        .copy_trade_alert(
                            &alias,
                            order.side,
                            &trade.market,
                            order.usd_amount,
                            trade.price,
                            order.mode,
                            TradeStatus::Failed,
                        )
                        .await;
                }
                Ok(false)
            }
            TradeStatus::Executed | TradeStatus::DryRun => {
                if status == TradeStatus::Executed {
                    self.store
                        .increment_follow_counters(
                            &self.user_address,
                            &trader.address,
                            order.usd_amount,
                        )
                        .await?;
                    self.record_event(
                        "trade_copied",
                        &format!(
                            "Copied {} ${:.2} from {alias}: {}",
                            order.side.as_str(),
                            order.usd_amount,
                            trade.market.chars().take(60).collect::<String>()
                        ),
                        Some(&format!(
                            "token={}, price={:.4}, mode={}",
                            short(&order.token_id),
                            trade.price,
                            order.mode.as_str()
                        )),
                    )
                    .await;

                    if trade.price > 0.0 {
                        if let Err(e) = self
                            .store
                            .upsert_position(
                                &self.user_address,
                                &order.token_id,
                                &trade.market,
                                order.side,
                                order.usd_amount,
                                trade.price,
                                Strategy::Copy.as_str(),
                                Some(&trader.address),
                            )
                            .await
                        {
                            warn!(error = %e, "failed to upsert position");
                        }
                    }
                }
                if let Some(notifier) = &self.notifier {
                    notifier
                        .copy_trade_alert(
                            &alias,
                            order.side,
                            &trade.market,
                            order.usd_amount,
                            trade.price,
                            order.mode,
                            status,
                        )
                        .await;
                }
                Ok(true)
            }
        }
    }

    async fn log_stats(&self) {
        let Ok(stats) = self.store.strategy_stats(&self.user_address, Strategy::Copy).await else {
            return;
        };
        let daily = self
            .store
            .daily_executed_spend(&self.user_address, Strategy::Copy, None)
            .await
            .unwrap_or(0.0);
        info!(
            user = %short(&self.user_address),
            trades = stats.total_trades,
            spent = stats.total_spent,
            failed = stats.failed_trades,
            daily_spend = daily,
            "copy stats"
        );
        self.record_event(
            "scan_stats",
            &format!(
                "{} trades copied, ${:.2} total spent, {} failed, ${daily:.2} spent today",
                stats.total_trades, stats.total_spent, stats.failed_trades
            ),
            None,
        )
        .await;
    }

    /// Main loop. Returns when cancelled; never panics the process.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        match self.store.list_follows(&self.user_address, false).await {
            Ok(traders) if traders.is_empty() => {
                let msg = "No traders to follow: add trader addresses first";
                error!(user = %short(&self.user_address), "{msg}");
                self.record_event("engine_error", msg, None).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "could not load follow list");
                self.record_event("engine_error", &format!("Could not load follow list: {e}"), None)
                    .await;
                return;
            }
            Ok(_) => {}
        }

        if let Err(e) = self.bootstrap().await {
            error!(error = %e, "bootstrap failed");
            self.record_event("engine_error", &format!("Bootstrap failed: {e}"), None)
                .await;
            return;
        }

        let mut iteration: u64 = 0;
        loop {
            if *cancel.borrow() {
                break;
            }
            iteration += 1;

            match self.poll_once(Some(&cancel)).await {
                Ok(copied) if copied > 0 => {
                    info!(iteration, copied, "scan copied trades");
                    self.record_event(
                        "scan_result",
                        &format!("Scan #{iteration}: copied {copied} trades"),
                        None,
                    )
                    .await;
                }
                Ok(_) => debug!(iteration, "scan found no new trades"),
                Err(e) => warn!(iteration, error = %e, "scan failed, retrying next interval"),
            }

            if iteration % MAINTENANCE_EVERY == 0 {
                self.log_stats().await;
                if let Err(e) = self.store.expire_seen(DEDUP_TTL_DAYS).await {
                    warn!(error = %e, "dedup expiry failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.changed() => {}
            }
        }

        self.log_stats().await;
        self.record_event("engine_stop", "Copy engine stopped", None).await;
    }
}
