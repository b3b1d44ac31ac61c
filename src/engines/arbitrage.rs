//! Per-user arbitrage scanner.
//!
//! A binary market's YES and NO tokens settle to exactly 1.00 combined, so
//! any moment their best asks sum below 1.00 is riskless profit. The
//! scanner buys both legs proportionally; a half-filled pair is surfaced as
//! a partial-arbitrage event and left to the operator (no automatic
//! unwind).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::gateway::{Gateway, MarketPair};
use crate::models::{Side, Strategy, TradeStatus};
use crate::store::{NewTrade, Store};

/// Iterations between market refreshes and stats events.
const REFRESH_EVERY: u64 = 10;
const MARKETS_PER_SCAN: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub market: String,
    pub yes_token: String,
    pub no_token: String,
    pub yes_price: f64,
    pub no_price: f64,
    pub combined_cost: f64,
    pub profit_pct: f64,
}

pub struct ArbitrageScanner {
    store: Store,
    gateway: Arc<dyn Gateway>,
    user_address: String,
    dry_run: bool,
    auto_execute: bool,
    min_profit_pct: f64,
    trade_amount: f64,
    max_position_size: f64,
    poll_interval: Duration,
}

impl ArbitrageScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        gateway: Arc<dyn Gateway>,
        user_address: &str,
        dry_run: bool,
        auto_execute: bool,
        min_profit_pct: f64,
        trade_amount: f64,
        max_position_size: f64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            user_address: user_address.to_lowercase(),
            dry_run,
            auto_execute,
            min_profit_pct,
            trade_amount,
            max_position_size,
            poll_interval,
        }
    }

    async fn record_event(&self, event_type: &str, message: &str, details: Option<&str>) {
        let _ = self
            .store
            .record_event(
                Some(&self.user_address),
                Some(Strategy::Arbitrage),
                event_type,
                message,
                details,
            )
            .await;
    }

    /// Check one YES/NO pair for a qualifying mispricing.
    pub async fn check_pair(&self, pair: &MarketPair) -> Option<Opportunity> {
        let yes = self.gateway.get_price(&pair.yes_token, Side::Buy).await?;
        let no = self.gateway.get_price(&pair.no_token, Side::Buy).await?;

        let combined = yes.value + no.value;
        if combined <= 0.0 || combined >= 1.0 {
            return None;
        }
        let profit_pct = (1.0 - combined) / combined * 100.0;
        if profit_pct < self.min_profit_pct {
            return None;
        }

        Some(Opportunity {
            market: pair.question.clone(),
            yes_token: pair.yes_token.clone(),
            no_token: pair.no_token.clone(),
            yes_price: yes.value,
            no_price: no.value,
            combined_cost: combined,
            profit_pct,
        })
    }

    /// Buy both legs. Returns true when both legs executed.
    pub async fn execute(&self, opp: &Opportunity) -> Result<bool> {
        let total = self.trade_amount.min(self.max_position_size);
        let yes_amount = total * (opp.yes_price / opp.combined_cost);
        let no_amount = total * (opp.no_price / opp.combined_cost);
        let expected_profit = (1.0 - opp.combined_cost) * total;

        info!(
            market = %opp.market.chars().take(50).collect::<String>(),
            yes = opp.yes_price,
            no = opp.no_price,
            combined = opp.combined_cost,
            profit_pct = opp.profit_pct,
            dry_run = self.dry_run,
            "arbitrage opportunity"
        );

        let legs = [
            (&opp.yes_token, yes_amount, opp.yes_price, "YES"),
            (&opp.no_token, no_amount, opp.no_price, "NO"),
        ];

        let mut executed = [false, false];
        for (i, (token, amount, price, label)) in legs.iter().enumerate() {
            let (status, reason) = if self.dry_run {
                (TradeStatus::DryRun, None)
            } else {
                let result = self
                    .gateway
                    .place_market_order(token, *amount, Side::Buy)
                    .await;
                if result.is_executed() {
                    (TradeStatus::Executed, None)
                } else {
                    (
                        TradeStatus::Failed,
                        Some(result.reason.unwrap_or_else(|| "order failed".to_string())),
                    )
                }
            };
            executed[i] = status != TradeStatus::Failed;

            self.store
                .record_trade(&NewTrade {
                    user_address: self.user_address.clone(),
                    strategy: Strategy::Arbitrage,
                    token_id: token.to_string(),
                    side: Side::Buy,
                    amount: *amount,
                    price: *price,
                    market: format!("{} ({label})", opp.market),
                    expected_profit: expected_profit / 2.0,
                    copied_from: None,
                    original_trade_id: None,
                    status,
                    notes: reason,
                })
                .await?;

            if status == TradeStatus::Executed && *price > 0.0 {
                if let Err(e) = self
                    .store
                    .upsert_position(
                        &self.user_address,
                        token,
                        &format!("{} ({label})", opp.market),
                        Side::Buy,
                        *amount,
                        *price,
                        Strategy::Arbitrage.as_str(),
                        None,
                    )
                    .await
                {
                    warn!(error = %e, "failed to upsert arbitrage position");
                }
            }
        }

        let success = executed[0] && executed[1];
        if !success && !self.dry_run {
            // One leg standing is an unhedged position the operator must
            // resolve; alert but do not unwind automatically.
            error!(
                market = %opp.market.chars().take(50).collect::<String>(),
                yes_ok = executed[0],
                no_ok = executed[1],
                "partial arbitrage execution"
            );
            self.record_event(
                "partial_arbitrage",
                &format!(
                    "Partial arbitrage on {}: YES {}, NO {}",
                    opp.market.chars().take(60).collect::<String>(),
                    if executed[0] { "executed" } else { "failed" },
                    if executed[1] { "executed" } else { "failed" },
                ),
                Some(&format!(
                    "yes_token={}, no_token={}, combined={:.4}",
                    opp.yes_token, opp.no_token, opp.combined_cost
                )),
            )
            .await;
        }
        Ok(success)
    }

    /// One scan over the current market set. Returns opportunities found.
    /// The cancellation handle is checked between pairs.
    pub async fn scan(
        &self,
        markets: &[MarketPair],
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();
        for pair in markets {
            if cancel.map(|c| *c.borrow()).unwrap_or(false) {
                break;
            }
            if let Some(opp) = self.check_pair(pair).await {
                opportunities.push(opp);
            }
        }
        opportunities
    }

    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        let mut markets = match self.gateway.get_active_markets(MARKETS_PER_SCAN).await {
            Ok(markets) if !markets.is_empty() => markets,
            Ok(_) => {
                let msg = "No tradable markets found";
                error!("{msg}");
                self.record_event("engine_error", msg, None).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "could not fetch markets");
                self.record_event("engine_error", &format!("Could not fetch markets: {e}"), None)
                    .await;
                return;
            }
        };

        info!(
            user = %self.user_address,
            markets = markets.len(),
            min_profit_pct = self.min_profit_pct,
            "arbitrage scanner started"
        );
        self.record_event(
            "engine_start",
            &format!("Arbitrage scanner started: monitoring {} markets", markets.len()),
            Some(&format!("dry_run={}, min_profit_pct={}", self.dry_run, self.min_profit_pct)),
        )
        .await;

        let mut iteration: u64 = 0;
        loop {
            if *cancel.borrow() {
                break;
            }
            iteration += 1;

            let opportunities = self.scan(&markets, Some(&cancel)).await;
            for opp in &opportunities {
                if *cancel.borrow() {
                    break;
                }
                if self.auto_execute || self.dry_run {
                    if let Err(e) = self.execute(opp).await {
                        warn!(error = %e, "arbitrage execution error");
                    }
                } else {
                    debug!(
                        market = %opp.market.chars().take(50).collect::<String>(),
                        profit_pct = opp.profit_pct,
                        "opportunity found (auto-execute off)"
                    );
                }
            }

            if iteration % REFRESH_EVERY == 0 {
                if let Ok(stats) = self
                    .store
                    .strategy_stats(&self.user_address, Strategy::Arbitrage)
                    .await
                {
                    info!(
                        trades = stats.total_trades,
                        expected_profit = stats.total_expected_profit,
                        "arbitrage stats"
                    );
                }
                match self.gateway.get_active_markets(MARKETS_PER_SCAN).await {
                    Ok(fresh) if !fresh.is_empty() => markets = fresh,
                    Ok(_) => warn!("market refresh returned no pairs, keeping previous set"),
                    Err(e) => warn!(error = %e, "market refresh failed, keeping previous set"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.changed() => {}
            }
        }

        self.record_event("engine_stop", "Arbitrage scanner stopped", None).await;
    }
}
