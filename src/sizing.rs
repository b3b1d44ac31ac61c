//! Pure sizing and admission logic for copy trades.
//!
//! Maps (upstream trade, per-trader overrides, user defaults, current daily
//! spend) to a target order or a typed rejection. No I/O; the workers own
//! dedup reads/writes and order submission.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::UpstreamTrade;
use crate::models::{CopyDefaults, OrderMode, Side};
use crate::store::FollowedTraderRecord;

/// Per-trader settings after falling back to user defaults for null overrides.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveSettings {
    pub copy_percentage: f64,
    pub min_copy_size: f64,
    pub max_copy_size: f64,
    pub max_daily_spend: f64,
    pub order_mode: OrderMode,
    pub limit_order_pct: f64,
}

pub fn effective_settings(
    follow: &FollowedTraderRecord,
    defaults: &CopyDefaults,
) -> EffectiveSettings {
    EffectiveSettings {
        copy_percentage: follow.copy_percentage.unwrap_or(defaults.copy_percentage),
        min_copy_size: follow.min_copy_size.unwrap_or(defaults.min_copy_size),
        max_copy_size: follow.max_copy_size.unwrap_or(defaults.max_copy_size),
        max_daily_spend: follow.max_daily_spend.unwrap_or(defaults.max_daily_spend),
        order_mode: follow.order_mode.unwrap_or(defaults.order_mode),
        limit_order_pct: follow.limit_order_pct.unwrap_or(defaults.limit_order_pct),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadySeen,
    TooOld,
    NoToken,
    InvalidSide,
    GlobalDailyLimit,
    TraderDailyLimit,
    ZeroSize,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AlreadySeen => "already_seen",
            RejectReason::TooOld => "too_old",
            RejectReason::NoToken => "no_token",
            RejectReason::InvalidSide => "invalid_side",
            RejectReason::GlobalDailyLimit => "global_daily_limit",
            RejectReason::TraderDailyLimit => "trader_daily_limit",
            RejectReason::ZeroSize => "zero_size",
        }
    }

    /// Whether the candidate's fingerprint should be recorded so it is never
    /// re-evaluated. Budget rejections stay unmarked: the same trade may fit
    /// after the day rolls over, and staleness will retire it otherwise.
    pub fn marks_seen(&self) -> bool {
        matches!(
            self,
            RejectReason::TooOld
                | RejectReason::NoToken
                | RejectReason::InvalidSide
                | RejectReason::ZeroSize
        )
    }
}

/// The order the worker should submit for an admitted candidate.
#[derive(Debug, Clone, Serialize)]
pub struct TargetOrder {
    pub token_id: String,
    pub side: Side,
    pub usd_amount: f64,
    pub mode: OrderMode,
    /// Set for limit orders: trader's price adjusted by slippage, clamped
    /// into [0.01, 0.99].
    pub limit_price: Option<f64>,
    /// Set for limit orders: usd_amount converted at the limit price.
    pub shares: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpendState {
    /// Executed copy spend for the user today, all traders.
    pub global_spent: f64,
    /// Executed copy spend for the user today, this trader only.
    pub trader_spent: f64,
}

#[derive(Debug, Clone)]
pub enum SizingDecision {
    Execute(TargetOrder),
    Reject(RejectReason),
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Limit price from the trader's execution price plus a slippage allowance.
/// BUY pays up to `pct` percent more, SELL accepts up to `pct` percent less.
pub fn limit_price_for(trader_price: f64, side: Side, slippage_pct: f64) -> Option<f64> {
    if trader_price <= 0.0 {
        return None;
    }
    let slip = slippage_pct / 100.0;
    let price = match side {
        Side::Buy => round4(trader_price * (1.0 + slip)).min(0.99),
        Side::Sell => round4(trader_price * (1.0 - slip)).max(0.01),
    };
    Some(price)
}

/// The admission pipeline. Checks run in a fixed order; the first failure
/// wins. `already_seen` is the caller's dedup-ledger read for this
/// fingerprint.
pub fn evaluate(
    trade: &UpstreamTrade,
    already_seen: bool,
    follow: &FollowedTraderRecord,
    defaults: &CopyDefaults,
    spend: SpendState,
    now: DateTime<Utc>,
) -> SizingDecision {
    let settings = effective_settings(follow, defaults);

    if already_seen {
        return SizingDecision::Reject(RejectReason::AlreadySeen);
    }

    if let Some(age) = trade.age_seconds(now) {
        if age > defaults.max_trade_age_secs {
            return SizingDecision::Reject(RejectReason::TooOld);
        }
    }

    let Some(token_id) = trade.token_id.as_deref().filter(|t| !t.is_empty()) else {
        return SizingDecision::Reject(RejectReason::NoToken);
    };

    let Some(side) = trade.side else {
        return SizingDecision::Reject(RejectReason::InvalidSide);
    };

    if spend.global_spent >= defaults.max_daily_spend {
        return SizingDecision::Reject(RejectReason::GlobalDailyLimit);
    }
    if spend.trader_spent >= settings.max_daily_spend {
        return SizingDecision::Reject(RejectReason::TraderDailyLimit);
    }

    let original_usd = trade.original_usd();
    let mut copy_usd = (original_usd * settings.copy_percentage)
        .max(settings.min_copy_size)
        .min(settings.max_copy_size);

    // Never exceed what remains of either daily budget.
    let global_remaining = defaults.max_daily_spend - spend.global_spent;
    let trader_remaining = settings.max_daily_spend - spend.trader_spent;
    copy_usd = copy_usd.min(global_remaining).min(trader_remaining);
    copy_usd = round2(copy_usd);

    if copy_usd <= 0.0 {
        return SizingDecision::Reject(RejectReason::ZeroSize);
    }

    // Limit mode needs the trader's price; without one we fall back to a
    // market order.
    if settings.order_mode == OrderMode::Limit {
        if let Some(limit) = limit_price_for(trade.price, side, settings.limit_order_pct) {
            let shares = round2(copy_usd / limit);
            return SizingDecision::Execute(TargetOrder {
                token_id: token_id.to_string(),
                side,
                usd_amount: copy_usd,
                mode: OrderMode::Limit,
                limit_price: Some(limit),
                shares: Some(shares),
            });
        }
    }

    SizingDecision::Execute(TargetOrder {
        token_id: token_id.to_string(),
        side,
        usd_amount: copy_usd,
        mode: OrderMode::Market,
        limit_price: None,
        shares: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn follow() -> FollowedTraderRecord {
        FollowedTraderRecord {
            user_address: "0xu".into(),
            address: "0xt".into(),
            alias: None,
            added_at: String::new(),
            active: true,
            total_copied: 0,
            total_spent: 0.0,
            copy_percentage: None,
            min_copy_size: None,
            max_copy_size: None,
            max_daily_spend: None,
            order_mode: None,
            limit_order_pct: None,
        }
    }

    fn defaults() -> CopyDefaults {
        CopyDefaults {
            copy_percentage: 0.10,
            min_copy_size: 5.0,
            max_copy_size: 100.0,
            max_daily_spend: 500.0,
            max_trade_age_secs: 300,
            order_mode: OrderMode::Market,
            limit_order_pct: 2.0,
        }
    }

    fn trade(size: f64, price: f64, age_secs: i64) -> UpstreamTrade {
        UpstreamTrade {
            fingerprint: "fp".into(),
            token_id: Some("0xtok".into()),
            side: Some(Side::Buy),
            raw_side: "BUY".into(),
            size,
            price,
            timestamp: Some(Utc::now() - Duration::seconds(age_secs)),
            market: "Test".into(),
        }
    }

    fn execute(decision: SizingDecision) -> TargetOrder {
        match decision {
            SizingDecision::Execute(order) => order,
            SizingDecision::Reject(reason) => panic!("unexpected reject: {:?}", reason),
        }
    }

    fn reject(decision: SizingDecision) -> RejectReason {
        match decision {
            SizingDecision::Reject(reason) => reason,
            SizingDecision::Execute(order) => panic!("unexpected execute: {:?}", order),
        }
    }

    #[test]
    fn test_basic_market_copy_sizing() {
        // 1000 shares at 0.42 = $420 original; 10% = $42.
        let decision = evaluate(
            &trade(1000.0, 0.42, 0),
            false,
            &follow(),
            &defaults(),
            SpendState::default(),
            Utc::now(),
        );
        let order = execute(decision);
        assert_eq!(order.usd_amount, 42.0);
        assert_eq!(order.mode, OrderMode::Market);
        assert_eq!(order.side, Side::Buy);
    }

    #[test]
    fn test_already_seen_rejected_without_marking() {
        let reason = reject(evaluate(
            &trade(100.0, 0.5, 0),
            true,
            &follow(),
            &defaults(),
            SpendState::default(),
            Utc::now(),
        ));
        assert_eq!(reason, RejectReason::AlreadySeen);
        assert!(!reason.marks_seen());
    }

    #[test]
    fn test_age_boundary_exact_is_accepted() {
        let now = Utc::now();
        let mut t = trade(1000.0, 0.42, 0);

        t.timestamp = Some(now - Duration::seconds(300));
        execute(evaluate(&t, false, &follow(), &defaults(), SpendState::default(), now));

        t.timestamp = Some(now - Duration::seconds(301));
        let reason = reject(evaluate(&t, false, &follow(), &defaults(), SpendState::default(), now));
        assert_eq!(reason, RejectReason::TooOld);
        assert!(reason.marks_seen());
    }

    #[test]
    fn test_missing_token_and_side() {
        let mut t = trade(100.0, 0.5, 0);
        t.token_id = None;
        let reason = reject(evaluate(&t, false, &follow(), &defaults(), SpendState::default(), Utc::now()));
        assert_eq!(reason, RejectReason::NoToken);

        let mut t = trade(100.0, 0.5, 0);
        t.side = None;
        t.raw_side = "MERGE".into();
        let reason = reject(evaluate(&t, false, &follow(), &defaults(), SpendState::default(), Utc::now()));
        assert_eq!(reason, RejectReason::InvalidSide);
        assert!(reason.marks_seen());
    }

    #[test]
    fn test_daily_limits_checked_in_order() {
        let spend = SpendState {
            global_spent: 500.0,
            trader_spent: 0.0,
        };
        let reason = reject(evaluate(
            &trade(100.0, 0.5, 0),
            false,
            &follow(),
            &defaults(),
            spend,
            Utc::now(),
        ));
        assert_eq!(reason, RejectReason::GlobalDailyLimit);
        assert!(!reason.marks_seen());

        let mut f = follow();
        f.max_daily_spend = Some(50.0);
        let spend = SpendState {
            global_spent: 100.0,
            trader_spent: 50.0,
        };
        let reason = reject(evaluate(&trade(100.0, 0.5, 0), false, &f, &defaults(), spend, Utc::now()));
        assert_eq!(reason, RejectReason::TraderDailyLimit);
    }

    #[test]
    fn test_remaining_budget_caps_order() {
        // $490 of $500 spent: a would-be $42 copy shrinks to the remainder.
        let spend = SpendState {
            global_spent: 490.0,
            trader_spent: 0.0,
        };
        let order = execute(evaluate(
            &trade(1000.0, 0.42, 0),
            false,
            &follow(),
            &defaults(),
            spend,
            Utc::now(),
        ));
        assert_eq!(order.usd_amount, 10.0);
    }

    #[test]
    fn test_min_max_clamp() {
        // Tiny original is raised to the minimum.
        let order = execute(evaluate(
            &trade(10.0, 0.5, 0),
            false,
            &follow(),
            &defaults(),
            SpendState::default(),
            Utc::now(),
        ));
        assert_eq!(order.usd_amount, 5.0);

        // Huge original is clamped to the maximum.
        let order = execute(evaluate(
            &trade(100_000.0, 0.5, 0),
            false,
            &follow(),
            &defaults(),
            SpendState::default(),
            Utc::now(),
        ));
        assert_eq!(order.usd_amount, 100.0);
    }

    #[test]
    fn test_limit_mode_slippage_and_cap() {
        let mut f = follow();
        f.order_mode = Some(OrderMode::Limit);
        f.limit_order_pct = Some(5.0);

        // 0.90 * 1.05 = 0.945, inside the cap.
        let order = execute(evaluate(
            &trade(1000.0, 0.90, 0),
            false,
            &f,
            &defaults(),
            SpendState::default(),
            Utc::now(),
        ));
        assert_eq!(order.mode, OrderMode::Limit);
        assert_eq!(order.limit_price, Some(0.945));
        let expected_shares = (order.usd_amount / 0.945 * 100.0).round() / 100.0;
        assert_eq!(order.shares, Some(expected_shares));

        // 0.98 * 1.05 would exceed 0.99: capped.
        let order = execute(evaluate(
            &trade(1000.0, 0.98, 0),
            false,
            &f,
            &defaults(),
            SpendState::default(),
            Utc::now(),
        ));
        assert_eq!(order.limit_price, Some(0.99));
    }

    #[test]
    fn test_limit_sell_floor() {
        assert_eq!(limit_price_for(0.02, Side::Sell, 60.0), Some(0.01));
        assert_eq!(limit_price_for(0.50, Side::Sell, 2.0), Some(0.49));
        assert_eq!(limit_price_for(0.0, Side::Sell, 2.0), None);
    }

    #[test]
    fn test_limit_mode_without_price_falls_back_to_market() {
        let mut f = follow();
        f.order_mode = Some(OrderMode::Limit);

        let order = execute(evaluate(
            &trade(55.0, 0.0, 0),
            false,
            &f,
            &defaults(),
            SpendState::default(),
            Utc::now(),
        ));
        assert_eq!(order.mode, OrderMode::Market);
        assert!(order.limit_price.is_none());
    }

    #[test]
    fn test_sizing_monotone_in_copy_percentage() {
        let t = trade(1000.0, 0.42, 0);
        let mut last = 0.0;
        for pct in [0.02, 0.05, 0.10, 0.15, 0.20] {
            let mut f = follow();
            f.copy_percentage = Some(pct);
            let order = execute(evaluate(&t, false, &f, &defaults(), SpendState::default(), Utc::now()));
            assert!(order.usd_amount >= last, "sizing must be monotone in pct");
            last = order.usd_amount;
        }
    }

    #[test]
    fn test_sizing_monotone_in_original_usd() {
        let mut last = 0.0;
        for size in [50.0, 100.0, 400.0, 900.0, 2000.0] {
            let order = execute(evaluate(
                &trade(size, 0.5, 0),
                false,
                &follow(),
                &defaults(),
                SpendState::default(),
                Utc::now(),
            ));
            assert!(order.usd_amount >= last, "sizing must be monotone in size");
            last = order.usd_amount;
        }
    }

    #[test]
    fn test_overrides_fall_back_to_defaults() {
        let mut f = follow();
        f.copy_percentage = Some(0.50);
        let settings = effective_settings(&f, &defaults());
        assert_eq!(settings.copy_percentage, 0.50);
        assert_eq!(settings.min_copy_size, 5.0);
        assert_eq!(settings.order_mode, OrderMode::Market);
    }
}
