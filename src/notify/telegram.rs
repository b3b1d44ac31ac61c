//! Telegram trade alerts.
//!
//! Fired on trade detection and on execution outcome. Send failures are
//! logged and swallowed; notifications never block the pipeline.

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::models::{Config, OrderMode, Side, TradeStatus};

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &Config, client: Client) -> Self {
        let notifier = Self {
            client,
            bot_token: config.telegram_bot_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
        };
        if notifier.enabled() {
            debug!("Telegram notifications enabled");
        }
        notifier
    }

    pub fn enabled(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    async fn send(&self, text: String) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return;
        };
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let result = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await;

        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "Telegram send failed");
            }
            Err(e) => warn!(error = %e, "Telegram send error"),
            _ => {}
        }
    }

    /// Alert: a followed trader made a trade.
    pub async fn trader_trade_alert(
        &self,
        trader_address: &str,
        trader_alias: &str,
        side: Side,
        market: &str,
        size: f64,
        price: f64,
    ) {
        if !self.enabled() {
            return;
        }
        let emoji = match side {
            Side::Buy => "\u{1f7e2}",
            Side::Sell => "\u{1f534}",
        };
        let usd = if price > 0.0 { size * price } else { size };
        let market: String = market.chars().take(80).collect();
        self.send(format!(
            "{emoji} <b>TRADER TRADE DETECTED</b>\n\n\
             <b>Trader:</b> {trader_alias}\n\
             <code>{trader_address}</code>\n\
             <b>Side:</b> {}\n\
             <b>Market:</b> {market}\n\
             <b>Size:</b> {size:.2} shares @ ${price:.4}\n\
             <b>Value:</b> ${usd:.2}\n",
            side.as_str(),
        ))
        .await;
    }

    /// Alert: a copy order was submitted (or dry-run logged).
    pub async fn copy_trade_alert(
        &self,
        trader_alias: &str,
        side: Side,
        market: &str,
        copy_size: f64,
        price: f64,
        mode: OrderMode,
        status: TradeStatus,
    ) {
        if !self.enabled() {
            return;
        }
        let (emoji, label) = match status {
            TradeStatus::Executed => ("\u{2705}", "EXECUTED"),
            TradeStatus::Failed => ("\u{274c}", "FAILED"),
            TradeStatus::DryRun => ("\u{1f4dd}", "DRY RUN"),
        };
        let market: String = market.chars().take(80).collect();
        self.send(format!(
            "{emoji} <b>COPY TRADE {label}</b>\n\n\
             <b>Copying:</b> {trader_alias}\n\
             <b>Side:</b> {}\n\
             <b>Market:</b> {market}\n\
             <b>Amount:</b> ${copy_size:.2}\n\
             <b>Price:</b> ${price:.4}\n\
             <b>Mode:</b> {}\n",
            side.as_str(),
            mode.as_str().to_uppercase(),
        ))
        .await;
    }
}
