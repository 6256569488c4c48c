//! Alert message rendering.

use crate::market::MarketData;
use kolwatch_core::{is_native_mint, reserve_symbol, TradeEvent};
use rust_decimal::Decimal;
use std::fmt::Write;

pub const SOLSCAN_TX_URL: &str = "https://solscan.io/tx";

/// Output flavor of a rendered alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStyle {
    Plain,
    /// Telegram HTML parse mode
    Html,
}

/// A trade event rendered for every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub chat_html: String,
    pub subject: String,
    pub text: String,
    pub mail_html: String,
}

impl AlertMessage {
    pub fn render(event: &TradeEvent, market: Option<&MarketData>) -> Self {
        let text = render_trade(event, market, MessageStyle::Plain);
        Self {
            chat_html: render_trade(event, market, MessageStyle::Html),
            subject: mail_subject(event),
            mail_html: text_to_html(&text),
            text,
        }
    }
}

pub fn mail_subject(event: &TradeEvent) -> String {
    format!(
        "🔔 KOL Trade Alert - {} {}",
        event.signer_name, event.operation
    )
}

/// Render the alert body.
pub fn render_trade(event: &TradeEvent, market: Option<&MarketData>, style: MessageStyle) -> String {
    let mut msg = String::new();
    let op = event.operation.as_str();

    let _ = writeln!(msg, "{}\n", bold(style, "🔔 New trade detected"));
    let _ = writeln!(
        msg,
        "{} {} ({})",
        bold(style, "Trader:"),
        escape(style, &event.signer_name),
        code(style, &event.signer)
    );
    let _ = writeln!(msg, "{} {}", bold(style, "Operation:"), op);

    if !event.sol_change.is_zero() {
        let _ = writeln!(
            msg,
            "\n{} {:.6} ({})",
            bold(style, "SOL change:"),
            event.sol_change.abs(),
            op
        );
    }

    if !is_native_mint(&event.source_asset) {
        let symbol = reserve_symbol(&event.source_asset).unwrap_or("tokens");
        let _ = writeln!(
            msg,
            "{} {} {}",
            bold(style, "Paid with:"),
            format_amount(event.source_change),
            symbol
        );
    }

    let _ = writeln!(msg, "\n{}", bold(style, "Token:"));
    if let Some(market) = market {
        let _ = writeln!(msg, "- Symbol: {}", escape(style, &market.symbol));
    }
    let _ = writeln!(msg, "- Contract: {}", code(style, &event.target_asset));
    let _ = writeln!(
        msg,
        "- Amount: {} ({})",
        format_amount(event.target_change),
        op
    );

    if let Some(market) = market {
        let _ = writeln!(msg, "\n{}", bold(style, "Market:"));
        let _ = writeln!(msg, "- Price: {}", format_price(market.price_usd));
        let _ = writeln!(msg, "- 24h change: {:.2}%", market.price_change_24h);
        let _ = writeln!(msg, "- Market cap: {}", format_market_cap(market.market_cap));
        let _ = writeln!(
            msg,
            "- Updated: {}",
            market.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    let _ = writeln!(
        msg,
        "\n{} {}",
        bold(style, "Venue:"),
        escape(style, &event.venue.to_string())
    );
    let link = format!("{}/{}", SOLSCAN_TX_URL, event.signature);
    match style {
        MessageStyle::Plain => {
            let _ = writeln!(msg, "Transaction: {}", link);
        }
        MessageStyle::Html => {
            let _ = writeln!(msg, "<a href=\"{}\">View transaction</a>", link);
        }
    }
    let _ = write!(
        msg,
        "{} {}",
        bold(style, "Time:"),
        event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );

    msg
}

/// Escape then turn newlines into `<br>` for the mail HTML part.
pub fn text_to_html(text: &str) -> String {
    escape_html(text).replace('\n', "<br>")
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Format market cap as `$x.xxB`, `$x.xxM`, `$x.xxK` or `$x.xx`.
pub fn format_market_cap(value: f64) -> String {
    if value >= 1e9 {
        format!("${:.2}B", value / 1e9)
    } else if value >= 1e6 {
        format!("${:.2}M", value / 1e6)
    } else if value >= 1e3 {
        format!("${:.2}K", value / 1e3)
    } else {
        format!("${:.2}", value)
    }
}

/// Format price with precision scaled to its magnitude.
pub fn format_price(price: f64) -> String {
    if price == 0.0 {
        return "$0".to_string();
    }
    let abs_price = price.abs();
    if abs_price >= 1000.0 {
        format!("${:.2}", price)
    } else if abs_price >= 1.0 {
        format!("${:.4}", price)
    } else if abs_price >= 0.01 {
        format!("${:.6}", price)
    } else if abs_price >= 0.0001 {
        format!("${:.8}", price)
    } else {
        format!("${:.10}", price)
    }
}

/// Absolute amount, at most 9 decimals, trailing zeros dropped.
pub fn format_amount(amount: Decimal) -> String {
    amount.abs().round_dp(9).normalize().to_string()
}

fn bold(style: MessageStyle, text: &str) -> String {
    match style {
        MessageStyle::Plain => text.to_string(),
        MessageStyle::Html => format!("<b>{}</b>", text),
    }
}

fn code(style: MessageStyle, text: &str) -> String {
    match style {
        MessageStyle::Plain => text.to_string(),
        MessageStyle::Html => format!("<code>{}</code>", escape_html(text)),
    }
}

fn escape(style: MessageStyle, text: &str) -> String {
    match style {
        MessageStyle::Plain => text.to_string(),
        MessageStyle::Html => escape_html(text),
    }
}
