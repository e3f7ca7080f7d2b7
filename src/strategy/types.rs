use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::strategy::errors::EngineError;
use crate::strategy::protection::ProtectionReport;

/// Direction requested by an inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
}

impl Signal {
    /// Position the signal asks us to hold.
    pub fn side(self) -> PositionSide {
        match self {
            Signal::Buy => PositionSide::Long,
            Signal::Sell => PositionSide::Short,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Buy => "buy",
            Signal::Sell => "sell",
        }
    }
}

impl FromStr for Signal {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Signal::Buy),
            "sell" => Ok(Signal::Sell),
            other => Err(EngineError::InvalidInput(format!("unknown signal '{}'", other))),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of a hedge-mode position.
///
/// Bybit identifies positions by `positionIdx` rather than by side name:
/// 1 is the long slot, 2 the short slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn position_idx(self) -> u8 {
        match self {
            PositionSide::Long => 1,
            PositionSide::Short => 2,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that grows this position.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position.
    pub fn exit_order_side(self) -> OrderSide {
        self.entry_order_side().flip()
    }

    /// +1 for long, -1 for short.
    pub fn direction(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn flip(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// Market orders are bounded by the tighter `maxMktOrderQty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginMode::Isolated => "ISOLATED",
            MarginMode::Cross => "CROSS",
        }
    }
}

impl FromStr for MarginMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ISOLATED" | "ISOLATED_MARGIN" => Ok(MarginMode::Isolated),
            "CROSS" | "REGULAR_MARGIN" => Ok(MarginMode::Cross),
            other => Err(format!("unknown margin mode '{}'", other)),
        }
    }
}

/// Live view of one position slot as reported by the exchange.
/// An empty slot reads as `size == 0.0` with no prices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionInfo {
    pub size: f64,
    pub avg_price: Option<f64>,
    pub mark_price: Option<f64>,
}

/// Resting order as listed by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub order_link_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    /// Exact wire quantity, already normalized.
    pub qty: String,
    pub position_idx: u8,
    pub reduce_only: bool,
    pub order_link_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: String,
    pub price: String,
    pub position_idx: u8,
    pub reduce_only: bool,
    pub order_link_id: String,
}

/// State of one managed position, created once the market entry is
/// confirmed and shared read-only with its monitors.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionHandle {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub leverage: u32,
    pub quantity: f64,
    pub tick_size: f64,
    pub tp_order_id: String,
    pub sl_order_id: String,
}

impl PositionHandle {
    pub fn position_idx(&self) -> u8 {
        self.side.position_idx()
    }

    /// True when `link_id` belongs to one of this position's protective orders.
    pub fn owns_order(&self, link_id: &str) -> bool {
        link_id == self.tp_order_id || link_id == self.sl_order_id
    }
}

/// Summary returned to the caller after a successful entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub trailing_monitor: bool,
    pub protection: ProtectionReport,
}

/// Successful result of handling a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened(PositionSummary),
    /// A same-side position already exists; nothing was submitted.
    AlreadyOpen,
    /// Computed order quantity was zero; nothing was submitted.
    Skipped { reason: String },
}

/// TradingView perpetual tickers carry a `.P` suffix that Bybit does not know.
pub fn underlying_symbol(symbol: &str) -> String {
    symbol.trim().trim_end_matches(".P").to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!("buy".parse::<Signal>().unwrap(), Signal::Buy);
        assert_eq!(" SELL ".parse::<Signal>().unwrap(), Signal::Sell);
        assert!("hold".parse::<Signal>().is_err());
        assert!("".parse::<Signal>().is_err());
    }

    #[test]
    fn test_position_idx_mapping() {
        assert_eq!(PositionSide::Long.position_idx(), 1);
        assert_eq!(PositionSide::Short.position_idx(), 2);
        assert_eq!(PositionSide::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.exit_order_side(), OrderSide::Buy);
        assert_eq!(Signal::Sell.side().opposite(), PositionSide::Long);
    }

    #[test]
    fn test_underlying_symbol_strips_perp_suffix() {
        assert_eq!(underlying_symbol("BTCUSDT.P"), "BTCUSDT");
        assert_eq!(underlying_symbol("ethusdt"), "ETHUSDT");
        assert_eq!(underlying_symbol("DOGEUSDT"), "DOGEUSDT");
    }
}
