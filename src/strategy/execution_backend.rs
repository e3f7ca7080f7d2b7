use std::collections::HashMap;

use crate::strategy::errors::ExchangeError;
use crate::strategy::symbol_meta::SymbolMeta;
use crate::strategy::types::{LimitOrderRequest, MarginMode, MarketOrderRequest, OpenOrder, PositionInfo};

/// Remote operations the engine needs from a derivatives exchange
/// (live Bybit, paper, or a test double).
///
/// Every call is a single request; retries and polling belong to the engine.
#[async_trait::async_trait]
pub trait ExchangeBackend: Send + Sync {
    /// Trading rules for every linear instrument.
    async fn get_instrument_meta(&self) -> Result<HashMap<String, SymbolMeta>, ExchangeError>;

    /// Wallet balance of the settlement coin.
    async fn get_balance(&self) -> Result<f64, ExchangeError>;

    /// Set leverage and margin mode. Idempotent: "already set" is `Ok(true)`.
    async fn set_leverage_and_mode(
        &self,
        symbol: &str,
        buy_leverage: u32,
        sell_leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<bool, ExchangeError>;

    /// Position slot `position_idx` of `symbol`. An empty slot is size 0.
    async fn get_position(&self, symbol: &str, position_idx: u8) -> Result<PositionInfo, ExchangeError>;

    async fn get_position_size(&self, symbol: &str, position_idx: u8) -> Result<f64, ExchangeError> {
        Ok(self.get_position(symbol, position_idx).await?.size)
    }

    async fn get_position_entry_price(&self, symbol: &str, position_idx: u8) -> Result<Option<f64>, ExchangeError> {
        Ok(self.get_position(symbol, position_idx).await?.avg_price)
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Returns the exchange order id.
    async fn submit_market_order(&self, order: MarketOrderRequest) -> Result<String, ExchangeError>;

    /// Returns the exchange order id.
    async fn submit_limit_order(&self, order: LimitOrderRequest) -> Result<String, ExchangeError>;

    /// Position-level TP/SL. `None` leaves that leg untouched.
    async fn set_native_stop(
        &self,
        symbol: &str,
        position_idx: u8,
        take_profit: Option<String>,
        stop_loss: Option<String>,
    ) -> Result<(), ExchangeError>;

    /// Remove both position-level legs.
    async fn clear_native_stop(&self, symbol: &str, position_idx: u8) -> Result<(), ExchangeError>;

    async fn list_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Name of this backend (for logging)
    fn backend_name(&self) -> &str;
}
