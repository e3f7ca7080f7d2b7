use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::strategy::execution_backend::ExchangeBackend;
use crate::strategy::risk::{format_price, round_to_tick, ExitPrices};
use crate::strategy::types::{LimitOrderRequest, PositionHandle};

/// What actually made it onto the exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProtectionReport {
    pub take_profit_order: Option<String>,
    pub stop_loss_order: Option<String>,
    pub native_stop: bool,
}

impl ProtectionReport {
    /// No protective layer was accepted at all.
    pub fn is_unprotected(&self) -> bool {
        self.take_profit_order.is_none() && self.stop_loss_order.is_none() && !self.native_stop
    }
}

/// Places the two protective layers of a position: reduce-only limit
/// orders at TP/SL, plus the exchange's position-level TP/SL.
///
/// Layers are independent; one failing does not stop the others.
pub struct ProtectiveOrderPlacer {
    backend: Arc<dyn ExchangeBackend>,
}

impl ProtectiveOrderPlacer {
    pub fn new(backend: Arc<dyn ExchangeBackend>) -> Self {
        Self { backend }
    }

    pub async fn place(&self, handle: &PositionHandle, qty: &str, prices: ExitPrices) -> ProtectionReport {
        let tick = handle.tick_size;
        let tp_price = format_price(round_to_tick(prices.take_profit, tick), tick);
        let sl_price = format_price(round_to_tick(prices.stop_loss, tick), tick);
        let side = handle.side.exit_order_side();

        info!(
            symbol = %handle.symbol,
            side = side.as_str(),
            qty,
            tp = %tp_price,
            sl = %sl_price,
            "[PROTECT] Placing TP/SL orders"
        );

        let mut report = ProtectionReport::default();

        let tp_order = LimitOrderRequest {
            symbol: handle.symbol.clone(),
            side,
            qty: qty.to_string(),
            price: tp_price.clone(),
            position_idx: handle.position_idx(),
            reduce_only: true,
            order_link_id: handle.tp_order_id.clone(),
        };
        match self.backend.submit_limit_order(tp_order).await {
            Ok(order_id) => report.take_profit_order = Some(order_id),
            Err(e) => warn!(symbol = %handle.symbol, error = %e, "[PROTECT] TP limit order failed"),
        }

        let sl_order = LimitOrderRequest {
            symbol: handle.symbol.clone(),
            side,
            qty: qty.to_string(),
            price: sl_price.clone(),
            position_idx: handle.position_idx(),
            reduce_only: true,
            order_link_id: handle.sl_order_id.clone(),
        };
        match self.backend.submit_limit_order(sl_order).await {
            Ok(order_id) => report.stop_loss_order = Some(order_id),
            Err(e) => warn!(symbol = %handle.symbol, error = %e, "[PROTECT] SL limit order failed"),
        }

        match self
            .backend
            .set_native_stop(&handle.symbol, handle.position_idx(), Some(tp_price), Some(sl_price))
            .await
        {
            Ok(()) => report.native_stop = true,
            Err(e) => warn!(symbol = %handle.symbol, error = %e, "[PROTECT] Native trading stop failed"),
        }

        if report.is_unprotected() {
            warn!(symbol = %handle.symbol, side = %handle.side, "[PROTECT] Position has no protection in place");
        }

        report
    }
}
