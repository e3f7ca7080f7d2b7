use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::strategy::cleanup::CleanupMonitor;
use crate::strategy::config::EngineConfig;
use crate::strategy::errors::EngineError;
use crate::strategy::execution_backend::ExchangeBackend;
use crate::strategy::policy::{RiskPolicy, SymbolPolicyTable};
use crate::strategy::protection::ProtectiveOrderPlacer;
use crate::strategy::quantity::{format_qty, normalize_qty, sizing_quantity, NormalizedQty};
use crate::strategy::registry::{PositionKey, PositionRegistry};
use crate::strategy::risk::{enforce_min_tick_gap, price_for_pnl, ExitPrices};
use crate::strategy::symbol_meta::{SymbolMeta, SymbolMetaHandle};
use crate::strategy::trailing_stop::TrailingStopMonitor;
use crate::strategy::types::{
    underlying_symbol, MarketOrderRequest, OrderKind, PositionHandle, PositionSide, PositionSummary, Signal,
    SignalOutcome,
};

/// Steps of one signal's journey to a protected position.
/// Any failure leaves the machine through an `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    ClosingOpposite,
    Entering,
    AwaitingFill,
    ComputingRisk,
    PlacingProtection,
    Done,
}

/// Unique order-link id, e.g. `entry_3f2a...`.
pub fn new_link_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Turns a buy/sell signal into a leveraged position with TP/SL protection
/// and background monitors.
///
/// All coordination with other invocations goes through exchange state; the
/// only local shared state is the monitor registry.
pub struct EntryExecutor {
    backend: Arc<dyn ExchangeBackend>,
    config: EngineConfig,
    policies: SymbolPolicyTable,
    meta: SymbolMetaHandle,
    registry: PositionRegistry,
    placer: ProtectiveOrderPlacer,
}

impl EntryExecutor {
    pub fn new(
        backend: Arc<dyn ExchangeBackend>,
        config: EngineConfig,
        policies: SymbolPolicyTable,
        meta: SymbolMetaHandle,
    ) -> Self {
        let placer = ProtectiveOrderPlacer::new(Arc::clone(&backend));
        Self {
            backend,
            config,
            policies,
            meta,
            registry: PositionRegistry::new(),
            placer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PositionRegistry {
        &self.registry
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    /// Stop the monitors of one position (manual flatten). Exchange state is untouched.
    pub fn release(&self, symbol: &str, side: PositionSide) -> usize {
        self.registry.release(symbol, side)
    }

    /// Stop every running monitor.
    pub fn shutdown(&self) {
        info!(active = self.registry.active_count(), "[ENGINE] Cancelling all monitors");
        self.registry.shutdown();
    }

    /// Entry point for inbound signals. Input is validated before any remote call.
    pub async fn handle_signal(&self, signal: &str, symbol: &str) -> Result<SignalOutcome, EngineError> {
        if symbol.trim().is_empty() {
            return Err(EngineError::InvalidInput("symbol is required".into()));
        }
        let signal: Signal = signal.parse()?;

        let result = self.execute(signal, symbol).await;
        match &result {
            Ok(outcome) => debug!(%signal, symbol, ?outcome, "[ENTRY] Signal handled"),
            Err(e) => error!(%signal, symbol, reason = e.reason(), error = %e, "[ENTRY] Signal failed"),
        }
        result
    }

    fn advance(&self, state: &mut EntryState, next: EntryState, symbol: &str) {
        debug!(symbol, from = ?*state, to = ?next, "[ENTRY] State change");
        *state = next;
    }

    async fn execute(&self, signal: Signal, raw_symbol: &str) -> Result<SignalOutcome, EngineError> {
        let symbol = underlying_symbol(raw_symbol);
        let side = signal.side();
        let meta = self.meta.meta(&symbol);
        let policy = self.policies.policy_for(&symbol).clone();
        let mut state = EntryState::Idle;

        let qty = match self.order_quantity(&symbol, &meta).await? {
            Some(q) if !q.is_zero() => q,
            _ => {
                warn!(%symbol, "[ENTRY] Order quantity is 0, skipping entry");
                return Ok(SignalOutcome::Skipped { reason: "order quantity is zero".into() });
            }
        };

        let leverage = self.config.leverage;
        let applied = self
            .backend
            .set_leverage_and_mode(&symbol, leverage, leverage, self.config.margin_mode)
            .await?;
        if !applied {
            warn!(%symbol, leverage, "[ENTRY] Leverage/margin mode not confirmed, continuing");
        }

        let opposite = side.opposite();
        if self.backend.get_position_size(&symbol, opposite.position_idx()).await? > 0.0 {
            self.advance(&mut state, EntryState::ClosingOpposite, &symbol);
            self.close_opposite(&symbol, opposite, &meta).await?;
        }

        if self.backend.get_position_size(&symbol, side.position_idx()).await? > 0.0 {
            info!(%symbol, %side, "[ENTRY] Position already open, not entering again");
            return Ok(SignalOutcome::AlreadyOpen);
        }

        self.advance(&mut state, EntryState::Entering, &symbol);
        let entry_order = MarketOrderRequest {
            symbol: symbol.clone(),
            side: side.entry_order_side(),
            qty: qty.text.clone(),
            position_idx: side.position_idx(),
            reduce_only: false,
            order_link_id: new_link_id("entry"),
        };
        info!(%symbol, %side, qty = %qty.text, link_id = %entry_order.order_link_id, "[ENTRY] Submitting market entry");
        self.backend.submit_market_order(entry_order).await?;

        self.advance(&mut state, EntryState::AwaitingFill, &symbol);
        let filled_size = self.await_fill(&symbol, side).await?;

        self.advance(&mut state, EntryState::ComputingRisk, &symbol);
        let entry_price = self.resolve_entry_price(&symbol, side).await?;
        let tick = meta.tick_size;
        let raw = price_for_pnl(entry_price, side, policy.tp, policy.sl, self.config.commission, leverage);
        let prices = ExitPrices {
            take_profit: enforce_min_tick_gap(entry_price, raw.take_profit, tick, self.config.min_tick_gap),
            stop_loss: enforce_min_tick_gap(entry_price, raw.stop_loss, tick, self.config.min_tick_gap),
        };
        info!(
            %symbol,
            %side,
            entry_price,
            tp = prices.take_profit,
            sl = prices.stop_loss,
            tick,
            "[ENTRY] Exit prices computed"
        );

        let handle = Arc::new(PositionHandle {
            symbol: symbol.clone(),
            side,
            entry_price,
            leverage,
            quantity: filled_size,
            tick_size: tick,
            tp_order_id: new_link_id("tp"),
            sl_order_id: new_link_id("sl"),
        });

        self.advance(&mut state, EntryState::PlacingProtection, &symbol);
        let protection_qty = normalize_qty(&meta, filled_size, OrderKind::Limit);
        let protection = self.placer.place(&handle, &protection_qty.text, prices).await;

        let trailing_monitor = self.start_monitors(&handle, &policy);

        self.advance(&mut state, EntryState::Done, &symbol);
        Ok(SignalOutcome::Opened(PositionSummary {
            symbol,
            side,
            quantity: filled_size,
            entry_price,
            take_profit: prices.take_profit,
            stop_loss: prices.stop_loss,
            trailing_monitor,
            protection,
        }))
    }

    /// Size the entry from balance and last price. `None` when either is unusable.
    async fn order_quantity(&self, symbol: &str, meta: &SymbolMeta) -> Result<Option<NormalizedQty>, EngineError> {
        let price = self.backend.get_last_price(symbol).await?;
        let balance = self.backend.get_balance().await?;
        let qty = sizing_quantity(meta, balance, price, self.config.leverage, self.config.risk_ratio);
        info!(
            symbol,
            price,
            balance,
            qty = qty.as_ref().map(|q| q.text.as_str()).unwrap_or("0"),
            "[ENTRY] Order quantity"
        );
        Ok(qty)
    }

    /// Flatten `side` with reduce-only market orders, re-reading the live
    /// size before every attempt.
    async fn close_opposite(&self, symbol: &str, side: PositionSide, meta: &SymbolMeta) -> Result<(), EngineError> {
        let idx = side.position_idx();
        let retries = self.config.close_max_retries;

        for attempt in 1..=retries {
            let size = match self.backend.get_position_size(symbol, idx).await {
                Ok(size) => size,
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "[ENTRY] Position read failed before close");
                    tokio::time::sleep(self.config.close_poll_interval).await;
                    continue;
                }
            };
            if size <= 0.0 {
                return Ok(());
            }

            let close_order = MarketOrderRequest {
                symbol: symbol.to_string(),
                side: side.exit_order_side(),
                qty: format_qty(size, meta.precision),
                position_idx: idx,
                reduce_only: true,
                order_link_id: new_link_id("close"),
            };
            info!(symbol, %side, size, attempt, "[ENTRY] Closing opposite position");
            if let Err(e) = self.backend.submit_market_order(close_order).await {
                warn!(symbol, attempt, error = %e, "[ENTRY] Close order failed");
            }

            if self.poll_until_flat(symbol, idx, self.config.close_wait).await {
                info!(symbol, %side, attempt, "[ENTRY] Opposite position closed");
                return Ok(());
            }
        }

        Err(EngineError::OppositeCloseTimeout {
            symbol: symbol.to_string(),
            attempts: retries,
        })
    }

    async fn poll_until_flat(&self, symbol: &str, idx: u8, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            tokio::time::sleep(self.config.close_poll_interval).await;
            match self.backend.get_position_size(symbol, idx).await {
                Ok(size) if size <= 0.0 => return true,
                Ok(_) => {}
                Err(e) => warn!(symbol, error = %e, "[ENTRY] Position read failed while closing"),
            }
        }
        false
    }

    /// Wait for the entry to show up as a position; returns its size.
    async fn await_fill(&self, symbol: &str, side: PositionSide) -> Result<f64, EngineError> {
        let timeout = self.config.fill_timeout;
        let start = Instant::now();
        loop {
            match self.backend.get_position_size(symbol, side.position_idx()).await {
                Ok(size) if size > 0.0 => {
                    info!(symbol, %side, size, waited = ?start.elapsed(), "[ENTRY] Entry filled");
                    return Ok(size);
                }
                Ok(_) => {}
                Err(e) => warn!(symbol, error = %e, "[ENTRY] Position read failed while awaiting fill"),
            }
            if start.elapsed() >= timeout {
                return Err(EngineError::FillTimeout {
                    symbol: symbol.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.config.fill_poll_interval).await;
        }
    }

    /// Position average price, falling back to the last traded price.
    async fn resolve_entry_price(&self, symbol: &str, side: PositionSide) -> Result<f64, EngineError> {
        let min = self.config.min_entry_price;

        match self.backend.get_position_entry_price(symbol, side.position_idx()).await {
            Ok(Some(price)) if price >= min => return Ok(price),
            Ok(other) => warn!(symbol, price = ?other, "[ENTRY] No usable position price, using last price"),
            Err(e) => warn!(symbol, error = %e, "[ENTRY] Entry price read failed, using last price"),
        }

        match self.backend.get_last_price(symbol).await {
            Ok(price) if price >= min => Ok(price),
            Ok(price) => {
                warn!(symbol, price, "[ENTRY] Last price implausible");
                Err(EngineError::NoEntryPrice { symbol: symbol.to_string() })
            }
            Err(e) => {
                warn!(symbol, error = %e, "[ENTRY] Last price read failed");
                Err(EngineError::NoEntryPrice { symbol: symbol.to_string() })
            }
        }
    }

    /// Spawn the cleanup monitor and, when the policy has a ladder, the
    /// trailing-stop monitor. Returns whether a trailing monitor was started.
    fn start_monitors(&self, handle: &Arc<PositionHandle>, policy: &RiskPolicy) -> bool {
        let key = PositionKey::new(&handle.symbol, handle.side);
        let Some(lease) = self.registry.try_register(key, self.config.dedupe_monitors) else {
            info!(symbol = %handle.symbol, side = %handle.side, "[ENTRY] Monitors already running for this position");
            return false;
        };
        let lease = Arc::new(lease);
        let interval = self.config.monitor_interval;

        let trailing = policy.has_trailing();
        if trailing {
            TrailingStopMonitor::new(
                Arc::clone(&self.backend),
                Arc::clone(handle),
                policy.trailing_steps.clone(),
                self.config.commission,
                interval,
            )
            .spawn(Arc::clone(&lease));
        }

        CleanupMonitor::new(Arc::clone(&self.backend), Arc::clone(handle), interval).spawn(lease);
        trailing
    }
}
