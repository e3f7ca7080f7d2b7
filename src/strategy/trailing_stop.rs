use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::strategy::errors::ExchangeError;
use crate::strategy::execution_backend::ExchangeBackend;
use crate::strategy::monitor::{wait_or_cancel, MonitorExit, PollState};
use crate::strategy::policy::TrailingStep;
use crate::strategy::registry::MonitorLease;
use crate::strategy::risk::{format_price, pnl_rate, round_to_tick, stop_loss_price};
use crate::strategy::types::PositionHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct TrailingReport {
    pub exit: MonitorExit,
    /// Indices of ladder steps that fired, in firing order.
    pub fired: Vec<usize>,
}

/// Walks a position's stop up the trailing ladder as unrealized PnL grows.
///
/// Steps are checked in definition order and each fires at most once. Only
/// the native stop-loss moves; the take-profit is left as placed.
pub struct TrailingStopMonitor {
    backend: Arc<dyn ExchangeBackend>,
    handle: Arc<PositionHandle>,
    steps: Vec<TrailingStep>,
    commission: f64,
    interval: Duration,
    triggered: Vec<bool>,
    fired: Vec<usize>,
}

impl TrailingStopMonitor {
    pub fn new(
        backend: Arc<dyn ExchangeBackend>,
        handle: Arc<PositionHandle>,
        steps: Vec<TrailingStep>,
        commission: f64,
        interval: Duration,
    ) -> Self {
        let triggered = vec![false; steps.len()];
        Self {
            backend,
            handle,
            steps,
            commission,
            interval,
            triggered,
            fired: Vec::new(),
        }
    }

    pub fn fired(&self) -> &[usize] {
        &self.fired
    }

    /// One poll of the position. A step is only marked triggered once the
    /// exchange accepted the new stop, so a failed push is retried next tick.
    pub async fn poll_once(&mut self) -> Result<PollState, ExchangeError> {
        let handle = Arc::clone(&self.handle);
        let position = self.backend.get_position(&handle.symbol, handle.position_idx()).await?;
        if position.size <= 0.0 {
            return Ok(PollState::Closed);
        }

        let entry = position
            .avg_price
            .filter(|p| *p > 0.0)
            .unwrap_or(handle.entry_price);
        let mark = position.mark_price.filter(|p| *p > 0.0).unwrap_or(entry);
        let rate = pnl_rate(handle.side, entry, mark, handle.leverage);

        debug!(symbol = %handle.symbol, side = %handle.side, entry, mark, pnl_rate = rate, "[TRAIL] Poll");

        for i in 0..self.steps.len() {
            if self.triggered[i] {
                continue;
            }
            let step = self.steps[i];
            if rate < step.trigger {
                continue;
            }

            let new_sl = stop_loss_price(entry, handle.side, step.sl, self.commission, handle.leverage);
            let new_sl = round_to_tick(new_sl, handle.tick_size);
            self.backend
                .set_native_stop(
                    &handle.symbol,
                    handle.position_idx(),
                    None,
                    Some(format_price(new_sl, handle.tick_size)),
                )
                .await?;

            self.triggered[i] = true;
            self.fired.push(i);
            info!(
                symbol = %handle.symbol,
                side = %handle.side,
                step = i + 1,
                lock_in = step.sl,
                stop = new_sl,
                "[TRAIL] Stop raised"
            );
        }

        Ok(PollState::Active)
    }

    /// Poll until the position closes or `token` is cancelled. Remote
    /// errors are logged and retried on the next tick.
    pub async fn run(mut self, token: CancellationToken) -> TrailingReport {
        info!(symbol = %self.handle.symbol, side = %self.handle.side, steps = self.steps.len(), "[TRAIL] Monitor started");
        let exit = loop {
            if token.is_cancelled() {
                break MonitorExit::Cancelled;
            }
            match self.poll_once().await {
                Ok(PollState::Closed) => break MonitorExit::PositionClosed,
                Ok(PollState::Active) => {}
                Err(e) => warn!(symbol = %self.handle.symbol, error = %e, "[TRAIL] Poll failed, retrying"),
            }
            if !wait_or_cancel(&token, self.interval).await {
                break MonitorExit::Cancelled;
            }
        };

        info!(symbol = %self.handle.symbol, side = %self.handle.side, ?exit, fired = self.fired.len(), "[TRAIL] Monitor stopped");
        TrailingReport { exit, fired: self.fired }
    }

    /// Run on a background task, holding `lease` until it finishes.
    pub fn spawn(self, lease: Arc<MonitorLease>) -> JoinHandle<TrailingReport> {
        tokio::spawn(async move {
            let token = lease.token().clone();
            let report = self.run(token).await;
            drop(lease);
            report
        })
    }
}
