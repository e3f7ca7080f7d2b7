use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::strategy::errors::ExchangeError;
use crate::strategy::execution_backend::ExchangeBackend;
use crate::strategy::monitor::{wait_or_cancel, MonitorExit, PollState};
use crate::strategy::registry::MonitorLease;
use crate::strategy::types::PositionHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupReport {
    pub exit: MonitorExit,
    pub cancelled_orders: usize,
}

/// Waits for a position to close, then removes whatever protection is left:
/// the sibling limit order and the position-level TP/SL.
pub struct CleanupMonitor {
    backend: Arc<dyn ExchangeBackend>,
    handle: Arc<PositionHandle>,
    interval: Duration,
    cancelled_orders: usize,
}

impl CleanupMonitor {
    pub fn new(backend: Arc<dyn ExchangeBackend>, handle: Arc<PositionHandle>, interval: Duration) -> Self {
        Self {
            backend,
            handle,
            interval,
            cancelled_orders: 0,
        }
    }

    pub async fn poll_once(&mut self) -> Result<PollState, ExchangeError> {
        let handle = Arc::clone(&self.handle);
        let size = self.backend.get_position_size(&handle.symbol, handle.position_idx()).await?;
        if size > 0.0 {
            return Ok(PollState::Active);
        }

        info!(symbol = %handle.symbol, side = %handle.side, "[CLEANUP] Position closed, removing leftover protection");

        // Listing must succeed before we call the position cleaned up.
        let open_orders = self.backend.list_open_orders(&handle.symbol).await?;
        let mut cancel_error = None;
        for order in open_orders.iter().filter(|o| handle.owns_order(&o.order_link_id)) {
            match self.backend.cancel_order(&handle.symbol, &order.order_id).await {
                Ok(()) => {
                    self.cancelled_orders += 1;
                    info!(symbol = %handle.symbol, order_id = %order.order_id, link_id = %order.order_link_id, "[CLEANUP] Cancelled order");
                }
                Err(e) => {
                    warn!(symbol = %handle.symbol, order_id = %order.order_id, error = %e, "[CLEANUP] Cancel failed");
                    cancel_error = Some(e);
                }
            }
        }
        // An owned order is still resting; list and cancel again next tick.
        if let Some(e) = cancel_error {
            return Err(e);
        }

        if let Err(e) = self.backend.clear_native_stop(&handle.symbol, handle.position_idx()).await {
            warn!(symbol = %handle.symbol, error = %e, "[CLEANUP] Clearing trading stop failed");
        }

        Ok(PollState::Closed)
    }

    pub async fn run(mut self, token: CancellationToken) -> CleanupReport {
        info!(symbol = %self.handle.symbol, side = %self.handle.side, "[CLEANUP] Monitor started");
        let exit = loop {
            if token.is_cancelled() {
                break MonitorExit::Cancelled;
            }
            match self.poll_once().await {
                Ok(PollState::Closed) => break MonitorExit::PositionClosed,
                Ok(PollState::Active) => {}
                Err(e) => warn!(symbol = %self.handle.symbol, error = %e, "[CLEANUP] Poll failed, retrying"),
            }
            if !wait_or_cancel(&token, self.interval).await {
                break MonitorExit::Cancelled;
            }
        };

        info!(symbol = %self.handle.symbol, ?exit, cancelled = self.cancelled_orders, "[CLEANUP] Monitor stopped");
        CleanupReport {
            exit,
            cancelled_orders: self.cancelled_orders,
        }
    }

    pub fn spawn(self, lease: Arc<MonitorLease>) -> JoinHandle<CleanupReport> {
        tokio::spawn(async move {
            let token = lease.token().clone();
            let report = self.run(token).await;
            drop(lease);
            report
        })
    }
}
