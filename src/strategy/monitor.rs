use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of a single monitor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Position still open, keep polling.
    Active,
    /// Position size observed as zero; the monitor is done.
    Closed,
}

/// Why a background monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    PositionClosed,
    Cancelled,
}

/// Sleep for `interval` unless `token` fires first. Returns `false` when cancelled.
pub(crate) async fn wait_or_cancel(token: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}
