use crate::strategy::quantity::round_to_decimals;
use crate::strategy::symbol_meta::precision_from_step_f64;
use crate::strategy::types::PositionSide;

const TICK_EPSILON: f64 = 1e-9;

/// Absolute take-profit and stop-loss prices for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPrices {
    pub take_profit: f64,
    pub stop_loss: f64,
}

/// Price at which the position realizes `tp_rate` of margin after the
/// round-trip `commission`.
///
/// Leverage divides the price move needed for a given account-level rate.
pub fn take_profit_price(entry: f64, side: PositionSide, tp_rate: f64, commission: f64, leverage: u32) -> f64 {
    let lev = leverage as f64;
    match side {
        PositionSide::Long => entry * (1.0 + (tp_rate + commission) / lev),
        PositionSide::Short => entry * (1.0 - (tp_rate - commission) / lev),
    }
}

/// Price at which the position realizes `sl_rate` (negative for a loss,
/// positive when a trailing step locks in profit).
pub fn stop_loss_price(entry: f64, side: PositionSide, sl_rate: f64, commission: f64, leverage: u32) -> f64 {
    let lev = leverage as f64;
    match side {
        PositionSide::Long => entry * (1.0 + (sl_rate - commission) / lev),
        PositionSide::Short => entry * (1.0 - (sl_rate + commission) / lev),
    }
}

pub fn price_for_pnl(
    entry: f64,
    side: PositionSide,
    tp_rate: f64,
    sl_rate: f64,
    commission: f64,
    leverage: u32,
) -> ExitPrices {
    ExitPrices {
        take_profit: take_profit_price(entry, side, tp_rate, commission, leverage),
        stop_loss: stop_loss_price(entry, side, sl_rate, commission, leverage),
    }
}

/// Snap to the nearest multiple of `tick`, dropping float noise past the
/// tick's own decimals.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    let decimals = precision_from_step_f64(tick);
    round_to_decimals((price / tick).round() * tick, decimals)
}

fn snap_up(price: f64, tick: f64) -> f64 {
    round_to_decimals(((price / tick) - TICK_EPSILON).ceil() * tick, precision_from_step_f64(tick))
}

fn snap_down(price: f64, tick: f64) -> f64 {
    round_to_decimals(((price / tick) + TICK_EPSILON).floor() * tick, precision_from_step_f64(tick))
}

/// Keep `target` at least `min_gap_ticks` ticks away from `entry`, on the
/// side of entry it started on.
///
/// A pushed target is snapped away from entry so that tick rounding cannot
/// pull it back inside the gap.
pub fn enforce_min_tick_gap(entry: f64, target: f64, tick: f64, min_gap_ticks: u32) -> f64 {
    let rounded = round_to_tick(target, tick);
    if tick <= 0.0 || min_gap_ticks == 0 {
        return rounded;
    }

    let min_dist = tick * min_gap_ticks as f64;
    let tolerance = 1e-12 * entry.abs().max(1.0);
    if (rounded - entry).abs() + tolerance >= min_dist && (rounded > entry) == (target > entry) {
        return rounded;
    }

    if target > entry {
        snap_up(entry + min_dist, tick)
    } else {
        snap_down(entry - min_dist, tick)
    }
}

/// Format a price with exactly the tick's decimals.
pub fn format_price(price: f64, tick: f64) -> String {
    let decimals = precision_from_step_f64(tick) as usize;
    format!("{:.*}", decimals, price)
}

/// Unrealized PnL as a fraction of margin.
pub fn pnl_rate(side: PositionSide, entry: f64, mark: f64, leverage: u32) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    side.direction() * (mark - entry) / entry * leverage as f64
}
