use crate::strategy::symbol_meta::SymbolMeta;
use crate::strategy::types::OrderKind;

/// Relative tolerance applied before flooring so that `0.3 / 0.1` counts as 3 steps.
const STEP_EPSILON: f64 = 1e-9;

/// Exchange-legal order size.
///
/// `text` is what goes on the wire; it is produced once at `precision`
/// decimals and never re-derived from `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQty {
    pub value: f64,
    pub text: String,
}

impl NormalizedQty {
    pub fn is_zero(&self) -> bool {
        self.value <= 0.0
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Serialize a quantity at exactly `precision` decimals.
pub fn format_qty(value: f64, precision: u32) -> String {
    if precision == 0 {
        format!("{}", value.round() as i64)
    } else {
        format!("{:.*}", precision as usize, value)
    }
}

/// Clamp, floor to `step_size`, round to `precision`, clamp again.
pub fn normalize_qty(meta: &SymbolMeta, raw: f64, kind: OrderKind) -> NormalizedQty {
    let max_qty = match kind {
        OrderKind::Market => meta.max_mkt_qty,
        OrderKind::Limit => meta.max_qty,
    };
    let raw = if raw.is_finite() { raw } else { 0.0 };

    let clamped = raw.max(meta.min_qty).min(max_qty);

    let ratio = clamped / meta.step_size;
    let steps = (ratio + STEP_EPSILON * ratio.abs().max(1.0)).floor();
    let floored = round_to_decimals(steps * meta.step_size, meta.precision);

    let mut value = floored.max(meta.min_qty).min(max_qty);
    if meta.precision == 0 {
        value = value.trunc();
    }

    NormalizedQty {
        value,
        text: format_qty(value, meta.precision),
    }
}

/// Order size for a fraction of the account: `balance × leverage × risk_ratio`
/// of notional, converted to contracts at `price`.
///
/// Returns `None` when balance or price is unusable.
pub fn sizing_quantity(
    meta: &SymbolMeta,
    balance: f64,
    price: f64,
    leverage: u32,
    risk_ratio: f64,
) -> Option<NormalizedQty> {
    if !(balance > 0.0) || !(price > 0.0) || meta.contract_size <= 0.0 {
        return None;
    }
    let notional = balance * leverage as f64 * risk_ratio;
    let raw = notional / (price * meta.contract_size);
    Some(normalize_qty(meta, raw, OrderKind::Market))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn btc_meta() -> SymbolMeta {
        SymbolMeta {
            step_size: 0.001,
            precision: 3,
            min_qty: 0.001,
            max_qty: 1190.0,
            max_mkt_qty: 119.0,
            contract_size: 1.0,
            tick_size: 0.1,
        }
    }

    fn doge_meta() -> SymbolMeta {
        SymbolMeta {
            step_size: 1.0,
            precision: 0,
            min_qty: 1.0,
            max_qty: 20_000_000.0,
            max_mkt_qty: 1_000_000.0,
            contract_size: 1.0,
            tick_size: 0.00001,
        }
    }

    #[test]
    fn test_floors_to_step() {
        let q = normalize_qty(&btc_meta(), 0.12345, OrderKind::Market);
        assert_eq!(q.text, "0.123");
        assert!((q.value - 0.123).abs() < 1e-12);
    }

    #[test]
    fn test_floor_survives_binary_representation() {
        let meta = SymbolMeta { step_size: 0.1, precision: 1, min_qty: 0.1, ..btc_meta() };
        let q = normalize_qty(&meta, 0.3, OrderKind::Market);
        assert_eq!(q.text, "0.3");
    }

    #[test]
    fn test_clamps_to_bounds() {
        let meta = btc_meta();
        assert_eq!(normalize_qty(&meta, 0.0000001, OrderKind::Market).text, "0.001");
        assert_eq!(normalize_qty(&meta, 500.0, OrderKind::Market).text, "119.000");
        assert_eq!(normalize_qty(&meta, 500.0, OrderKind::Limit).text, "500.000");
        assert_eq!(normalize_qty(&meta, f64::NAN, OrderKind::Market).text, "0.001");
    }

    #[test]
    fn test_integer_precision() {
        let q = normalize_qty(&doge_meta(), 1234.9, OrderKind::Market);
        assert_eq!(q.value, 1234.0);
        assert_eq!(q.text, "1234");
    }

    #[test]
    fn test_sizing_quantity() {
        // 1000 USDT * 10x * 10% = 1000 notional at 50_000 => 0.02 BTC
        let q = sizing_quantity(&btc_meta(), 1000.0, 50_000.0, 10, 0.10).unwrap();
        assert_eq!(q.text, "0.020");

        assert!(sizing_quantity(&btc_meta(), 0.0, 50_000.0, 10, 0.10).is_none());
        assert!(sizing_quantity(&btc_meta(), 1000.0, 0.0, 10, 0.10).is_none());
    }

    proptest! {
        #[test]
        fn prop_normalization_is_idempotent_and_bounded(raw in 0.0f64..5000.0, market in prop::bool::ANY) {
            let meta = btc_meta();
            let kind = if market { OrderKind::Market } else { OrderKind::Limit };
            let max = if market { meta.max_mkt_qty } else { meta.max_qty };

            let once = normalize_qty(&meta, raw, kind);
            let twice = normalize_qty(&meta, once.value, kind);

            prop_assert_eq!(&once.text, &twice.text);
            prop_assert!(once.value >= meta.min_qty && once.value <= max);

            let steps = once.value / meta.step_size;
            prop_assert!((steps - steps.round()).abs() < 1e-6);
        }

        #[test]
        fn prop_integer_precision_text_has_no_fraction(raw in 0.0f64..2_000_000.0) {
            let q = normalize_qty(&doge_meta(), raw, OrderKind::Market);
            prop_assert!(!q.text.contains('.'));
            prop_assert_eq!(q.text.parse::<f64>().unwrap(), q.value);
        }
    }
}
