use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::strategy::errors::ExchangeError;

/// Fallbacks for symbols missing from the instrument snapshot.
pub const DEFAULT_STEP_SIZE: f64 = 1.0;
pub const DEFAULT_MIN_QTY: f64 = 1.0;
pub const DEFAULT_MAX_MKT_QTY: f64 = 71_000.0;
pub const DEFAULT_MAX_QTY: f64 = 710_000.0;
pub const DEFAULT_TICK_SIZE: f64 = 0.01;

/// Trading rules for one linear instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMeta {
    pub step_size: f64,
    /// Decimals implied by `step_size`.
    pub precision: u32,
    pub min_qty: f64,
    /// Limit-order ceiling.
    pub max_qty: f64,
    /// Market-order ceiling.
    pub max_mkt_qty: f64,
    pub contract_size: f64,
    pub tick_size: f64,
}

impl Default for SymbolMeta {
    fn default() -> Self {
        Self {
            step_size: DEFAULT_STEP_SIZE,
            precision: 0,
            min_qty: DEFAULT_MIN_QTY,
            max_qty: DEFAULT_MAX_QTY,
            max_mkt_qty: DEFAULT_MAX_MKT_QTY,
            contract_size: 1.0,
            tick_size: DEFAULT_TICK_SIZE,
        }
    }
}

/// Number of decimals in a step string such as `"0.001"` (3) or `"1"` (0).
pub fn precision_from_step(step: &str) -> u32 {
    let step = step.trim();
    match step.parse::<f64>() {
        Ok(v) if v > 0.0 && v.fract() == 0.0 => return 0,
        Ok(_) => {}
        Err(_) => return 0,
    }
    match step.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

/// Same as [`precision_from_step`] for an already parsed step.
pub fn precision_from_step_f64(step: f64) -> u32 {
    precision_from_step(&format!("{}", step))
}

/// Immutable symbol -> meta snapshot. Replaced wholesale on refresh.
#[derive(Debug, Clone, Default)]
pub struct SymbolMetaTable {
    symbols: HashMap<String, SymbolMeta>,
}

impl SymbolMetaTable {
    pub fn new(symbols: HashMap<String, SymbolMeta>) -> Self {
        Self { symbols }
    }

    /// Meta for `symbol`, or the engine-wide defaults.
    pub fn get_or_default(&self, symbol: &str) -> SymbolMeta {
        self.symbols.get(symbol).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Shared handle over the current snapshot.
///
/// Readers take a full `Arc` of the table, so a concurrent `install` never
/// exposes a half-written map.
#[derive(Clone)]
pub struct SymbolMetaHandle {
    inner: Arc<ArcSwap<SymbolMetaTable>>,
}

impl SymbolMetaHandle {
    pub fn new(table: SymbolMetaTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn get(&self) -> Arc<SymbolMetaTable> {
        self.inner.load_full()
    }

    pub fn install(&self, table: SymbolMetaTable) {
        self.inner.store(Arc::new(table));
    }

    pub fn meta(&self, symbol: &str) -> SymbolMeta {
        self.inner.load().get_or_default(symbol)
    }
}

impl Default for SymbolMetaHandle {
    fn default() -> Self {
        Self::new(SymbolMetaTable::default())
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|f| f.as_str())
}

fn f64_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parse a Bybit `/v5/market/instruments-info` response.
///
/// Instruments with an unreadable lot-size filter are skipped rather than
/// failing the whole snapshot.
pub fn parse_instruments(response: &Value) -> Result<HashMap<String, SymbolMeta>, ExchangeError> {
    let list = response
        .get("result")
        .and_then(|r| r.get("list"))
        .and_then(|l| l.as_array())
        .ok_or_else(|| ExchangeError::decode("instruments-info: missing result.list"))?;

    let mut symbols = HashMap::with_capacity(list.len());
    for item in list {
        let Some(symbol) = str_field(item, "symbol") else {
            continue;
        };
        let Some(lot) = item.get("lotSizeFilter") else {
            continue;
        };
        let Some(step_str) = str_field(lot, "qtyStep") else {
            continue;
        };
        let Ok(step_size) = step_str.parse::<f64>() else {
            continue;
        };
        if step_size <= 0.0 {
            continue;
        }

        let min_qty = f64_field(lot, "minOrderQty").unwrap_or(DEFAULT_MIN_QTY);
        let max_qty = f64_field(lot, "maxOrderQty").unwrap_or(DEFAULT_MAX_QTY);
        let max_mkt_qty = f64_field(lot, "maxMktOrderQty").unwrap_or(max_qty);
        let contract_size = f64_field(item, "contractSize").unwrap_or(1.0);
        let tick_size = item
            .get("priceFilter")
            .and_then(|pf| f64_field(pf, "tickSize"))
            .filter(|t| *t > 0.0)
            .unwrap_or(DEFAULT_TICK_SIZE);

        symbols.insert(
            symbol.to_string(),
            SymbolMeta {
                step_size,
                precision: precision_from_step(step_str),
                min_qty,
                max_qty,
                max_mkt_qty,
                contract_size,
                tick_size,
            },
        );
    }

    Ok(symbols)
}
