#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bybit_signal_trader::strategy::config::EngineConfig;
use bybit_signal_trader::strategy::entry::EntryExecutor;
use bybit_signal_trader::strategy::paper_trading_backend::PaperExchange;
use bybit_signal_trader::strategy::policy::SymbolPolicyTable;
use bybit_signal_trader::strategy::symbol_meta::{SymbolMeta, SymbolMetaHandle, SymbolMetaTable};

pub const BTC: &str = "BTCUSDT";
pub const ETH: &str = "ETHUSDT";

pub fn btc_meta() -> SymbolMeta {
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

pub fn eth_meta() -> SymbolMeta {
    SymbolMeta {
        step_size: 0.01,
        precision: 2,
        min_qty: 0.01,
        max_qty: 7240.0,
        max_mkt_qty: 724.0,
        contract_size: 1.0,
        tick_size: 0.01,
    }
}

/// Paper exchange with 1000 USDT, BTC at 50000 and ETH at 100.
pub async fn paper() -> PaperExchange {
    let paper = PaperExchange::new(1000.0);
    paper.set_last_price(BTC, 50_000.0).await;
    paper.set_last_price(ETH, 100.0).await;
    paper
}

pub fn executor(paper: &PaperExchange, config: EngineConfig) -> EntryExecutor {
    let mut symbols = HashMap::new();
    symbols.insert(BTC.to_string(), btc_meta());
    symbols.insert(ETH.to_string(), eth_meta());

    let policies = SymbolPolicyTable::builtin(config.default_tp_rate, config.default_sl_rate);
    EntryExecutor::new(
        Arc::new(paper.clone()),
        config,
        policies,
        SymbolMetaHandle::new(SymbolMetaTable::new(symbols)),
    )
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
