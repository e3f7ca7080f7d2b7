pub mod types;
pub mod errors;
pub mod config;
pub mod symbol_meta;
pub mod policy;
pub mod quantity;
pub mod risk;
pub mod execution_backend;
pub mod paper_trading_backend;
pub mod registry;
pub mod monitor;
pub mod protection;
pub mod trailing_stop;
pub mod cleanup;
pub mod entry;
