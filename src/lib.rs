use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;

pub mod bybit;
pub mod strategy;
pub mod webhook;
