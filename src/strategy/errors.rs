use std::time::Duration;
use thiserror::Error;

/// Failure of a single remote call against the exchange.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-zero `retCode` in a Bybit envelope.
    #[error("Bybit API error ({code}): {message}")]
    Api { code: i64, message: String },

    /// Response decoded but a required field was missing or malformed.
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Order refused by the paper exchange.
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Private endpoint called without API credentials")]
    MissingCredentials,
}

impl ExchangeError {
    pub fn decode(what: impl Into<String>) -> Self {
        ExchangeError::Decode(what.into())
    }
}

/// Why a signal could not be turned into a managed position.
///
/// Every variant is caught at the entry executor boundary and handed back to
/// the caller; none of them abort the process.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Opposite position on {symbol} did not close after {attempts} attempts")]
    OppositeCloseTimeout { symbol: String, attempts: u32 },

    #[error("No position on {symbol} appeared within {waited:?} of the entry order")]
    FillTimeout { symbol: String, waited: Duration },

    #[error("No usable entry price for {symbol}")]
    NoEntryPrice { symbol: String },

    #[error("Remote call failed: {0}")]
    Remote(#[from] ExchangeError),
}

impl EngineError {
    /// Stable machine-readable reason, used in webhook responses.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::OppositeCloseTimeout { .. } => "opposite_close_timeout",
            EngineError::FillTimeout { .. } => "fill_timeout",
            EngineError::NoEntryPrice { .. } => "no_entry_price",
            EngineError::Remote(_) => "remote_error",
        }
    }

    /// 400 for caller mistakes, 500 for processing failures.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidInput(_) => 400,
            _ => 500,
        }
    }
}

/// Rejected configuration value.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse policy file: {0}")]
    Parse(#[from] serde_json::Error),
}
