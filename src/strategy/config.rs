use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::strategy::errors::ConfigError;
use crate::strategy::types::MarginMode;

const DEFAULT_BYBIT_URL: &str = "https://api.bybit.com";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Trading parameters injected into the entry executor and its monitors.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub leverage: u32,
    /// Fraction of leveraged balance committed per entry.
    pub risk_ratio: f64,
    pub margin_mode: MarginMode,
    /// Round-trip commission as a PnL fraction.
    pub commission: f64,
    /// Policy used for symbols without their own entry.
    pub default_tp_rate: f64,
    pub default_sl_rate: f64,
    pub close_max_retries: u32,
    /// Poll window per close attempt.
    pub close_wait: Duration,
    pub close_poll_interval: Duration,
    pub fill_timeout: Duration,
    pub fill_poll_interval: Duration,
    pub monitor_interval: Duration,
    pub min_tick_gap: u32,
    /// Entry prices below this are treated as missing.
    pub min_entry_price: f64,
    /// Suppress a second monitor pair for a (symbol, side) that already has one.
    pub dedupe_monitors: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            leverage: 10,
            risk_ratio: 0.10,
            margin_mode: MarginMode::Isolated,
            commission: 0.0006,
            default_tp_rate: 0.06,
            default_sl_rate: -0.02,
            close_max_retries: 3,
            close_wait: Duration::from_secs(5),
            close_poll_interval: Duration::from_secs(1),
            fill_timeout: Duration::from_secs(10),
            fill_poll_interval: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(1),
            min_tick_gap: 20,
            min_entry_price: 0.00001,
            dedupe_monitors: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            leverage: env_or("TRADE_LEVERAGE", d.leverage),
            risk_ratio: env_or("RISK_RATIO", d.risk_ratio),
            margin_mode: env_or("MARGIN_MODE", d.margin_mode),
            commission: env_or("COMMISSION", d.commission),
            default_tp_rate: env_or("DEFAULT_TP_RATE", d.default_tp_rate),
            default_sl_rate: env_or("DEFAULT_SL_RATE", d.default_sl_rate),
            close_max_retries: env_or("CLOSE_MAX_RETRIES", d.close_max_retries),
            close_wait: Duration::from_secs(env_or("CLOSE_WAIT_SECS", d.close_wait.as_secs())),
            close_poll_interval: d.close_poll_interval,
            fill_timeout: Duration::from_millis(env_or("FILL_TIMEOUT_MS", d.fill_timeout.as_millis() as u64)),
            fill_poll_interval: Duration::from_millis(env_or("FILL_POLL_MS", d.fill_poll_interval.as_millis() as u64)),
            monitor_interval: Duration::from_millis(env_or("MONITOR_INTERVAL_MS", d.monitor_interval.as_millis() as u64)),
            min_tick_gap: env_or("MIN_TICK_GAP", d.min_tick_gap),
            min_entry_price: d.min_entry_price,
            dedupe_monitors: env_or("DEDUPE_MONITORS", d.dedupe_monitors),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leverage == 0 {
            return Err(ConfigError::Invalid("leverage must be at least 1".into()));
        }
        if !(self.risk_ratio > 0.0) {
            return Err(ConfigError::Invalid("risk_ratio must be greater than 0".into()));
        }
        if self.commission < 0.0 {
            return Err(ConfigError::Invalid("commission cannot be negative".into()));
        }
        if !(self.default_tp_rate > 0.0) {
            return Err(ConfigError::Invalid("default_tp_rate must be greater than 0".into()));
        }
        if self.default_sl_rate >= 0.0 {
            return Err(ConfigError::Invalid("default_sl_rate must be negative".into()));
        }
        if self.close_max_retries == 0 {
            return Err(ConfigError::Invalid("close_max_retries must be greater than 0".into()));
        }
        if self.close_poll_interval.is_zero() || self.fill_poll_interval.is_zero() || self.monitor_interval.is_zero() {
            return Err(ConfigError::Invalid("poll intervals must be greater than 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    Paper,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(ExecutionMode::Live),
            "paper" => Ok(ExecutionMode::Paper),
            other => Err(ConfigError::Invalid(format!("EXECUTION_MODE must be live or paper, got '{}'", other))),
        }
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub execution_mode: ExecutionMode,
    pub credentials: Option<ExchangeCredentials>,
    pub base_url: String,
    pub recv_window_ms: u64,
    pub bind_addr: String,
    pub meta_refresh: Duration,
    pub webhook_passphrase: Option<String>,
    pub policy_file: Option<PathBuf>,
    /// Starting balance in paper mode.
    pub paper_balance: f64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let execution_mode = match env_opt("EXECUTION_MODE") {
            Some(v) => v.parse()?,
            None => ExecutionMode::Live,
        };

        let credentials = Self::load_credentials("BYBIT")?;
        if execution_mode == ExecutionMode::Live && credentials.is_none() {
            return Err(ConfigError::Missing("BYBIT_API_KEY / BYBIT_API_SECRET".into()));
        }

        Ok(Self {
            execution_mode,
            credentials,
            base_url: env_opt("BYBIT_BASE_URL").unwrap_or_else(|| DEFAULT_BYBIT_URL.to_string()),
            recv_window_ms: env_or("RECV_WINDOW_MS", 5000),
            bind_addr: env_opt("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            meta_refresh: Duration::from_secs(env_or("META_REFRESH_SECS", 3600).max(1)),
            webhook_passphrase: env_opt("WEBHOOK_PASSPHRASE"),
            policy_file: env_opt("SYMBOL_POLICY_FILE").map(PathBuf::from),
            paper_balance: env_or("PAPER_BALANCE", 1000.0),
        })
    }

    fn load_credentials(prefix: &str) -> Result<Option<ExchangeCredentials>, ConfigError> {
        let api_key = env_opt(&format!("{}_API_KEY", prefix));
        let api_secret = env_opt(&format!("{}_API_SECRET", prefix));

        match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) => Ok(Some(ExchangeCredentials { api_key, api_secret })),
            (None, None) => Ok(None),
            _ => Err(ConfigError::Invalid(format!(
                "Incomplete credentials for {}: both API_KEY and API_SECRET required",
                prefix
            ))),
        }
    }
}
