use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::strategy::errors::ConfigError;
use crate::strategy::types::underlying_symbol;

/// One rung of a trailing-stop ladder.
///
/// Once the position's PnL rate reaches `trigger`, the stop moves to the
/// price that realizes `sl` (a positive rate locks in profit).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStep {
    pub trigger: f64,
    pub sl: f64,
}

/// Per-symbol exit policy, rates expressed as account-level PnL fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub tp: f64,
    /// Negative.
    pub sl: f64,
    #[serde(default)]
    pub trailing_steps: Vec<TrailingStep>,
}

impl RiskPolicy {
    pub fn has_trailing(&self) -> bool {
        !self.trailing_steps.is_empty()
    }
}

fn default_ladder() -> Vec<TrailingStep> {
    vec![
        TrailingStep { trigger: 0.05, sl: 0.03 },
        TrailingStep { trigger: 0.07, sl: 0.05 },
    ]
}

static BUILTIN_POLICIES: Lazy<HashMap<String, RiskPolicy>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(3);
    map.insert(
        "BTCUSDT".to_string(),
        RiskPolicy { tp: 0.06, sl: -0.02, trailing_steps: default_ladder() },
    );
    map.insert(
        "ETHUSDT".to_string(),
        RiskPolicy { tp: 0.06, sl: -0.02, trailing_steps: default_ladder() },
    );
    map.insert(
        "DOGEUSDT".to_string(),
        RiskPolicy { tp: 0.1, sl: -0.02, trailing_steps: default_ladder() },
    );
    map
});

/// Static symbol -> policy table with a global fallback.
#[derive(Debug, Clone)]
pub struct SymbolPolicyTable {
    policies: HashMap<String, RiskPolicy>,
    default_policy: RiskPolicy,
}

impl SymbolPolicyTable {
    /// Built-in policies; unknown symbols get `default_tp`/`default_sl` and no ladder.
    pub fn builtin(default_tp: f64, default_sl: f64) -> Self {
        Self {
            policies: BUILTIN_POLICIES.clone(),
            default_policy: RiskPolicy { tp: default_tp, sl: default_sl, trailing_steps: Vec::new() },
        }
    }

    /// Merge a JSON override file (`{"SYMBOL": {"tp":..,"sl":..,"trailing_steps":[..]}}`).
    pub fn with_overrides_from_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.merge_json(&raw)?;
        Ok(self)
    }

    pub fn merge_json(&mut self, raw: &str) -> Result<(), ConfigError> {
        let overrides: HashMap<String, RiskPolicy> = serde_json::from_str(raw)?;
        for (symbol, policy) in overrides {
            if policy.sl >= 0.0 {
                return Err(ConfigError::Invalid(format!("{}: sl must be negative", symbol)));
            }
            if policy.tp <= 0.0 {
                return Err(ConfigError::Invalid(format!("{}: tp must be positive", symbol)));
            }
            self.policies.insert(underlying_symbol(&symbol), policy);
        }
        Ok(())
    }

    pub fn policy_for(&self, symbol: &str) -> &RiskPolicy {
        self.policies
            .get(&underlying_symbol(symbol))
            .unwrap_or(&self.default_policy)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
