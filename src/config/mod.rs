//! Three-layer configuration: a base YAML file merged with an optional
//! profile layer and an optional scenario layer, deep-merged key by key.
//! Loading raw YAML/JSON is the only I/O this module performs; everything
//! else is pure.

use crate::domain::errors::ConfigError;
use crate::domain::indicator::IndicatorConfig;
use crate::domain::position::StagedTakeProfit;
use crate::domain::protections::Protection;
use crate::domain::regime::{RegimeConfig, RegimeLabel};
use crate::domain::risk::RiskConfig;
use crate::domain::signal::{RuleThresholds, SignalRules};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCosts {
    pub fee_rate: Decimal,
    pub slippage_percent: Decimal,
    pub spread_bps: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizing {
    pub position_ratio: Decimal,
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub min_order_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub activation_percent: Decimal,
    pub callback_percent: Decimal,
}

/// Paper-DCA trigger parameters. `tranche_usdt` is the fixed add-size used
/// each time the trigger fires; see `domain::account::paper_dca_should_trigger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaConfig {
    pub total_tranches: u32,
    pub drop_pct_threshold: Decimal,
    pub max_duration_ms: i64,
    pub tranche_usdt: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub scenario: String,
    pub symbols: Vec<String>,
    pub initial_cash: Decimal,
    pub indicator: IndicatorConfig,
    pub regime: RegimeConfig,
    pub rule_thresholds: RuleThresholds,
    pub signal_rules: SignalRules,
    /// Regime-keyed overrides of `signal_rules`; when empty the
    /// auto-classification fallback narrows the base rules instead.
    #[serde(default)]
    pub regime_strategies: BTreeMap<RegimeLabel, SignalRules>,
    /// Aggregation factor (number of base bars per higher-timeframe bar) for
    /// the multi-timeframe confirmation filter. `None` disables the filter.
    #[serde(default)]
    pub trend_timeframe: Option<usize>,
    #[serde(default)]
    pub staged_take_profits: Vec<StagedTakeProfit>,
    #[serde(default)]
    pub dca: Option<DcaConfig>,
    pub risk: RiskConfig,
    pub execution_costs: ExecutionCosts,
    pub position_sizing: PositionSizing,
    pub trailing_stop: TrailingStopConfig,
    pub time_stop_hours: i64,
    pub protections: Vec<Protection>,
    pub is_futures_or_margin_market: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scenario: "default".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            initial_cash: Decimal::from(10_000),
            indicator: IndicatorConfig::default(),
            regime: RegimeConfig::default(),
            rule_thresholds: RuleThresholds::default(),
            signal_rules: SignalRules {
                buy: vec![],
                sell: vec![],
                short: vec![],
                cover: vec![],
            },
            regime_strategies: BTreeMap::new(),
            trend_timeframe: None,
            staged_take_profits: Vec::new(),
            dca: None,
            risk: RiskConfig::default(),
            execution_costs: ExecutionCosts {
                fee_rate: Decimal::new(1, 3),
                slippage_percent: Decimal::new(5, 4),
                spread_bps: Decimal::from(5),
            },
            position_sizing: PositionSizing {
                position_ratio: Decimal::new(2, 1),
                stop_loss_percent: Decimal::new(5, 2),
                take_profit_percent: Decimal::new(15, 2),
                min_order_size: Decimal::from(10),
            },
            trailing_stop: TrailingStopConfig {
                activation_percent: Decimal::new(5, 2),
                callback_percent: Decimal::new(2, 2),
            },
            time_stop_hours: 72,
            protections: Vec::new(),
            is_futures_or_margin_market: false,
        }
    }
}

/// Deep-merges `overlay` into `base` in place. Mapping keys are merged
/// recursively; any other value kind in `overlay` replaces `base` wholesale.
/// A `null` in the overlay deletes the key from the merged result.
fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    base_map.remove(&key);
                    continue;
                }
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

fn read_layer(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
        key: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::InvalidValue {
        key: path.display().to_string(),
        reason: e.to_string(),
    })
}

impl RuntimeConfig {
    /// Loads `base`, then merges an optional `profile` layer and an
    /// optional `scenario` layer on top, in that order. A layer whose path
    /// does not exist is skipped rather than treated as an error.
    pub fn load(
        base: &Path,
        profile: Option<&Path>,
        scenario: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut merged = read_layer(base)?;

        for layer_path in [profile, scenario].into_iter().flatten() {
            if !layer_path.exists() {
                continue;
            }
            let layer = read_layer(layer_path)?;
            deep_merge(&mut merged, layer);
        }

        serde_yaml::from_value(merged).map_err(|e| ConfigError::InvalidValue {
            key: "<merged>".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_nested_keys_without_clobbering_siblings() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "risk:\n  max_concurrent_positions: 5\n  allow_shorts: true\n",
        )
        .unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("risk:\n  max_concurrent_positions: 3\n").unwrap();
        deep_merge(&mut base, overlay);

        let risk = base.get("risk").unwrap();
        assert_eq!(risk.get("max_concurrent_positions").unwrap().as_i64(), Some(3));
        assert_eq!(risk.get("allow_shorts").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn null_overlay_value_deletes_key() {
        let mut base: serde_yaml::Value = serde_yaml::from_str("a: 1\nb: 2\n").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("b: null\n").unwrap();
        deep_merge(&mut base, overlay);
        assert!(base.get("b").is_none());
        assert_eq!(base.get("a").unwrap().as_i64(), Some(1));
    }

    #[test]
    fn missing_optional_layers_are_skipped_not_errors() {
        let dir = std::env::temp_dir().join(format!("cryptara-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let base_path = dir.join("base.yaml");
        std::fs::write(
            &base_path,
            "scenario: test\nsymbols: [BTCUSDT]\ninitial_cash: 10000\n\
             indicator:\n  short_ma_period: 9\n  long_ma_period: 21\n  rsi_period: 14\n\
             \x20 macd_fast: 12\n  macd_slow: 26\n  macd_signal: 9\n  atr_period: 14\n\
             \x20 adx_period: 14\n  avg_volume_window: 20\n\
             regime:\n  lookback: 100\n  long_ma_period: 50\n  adx_period: 14\n\
             \x20 adx_trend_threshold: 25\n  band_width_wide_threshold: 6\n\
             \x20 breakout_lookback: 20\n  breakout_volume_multiplier: 1.5\n\
             rule_thresholds:\n  rsi_oversold: 30\n  rsi_overbought: 70\n\
             \x20 volume_surge_ratio: 2\n  volume_low_ratio: 0.5\n\
             signal_rules:\n  buy: []\n  sell: []\n  short: []\n  cover: []\n\
             risk:\n  max_concurrent_positions: 5\n  max_symbol_notional_fraction: 0.3\n\
             \x20 daily_loss_limit_pct: 5\n  max_total_loss_pct: 25\n  max_correlation: 0.8\n\
             \x20 max_portfolio_heat: 0.6\n  kelly_fraction_cap: 0.25\n  allow_shorts: true\n\
             \x20 sentiment_max_age_ms: 3600000\n  sentiment_min_score: -0.5\n\
             execution_costs:\n  fee_rate: 0.001\n  slippage_percent: 0.0005\n  spread_bps: 5\n\
             position_sizing:\n  position_ratio: 0.2\n  stop_loss_percent: 0.05\n\
             \x20 take_profit_percent: 0.15\n  min_order_size: 10\n\
             trailing_stop:\n  activation_percent: 0.05\n  callback_percent: 0.02\n\
             time_stop_hours: 72\nprotections: []\nis_futures_or_margin_market: false\n",
        )
        .unwrap();

        let missing_profile = dir.join("does-not-exist.yaml");
        let result = RuntimeConfig::load(&base_path, Some(&missing_profile), None);
        assert!(result.is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }
}
