//! Signal detection: rule composition, multi-timeframe confirmation, and
//! regime-aware overrides. The detector is a pure function of
//! (snapshot, config, position side, regime, optional higher-timeframe
//! snapshot) so it is trivially deterministic.

use crate::domain::indicator::IndicatorSnapshot;
use crate::domain::position::Side;
use crate::domain::regime::RegimeLabel;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Buy,
    Sell,
    Short,
    Cover,
    None,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalType::Buy => "buy",
            SignalType::Sell => "sell",
            SignalType::Short => "short",
            SignalType::Cover => "cover",
            SignalType::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord, Hash)]
pub enum Rule {
    MaBullish,
    MaBearish,
    MacdBullish,
    MacdBearish,
    RsiOversold,
    RsiOverbought,
    RsiNotOverbought,
    RsiNotOversold,
    VolumeSurge,
    VolumeLow,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rule::MaBullish => "ma_bullish",
            Rule::MaBearish => "ma_bearish",
            Rule::MacdBullish => "macd_bullish",
            Rule::MacdBearish => "macd_bearish",
            Rule::RsiOversold => "rsi_oversold",
            Rule::RsiOverbought => "rsi_overbought",
            Rule::RsiNotOverbought => "rsi_not_overbought",
            Rule::RsiNotOversold => "rsi_not_oversold",
            Rule::VolumeSurge => "volume_surge",
            Rule::VolumeLow => "volume_low",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleThresholds {
    pub rsi_oversold: Decimal,
    pub rsi_overbought: Decimal,
    pub volume_surge_ratio: Decimal,
    pub volume_low_ratio: Decimal,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            rsi_oversold: Decimal::from(30),
            rsi_overbought: Decimal::from(70),
            volume_surge_ratio: Decimal::from(2),
            volume_low_ratio: rust_decimal_macros::dec!(0.5),
        }
    }
}

/// Evaluate a single rule predicate against a snapshot. Returns `None` (not
/// `false`) when the snapshot lacks the data the rule needs — the caller
/// treats an indeterminate rule as not-satisfied, but this lets diagnostics
/// distinguish "failed" from "couldn't be evaluated".
pub fn evaluate_rule(rule: Rule, snapshot: &IndicatorSnapshot, thresholds: &RuleThresholds) -> Option<bool> {
    match rule {
        Rule::MaBullish => Some(snapshot.short_ma? > snapshot.long_ma?),
        Rule::MaBearish => Some(snapshot.short_ma? < snapshot.long_ma?),
        Rule::MacdBullish => {
            let m = snapshot.macd?;
            Some(m.line > m.signal && m.histogram > Decimal::ZERO)
        }
        Rule::MacdBearish => {
            let m = snapshot.macd?;
            Some(m.line < m.signal && m.histogram < Decimal::ZERO)
        }
        Rule::RsiOversold => Some(snapshot.rsi? <= thresholds.rsi_oversold),
        Rule::RsiOverbought => Some(snapshot.rsi? >= thresholds.rsi_overbought),
        Rule::RsiNotOverbought => Some(snapshot.rsi? < thresholds.rsi_overbought),
        Rule::RsiNotOversold => Some(snapshot.rsi? > thresholds.rsi_oversold),
        Rule::VolumeSurge => {
            Some(snapshot.last_volume? >= snapshot.avg_volume? * thresholds.volume_surge_ratio)
        }
        Rule::VolumeLow => {
            Some(snapshot.last_volume? <= snapshot.avg_volume? * thresholds.volume_low_ratio)
        }
    }
}

/// Map of signal type -> the rules that must all hold for that signal to
/// qualify. Regime overrides replace this wholesale; the auto-classification
/// fallback narrows it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRules {
    pub buy: Vec<Rule>,
    pub sell: Vec<Rule>,
    pub short: Vec<Rule>,
    pub cover: Vec<Rule>,
}

impl SignalRules {
    pub fn for_type(&self, t: SignalType) -> &[Rule] {
        match t {
            SignalType::Buy => &self.buy,
            SignalType::Sell => &self.sell,
            SignalType::Short => &self.short,
            SignalType::Cover => &self.cover,
            SignalType::None => &[],
        }
    }

    /// Auto-classification fallback: ranging regimes keep only RSI-reversal
    /// rules, trending regimes keep only trend rules.
    pub fn narrow_for_regime(&self, regime: RegimeLabel) -> SignalRules {
        let is_ranging = matches!(regime, RegimeLabel::RangingTight | RegimeLabel::RangingWide);
        let is_trending = matches!(
            regime,
            RegimeLabel::TrendingBull | RegimeLabel::TrendingBear | RegimeLabel::BreakoutUp | RegimeLabel::BreakoutDown
        );
        let keep = |rules: &[Rule]| -> Vec<Rule> {
            rules
                .iter()
                .copied()
                .filter(|r| {
                    let is_rsi_reversal = matches!(
                        r,
                        Rule::RsiOversold | Rule::RsiOverbought | Rule::RsiNotOverbought | Rule::RsiNotOversold
                    );
                    let is_trend_rule = matches!(
                        r,
                        Rule::MaBullish | Rule::MaBearish | Rule::MacdBullish | Rule::MacdBearish
                    );
                    if is_ranging {
                        is_rsi_reversal
                    } else if is_trending {
                        is_trend_rule
                    } else {
                        true
                    }
                })
                .collect()
        };
        SignalRules {
            buy: keep(&self.buy),
            sell: keep(&self.sell),
            short: keep(&self.short),
            cover: keep(&self.cover),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub symbol: String,
    pub price: Option<Decimal>,
    pub triggered_rules: Vec<Rule>,
    pub snapshot: IndicatorSnapshot,
    pub timestamp: i64,
    pub diagnostic: Option<String>,
}

impl Signal {
    pub fn none(symbol: &str, snapshot: IndicatorSnapshot, timestamp: i64, diagnostic: Option<String>) -> Self {
        Self {
            signal_type: SignalType::None,
            symbol: symbol.to_string(),
            price: None,
            triggered_rules: Vec::new(),
            snapshot,
            timestamp,
            diagnostic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSideFilter(pub Option<Side>);

/// Check whether every rule in `rules` evaluates true. Returns the ordered
/// set of triggered rule names on success (preserving declaration order via
/// a `BTreeSet` keyed on the enum's declared ordinal through `Ord`).
fn all_rules_satisfied(rules: &[Rule], snapshot: &IndicatorSnapshot, thresholds: &RuleThresholds) -> Option<Vec<Rule>> {
    if rules.is_empty() {
        return None;
    }
    let mut triggered = BTreeSet::new();
    for &rule in rules {
        match evaluate_rule(rule, snapshot, thresholds) {
            Some(true) => {
                triggered.insert(rule);
            }
            _ => return None,
        }
    }
    Some(triggered.into_iter().collect())
}

/// Detect a signal for `symbol` given the current position side. Emission
/// policy: a position in `long` can only emit `sell`; a flat symbol can emit
/// `buy` or `short` but not both (buy wins ties). Price must be finite and
/// positive or the signal is suppressed with a diagnostic.
pub fn detect_signal(
    symbol: &str,
    snapshot: &IndicatorSnapshot,
    price: Option<Decimal>,
    rules: &SignalRules,
    thresholds: &RuleThresholds,
    position_side: Option<Side>,
    timestamp: i64,
) -> Signal {
    let candidate_types: &[SignalType] = match position_side {
        Some(Side::Long) => &[SignalType::Sell],
        Some(Side::Short) => &[SignalType::Cover],
        None => &[SignalType::Buy, SignalType::Short],
    };

    for &t in candidate_types {
        if let Some(triggered) = all_rules_satisfied(rules.for_type(t), snapshot, thresholds) {
            match price {
                Some(p) if p.is_sign_positive() && !p.is_zero() => {
                    return Signal {
                        signal_type: t,
                        symbol: symbol.to_string(),
                        price: Some(p),
                        triggered_rules: triggered,
                        snapshot: *snapshot,
                        timestamp,
                        diagnostic: None,
                    };
                }
                _ => {
                    return Signal::none(
                        symbol,
                        *snapshot,
                        timestamp,
                        Some("price invalid: signal suppressed".to_string()),
                    );
                }
            }
        }
    }

    Signal::none(symbol, *snapshot, timestamp, None)
}

/// Multi-timeframe filter: a long entry requires `ma_bullish` on the higher
/// timeframe, a short entry requires `ma_bearish`. Failing downgrades the
/// signal to `none` with a recorded reason.
pub fn apply_trend_timeframe_filter(signal: Signal, higher_tf_snapshot: Option<&IndicatorSnapshot>) -> Signal {
    let Some(higher) = higher_tf_snapshot else {
        return signal;
    };
    match signal.signal_type {
        SignalType::Buy => {
            if evaluate_rule(Rule::MaBullish, higher, &RuleThresholds::default()) == Some(true) {
                signal
            } else {
                Signal::none(
                    &signal.symbol,
                    signal.snapshot,
                    signal.timestamp,
                    Some("multi-timeframe filter: higher timeframe not ma_bullish".to_string()),
                )
            }
        }
        SignalType::Short => {
            if evaluate_rule(Rule::MaBearish, higher, &RuleThresholds::default()) == Some(true) {
                signal
            } else {
                Signal::none(
                    &signal.symbol,
                    signal.snapshot,
                    signal.timestamp,
                    Some("multi-timeframe filter: higher timeframe not ma_bearish".to_string()),
                )
            }
        }
        _ => signal,
    }
}

/// Regime override lookup: the effective rule set for the current regime,
/// or the auto-classification fallback if no override map is supplied.
pub fn effective_rules(
    base: &SignalRules,
    overrides: Option<&BTreeMap<RegimeLabel, SignalRules>>,
    regime: Option<RegimeLabel>,
) -> SignalRules {
    if let (Some(map), Some(r)) = (overrides, regime)
        && let Some(rules) = map.get(&r)
    {
        return rules.clone();
    }
    if let Some(r) = regime {
        return base.narrow_for_regime(r);
    }
    base.clone()
}
