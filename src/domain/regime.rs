//! Regime classification from the tail of a candle sequence. Thresholds are
//! fixed constants (documented below) rather than configuration so that the
//! classifier is trivially stable: the same window always yields the same
//! label, and a monotonically strengthening trend never regresses from
//! trending to ranging.

use crate::domain::candle::Candle;
use crate::domain::indicator::{adx_wilder, ema};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum RegimeLabel {
    TrendingBull,
    TrendingBear,
    RangingTight,
    RangingWide,
    BreakoutUp,
    BreakoutDown,
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegimeLabel::TrendingBull => "trending-bull",
            RegimeLabel::TrendingBear => "trending-bear",
            RegimeLabel::RangingTight => "ranging-tight",
            RegimeLabel::RangingWide => "ranging-wide",
            RegimeLabel::BreakoutUp => "breakout-up",
            RegimeLabel::BreakoutDown => "breakout-down",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub label: RegimeLabel,
    /// Confidence in [0, 100].
    pub confidence: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct RegimeConfig {
    /// Bars of history examined; default 100 per spec.
    pub lookback: usize,
    pub long_ma_period: usize,
    pub adx_period: usize,
    /// ADX at/above this is considered trending.
    pub adx_trend_threshold: Decimal,
    /// Band width (range / long MA, in percent) at/above this is "wide".
    pub band_width_wide_threshold: Decimal,
    /// Bars back to look for the breakout reference high/low.
    pub breakout_lookback: usize,
    /// Volume must be at least this multiple of the average to confirm breakout.
    pub breakout_volume_multiplier: Decimal,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            lookback: 100,
            long_ma_period: 50,
            adx_period: 14,
            adx_trend_threshold: dec!(25),
            band_width_wide_threshold: dec!(6),
            breakout_lookback: 20,
            breakout_volume_multiplier: dec!(1.5),
        }
    }
}

/// Classify the regime from the tail of `candles`. Priority order when more
/// than one condition is met: breakout > trending > ranging.
pub fn classify(candles: &[Candle], cfg: &RegimeConfig) -> Option<RegimeClassification> {
    if candles.len() < cfg.lookback.max(cfg.long_ma_period + 2) {
        return None;
    }
    let window = &candles[candles.len() - cfg.lookback..];
    let closes: Vec<Decimal> = window.iter().map(|c| c.close).collect();

    let long_ma_now = ema(&closes, cfg.long_ma_period)?;
    let long_ma_prev = ema(&closes[..closes.len() - 1], cfg.long_ma_period)?;
    let slope = long_ma_now - long_ma_prev;
    let slope_pct = if long_ma_prev.is_zero() {
        Decimal::ZERO
    } else {
        (slope / long_ma_prev) * Decimal::from(100)
    };

    let adx = adx_wilder(window, cfg.adx_period);

    let highest = window.iter().map(|c| c.high).fold(Decimal::MIN, Decimal::max);
    let lowest = window.iter().map(|c| c.low).fold(Decimal::MAX, Decimal::min);
    let band_width_pct = if long_ma_now.is_zero() {
        Decimal::ZERO
    } else {
        ((highest - lowest) / long_ma_now) * Decimal::from(100)
    };

    // Breakout check: last close beyond the N-bar high/low excluding the
    // current bar, confirmed by volume expansion over the trailing average.
    let breakout = detect_breakout(window, cfg);

    if let Some((label, strength)) = breakout {
        let confidence = dec!(60) + strength.min(dec!(40));
        return Some(RegimeClassification {
            label,
            confidence: confidence.min(dec!(100)),
        });
    }

    let is_trending = adx.map(|a| a >= cfg.adx_trend_threshold).unwrap_or(false);
    if is_trending {
        let label = if slope_pct >= Decimal::ZERO {
            RegimeLabel::TrendingBull
        } else {
            RegimeLabel::TrendingBear
        };
        let excess = adx.unwrap_or(cfg.adx_trend_threshold) - cfg.adx_trend_threshold;
        let confidence = (dec!(50) + excess * dec!(2)).min(dec!(100));
        return Some(RegimeClassification { label, confidence });
    }

    let label = if band_width_pct >= cfg.band_width_wide_threshold {
        RegimeLabel::RangingWide
    } else {
        RegimeLabel::RangingTight
    };
    let distance = (cfg.band_width_wide_threshold - band_width_pct).abs();
    let confidence = (dec!(50) + distance * dec!(3)).min(dec!(100));
    Some(RegimeClassification { label, confidence })
}

fn detect_breakout(window: &[Candle], cfg: &RegimeConfig) -> Option<(RegimeLabel, Decimal)> {
    if window.len() < cfg.breakout_lookback + 2 {
        return None;
    }
    let current = window.last()?;
    let reference = &window[window.len() - cfg.breakout_lookback - 1..window.len() - 1];
    let ref_high = reference.iter().map(|c| c.high).fold(Decimal::MIN, Decimal::max);
    let ref_low = reference.iter().map(|c| c.low).fold(Decimal::MAX, Decimal::min);

    let avg_vol: Decimal = reference.iter().map(|c| c.volume).sum::<Decimal>()
        / Decimal::from(reference.len().max(1));
    let volume_ok = if avg_vol.is_zero() {
        false
    } else {
        current.volume >= avg_vol * cfg.breakout_volume_multiplier
    };
    if !volume_ok {
        return None;
    }

    if current.close > ref_high {
        let strength = if ref_high.is_zero() {
            Decimal::ZERO
        } else {
            ((current.close - ref_high) / ref_high) * Decimal::from(1000)
        };
        return Some((RegimeLabel::BreakoutUp, strength));
    }
    if current.close < ref_low {
        let strength = if ref_low.is_zero() {
            Decimal::ZERO
        } else {
            ((ref_low - current.close) / ref_low) * Decimal::from(1000)
        };
        return Some((RegimeLabel::BreakoutDown, strength));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat_candle(i: i64, close: Decimal, volume: Decimal) -> Candle {
        Candle::new(i * 60, i * 60 + 60, close, close + dec!(0.1), close - dec!(0.1), close, volume)
    }

    fn uptrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| flat_candle(i as i64, dec!(100) + Decimal::from(i as i64) * dec!(0.6), dec!(100)))
            .collect()
    }

    #[test]
    fn classify_none_below_lookback() {
        let candles = uptrend(10);
        let cfg = RegimeConfig::default();
        assert!(classify(&candles, &cfg).is_none());
    }

    #[test]
    fn classify_is_stable_for_same_window() {
        let candles = uptrend(150);
        let cfg = RegimeConfig::default();
        let a = classify(&candles, &cfg).unwrap();
        let b = classify(&candles, &cfg).unwrap();
        assert_eq!(a.label, b.label);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn strong_uptrend_classifies_as_trending_bull_or_breakout() {
        let candles = uptrend(150);
        let cfg = RegimeConfig::default();
        let result = classify(&candles, &cfg).unwrap();
        assert!(matches!(
            result.label,
            RegimeLabel::TrendingBull | RegimeLabel::BreakoutUp
        ));
    }

    #[test]
    fn ranging_flat_market_classifies_ranging() {
        let candles: Vec<Candle> = (0..150)
            .map(|i| flat_candle(i as i64, dec!(100), dec!(100)))
            .collect();
        let cfg = RegimeConfig::default();
        let result = classify(&candles, &cfg).unwrap();
        assert!(matches!(
            result.label,
            RegimeLabel::RangingTight | RegimeLabel::RangingWide
        ));
    }

    #[test]
    fn breakout_requires_volume_expansion() {
        let mut candles: Vec<Candle> = (0..120)
            .map(|i| flat_candle(i as i64, dec!(100), dec!(100)))
            .collect();
        // Price breaks out above the reference high but volume stays flat.
        candles.push(flat_candle(120, dec!(110), dec!(100)));
        let cfg = RegimeConfig::default();
        let result = classify(&candles, &cfg).unwrap();
        assert_ne!(result.label, RegimeLabel::BreakoutUp);
    }
}
