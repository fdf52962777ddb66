//! Pure indicator pipeline: candle window in, snapshot out. Every function
//! here is deterministic and side-effect free — insufficient history yields
//! an absent component rather than a partial/placeholder value.

use crate::domain::candle::Candle;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValues {
    pub line: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// Snapshot of indicator values computed from the tail of a candle sequence.
/// All components are independently optional: a missing input window never
/// forces another component to go absent too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub short_ma: Option<Decimal>,
    pub long_ma: Option<Decimal>,
    pub rsi: Option<Decimal>,
    pub macd: Option<MacdValues>,
    pub atr: Option<Decimal>,
    pub adx: Option<Decimal>,
    pub last_close: Option<Decimal>,
    pub last_volume: Option<Decimal>,
    pub avg_volume: Option<Decimal>,
}

#[derive(Debug, Clone, Copy)]
pub struct IndicatorConfig {
    pub short_ma_period: usize,
    pub long_ma_period: usize,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub atr_period: usize,
    pub adx_period: Option<usize>,
    pub avg_volume_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            short_ma_period: 9,
            long_ma_period: 21,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr_period: 14,
            adx_period: Some(14),
            avg_volume_window: 20,
        }
    }
}

/// Compute the full snapshot from the tail of a candle sequence. Pure: the
/// same window always produces a bit-identical result.
pub fn compute_snapshot(candles: &[Candle], cfg: &IndicatorConfig) -> IndicatorSnapshot {
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();

    let macd = compute_macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal);

    IndicatorSnapshot {
        short_ma: ema(&closes, cfg.short_ma_period),
        long_ma: ema(&closes, cfg.long_ma_period),
        rsi: rsi_wilder(&closes, cfg.rsi_period),
        macd,
        atr: atr_wilder(candles, cfg.atr_period),
        adx: cfg.adx_period.and_then(|p| adx_wilder(candles, p)),
        last_close: closes.last().copied(),
        last_volume: candles.last().map(|c| c.volume),
        avg_volume: avg_volume(candles, cfg.avg_volume_window),
    }
}

/// Simple mean of the last `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    let sum: Decimal = window.iter().copied().sum();
    Some(sum / Decimal::from(period))
}

/// EMA seeded from a simple mean of the first `period` closes, then
/// recursively smoothed forward across the remaining values.
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = Decimal::from(2) / Decimal::from(period + 1);
    let seed: Decimal = values[..period].iter().copied().sum::<Decimal>() / Decimal::from(period);
    let mut value = seed;
    for &v in &values[period..] {
        value = (v - value) * alpha + value;
    }
    Some(value)
}

/// Full EMA series (one value per input past the seed index), used by MACD
/// to line up fast/slow EMAs bar-for-bar.
fn ema_series(values: &[Decimal], period: usize) -> Option<Vec<Decimal>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = Decimal::from(2) / Decimal::from(period + 1);
    let seed: Decimal = values[..period].iter().copied().sum::<Decimal>() / Decimal::from(period);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    let mut value = seed;
    for &v in &values[period..] {
        value = (v - value) * alpha + value;
        out.push(value);
    }
    Some(out)
}

/// Wilder's RSI. Requires `period + 1` candles. A perfectly flat window
/// (zero average gain and loss) is defined as RSI = 50, never NaN.
pub fn rsi_wilder(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];

    let mut gains = Decimal::ZERO;
    let mut losses = Decimal::ZERO;
    for i in 1..=period {
        let delta = window[i] - window[i - 1];
        if delta > Decimal::ZERO {
            gains += delta;
        } else {
            losses += -delta;
        }
    }
    let mut avg_gain = gains / Decimal::from(period);
    let mut avg_loss = losses / Decimal::from(period);

    // Any bars beyond the initial seed window are rolled in with Wilder smoothing.
    for i in (period + 1)..window.len() {
        let delta = window[i] - window[i - 1];
        let (gain, loss) = if delta > Decimal::ZERO {
            (delta, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -delta)
        };
        avg_gain = (avg_gain * Decimal::from(period - 1) + gain) / Decimal::from(period);
        avg_loss = (avg_loss * Decimal::from(period - 1) + loss) / Decimal::from(period);
    }

    if avg_gain.is_zero() && avg_loss.is_zero() {
        return Some(Decimal::from(50));
    }
    if avg_loss.is_zero() {
        return Some(Decimal::from(100));
    }
    let rs = avg_gain / avg_loss;
    Some(Decimal::from(100) - (Decimal::from(100) / (Decimal::ONE + rs)))
}

/// MACD line (fast EMA - slow EMA), signal line (EMA of the MACD line), and
/// histogram. Only emitted when `fast < slow` and at least `slow + signal`
/// candles are available.
pub fn compute_macd(
    closes: &[Decimal],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdValues> {
    if fast >= slow || closes.len() < slow + signal {
        return None;
    }
    let fast_series = ema_series(closes, fast)?;
    let slow_series = ema_series(closes, slow)?;

    // Align both series to the same (later) starting index (slow's seed index).
    let offset = slow - fast;
    let macd_series: Vec<Decimal> = fast_series[offset..]
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_series.len() < signal {
        return None;
    }
    let signal_value = ema(&macd_series, signal)?;
    let line = *macd_series.last()?;
    Some(MacdValues {
        line,
        signal: signal_value,
        histogram: line - signal_value,
    })
}

/// Wilder's ATR: true range smoothed with Wilder's recursive average.
pub fn atr_wilder(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - (period + 1)..];
    let mut tr_sum = Decimal::ZERO;
    for i in 1..=period {
        tr_sum += window[i].true_range(window[i - 1].close);
    }
    let mut atr = tr_sum / Decimal::from(period);
    for i in (period + 1)..window.len() {
        let tr = window[i].true_range(window[i - 1].close);
        atr = (atr * Decimal::from(period - 1) + tr) / Decimal::from(period);
    }
    Some(atr)
}

/// Wilder's ADX from smoothed +DM/-DM and true range.
pub fn adx_wilder(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }
    let n = candles.len();
    let mut plus_dm = Vec::with_capacity(n);
    let mut minus_dm = Vec::with_capacity(n);
    let mut tr = Vec::with_capacity(n);

    for i in 1..n {
        let up_move = candles[i].high - candles[i - 1].high;
        let down_move = candles[i - 1].low - candles[i].low;
        let pdm = if up_move > down_move && up_move > Decimal::ZERO {
            up_move
        } else {
            Decimal::ZERO
        };
        let mdm = if down_move > up_move && down_move > Decimal::ZERO {
            down_move
        } else {
            Decimal::ZERO
        };
        plus_dm.push(pdm);
        minus_dm.push(mdm);
        tr.push(candles[i].true_range(candles[i - 1].close));
    }

    if plus_dm.len() < 2 * period {
        return None;
    }

    let wilder_smooth = |series: &[Decimal], period: usize| -> Vec<Decimal> {
        let mut smoothed = Vec::with_capacity(series.len() - period + 1);
        let seed: Decimal = series[..period].iter().copied().sum();
        smoothed.push(seed);
        let mut value = seed;
        for &v in &series[period..] {
            value = value - (value / Decimal::from(period)) + v;
            smoothed.push(value);
        }
        smoothed
    };

    let smoothed_tr = wilder_smooth(&tr, period);
    let smoothed_pdm = wilder_smooth(&plus_dm, period);
    let smoothed_mdm = wilder_smooth(&minus_dm, period);

    let dx_series: Vec<Decimal> = smoothed_tr
        .iter()
        .zip(smoothed_pdm.iter())
        .zip(smoothed_mdm.iter())
        .map(|((&tr, &pdm), &mdm)| {
            if tr.is_zero() {
                return Decimal::ZERO;
            }
            let plus_di = Decimal::from(100) * pdm / tr;
            let minus_di = Decimal::from(100) * mdm / tr;
            let di_sum = plus_di + minus_di;
            if di_sum.is_zero() {
                Decimal::ZERO
            } else {
                Decimal::from(100) * (plus_di - minus_di).abs() / di_sum
            }
        })
        .collect();

    sma(&dx_series, period)
}

/// Mean volume over the last `window` candles.
pub fn avg_volume(candles: &[Candle], window: usize) -> Option<Decimal> {
    if window == 0 || candles.len() < window {
        return None;
    }
    let tail = &candles[candles.len() - window..];
    let sum: Decimal = tail.iter().map(|c| c.volume).sum();
    Some(sum / Decimal::from(window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(i: i64, close: Decimal) -> Candle {
        Candle::new(i * 60, i * 60 + 60, close, close + dec!(1), close - dec!(1), close, dec!(100))
    }

    fn series(closes: &[i64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle(i as i64, Decimal::from(c)))
            .collect()
    }

    #[test]
    fn ema_absent_below_period() {
        let closes = vec![dec!(1), dec!(2)];
        assert!(ema(&closes, 5).is_none());
    }

    #[test]
    fn ema_seeded_from_simple_mean() {
        let closes = vec![dec!(1), dec!(2), dec!(3)];
        // period == len: EMA seed == SMA, no further smoothing applied.
        assert_eq!(ema(&closes, 3), Some(dec!(2)));
    }

    #[test]
    fn rsi_of_flat_window_is_fifty() {
        let candles = series(&[100; 20]);
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        assert_eq!(rsi_wilder(&closes, 14), Some(dec!(50)));
    }

    #[test]
    fn rsi_absent_without_enough_history() {
        let closes = vec![dec!(1); 5];
        assert!(rsi_wilder(&closes, 14).is_none());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let prices: Vec<i64> = (1..=20).collect();
        let candles = series(&prices);
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        assert_eq!(rsi_wilder(&closes, 14), Some(dec!(100)));
    }

    #[test]
    fn macd_requires_fast_below_slow() {
        let closes = vec![dec!(1); 100];
        assert!(compute_macd(&closes, 26, 12, 9).is_none());
    }

    #[test]
    fn macd_absent_without_enough_candles() {
        let closes = vec![dec!(1); 30];
        assert!(compute_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_present_with_enough_history() {
        let prices: Vec<i64> = (1..=60).collect();
        let candles = series(&prices);
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        assert!(compute_macd(&closes, 12, 26, 9).is_some());
    }

    #[test]
    fn indicators_are_deterministic() {
        let candles = series(&(1..=60).collect::<Vec<_>>());
        let cfg = IndicatorConfig::default();
        let a = compute_snapshot(&candles, &cfg);
        let b = compute_snapshot(&candles, &cfg);
        assert_eq!(a, b);
    }

    #[test]
    fn atr_absent_without_enough_history() {
        let candles = series(&[1, 2, 3]);
        assert!(atr_wilder(&candles, 14).is_none());
    }

    #[test]
    fn avg_volume_mean_over_window() {
        let candles = series(&(1..=25).collect::<Vec<_>>());
        assert_eq!(avg_volume(&candles, 20), Some(dec!(100)));
        assert!(avg_volume(&candles, 30).is_none());
    }
}
