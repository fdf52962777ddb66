use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar. Time-ordered by `open_time`; sequences must not
/// assume contiguity but a sequence builder must reject bars that arrive
/// out of order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        open_time: i64,
        close_time: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn true_range(&self, prev_close: Decimal) -> Decimal {
        let a = self.high - self.low;
        let b = (self.high - prev_close).abs();
        let c = (self.low - prev_close).abs();
        a.max(b).max(c)
    }
}

/// Append-only, time-ordered candle buffer. `push` rejects a candle whose
/// `open_time` does not strictly follow the last stored bar.
#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self {
            candles: Vec::new(),
        }
    }

    pub fn from_sorted(candles: Vec<Candle>) -> Result<Self, OutOfOrderError> {
        let mut series = Self::new();
        for c in candles {
            series.push(c)?;
        }
        Ok(series)
    }

    pub fn push(&mut self, candle: Candle) -> Result<(), OutOfOrderError> {
        if let Some(last) = self.candles.last()
            && candle.open_time <= last.open_time
        {
            return Err(OutOfOrderError {
                last_open_time: last.open_time,
                incoming_open_time: candle.open_time,
            });
        }
        self.candles.push(candle);
        Ok(())
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn tail(&self, n: usize) -> &[Candle] {
        let start = self.candles.len().saturating_sub(n);
        &self.candles[start..]
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("out-of-order candle: last open_time={last_open_time}, incoming open_time={incoming_open_time}")]
pub struct OutOfOrderError {
    pub last_open_time: i64,
    pub incoming_open_time: i64,
}

/// Compress `factor` consecutive bars into one higher-timeframe bar: open of
/// the first, close of the last, high/low extremes, summed volume. Only
/// complete, non-overlapping windows are emitted — a trailing partial window
/// would mix a still-forming bar into the snapshot and is dropped instead.
pub fn aggregate(candles: &[Candle], factor: usize) -> Vec<Candle> {
    if factor <= 1 || candles.is_empty() {
        return candles.to_vec();
    }
    candles
        .chunks(factor)
        .filter(|chunk| chunk.len() == factor)
        .map(|chunk| {
            let first = chunk.first().unwrap();
            let last = chunk.last().unwrap();
            let high = chunk.iter().map(|c| c.high).fold(Decimal::MIN, Decimal::max);
            let low = chunk.iter().map(|c| c.low).fold(Decimal::MAX, Decimal::min);
            let volume: Decimal = chunk.iter().map(|c| c.volume).sum();
            Candle::new(first.open_time, last.close_time, first.open, high, low, last.close, volume)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(t: i64, close: Decimal) -> Candle {
        Candle::new(t, t + 60, close, close, close, close, dec!(1))
    }

    #[test]
    fn rejects_out_of_order_insertion() {
        let mut series = CandleSeries::new();
        series.push(candle(100, dec!(1))).unwrap();
        series.push(candle(200, dec!(1))).unwrap();
        let err = series.push(candle(150, dec!(1))).unwrap_err();
        assert_eq!(err.last_open_time, 200);
        assert_eq!(err.incoming_open_time, 150);
    }

    #[test]
    fn rejects_duplicate_open_time() {
        let mut series = CandleSeries::new();
        series.push(candle(100, dec!(1))).unwrap();
        assert!(series.push(candle(100, dec!(1))).is_err());
    }

    #[test]
    fn tail_does_not_assume_contiguity() {
        let mut series = CandleSeries::new();
        series.push(candle(100, dec!(1))).unwrap();
        series.push(candle(500, dec!(2))).unwrap();
        assert_eq!(series.tail(2).len(), 2);
        assert_eq!(series.tail(10).len(), 2);
    }

    #[test]
    fn aggregate_drops_trailing_partial_window() {
        let candles: Vec<Candle> = (0..7).map(|i| candle(i * 60, Decimal::from(i))).collect();
        let higher = aggregate(&candles, 3);
        assert_eq!(higher.len(), 2);
        assert_eq!(higher[0].close, Decimal::from(2));
        assert_eq!(higher[1].close, Decimal::from(5));
    }

    #[test]
    fn aggregate_passthrough_for_factor_one() {
        let candles: Vec<Candle> = (0..3).map(|i| candle(i * 60, Decimal::from(i))).collect();
        assert_eq!(aggregate(&candles, 1), candles);
    }
}
