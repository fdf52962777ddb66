//! Shape of sentiment data consumed by the risk gate. Fetching and scoring
//! news live outside this crate; this module only defines the snapshot type
//! and the gate predicate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A scored sentiment reading for one symbol, produced by an external
/// collaborator and handed to the risk gate as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub symbol: String,
    pub score: Decimal,
    pub as_of: i64,
}

impl SentimentSnapshot {
    pub fn is_stale(&self, now: i64, max_age_ms: i64) -> bool {
        now - self.as_of > max_age_ms
    }
}

/// Blocks entry when a fresh, sufficiently negative sentiment score exists
/// for the symbol. A stale or absent snapshot never blocks.
pub fn sentiment_allows_entry(
    snapshot: Option<&SentimentSnapshot>,
    now: i64,
    max_age_ms: i64,
    min_score_threshold: Decimal,
) -> Result<(), String> {
    let Some(snapshot) = snapshot else {
        return Ok(());
    };
    if snapshot.is_stale(now, max_age_ms) {
        return Ok(());
    }
    if snapshot.score < min_score_threshold {
        return Err(format!(
            "sentiment {} below threshold {}",
            snapshot.score, min_score_threshold
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stale_sentiment_never_blocks() {
        let snapshot = SentimentSnapshot {
            symbol: "BTCUSDT".into(),
            score: dec!(-0.9),
            as_of: 0,
        };
        assert!(sentiment_allows_entry(Some(&snapshot), 100_000, 1_000, dec!(-0.5)).is_ok());
    }

    #[test]
    fn fresh_negative_sentiment_blocks() {
        let snapshot = SentimentSnapshot {
            symbol: "BTCUSDT".into(),
            score: dec!(-0.9),
            as_of: 0,
        };
        assert!(sentiment_allows_entry(Some(&snapshot), 500, 1_000, dec!(-0.5)).is_err());
    }

    #[test]
    fn missing_snapshot_never_blocks() {
        assert!(sentiment_allows_entry(None, 0, 1_000, dec!(-0.5)).is_ok());
    }
}
