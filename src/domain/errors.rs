use rust_decimal::Decimal;
use thiserror::Error;

/// Fatal, startup-time configuration problems. Propagates to the top level
/// and exits nonzero; never returned from a signal or order path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key: {key}")]
    MissingKey { key: String },
    #[error("invalid config value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Non-exceptional "this operation was not admitted" outcomes. These are
/// first-class values threaded back through `Result<Trade, SkipReason>`,
/// never strings matched by regex and never thrown as exceptions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("price invalid: {price}")]
    PriceInvalid { price: Decimal },
    #[error("insufficient funds: need {need}, available {available}")]
    InsufficientFunds { need: Decimal, available: Decimal },
    #[error("insufficient margin: need {need}, available {available}")]
    InsufficientMargin { need: Decimal, available: Decimal },
    #[error("position already open for {symbol}")]
    PositionAlreadyOpen { symbol: String },
    #[error("no position open for {symbol}")]
    NoPositionOpen { symbol: String },
    #[error("spend {spend} below minimum order size {min}")]
    BelowMinimumOrderSize { spend: Decimal, min: Decimal },
    #[error("market does not support shorting: {symbol}")]
    MarketUnsupported { symbol: String },
    #[error("max concurrent positions reached: {max}")]
    MaxPositionsReached { max: usize },
    #[error("symbol notional cap exceeded for {symbol}")]
    SymbolCapExceeded { symbol: String },
    #[error("daily loss limit reached: {loss_pct:.4}% >= {limit_pct:.4}%")]
    DailyLossLimit { loss_pct: Decimal, limit_pct: Decimal },
    #[error("scenario paused: total loss {loss_pct:.4}% >= {limit_pct:.4}%")]
    MaxTotalLossPaused { loss_pct: Decimal, limit_pct: Decimal },
    #[error("blocked by protection plugin {rule}: {reason}")]
    ProtectionBlock { rule: String, reason: String },
    #[error("blocked by sentiment gate: {reason}")]
    SentimentBlock { reason: String },
    #[error("blocked by correlation filter against {symbol}: corr={correlation:.4}")]
    CorrelationBlock { symbol: String, correlation: Decimal },
    #[error("blocked by portfolio heat filter: heat={heat:.4} >= max={max:.4}")]
    HeatBlock { heat: Decimal, max: Decimal },
    #[error("indicator snapshot not computable: {reason}")]
    DataStale { reason: String },
    #[error("equity non-positive, cannot size position")]
    NonPositiveEquity,
}

/// Infrastructure-level failures that may reach the top-level loop.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("transient exchange error: {reason}")]
    ExchangeTransient { reason: String },
    #[error("fatal exchange error: {reason}")]
    ExchangeFatal { reason: String },
    #[error("reconciliation critical: {reason}")]
    ReconcileCritical { reason: String },
    #[error("persistence error: {0}")]
    Persistence(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn skip_reason_formats_with_values() {
        let reason = SkipReason::DailyLossLimit {
            loss_pct: dec!(5.25),
            limit_pct: dec!(5.00),
        };
        let msg = reason.to_string();
        assert!(msg.contains("5.25"));
        assert!(msg.contains("5.00"));
    }

    #[test]
    fn skip_reason_is_comparable_for_tests() {
        let a = SkipReason::NonPositiveEquity;
        let b = SkipReason::NonPositiveEquity;
        assert_eq!(a, b);
    }
}
