//! Protection plugins: independent entry gates evaluated against recent
//! trade history, each either silent or returning a `SkipReason` with the
//! offending rule name attached.

use crate::domain::errors::SkipReason;
use crate::domain::trade::Trade;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub stop_duration_candles: u32,
    pub candle_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoplossGuardConfig {
    pub lookback_trades: usize,
    pub trade_limit: usize,
    pub stop_duration_candles: u32,
    pub candle_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaxDrawdownConfig {
    pub lookback_trades: usize,
    pub max_allowed_drawdown: Decimal,
    pub stop_duration_candles: u32,
    pub candle_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LowProfitPairsConfig {
    pub lookback_trades: usize,
    pub required_profit: Decimal,
    pub stop_duration_candles: u32,
    pub candle_duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Protection {
    Cooldown(CooldownConfig),
    StoplossGuard(StoplossGuardConfig),
    MaxDrawdown(MaxDrawdownConfig),
    LowProfitPairs(LowProfitPairsConfig),
}

impl Protection {
    pub fn name(&self) -> &'static str {
        match self {
            Protection::Cooldown(_) => "cooldown",
            Protection::StoplossGuard(_) => "stoploss_guard",
            Protection::MaxDrawdown(_) => "max_drawdown",
            Protection::LowProfitPairs(_) => "low_profit_pairs",
        }
    }
}

fn closed_trades_for(trades: &[Trade], symbol: &str) -> Vec<&Trade> {
    trades.iter().filter(|t| t.is_closing() && t.symbol == symbol).collect()
}

/// Blocks re-entry into `symbol` for `stop_duration_candles` after its most
/// recent closing trade.
fn check_cooldown(cfg: &CooldownConfig, trades: &[Trade], symbol: &str, now: i64) -> Result<(), String> {
    let closed = closed_trades_for(trades, symbol);
    let Some(last) = closed.last() else {
        return Ok(());
    };
    let lockout_until = last.timestamp + cfg.stop_duration_candles as i64 * cfg.candle_duration_ms;
    if now < lockout_until {
        return Err(format!("cooldown active until {lockout_until}"));
    }
    Ok(())
}

/// Blocks entry when the last `lookback_trades` closes for `symbol` include
/// more than `trade_limit` stop-loss exits.
fn check_stoploss_guard(cfg: &StoplossGuardConfig, trades: &[Trade], symbol: &str, now: i64) -> Result<(), String> {
    let closed = closed_trades_for(trades, symbol);
    let window: Vec<&&Trade> = closed.iter().rev().take(cfg.lookback_trades).collect();
    let stop_count = window.iter().filter(|t| t.reason == "stop_loss").count();
    if stop_count > cfg.trade_limit {
        if let Some(last) = window.first() {
            let lockout_until = last.timestamp + cfg.stop_duration_candles as i64 * cfg.candle_duration_ms;
            if now < lockout_until {
                return Err(format!("{stop_count} stop-losses in last {} trades", cfg.lookback_trades));
            }
        }
    }
    Ok(())
}

/// Blocks entry when cumulative drawdown over the last `lookback_trades`
/// closes for `symbol` exceeds `max_allowed_drawdown` (fraction, e.g. 0.1).
fn check_max_drawdown(cfg: &MaxDrawdownConfig, trades: &[Trade], symbol: &str, now: i64) -> Result<(), String> {
    let closed = closed_trades_for(trades, symbol);
    let window: Vec<&&Trade> = closed.iter().rev().take(cfg.lookback_trades).collect();
    if window.is_empty() {
        return Ok(());
    }

    let mut peak = Decimal::ZERO;
    let mut cumulative = Decimal::ZERO;
    let mut max_dd = Decimal::ZERO;
    for trade in window.iter().rev() {
        cumulative += trade.pnl.unwrap_or(Decimal::ZERO);
        if cumulative > peak {
            peak = cumulative;
        }
        let dd = if peak.is_zero() {
            Decimal::ZERO
        } else {
            (peak - cumulative) / peak.abs().max(Decimal::ONE)
        };
        if dd > max_dd {
            max_dd = dd;
        }
    }

    if max_dd >= cfg.max_allowed_drawdown {
        if let Some(last) = window.first() {
            let lockout_until = last.timestamp + cfg.stop_duration_candles as i64 * cfg.candle_duration_ms;
            if now < lockout_until {
                return Err(format!("drawdown {max_dd:.4} >= {:.4}", cfg.max_allowed_drawdown));
            }
        }
    }
    Ok(())
}

/// Blocks entry when the average pnl fraction over the last `lookback_trades`
/// closes for `symbol` is below `required_profit`.
fn check_low_profit_pairs(cfg: &LowProfitPairsConfig, trades: &[Trade], symbol: &str, now: i64) -> Result<(), String> {
    let closed = closed_trades_for(trades, symbol);
    let window: Vec<&&Trade> = closed.iter().rev().take(cfg.lookback_trades).collect();
    if window.len() < cfg.lookback_trades {
        return Ok(());
    }
    let total: Decimal = window.iter().filter_map(|t| t.pnl_fraction).sum();
    let avg = total / Decimal::from(window.len());
    if avg < cfg.required_profit {
        if let Some(last) = window.first() {
            let lockout_until = last.timestamp + cfg.stop_duration_candles as i64 * cfg.candle_duration_ms;
            if now < lockout_until {
                return Err(format!("avg profit {avg:.4} < required {:.4}", cfg.required_profit));
            }
        }
    }
    Ok(())
}

/// Runs every configured protection against `symbol`'s trade history, in
/// order; returns the first block encountered.
pub fn check_protections(
    protections: &[Protection],
    trades: &[Trade],
    symbol: &str,
    now: i64,
) -> Result<(), SkipReason> {
    for protection in protections {
        let result = match protection {
            Protection::Cooldown(cfg) => check_cooldown(cfg, trades, symbol, now),
            Protection::StoplossGuard(cfg) => check_stoploss_guard(cfg, trades, symbol, now),
            Protection::MaxDrawdown(cfg) => check_max_drawdown(cfg, trades, symbol, now),
            Protection::LowProfitPairs(cfg) => check_low_profit_pairs(cfg, trades, symbol, now),
        };
        if let Err(reason) = result {
            return Err(SkipReason::ProtectionBlock {
                rule: protection.name().to_string(),
                reason,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade::TradeSide;
    use rust_decimal_macros::dec;

    fn closing_trade(symbol: &str, reason: &str, timestamp: i64, pnl: Decimal) -> Trade {
        Trade {
            id: "t".into(),
            symbol: symbol.into(),
            side: TradeSide::Sell,
            quantity: dec!(1),
            executed_price: dec!(100),
            cash_impact: dec!(100),
            fee: Decimal::ZERO,
            slippage: Decimal::ZERO,
            timestamp,
            reason: reason.into(),
            pnl: Some(pnl),
            pnl_fraction: Some(pnl / dec!(100)),
            liquidation: false,
        }
    }

    #[test]
    fn cooldown_blocks_immediately_after_close() {
        let cfg = CooldownConfig {
            stop_duration_candles: 3,
            candle_duration_ms: 60_000,
        };
        let trades = vec![closing_trade("BTC", "take_profit", 0, dec!(10))];
        let result = check_protections(&[Protection::Cooldown(cfg)], &trades, "BTC", 10_000);
        assert!(result.is_err());
    }

    #[test]
    fn cooldown_allows_after_window_elapses() {
        let cfg = CooldownConfig {
            stop_duration_candles: 3,
            candle_duration_ms: 60_000,
        };
        let trades = vec![closing_trade("BTC", "take_profit", 0, dec!(10))];
        let result = check_protections(&[Protection::Cooldown(cfg)], &trades, "BTC", 200_000);
        assert!(result.is_ok());
    }

    #[test]
    fn stoploss_guard_blocks_when_limit_exceeded() {
        let cfg = StoplossGuardConfig {
            lookback_trades: 3,
            trade_limit: 1,
            stop_duration_candles: 5,
            candle_duration_ms: 60_000,
        };
        let trades = vec![
            closing_trade("BTC", "stop_loss", 0, dec!(-10)),
            closing_trade("BTC", "stop_loss", 60_000, dec!(-10)),
        ];
        let result = check_protections(&[Protection::StoplossGuard(cfg)], &trades, "BTC", 120_000);
        assert!(result.is_err());
    }

    #[test]
    fn other_symbols_are_unaffected() {
        let cfg = CooldownConfig {
            stop_duration_candles: 3,
            candle_duration_ms: 60_000,
        };
        let trades = vec![closing_trade("BTC", "take_profit", 0, dec!(10))];
        let result = check_protections(&[Protection::Cooldown(cfg)], &trades, "ETH", 1_000);
        assert!(result.is_ok());
    }
}
