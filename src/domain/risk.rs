//! Risk gate: the single chokepoint every entry must pass before an
//! account operation is attempted. Checks run cheapest-first so a rejection
//! never pays for the expensive ones.

use crate::domain::account::Account;
use crate::domain::errors::SkipReason;
use crate::domain::protections::{self, Protection};
use crate::domain::sentiment::{self, SentimentSnapshot};
use crate::domain::trade::Trade;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_concurrent_positions: usize,
    pub max_symbol_notional_fraction: Decimal,
    pub daily_loss_limit_pct: Decimal,
    pub max_total_loss_pct: Decimal,
    pub max_correlation: Decimal,
    pub max_portfolio_heat: Decimal,
    pub kelly_fraction_cap: Decimal,
    pub allow_shorts: bool,
    pub sentiment_max_age_ms: i64,
    pub sentiment_min_score: Decimal,
    /// Enables Kelly-sized entries (see `kelly_position_fraction`). When
    /// false, or when the closed-trade sample is too small, the configured
    /// `position_sizing.position_ratio` is used unchanged.
    #[serde(default)]
    pub use_kelly_sizing: bool,
    /// Number of most-recent closed trades required before Kelly sizing
    /// engages.
    #[serde(default = "default_kelly_lookback_trades")]
    pub kelly_lookback_trades: usize,
    /// Floor applied to a positive Kelly fraction.
    #[serde(default)]
    pub kelly_min_fraction: Decimal,
}

fn default_kelly_lookback_trades() -> usize {
    20
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 5,
            max_symbol_notional_fraction: Decimal::new(3, 1),
            daily_loss_limit_pct: Decimal::new(5, 0),
            max_total_loss_pct: Decimal::new(25, 0),
            max_correlation: Decimal::new(8, 1),
            max_portfolio_heat: Decimal::new(6, 1),
            kelly_fraction_cap: Decimal::new(25, 2),
            allow_shorts: true,
            sentiment_max_age_ms: 3_600_000,
            sentiment_min_score: Decimal::new(-5, 1),
            use_kelly_sizing: false,
            kelly_lookback_trades: default_kelly_lookback_trades(),
            kelly_min_fraction: Decimal::new(5, 2),
        }
    }
}

pub struct RiskContext<'a> {
    pub account: &'a Account,
    pub equity: Decimal,
    pub symbol: &'a str,
    pub is_short: bool,
    pub is_futures_or_margin_market: bool,
    pub today: NaiveDate,
    pub now: i64,
    pub protections: &'a [Protection],
    pub sentiment: Option<&'a SentimentSnapshot>,
    /// Correlation of `symbol`'s returns against each currently open symbol.
    pub correlations: &'a HashMap<String, Decimal>,
    /// Sum of `|notional| / equity` across open positions, excluding the
    /// candidate.
    pub current_portfolio_heat: Decimal,
    pub candidate_notional_fraction: Decimal,
}

/// Runs every gate in order; the first failure is returned. Passing all
/// gates does not guarantee the subsequent account operation succeeds (cash
/// may still be insufficient at execution time) — it only establishes that
/// risk policy admits the attempt.
pub fn check_entry(ctx: &RiskContext, cfg: &RiskConfig) -> Result<(), SkipReason> {
    if ctx.is_short && (!cfg.allow_shorts || !ctx.is_futures_or_margin_market) {
        return Err(SkipReason::MarketUnsupported {
            symbol: ctx.symbol.to_string(),
        });
    }

    if ctx.account.positions.len() >= cfg.max_concurrent_positions
        && !ctx.account.positions.contains_key(ctx.symbol)
    {
        return Err(SkipReason::MaxPositionsReached {
            max: cfg.max_concurrent_positions,
        });
    }

    if ctx.candidate_notional_fraction > cfg.max_symbol_notional_fraction {
        return Err(SkipReason::SymbolCapExceeded {
            symbol: ctx.symbol.to_string(),
        });
    }

    let today_loss = ctx.account.today_realized_loss(ctx.today);
    if !ctx.account.initial_cash.is_zero() {
        let loss_pct = today_loss / ctx.account.initial_cash * Decimal::from(100);
        if loss_pct >= cfg.daily_loss_limit_pct {
            return Err(SkipReason::DailyLossLimit {
                loss_pct,
                limit_pct: cfg.daily_loss_limit_pct,
            });
        }
    }

    if !ctx.account.initial_cash.is_zero() {
        let total_loss_pct =
            (ctx.account.initial_cash - ctx.equity) / ctx.account.initial_cash * Decimal::from(100);
        if total_loss_pct >= cfg.max_total_loss_pct {
            return Err(SkipReason::MaxTotalLossPaused {
                loss_pct: total_loss_pct,
                limit_pct: cfg.max_total_loss_pct,
            });
        }
    }

    protections::check_protections(ctx.protections, &ctx.account.trades, ctx.symbol, ctx.now)?;

    if let Err(reason) = sentiment::sentiment_allows_entry(
        ctx.sentiment,
        ctx.now,
        cfg.sentiment_max_age_ms,
        cfg.sentiment_min_score,
    ) {
        return Err(SkipReason::SentimentBlock { reason });
    }

    for (other_symbol, correlation) in ctx.correlations {
        if correlation.abs() >= cfg.max_correlation {
            return Err(SkipReason::CorrelationBlock {
                symbol: other_symbol.clone(),
                correlation: *correlation,
            });
        }
    }

    let projected_heat = ctx.current_portfolio_heat + ctx.candidate_notional_fraction;
    if projected_heat >= cfg.max_portfolio_heat {
        return Err(SkipReason::HeatBlock {
            heat: projected_heat,
            max: cfg.max_portfolio_heat,
        });
    }

    Ok(())
}

/// Fractional Kelly position size: `f* = win_rate - (1 - win_rate) / payoff_ratio`,
/// clamped to `[0, kelly_fraction_cap]`. A non-positive edge sizes to zero
/// rather than going negative.
pub fn kelly_position_fraction(win_rate: Decimal, payoff_ratio: Decimal, cap: Decimal) -> Decimal {
    if payoff_ratio <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let edge = win_rate - (Decimal::ONE - win_rate) / payoff_ratio;
    edge.clamp(Decimal::ZERO, cap)
}

/// Scales a candidate's position ratio down by the sum of `|correlation|`
/// against currently held same-direction symbols: `ratio * (1 - Σ|corr_i|)`,
/// floored at zero. With no correlated symbols the ratio passes through
/// unchanged.
pub fn heat_scaled_ratio(base_ratio: Decimal, correlations: &HashMap<String, Decimal>) -> Decimal {
    let correlation_sum: Decimal = correlations.values().map(|c| c.abs()).sum();
    let scale = (Decimal::ONE - correlation_sum).max(Decimal::ZERO);
    base_ratio * scale
}

/// Sum of `|notional| / equity` across every open position, for the heat gate
/// and the portfolio-heat scaling of the next entry's size. Positions the
/// caller has no fresh mark for fall back to their entry price, which is
/// exact for a just-opened position and a reasonable approximation for an
/// older one the caller hasn't re-quoted.
pub fn portfolio_heat(account: &Account, marks: &HashMap<String, Decimal>, equity: Decimal) -> Decimal {
    if equity.is_zero() {
        return Decimal::ZERO;
    }
    account
        .positions
        .values()
        .map(|pos| {
            let mark = marks.get(&pos.symbol).copied().unwrap_or(pos.entry_price);
            (pos.notional(mark) / equity).abs()
        })
        .sum()
}

/// Effective entry sizing ratio: Kelly-sized from the last `kelly_lookback_trades`
/// closed trades when enabled and the sample supports a positive edge,
/// otherwise the scenario's configured `fallback` ratio. Independent of
/// portfolio heat, which only ever shrinks the candidate's notional fraction
/// relative to equity, not the sizing ratio itself.
pub fn kelly_effective_ratio(trades: &[Trade], cfg: &RiskConfig, fallback: Decimal) -> Decimal {
    if !cfg.use_kelly_sizing {
        return fallback;
    }
    let closed: Vec<&Trade> = trades.iter().filter(|t| t.is_closing()).collect();
    if closed.len() < cfg.kelly_lookback_trades {
        return fallback;
    }
    let recent = &closed[closed.len() - cfg.kelly_lookback_trades..];
    let wins: Vec<Decimal> = recent.iter().filter_map(|t| t.pnl).filter(|p| *p > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = recent
        .iter()
        .filter_map(|t| t.pnl)
        .filter(|p| *p < Decimal::ZERO)
        .map(|p| -p)
        .collect();
    if wins.is_empty() || losses.is_empty() {
        return fallback;
    }
    let win_rate = Decimal::from(wins.len() as i64) / Decimal::from(recent.len() as i64);
    let avg_win = wins.iter().sum::<Decimal>() / Decimal::from(wins.len() as i64);
    let avg_loss = losses.iter().sum::<Decimal>() / Decimal::from(losses.len() as i64);
    if avg_loss.is_zero() {
        return fallback;
    }
    let payoff_ratio = avg_win / avg_loss;
    let fraction = kelly_position_fraction(win_rate, payoff_ratio, cfg.kelly_fraction_cap);
    if fraction <= Decimal::ZERO {
        fallback
    } else {
        fraction.max(cfg.kelly_min_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Account;
    use rust_decimal_macros::dec;

    fn base_ctx<'a>(account: &'a Account, correlations: &'a HashMap<String, Decimal>) -> RiskContext<'a> {
        RiskContext {
            account,
            equity: dec!(10000),
            symbol: "BTCUSDT",
            is_short: false,
            is_futures_or_margin_market: true,
            today: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            now: 1_000_000,
            protections: &[],
            sentiment: None,
            correlations,
            current_portfolio_heat: Decimal::ZERO,
            candidate_notional_fraction: dec!(0.1),
        }
    }

    #[test]
    fn daily_loss_limit_blocks_when_breached() {
        let mut account = Account::new("x", dec!(10000), 0);
        account.daily_loss = Some(crate::domain::account::DailyLoss {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            cumulative_loss: dec!(600),
        });
        let correlations = HashMap::new();
        let ctx = base_ctx(&account, &correlations);
        let cfg = RiskConfig::default();
        let result = check_entry(&ctx, &cfg);
        assert!(matches!(result, Err(SkipReason::DailyLossLimit { .. })));
    }

    #[test]
    fn max_total_loss_pauses_scenario() {
        let account = Account::new("x", dec!(10000), 0);
        let correlations = HashMap::new();
        let mut ctx = base_ctx(&account, &correlations);
        ctx.equity = dec!(7000);
        let cfg = RiskConfig::default();
        let result = check_entry(&ctx, &cfg);
        assert!(matches!(result, Err(SkipReason::MaxTotalLossPaused { .. })));
    }

    #[test]
    fn shorts_blocked_on_spot_only_market() {
        let account = Account::new("x", dec!(10000), 0);
        let correlations = HashMap::new();
        let mut ctx = base_ctx(&account, &correlations);
        ctx.is_short = true;
        ctx.is_futures_or_margin_market = false;
        let cfg = RiskConfig::default();
        let result = check_entry(&ctx, &cfg);
        assert!(matches!(result, Err(SkipReason::MarketUnsupported { .. })));
    }

    #[test]
    fn correlation_block_fires_above_threshold() {
        let account = Account::new("x", dec!(10000), 0);
        let mut correlations = HashMap::new();
        correlations.insert("ETHUSDT".to_string(), dec!(0.95));
        let ctx = base_ctx(&account, &correlations);
        let cfg = RiskConfig::default();
        let result = check_entry(&ctx, &cfg);
        assert!(matches!(result, Err(SkipReason::CorrelationBlock { .. })));
    }

    #[test]
    fn portfolio_heat_blocks_when_projected_over_max() {
        let account = Account::new("x", dec!(10000), 0);
        let correlations = HashMap::new();
        let mut ctx = base_ctx(&account, &correlations);
        ctx.current_portfolio_heat = dec!(0.55);
        ctx.candidate_notional_fraction = dec!(0.1);
        let cfg = RiskConfig::default();
        let result = check_entry(&ctx, &cfg);
        assert!(matches!(result, Err(SkipReason::HeatBlock { .. })));
    }

    #[test]
    fn kelly_fraction_is_zero_for_negative_edge() {
        let f = kelly_position_fraction(dec!(0.3), dec!(1), dec!(0.25));
        assert_eq!(f, Decimal::ZERO);
    }

    #[test]
    fn kelly_fraction_clamps_at_cap() {
        let f = kelly_position_fraction(dec!(0.9), dec!(3), dec!(0.25));
        assert_eq!(f, dec!(0.25));
    }

    #[test]
    fn passing_ctx_admits_entry() {
        let account = Account::new("x", dec!(10000), 0);
        let correlations = HashMap::new();
        let ctx = base_ctx(&account, &correlations);
        let cfg = RiskConfig::default();
        assert!(check_entry(&ctx, &cfg).is_ok());
    }

    fn open_position(symbol: &str, quantity: Decimal, entry_price: Decimal) -> crate::domain::position::Position {
        crate::domain::position::Position {
            symbol: symbol.to_string(),
            side: crate::domain::position::Side::Long,
            quantity,
            entry_price,
            entry_time: 0,
            stop_loss: dec!(1),
            take_profit: dec!(1000000),
            trailing_stop: crate::domain::position::TrailingStopState::Inactive,
            dca_state: None,
            staged_take_profits: Vec::new(),
            margin_amount: None,
            signal_history_id: None,
        }
    }

    #[test]
    fn portfolio_heat_falls_back_to_entry_price_without_a_fresh_mark() {
        let mut account = Account::new("x", dec!(10000), 0);
        account.positions.insert("ETHUSDT".to_string(), open_position("ETHUSDT", dec!(10), dec!(100)));
        let heat = portfolio_heat(&account, &HashMap::new(), dec!(10000));
        assert_eq!(heat, dec!(0.1));
    }

    #[test]
    fn heat_scaled_ratio_shrinks_with_correlated_exposure() {
        let mut correlations = HashMap::new();
        correlations.insert("ETHUSDT".to_string(), dec!(0.3));
        let scaled = heat_scaled_ratio(dec!(0.2), &correlations);
        assert_eq!(scaled, dec!(0.14));
    }

    #[test]
    fn heat_scaled_ratio_passes_through_with_no_correlations() {
        let scaled = heat_scaled_ratio(dec!(0.2), &HashMap::new());
        assert_eq!(scaled, dec!(0.2));
    }

    #[test]
    fn portfolio_heat_is_zero_with_no_open_positions() {
        let account = Account::new("x", dec!(10000), 0);
        assert_eq!(portfolio_heat(&account, &HashMap::new(), dec!(10000)), Decimal::ZERO);
    }

    fn closing_trade(pnl: Decimal) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: "BTCUSDT".to_string(),
            side: crate::domain::trade::TradeSide::Sell,
            quantity: dec!(1),
            executed_price: dec!(100),
            cash_impact: dec!(100),
            fee: Decimal::ZERO,
            slippage: Decimal::ZERO,
            timestamp: 0,
            reason: "signal".to_string(),
            pnl: Some(pnl),
            pnl_fraction: Some(Decimal::ZERO),
            liquidation: false,
        }
    }

    #[test]
    fn kelly_effective_ratio_falls_back_when_disabled() {
        let cfg = RiskConfig::default();
        let trades: Vec<Trade> = (0..30).map(|i| closing_trade(if i % 2 == 0 { dec!(20) } else { dec!(-10) })).collect();
        assert_eq!(kelly_effective_ratio(&trades, &cfg, dec!(0.2)), dec!(0.2));
    }

    #[test]
    fn kelly_effective_ratio_falls_back_when_sample_too_small() {
        let mut cfg = RiskConfig::default();
        cfg.use_kelly_sizing = true;
        let trades: Vec<Trade> = (0..5).map(|i| closing_trade(if i % 2 == 0 { dec!(20) } else { dec!(-10) })).collect();
        assert_eq!(kelly_effective_ratio(&trades, &cfg, dec!(0.2)), dec!(0.2));
    }

    #[test]
    fn kelly_effective_ratio_sizes_up_on_a_winning_sample() {
        let mut cfg = RiskConfig::default();
        cfg.use_kelly_sizing = true;
        cfg.kelly_lookback_trades = 20;
        cfg.kelly_fraction_cap = dec!(0.5);
        let trades: Vec<Trade> = (0..20).map(|i| closing_trade(if i % 2 == 0 { dec!(30) } else { dec!(-10) })).collect();
        let ratio = kelly_effective_ratio(&trades, &cfg, dec!(0.2));
        assert!(ratio > Decimal::ZERO);
        assert!(ratio <= cfg.kelly_fraction_cap);
    }
}
