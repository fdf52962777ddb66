//! Backtest runner: replays a candle history bar by bar through the
//! indicator pipeline, signal detector, risk gate, and simulated account,
//! producing a trade log, an equity curve, and summary metrics.

use crate::config::RuntimeConfig;
use crate::domain::account::{self, Account, OpenOptions};
use crate::domain::candle::{self, Candle};
use crate::domain::indicator;
use crate::domain::position::{DcaState, Side};
use crate::domain::regime;
use crate::domain::risk::{self, RiskContext};
use crate::domain::signal::{self, SignalType};
use crate::domain::strategy::StrategyHandle;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySample {
    pub timestamp: i64,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExitReasonCounts {
    pub stop_loss: usize,
    pub take_profit: usize,
    pub trailing_stop: usize,
    pub time_stop: usize,
    pub staged_take_profit: usize,
    pub signal: usize,
    pub end_of_data: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_return_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub sharpe_ratio: Decimal,
    pub sortino_ratio: Decimal,
    pub win_rate_pct: Decimal,
    pub profit_factor: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub avg_hold_bars: Decimal,
    pub total_trades: usize,
    pub exit_reasons: ExitReasonCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub account: Account,
    pub equity_curve: Vec<EquitySample>,
    pub metrics: BacktestMetrics,
}

/// Number of leading bars that must be skipped before any indicator can be
/// computed: the largest of the configured lookback windows, plus one bar
/// of slack for the multi-timeframe filter.
pub fn warmup_bars(cfg: &RuntimeConfig) -> usize {
    let indicator_warmup = [
        cfg.indicator.short_ma_period,
        cfg.indicator.long_ma_period,
        cfg.indicator.rsi_period + 1,
        cfg.indicator.macd_slow + cfg.indicator.macd_signal,
        cfg.indicator.atr_period + 1,
        cfg.indicator.adx_period.map(|p| 2 * p + 1).unwrap_or(0),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);

    let regime_warmup = cfg.regime.lookback.max(cfg.regime.long_ma_period + 2);

    indicator_warmup.max(regime_warmup) + 1
}

struct ExitOutcome {
    price: Decimal,
    reason: &'static str,
}

fn check_exit(position: &crate::domain::position::Position, mark: Decimal, cfg: &RuntimeConfig, now: i64) -> Option<ExitOutcome> {
    let stop_hit = match position.side {
        Side::Long => mark <= position.stop_loss,
        Side::Short => mark >= position.stop_loss,
    };
    if stop_hit {
        return Some(ExitOutcome {
            price: position.stop_loss,
            reason: "stop_loss",
        });
    }

    let tp_hit = match position.side {
        Side::Long => mark >= position.take_profit,
        Side::Short => mark <= position.take_profit,
    };
    if tp_hit {
        return Some(ExitOutcome {
            price: position.take_profit,
            reason: "take_profit",
        });
    }

    if account::time_stop_triggered(position, mark, now, cfg.time_stop_hours) {
        return Some(ExitOutcome {
            price: mark,
            reason: "time_stop",
        });
    }

    None
}

/// Runs a full backtest over `candles` for a single symbol. `candles` must
/// be in strictly increasing `open_time` order; the caller is responsible
/// for supplying a contiguous-enough series (gaps are tolerated, duplicates
/// are not — use `CandleSeries` upstream to enforce this).
pub fn run_backtest(symbol: &str, candles: &[Candle], cfg: &RuntimeConfig) -> BacktestResult {
    run_backtest_with_strategy(symbol, candles, cfg, None)
}

/// Same as `run_backtest`, additionally routing each bar's signal and open
/// positions through `strategy`'s `populate_signal`/`adjust_position` hooks
/// when one is supplied.
pub fn run_backtest_with_strategy(
    symbol: &str,
    candles: &[Candle],
    cfg: &RuntimeConfig,
    strategy: Option<&dyn StrategyHandle>,
) -> BacktestResult {
    let warmup = warmup_bars(cfg);
    let mut account = Account::new(cfg.scenario.clone(), cfg.initial_cash, candles.first().map(|c| c.open_time).unwrap_or(0));
    let mut equity_curve = Vec::new();
    let mut exit_reasons = ExitReasonCounts::default();
    let mut entry_bar_index: HashMap<String, usize> = HashMap::new();
    let mut hold_bars = Vec::new();

    if candles.len() <= warmup {
        let metrics = finalize_metrics(&account.trades, &equity_curve, &exit_reasons, &hold_bars, account.initial_cash);
        return BacktestResult {
            account,
            equity_curve,
            metrics,
        };
    }

    for i in warmup..candles.len() {
        let window = &candles[..=i];
        let current = &candles[i];
        let snapshot = indicator::compute_snapshot(window, &cfg.indicator);
        let regime_classification = regime::classify(window, &cfg.regime);
        let position_side = account.positions.get(symbol).map(|p| p.side);

        if let Some(position) = account.positions.get_mut(symbol) {
            let triggered = account::update_trailing_stop(
                position,
                current.close,
                cfg.trailing_stop.activation_percent,
                cfg.trailing_stop.callback_percent,
            );
            if triggered {
                if let Ok((next, _)) = close_position(&account, symbol, current.close, "trailing_stop", cfg, current.open_time) {
                    account = next;
                    exit_reasons.trailing_stop += 1;
                    if let Some(&entry_idx) = entry_bar_index.get(symbol) {
                        hold_bars.push((i - entry_idx) as i64);
                    }
                    continue;
                }
            }
        }

        if let Some(position) = account.positions.get(symbol).cloned() {
            if let Some(exit) = check_exit(&position, current.close, cfg, current.open_time) {
                if let Ok((next, _)) = close_position(&account, symbol, exit.price, exit.reason, cfg, current.open_time) {
                    account = next;
                    match exit.reason {
                        "stop_loss" => exit_reasons.stop_loss += 1,
                        "take_profit" => exit_reasons.take_profit += 1,
                        "time_stop" => exit_reasons.time_stop += 1,
                        _ => {}
                    }
                    if let Some(&entry_idx) = entry_bar_index.get(symbol) {
                        hold_bars.push((i - entry_idx) as i64);
                    }
                    continue;
                }
            }
        }

        if let Some(position) = account.positions.get_mut(symbol) {
            if let Some(stage) = account::check_staged_take_profit(position, current.close) {
                if let Ok((next, _)) = account::close_partial(
                    &account,
                    symbol,
                    current.close,
                    stage.close_ratio,
                    "staged_take_profit",
                    cfg.execution_costs.fee_rate,
                    cfg.execution_costs.slippage_percent,
                    cfg.execution_costs.spread_bps,
                    current.open_time,
                    epoch_ms_to_date(current.open_time),
                ) {
                    account = next;
                    exit_reasons.staged_take_profit += 1;
                }
            }
        }

        if let Some(position) = account.positions.get(symbol).cloned() {
            let adjustment = strategy.and_then(|s| s.adjust_position(&position, &snapshot));
            match adjustment {
                Some(amount) if amount > Decimal::ZERO => {
                    if let Ok((next, _)) = account::dca_add(&account, symbol, current.close, amount, current.open_time) {
                        account = next;
                    }
                }
                Some(amount) if amount < Decimal::ZERO => {
                    let notional = position.notional(current.close);
                    if !notional.is_zero() {
                        let ratio = (-amount / notional).min(Decimal::ONE);
                        if let Ok((next, _)) = account::close_partial(
                            &account,
                            symbol,
                            current.close,
                            ratio,
                            "strategy_adjust",
                            cfg.execution_costs.fee_rate,
                            cfg.execution_costs.slippage_percent,
                            cfg.execution_costs.spread_bps,
                            current.open_time,
                            epoch_ms_to_date(current.open_time),
                        ) {
                            account = next;
                        }
                    }
                }
                _ => {
                    if let Some(dca_state) = &position.dca_state {
                        if account::paper_dca_should_trigger(dca_state, current.close, current.open_time) {
                            let add_usdt = cfg.dca.as_ref().map(|d| d.tranche_usdt).unwrap_or(Decimal::ZERO);
                            if add_usdt > Decimal::ZERO {
                                if let Ok((next, _)) = account::dca_add(&account, symbol, current.close, add_usdt, current.open_time) {
                                    account = next;
                                }
                            }
                        }
                    }
                }
            }
        }

        let higher_snapshot = cfg.trend_timeframe.and_then(|factor| {
            let aggregated = candle::aggregate(window, factor);
            if aggregated.is_empty() {
                None
            } else {
                Some(indicator::compute_snapshot(&aggregated, &cfg.indicator))
            }
        });

        let regime_overrides = if cfg.regime_strategies.is_empty() {
            None
        } else {
            Some(&cfg.regime_strategies)
        };
        let base_rules = strategy.map(|s| s.rules()).unwrap_or(&cfg.signal_rules);
        let effective_rules = signal::effective_rules(base_rules, regime_overrides, regime_classification.map(|r| r.label));
        let thresholds = cfg.rule_thresholds.clone();
        let mut signal = signal::detect_signal(
            symbol,
            &snapshot,
            Some(current.close),
            &effective_rules,
            &thresholds,
            position_side,
            current.open_time,
        );
        if let Some(s) = strategy {
            signal = s.populate_signal(signal, &snapshot);
        }
        signal = signal::apply_trend_timeframe_filter(signal, higher_snapshot.as_ref());

        match signal.signal_type {
            SignalType::Buy | SignalType::Short => {
                let marks = mark_map(symbol, current.close);
                let equity = account.equity(&marks);
                let heat = risk::portfolio_heat(&account, &marks, equity);
                let kelly_ratio = risk::kelly_effective_ratio(&account.trades, &cfg.risk, cfg.position_sizing.position_ratio);
                let scaled_ratio = risk::heat_scaled_ratio(kelly_ratio, entry_ctx_empty_corr());
                let ctx = entry_ctx(
                    &account,
                    equity,
                    symbol,
                    signal.signal_type == SignalType::Short,
                    cfg,
                    current.open_time,
                    heat,
                    scaled_ratio,
                );
                if risk::check_entry(&ctx, &cfg.risk).is_ok() {
                    let opts = open_options(cfg, scaled_ratio);
                    let result = if signal.signal_type == SignalType::Buy {
                        account::open_long(&account, symbol, current.close, "signal", &opts, current.open_time, equity)
                    } else {
                        account::open_short(&account, symbol, current.close, "signal", &opts, current.open_time, equity)
                    };
                    if let Ok((next, _)) = result {
                        account = next;
                        apply_open_configs(&mut account, symbol, cfg, current.open_time);
                        entry_bar_index.insert(symbol.to_string(), i);
                    }
                }
            }
            SignalType::Sell | SignalType::Cover => {
                if let Ok((next, _)) = close_position(&account, symbol, current.close, "signal", cfg, current.open_time) {
                    account = next;
                    exit_reasons.signal += 1;
                    if let Some(&entry_idx) = entry_bar_index.get(symbol) {
                        hold_bars.push((i - entry_idx) as i64);
                    }
                }
            }
            SignalType::None => {}
        }

        let marks = mark_map(symbol, current.close);
        equity_curve.push(EquitySample {
            timestamp: current.open_time,
            equity: account.equity(&marks),
        });
    }

    if let Some(last) = candles.last() {
        if account.positions.contains_key(symbol) {
            if let Ok((next, _)) = close_position(&account, symbol, last.close, "end_of_data", cfg, last.open_time) {
                account = next;
                exit_reasons.end_of_data += 1;
            }
        }
    }

    let metrics = finalize_metrics(&account.trades, &equity_curve, &exit_reasons, &hold_bars, account.initial_cash);
    BacktestResult {
        account,
        equity_curve,
        metrics,
    }
}

fn epoch_ms_to_date(ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|d| d.date_naive())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch date"))
}

fn mark_map(symbol: &str, price: Decimal) -> HashMap<String, Decimal> {
    let mut m = HashMap::new();
    m.insert(symbol.to_string(), price);
    m
}

fn open_options(cfg: &RuntimeConfig, ratio: Decimal) -> OpenOptions {
    OpenOptions {
        fee_rate: cfg.execution_costs.fee_rate,
        slippage_percent: cfg.execution_costs.slippage_percent,
        spread_bps: cfg.execution_costs.spread_bps,
        position_ratio: ratio,
        stop_loss_percent: cfg.position_sizing.stop_loss_percent,
        take_profit_percent: cfg.position_sizing.take_profit_percent,
        usdt_to_spend_override: None,
        min_order_size: cfg.position_sizing.min_order_size,
        is_futures_or_margin_market: cfg.is_futures_or_margin_market,
    }
}

/// Populates a freshly opened position's staged take-profit ladder and DCA
/// state from configuration. No-op if the position isn't found (shouldn't
/// happen immediately after a successful open).
fn apply_open_configs(account: &mut Account, symbol: &str, cfg: &RuntimeConfig, now: i64) {
    if let Some(position) = account.positions.get_mut(symbol) {
        position.staged_take_profits = cfg.staged_take_profits.clone();
        if let Some(dca_cfg) = &cfg.dca {
            position.dca_state = Some(DcaState {
                total_tranches: dca_cfg.total_tranches,
                completed_tranches: 0,
                last_tranche_price: position.entry_price,
                drop_pct_threshold: dca_cfg.drop_pct_threshold,
                started_at: now,
                max_duration_ms: dca_cfg.max_duration_ms,
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn entry_ctx<'a>(
    account: &'a Account,
    equity: Decimal,
    symbol: &'a str,
    is_short: bool,
    cfg: &RuntimeConfig,
    now: i64,
    current_portfolio_heat: Decimal,
    candidate_notional_fraction: Decimal,
) -> RiskContext<'a> {
    RiskContext {
        account,
        equity,
        symbol,
        is_short,
        is_futures_or_margin_market: cfg.is_futures_or_margin_market,
        today: epoch_ms_to_date(now),
        now,
        protections: &cfg.protections,
        sentiment: None,
        correlations: entry_ctx_empty_corr(),
        current_portfolio_heat,
        candidate_notional_fraction,
    }
}

fn entry_ctx_empty_corr() -> &'static HashMap<String, Decimal> {
    use std::sync::OnceLock;
    static EMPTY: OnceLock<HashMap<String, Decimal>> = OnceLock::new();
    EMPTY.get_or_init(HashMap::new)
}

fn close_position(
    account: &Account,
    symbol: &str,
    price: Decimal,
    reason: &str,
    cfg: &RuntimeConfig,
    now: i64,
) -> Result<(Account, crate::domain::trade::Trade), crate::domain::errors::SkipReason> {
    let today = epoch_ms_to_date(now);
    let side = account.positions.get(symbol).map(|p| p.side);
    match side {
        Some(Side::Long) => account::close_long(
            account,
            symbol,
            price,
            reason,
            cfg.execution_costs.fee_rate,
            cfg.execution_costs.slippage_percent,
            cfg.execution_costs.spread_bps,
            now,
            today,
        ),
        Some(Side::Short) => account::close_short(
            account,
            symbol,
            price,
            reason,
            cfg.execution_costs.fee_rate,
            cfg.execution_costs.slippage_percent,
            cfg.execution_costs.spread_bps,
            now,
            today,
        ),
        None => Err(crate::domain::errors::SkipReason::NoPositionOpen {
            symbol: symbol.to_string(),
        }),
    }
}

fn finalize_metrics(
    trades: &[crate::domain::trade::Trade],
    equity_curve: &[EquitySample],
    exit_reasons: &ExitReasonCounts,
    hold_bars: &[i64],
    initial_cash: Decimal,
) -> BacktestMetrics {
    let closed: Vec<&crate::domain::trade::Trade> = trades.iter().filter(|t| t.is_closing()).collect();
    let total_trades = closed.len();

    let final_equity = equity_curve.last().map(|p| p.equity).unwrap_or(initial_cash);
    let total_return_pct = if initial_cash.is_zero() {
        Decimal::ZERO
    } else {
        (final_equity - initial_cash) / initial_cash * Decimal::from(100)
    };

    let mut peak = initial_cash;
    let mut max_dd = Decimal::ZERO;
    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if !peak.is_zero() {
            let dd = (peak - point.equity) / peak * Decimal::from(100);
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    let returns: Vec<Decimal> = equity_curve
        .windows(2)
        .map(|w| {
            if w[0].equity.is_zero() {
                Decimal::ZERO
            } else {
                (w[1].equity - w[0].equity) / w[0].equity
            }
        })
        .collect();

    let sharpe_ratio = sharpe(&returns);
    let sortino_ratio = sortino(&returns);

    let wins: Vec<Decimal> = closed.iter().filter_map(|t| t.pnl).filter(|p| *p > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = closed.iter().filter_map(|t| t.pnl).filter(|p| *p < Decimal::ZERO).collect();

    let win_rate_pct = if total_trades == 0 {
        Decimal::ZERO
    } else {
        Decimal::from(wins.len()) / Decimal::from(total_trades) * Decimal::from(100)
    };

    let gross_profit: Decimal = wins.iter().sum();
    let gross_loss: Decimal = losses.iter().map(|l| -l).sum();
    let profit_factor = if gross_loss.is_zero() {
        if gross_profit.is_zero() {
            Decimal::ZERO
        } else {
            Decimal::MAX
        }
    } else {
        gross_profit / gross_loss
    };

    let avg_win = if wins.is_empty() {
        Decimal::ZERO
    } else {
        wins.iter().sum::<Decimal>() / Decimal::from(wins.len())
    };
    let avg_loss = if losses.is_empty() {
        Decimal::ZERO
    } else {
        losses.iter().sum::<Decimal>() / Decimal::from(losses.len())
    };

    let avg_hold_bars = if hold_bars.is_empty() {
        Decimal::ZERO
    } else {
        Decimal::from(hold_bars.iter().sum::<i64>()) / Decimal::from(hold_bars.len() as i64)
    };

    BacktestMetrics {
        total_return_pct,
        max_drawdown_pct: max_dd,
        sharpe_ratio,
        sortino_ratio,
        win_rate_pct,
        profit_factor,
        avg_win,
        avg_loss,
        avg_hold_bars,
        total_trades,
        exit_reasons: exit_reasons.clone(),
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len())
}

fn std_dev(values: &[Decimal], avg: Decimal) -> Decimal {
    if values.len() < 2 {
        return Decimal::ZERO;
    }
    let variance: Decimal =
        values.iter().map(|v| (*v - avg) * (*v - avg)).sum::<Decimal>() / Decimal::from(values.len() - 1);
    variance.sqrt().unwrap_or(Decimal::ZERO)
}

fn sharpe(returns: &[Decimal]) -> Decimal {
    if returns.is_empty() {
        return Decimal::ZERO;
    }
    let avg = mean(returns);
    let sd = std_dev(returns, avg);
    if sd.is_zero() {
        return Decimal::ZERO;
    }
    avg / sd * Decimal::from(252).sqrt().unwrap_or(Decimal::ONE)
}

fn sortino(returns: &[Decimal]) -> Decimal {
    if returns.is_empty() {
        return Decimal::ZERO;
    }
    let avg = mean(returns);
    let downside: Vec<Decimal> = returns.iter().filter(|r| **r < Decimal::ZERO).copied().collect();
    if downside.is_empty() {
        return Decimal::ZERO;
    }
    let downside_dev = (downside.iter().map(|r| r * r).sum::<Decimal>() / Decimal::from(downside.len()))
        .sqrt()
        .unwrap_or(Decimal::ZERO);
    if downside_dev.is_zero() {
        return Decimal::ZERO;
    }
    avg / downside_dev * Decimal::from(252).sqrt().unwrap_or(Decimal::ONE)
}
