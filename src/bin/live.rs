use anyhow::{Context, Result};
use clap::Parser;
use cryptara::backtest;
use cryptara::config::RuntimeConfig;
use cryptara::domain::account::{self, Account, OpenOptions};
use cryptara::domain::candle::{self, Candle, CandleSeries};
use cryptara::domain::indicator;
use cryptara::domain::position::{DcaState, Side};
use cryptara::domain::regime;
use cryptara::domain::risk::{self, RiskContext};
use cryptara::domain::signal::{self, SignalType};
use cryptara::domain::strategy::StrategyHandle;
use cryptara::executor::binance::BinanceExchangeClient;
use cryptara::executor::{ExchangeClient, LiveExecutor, ReconcileSeverity};
use cryptara::persistence::account_file;
use cryptara::persistence::equity_history::{self, EquitySample};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Live trading loop: each poll cycle fetches the current price per symbol,
/// folds it into a local one-bar-per-cycle candle series, runs the same
/// indicator/regime/signal/risk pipeline the backtest runner uses, and
/// submits any resulting entry or exit to the exchange.
#[derive(Parser, Debug)]
#[command(name = "cryptara")]
struct Args {
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(long)]
    scenario_config: Option<PathBuf>,

    /// Directory holding per-scenario account/signal/equity files.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    /// Seconds between per-symbol polling cycles; each cycle is treated as
    /// one candle for indicator purposes.
    #[arg(long, default_value_t = 60)]
    poll_interval_secs: u64,

    /// Run a single scan cycle and exit, instead of looping.
    #[arg(long, default_value_t = false)]
    once: bool,
}

fn env_or_exit(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn empty_correlations() -> &'static HashMap<String, Decimal> {
    static CORR: OnceLock<HashMap<String, Decimal>> = OnceLock::new();
    CORR.get_or_init(HashMap::new)
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

/// Reduce an open position by `ratio` on the exchange, then record the fill
/// against the local account. Used by staged take-profit and a strategy's
/// negative `adjustPosition` override.
async fn partial_close(
    executor: &LiveExecutor<&BinanceExchangeClient>,
    account: &Account,
    symbol: &str,
    ratio: Decimal,
    reason: &str,
    now: i64,
) -> Result<Option<Account>> {
    let Some(position) = account.positions.get(symbol) else {
        return Ok(None);
    };
    let side = position.side;
    let close_qty = position.quantity * ratio.clamp(Decimal::ZERO, Decimal::ONE);
    if close_qty.is_zero() {
        return Ok(None);
    }

    let fill = match side {
        Side::Long => executor.exit_long(symbol, close_qty).await,
        Side::Short => executor.enter_long(symbol, close_qty * position.entry_price).await,
    };

    let fill = match fill {
        Ok(fill) => fill,
        Err(e) => {
            error!(symbol, error = %e, "partial exit order failed; leaving position open");
            return Ok(None);
        }
    };

    info!(symbol, avg_price = %fill.avg_price, qty = %fill.executed_quantity, reason, "partial exit fill recorded");
    let today = chrono::Utc::now().date_naive();
    let result = account::close_partial(account, symbol, fill.avg_price, ratio, reason, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, now, today);
    Ok(result.ok().map(|(next, _)| next))
}

/// Add a DCA tranche on the exchange, then record it against the local
/// account. Only defined for longs; the executor has no margin-short add
/// primitive.
async fn dca_tranche(
    executor: &LiveExecutor<&BinanceExchangeClient>,
    account: &Account,
    symbol: &str,
    add_usdt: Decimal,
    now: i64,
) -> Result<Option<Account>> {
    if add_usdt <= Decimal::ZERO {
        return Ok(None);
    }
    let fill = match executor.enter_long(symbol, add_usdt).await {
        Ok(fill) => fill,
        Err(e) => {
            error!(symbol, error = %e, "dca tranche order failed");
            return Ok(None);
        }
    };
    info!(symbol, avg_price = %fill.avg_price, qty = %fill.executed_quantity, "dca tranche fill recorded");
    let result = account::dca_add(account, symbol, fill.avg_price, add_usdt, now);
    Ok(result.ok().map(|(next, _)| next))
}

async fn close_position(
    executor: &LiveExecutor<&BinanceExchangeClient>,
    account: &Account,
    symbol: &str,
    price: Decimal,
    now: i64,
) -> Result<Option<Account>> {
    let Some(position) = account.positions.get(symbol) else {
        return Ok(None);
    };
    let side = position.side;
    let quantity = position.quantity;

    let fill = match side {
        Side::Long => executor.exit_long(symbol, quantity).await,
        // Covering a short means buying back the borrowed quantity; the
        // exchange's buy endpoint takes a quote amount, so this approximates
        // the needed spend from the last observed price.
        Side::Short => executor.enter_long(symbol, quantity * price).await,
    };

    let fill = match fill {
        Ok(fill) => fill,
        Err(e) => {
            error!(symbol, error = %e, "exit order failed; leaving position open");
            return Ok(None);
        }
    };

    info!(symbol, avg_price = %fill.avg_price, qty = %fill.executed_quantity, "exit fill recorded");
    let today = chrono::Utc::now().date_naive();
    let result = match side {
        Side::Long => account::close_long(account, symbol, fill.avg_price, "signal", Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, now, today),
        Side::Short => account::close_short(account, symbol, fill.avg_price, "signal", Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, now, today),
    };
    Ok(result.ok().map(|(next, _)| next))
}

#[allow(clippy::too_many_arguments)]
async fn open_position(
    executor: &LiveExecutor<&BinanceExchangeClient>,
    account: &Account,
    symbol: &str,
    signal_type: SignalType,
    cfg: &RuntimeConfig,
    ratio: Decimal,
    equity: Decimal,
    now: i64,
) -> Result<Option<Account>> {
    let opts = open_options(cfg, ratio);
    let quote_amount = (equity * opts.position_ratio).max(opts.min_order_size);

    // Shorting reuses the same quote-denominated buy primitive as a long
    // entry; a true margin short would sell borrowed base quantity, but the
    // exchange contract here only exposes spot-style buy/sell sizing.
    let fill = match signal_type {
        SignalType::Buy | SignalType::Short => executor.enter_long(symbol, quote_amount).await,
        _ => return Ok(None),
    };

    let fill = match fill {
        Ok(fill) => fill,
        Err(e) => {
            error!(symbol, error = %e, "entry order failed");
            return Ok(None);
        }
    };

    info!(symbol, avg_price = %fill.avg_price, qty = %fill.executed_quantity, "entry fill recorded");
    let result = if signal_type == SignalType::Buy {
        account::open_long(account, symbol, fill.avg_price, "signal", &opts, now, equity)
    } else {
        account::open_short(account, symbol, fill.avg_price, "signal", &opts, now, equity)
    };
    Ok(result.ok().map(|(next, _)| next))
}

async fn scan_symbol(
    client: &BinanceExchangeClient,
    executor: &LiveExecutor<&BinanceExchangeClient>,
    mut account: Account,
    symbol: &str,
    series: &mut CandleSeries,
    cfg: &RuntimeConfig,
    strategy: Option<&dyn StrategyHandle>,
) -> Result<(Account, Decimal)> {
    let price = client.get_price(symbol).await.context("failed to fetch price")?;
    let now = chrono::Utc::now().timestamp_millis();

    let _ = series.push(Candle::new(now, now, price, price, price, price, Decimal::ZERO));
    let window = series.as_slice();

    if let Some(position) = account.positions.get_mut(symbol) {
        let triggered = account::update_trailing_stop(
            position,
            price,
            cfg.trailing_stop.activation_percent,
            cfg.trailing_stop.callback_percent,
        );
        if triggered {
            if let Some(next) = close_position(executor, &account, symbol, price, now).await? {
                return Ok((next, price));
            }
        }
    }

    if let Some(position) = account.positions.get(symbol) {
        let stop_hit = match position.side {
            Side::Long => price <= position.stop_loss,
            Side::Short => price >= position.stop_loss,
        };
        let take_profit_hit = match position.side {
            Side::Long => price >= position.take_profit,
            Side::Short => price <= position.take_profit,
        };
        let time_stop_hit = account::time_stop_triggered(position, price, now, cfg.time_stop_hours);
        if stop_hit || take_profit_hit || time_stop_hit {
            if let Some(next) = close_position(executor, &account, symbol, price, now).await? {
                return Ok((next, price));
            }
        }
    }

    if let Some(position) = account.positions.get_mut(symbol) {
        if let Some(stage) = account::check_staged_take_profit(position, price) {
            if let Some(next) = partial_close(executor, &account, symbol, stage.close_ratio, "staged_take_profit", now).await? {
                account = next;
            }
        }
    }

    if let Some(position) = account.positions.get(symbol).cloned() {
        let snapshot = indicator::compute_snapshot(window, &cfg.indicator);
        let adjustment = strategy.and_then(|s| s.adjust_position(&position, &snapshot));
        match adjustment {
            Some(amount) if amount > Decimal::ZERO => {
                if let Some(next) = dca_tranche(executor, &account, symbol, amount, now).await? {
                    account = next;
                }
            }
            Some(amount) if amount < Decimal::ZERO => {
                let notional = position.notional(price);
                if !notional.is_zero() {
                    let ratio = (-amount / notional).min(Decimal::ONE);
                    if let Some(next) = partial_close(executor, &account, symbol, ratio, "strategy_adjust", now).await? {
                        account = next;
                    }
                }
            }
            _ => {
                if let Some(dca_state) = &position.dca_state {
                    if account::paper_dca_should_trigger(dca_state, price, now) {
                        let add_usdt = cfg.dca.as_ref().map(|d| d.tranche_usdt).unwrap_or(Decimal::ZERO);
                        if let Some(next) = dca_tranche(executor, &account, symbol, add_usdt, now).await? {
                            account = next;
                        }
                    }
                }
            }
        }
    }

    let warmup = backtest::warmup_bars(cfg);
    if window.len() < warmup {
        return Ok((account, price));
    }

    let snapshot = indicator::compute_snapshot(window, &cfg.indicator);
    let regime_classification = regime::classify(window, &cfg.regime);
    let position_side = account.positions.get(symbol).map(|p| p.side);
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
    let mut emitted = signal::detect_signal(
        symbol,
        &snapshot,
        Some(price),
        &effective_rules,
        &cfg.rule_thresholds,
        position_side,
        now,
    );
    if let Some(s) = strategy {
        emitted = s.populate_signal(emitted, &snapshot);
    }
    emitted = signal::apply_trend_timeframe_filter(emitted, higher_snapshot.as_ref());

    match emitted.signal_type {
        SignalType::Buy | SignalType::Short => {
            let mut marks = HashMap::new();
            marks.insert(symbol.to_string(), price);
            let equity = account.equity(&marks);
            let today = chrono::Utc::now().date_naive();
            let heat = risk::portfolio_heat(&account, &marks, equity);
            let kelly_ratio = risk::kelly_effective_ratio(&account.trades, &cfg.risk, cfg.position_sizing.position_ratio);
            let scaled_ratio = risk::heat_scaled_ratio(kelly_ratio, empty_correlations());
            let ctx = RiskContext {
                account: &account,
                equity,
                symbol,
                is_short: emitted.signal_type == SignalType::Short,
                is_futures_or_margin_market: cfg.is_futures_or_margin_market,
                today,
                now,
                protections: &cfg.protections,
                sentiment: None,
                correlations: empty_correlations(),
                current_portfolio_heat: heat,
                candidate_notional_fraction: scaled_ratio,
            };
            if risk::check_entry(&ctx, &cfg.risk).is_ok() {
                if let Some(next) = open_position(executor, &account, symbol, emitted.signal_type, cfg, scaled_ratio, equity, now).await? {
                    account = next;
                    apply_open_configs(&mut account, symbol, cfg, now);
                }
            }
        }
        SignalType::Sell | SignalType::Cover => {
            if let Some(next) = close_position(executor, &account, symbol, price, now).await? {
                account = next;
            }
        }
        SignalType::None => {}
    }

    Ok((account, price))
}

async fn run(args: Args) -> Result<()> {
    let cfg = RuntimeConfig::load(&args.config, args.profile.as_deref(), args.scenario_config.as_deref())
        .context("failed to load configuration")?;

    let api_key = env_or_exit("BINANCE_API_KEY")?;
    let api_secret = env_or_exit("BINANCE_API_SECRET")?;
    let base_url = std::env::var("BINANCE_BASE_URL").unwrap_or_else(|_| "https://api.binance.com".to_string());

    let client = BinanceExchangeClient::new(api_key, api_secret, base_url);
    let mut executor = LiveExecutor::new(&client);

    let balance = executor
        .startup_check()
        .await
        .context("startup check failed: exchange unreachable or credentials rejected")?;
    info!(scenario = %cfg.scenario, balance = %balance, "startup check passed");

    let mut account = account_file::load(&args.logs_dir, &cfg.scenario, cfg.initial_cash, chrono::Utc::now().timestamp_millis())
        .await
        .context("failed to load account file")?;

    let mut series_by_symbol: HashMap<String, CandleSeries> =
        cfg.symbols.iter().map(|s| (s.clone(), CandleSeries::new())).collect();
    let mut last_marks: HashMap<String, Decimal> = HashMap::new();

    loop {
        let exchange_positions = client.get_open_positions().await.unwrap_or_default();
        let report = cryptara::executor::reconcile(&account, &exchange_positions);
        match report.severity {
            ReconcileSeverity::Critical => {
                error!(?report, "critical reconciliation drift, pausing scenario");
                account.paused = true;
                account_file::save(&args.logs_dir, &cfg.scenario, &account).await?;
                return Err(anyhow::anyhow!("reconciliation critical, scenario paused"));
            }
            ReconcileSeverity::Warning => warn!(?report, "reconciliation drift within warning threshold"),
            ReconcileSeverity::Ok => {}
        }

        if !account.paused {
            for symbol in cfg.symbols.clone() {
                let series = series_by_symbol.entry(symbol.clone()).or_default();
                match scan_symbol(&client, &executor, account.clone(), &symbol, series, &cfg, None).await {
                    Ok((next, price)) => {
                        account = next;
                        last_marks.insert(symbol.clone(), price);
                    }
                    Err(e) => error!(symbol = %symbol, error = %e, "scan cycle failed for symbol"),
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }

        account_file::save(&args.logs_dir, &cfg.scenario, &account).await?;
        let marks = last_marks.clone();
        let _ = equity_history::append_if_due(
            &args.logs_dir,
            &cfg.scenario,
            EquitySample {
                timestamp: chrono::Utc::now().timestamp_millis(),
                equity: account.equity(&marks),
                positions: account.positions.len(),
            },
        )
        .await;

        if args.once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(args.poll_interval_secs)).await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
    dotenvy::dotenv().ok();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
