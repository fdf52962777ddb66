use anyhow::{Context, Result};
use clap::Parser;
use cryptara::backtest::run_backtest;
use cryptara::config::RuntimeConfig;
use cryptara::domain::candle::Candle;
use cryptara::optimizer::{
    passes_improvement_gate, train_test_split, Optimizer, OptimizerConfig, ParameterSpace, WalkForwardConfig,
    CONSTRAINT_VIOLATION_SCORE,
};
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

/// Searches short/long MA periods and position sizing for the config that
/// maximizes out-of-sample Sharpe ratio, gated by a walk-forward split.
#[derive(Parser, Debug)]
#[command(name = "optimize")]
struct Args {
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(long)]
    scenario_config: Option<PathBuf>,

    #[arg(long)]
    candles: PathBuf,

    #[arg(long)]
    symbol: String,

    #[arg(long, default_value_t = 60)]
    trials: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn load_candles(path: &std::path::Path) -> Result<Vec<Candle>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read candle file at {}", path.display()))?;
    serde_json::from_str(&contents).context("candle file is not a valid JSON array of candles")
}

fn parameter_space() -> HashMap<String, ParameterSpace> {
    let mut space = HashMap::new();
    space.insert("short_ma_period".to_string(), ParameterSpace::Int { min: 3, max: 20 });
    space.insert("long_ma_period".to_string(), ParameterSpace::Int { min: 15, max: 80 });
    space.insert("stop_loss_percent".to_string(), ParameterSpace::Float { min: 0.01, max: 0.10 });
    space.insert("take_profit_percent".to_string(), ParameterSpace::Float { min: 0.03, max: 0.30 });
    space
}

fn apply_params(base: &RuntimeConfig, params: &HashMap<String, f64>) -> RuntimeConfig {
    let mut cfg = base.clone();
    cfg.indicator.short_ma_period = params["short_ma_period"].round() as usize;
    cfg.indicator.long_ma_period = params["long_ma_period"].round() as usize;
    cfg.position_sizing.stop_loss_percent =
        rust_decimal::Decimal::try_from(params["stop_loss_percent"]).unwrap_or(cfg.position_sizing.stop_loss_percent);
    cfg.position_sizing.take_profit_percent = rust_decimal::Decimal::try_from(params["take_profit_percent"])
        .unwrap_or(cfg.position_sizing.take_profit_percent);
    cfg
}

fn violates_constraints(params: &HashMap<String, f64>) -> bool {
    params["short_ma_period"] >= params["long_ma_period"]
}

fn score(base: &RuntimeConfig, candles: &[Candle], symbol: &str, params: &HashMap<String, f64>) -> f64 {
    if violates_constraints(params) {
        return CONSTRAINT_VIOLATION_SCORE;
    }
    let cfg = apply_params(base, params);
    let result = run_backtest(symbol, candles, &cfg);
    result.metrics.sharpe_ratio.to_f64().unwrap_or(CONSTRAINT_VIOLATION_SCORE)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let base_cfg = RuntimeConfig::load(&args.config, args.profile.as_deref(), args.scenario_config.as_deref())
        .context("failed to load configuration")?;
    let candles = load_candles(&args.candles)?;

    let walk_forward = WalkForwardConfig::default();
    let (train_candles, test_candles) = train_test_split(&candles, &walk_forward);

    let mut optimizer = Optimizer::new(parameter_space(), OptimizerConfig::default(), args.seed);

    for trial in 0..args.trials {
        let params = optimizer.suggest();
        let trial_score = score(&base_cfg, &train_candles, &args.symbol, &params);
        optimizer.observe(params, trial_score);
        if trial % 10 == 0 {
            info!(trial, score = trial_score, "optimizer trial");
        }
    }

    let current_test_score = score(&base_cfg, &test_candles, &args.symbol, &default_params(&base_cfg));

    let Some(best_trial) = optimizer.best() else {
        anyhow::bail!("optimizer produced no trials");
    };
    let new_test_score = score(&base_cfg, &test_candles, &args.symbol, &best_trial.params);

    let accept = passes_improvement_gate(current_test_score, new_test_score, &walk_forward);

    info!(
        current_test_score,
        new_test_score,
        accept,
        "walk-forward evaluation complete"
    );

    println!(
        "{}",
        serde_json::json!({
            "best_train_params": best_trial.params,
            "best_train_score": best_trial.score,
            "current_test_score": current_test_score,
            "new_test_score": new_test_score,
            "accepted": accept,
        })
    );

    Ok(())
}

fn default_params(cfg: &RuntimeConfig) -> HashMap<String, f64> {
    let mut params = HashMap::new();
    params.insert("short_ma_period".to_string(), cfg.indicator.short_ma_period as f64);
    params.insert("long_ma_period".to_string(), cfg.indicator.long_ma_period as f64);
    params.insert(
        "stop_loss_percent".to_string(),
        cfg.position_sizing.stop_loss_percent.to_f64().unwrap_or(0.05),
    );
    params.insert(
        "take_profit_percent".to_string(),
        cfg.position_sizing.take_profit_percent.to_f64().unwrap_or(0.15),
    );
    params
}
