use anyhow::{Context, Result};
use clap::Parser;
use cryptara::backtest::run_backtest;
use cryptara::config::RuntimeConfig;
use cryptara::domain::candle::Candle;
use std::path::PathBuf;
use tracing::info;

/// Replays a candle series through the trading engine and reports metrics.
#[derive(Parser, Debug)]
#[command(name = "backtest")]
struct Args {
    /// Base strategy config YAML.
    #[arg(long)]
    config: PathBuf,

    /// Named strategy profile layer, merged on top of the base.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Per-scenario override layer, merged on top of profile (or base).
    #[arg(long)]
    scenario_config: Option<PathBuf>,

    /// JSON file containing an array of candles for `symbol`.
    #[arg(long)]
    candles: PathBuf,

    /// Symbol the candle file corresponds to.
    #[arg(long)]
    symbol: String,
}

fn load_candles(path: &std::path::Path) -> Result<Vec<Candle>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read candle file at {}", path.display()))?;
    serde_json::from_str(&contents).context("candle file is not a valid JSON array of candles")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();

    let cfg = RuntimeConfig::load(&args.config, args.profile.as_deref(), args.scenario_config.as_deref())
        .context("failed to load configuration")?;
    let candles = load_candles(&args.candles)?;

    info!(symbol = %args.symbol, bars = candles.len(), "starting backtest");

    let result = run_backtest(&args.symbol, &candles, &cfg);

    println!("{}", serde_json::to_string_pretty(&result.metrics)?);
    info!(
        total_return_pct = %result.metrics.total_return_pct,
        max_drawdown_pct = %result.metrics.max_drawdown_pct,
        trades = result.metrics.total_trades,
        "backtest complete"
    );

    Ok(())
}
