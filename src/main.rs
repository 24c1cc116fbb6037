use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use maxtrend::candle_utils::{is_strictly_ascending, random_walk_series};
use maxtrend::config::{
    BacktestConfig, LiveParams, StrategyParams, TradeDirection, DEFAULT_FACTOR,
    DEFAULT_STOP_LOSS_PERCENT, DEFAULT_TAKE_PROFIT_PERCENT,
};
use maxtrend::engine::LiveEngine;
use maxtrend::models::Bar;
use maxtrend::strategy::apply_strategy;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "maxtrend")]
#[command(about = "Streaming trend-channel indicator, backtester and live strategy runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest the trend strategy over a bar series
    Backtest {
        /// JSON file holding an array of bars (time/open/high/low/close)
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Synthetic random-walk length used when no data file is given
        #[arg(long, default_value_t = 600)]
        synthetic_bars: usize,
        /// Seed for the synthetic series
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Band distance multiplier
        #[arg(long, default_value_t = DEFAULT_FACTOR)]
        factor: f64,
        #[arg(long = "take-profit", default_value_t = DEFAULT_TAKE_PROFIT_PERCENT)]
        take_profit_percent: f64,
        #[arg(long = "stop-loss", default_value_t = DEFAULT_STOP_LOSS_PERCENT)]
        stop_loss_percent: f64,
        /// Trade direction filter: both, long or short
        #[arg(long, default_value = "both")]
        direction: TradeDirection,
        /// Also print the full position ledger
        #[arg(long)]
        ledger: bool,
    },
    /// Feed a synthetic bar stream through a live strategy instance
    SimulateLive {
        #[arg(long, default_value_t = 600)]
        bars: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long, default_value_t = DEFAULT_FACTOR)]
        factor: f64,
        /// Force-close any open position before stopping
        #[arg(long)]
        close_at_end: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Backtest {
            data_file,
            synthetic_bars,
            seed,
            factor,
            take_profit_percent,
            stop_loss_percent,
            direction,
            ledger,
        } => {
            let bars = load_bars(data_file, synthetic_bars, seed)?;
            let params = StrategyParams {
                factor,
                backtest: BacktestConfig {
                    take_profit_percent,
                    stop_loss_percent,
                    trade_direction: direction,
                    ..BacktestConfig::default()
                },
            };
            info!(
                "backtesting {} bars (factor {}, tp {}%, sl {}%, direction {})",
                bars.len(),
                factor,
                take_profit_percent,
                stop_loss_percent,
                direction.as_str()
            );

            let output = apply_strategy(&bars, &params)?;
            info!(
                "{} signals, {} positions",
                output.signals.len(),
                output.positions.len()
            );
            println!("{}", serde_json::to_string_pretty(&output.stats)?);
            if ledger {
                println!("{}", serde_json::to_string_pretty(&output.positions)?);
            }
        }
        Commands::SimulateLive {
            bars,
            seed,
            factor,
            close_at_end,
        } => {
            let series = random_walk_series(bars, 250.0, 0.02, seed);
            let engine = LiveEngine::new();
            let mut params = LiveParams::default();
            params.strategy.factor = factor;
            engine.start("demo", "SYNTH", "1h", params)?;

            for bar in &series {
                engine.on_bar("demo", *bar).await?;
            }
            if close_at_end {
                match engine.close_position("demo").await {
                    Ok(position) => info!("closed final position with pnl {:.4}", position.pnl),
                    Err(err) => info!("no position to close: {}", err),
                }
            }
            engine.stop("demo").await?;
            engine.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&engine.list())?);
        }
    }

    Ok(())
}

fn load_bars(data_file: Option<PathBuf>, synthetic_bars: usize, seed: u64) -> Result<Vec<Bar>> {
    match data_file {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let bars: Vec<Bar> = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse bars from {}", path.display()))?;
            anyhow::ensure!(
                is_strictly_ascending(&bars),
                "bars in {} must have strictly increasing timestamps",
                path.display()
            );
            Ok(bars)
        }
        None => {
            info!("no data file given; generating {} synthetic bars", synthetic_bars);
            Ok(random_walk_series(synthetic_bars, 250.0, 0.02, seed))
        }
    }
}
