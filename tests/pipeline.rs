use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::Duration;
use maxtrend::candle_utils::{base_time, random_walk_series, trending_series};
use maxtrend::config::{BacktestConfig, StrategyParams};
use maxtrend::engine::LiveEngine;
use maxtrend::errors::EngineError;
use maxtrend::indicators::{compute_bands, TREND_PERIOD};
use maxtrend::models::{Bar, Direction, ExitReason, Side};
use maxtrend::signals::detect_signals;
use maxtrend::strategy::{apply_strategy, StrategyKey, StrategyService};
use maxtrend::viewport::{ExtendDirection, SessionKey, ViewportManager};
use tokio::time::{sleep, Duration as TokioDuration};

const FACTOR: f64 = 2.5;

/// Flat closes at 100 with a constant high-low range of 2, long enough to
/// complete warm-up, then a sharp drop through the lower band and a sharp
/// recovery back through the upper band. With a constant range the smoothed
/// band distance equals the range at every defined index, which makes the
/// band algebra exact: the envelope sits at 100 +/- 5.
fn v_shape_series() -> Vec<Bar> {
    let mut bars = Vec::new();
    for i in 0..(TREND_PERIOD + 10) {
        bars.push(flat_bar(i, 100.0));
    }
    for close in [94.0, 98.0, 101.0, 102.0, 103.0] {
        bars.push(flat_bar(bars.len(), close));
    }
    bars
}

fn flat_bar(index: usize, close: f64) -> Bar {
    Bar {
        time: base_time() + Duration::hours(index as i64),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
    }
}

/// Element-wise comparison that treats NaN warm-up values as equal.
fn assert_f64_series_match(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        if e.is_nan() {
            assert!(a.is_nan(), "expected NaN at {}, got {}", i, a);
        } else {
            assert_eq!(a, e, "values diverged at {}", i);
        }
    }
}

#[test]
fn monotonic_rise_never_reverses() {
    let bars = trending_series(260, 100.0, 0.5, 2.0);
    let states = compute_bands(&bars, FACTOR).unwrap();

    let first_defined = states
        .iter()
        .position(|s| s.is_defined())
        .expect("bands should become defined");
    assert_eq!(first_defined, TREND_PERIOD - 1);

    for state in &states[first_defined..] {
        assert_eq!(state.direction, Some(Direction::Up));
        assert_eq!(state.trend_line, state.lower_band);
    }
    assert!(detect_signals(&bars, &states).is_empty());

    // The ratcheted lower band never regresses in a monotonic rise.
    let lows: Vec<f64> = states[first_defined..]
        .iter()
        .map(|s| s.lower_band)
        .collect();
    assert!(lows.windows(2).all(|pair| pair[1] >= pair[0]));
}

#[test]
fn v_shape_opens_short_then_recovers_long() {
    let bars = v_shape_series();
    let drop_index = TREND_PERIOD + 10;
    let params = StrategyParams {
        factor: FACTOR,
        backtest: BacktestConfig {
            take_profit_percent: 2.0,
            stop_loss_percent: 2.0,
            ..BacktestConfig::default()
        },
    };
    let output = apply_strategy(&bars, &params).unwrap();

    // One reversal on the way down, one on the recovery.
    assert_eq!(output.signals.len(), 2);
    let down = &output.signals[0];
    assert_eq!(down.index, drop_index);
    assert_eq!(down.direction, Direction::Down);
    assert_relative_eq!(down.price, 94.0);
    let up = &output.signals[1];
    assert_eq!(up.index, drop_index + 2);
    assert_eq!(up.direction, Direction::Up);
    assert_relative_eq!(up.price, 101.0);

    assert_eq!(output.positions.len(), 2);

    // The short from the first signal is stopped out on the recovery bar:
    // its high (99) clears the 2% stop at 94 * 1.02 before any reversal.
    let short = &output.positions[0];
    assert_eq!(short.side, Side::Short);
    assert_eq!(short.entry_index, drop_index);
    assert_relative_eq!(short.entry_price, 94.0);
    assert_eq!(short.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(short.exit_index, Some(drop_index + 1));
    assert_relative_eq!(short.exit_price.unwrap(), 94.0 * 1.02);
    assert_relative_eq!(short.pnl, (94.0 - 94.0 * 1.02) * 1.0);

    // The long from the second signal rides to its take-profit.
    let long = &output.positions[1];
    assert_eq!(long.side, Side::Long);
    assert_eq!(long.entry_index, drop_index + 2);
    assert_relative_eq!(long.entry_price, 101.0);
    assert_eq!(long.exit_reason, Some(ExitReason::TakeProfit));
    assert_relative_eq!(long.exit_price.unwrap(), 101.0 * 1.02);

    assert_eq!(output.stats.total_trades, 2);
    assert_eq!(output.stats.winning_trades, 1);
    assert_eq!(output.stats.losing_trades, 1);
}

#[test]
fn closed_positions_have_exactly_one_exit_reason() {
    let bars = random_walk_series(500, 140.0, 0.025, 17);
    let output = apply_strategy(&bars, &StrategyParams::default()).unwrap();
    for position in &output.positions {
        assert!(!position.is_open);
        assert!(position.exit_reason.is_some());
    }
    assert_eq!(
        output.stats.total_trades,
        output.positions.iter().filter(|p| !p.is_open).count()
    );
    assert_eq!(
        output.stats.winning_trades + output.stats.losing_trades,
        output.stats.total_trades
    );
}

#[test]
fn windowing_slices_full_history_not_local_recomputation() {
    let bars = random_walk_series(420, 160.0, 0.02, 23);
    let full = compute_bands(&bars, FACTOR).unwrap();

    // Causality: computing over a prefix and slicing equals slicing the
    // full-history computation.
    let prefix_end = 380;
    let prefix = compute_bands(&bars[..prefix_end], FACTOR).unwrap();
    for i in 0..prefix_end {
        match (full[i].is_defined(), prefix[i].is_defined()) {
            (true, true) => {
                assert_relative_eq!(full[i].trend_line, prefix[i].trend_line);
                assert_eq!(full[i].direction, prefix[i].direction);
            }
            (false, false) => {}
            _ => panic!("definedness diverged at {}", i),
        }
    }

    // Recomputing over the truncated window alone diverges: the slice-local
    // run loses its preceding context and restarts warm-up.
    let window_start = 100;
    let local = compute_bands(&bars[window_start..prefix_end], FACTOR).unwrap();
    let divergent = (0..(prefix_end - window_start)).any(|i| {
        let global = &full[window_start + i];
        let localized = &local[i];
        global.is_defined() != localized.is_defined()
            || (global.is_defined()
                && (global.trend_line - localized.trend_line).abs() > 1e-9)
    });
    assert!(divergent, "slice-local recomputation unexpectedly matched");

    // The viewport manager serves the full-history values.
    let manager = ViewportManager::new();
    let key = SessionKey::new("ETH", "1h");
    let slice = manager
        .load_window(key.clone(), bars.clone(), &StrategyParams::default(), 60)
        .unwrap();
    assert_eq!(slice.window.start, 360);
    let expected = apply_strategy(&bars, &StrategyParams::default()).unwrap();
    assert_f64_series_match(&slice.trend_lines, &expected.trend_lines[360..420]);

    let extended = manager
        .extend_window(&key, ExtendDirection::Back, 200)
        .unwrap();
    assert_eq!(extended.slice.window.start, 160);
    assert_eq!(extended.new_bars.len(), 200);
    assert_f64_series_match(&extended.slice.trend_lines, &expected.trend_lines[160..420]);
}

#[test]
fn apply_strategy_is_deterministic_end_to_end() {
    let bars = random_walk_series(450, 95.0, 0.02, 31);
    let params = StrategyParams::default();
    let first = apply_strategy(&bars, &params).unwrap();
    let second = apply_strategy(&bars, &params).unwrap();
    assert_f64_series_match(&first.trend_lines, &second.trend_lines);
    assert_eq!(first.directions, second.directions);
    assert_eq!(first.signals, second.signals);
    assert_eq!(first.positions, second.positions);
    assert_eq!(first.segments, second.segments);
    assert_eq!(first.stats, second.stats);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_instance_mirrors_backtest_entries() {
    let bars = v_shape_series();
    let params = StrategyParams {
        factor: FACTOR,
        backtest: BacktestConfig {
            take_profit_percent: 2.0,
            stop_loss_percent: 2.0,
            ..BacktestConfig::default()
        },
    };
    let backtest = apply_strategy(&bars, &params).unwrap();

    let engine = LiveEngine::new();
    let mut live_params = maxtrend::config::LiveParams::default();
    live_params.strategy = params;
    engine.start("mirror", "ETH", "1h", live_params).unwrap();
    for bar in &bars {
        engine.on_bar("mirror", *bar).await.unwrap();
    }
    for _ in 0..400 {
        if engine.query("mirror").unwrap().bars_seen as usize == bars.len() {
            break;
        }
        sleep(TokioDuration::from_millis(5)).await;
    }

    // The live instance applied the same rules bar by bar, so its final
    // position matches the backtest ledger's last entry.
    let snapshot = engine.query("mirror").unwrap();
    let live_position = snapshot.position.expect("live position expected");
    let last = backtest.positions.last().unwrap();
    assert_eq!(live_position.side, last.side);
    assert_eq!(live_position.entry_index, last.entry_index);
    assert_relative_eq!(live_position.entry_price, last.entry_price);
    assert_eq!(live_position.exit_reason, last.exit_reason);

    engine.stop("mirror").await.unwrap();
    for _ in 0..400 {
        if !engine.query("mirror").unwrap().running {
            break;
        }
        sleep(TokioDuration::from_millis(5)).await;
    }
    let listed = engine.list();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].running);
    // Stop does not touch the position by itself.
    assert_eq!(listed[0].position, Some(live_position));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newer_apply_supersedes_in_flight_request() {
    let service = Arc::new(StrategyService::new());
    let key = StrategyKey::new("ETH", "1h", "max-trend");

    let slow_bars = random_walk_series(300_000, 220.0, 0.015, 2);
    let fast_bars = random_walk_series(400, 220.0, 0.015, 2);

    let slow_service = Arc::clone(&service);
    let slow_key = key.clone();
    let slow = tokio::spawn(async move {
        slow_service
            .apply(slow_key, slow_bars, StrategyParams::default())
            .await
    });

    sleep(TokioDuration::from_millis(25)).await;
    let fast = service.apply(key, fast_bars, StrategyParams::default()).await;
    assert!(fast.is_ok(), "newest request must produce a full result");

    let slow = slow.await.unwrap();
    assert!(
        matches!(slow, Err(EngineError::Superseded)),
        "stale request should resolve to a cancellation signal"
    );
}
