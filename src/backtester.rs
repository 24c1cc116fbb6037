use std::collections::HashMap;

use log::debug;

use crate::config::{BacktestConfig, SameBarTieBreak};
use crate::errors::EngineError;
use crate::models::{BacktestStats, BandState, Bar, ExitReason, Position, Side, Signal};
use crate::performance::compute_stats;

/// Exit decided by a single bar against an open position's thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    pub price: f64,
}

/// Checks one bar's high/low against the position's take-profit and
/// stop-loss thresholds. Exits happen at the threshold price. When the bar
/// touches both, `config.tie_break` decides; stop-loss-first is the
/// conservative default. Shared by the backtester and the live runner so
/// both apply identical rules.
pub fn check_tp_sl(position: &Position, bar: &Bar, config: &BacktestConfig) -> Option<ExitTrigger> {
    let entry = position.entry_price;
    let (tp_price, sl_price, tp_hit, sl_hit) = match position.side {
        Side::Long => {
            let tp = entry * (1.0 + config.take_profit_percent / 100.0);
            let sl = entry * (1.0 - config.stop_loss_percent / 100.0);
            (tp, sl, bar.high >= tp, bar.low <= sl)
        }
        Side::Short => {
            let tp = entry * (1.0 - config.take_profit_percent / 100.0);
            let sl = entry * (1.0 + config.stop_loss_percent / 100.0);
            (tp, sl, bar.low <= tp, bar.high >= sl)
        }
    };

    match (tp_hit, sl_hit) {
        (true, true) => Some(match config.tie_break {
            SameBarTieBreak::StopLossFirst => ExitTrigger {
                reason: ExitReason::StopLoss,
                price: sl_price,
            },
            SameBarTieBreak::TakeProfitFirst => ExitTrigger {
                reason: ExitReason::TakeProfit,
                price: tp_price,
            },
        }),
        (true, false) => Some(ExitTrigger {
            reason: ExitReason::TakeProfit,
            price: tp_price,
        }),
        (false, true) => Some(ExitTrigger {
            reason: ExitReason::StopLoss,
            price: sl_price,
        }),
        (false, false) => None,
    }
}

/// Replays a bar series against its reversal signals, producing the
/// position ledger and aggregate stats.
///
/// One position at a time. A signal whose side passes the direction filter
/// opens at that bar's close; exits are evaluated on every later bar in the
/// order take-profit / stop-loss / opposing reversal; a bar that exits never
/// re-enters; data exhaustion force-closes at the last close with reason
/// `end_of_data`.
pub fn run_backtest(
    bars: &[Bar],
    band_states: &[BandState],
    signals: &[Signal],
    config: &BacktestConfig,
) -> Result<(Vec<Position>, BacktestStats), EngineError> {
    config.validate()?;
    debug_assert_eq!(bars.len(), band_states.len());

    let signal_at: HashMap<usize, &Signal> = signals.iter().map(|s| (s.index, s)).collect();
    let mut positions: Vec<Position> = Vec::new();
    let mut current: Option<Position> = None;

    for (index, bar) in bars.iter().enumerate() {
        let mut exited = false;

        if let Some(position) = current.as_mut() {
            if index > position.entry_index {
                position.track_excursion(bar);
                if let Some(trigger) = check_tp_sl(position, bar, config) {
                    position.close(index, trigger.price, bar.time, trigger.reason);
                    debug!(
                        "closed {} position at {}: {} @ {:.4}",
                        position.side.as_str(),
                        index,
                        trigger.reason.as_str(),
                        trigger.price
                    );
                    positions.push(current.take().expect("position checked above"));
                    exited = true;
                }
            }
        }

        let Some(signal) = signal_at.get(&index) else {
            continue;
        };

        if let Some(position) = current.as_mut() {
            if position.side != signal.side() {
                position.close(index, signal.price, bar.time, ExitReason::Reversal);
                debug!(
                    "closed {} position at {} on reversal @ {:.4}",
                    position.side.as_str(),
                    index,
                    signal.price
                );
                positions.push(current.take().expect("position checked above"));
                exited = true;
            }
        }

        // A bar that exited does not re-enter; the next opportunity is the
        // next signal.
        if current.is_none() && !exited && config.trade_direction.allows(signal.side()) {
            current = Some(Position::open(
                signal.side(),
                index,
                signal.price,
                bar.time,
                config.position_size,
            ));
            debug!(
                "opened {} position at {} @ {:.4}",
                signal.side().as_str(),
                index,
                signal.price
            );
        }
    }

    if let (Some(mut position), Some(last)) = (current.take(), bars.last()) {
        position.close(bars.len() - 1, last.close, last.time, ExitReason::EndOfData);
        positions.push(position);
    }

    let stats = compute_stats(&positions);
    Ok((positions, stats))
}
