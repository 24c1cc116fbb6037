use statrs::statistics::Statistics;

use crate::models::{BacktestStats, Position};

/// Aggregates the closed portion of a position ledger. Open positions are
/// skipped; the ledger is expected in close order (which is how the
/// backtester emits it), since streaks and the drawdown curve follow that
/// order.
pub fn compute_stats(positions: &[Position]) -> BacktestStats {
    let closed: Vec<&Position> = positions.iter().filter(|p| !p.is_open).collect();
    if closed.is_empty() {
        return BacktestStats::default();
    }

    let mut stats = BacktestStats {
        total_trades: closed.len(),
        ..BacktestStats::default()
    };

    let mut total_win = 0.0;
    let mut total_loss = 0.0;
    let mut current_win_streak = 0usize;
    let mut current_loss_streak = 0usize;
    let mut total_hold_seconds = 0.0;
    let mut total_capital = 0.0;
    let mut pnl_percents = Vec::with_capacity(closed.len());

    for position in &closed {
        stats.total_pnl += position.pnl;
        total_capital += position.size * position.entry_price;
        pnl_percents.push(position.pnl_percent);

        if position.pnl > 0.0 {
            stats.winning_trades += 1;
            total_win += position.pnl;
            current_win_streak += 1;
            current_loss_streak = 0;
            if current_win_streak > stats.longest_win_streak {
                stats.longest_win_streak = current_win_streak;
            }
        } else {
            stats.losing_trades += 1;
            total_loss += -position.pnl;
            current_loss_streak += 1;
            current_win_streak = 0;
            if current_loss_streak > stats.longest_loss_streak {
                stats.longest_loss_streak = current_loss_streak;
            }
        }

        if let Some(exit_time) = position.exit_time {
            total_hold_seconds +=
                (exit_time - position.entry_time).num_milliseconds() as f64 / 1000.0;
        }
    }

    stats.win_rate = stats.winning_trades as f64 / stats.total_trades as f64;
    stats.average_hold_seconds = total_hold_seconds / stats.total_trades as f64;

    let average_capital = total_capital / stats.total_trades as f64;
    if average_capital > 0.0 {
        stats.total_pnl_percent = stats.total_pnl / average_capital * 100.0;
    }
    if stats.winning_trades > 0 {
        stats.average_win = total_win / stats.winning_trades as f64;
    }
    if stats.losing_trades > 0 {
        stats.average_loss = total_loss / stats.losing_trades as f64;
    }
    stats.profit_factor = if total_loss > 0.0 {
        total_win / total_loss
    } else if stats.winning_trades > 0 {
        f64::INFINITY
    } else {
        0.0
    };

    let (max_drawdown, max_drawdown_percent) = realized_drawdown(&closed);
    stats.max_drawdown = max_drawdown;
    stats.max_drawdown_percent = max_drawdown_percent;
    stats.risk_adjusted_return = risk_adjusted_return(&pnl_percents);

    stats
}

/// Largest peak-to-trough decline of the cumulative realized PnL curve, in
/// close order. Percent is relative to the peak when the peak is positive.
fn realized_drawdown(closed: &[&Position]) -> (f64, f64) {
    let mut cumulative = 0.0;
    let mut peak = 0.0;
    let mut max_drawdown = 0.0;
    let mut max_drawdown_percent = 0.0;

    for position in closed {
        cumulative += position.pnl;
        if cumulative > peak {
            peak = cumulative;
        } else {
            let drawdown = peak - cumulative;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
            if peak > 0.0 {
                let percent = drawdown / peak * 100.0;
                if percent > max_drawdown_percent {
                    max_drawdown_percent = percent;
                }
            }
        }
    }

    (max_drawdown, max_drawdown_percent)
}

/// Simplified risk-adjusted return: mean per-trade PnL% over its standard
/// deviation. Zero when there are fewer than two trades or no dispersion.
fn risk_adjusted_return(pnl_percents: &[f64]) -> f64 {
    if pnl_percents.len() < 2 {
        return 0.0;
    }
    let values = pnl_percents.to_vec();
    let mean = values.clone().mean();
    let std_dev = values.std_dev();
    if std_dev == 0.0 || !std_dev.is_finite() {
        0.0
    } else {
        mean / std_dev
    }
}
