use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLC sample for a fixed interval. Timestamps are expected to be
/// strictly increasing; the engine does not reorder or deduplicate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn hl2(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Which side of the envelope is currently active as the trend line.
/// `Up` rides the lower band (bullish), `Down` rides the upper band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_int(self) -> i32 {
        match self {
            Direction::Up => -1,
            Direction::Down => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// The position side implied by a trend in this direction.
    pub fn side(self) -> Side {
        match self {
            Direction::Up => Side::Long,
            Direction::Down => Side::Short,
        }
    }
}

/// Per-bar band values. During indicator warm-up every float is NaN and
/// `direction` is `None`. Once defined, `trend_line` always equals exactly
/// one of `upper_band`/`lower_band`, selected by `direction`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandState {
    pub upper_band: f64,
    pub lower_band: f64,
    pub trend_line: f64,
    pub direction: Option<Direction>,
}

impl BandState {
    pub fn undefined() -> Self {
        Self {
            upper_band: f64::NAN,
            lower_band: f64::NAN,
            trend_line: f64::NAN,
            direction: None,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.direction.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Reversal,
}

/// A discrete trend-reversal event. `direction` is the new direction after
/// the flip; `price` is the close of the bar that flipped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub index: usize,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub kind: SignalKind,
    pub direction: Direction,
}

impl Signal {
    pub fn side(&self) -> Side {
        self.direction.side()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// PnL sign multiplier: price appreciation is profit for longs,
    /// loss for shorts.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Reversal,
    EndOfData,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Reversal => "reversal",
            ExitReason::EndOfData => "end_of_data",
            ExitReason::Manual => "manual",
        }
    }
}

/// A simulated or live trade. Exit fields stay `None` while the position is
/// open; `max_profit`/`max_drawdown` track the best and worst unrealized PnL
/// observed from the high/low excursion of bars after entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub side: Side,
    pub entry_index: usize,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_index: Option<usize>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub size: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub is_open: bool,
    pub exit_reason: Option<ExitReason>,
    pub max_drawdown: f64,
    pub max_profit: f64,
}

impl Position {
    pub fn open(
        side: Side,
        entry_index: usize,
        entry_price: f64,
        entry_time: DateTime<Utc>,
        size: f64,
    ) -> Self {
        Self {
            side,
            entry_index,
            entry_price,
            entry_time,
            exit_index: None,
            exit_price: None,
            exit_time: None,
            size,
            pnl: 0.0,
            pnl_percent: 0.0,
            is_open: true,
            exit_reason: None,
            max_drawdown: 0.0,
            max_profit: 0.0,
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    pub fn close(
        &mut self,
        exit_index: usize,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) {
        self.exit_index = Some(exit_index);
        self.exit_price = Some(exit_price);
        self.exit_time = Some(exit_time);
        self.exit_reason = Some(reason);
        self.is_open = false;
        self.pnl = self.unrealized_pnl(exit_price);
        if self.entry_price != 0.0 {
            self.pnl_percent =
                (exit_price - self.entry_price) / self.entry_price * 100.0 * self.side.sign();
        }
    }

    /// Updates the intra-trade excursion extremes from a bar's high/low.
    pub fn track_excursion(&mut self, bar: &Bar) {
        let (favorable, adverse) = match self.side {
            Side::Long => (bar.high, bar.low),
            Side::Short => (bar.low, bar.high),
        };
        let best = self.unrealized_pnl(favorable);
        let worst = self.unrealized_pnl(adverse);
        if best > self.max_profit {
            self.max_profit = best;
        }
        if worst < self.max_drawdown {
            self.max_drawdown = worst;
        }
    }
}

/// An extreme-to-extreme swing between two reversals, used for chart labels.
/// The segment starts at the flip bar's close and extends to the most
/// favorable extreme reached while the direction held.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSegment {
    pub start_index: usize,
    pub start_price: f64,
    pub end_index: usize,
    pub end_price: f64,
    pub direction: Direction,
    pub swing_percent: f64,
}

/// Aggregate metrics over the closed portion of a position ledger.
///
/// Profit-factor convention: `f64::INFINITY` when there is at least one
/// winning trade and no losers, `0.0` when there are no closed trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestStats {
    pub total_pnl: f64,
    pub total_pnl_percent: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub risk_adjusted_return: f64,
    pub longest_win_streak: usize,
    pub longest_loss_streak: usize,
    pub average_hold_seconds: f64,
}

/// Full result of applying the strategy to a bar history. The per-bar
/// vectors are index-aligned with the input bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutput {
    pub trend_lines: Vec<f64>,
    pub directions: Vec<Option<Direction>>,
    pub signals: Vec<Signal>,
    pub positions: Vec<Position>,
    pub segments: Vec<TrendSegment>,
    pub stats: BacktestStats,
}

/// Half-open `[start, end)` view into a retained full history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportWindow {
    pub start: usize,
    pub end: usize,
    pub total_available: usize,
}

/// Consistent read-only view of a live strategy instance. `position` holds
/// the current open position, or the most recently closed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSnapshot {
    pub id: String,
    pub symbol: String,
    pub interval: String,
    pub running: bool,
    pub position: Option<Position>,
    pub last_bar_time: Option<DateTime<Utc>>,
    pub last_price: Option<f64>,
    pub bars_seen: u64,
    pub bars_rejected: u64,
}
