use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::task;

use crate::backtester::run_backtest;
use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::indicators::BandTracker;
use crate::models::{BandState, Bar, Direction, StrategyOutput, TrendSegment};
use crate::signals::detect_signals;

/// How many bars are processed between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Cooperative cancellation flag for long apply runs. Cancellation yields
/// no output at all, never a truncated one.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// Runs the full pipeline over a bar history: bands, reversal signals,
/// backtest, swing segments. Pure and deterministic; identical bars and
/// params always yield identical output.
pub fn apply_strategy(bars: &[Bar], params: &StrategyParams) -> Result<StrategyOutput, EngineError> {
    apply_strategy_cancellable(bars, params, &CancelToken::new())
}

pub fn apply_strategy_cancellable(
    bars: &[Bar],
    params: &StrategyParams,
    cancel: &CancelToken,
) -> Result<StrategyOutput, EngineError> {
    params.validate()?;

    let mut tracker = BandTracker::new(params.factor);
    let mut band_states = Vec::with_capacity(bars.len());
    for (index, bar) in bars.iter().enumerate() {
        if index % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        band_states.push(tracker.update(bar));
    }

    let signals = detect_signals(bars, &band_states);
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    let (positions, stats) = run_backtest(bars, &band_states, &signals, &params.backtest)?;
    let segments = trend_segments(bars, &band_states);
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    Ok(StrategyOutput {
        trend_lines: band_states.iter().map(|s| s.trend_line).collect(),
        directions: band_states.iter().map(|s| s.direction).collect(),
        signals,
        positions,
        segments,
        stats,
    })
}

/// Builds swing segments for chart labels: each reversal starts a segment at
/// the flip bar's close, extended to the most favorable extreme (highest
/// high while Up, lowest low while Down) reached before the next flip.
fn trend_segments(bars: &[Bar], band_states: &[BandState]) -> Vec<TrendSegment> {
    let mut segments = Vec::new();
    let mut current: Option<TrendSegment> = None;
    let mut last_direction: Option<Direction> = None;

    for (index, state) in band_states.iter().enumerate() {
        let Some(direction) = state.direction else {
            continue;
        };
        match last_direction {
            Some(previous) if previous != direction => {
                if let Some(segment) = current.take() {
                    segments.push(segment);
                }
                let price = bars[index].close;
                current = Some(TrendSegment {
                    start_index: index,
                    start_price: price,
                    end_index: index,
                    end_price: price,
                    direction,
                    swing_percent: 0.0,
                });
            }
            Some(_) => {
                if let Some(segment) = current.as_mut() {
                    let extreme = match segment.direction {
                        Direction::Up => bars[index].high,
                        Direction::Down => bars[index].low,
                    };
                    let improved = match segment.direction {
                        Direction::Up => extreme > segment.end_price,
                        Direction::Down => extreme < segment.end_price,
                    };
                    if improved {
                        segment.end_index = index;
                        segment.end_price = extreme;
                        if segment.start_price != 0.0 {
                            segment.swing_percent = (segment.end_price - segment.start_price)
                                / segment.start_price
                                * 100.0;
                        }
                    }
                }
            }
            None => {}
        }
        last_direction = Some(direction);
    }

    if let Some(segment) = current.take() {
        segments.push(segment);
    }
    segments
}

/// Identifies an apply request stream: newer requests for the same key
/// supersede older in-flight ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrategyKey {
    pub symbol: String,
    pub interval: String,
    pub strategy: String,
}

impl StrategyKey {
    pub fn new(
        symbol: impl Into<String>,
        interval: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            strategy: strategy.into(),
        }
    }
}

/// Last-request-wins apply service. Each key tracks its in-flight token; a
/// new request cancels the previous one, whose caller resolves to
/// `EngineError::Superseded` instead of a stale result.
#[derive(Default)]
pub struct StrategyService {
    in_flight: DashMap<StrategyKey, CancelToken>,
}

impl StrategyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(
        &self,
        key: StrategyKey,
        bars: Vec<Bar>,
        params: StrategyParams,
    ) -> Result<StrategyOutput, EngineError> {
        let token = CancelToken::new();
        if let Some(previous) = self.in_flight.insert(key.clone(), token.clone()) {
            debug!("superseding in-flight apply for {:?}", key);
            previous.cancel();
        }

        let run_token = token.clone();
        let result = task::spawn_blocking(move || {
            apply_strategy_cancellable(&bars, &params, &run_token)
        })
        .await
        .map_err(|err| {
            warn!("apply worker for {:?} failed: {}", key, err);
            EngineError::Cancelled
        })?;

        self.in_flight.remove_if(&key, |_, active| active.same_as(&token));

        match result {
            // A cancelled run means a newer request took over the key.
            Err(EngineError::Cancelled) => Err(EngineError::Superseded),
            Ok(output) if token.is_cancelled() => Err(EngineError::Superseded),
            other => other,
        }
    }
}
