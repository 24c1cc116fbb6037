use std::collections::VecDeque;

use crate::errors::EngineError;
use crate::models::{BandState, Bar, Direction};

/// Tolerance for deciding which band the previous trend line was riding.
pub const BAND_EPSILON: f64 = 1e-10;

/// Lookback of the band-distance smoother. With the nested half and
/// sqrt passes of the Hull average, the first defined output lands at
/// index `TREND_PERIOD - 1`.
pub const TREND_PERIOD: usize = 200;

/// Windowed weighted moving average with linear weights, heaviest on the
/// newest value (weight `period - offset` at `offset` bars behind the
/// evaluation index). NaN inputs occupy their window slot but contribute
/// to neither the weighted sum nor the weight sum. Output is NaN until
/// `period` input values have been observed.
#[derive(Debug, Clone)]
pub struct RollingWma {
    period: usize,
    window: VecDeque<f64>,
    seen: usize,
}

impl RollingWma {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1)),
            seen: 0,
        }
    }

    pub fn push(&mut self, value: f64) -> f64 {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.seen += 1;
        if self.seen < self.period {
            return f64::NAN;
        }
        weighted_mean(&self.window, self.period)
    }
}

fn weighted_mean(window: &VecDeque<f64>, period: usize) -> f64 {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for (offset, value) in window.iter().rev().enumerate() {
        if value.is_nan() {
            continue;
        }
        let weight = (period - offset) as f64;
        sum += value * weight;
        weight_sum += weight;
    }
    if weight_sum == 0.0 {
        f64::NAN
    } else {
        sum / weight_sum
    }
}

/// Hull moving average, `WMA(2*WMA(x, n/2) - WMA(x, n), round(sqrt(n)))`,
/// advanced one value at a time. Each push costs one pass over the fixed
/// windows, so feeding a stream is linear in stream length rather than the
/// quadratic full-history recomputation of the naive form.
#[derive(Debug, Clone)]
pub struct RollingHma {
    half: RollingWma,
    full: RollingWma,
    smooth: RollingWma,
}

impl RollingHma {
    pub fn new(period: usize) -> Self {
        let sqrt_period = (period as f64).sqrt().round() as usize;
        Self {
            half: RollingWma::new(period / 2),
            full: RollingWma::new(period),
            smooth: RollingWma::new(sqrt_period),
        }
    }

    pub fn push(&mut self, value: f64) -> f64 {
        let half = self.half.push(value);
        let full = self.full.push(value);
        // NaN until the full window fills; the smoother excludes those.
        let diff = 2.0 * half - full;
        self.smooth.push(diff)
    }
}

/// Batch WMA over a slice, index-aligned with the input.
pub fn calculate_wma(values: &[f64], period: usize) -> Vec<f64> {
    let mut wma = RollingWma::new(period);
    values.iter().map(|&value| wma.push(value)).collect()
}

/// Batch HMA over a slice, index-aligned with the input.
pub fn calculate_hma(values: &[f64], period: usize) -> Vec<f64> {
    let mut hma = RollingHma::new(period);
    values.iter().map(|&value| hma.push(value)).collect()
}

/// Whether a previous trend line sat on the upper band, within
/// [`BAND_EPSILON`].
pub fn rides_upper_band(prev_trend_line: f64, prev_upper_band: f64) -> bool {
    (prev_trend_line - prev_upper_band).abs() <= BAND_EPSILON
}

#[derive(Debug, Clone, Copy)]
struct PrevBands {
    upper: f64,
    lower: f64,
    close: f64,
    trend_line: f64,
}

/// Incremental band engine: feeds bars one at a time and emits the band
/// state for each. [`compute_bands`] folds a bar history through this
/// tracker, so streaming one bar at a time and recomputing over the full
/// history produce identical series.
#[derive(Debug, Clone)]
pub struct BandTracker {
    factor: f64,
    dist: RollingHma,
    prev: Option<PrevBands>,
}

impl BandTracker {
    pub fn new(factor: f64) -> Self {
        Self {
            factor,
            dist: RollingHma::new(TREND_PERIOD),
            prev: None,
        }
    }

    pub fn update(&mut self, bar: &Bar) -> BandState {
        let dist = self.dist.push(bar.range());
        if dist.is_nan() {
            return BandState::undefined();
        }

        let src = bar.hl2();
        let mut upper = src + self.factor * dist;
        let mut lower = src - self.factor * dist;

        let direction = match self.prev {
            None => Direction::Up,
            Some(prev) => {
                // Ratchet: the envelope may not narrow while price stays
                // inside it. A close through a band releases that side back
                // to its raw value.
                if !(lower > prev.lower || prev.close < prev.lower) {
                    lower = prev.lower;
                }
                if !(upper < prev.upper || prev.close > prev.upper) {
                    upper = prev.upper;
                }
                if rides_upper_band(prev.trend_line, prev.upper) {
                    if bar.close > upper {
                        Direction::Up
                    } else {
                        Direction::Down
                    }
                } else if bar.close < lower {
                    Direction::Down
                } else {
                    Direction::Up
                }
            }
        };

        let trend_line = match direction {
            Direction::Up => lower,
            Direction::Down => upper,
        };
        self.prev = Some(PrevBands {
            upper,
            lower,
            close: bar.close,
            trend_line,
        });
        BandState {
            upper_band: upper,
            lower_band: lower,
            trend_line,
            direction: Some(direction),
        }
    }
}

/// Computes the adaptive trend channel over a bar history. The output is
/// index-aligned with `bars`; warm-up indices are all-NaN. An empty input
/// yields an empty output.
pub fn compute_bands(bars: &[Bar], factor: f64) -> Result<Vec<BandState>, EngineError> {
    if !(factor.is_finite() && factor > 0.0) {
        return Err(EngineError::InvalidConfig(format!(
            "factor must be a positive number, got {}",
            factor
        )));
    }
    let mut tracker = BandTracker::new(factor);
    Ok(bars.iter().map(|bar| tracker.update(bar)).collect())
}
