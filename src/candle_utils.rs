use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::Bar;

/// Fixed origin for generated series: 2024-01-01 00:00:00 UTC.
pub fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default()
}

/// Whether timestamps are strictly increasing, the ordering the engine
/// expects from its bar source.
pub fn is_strictly_ascending(bars: &[Bar]) -> bool {
    bars.windows(2).all(|pair| pair[0].time < pair[1].time)
}

/// Hourly bars with strictly increasing closes and a constant high-low
/// range, handy for pinning down warm-up behavior: a constant range makes
/// the smoothed band distance equal that range at every defined index.
pub fn trending_series(count: usize, start_price: f64, step: f64, range: f64) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let close = start_price + step * i as f64;
            Bar {
                time: base_time() + Duration::hours(i as i64),
                open: close - step,
                high: close + range / 2.0,
                low: close - range / 2.0,
                close,
            }
        })
        .collect()
}

/// Deterministic hourly random walk. The same seed always yields the same
/// series.
pub fn random_walk_series(count: usize, start_price: f64, volatility: f64, seed: u64) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut close = start_price;
    let mut bars = Vec::with_capacity(count);
    for i in 0..count {
        let open = close;
        let shock: f64 = rng.gen_range(-1.0..1.0);
        close = (open * (1.0 + volatility * shock)).max(0.01);
        let wick: f64 = rng.gen_range(0.0..volatility) * open;
        let high = open.max(close) + wick;
        let low = (open.min(close) - wick).max(0.005);
        bars.push(Bar {
            time: base_time() + Duration::hours(i as i64),
            open,
            high,
            low,
            close,
        });
    }
    bars
}
