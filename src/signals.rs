use log::debug;

use crate::models::{BandState, Bar, Signal, SignalKind};

/// Scans a band-state series for trend reversals: an event is emitted at
/// every index whose defined direction differs from the last defined
/// direction. The first defined direction produces no signal. Pure and
/// restartable; identical input yields identical output.
pub fn detect_signals(bars: &[Bar], band_states: &[BandState]) -> Vec<Signal> {
    debug_assert_eq!(bars.len(), band_states.len());
    let mut signals = Vec::new();
    let mut last_direction = None;

    for (index, state) in band_states.iter().enumerate() {
        let Some(direction) = state.direction else {
            continue;
        };
        if let Some(previous) = last_direction {
            if previous != direction {
                let bar = &bars[index];
                signals.push(Signal {
                    index,
                    time: bar.time,
                    price: bar.close,
                    kind: SignalKind::Reversal,
                    direction,
                });
            }
        }
        last_direction = Some(direction);
    }

    debug!(
        "detected {} reversal signals over {} bars",
        signals.len(),
        bars.len()
    );
    signals
}
