use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::debug;

use crate::config::StrategyParams;
use crate::errors::EngineError;
use crate::models::{Bar, Direction, Signal, StrategyOutput, ViewportWindow};
use crate::strategy::apply_strategy;

/// One viewport cache per (symbol, interval) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub symbol: String,
    pub interval: String,
}

impl SessionKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendDirection {
    /// Toward the beginning of the history.
    Back,
    /// Toward the end of the history.
    Forward,
}

/// A `[start, end)` view over the retained full history. Signal indices stay
/// absolute into the full history so markers remain aligned as the window
/// moves.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSlice {
    pub bars: Vec<Bar>,
    pub trend_lines: Vec<f64>,
    pub directions: Vec<Option<Direction>>,
    pub signals: Vec<Signal>,
    pub window: ViewportWindow,
}

/// Extension result: the newly revealed bars plus the full re-sliced window.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendResult {
    pub new_bars: Vec<Bar>,
    pub slice: WindowSlice,
}

/// Holds a bar history and its strategy output computed once over the whole
/// history. Every slice is cut from these retained full arrays: the band
/// recurrence needs the complete preceding context, so recomputing over a
/// sub-range would diverge near the window's left edge.
pub struct ViewportSession {
    bars: Vec<Bar>,
    output: StrategyOutput,
    window: ViewportWindow,
}

impl ViewportSession {
    pub fn new(
        bars: Vec<Bar>,
        params: &StrategyParams,
        initial_viewport: usize,
    ) -> Result<Self, EngineError> {
        let output = apply_strategy(&bars, params)?;
        let total = bars.len();
        let start = total.saturating_sub(initial_viewport.max(1));
        Ok(Self {
            bars,
            output,
            window: ViewportWindow {
                start,
                end: total,
                total_available: total,
            },
        })
    }

    pub fn window(&self) -> ViewportWindow {
        self.window
    }

    pub fn output(&self) -> &StrategyOutput {
        &self.output
    }

    /// Slices `[start, end)` from the retained full arrays, clamping both
    /// offsets into `[0, total_available]`.
    pub fn slice(&self, start: usize, end: usize) -> WindowSlice {
        let total = self.window.total_available;
        let end = end.min(total);
        let start = start.min(end);
        WindowSlice {
            bars: self.bars[start..end].to_vec(),
            trend_lines: self.output.trend_lines[start..end].to_vec(),
            directions: self.output.directions[start..end].to_vec(),
            signals: self
                .output
                .signals
                .iter()
                .filter(|s| s.index >= start && s.index < end)
                .copied()
                .collect(),
            window: ViewportWindow {
                start,
                end,
                total_available: total,
            },
        }
    }

    pub fn current_slice(&self) -> WindowSlice {
        self.slice(self.window.start, self.window.end)
    }

    /// Grows the visible window by `amount` bars toward the requested side,
    /// clamped at the history bounds, and re-slices from the retained full
    /// output.
    pub fn extend(&mut self, direction: ExtendDirection, amount: usize) -> ExtendResult {
        let previous = self.window;
        match direction {
            ExtendDirection::Back => {
                self.window.start = previous.start.saturating_sub(amount);
            }
            ExtendDirection::Forward => {
                self.window.end = previous
                    .end
                    .saturating_add(amount)
                    .min(previous.total_available);
            }
        }
        let new_bars = match direction {
            ExtendDirection::Back => self.bars[self.window.start..previous.start].to_vec(),
            ExtendDirection::Forward => self.bars[previous.end..self.window.end].to_vec(),
        };
        ExtendResult {
            new_bars,
            slice: self.current_slice(),
        }
    }
}

/// Registry of viewport sessions. Each session is exclusively owned per
/// (symbol, interval); concurrent extends on one session serialize on its
/// mutex while other sessions stay independent.
#[derive(Default)]
pub struct ViewportManager {
    sessions: DashMap<SessionKey, Arc<Mutex<ViewportSession>>>,
}

impl ViewportManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the full strategy output over `bars` once, retains it, and
    /// returns the trailing `initial_viewport` bars. Replaces any previous
    /// session for the key.
    pub fn load_window(
        &self,
        key: SessionKey,
        bars: Vec<Bar>,
        params: &StrategyParams,
        initial_viewport: usize,
    ) -> Result<WindowSlice, EngineError> {
        let session = ViewportSession::new(bars, params, initial_viewport)?;
        let slice = session.current_slice();
        debug!(
            "loaded viewport for {}/{}: {} bars, initial window [{}, {})",
            key.symbol, key.interval, slice.window.total_available, slice.window.start,
            slice.window.end
        );
        self.sessions.insert(key, Arc::new(Mutex::new(session)));
        Ok(slice)
    }

    pub fn extend_window(
        &self,
        key: &SessionKey,
        direction: ExtendDirection,
        amount: usize,
    ) -> Result<ExtendResult, EngineError> {
        let session = self
            .sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::UnknownSession(format!("{}/{}", key.symbol, key.interval)))?;
        let mut session = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(session.extend(direction, amount))
    }

    pub fn window(&self, key: &SessionKey) -> Result<ViewportWindow, EngineError> {
        let session = self
            .sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::UnknownSession(format!("{}/{}", key.symbol, key.interval)))?;
        let session = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(session.window())
    }

    pub fn drop_session(&self, key: &SessionKey) {
        self.sessions.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_utils::random_walk_series;

    fn session(count: usize, viewport: usize) -> ViewportSession {
        let bars = random_walk_series(count, 120.0, 0.02, 11);
        ViewportSession::new(bars, &StrategyParams::default(), viewport).unwrap()
    }

    #[test]
    fn initial_window_is_the_trailing_viewport() {
        let session = session(400, 50);
        let window = session.window();
        assert_eq!(window.start, 350);
        assert_eq!(window.end, 400);
        assert_eq!(window.total_available, 400);
        assert_eq!(session.current_slice().bars.len(), 50);
    }

    #[test]
    fn extend_back_reveals_older_bars_and_clamps() {
        let mut session = session(400, 50);
        let result = session.extend(ExtendDirection::Back, 100);
        assert_eq!(result.new_bars.len(), 100);
        assert_eq!(result.slice.window.start, 250);
        assert_eq!(result.slice.bars.len(), 150);

        // Past the beginning: clamped, never an error.
        let result = session.extend(ExtendDirection::Back, 10_000);
        assert_eq!(result.slice.window.start, 0);
        assert_eq!(result.slice.bars.len(), 400);
        let result = session.extend(ExtendDirection::Forward, 10_000);
        assert_eq!(result.new_bars.len(), 0);
        assert_eq!(result.slice.window.end, 400);
    }

    #[test]
    fn slices_come_from_the_full_computation() {
        let session = session(400, 50);
        let slice = session.slice(250, 320);
        let full = session.output();
        assert_eq!(slice.trend_lines.as_slice(), &full.trend_lines[250..320]);
        assert_eq!(slice.directions.as_slice(), &full.directions[250..320]);
        assert!(slice.signals.iter().all(|s| (250..320).contains(&s.index)));
    }

    #[test]
    fn manager_rejects_unknown_sessions() {
        let manager = ViewportManager::new();
        let key = SessionKey::new("BTC", "1h");
        assert!(matches!(
            manager.extend_window(&key, ExtendDirection::Back, 10),
            Err(EngineError::UnknownSession(_))
        ));

        let bars = random_walk_series(300, 95.0, 0.02, 5);
        manager
            .load_window(key.clone(), bars, &StrategyParams::default(), 40)
            .unwrap();
        let result = manager
            .extend_window(&key, ExtendDirection::Back, 20)
            .unwrap();
        assert_eq!(result.slice.window.start, 240);
        manager.drop_session(&key);
        assert!(manager.window(&key).is_err());
    }
}
