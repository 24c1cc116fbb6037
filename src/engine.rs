use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backtester::check_tp_sl;
use crate::config::LiveParams;
use crate::errors::EngineError;
use crate::indicators::BandTracker;
use crate::models::{Bar, Direction, ExitReason, LiveSnapshot, Position};

const COMMAND_BUFFER: usize = 64;

enum LiveCommand {
    Bar(Bar),
    ClosePosition {
        reply: oneshot::Sender<Result<Position, EngineError>>,
    },
    Stop,
}

struct LiveHandle {
    tx: mpsc::Sender<LiveCommand>,
    snapshot: Arc<RwLock<LiveSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Supervisor for named live strategy instances. Each instance is an
/// independent tokio task consuming a serialized command stream, so bars for
/// one id are applied strictly in arrival order while instances never block
/// each other. Constructed explicitly and passed by reference; there is no
/// process-wide singleton.
#[derive(Default)]
pub struct LiveEngine {
    instances: DashMapInstances,
}

type DashMapInstances = dashmap::DashMap<String, LiveHandle>;

impl LiveEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or recreates, if a stopped instance holds the id) a live
    /// instance and starts its ingestion task. Returns immediately.
    pub fn start(
        &self,
        id: &str,
        symbol: &str,
        interval: &str,
        params: LiveParams,
    ) -> Result<(), EngineError> {
        params.validate()?;
        if let Some(existing) = self.instances.get(id) {
            let running = read_snapshot(&existing.snapshot).running;
            if running {
                return Err(EngineError::AlreadyRunning(id.to_string()));
            }
        }

        let snapshot = Arc::new(RwLock::new(LiveSnapshot {
            id: id.to_string(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            running: true,
            position: None,
            last_bar_time: None,
            last_price: None,
            bars_seen: 0,
            bars_rejected: 0,
        }));
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let state = LiveState::new(id.to_string(), params);
        let task = tokio::spawn(run_instance(rx, state, Arc::clone(&snapshot)));

        info!("started live strategy '{}' on {} {}", id, symbol, interval);
        self.instances.insert(
            id.to_string(),
            LiveHandle {
                tx,
                snapshot,
                task: Mutex::new(Some(task)),
            },
        );
        Ok(())
    }

    /// Feeds one bar to an instance. Bars are processed in arrival order;
    /// an out-of-order bar is rejected by the instance and counted in its
    /// snapshot rather than silently misapplied.
    pub async fn on_bar(&self, id: &str, bar: Bar) -> Result<(), EngineError> {
        let tx = self.running_sender(id)?;
        tx.send(LiveCommand::Bar(bar))
            .await
            .map_err(|_| EngineError::InstanceUnavailable(id.to_string()))
    }

    /// Marks the instance stopped after any already-queued bars drain. The
    /// instance stays listed with `running: false`; its open position is
    /// left untouched unless `close_on_stop` was configured.
    pub async fn stop(&self, id: &str) -> Result<(), EngineError> {
        let tx = self.running_sender(id)?;
        tx.send(LiveCommand::Stop)
            .await
            .map_err(|_| EngineError::InstanceUnavailable(id.to_string()))
    }

    /// Force-closes the current open position at the most recent known
    /// price with reason `manual`.
    pub async fn close_position(&self, id: &str) -> Result<Position, EngineError> {
        let tx = self.running_sender(id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(LiveCommand::ClosePosition { reply: reply_tx })
            .await
            .map_err(|_| EngineError::InstanceUnavailable(id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::InstanceUnavailable(id.to_string()))?
    }

    /// Snapshot of every instance, running or stopped. Reads never block on
    /// bar processing.
    pub fn list(&self) -> Vec<LiveSnapshot> {
        self.instances
            .iter()
            .map(|entry| read_snapshot(&entry.snapshot))
            .collect()
    }

    pub fn query(&self, id: &str) -> Result<LiveSnapshot, EngineError> {
        let entry = self
            .instances
            .get(id)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;
        Ok(read_snapshot(&entry.snapshot))
    }

    /// Stops every running instance and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        let mut senders = Vec::new();
        let mut tasks = Vec::new();
        for entry in self.instances.iter() {
            if read_snapshot(&entry.snapshot).running {
                senders.push(entry.tx.clone());
            }
            if let Ok(mut slot) = entry.task.lock() {
                if let Some(task) = slot.take() {
                    tasks.push(task);
                }
            }
        }
        for tx in senders {
            let _ = tx.send(LiveCommand::Stop).await;
        }
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!("live instance task ended abnormally: {}", err);
            }
        }
    }

    fn running_sender(&self, id: &str) -> Result<mpsc::Sender<LiveCommand>, EngineError> {
        let entry = self
            .instances
            .get(id)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;
        if !read_snapshot(&entry.snapshot).running {
            return Err(EngineError::UnknownInstance(id.to_string()));
        }
        Ok(entry.tx.clone())
    }
}

fn read_snapshot(snapshot: &Arc<RwLock<LiveSnapshot>>) -> LiveSnapshot {
    match snapshot.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

struct LiveState {
    id: String,
    params: LiveParams,
    tracker: BandTracker,
    last_direction: Option<Direction>,
    position: Option<Position>,
    recent_bars: VecDeque<Bar>,
    last_time: Option<DateTime<Utc>>,
    bars_seen: u64,
    bars_rejected: u64,
}

impl LiveState {
    fn new(id: String, params: LiveParams) -> Self {
        Self {
            id,
            tracker: BandTracker::new(params.strategy.factor),
            params,
            last_direction: None,
            position: None,
            recent_bars: VecDeque::new(),
            last_time: None,
            bars_seen: 0,
            bars_rejected: 0,
        }
    }

    fn last_price(&self) -> Option<f64> {
        self.recent_bars.back().map(|bar| bar.close)
    }

    fn process_bar(&mut self, bar: &Bar) {
        if let Some(last) = self.last_time {
            if bar.time <= last {
                warn!(
                    "[{}] rejecting out-of-order bar at {} (last processed {})",
                    self.id, bar.time, last
                );
                self.bars_rejected += 1;
                return;
            }
        }

        let index = self.bars_seen as usize;
        self.bars_seen += 1;
        self.last_time = Some(bar.time);
        if self.recent_bars.len() == self.params.buffer_bars {
            self.recent_bars.pop_front();
        }
        self.recent_bars.push_back(*bar);

        let band = self.tracker.update(bar);
        let config = self.params.strategy.backtest;
        let mut exited = false;

        if let Some(position) = self.position.as_mut() {
            if position.is_open && index > position.entry_index {
                position.track_excursion(bar);
                if let Some(trigger) = check_tp_sl(position, bar, &config) {
                    position.close(index, trigger.price, bar.time, trigger.reason);
                    info!(
                        "[{}] closed {} position: {} @ {:.4}",
                        self.id,
                        position.side.as_str(),
                        trigger.reason.as_str(),
                        trigger.price
                    );
                    exited = true;
                }
            }
        }

        let Some(direction) = band.direction else {
            return;
        };
        let flipped = matches!(self.last_direction, Some(previous) if previous != direction);
        self.last_direction = Some(direction);
        if !flipped {
            return;
        }

        debug!(
            "[{}] trend reversal to {} at {}",
            self.id,
            direction.as_str(),
            bar.time
        );

        if let Some(position) = self.position.as_mut() {
            if position.is_open && position.side != direction.side() {
                position.close(index, bar.close, bar.time, ExitReason::Reversal);
                info!(
                    "[{}] closed {} position on reversal @ {:.4}",
                    self.id,
                    position.side.as_str(),
                    bar.close
                );
                exited = true;
            }
        }

        let flat = self.position.as_ref().map(|p| !p.is_open).unwrap_or(true);
        if flat && !exited && config.trade_direction.allows(direction.side()) {
            self.position = Some(Position::open(
                direction.side(),
                index,
                bar.close,
                bar.time,
                config.position_size,
            ));
            info!(
                "[{}] opened {} position @ {:.4}",
                self.id,
                direction.side().as_str(),
                bar.close
            );
        }
    }

    fn close_manual(&mut self) -> Result<Position, EngineError> {
        let price = self.last_price();
        let Some(position) = self.position.as_mut().filter(|p| p.is_open) else {
            return Err(EngineError::NoOpenPosition(self.id.clone()));
        };
        let price = price.unwrap_or(position.entry_price);
        let time = self.last_time.unwrap_or(position.entry_time);
        let index = (self.bars_seen.max(1) - 1) as usize;
        position.close(index, price, time, ExitReason::Manual);
        info!(
            "[{}] manually closed {} position @ {:.4}",
            self.id,
            position.side.as_str(),
            price
        );
        Ok(position.clone())
    }

    fn on_stop(&mut self) {
        if self.params.close_on_stop {
            match self.close_manual() {
                Ok(_) => {}
                Err(EngineError::NoOpenPosition(_)) => {}
                Err(err) => warn!("[{}] close-on-stop failed: {}", self.id, err),
            }
        }
        info!("[{}] live strategy stopped", self.id);
    }

    fn publish(&self, snapshot: &Arc<RwLock<LiveSnapshot>>, running: bool) {
        if let Ok(mut guard) = snapshot.write() {
            guard.running = running;
            guard.position = self.position.clone();
            guard.last_bar_time = self.last_time;
            guard.last_price = self.last_price();
            guard.bars_seen = self.bars_seen;
            guard.bars_rejected = self.bars_rejected;
        }
    }
}

async fn run_instance(
    mut rx: mpsc::Receiver<LiveCommand>,
    mut state: LiveState,
    snapshot: Arc<RwLock<LiveSnapshot>>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            LiveCommand::Bar(bar) => {
                state.process_bar(&bar);
                state.publish(&snapshot, true);
            }
            LiveCommand::ClosePosition { reply } => {
                let result = state.close_manual();
                state.publish(&snapshot, true);
                let _ = reply.send(result);
            }
            LiveCommand::Stop => {
                state.on_stop();
                state.publish(&snapshot, false);
                break;
            }
        }
    }
    debug!("[{}] instance task finished", state.id);
}
