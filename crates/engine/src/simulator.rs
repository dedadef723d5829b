//! Progress simulation
//!
//! Stands in for a real transfer backend: every tick, each simulated entry
//! that is Queued or Downloading moves forward by a random increment.

use crate::config::Config;
use crate::store::{Batch, Store};
use bridge::{DownloadEntry, DownloadEvent, DownloadStatus, Driver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// What a single tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub started: usize,
    pub advanced: usize,
    pub completed: usize,
    pub pruned: usize,
}

pub struct Simulator {
    rng: StdRng,
    min_increment: f64,
    max_increment: f64,
}

impl Simulator {
    /// Expects a validated config (`0 < min <= max < 100`)
    pub fn new(config: &Config) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            min_increment: config.min_increment,
            max_increment: config.max_increment,
        }
    }

    fn increment(&mut self) -> f64 {
        self.rng.gen_range(self.min_increment..=self.max_increment)
    }

    /// Advance every eligible entry once
    pub fn step(&mut self, batch: &mut Batch<'_>) -> TickSummary {
        let mut summary = TickSummary::default();
        batch.modify_each(|entry, events| {
            if entry.driver != Driver::Simulated {
                return;
            }
            if !matches!(entry.status, DownloadStatus::Queued | DownloadStatus::Downloading) {
                return;
            }
            let increment = self.increment();
            let was_queued = entry.status == DownloadStatus::Queued;
            advance(entry, increment, events);

            if was_queued {
                summary.started += 1;
            }
            summary.advanced += 1;
            if entry.status == DownloadStatus::Completed {
                summary.completed += 1;
            }
        });
        summary
    }
}

/// Move one entry forward by `increment` percentage points.
///
/// Queued entries first become Downloading. Progress is clamped to 100.0, and
/// landing on 100.0 completes the entry in the same call. Paused and terminal
/// entries are left alone.
pub fn advance(entry: &mut DownloadEntry, increment: f64, events: &mut Vec<DownloadEvent>) {
    if entry.status == DownloadStatus::Queued {
        entry.status = DownloadStatus::Downloading;
        events.push(DownloadEvent::Started { id: entry.id });
    }
    if entry.status != DownloadStatus::Downloading {
        return;
    }

    let next = (entry.progress + increment.max(0.0)).min(100.0);
    if next >= 100.0 {
        complete(entry, events);
    } else {
        entry.progress = next;
    }
}

/// Downloading -> Completed, pinning progress at exactly 100.0
pub fn complete(entry: &mut DownloadEntry, events: &mut Vec<DownloadEvent>) {
    debug_assert_eq!(entry.status, DownloadStatus::Downloading);
    entry.progress = 100.0;
    entry.status = DownloadStatus::Completed;
    info!("Download complete: {}", entry.name);
    events.push(DownloadEvent::Completed {
        id: entry.id,
        name: entry.name.clone(),
    });
}

/// Handles shared between the coordinator and its tick task
#[derive(Clone)]
pub(crate) struct LoopControl {
    pub cancelled: Arc<AtomicBool>,
    pub history_enabled: Arc<AtomicBool>,
}

/// Run one tick against the store.
///
/// The cancellation flag is checked under the store lock, so once it is set
/// no later tick can mutate anything. Returns `None` when cancelled.
pub(crate) fn tick(
    store: &Store,
    simulator: &mut Simulator,
    control: &LoopControl,
) -> Option<TickSummary> {
    store.batch(|batch| {
        if control.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        let mut summary = simulator.step(batch);
        if summary.completed > 0 && !control.history_enabled.load(Ordering::SeqCst) {
            summary.pruned = batch.drop_finished();
        }
        Some(summary)
    })
}

/// Tick loop; lives until the stop signal fires or the flag is set
pub(crate) async fn run(
    store: Arc<Store>,
    mut simulator: Simulator,
    period: Duration,
    start: Instant,
    control: LoopControl,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                match tick(&store, &mut simulator, &control) {
                    Some(summary) => {
                        ticks += 1;
                        if summary.advanced > 0 {
                            debug!(
                                "Tick {}: {} advanced, {} started, {} completed",
                                ticks, summary.advanced, summary.started, summary.completed
                            );
                        }
                    }
                    None => break,
                }
            }
        }
    }

    debug!("Progress loop stopped after {} ticks", ticks);
}
