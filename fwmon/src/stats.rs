use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters shared by the capture threads, the emit path and the sink.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_received: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub callback_failures: AtomicU64,
    pub events_emitted: AtomicU64,
    pub events_written: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_malformed: u64,
    pub callback_failures: u64,
    pub events_emitted: u64,
    pub events_written: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counts occurrences and reports the total once per elapsed window.
#[derive(Debug)]
pub struct WindowCounter {
    window: Duration,
    state: Mutex<(u64, Instant)>,
}

impl WindowCounter {
    pub fn hourly() -> Self {
        Self::new(Duration::from_secs(3600))
    }

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new((0, Instant::now())),
        }
    }

    /// Count one occurrence; returns the window total when the window has just elapsed.
    pub fn tick(&self) -> Option<u64> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.0 += 1;
        if state.1.elapsed() < self.window {
            return None;
        }
        let total = state.0;
        *state = (0, Instant::now());
        Some(total)
    }
}
