// Throughput and ETA tracking for a single byte stream

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Snapshot of a stream's progress
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub length: u64,
    pub transferred: u64,
    /// Bytes transferred since the previous snapshot
    pub delta: u64,
    pub percentage: f64,
    pub remaining: u64,
    pub runtime_ms: u64,
    /// Bytes per second
    pub speed: f64,
    /// Seconds
    pub eta: f64,
}

/// Rolling speed estimate over a fixed window
#[derive(Debug, Clone)]
pub struct Speedometer {
    window: Duration,
    // (time, cumulative bytes)
    samples: VecDeque<(Instant, u64)>,
}

impl Speedometer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant, total: u64) {
        self.samples.push_back((now, total));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(t, _)) if now.duration_since(t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second across the retained samples
    pub fn speed(&self) -> f64 {
        let (Some(&(first_t, first_b)), Some(&(last_t, last_b))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last_t.duration_since(first_t).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last_b.saturating_sub(first_b) as f64 / elapsed
    }
}

pub struct ProgressMeter {
    length: u64,
    transferred: u64,
    last_reported: u64,
    started: Instant,
    speedometer: Speedometer,
}

impl ProgressMeter {
    pub fn new(length: u64, now: Instant) -> Self {
        let mut speedometer = Speedometer::new(Duration::from_secs(5));
        speedometer.record(now, 0);
        Self {
            length,
            transferred: 0,
            last_reported: 0,
            started: now,
            speedometer,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.transferred += bytes;
    }

    /// Take a snapshot; `delta` covers the bytes since the previous one
    pub fn tick(&mut self, now: Instant) -> ProgressState {
        self.speedometer.record(now, self.transferred);

        let delta = self.transferred - self.last_reported;
        self.last_reported = self.transferred;

        let percentage = if self.length == 0 {
            100.0
        } else {
            (self.transferred as f64 / self.length as f64 * 100.0).min(100.0)
        };
        let remaining = self.length.saturating_sub(self.transferred);
        let speed = self.speedometer.speed();
        let eta = if speed > 0.0 {
            remaining as f64 / speed
        } else {
            0.0
        };

        ProgressState {
            length: self.length,
            transferred: self.transferred,
            delta,
            percentage,
            remaining,
            runtime_ms: now.duration_since(self.started).as_millis() as u64,
            speed,
            eta,
        }
    }
}
