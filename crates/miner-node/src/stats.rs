//! Hash rate accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Running totals across every job this process has searched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiningStats {
    pub total_hashes: u64,
    pub jobs: u64,
    pub blocks_found: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,
    pub stale_jobs: u64,
    pub elapsed: Duration,
}

impl MiningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average rate over everything recorded so far.
    pub fn hash_rate(&self) -> f64 {
        rate(self.total_hashes, self.elapsed)
    }

    /// Fold in one finished job.
    pub fn record_job(&mut self, hashes: u64, elapsed: Duration) {
        self.jobs += 1;
        self.total_hashes += hashes;
        self.elapsed += elapsed;
    }
}

fn rate(hashes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        hashes as f64 / secs
    } else {
        0.0
    }
}

/// Format a hash rate for display.
pub fn format_hash_rate(hash_rate: f64) -> String {
    if hash_rate >= 1_000_000_000.0 {
        format!("{:.2} GH/s", hash_rate / 1_000_000_000.0)
    } else if hash_rate >= 1_000_000.0 {
        format!("{:.2} MH/s", hash_rate / 1_000_000.0)
    } else if hash_rate >= 1_000.0 {
        format!("{:.2} KH/s", hash_rate / 1_000.0)
    } else {
        format!("{:.2} H/s", hash_rate)
    }
}

/// Samples the shared attempt counter that every search task adds to.
#[derive(Debug)]
pub struct HashRateMeter {
    counter: Arc<AtomicU64>,
    started: Instant,
    last_count: u64,
    last_sample: Instant,
}

impl HashRateMeter {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        let now = Instant::now();
        let last_count = counter.load(Ordering::Relaxed);
        HashRateMeter {
            counter,
            started: now,
            last_count,
            last_sample: now,
        }
    }

    /// Attempts counted so far.
    pub fn total(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Rate since the previous sample.
    pub fn sample(&mut self) -> f64 {
        let now = Instant::now();
        let count = self.counter.load(Ordering::Relaxed);

        let rate = rate(count.saturating_sub(self.last_count), now - self.last_sample);

        self.last_count = count;
        self.last_sample = now;
        rate
    }
}
