//! Proof-of-work search.
//!
//! A [`SearchTask`] owns one worker's header, target, nonce strategy and
//! cancellation token. Running it walks the nonce space until a header hash
//! falls below the target or the token is cancelled. The token is polled
//! every `check_interval` attempts, which bounds how long a cancelled task
//! keeps hashing.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::difficulty::hash_meets_target;
use crate::hash::Midstate;
use crate::network::{BLOCK_HEADER_SIZE, HEADER_NONCE_OFFSET, HEADER_TIME_OFFSET};

/// Attempts between cancellation checks.
pub const DEFAULT_CHECK_INTERVAL: u32 = 250;

/// Per-job stop signal shared by every worker, the watchdog and the coordinator.
///
/// Cloning yields another handle to the same flag. Once set it is never cleared.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the token. Returns `true` only for the call that actually set it.
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if first {
            let _guard = self.inner.lock.lock();
            self.inner.condvar.notify_all();
        }

        first
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    ///
    /// Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();

        while !self.is_cancelled() {
            if self.inner.condvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }

        self.is_cancelled()
    }
}

/// How a worker walks the 32-bit nonce space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonceStrategy {
    /// Start at 0 (or the configured offset) and count up.
    Incremental,
    /// Draw every nonce uniformly at random.
    Random,
    /// Draw one random start, then count up.
    #[default]
    Mixed,
}

impl NonceStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            NonceStrategy::Incremental => "incremental",
            NonceStrategy::Random => "random",
            NonceStrategy::Mixed => "mixed",
        }
    }
}

impl FromStr for NonceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(NonceStrategy::Incremental),
            "random" => Ok(NonceStrategy::Random),
            "mixed" => Ok(NonceStrategy::Mixed),
            other => Err(format!("unknown nonce strategy: {}", other)),
        }
    }
}

impl fmt::Display for NonceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source of the header timestamp used when rolling time.
pub trait Clock: Send + Sync {
    /// Current Unix time in seconds.
    fn unix_time(&self) -> u32;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_time(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Searching,
    Found,
    Cancelled,
}

/// A header that meets the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    /// The completed header, nonce and time included.
    pub header: [u8; BLOCK_HEADER_SIZE],
    pub nonce: u32,
    pub timestamp: u32,
    /// Header hash in internal byte order.
    pub hash: [u8; 32],
    pub attempts: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(Solution),
    Cancelled { attempts: u64, elapsed: Duration },
}

impl SearchOutcome {
    pub fn attempts(&self) -> u64 {
        match self {
            SearchOutcome::Found(solution) => solution.attempts,
            SearchOutcome::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            SearchOutcome::Found(solution) => solution.elapsed,
            SearchOutcome::Cancelled { elapsed, .. } => *elapsed,
        }
    }
}

struct TimeRoll {
    interval: Duration,
    clock: Arc<dyn Clock>,
}

/// One worker's proof-of-work search.
pub struct SearchTask {
    header: [u8; BLOCK_HEADER_SIZE],
    target: [u8; 32],
    token: CancellationToken,
    strategy: NonceStrategy,
    start_nonce: Option<u32>,
    check_interval: u32,
    time_roll: Option<TimeRoll>,
    hash_counter: Option<Arc<AtomicU64>>,
    state: SearchState,
    outcome: Option<SearchOutcome>,
}

impl SearchTask {
    /// `target` is big-endian, as produced by [`crate::difficulty::bits_to_target`].
    pub fn new(
        header: [u8; BLOCK_HEADER_SIZE],
        target: [u8; 32],
        token: CancellationToken,
    ) -> Self {
        SearchTask {
            header,
            target,
            token,
            strategy: NonceStrategy::default(),
            start_nonce: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            time_roll: None,
            hash_counter: None,
            state: SearchState::Idle,
            outcome: None,
        }
    }

    pub fn with_strategy(mut self, strategy: NonceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// First nonce for the incremental strategy.
    pub fn with_start_nonce(mut self, nonce: u32) -> Self {
        self.start_nonce = Some(nonce);
        self
    }

    pub fn with_check_interval(mut self, attempts: u32) -> Self {
        self.check_interval = attempts.max(1);
        self
    }

    /// Advance the header time to `clock` every `interval` of wall-clock time.
    pub fn with_time_roll(mut self, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        self.time_roll = Some(TimeRoll { interval, clock });
        self
    }

    /// Shared counter every batch of attempts is added to.
    pub fn with_hash_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.hash_counter = Some(counter);
        self
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    /// Run until a solution is found or the token is cancelled.
    ///
    /// A task that already finished returns its previous outcome.
    pub fn run(&mut self) -> SearchOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        self.state = SearchState::Searching;
        let outcome = self.search();
        self.state = match outcome {
            SearchOutcome::Found(_) => SearchState::Found,
            SearchOutcome::Cancelled { .. } => SearchState::Cancelled,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    fn search(&mut self) -> SearchOutcome {
        let start = Instant::now();
        let mut rng = SmallRng::from_entropy();
        let mut header = self.header;

        // Version, previous hash and most of the merkle root never change here
        let midstate = Midstate::new(&header);

        let mut nonce = match self.strategy {
            NonceStrategy::Incremental => self.start_nonce.unwrap_or(0),
            NonceStrategy::Random | NonceStrategy::Mixed => rng.gen(),
        };

        let mut attempts: u64 = 0;
        let mut last_roll = Instant::now();

        loop {
            if self.token.is_cancelled() {
                return SearchOutcome::Cancelled {
                    attempts,
                    elapsed: start.elapsed(),
                };
            }

            if let Some(roll) = &self.time_roll {
                if last_roll.elapsed() >= roll.interval {
                    roll_time(&mut header, roll.clock.unix_time());
                    last_roll = Instant::now();
                }
            }

            for batch_attempt in 0..self.check_interval {
                header[HEADER_NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
                let hash = midstate.header_hash(&header[64..]);

                if hash_meets_target(&hash, &self.target) {
                    attempts += batch_attempt as u64 + 1;
                    self.count(batch_attempt as u64 + 1);

                    return SearchOutcome::Found(Solution {
                        header,
                        nonce,
                        timestamp: header_time(&header),
                        hash,
                        attempts,
                        elapsed: start.elapsed(),
                    });
                }

                nonce = match self.strategy {
                    NonceStrategy::Random => rng.gen(),
                    NonceStrategy::Incremental | NonceStrategy::Mixed => nonce.wrapping_add(1),
                };
            }

            attempts += self.check_interval as u64;
            self.count(self.check_interval as u64);
        }
    }

    fn count(&self, attempts: u64) {
        if let Some(counter) = &self.hash_counter {
            counter.fetch_add(attempts, Ordering::Relaxed);
        }
    }
}

/// Write `now` into the header time field if it moves time forward.
fn roll_time(header: &mut [u8; BLOCK_HEADER_SIZE], now: u32) {
    let current = header_time(header);
    if now > current {
        header[HEADER_TIME_OFFSET..HEADER_TIME_OFFSET + 4].copy_from_slice(&now.to_le_bytes());
        debug!(from = current, to = now, "Rolled header time");
    }
}

fn header_time(header: &[u8; BLOCK_HEADER_SIZE]) -> u32 {
    let mut time = [0u8; 4];
    time.copy_from_slice(&header[HEADER_TIME_OFFSET..HEADER_TIME_OFFSET + 4]);
    u32::from_le_bytes(time)
}
