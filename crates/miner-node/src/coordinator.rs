//! Job loop.
//!
//! Each cycle fetches a template, prepares a [`Job`], fans one [`Work`] per
//! worker out to OS threads, and waits for the first solution, a tip change
//! or shutdown. Workers report over a channel; the first solution of the
//! current generation is submitted and every later one is dropped.

use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use gbt_miner_core::difficulty::{
    bits_to_difficulty, expected_hashes, format_difficulty, target_to_difficulty,
};
use gbt_miner_core::hash::{count_leading_zeros, hash_to_display_hex};
use gbt_miner_core::{
    BlockTemplate, CancellationToken, Clock, Job, SearchOutcome, Solution, SystemClock, Work,
};
use thiserror::Error;

use crate::config::MinerSettings;
use crate::rpc::{NodeClient, SubmitResult};
use crate::stats::{format_hash_rate, HashRateMeter, MiningStats};
use crate::tracing::prelude::*;
use crate::watchdog::{Watchdog, WatchdogExit};

/// Pause between one job ending and the next template request.
const CYCLE_PAUSE: Duration = Duration::from_secs(1);

/// How often the result loop wakes to check for shutdown and log stats.
const POLL_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn { name: String, source: io::Error },
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Accepted,
    Rejected(String),
    /// Submitting failed at the transport level.
    SubmitFailed,
    /// The chain tip moved before a solution was found.
    Stale,
    /// The template or job could not be used.
    Abandoned,
    Shutdown,
}

/// A worker's final report.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub worker: usize,
    pub generation: u64,
    pub outcome: SearchOutcome,
}

/// Lets exactly one solution per generation through to submission.
#[derive(Debug)]
pub struct SubmissionGuard {
    generation: u64,
    claimed: bool,
}

impl SubmissionGuard {
    pub fn new(generation: u64) -> Self {
        SubmissionGuard {
            generation,
            claimed: false,
        }
    }

    /// The solution in `event`, if it is the first one for this generation.
    pub fn claim<'a>(&mut self, event: &'a WorkerEvent) -> Option<&'a Solution> {
        if self.claimed || event.generation != self.generation {
            return None;
        }
        match &event.outcome {
            SearchOutcome::Found(solution) => {
                self.claimed = true;
                Some(solution)
            }
            SearchOutcome::Cancelled { .. } => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}

pub struct Coordinator {
    client: Arc<dyn NodeClient>,
    settings: MinerSettings,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
    generation: u64,
    stats: MiningStats,
}

impl Coordinator {
    /// Cancelling `shutdown` stops the running job and the loop after it.
    pub fn new(
        client: Arc<dyn NodeClient>,
        settings: MinerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Coordinator {
            client,
            settings,
            shutdown,
            clock: Arc::new(SystemClock),
            generation: 0,
            stats: MiningStats::new(),
        }
    }

    pub fn stats(&self) -> &MiningStats {
        &self.stats
    }

    /// Mine until shutdown.
    pub fn run(&mut self) -> Result<MiningStats, CoordinatorError> {
        info!(
            workers = self.settings.workers,
            strategy = %self.settings.nonce_strategy,
            network = %self.settings.job.network,
            "Starting miner"
        );

        while !self.shutdown.is_cancelled() {
            if self.run_cycle()? == CycleOutcome::Shutdown {
                break;
            }
            self.shutdown.wait_timeout(CYCLE_PAUSE);
        }

        info!(
            jobs = self.stats.jobs,
            found = self.stats.blocks_found,
            accepted = self.stats.blocks_accepted,
            rate = %format_hash_rate(self.stats.hash_rate()),
            "Miner stopped"
        );
        Ok(self.stats.clone())
    }

    /// Fetch one template and mine it to completion.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, CoordinatorError> {
        let Some(template) = self.fetch_template() else {
            return Ok(CycleOutcome::Shutdown);
        };

        self.generation += 1;
        let job = match Job::new(self.generation, template, &self.settings.job) {
            Ok(job) => job,
            Err(e) => {
                error!(generation = self.generation, error = %e, "Abandoning job");
                return Ok(CycleOutcome::Abandoned);
            }
        };

        let outcome = self.mine_job(&job)?;
        match &outcome {
            CycleOutcome::Stale => self.stats.stale_jobs += 1,
            CycleOutcome::Rejected(_) => self.stats.blocks_rejected += 1,
            CycleOutcome::Accepted => self.stats.blocks_accepted += 1,
            _ => {}
        }
        Ok(outcome)
    }

    /// Ask for a template until one arrives or shutdown is requested.
    fn fetch_template(&self) -> Option<BlockTemplate> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.client.get_block_template() {
                Ok(template) => return Some(template),
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?self.settings.retry_delay,
                        "Failed to fetch block template"
                    );
                    if self.shutdown.wait_timeout(self.settings.retry_delay) {
                        return None;
                    }
                }
            }
        }
    }

    fn prepare_work(&self, job: &Job) -> Option<Vec<Work>> {
        let extranonces = match self.settings.allocator.allocate(self.settings.workers) {
            Ok(extranonces) => extranonces,
            Err(e) => {
                error!(error = %e, "Cannot allocate extranonce2 values");
                return None;
            }
        };

        let mut works = Vec::with_capacity(extranonces.len());
        for extranonce2 in extranonces {
            match job.work(extranonce2) {
                Ok(work) => works.push(work),
                Err(e) => {
                    error!(%extranonce2, error = %e, "Cannot build work");
                    return None;
                }
            }
        }
        Some(works)
    }

    fn mine_job(&mut self, job: &Job) -> Result<CycleOutcome, CoordinatorError> {
        let generation = job.generation();
        let Some(works) = self.prepare_work(job) else {
            return Ok(CycleOutcome::Abandoned);
        };

        let difficulty = target_to_difficulty(&job.target());
        info!(
            generation,
            height = job.height(),
            prev = %job.template().prev_hash_display(),
            transactions = job.template().transactions.len(),
            difficulty = %format_difficulty(difficulty),
            network_difficulty = %format_difficulty(bits_to_difficulty(job.template().bits)),
            expected_hashes = expected_hashes(difficulty),
            "Mining new job"
        );
        debug!(
            extranonce1 = %job.extranonce1(),
            branch_len = job.coinbase_branch().len(),
            "Job coinbase layout"
        );

        let token = CancellationToken::new();
        let counter = Arc::new(AtomicU64::new(0));
        let mut meter = HashRateMeter::new(counter.clone());
        let (tx, rx) = unbounded::<WorkerEvent>();

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(works.len());
        for (worker, work) in works.iter().enumerate() {
            debug!(
                worker,
                extranonce2 = %work.extranonce2,
                merkle_root = %work.merkle_root_display(),
                "Starting worker"
            );

            let mut task = work
                .search_task(token.clone())
                .with_strategy(self.settings.nonce_strategy)
                .with_check_interval(self.settings.check_interval)
                .with_hash_counter(counter.clone());
            if let Some(interval) = self.settings.time_roll {
                task = task.with_time_roll(interval, self.clock.clone());
            }

            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", worker))
                .spawn(move || {
                    let outcome = task.run();
                    // The receiver is gone only if the coordinator itself stopped
                    let _ = tx.send(WorkerEvent {
                        worker,
                        generation,
                        outcome,
                    });
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    token.cancel();
                    join_workers(workers);
                    return Err(CoordinatorError::Spawn {
                        name: format!("worker-{}", worker),
                        source,
                    });
                }
            }
        }
        drop(tx);

        let watchdog = match Watchdog::new(
            self.client.clone(),
            job.template().prev_hash,
            token.clone(),
            self.settings.watchdog_interval,
        )
        .spawn()
        {
            Ok(handle) => handle,
            Err(source) => {
                token.cancel();
                join_workers(workers);
                return Err(CoordinatorError::Spawn {
                    name: "watchdog".into(),
                    source,
                });
            }
        };

        let mut guard = SubmissionGuard::new(generation);
        let mut submitted: Option<CycleOutcome> = None;
        let mut last_report = Instant::now();

        // Runs until every worker has reported and dropped its sender
        loop {
            match rx.recv_timeout(POLL_TICK) {
                Ok(event) => {
                    if let Some(solution) = guard.claim(&event) {
                        token.cancel();
                        self.stats.blocks_found += 1;
                        info!(
                            worker = event.worker,
                            nonce = solution.nonce,
                            hash = %hash_to_display_hex(&solution.hash),
                            zeros = count_leading_zeros(&solution.hash),
                            attempts = solution.attempts,
                            "Worker found a solution"
                        );
                        submitted = Some(self.submit(job, &works[event.worker], solution));
                    } else if let SearchOutcome::Found(late) = &event.outcome {
                        debug!(
                            worker = event.worker,
                            nonce = late.nonce,
                            "Dropping late solution"
                        );
                    } else {
                        debug!(
                            worker = event.worker,
                            attempts = event.outcome.attempts(),
                            "Worker stopped"
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_cancelled() && token.cancel() {
                        info!(generation, "Shutdown requested, stopping workers");
                    }
                    if last_report.elapsed() >= self.settings.stats_interval {
                        info!(
                            generation,
                            rate = %format_hash_rate(meter.sample()),
                            attempts = meter.total(),
                            "Mining"
                        );
                        last_report = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        token.cancel();
        join_workers(workers);
        let watchdog_exit = match watchdog.join() {
            Ok(exit) => exit,
            Err(_) => {
                error!("Watchdog thread panicked");
                WatchdogExit::Cancelled
            }
        };

        let elapsed = meter.elapsed();
        let attempts = meter.total();
        self.stats.record_job(attempts, elapsed);
        info!(
            generation,
            attempts,
            elapsed = ?elapsed,
            rate = %format_hash_rate(attempts as f64 / elapsed.as_secs_f64().max(f64::EPSILON)),
            "Job finished"
        );

        Ok(match submitted {
            Some(outcome) => outcome,
            None if watchdog_exit == WatchdogExit::TipChanged => CycleOutcome::Stale,
            None if self.shutdown.is_cancelled() => CycleOutcome::Shutdown,
            None => CycleOutcome::Abandoned,
        })
    }

    fn submit(&self, job: &Job, work: &Work, solution: &Solution) -> CycleOutcome {
        let block = match job.assemble_block(work, solution) {
            Ok(block) => block,
            Err(e) => {
                error!(error = %e, "Cannot assemble block");
                return CycleOutcome::Abandoned;
            }
        };

        info!(
            height = job.height(),
            bytes = block.len(),
            "Submitting block"
        );

        match self.client.submit_block(&block) {
            Ok(SubmitResult::Accepted) => {
                info!(
                    height = job.height(),
                    hash = %hash_to_display_hex(&solution.hash),
                    "Block accepted"
                );
                CycleOutcome::Accepted
            }
            Ok(SubmitResult::Rejected(reason)) => {
                warn!(height = job.height(), %reason, "Block rejected");
                CycleOutcome::Rejected(reason)
            }
            Err(e) => {
                warn!(height = job.height(), error = %e, "Block submission failed");
                CycleOutcome::SubmitFailed
            }
        }
    }
}

fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MinerConfig;
    use crate::rpc::{BlockchainInfo, RpcError};
    use gbt_miner_core::block::BlockHeader;
    use gbt_miner_core::coinbase::encode_varint;
    use gbt_miner_core::difficulty::hash_meets_target;
    use gbt_miner_core::Network;
    use parking_lot::Mutex;

    const PREV_HASH: [u8; 32] = [7; 32];

    struct MockNode {
        template: BlockTemplate,
        template_failures: Mutex<usize>,
        tip: Mutex<[u8; 32]>,
        submitted: Mutex<Vec<Vec<u8>>>,
        reply: SubmitResult,
    }

    impl MockNode {
        fn new(bits: u32) -> Self {
            MockNode {
                template: BlockTemplate {
                    height: 101,
                    prev_hash: PREV_HASH,
                    version: 0x20000000,
                    bits,
                    curtime: 1_700_000_000,
                    coinbase_value: 5_000_000_000,
                    transactions: vec![],
                    witness_commitment: None,
                },
                template_failures: Mutex::new(0),
                tip: Mutex::new(PREV_HASH),
                submitted: Mutex::new(Vec::new()),
                reply: SubmitResult::Accepted,
            }
        }
    }

    impl NodeClient for MockNode {
        fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
            let mut failures = self.template_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(RpcError::EmptyResult("getblocktemplate"));
            }
            Ok(self.template.clone())
        }

        fn get_best_block_hash(&self) -> Result<[u8; 32], RpcError> {
            Ok(*self.tip.lock())
        }

        fn submit_block(&self, block: &[u8]) -> Result<SubmitResult, RpcError> {
            self.submitted.lock().push(block.to_vec());
            Ok(self.reply.clone())
        }

        fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
            Ok(BlockchainInfo {
                chain: "regtest".into(),
                blocks: 100,
                difficulty: 0.0,
            })
        }
    }

    fn settings(workers: usize) -> MinerSettings {
        let config = MinerConfig::from_json(&format!(
            r#"{{ "mining": {{ "payout_script": "51", "workers": {}, "time_roll_secs": null }} }}"#,
            workers
        ))
        .unwrap();
        let mut settings = config.validate(Network::Regtest).unwrap();
        settings.watchdog_interval = Duration::from_millis(10);
        settings.retry_delay = Duration::from_millis(10);
        settings
    }

    fn found(worker: usize, generation: u64, nonce: u32) -> WorkerEvent {
        WorkerEvent {
            worker,
            generation,
            outcome: SearchOutcome::Found(Solution {
                header: [0; 80],
                nonce,
                timestamp: 0,
                hash: [0; 32],
                attempts: 1,
                elapsed: Duration::ZERO,
            }),
        }
    }

    #[test]
    fn test_guard_admits_first_solution_only() {
        let mut guard = SubmissionGuard::new(3);

        let cancelled = WorkerEvent {
            worker: 0,
            generation: 3,
            outcome: SearchOutcome::Cancelled {
                attempts: 10,
                elapsed: Duration::ZERO,
            },
        };
        assert!(guard.claim(&cancelled).is_none());
        assert!(!guard.is_claimed());

        // A result from an older job never counts
        assert!(guard.claim(&found(1, 2, 5)).is_none());

        assert_eq!(guard.claim(&found(2, 3, 6)).map(|s| s.nonce), Some(6));
        assert!(guard.claim(&found(3, 3, 7)).is_none());
        assert!(guard.is_claimed());
    }

    #[test]
    fn test_cycle_submits_exactly_once() {
        // Regtest bits: about half of all hashes qualify, so several workers
        // find solutions before cancellation reaches them
        let node = Arc::new(MockNode::new(0x207fffff));
        let mut coordinator = Coordinator::new(node.clone(), settings(4), CancellationToken::new());

        let outcome = coordinator.run_cycle().unwrap();

        assert_eq!(outcome, CycleOutcome::Accepted);
        let submitted = node.submitted.lock();
        assert_eq!(submitted.len(), 1);

        let block = &submitted[0];
        let mut header = [0u8; 80];
        header.copy_from_slice(&block[..80]);
        let header = BlockHeader::deserialize(&header);
        assert_eq!(header.prev_block_hash, PREV_HASH);
        assert!(hash_meets_target(&header.hash(), &header.target()));

        let mut count = Vec::new();
        encode_varint(1, &mut count);
        assert_eq!(&block[80..81], &count[..]);

        assert_eq!(coordinator.stats().blocks_found, 1);
        assert_eq!(coordinator.stats().blocks_accepted, 1);
    }

    #[test]
    fn test_rejection_is_not_fatal() {
        let mut node = MockNode::new(0x207fffff);
        node.reply = SubmitResult::Rejected("duplicate".into());
        let node = Arc::new(node);
        let mut coordinator = Coordinator::new(node.clone(), settings(2), CancellationToken::new());

        assert_eq!(
            coordinator.run_cycle().unwrap(),
            CycleOutcome::Rejected("duplicate".into())
        );
        assert_eq!(coordinator.run_cycle().unwrap(), CycleOutcome::Rejected("duplicate".into()));
        assert_eq!(node.submitted.lock().len(), 2);
        assert_eq!(coordinator.stats().blocks_rejected, 2);
    }

    #[test]
    fn test_tip_change_makes_job_stale() {
        // Mainnet difficulty: nothing will be found in this test
        let node = Arc::new(MockNode::new(0x17034219));
        *node.tip.lock() = [8; 32];
        let mut coordinator = Coordinator::new(node.clone(), settings(2), CancellationToken::new());

        let outcome = coordinator.run_cycle().unwrap();

        assert_eq!(outcome, CycleOutcome::Stale);
        assert!(node.submitted.lock().is_empty());
        assert_eq!(coordinator.stats().stale_jobs, 1);
    }

    #[test]
    fn test_template_fetch_retries() {
        let node = MockNode::new(0x207fffff);
        *node.template_failures.lock() = 2;
        let node = Arc::new(node);
        let mut coordinator = Coordinator::new(node.clone(), settings(1), CancellationToken::new());

        assert_eq!(coordinator.run_cycle().unwrap(), CycleOutcome::Accepted);
        assert_eq!(*node.template_failures.lock(), 0);
    }

    #[test]
    fn test_shutdown_stops_running_job() {
        let node = Arc::new(MockNode::new(0x17034219));
        let shutdown = CancellationToken::new();
        let mut settings = settings(2);
        settings.watchdog_interval = Duration::from_secs(60);
        let mut coordinator = Coordinator::new(node.clone(), settings, shutdown.clone());

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shutdown.cancel();
        });

        let stats = coordinator.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(stats.jobs, 1);
        assert_eq!(stats.blocks_found, 0);
        assert!(node.submitted.lock().is_empty());
    }

    #[test]
    fn test_shutdown_before_start() {
        let node = Arc::new(MockNode::new(0x207fffff));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut coordinator = Coordinator::new(node.clone(), settings(1), shutdown);

        assert_eq!(coordinator.run_cycle().unwrap(), CycleOutcome::Shutdown);
        assert_eq!(coordinator.run().unwrap().jobs, 0);
    }
}
