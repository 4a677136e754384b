//! Stale work detection.
//!
//! One watchdog thread runs per job. It polls the node's best block hash and
//! cancels the job's token the first time the tip differs from the one the
//! job was built on.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gbt_miner_core::hash::hash_to_display_hex;
use gbt_miner_core::CancellationToken;

use crate::rpc::NodeClient;
use crate::tracing::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// The tip moved and this watchdog cancelled the job.
    TipChanged,
    /// The job ended for another reason.
    Cancelled,
}

pub struct Watchdog {
    client: Arc<dyn NodeClient>,
    tip: [u8; 32],
    token: CancellationToken,
    interval: Duration,
}

impl Watchdog {
    /// Watch for the chain moving past `tip`.
    pub fn new(
        client: Arc<dyn NodeClient>,
        tip: [u8; 32],
        token: CancellationToken,
        interval: Duration,
    ) -> Self {
        Watchdog {
            client,
            tip,
            token,
            interval,
        }
    }

    /// Poll the node once. Returns `Some` when the watchdog is done.
    pub fn check(&self) -> Option<WatchdogExit> {
        match self.client.get_best_block_hash() {
            Ok(tip) if tip != self.tip => {
                if self.token.cancel() {
                    info!(
                        old = %hash_to_display_hex(&self.tip),
                        new = %hash_to_display_hex(&tip),
                        "New block on the network, abandoning job"
                    );
                    Some(WatchdogExit::TipChanged)
                } else {
                    Some(WatchdogExit::Cancelled)
                }
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Watchdog failed to fetch best block hash");
                None
            }
        }
    }

    /// Poll every interval until the tip changes or the token is cancelled.
    pub fn run(self) -> WatchdogExit {
        loop {
            if self.token.wait_timeout(self.interval) {
                return WatchdogExit::Cancelled;
            }
            if let Some(exit) = self.check() {
                return exit;
            }
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<WatchdogExit>> {
        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{BlockchainInfo, RpcError, SubmitResult};
    use gbt_miner_core::BlockTemplate;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Replays a fixed sequence of tips, repeating the last one.
    struct ScriptedTips {
        tips: Mutex<VecDeque<Option<[u8; 32]>>>,
        polls: Mutex<usize>,
    }

    impl ScriptedTips {
        fn new(tips: Vec<Option<[u8; 32]>>) -> Arc<Self> {
            Arc::new(ScriptedTips {
                tips: Mutex::new(tips.into()),
                polls: Mutex::new(0),
            })
        }
    }

    impl NodeClient for ScriptedTips {
        fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
            Err(RpcError::EmptyResult("getblocktemplate"))
        }

        fn get_best_block_hash(&self) -> Result<[u8; 32], RpcError> {
            *self.polls.lock() += 1;
            let mut tips = self.tips.lock();
            let tip = if tips.len() > 1 {
                tips.pop_front().flatten()
            } else {
                tips.front().copied().flatten()
            };
            tip.ok_or(RpcError::EmptyResult("getbestblockhash"))
        }

        fn submit_block(&self, _block: &[u8]) -> Result<SubmitResult, RpcError> {
            Ok(SubmitResult::Accepted)
        }

        fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
            Err(RpcError::EmptyResult("getblockchaininfo"))
        }
    }

    #[test]
    fn test_tip_change_cancels_once() {
        let client = ScriptedTips::new(vec![Some([1; 32]), None, Some([2; 32])]);
        let token = CancellationToken::new();
        let watchdog =
            Watchdog::new(client.clone(), [1; 32], token.clone(), Duration::from_millis(1));

        // Same tip, then a transport error: keep watching
        assert_eq!(watchdog.check(), None);
        assert_eq!(watchdog.check(), None);
        assert!(!token.is_cancelled());

        assert_eq!(watchdog.check(), Some(WatchdogExit::TipChanged));
        assert!(token.is_cancelled());

        // Token already set by us, a second detection is not a second cancel
        assert_eq!(watchdog.check(), Some(WatchdogExit::Cancelled));
    }

    #[test]
    fn test_thread_stops_on_tip_change() {
        let client = ScriptedTips::new(vec![Some([1; 32]), Some([1; 32]), Some([9; 32])]);
        let token = CancellationToken::new();

        let handle = Watchdog::new(client.clone(), [1; 32], token.clone(), Duration::from_millis(5))
            .spawn()
            .unwrap();

        assert_eq!(handle.join().unwrap(), WatchdogExit::TipChanged);
        assert!(token.is_cancelled());
        assert_eq!(*client.polls.lock(), 3);
    }

    #[test]
    fn test_thread_exits_promptly_when_job_cancelled() {
        let client = ScriptedTips::new(vec![Some([1; 32])]);
        let token = CancellationToken::new();

        let handle = Watchdog::new(client.clone(), [1; 32], token.clone(), Duration::from_secs(60))
            .spawn()
            .unwrap();

        let start = Instant::now();
        token.cancel();

        assert_eq!(handle.join().unwrap(), WatchdogExit::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(*client.polls.lock(), 0);
    }
}
