//! Mining jobs.
//!
//! A [`Job`] binds one template to everything that stays fixed while it is
//! searched: the target, extranonce1, the payout script and the coinbase
//! Merkle branch. Each worker derives its own [`Work`] from the job with a
//! distinct extranonce2, so no mutable state is shared between workers.

use thiserror::Error;
use tracing::debug;

use crate::block::{serialize_block, BlockError, BlockHeader};
use crate::coinbase::{CoinbaseBuilder, CoinbaseError, CoinbaseTransaction};
use crate::difficulty::{effective_target, target_to_difficulty};
use crate::extranonce::{Extranonce1, Extranonce2, Extranonce2Error};
use crate::hash::hash_to_display_hex;
use crate::merkle::{coinbase_branch, MerkleBranch};
use crate::network::Network;
use crate::search::{CancellationToken, SearchTask, Solution};
use crate::template::BlockTemplate;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("coinbase: {0}")]
    Coinbase(#[from] CoinbaseError),

    #[error("extranonce: {0}")]
    Extranonce(#[from] Extranonce2Error),

    #[error("extranonce2 is {actual} bytes but this job uses {expected}")]
    ExtranonceSize { expected: u8, actual: u8 },

    #[error("block: {0}")]
    Block(#[from] BlockError),
}

/// Settings that shape every job, independent of the template.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    pub network: Network,
    pub payout_script: Vec<u8>,
    pub message: Vec<u8>,
    pub extranonce1: Extranonce1,
    pub extranonce2_size: u8,
    /// Only honoured where the network allows overriding difficulty.
    pub difficulty_factor: Option<f64>,
}

/// A template prepared for searching.
#[derive(Debug, Clone)]
pub struct Job {
    generation: u64,
    template: BlockTemplate,
    target: [u8; 32],
    payout_script: Vec<u8>,
    message: Vec<u8>,
    extranonce1: Extranonce1,
    extranonce2_size: u8,
    branch: MerkleBranch,
}

impl Job {
    /// Prepare `template` as job number `generation`.
    ///
    /// Builds one trial coinbase so that a scriptSig that cannot fit fails
    /// here rather than in every worker.
    pub fn new(
        generation: u64,
        template: BlockTemplate,
        params: &JobParams,
    ) -> Result<Self, JobError> {
        let target = effective_target(template.bits, params.difficulty_factor, params.network);
        let branch = coinbase_branch(&template.txids());

        let job = Job {
            generation,
            template,
            target,
            payout_script: params.payout_script.clone(),
            message: params.message.clone(),
            extranonce1: params.extranonce1.clone(),
            extranonce2_size: params.extranonce2_size,
            branch,
        };

        job.coinbase(&Extranonce2::new(0, params.extranonce2_size)?)?;

        debug!(
            generation,
            height = job.template.height,
            transactions = job.template.transactions.len(),
            difficulty = target_to_difficulty(&job.target),
            "Prepared job"
        );

        Ok(job)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn template(&self) -> &BlockTemplate {
        &self.template
    }

    pub fn height(&self) -> u32 {
        self.template.height
    }

    /// Big-endian target the header hash must fall below.
    pub fn target(&self) -> [u8; 32] {
        self.target
    }

    pub fn extranonce1(&self) -> &Extranonce1 {
        &self.extranonce1
    }

    pub fn coinbase_branch(&self) -> &MerkleBranch {
        &self.branch
    }

    fn coinbase(&self, extranonce2: &Extranonce2) -> Result<CoinbaseTransaction, CoinbaseError> {
        CoinbaseBuilder::new(
            self.template.height,
            self.template.coinbase_value,
            self.payout_script.clone(),
        )
        .with_message(self.message.clone())
        .with_witness_commitment(self.template.witness_commitment)
        .with_extranonce(&self.extranonce1, extranonce2)
        .build()
    }

    /// Derive the coinbase, Merkle root and header for one extranonce2.
    pub fn work(&self, extranonce2: Extranonce2) -> Result<Work, JobError> {
        if extranonce2.size() != self.extranonce2_size {
            return Err(JobError::ExtranonceSize {
                expected: self.extranonce2_size,
                actual: extranonce2.size(),
            });
        }

        let coinbase = self.coinbase(&extranonce2)?;
        let merkle_root = self.branch.root(&coinbase.txid());
        let header = BlockHeader::new(
            self.template.version,
            self.template.prev_hash,
            merkle_root,
            self.template.curtime,
            self.template.bits,
        );

        Ok(Work {
            generation: self.generation,
            extranonce2,
            coinbase,
            merkle_root,
            header,
            target: self.target,
        })
    }

    /// Serialize the block for a solution found on `work`.
    pub fn assemble_block(&self, work: &Work, solution: &Solution) -> Result<Vec<u8>, JobError> {
        Ok(serialize_block(
            &solution.header,
            &work.coinbase,
            &self.template.transactions,
        )?)
    }
}

/// One worker's share of a job.
#[derive(Debug, Clone)]
pub struct Work {
    pub generation: u64,
    pub extranonce2: Extranonce2,
    pub coinbase: CoinbaseTransaction,
    pub merkle_root: [u8; 32],
    pub header: BlockHeader,
    pub target: [u8; 32],
}

impl Work {
    /// A search over this work's header, not yet started.
    pub fn search_task(&self, token: CancellationToken) -> SearchTask {
        SearchTask::new(self.header.serialize(), self.target, token)
    }

    pub fn merkle_root_display(&self) -> String {
        hash_to_display_hex(&self.merkle_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::encode_varint;
    use crate::difficulty::{bits_to_target, scale_target};
    use crate::extranonce::ExtranonceAllocator;
    use crate::hash::double_sha256;
    use crate::merkle::compute_merkle_root;
    use crate::search::{NonceStrategy, SearchOutcome};
    use crate::template::TemplateTransaction;
    use std::collections::HashSet;

    fn template(transactions: Vec<TemplateTransaction>) -> BlockTemplate {
        BlockTemplate {
            height: 850_000,
            prev_hash: [0x5A; 32],
            version: 0x20000000,
            bits: 0x17034219,
            curtime: 1_718_000_000,
            coinbase_value: 312_500_000,
            transactions,
            witness_commitment: None,
        }
    }

    fn params(network: Network, difficulty_factor: Option<f64>) -> JobParams {
        JobParams {
            network,
            payout_script: hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap(),
            message: b"/gbt-miner/".to_vec(),
            extranonce1: Extranonce1::from_hex("1234567890abcdef").unwrap(),
            extranonce2_size: 4,
            difficulty_factor,
        }
    }

    fn transactions(count: u8) -> Vec<TemplateTransaction> {
        (1..=count)
            .map(|i| {
                let data = vec![i; 60];
                TemplateTransaction {
                    txid: double_sha256(&data),
                    data,
                }
            })
            .collect()
    }

    #[test]
    fn test_work_commits_to_coinbase_and_transactions() {
        let job = Job::new(1, template(transactions(5)), &params(Network::Mainnet, None)).unwrap();
        let work = job.work(Extranonce2::new(7, 4).unwrap()).unwrap();

        let mut txids = vec![work.coinbase.txid()];
        txids.extend(job.template().txids());

        assert_eq!(work.merkle_root, compute_merkle_root(&txids));
        assert_eq!(work.header.merkle_root, work.merkle_root);
        assert_eq!(work.header.prev_block_hash, [0x5A; 32]);
        assert_eq!(work.header.version, 0x20000000);
        assert_eq!(work.header.nonce, 0);
        assert_eq!(work.generation, 1);
    }

    #[test]
    fn test_workers_get_distinct_merkle_roots() {
        let job = Job::new(1, template(transactions(3)), &params(Network::Mainnet, None)).unwrap();
        let allocator = ExtranonceAllocator::from_hex("12341234", 4).unwrap();

        let roots: HashSet<[u8; 32]> = allocator
            .allocate(16)
            .unwrap()
            .into_iter()
            .map(|ext2| job.work(ext2).unwrap().merkle_root)
            .collect();

        assert_eq!(roots.len(), 16);
    }

    #[test]
    fn test_extranonce2_width_is_fixed_per_job() {
        let job = Job::new(1, template(vec![]), &params(Network::Mainnet, None)).unwrap();
        let result = job.work(Extranonce2::new(1, 8).unwrap());
        assert_eq!(
            result.unwrap_err(),
            JobError::ExtranonceSize { expected: 4, actual: 8 }
        );
    }

    #[test]
    fn test_oversized_script_sig_fails_job() {
        let mut params = params(Network::Mainnet, None);
        params.message = vec![b'x'; 95];

        let result = Job::new(1, template(vec![]), &params);
        assert!(matches!(
            result,
            Err(JobError::Coinbase(CoinbaseError::ScriptSigTooLarge(_)))
        ));
    }

    #[test]
    fn test_difficulty_override_only_on_regtest() {
        let template_target = bits_to_target(0x17034219);

        let mainnet = Job::new(1, template(vec![]), &params(Network::Mainnet, Some(8.0))).unwrap();
        assert_eq!(mainnet.target(), template_target);

        let regtest = Job::new(1, template(vec![]), &params(Network::Regtest, Some(8.0))).unwrap();
        assert_eq!(regtest.target(), scale_target(&template_target, 8.0));
        assert!(regtest.target() < template_target);

        let same = Job::new(1, template(vec![]), &params(Network::Regtest, Some(1.0))).unwrap();
        assert_eq!(same.target(), template_target);
    }

    #[test]
    fn test_witness_block_carries_witness_coinbase() {
        let mut template = template(transactions(1));
        template.witness_commitment = Some([0xAB; 32]);
        let job = Job::new(1, template, &params(Network::Mainnet, None)).unwrap();
        let work = job.work(Extranonce2::new(3, 4).unwrap()).unwrap();
        let witness = work.coinbase.witness_tx().unwrap().to_vec();

        let solution = Solution {
            header: work.header.serialize(),
            nonce: 0,
            timestamp: work.header.timestamp,
            hash: work.header.hash(),
            attempts: 1,
            elapsed: std::time::Duration::ZERO,
        };
        let block = job.assemble_block(&work, &solution).unwrap();

        assert_eq!(block[80], 2);
        let coinbase_end = 81 + witness.len();
        let coinbase = &block[81..coinbase_end];
        assert_eq!(coinbase, &witness[..]);
        // BIP144 marker and flag after the version
        assert_eq!(&coinbase[4..6], &[0x00, 0x01]);
        assert_ne!(coinbase, work.coinbase.raw_tx());

        // The header commits the legacy txid, not the witness serialization
        let header = BlockHeader::deserialize(&solution.header);
        let legacy_txid = double_sha256(work.coinbase.raw_tx());
        assert_eq!(work.coinbase.txid(), legacy_txid);
        assert_eq!(header.merkle_root, job.coinbase_branch().root(&legacy_txid));
        assert_ne!(header.merkle_root, job.coinbase_branch().root(&double_sha256(&witness)));

        assert_eq!(&block[coinbase_end..], &job.template().transactions[0].data[..]);
    }

    #[test]
    fn test_end_to_end_nonce_zero() {
        let mut params = params(Network::Regtest, None);
        params.message.clear();
        let job = Job::new(1, template(vec![]), &params).unwrap();

        let mut work = job.work(Extranonce2::from_hex("12341234", 4).unwrap()).unwrap();
        // Everything passes this target
        work.target = [0xFF; 32];

        let mut task = work
            .search_task(CancellationToken::new())
            .with_strategy(NonceStrategy::Incremental);
        let SearchOutcome::Found(solution) = task.run() else {
            panic!("any hash meets the target");
        };
        assert_eq!(solution.nonce, 0);
        assert_eq!(solution.attempts, 1);
        assert_eq!(solution.header, work.header.serialize());

        let block = job.assemble_block(&work, &solution).unwrap();

        let mut expected = solution.header.to_vec();
        encode_varint(1, &mut expected);
        expected.extend_from_slice(work.coinbase.raw_tx());
        assert_eq!(block, expected);

        // Coinbase-only block: the merkle root is the coinbase txid
        assert_eq!(work.merkle_root, work.coinbase.txid());
    }

    #[test]
    fn test_assemble_rejects_foreign_work() {
        let job = Job::new(1, template(transactions(2)), &params(Network::Mainnet, None)).unwrap();
        let work = job.work(Extranonce2::new(1, 4).unwrap()).unwrap();
        let other = job.work(Extranonce2::new(2, 4).unwrap()).unwrap();

        let solution = Solution {
            header: work.header.serialize(),
            nonce: 0,
            timestamp: work.header.timestamp,
            hash: work.header.hash(),
            attempts: 1,
            elapsed: std::time::Duration::ZERO,
        };

        assert!(job.assemble_block(&work, &solution).is_ok());
        assert!(matches!(
            job.assemble_block(&other, &solution),
            Err(JobError::Block(BlockError::StaleCoinbase { .. }))
        ));
    }
}
