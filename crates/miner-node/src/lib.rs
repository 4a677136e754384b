//! Runtime for the `gbt-miner` binary: node RPC, configuration, logging and
//! the job loop that drives the search threads.

pub mod config;
pub mod coordinator;
pub mod rpc;
pub mod stats;
pub mod tracing;
pub mod watchdog;
