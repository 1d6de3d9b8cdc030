//! SQLite-backed persistence layer for a blockchain UTXO indexer.
//!
//! This crate maintains a reorg-safe mirror of a chain's unspent-output set
//! and a speculative mirror of unconfirmed (mempool) transactions:
//! - Three shape-partitioned confirmed coin tables with independent,
//!   monotonically increasing identity sequences.
//! - A spent-coin archive and block archive making coin removal reversible
//!   for the expected reorganization depth.
//! - Pending-transaction mirrors plus a rejection sweep that detects and
//!   evicts transactions that will never confirm.
//! - A batched, resumable schema-migration engine that survives process
//!   crashes mid-migration.
//!
//! The design assumes a single writer process per physical ledger; see the
//! individual module docs for the concurrency contracts.

mod backup;
mod db;
mod error;
mod ledger;
mod mempool;
mod migrate;
mod partition;
mod sweep;

pub use db::CoinStore;
pub use error::{Error, Result};
pub use migrate::{StopHandle, DB_VERSION_V1, DB_VERSION_V2, DB_VERSION_V3, LATEST_DB_VERSION};
pub use partition::CoinPartition;
pub use sweep::SweepOutcome;
