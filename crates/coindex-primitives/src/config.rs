//! Runtime configuration for a ledger instance.

use serde::{Deserialize, Serialize};

/// Consensus-level quirks of the indexed chain that affect storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTraits {
    /// Atomic units per whole coin, used when rescaling legacy decimal
    /// amounts during migration.
    pub sat_per_coin: u64,
    /// Whether `(tx_id, pos)` is unique in the addressed partition. Chains
    /// that allowed identical coinbase transactions before the relevant
    /// activation height must set this to `false`, which relaxes the
    /// uniqueness constraint on that partition only.
    pub unique_coinbase_txids: bool,
}

impl Default for ChainTraits {
    fn default() -> Self {
        Self {
            sat_per_coin: 100_000_000,
            unique_coinbase_txids: true,
        }
    }
}

/// Recognized configuration surface of the storage engine.
///
/// Construct via deserialization or field init, then call [`Config::sanitize`]
/// to apply the documented floors before handing it to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chain identity label, e.g. "bitcoin". Immutable once a ledger exists.
    pub coin: String,
    /// Network label, e.g. "mainnet". Immutable once a ledger exists.
    pub network: String,
    /// Record pending spends as three shape-partitioned tables carrying
    /// address and height (`true`), or as one bare reference table (`false`).
    pub resolve_spending: bool,
    /// Maintain the multisig coin partition and its pending mirrors.
    pub support_multisig: bool,
    /// Maintain the payload partitions.
    pub support_payload: bool,
    /// Ingestion batch size, also the V2→V3 migration window. Floor 1.
    pub batch_blocks: usize,
    /// Identity-widening migration window. Floor 1.
    pub batch_upgrade_size: usize,
    /// Minimum age, in seconds, before a pending spend may be judged
    /// rejected. Floor 3600.
    pub min_pending_time: u64,
    pub traits: ChainTraits,
}

const MIN_PENDING_TIME_FLOOR: u64 = 3600;

impl Default for Config {
    fn default() -> Self {
        Self {
            coin: String::new(),
            network: String::new(),
            resolve_spending: true,
            support_multisig: true,
            support_payload: false,
            batch_blocks: 100,
            batch_upgrade_size: 100,
            min_pending_time: MIN_PENDING_TIME_FLOOR,
            traits: ChainTraits::default(),
        }
    }
}

impl Config {
    /// Apply the documented floors: batch sizes at least 1, pending age at
    /// least one hour.
    pub fn sanitize(mut self) -> Self {
        if self.batch_blocks < 1 {
            self.batch_blocks = 1;
        }
        if self.batch_upgrade_size < 1 {
            self.batch_upgrade_size = 100;
        }
        if self.min_pending_time < MIN_PENDING_TIME_FLOOR {
            self.min_pending_time = MIN_PENDING_TIME_FLOOR;
        }
        self
    }
}
