//! Shared data model for the coindex storage engine.
//!
//! This crate defines the records persisted by `coindex-store`:
//! - Confirmed and pending coins (UTXOs), partitioned by output shape.
//! - Spend descriptors produced by block/mempool ingestion.
//! - Payload records for chains that attach data hints to outputs.
//! - Block info, chain identity and the runtime configuration surface.
//!
//! Nothing here touches storage; the types are plain `serde`-serializable
//! values shared between the store and its callers.

mod amount;
mod config;
mod pending_id;

pub use amount::parse_decimal_amount;
pub use config::{ChainTraits, Config};
pub use pending_id::{pending_id_timestamp, PendingIdGenerator};

use serde::{Deserialize, Serialize};

/// A confirmed unspent transaction output.
///
/// Identity on the chain is `(tx_id, pos)`; the storage identity (`i64`
/// sequence value) is assigned by the store when the coin is appended.
/// `addresses` holds zero entries for the no-address partition, exactly one
/// for the addressed partition and the full signer set for multisig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Transaction ID containing this output, as hex.
    pub tx_id: String,
    /// Output index within the transaction.
    pub pos: u32,
    /// Value in atomic units (satoshis or the chain's equivalent).
    pub value: i64,
    /// Block height where this output was created.
    pub height: u32,
    /// Locking script, opaque to the store.
    pub script: String,
    /// Resolved address(es), shape-dependent.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// A mempool-mirror coin: an output of an unconfirmed transaction.
///
/// No height; the transaction is not in a block yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCoin {
    pub tx_id: String,
    pub pos: u32,
    pub value: i64,
    pub script: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// A mempool-mirror spend: an input of an unconfirmed transaction,
/// referencing the coin `(spent_tx_id, pos)` it is about to consume.
///
/// In `resolve_spending` mode the record carries the spent coin's address
/// shape and creation height, enabling address-level queries over in-flight
/// spends. In bare mode only the reference triple is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSpend {
    /// The unconfirmed transaction doing the spending.
    pub tx_id: String,
    /// Transaction ID of the coin being consumed.
    pub spent_tx_id: String,
    /// Output index of the coin being consumed.
    pub pos: u32,
    /// Creation height of the coin being consumed.
    pub height: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// A spend observed in a confirmed block, used to drive the archive
/// protocol: the referenced coin is atomically removed from its partition
/// and preserved in the spent-coin archive until the reorg window passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendDescriptor {
    /// The confirmed transaction doing the spending.
    pub tx_id: String,
    /// Transaction ID of the coin being consumed.
    pub spent_tx_id: String,
    /// Output index of the coin being consumed.
    pub pos: u32,
    /// Height of the block containing the spending transaction.
    pub height: u32,
}

/// A data payload attached to an output, for chains supporting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub tx_id: String,
    pub pos: u32,
    pub address: String,
    pub hint: String,
    #[serde(default)]
    pub subhint: Option<String>,
    pub height: u32,
}

/// Mempool-mirror counterpart of [`Payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPayload {
    pub tx_id: String,
    pub pos: u32,
    pub address: String,
    pub hint: String,
    #[serde(default)]
    pub subhint: Option<String>,
}

/// An archived raw block record, retained for the reorg window and used to
/// replay blocks during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupBlock {
    pub height: u32,
    pub hash: String,
    /// Raw block record, opaque to the store.
    pub data: String,
}

/// Identity of a recorded block, persisted as a fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u32,
    pub hash: String,
    /// Block timestamp, Unix seconds.
    pub time: i64,
}

/// The chain a physical ledger belongs to. Immutable once set; reopening a
/// ledger under a different identity is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIdentity {
    pub coin: String,
    pub network: String,
}

/// Severity of a persisted event-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
}

impl LogLevel {
    pub fn as_i64(self) -> i64 {
        self as u8 as i64
    }
}
