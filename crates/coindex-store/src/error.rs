//! Error types for the storage engine.

use coindex_primitives::ChainIdentity;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization of a stored value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Recorded schema version does not match this build and no upgrade was
    /// requested. Fatal: the process must not proceed.
    #[error(
        "database version mismatch: expected {expected}, found {found}; run an upgrade first"
    )]
    VersionMismatch { expected: u32, found: u32 },

    /// The ledger on disk belongs to a different chain. Fatal.
    #[error(
        "chain identity mismatch: ledger records {recorded_coin}/{recorded_network}, \
         configured {configured_coin}/{configured_network}"
    )]
    ChainIdentityMismatch {
        recorded_coin: String,
        recorded_network: String,
        configured_coin: String,
        configured_network: String,
    },

    /// Recorded schema version is newer than anything this build knows.
    #[error("unsupported database version {0}")]
    UnsupportedVersion(u32),

    /// A partition disabled by configuration was addressed.
    #[error("the {0} partition is disabled by configuration")]
    PartitionDisabled(&'static str),

    /// A legacy row could not be transformed during migration.
    #[error("malformed legacy record {table}[{id}]: {reason}")]
    MalformedLegacyRecord {
        table: &'static str,
        id: i64,
        reason: String,
    },
}

impl Error {
    pub(crate) fn chain_identity_mismatch(
        recorded: &ChainIdentity,
        configured: &ChainIdentity,
    ) -> Self {
        Self::ChainIdentityMismatch {
            recorded_coin: recorded.coin.clone(),
            recorded_network: recorded.network.clone(),
            configured_coin: configured.coin.clone(),
            configured_network: configured.network.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
