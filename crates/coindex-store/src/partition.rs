//! Shape partitions of the coin tables.
//!
//! Every output lands in exactly one of three partitions depending on how
//! its locking script resolved: a single address, a multisig signer set, or
//! no address at all. The partition is a closed enum carrying the table
//! names and DDL for its confirmed table and its pending mirrors; which
//! partitions are active is resolved once when the store is opened.

use coindex_primitives::ChainTraits;

/// A coin shape partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoinPartition {
    /// Outputs resolving to a single address.
    Addressed,
    /// Outputs locked by a multisig script.
    Multisig,
    /// Outputs with no resolvable address.
    NoAddress,
}

impl CoinPartition {
    pub const ALL: [CoinPartition; 3] = [
        CoinPartition::Addressed,
        CoinPartition::Multisig,
        CoinPartition::NoAddress,
    ];

    /// Confirmed coin table.
    pub fn table(self) -> &'static str {
        match self {
            CoinPartition::Addressed => "coins",
            CoinPartition::Multisig => "coins_multisig",
            CoinPartition::NoAddress => "coins_noaddr",
        }
    }

    /// Mempool-mirror coin table.
    pub fn pending_table(self) -> &'static str {
        match self {
            CoinPartition::Addressed => "pending_coins",
            CoinPartition::Multisig => "pending_coins_multisig",
            CoinPartition::NoAddress => "pending_coins_noaddr",
        }
    }

    /// Mempool-mirror spend table (`resolve_spending` mode only).
    pub fn pending_spends_table(self) -> &'static str {
        match self {
            CoinPartition::Addressed => "pending_spents",
            CoinPartition::Multisig => "pending_spents_multisig",
            CoinPartition::NoAddress => "pending_spents_noaddr",
        }
    }

    /// Tag stored in the spent-coin archive identifying the partition a coin
    /// was removed from. Part of the on-disk format; do not renumber.
    pub fn archive_tag(self) -> i64 {
        match self {
            CoinPartition::Addressed => 0,
            CoinPartition::Multisig => 1,
            CoinPartition::NoAddress => 2,
        }
    }

    pub fn from_archive_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(CoinPartition::Addressed),
            1 => Some(CoinPartition::Multisig),
            2 => Some(CoinPartition::NoAddress),
            _ => None,
        }
    }

    /// DDL for the confirmed table and its indexes.
    ///
    /// The `(tx_id, pos)` index is unique everywhere except the addressed
    /// partition on chains whose pre-activation coinbases may repeat a
    /// `(tx_id, pos)` pair; there `traits.unique_coinbase_txids` relaxes it.
    pub fn confirmed_ddl(self, traits: &ChainTraits) -> String {
        match self {
            CoinPartition::Addressed => {
                let unique = if traits.unique_coinbase_txids {
                    "UNIQUE "
                } else {
                    ""
                };
                format!(
                    "CREATE TABLE IF NOT EXISTS coins (
                        id INTEGER PRIMARY KEY,
                        tx_id TEXT NOT NULL,
                        pos INTEGER NOT NULL,
                        address TEXT NOT NULL,
                        value INTEGER NOT NULL,
                        height INTEGER NOT NULL,
                        script TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_coins_addr ON coins(address);
                    CREATE INDEX IF NOT EXISTS idx_coins_height ON coins(height);
                    CREATE {unique}INDEX IF NOT EXISTS idx_coins_xo ON coins(tx_id, pos);"
                )
            }
            CoinPartition::Multisig => "CREATE TABLE IF NOT EXISTS coins_multisig (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    addresses TEXT NOT NULL,
                    value INTEGER NOT NULL,
                    height INTEGER NOT NULL,
                    script TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_coins_multisig_addr ON coins_multisig(addresses);
                CREATE INDEX IF NOT EXISTS idx_coins_multisig_height ON coins_multisig(height);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_coins_multisig_xo ON coins_multisig(tx_id, pos);"
                .to_string(),
            CoinPartition::NoAddress => "CREATE TABLE IF NOT EXISTS coins_noaddr (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    value INTEGER NOT NULL,
                    height INTEGER NOT NULL,
                    script TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_coins_noaddr_height ON coins_noaddr(height);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_coins_noaddr_xo ON coins_noaddr(tx_id, pos);"
                .to_string(),
        }
    }

    /// DDL for the pending coin mirror.
    pub fn pending_ddl(self) -> &'static str {
        match self {
            CoinPartition::Addressed => {
                "CREATE TABLE IF NOT EXISTS pending_coins (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    address TEXT NOT NULL,
                    value INTEGER NOT NULL,
                    script TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_coins_addr ON pending_coins(address);
                CREATE INDEX IF NOT EXISTS idx_pending_coins_tx ON pending_coins(tx_id);"
            }
            CoinPartition::Multisig => {
                "CREATE TABLE IF NOT EXISTS pending_coins_multisig (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    addresses TEXT NOT NULL,
                    value INTEGER NOT NULL,
                    script TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_coins_multisig_addr
                    ON pending_coins_multisig(addresses);
                CREATE INDEX IF NOT EXISTS idx_pending_coins_multisig_tx
                    ON pending_coins_multisig(tx_id);"
            }
            CoinPartition::NoAddress => {
                "CREATE TABLE IF NOT EXISTS pending_coins_noaddr (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    value INTEGER NOT NULL,
                    script TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_coins_noaddr_tx
                    ON pending_coins_noaddr(tx_id);"
            }
        }
    }

    /// DDL for the pending spend mirror (`resolve_spending` mode).
    pub fn pending_spends_ddl(self) -> &'static str {
        match self {
            CoinPartition::Addressed => {
                "CREATE TABLE IF NOT EXISTS pending_spents (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    spent_tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    height INTEGER NOT NULL,
                    address TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_spents_addr ON pending_spents(address);
                CREATE INDEX IF NOT EXISTS idx_pending_spents_height ON pending_spents(height);
                CREATE INDEX IF NOT EXISTS idx_pending_spents_tx ON pending_spents(tx_id);"
            }
            CoinPartition::Multisig => {
                "CREATE TABLE IF NOT EXISTS pending_spents_multisig (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    spent_tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    height INTEGER NOT NULL,
                    addresses TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_spents_multisig_addr
                    ON pending_spents_multisig(addresses);
                CREATE INDEX IF NOT EXISTS idx_pending_spents_multisig_height
                    ON pending_spents_multisig(height);
                CREATE INDEX IF NOT EXISTS idx_pending_spents_multisig_tx
                    ON pending_spents_multisig(tx_id);"
            }
            CoinPartition::NoAddress => {
                "CREATE TABLE IF NOT EXISTS pending_spents_noaddr (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    spent_tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    height INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_spents_noaddr_height
                    ON pending_spents_noaddr(height);
                CREATE INDEX IF NOT EXISTS idx_pending_spents_noaddr_tx
                    ON pending_spents_noaddr(tx_id);"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_tags_roundtrip() {
        for partition in CoinPartition::ALL {
            assert_eq!(
                CoinPartition::from_archive_tag(partition.archive_tag()),
                Some(partition)
            );
        }
        assert_eq!(CoinPartition::from_archive_tag(3), None);
    }

    #[test]
    fn addressed_uniqueness_follows_chain_traits() {
        let strict = ChainTraits {
            unique_coinbase_txids: true,
            ..ChainTraits::default()
        };
        let lax = ChainTraits {
            unique_coinbase_txids: false,
            ..ChainTraits::default()
        };
        assert!(CoinPartition::Addressed
            .confirmed_ddl(&strict)
            .contains("UNIQUE INDEX IF NOT EXISTS idx_coins_xo"));
        assert!(!CoinPartition::Addressed
            .confirmed_ddl(&lax)
            .contains("UNIQUE INDEX IF NOT EXISTS idx_coins_xo"));
    }
}
