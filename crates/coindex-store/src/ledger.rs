//! Confirmed UTXO partitions.
//!
//! Each partition owns a private, monotonically increasing identity
//! sequence backed by the `sequences` table. A block of identities is
//! reserved with a single atomic upsert, so identities are never reused
//! even across a crash-and-resume of a batch insert; sequences of different
//! partitions are independent and not comparable.

use crate::db::CoinStore;
use crate::error::Result;
use crate::partition::CoinPartition;
use coindex_primitives::{Coin, Payload};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::Sqlite;

/// A coin together with its storage identity, as archived and restored by
/// the backup engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredCoin {
    pub id: i64,
    #[serde(flatten)]
    pub coin: Coin,
}

/// Reserve `count` identities from the named sequence; returns the last
/// reserved value (the first is `last - count + 1`). One atomic statement,
/// no read-modify-write window.
pub(crate) async fn reserve_ids<'e, E>(executor: E, sequence: &str, count: i64) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (last,): (i64,) = sqlx::query_as(
        "INSERT INTO sequences (name, last_id) VALUES (?, ?)
         ON CONFLICT(name) DO UPDATE SET last_id = last_id + excluded.last_id
         RETURNING last_id",
    )
    .bind(sequence)
    .bind(count)
    .fetch_one(executor)
    .await?;
    Ok(last)
}

/// Insert one coin row with an explicit identity.
pub(crate) async fn insert_coin_row<'e, E>(
    executor: E,
    partition: CoinPartition,
    id: i64,
    coin: &Coin,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    match partition {
        CoinPartition::Addressed => {
            sqlx::query(
                "INSERT INTO coins (id, tx_id, pos, address, value, height, script)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&coin.tx_id)
            .bind(i64::from(coin.pos))
            .bind(coin.addresses.first().map(String::as_str).unwrap_or(""))
            .bind(coin.value)
            .bind(i64::from(coin.height))
            .bind(&coin.script)
            .execute(executor)
            .await?;
        }
        CoinPartition::Multisig => {
            sqlx::query(
                "INSERT INTO coins_multisig (id, tx_id, pos, addresses, value, height, script)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&coin.tx_id)
            .bind(i64::from(coin.pos))
            .bind(serde_json::to_string(&coin.addresses)?)
            .bind(coin.value)
            .bind(i64::from(coin.height))
            .bind(&coin.script)
            .execute(executor)
            .await?;
        }
        CoinPartition::NoAddress => {
            sqlx::query(
                "INSERT INTO coins_noaddr (id, tx_id, pos, value, height, script)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&coin.tx_id)
            .bind(i64::from(coin.pos))
            .bind(coin.value)
            .bind(i64::from(coin.height))
            .bind(&coin.script)
            .execute(executor)
            .await?;
        }
    }
    Ok(())
}

/// Reassemble a coin from the uniform row shape used by the partition
/// queries (`address` carries the single address, the JSON signer array, or
/// an empty string depending on the partition).
pub(crate) fn stored_coin_from_row(
    partition: CoinPartition,
    row: (i64, String, i64, String, i64, i64, String),
) -> Result<StoredCoin> {
    let (id, tx_id, pos, address, value, height, script) = row;
    let addresses = match partition {
        CoinPartition::Addressed => {
            if address.is_empty() {
                Vec::new()
            } else {
                vec![address]
            }
        }
        CoinPartition::Multisig => serde_json::from_str(&address)?,
        CoinPartition::NoAddress => Vec::new(),
    };
    Ok(StoredCoin {
        id,
        coin: Coin {
            tx_id,
            pos: pos as u32,
            value,
            height: height as u32,
            script,
            addresses,
        },
    })
}

impl CoinStore {
    /// Append a batch of confirmed coins to a partition, assigning each the
    /// next value of that partition's identity sequence. A zero-length
    /// batch is a no-op.
    pub async fn append_coins(&self, partition: CoinPartition, coins: &[Coin]) -> Result<()> {
        self.ensure_enabled(partition)?;
        if coins.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let last = reserve_ids(&mut *tx, partition.table(), coins.len() as i64).await?;
        let first = last - coins.len() as i64 + 1;
        for (offset, coin) in coins.iter().enumerate() {
            insert_coin_row(&mut *tx, partition, first + offset as i64, coin).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every coin of a partition with `height >= from_height`.
    ///
    /// Rollback-only: forward spend processing removes coins through the
    /// backup engine so they stay restorable.
    pub async fn remove_coins_from_height(
        &self,
        partition: CoinPartition,
        from_height: u32,
    ) -> Result<u64> {
        self.ensure_enabled(partition)?;
        let sql = format!("DELETE FROM {} WHERE height >= ?", partition.table());
        let result = sqlx::query(&sql)
            .bind(i64::from(from_height))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Coins of a partition holding the given address. Addressed partitions
    /// match the single address column; multisig matches membership in the
    /// signer set.
    pub async fn coins_by_address(
        &self,
        partition: CoinPartition,
        address: &str,
    ) -> Result<Vec<Coin>> {
        self.ensure_enabled(partition)?;
        let sql = match partition {
            CoinPartition::Addressed => {
                "SELECT id, tx_id, pos, address, value, height, script
                 FROM coins WHERE address = ? ORDER BY id"
            }
            CoinPartition::Multisig => {
                "SELECT id, tx_id, pos, addresses, value, height, script
                 FROM coins_multisig
                 WHERE EXISTS (
                     SELECT 1 FROM json_each(coins_multisig.addresses)
                     WHERE json_each.value = ?
                 )
                 ORDER BY id"
            }
            CoinPartition::NoAddress => return Ok(Vec::new()),
        };
        let rows: Vec<(i64, String, i64, String, i64, i64, String)> = sqlx::query_as(sql)
            .bind(address)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| stored_coin_from_row(partition, row).map(|stored| stored.coin))
            .collect()
    }

    /// Number of coins in a partition.
    pub async fn coin_count(&self, partition: CoinPartition) -> Result<u64> {
        self.ensure_enabled(partition)?;
        let sql = format!("SELECT COUNT(*) FROM {}", partition.table());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    /// Append confirmed payload records, drawing identities from the
    /// payloads sequence. A zero-length batch is a no-op.
    pub async fn append_payloads(&self, payloads: &[Payload]) -> Result<()> {
        if !self.config.support_payload {
            return Err(crate::error::Error::PartitionDisabled("payloads"));
        }
        if payloads.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let last = reserve_ids(&mut *tx, "payloads", payloads.len() as i64).await?;
        let first = last - payloads.len() as i64 + 1;
        for (offset, payload) in payloads.iter().enumerate() {
            sqlx::query(
                "INSERT INTO payloads (id, tx_id, pos, address, hint, subhint, height)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(first + offset as i64)
            .bind(&payload.tx_id)
            .bind(i64::from(payload.pos))
            .bind(&payload.address)
            .bind(&payload.hint)
            .bind(payload.subhint.as_deref())
            .bind(i64::from(payload.height))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete payload records with `height >= from_height` (rollback path).
    pub async fn remove_payloads_from_height(&self, from_height: u32) -> Result<u64> {
        if !self.config.support_payload {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM payloads WHERE height >= ?")
            .bind(i64::from(from_height))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
