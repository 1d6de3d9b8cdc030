//! Reorg backup and rollback.
//!
//! Spending a confirmed coin does not delete it outright: the coin is moved
//! into the spent-coin archive together with the height that spent it and a
//! tag naming its origin partition. If the chain reorganizes below that
//! height the archive is replayed to restore the coins; once a height is
//! buried deeper than the expected reorganization depth the archive entries
//! are retired for good. Raw block records are archived symmetrically.
//!
//! Ordering is the crash-safety contract: restoring coins always happens
//! before the archive rows, backup blocks or forward-processed coins at the
//! same heights are purged, so an interrupted rollback never loses a
//! restorable coin.

use crate::db::CoinStore;
use crate::error::{Error, Result};
use crate::ledger::{insert_coin_row, StoredCoin};
use crate::partition::CoinPartition;
use coindex_primitives::{BackupBlock, SpendDescriptor};
use sqlx::sqlite::Sqlite;

/// Atomically locate-and-remove one coin matching `(tx_id, pos)` from a
/// partition. A single `DELETE … RETURNING` statement: there is no window
/// where the coin is gone from the ledger view without being in hand.
///
/// Deletes at most one row; on chains allowing duplicated pre-activation
/// coinbase pairs the earliest matching row is taken.
async fn delete_one_coin<'e, E>(
    executor: E,
    partition: CoinPartition,
    tx_id: &str,
    pos: u32,
) -> Result<Option<StoredCoin>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = match partition {
        CoinPartition::Addressed => {
            "DELETE FROM coins WHERE rowid IN (
                 SELECT rowid FROM coins WHERE tx_id = ? AND pos = ? ORDER BY id LIMIT 1
             )
             RETURNING id, tx_id, pos, address, value, height, script"
        }
        CoinPartition::Multisig => {
            "DELETE FROM coins_multisig WHERE rowid IN (
                 SELECT rowid FROM coins_multisig WHERE tx_id = ? AND pos = ? ORDER BY id LIMIT 1
             )
             RETURNING id, tx_id, pos, addresses, value, height, script"
        }
        CoinPartition::NoAddress => {
            "DELETE FROM coins_noaddr WHERE rowid IN (
                 SELECT rowid FROM coins_noaddr WHERE tx_id = ? AND pos = ? ORDER BY id LIMIT 1
             )
             RETURNING id, tx_id, pos, '', value, height, script"
        }
    };
    let row: Option<(i64, String, i64, String, i64, i64, String)> = sqlx::query_as(sql)
        .bind(tx_id)
        .bind(i64::from(pos))
        .fetch_optional(executor)
        .await?;
    row.map(|row| crate::ledger::stored_coin_from_row(partition, row))
        .transpose()
}

impl CoinStore {
    /// Archive-and-remove the coins consumed by the given spends.
    ///
    /// Every enabled partition is probed for each `(spent_tx_id, pos)`;
    /// exactly one should match. The whole pass runs in one transaction, so
    /// a crash can never leave a coin deleted but unarchived.
    pub async fn backup_spend(&self, spends: &[SpendDescriptor]) -> Result<()> {
        if spends.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut archived = 0usize;
        for &partition in &self.partitions {
            for spend in spends {
                let Some(stored) =
                    delete_one_coin(&mut *tx, partition, &spend.spent_tx_id, spend.pos).await?
                else {
                    continue;
                };
                sqlx::query(
                    "INSERT INTO backup_spent_coins (height, src, tx_id, pos, coin)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(i64::from(spend.height))
                .bind(partition.archive_tag())
                .bind(&spend.spent_tx_id)
                .bind(i64::from(spend.pos))
                .bind(serde_json::to_string(&stored)?)
                .execute(&mut *tx)
                .await?;
                archived += 1;
            }
        }
        tx.commit().await?;

        tracing::debug!(spends = spends.len(), archived, "archived spent coins");
        Ok(())
    }

    /// Undo every spend archived at `height >= from_height` and purge all
    /// forward-processed data at those heights.
    ///
    /// Phase one (single transaction): re-insert each archived coin into its
    /// origin partition with its original identity, then delete the consumed
    /// archive rows. Phase two (concurrent, independent): remove backup
    /// blocks, payload records and forward-added coins at
    /// `height >= from_height`.
    pub async fn rollback_from(&self, from_height: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(
            "SELECT id, src, coin FROM backup_spent_coins WHERE height >= ?",
        )
        .bind(i64::from(from_height))
        .fetch_all(&mut *tx)
        .await?;

        let restored = rows.len();
        for (row_id, tag, coin_json) in rows {
            let partition = CoinPartition::from_archive_tag(tag).ok_or_else(|| {
                Error::MalformedLegacyRecord {
                    table: "backup_spent_coins",
                    id: row_id,
                    reason: format!("unknown partition tag {tag}"),
                }
            })?;
            let stored: StoredCoin = serde_json::from_str(&coin_json)?;
            insert_coin_row(&mut *tx, partition, stored.id, &stored.coin).await?;
        }
        sqlx::query("DELETE FROM backup_spent_coins WHERE height >= ?")
            .bind(i64::from(from_height))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let (removed_blocks, removed_payloads, _) = futures::try_join!(
            self.remove_backup_blocks_from(from_height),
            self.remove_payloads_from_height(from_height),
            futures::future::try_join_all(
                self.partitions
                    .iter()
                    .map(|partition| self.remove_coins_from_height(*partition, from_height)),
            ),
        )?;

        tracing::info!(
            from_height,
            restored,
            removed_blocks,
            removed_payloads,
            "rolled back ledger"
        );
        Ok(())
    }

    /// Permanently drop archive entries with `height <= before_height`.
    ///
    /// Irreversible: coins retired here can never be restored. Callers must
    /// only pass heights buried deeper than the chain's maximum expected
    /// reorganization depth.
    pub async fn retire_spent_archive(&self, before_height: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backup_spent_coins WHERE height <= ?")
            .bind(i64::from(before_height))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========== Backup blocks ==========

    /// Archive raw block records. Re-archiving a height replaces the
    /// previous record.
    pub async fn add_backup_blocks(&self, blocks: &[BackupBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for block in blocks {
            sqlx::query(
                "INSERT OR REPLACE INTO backup_blocks (height, hash, data) VALUES (?, ?, ?)",
            )
            .bind(i64::from(block.height))
            .bind(&block.hash)
            .bind(&block.data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All archived blocks, in height order.
    pub async fn backup_blocks(&self) -> Result<Vec<BackupBlock>> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT height, hash, data FROM backup_blocks ORDER BY height")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(height, hash, data)| BackupBlock {
                height: height as u32,
                hash,
                data,
            })
            .collect())
    }

    pub async fn remove_backup_blocks_from(&self, from_height: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backup_blocks WHERE height >= ?")
            .bind(i64::from(from_height))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Permanently drop archived blocks with `height <= before_height`,
    /// under the same retention policy as the spent-coin archive.
    pub async fn retire_backup_blocks(&self, before_height: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM backup_blocks WHERE height <= ?")
            .bind(i64::from(before_height))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
