//! Mempool mirror: speculative records for unconfirmed transactions.
//!
//! Pending coins, spends and payloads shadow the confirmed partitions but
//! carry time-ordered identities instead of sequence values. Records leave
//! the mirror on confirmation (`remove_pending_by_txids` once the txid
//! shows up on-chain), wholesale (`remove_all_pending`), or through the
//! rejection sweep.

use crate::db::CoinStore;
use crate::error::{Error, Result};
use crate::partition::CoinPartition;
use coindex_primitives::{PendingCoin, PendingPayload, PendingSpend};

impl CoinStore {
    /// Every pending table the active configuration maintains.
    pub(crate) fn pending_tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<&'static str> =
            self.partitions.iter().map(|p| p.pending_table()).collect();
        if self.config.resolve_spending {
            tables.extend(self.partitions.iter().map(|p| p.pending_spends_table()));
        } else {
            tables.push("pending_spents_bare");
        }
        if self.config.support_payload {
            tables.push("pending_payloads");
        }
        tables
    }

    /// Mirror unconfirmed outputs into a pending partition. A zero-length
    /// batch is a no-op.
    pub async fn add_pending_coins(
        &self,
        partition: CoinPartition,
        coins: &[PendingCoin],
    ) -> Result<()> {
        self.ensure_enabled(partition)?;
        if coins.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for coin in coins {
            let id = self.pending_ids.next();
            match partition {
                CoinPartition::Addressed => {
                    sqlx::query(
                        "INSERT INTO pending_coins (id, tx_id, pos, address, value, script)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&coin.tx_id)
                    .bind(i64::from(coin.pos))
                    .bind(coin.addresses.first().map(String::as_str).unwrap_or(""))
                    .bind(coin.value)
                    .bind(&coin.script)
                    .execute(&mut *tx)
                    .await?;
                }
                CoinPartition::Multisig => {
                    sqlx::query(
                        "INSERT INTO pending_coins_multisig
                             (id, tx_id, pos, addresses, value, script)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&coin.tx_id)
                    .bind(i64::from(coin.pos))
                    .bind(serde_json::to_string(&coin.addresses)?)
                    .bind(coin.value)
                    .bind(&coin.script)
                    .execute(&mut *tx)
                    .await?;
                }
                CoinPartition::NoAddress => {
                    sqlx::query(
                        "INSERT INTO pending_coins_noaddr (id, tx_id, pos, value, script)
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&coin.tx_id)
                    .bind(i64::from(coin.pos))
                    .bind(coin.value)
                    .bind(&coin.script)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mirror unconfirmed spends in `resolve_spending` mode: one record per
    /// consumed coin, carrying the spent coin's address shape and height for
    /// rich queries. Fails if the ledger runs in bare mode.
    pub async fn add_pending_spends(
        &self,
        partition: CoinPartition,
        spends: &[PendingSpend],
    ) -> Result<()> {
        self.ensure_enabled(partition)?;
        if !self.config.resolve_spending {
            return Err(Error::PartitionDisabled(partition.pending_spends_table()));
        }
        if spends.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for spend in spends {
            let id = self.pending_ids.next();
            match partition {
                CoinPartition::Addressed => {
                    sqlx::query(
                        "INSERT INTO pending_spents
                             (id, tx_id, spent_tx_id, pos, height, address)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&spend.tx_id)
                    .bind(&spend.spent_tx_id)
                    .bind(i64::from(spend.pos))
                    .bind(i64::from(spend.height))
                    .bind(spend.addresses.first().map(String::as_str).unwrap_or(""))
                    .execute(&mut *tx)
                    .await?;
                }
                CoinPartition::Multisig => {
                    sqlx::query(
                        "INSERT INTO pending_spents_multisig
                             (id, tx_id, spent_tx_id, pos, height, addresses)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&spend.tx_id)
                    .bind(&spend.spent_tx_id)
                    .bind(i64::from(spend.pos))
                    .bind(i64::from(spend.height))
                    .bind(serde_json::to_string(&spend.addresses)?)
                    .execute(&mut *tx)
                    .await?;
                }
                CoinPartition::NoAddress => {
                    sqlx::query(
                        "INSERT INTO pending_spents_noaddr
                             (id, tx_id, spent_tx_id, pos, height)
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&spend.tx_id)
                    .bind(&spend.spent_tx_id)
                    .bind(i64::from(spend.pos))
                    .bind(i64::from(spend.height))
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mirror unconfirmed spends in bare mode: only the reference triple
    /// `(tx_id, spent_tx_id, pos)` is persisted; `height` and `addresses`
    /// of the input records are ignored. Fails in `resolve_spending` mode.
    pub async fn add_pending_spends_bare(&self, spends: &[PendingSpend]) -> Result<()> {
        if self.config.resolve_spending {
            return Err(Error::PartitionDisabled("pending_spents_bare"));
        }
        if spends.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for spend in spends {
            sqlx::query(
                "INSERT INTO pending_spents_bare (id, tx_id, spent_tx_id, pos)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(self.pending_ids.next())
            .bind(&spend.tx_id)
            .bind(&spend.spent_tx_id)
            .bind(i64::from(spend.pos))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mirror unconfirmed payload records.
    pub async fn add_pending_payloads(&self, payloads: &[PendingPayload]) -> Result<()> {
        if !self.config.support_payload {
            return Err(Error::PartitionDisabled("pending_payloads"));
        }
        if payloads.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for payload in payloads {
            sqlx::query(
                "INSERT INTO pending_payloads (id, tx_id, pos, address, hint, subhint)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(self.pending_ids.next())
            .bind(&payload.tx_id)
            .bind(i64::from(payload.pos))
            .bind(&payload.address)
            .bind(&payload.hint)
            .bind(payload.subhint.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop the whole mempool mirror, e.g. after a node restart invalidated
    /// the speculative view.
    pub async fn remove_all_pending(&self) -> Result<()> {
        futures::future::try_join_all(self.pending_tables().into_iter().map(|table| {
            let sql = format!("DELETE FROM {table}");
            async move { sqlx::query(&sql).execute(&self.pool).await }
        }))
        .await?;
        Ok(())
    }

    /// Delete every pending record of the given txids across all pending
    /// partitions, in one best-effort pass.
    ///
    /// Deletes are unordered and independent: a failure in one partition is
    /// logged and does not block the others. The records left behind by a
    /// failed partition are retried naturally on the next confirmation pass
    /// or sweep, since deletes are idempotent.
    pub async fn remove_pending_by_txids(&self, txids: &[String]) -> Result<()> {
        if txids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; txids.len()].join(", ");

        let results =
            futures::future::join_all(self.pending_tables().into_iter().map(|table| {
                let sql = format!("DELETE FROM {table} WHERE tx_id IN ({placeholders})");
                async move {
                    let mut query = sqlx::query(&sql);
                    for txid in txids {
                        query = query.bind(txid);
                    }
                    (table, query.execute(&self.pool).await)
                }
            }))
            .await;

        for (table, result) in results {
            if let Err(error) = result {
                tracing::warn!(table, %error, "pending purge failed for one partition");
            }
        }
        Ok(())
    }
}
