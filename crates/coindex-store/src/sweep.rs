//! Rejection detection: the sweep that finds pending transactions that can
//! never confirm.
//!
//! A pending spend references a coin by `(spent_tx_id, pos)`. If that coin
//! exists nowhere — not in the confirmed partitions, not among pending
//! coins, not in the spent-coin archive — then some other, now-confirmed
//! transaction consumed it and the spending transaction is permanently
//! unconfirmable. Its txid gets a reject marker and all of its pending
//! records are purged.
//!
//! The sweep is check-then-act over many rows with no isolation between
//! the existence probes and the final deletions, so it is single-flight:
//! a second invocation while one is running returns immediately.

use crate::db::CoinStore;
use crate::error::Result;
use coindex_primitives::pending_id_timestamp;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Result of a rejection sweep invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The sweep ran to completion and rejected this many transactions.
    Completed { rejected: usize },
    /// Another sweep held the gate; nothing was scanned.
    AlreadyRunning,
}

impl CoinStore {
    /// Run one rejection sweep over all active pending-spend partitions.
    ///
    /// Records younger than `min_pending_time` (by the creation instant
    /// embedded in their identity) are skipped: the referenced coin may
    /// simply not have propagated to this node yet.
    pub async fn detect_rejections(&self) -> Result<SweepOutcome> {
        let Ok(_gate) = self.sweep_gate.try_lock() else {
            tracing::debug!("rejection sweep already in flight, skipping");
            return Ok(SweepOutcome::AlreadyRunning);
        };

        let now = unix_now();
        let mut rejects: HashSet<String> = HashSet::new();

        for table in self.spend_scan_tables() {
            let sql = format!("SELECT id, tx_id, spent_tx_id, pos FROM {table}");
            let spends: Vec<(i64, String, String, i64)> =
                sqlx::query_as(&sql).fetch_all(&self.pool).await?;

            for (id, tx_id, spent_tx_id, pos) in spends {
                let age = now.saturating_sub(pending_id_timestamp(id));
                if age <= self.config.min_pending_time {
                    continue;
                }
                if rejects.contains(&tx_id) {
                    continue;
                }
                if self.coin_exists_anywhere(&spent_tx_id, pos as u32).await? {
                    continue;
                }
                // The referenced coin is gone everywhere: consumed by a
                // different, now-confirmed transaction or evicted upstream.
                rejects.insert(tx_id);
            }
        }

        let rejected = rejects.len();
        if rejected > 0 {
            self.commit_rejections(&rejects).await?;
            tracing::info!(rejected, "purged unconfirmable transactions");
        }
        Ok(SweepOutcome::Completed { rejected })
    }

    fn spend_scan_tables(&self) -> Vec<&'static str> {
        if self.config.resolve_spending {
            self.partitions
                .iter()
                .map(|p| p.pending_spends_table())
                .collect()
        } else {
            vec!["pending_spents_bare"]
        }
    }

    /// Does a coin `(tx_id, pos)` exist in any confirmed partition, any
    /// pending coin partition, or the spent-coin archive?
    async fn coin_exists_anywhere(&self, tx_id: &str, pos: u32) -> Result<bool> {
        let mut tables: Vec<&'static str> = Vec::new();
        for partition in &self.partitions {
            tables.push(partition.table());
            tables.push(partition.pending_table());
        }
        tables.push("backup_spent_coins");

        for table in tables {
            let sql = format!("SELECT COUNT(*) FROM {table} WHERE tx_id = ? AND pos = ?");
            let (count,): (i64,) = sqlx::query_as(&sql)
                .bind(tx_id)
                .bind(i64::from(pos))
                .fetch_one(&self.pool)
                .await?;
            if count > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Insert reject markers and purge the rejected txids' pending records
    /// as one transaction, keeping the reject set and the pending mirror
    /// disjoint. Markers are insert-once (`INSERT OR IGNORE`).
    async fn commit_rejections(&self, txids: &HashSet<String>) -> Result<()> {
        let txids: Vec<&String> = txids.iter().collect();
        let placeholders = vec!["?"; txids.len()].join(", ");

        let mut tx = self.pool.begin().await?;
        for txid in &txids {
            sqlx::query("INSERT OR IGNORE INTO rejects (tx_id) VALUES (?)")
                .bind(txid.as_str())
                .execute(&mut *tx)
                .await?;
        }
        for table in self.pending_tables() {
            let sql = format!("DELETE FROM {table} WHERE tx_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for txid in &txids {
                query = query.bind(txid.as_str());
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
