//! Crash-safe, resumable schema migrations.
//!
//! Schema versions are strictly sequential. Each migration walks its source
//! table in fixed windows, committing every window's destination rows
//! before persisting the cursor (`last_upgrade_item`, the last fully
//! migrated source index). On resume the cursor names the last committed
//! batch; destination rows beyond what that cursor implies are partial
//! writes from an interrupted batch and are deleted before work restarts,
//! which makes re-running a crashed migration idempotent. The obsolete
//! source table is dropped and the version advanced only once every item
//! has been migrated.
//!
//! A single concurrent runner is assumed. Cancellation is cooperative and
//! observed at batch boundaries only: a window in flight either commits
//! entirely or was never started.

use crate::db::CoinStore;
use crate::error::{Error, Result};
use crate::partition::CoinPartition;
use coindex_primitives::parse_decimal_amount;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Int32-identity coins and payloads.
pub const DB_VERSION_V1: u32 = 1;
/// Int64-identity coins and payloads.
pub const DB_VERSION_V2: u32 = 2;
/// Shape-partitioned layout: confirmed/pending partitions, spent-coin and
/// block archives, reject set, event log, facts.
pub const DB_VERSION_V3: u32 = 3;
pub const LATEST_DB_VERSION: u32 = DB_VERSION_V3;

/// Migration cursor fact: index of the last fully committed source item.
const CURSOR_FACT: &str = "last_upgrade_item";
/// Superseded by the `last_recorded_block` fact; removed during V2→V3.
const LEGACY_HEIGHT_FACT: &str = "lastBlockHeight";

/// Cooperative stop flag threaded into long-running operations. Cloning
/// shares the flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl CoinStore {
    /// Run every outstanding migration in order until the recorded version
    /// reaches [`LATEST_DB_VERSION`] or the stop handle is raised. Returns
    /// the version the ledger ended up at; a paused migration resumes from
    /// its cursor on the next invocation.
    pub async fn upgrade(&self, stop: &StopHandle) -> Result<u32> {
        loop {
            let version = self.db_version().await?;
            if version == LATEST_DB_VERSION {
                self.seed_sequences().await?;
                return Ok(version);
            }
            if version > LATEST_DB_VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            if stop.is_stopped() {
                return Ok(version);
            }

            match version {
                DB_VERSION_V1 => self.upgrade_v1_to_v2(stop).await?,
                DB_VERSION_V2 => self.upgrade_v2_to_v3(stop).await?,
                other => return Err(Error::UnsupportedVersion(other)),
            }

            if self.db_version().await? == version {
                // Stopped mid-migration; the cursor holds the progress.
                return Ok(version);
            }
        }
    }

    /// V1→V2: widen the coin identity space from 32 to 64 bits by copying
    /// the legacy table into a freshly indexed one.
    async fn upgrade_v1_to_v2(&self, stop: &StopHandle) -> Result<()> {
        tracing::info!("upgrading schema v1 -> v2");

        // An interrupted run leaves `coins_v1` or the cursor behind; rename
        // only on a fresh start, or a finished copy would be mistaken for
        // the legacy source and dropped.
        let resumed = self.table_exists("coins_v1").await?
            || self.fact::<i64>(CURSOR_FACT).await?.is_some();
        if !resumed && self.table_exists("coins").await? {
            tracing::info!("fresh upgrade, renaming legacy coins table");
            sqlx::query("ALTER TABLE coins RENAME TO coins_v1")
                .execute(&self.pool)
                .await?;
        }
        let ddl = CoinPartition::Addressed.confirmed_ddl(&self.config.traits);
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;

        let total = if self.table_exists("coins_v1").await? {
            self.table_count("coins_v1").await?
        } else {
            0
        };
        tracing::info!(total, "coins to migrate");

        if total > 0 {
            let mut i = match self.fact::<i64>(CURSOR_FACT).await? {
                Some(cursor) => cursor + 1,
                None => 0,
            };

            if i < total {
                // Remove partial writes of a batch interrupted mid-commit.
                let boundary: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM coins_v1 ORDER BY id LIMIT 1 OFFSET ?")
                        .bind(i)
                        .fetch_optional(&self.pool)
                        .await?;
                if let Some((from_id,)) = boundary {
                    tracing::info!(from_index = i, from_id, "clearing dirty destination rows");
                    sqlx::query("DELETE FROM coins WHERE id >= ?")
                        .bind(from_id)
                        .execute(&self.pool)
                        .await?;
                }
            }

            while i < total {
                if stop.is_stopped() {
                    tracing::info!(cursor = i - 1, "stop requested, pausing migration");
                    break;
                }
                let j = (i + self.config.batch_upgrade_size as i64).min(total);
                tracing::info!(from = i, to = j, "migrating window");

                let rows: Vec<(i64, String, i64, String, i64, i64, String)> = sqlx::query_as(
                    "SELECT id, tx_id, pos, address, value, height, script
                     FROM coins_v1 ORDER BY id LIMIT ? OFFSET ?",
                )
                .bind(j - i)
                .bind(i)
                .fetch_all(&self.pool)
                .await?;

                let mut tx = self.pool.begin().await?;
                for (id, tx_id, pos, address, value, height, script) in rows {
                    sqlx::query(
                        "INSERT INTO coins (id, tx_id, pos, address, value, height, script)
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&tx_id)
                    .bind(pos)
                    .bind(&address)
                    .bind(value)
                    .bind(height)
                    .bind(&script)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                // Cursor strictly after the destination commit.
                self.set_fact(CURSOR_FACT, &(j - 1)).await?;
                i = j;
            }

            let done = matches!(
                self.fact::<i64>(CURSOR_FACT).await?,
                Some(cursor) if cursor == total - 1
            );
            if !done {
                return Ok(());
            }
        }

        sqlx::query("DROP TABLE IF EXISTS coins_v1")
            .execute(&self.pool)
            .await?;
        self.delete_fact(CURSOR_FACT).await?;
        self.set_db_version(DB_VERSION_V2).await?;
        tracing::info!("schema v1 -> v2 complete");
        Ok(())
    }

    /// V2→V3: flatten the legacy `errors` table (failed coin-attempt
    /// records carrying raw transaction JSON) into the no-address
    /// partition, rescaling decimal amounts into atomic units.
    async fn upgrade_v2_to_v3(&self, stop: &StopHandle) -> Result<()> {
        tracing::info!("upgrading schema v2 -> v3");

        let ddl = CoinPartition::NoAddress.confirmed_ddl(&self.config.traits);
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;

        let total = if self.table_exists("errors").await? {
            self.table_count("errors").await?
        } else {
            0
        };
        tracing::info!(total, "legacy records to migrate");

        let mut done = total == 0;
        if total > 0 {
            let sat_per_coin = self.config.traits.sat_per_coin;
            let mut i = match self.fact::<i64>(CURSOR_FACT).await? {
                Some(cursor) => cursor + 1,
                None => 0,
            };

            if i < total {
                tracing::info!(from_index = i, "clearing dirty destination rows");
                sqlx::query("DELETE FROM coins_noaddr WHERE id >= ?")
                    .bind(i)
                    .execute(&self.pool)
                    .await?;
            }

            while i < total {
                if stop.is_stopped() {
                    tracing::info!(cursor = i - 1, "stop requested, pausing migration");
                    break;
                }
                let j = (i + self.config.batch_blocks as i64).min(total);
                tracing::info!(from = i, to = j, "migrating window");

                let rows: Vec<(i64, String, i64, i64, String)> = sqlx::query_as(
                    "SELECT id, tx_id, pos, height, tx_info
                     FROM errors ORDER BY id LIMIT ? OFFSET ?",
                )
                .bind(j - i)
                .bind(i)
                .fetch_all(&self.pool)
                .await?;

                let mut tx = self.pool.begin().await?;
                let mut dest_id = i;
                for (src_id, tx_id, pos, height, tx_info) in rows {
                    // Attempts that never made it into a block carry a
                    // negative height and are dropped.
                    if height < 0 {
                        continue;
                    }
                    let (value, script) =
                        transform_legacy_attempt(src_id, &tx_info, pos, sat_per_coin)?;
                    sqlx::query(
                        "INSERT INTO coins_noaddr (id, tx_id, pos, value, height, script)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(dest_id)
                    .bind(&tx_id)
                    .bind(pos)
                    .bind(value)
                    .bind(height)
                    .bind(&script)
                    .execute(&mut *tx)
                    .await?;
                    dest_id += 1;
                }
                tx.commit().await?;
                self.set_fact(CURSOR_FACT, &(j - 1)).await?;
                i = j;
            }

            done = matches!(
                self.fact::<i64>(CURSOR_FACT).await?,
                Some(cursor) if cursor == total - 1
            );
        }

        if done {
            sqlx::query("DROP TABLE IF EXISTS errors")
                .execute(&self.pool)
                .await?;
            self.delete_fact(CURSOR_FACT).await?;
            self.set_db_version(DB_VERSION_V3).await?;
            if self.last_recorded_block().await?.is_some() {
                self.delete_fact(LEGACY_HEIGHT_FACT).await?;
            }
            tracing::info!("schema v2 -> v3 complete");
        }
        Ok(())
    }

    async fn table_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}

/// Extract `(value, script)` for output `pos` of a legacy attempt record.
/// Amounts are rescaled from decimal coins to atomic units with integer
/// arithmetic only.
fn transform_legacy_attempt(
    id: i64,
    tx_info: &str,
    pos: i64,
    sat_per_coin: u64,
) -> Result<(i64, String)> {
    let malformed = |reason: String| Error::MalformedLegacyRecord {
        table: "errors",
        id,
        reason,
    };

    let info: serde_json::Value = serde_json::from_str(tx_info)
        .map_err(|e| malformed(format!("invalid tx_info JSON: {e}")))?;
    let vout = info
        .get("vout")
        .and_then(|outputs| outputs.get(pos as usize))
        .ok_or_else(|| malformed(format!("missing vout[{pos}]")))?;

    let raw_amount = vout
        .get("value")
        .ok_or_else(|| malformed("missing output value".to_string()))?;
    let amount_text = match raw_amount {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let value = parse_decimal_amount(&amount_text, sat_per_coin)
        .ok_or_else(|| malformed(format!("unparseable amount {amount_text:?}")))?;

    let script = vout
        .get("scriptPubKey")
        .map(|script| script.to_string())
        .unwrap_or_default();

    Ok((value, script))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_transform_rescales_exactly() {
        let tx_info = r#"{"vout":[
            {"value":"12.345","scriptPubKey":{"type":"nulldata"}},
            {"value":0.1,"scriptPubKey":{"type":"nulldata"}}
        ]}"#;
        let (value, script) = transform_legacy_attempt(7, tx_info, 0, 100_000_000).unwrap();
        assert_eq!(value, 1_234_500_000);
        assert!(script.contains("nulldata"));

        let (value, _) = transform_legacy_attempt(7, tx_info, 1, 100_000_000).unwrap();
        assert_eq!(value, 10_000_000);
    }

    #[test]
    fn legacy_transform_rejects_missing_output() {
        let err = transform_legacy_attempt(3, r#"{"vout":[]}"#, 0, 100_000_000).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedLegacyRecord { table: "errors", id: 3, .. }
        ));
    }

    #[test]
    fn stop_handle_is_shared() {
        let stop = StopHandle::new();
        let clone = stop.clone();
        assert!(!clone.is_stopped());
        stop.stop();
        assert!(clone.is_stopped());
    }
}
