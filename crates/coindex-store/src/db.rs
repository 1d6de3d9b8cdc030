//! Store handle: connection lifecycle, schema provisioning, facts and the
//! persisted event log.

use crate::error::{Error, Result};
use crate::migrate::LATEST_DB_VERSION;
use crate::partition::CoinPartition;
use coindex_primitives::{BlockInfo, ChainIdentity, Config, LogLevel, PendingIdGenerator};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

/// Facts-store keys. `last_upgrade_item` lives in `migrate.rs`.
const FACT_DB_VERSION: &str = "db_version";
const FACT_DB_TRAITS: &str = "db_traits";
const FACT_CHAIN_IDENTITY: &str = "coin";
const FACT_LAST_RECORDED_BLOCK: &str = "last_recorded_block";
const FACT_LAST_SAFE_BLOCK: &str = "last_safe_block";

/// One SQLite-backed ledger instance.
///
/// The handle owns the connection pool, the set of partitions enabled by
/// configuration (resolved once here, never re-checked per call), the
/// pending-identity generator and the single-flight gate of the rejection
/// sweep. A single writer process per ledger is assumed throughout.
#[derive(Debug)]
pub struct CoinStore {
    pub(crate) pool: SqlitePool,
    pub(crate) config: Config,
    pub(crate) partitions: Vec<CoinPartition>,
    pub(crate) pending_ids: PendingIdGenerator,
    pub(crate) sweep_gate: Mutex<()>,
}

impl CoinStore {
    /// Open or create the ledger under `path`, provisioning the schema for
    /// the partitions the configuration enables.
    ///
    /// Fatal errors: backend unreachable, recorded schema version mismatched
    /// against [`LATEST_DB_VERSION`] on a non-empty ledger, chain-identity
    /// mismatch.
    pub async fn open(path: &Path, config: Config) -> Result<Self> {
        let store = Self::connect(path, config).await?;

        if let Some(recorded) = store.fact::<BlockInfo>(FACT_LAST_RECORDED_BLOCK).await? {
            let version = store.db_version().await?;
            if version != LATEST_DB_VERSION {
                tracing::error!(
                    found = version,
                    expected = LATEST_DB_VERSION,
                    last_block = recorded.height,
                    "schema version mismatch"
                );
                return Err(Error::VersionMismatch {
                    expected: LATEST_DB_VERSION,
                    found: version,
                });
            }
        }

        store.provision_schema().await?;
        store.seed_sequences().await?;
        store.set_db_version(LATEST_DB_VERSION).await?;
        store
            .set_fact(
                FACT_DB_TRAITS,
                &serde_json::json!({
                    "resolve_spending": store.config.resolve_spending,
                    "support_multisig": store.config.support_multisig,
                    "support_payload": store.config.support_payload,
                }),
            )
            .await?;
        store.check_chain_identity().await?;

        Ok(store)
    }

    /// Open without provisioning or version checks, for the migration
    /// engine operating on a legacy layout. The chain identity is still
    /// verified.
    pub async fn open_for_upgrade(path: &Path, config: Config) -> Result<Self> {
        let store = Self::connect(path, config).await?;
        store.check_chain_identity().await?;
        Ok(store)
    }

    async fn connect(path: &Path, config: Config) -> Result<Self> {
        let config = config.sanitize();

        // Ledger files are namespaced by chain identity so two networks can
        // never share a database file.
        let db_path = path
            .join(&config.coin)
            .join(&config.network)
            .join("coindex.sqlite");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("synchronous", "NORMAL");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        // The facts table must exist before any version or identity check.
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS summary (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sequences (
                name TEXT PRIMARY KEY,
                last_id INTEGER NOT NULL
            );",
        )
        .execute(&pool)
        .await?;

        let mut partitions = vec![CoinPartition::Addressed];
        if config.support_multisig {
            partitions.push(CoinPartition::Multisig);
        }
        partitions.push(CoinPartition::NoAddress);

        tracing::info!(
            coin = %config.coin,
            network = %config.network,
            db = %db_path.display(),
            "opened ledger database"
        );

        Ok(Self {
            pool,
            config,
            partitions,
            pending_ids: PendingIdGenerator::new(),
            sweep_gate: Mutex::new(()),
        })
    }

    /// Create every table and index the active configuration needs.
    /// Independent DDL groups are dispatched concurrently.
    async fn provision_schema(&self) -> Result<()> {
        let mut ddl: Vec<String> = Vec::new();

        for partition in &self.partitions {
            ddl.push(partition.confirmed_ddl(&self.config.traits));
            ddl.push(partition.pending_ddl().to_string());
            if self.config.resolve_spending {
                ddl.push(partition.pending_spends_ddl().to_string());
            }
        }

        if !self.config.resolve_spending {
            ddl.push(
                "CREATE TABLE IF NOT EXISTS pending_spents_bare (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    spent_tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pending_spents_bare_spent
                    ON pending_spents_bare(spent_tx_id, pos);
                CREATE INDEX IF NOT EXISTS idx_pending_spents_bare_tx
                    ON pending_spents_bare(tx_id);"
                    .to_string(),
            );
        }

        if self.config.support_payload {
            ddl.push(
                "CREATE TABLE IF NOT EXISTS payloads (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    address TEXT NOT NULL,
                    hint TEXT NOT NULL,
                    subhint TEXT,
                    height INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_payloads_addr_hint
                    ON payloads(address, hint, subhint);
                CREATE INDEX IF NOT EXISTS idx_payloads_height ON payloads(height);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_payloads_xo ON payloads(tx_id, pos);
                CREATE TABLE IF NOT EXISTS pending_payloads (
                    id INTEGER PRIMARY KEY,
                    tx_id TEXT NOT NULL,
                    pos INTEGER NOT NULL,
                    address TEXT NOT NULL,
                    hint TEXT NOT NULL,
                    subhint TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_pending_payloads_addr
                    ON pending_payloads(address);
                CREATE INDEX IF NOT EXISTS idx_pending_payloads_tx
                    ON pending_payloads(tx_id);"
                    .to_string(),
            );
        }

        ddl.push(
            "CREATE TABLE IF NOT EXISTS rejects (
                tx_id TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS backup_blocks (
                height INTEGER PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backup_spent_coins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                height INTEGER NOT NULL,
                src INTEGER NOT NULL,
                tx_id TEXT NOT NULL,
                pos INTEGER NOT NULL,
                coin TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backup_spent_coins_height
                ON backup_spent_coins(height);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_backup_spent_coins_xo
                ON backup_spent_coins(tx_id, pos);
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level INTEGER NOT NULL,
                code TEXT NOT NULL,
                pid INTEGER NOT NULL,
                at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);"
                .to_string(),
        );

        futures::future::try_join_all(
            ddl.iter()
                .map(|statements| sqlx::raw_sql(statements).execute(&self.pool)),
        )
        .await?;

        Ok(())
    }

    /// Bring every partition's identity sequence at least up to the highest
    /// identity present in its table, so identities are never reused even on
    /// a ledger migrated from a layout that predates the sequences table.
    pub(crate) async fn seed_sequences(&self) -> Result<()> {
        let mut tables: Vec<&'static str> =
            self.partitions.iter().map(|p| p.table()).collect();
        if self.config.support_payload {
            tables.push("payloads");
        }
        for table in tables {
            // On the upgrade path some partitions may not exist yet; they
            // are seeded when the store is next opened normally.
            if !self.table_exists(table).await? {
                continue;
            }
            let sql = format!(
                "INSERT INTO sequences (name, last_id)
                 VALUES (?1, COALESCE((SELECT MAX(id) FROM {table}), 0))
                 ON CONFLICT(name) DO UPDATE SET
                     last_id = MAX(last_id, excluded.last_id)"
            );
            sqlx::query(&sql).bind(table).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn check_chain_identity(&self) -> Result<()> {
        let configured = ChainIdentity {
            coin: self.config.coin.clone(),
            network: self.config.network.clone(),
        };
        match self.fact::<ChainIdentity>(FACT_CHAIN_IDENTITY).await? {
            None => self.set_fact(FACT_CHAIN_IDENTITY, &configured).await,
            Some(recorded) if recorded == configured => Ok(()),
            Some(recorded) => {
                tracing::error!(
                    recorded = %format!("{}/{}", recorded.coin, recorded.network),
                    configured = %format!("{}/{}", configured.coin, configured.network),
                    "refusing to open ledger for a different chain"
                );
                Err(Error::chain_identity_mismatch(&recorded, &configured))
            }
        }
    }

    /// Close the connection pool, waiting for in-flight operations.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shape partitions enabled by this ledger's configuration.
    pub fn partitions(&self) -> &[CoinPartition] {
        &self.partitions
    }

    pub(crate) fn ensure_enabled(&self, partition: CoinPartition) -> Result<()> {
        if self.partitions.contains(&partition) {
            Ok(())
        } else {
            Err(Error::PartitionDisabled(partition.table()))
        }
    }

    // ========== Facts ==========

    /// Fetch a fact by key. Absence is `Ok(None)`, not an error.
    pub async fn fact<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM summary WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// Upsert a fact.
    pub async fn set_fact<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO summary (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_fact(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM summary WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recorded schema version; a ledger without the fact is treated as V1.
    pub async fn db_version(&self) -> Result<u32> {
        Ok(self
            .fact::<u32>(FACT_DB_VERSION)
            .await?
            .unwrap_or(crate::migrate::DB_VERSION_V1))
    }

    pub async fn set_db_version(&self, version: u32) -> Result<()> {
        self.set_fact(FACT_DB_VERSION, &version).await
    }

    pub async fn last_recorded_block(&self) -> Result<Option<BlockInfo>> {
        self.fact(FACT_LAST_RECORDED_BLOCK).await
    }

    pub async fn set_last_recorded_block(&self, info: &BlockInfo) -> Result<()> {
        self.set_fact(FACT_LAST_RECORDED_BLOCK, info).await
    }

    pub async fn last_safe_block(&self) -> Result<Option<BlockInfo>> {
        self.fact(FACT_LAST_SAFE_BLOCK).await
    }

    pub async fn set_last_safe_block(&self, info: &BlockInfo) -> Result<()> {
        self.set_fact(FACT_LAST_SAFE_BLOCK, info).await
    }

    // ========== Event log ==========

    /// Append entries to the persisted leveled event log. A zero-length
    /// batch is a no-op.
    pub async fn log_events(
        &self,
        entries: &[serde_json::Value],
        code: &str,
        level: LogLevel,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let pid = i64::from(std::process::id());
        let at = chrono::Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query("INSERT INTO logs (level, code, pid, at, body) VALUES (?, ?, ?, ?, ?)")
                .bind(level.as_i64())
                .bind(code)
                .bind(pid)
                .bind(&at)
                .bind(serde_json::to_string(entry)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn log_event(
        &self,
        entry: &serde_json::Value,
        code: &str,
        level: LogLevel,
    ) -> Result<()> {
        self.log_events(std::slice::from_ref(entry), code, level)
            .await
    }

    pub(crate) async fn table_exists(&self, name: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}
