//! End-to-end reorg tests: archive-spend, rollback, retirement and the
//! identity-sequence guarantees.

use coindex_primitives::{BackupBlock, ChainTraits, Coin, Config, SpendDescriptor};
use coindex_store::{CoinPartition, CoinStore};

fn config() -> Config {
    Config {
        coin: "btc".into(),
        network: "regtest".into(),
        ..Config::default()
    }
}

fn coin(tx_id: &str, pos: u32, height: u32, address: &str) -> Coin {
    Coin {
        tx_id: tx_id.into(),
        pos,
        value: 5_000_000_000,
        height,
        script: "76a914deadbeef88ac".into(),
        addresses: vec![address.into()],
    }
}

fn spend(tx_id: &str, spent_tx_id: &str, pos: u32, height: u32) -> SpendDescriptor {
    SpendDescriptor {
        tx_id: tx_id.into(),
        spent_tx_id: spent_tx_id.into(),
        pos,
        height,
    }
}

async fn partition_rows(
    store: &CoinStore,
) -> Vec<(i64, String, i64, String, i64, i64, String)> {
    sqlx::query_as("SELECT id, tx_id, pos, address, value, height, script FROM coins ORDER BY id")
        .fetch_all(store.pool())
        .await
        .unwrap()
}

async fn archive_count_from(store: &CoinStore, height: u32) -> i64 {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM backup_spent_coins WHERE height >= ?")
            .bind(i64::from(height))
            .fetch_one(store.pool())
            .await
            .unwrap();
    count
}

#[tokio::test]
async fn spend_and_rollback_restores_prespend_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    // Three addressed coins, created while processing block 100.
    let coins = vec![
        coin("aa01", 0, 90, "addr1"),
        coin("bb02", 0, 91, "addr2"),
        coin("cc03", 1, 92, "addr3"),
    ];
    store
        .append_coins(CoinPartition::Addressed, &coins)
        .await
        .unwrap();
    let before = partition_rows(&store).await;
    assert_eq!(before.len(), 3);

    // Block 100 spends two of them.
    store
        .backup_spend(&[
            spend("dd04", "aa01", 0, 100),
            spend("dd04", "bb02", 0, 100),
        ])
        .await
        .unwrap();
    assert_eq!(partition_rows(&store).await.len(), 1);
    assert_eq!(archive_count_from(&store, 100).await, 2);

    // The chain reorganized below block 100.
    store.rollback_from(100).await.unwrap();

    let after = partition_rows(&store).await;
    assert_eq!(after, before, "partition must be bit-identical to its pre-spend state");
    assert_eq!(archive_count_from(&store, 100).await, 0);
}

#[tokio::test]
async fn rollback_purges_forward_added_coins_and_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .append_coins(CoinPartition::Addressed, &[coin("aa01", 0, 90, "addr1")])
        .await
        .unwrap();
    store
        .add_backup_blocks(&[
            BackupBlock {
                height: 99,
                hash: "h99".into(),
                data: "{}".into(),
            },
            BackupBlock {
                height: 100,
                hash: "h100".into(),
                data: "{}".into(),
            },
        ])
        .await
        .unwrap();

    // Block 100 spends the old coin and creates a new one.
    store
        .backup_spend(&[spend("bb02", "aa01", 0, 100)])
        .await
        .unwrap();
    store
        .append_coins(CoinPartition::Addressed, &[coin("bb02", 0, 100, "addr2")])
        .await
        .unwrap();

    store.rollback_from(100).await.unwrap();

    let rows = partition_rows(&store).await;
    assert_eq!(rows.len(), 1, "the coin created at the rolled-back height must go");
    assert_eq!(rows[0].1, "aa01");

    let blocks = store.backup_blocks().await.unwrap();
    assert_eq!(
        blocks.iter().map(|b| b.height).collect::<Vec<_>>(),
        vec![99],
        "backup blocks at the rolled-back heights must go"
    );
}

#[tokio::test]
async fn multisig_and_noaddr_spends_restore_to_their_origin_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    let multisig = Coin {
        addresses: vec!["addr1".into(), "addr2".into()],
        ..coin("aa01", 0, 50, "")
    };
    let bare = Coin {
        addresses: vec![],
        ..coin("bb02", 3, 51, "")
    };
    store
        .append_coins(CoinPartition::Multisig, &[multisig.clone()])
        .await
        .unwrap();
    store
        .append_coins(CoinPartition::NoAddress, &[bare.clone()])
        .await
        .unwrap();

    store
        .backup_spend(&[
            spend("cc03", "aa01", 0, 60),
            spend("cc03", "bb02", 3, 60),
        ])
        .await
        .unwrap();
    assert_eq!(store.coin_count(CoinPartition::Multisig).await.unwrap(), 0);
    assert_eq!(store.coin_count(CoinPartition::NoAddress).await.unwrap(), 0);

    store.rollback_from(60).await.unwrap();

    assert_eq!(store.coin_count(CoinPartition::Multisig).await.unwrap(), 1);
    assert_eq!(store.coin_count(CoinPartition::NoAddress).await.unwrap(), 1);
    let found = store
        .coins_by_address(CoinPartition::Multisig, "addr2")
        .await
        .unwrap();
    assert_eq!(found, vec![multisig]);
}

#[tokio::test]
async fn retire_is_permanent_and_bounded_by_height() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .append_coins(
            CoinPartition::Addressed,
            &[coin("aa01", 0, 10, "addr1"), coin("bb02", 0, 11, "addr2")],
        )
        .await
        .unwrap();
    store
        .backup_spend(&[
            spend("cc03", "aa01", 0, 20),
            spend("dd04", "bb02", 0, 30),
        ])
        .await
        .unwrap();

    let retired = store.retire_spent_archive(20).await.unwrap();
    assert_eq!(retired, 1);
    assert_eq!(archive_count_from(&store, 0).await, 1);

    // The retired coin is gone for good: rolling back past its spend height
    // restores only what the archive still holds.
    store.rollback_from(25).await.unwrap();
    let rows = partition_rows(&store).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, "bb02");
}

#[tokio::test]
async fn backup_blocks_list_in_height_order_and_retire() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .add_backup_blocks(&[
            BackupBlock {
                height: 12,
                hash: "h12".into(),
                data: "{}".into(),
            },
            BackupBlock {
                height: 10,
                hash: "h10".into(),
                data: "{}".into(),
            },
            BackupBlock {
                height: 11,
                hash: "h11".into(),
                data: "{}".into(),
            },
        ])
        .await
        .unwrap();

    let heights: Vec<u32> = store
        .backup_blocks()
        .await
        .unwrap()
        .iter()
        .map(|b| b.height)
        .collect();
    assert_eq!(heights, vec![10, 11, 12]);

    store.retire_backup_blocks(10).await.unwrap();
    store.remove_backup_blocks_from(12).await.unwrap();
    let heights: Vec<u32> = store
        .backup_blocks()
        .await
        .unwrap()
        .iter()
        .map(|b| b.height)
        .collect();
    assert_eq!(heights, vec![11]);
}

#[tokio::test]
async fn identities_increase_and_are_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .append_coins(
            CoinPartition::Addressed,
            &[
                coin("aa01", 0, 10, "addr1"),
                coin("aa01", 1, 10, "addr1"),
                coin("aa01", 2, 10, "addr1"),
            ],
        )
        .await
        .unwrap();
    let ids: Vec<i64> = partition_rows(&store).await.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // Deleting rows must not free their identities.
    store
        .remove_coins_from_height(CoinPartition::Addressed, 0)
        .await
        .unwrap();
    store
        .append_coins(CoinPartition::Addressed, &[coin("bb02", 0, 11, "addr2")])
        .await
        .unwrap();
    let ids: Vec<i64> = partition_rows(&store).await.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![4]);

    // And the sequence survives a close-and-reopen.
    drop(store);
    let store = CoinStore::open(dir.path(), config()).await.unwrap();
    store
        .append_coins(CoinPartition::Addressed, &[coin("cc03", 0, 12, "addr3")])
        .await
        .unwrap();
    let ids: Vec<i64> = partition_rows(&store).await.iter().map(|r| r.0).collect();
    assert_eq!(ids, vec![4, 5]);
}

#[tokio::test]
async fn partition_sequences_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .append_coins(
            CoinPartition::Addressed,
            &[coin("aa01", 0, 10, "addr1"), coin("aa01", 1, 10, "addr1")],
        )
        .await
        .unwrap();
    store
        .append_coins(
            CoinPartition::NoAddress,
            &[Coin {
                addresses: vec![],
                ..coin("bb02", 0, 10, "")
            }],
        )
        .await
        .unwrap();

    let (noaddr_id,): (i64,) = sqlx::query_as("SELECT id FROM coins_noaddr")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(noaddr_id, 1, "each partition counts from its own sequence");
}

#[tokio::test]
async fn duplicate_outpoints_rejected_unless_chain_allows_them() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .append_coins(CoinPartition::Addressed, &[coin("aa01", 0, 10, "addr1")])
        .await
        .unwrap();
    let duplicate = store
        .append_coins(CoinPartition::Addressed, &[coin("aa01", 0, 11, "addr1")])
        .await;
    assert!(duplicate.is_err(), "duplicate (tx_id, pos) must violate the unique index");

    // A chain with duplicated pre-activation coinbases relaxes the
    // addressed-partition constraint.
    let dir = tempfile::tempdir().unwrap();
    let lax = Config {
        traits: ChainTraits {
            unique_coinbase_txids: false,
            ..ChainTraits::default()
        },
        ..config()
    };
    let store = CoinStore::open(dir.path(), lax).await.unwrap();
    store
        .append_coins(CoinPartition::Addressed, &[coin("aa01", 0, 10, "addr1")])
        .await
        .unwrap();
    store
        .append_coins(CoinPartition::Addressed, &[coin("aa01", 0, 11, "addr1")])
        .await
        .unwrap();
    assert_eq!(store.coin_count(CoinPartition::Addressed).await.unwrap(), 2);

    // Other partitions stay strict regardless.
    let bare = Coin {
        addresses: vec![],
        ..coin("bb02", 0, 10, "")
    };
    store
        .append_coins(CoinPartition::NoAddress, &[bare.clone()])
        .await
        .unwrap();
    assert!(store
        .append_coins(CoinPartition::NoAddress, &[bare])
        .await
        .is_err());
}

#[tokio::test]
async fn empty_batches_are_no_ops() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .append_coins(CoinPartition::Addressed, &[])
        .await
        .unwrap();
    store.backup_spend(&[]).await.unwrap();
    store.add_backup_blocks(&[]).await.unwrap();

    // No identities were consumed.
    store
        .append_coins(CoinPartition::Addressed, &[coin("aa01", 0, 10, "addr1")])
        .await
        .unwrap();
    let rows = partition_rows(&store).await;
    assert_eq!(rows[0].0, 1);
}
