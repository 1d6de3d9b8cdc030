//! Open/close lifecycle, facts, chain identity and mempool-mirror tests.

use coindex_primitives::{
    BlockInfo, Coin, Config, Payload, PendingCoin, PendingPayload, PendingSpend,
};
use coindex_store::{CoinPartition, CoinStore, Error};

fn config() -> Config {
    Config {
        coin: "btc".into(),
        network: "regtest".into(),
        ..Config::default()
    }
}

fn pending_coin(tx_id: &str, pos: u32) -> PendingCoin {
    PendingCoin {
        tx_id: tx_id.into(),
        pos,
        value: 1_000,
        script: "00".into(),
        addresses: vec!["addr".into()],
    }
}

fn pending_spend(tx_id: &str, spent_tx_id: &str) -> PendingSpend {
    PendingSpend {
        tx_id: tx_id.into(),
        spent_tx_id: spent_tx_id.into(),
        pos: 0,
        height: 10,
        addresses: vec!["addr".into()],
    }
}

async fn count(store: &CoinStore, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(store.pool()).await.unwrap();
    count
}

#[tokio::test]
async fn facts_upsert_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    assert_eq!(store.fact::<String>("greeting").await.unwrap(), None);
    store.set_fact("greeting", &"hello").await.unwrap();
    store.set_fact("greeting", &"goodbye").await.unwrap();
    assert_eq!(
        store.fact::<String>("greeting").await.unwrap(),
        Some("goodbye".into())
    );

    store.delete_fact("greeting").await.unwrap();
    assert_eq!(store.fact::<String>("greeting").await.unwrap(), None);
}

#[tokio::test]
async fn block_info_facts_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    assert!(store.last_recorded_block().await.unwrap().is_none());
    let info = BlockInfo {
        height: 812_345,
        hash: "deadbeef".into(),
        time: 1_700_000_000,
    };
    store.set_last_recorded_block(&info).await.unwrap();
    store.set_last_safe_block(&info).await.unwrap();
    assert_eq!(store.last_recorded_block().await.unwrap(), Some(info.clone()));
    assert_eq!(store.last_safe_block().await.unwrap(), Some(info));
}

#[tokio::test]
async fn version_mismatch_on_populated_ledger_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();
    store
        .set_last_recorded_block(&BlockInfo {
            height: 1,
            hash: "h1".into(),
            time: 0,
        })
        .await
        .unwrap();
    // An older build wrote this ledger.
    store.set_db_version(2).await.unwrap();
    drop(store);

    let err = CoinStore::open(dir.path(), config()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::VersionMismatch {
            expected: 3,
            found: 2
        }
    ));
}

#[tokio::test]
async fn chain_identity_is_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();
    drop(store);

    // Same identity reopens fine.
    let store = CoinStore::open(dir.path(), config()).await.unwrap();
    drop(store);

    // A different network resolves to its own database file, so corrupt the
    // recorded identity directly to simulate a swapped-out backend.
    let store = CoinStore::open(dir.path(), config()).await.unwrap();
    store
        .set_fact(
            "coin",
            &coindex_primitives::ChainIdentity {
                coin: "btc".into(),
                network: "testnet".into(),
            },
        )
        .await
        .unwrap();
    drop(store);
    let err = CoinStore::open(dir.path(), config()).await.unwrap_err();
    assert!(matches!(err, Error::ChainIdentityMismatch { .. }));
}

#[tokio::test]
async fn disabled_partitions_are_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let no_multisig = Config {
        support_multisig: false,
        ..config()
    };
    let store = CoinStore::open(dir.path(), no_multisig).await.unwrap();

    assert_eq!(
        store.partitions(),
        &[CoinPartition::Addressed, CoinPartition::NoAddress]
    );
    let err = store
        .append_coins(
            CoinPartition::Multisig,
            &[Coin {
                tx_id: "aa01".into(),
                pos: 0,
                value: 1,
                height: 1,
                script: "00".into(),
                addresses: vec![],
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitionDisabled("coins_multisig")));

    let err = store.append_payloads(&[]).await.unwrap_err();
    assert!(matches!(err, Error::PartitionDisabled("payloads")));
}

#[tokio::test]
async fn confirmation_purges_pending_records_across_all_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .add_pending_coins(CoinPartition::Addressed, &[pending_coin("aa01", 0)])
        .await
        .unwrap();
    store
        .add_pending_coins(
            CoinPartition::NoAddress,
            &[PendingCoin {
                addresses: vec![],
                ..pending_coin("aa01", 1)
            }],
        )
        .await
        .unwrap();
    store
        .add_pending_spends(CoinPartition::Addressed, &[pending_spend("aa01", "ff99")])
        .await
        .unwrap();
    store
        .add_pending_coins(CoinPartition::Addressed, &[pending_coin("bb02", 0)])
        .await
        .unwrap();

    store
        .remove_pending_by_txids(&["aa01".to_string()])
        .await
        .unwrap();

    assert_eq!(count(&store, "pending_coins").await, 1);
    assert_eq!(count(&store, "pending_coins_noaddr").await, 0);
    assert_eq!(count(&store, "pending_spents").await, 0);

    // Unrelated transactions are untouched.
    let (tx_id,): (String,) = sqlx::query_as("SELECT tx_id FROM pending_coins")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(tx_id, "bb02");
}

#[tokio::test]
async fn remove_all_pending_clears_the_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();

    store
        .add_pending_coins(CoinPartition::Addressed, &[pending_coin("aa01", 0)])
        .await
        .unwrap();
    store
        .add_pending_spends(CoinPartition::NoAddress, &[PendingSpend {
            addresses: vec![],
            ..pending_spend("bb02", "ff99")
        }])
        .await
        .unwrap();

    store.remove_all_pending().await.unwrap();
    assert_eq!(count(&store, "pending_coins").await, 0);
    assert_eq!(count(&store, "pending_spents_noaddr").await, 0);
}

#[tokio::test]
async fn spend_mode_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let store = CoinStore::open(dir.path(), config()).await.unwrap();
    // resolve_spending mode: the bare table does not exist.
    let err = store
        .add_pending_spends_bare(&[pending_spend("aa01", "ff99")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitionDisabled("pending_spents_bare")));
    drop(store);

    let dir = tempfile::tempdir().unwrap();
    let bare_mode = Config {
        resolve_spending: false,
        ..config()
    };
    let store = CoinStore::open(dir.path(), bare_mode).await.unwrap();
    store
        .add_pending_spends_bare(&[pending_spend("aa01", "ff99")])
        .await
        .unwrap();
    assert_eq!(count(&store, "pending_spents_bare").await, 1);

    let err = store
        .add_pending_spends(CoinPartition::Addressed, &[pending_spend("bb02", "ff98")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitionDisabled("pending_spents")));
}

#[tokio::test]
async fn payload_partitions_follow_coins_through_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let with_payload = Config {
        support_payload: true,
        ..config()
    };
    let store = CoinStore::open(dir.path(), with_payload).await.unwrap();

    store
        .append_payloads(&[
            Payload {
                tx_id: "aa01".into(),
                pos: 0,
                address: "addr".into(),
                hint: "profile".into(),
                subhint: None,
                height: 99,
            },
            Payload {
                tx_id: "bb02".into(),
                pos: 0,
                address: "addr".into(),
                hint: "profile".into(),
                subhint: Some("v2".into()),
                height: 100,
            },
        ])
        .await
        .unwrap();
    store
        .add_pending_payloads(&[PendingPayload {
            tx_id: "cc03".into(),
            pos: 0,
            address: "addr".into(),
            hint: "profile".into(),
            subhint: None,
        }])
        .await
        .unwrap();

    store.rollback_from(100).await.unwrap();
    assert_eq!(count(&store, "payloads").await, 1);

    store
        .remove_pending_by_txids(&["cc03".to_string()])
        .await
        .unwrap();
    assert_eq!(count(&store, "pending_payloads").await, 0);
}
