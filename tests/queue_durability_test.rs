use alloy::primitives::{Address, B256};
use attack_simulation::alerts::{AlertSource, CorrelatedAlert};
use attack_simulation::scheduler::{AlertEffect, ScanScheduler, SchedulerConfig};
use attack_simulation::storage::queue_db::{QueueStore, SqliteQueueStore};
use attack_simulation::types::{CreatedContract, HIGH_PRIORITY, LOW_PRIORITY};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const T0: u64 = 1_700_000_000;

fn temp_db_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        default_priority: LOW_PRIORITY,
        waiting_secs: 24 * 3_600,
        target_mode: false,
    }
}

fn contract(byte: u8) -> CreatedContract {
    CreatedContract {
        address: Address::repeat_byte(byte),
        deployer: Address::repeat_byte(0xd0),
        block_number: 100,
        timestamp: T0,
        tx_hash: B256::repeat_byte(byte),
    }
}

fn scheduler_at(path: &PathBuf) -> ScanScheduler {
    let store = SqliteQueueStore::open(path).expect("open store");
    ScanScheduler::new(Arc::new(store), config())
}

#[tokio::test]
async fn test_restart_restores_unfinished_items_with_priorities() {
    let path = temp_db_path("queue_durability");
    let created: Vec<CreatedContract> = (1u8..=5).map(contract).collect();

    {
        let scheduler = scheduler_at(&path);
        assert_eq!(scheduler.restore().await.expect("restore"), 0);
        scheduler.on_block(T0, &created).await.expect("block");

        let alert = CorrelatedAlert {
            source: AlertSource::Flashloan,
            address: contract(4).address,
            priority: HIGH_PRIORITY,
            timestamp: T0,
        };
        assert_eq!(
            scheduler.on_alert(&alert).await.expect("alert"),
            AlertEffect::Reprioritized {
                from: LOW_PRIORITY,
                to: HIGH_PRIORITY
            }
        );

        // Finish one scan; the rest is left behind by the "crash".
        let first = scheduler.next().await.expect("first");
        assert_eq!(first, contract(4));
        scheduler.complete(first.address).await.expect("complete");

        let second = scheduler.next().await.expect("second");
        assert_eq!(second, contract(1));
        // In flight when the process dies: never completed, so it must come back.
    }

    let store = SqliteQueueStore::open(&path).expect("reopen");
    let stored = store.list_all().expect("list");
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|item| item.priority == LOW_PRIORITY));

    let scheduler = scheduler_at(&path);
    assert_eq!(scheduler.restore().await.expect("restore"), 4);
    assert_eq!(scheduler.len().await, 4);
    for byte in [1u8, 2, 3, 5] {
        assert_eq!(
            scheduler.priority_of(contract(byte).address).await,
            Some(LOW_PRIORITY)
        );
    }
    assert_eq!(scheduler.priority_of(contract(4).address).await, None);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_reprioritized_item_survives_restart_and_runs_first() {
    let path = temp_db_path("queue_reprioritized");

    {
        let scheduler = scheduler_at(&path);
        let created: Vec<CreatedContract> = (1u8..=3).map(contract).collect();
        scheduler.on_block(T0, &created).await.expect("block");
        let alert = CorrelatedAlert {
            source: AlertSource::Aztec,
            address: contract(3).address,
            priority: HIGH_PRIORITY,
            timestamp: T0,
        };
        scheduler.on_alert(&alert).await.expect("alert");
    }

    let scheduler = scheduler_at(&path);
    assert_eq!(scheduler.restore().await.expect("restore"), 3);
    assert_eq!(
        scheduler.priority_of(contract(3).address).await,
        Some(HIGH_PRIORITY)
    );

    let mut order = Vec::new();
    for _ in 0..3 {
        let next = scheduler.next().await.expect("item");
        scheduler.complete(next.address).await.expect("complete");
        order.push(next.address);
    }
    assert_eq!(
        order,
        vec![contract(3).address, contract(1).address, contract(2).address]
    );
    assert!(SqliteQueueStore::open(&path)
        .expect("reopen")
        .list_all()
        .expect("list")
        .is_empty());

    let _ = std::fs::remove_file(&path);
}
