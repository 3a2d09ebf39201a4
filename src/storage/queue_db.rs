use crate::types::{lower_hex, CreatedContract, QueuedContract};
use alloy::primitives::{Address, B256};
use anyhow::Context;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

/// Durable mirror of the scan queue. Every call is synchronous and independent.
pub trait QueueStore: Send + Sync {
    /// Inserts the contract, or overwrites a previous record for the same address.
    fn add(&self, contract: &CreatedContract, priority: u8) -> anyhow::Result<()>;
    fn update_priority(&self, address: Address, priority: u8) -> anyhow::Result<()>;
    fn delete(&self, address: Address) -> anyhow::Result<()>;
    /// Every stored item, oldest first.
    fn list_all(&self) -> anyhow::Result<Vec<QueuedContract>>;
    fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    path: PathBuf,
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn decode_row(
    address: &str,
    deployer: &str,
    block_number: i64,
    timestamp: i64,
    tx_hash: &str,
    priority: i64,
) -> anyhow::Result<QueuedContract> {
    Ok(QueuedContract {
        contract: CreatedContract {
            address: Address::from_str(address)
                .with_context(|| format!("invalid stored address {address}"))?,
            deployer: Address::from_str(deployer)
                .with_context(|| format!("invalid stored deployer {deployer}"))?,
            block_number: from_i64(block_number),
            timestamp: from_i64(timestamp),
            tx_hash: B256::from_str(tx_hash)
                .with_context(|| format!("invalid stored tx hash {tx_hash}"))?,
        },
        priority: u8::try_from(priority).unwrap_or(u8::MAX),
    })
}

impl SqliteQueueStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS contracts (
                    address TEXT PRIMARY KEY NOT NULL,
                    deployer TEXT NOT NULL,
                    block_number INTEGER NOT NULL,
                    timestamp INTEGER NOT NULL,
                    tx_hash TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    inserted_seq INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_contracts_priority ON contracts(priority, inserted_seq);
                "#,
            )?;
            match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            }) {
                Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
                Ok(mode) => tracing::warn!("[QUEUE] SQLite kept journal_mode={}", mode),
                Err(err) => tracing::warn!("[QUEUE] Failed to enable WAL journaling: {}", err),
            }
            if let Err(err) = conn.pragma_update(None, "synchronous", "NORMAL") {
                tracing::warn!("[QUEUE] Failed to set synchronous=NORMAL: {}", err);
            }
            Ok(())
        })
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let max_attempts = 6u32;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            let conn = Connection::open(&self.path).with_context(|| {
                format!("failed to open sqlite database {}", self.path.display())
            })?;
            conn.busy_timeout(Duration::from_millis(5_000))
                .context("failed to configure sqlite busy timeout")?;

            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err.to_string();
                    if is_sqlite_locked_error(&err) && attempt < max_attempts {
                        continue;
                    }
                    return Err(anyhow::anyhow!(
                        "{} failed for {}: {}",
                        context,
                        self.path.display(),
                        last_err
                    ));
                }
            }
        }

        Err(anyhow::anyhow!(
            "{} failed for {} after {} attempt(s): {}",
            context,
            self.path.display(),
            max_attempts,
            last_err
        ))
    }
}

impl QueueStore for SqliteQueueStore {
    fn add(&self, contract: &CreatedContract, priority: u8) -> anyhow::Result<()> {
        let address = lower_hex(contract.address);
        let deployer = lower_hex(contract.deployer);
        let tx_hash = format!("{:#x}", contract.tx_hash);
        self.with_connection("add", |conn| {
            conn.execute(
                r#"
                INSERT INTO contracts (address, deployer, block_number, timestamp, tx_hash, priority, inserted_seq)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                        (SELECT COALESCE(MAX(inserted_seq), 0) + 1 FROM contracts))
                ON CONFLICT(address) DO UPDATE SET
                    deployer = excluded.deployer,
                    block_number = excluded.block_number,
                    timestamp = excluded.timestamp,
                    tx_hash = excluded.tx_hash,
                    priority = excluded.priority
                "#,
                params![
                    address,
                    deployer,
                    to_i64(contract.block_number),
                    to_i64(contract.timestamp),
                    tx_hash,
                    i64::from(priority),
                ],
            )
        })
        .map(|_| ())
    }

    fn update_priority(&self, address: Address, priority: u8) -> anyhow::Result<()> {
        let address = lower_hex(address);
        self.with_connection("update_priority", |conn| {
            conn.execute(
                "UPDATE contracts SET priority = ?1 WHERE address = ?2",
                params![i64::from(priority), address],
            )
        })
        .map(|_| ())
    }

    fn delete(&self, address: Address) -> anyhow::Result<()> {
        let address = lower_hex(address);
        self.with_connection("delete", |conn| {
            conn.execute("DELETE FROM contracts WHERE address = ?1", params![address])
        })
        .map(|_| ())
    }

    fn list_all(&self) -> anyhow::Result<Vec<QueuedContract>> {
        let rows = self.with_connection("list_all", |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT address, deployer, block_number, timestamp, tx_hash, priority
                FROM contracts
                ORDER BY inserted_seq ASC
                "#,
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut out = Vec::with_capacity(rows.len());
        for (address, deployer, block_number, timestamp, tx_hash, priority) in rows {
            match decode_row(&address, &deployer, block_number, timestamp, &tx_hash, priority) {
                Ok(item) => out.push(item),
                Err(err) => tracing::warn!("[QUEUE] Skipping unreadable stored contract: {err:#}"),
            }
        }
        Ok(out)
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.with_connection("clear", |conn| conn.execute("DELETE FROM contracts", []))
            .map(|_| ())
    }
}

fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
        }
        _ => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Volatile store for development runs. Insertion order is kept for `list_all`.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_seq: u64,
    items: BTreeMap<Address, (u64, QueuedContract)>,
}

impl InMemoryQueueStore {
    fn state(&self) -> anyhow::Result<std::sync::MutexGuard<'_, InMemoryState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory queue store lock poisoned"))
    }
}

impl QueueStore for InMemoryQueueStore {
    fn add(&self, contract: &CreatedContract, priority: u8) -> anyhow::Result<()> {
        let mut state = self.state()?;
        let seq = match state.items.get(&contract.address) {
            Some((seq, _)) => *seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        state.items.insert(
            contract.address,
            (
                seq,
                QueuedContract {
                    contract: contract.clone(),
                    priority,
                },
            ),
        );
        Ok(())
    }

    fn update_priority(&self, address: Address, priority: u8) -> anyhow::Result<()> {
        if let Some((_, item)) = self.state()?.items.get_mut(&address) {
            item.priority = priority;
        }
        Ok(())
    }

    fn delete(&self, address: Address) -> anyhow::Result<()> {
        self.state()?.items.remove(&address);
        Ok(())
    }

    fn list_all(&self) -> anyhow::Result<Vec<QueuedContract>> {
        let state = self.state()?;
        let mut items: Vec<_> = state.items.values().cloned().collect();
        items.sort_by_key(|(seq, _)| *seq);
        Ok(items.into_iter().map(|(_, item)| item).collect())
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.state()?.items.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryQueueStore, QueueStore, SqliteQueueStore};
    use crate::types::CreatedContract;
    use alloy::primitives::{Address, B256};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
    }

    fn contract(byte: u8) -> CreatedContract {
        CreatedContract {
            address: Address::repeat_byte(byte),
            deployer: Address::repeat_byte(0xd0),
            block_number: 100 + u64::from(byte),
            timestamp: 1_700_000_000,
            tx_hash: B256::repeat_byte(byte),
        }
    }

    fn exercise(store: &dyn QueueStore) {
        store.add(&contract(1), 9).expect("add 1");
        store.add(&contract(2), 9).expect("add 2");
        store.add(&contract(3), 9).expect("add 3");
        store.update_priority(contract(2).address, 1).expect("update");
        store.delete(contract(1).address).expect("delete");

        let items = store.list_all().expect("list");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].contract, contract(2));
        assert_eq!(items[0].priority, 1);
        assert_eq!(items[1].contract, contract(3));
        assert_eq!(items[1].priority, 9);

        // Re-adding keeps a single record.
        store.add(&contract(3), 4).expect("re-add");
        let items = store.list_all().expect("list");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].priority, 4);

        store.clear().expect("clear");
        assert!(store.list_all().expect("list").is_empty());
    }

    #[test]
    fn test_sqlite_store_round_trip() {
        let path = temp_db_path("queue_store");
        let store = SqliteQueueStore::open(&path).expect("open");
        exercise(&store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_in_memory_store_round_trip() {
        exercise(&InMemoryQueueStore::default());
    }

    #[test]
    fn test_sqlite_store_uses_wal_journal() {
        let path = temp_db_path("queue_store_wal");
        let _store = SqliteQueueStore::open(&path).expect("open");
        let conn = rusqlite::Connection::open(&path).expect("reopen");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        drop(conn);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }
}
