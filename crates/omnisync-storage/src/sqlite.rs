//! SQLite sync store.
//!
//! Persists blocks, logs, transactions, receipts, traces, fragment intervals
//! and cached RPC results to a single SQLite file. Records are stored as JSON
//! next to the columns the engine queries on. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use omnisync_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./sync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use omnisync_core::error::SyncError;
use omnisync_core::filter::{Factory, Fragment};
use omnisync_core::interval::{self, Interval};
use omnisync_core::store::{EventPage, EventQuery, LogRecord, SyncBatch, SyncStore};
use omnisync_core::types::{Block, Log, Trace, Transaction, TransactionReceipt};

use crate::events::{self, ChildIndex};

/// Logs fetched per round trip while paging events.
const LOG_CHUNK: i64 = 1_000;

fn storage_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn int(value: u64) -> Result<i64, SyncError> {
    i64::try_from(value).map_err(|_| SyncError::Storage(format!("{value} does not fit in SQLite")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    serde_json::to_string(value).map_err(storage_err)
}

fn from_json<T: DeserializeOwned>(json: &str) -> Result<T, SyncError> {
    serde_json::from_str(json).map_err(storage_err)
}

/// SQLite-backed [`SyncStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./sync.db"`) or a full
    /// SQLite URL (`"sqlite:./sync.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Limited to one connection so every query sees the same database. All
    /// data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id     INTEGER NOT NULL,
                number       INTEGER NOT NULL,
                hash         TEXT    NOT NULL,
                body         TEXT    NOT NULL,
                PRIMARY KEY (chain_id, number)
            );",
            "CREATE TABLE IF NOT EXISTS logs (
                chain_id     INTEGER NOT NULL,
                id           TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                address      TEXT    NOT NULL,
                topic0       TEXT,
                checkpoint   TEXT,
                body         TEXT    NOT NULL,
                PRIMARY KEY (chain_id, id)
            );",
            "CREATE INDEX IF NOT EXISTS idx_logs_checkpoint ON logs (checkpoint);",
            "CREATE INDEX IF NOT EXISTS idx_logs_factory ON logs (chain_id, address, topic0);",
            "CREATE TABLE IF NOT EXISTS transactions (
                chain_id     INTEGER NOT NULL,
                hash         TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                body         TEXT    NOT NULL,
                PRIMARY KEY (chain_id, hash)
            );",
            "CREATE TABLE IF NOT EXISTS transaction_receipts (
                chain_id         INTEGER NOT NULL,
                transaction_hash TEXT    NOT NULL,
                block_number     INTEGER NOT NULL,
                body             TEXT    NOT NULL,
                PRIMARY KEY (chain_id, transaction_hash)
            );",
            "CREATE TABLE IF NOT EXISTS traces (
                chain_id         INTEGER NOT NULL,
                transaction_hash TEXT    NOT NULL,
                trace_index      INTEGER NOT NULL,
                block_number     INTEGER NOT NULL,
                body             TEXT    NOT NULL,
                PRIMARY KEY (chain_id, transaction_hash, trace_index)
            );",
            "CREATE TABLE IF NOT EXISTS intervals (
                chain_id     INTEGER NOT NULL,
                fragment_id  TEXT    NOT NULL,
                start_block  INTEGER NOT NULL,
                end_block    INTEGER NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_intervals_fragment ON intervals (chain_id, fragment_id);",
            "CREATE TABLE IF NOT EXISTS rpc_request_results (
                chain_id     INTEGER NOT NULL,
                request      TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                result       TEXT    NOT NULL,
                PRIMARY KEY (chain_id, request)
            );",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // ─── Inspection ─────────────────────────────────────────────────────────────

    /// Every fragment stored for a chain with its intervals.
    pub async fn fragment_intervals(
        &self,
        chain_id: u64,
    ) -> Result<BTreeMap<String, Vec<Interval>>, SyncError> {
        let rows = sqlx::query(
            "SELECT fragment_id, start_block, end_block FROM intervals
             WHERE chain_id = ? ORDER BY fragment_id, start_block",
        )
        .bind(int(chain_id)?)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut fragments: BTreeMap<String, Vec<Interval>> = BTreeMap::new();
        for row in rows {
            fragments
                .entry(row.get("fragment_id"))
                .or_default()
                .push((
                    row.get::<i64, _>("start_block") as u64,
                    row.get::<i64, _>("end_block") as u64,
                ));
        }
        Ok(fragments)
    }

    /// Number of stored event logs.
    pub async fn event_count(&self) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM logs WHERE checkpoint IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    // ─── Reads used by event paging ─────────────────────────────────────────────

    async fn child_index(&self, factories: &[&Factory], chain_id: u64) -> Result<ChildIndex, SyncError> {
        let mut index = ChildIndex::default();
        for factory in factories {
            let rows = sqlx::query(
                "SELECT body FROM logs WHERE chain_id = ? AND address = ? AND topic0 = ?",
            )
            .bind(int(chain_id)?)
            .bind(factory.address.to_ascii_lowercase())
            .bind(factory.event_selector.to_ascii_lowercase())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
            for row in rows {
                let log: Log = from_json(row.get::<&str, _>("body"))?;
                index.observe(factory, &log);
            }
        }
        Ok(index)
    }

    async fn block(&self, chain_id: u64, number: u64) -> Result<Option<Block>, SyncError> {
        let row = sqlx::query("SELECT body FROM blocks WHERE chain_id = ? AND number = ?")
            .bind(int(chain_id)?)
            .bind(int(number)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| from_json(r.get::<&str, _>("body"))).transpose()
    }

    async fn transaction(&self, chain_id: u64, hash: &str) -> Result<Option<Transaction>, SyncError> {
        let row = sqlx::query("SELECT body FROM transactions WHERE chain_id = ? AND hash = ?")
            .bind(int(chain_id)?)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| from_json(r.get::<&str, _>("body"))).transpose()
    }
}

// ─── Writes (shared by single inserts and batches) ──────────────────────────

async fn write_blocks(
    conn: &mut SqliteConnection,
    chain_id: u64,
    blocks: &[Block],
) -> Result<(), SyncError> {
    for block in blocks {
        sqlx::query(
            "INSERT OR REPLACE INTO blocks (chain_id, number, hash, body) VALUES (?, ?, ?, ?)",
        )
        .bind(int(chain_id)?)
        .bind(int(block.number)?)
        .bind(&block.hash)
        .bind(to_json(&block.without_transactions())?)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn write_logs(
    conn: &mut SqliteConnection,
    chain_id: u64,
    logs: &[LogRecord],
) -> Result<(), SyncError> {
    for record in logs {
        let log = &record.log;
        sqlx::query(
            "INSERT INTO logs (chain_id, id, block_number, address, topic0, checkpoint, body)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain_id, id) DO UPDATE SET
                checkpoint = COALESCE(excluded.checkpoint, logs.checkpoint),
                body = excluded.body",
        )
        .bind(int(chain_id)?)
        .bind(log.id())
        .bind(int(log.block_number)?)
        .bind(log.address.to_ascii_lowercase())
        .bind(log.topic0().map(str::to_ascii_lowercase))
        .bind(record.checkpoint.as_deref())
        .bind(to_json(log)?)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn write_transactions(
    conn: &mut SqliteConnection,
    chain_id: u64,
    transactions: &[Transaction],
) -> Result<(), SyncError> {
    for tx in transactions {
        sqlx::query(
            "INSERT OR REPLACE INTO transactions (chain_id, hash, block_number, body)
             VALUES (?, ?, ?, ?)",
        )
        .bind(int(chain_id)?)
        .bind(&tx.hash)
        .bind(int(tx.block_number)?)
        .bind(to_json(tx)?)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn write_receipts(
    conn: &mut SqliteConnection,
    chain_id: u64,
    receipts: &[TransactionReceipt],
) -> Result<(), SyncError> {
    for receipt in receipts {
        sqlx::query(
            "INSERT OR REPLACE INTO transaction_receipts
             (chain_id, transaction_hash, block_number, body) VALUES (?, ?, ?, ?)",
        )
        .bind(int(chain_id)?)
        .bind(&receipt.transaction_hash)
        .bind(int(receipt.block_number)?)
        .bind(to_json(receipt)?)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

async fn write_traces(
    conn: &mut SqliteConnection,
    chain_id: u64,
    traces: &[Trace],
) -> Result<(), SyncError> {
    for trace in traces {
        sqlx::query(
            "INSERT OR REPLACE INTO traces
             (chain_id, transaction_hash, trace_index, block_number, body) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(int(chain_id)?)
        .bind(&trace.transaction_hash)
        .bind(i64::from(trace.trace_index))
        .bind(int(trace.block_number)?)
        .bind(to_json(trace)?)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    }
    Ok(())
}

/// Replace each fragment's stored set with its union with the new intervals.
async fn write_intervals(
    conn: &mut SqliteConnection,
    chain_id: u64,
    intervals: &[(Fragment, Interval)],
) -> Result<(), SyncError> {
    let mut by_fragment: BTreeMap<&str, Vec<Interval>> = BTreeMap::new();
    for (fragment, range) in intervals {
        by_fragment.entry(fragment.id.as_str()).or_default().push(*range);
    }

    for (fragment_id, mut merged) in by_fragment {
        let rows = sqlx::query(
            "SELECT start_block, end_block FROM intervals WHERE chain_id = ? AND fragment_id = ?",
        )
        .bind(int(chain_id)?)
        .bind(fragment_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err)?;
        merged.extend(rows.iter().map(|row| {
            (
                row.get::<i64, _>("start_block") as u64,
                row.get::<i64, _>("end_block") as u64,
            )
        }));

        sqlx::query("DELETE FROM intervals WHERE chain_id = ? AND fragment_id = ?")
            .bind(int(chain_id)?)
            .bind(fragment_id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        for (start, end) in interval::union(&merged) {
            sqlx::query(
                "INSERT INTO intervals (chain_id, fragment_id, start_block, end_block)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(int(chain_id)?)
            .bind(fragment_id)
            .bind(int(start)?)
            .bind(int(end)?)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

// ─── SyncStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl SyncStore for SqliteStore {
    async fn insert_blocks(&self, chain_id: u64, blocks: &[Block]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_blocks(&mut *tx, chain_id, blocks).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn insert_logs(&self, chain_id: u64, logs: &[LogRecord]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_logs(&mut *tx, chain_id, logs).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn insert_transactions(
        &self,
        chain_id: u64,
        transactions: &[Transaction],
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_transactions(&mut *tx, chain_id, transactions).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn insert_transaction_receipts(
        &self,
        chain_id: u64,
        receipts: &[TransactionReceipt],
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_receipts(&mut *tx, chain_id, receipts).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn insert_traces(&self, chain_id: u64, traces: &[Trace]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_traces(&mut *tx, chain_id, traces).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn insert_intervals(
        &self,
        chain_id: u64,
        intervals: &[(Fragment, Interval)],
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_intervals(&mut *tx, chain_id, intervals).await?;
        tx.commit().await.map_err(storage_err)
    }

    async fn insert_batch(&self, batch: SyncBatch) -> Result<(), SyncError> {
        let chain_id = batch.chain_id;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        write_blocks(&mut *tx, chain_id, &batch.blocks).await?;
        write_logs(&mut *tx, chain_id, &batch.logs).await?;
        write_transactions(&mut *tx, chain_id, &batch.transactions).await?;
        write_receipts(&mut *tx, chain_id, &batch.transaction_receipts).await?;
        write_traces(&mut *tx, chain_id, &batch.traces).await?;
        write_intervals(&mut *tx, chain_id, &batch.intervals).await?;
        tx.commit().await.map_err(storage_err)?;

        debug!(
            chain_id,
            blocks = batch.blocks.len(),
            logs = batch.logs.len(),
            intervals = batch.intervals.len(),
            "batch stored"
        );
        Ok(())
    }

    async fn get_intervals(
        &self,
        chain_id: u64,
        fragments: &[Fragment],
    ) -> Result<Vec<Vec<Interval>>, SyncError> {
        let mut result = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let rows = sqlx::query(
                "SELECT start_block, end_block FROM intervals
                 WHERE chain_id = ? AND fragment_id = ? ORDER BY start_block",
            )
            .bind(int(chain_id)?)
            .bind(&fragment.id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
            let stored: Vec<Interval> = rows
                .iter()
                .map(|row| {
                    (
                        row.get::<i64, _>("start_block") as u64,
                        row.get::<i64, _>("end_block") as u64,
                    )
                })
                .collect();
            result.push(interval::union(&stored));
        }
        Ok(result)
    }

    async fn get_events(&self, query: &EventQuery) -> Result<EventPage, SyncError> {
        let mut events_out = Vec::new();
        if query.from >= query.to {
            return Ok(EventPage {
                events: events_out,
                cursor: query.to.clone(),
            });
        }

        let mut indexes: HashMap<u64, ChildIndex> = HashMap::new();
        let mut after = query.from.clone();
        loop {
            let rows = sqlx::query(
                "SELECT chain_id, checkpoint, body FROM logs
                 WHERE checkpoint > ? AND checkpoint <= ?
                 ORDER BY checkpoint LIMIT ?",
            )
            .bind(&after)
            .bind(&query.to)
            .bind(LOG_CHUNK)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
            let exhausted = (rows.len() as i64) < LOG_CHUNK;

            for row in rows {
                let chain_id = row.get::<i64, _>("chain_id") as u64;
                let checkpoint: String = row.get("checkpoint");
                let log: Log = from_json(row.get::<&str, _>("body"))?;

                if !indexes.contains_key(&chain_id) {
                    let factories = events::factories_for(&query.sources, chain_id);
                    let index = self.child_index(&factories, chain_id).await?;
                    indexes.insert(chain_id, index);
                }
                let Some(children) = indexes.get(&chain_id) else {
                    continue;
                };
                let sources = events::matching_sources(&query.sources, chain_id, &log, children);
                if !sources.is_empty() {
                    let block = self.block(chain_id, log.block_number).await?;
                    let transaction = self.transaction(chain_id, &log.transaction_hash).await?;
                    events_out.extend(events::build_events(
                        &sources,
                        chain_id,
                        &checkpoint,
                        &log,
                        block.as_ref(),
                        transaction.as_ref(),
                    )?);
                }

                if events_out.len() >= query.limit {
                    return Ok(EventPage {
                        events: events_out,
                        cursor: checkpoint,
                    });
                }
                after = checkpoint;
            }

            if exhausted {
                return Ok(EventPage {
                    events: events_out,
                    cursor: query.to.clone(),
                });
            }
        }
    }

    async fn get_child_addresses(
        &self,
        chain_id: u64,
        factory: &Factory,
        to_block: u64,
    ) -> Result<Vec<String>, SyncError> {
        let index = self.child_index(&[factory], chain_id).await?;
        Ok(index.addresses(factory, to_block))
    }

    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
        result: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO rpc_request_results (chain_id, request, block_number, result)
             VALUES (?, ?, ?, ?)",
        )
        .bind(int(chain_id)?)
        .bind(request)
        .bind(int(block_number)?)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        request: &str,
    ) -> Result<Option<String>, SyncError> {
        let row = sqlx::query(
            "SELECT result FROM rpc_request_results WHERE chain_id = ? AND request = ?",
        )
        .bind(int(chain_id)?)
        .bind(request)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.map(|r| r.get::<String, _>("result")))
    }

    async fn prune_rpc_request_result(
        &self,
        chain_id: u64,
        block_numbers: &[u64],
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for number in block_numbers {
            sqlx::query("DELETE FROM rpc_request_results WHERE chain_id = ? AND block_number = ?")
                .bind(int(chain_id)?)
                .bind(int(*number)?)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }

    async fn prune_by_chain(&self, chain_id: u64, from_block: u64) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for table in [
            "blocks",
            "logs",
            "transactions",
            "transaction_receipts",
            "traces",
            "rpc_request_results",
        ] {
            let column = if table == "blocks" { "number" } else { "block_number" };
            sqlx::query(&format!("DELETE FROM {table} WHERE chain_id = ? AND {column} >= ?"))
                .bind(int(chain_id)?)
                .bind(int(from_block)?)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        sqlx::query("DELETE FROM intervals WHERE chain_id = ? AND start_block >= ?")
            .bind(int(chain_id)?)
            .bind(int(from_block)?)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if let Some(last) = from_block.checked_sub(1) {
            sqlx::query("UPDATE intervals SET end_block = ? WHERE chain_id = ? AND end_block > ?")
                .bind(int(last)?)
                .bind(int(chain_id)?)
                .bind(int(last)?)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(chain_id, from_block, "pruned chain data");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
