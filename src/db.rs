// 🗄️ Follow Store - SQLite + WAL
//
// One process-wide handle, opened at startup and closed at shutdown.
// Every read or write goes through a scoped transaction acquired from the
// shared handle, so a reader never sees half of a pass applied.
//
// A file-backed store keeps one writer connection plus a few read-only
// connections. Under WAL a read transaction works from the last committed
// snapshot and never waits on the writer. An in-memory store has a single
// connection that serves both.
//
// A store tracks exactly one account. The first pass binds it and passes
// for any other account are refused.
//
// Tables:
//   tracked_account          the account this store belongs to
//   users                    peer id → profile JSON (+ fetched_at)
//   followers / following    peer id → live edge
//   unfollowers / unfollowing peer id → churn event
//   sync_passes              audit log, one row per pass

use crate::model::{CachedProfile, ChurnEvent, Direction, FollowEdge, Profile};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Read-only connections opened next to the writer for a file-backed store
pub const READ_CONNECTIONS: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// STORE HANDLE
// ============================================================================

pub struct Store {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store file and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        setup_database(&writer)?;

        let mut readers = Vec::with_capacity(READ_CONNECTIONS);
        for _ in 0..READ_CONNECTIONS {
            let conn = Connection::open(path)
                .with_context(|| format!("Failed to open reader on {}", path.display()))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "query_only", true)?;
            readers.push(Mutex::new(conn));
        }

        tracing::info!(path = %path.display(), readers = readers.len(), "store opened");

        Ok(Store {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;

        Ok(Store {
            writer: Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether reads run on their own connections, concurrently with a write
    pub fn has_read_connections(&self) -> bool {
        !self.readers.is_empty()
    }

    // First idle reader, otherwise round-robin
    fn reader(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer.lock();
        }
        for reader in &self.readers {
            if let Some(conn) = reader.try_lock() {
                return conn;
            }
        }
        let i = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[i].lock()
    }

    /// Run `f` inside a read transaction. Nothing it does is committed.
    pub fn read<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.reader();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let txn = Txn { tx };

        let out = f(&txn)?;
        txn.tx.rollback()?;

        Ok(out)
    }

    /// Run `f` inside a write transaction.
    /// Commits only if `f` succeeds; any error rolls the whole group back.
    pub fn write<T>(&self, f: impl FnOnce(&Txn<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = Txn { tx };

        let out = f(&txn)?;
        txn.tx.commit().context("Failed to commit store transaction")?;

        Ok(out)
    }

    /// Close every connection, surfacing the first pending error
    pub fn close(self) -> Result<()> {
        for reader in self.readers {
            reader
                .into_inner()
                .close()
                .map_err(|(_, e)| anyhow!("Failed to close store reader: {}", e))?;
        }

        let conn = self.writer.into_inner();
        conn.close()
            .map_err(|(_, e)| anyhow!("Failed to close store: {}", e))?;

        tracing::info!("store closed");
        Ok(())
    }
}

/// A scoped transaction with typed views over each table
pub struct Txn<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl<'c> Txn<'c> {
    pub fn edges(&self, direction: Direction) -> EdgeStore<'_> {
        EdgeStore {
            conn: &self.tx,
            direction,
        }
    }

    pub fn churn(&self, direction: Direction) -> ChurnStore<'_> {
        ChurnStore {
            conn: &self.tx,
            direction,
        }
    }

    pub fn profiles(&self) -> ProfileCache<'_> {
        ProfileCache { conn: &self.tx }
    }

    pub fn passes(&self) -> PassLog<'_> {
        PassLog { conn: &self.tx }
    }

    pub fn tracked_account(&self) -> TrackedAccount<'_> {
        TrackedAccount { conn: &self.tx }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Readers on other connections see the last commit instead of blocking
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tracked_account (
            slot INTEGER PRIMARY KEY CHECK (slot = 1),
            account_id TEXT NOT NULL,
            bound_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            fetched_at TEXT NOT NULL
        )",
        [],
    )?;

    for direction in Direction::ALL {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    observed_at TEXT NOT NULL,
                    followed_at TEXT,
                    rejoined_after TEXT
                )",
                direction.edge_table()
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    changed_at TEXT NOT NULL
                )",
                direction.churn_table()
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_passes (
            pass_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL,
            pages INTEGER NOT NULL,
            added INTEGER NOT NULL,
            removed INTEGER NOT NULL,
            error TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_passes_started ON sync_passes(started_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TIMESTAMP HELPERS
// ============================================================================

// Fixed-width UTC so text order matches time order
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_from_sql(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| ts_from_sql(idx, &s)).transpose()
}

// ============================================================================
// TRACKED ACCOUNT
// ============================================================================

/// The single account whose edges this store holds
pub struct TrackedAccount<'a> {
    conn: &'a Connection,
}

impl<'a> TrackedAccount<'a> {
    pub fn get(&self) -> Result<Option<String>> {
        let owner = self
            .conn
            .query_row("SELECT account_id FROM tracked_account WHERE slot = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(owner)
    }

    /// Bind the store to `account_id` if it is still unbound.
    /// Returns the current owner when it is a different account.
    pub fn bind(&self, account_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        match self.get()? {
            Some(owner) if owner == account_id => Ok(None),
            Some(owner) => Ok(Some(owner)),
            None => {
                self.conn.execute(
                    "INSERT INTO tracked_account (slot, account_id, bound_at) VALUES (1, ?1, ?2)",
                    params![account_id, ts_to_sql(&now)],
                )?;
                tracing::info!(account_id, "store bound to account");
                Ok(None)
            }
        }
    }
}

// ============================================================================
// EDGE STORE
// ============================================================================

/// Live edges for one direction: peer id → first observation
pub struct EdgeStore<'a> {
    conn: &'a Connection,
    direction: Direction,
}

impl<'a> EdgeStore<'a> {
    fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowEdge> {
        let observed_at: String = row.get(1)?;
        Ok(FollowEdge {
            peer_id: row.get(0)?,
            observed_at: ts_from_sql(1, &observed_at)?,
            followed_at: opt_ts_from_sql(2, row.get(2)?)?,
            rejoined_after: opt_ts_from_sql(3, row.get(3)?)?,
        })
    }

    pub fn get(&self, peer_id: &str) -> Result<Option<FollowEdge>> {
        let edge = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, observed_at, followed_at, rejoined_after FROM {} WHERE id = ?1",
                    self.direction.edge_table()
                ),
                [peer_id],
                Self::row_to_edge,
            )
            .optional()?;

        Ok(edge)
    }

    pub fn put(&self, edge: &FollowEdge) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, observed_at, followed_at, rejoined_after)
                 VALUES (?1, ?2, ?3, ?4)",
                self.direction.edge_table()
            ),
            params![
                edge.peer_id,
                ts_to_sql(&edge.observed_at),
                edge.followed_at.as_ref().map(ts_to_sql),
                edge.rejoined_after.as_ref().map(ts_to_sql),
            ],
        )?;

        Ok(())
    }

    /// Returns true when an edge was actually removed
    pub fn delete(&self, peer_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.direction.edge_table()),
            [peer_id],
        )?;

        Ok(n > 0)
    }

    /// Visit every edge in store order. Each call re-runs the scan.
    pub fn for_each(&self, mut visit: impl FnMut(FollowEdge) -> Result<()>) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, observed_at, followed_at, rejoined_after FROM {}",
            self.direction.edge_table()
        ))?;

        let rows = stmt.query_map([], Self::row_to_edge)?;
        for row in rows {
            visit(row?)?;
        }

        Ok(())
    }

    pub fn all(&self) -> Result<Vec<FollowEdge>> {
        let mut edges = Vec::new();
        self.for_each(|edge| {
            edges.push(edge);
            Ok(())
        })?;
        Ok(edges)
    }

    pub fn keys(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {}", self.direction.edge_table()))?;

        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;

        Ok(keys)
    }

    pub fn count(&self) -> Result<i64> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.direction.edge_table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ============================================================================
// CHURN STORE
// ============================================================================

/// Churn history for one direction: peer id → most recent loss
pub struct ChurnStore<'a> {
    conn: &'a Connection,
    direction: Direction,
}

impl<'a> ChurnStore<'a> {
    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChurnEvent> {
        let changed_at: String = row.get(1)?;
        Ok(ChurnEvent {
            peer_id: row.get(0)?,
            changed_at: ts_from_sql(1, &changed_at)?,
        })
    }

    pub fn get(&self, peer_id: &str) -> Result<Option<ChurnEvent>> {
        let event = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, changed_at FROM {} WHERE id = ?1",
                    self.direction.churn_table()
                ),
                [peer_id],
                Self::row_to_event,
            )
            .optional()?;

        Ok(event)
    }

    pub fn put(&self, event: &ChurnEvent) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, changed_at) VALUES (?1, ?2)",
                self.direction.churn_table()
            ),
            params![event.peer_id, ts_to_sql(&event.changed_at)],
        )?;

        Ok(())
    }

    pub fn delete(&self, peer_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.direction.churn_table()),
            [peer_id],
        )?;

        Ok(n > 0)
    }

    pub fn for_each(&self, mut visit: impl FnMut(ChurnEvent) -> Result<()>) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, changed_at FROM {}",
            self.direction.churn_table()
        ))?;

        let rows = stmt.query_map([], Self::row_to_event)?;
        for row in rows {
            visit(row?)?;
        }

        Ok(())
    }

    pub fn all(&self) -> Result<Vec<ChurnEvent>> {
        let mut events = Vec::new();
        self.for_each(|event| {
            events.push(event);
            Ok(())
        })?;
        Ok(events)
    }

    pub fn keys(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {}", self.direction.churn_table()))?;

        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;

        Ok(keys)
    }
}

// ============================================================================
// PROFILE CACHE
// ============================================================================

/// Peer id → last-known profile. Written whenever a profile is fetched.
pub struct ProfileCache<'a> {
    conn: &'a Connection,
}

impl<'a> ProfileCache<'a> {
    fn row_to_cached(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedProfile> {
        let fetched_at: String = row.get(2)?;
        Ok(CachedProfile {
            id: row.get(0)?,
            data: row.get(1)?,
            fetched_at: ts_from_sql(2, &fetched_at)?,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedProfile>> {
        let cached = self
            .conn
            .query_row(
                "SELECT id, data, fetched_at FROM users WHERE id = ?1",
                [id],
                Self::row_to_cached,
            )
            .optional()?;

        Ok(cached)
    }

    /// Upsert a freshly fetched profile
    pub fn put(&self, profile: &Profile, fetched_at: DateTime<Utc>) -> Result<()> {
        let data = profile.to_json()?;
        self.put_raw(&profile.id, &data, fetched_at)
    }

    /// Store a record verbatim (used for imports and tests)
    pub fn put_raw(&self, id: &str, data: &str, fetched_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO users (id, data, fetched_at) VALUES (?1, ?2, ?3)",
            params![id, data, ts_to_sql(&fetched_at)],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let n = self.conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn for_each(&self, mut visit: impl FnMut(CachedProfile) -> Result<()>) -> Result<()> {
        let mut stmt = self.conn.prepare("SELECT id, data, fetched_at FROM users")?;

        let rows = stmt.query_map([], Self::row_to_cached)?;
        for row in rows {
            visit(row?)?;
        }

        Ok(())
    }

    /// Fetch time of every cached profile, for hydration decisions
    pub fn fetched_at_all(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut out = HashMap::new();
        self.for_each(|cached| {
            out.insert(cached.id, cached.fetched_at);
            Ok(())
        })?;
        Ok(out)
    }
}

// ============================================================================
// PASS LOG (audit trail)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStatus {
    Completed,
    Aborted,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Completed => "completed",
            PassStatus::Aborted => "aborted",
        }
    }

    fn from_sql(idx: usize, raw: &str) -> rusqlite::Result<Self> {
        match raw {
            "completed" => Ok(PassStatus::Completed),
            "aborted" => Ok(PassStatus::Aborted),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("unknown pass status: {other}").into(),
            )),
        }
    }
}

/// One synchronization pass, as recorded in the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass_id: String,
    pub account_id: String,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: PassStatus,
    pub pages: u32,
    pub added: u32,
    pub removed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PassLog<'a> {
    conn: &'a Connection,
}

impl<'a> PassLog<'a> {
    pub fn insert(&self, record: &PassRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_passes (
                pass_id, account_id, direction, started_at, finished_at,
                status, pages, added, removed, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.pass_id,
                record.account_id,
                record.direction.as_str(),
                ts_to_sql(&record.started_at),
                ts_to_sql(&record.finished_at),
                record.status.as_str(),
                record.pages,
                record.added,
                record.removed,
                record.error,
            ],
        )?;

        Ok(())
    }

    /// Most recent passes first
    pub fn recent(&self, limit: u32) -> Result<Vec<PassRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT pass_id, account_id, direction, started_at, finished_at,
                    status, pages, added, removed, error
             FROM sync_passes
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;

        let records = stmt
            .query_map([limit], |row| {
                let direction: String = row.get(2)?;
                let started_at: String = row.get(3)?;
                let finished_at: String = row.get(4)?;
                let status: String = row.get(5)?;

                Ok(PassRecord {
                    pass_id: row.get(0)?,
                    account_id: row.get(1)?,
                    direction: direction.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
                    })?,
                    started_at: ts_from_sql(3, &started_at)?,
                    finished_at: ts_from_sql(4, &finished_at)?,
                    status: PassStatus::from_sql(5, &status)?,
                    pages: row.get(6)?,
                    added: row.get(7)?,
                    removed: row.get(8)?,
                    error: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn edge(id: &str, observed_at: DateTime<Utc>) -> FollowEdge {
        FollowEdge {
            peer_id: id.to_string(),
            observed_at,
            followed_at: None,
            rejoined_after: None,
        }
    }

    #[test]
    fn test_edge_store_crud() {
        let store = Store::open_in_memory().unwrap();

        store
            .write(|txn| {
                let edges = txn.edges(Direction::Followers);
                edges.put(&edge("1", at(2024, 1, 1)))?;
                edges.put(&edge("2", at(2024, 2, 1)))?;
                Ok(())
            })
            .unwrap();

        let (one, keys, other_dir) = store
            .read(|txn| {
                Ok((
                    txn.edges(Direction::Followers).get("1")?,
                    txn.edges(Direction::Followers).keys()?,
                    txn.edges(Direction::Following).count()?,
                ))
            })
            .unwrap();

        assert_eq!(one.unwrap().observed_at, at(2024, 1, 1));
        assert_eq!(keys.len(), 2);
        assert_eq!(other_dir, 0, "directions must not share a namespace");

        let removed = store
            .write(|txn| txn.edges(Direction::Followers).delete("1"))
            .unwrap();
        assert!(removed);

        let missing = store
            .read(|txn| txn.edges(Direction::Followers).get("1"))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let store = Store::open_in_memory().unwrap();

        let result: Result<()> = store.write(|txn| {
            txn.edges(Direction::Following).put(&edge("9", at(2024, 1, 1)))?;
            txn.churn(Direction::Following).put(&ChurnEvent {
                peer_id: "8".to_string(),
                changed_at: at(2024, 1, 1),
            })?;
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());

        let (edges, churn) = store
            .read(|txn| {
                Ok((
                    txn.edges(Direction::Following).keys()?,
                    txn.churn(Direction::Following).keys()?,
                ))
            })
            .unwrap();

        assert!(edges.is_empty());
        assert!(churn.is_empty());
    }

    #[test]
    fn test_for_each_is_restartable() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|txn| {
                let churn = txn.churn(Direction::Followers);
                churn.put(&ChurnEvent { peer_id: "a".into(), changed_at: at(2024, 1, 1) })?;
                churn.put(&ChurnEvent { peer_id: "b".into(), changed_at: at(2024, 3, 1) })?;
                Ok(())
            })
            .unwrap();

        store
            .read(|txn| {
                let churn = txn.churn(Direction::Followers);
                let mut first = 0;
                churn.for_each(|_| {
                    first += 1;
                    Ok(())
                })?;
                let second = churn.all()?.len();
                assert_eq!(first, 2);
                assert_eq!(second, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_profile_cache_keeps_raw_record() {
        let store = Store::open_in_memory().unwrap();
        let profile = Profile::new("7", "seven", "Seven", "https://img/7.png");

        store
            .write(|txn| {
                txn.profiles().put(&profile, at(2024, 5, 1))?;
                txn.profiles().put_raw("8", "{broken", at(2024, 5, 1))?;
                Ok(())
            })
            .unwrap();

        let (seven, eight, fetched) = store
            .read(|txn| {
                Ok((
                    txn.profiles().get("7")?,
                    txn.profiles().get("8")?,
                    txn.profiles().fetched_at_all()?,
                ))
            })
            .unwrap();

        assert_eq!(seven.unwrap().decode().unwrap(), profile);
        assert!(eight.unwrap().decode().is_err());
        assert_eq!(fetched.len(), 2);
    }

    #[test]
    fn test_pass_log_orders_recent_first() {
        let store = Store::open_in_memory().unwrap();

        for (i, day) in [1u32, 3, 2].iter().enumerate() {
            let record = PassRecord {
                pass_id: format!("pass-{i}"),
                account_id: "100".to_string(),
                direction: Direction::Followers,
                started_at: at(2024, 1, *day),
                finished_at: at(2024, 1, *day),
                status: if *day == 2 { PassStatus::Aborted } else { PassStatus::Completed },
                pages: 1,
                added: 0,
                removed: 0,
                error: None,
            };
            store.write(|txn| txn.passes().insert(&record)).unwrap();
        }

        let recent = store.read(|txn| txn.passes().recent(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].pass_id, "pass-1");
        assert_eq!(recent[1].status, PassStatus::Aborted);
    }

    #[test]
    fn test_store_binds_to_first_account() {
        let store = Store::open_in_memory().unwrap();

        let first = store.write(|txn| txn.tracked_account().bind("100", at(2024, 1, 1))).unwrap();
        let again = store.write(|txn| txn.tracked_account().bind("100", at(2024, 1, 2))).unwrap();
        let other = store.write(|txn| txn.tracked_account().bind("200", at(2024, 1, 3))).unwrap();

        assert_eq!(first, None);
        assert_eq!(again, None);
        assert_eq!(other.as_deref(), Some("100"));

        let owner = store.read(|txn| txn.tracked_account().get()).unwrap();
        assert_eq!(owner.as_deref(), Some("100"));
    }

    #[test]
    fn test_reads_do_not_wait_for_open_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("follows.db")).unwrap();
        assert!(store.has_read_connections());

        store
            .write(|txn| {
                txn.edges(Direction::Followers).put(&edge("1", at(2024, 1, 1)))?;

                // Uncommitted rows stay invisible to a reader on another connection
                let seen = store.read(|r| r.edges(Direction::Followers).count())?;
                assert_eq!(seen, 0);
                Ok(())
            })
            .unwrap();

        let seen = store.read(|txn| txn.edges(Direction::Followers).count()).unwrap();
        assert_eq!(seen, 1);

        let readers = store.read(|txn| {
            // Reader connections refuse writes
            Ok(txn.edges(Direction::Followers).put(&edge("2", at(2024, 1, 1))).is_err())
        });
        assert!(readers.unwrap());
        store.close().unwrap();
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("follows.db");

        let store = Store::open(&path).unwrap();
        store
            .write(|txn| txn.edges(Direction::Followers).put(&edge("5", at(2024, 1, 1))))
            .unwrap();
        store.close().unwrap();

        let reopened = Store::open(&path).unwrap();
        let got = reopened
            .read(|txn| txn.edges(Direction::Followers).get("5"))
            .unwrap();
        assert_eq!(got.unwrap().peer_id, "5");
    }
}
