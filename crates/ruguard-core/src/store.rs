//! Persistence for the runaway audit surfaces.
//!
//! Two tables back the operator-facing views:
//!
//! - `runaway_queries`: one row per flushed [`RunawayEvent`].
//! - `runaway_watch`: one row per live [`WatchEntry`], keyed by
//!   `(resource_group_name, watch_type, watch_text)`.
//!
//! [`SqliteAuditStore`] is the production backend. [`MemoryAuditStore`]
//! backs tests and can inject write failures.
//!
//! All methods are blocking. Async callers go through
//! `tokio::task::spawn_blocking`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::group::{RunawayAction, WatchType};
use crate::recorder::{MatchType, RunawayEvent};
use crate::watch::{WatchEntry, WatchKey};

/// Current audit schema version (`PRAGMA user_version`).
pub const SCHEMA_VERSION: i32 = 1;

/// Audit schema.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS runaway_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_group_name TEXT NOT NULL,
    sample_sql TEXT NOT NULL,
    sql_digest TEXT NOT NULL,
    repeats INTEGER NOT NULL,
    match_type TEXT NOT NULL,
    action TEXT NOT NULL,
    rule TEXT NOT NULL,
    start_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runaway_queries_start
    ON runaway_queries(start_time);
CREATE INDEX IF NOT EXISTS idx_runaway_queries_group
    ON runaway_queries(resource_group_name, start_time);

CREATE TABLE IF NOT EXISTS runaway_watch (
    resource_group_name TEXT NOT NULL,
    watch_type TEXT NOT NULL,
    watch_text TEXT NOT NULL,
    action TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    PRIMARY KEY (resource_group_name, watch_type, watch_text)
);
CREATE INDEX IF NOT EXISTS idx_runaway_watch_end
    ON runaway_watch(end_time);
";

/// Filter for [`AuditStore::list_queries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub group: Option<String>,
    pub match_type: Option<MatchType>,
    pub limit: usize,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            group: None,
            match_type: None,
            limit: 100,
        }
    }
}

/// Storage operations needed by the recorder, watch persistence and CLI.
///
/// Implementations provide actual database access; the trait enables testing
/// with in-memory stores.
pub trait AuditStore: Send + Sync {
    /// Append flushed events. Returns rows written.
    fn insert_queries(&self, events: &[RunawayEvent]) -> Result<usize, StorageError>;

    /// Insert or replace watch rows.
    fn upsert_watches(&self, entries: &[WatchEntry]) -> Result<usize, StorageError>;

    /// Delete watch rows by key. Missing rows are ignored.
    fn delete_watches(&self, keys: &[WatchKey]) -> Result<usize, StorageError>;

    /// Delete at most `limit` query rows that started before `cutoff_ms`.
    fn purge_queries_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize, StorageError>;

    /// Delete at most `limit` watch rows whose end time has passed.
    fn purge_expired_watches(&self, now_ms: u64, limit: usize) -> Result<usize, StorageError>;

    /// Query rows, newest first.
    fn list_queries(&self, filter: &QueryFilter) -> Result<Vec<RunawayEvent>, StorageError>;

    /// Watch rows ordered by group then start time.
    fn list_watches(&self) -> Result<Vec<WatchEntry>, StorageError>;
}

// =============================================================================
// SQLite
// =============================================================================

/// SQLite-backed audit store.
#[derive(Debug)]
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteAuditStore {
    /// Open (creating if needed) and migrate the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        migrate(&conn)?;
        tracing::debug!(path = %path.display(), "audit store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn)
    }
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        });
    }
    if current < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
        tracing::info!(from = current, to = SCHEMA_VERSION, "audit schema migrated");
    }
    Ok(())
}

fn decode_err(what: &str, value: &str) -> StorageError {
    StorageError::Database(format!("invalid {what} '{value}' in audit row"))
}

impl AuditStore for SqliteAuditStore {
    fn insert_queries(&self, events: &[RunawayEvent]) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO runaway_queries
                     (resource_group_name, sample_sql, sql_digest, repeats, match_type, action, rule, start_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for event in events {
                    stmt.execute(params![
                        event.group,
                        event.sample_sql,
                        event.sql_digest,
                        event.repeats as i64,
                        event.match_type.as_str(),
                        event.action,
                        event.rule,
                        event.start_time_ms as i64,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(events.len())
        })
    }

    fn upsert_watches(&self, entries: &[WatchEntry]) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO runaway_watch
                     (resource_group_name, watch_type, watch_text, action, start_time, end_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(resource_group_name, watch_type, watch_text)
                     DO UPDATE SET action = excluded.action, end_time = excluded.end_time",
                )?;
                for entry in entries {
                    stmt.execute(params![
                        entry.group,
                        entry.watch_type.as_str(),
                        entry.key,
                        entry.action.to_string(),
                        entry.created_at_ms as i64,
                        entry.expire_at_ms.map(|t| t as i64),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(entries.len())
        })
    }

    fn delete_watches(&self, keys: &[WatchKey]) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "DELETE FROM runaway_watch
                     WHERE resource_group_name = ?1 AND watch_type = ?2 AND watch_text = ?3",
                )?;
                for key in keys {
                    deleted += stmt.execute(params![key.group, key.watch_type.as_str(), key.key])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
    }

    fn purge_queries_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM runaway_queries WHERE id IN (
                     SELECT id FROM runaway_queries
                     WHERE start_time < ?1
                     ORDER BY start_time
                     LIMIT ?2
                 )",
                params![cutoff_ms as i64, limit as i64],
            )?;
            Ok(deleted)
        })
    }

    fn purge_expired_watches(&self, now_ms: u64, limit: usize) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM runaway_watch WHERE rowid IN (
                     SELECT rowid FROM runaway_watch
                     WHERE end_time IS NOT NULL AND end_time <= ?1
                     LIMIT ?2
                 )",
                params![now_ms as i64, limit as i64],
            )?;
            Ok(deleted)
        })
    }

    fn list_queries(&self, filter: &QueryFilter) -> Result<Vec<RunawayEvent>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_group_name, sample_sql, sql_digest, repeats, match_type, action, rule, start_time
                 FROM runaway_queries
                 WHERE (?1 IS NULL OR resource_group_name = ?1)
                   AND (?2 IS NULL OR match_type = ?2)
                 ORDER BY start_time DESC, id DESC
                 LIMIT ?3",
            )?;
            let group = filter.group.as_ref().map(|g| g.trim().to_lowercase());
            let match_type = filter.match_type.map(MatchType::as_str);
            let rows = stmt.query_map(
                params![group, match_type, filter.limit as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )?;
            let mut events = Vec::new();
            for row in rows {
                let (group, sample_sql, sql_digest, repeats, match_type, action, rule, start) = row?;
                let match_type = match_type
                    .parse::<MatchType>()
                    .map_err(|_| decode_err("match_type", &match_type))?;
                events.push(RunawayEvent {
                    group,
                    sample_sql,
                    sql_digest,
                    match_type,
                    action,
                    rule,
                    repeats: repeats.max(0) as u64,
                    start_time_ms: start.max(0) as u64,
                });
            }
            Ok(events)
        })
    }

    fn list_watches(&self) -> Result<Vec<WatchEntry>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_group_name, watch_type, watch_text, action, start_time, end_time
                 FROM runaway_watch
                 ORDER BY resource_group_name, start_time, watch_text",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (group, watch_type, key, action, start, end) = row?;
                entries.push(WatchEntry {
                    group,
                    watch_type: watch_type
                        .parse::<WatchType>()
                        .map_err(|_| decode_err("watch_type", &watch_type))?,
                    key,
                    action: action
                        .parse::<RunawayAction>()
                        .map_err(|_| decode_err("action", &action))?,
                    created_at_ms: start.max(0) as u64,
                    expire_at_ms: end.map(|t| t.max(0) as u64),
                });
            }
            Ok(entries)
        })
    }
}

/// Read the schema version of an existing database without migrating it.
pub fn schema_version(path: &Path) -> Result<Option<i32>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let conn = Connection::open(path)?;
    let version = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i32>(0))
        .optional()?;
    Ok(version)
}

// =============================================================================
// In-memory
// =============================================================================

/// In-memory audit store with failure injection.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    queries: Mutex<Vec<RunawayEvent>>,
    watches: Mutex<HashMap<WatchKey, WatchEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `StorageError::Unavailable` until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl AuditStore for MemoryAuditStore {
    fn insert_queries(&self, events: &[RunawayEvent]) -> Result<usize, StorageError> {
        self.check_writable()?;
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(events);
        Ok(events.len())
    }

    fn upsert_watches(&self, entries: &[WatchEntry]) -> Result<usize, StorageError> {
        self.check_writable()?;
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            watches
                .entry(entry.watch_key())
                .and_modify(|existing| {
                    existing.action = entry.action.clone();
                    existing.expire_at_ms = entry.expire_at_ms;
                })
                .or_insert_with(|| entry.clone());
        }
        Ok(entries.len())
    }

    fn delete_watches(&self, keys: &[WatchKey]) -> Result<usize, StorageError> {
        self.check_writable()?;
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.iter().filter(|key| watches.remove(*key).is_some()).count())
    }

    fn purge_queries_before(&self, cutoff_ms: u64, limit: usize) -> Result<usize, StorageError> {
        self.check_writable()?;
        let mut queries = self.queries.lock().unwrap_or_else(|e| e.into_inner());
        let mut budget = limit;
        queries.retain(|event| {
            if budget > 0 && event.start_time_ms < cutoff_ms {
                budget -= 1;
                false
            } else {
                true
            }
        });
        Ok(limit - budget)
    }

    fn purge_expired_watches(&self, now_ms: u64, limit: usize) -> Result<usize, StorageError> {
        self.check_writable()?;
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<WatchKey> = watches
            .iter()
            .filter(|(_, entry)| entry.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .take(limit)
            .collect();
        for key in &doomed {
            watches.remove(key);
        }
        Ok(doomed.len())
    }

    fn list_queries(&self, filter: &QueryFilter) -> Result<Vec<RunawayEvent>, StorageError> {
        let queries = self.queries.lock().unwrap_or_else(|e| e.into_inner());
        let group = filter.group.as_ref().map(|g| g.trim().to_lowercase());
        let mut rows: Vec<RunawayEvent> = queries
            .iter()
            .rev()
            .filter(|e| group.as_ref().is_none_or(|g| *g == e.group))
            .filter(|e| filter.match_type.is_none_or(|m| m == e.match_type))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.start_time_ms.cmp(&a.start_time_ms));
        rows.truncate(filter.limit);
        Ok(rows)
    }

    fn list_watches(&self) -> Result<Vec<WatchEntry>, StorageError> {
        let watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<WatchEntry> = watches.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
                .then(a.key.cmp(&b.key))
        });
        Ok(rows)
    }
}
