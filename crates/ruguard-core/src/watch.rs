//! TTL-indexed watch list of quarantined query fingerprints.
//!
//! Entries are keyed by `(group, watch type, key)` in a [`ShardedMap`], so
//! lookups on the admission path only lock one shard. Expiry is lazy on
//! lookup; [`WatchList::sweep`] reclaims entries nobody looks up, visiting a
//! bounded number of entries per call with a rotating shard cursor.
//!
//! Every insert and removal also queues a [`WatchChange`] that maintenance
//! drains into the runaway-watch table.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::fingerprint::QueryFingerprint;
use crate::group::{RunawayAction, WatchType};
use crate::sharded_map::ShardedMap;

/// Lookup precedence, most specific first.
const PRECEDENCE: [WatchType; 3] = [WatchType::Plan, WatchType::Similar, WatchType::Exact];

/// Identity of a watch entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchKey {
    pub group: String,
    pub watch_type: WatchType,
    /// SQL text (exact), SQL digest (similar) or plan digest (plan).
    pub key: String,
}

/// A quarantined fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub group: String,
    pub watch_type: WatchType,
    pub key: String,
    /// Action applied to queries that hit this entry.
    pub action: RunawayAction,
    pub created_at_ms: u64,
    /// `None` = never expires.
    pub expire_at_ms: Option<u64>,
}

impl WatchEntry {
    /// Build the entry a fired rule leaves behind. `None` for `WatchType::None`
    /// or a fingerprint without the needed key (plan watch, no plan digest).
    #[must_use]
    pub fn for_query(
        group: &str,
        watch_type: WatchType,
        fingerprint: &QueryFingerprint,
        action: RunawayAction,
        now_ms: u64,
        expire_at_ms: Option<u64>,
    ) -> Option<Self> {
        let key = match watch_type {
            WatchType::None => return None,
            WatchType::Exact => fingerprint.sql_text.clone(),
            WatchType::Similar => fingerprint.sql_digest.clone(),
            WatchType::Plan => fingerprint.plan_digest.clone()?,
        };
        Some(Self {
            group: group.to_string(),
            watch_type,
            key,
            action,
            created_at_ms: now_ms,
            expire_at_ms,
        })
    }

    #[must_use]
    pub fn watch_key(&self) -> WatchKey {
        WatchKey {
            group: self.group.clone(),
            watch_type: self.watch_type,
            key: self.key.clone(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Pending persistence work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchChange {
    Upsert(WatchEntry),
    Remove(WatchKey),
}

impl WatchChange {
    #[must_use]
    pub fn key(&self) -> WatchKey {
        match self {
            Self::Upsert(entry) => entry.watch_key(),
            Self::Remove(key) => key.clone(),
        }
    }
}

/// Concurrent watch list.
#[derive(Debug)]
pub struct WatchList {
    entries: ShardedMap<WatchKey, WatchEntry>,
    changes: Mutex<Vec<WatchChange>>,
    sweep_cursor: AtomicUsize,
}

impl Default for WatchList {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ShardedMap::new(),
            changes: Mutex::new(Vec::new()),
            sweep_cursor: AtomicUsize::new(0),
        }
    }

    fn queue(&self, change: WatchChange) {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(change);
    }

    /// Insert, or refresh the expiry and action of an existing entry.
    /// Returns `true` for a new entry.
    pub fn insert(&self, entry: WatchEntry) -> bool {
        let key = entry.watch_key();
        let refreshed = entry.clone();
        let inserted = self.entries.upsert_with(
            key,
            || entry,
            |existing| {
                existing.expire_at_ms = refreshed.expire_at_ms;
                existing.action = refreshed.action.clone();
            },
        );
        tracing::debug!(
            group = %refreshed.group,
            watch_type = %refreshed.watch_type,
            inserted,
            "watch entry upserted"
        );
        self.queue(WatchChange::Upsert(refreshed));
        inserted
    }

    /// First live entry matching the query, checking plan, then similar, then
    /// exact. Expired hits are removed and skipped.
    #[must_use]
    pub fn lookup(
        &self,
        group: &str,
        sql_text: &str,
        sql_digest: &str,
        plan_digest: Option<&str>,
        now_ms: u64,
    ) -> Option<WatchEntry> {
        for watch_type in PRECEDENCE {
            let key = match watch_type {
                WatchType::Plan => match plan_digest {
                    Some(digest) => digest,
                    None => continue,
                },
                WatchType::Similar => sql_digest,
                _ => sql_text,
            };
            let key = WatchKey {
                group: group.to_string(),
                watch_type,
                key: key.to_string(),
            };
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.is_expired(now_ms) {
                if self
                    .entries
                    .remove_if(&key, |e| e.is_expired(now_ms))
                    .is_some()
                {
                    tracing::debug!(group, watch_type = %watch_type, "expired watch removed on lookup");
                    self.queue(WatchChange::Remove(key));
                }
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// [`lookup`](Self::lookup) with the keys taken from a fingerprint.
    #[must_use]
    pub fn lookup_fingerprint(
        &self,
        group: &str,
        fingerprint: &QueryFingerprint,
        now_ms: u64,
    ) -> Option<WatchEntry> {
        self.lookup(
            group,
            &fingerprint.sql_text,
            &fingerprint.sql_digest,
            fingerprint.plan_digest.as_deref(),
            now_ms,
        )
    }

    /// Remove expired entries, inspecting at most `max_entries` of them.
    /// Returns the number removed.
    pub fn sweep(&self, now_ms: u64, max_entries: usize) -> usize {
        let shard_count = self.entries.shard_count();
        let mut budget = max_entries;
        let mut removed = 0;
        for _ in 0..shard_count {
            if budget == 0 {
                break;
            }
            let shard = self.sweep_cursor.fetch_add(1, Ordering::Relaxed) % shard_count;
            let sweep = self
                .entries
                .sweep_shard(shard, budget, |_, entry| entry.is_expired(now_ms));
            budget -= sweep.inspected;
            removed += sweep.removed.len();
            for (key, _) in sweep.removed {
                self.queue(WatchChange::Remove(key));
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "watch sweep removed expired entries");
        }
        removed
    }

    /// Drop every entry of `group`. Returns the number removed.
    pub fn remove_group(&self, group: &str) -> usize {
        let removed = self.entries.retain(|key, _| key.group != group);
        let count = removed.len();
        for (key, _) in removed {
            self.queue(WatchChange::Remove(key));
        }
        if count > 0 {
            tracing::info!(group, removed = count, "watch entries of dropped group removed");
        }
        count
    }

    /// Reload persisted entries at startup without queueing them again.
    /// Expired rows are skipped. Returns the number loaded.
    pub fn restore(&self, entries: Vec<WatchEntry>, now_ms: u64) -> usize {
        let mut loaded = 0;
        for entry in entries {
            if entry.is_expired(now_ms) {
                continue;
            }
            self.entries.insert(entry.watch_key(), entry);
            loaded += 1;
        }
        loaded
    }

    /// Current entries, ordered by group then creation time.
    #[must_use]
    pub fn entries(&self) -> Vec<WatchEntry> {
        let mut entries = self.entries.values();
        entries.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
                .then(a.key.cmp(&b.key))
        });
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every queued change, oldest first.
    pub fn take_changes(&self) -> Vec<WatchChange> {
        std::mem::take(&mut *self.changes.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Put back changes that failed to persist, ahead of newer ones.
    pub fn requeue_changes(&self, mut failed: Vec<WatchChange>) {
        let mut guard = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        failed.append(&mut guard);
        *guard = failed;
    }

    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.changes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
